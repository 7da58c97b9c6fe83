//! AT transport over a serial byte stream.
//!
//! [`AtTransport`] speaks the AT dialect over anything that is
//! `AsyncRead + AsyncWrite`: a [`SerialPort`] in production, an in-memory
//! duplex pipe in tests. A command is written as `<command>\r` and the
//! response is read until a final result line:
//!
//! | final line                                   | outcome                |
//! |----------------------------------------------|------------------------|
//! | `OK`, `CONNECT…`                             | success                |
//! | `ERROR`, `+CME ERROR:`, `+CMS ERROR:`        | `Rejected`             |
//! | `NO CARRIER`, `BUSY`, `NO DIALTONE`, `NO ANSWER` | `Rejected`         |
//! | none before the deadline                     | `Timeout { partial }`  |
//!
//! End of stream, or an I/O error that means the device node went away
//! (EIO, ENXIO, ENODEV, broken pipe), fires the error callback once and
//! returns `DeviceGone` from then on.
//!
//! Input left over from an earlier exchange is discarded before each new
//! command is written. When the previous exchange ended without its final
//! result (timed out, or dropped by the caller mid-read), its late reply is
//! awaited briefly and dropped too, so it is never taken for the answer to
//! the next command.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_serial::{
    ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};

use crate::config::FlowControl;
use crate::error::TransportError;
use crate::operator;
use crate::transport::{ErrorCallback, ModemMode, ModemTransport, SignalQuality, TerminalError};

const SYNC_TIMEOUT: Duration = Duration::from_millis(1000);
const DIAL_TIMEOUT: Duration = Duration::from_millis(8000);
const ESCAPE_TIMEOUT: Duration = Duration::from_millis(2000);
const CSQ_TIMEOUT: Duration = Duration::from_millis(1500);
/// Silence required on both sides of the `+++` escape sequence.
const DEFAULT_GUARD_TIME: Duration = Duration::from_millis(1000);
/// How long a late reply to an unfinished exchange is waited for.
const LATE_REPLY_GRACE: Duration = Duration::from_millis(1000);

const LINE_END: &[char] = &['\r', '\n'];

/// Final result of an AT exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Connect,
    Error,
}

/// Classify one trimmed response line. `None` for intermediate lines.
pub fn classify_line(line: &str) -> Option<FinalResult> {
    match line {
        "OK" => Some(FinalResult::Ok),
        "ERROR" | "NO CARRIER" | "BUSY" | "NO DIALTONE" | "NO ANSWER" => Some(FinalResult::Error),
        l if l.starts_with("CONNECT") => Some(FinalResult::Connect),
        l if l.starts_with("+CME ERROR:") || l.starts_with("+CMS ERROR:") => {
            Some(FinalResult::Error)
        }
        _ => None,
    }
}

/// Final result among the complete (terminated) lines of `text`.
pub fn final_result(text: &str) -> Option<FinalResult> {
    let complete = match text.rfind(LINE_END) {
        Some(end) => &text[..end],
        None => return None,
    };
    complete
        .split(LINE_END)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(classify_line)
}

struct Link<S> {
    stream: S,
    mode: ModemMode,
    /// The last exchange ended before its final result was read.
    unsettled: bool,
}

pub struct AtTransport<S> {
    link: Mutex<Link<S>>,
    context_id: u8,
    guard_time: Duration,
    gone: AtomicBool,
    callback: StdMutex<Option<ErrorCallback>>,
}

impl<S> AtTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `context_id` is the PDP context dialed by `set_mode(Data)`.
    pub fn new(stream: S, context_id: u8) -> Self {
        Self {
            link: Mutex::new(Link {
                stream,
                mode: ModemMode::Command,
                unsettled: false,
            }),
            context_id,
            guard_time: DEFAULT_GUARD_TIME,
            gone: AtomicBool::new(false),
            callback: StdMutex::new(None),
        }
    }

    pub fn with_guard_time(mut self, guard_time: Duration) -> Self {
        self.guard_time = guard_time;
        self
    }

    fn device_gone(&self) -> TransportError {
        if !self.gone.swap(true, Ordering::AcqRel) {
            tracing::error!("serial device gone");
            let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(callback) = callback.as_ref() {
                callback(TerminalError::DeviceGone);
            }
        }
        TransportError::DeviceGone
    }

    fn io_error(&self, err: io::Error) -> TransportError {
        if is_device_gone(&err) {
            self.device_gone()
        } else {
            TransportError::Io(err)
        }
    }

    fn check_present(&self) -> Result<(), TransportError> {
        if self.gone.load(Ordering::Acquire) {
            Err(TransportError::DeviceGone)
        } else {
            Ok(())
        }
    }

    async fn send(&self, link: &mut Link<S>, bytes: &[u8]) -> Result<(), TransportError> {
        link.stream
            .write_all(bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        link.stream.flush().await.map_err(|e| self.io_error(e))
    }

    /// Take whatever is already buffered on the line, without waiting.
    async fn drain_buffered(&self, link: &mut Link<S>) -> Result<String, TransportError> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let polled = poll_fn(|cx| {
                let mut buf = ReadBuf::new(&mut chunk);
                match Pin::new(&mut link.stream).poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(buf.filled().len()))),
                    Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
                    Poll::Pending => Poll::Ready(None),
                }
            })
            .await;
            match polled {
                None => break,
                Some(Ok(0)) => return Err(self.device_gone()),
                Some(Ok(n)) => raw.extend_from_slice(&chunk[..n]),
                Some(Err(e)) => return Err(self.io_error(e)),
            }
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Discard stale input before a new command; waits up to `grace` for
    /// the late reply of an unfinished exchange.
    async fn settle(&self, link: &mut Link<S>, grace: Duration) -> Result<(), TransportError> {
        let mut stale = self.drain_buffered(link).await?;
        if link.unsettled && final_result(&stale).is_none() {
            match self.read_response(link, Instant::now() + grace).await {
                Ok((_, late)) => stale.push_str(&late),
                Err(TransportError::Timeout { partial }) => stale.push_str(&partial),
                Err(e) => return Err(e),
            }
        }
        link.unsettled = false;
        if !stale.trim().is_empty() {
            tracing::debug!(stale = %stale.trim(), "discarded stale modem output");
        }
        Ok(())
    }

    /// Read until a final result line or `deadline`.
    async fn read_response(
        &self,
        link: &mut Link<S>,
        deadline: Instant,
    ) -> Result<(FinalResult, String), TransportError> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            {
                let text = String::from_utf8_lossy(&raw);
                if let Some(result) = final_result(&text) {
                    return Ok((result, text.into_owned()));
                }
            }
            match tokio::time::timeout_at(deadline, link.stream.read(&mut chunk)).await {
                Err(_) => {
                    return Err(TransportError::Timeout {
                        partial: String::from_utf8_lossy(&raw).into_owned(),
                    })
                }
                Ok(Ok(0)) => return Err(self.device_gone()),
                Ok(Ok(n)) => raw.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(self.io_error(e)),
            }
        }
    }

    /// Write `command` and read its response. Settling spends at most half
    /// of `timeout`.
    async fn command(
        &self,
        link: &mut Link<S>,
        command: &str,
        timeout: Duration,
    ) -> Result<(FinalResult, String), TransportError> {
        if link.mode == ModemMode::Data {
            return Err(TransportError::Protocol(format!(
                "`{command}` issued while in data mode"
            )));
        }
        let deadline = Instant::now() + timeout;
        self.settle(link, LATE_REPLY_GRACE.min(timeout / 2)).await?;
        self.send(link, format!("{command}\r").as_bytes()).await?;
        link.unsettled = true;
        let response = self.read_response(link, deadline).await?;
        link.unsettled = false;
        Ok(response)
    }

    async fn exchange(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.check_present()?;
        let mut link = self.link.lock().await;
        match self.command(&mut link, command, timeout).await? {
            (FinalResult::Error, response) => Err(TransportError::Rejected { response }),
            (_, response) => Ok(response),
        }
    }

    /// Leave data mode with the `+++` escape.
    ///
    /// A modem that reset on its own is already in command mode and ignores
    /// the escape; when it answers a plain `AT` afterwards, that counts as
    /// being in command mode.
    async fn escape(&self, link: &mut Link<S>) -> Result<(), TransportError> {
        tokio::time::sleep(self.guard_time).await;
        self.drain_buffered(link).await?;
        self.send(link, b"+++").await?;
        tokio::time::sleep(self.guard_time).await;
        link.unsettled = true;
        let escape_err = match self
            .read_response(link, Instant::now() + ESCAPE_TIMEOUT)
            .await
        {
            Ok((FinalResult::Ok, _)) => {
                link.unsettled = false;
                link.mode = ModemMode::Command;
                tracing::debug!("serial link in command mode");
                return Ok(());
            }
            Ok((_, response)) => {
                link.unsettled = false;
                TransportError::Rejected { response }
            }
            Err(TransportError::Timeout { partial }) => TransportError::Timeout { partial },
            Err(e) => return Err(e),
        };

        link.mode = ModemMode::Command;
        match self.command(link, "AT", SYNC_TIMEOUT).await {
            Ok((FinalResult::Ok, _)) => {
                tracing::warn!(error = %escape_err, "escape not acknowledged but modem answers AT, already in command mode");
                Ok(())
            }
            Ok(_) | Err(TransportError::Timeout { .. }) => {
                link.mode = ModemMode::Data;
                Err(escape_err)
            }
            Err(e) => {
                link.mode = ModemMode::Data;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S> ModemTransport for AtTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn sync(&self) -> Result<(), TransportError> {
        self.exchange("AT", SYNC_TIMEOUT).await.map(|_| ())
    }

    async fn set_mode(&self, mode: ModemMode) -> Result<(), TransportError> {
        self.check_present()?;
        let mut link = self.link.lock().await;
        if link.mode == mode {
            return Ok(());
        }
        match mode {
            ModemMode::Data => {
                let dial = format!("ATD*99***{}#", self.context_id);
                match self.command(&mut link, &dial, DIAL_TIMEOUT).await? {
                    (FinalResult::Connect, _) => {
                        link.mode = ModemMode::Data;
                        tracing::debug!("serial link in data mode");
                        Ok(())
                    }
                    (_, response) => Err(TransportError::Rejected { response }),
                }
            }
            ModemMode::Command => self.escape(&mut link).await,
        }
    }

    async fn at(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.exchange(command, timeout).await
    }

    async fn signal_quality(&self) -> Result<SignalQuality, TransportError> {
        let response = self.exchange("AT+CSQ", CSQ_TIMEOUT).await?;
        let (rssi, ber) = operator::parse_signal_quality(&response).ok_or_else(|| {
            TransportError::Protocol(format!("unparseable CSQ response: {:?}", response.trim()))
        })?;
        Ok(SignalQuality { rssi, ber })
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }
}

/// I/O errors that mean the device node is gone for good.
fn is_device_gone(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV)
    )
}

fn port_flow_control(flow_control: FlowControl) -> tokio_serial::FlowControl {
    match flow_control {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        FlowControl::Software => tokio_serial::FlowControl::Software,
    }
}

/// Open `path` as a raw 8N1 line at `baud`, registered with the tokio reactor.
pub fn open_port(
    path: &str,
    baud: u32,
    flow_control: FlowControl,
) -> tokio_serial::Result<SerialStream> {
    let port = tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(port_flow_control(flow_control))
        .open_native_async()?;
    port.clear(ClearBuffer::All)?;
    tracing::info!(path, baud, flow_control = ?flow_control, "serial port open");
    Ok(port)
}
