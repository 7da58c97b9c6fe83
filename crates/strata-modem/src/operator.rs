//! Operator identification and registration parsing.
//!
//! The serving operator is read from the `AT+COPS?` response. The general
//! case is a quoted name or numeric PLMN code (`+COPS: 0,2,"20210",7`).
//! Some modems omit the quotes for certain formats, so an unquoted
//! response falls back to case-insensitive substring matching against a
//! configurable [`OperatorAllowList`].

use std::fmt;

use serde::Serialize;

/// Longest operator name kept in [`ConnectionInfo`].
pub const MAX_OPERATOR_NAME: usize = 31;

/// Value reported by the modem when RSSI or BER is not known.
pub const SIGNAL_UNKNOWN: i32 = 99;

/// Serving network and radio quality discovered by the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub operator_name: String,
    pub rssi: i32,
    pub ber: i32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            operator_name: String::new(),
            rssi: SIGNAL_UNKNOWN,
            ber: SIGNAL_UNKNOWN,
        }
    }
}

impl ConnectionInfo {
    /// Store the operator name, truncated to [`MAX_OPERATOR_NAME`] chars.
    pub fn set_operator_name(&mut self, name: &str) {
        self.operator_name = truncate_name(name);
    }

    pub fn rssi_dbm(&self) -> Option<i32> {
        rssi_to_dbm(self.rssi)
    }
}

fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_OPERATOR_NAME).collect()
}

/// One allow-list entry: a response substring and the name it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlias {
    /// Lowercased substring searched for in the response.
    pattern: String,
    name: String,
}

impl OperatorAlias {
    pub fn new(pattern: &str, name: &str) -> Self {
        Self {
            pattern: pattern.trim().to_lowercase(),
            name: truncate_name(name.trim()),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Known operator names/codes for unquoted `+COPS` responses.
///
/// When several entries match the same response, the entry that comes
/// first in list order wins, regardless of where in the response each
/// pattern occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAllowList {
    entries: Vec<OperatorAlias>,
}

impl OperatorAllowList {
    /// Entries with an empty pattern or name are dropped.
    pub fn new(entries: impl IntoIterator<Item = OperatorAlias>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .filter(|e| !e.pattern.is_empty() && !e.name.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[OperatorAlias] {
        &self.entries
    }

    /// First entry (in list order) whose pattern occurs in `response`.
    pub fn find(&self, response: &str) -> Option<&OperatorAlias> {
        let lowered = response.to_lowercase();
        self.entries
            .iter()
            .find(|e| lowered.contains(e.pattern.as_str()))
    }
}

impl Default for OperatorAllowList {
    fn default() -> Self {
        Self::new([
            OperatorAlias::new("vodafone", "VODAFONE"),
            OperatorAlias::new("20205", "20205"),
            OperatorAlias::new("cosmote", "COSMOTE"),
            OperatorAlias::new("20201", "20201"),
            OperatorAlias::new("20210", "20210"),
            OperatorAlias::new("nova", "NOVA"),
        ])
    }
}

/// First quoted substring of `response`, if it is a usable operator name.
///
/// Empty quotes and names longer than [`MAX_OPERATOR_NAME`] are rejected
/// so the caller falls back to the allow-list.
pub fn quoted_operator(response: &str) -> Option<&str> {
    let start = response.find('"')? + 1;
    let len = response[start..].find('"')?;
    let name = &response[start..start + len];
    if name.is_empty() || name.chars().count() > MAX_OPERATOR_NAME {
        return None;
    }
    Some(name)
}

/// Extract the serving operator from an `AT+COPS?` response.
pub fn extract_operator(response: &str, allow_list: &OperatorAllowList) -> Option<String> {
    if let Some(name) = quoted_operator(response) {
        return Some(name.to_string());
    }
    allow_list.find(response).map(|alias| alias.name.clone())
}

/// Network registration state from `+CREG: <n>,<stat>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    NotRegistered,
    RegisteredHome,
    Searching,
    Denied,
    Unknown,
    RegisteredRoaming,
}

impl RegistrationStatus {
    pub fn from_stat(stat: u8) -> Self {
        match stat {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::RegisteredHome,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::Denied,
            5 => RegistrationStatus::RegisteredRoaming,
            _ => RegistrationStatus::Unknown,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHome | RegistrationStatus::RegisteredRoaming
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::NotRegistered => "not-registered",
            RegistrationStatus::RegisteredHome => "home",
            RegistrationStatus::Searching => "searching",
            RegistrationStatus::Denied => "denied",
            RegistrationStatus::Unknown => "unknown",
            RegistrationStatus::RegisteredRoaming => "roaming",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the `+CREG: <n>,<stat>[,…]` line of an `AT+CREG?` response.
pub fn parse_registration(response: &str) -> Option<RegistrationStatus> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("+CREG:"))?;
    let mut fields = line["+CREG:".len()..].split(',').map(str::trim);
    let _mode = fields.next()?;
    let stat = fields.next()?.parse::<u8>().ok()?;
    Some(RegistrationStatus::from_stat(stat))
}

/// Parse `+CSQ: <rssi>,<ber>`.
pub fn parse_signal_quality(response: &str) -> Option<(i32, i32)> {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("+CSQ:"))?;
    let (rssi, ber) = line["+CSQ:".len()..].split_once(',')?;
    Some((rssi.trim().parse().ok()?, ber.trim().parse().ok()?))
}

/// Convert a CSQ RSSI index (0–31) to dBm. `99` and out-of-range give `None`.
pub fn rssi_to_dbm(rssi: i32) -> Option<i32> {
    match rssi {
        0..=31 => Some(-113 + rssi * 2),
        _ => None,
    }
}
