use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Administrative status of a managed MySQL server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    /// Current master of its group.
    Primary,
    /// Healthy replica, promotion candidate.
    Secondary,
    /// Kept out of candidate selection unless named explicitly.
    Spare,
    /// Declared failed; never promoted.
    Faulty,
    /// Being brought back after a failure.
    Recovering,
    /// Administratively down.
    Offline,
}

impl BackendStatus {
    pub fn parse(s: &str) -> Option<Self> {
        use BackendStatus::*;
        match s.to_ascii_uppercase().as_str() {
            "PRIMARY" => Some(Primary),
            "SECONDARY" => Some(Secondary),
            "SPARE" => Some(Spare),
            "FAULTY" => Some(Faulty),
            "RECOVERING" => Some(Recovering),
            "OFFLINE" => Some(Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use BackendStatus::*;
        match self {
            Primary => write!(f, "PRIMARY"),
            Secondary => write!(f, "SECONDARY"),
            Spare => write!(f, "SPARE"),
            Faulty => write!(f, "FAULTY"),
            Recovering => write!(f, "RECOVERING"),
            Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Traffic mode of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendMode {
    Offline,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BackendMode {
    pub fn parse(s: &str) -> Option<Self> {
        use BackendMode::*;
        match s.to_ascii_uppercase().as_str() {
            "OFFLINE" => Some(Offline),
            "READ_ONLY" => Some(ReadOnly),
            "WRITE_ONLY" => Some(WriteOnly),
            "READ_WRITE" => Some(ReadWrite),
            _ => None,
        }
    }

    /// Mode accepts writes.
    pub fn writable(&self) -> bool {
        matches!(self, BackendMode::WriteOnly | BackendMode::ReadWrite)
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use BackendMode::*;
        match self {
            Offline => write!(f, "OFFLINE"),
            ReadOnly => write!(f, "READ_ONLY"),
            WriteOnly => write!(f, "WRITE_ONLY"),
            ReadWrite => write!(f, "READ_WRITE"),
        }
    }
}

/// A managed MySQL server. Identity is the uuid the server reports about
/// itself, not the address it is reachable at.
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub uuid: Uuid,
    pub address: String,
    pub user: String,
    pub password: String,
    pub status: BackendStatus,
    pub mode: BackendMode,
    pub weight: f64,
}

impl Backend {
    pub fn new(uuid: Uuid, address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            uuid,
            address: address.into(),
            user: user.into(),
            password: String::new(),
            status: BackendStatus::Secondary,
            mode: BackendMode::ReadOnly,
            weight: 1.0,
        }
    }

    /// Status allows this backend to serve as a promotion candidate at all.
    pub fn promotable(&self) -> bool {
        !matches!(
            self.status,
            BackendStatus::Faulty | BackendStatus::Offline | BackendStatus::Primary
        )
    }
}

/// Attributes observed on a live backend, refreshed on probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Observed {
    pub uuid: Option<Uuid>,
    pub server_id: u32,
    pub version: String,
    pub gtid_enabled: bool,
    pub binlog_enabled: bool,
    pub read_only: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            BackendStatus::Primary,
            BackendStatus::Secondary,
            BackendStatus::Spare,
            BackendStatus::Faulty,
            BackendStatus::Recovering,
            BackendStatus::Offline,
        ] {
            assert_eq!(BackendStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(BackendStatus::parse("bogus"), None);
    }

    #[test]
    fn test_mode_writable() {
        assert!(BackendMode::ReadWrite.writable());
        assert!(BackendMode::WriteOnly.writable());
        assert!(!BackendMode::ReadOnly.writable());
        assert!(!BackendMode::Offline.writable());
    }
}
