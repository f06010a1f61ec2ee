//! Status and action codes carried on the wire

/// Outcome of a QueryImage negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OtaQueryStatus {
    UpdateAvailable = 0,
    Busy = 1,
    NotAvailable = 2,
    DownloadProtocolNotSupported = 3,
}

impl OtaQueryStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::UpdateAvailable),
            1 => Some(Self::Busy),
            2 => Some(Self::NotAvailable),
            3 => Some(Self::DownloadProtocolNotSupported),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateAvailable => "update-available",
            Self::Busy => "busy",
            Self::NotAvailable => "not-available",
            Self::DownloadProtocolNotSupported => "download-protocol-not-supported",
        }
    }
}

/// What the requestor should do with a downloaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ApplyUpdateAction {
    #[default]
    Proceed = 0,
    AwaitNextAction = 1,
    Discontinue = 2,
}

impl ApplyUpdateAction {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Proceed),
            1 => Some(Self::AwaitNextAction),
            2 => Some(Self::Discontinue),
            _ => None,
        }
    }
}

/// Protocol-level command status, sent instead of a response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandStatus {
    Success = 0x00,
    Failure = 0x01,
    InvalidCommand = 0x85,
    ResourceExhausted = 0x89,
    NotFound = 0x8B,
}

impl CommandStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::Failure),
            0x85 => Some(Self::InvalidCommand),
            0x89 => Some(Self::ResourceExhausted),
            0x8B => Some(Self::NotFound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::InvalidCommand => "invalid command",
            Self::ResourceExhausted => "resource exhausted",
            Self::NotFound => "not found",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(OtaQueryStatus::from_u8(4), None);
        assert_eq!(ApplyUpdateAction::from_u8(3), None);
        assert_eq!(CommandStatus::from_u8(0x02), None);
    }

    #[test]
    fn command_status_codes() {
        assert_eq!(CommandStatus::InvalidCommand as u8, 0x85);
        assert_eq!(CommandStatus::from_u8(0x89), Some(CommandStatus::ResourceExhausted));
        assert_eq!(CommandStatus::from_u8(0x8B), Some(CommandStatus::NotFound));
    }
}
