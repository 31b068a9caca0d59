use derive_more::Display;

/// Error type for misuse of the regulation engine API.
#[derive(Debug, Display)]
pub enum MemschedError {
    /// The referenced execution unit does not exist.
    #[display("unknown unit {unit}")]
    UnknownUnit { unit: usize },
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl core::error::Error for MemschedError {}

impl MemschedError {
    pub fn unknown_unit(unit: usize) -> Self {
        Self::UnknownUnit { unit }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}
