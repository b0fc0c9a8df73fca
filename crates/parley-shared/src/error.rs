use thiserror::Error;

/// Input rejected on the client before anything is sent or cached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Conversation name must not be empty")]
    EmptyName,

    #[error("Message content must not be empty")]
    EmptyContent,

    #[error("Temperature must be between 0 and 1, got {0}")]
    TemperatureOutOfRange(f64),

    #[error("Max completion tokens must be between 1 and 4000, got {0}")]
    MaxTokensOutOfRange(u32),
}
