use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("PTZ payload must be 16 hex digits, got {0}")]
    InvalidLength(usize),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Media port range exhausted")]
    PortExhausted,

    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("Unknown call id: {0}")]
    UnknownCallId(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Media worker error: {0}")]
    Media(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
