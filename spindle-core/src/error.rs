use thiserror::Error;

/// Unified error type for the Spindle platform.
#[derive(Error, Debug)]
pub enum SpindleError {
    #[error("Function not found: {0}")]
    UnknownFunction(String),

    #[error("Missing required argument '{argument}' for {function}")]
    MissingArgument { function: String, argument: String },

    #[error("Argument name '{argument}' used in function {function} is reserved")]
    ReservedArgument { function: String, argument: String },

    #[error("A function with the name {0} is already registered")]
    DuplicateFunction(String),

    #[error("Invalid reservation UUID: {0}")]
    InvalidUuid(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl SpindleError {
    /// Map to HTTP status code for the JSON surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            SpindleError::UnknownFunction(_) => 404,
            SpindleError::ReservationNotFound(_) => 404,
            SpindleError::MissingArgument { .. } => 400,
            SpindleError::InvalidUuid(_) => 400,
            SpindleError::ReservedArgument { .. } => 500,
            SpindleError::DuplicateFunction(_) => 500,
            SpindleError::SchedulerUnavailable(_) => 502,
            SpindleError::Broker(_) => 503,
            _ => 500,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self) -> Vec<u8> {
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": self.status_code(),
        });
        body.to_string().into_bytes()
    }
}
