use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchyardError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParsing(#[from] uuid::Error),

    #[error("Unknown job type: {job_type}")]
    UnknownJobType { job_type: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Broker item not found: {id}")]
    ItemNotFound { id: String },

    #[error("Coordination store error: {message}")]
    Coordination { message: String },

    #[error("Lock error: {message}")]
    Lock { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for SwitchyardError {
    fn from(err: toml::de::Error) -> Self {
        SwitchyardError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for SwitchyardError {
    fn from(err: toml::ser::Error) -> Self {
        SwitchyardError::Config(format!("TOML serialization error: {}", err))
    }
}
