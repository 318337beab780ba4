use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ebarimt_core::ConfigError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Client(#[from] ebarimt_core::ClientError),

    #[error(transparent)]
    Queue(#[from] ebarimt_core::QueueError),

    #[error(transparent)]
    Operator(#[from] ebarimt_core::operator::OperatorError),

    #[error(transparent)]
    Sync(#[from] ebarimt_core::SyncError),

    #[error(transparent)]
    Store(#[from] ebarimt_store::StoreError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Command(_) => 2,
            Self::Client(_) => 3,
            Self::Operator(_) => 7,
            Self::Queue(_) | Self::Store(_) => 8,
            Self::Sync(_) => 9,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}
