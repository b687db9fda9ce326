use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("exchange conflict: {0}")]
    ExchangeConflict(String),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("dedup cache unavailable: {0}")]
    DedupUnavailable(String),

    #[error("persist error: {0}")]
    Persist(String),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("work queue closed")]
    ChannelSend,
}

/// Failure of a bounded publish, carrying the cause of the final attempt.
#[derive(Debug, Error)]
#[error("failed to publish after {attempts} attempts: {last}")]
pub struct PublishError {
    pub attempts: u32,
    #[source]
    pub last: Box<Error>,
}

impl PublishError {
    pub fn new(attempts: u32, last: Error) -> Self {
        Self {
            attempts,
            last: Box::new(last),
        }
    }
}

/// How a failure is handled, see the propagation rules in `pipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Absorbed by the owning connection manager's reconnect loop.
    Transport,
    /// The message can never succeed; dropped without retry.
    Permanent,
    /// The message is dropped (or partially succeeded) but a later one may pass.
    Transient,
    /// Startup cannot continue.
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Connection(_)
            | Error::Subscription(_)
            | Error::ExchangeConflict(_)
            | Error::Transport(_) => ErrorClass::Transport,
            Error::Decode(_) | Error::Validation(_) => ErrorClass::Permanent,
            Error::DedupUnavailable(_)
            | Error::Persist(_)
            | Error::Publish(_)
            | Error::ChannelSend => ErrorClass::Transient,
            Error::Config(_) | Error::Database(_) | Error::Migration(_) | Error::Io(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Short stable label used for metrics and log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::Subscription(_) => "subscription",
            Error::ExchangeConflict(_) => "exchange_conflict",
            Error::Decode(_) => "decode",
            Error::Validation(_) => "validation",
            Error::DedupUnavailable(_) => "dedup_unavailable",
            Error::Persist(_) => "persist",
            Error::Publish(_) => "publish",
            Error::Transport(_) => "transport",
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Migration(_) => "migration",
            Error::Io(_) => "io",
            Error::ChannelSend => "channel_send",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
