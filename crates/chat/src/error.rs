use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("run belongs to a different session")]
    WrongSession,

    #[error("run not found")]
    UnknownRun,

    /// Caller-facing validation failure.
    #[error("{message}")]
    Message { message: String },

    /// Internal failure wrapped with context via [`Context`].
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl tether_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Internal { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

tether_common::impl_context!();
