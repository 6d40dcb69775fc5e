use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("remote call failed: {0}")]
    Network(#[source] anyhow::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("permission denied")]
    Permission,

    #[error("no microphone found")]
    Device,

    #[error("not signed in")]
    NotSignedIn,

    #[error("message has neither text nor audio")]
    EmptyMessage,

    #[error("voice recording is empty")]
    EmptyRecording,

    #[error("local storage failed: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is already registered")]
    AlreadyRegistered(String),
}

impl ChatError {
    pub fn network(err: impl Into<anyhow::Error>) -> Self {
        Self::Network(err.into())
    }
}

/// Why an appearance code was rejected.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("appearance code is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("appearance code is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("appearance code does not hold valid settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0:?} is not a hex colour")]
    InvalidColor(String),
}

macro_rules! network_impl {
    ($E:ty) => {
        impl From<$E> for ChatError {
            fn from(err: $E) -> Self {
                Self::Network(anyhow::Error::from(err))
            }
        }
    };
}

network_impl!(sqlx::Error);
network_impl!(reqwest::Error);
