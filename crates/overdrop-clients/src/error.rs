use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("service unreachable: {0}")]
    Unavailable(String),

    #[error("service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ClientError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        ClientError::Unavailable(e.to_string())
    }
}
