use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network failure or timeout; retried until the attempt ceiling.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success status that survived the retry loop.
    #[error("remote error (status {status}): {body}")]
    Remote { status: u16, body: String },

    /// 2xx response carrying a tRPC error envelope instead of data.
    #[error("procedure error: {0}")]
    Procedure(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// A remote payload did not have the shape an extractor expected.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("no list found in response (tried {0})")]
    NoList(String),
    #[error("missing field: {0}")]
    MissingField(String),
}
