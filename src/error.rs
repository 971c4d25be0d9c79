use crate::http::{Request, Response};
use std::io;
use thiserror::Error;

/// Main error type for the file server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Missing file, unmapped extension, traversal attempt or non-regular target
    #[error("{message}")]
    NotFound { message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failure while moving bytes between a source stream and a response
    #[error("Stream error: {0}")]
    Stream(io::Error),

    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// Build the 404 shape for a requested name
    pub fn not_found(name: impl std::fmt::Display) -> Self {
        ServerError::NotFound {
            message: format!("404: Not Found {}", name),
        }
    }

    /// The HTTP status code carried by this error, if any
    pub fn code(&self) -> Option<u16> {
        match self {
            ServerError::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Translate a stat failure on the final candidate path.
///
/// A missing file becomes the 404 shape naming what the caller originally
/// asked for; anything else passes through untouched.
pub fn translate_stat_error(error: io::Error, requested: impl std::fmt::Display) -> ServerError {
    if error.kind() == io::ErrorKind::NotFound {
        ServerError::not_found(requested)
    } else {
        ServerError::Io(error)
    }
}

/// The single channel through which request failures reach the embedder.
///
/// Writing a status for generic errors is the sink's job; the server never
/// does it on its behalf.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: ServerError, request: &Request, response: &mut Response);
}

impl<F> ErrorSink for F
where
    F: Fn(ServerError, &Request, &mut Response) + Send + Sync,
{
    fn report(&self, error: ServerError, request: &Request, response: &mut Response) {
        self(error, request, response)
    }
}
