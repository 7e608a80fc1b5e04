use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("node {name} not found")]
    NodeNotFound { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;
