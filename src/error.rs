//! Script Filter Error

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script load error: {0}")]
    Load(String),
    #[error("script run error: {0}")]
    Runtime(#[from] mlua::Error),
    #[error("script performed an unexpected yield")]
    UnexpectedYield,
    #[error("object used outside of proper scope")]
    DeadObject,
    #[error("header map can no longer be modified")]
    HeadersReadOnly,
    #[error("body is not buffered")]
    BodyNotBuffered,
    #[error("invalid log level {0}")]
    BadLogLevel(i64),
    #[error("{0} is not supported")]
    NotSupported(&'static str),
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("invalid header name")]
    InvalidName,
    #[error("invalid header value")]
    InvalidValue,
}
