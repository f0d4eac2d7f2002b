//! Kapibara scripted stream filter library
//!
//! Attaches an operator-provided Lua script to the request and response
//! pipelines of a proxied HTTP stream. The proxy pushes pipeline events
//! (headers, data frames, trailers) into a [`ScriptFilter`]; the script
//! pulls headers, body and trailers through a stream handle and is
//! suspended on a coroutine whenever it asks for data that has not arrived
//! yet.
//!
//! Each worker thread owns an independent [`WorkerRuntime`] built from one
//! shared [`ScriptConfig`]. Script globals are therefore per worker, not
//! per stream, and nothing in this crate is safe to move across workers:
//! a runtime and every filter built on it stay on the thread that created
//! them.

use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;

pub mod error;
pub use error::{HeaderError, ScriptError};

pub mod option;
pub use option::ScriptFilterOption;

pub mod headers;
pub use headers::{ByteHeaderMap, HeaderMap, SharedHeaderMap};

pub mod script;
pub use script::{ScriptConfig, WorkerRuntime, REQUEST_ENTRY_POINT, RESPONSE_ENTRY_POINT};

pub mod filter;
pub use filter::{FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus, ScriptFilter};

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Per-direction hooks into the proxy's buffered body.
pub trait FilterCallbacks {
    /// Append data to the buffered body for this direction.
    fn add_buffered_data(&mut self, data: Bytes);

    /// The currently buffered body, if any data has been buffered.
    fn buffered_body(&self) -> Option<Bytes>;
}

pub type SharedFilterCallbacks = Rc<RefCell<dyn FilterCallbacks>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn from_int(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Sink for script log calls and for script errors reported by the filter.
pub trait ScriptLogger {
    fn script_log(&self, level: LogLevel, message: &[u8]);
}

pub type SharedScriptLogger = Rc<dyn ScriptLogger>;

/// Default logger forwarding script logs to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingScriptLogger;

impl ScriptLogger for TracingScriptLogger {
    fn script_log(&self, level: LogLevel, message: &[u8]) {
        let message = String::from_utf8_lossy(message);
        match level {
            LogLevel::Trace => tracing::trace!("script log: {}", message),
            LogLevel::Debug => tracing::debug!("script log: {}", message),
            LogLevel::Info => tracing::info!("script log: {}", message),
            LogLevel::Warn => tracing::warn!("script log: {}", message),
            LogLevel::Error | LogLevel::Critical => tracing::error!("script log: {}", message),
        }
    }
}
