//! Error types for the environment lifecycle.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type EnvResult<T> = Result<T, EnvError>;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("environment '{name}' not found")]
    NotFound { name: String },

    #[error("generated file path '{path}' is not allowed")]
    InvalidFilePath { path: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed writing environment metadata {}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no free port found between {first} and {last}")]
    NoFreePort { first: u16, last: u16 },

    #[error(
        "server for '{name}' did not report ready on port {port} within {}ms",
        timeout.as_millis()
    )]
    ServerStartTimeout {
        name: String,
        port: u16,
        timeout: Duration,
    },

    #[error("server for '{name}' exited on port {port} ({status}); see {}", log.display())]
    ServerExited {
        name: String,
        port: u16,
        status: String,
        log: PathBuf,
    },
}

impl EnvError {
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Port exhaustion and startup problems, which the CLI pairs with a port hint.
    pub fn is_port_problem(&self) -> bool {
        matches!(
            self,
            Self::NoFreePort { .. } | Self::ServerStartTimeout { .. } | Self::ServerExited { .. }
        )
    }
}
