use std::io;

use pot_protocol::CodecError;

/// Errors that can surface while a store's worker is being supervised.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to create ephemeral socket directory: {0}")]
    TempDir(#[source] io::Error),
    #[error("failed to bind worker socket at {path}: {source}")]
    Bind {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn worker process {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("initial CONFIG request to store '{store}' failed: {source}")]
    InitialConfig {
        store: String,
        #[source]
        source: RelayError,
    },
}

/// Errors raised while relaying a request to, or a response from, a worker.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transaction id space exhausted after a full wraparound lap")]
    IdSpaceExhausted,
    #[error("worker socket closed")]
    WorkerGone,
    #[error("worker returned an error response: {0}")]
    WorkerError(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors reported on the wire to an external client as an error-bearing
/// `REP`, per the fixed taxonomy in `pot_protocol::error_codes`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Key(String),
    #[error("{0}")]
    Value(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Runtime(String),
}

impl RequestError {
    pub fn wire_type(&self) -> &'static str {
        match self {
            RequestError::Key(_) => pot_protocol::error_codes::KEY_ERROR,
            RequestError::Value(_) => pot_protocol::error_codes::VALUE_ERROR,
            RequestError::Type(_) => pot_protocol::error_codes::TYPE_ERROR,
            RequestError::Runtime(_) => pot_protocol::error_codes::RUNTIME_ERROR,
        }
    }

    pub fn text(&self) -> String {
        match self {
            RequestError::Key(s)
            | RequestError::Value(s)
            | RequestError::Type(s)
            | RequestError::Runtime(s) => s.clone(),
        }
    }

    pub fn into_payload(self) -> pot_protocol::ErrorPayload {
        let wire_type = self.wire_type().to_owned();
        pot_protocol::ErrorPayload::new(wire_type, self.text())
    }
}
