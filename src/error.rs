use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{what} returned status {status}: {body}")]
    Status {
        what:   &'static str,
        status: reqwest::StatusCode,
        body:   String,
    },

    #[error("{what} timed out after {millis} ms")]
    Timeout { what: &'static str, millis: u64 },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what:   &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("fixture error in {file}: {source}")]
    Fixture {
        file:   String,
        #[source]
        source: csv::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SimResult<T> = Result<T, SimulatorError>;
