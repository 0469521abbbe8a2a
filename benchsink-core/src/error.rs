use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("output has already started receiving")]
    AlreadyStarted,

    #[error("timed out waiting for the output to close")]
    Timeout,

    #[error("Derivation Error - {0}")]
    Derivation(String),

    #[error("Reporter Error - {0}")]
    Reporter(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Runtime Error - {0}")]
    Runtime(String),

    #[error("metrics Error - {0}")]
    Metrics(String),
}
