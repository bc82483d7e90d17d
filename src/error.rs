use std::time::Duration;

/// Crate-wide error type covering engine, pipeline, and persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("engine initialization failed: {0}")]
    EngineInit(String),

    #[error("engine initialization timeout")]
    EngineInitTimeout,

    #[error("engine process terminated unexpectedly")]
    EngineTerminated,

    #[error("engine task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("engine pool is shutting down")]
    PoolShutdown,

    #[error("task was abandoned before completion")]
    TaskAbandoned,

    #[error("no stdin handle available")]
    NoStdin,

    #[error("no stdout handle available")]
    NoStdout,

    #[error("unknown step '{step}', available: {available:?}")]
    UnknownStep { step: String, available: Vec<String> },

    #[error("thresholds must be strictly increasing, got {0}/{1}/{2}")]
    InvalidThresholds(i32, i32, i32),

    #[error("game not found: {0}")]
    GameNotFound(String),

    #[error("invalid PGN: {0}")]
    InvalidPgn(String),

    #[error("step {step} missing dependencies: {missing:?}")]
    MissingDependencies { step: String, missing: Vec<String> },

    #[error("pipeline failed: {0}")]
    PipelineFailed(String),

    #[error("FEN parsing error: {0}")]
    FenParsing(#[from] shakmaty::fen::ParseFenError),

    #[error("position setup error: {0}")]
    PositionSetup(String),

    #[error("UCI move parsing error: {0}")]
    UciMoveParsing(#[from] shakmaty::uci::ParseUciMoveError),

    #[error("illegal move: {0}")]
    IllegalMove(String),

    #[error("SAN error: {0}")]
    San(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<shakmaty::PositionError<shakmaty::Chess>> for Error {
    fn from(err: shakmaty::PositionError<shakmaty::Chess>) -> Self {
        Error::PositionSetup(err.to_string())
    }
}

impl From<shakmaty::uci::IllegalUciMoveError> for Error {
    fn from(err: shakmaty::uci::IllegalUciMoveError) -> Self {
        Error::IllegalMove(err.to_string())
    }
}

impl From<shakmaty::san::ParseSanError> for Error {
    fn from(err: shakmaty::san::ParseSanError) -> Self {
        Error::San(err.to_string())
    }
}

impl From<shakmaty::san::SanError> for Error {
    fn from(err: shakmaty::san::SanError) -> Self {
        Error::San(err.to_string())
    }
}
