use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Predictor plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Predictor plugin {0} does not export symbol {1}")]
    MissingSymbol(String, &'static str),

    #[error("Predictor {call} returned status {status}")]
    PluginStatus { call: &'static str, status: i32 },

    #[error("Predictor initialization failed")]
    InitFailed,

    #[error("Predictor is not initialized")]
    NotInitialized,

    #[error(transparent)]
    LibraryError(#[from] libloading::Error),
}

pub type PredictResult<T> = Result<T, PredictError>;
