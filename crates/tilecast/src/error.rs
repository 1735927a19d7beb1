use thiserror::Error;

use crate::adaptation::TrackId;

#[derive(Error, Debug)]
pub enum TilecastError {
    #[error("Invalid viewport parameters: {0}")]
    InvalidViewport(String),

    #[error("Region mapper error: {0}")]
    MapperError(String),

    #[error("Region mapper is not configured")]
    MapperNotConfigured,

    #[error("Invalid stream info: {0}")]
    InvalidStreamInfo(String),

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    #[error("Selection is empty")]
    EmptySelection,

    #[error("Stitch error: {0}")]
    StitchError(String),

    #[error("Stream is stopped")]
    StreamStopped,

    #[error("Stream is already running")]
    StreamRunning,

    #[error("Catch-up is not available for this stream")]
    CatchupDisabled,

    #[error("Catch-up queue is full")]
    CatchupQueueFull,

    #[error(transparent)]
    Predict(#[from] tilecast_predict::PredictError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

pub type TilecastResult<T> = Result<T, TilecastError>;
