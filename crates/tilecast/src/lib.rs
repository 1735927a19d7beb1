//! Viewport-adaptive tile selection and stitching for tiled 360° video.
//!
//! Head poses feed a [`TrackSelector`](selector::TrackSelector), the [`MediaStream`] enables
//! the selected tracks and, for tile streams, merges their packets into one picture per frame.
//! Segments whose selection went stale are re-stitched by the [`catchup`] workers.

pub mod adaptation;
pub mod catchup;
pub mod config;
pub mod error;
pub mod geometry;
pub mod packet;
pub mod pose;
pub mod selector;
pub mod stitch;
pub mod stream;

pub use error::*;
pub use stream::{MediaStream, MediaStreamBuilder, StreamInfo, StreamStatus};

pub use tilecast_predict as predict;
