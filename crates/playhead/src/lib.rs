pub mod decode;
pub mod device;
pub mod error;
pub mod output;
pub mod playback;
pub mod render;
pub mod resample;
pub mod state;

pub use error::{Result, StreamError};
pub use playback::{Playback, PlaybackStatus};
