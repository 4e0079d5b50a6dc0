use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "playhead", version)]
pub struct Args {
    /// Path to the audio file to play
    pub path: Option<PathBuf>,

    /// Playback speed multiplier (> 0; 1.0 is normal speed)
    #[arg(long, default_value_t = 1.0)]
    pub speed: f32,

    /// Output volume (typically 0.0..=1.0)
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,

    /// Loop playback instead of stopping at end of stream
    #[arg(long = "loop")]
    pub loops: bool,

    /// Start position in seconds
    #[arg(long)]
    pub seek: Option<f64>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,
}
