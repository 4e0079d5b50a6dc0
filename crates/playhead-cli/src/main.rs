//! playhead, a small CLI that decodes one audio file and plays it through
//! the default (or a chosen) output device.
//!
//! The heavy lifting lives in the `playhead` library; this binary is the
//! control context: it loads the source, initializes the stream, issues
//! speed/volume/seek settings, then polls for the natural end of the
//! stream (or Ctrl-C) and tears everything down.

mod cli;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::{bounded, select, tick};
use playhead::{Playback, PlaybackStatus};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        playhead::device::list_devices(&host)?;
        let count = playhead::device::playback_device_count(&host)?;
        tracing::info!(count, "playback devices");
        return Ok(());
    }

    let Some(path) = args.path.clone() else {
        bail!("no input file given (see --help)");
    };

    let (quit_tx, quit_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("install signal handler")?;

    let mut playback = Playback::new();
    playback.select_device(args.device.clone());
    playback.set_looping(args.loops);
    playback
        .set_speed(args.speed)
        .context("apply --speed")?;
    playback
        .load(&path)
        .with_context(|| format!("load {}", path.display()))?;
    playback.set_volume(args.volume)?;
    playback
        .initialize_stream()
        .context("initialize output stream")?;

    let rate = playback.sample_rate().unwrap_or(0);
    if let Some(secs) = args.seek {
        let frame = (secs.max(0.0) * f64::from(rate)) as u64;
        playback.seek(frame)?;
    }

    playback.start().context("start playback")?;
    tracing::info!(
        path = %path.display(),
        speed = args.speed,
        looping = args.loops,
        "playing"
    );

    let ticker = tick(Duration::from_millis(100));
    let mut last_logged_secs = u64::MAX;
    loop {
        select! {
            recv(quit_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(ticker) -> _ => {
                if playback.has_ended_naturally() {
                    tracing::info!("end of stream");
                    break;
                }
                if rate > 0 {
                    let secs = playback.position_frames() / u64::from(rate);
                    if secs != last_logged_secs && secs % 5 == 0 {
                        last_logged_secs = secs;
                        tracing::debug!(position_secs = secs, "playing");
                    }
                }
            }
        }
    }

    if playback.status() == PlaybackStatus::Active {
        // Some backends cannot pause; termination below stops them anyway.
        if let Err(e) = playback.stop() {
            tracing::warn!("stop failed: {e}");
        }
    }
    playback.terminate()?;
    Ok(())
}
