//! Tinnitune CLI - play therapy protocols on an output device
//!
//! Each playing command runs for `--duration` seconds, then ends the session
//! with the configured master fade.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tinnitune_core::{
    AudioDevice, DecodedAudio, EngineConfig, Event, ModulationParams, TherapyEngine, TherapySource,
    Waveform,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tinnitune - sound therapy engine
#[derive(Parser)]
#[command(name = "tinnitune")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration (JSON); missing fields take defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output device name (default: system default)
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List output devices
    Devices {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Play a pure tone
    Tone {
        /// Frequency in Hz
        frequency: f32,

        /// sine, square, triangle or sawtooth
        #[arg(short, long, default_value = "sine")]
        waveform: Waveform,

        /// Tone level in dB
        #[arg(short, long, default_value_t = -30.0, allow_hyphen_values = true)]
        gain_db: f32,

        /// Playback time in seconds
        #[arg(short = 't', long, default_value_t = 10.0)]
        duration: f32,
    },

    /// Play noise with a band gap around the tinnitus frequency
    BandGap {
        /// Tinnitus frequency in Hz
        target: f32,

        /// white, pink, sine, square, triangle or sawtooth
        #[arg(short, long, default_value = "pink")]
        source: TherapySource,

        #[arg(short = 't', long, default_value_t = 60.0)]
        duration: f32,
    },

    /// Play a carrier ring-modulated by a low-frequency cosine
    Modulation {
        /// Carrier frequency in Hz, usually the tinnitus frequency
        carrier: f32,

        /// Modulation rate in Hz
        #[arg(short, long, default_value_t = 10.0)]
        rate: f32,

        /// Modulation depth
        #[arg(long, default_value_t = 1.0)]
        depth: f32,

        /// Modulator phase in radians
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        phase: f32,

        #[arg(short = 't', long, default_value_t = 60.0)]
        duration: f32,
    },

    /// Play a WAV file through the equalizer and band-gap filters
    File {
        /// WAV file to play
        path: PathBuf,

        /// Tinnitus frequency in Hz
        #[arg(long)]
        target: f32,

        /// Play once instead of looping
        #[arg(long)]
        once: bool,

        /// Playback time in seconds (default: file length when playing once)
        #[arg(short = 't', long)]
        duration: Option<f32>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tinnitune=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Devices { json } = cli.command {
        return list_devices(json);
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if cli.device.is_some() {
        config.output.device_name = cli.device.clone();
    }

    let mut engine = TherapyEngine::new(config).context("invalid engine configuration")?;
    engine.initialize().context("failed to open audio output")?;

    let duration = match cli.command {
        Commands::Devices { .. } => return Ok(()),
        Commands::Tone {
            frequency,
            waveform,
            gain_db,
            duration,
        } => {
            engine.play_pure_tone(frequency, waveform, gain_db)?;
            duration
        }
        Commands::BandGap {
            target,
            source,
            duration,
        } => {
            engine.start_band_gap_session(source, target)?;
            duration
        }
        Commands::Modulation {
            carrier,
            rate,
            depth,
            phase,
            duration,
        } => {
            let params = ModulationParams {
                modulation_hz: rate,
                modulation_depth: depth,
                phase_radians: phase,
                ..ModulationParams::new(carrier)
            };
            engine.start_modulation_session(params)?;
            duration
        }
        Commands::File {
            path,
            target,
            once,
            duration,
        } => {
            let audio = DecodedAudio::from_wav_file(&path)
                .with_context(|| format!("failed to decode {}", path.display()))?;
            let therapy = engine.build_file_therapy_chain_with(&audio, target, !once)?;
            match duration {
                Some(duration) => duration,
                None if once => therapy.duration as f32,
                None => bail!("--duration is required for looping playback"),
            }
        }
    };

    play_for(&mut engine, duration)?;
    let report = engine.end_session()?;
    if !report.is_clean() {
        warn!("{} teardown steps failed", report.failures().len());
    }
    Ok(())
}

fn list_devices(json: bool) -> Result<()> {
    let devices = AudioDevice::enumerate_outputs()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    for device in devices {
        let marker = if device.is_default { "*" } else { " " };
        println!(
            "{} {} ({} ch, {:?} Hz)",
            marker, device.name, device.max_channels, device.sample_rates
        );
    }
    Ok(())
}

/// Wait out the playback time, handling engine events as they arrive
fn play_for(engine: &mut TherapyEngine, seconds: f32) -> Result<()> {
    if !(seconds >= 0.0) || !seconds.is_finite() {
        bail!("invalid duration: {}", seconds);
    }
    info!("Playing for {:.1} s", seconds);

    let deadline = Instant::now() + Duration::from_secs_f32(seconds);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
        for event in engine.process_events() {
            if let Event::Error { message } = &event {
                bail!("audio output failed: {}", message);
            }
        }
        if engine.active_sound().is_none() {
            break;
        }
    }
    Ok(())
}
