//! Therapy Engine
//!
//! Entry points used by the host: initialize the output, play one therapy
//! sound at a time, adjust the master gain and tear everything down.
//!
//! # Threading
//!
//! ```text
//!  host thread ── &mut TherapyEngine ──lock──▶ AudioGraph ◀──lock── render (cpal thread / host pull)
//!                        ▲                         ▲
//!                        └──── events ◀────────────┤
//!                                                  └──lock── equalizer loop (tinnitune-eq)
//! ```
//!
//! Mutating operations take `&mut self`, so changes to the active sound and
//! master chain are serialized by ownership. Hosts that drive the engine from
//! several threads wrap it in a `Mutex`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tinnitune_dsp::{db_to_linear, white_noise_buffer, BandGapParams, Waveform, NUM_BINS};
use tracing::{debug, info, warn};

use crate::chains::{
    self, build_notch_peak_chain, ChainHandle, ModulationParams, NotchPeakFilters, TherapySource,
};
use crate::config::{BackendKind, EngineConfig};
use crate::decode::DecodedAudio;
use crate::equalizer::{self, EqualizerHandle};
use crate::error::{EngineError, EngineResult};
use crate::graph::{AudioGraph, Endpoint, ParamKind, UnitId};
use crate::master::{MasterChain, DEFAULT_GAIN_RAMP_SECONDS};
use crate::message::{Event, SoundKind};
use crate::sound::{ActiveSound, SessionProtocol, TeardownReport};
use crate::stream::{DeviceFormat, DeviceOutput, HostOutput, OutputBackend};

/// Time constant of `set_tone_frequency`
const TONE_RETUNE_SECONDS: f64 = 0.01;

/// Margin added to the session fade before the sound is cut
const SESSION_FADE_MARGIN: Duration = Duration::from_millis(20);

/// Capacity of the event channel; events beyond it are dropped
const EVENT_CAPACITY: usize = 256;

/// Result of `build_file_therapy_chain`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileTherapy {
    pub filters: NotchPeakFilters,
    /// Length of the decoded material in seconds
    pub duration: f64,
}

struct EngineContext {
    graph: Arc<Mutex<AudioGraph>>,
    backend: Box<dyn OutputBackend>,
    master: MasterChain,
    active: Option<ActiveSound>,
}

/// The therapy audio engine
pub struct TherapyEngine {
    config: EngineConfig,
    context: Option<EngineContext>,
    event_sender: Sender<Event>,
    event_receiver: Receiver<Event>,
    rng: StdRng,
}

impl TherapyEngine {
    /// Create an engine; no output is opened until `initialize`
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let (event_sender, event_receiver) = bounded(EVENT_CAPACITY);
        let rng = match config.noise_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            context: None,
            event_sender,
            event_receiver,
            rng,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the output and build the master chain. Calling it again resumes a
    /// suspended output and otherwise does nothing.
    pub fn initialize(&mut self) -> EngineResult<()> {
        if let Some(ctx) = self.context.as_mut() {
            if ctx.backend.is_suspended() {
                ctx.backend.resume()?;
                self.emit(Event::Resumed);
            }
            return Ok(());
        }

        let output = &self.config.output;
        let format = match output.backend {
            BackendKind::Host => None,
            BackendKind::Device => Some(DeviceFormat::negotiate(output).map_err(unavailable)?),
        };
        let sample_rate = format.map_or(output.sample_rate, |f| f.sample_rate) as f32;

        let mut graph = AudioGraph::new(sample_rate, self.event_sender.clone())?;
        let master = MasterChain::build(&mut graph, &self.config.master)?;
        let graph = Arc::new(Mutex::new(graph));

        let backend: Box<dyn OutputBackend> = match format {
            None => Box::new(HostOutput::new(Arc::clone(&graph))),
            Some(format) => Box::new(
                DeviceOutput::open(
                    output,
                    format,
                    Arc::clone(&graph),
                    self.event_sender.clone(),
                )
                .map_err(unavailable)?,
            ),
        };

        info!(
            "Engine initialized: {} backend at {} Hz",
            backend.name(),
            sample_rate
        );
        self.emit(Event::Initialized {
            sample_rate,
            backend: backend.name().to_string(),
        });
        self.context = Some(EngineContext {
            graph,
            backend,
            master,
            active: None,
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    fn context(&self) -> EngineResult<&EngineContext> {
        self.context.as_ref().ok_or(EngineError::NotInitialized)
    }

    fn context_mut(&mut self) -> EngineResult<&mut EngineContext> {
        self.context.as_mut().ok_or(EngineError::NotInitialized)
    }

    /// Context sample rate, once initialized
    pub fn sample_rate(&self) -> Option<f32> {
        self.context.as_ref().map(|ctx| ctx.backend.sample_rate())
    }

    /// Graph clock in seconds, once initialized
    pub fn current_time(&self) -> Option<f64> {
        self.context
            .as_ref()
            .map(|ctx| ctx.graph.lock().current_time())
    }

    pub fn master(&self) -> Option<MasterChain> {
        self.context.as_ref().map(|ctx| ctx.master)
    }

    pub fn active_sound(&self) -> Option<&ActiveSound> {
        self.context.as_ref().and_then(|ctx| ctx.active.as_ref())
    }

    pub fn active_kind(&self) -> Option<SoundKind> {
        self.active_sound().map(ActiveSound::kind)
    }

    /// Live units in the graph, 0 before initialization
    pub fn unit_count(&self) -> usize {
        self.context
            .as_ref()
            .map_or(0, |ctx| ctx.graph.lock().unit_count())
    }

    // ---- master gain ---------------------------------------------------

    /// Approach `db` exponentially with time constant `ramp_seconds`.
    /// Does nothing before initialization.
    pub fn set_master_gain_db(&mut self, db: f32, ramp_seconds: f64) -> EngineResult<()> {
        check_finite("master gain", db)?;
        check_seconds("master ramp", ramp_seconds)?;
        let Some(ctx) = self.context.as_ref() else {
            return Ok(());
        };
        ctx.master.set_gain_db(&mut ctx.graph.lock(), db, ramp_seconds)
    }

    /// Return the master gain to its configured default
    pub fn reset_master_gain(&mut self) -> EngineResult<()> {
        self.set_master_gain_db(self.config.master.default_gain_db, DEFAULT_GAIN_RAMP_SECONDS)
    }

    /// Linear master fade to `target_db`. Does nothing before initialization.
    pub fn fade_master_gain(&mut self, target_db: f32, duration_seconds: f64) -> EngineResult<()> {
        check_finite("fade target", target_db)?;
        check_seconds("fade duration", duration_seconds)?;
        let Some(ctx) = self.context.as_ref() else {
            return Ok(());
        };
        ctx.master
            .fade_gain(&mut ctx.graph.lock(), target_db, duration_seconds)
    }

    /// Current linear master gain
    pub fn master_gain(&self) -> EngineResult<f32> {
        let ctx = self.context()?;
        ctx.master.gain(&ctx.graph.lock())
    }

    // ---- tones ---------------------------------------------------------

    /// Replace the active sound with a pure tone
    pub fn play_pure_tone(
        &mut self,
        frequency_hz: f32,
        waveform: Waveform,
        gain_db: f32,
    ) -> EngineResult<()> {
        check_frequency(frequency_hz)?;
        check_finite("tone gain", gain_db)?;
        self.context()?;
        self.stop_active_sound();

        let ctx = self.context_mut()?;
        let (oscillator, gain) = {
            let mut g = ctx.graph.lock();
            let oscillator = g.add_oscillator(waveform, frequency_hz)?;
            let wired = (|| -> EngineResult<UnitId> {
                let gain = g.add_gain(db_to_linear(gain_db))?;
                g.connect(oscillator, Endpoint::Input(gain))?;
                g.connect(gain, ctx.master.input())?;
                let now = g.current_time();
                g.start(oscillator, now)?;
                Ok(gain)
            })();
            match wired {
                Ok(gain) => (oscillator, gain),
                Err(e) => {
                    release_all(&mut g, &[oscillator]);
                    return Err(e);
                }
            }
        };

        ctx.active = Some(ActiveSound::Tone {
            oscillator,
            gain,
            frequency: frequency_hz,
            waveform,
        });
        info!("Tone started: {} Hz {} at {} dB", frequency_hz, waveform, gain_db);
        self.emit(Event::SoundStarted {
            kind: SoundKind::Tone,
        });
        Ok(())
    }

    /// Retune the active tone with a 10 ms exponential approach. Does nothing
    /// when no tone is playing.
    pub fn set_tone_frequency(&mut self, frequency_hz: f32) -> EngineResult<()> {
        check_frequency(frequency_hz)?;
        let Some(ctx) = self.context.as_mut() else {
            return Ok(());
        };
        let Some(ActiveSound::Tone {
            oscillator,
            frequency,
            ..
        }) = ctx.active.as_mut()
        else {
            return Ok(());
        };

        let mut g = ctx.graph.lock();
        let now = g.current_time();
        g.param_mut(*oscillator, ParamKind::Frequency)?
            .set_target_at(frequency_hz, now, TONE_RETUNE_SECONDS);
        *frequency = frequency_hz;
        debug!("Tone retuned to {} Hz", frequency_hz);
        Ok(())
    }

    // ---- teardown ------------------------------------------------------

    /// Fade out and release the active sound. Safe to call at any time.
    pub fn stop_active_sound(&mut self) -> TeardownReport {
        let declick = self.config.declick_seconds as f64;
        let Some(ctx) = self.context.as_mut() else {
            return TeardownReport::new();
        };
        let Some(sound) = ctx.active.take() else {
            return TeardownReport::new();
        };

        let kind = sound.kind();
        let report = sound.teardown(&ctx.graph, declick);
        report.log("stop_active_sound");
        info!("Sound stopped: {:?}", kind);
        self.emit(Event::SoundStopped);
        report
    }

    /// Fade the master to the session floor, stop the active sound and
    /// restore the default master gain. Blocks for the length of the fade.
    pub fn end_session(&mut self) -> EngineResult<TeardownReport> {
        if self.context.is_none() {
            return Ok(TeardownReport::new());
        }
        let fade = self.config.session_fade.clone();
        self.fade_master_gain(fade.floor_db, fade.duration_seconds as f64)?;
        thread::sleep(Duration::from_secs_f32(fade.duration_seconds) + SESSION_FADE_MARGIN);

        let report = self.stop_active_sound();
        self.reset_master_gain()?;
        info!("Session ended");
        Ok(report)
    }

    // ---- chain construction --------------------------------------------

    /// Uniform white noise at the context rate, scaled to ±0.35
    pub fn generate_white_noise_buffer(&mut self, duration_seconds: f32) -> EngineResult<Vec<f32>> {
        if !(duration_seconds >= 0.0) || !duration_seconds.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "noise duration must be non-negative, got {}",
                duration_seconds
            )));
        }
        let sample_rate = self.context()?.backend.sample_rate();
        Ok(white_noise_buffer(&mut self.rng, sample_rate, duration_seconds))
    }

    /// Build and start a generated source; the caller connects its output
    pub fn build_therapy_source(&mut self, kind: TherapySource) -> EngineResult<ChainHandle> {
        let graph = Arc::clone(&self.context()?.graph);
        chains::build_therapy_source(&graph, kind, &mut self.rng)
    }

    /// Ring-modulation chain; the caller connects its output
    pub fn build_modulation_chain(&mut self, params: &ModulationParams) -> EngineResult<ChainHandle> {
        let graph = Arc::clone(&self.context()?.graph);
        chains::build_modulation_chain(&graph, params)
    }

    /// Cascade `source` through the band-gap filters into the master limiter
    pub fn build_notch_peak_chain(
        &mut self,
        source: UnitId,
        target_hz: f32,
    ) -> EngineResult<NotchPeakFilters> {
        let ctx = self.context()?;
        let mut g = ctx.graph.lock();
        build_notch_peak_chain(&mut g, source, target_hz, ctx.master.input())
    }

    /// Balance the two bands around `target_hz` of `input`
    pub fn equalize_spectrum(&mut self, input: UnitId, target_hz: f32) -> EngineResult<EqualizerHandle> {
        let graph = Arc::clone(&self.context()?.graph);
        equalizer::equalize_spectrum(&graph, input, target_hz, &self.config.equalizer)
    }

    /// Connect a unit straight into the master limiter
    pub fn connect_to_output(&mut self, unit: UnitId) -> EngineResult<()> {
        let ctx = self.context()?;
        let input = ctx.master.input();
        ctx.graph.lock().connect(unit, input)
    }

    /// Play decoded material, looped, through the equalizer and band-gap filters
    pub fn build_file_therapy_chain(
        &mut self,
        audio: &DecodedAudio,
        target_hz: f32,
    ) -> EngineResult<FileTherapy> {
        self.build_file_therapy_chain_with(audio, target_hz, true)
    }

    /// As `build_file_therapy_chain`; a non-looping chain stops itself when
    /// the material ends (see `process_events`)
    pub fn build_file_therapy_chain_with(
        &mut self,
        audio: &DecodedAudio,
        target_hz: f32,
        looping: bool,
    ) -> EngineResult<FileTherapy> {
        BandGapParams::for_target(target_hz)?;
        self.context()?;
        self.stop_active_sound();

        let equalizer_config = self.config.equalizer.clone();
        let ctx = self.context_mut()?;
        let graph = Arc::clone(&ctx.graph);
        let limiter = ctx.master.input();

        // Downmix before locking; the render callback waits on the same lock
        let mono: Arc<[f32]> = audio.to_mono().into();
        let (source, gain) = {
            let mut g = graph.lock();
            let source = g.add_buffer_source(mono, audio.sample_rate() as f32, looping)?;
            match g
                .add_gain(1.0)
                .and_then(|gain| g.connect(source, Endpoint::Input(gain)).map(|_| gain))
            {
                Ok(gain) => (source, gain),
                Err(e) => {
                    release_all(&mut g, &[source]);
                    return Err(e);
                }
            }
        };

        let mut equalizer =
            match equalizer::equalize_spectrum(&graph, gain, target_hz, &equalizer_config) {
                Ok(equalizer) => equalizer,
                Err(e) => {
                    release_all(&mut graph.lock(), &[source, gain]);
                    return Err(e);
                }
            };

        let wired = {
            let mut g = graph.lock();
            build_notch_peak_chain(&mut g, equalizer.output(), target_hz, limiter).and_then(
                |filters| {
                    let now = g.current_time();
                    match g.start(source, now) {
                        Ok(()) => Ok(filters),
                        Err(e) => {
                            release_all(&mut g, &filters.units());
                            Err(e)
                        }
                    }
                },
            )
        };
        let filters = match wired {
            Ok(filters) => filters,
            Err(e) => {
                equalizer.stop().log("build_file_therapy_chain");
                release_all(&mut graph.lock(), &[source, gain]);
                return Err(e);
            }
        };

        let duration = audio.duration();
        ctx.active = Some(ActiveSound::File {
            source,
            gain,
            filters,
            equalizer,
            duration,
        });
        info!(
            "File therapy started: {:.1} s at {} Hz, target {} Hz",
            duration,
            audio.sample_rate(),
            target_hz
        );
        self.emit(Event::SoundStarted {
            kind: SoundKind::File,
        });
        Ok(FileTherapy { filters, duration })
    }

    // ---- sessions ------------------------------------------------------

    /// Band-gap protocol on a generated source
    pub fn start_band_gap_session(&mut self, kind: TherapySource, target_hz: f32) -> EngineResult<()> {
        BandGapParams::for_target(target_hz)?;
        self.context()?;
        self.stop_active_sound();

        let chain = self.build_therapy_source(kind)?;
        let (gain, filters) = {
            let ctx = self.context()?;
            let mut g = ctx.graph.lock();
            let gain = g.add_gain(1.0)?;
            let wired = g
                .connect(chain.output(), Endpoint::Input(gain))
                .and_then(|_| build_notch_peak_chain(&mut g, gain, target_hz, ctx.master.input()));
            match wired {
                Ok(filters) => (gain, filters),
                Err(e) => {
                    release_all(&mut g, &[gain]);
                    drop(g);
                    drop(chain);
                    return Err(e);
                }
            }
        };

        self.register_session(
            SessionProtocol::BandGap {
                source: kind,
                target_hz,
            },
            chain,
            gain,
            Some(filters),
        )?;
        self.reset_master_gain()?;
        info!("Band-gap session started: {} source, target {} Hz", kind, target_hz);
        Ok(())
    }

    /// Modulation protocol straight into the limiter
    pub fn start_modulation_session(&mut self, params: ModulationParams) -> EngineResult<()> {
        params.validate()?;
        self.context()?;
        self.stop_active_sound();

        let chain = self.build_modulation_chain(&params)?;
        let gain = {
            let ctx = self.context()?;
            let mut g = ctx.graph.lock();
            let gain = g.add_gain(1.0)?;
            let wired = g
                .connect(chain.output(), Endpoint::Input(gain))
                .and_then(|_| g.connect(gain, ctx.master.input()));
            if let Err(e) = wired {
                release_all(&mut g, &[gain]);
                drop(g);
                drop(chain);
                return Err(e);
            }
            gain
        };

        self.register_session(SessionProtocol::Modulation(params), chain, gain, None)?;
        self.reset_master_gain()?;
        info!(
            "Modulation session started: carrier {} Hz, modulator {} Hz",
            params.carrier_hz, params.modulation_hz
        );
        Ok(())
    }

    fn register_session(
        &mut self,
        protocol: SessionProtocol,
        chain: ChainHandle,
        gain: UnitId,
        filters: Option<NotchPeakFilters>,
    ) -> EngineResult<()> {
        let sound = ActiveSound::Session {
            protocol,
            chain,
            gain,
            filters,
        };
        let kind = sound.kind();
        self.context_mut()?.active = Some(sound);
        self.emit(Event::SoundStarted { kind });
        Ok(())
    }

    // ---- output --------------------------------------------------------

    /// Pause the output; graph state is kept
    pub fn suspend(&mut self) -> EngineResult<()> {
        let ctx = self.context_mut()?;
        if ctx.backend.is_suspended() {
            return Ok(());
        }
        ctx.backend.suspend()?;
        info!("Output suspended");
        self.emit(Event::Suspended);
        Ok(())
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        let ctx = self.context_mut()?;
        if !ctx.backend.is_suspended() {
            return Ok(());
        }
        ctx.backend.resume()?;
        info!("Output resumed");
        self.emit(Event::Resumed);
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.context
            .as_ref()
            .is_some_and(|ctx| ctx.backend.is_suspended())
    }

    /// Pull rendered mono audio (host backend only)
    pub fn render(&mut self, out: &mut [f32]) -> EngineResult<()> {
        self.context_mut()?.backend.render(out)
    }

    pub fn master_spectrum(&self) -> EngineResult<[f32; NUM_BINS]> {
        let ctx = self.context()?;
        ctx.master.spectrum(&mut ctx.graph.lock())
    }

    pub fn master_rms(&self) -> EngineResult<f32> {
        let ctx = self.context()?;
        ctx.master.rms(&ctx.graph.lock())
    }

    // ---- events --------------------------------------------------------

    /// Next pending event, if any
    pub fn poll_event(&self) -> Option<Event> {
        self.event_receiver.try_recv().ok()
    }

    /// Drain pending events and act on them. A finished non-looping file
    /// source stops the file chain. The drained events are returned.
    pub fn process_events(&mut self) -> Vec<Event> {
        let events: Vec<Event> = self.event_receiver.try_iter().collect();
        for event in &events {
            match event {
                Event::SourceEnded { unit } => {
                    let ended_active = matches!(
                        self.active_sound(),
                        Some(ActiveSound::File { source, .. }) if source == unit
                    );
                    if ended_active {
                        debug!("File source {} ended", unit);
                        self.stop_active_sound();
                    }
                }
                Event::Error { message } => warn!("Engine error: {}", message),
                _ => {}
            }
        }
        events
    }

    fn emit(&self, event: Event) {
        if let Err(TrySendError::Full(event)) = self.event_sender.try_send(event) {
            debug!("Event channel full, dropping {:?}", event);
        }
    }
}

impl Drop for TherapyEngine {
    fn drop(&mut self) {
        self.stop_active_sound();
    }
}

/// Release units of a half-built chain
fn release_all(graph: &mut AudioGraph, units: &[UnitId]) {
    for &unit in units {
        if let Err(e) = graph.release(unit) {
            warn!("Failed to release unit {}: {}", unit, e);
        }
    }
}

fn unavailable(err: EngineError) -> EngineError {
    match err {
        EngineError::EngineUnavailable(_) => err,
        other => EngineError::EngineUnavailable(other.to_string()),
    }
}

fn check_finite(what: &str, value: f32) -> EngineResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidParameter(format!("{} must be finite, got {}", what, value)))
    }
}

fn check_seconds(what: &str, seconds: f64) -> EngineResult<()> {
    if seconds >= 0.0 && seconds.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidParameter(format!(
            "{} must be a non-negative time, got {}",
            what, seconds
        )))
    }
}

fn check_frequency(frequency_hz: f32) -> EngineResult<()> {
    if frequency_hz > 0.0 && frequency_hz.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidParameter(format!(
            "frequency must be positive, got {}",
            frequency_hz
        )))
    }
}
