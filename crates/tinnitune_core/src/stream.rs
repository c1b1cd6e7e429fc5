//! Output Backends
//!
//! Where the rendered graph goes:
//!
//! ```text
//! DeviceOutput:  cpal callback ──lock──▶ AudioGraph::render ──▶ every device channel
//! HostOutput:    host pull (TherapyEngine::render) ──lock──▶ AudioGraph::render
//! ```
//!
//! cpal streams are not `Send`, so `DeviceOutput` keeps its stream on a
//! dedicated thread and talks to it over a command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig as CpalStreamConfig};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::device::find_output_device;
use crate::error::{EngineError, EngineResult};
use crate::graph::AudioGraph;
use crate::message::Event;

/// Frames rendered per graph lock inside the device callback
const CALLBACK_CHUNK: usize = 1024;

/// Destination of the rendered graph
pub trait OutputBackend: Send {
    fn name(&self) -> &'static str;

    fn sample_rate(&self) -> f32;

    /// Pause output. Graph state is kept and the clock stops.
    fn suspend(&mut self) -> EngineResult<()>;

    fn resume(&mut self) -> EngineResult<()>;

    fn is_suspended(&self) -> bool;

    /// Pull rendered audio. Only backends without their own clock support this.
    fn render(&mut self, _out: &mut [f32]) -> EngineResult<()> {
        Err(EngineError::InvalidState(format!(
            "the {} backend renders on its own clock",
            self.name()
        )))
    }
}

/// Output pulled by the embedding host
pub struct HostOutput {
    graph: Arc<Mutex<AudioGraph>>,
    sample_rate: f32,
    suspended: bool,
}

impl HostOutput {
    pub fn new(graph: Arc<Mutex<AudioGraph>>) -> Self {
        let sample_rate = graph.lock().sample_rate();
        Self {
            graph,
            sample_rate,
            suspended: false,
        }
    }
}

impl OutputBackend for HostOutput {
    fn name(&self) -> &'static str {
        "host"
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn suspend(&mut self) -> EngineResult<()> {
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> EngineResult<()> {
        self.suspended = false;
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn render(&mut self, out: &mut [f32]) -> EngineResult<()> {
        if self.suspended {
            out.fill(0.0);
        } else {
            self.graph.lock().render(out);
        }
        Ok(())
    }
}

/// Device format settled with the host before the graph exists
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl DeviceFormat {
    /// Query the default output configuration of the configured device
    pub fn negotiate(config: &OutputConfig) -> EngineResult<Self> {
        let device = find_output_device(config.device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))?;

        Ok(Self {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
            sample_format: supported.sample_format(),
        })
    }
}

enum StreamCommand {
    Suspend,
    Resume,
    Shutdown,
}

/// Physical output device driven by cpal
pub struct DeviceOutput {
    format: DeviceFormat,
    commands: Sender<StreamCommand>,
    suspended: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceOutput {
    /// Open the device and start rendering `graph` into it
    pub fn open(
        config: &OutputConfig,
        format: DeviceFormat,
        graph: Arc<Mutex<AudioGraph>>,
        events: Sender<Event>,
    ) -> EngineResult<Self> {
        let (command_sender, command_receiver) = bounded::<StreamCommand>(8);
        let (ready_sender, ready_receiver) = bounded::<EngineResult<()>>(1);
        let suspended = Arc::new(AtomicBool::new(false));

        let device_name = config.device_name.clone();
        let buffer_size = config.buffer_size;
        let suspended_clone = Arc::clone(&suspended);

        let thread = thread::Builder::new()
            .name("tinnitune-audio".into())
            .spawn(move || {
                let stream = match build_stream(
                    device_name.as_deref(),
                    format,
                    buffer_size,
                    graph,
                    suspended_clone,
                    events.clone(),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_sender.send(Err(e));
                        return;
                    }
                };
                let _ = ready_sender.send(Ok(()));

                for command in command_receiver.iter() {
                    let result = match command {
                        StreamCommand::Suspend => stream.pause().map_err(|e| e.to_string()),
                        StreamCommand::Resume => stream.play().map_err(|e| e.to_string()),
                        StreamCommand::Shutdown => break,
                    };
                    if let Err(e) = result {
                        warn!("Output stream command failed: {}", e);
                        let _ = events.try_send(Event::error(e));
                    }
                }
                debug!("Audio thread exiting");
            })
            .map_err(|e| EngineError::StreamBuildError(e.to_string()))?;

        match ready_receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(EngineError::StreamBuildError("audio thread exited".into()));
            }
        }

        info!(
            "Output stream open: {} Hz, {} channels, {:?}",
            format.sample_rate, format.channels, format.sample_format
        );

        Ok(Self {
            format,
            commands: command_sender,
            suspended,
            thread: Some(thread),
        })
    }

    pub fn format(&self) -> DeviceFormat {
        self.format
    }

    fn send_command(&self, command: StreamCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::ChannelSendError)
    }
}

impl OutputBackend for DeviceOutput {
    fn name(&self) -> &'static str {
        "device"
    }

    fn sample_rate(&self) -> f32 {
        self.format.sample_rate as f32
    }

    fn suspend(&mut self) -> EngineResult<()> {
        self.suspended.store(true, Ordering::Relaxed);
        self.send_command(StreamCommand::Suspend)
    }

    fn resume(&mut self) -> EngineResult<()> {
        self.suspended.store(false, Ordering::Relaxed);
        self.send_command(StreamCommand::Resume)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    format: DeviceFormat,
    buffer_size: Option<u32>,
    graph: Arc<Mutex<AudioGraph>>,
    suspended: Arc<AtomicBool>,
    events: Sender<Event>,
) -> EngineResult<Stream> {
    let device = find_output_device(device_name)?;
    let config = CpalStreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: buffer_size.map_or(cpal::BufferSize::Default, cpal::BufferSize::Fixed),
    };

    let stream = match format.sample_format {
        SampleFormat::F32 => {
            build_output_stream::<f32>(&device, &config, graph, suspended, events)?
        }
        SampleFormat::I16 => {
            build_output_stream::<i16>(&device, &config, graph, suspended, events)?
        }
        other => {
            return Err(EngineError::StreamBuildError(format!(
                "unsupported sample format: {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| EngineError::StreamPlayError(e.to_string()))?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &CpalStreamConfig,
    graph: Arc<Mutex<AudioGraph>>,
    suspended: Arc<AtomicBool>,
    events: Sender<Event>,
) -> EngineResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = vec![0.0_f32; CALLBACK_CHUNK];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Real-time audio callback - NO allocations allowed here
                if suspended.load(Ordering::Relaxed) {
                    data.fill(T::EQUILIBRIUM);
                    return;
                }

                let mut graph = graph.lock();
                for frames in data.chunks_mut(channels * CALLBACK_CHUNK) {
                    let block = &mut mono[..frames.len() / channels];
                    graph.render(block);
                    for (frame, &sample) in frames.chunks_mut(channels).zip(block.iter()) {
                        frame.fill(T::from_sample(sample));
                    }
                }
            },
            move |err| {
                let _ = events.try_send(Event::error(err));
            },
            None,
        )
        .map_err(|e| EngineError::StreamBuildError(e.to_string()))
}
