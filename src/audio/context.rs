//! The audio-processing context owned by one viewer.
//!
//! An [`AudioContext`] wraps an [`AudioBackend`]: an engine clock plus a way
//! to start playback nodes bound to a [`SampleBuffer`]. The real backend
//! plays through rodio; tests substitute a scripted one.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info, warn};

use super::buffer::SampleBuffer;
use crate::error::ViewerError;

/// Output side of an audio context.
pub trait AudioBackend: Send {
    /// Engine clock in seconds. Monotonic for the life of the backend.
    fn now(&self) -> f64;

    /// Start a node that plays `buffer` from `offset_secs` at `volume`.
    fn start_node(
        &mut self,
        buffer: &SampleBuffer,
        offset_secs: f64,
        volume: f32,
    ) -> Result<Box<dyn PlaybackNode>, ViewerError>;

    /// Release the output device. Called at most once.
    fn close(&mut self);
}

/// One play-through of a buffer. The engine stops a node explicitly before
/// discarding it.
pub trait PlaybackNode: Send {
    fn set_volume(&mut self, volume: f32);

    /// Stop and detach from the output. Idempotent.
    fn stop(&mut self);
}

/// Creates a backend on demand. Called lazily on the first decode.
pub type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn AudioBackend>, ViewerError> + Send + Sync>;

/// Factory for the default rodio output, optionally on a named device.
pub fn rodio_factory(output_device: Option<String>) -> BackendFactory {
    Arc::new(move || {
        let backend = RodioBackend::open(output_device.as_deref())?;
        Ok(Box::new(backend) as Box<dyn AudioBackend>)
    })
}

// ---------------------------------------------------------------------------
// AudioContext
// ---------------------------------------------------------------------------

/// Scoped owner of a backend. Released exactly once, either by an explicit
/// [`close`](Self::close) or on drop.
pub struct AudioContext {
    backend: Option<Box<dyn AudioBackend>>,
}

impl AudioContext {
    pub fn new(backend: Box<dyn AudioBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn now(&self) -> f64 {
        self.backend.as_ref().map(|b| b.now()).unwrap_or(0.0)
    }

    pub fn start_node(
        &mut self,
        buffer: &SampleBuffer,
        offset_secs: f64,
        volume: f32,
    ) -> Result<Box<dyn PlaybackNode>, ViewerError> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| ViewerError::PlaybackError("audio context is closed".into()))?;
        backend.start_node(buffer, offset_secs, volume)
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            debug!("Audio context closed");
        }
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// rodio backend
// ---------------------------------------------------------------------------

/// Plays through the system output with one rodio `Sink` per node.
///
/// rodio's `OutputStream` cannot leave the thread that opened it, so a
/// dedicated thread owns it until the backend is closed. Only the
/// `OutputStreamHandle` crosses threads.
pub struct RodioBackend {
    handle: OutputStreamHandle,
    origin: Instant,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RodioBackend {
    /// Open the named output device, or the default one.
    pub fn open(device: Option<&str>) -> Result<Self, ViewerError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let device = device.map(str::to_string);

        let thread = std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match open_stream(device.as_deref()) {
                Ok((stream, handle)) => {
                    if ready_tx.send(Ok(handle)).is_ok() {
                        // Returns once the sender is dropped by close().
                        let _ = shutdown_rx.recv();
                    }
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| ViewerError::PlaybackError(format!("Failed to spawn output thread: {}", e)))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| ViewerError::PlaybackError("audio output thread exited".into()))??;

        info!("Audio output opened");
        Ok(Self {
            handle,
            origin: Instant::now(),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

fn open_stream(device: Option<&str>) -> Result<(OutputStream, OutputStreamHandle), ViewerError> {
    if let Some(name) = device {
        let host = cpal::default_host();
        let found = host
            .output_devices()
            .map_err(|e| ViewerError::PlaybackError(format!("Failed to list output devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));
        match found {
            Some(d) => {
                return OutputStream::try_from_device(&d).map_err(|e| {
                    ViewerError::PlaybackError(format!("Failed to open output device {}: {}", name, e))
                });
            }
            None => warn!(device = %name, "Output device not found, using default"),
        }
    }
    OutputStream::try_default()
        .map_err(|e| ViewerError::PlaybackError(format!("Failed to open audio output: {}", e)))
}

impl AudioBackend for RodioBackend {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start_node(
        &mut self,
        buffer: &SampleBuffer,
        offset_secs: f64,
        volume: f32,
    ) -> Result<Box<dyn PlaybackNode>, ViewerError> {
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| ViewerError::PlaybackError(format!("Failed to create audio sink: {}", e)))?;
        sink.set_volume(volume.clamp(0.0, 1.0));

        let tail = buffer.samples_from(offset_secs);
        if !tail.is_empty() {
            sink.append(SamplesBuffer::new(
                buffer.channels(),
                buffer.sample_rate(),
                tail.to_vec(),
            ));
        }
        sink.play();
        Ok(Box::new(RodioNode { sink }))
    }

    fn close(&mut self) {
        // Dropping the sender wakes the output thread, which drops the stream.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
    }
}

impl Drop for RodioBackend {
    fn drop(&mut self) {
        self.close();
    }
}

struct RodioNode {
    sink: Sink,
}

impl PlaybackNode for RodioNode {
    fn set_volume(&mut self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }

    fn stop(&mut self) {
        self.sink.stop();
    }
}

/// Names of the available output devices.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            warn!("Failed to enumerate output devices: {}", e);
            Vec::new()
        }
    }
}
