//! Playback engine: one playback session over a decoded buffer.
//!
//! State machine: `Idle -> Loading -> Ready -> Playing -> (Idle | Ready)`.
//! `Ready` is the barrier between decode and playback; `play` and `seek` are
//! silent no-ops until a buffer is armed.
//!
//! While `Playing`, a render loop samples the engine clock once per frame
//! and publishes progress. Each playing episode owns its own
//! `CancellationToken`; leaving `Playing` on any path cancels it, and a frame
//! from a stale loop is ignored by generation check.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::buffer::SampleBuffer;
use super::context::{AudioContext, PlaybackNode};
use crate::error::ViewerError;

/// Default render-loop period, about one display frame.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing playing. A buffer may or may not be armed.
    Idle,
    /// Decode in flight.
    Loading,
    /// Buffer armed, not playing.
    Ready,
    /// A playback node is driving output.
    Playing,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Playing => write!(f, "playing"),
        }
    }
}

/// Point-in-time view of the engine, published every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub state: EngineState,
    pub offset_secs: f64,
    pub duration_secs: f64,
    pub progress_percent: f64,
    pub volume: f32,
}

/// Notifications from the render loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    Progress(PlaybackSnapshot),
    /// Playback reached the end of the buffer. Sent once per play-through.
    Ended,
}

pub type NoticeFn = Arc<dyn Fn(PlaybackNotice) + Send + Sync>;

/// `clamp(offset / duration * 100, 0, 100)`, with 0 for an empty buffer.
pub fn progress_percent(offset_secs: f64, duration_secs: f64) -> f64 {
    if duration_secs <= 0.0 || !offset_secs.is_finite() {
        return 0.0;
    }
    (offset_secs / duration_secs * 100.0).clamp(0.0, 100.0)
}

/// Clamp a seek fraction into [0, 1]. NaN seeks to the start.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

struct EngineInner {
    state: EngineState,
    buffer: Option<SampleBuffer>,
    context: Option<AudioContext>,
    node: Option<Box<dyn PlaybackNode>>,
    /// Engine-clock time at which offset 0 would have started.
    started_at: f64,
    offset_secs: f64,
    volume: f32,
    loop_token: Option<CancellationToken>,
    generation: u64,
    torn_down: bool,
}

impl EngineInner {
    fn duration(&self) -> f64 {
        self.buffer.as_ref().map(|b| b.duration_secs()).unwrap_or(0.0)
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        let duration = self.duration();
        PlaybackSnapshot {
            state: self.state,
            offset_secs: self.offset_secs,
            duration_secs: duration,
            progress_percent: progress_percent(self.offset_secs, duration),
            volume: self.volume,
        }
    }

    /// Cancel the render loop and stop the active node, if any.
    fn detach(&mut self) {
        if let Some(token) = self.loop_token.take() {
            token.cancel();
        }
        if let Some(mut node) = self.node.take() {
            node.stop();
        }
    }
}

/// Drives playback of one buffer for one viewer.
pub struct PlaybackEngine {
    inner: Arc<Mutex<EngineInner>>,
    frame_interval: Duration,
    notify: NoticeFn,
}

impl PlaybackEngine {
    pub fn new(frame_interval: Duration, notify: NoticeFn) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                state: EngineState::Idle,
                buffer: None,
                context: None,
                node: None,
                started_at: 0.0,
                offset_secs: 0.0,
                volume: 1.0,
                loop_token: None,
                generation: 0,
                torn_down: false,
            })),
            frame_interval,
            notify,
        }
    }

    /// Engine without observers, for callers that poll [`snapshot`](Self::snapshot).
    pub fn detached(frame_interval: Duration) -> Self {
        Self::new(frame_interval, Arc::new(|_| {}))
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        lock_inner(&self.inner)
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.lock().snapshot()
    }

    pub fn has_buffer(&self) -> bool {
        self.lock().buffer.is_some()
    }

    pub fn has_context(&self) -> bool {
        self.lock().context.is_some()
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    /// Enter `Loading` for the decode window.
    pub fn begin_loading(&self) {
        let mut g = self.lock();
        if g.torn_down {
            return;
        }
        g.detach();
        g.state = EngineState::Loading;
    }

    /// Leave `Loading` after a failed decode.
    pub fn fail_loading(&self) {
        let mut g = self.lock();
        if g.state == EngineState::Loading {
            g.state = EngineState::Idle;
        }
    }

    /// Adopt the audio context. A context installed after teardown is
    /// closed immediately; a second context is discarded.
    pub fn install_context(&self, mut context: AudioContext) {
        let mut g = self.lock();
        if g.torn_down {
            context.close();
            return;
        }
        if g.context.is_none() {
            g.context = Some(context);
        }
    }

    /// Arm the engine with a decoded buffer (`Ready`). Returns `false` if the
    /// engine was torn down in the meantime.
    pub fn arm(&self, buffer: SampleBuffer) -> bool {
        let mut g = self.lock();
        if g.torn_down {
            return false;
        }
        g.detach();
        g.buffer = Some(buffer);
        g.offset_secs = 0.0;
        g.state = EngineState::Ready;
        true
    }

    /// Start (or resume) playback from the current offset.
    ///
    /// No-op without a buffer, while loading, or when already playing.
    pub fn play(&self) -> Result<(), ViewerError> {
        let mut g = self.lock();
        if g.torn_down || matches!(g.state, EngineState::Loading | EngineState::Playing) {
            return Ok(());
        }
        let Some(buffer) = g.buffer.clone() else {
            return Ok(());
        };
        let offset = if g.offset_secs >= buffer.duration_secs() {
            0.0
        } else {
            g.offset_secs
        };
        self.start_at(&mut g, &buffer, offset)
    }

    /// Stop output and keep the current position (`Ready`). `play` resumes
    /// from here.
    pub fn pause(&self) {
        let mut g = self.lock();
        if g.state != EngineState::Playing {
            return;
        }
        let now = g.context.as_ref().map(|c| c.now()).unwrap_or(g.started_at);
        let duration = g.duration();
        g.offset_secs = (now - g.started_at).clamp(0.0, duration);
        g.detach();
        g.state = EngineState::Ready;
        debug!(offset_secs = g.offset_secs, "Playback paused");
    }

    /// Jump to `fraction` of the duration and play from there.
    ///
    /// The fraction is clamped into [0, 1]. No-op without a buffer.
    pub fn seek(&self, fraction: f64) -> Result<(), ViewerError> {
        let mut g = self.lock();
        if g.torn_down || g.state == EngineState::Loading {
            return Ok(());
        }
        let Some(buffer) = g.buffer.clone() else {
            return Ok(());
        };
        let offset = clamp_fraction(fraction) * buffer.duration_secs();
        self.start_at(&mut g, &buffer, offset)
    }

    pub fn set_volume(&self, volume: f32) {
        let mut g = self.lock();
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        g.volume = volume;
        if let Some(node) = g.node.as_mut() {
            node.set_volume(volume);
        }
    }

    fn start_at(
        &self,
        g: &mut EngineInner,
        buffer: &SampleBuffer,
        offset: f64,
    ) -> Result<(), ViewerError> {
        // Never two nodes at once: the old one goes before the new one starts.
        g.detach();

        let volume = g.volume;
        let context = g.context.as_mut().ok_or_else(|| {
            ViewerError::PlaybackError("audio context not initialised".into())
        })?;
        let node = match context.start_node(buffer, offset, volume) {
            Ok(node) => node,
            Err(e) => {
                g.state = EngineState::Ready;
                return Err(e);
            }
        };
        let now = context.now();

        g.node = Some(node);
        g.started_at = now - offset;
        g.offset_secs = offset;
        g.state = EngineState::Playing;
        g.generation += 1;

        let token = CancellationToken::new();
        g.loop_token = Some(token.clone());
        info!(offset_secs = format!("{:.2}", offset), "Playback started");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(render_loop(
                    Arc::downgrade(&self.inner),
                    token,
                    g.generation,
                    self.frame_interval,
                    Arc::clone(&self.notify),
                ));
            }
            Err(_) => debug!("No runtime, render loop must be driven by tick()"),
        }
        Ok(())
    }

    /// Run one render frame by hand. Returns whether another frame is due.
    pub fn tick(&self) -> bool {
        render_frame(&self.inner, None, &self.notify)
    }

    /// Stop everything and release the audio context. Idempotent.
    pub fn teardown(&self) {
        let mut g = self.lock();
        if g.torn_down {
            return;
        }
        g.torn_down = true;
        g.detach();
        g.buffer = None;
        g.offset_secs = 0.0;
        g.state = EngineState::Idle;
        if let Some(mut context) = g.context.take() {
            context.close();
        }
        debug!("Playback engine torn down");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn lock_inner(inner: &Mutex<EngineInner>) -> MutexGuard<'_, EngineInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One frame: advance the offset, or finish the play-through.
fn render_frame(inner: &Mutex<EngineInner>, generation: Option<u64>, notify: &NoticeFn) -> bool {
    let notice = {
        let mut g = lock_inner(inner);
        if g.state != EngineState::Playing {
            return false;
        }
        if generation.is_some_and(|expected| expected != g.generation) {
            return false;
        }
        let duration = g.duration();
        let now = g.context.as_ref().map(|c| c.now()).unwrap_or(g.started_at);
        let elapsed = (now - g.started_at).max(0.0);

        if elapsed >= duration {
            g.detach();
            g.state = EngineState::Idle;
            g.offset_secs = 0.0;
            info!("Playback finished");
            PlaybackNotice::Ended
        } else {
            g.offset_secs = elapsed;
            PlaybackNotice::Progress(g.snapshot())
        }
    };

    let keep_going = matches!(notice, PlaybackNotice::Progress(_));
    notify(notice);
    keep_going
}

async fn render_loop(
    inner: Weak<Mutex<EngineInner>>,
    token: CancellationToken,
    generation: u64,
    interval: Duration,
    notify: NoticeFn,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if token.is_cancelled() {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !render_frame(&inner, Some(generation), &notify) {
            break;
        }
    }
    debug!(generation, "Render loop exited");
}
