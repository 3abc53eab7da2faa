//! Media viewer: one instance per media reference.
//!
//! Resolves and probes the file, decodes audio into the playback engine,
//! and turns every failure into a visible state plus an event on the
//! parent's channel. On mobile platforms decode and playback failures are
//! absorbed into a permanent download-only mode.

pub mod view;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::context::{AudioContext, BackendFactory};
use crate::audio::decode::Decoder;
use crate::audio::engine::{NoticeFn, PlaybackEngine, PlaybackNotice, PlaybackSnapshot};
use crate::error::{ErrorKind, ViewerError};
use crate::fallback::{extract_transcription, PlatformProfile};
use crate::media::{MediaKind, MediaReference, ResolvedMedia, Resolver};

pub use view::{format_time, MediaView};

/// Notifications a viewer sends to its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    State { id: String, view: MediaView },
    Progress { id: String, playback: PlaybackSnapshot },
    Ended { id: String },
    Error { id: String, kind: ErrorKind, message: String },
    Downloaded { id: String, path: PathBuf },
}

/// Services shared by every viewer of a session.
#[derive(Clone)]
pub struct ViewerServices {
    pub resolver: Arc<Resolver>,
    pub decoder: Decoder,
    pub platform: Arc<dyn PlatformProfile>,
    pub backend: BackendFactory,
    pub frame_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Loading,
    Unavailable(String),
    Failed(String),
    Ready,
    DownloadOnly,
}

struct ViewerStatus {
    phase: Phase,
    media: Option<ResolvedMedia>,
    disposed: bool,
}

impl ViewerStatus {
    fn new() -> Self {
        Self {
            phase: Phase::Loading,
            media: None,
            disposed: false,
        }
    }
}

type SharedStatus = Arc<Mutex<ViewerStatus>>;

fn lock_status(status: &Mutex<ViewerStatus>) -> MutexGuard<'_, ViewerStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Engine notifications for viewer `id`. The disposed check and the send
/// happen under the status lock, so nothing goes out once teardown has
/// marked the viewer.
fn notifier(id: String, status: SharedStatus, events: mpsc::UnboundedSender<MediaEvent>) -> NoticeFn {
    Arc::new(move |notice| {
        let status = lock_status(&status);
        if status.disposed {
            return;
        }
        let event = match notice {
            PlaybackNotice::Progress(playback) => MediaEvent::Progress {
                id: id.clone(),
                playback,
            },
            PlaybackNotice::Ended => MediaEvent::Ended { id: id.clone() },
        };
        let _ = events.send(event);
    })
}

pub struct MediaViewer {
    id: String,
    reference: MediaReference,
    transcription: Option<String>,
    services: ViewerServices,
    engine: PlaybackEngine,
    status: SharedStatus,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl MediaViewer {
    pub fn new(
        id: impl Into<String>,
        reference: MediaReference,
        message: Option<&str>,
        services: ViewerServices,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        let id = id.into();
        let transcription = match reference.kind {
            MediaKind::Audio => message.and_then(extract_transcription),
            _ => None,
        };

        let status = Arc::new(Mutex::new(ViewerStatus::new()));
        let notify = notifier(id.clone(), Arc::clone(&status), events.clone());

        Self {
            engine: PlaybackEngine::new(services.frame_interval, notify),
            id,
            reference,
            transcription,
            services,
            status,
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reference(&self) -> &MediaReference {
        &self.reference
    }

    pub fn transcription(&self) -> Option<&str> {
        self.transcription.as_deref()
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    fn lock(&self) -> MutexGuard<'_, ViewerStatus> {
        lock_status(&self.status)
    }

    fn set_phase(&self, phase: Phase) {
        let mut status = self.lock();
        // Download-only lasts for the lifetime of the viewer.
        if status.phase != Phase::DownloadOnly {
            status.phase = phase;
        }
    }

    fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn emit(&self, event: MediaEvent) {
        let status = self.lock();
        if status.disposed {
            return;
        }
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        self.emit(MediaEvent::State {
            id: self.id.clone(),
            view: self.view(),
        });
    }

    /// Current renderable state.
    pub fn view(&self) -> MediaView {
        let status = self.lock();
        let url = status.media.as_ref().map(|m| m.url.clone());
        let transcription = self.transcription.clone();
        match (&status.phase, url) {
            (Phase::Unavailable(message), _) => MediaView::Unavailable {
                message: message.clone(),
            },
            (Phase::Failed(message), _) => MediaView::Failed {
                message: message.clone(),
            },
            (Phase::Loading, _) | (_, None) => MediaView::Loading { transcription },
            (Phase::DownloadOnly, Some(url)) => MediaView::DownloadOnly { url, transcription },
            (Phase::Ready, Some(url)) => match self.reference.kind {
                MediaKind::Audio => MediaView::Player {
                    url,
                    playback: self.engine.snapshot(),
                    transcription,
                },
                MediaKind::Image => MediaView::Image { url },
                MediaKind::Document => MediaView::Document { url },
            },
        }
    }

    /// Resolve, probe and (for audio) decode. Safe to race with
    /// [`teardown`](Self::teardown): a cancelled open leaves no trace.
    pub async fn open(&self) {
        info!(
            id = %self.id,
            kind = %self.reference.kind,
            file = %self.reference.file_name,
            "Opening media"
        );

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(id = %self.id, "Open cancelled by teardown");
                return;
            }
            outcome = self.load() => outcome,
        };
        if self.is_disposed() {
            return;
        }

        match outcome {
            Ok(()) => self.publish_state(),
            Err(e) => self.handle_failure(e),
        }
    }

    async fn load(&self) -> Result<(), ViewerError> {
        let media = self.services.resolver.resolve_and_probe(&self.reference).await?;
        let url = media.url.clone();
        self.lock().media = Some(media);

        match self.reference.kind {
            MediaKind::Image | MediaKind::Document => {
                self.set_phase(Phase::Ready);
                Ok(())
            }
            MediaKind::Audio => {
                self.engine.begin_loading();
                self.publish_state();
                let result = self.load_audio(&url).await;
                if result.is_err() {
                    self.engine.fail_loading();
                }
                result
            }
        }
    }

    async fn load_audio(&self, url: &str) -> Result<(), ViewerError> {
        let bytes = self.services.decoder.fetch(url).await?;
        self.ensure_context().await?;
        let buffer = self
            .services
            .decoder
            .decode(bytes, self.reference.extension())
            .await?;
        if self.engine.arm(buffer) {
            self.set_phase(Phase::Ready);
        }
        Ok(())
    }

    /// Create the audio context on first use.
    async fn ensure_context(&self) -> Result<(), ViewerError> {
        if self.engine.has_context() {
            return Ok(());
        }
        let factory = Arc::clone(&self.services.backend);
        // The context is wrapped on the blocking thread so that an abandoned
        // open still closes it when the result is dropped.
        let context = tokio::task::spawn_blocking(move || factory().map(AudioContext::new))
            .await
            .map_err(|e| ViewerError::PlaybackError(format!("audio context task failed: {}", e)))??;
        self.engine.install_context(context);
        Ok(())
    }

    fn handle_failure(&self, err: ViewerError) {
        if err.is_fallback_candidate() && self.services.platform.is_mobile() {
            warn!(id = %self.id, error = %err, "Inline playback unavailable, offering download only");
            self.set_phase(Phase::DownloadOnly);
            self.publish_state();
            return;
        }

        error!(id = %self.id, error = %err, "Media error");
        let message = err.to_string();
        let phase = match err {
            ViewerError::UnreachableResource { .. } => Phase::Unavailable(message.clone()),
            _ => Phase::Failed(message.clone()),
        };
        self.set_phase(phase);
        self.publish_state();
        self.emit(MediaEvent::Error {
            id: self.id.clone(),
            kind: err.kind(),
            message,
        });
    }

    fn accepts_playback(&self) -> bool {
        let status = self.lock();
        !status.disposed && status.phase == Phase::Ready && self.reference.kind == MediaKind::Audio
    }

    fn after_playback_call(&self, result: Result<(), ViewerError>) {
        match result {
            Ok(()) => self.publish_state(),
            Err(e) => self.handle_failure(e),
        }
    }

    /// Start or resume. Ignored until the audio is ready.
    pub fn play(&self) {
        if !self.accepts_playback() {
            return;
        }
        let result = self.engine.play();
        self.after_playback_call(result);
    }

    pub fn pause(&self) {
        if !self.accepts_playback() {
            return;
        }
        self.engine.pause();
        self.publish_state();
    }

    /// Jump to `fraction` (clamped into [0, 1]) of the duration and play.
    pub fn seek(&self, fraction: f64) {
        if !self.accepts_playback() {
            return;
        }
        let result = self.engine.seek(fraction);
        self.after_playback_call(result);
    }

    pub fn set_volume(&self, volume: f32) {
        self.engine.set_volume(volume);
        if self.accepts_playback() {
            self.publish_state();
        }
    }

    /// Save the file into `dest_dir`. Explicit user action; the player
    /// state is left untouched whatever the outcome.
    pub async fn download(&self, dest_dir: &Path) -> Result<PathBuf, ViewerError> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ViewerError::DownloadError("viewer closed".into())),
            result = self.save_to(dest_dir) => result,
        };
        match &result {
            Ok(path) => {
                info!(id = %self.id, path = %path.display(), "Media downloaded");
                self.emit(MediaEvent::Downloaded {
                    id: self.id.clone(),
                    path: path.clone(),
                });
            }
            Err(e) => {
                error!(id = %self.id, error = %e, "Download failed");
                self.emit(MediaEvent::Error {
                    id: self.id.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn save_to(&self, dest_dir: &Path) -> Result<PathBuf, ViewerError> {
        let url = self
            .lock()
            .media
            .as_ref()
            .map(|m| m.url.clone())
            .ok_or_else(|| ViewerError::DownloadError("media is not available".into()))?;
        let bytes = self.services.decoder.fetch(&url).await?;

        // Only the final component: file names come from the record store.
        let name = Path::new(&self.reference.file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| ViewerError::DownloadError(format!("cannot create {}: {}", dest_dir.display(), e)))?;
        let path = dest_dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ViewerError::DownloadError(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    /// Cancel any in-flight open, stop playback and release the audio
    /// context. Idempotent.
    pub fn teardown(&self) {
        {
            let mut status = self.lock();
            if status.disposed {
                return;
            }
            status.disposed = true;
        }
        self.cancel.cancel();
        self.engine.teardown();
        debug!(id = %self.id, "Media viewer torn down");
    }
}

impl Drop for MediaViewer {
    fn drop(&mut self) {
        self.teardown();
    }
}
