//! Main loop: routes IPC commands to the backend and to media viewers, and
//! forwards viewer events back out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::audio::{list_output_devices, rodio_factory, BackendFactory, Decoder};
use crate::backend::{openable_reference, AuthStore, ConversationService, MessageList, PocketBase};
use crate::config::{get_session_path, ViewerConfig};
use crate::error::ErrorKind;
use crate::fallback::{PlatformProfile, UserAgentProfile};
use crate::ipc::{ViewerCommand, ViewerEvent};
use crate::media::Resolver;
use crate::viewer::{format_time, MediaEvent, MediaViewer, ViewerServices};

/// Where outgoing events go. stdout in production.
pub type EventSink = Arc<dyn Fn(ViewerEvent) + Send + Sync>;

pub struct App {
    config: ViewerConfig,
    services: ViewerServices,
    auth: Arc<AuthStore>,
    conversations: ConversationService,
    viewers: HashMap<String, Arc<MediaViewer>>,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    sink: EventSink,
}

impl App {
    /// App with the rodio output, user-agent platform detection and the
    /// session file in the data directory.
    pub fn new(config: ViewerConfig, sink: EventSink) -> anyhow::Result<Self> {
        let platform = Arc::new(UserAgentProfile::new(config.user_agent()));
        let backend = rodio_factory(config.output_device.clone());
        Self::build(config, platform, backend, get_session_path(), sink)
    }

    pub fn build(
        config: ViewerConfig,
        platform: Arc<dyn PlatformProfile>,
        backend: BackendFactory,
        session_path: PathBuf,
        sink: EventSink,
    ) -> anyhow::Result<Self> {
        let base = Url::parse(config.backend_url())
            .with_context(|| format!("Invalid backend URL: {}", config.backend_url()))?;
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        let resolver = Arc::new(
            Resolver::new(base.clone(), http.clone())?.with_probe_timeout(config.probe_timeout()),
        );
        let client = PocketBase::new(base, http.clone())?;
        let auth = Arc::new(AuthStore::new(client.clone(), session_path));
        let conversations = ConversationService::new(client, Arc::clone(&resolver));

        let services = ViewerServices {
            resolver,
            decoder: Decoder::new(http).with_timeout(config.download_timeout()),
            platform,
            backend,
            frame_interval: config.frame_interval(),
        };
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        info!(backend = %config.backend_url(), "Viewer configured");
        Ok(Self {
            config,
            services,
            auth,
            conversations,
            viewers: HashMap::new(),
            media_tx,
            media_rx,
            sink,
        })
    }

    /// Pick up a saved login. Returns whether a valid session exists.
    pub fn restore_session(&self) -> bool {
        self.auth.restore().is_some()
    }

    fn emit(&self, event: ViewerEvent) {
        (self.sink)(event);
    }

    fn emit_error(&self, id: Option<&str>, message: impl Into<String>) {
        self.emit(ViewerEvent::Error {
            id: id.map(str::to_string),
            kind: None,
            message: message.into(),
        });
    }

    /// Process commands until `stop` or end of input, then tear down every
    /// open viewer.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ViewerCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(command) => {
                            if !self.handle_command(command) {
                                break;
                            }
                        }
                        None => {
                            info!("stdin closed, shutting down");
                            break;
                        }
                    }
                }
                Some(event) = self.media_rx.recv() => self.forward(event),
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for (_, viewer) in self.viewers.drain() {
            viewer.teardown();
        }
        info!("All viewers closed");
    }

    fn viewer(&self, id: &str) -> Option<Arc<MediaViewer>> {
        let viewer = self.viewers.get(id).cloned();
        if viewer.is_none() {
            self.emit_error(Some(id), format!("No media open with id {}", id));
        }
        viewer
    }

    /// Handle a single command. Returns `false` if the main loop should exit.
    pub fn handle_command(&mut self, cmd: ViewerCommand) -> bool {
        match cmd {
            ViewerCommand::Ping {} => self.emit(ViewerEvent::Pong {}),

            ViewerCommand::Stop {} => {
                self.emit(ViewerEvent::Stopping {});
                return false;
            }

            ViewerCommand::Login { email, password } => {
                let auth = Arc::clone(&self.auth);
                let sink = Arc::clone(&self.sink);
                tokio::spawn(async move {
                    match auth.login(&email, &password).await {
                        Ok(session) => sink(ViewerEvent::LoggedIn { user: session.record }),
                        Err(e) => {
                            warn!(error = %e, "Login failed");
                            sink(ViewerEvent::Error {
                                id: None,
                                kind: None,
                                message: format!("Login failed: {}", e),
                            });
                        }
                    }
                });
            }

            ViewerCommand::Logout {} => {
                self.auth.logout();
                self.emit(ViewerEvent::LoggedOut {});
            }

            ViewerCommand::ListConversations { search } => {
                let service = self.conversations.clone();
                let sink = Arc::clone(&self.sink);
                tokio::spawn(async move {
                    match service.list_conversations(&search).await {
                        Ok(conversations) => sink(ViewerEvent::Conversations { conversations }),
                        Err(e) => sink(ViewerEvent::Error {
                            id: None,
                            kind: None,
                            message: format!("Failed to list conversations: {}", e),
                        }),
                    }
                });
            }

            ViewerCommand::ListMessages {
                phone,
                search,
                message_type,
            } => {
                let service = self.conversations.clone();
                let sink = Arc::clone(&self.sink);
                tokio::spawn(async move {
                    match service.list_messages(&phone, &search, message_type).await {
                        Ok(MessageList { messages, counts }) => sink(ViewerEvent::Messages {
                            phone,
                            messages,
                            counts,
                        }),
                        Err(e) => sink(ViewerEvent::Error {
                            id: None,
                            kind: None,
                            message: format!("Failed to list messages: {}", e),
                        }),
                    }
                });
            }

            ViewerCommand::OpenMedia {
                id,
                reference,
                message,
            } => {
                let reference = match openable_reference(reference, message.as_deref()) {
                    Ok(reference) => reference,
                    Err(e) => {
                        warn!(id = %id, error = %e, "Refusing to open media");
                        self.emit(ViewerEvent::Error {
                            id: Some(id),
                            kind: Some(ErrorKind::InvalidReference),
                            message: e.to_string(),
                        });
                        return true;
                    }
                };
                if let Some(previous) = self.viewers.remove(&id) {
                    previous.teardown();
                }
                let viewer = Arc::new(MediaViewer::new(
                    id.clone(),
                    reference,
                    message.as_deref(),
                    self.services.clone(),
                    self.media_tx.clone(),
                ));
                viewer.set_volume(self.config.volume());
                self.emit(ViewerEvent::MediaState {
                    id: id.clone(),
                    view: viewer.view(),
                });
                self.viewers.insert(id, Arc::clone(&viewer));
                tokio::spawn(async move { viewer.open().await });
            }

            ViewerCommand::Play { id } => {
                if let Some(viewer) = self.viewer(&id) {
                    viewer.play();
                }
            }

            ViewerCommand::Pause { id } => {
                if let Some(viewer) = self.viewer(&id) {
                    viewer.pause();
                }
            }

            ViewerCommand::Seek { id, fraction } => {
                if let Some(viewer) = self.viewer(&id) {
                    viewer.seek(fraction);
                }
            }

            ViewerCommand::SetVolume { id, volume } => {
                if let Some(viewer) = self.viewer(&id) {
                    viewer.set_volume(volume);
                }
            }

            ViewerCommand::Download { id, dest_dir } => {
                if let Some(viewer) = self.viewer(&id) {
                    let dest = dest_dir
                        .filter(|d| !d.is_empty())
                        .map(PathBuf::from)
                        .unwrap_or_else(|| self.config.download_dir());
                    // The viewer reports the outcome on its event channel.
                    tokio::spawn(async move {
                        let _ = viewer.download(&dest).await;
                    });
                }
            }

            ViewerCommand::CloseMedia { id } => match self.viewers.remove(&id) {
                Some(viewer) => {
                    viewer.teardown();
                    info!(id = %id, "Media closed");
                }
                None => self.emit_error(Some(&id), format!("No media open with id {}", id)),
            },

            ViewerCommand::ListAudioDevices {} => {
                self.emit(ViewerEvent::AudioDevices {
                    output: list_output_devices(),
                });
            }

            ViewerCommand::GetState { id } => match id {
                Some(id) => {
                    if let Some(viewer) = self.viewer(&id) {
                        self.emit(ViewerEvent::MediaState {
                            id,
                            view: viewer.view(),
                        });
                    }
                }
                None => {
                    for (id, viewer) in &self.viewers {
                        self.emit(ViewerEvent::MediaState {
                            id: id.clone(),
                            view: viewer.view(),
                        });
                    }
                }
            },
        }

        true
    }

    /// Translate a viewer notification into an IPC event. Notifications
    /// from viewers that have since been closed or replaced are dropped.
    fn forward(&self, event: MediaEvent) {
        let event = match event {
            MediaEvent::State { id, view } => {
                if !self.viewers.contains_key(&id) {
                    return;
                }
                ViewerEvent::MediaState { id, view }
            }
            MediaEvent::Progress { id, playback } => {
                if !self.viewers.contains_key(&id) {
                    return;
                }
                ViewerEvent::Progress {
                    elapsed: format_time(playback.offset_secs),
                    duration: format_time(playback.duration_secs),
                    id,
                    playback,
                }
            }
            MediaEvent::Ended { id } => {
                if !self.viewers.contains_key(&id) {
                    return;
                }
                ViewerEvent::PlaybackEnded { id }
            }
            MediaEvent::Error { id, kind, message } => ViewerEvent::Error {
                id: Some(id),
                kind: Some(kind),
                message,
            },
            MediaEvent::Downloaded { id, path } => ViewerEvent::Downloaded {
                id,
                path: path.display().to_string(),
            },
        };
        self.emit(event);
    }
}
