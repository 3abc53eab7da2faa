//! voicenote-viewer: headless media viewer process.
//!
//! Communicates with the host UI via JSON-line IPC on stdin/stdout.

use std::sync::Arc;

use tracing::info;

use voicenote_viewer::app::App;
use voicenote_viewer::config::read_viewer_config;
use voicenote_viewer::ipc::bridge::{emit_event, spawn_stdin_reader};
use voicenote_viewer::ipc::ViewerEvent;
use voicenote_viewer::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = read_viewer_config();
    logging::init(config.log_dir().as_deref())?;

    // Emit starting event immediately so the host knows we're alive.
    emit_event(&ViewerEvent::Starting {});
    info!(?config, "Configuration loaded");

    let app = App::new(config, Arc::new(|event: ViewerEvent| emit_event(&event)))?;
    let authenticated = app.restore_session();

    let commands = spawn_stdin_reader();
    emit_event(&ViewerEvent::Ready { authenticated });
    info!("Viewer ready");

    app.run(commands).await;

    info!("Viewer shutting down");
    Ok(())
}
