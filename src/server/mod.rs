//! HTTP bridge
//!
//! | Route | |
//! |---|---|
//! | `POST /flash` | stream a raw image into a new session |
//! | `POST /flash/stored/:name` | program the latest stored image |
//! | `GET /status` | current progress snapshot |
//! | `POST /reset` | run the peer's reset sequence |
//! | `POST /abort` | cancel the running session |
//! | `POST /relay` | forward bytes to the peer's application |

pub mod control;
pub mod error;
mod routes;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use stkbridge_core::config::SessionConfig;
use stkbridge_core::link::PeerLink;
use stkbridge_core::{ProgrammingSession, ProgressSnapshot};
use stkbridge_store::FirmwareStore;
use tokio::sync::{mpsc, watch};

use crate::config::BridgeConfig;
use crate::link::BoxedLink;
use control::{ControlHandle, ControlLoop, WatchObserver, COMMAND_QUEUE};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub control: ControlHandle,
    pub store: Option<Arc<FirmwareStore>>,
    /// Store name for successful uploads, when persisting
    pub persist_name: Option<String>,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/flash", post(routes::flash))
        .route("/flash/stored/:name", post(routes::flash_stored))
        .route("/status", get(routes::status))
        .route("/reset", post(routes::reset))
        .route("/abort", post(routes::abort))
        .route("/relay", post(routes::relay))
        .with_state(state)
}

/// Move a session over `link` onto its own control loop thread
pub fn spawn_control_loop<L: PeerLink + Send + 'static>(
    link: L,
    config: &SessionConfig,
) -> Result<(ControlHandle, JoinHandle<()>), Box<dyn std::error::Error>> {
    let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot::default());
    let session = ProgrammingSession::with_observer(link, *config, WatchObserver::new(progress_tx))?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let abort = Arc::new(AtomicBool::new(false));
    let loop_abort = abort.clone();
    let worker = std::thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || ControlLoop::new(session, command_rx, loop_abort).run())?;

    Ok((ControlHandle::new(command_tx, abort, progress_rx), worker))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }
    log::info!("Shutdown requested");
}

/// Run the HTTP bridge until Ctrl-C
pub async fn serve(
    config: &BridgeConfig,
    link: BoxedLink,
    store: Option<FirmwareStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (control, worker) = spawn_control_loop(link, &config.session_config())?;
    let state = AppState {
        control,
        store: store.map(Arc::new),
        persist_name: config
            .server
            .persist
            .then(|| config.server.persist_name.clone()),
        started: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping the router closed the command channel
    tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| "control loop panicked")?;
    Ok(())
}
