//! One-shot guest-config delivery over a Unix socket.
//!
//! On first boot the guest fetches its configuration with a single HTTP GET.
//! A small axum router answers that request with the payload, shuts down
//! gracefully, unlinks the socket and reports the outcome on a channel.

use crate::alloc;
use crate::error::{Error, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::oneshot;

/// Handle to a running delivery listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct Delivery {
    path: PathBuf,
    done: mpsc::Receiver<Result<()>>,
    _cancel: oneshot::Sender<()>,
}

impl Delivery {
    /// Bind `path` and serve `payload` to the first client, in the background.
    ///
    /// The socket exists when this returns.
    pub fn serve_once(path: impl Into<PathBuf>, payload: Vec<u8>) -> Result<Self> {
        let path = path.into();
        if !alloc::claim_socket_path(&path)? {
            return Err(Error::forwarding(format!(
                "guest config socket {} is already in use",
                path.display()
            )));
        }
        let listener = std::os::unix::net::UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;

        let (tx, done) = mpsc::channel();
        let (cancel, cancelled) = oneshot::channel();
        let socket = path.clone();
        std::thread::Builder::new()
            .name("machina-guest-config".into())
            .spawn(move || {
                let outcome = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(Error::from)
                    .and_then(|rt| rt.block_on(serve(listener, payload, cancelled)));
                let _ = std::fs::remove_file(&socket);
                match &outcome {
                    Ok(()) => tracing::debug!(path = %socket.display(), "guest config delivered"),
                    Err(e) => tracing::warn!(path = %socket.display(), error = %e, "guest config delivery failed"),
                }
                let _ = tx.send(outcome);
            })?;

        Ok(Self {
            path,
            done,
            _cancel: cancel,
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `timeout` for the payload to be served.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        match self.done.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(Error::timeout("guest config delivery", timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::forwarding("guest config listener exited without reporting"))
            }
        }
    }

    /// Outcome if the listener has finished.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.done.try_recv().ok()
    }
}

/// Router state: the payload and the signal fired by the first GET.
#[derive(Clone)]
struct GuestConfig {
    payload: Arc<Vec<u8>>,
    served: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

async fn guest_config(State(state): State<GuestConfig>) -> impl IntoResponse {
    if let Some(served) = state.served.lock().take() {
        let _ = served.send(());
    }
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.payload.to_vec(),
    )
}

async fn serve(
    listener: std::os::unix::net::UnixListener,
    payload: Vec<u8>,
    cancelled: oneshot::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::UnixListener::from_std(listener)?;
    let (served_tx, served_rx) = oneshot::channel();
    let app = Router::new()
        .route("/", get(guest_config))
        .with_state(GuestConfig {
            payload: Arc::new(payload),
            served: Arc::new(Mutex::new(Some(served_tx))),
        });

    let delivered = Arc::new(AtomicBool::new(false));
    let flag = delivered.clone();
    // The in-flight response still completes after the shutdown signal.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                Ok(()) = served_rx => flag.store(true, Ordering::SeqCst),
                _ = cancelled => {}
            }
        })
        .await?;

    if delivered.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Error::forwarding("guest config delivery cancelled"))
    }
}
