//! Rollback of partially completed lifecycle sequences.
//!
//! A [`CleanupCallbacks`] collects undo actions while a multi-step operation
//! runs. On failure the actions run in the order they were registered; on
//! success the list is discarded. While armed, a termination signal drains
//! the list before the process exits; anything registered after that runs
//! immediately.

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::{Arc, Once, OnceLock, Weak};

/// A single undo action.
pub type UndoFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct Action {
    label: String,
    undo: UndoFn,
}

#[derive(Default)]
struct Pending {
    actions: Vec<Action>,
    /// Set once a termination signal drained the list.
    drained: bool,
}

/// Ordered accumulator of undo actions.
#[derive(Default)]
pub struct CleanupCallbacks {
    pending: Mutex<Pending>,
}

impl std::fmt::Debug for CleanupCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock();
        let labels: Vec<&str> = pending.actions.iter().map(|a| a.label.as_str()).collect();
        f.debug_struct("CleanupCallbacks")
            .field("actions", &labels)
            .field("drained", &pending.drained)
            .finish()
    }
}

fn run(action: Action) {
    match (action.undo)() {
        Ok(()) => tracing::debug!(action = %action.label, "cleanup done"),
        Err(e) => tracing::warn!(action = %action.label, error = %e, "cleanup failed"),
    }
}

impl CleanupCallbacks {
    /// Create an empty, shareable coordinator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append an undo action.
    ///
    /// After a signal drained this coordinator the action runs right away,
    /// since the process is about to exit.
    pub fn add<F>(&self, label: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let action = Action {
            label: label.into(),
            undo: Box::new(undo),
        };
        let mut pending = self.pending.lock();
        if pending.drained {
            drop(pending);
            tracing::debug!(action = %action.label, "registered after drain, undoing now");
            run(action);
            return;
        }
        tracing::trace!(action = %action.label, "registered cleanup");
        pending.actions.push(action);
    }

    /// Register removal of a file. A file that is already gone is fine.
    pub fn add_remove_file(&self, path: impl Into<std::path::PathBuf>) {
        let path = path.into();
        self.add(format!("remove {}", path.display()), move || {
            remove_if_exists(&path)
        });
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.pending.lock().actions.len()
    }

    /// No pending actions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending action if `outcome` is an error.
    pub fn clean_if_err<T>(&self, outcome: &Result<T>) {
        if let Err(e) = outcome {
            tracing::info!(error = %e, pending = self.len(), "rolling back");
            self.clean();
        }
    }

    /// Take the pending actions and run them in registration order.
    ///
    /// The list is swapped out under the lock, so a second call (from the
    /// signal path or a retry) finds nothing to do. Failures are logged and do
    /// not stop the remaining actions.
    pub fn clean(&self) {
        let actions = std::mem::take(&mut self.pending.lock().actions);
        actions.into_iter().for_each(run);
    }

    /// Like [`clean`](Self::clean), and every later [`add`](Self::add) runs
    /// its action immediately.
    fn drain(&self) {
        let actions = {
            let mut pending = self.pending.lock();
            pending.drained = true;
            std::mem::take(&mut pending.actions)
        };
        actions.into_iter().for_each(run);
    }

    /// Whether a signal drained this coordinator.
    pub fn is_drained(&self) -> bool {
        self.pending.lock().drained
    }

    /// Discard pending actions after a successful sequence.
    pub fn disarm(&self) {
        self.pending.lock().actions.clear();
    }

    /// Drain this coordinator if the process receives SIGINT, SIGTERM or SIGHUP.
    ///
    /// Armed until the returned guard is dropped.
    pub fn arm_signals(self: &Arc<Self>) -> SignalGuard {
        start_signal_watcher();
        let weak = Arc::downgrade(self);
        armed().lock().push(weak.clone());
        SignalGuard { callbacks: weak }
    }
}

/// Keeps a coordinator registered with the signal watcher.
#[must_use = "dropping the guard disarms signal cleanup"]
pub struct SignalGuard {
    callbacks: Weak<CleanupCallbacks>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        armed()
            .lock()
            .retain(|w| w.strong_count() > 0 && !w.ptr_eq(&self.callbacks));
    }
}

fn armed() -> &'static Mutex<Vec<Weak<CleanupCallbacks>>> {
    static ARMED: OnceLock<Mutex<Vec<Weak<CleanupCallbacks>>>> = OnceLock::new();
    ARMED.get_or_init(|| Mutex::new(Vec::new()))
}

/// Whether a coordinator is currently armed.
pub fn is_armed(callbacks: &Arc<CleanupCallbacks>) -> bool {
    let weak = Arc::downgrade(callbacks);
    armed().lock().iter().any(|w| w.ptr_eq(&weak))
}

/// Drain every armed coordinator. Called by the signal watcher before exit.
pub fn drain_armed() {
    let live: Vec<Arc<CleanupCallbacks>> = {
        let mut list = armed().lock();
        let live = list.iter().filter_map(Weak::upgrade).collect();
        list.clear();
        live
    };
    for callbacks in live {
        callbacks.drain();
    }
}

fn start_signal_watcher() {
    static WATCHER: Once = Once::new();
    WATCHER.call_once(|| {
        let spawned = std::thread::Builder::new()
            .name("machina-signals".into())
            .spawn(|| {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::warn!(error = %e, "signal watcher unavailable");
                        return;
                    }
                };
                let signo = runtime.block_on(wait_for_signal());
                tracing::warn!(signal = signo, "termination signal received, rolling back");
                drain_armed();
                std::process::exit(128 + signo);
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn signal watcher");
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    async fn recv(sig: &mut Option<Signal>) -> Option<()> {
        match sig {
            Some(s) => s.recv().await,
            None => std::future::pending().await,
        }
    }

    let mut terminate = signal(SignalKind::terminate()).ok();
    let mut hangup = signal(SignalKind::hangup()).ok();

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if res.is_err() {
                std::future::pending::<()>().await;
            }
            libc::SIGINT
        }
        Some(_) = recv(&mut terminate) => libc::SIGTERM,
        Some(_) = recv(&mut hangup) => libc::SIGHUP,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    2
}

/// Remove a file, treating "not found" as success.
pub(crate) fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
