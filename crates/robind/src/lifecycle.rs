//! Manages the life cycle of the server process so that in-flight
//! sessions get a bounded chance to finish when shutdown is requested.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for the general shape.
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

static ACTIVE: OnceCell<Mutex<Option<Activity>>> = OnceCell::new();
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static STOPPING: OnceCell<ShutdownState> = OnceCell::new();

/// How long in-flight sessions get to wrap up before we stop waiting
/// for them
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Represents some activity which cannot be ruthlessly interrupted.
/// While any Activity instances are alive, LifeCycle::wait_for_shutdown
/// keeps waiting (up to the drain deadline).
#[derive(Clone)]
pub struct Activity {
    _tx: MPSCSender<()>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

impl Activity {
    /// Obtain an Activity instance.
    /// None means the process is shutting down and no new activity
    /// should be started.
    pub fn get_opt() -> Option<Self> {
        Some(ACTIVE.get()?.lock().unwrap().as_ref()?.clone())
    }

    pub fn get() -> anyhow::Result<Self> {
        Self::get_opt().ok_or_else(|| anyhow::anyhow!("shutting down"))
    }

    pub fn is_shutting_down(&self) -> bool {
        SHUTTING_DOWN.load(Ordering::Relaxed)
    }
}

struct ShutdownState {
    tx: WatchSender<()>,
    rx: WatchReceiver<()>,
    request_shutdown_tx: MPSCSender<()>,
}

/// Used by idling code: select on your own work and `shutting_down` to
/// wake when the process begins to stop
pub struct ShutdownSubscription {
    rx: WatchReceiver<()>,
}

impl ShutdownSubscription {
    pub fn get() -> Self {
        Self {
            rx: STOPPING.get().unwrap().rx.clone(),
        }
    }

    pub async fn shutting_down(&mut self) {
        self.rx.changed().await.ok();
    }
}

/// Owns the global shutdown machinery; create exactly one in main
pub struct LifeCycle {
    activity_rx: MPSCReceiver<()>,
    request_shutdown_rx: MPSCReceiver<()>,
}

impl LifeCycle {
    /// May be called only once; panics if called a second time
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        ACTIVE
            .set(Mutex::new(Some(Activity { _tx: activity_tx })))
            .map_err(|_| ())
            .unwrap();

        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);
        let (tx, rx) = tokio::sync::watch::channel(());
        STOPPING
            .set(ShutdownState {
                tx,
                rx,
                request_shutdown_tx,
            })
            .map_err(|_| ())
            .unwrap();

        Self {
            activity_rx,
            request_shutdown_rx,
        }
    }

    /// Ask the process to stop; wakes wait_for_shutdown
    pub async fn request_shutdown() {
        if let Some(state) = STOPPING.get() {
            state.request_shutdown_tx.send(()).await.ok();
        }
    }

    /// Wait for ctrl-c or a shutdown request, propagate the stop signal
    /// to running tasks, then wait for them to finish within the drain
    /// deadline
    pub async fn wait_for_shutdown(&mut self) {
        tracing::debug!("waiting for shutdown request");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };
        tracing::info!("shutdown requested, draining sessions");
        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        ACTIVE.get().map(|a| a.lock().unwrap().take());
        STOPPING.get().map(|s| s.tx.send(()).ok());

        if tokio::time::timeout(DRAIN_DEADLINE, self.activity_rx.recv())
            .await
            .is_err()
        {
            tracing::warn!(
                "sessions still in flight after {DRAIN_DEADLINE:?}, closing anyway"
            );
        }
    }
}
