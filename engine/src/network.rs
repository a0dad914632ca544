//! Debounced connectivity signal.
//!
//! The platform layer reports raw readings with [`NetworkMonitor::report`].
//! Going offline is published at once; coming back online is published only
//! after the raw signal has stayed online for the debounce window, so a
//! flapping connection does not trigger a drain per flap.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct MonitorInner {
    raw: watch::Sender<bool>,
    debounced: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connectivity source for the sync coordinator. Cheap to clone.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Start a monitor with an initial reading. Must be called inside a
    /// tokio runtime.
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (raw, raw_rx) = watch::channel(initially_online);
        let debounced = Arc::new(watch::Sender::new(initially_online));
        let task = tokio::spawn(debounce_task(raw_rx, debounced.clone(), debounce));

        Self {
            inner: Arc::new(MonitorInner {
                raw,
                debounced,
                task,
            }),
        }
    }

    /// Feed a raw connectivity reading.
    pub fn report(&self, online: bool) {
        self.inner.raw.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
    }

    /// The debounced state.
    pub fn is_online(&self) -> bool {
        *self.inner.debounced.borrow()
    }

    /// Receiver that is notified once per debounced transition. Dropping it
    /// unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.debounced.subscribe()
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .finish()
    }
}

fn publish(out: &watch::Sender<bool>, online: bool) {
    let changed = out.send_if_modified(|current| {
        if *current == online {
            return false;
        }
        *current = online;
        true
    });
    if changed {
        if online {
            tracing::info!("Connectivity restored");
        } else {
            tracing::info!("Connectivity lost");
        }
    }
}

async fn debounce_task(
    mut raw: watch::Receiver<bool>,
    out: Arc<watch::Sender<bool>>,
    window: Duration,
) {
    loop {
        let online = *raw.borrow_and_update();

        if !online || *out.borrow() {
            publish(&out, online);
            if raw.changed().await.is_err() {
                return;
            }
            continue;
        }

        // Online but not yet published: wait for the window to pass quietly.
        match tokio::time::timeout(window, raw.changed()).await {
            Err(_elapsed) => publish(&out, true),
            Ok(Ok(())) => {}
            Ok(Err(_closed)) => return,
        }
    }
}
