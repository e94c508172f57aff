//! Update scheduler.
//!
//! Drives the ingestion cycle on a dedicated background thread at a fixed
//! interval. `start`/`stop` are idempotent; `stop` wakes the inter-cycle
//! sleep immediately and blocks until the loop has exited. A failed cycle
//! is logged and the schedule carries on; the interval is the only retry
//! mechanism.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::fetch::Fetch;
use crate::store::engine::ApplyOutcome;
use crate::store::Store;
use crate::update;

pub struct WorkerSettings {
    pub source_url: String,
    pub interval: Duration,
    /// Run the first cycle right away instead of waiting one interval.
    pub start_immediately: bool,
    pub work_dir: PathBuf,
}

/// Mutable while stopped, frozen while the loop runs.
struct Settings {
    source_url: String,
    interval: Duration,
}

/// The collaborators one cycle needs. Behind a single mutex so exactly one
/// cycle runs at a time, even across a stop/start boundary.
struct Session {
    fetcher: Box<dyn Fetch + Send>,
    store: Store,
    work_dir: PathBuf,
}

struct Shared {
    settings: Mutex<Settings>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

pub struct UpdateWorker {
    shared: Arc<Shared>,
    start_immediately: bool,
    lifecycle: Mutex<Lifecycle>,
}

impl UpdateWorker {
    pub fn new(settings: WorkerSettings, fetcher: Box<dyn Fetch + Send>, store: Store) -> Self {
        UpdateWorker {
            shared: Arc::new(Shared {
                settings: Mutex::new(Settings {
                    source_url: settings.source_url,
                    interval: settings.interval,
                }),
                session: Mutex::new(Session {
                    fetcher,
                    store,
                    work_dir: settings.work_dir,
                }),
            }),
            start_immediately: settings.start_immediately,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Begin the background loop. A second call while running is a no-op.
    pub fn start(&self) {
        let Ok(mut lifecycle) = self.lifecycle.lock() else {
            return;
        };
        if lifecycle.running {
            return;
        }

        info!("starting stock update worker");

        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let start_immediately = self.start_immediately;

        lifecycle.stop = Some(tx);
        lifecycle.thread = Some(thread::spawn(move || {
            run_loop(&shared, &rx, start_immediately);
        }));
        lifecycle.running = true;
    }

    /// Request termination and block until the loop has exited. A call
    /// while idle is a no-op.
    pub fn stop(&self) {
        let (stop, thread) = {
            let Ok(mut lifecycle) = self.lifecycle.lock() else {
                return;
            };
            if !lifecycle.running {
                return;
            }
            lifecycle.running = false;
            (lifecycle.stop.take(), lifecycle.thread.take())
        };

        info!("stopping stock update worker");

        // disconnecting the channel wakes the inter-cycle sleep
        drop(stop);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().map(|l| l.running).unwrap_or(false)
    }

    pub fn source_url(&self) -> String {
        self.shared
            .settings
            .lock()
            .map(|s| s.source_url.clone())
            .unwrap_or_default()
    }

    pub fn interval(&self) -> Duration {
        self.shared
            .settings
            .lock()
            .map(|s| s.interval)
            .unwrap_or(Duration::ZERO)
    }

    /// Ignored while the loop is running; configuration is frozen between
    /// `start` and `stop`.
    pub fn set_source_url(&self, source_url: &str) {
        if self.is_running() {
            return;
        }
        if let Ok(mut settings) = self.shared.settings.lock() {
            settings.source_url = source_url.to_string();
        }
    }

    /// Ignored while the loop is running.
    pub fn set_interval(&self, interval: Duration) {
        if self.is_running() {
            return;
        }
        if let Ok(mut settings) = self.shared.settings.lock() {
            settings.interval = interval;
        }
    }
}

impl Drop for UpdateWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Wait {
    Elapsed,
    Stop,
}

fn run_loop(shared: &Shared, stop: &Receiver<()>, start_immediately: bool) {
    if !start_immediately {
        if let Wait::Stop = wait_interval(shared, stop) {
            return;
        }
    }

    loop {
        run_one(shared);

        if stop_requested(stop) {
            return;
        }
        if let Wait::Stop = wait_interval(shared, stop) {
            return;
        }
    }
}

fn run_one(shared: &Shared) {
    let Ok(source_url) = shared.settings.lock().map(|s| s.source_url.clone()) else {
        return;
    };
    let Ok(mut session) = shared.session.lock() else {
        return;
    };
    let session = &mut *session;

    match update::run_cycle(
        session.fetcher.as_ref(),
        &mut session.store,
        &source_url,
        &session.work_dir,
    ) {
        Ok(cycle) => match &cycle.outcome {
            ApplyOutcome::Unchanged => {
                info!(date = %cycle.stamp.date, time = %cycle.stamp.time, "feed unchanged");
            }
            ApplyOutcome::Applied { archived } => {
                info!(
                    date = %cycle.stamp.date,
                    time = %cycle.stamp.time,
                    titles = cycle.titles,
                    rows = cycle.rows,
                    archived = archived.as_deref(),
                    "live snapshot replaced"
                );
            }
        },
        // next tick is the retry; the loop never dies with the cycle
        Err(e) => error!(error = %e, "update cycle failed"),
    }
}

/// Sleep one interval, waking early on stop. Both an explicit signal and a
/// dropped sender mean stop.
fn wait_interval(shared: &Shared, stop: &Receiver<()>) -> Wait {
    let interval = shared
        .settings
        .lock()
        .map(|s| s.interval)
        .unwrap_or(Duration::from_secs(60));

    match stop.recv_timeout(interval) {
        Err(RecvTimeoutError::Timeout) => Wait::Elapsed,
        _ => Wait::Stop,
    }
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}
