//! Timer loops driving the dispatcher and reconciler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::{Dispatcher, Reconciler};

/// One bounded unit of periodic work.
#[async_trait]
pub trait PeriodicPass: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run one pass. `shutdown` is checked between messages.
    async fn run_once(&self, shutdown: &AtomicBool);
}

/// Shutdown flag for one task, plus a wakeup so an idle ticker stops
/// without waiting out its interval.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }
}

/// Spawn a task that runs `pass` every `interval` until `shutdown` fires.
///
/// The first pass runs immediately. A pass that overruns the interval
/// delays the next tick rather than bunching ticks up.
pub fn spawn_ticker(
    pass: Arc<dyn PeriodicPass>,
    interval: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(task = pass.name(), interval_secs = interval.as_secs(), "Ticker started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wake.notified() => {}
            }

            if shutdown.is_triggered() {
                info!(task = pass.name(), "Ticker shutting down");
                return;
            }

            pass.run_once(shutdown.flag()).await;
        }
    })
}

/// Running dispatcher and reconciler tasks.
pub struct EngineHandle {
    tasks: Vec<(&'static str, JoinHandle<()>, Shutdown)>,
}

impl EngineHandle {
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        dispatch_interval: Duration,
        reconciler: Arc<Reconciler>,
        reply_poll_interval: Duration,
    ) -> Self {
        let mut handle = Self { tasks: Vec::new() };
        handle.spawn(dispatcher, dispatch_interval);
        handle.spawn(reconciler, reply_poll_interval);
        handle
    }

    fn spawn(&mut self, pass: Arc<dyn PeriodicPass>, interval: Duration) {
        let shutdown = Shutdown::new();
        let name = pass.name();
        let task = spawn_ticker(pass, interval, shutdown.clone());
        self.tasks.push((name, task, shutdown));
    }

    /// Signal every task and wait for in-flight passes to finish.
    pub async fn shutdown(self) {
        for (_, _, shutdown) in &self.tasks {
            shutdown.trigger();
        }
        for (name, task, _) in self.tasks {
            if let Err(e) = task.await {
                error!(task = name, "Engine task ended abnormally: {e}");
            }
        }
        info!("Engine stopped");
    }
}
