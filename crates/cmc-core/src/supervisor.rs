//! ---
//! cmc_section: "04-configuration-orchestration"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Subsystem supervision with a fan-in event channel."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Owns every long-running subsystem task.
//!
//! Subsystems report readiness and failures over one `mpsc` channel. The first failure,
//! or any subsystem returning before shutdown was requested, is fatal for the process.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 32;

/// Default time subsystems get to drain after shutdown is signalled.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemEvent {
    /// A listener bound its socket.
    Started { name: String, addr: SocketAddr },
    Failed { name: String, error: String },
    Stopped { name: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("subsystem {name} failed: {error}")]
    SubsystemFailed { name: String, error: String },
    #[error("subsystem {name} exited unexpectedly")]
    UnexpectedExit { name: String },
}

/// Handle a subsystem uses to report into the fan-in channel.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    name: String,
    events: mpsc::Sender<SubsystemEvent>,
}

impl EventNotifier {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn started(&self, addr: SocketAddr) {
        self.send(SubsystemEvent::Started {
            name: self.name.clone(),
            addr,
        })
        .await;
    }

    pub async fn failed(&self, error: impl ToString) {
        self.send(SubsystemEvent::Failed {
            name: self.name.clone(),
            error: error.to_string(),
        })
        .await;
    }

    async fn send(&self, event: SubsystemEvent) {
        if self.events.send(event).await.is_err() {
            debug!(subsystem = %self.name, "supervisor no longer listening");
        }
    }
}

pub struct Supervisor {
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    events_tx: mpsc::Sender<SubsystemEvent>,
    events_rx: mpsc::Receiver<SubsystemEvent>,
    grace: Duration,
    started: Vec<(String, SocketAddr)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            tasks: JoinSet::new(),
            shutdown,
            events_tx,
            events_rx,
            grace: DEFAULT_SHUTDOWN_GRACE,
            started: Vec::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn notifier(&self, name: impl Into<String>) -> EventNotifier {
        EventNotifier {
            name: name.into(),
            events: self.events_tx.clone(),
        }
    }

    /// Listeners that reported a bound address so far.
    pub fn started(&self) -> &[(String, SocketAddr)] {
        &self.started
    }

    /// Run `task` until it finishes. An `Err` is reported as a failure and a return
    /// before shutdown as an unexpected stop.
    pub fn spawn<F, E>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let notifier = self.notifier(name);
        let shutdown = self.shutdown.subscribe();
        self.tasks.spawn(async move {
            match task.await {
                Ok(()) if *shutdown.borrow() => {
                    debug!(subsystem = %notifier.name, "subsystem stopped");
                }
                Ok(()) => {
                    notifier
                        .send(SubsystemEvent::Stopped {
                            name: notifier.name.clone(),
                        })
                        .await;
                }
                Err(err) => notifier.failed(err).await,
            }
        });
    }

    /// Wait for the next subsystem event. Failures and unexpected stops become errors.
    pub async fn next_event(&mut self) -> Result<Option<SubsystemEvent>, SupervisorError> {
        let Some(event) = self.events_rx.recv().await else {
            return Ok(None);
        };
        match &event {
            SubsystemEvent::Started { name, addr } => {
                info!(subsystem = %name, addr = %addr, "subsystem listening");
                self.started.push((name.clone(), *addr));
                Ok(Some(event))
            }
            SubsystemEvent::Failed { name, error } => {
                error!(subsystem = %name, error = %error, "subsystem failed");
                Err(SupervisorError::SubsystemFailed {
                    name: name.clone(),
                    error: error.clone(),
                })
            }
            SubsystemEvent::Stopped { name } => {
                error!(subsystem = %name, "subsystem exited unexpectedly");
                Err(SupervisorError::UnexpectedExit { name: name.clone() })
            }
        }
    }

    /// Supervise until `shutdown` completes or a subsystem fails, then stop every task.
    pub async fn run_until<S>(mut self, shutdown: S) -> Result<(), SupervisorError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                event = self.next_event() => match event {
                    Ok(Some(_)) => continue,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                },
            }
        };
        self.stop().await;
        outcome
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        let grace = self.grace;
        let tasks = &mut self.tasks;
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    if !err.is_cancelled() {
                        warn!(error = %err, "subsystem task join error");
                    }
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "subsystems did not stop in time; aborting");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}
