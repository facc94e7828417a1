//! Collection supervision: one worker task per enabled profile, restarted
//! when it dies, plus the log sink and the status relay into the store.

use crate::collectors::Connector;
use crate::metrics;
use crate::profile::{Profile, StatusReport, worker};
use crate::store::{StoreError, StoreHandle};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument as _;
use ulid::Ulid;

pub mod logsink;

pub use logsink::{LogFileConfig, LogQueue, LogSink};

struct Worker {
    id: Ulid,
    profile: Profile,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Abort the task and wait until it is torn down.
    async fn reap(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct CollectorSupervisor {
    store: StoreHandle,
    connector: Arc<dyn Connector>,
    collect_interval: Duration,
    workers: HashMap<String, Worker>,
    status_tx: mpsc::UnboundedSender<StatusReport>,
    status_rx: mpsc::UnboundedReceiver<StatusReport>,
    log_sink: Option<LogSink>,
}

impl CollectorSupervisor {
    pub fn new(
        store: StoreHandle,
        connector: Arc<dyn Connector>,
        collect_interval: Duration,
        log_sink: Option<LogSink>,
    ) -> Self {
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        Self {
            store,
            connector,
            collect_interval,
            workers: HashMap::new(),
            status_tx,
            status_rx,
            log_sink,
        }
    }

    /// Identity of every running worker, by profile name.
    pub fn workers(&self) -> BTreeMap<String, Ulid> {
        self.workers
            .iter()
            .map(|(name, w)| (name.clone(), w.id))
            .collect()
    }

    /// One supervision pass. Each step is guarded on its own, nothing here
    /// can fail the caller.
    pub async fn health_check(&mut self) {
        if let Err(e) = self.reconcile_workers().await {
            error!(error = %e, "worker reconciliation failed");
        }

        self.drain_statuses().await;
        self.check_log_sink();
    }

    /// Bring the running workers in line with the store: one live worker per
    /// enabled, valid profile, running its current settings.
    async fn reconcile_workers(&mut self) -> Result<()> {
        let wanted: HashMap<String, Profile> = self
            .store
            .profiles()
            .await?
            .into_iter()
            .filter(|p| p.is_enabled())
            .filter(|p| match p.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(profile = %p.name, error = %e, "skipping invalid profile");
                    false
                }
            })
            .map(|p| (p.name.clone(), p))
            .collect();

        let stale: Vec<String> = self
            .workers
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();

        for name in stale {
            if let Some(worker) = self.workers.remove(&name) {
                let id = worker.id;
                worker.reap().await;
                info!(profile = %name, worker = %id, "profile collector stopped");
            }
        }

        for (name, profile) in wanted {
            let Some(worker) = self.workers.remove(&name) else {
                self.spawn_worker(profile);
                continue;
            };

            if !worker.profile.settings_eq(&profile) {
                let id = worker.id;
                // the old task is gone before its replacement starts
                worker.reap().await;
                info!(profile = %name, worker = %id, "profile changed, restarting collector");
                self.spawn_worker(profile);
            } else if worker.handle.is_finished() {
                let cause = match worker.handle.await {
                    Ok(()) => "exited".to_string(),
                    Err(e) if e.is_panic() => logsink::panic_message(e.into_panic().as_ref()),
                    Err(e) => e.to_string(),
                };
                error!(profile = %name, worker = %worker.id, cause = %cause, "profile collector died");
                metrics::RESTARTS.with_label_values(&["worker"]).inc();
                self.spawn_worker(profile);
            } else {
                self.workers.insert(name, worker);
            }
        }

        Ok(())
    }

    fn spawn_worker(&mut self, profile: Profile) {
        let id = Ulid::new();
        let name = profile.name.clone();

        let span = info_span!("worker", profile = %name, worker = %id);
        let handle = tokio::spawn(
            worker::run(
                profile.clone(),
                Arc::clone(&self.connector),
                self.status_tx.clone(),
                self.collect_interval,
            )
            .instrument(span),
        );

        info!(profile = %name, worker = %id, "profile collector spawned");

        self.workers.insert(name, Worker { id, profile, handle });
    }

    /// Relay every queued status report to the store, without waiting for
    /// new ones.
    async fn drain_statuses(&mut self) {
        while let Ok(report) = self.status_rx.try_recv() {
            match self.store.update_status(&report.name, report.update).await {
                Ok(_) => {}
                // the profile was deleted after the worker reported
                Err(StoreError::NotFound(_)) => {
                    debug!(profile = %report.name, "status for unknown profile dropped");
                }
                Err(e) => {
                    warn!(profile = %report.name, error = %e, "failed to record profile status");
                }
            }
        }
    }

    fn check_log_sink(&mut self) {
        let Some(sink) = self.log_sink.as_mut() else {
            return;
        };

        if sink.is_alive() {
            return;
        }

        match sink.restart() {
            Ok(cause) => {
                error!(cause = %cause, "log sink died, restarted");
                metrics::RESTARTS.with_label_values(&["log_sink"]).inc();
            }
            Err(e) => error!(error = %e, "failed to restart log sink"),
        }
    }

    /// Run health checks every `check_interval` until `shutdown` flips to
    /// true, then stop everything. Checks that would fire while one is still
    /// running are skipped, not queued.
    pub async fn run(mut self, check_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_check().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop all workers, relay their last statuses and stop the log sink.
    pub async fn shutdown(mut self) {
        for (name, worker) in self.workers.drain() {
            worker.reap().await;
            debug!(profile = %name, "profile collector stopped");
        }

        self.drain_statuses().await;

        info!("collector supervisor stopped");

        if let Some(sink) = self.log_sink.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || sink.stop()).await {
                error!(error = %e, "log sink did not stop cleanly");
            }
        }
    }
}
