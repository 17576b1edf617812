//! Scheduler and worker pool
//!
//! A single scanner lists due ACTIVE strategies each monitoring tick and
//! feeds a bounded queue; when the queue is full new ids drop with a
//! warning so eligibility discovery never blocks. N workers drain the
//! queue; the per-strategy execution lease keeps each strategy on at
//! most one worker at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::EngineError;

pub struct SchedulerHandles {
    pub scanner: tokio::task::JoinHandle<()>,
    pub workers: Vec<tokio::task::JoinHandle<()>>,
}

impl SchedulerHandles {
    pub fn abort(&self) {
        self.scanner.abort();
        for w in &self.workers {
            w.abort();
        }
    }
}

/// Spawn the scanner and the worker pool. Returns handles so the caller
/// owns shutdown.
pub fn spawn_scheduler(engine: Engine) -> SchedulerHandles {
    let cfg = &engine.config.worker;
    let (tx, rx) = mpsc::channel::<String>(cfg.queue_maxsize);
    let rx = Arc::new(Mutex::new(rx));

    let scanner = {
        let engine = engine.clone();
        let tick = Duration::from_secs(engine.config.worker.monitor_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let due = match engine.store.list_due_active(now) {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!(error = %e, "eligibility scan failed");
                        continue;
                    }
                };
                debug!(count = due.len(), "eligible strategies");
                for id in due {
                    match tx.try_send(id) {
                        Ok(()) => {}
                        Err(TrySendError::Full(id)) => {
                            warn!(strategy_id = %id, "monitor queue full, dropping");
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }
        })
    };

    let workers = (0..engine.config.worker.configured_threads)
        .map(|i| {
            let engine = engine.clone();
            let rx = Arc::clone(&rx);
            let owner = format!("worker-{i}");
            tokio::spawn(async move {
                loop {
                    let id = { rx.lock().await.recv().await };
                    let Some(id) = id else { break };
                    match engine.process_strategy(&id, &owner, Utc::now()).await {
                        Ok(_) => {}
                        // Another worker beat us to the lease; next tick
                        // will requeue if still eligible.
                        Err(EngineError::StrategyLocked { .. }) => {
                            debug!(strategy_id = %id, "strategy leased elsewhere");
                        }
                        Err(e) => {
                            warn!(strategy_id = %id, error = %e, "strategy run failed");
                        }
                    }
                }
            })
        })
        .collect();

    SchedulerHandles { scanner, workers }
}
