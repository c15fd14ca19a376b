//! Sweep scheduler.
//!
//! One spawned loop per sweep, each on its own interval. All state lives in
//! the store, so stopping mid-sweep and restarting later is safe.

use crate::engine::Engine;
use crate::error::EngineResult;
use concord_types::ProactiveReport;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

type SweepFn = for<'a> fn(&'a Engine) -> BoxFuture<'a, EngineResult<ProactiveReport>>;

pub struct Scheduler {
    engine: Arc<Engine>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Spawn every sweep loop. Loops exit when `shutdown` flips to true or
    /// its sender is dropped.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let cfg = self.engine.scheduler_config().clone();
        let sweeps: [(&'static str, u64, SweepFn); 6] = [
            ("stale_messages", cfg.stale_message_interval_secs, |e| {
                Box::pin(e.sweep_stale_messages())
            }),
            ("stale_proposals", cfg.stale_message_interval_secs, |e| {
                Box::pin(e.sweep_stale_proposals())
            }),
            ("expired_rounds", cfg.round_close_interval_secs, |e| {
                Box::pin(e.sweep_expired_rounds())
            }),
            ("vote_reminders", cfg.reminder_interval_secs, |e| {
                Box::pin(e.sweep_vote_reminders())
            }),
            ("reputation", cfg.reputation_interval_secs, |e| {
                Box::pin(e.sweep_reputation())
            }),
            ("retention", cfg.retention_interval_secs, |e| {
                Box::pin(e.sweep_retention())
            }),
        ];

        tracing::info!("Scheduler started");
        sweeps
            .into_iter()
            .map(|(name, every_secs, sweep)| {
                spawn_sweep(
                    self.engine.clone(),
                    name,
                    Duration::from_secs(every_secs.max(1)),
                    sweep,
                    shutdown.clone(),
                )
            })
            .collect()
    }
}

fn spawn_sweep(
    engine: Arc<Engine>,
    name: &'static str,
    every: Duration,
    sweep: SweepFn,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep(&engine).await {
                        Ok(report) if report.actions_performed > 0 => {
                            tracing::info!(sweep = name, actions = report.actions_performed, "Sweep completed");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(sweep = name, error = %e, "Sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(sweep = name, "Sweep loop stopped");
    })
}
