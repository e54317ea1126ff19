//! Periodic eviction sweep.
//!
//! Every period the scheduler probes each registered peer and feeds the
//! result back into the [`AddressRegistry`], which resets or increments the
//! failure counter and evicts at the threshold.  Probes for one sweep run
//! concurrently, each in its own task, so a slow or panicking probe only
//! affects its own entry.  The probe tasks belong to the sweep: stopping the
//! scheduler mid-sweep aborts them.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::liveness::LivenessCheck;
use crate::registry::{AddressRegistry, ProbeOutcome};

/// Default time between sweeps.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(120);

type SweepHook = Arc<dyn Fn(SweepReport) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub healthy: usize,
    pub failing: usize,
    pub evicted: Vec<String>,
    /// Probes that panicked; counted as failures.
    pub faulted: usize,
}

pub struct EvictionScheduler {
    registry: Arc<AddressRegistry>,
    checker: Arc<dyn LivenessCheck>,
    period: Duration,
    after_sweep: Option<SweepHook>,
}

impl EvictionScheduler {
    pub fn new(
        registry: Arc<AddressRegistry>,
        checker: Arc<dyn LivenessCheck>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            checker,
            period,
            after_sweep: None,
        }
    }

    /// Runs `hook` after every scheduled sweep.
    pub fn on_sweep<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SweepReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after_sweep = Some(Arc::new(move |report| Box::pin(hook(report))));
        self
    }

    /// Probes every current member once and applies the results.
    pub async fn sweep(&self) -> SweepReport {
        let members = self.registry.memberships().await;
        let mut report = SweepReport {
            probed: members.len(),
            ..SweepReport::default()
        };

        let mut probes = JoinSet::new();
        for (idx, member) in members.iter().enumerate() {
            let checker = Arc::clone(&self.checker);
            let address = member.address;
            probes.spawn(async move {
                let verdict = AssertUnwindSafe(checker.is_alive(&address))
                    .catch_unwind()
                    .await;
                (idx, verdict.ok())
            });
        }

        let mut verdicts = vec![None; members.len()];
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((idx, verdict)) => verdicts[idx] = verdict,
                Err(e) => error!("Probe task failed: {}", e),
            }
        }

        for (member, verdict) in members.iter().zip(verdicts) {
            let alive = match verdict {
                Some(alive) => alive,
                None => {
                    error!("Probe of {} ({}) panicked", member.name, member.address);
                    report.faulted += 1;
                    false
                }
            };
            match self
                .registry
                .record_probe(&member.name, member.generation, alive)
                .await
            {
                ProbeOutcome::Healthy => report.healthy += 1,
                ProbeOutcome::Failing(n) => {
                    debug!("{} unreachable ({} in a row)", member.name, n);
                    report.failing += 1;
                }
                ProbeOutcome::Evicted(_) => report.evicted.push(member.name.clone()),
                ProbeOutcome::Stale => debug!("{} changed during the sweep", member.name),
            }
        }

        if !report.evicted.is_empty() {
            info!("Sweep evicted {:?}", report.evicted);
        }
        report
    }

    /// Starts the periodic sweep.  The first sweep runs one period from now.
    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        SchedulerHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    async fn run(self, mut stop_rx: oneshot::Receiver<()>) {
        info!("Eviction sweep every {:?}", self.period);
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {}
            }

            let report = tokio::select! {
                _ = &mut stop_rx => break,
                report = self.sweep() => report,
            };
            debug!("Sweep finished: {:?}", report);
            if let Some(hook) = &self.after_sweep {
                hook(report).await;
            }
        }
        info!("Eviction sweep stopped");
    }
}

/// Owner of the running sweep task.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Cancels the timer and waits up to `grace` for the task to exit,
    /// aborting it after that.
    pub async fn stop(mut self, grace: Duration) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Eviction task failed: {}", e),
            Err(_) => {
                warn!("Eviction task did not stop within {:?}, aborting", grace);
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
