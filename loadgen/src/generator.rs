//! The ledger-entry fetch worker pool.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of fetch requests issued
//! `request_ok`: Successful fetches
//! `request_failure`: Failed fetches
//! `request_latency_seconds`: Observed per-request latency
//!

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use hyper::Uri;
use metrics::{counter, histogram};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};

use crate::{
    client::{self, LedgerClient},
    config::Config,
    keys::LedgerKey,
    stats::WorkerStats,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Pool`].
pub enum Error {
    /// The key file produced no usable keys.
    #[error("No usable ledger keys were loaded, refusing to start workers")]
    NoKeys,
    /// Child sub-task error.
    #[error("Child join error: {0}")]
    Child(#[from] JoinError),
    /// Shutdown watcher registration failed.
    #[error(transparent)]
    Registration(#[from] loadgen_signal::RegisterError),
}

/// The ledger-entry fetch worker pool.
///
/// Spawns a fixed number of identical query loops at construction time. All
/// workers share the read-only key list and otherwise never coordinate; the
/// only cross-worker machinery is the shutdown signal.
#[derive(Debug)]
pub struct Pool {
    handles: JoinSet<()>,
    shutdown: loadgen_signal::Watcher,
}

impl Pool {
    /// Create a new [`Pool`] instance, spawning one worker task per
    /// configured worker.
    ///
    /// Worker 0 is the designated reporter; the others accumulate statistics
    /// that are never surfaced except through metrics.
    ///
    /// # Errors
    ///
    /// Function will return an error if `keys` is empty or if workers cannot
    /// be registered against the shutdown watcher.
    pub fn new(
        config: &Config,
        keys: Vec<LedgerKey>,
        shutdown: loadgen_signal::Watcher,
    ) -> Result<Self, Error> {
        if keys.is_empty() {
            return Err(Error::NoKeys);
        }
        let keys = Arc::new(keys);

        let worker_count = config.workers.get();
        let labels = vec![
            ("component".to_string(), "generator".to_string()),
            ("component_name".to_string(), "ledger_fetch".to_string()),
        ];

        let mut handles = JoinSet::new();
        for i in 0..worker_count {
            // Base seed with the worker index folded in, so each worker owns
            // an independent but reproducible stream.
            let mut seed = config.seed;
            for (slot, byte) in seed.iter_mut().zip(i.to_le_bytes()) {
                *slot ^= byte;
            }

            let mut worker_labels = labels.clone();
            if worker_count > 1 {
                worker_labels.push(("worker".to_string(), i.to_string()));
            }

            let worker = Worker {
                index: i,
                worker_count,
                reporter: i == 0,
                report_interval: config.report_interval,
                target_uri: config.target_uri.clone(),
                keys: Arc::clone(&keys),
                rng: StdRng::from_seed(seed),
                metric_labels: worker_labels,
                shutdown: shutdown.register()?,
            };
            handles.spawn(worker.spin());
        }

        Ok(Self { handles, shutdown })
    }

    /// Run [`Pool`] until a shutdown signal is received, then drain the
    /// worker tasks.
    ///
    /// # Errors
    ///
    /// Function will return an error if a worker task panics.
    pub async fn spin(mut self) -> Result<(), Error> {
        self.shutdown.recv().await;
        info!("shutdown signal received");

        while let Some(res) = self.handles.join_next().await {
            res?;
        }
        Ok(())
    }
}

struct Worker {
    index: u16,
    worker_count: u16,
    reporter: bool,
    report_interval: std::num::NonZeroU64,
    target_uri: Uri,
    keys: Arc<Vec<LedgerKey>>,
    rng: StdRng,
    metric_labels: Vec<(String, String)>,
    shutdown: loadgen_signal::Watcher,
}

impl Worker {
    async fn spin(self) {
        let Worker {
            index,
            worker_count,
            reporter,
            report_interval,
            target_uri,
            keys,
            mut rng,
            metric_labels,
            shutdown,
        } = self;

        let client = LedgerClient::new(target_uri);
        let mut stats = WorkerStats::default();

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let key = &keys[rng.random_range(0..keys.len())];

            tokio::select! {
                (elapsed, result) = timed_fetch(&client, key) => {
                    counter!("requests_sent", &metric_labels).increment(1);
                    histogram!("request_latency_seconds", &metric_labels)
                        .record(elapsed.as_secs_f64());

                    match result {
                        Ok(()) => {
                            stats.record(elapsed, true);
                            counter!("request_ok", &metric_labels).increment(1);
                        }
                        Err(err) => {
                            stats.record(elapsed, false);
                            warn!(worker = index, "fetch failed: {err}");

                            let mut error_labels = metric_labels.clone();
                            error_labels.push(("error".to_string(), err.to_string()));
                            counter!("request_failure", &error_labels).increment(1);
                        }
                    }

                    if reporter && stats.report_due(report_interval) {
                        info!(
                            worker = index,
                            "{report}",
                            report = stats.report(worker_count)
                        );
                    }
                }
                () = &mut shutdown_wait => {
                    info!(worker = index, "shutdown signal received");
                    return;
                },
            }
        }
    }
}

async fn timed_fetch(
    client: &LedgerClient,
    key: &LedgerKey,
) -> (Duration, Result<(), client::Error>) {
    let start = Instant::now();
    let result = client.fetch(key).await;
    (start.elapsed(), result)
}
