//! Runs pending migrations under the cross-process lease
//!
//! Only the lease holder applies units. Every other runner polls the version
//! marker until the holder finishes, retrying acquisition in case the holder
//! crashed and its lease ran out.

use crate::registry::MigrationRegistry;
use rand::Rng;
use routing_api::{Result, RoutingError};
use routing_db::{Coordinator, Database};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Lock lease, renewed before each unit
    pub lease: Duration,
    /// How long a non-holder waits for the holder to finish
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            grace_period: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of a successful run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions this runner applied, ascending
    pub applied: Vec<u32>,
    /// Marker after the run
    pub version: Option<u32>,
}

pub struct MigrationRunner {
    db: Arc<dyn Database>,
    registry: Arc<MigrationRegistry>,
    config: RunnerConfig,
    holder: String,
}

impl MigrationRunner {
    pub fn new(db: Arc<dyn Database>, registry: Arc<MigrationRegistry>, config: RunnerConfig) -> Self {
        Self {
            db,
            registry,
            config,
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn run(&self) -> Result<MigrationReport> {
        let started = Instant::now();

        loop {
            if let Some(lease) = self
                .db
                .try_acquire_lock(&self.holder, self.config.lease)
                .await?
            {
                info!("Acquired migration lock as {} until {}", self.holder, lease.expires_at);
                break;
            }

            let marker = self.db.migration_version().await?;
            if self.registry.is_satisfied_by(marker) {
                info!("Migrations already at {:?}, nothing to apply", marker);
                return Ok(MigrationReport {
                    applied: Vec::new(),
                    version: marker,
                });
            }

            if started.elapsed() >= self.config.grace_period {
                warn!(
                    "Gave up waiting for migration lock after {:?} (marker {:?})",
                    self.config.grace_period, marker
                );
                return Err(RoutingError::LockTimeout(self.config.grace_period));
            }

            debug!("Migration lock held elsewhere, marker at {:?}", marker);
            sleep(self.poll_delay()).await;
        }

        let result = self.apply_pending().await;
        let released = self.db.release_lock(&self.holder).await;

        match (result, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!("Failed to release migration lock: {}", release_err);
                }
                Err(e)
            }
        }
    }

    async fn apply_pending(&self) -> Result<MigrationReport> {
        let marker = self.db.migration_version().await?;
        let mut applied = Vec::new();

        for unit in self.registry.pending(marker) {
            self.db.renew_lock(&self.holder, self.config.lease).await?;

            info!("Applying migration {} ({})", unit.version(), unit.name());
            if let Err(e) = unit.run(self.db.as_ref()).await {
                error!("Migration {} ({}) failed: {}", unit.version(), unit.name(), e);
                return Err(e);
            }

            self.db.set_migration_version(unit.version()).await?;
            applied.push(unit.version());
        }

        let version = applied.last().copied().or(marker);
        info!("Migrations complete at {:?}, applied {:?}", version, applied);
        Ok(MigrationReport { applied, version })
    }

    /// Poll interval with up to 50% jitter so waiting runners spread out
    fn poll_delay(&self) -> Duration {
        let base = self.config.poll_interval.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Migration;
    use async_trait::async_trait;
    use routing_db::{KvStore, ManualClock, MemoryKv};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records the order units ran in, optionally failing or pausing
    struct Recording {
        version: u32,
        log: Arc<Mutex<Vec<u32>>>,
        fail: bool,
        pause: Duration,
    }

    #[async_trait]
    impl Migration for Recording {
        fn version(&self) -> u32 {
            self.version
        }

        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(&self, _db: &dyn Database) -> Result<()> {
            sleep(self.pause).await;
            if self.fail {
                return Err(RoutingError::Communication("backend went away".to_string()));
            }
            self.log
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(self.version);
            Ok(())
        }
    }

    fn registry(versions: &[u32], failing: Option<u32>, log: &Arc<Mutex<Vec<u32>>>) -> Arc<MigrationRegistry> {
        let units = versions
            .iter()
            .map(|v| {
                Box::new(Recording {
                    version: *v,
                    log: log.clone(),
                    fail: failing == Some(*v),
                    pause: Duration::from_millis(20),
                }) as Box<dyn Migration>
            })
            .collect();
        Arc::new(MigrationRegistry::new(units).unwrap())
    }

    fn fast() -> RunnerConfig {
        RunnerConfig {
            lease: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn database() -> (Arc<dyn Database>, ManualClock) {
        let clock = ManualClock::default();
        let kv = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
        let db: Arc<dyn Database> = Arc::new(KvStore::new(kv, Arc::new(clock.clone())));
        (db, clock)
    }

    #[tokio::test]
    async fn test_fresh_store_applies_all_then_nothing() {
        let (db, _) = database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&[0, 1, 2], None, &log);

        let first = MigrationRunner::new(db.clone(), registry.clone(), fast());
        let report = first.run().await.unwrap();
        assert_eq!(report.applied, vec![0, 1, 2]);
        assert_eq!(report.version, Some(2));
        assert_eq!(db.migration_version().await.unwrap(), Some(2));

        let second = MigrationRunner::new(db.clone(), registry, fast());
        let report = second.run().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failure_stops_at_last_good_unit() {
        let (db, _) = database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = MigrationRunner::new(db.clone(), registry(&[0, 1, 2], Some(1), &log), fast());

        let err = runner.run().await.unwrap_err();
        assert_eq!(err, RoutingError::Communication("backend went away".to_string()));
        assert_eq!(db.migration_version().await.unwrap(), Some(0));
        assert_eq!(*log.lock().unwrap(), vec![0]);

        // lock released on abort
        assert!(db
            .try_acquire_lock("someone-else", Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_runners_apply_each_unit_once() {
        let (db, _) = database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&[0, 1, 2], None, &log);

        let runners: Vec<MigrationRunner> = (0..3)
            .map(|_| MigrationRunner::new(db.clone(), registry.clone(), fast()))
            .collect();
        let reports = futures::future::join_all(runners.iter().map(|r| r.run())).await;

        let mut applied: Vec<Vec<u32>> = reports
            .into_iter()
            .map(|report| {
                let report = report.unwrap();
                assert_eq!(report.version, Some(2));
                report.applied
            })
            .collect();
        applied.sort();
        assert_eq!(applied, vec![vec![], vec![], vec![0, 1, 2]]);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_non_contiguous_versions() {
        let (db, _) = database();
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = MigrationRunner::new(db.clone(), registry(&[10, 1, 5], None, &log), fast());

        assert_eq!(runner.run().await.unwrap().applied, vec![1, 5, 10]);
        assert_eq!(db.migration_version().await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_lock_timeout_when_holder_never_finishes() {
        let (db, _) = database();
        db.try_acquire_lock("stuck", Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let config = RunnerConfig {
            grace_period: Duration::from_millis(50),
            ..fast()
        };
        let runner = MigrationRunner::new(db, registry(&[0], None, &log), config);

        assert_eq!(
            runner.run().await.unwrap_err(),
            RoutingError::LockTimeout(Duration::from_millis(50))
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_takes_over_expired_lease() {
        let (db, clock) = database();
        db.try_acquire_lock("crashed", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        clock.advance(Duration::from_secs(31));

        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = MigrationRunner::new(db, registry(&[0, 1], None, &log), fast());
        assert_eq!(runner.run().await.unwrap().applied, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_waiting_runner_returns_once_marker_is_current() {
        let (db, _) = database();
        db.try_acquire_lock("other", Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        db.set_migration_version(3).await.unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl Migration for Counting {
            fn version(&self) -> u32 {
                3
            }

            fn name(&self) -> &'static str {
                "counting"
            }

            async fn run(&self, _db: &dyn Database) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let registry = Arc::new(
            MigrationRegistry::new(vec![Box::new(Counting(runs.clone())) as Box<dyn Migration>]).unwrap(),
        );
        let report = MigrationRunner::new(db, registry, fast()).run().await.unwrap();
        assert_eq!(report, MigrationReport { applied: vec![], version: Some(3) });
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
