use routing_api::RouteEntry;
use routing_api::RoutingError;
use routing_db::{
    connect, BackendType, Coordinator, DbConfig, ManualClock, RouteStore, SqlConfig, SystemClock,
};
use routing_migration::{
    builtin_registry, CreateRouteTable, Migration, MigrationRegistry, MigrationRunner,
    RunnerConfig, UNKNOWN_LOG_GUID,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn sqlite() -> DbConfig {
    sqlite_at("sqlite::memory:", 1)
}

fn sqlite_at(url: &str, max_connections: u32) -> DbConfig {
    DbConfig {
        backend: BackendType::Sql,
        sql: SqlConfig {
            url: url.to_string(),
            max_connections,
            ..SqlConfig::default()
        },
        ..DbConfig::default()
    }
}

/// SQLite file removed, with its journal files, on drop
struct TempDb(PathBuf);

impl TempDb {
    fn new(name: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Self(std::env::temp_dir().join(format!(
            "routing-migration-{}-{}-{}.db",
            name,
            std::process::id(),
            nanos
        )))
    }

    fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.0.display())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let _ = std::fs::remove_file(format!("{}{}", self.0.display(), suffix));
        }
    }
}

fn config() -> RunnerConfig {
    RunnerConfig {
        poll_interval: Duration::from_millis(10),
        grace_period: Duration::from_secs(5),
        ..RunnerConfig::default()
    }
}

#[tokio::test]
async fn builtin_migrations_run_once_on_sqlite() {
    let db = connect(&sqlite(), Arc::new(SystemClock)).await.unwrap();
    let registry = Arc::new(builtin_registry().unwrap());

    let report = MigrationRunner::new(db.clone(), registry.clone(), config())
        .run()
        .await
        .unwrap();
    assert_eq!(report.applied, vec![0, 1, 2]);
    assert_eq!(db.migration_version().await.unwrap(), Some(2));

    let again = MigrationRunner::new(db.clone(), registry, config())
        .run()
        .await
        .unwrap();
    assert!(again.applied.is_empty());

    let entry = RouteEntry::new("web.example.com", "10.0.0.1", 8080).with_ttl(60);
    assert_eq!(db.create(&entry).await.unwrap(), 0);
}

#[tokio::test]
async fn upgrade_backfills_entries_written_before_owners() {
    let db = connect(&sqlite(), Arc::new(SystemClock)).await.unwrap();

    let baseline: Vec<Box<dyn Migration>> = vec![Box::new(CreateRouteTable)];
    let baseline = Arc::new(MigrationRegistry::new(baseline).unwrap());
    MigrationRunner::new(db.clone(), baseline, config())
        .run()
        .await
        .unwrap();
    assert_eq!(db.migration_version().await.unwrap(), Some(0));

    let legacy = RouteEntry::new("legacy.example.com", "10.0.0.9", 80);
    db.create(&legacy).await.unwrap();

    let report = MigrationRunner::new(db.clone(), Arc::new(builtin_registry().unwrap()), config())
        .run()
        .await
        .unwrap();
    assert_eq!(report.applied, vec![1, 2]);

    let upgraded = db.get(&legacy.id()).await.unwrap();
    assert_eq!(upgraded.log_guid.as_deref(), Some(UNKNOWN_LOG_GUID));
    assert_eq!(upgraded.revision, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runners_share_one_sqlite_file() {
    let file = TempDb::new("runners");
    let db = connect(&sqlite_at(&file.url(), 8), Arc::new(SystemClock))
        .await
        .unwrap();
    let registry = Arc::new(builtin_registry().unwrap());

    let runners: Vec<_> = (0..3)
        .map(|_| {
            let runner = MigrationRunner::new(db.clone(), registry.clone(), config());
            tokio::spawn(async move { runner.run().await })
        })
        .collect();

    let mut applied = Vec::new();
    for runner in runners {
        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.version, Some(2));
        applied.push(report.applied);
    }
    applied.sort();
    assert_eq!(applied, vec![vec![], vec![], vec![0, 1, 2]]);
    assert_eq!(db.migration_version().await.unwrap(), Some(2));
}

#[tokio::test]
async fn backfill_keeps_remaining_ttl_on_sqlite() {
    let clock = ManualClock::default();
    let db = connect(&sqlite(), Arc::new(clock.clone())).await.unwrap();

    let baseline: Vec<Box<dyn Migration>> = vec![Box::new(CreateRouteTable)];
    let baseline = Arc::new(MigrationRegistry::new(baseline).unwrap());
    MigrationRunner::new(db.clone(), baseline, config())
        .run()
        .await
        .unwrap();

    let legacy = RouteEntry::new("legacy.example.com", "10.0.0.9", 80).with_ttl(60);
    db.create(&legacy).await.unwrap();
    clock.advance(Duration::from_secs(50));

    MigrationRunner::new(db.clone(), Arc::new(builtin_registry().unwrap()), config())
        .run()
        .await
        .unwrap();
    let upgraded = db.get(&legacy.id()).await.unwrap();
    assert_eq!(upgraded.log_guid.as_deref(), Some(UNKNOWN_LOG_GUID));

    clock.advance(Duration::from_secs(20));
    assert!(matches!(
        db.get(&legacy.id()).await,
        Err(RoutingError::NotFound(_))
    ));
}
