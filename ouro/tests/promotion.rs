//! Evolution loop: isolation, proposal gating, promotion, rollback.

mod init_logging;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ouro::evolution::{
    EnvKind, Environment, EnvironmentPair, EvolutionError, EvolutionLoop, FileChange,
    ProposalStatus, Risk, RollbackPlan, SmokeCheck,
};
use tokio_util::sync::CancellationToken;

fn env(kind: EnvKind, root: &Path, test_command: Option<&str>) -> Environment {
    let name = kind.to_string();
    Environment {
        kind,
        database_path: root.join(format!("{name}.db")),
        storage_path: root.join(name),
        ports: match kind {
            EnvKind::Dev => [8101u16, 8102].into_iter().collect(),
            EnvKind::Prod => [8201u16, 8202].into_iter().collect(),
        },
        env_vars: BTreeMap::new(),
        max_memory_mb: Some(512),
        max_cpu_percent: None,
        test_command: test_command.map(str::to_string),
        test_timeout: Duration::from_secs(30),
    }
}

fn evolution(root: &Path, dev_tests: &str) -> EvolutionLoop {
    let pair = EnvironmentPair::new(
        env(EnvKind::Dev, root, Some(dev_tests)),
        env(EnvKind::Prod, root, None),
    )
    .unwrap();
    EvolutionLoop::new(pair).unwrap()
}

/// **Scenario**: a pair sharing a database, storage root, or port is
/// refused at startup.
#[tokio::test]
async fn startup_refuses_non_isolated_environments() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();

    let mut dev = env(EnvKind::Dev, dir.path(), None);
    let prod = env(EnvKind::Prod, dir.path(), None);
    dev.database_path = prod.database_path.clone();
    assert!(matches!(
        EnvironmentPair::new(dev, prod.clone()),
        Err(EvolutionError::Isolation(_))
    ));

    let mut dev = env(EnvKind::Dev, dir.path(), None);
    dev.ports = prod.ports.clone();
    assert!(EnvironmentPair::new(dev, prod.clone()).is_err());

    let mut dev = env(EnvKind::Dev, dir.path(), None);
    dev.storage_path = prod.storage_path.clone();
    assert!(EnvironmentPair::new(dev, prod).is_err());
}

/// **Scenario**: approval of a proposal with failing tests is rejected with
/// a validation error; status stays `pending_review`; prod is never touched.
#[tokio::test]
async fn failing_tests_block_approval_and_prod_stays_clean() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let loop_ = evolution(dir.path(), "exit 1");

    let mut p = loop_.create_proposal("risky change", "rewrites the dispatcher").unwrap();
    p.file_changes.push(FileChange {
        path: "dispatcher.rs".into(),
        new_content: "// new".into(),
    });
    p.risk = Some(Risk::Medium);
    p.rollback_plan = Some(RollbackPlan::default());

    loop_.submit_for_review(&mut p).unwrap();
    loop_
        .run_dev_tests(&mut p, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!p.test_results.as_ref().unwrap().passed);

    let err = loop_.approve(&mut p, "alice").unwrap_err();
    assert!(matches!(err, EvolutionError::InvalidTransition { .. }));
    assert_eq!(p.status, ProposalStatus::PendingReview);
    assert!(
        !loop_.prod().storage_path.join("dispatcher.rs").exists(),
        "no prod write may happen before approval"
    );
}

/// **Scenario**: the only path to `deployed` is
/// draft → pending_review → approved → deployed; the happy path walks it and
/// prod receives the change set.
#[tokio::test]
async fn full_promotion_path_deploys_to_prod() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let loop_ = evolution(dir.path(), "true");

    let mut p = loop_.create_proposal("add greeting", "writes greeting.txt").unwrap();
    p.file_changes.push(FileChange {
        path: "greeting.txt".into(),
        new_content: "hello prod".into(),
    });
    p.risk = Some(Risk::Low);
    p.rollback_plan = Some(RollbackPlan::default());

    // Shortcut attempts fail at every stage.
    assert!(loop_.promote(&mut p, "loop", None).await.is_err());

    loop_.apply_to_dev(&p).unwrap();
    assert!(loop_.dev().storage_path.join("greeting.txt").exists());

    loop_.submit_for_review(&mut p).unwrap();
    loop_.run_dev_tests(&mut p, &CancellationToken::new()).await.unwrap();
    assert!(p.test_results.as_ref().unwrap().passed);

    assert!(loop_.promote(&mut p, "loop", None).await.is_err(), "still unapproved");

    loop_.approve(&mut p, "alice").unwrap();
    loop_.promote(&mut p, "loop", None).await.unwrap();

    assert_eq!(p.status, ProposalStatus::Deployed);
    assert_eq!(p.deployed_by.as_deref(), Some("loop"));
    assert_eq!(
        std::fs::read_to_string(loop_.prod().storage_path.join("greeting.txt")).unwrap(),
        "hello prod"
    );

    // Rollback restores the pre-deploy state (file absent).
    loop_.roll_back_deployed(&mut p).unwrap();
    assert_eq!(p.status, ProposalStatus::RolledBack);
    assert!(!loop_.prod().storage_path.join("greeting.txt").exists());
}

struct FailingSmoke;

#[async_trait]
impl SmokeCheck for FailingSmoke {
    async fn check(&self, _env: &Environment) -> Result<(), String> {
        Err("healthz returned 500".to_string())
    }
}

/// **Scenario**: a failing smoke check rolls the deploy back automatically.
#[tokio::test]
async fn smoke_failure_triggers_rollback() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let loop_ = evolution(dir.path(), "true");
    std::fs::create_dir_all(&loop_.prod().storage_path).unwrap();
    std::fs::write(loop_.prod().storage_path.join("conf.toml"), "v = 1").unwrap();

    let mut p = loop_.create_proposal("bump conf", "v = 2").unwrap();
    p.file_changes.push(FileChange {
        path: "conf.toml".into(),
        new_content: "v = 2".into(),
    });
    p.risk = Some(Risk::Low);
    p.rollback_plan = Some(RollbackPlan::default());
    loop_.submit_for_review(&mut p).unwrap();
    loop_.run_dev_tests(&mut p, &CancellationToken::new()).await.unwrap();
    loop_.approve(&mut p, "alice").unwrap();

    let err = loop_.promote(&mut p, "loop", Some(&FailingSmoke)).await.unwrap_err();
    assert!(matches!(err, EvolutionError::SmokeFailed(_)));
    assert_eq!(p.status, ProposalStatus::RolledBack);
    assert_eq!(
        std::fs::read_to_string(loop_.prod().storage_path.join("conf.toml")).unwrap(),
        "v = 1"
    );
}

/// **Scenario**: proposals persist across loop instances via the store.
#[tokio::test]
async fn proposals_persist_on_disk() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let loop_ = evolution(dir.path(), "true");
        let mut p = loop_.create_proposal("persisted", "outlives the loop").unwrap();
        p.file_changes.push(FileChange {
            path: "x.txt".into(),
            new_content: "x".into(),
        });
        loop_.submit_for_review(&mut p).unwrap();
        p.id
    };

    let loop_ = evolution(dir.path(), "true");
    let reloaded = loop_.proposals().load(&id).unwrap().unwrap();
    assert_eq!(reloaded.status, ProposalStatus::PendingReview);
}

/// **Scenario**: a concurrent prod change between proposal creation and
/// promotion is detected as a base revision conflict.
#[tokio::test]
async fn concurrent_prod_drift_blocks_promotion() {
    init_logging::init();
    let dir = tempfile::tempdir().unwrap();
    let loop_ = evolution(dir.path(), "true");

    let mut p = loop_.create_proposal("drift test", "d").unwrap();
    p.file_changes.push(FileChange {
        path: "a.txt".into(),
        new_content: "a".into(),
    });
    loop_.submit_for_review(&mut p).unwrap();
    loop_.run_dev_tests(&mut p, &CancellationToken::new()).await.unwrap();
    p.risk = Some(Risk::Low);
    p.rollback_plan = Some(RollbackPlan::default());
    loop_.approve(&mut p, "alice").unwrap();

    // Prod drifts after the proposal captured its base revision.
    std::fs::create_dir_all(&loop_.prod().storage_path).unwrap();
    std::fs::write(loop_.prod().storage_path.join("drift.txt"), "surprise").unwrap();

    let err = loop_.promote(&mut p, "loop", None).await.unwrap_err();
    assert!(matches!(err, EvolutionError::Conflict(_)));
    assert!(!loop_.prod().storage_path.join("a.txt").exists());
}
