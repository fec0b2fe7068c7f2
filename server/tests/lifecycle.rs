//! Create, open, update and delete against the in-memory collaborators

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;

use common::{strings, token, Harness};
use environment_server::domain::container::ContainerRef;
use environment_server::domain::environment::{Environment, EnvironmentConfig, DEFAULT_INSTRUCTIONS};
use environment_server::domain::revision::{RevisionRecord, Version};
use environment_server::infra::backend::ContainerBackend;
use environment_server::infra::memory::MemoryRecord;
use environment_server::infra::tracker::Tracker;
use environment_server::service::{EnvironmentUpdate, ExecRequest};
use environment_server::{Error, Result};

mock! {
    pub FlakyTracker {}

    #[async_trait]
    impl Tracker for FlakyTracker {
        async fn setup(&self, env: &Environment) -> Result<()>;
        async fn propagate(&self, env: &Environment, message: &str, explanation: &str) -> Result<()>;
        async fn delete(&self, env: &Environment) -> Result<()>;
        async fn append_note(&self, env: &Environment, text: &str) -> Result<()>;
        async fn uncommitted_diff(&self, env: &Environment) -> Result<String>;
    }
}

/// A tracker that accepts everything except what the test overrides
fn permissive_tracker() -> MockFlakyTracker {
    let mut tracker = MockFlakyTracker::new();
    tracker.expect_setup().returning(|_| Ok(()));
    tracker.expect_append_note().returning(|_, _| Ok(()));
    tracker
        .expect_uncommitted_diff()
        .returning(|_| Ok(String::new()));
    tracker
}

#[tokio::test]
async fn test_create_records_everywhere() {
    let h = Harness::new();
    h.tracker.set_diff("diff --git a/README.md b/README.md\n");

    let env = h
        .service
        .create("start work", h.source.path(), "web", &token())
        .await
        .unwrap();

    assert!(env.id().starts_with("web/"));
    assert_eq!(env.name(), "web");
    assert_eq!(env.source(), h.source.path());

    let config = env.config().await;
    assert_eq!(config.base_image, "alpine:3.20");
    assert_eq!(config.workdir, "/workdir");
    assert_eq!(config.instructions, DEFAULT_INSTRUCTIONS);

    assert_eq!(h.tracker.messages(env.id()), vec!["Init env web".to_string()]);
    let notes = h.tracker.notes(env.id());
    assert!(notes[0].contains("created with base image alpine:3.20"));

    let record = h.storage.record(env.id()).unwrap();
    assert_eq!(record.project, h.repo_name());
    assert_eq!(record.revisions.len(), 1);
    assert_eq!(record.patches, vec!["diff --git a/README.md b/README.md\n".to_string()]);
    // Instructions are never persisted
    assert_eq!(record.config.unwrap().instructions, "");

    let container = h.backend.inspect(&env.container().await.unwrap()).unwrap();
    assert_eq!(container.image, "alpine:3.20");
    assert_eq!(
        container.files.get("/workdir/README.md").map(String::as_str),
        Some("hello\n")
    );
}

#[tokio::test]
async fn test_create_rejects_bad_name() {
    let h = Harness::new();
    for name in ["", "a/b"] {
        let err = h
            .service
            .create("", h.source.path(), name, &token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }
    assert!(h.service.list().is_empty());
}

#[tokio::test]
async fn test_create_not_registered_when_tracking_fails() {
    let mut tracker = permissive_tracker();
    tracker
        .expect_propagate()
        .returning(|_, _, _| Err(Error::Tracking("no remote".to_string())));
    tracker.expect_delete().times(1).returning(|_| Ok(()));
    let h = Harness::with_tracker(Arc::new(tracker));

    let err = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Tracking(_)));
    assert!(h.service.list().is_empty());
    assert_eq!(h.storage.record_count(), 0);
}

#[tokio::test]
async fn test_failed_create_leaves_nothing_behind() {
    let h = Harness::new();
    h.backend.set_fail_sync(true);

    let err = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(_)));
    assert!(h.service.list().is_empty());
    assert_eq!(h.storage.record_count(), 0);
}

#[tokio::test]
async fn test_commit_survives_tracking_failure() {
    let mut tracker = permissive_tracker();
    tracker
        .expect_propagate()
        .withf(|_, message, _| message.starts_with("Init env"))
        .returning(|_, _, _| Ok(()));
    tracker
        .expect_propagate()
        .withf(|_, message, _| !message.starts_with("Init env"))
        .returning(|_, _, _| Err(Error::Tracking("remote gone".to_string())));
    let h = Harness::with_tracker(Arc::new(tracker));
    let cancel = token();

    let env = h
        .service
        .create("", h.source.path(), "web", &cancel)
        .await
        .unwrap();

    let output = h
        .service
        .run(env.id(), "", &ExecRequest::new("echo hi"), &cancel)
        .await
        .unwrap();
    assert_eq!(output, "hi\n");

    let reverted = h.service.revert(env.id(), "", 1, &cancel).await.unwrap();
    assert_eq!(reverted.version, Version(3));

    assert_eq!(env.history().await.len(), 3);
    assert_eq!(h.storage.record(env.id()).unwrap().revisions.len(), 3);
}

#[tokio::test]
async fn test_open_unknown_id_creates() {
    let h = Harness::new();
    let env = h
        .service
        .open("resume", h.source.path(), "web/deadbeef", &token())
        .await
        .unwrap();

    assert_eq!(env.name(), "web");
    assert_eq!(env.history().await.len(), 1);
    assert!(h.service.get(env.id()).is_ok());
}

#[tokio::test]
async fn test_open_live_id_returns_same_instance() {
    let h = Harness::new();
    let env = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap();

    let opened = h
        .service
        .open("", h.source.path(), env.id(), &token())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&env, &opened));
    assert_eq!(opened.history().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_share_one_instance() {
    let h = Harness::new();
    let env = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap();
    let id = env.id().to_string();
    h.service.registry().remove(&id);

    h.storage.set_save_delay(Duration::from_millis(50));
    let (cancel_a, cancel_b) = (token(), token());
    let (a, b) = tokio::join!(
        h.service.open("", h.source.path(), &id, &cancel_a),
        h.service.open("", h.source.path(), &id, &cancel_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &h.service.get(&id).unwrap()));
    assert_eq!(a.history().await.len(), 2);

    let versions: Vec<_> = h
        .storage
        .record(&id)
        .unwrap()
        .revisions
        .iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(versions, vec![Version(1), Version(2)]);

    // Still restorable after another restart
    h.service.registry().remove(&id);
    h.storage.set_save_delay(Duration::ZERO);
    let reopened = h
        .service
        .open("", h.source.path(), &id, &token())
        .await
        .unwrap();
    assert_eq!(reopened.history().await.len(), 3);
}

#[tokio::test]
async fn test_open_restores_history_and_reverts_reference() {
    let h = Harness::new();
    let cancel = token();

    // States a previous process committed
    let first = h.backend.from_image("alpine:3.20").await.unwrap();
    let output = h
        .backend
        .with_exec(
            &first,
            &strings(&["sh", "-c", "echo old > /workdir/state.txt"]),
            Default::default(),
        )
        .await
        .unwrap();
    let first_id = h.backend.id(&first).await.unwrap();
    let second_id = h.backend.id(&output.state).await.unwrap();

    let record = |version: u64, name: &str, state| RevisionRecord {
        version: Version(version),
        name: name.to_string(),
        explanation: String::new(),
        output: String::new(),
        created_at: Utc::now(),
        state,
    };
    let mut config = EnvironmentConfig::new("alpine:3.20", "/workdir");
    config.instructions.clear();
    config.setup_commands = strings(&["echo ready"]);
    h.storage.insert_record(
        "web/0000abcd",
        MemoryRecord {
            project: h.repo_name(),
            config: Some(config),
            revisions: vec![
                record(1, "Create environment", first_id.clone()),
                record(2, "Run echo old", second_id.clone()),
            ],
            ..Default::default()
        },
    );

    let env = h
        .service
        .open("resume", h.source.path(), "web/0000abcd", &cancel)
        .await
        .unwrap();

    assert_eq!(env.id(), "web/0000abcd");
    let restored = env.config().await;
    assert_eq!(restored.setup_commands, strings(&["echo ready"]));
    assert_eq!(restored.instructions, DEFAULT_INSTRUCTIONS);

    let history = env.history().await;
    assert_eq!(history.len(), 3);
    assert_eq!(history.latest().unwrap().name, "Open environment");
    let v2 = history.get(Version(2)).unwrap();
    assert_eq!(v2.container, ContainerRef::Reference(second_id.clone()));

    let reverted = h
        .service
        .revert(env.id(), "back", 2, &cancel)
        .await
        .unwrap();
    assert_eq!(reverted.version, Version(4));
    assert_eq!(reverted.state, second_id);
    assert!(matches!(reverted.container, ContainerRef::Live(_)));

    let text = h
        .service
        .run(env.id(), "", &ExecRequest::new("cat /workdir/state.txt"), &cancel)
        .await
        .unwrap();
    assert_eq!(text, "old\n");
}

#[tokio::test]
async fn test_open_rejects_gapped_history() {
    let h = Harness::new();
    let state = h.backend.from_image("alpine:3.20").await.unwrap();
    let state_id = h.backend.id(&state).await.unwrap();

    h.storage.insert_record(
        "web/0000abcd",
        MemoryRecord {
            project: h.repo_name(),
            config: Some(EnvironmentConfig::new("alpine:3.20", "/workdir")),
            revisions: vec![RevisionRecord {
                version: Version(2),
                name: "Run".to_string(),
                explanation: String::new(),
                output: String::new(),
                created_at: Utc::now(),
                state: state_id,
            }],
            ..Default::default()
        },
    );

    let err = h
        .service
        .open("", h.source.path(), "web/0000abcd", &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(h.service.list().is_empty());
}

#[tokio::test]
async fn test_update_rebuilds_with_new_config() {
    let h = Harness::new();
    let cancel = token();
    let env = h
        .service
        .create("", h.source.path(), "web", &cancel)
        .await
        .unwrap();

    let revision = h
        .service
        .update(
            env.id(),
            "add tooling",
            EnvironmentUpdate {
                instructions: "use make".to_string(),
                base_image: "debian:12".to_string(),
                setup_commands: strings(&["echo installed > /opt/tool"]),
                secrets: strings(&["TOKEN=env://GITHUB_TOKEN"]),
            },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(revision.version, Version(2));
    assert_eq!(revision.name, "Update environment");

    let config = env.config().await;
    assert_eq!(config.base_image, "debian:12");
    assert_eq!(config.instructions, "use make");
    assert_eq!(config.workdir, "/workdir");
    assert_eq!(config.secrets, strings(&["TOKEN=env://GITHUB_TOKEN"]));

    let container = h.backend.inspect(&env.container().await.unwrap()).unwrap();
    assert_eq!(container.image, "debian:12");
    assert_eq!(
        container.files.get("/opt/tool").map(String::as_str),
        Some("installed\n")
    );
    assert_eq!(
        container.secrets.get("TOKEN").map(String::as_str),
        Some("env://GITHUB_TOKEN")
    );

    let stored = h.storage.record(env.id()).unwrap().config.unwrap();
    assert_eq!(stored.base_image, "debian:12");
    assert!(h
        .tracker
        .messages(env.id())
        .contains(&"Update environment web".to_string()));
    assert!(h
        .tracker
        .notes(env.id())
        .iter()
        .any(|n| n.starts_with("$ echo installed > /opt/tool")));
}

#[tokio::test]
async fn test_update_failures_keep_previous_config() {
    let h = Harness::new();
    let cancel = token();
    let env = h
        .service
        .create("", h.source.path(), "web", &cancel)
        .await
        .unwrap();
    let before = env.config().await;

    let err = h
        .service
        .update(
            env.id(),
            "",
            EnvironmentUpdate {
                base_image: "debian:12".to_string(),
                setup_commands: strings(&["echo ok", "exit 4"]),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SetupCommandFailed { exit_code: 4, .. }));
    assert!(h
        .tracker
        .notes(env.id())
        .iter()
        .any(|n| n.starts_with("$ exit 4\nexit 4")));

    let err = h
        .service
        .update(
            env.id(),
            "",
            EnvironmentUpdate {
                base_image: "debian:12".to_string(),
                secrets: strings(&["NOVALUE"]),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSecret(_)));

    let err = h
        .service
        .update(env.id(), "", EnvironmentUpdate::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    h.storage.set_fail_save(true);
    let err = h
        .service
        .update(
            env.id(),
            "",
            EnvironmentUpdate {
                base_image: "debian:12".to_string(),
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    assert_eq!(env.config().await, before);
    assert_eq!(env.history().await.len(), 1);
}

#[tokio::test]
async fn test_update_refused_while_locked() {
    let h = Harness::new();
    let cancel = token();
    let env = h
        .service
        .create("", h.source.path(), "web", &cancel)
        .await
        .unwrap();
    let update = EnvironmentUpdate {
        base_image: "debian:12".to_string(),
        ..Default::default()
    };

    assert!(!h.service.is_locked(env.id()).await.unwrap());
    assert!(h.service.lock(env.id()).await.unwrap());
    assert!(!h.service.lock(env.id()).await.unwrap());
    assert!(h.service.is_locked(env.id()).await.unwrap());

    let err = h
        .service
        .update(env.id(), "", update.clone(), &cancel)
        .await
        .unwrap_err();
    let lock_path = h.source.path().join(".environment").join("lock");
    assert!(matches!(err, Error::EnvironmentLocked(ref path) if *path == lock_path));
    assert!(err.to_string().contains(&lock_path.display().to_string()));
    assert_eq!(env.history().await.len(), 1);

    // Other mutations are not gated by the marker
    h.service
        .run(env.id(), "", &ExecRequest::new("true"), &cancel)
        .await
        .unwrap();

    assert!(h.service.unlock(env.id()).await.unwrap());
    assert!(!h.service.unlock(env.id()).await.unwrap());
    h.service.update(env.id(), "", update, &cancel).await.unwrap();
    assert_eq!(env.history().await.len(), 3);
}

#[tokio::test]
async fn test_delete_forgets_environment() {
    let h = Harness::new();
    let env = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap();
    let id = env.id().to_string();

    h.service.delete(&id, &token()).await.unwrap();

    assert!(matches!(h.service.get(&id), Err(Error::EnvironmentNotFound(_))));
    assert!(h.storage.record(&id).is_none());
    assert!(!h.tracker.is_tracked(&id));
    assert!(matches!(
        h.service.delete(&id, &token()).await,
        Err(Error::EnvironmentNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_wins_over_inflight_run() {
    let h = Harness::new();
    let env = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap();
    let id = env.id().to_string();

    h.backend.set_exec_delay(Duration::from_millis(100));
    let service = h.service.clone();
    let run_id = id.clone();
    let run = tokio::spawn(async move {
        let cancel = token();
        let request = ExecRequest::new("echo late");
        service.run(&run_id, "", &request, &cancel).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.service.delete(&id, &token()).await.unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::EnvironmentNotFound(_)));
    assert!(h.storage.record(&id).is_none());
    assert!(env.lock().await.is_deleted());
    assert_eq!(env.history().await.len(), 1);

    // Nothing persisted, so the id opens as a fresh environment
    h.backend.set_exec_delay(Duration::ZERO);
    let opened = h
        .service
        .open("", h.source.path(), &id, &token())
        .await
        .unwrap();
    assert_ne!(opened.id(), id);
    assert_eq!(opened.history().await.len(), 1);
}

#[tokio::test]
async fn test_delete_keeps_environment_when_storage_fails() {
    let h = Harness::new();
    let env = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap();

    h.storage.set_fail_delete(true);
    let err = h.service.delete(env.id(), &token()).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(h.service.get(env.id()).is_ok());
    assert!(h.storage.record(env.id()).is_some());
}

#[tokio::test]
async fn test_delete_keeps_environment_when_tracking_fails() {
    let mut tracker = permissive_tracker();
    tracker.expect_propagate().returning(|_, _, _| Ok(()));
    tracker
        .expect_delete()
        .times(1)
        .returning(|env| Err(Error::Tracking(format!("cannot delete {}", env.id()))));
    let h = Harness::with_tracker(Arc::new(tracker));

    let env = h
        .service
        .create("", h.source.path(), "web", &token())
        .await
        .unwrap();

    let err = h.service.delete(env.id(), &token()).await.unwrap_err();
    assert!(matches!(err, Error::Tracking(_)));
    assert!(h.service.get(env.id()).is_ok());
    assert!(h.storage.record(env.id()).is_some());
}

#[tokio::test]
async fn test_list_history_checkpoint_and_terminal() {
    let h = Harness::new();
    let cancel = token();
    let a = h
        .service
        .create("", h.source.path(), "alpha", &cancel)
        .await
        .unwrap();
    h.service
        .create("", h.source.path(), "beta", &cancel)
        .await
        .unwrap();
    assert_eq!(h.service.list().len(), 2);

    h.service
        .run(a.id(), "why", &ExecRequest::new("echo hi"), &cancel)
        .await
        .unwrap();
    let history = h.service.history(a.id()).await.unwrap();
    let names: Vec<_> = history.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Create environment", "Run echo hi"]);
    assert_eq!(history[1].explanation, "why");
    assert_eq!(history[1].output, "hi\n");

    let reference = h
        .service
        .checkpoint(a.id(), "registry.local/alpha:v1", &cancel)
        .await
        .unwrap();
    assert!(reference.starts_with("registry.local/alpha:v1@"));
    assert_eq!(h.backend.published(), strings(&["registry.local/alpha:v1"]));

    let err = h.service.checkpoint(a.id(), " ", &cancel).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    h.service.terminal(a.id(), &cancel).await.unwrap();
    assert_eq!(h.backend.terminal_count(), 1);
}
