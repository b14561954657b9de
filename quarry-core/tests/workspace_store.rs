mod support;

use std::{fs, sync::Arc};

use chrono::{Duration as ChronoDuration, Utc};
use quarry_core::workspace::WorkspaceStore;
use quarry_core::{ContentSetId, GovernorError, ModelName, TenantId};

use support::workspace_settings;

fn tenant(raw: &str) -> TenantId {
    TenantId::new(raw).expect("valid tenant")
}

fn lesson(raw: &str) -> ContentSetId {
    ContentSetId::new(raw).expect("valid content set")
}

fn children(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn acquire_builds_a_complete_workspace() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = WorkspaceStore::with_default_renderer(workspace_settings(base.path()));

    let path = store
        .acquire(&tenant("u1"), &lesson("lesson1"))
        .await
        .expect("acquire");

    assert_eq!(path, base.path().join("workspaces/u1/lesson1"));
    assert!(path.join("dbt_project.yml").is_file());
    assert!(path.join("models/orders.sql").is_file());
    let profile = fs::read_to_string(path.join("profiles.yml")).expect("profile");
    assert!(profile.contains("schema: learner_u1"));
    assert_eq!(children(&base.path().join("workspaces/u1")), ["lesson1"]);
}

#[tokio::test]
async fn second_acquire_reuses_the_workspace() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = WorkspaceStore::with_default_renderer(workspace_settings(base.path()));
    let (t, l) = (tenant("u1"), lesson("lesson1"));

    let path = store.acquire(&t, &l).await.expect("first acquire");
    fs::write(path.join("models/orders.sql"), "select 2 as id\n").expect("edit model");

    let again = store.acquire(&t, &l).await.expect("second acquire");
    assert_eq!(again, path);
    assert_eq!(
        fs::read_to_string(again.join("models/orders.sql")).expect("model"),
        "select 2 as id\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_initializes_once() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(WorkspaceStore::with_default_renderer(workspace_settings(
        base.path(),
    )));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.acquire(&tenant("u1"), &lesson("lesson1")).await })
        })
        .collect();

    let mut paths = Vec::new();
    for handle in handles {
        paths.push(handle.await.expect("join").expect("acquire"));
    }

    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    // No staging leftovers next to the workspace.
    assert_eq!(children(&base.path().join("workspaces/u1")), ["lesson1"]);
}

#[tokio::test]
async fn missing_template_fails_without_leaving_a_directory() {
    let base = tempfile::tempdir().expect("tempdir");
    let mut settings = workspace_settings(base.path());
    settings.template_dir = base.path().join("does-not-exist");
    let store = WorkspaceStore::with_default_renderer(settings);

    let err = store
        .acquire(&tenant("u1"), &lesson("lesson1"))
        .await
        .expect_err("template is missing");

    assert!(matches!(err, GovernorError::WorkspaceInit { .. }), "{err:?}");
    assert!(!base.path().join("workspaces/u1/lesson1").exists());
}

#[tokio::test]
async fn reclaim_keeps_fresh_and_removes_expired_workspaces() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = WorkspaceStore::with_default_renderer(workspace_settings(base.path()));
    let max_age = ChronoDuration::from_std(store.settings().max_age()).expect("max age");

    store.acquire(&tenant("u1"), &lesson("lesson1")).await.expect("acquire");
    store.acquire(&tenant("u2"), &lesson("lesson1")).await.expect("acquire");

    let fresh = store
        .reclaim_expired(Utc::now() + max_age - ChronoDuration::minutes(1))
        .await
        .expect("reclaim");
    assert_eq!(fresh.removed, 0);
    assert!(base.path().join("workspaces/u1/lesson1").exists());

    let expired = store
        .reclaim_expired(Utc::now() + max_age + ChronoDuration::minutes(1))
        .await
        .expect("reclaim");
    assert_eq!(expired.removed, 2);
    assert!(expired.freed_bytes > 0);
    assert_eq!(expired.tenants_removed, 2);
    assert!(children(&base.path().join("workspaces")).is_empty());
    assert_eq!(store.stats().tracked, 0);
}

#[tokio::test]
async fn touch_postpones_reclamation() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = WorkspaceStore::with_default_renderer(workspace_settings(base.path()));
    let (t, l) = (tenant("u1"), lesson("lesson1"));
    store.acquire(&t, &l).await.expect("acquire");

    store.touch(&t, &l).await;
    let report = store.reclaim_expired(Utc::now()).await.expect("reclaim");

    assert_eq!(report.removed, 0);
    // Unknown keys are ignored.
    store.touch(&tenant("nobody"), &l).await;
}

#[tokio::test]
async fn workspaces_from_a_previous_process_are_adopted_then_aged_by_mtime() {
    let base = tempfile::tempdir().expect("tempdir");
    let settings = workspace_settings(base.path());
    let (t, l) = (tenant("u1"), lesson("lesson1"));

    let first = WorkspaceStore::with_default_renderer(settings.clone());
    let path = first.acquire(&t, &l).await.expect("acquire");
    fs::write(path.join("models/mine.sql"), "select 42\n").expect("write");
    drop(first);

    let second = WorkspaceStore::with_default_renderer(settings.clone());
    let adopted = second.acquire(&t, &l).await.expect("adopt");
    assert_eq!(adopted, path);
    assert!(adopted.join("models/mine.sql").is_file());

    // A third store never saw the workspace; reclamation still finds it.
    let third = WorkspaceStore::with_default_renderer(settings);
    let max_age = ChronoDuration::from_std(third.settings().max_age()).expect("max age");
    let report = third
        .reclaim_expired(Utc::now() + max_age + ChronoDuration::hours(1))
        .await
        .expect("reclaim");
    assert_eq!(report.removed, 1);
    assert!(!path.exists());
}

#[tokio::test]
async fn stale_staging_directories_are_swept() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = WorkspaceStore::with_default_renderer(workspace_settings(base.path()));
    let staging = base.path().join("workspaces/u1/.staging-lesson1-deadbeef");
    fs::create_dir_all(staging.join("models")).expect("staging");

    let max_age = ChronoDuration::from_std(store.settings().max_age()).expect("max age");
    let report = store
        .reclaim_expired(Utc::now() + max_age + ChronoDuration::hours(1))
        .await
        .expect("reclaim");

    assert_eq!(report.staging_removed, 1);
    assert_eq!(report.tenants_removed, 1);
    assert!(!base.path().join("workspaces/u1").exists());
}

#[tokio::test]
async fn model_files_round_trip_inside_the_workspace() {
    let base = tempfile::tempdir().expect("tempdir");
    let store = WorkspaceStore::with_default_renderer(workspace_settings(base.path()));
    let (t, l) = (tenant("u1"), lesson("lesson1"));
    let customers = ModelName::new("customers").expect("model name");

    let err = store.list_models(&t, &l).await.expect_err("no workspace yet");
    assert!(matches!(err, GovernorError::WorkspaceNotFound { .. }));

    store.acquire(&t, &l).await.expect("acquire");
    assert_eq!(store.read_model(&t, &l, &customers).await.expect("read"), None);

    store
        .write_model(&t, &l, &customers, "select * from raw_customers\n")
        .await
        .expect("write");

    let names: Vec<String> = store
        .list_models(&t, &l)
        .await
        .expect("list")
        .into_iter()
        .map(|m| m.name.to_string())
        .collect();
    assert_eq!(names, ["customers", "orders"]);
    assert_eq!(
        store.read_model(&t, &l, &customers).await.expect("read").as_deref(),
        Some("select * from raw_customers\n")
    );
}

#[tokio::test]
async fn model_edits_keep_an_adopted_workspace_alive() {
    let base = tempfile::tempdir().expect("tempdir");
    let settings = workspace_settings(base.path());
    let (t, l) = (tenant("u1"), lesson("lesson1"));

    let first = WorkspaceStore::with_default_renderer(settings.clone());
    let path = first.acquire(&t, &l).await.expect("acquire");
    drop(first);

    // Left over from a previous process and last used long ago.
    let long_ago = std::time::SystemTime::now()
        - settings.max_age()
        - std::time::Duration::from_secs(3600);
    fs::File::open(&path)
        .and_then(|dir| dir.set_modified(long_ago))
        .expect("backdate workspace");

    let store = WorkspaceStore::with_default_renderer(settings);
    let orders = ModelName::new("orders").expect("model name");
    store
        .write_model(&t, &l, &orders, "select 3 as id\n")
        .await
        .expect("write");
    assert_eq!(store.stats().tracked, 1);

    let report = store.reclaim_expired(Utc::now()).await.expect("reclaim");

    assert_eq!(report.removed, 0);
    assert_eq!(
        fs::read_to_string(path.join("models/orders.sql")).expect("model"),
        "select 3 as id\n"
    );
}
