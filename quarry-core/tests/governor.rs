mod support;

use std::time::Duration;

use futures::StreamExt;
use quarry_core::jobs::{JobStatus, OutputEvent};
use quarry_core::{
    ContentSetId, DbtSettings, Governor, GovernorError, GovernorSettings, JobSettings, TenantId,
};
use tokio_util::sync::CancellationToken;

use support::{FakeConnector, workspace_settings};

fn governor(base: &std::path::Path) -> Governor<FakeConnector> {
    let settings = GovernorSettings {
        workspace: workspace_settings(base),
        jobs: JobSettings {
            max_concurrent_jobs: 1,
            ..JobSettings::default()
        },
        dbt: DbtSettings {
            // Stand-in for the dbt CLI: echoes the arguments it was given.
            executable: "echo".to_string(),
            ..DbtSettings::default()
        },
        ..GovernorSettings::default()
    };
    Governor::new(settings, FakeConnector::default())
}

fn ids() -> (TenantId, ContentSetId) {
    (
        TenantId::new("Learner-9").expect("tenant"),
        ContentSetId::new("lesson2").expect("content set"),
    )
}

#[tokio::test]
async fn initializing_a_workspace_bootstraps_the_namespace() {
    let base = tempfile::tempdir().expect("tempdir");
    let governor = governor(base.path());
    let (tenant, lesson) = ids();

    let path = governor
        .initialize_workspace(&tenant, &lesson)
        .await
        .expect("initialize");

    assert!(path.join("profiles.yml").is_file());
    let namespaces = governor.pool().connector().namespaces.lock().expect("lock").clone();
    assert_eq!(namespaces, ["learner_learner_9"]);
}

#[tokio::test]
async fn queries_run_in_the_tenant_namespace() {
    let base = tempfile::tempdir().expect("tempdir");
    let governor = governor(base.path());
    let (tenant, _) = ids();

    let result = governor.run_query(&tenant, "select 1").await.expect("query");
    assert_eq!(result.row_count, 1);

    let err = governor.run_query(&tenant, "fail").await.expect_err("bad sql");
    assert!(matches!(err, GovernorError::Query(_)));
    assert!(!err.is_busy());

    let executed = governor.pool().connector().executed.lock().expect("lock").clone();
    assert!(executed.iter().all(|(ns, _)| ns == "learner_learner_9"));
}

#[cfg(unix)]
#[tokio::test]
async fn runs_execute_in_the_workspace_and_respect_admission() {
    let base = tempfile::tempdir().expect("tempdir");
    let governor = governor(base.path());
    let (tenant, lesson) = ids();

    let id = governor
        .start_run(&tenant, &lesson, Vec::new(), false, true)
        .await
        .expect("start run");
    let done = governor.wait_job(&tenant, id).await.expect("wait");
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.label, "dbt run");

    let output: Vec<OutputEvent> = governor
        .attach_output(&tenant, id)
        .expect("attach")
        .collect()
        .await;
    let workspace = base.path().join("workspaces/Learner-9/lesson2");
    let expected = format!(
        "run --full-refresh --profiles-dir {0} --project-dir {0}\n",
        workspace.display()
    );
    assert!(
        output
            .iter()
            .any(|event| matches!(event, OutputEvent::Chunk { text, .. } if **text == *expected)),
        "{output:?}"
    );

    assert_eq!(governor.list_jobs(&tenant).len(), 1);
    assert_eq!(governor.stats().jobs.finished, 1);
}

#[tokio::test]
async fn maintenance_pass_reports_every_component() {
    let base = tempfile::tempdir().expect("tempdir");
    let governor = governor(base.path());
    let (tenant, lesson) = ids();
    governor.initialize_workspace(&tenant, &lesson).await.expect("initialize");

    let report = governor.maintenance_pass().await.expect("maintenance");

    assert_eq!(report.workspaces.removed, 0);
    assert_eq!(report.jobs_reaped, 0);
    assert_eq!(report.connections_reaped, 0);
    assert_eq!(governor.stats().pool.idle, 1);
}

#[tokio::test(start_paused = true)]
async fn maintenance_loops_stop_on_shutdown() {
    let base = tempfile::tempdir().expect("tempdir");
    let governor = governor(base.path());
    let shutdown = CancellationToken::new();

    let handles = governor.spawn_maintenance(shutdown.clone());
    tokio::time::sleep(Duration::from_secs(120)).await;
    shutdown.cancel();

    for handle in handles {
        handle.await.expect("loop exits cleanly");
    }
}
