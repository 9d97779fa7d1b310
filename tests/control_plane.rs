//! Caller-facing flows through the control plane.

use std::sync::Arc;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{TimeDelta, Utc};
use rstest::{fixture, rstest};
use skiff::operations::{ExecTarget, FileTransfer, LocalDocker, StagingBucket};
use skiff::pipeline::DeploymentRequest;
use skiff::progress::{DEFAULT_RELAY_POLL, ProgressEvent, StreamOutcome};
use skiff::provider::ProviderError;
use skiff::service::{ControlPlane, ServiceError};
use skiff::test_support::{CommandOutcome, FakeCloud, ManualClock, ScriptedRunner};
use skiff::trust::{InMemorySessionStore, RoleRef, SessionError, SessionId, TrustSettings};
use tokio::sync::mpsc;

#[fixture]
fn cloud() -> FakeCloud {
    let cloud = FakeCloud::with_standard_images("us-east-1");
    cloud.add_registry_image("solver", "sha256:aaa", &["latest"], None);
    cloud
}

fn request() -> DeploymentRequest {
    DeploymentRequest::builder()
        .region("us-east-1")
        .account_id(FakeCloud::ACCOUNT)
        .repository("solver")
        .instance_type("c5.large")
        .build()
        .unwrap_or_else(|err| panic!("valid request: {err}"))
}

fn plane(cloud: &FakeCloud) -> ControlPlane<FakeCloud> {
    ControlPlane::new(cloud.clone(), TrustSettings::new("us-east-1"))
}

async fn verified<S: skiff::trust::SessionStore>(plane: &ControlPlane<FakeCloud, S>) -> SessionId {
    let (id, session) = plane
        .verify_trust(FakeCloud::ACCOUNT, &RoleRef::parse("SkiffDeployerRole"))
        .await
        .unwrap_or_else(|err| panic!("trust verified: {err}"));
    assert_eq!(session.account_id, FakeCloud::ACCOUNT);
    id
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn verified_session_deploys_with_buffered_logs(cloud: FakeCloud) {
    let plane = plane(&cloud);
    let id = verified(&plane).await;

    let report = plane
        .deploy(&id, &request())
        .await
        .unwrap_or_else(|err| panic!("deployment succeeds: {err}"));

    assert_eq!(cloud.launches().len(), 1);
    assert!(report.instance.id.starts_with("i-"));
    assert!(
        report
            .logs
            .last()
            .is_some_and(|line| line.starts_with("Deployment completed successfully"))
    );
}

#[rstest]
#[tokio::test]
async fn unknown_session_requires_authentication(cloud: FakeCloud) {
    let plane = plane(&cloud);

    let err = plane
        .deploy(&SessionId::generate(), &request())
        .await
        .expect_err("no session");

    assert!(matches!(
        err,
        ServiceError::Session(SessionError::AuthenticationRequired)
    ));
    assert!(cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn expired_session_requires_authentication(cloud: FakeCloud) {
    let clock = ManualClock::new(Utc::now());
    let plane = plane(&cloud).with_session_store(InMemorySessionStore::with_clock(clock.clone()));
    let id = verified(&plane).await;
    clock.advance(TimeDelta::hours(2));

    let err = plane
        .list_instances(&id)
        .await
        .expect_err("session expired");

    assert!(matches!(
        err,
        ServiceError::Session(SessionError::AuthenticationRequired)
    ));
    assert!(plane.sessions().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_verification_stores_nothing(cloud: FakeCloud) {
    cloud.push_assume_role(Err(ProviderError::new(
        "InvalidClientTokenId",
        "The security token included in the request is invalid",
    )));
    let plane = plane(&cloud);

    let err = plane
        .verify_trust(FakeCloud::ACCOUNT, &RoleRef::parse("SkiffDeployerRole"))
        .await
        .expect_err("bad credentials");

    assert!(matches!(err, ServiceError::Trust(_)));
    assert!(plane.sessions().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn streamed_deployment_ends_with_one_complete_event(cloud: FakeCloud) {
    let plane = plane(&cloud);
    let id = verified(&plane).await;

    let stream = plane
        .deploy_streaming(&id, request())
        .unwrap_or_else(|err| panic!("stream started: {err}"));
    let (tx, mut rx) = mpsc::channel(256);
    let outcome = stream.relay(&tx, DEFAULT_RELAY_POLL).await;
    drop(tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(matches!(outcome, StreamOutcome::Completed(_)));
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
    assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
    assert!(events.contains(&ProgressEvent::Milestone { percent: 100 }));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn streamed_failure_ends_with_error_event(cloud: FakeCloud) {
    cloud.on_command(
        "systemctl enable --now docker",
        CommandOutcome::fail("", "No match for argument: docker"),
    );
    let plane = plane(&cloud);
    let id = verified(&plane).await;

    let stream = plane
        .deploy_streaming(&id, request())
        .unwrap_or_else(|err| panic!("stream started: {err}"));
    let (tx, mut rx) = mpsc::channel(256);
    let outcome = stream.relay(&tx, DEFAULT_RELAY_POLL).await;
    drop(tx);
    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }

    let StreamOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("No match for argument"), "{message}");
    assert!(matches!(last, Some(ProgressEvent::Error { .. })));
    assert_eq!(cloud.terminations().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn operations_run_against_deployed_instance(cloud: FakeCloud) {
    cloud.on_command("docker exec skiff-solver", CommandOutcome::succeed("done\n"));
    let plane = plane(&cloud);
    let id = verified(&plane).await;
    let instance = plane
        .deploy(&id, &request())
        .await
        .unwrap_or_else(|err| panic!("deployment succeeds: {err}"))
        .instance;

    let output = plane
        .execute(
            &id,
            &instance.id,
            "cat status",
            &ExecTarget::Container(String::from("skiff-solver")),
        )
        .await
        .unwrap_or_else(|err| panic!("exec: {err}"));
    assert_eq!(output.stdout, "done\n");

    let listed = plane
        .list_instances(&id)
        .await
        .unwrap_or_else(|err| panic!("listing: {err}"));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name.as_deref(), Some("skiff-solver"));

    plane
        .terminate(&id, &instance.id)
        .await
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    let remaining = plane
        .list_instances(&id)
        .await
        .unwrap_or_else(|err| panic!("listing: {err}"));
    assert!(remaining.is_empty());

    let deleted = plane
        .clear_repository(&id, "solver")
        .await
        .unwrap_or_else(|err| panic!("clear: {err}"));
    assert_eq!(deleted, 1);
}

#[rstest]
#[tokio::test]
async fn ended_session_is_forgotten(cloud: FakeCloud) {
    let plane = plane(&cloud);
    let id = verified(&plane).await;

    plane.end_session(&id);

    assert_eq!(
        plane.session(&id).map(|_| ()),
        Err(SessionError::AuthenticationRequired)
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn files_travel_through_the_account_staging_bucket(cloud: FakeCloud) {
    let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));
    let dir = Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"));
    dir.write("input.csv", b"1,2,3\n")
        .unwrap_or_else(|err| panic!("write input: {err}"));
    cloud.serve_remote_file("/workspace/result.csv", b"6\n");
    let plane = plane(&cloud);
    let id = verified(&plane).await;
    let bucket = StagingBucket::for_account(FakeCloud::ACCOUNT, "us-east-1");

    let uploaded = plane
        .upload(
            &id,
            &FileTransfer {
                instance_id: String::from("i-1"),
                local_path: root.join("input.csv"),
                remote_path: String::from("/workspace/"),
                container: Some(String::from("skiff-solver")),
            },
        )
        .await
        .unwrap_or_else(|err| panic!("upload: {err}"));
    let downloaded = plane
        .download(
            &id,
            &FileTransfer {
                instance_id: String::from("i-1"),
                local_path: root.join("result.csv"),
                remote_path: String::from("/workspace/result.csv"),
                container: Some(String::from("skiff-solver")),
            },
        )
        .await
        .unwrap_or_else(|err| panic!("download: {err}"));

    assert_eq!(uploaded.destination, "/workspace/input.csv");
    assert_eq!(downloaded.bytes, 2);
    assert_eq!(
        dir.read_to_string("result.csv")
            .unwrap_or_else(|err| panic!("read result: {err}")),
        "6\n"
    );
    assert_eq!(bucket.name, "skiff-transfers-123456789012-us-east-1");
    assert_eq!(cloud.bucket_expiration(&bucket.name), Some(1));
    assert!(cloud.object_keys(&bucket.name).is_empty());
}

#[rstest]
#[tokio::test]
async fn image_archive_is_pushed_into_a_new_repository(cloud: FakeCloud) {
    let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));
    Dir::open_ambient_dir(&root, ambient_authority())
        .and_then(|dir| dir.write("trainer.tar", b"tar"))
        .unwrap_or_else(|err| panic!("write archive: {err}"));
    let runner = ScriptedRunner::new();
    runner.push_json("27.0.1\n");
    runner.push_json("Login Succeeded\n");
    runner.push_json("Loaded image: trainer:dev\n");
    runner.push_success();
    runner.push_json("v1: digest: sha256:bbb size: 525\n");
    let plane = plane(&cloud);
    let id = verified(&plane).await;

    let pushed = plane
        .push_image(
            &id,
            "trainer",
            &root.join("trainer.tar"),
            "v1",
            &LocalDocker::new("docker", Arc::new(runner.clone())),
        )
        .await
        .unwrap_or_else(|err| panic!("push: {err}"));

    assert!(cloud.has_repository("trainer"));
    assert!(pushed.image_uri.ends_with("/trainer:v1"));
    assert_eq!(pushed.source_image, "trainer:dev");
    assert_eq!(runner.invocations().len(), 5);
}
