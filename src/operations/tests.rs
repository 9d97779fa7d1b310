//! Unit tests for post-deployment operations.

use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::*;
use crate::provider::{IamInstanceProfileSpec, RunInstancesRequest, Tag, TagSpecification};
use crate::test_support::{CommandOutcome, FakeCloud};

#[fixture]
fn cloud() -> FakeCloud {
    FakeCloud::new("us-east-1")
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn container_commands_are_wrapped_and_escaped(cloud: FakeCloud) {
    cloud.on_command("docker exec", CommandOutcome::succeed("42\n"));

    let output = InstanceOperations::new(&cloud)
        .execute(
            "i-1",
            "cat result.txt | wc -l",
            &ExecTarget::Container(String::from("skiff-solver")),
        )
        .await
        .expect("command observed");

    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, "42\n");
    let script = cloud.dispatched().pop().expect("one command").script;
    assert_eq!(
        script,
        "docker exec skiff-solver sh -c 'cat result.txt | wc -l'"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failing_host_command_reports_exit_code(cloud: FakeCloud) {
    cloud.on_command("false", CommandOutcome::fail("partial\n", "boom\n"));

    let output = InstanceOperations::new(&cloud)
        .execute("i-1", "false", &ExecTarget::Host)
        .await
        .expect("failure is data");

    assert_eq!(output.exit_code, 1);
    assert_eq!(output.output, "partial\nboom\n");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn logs_come_with_running_status(cloud: FakeCloud) {
    cloud.on_command("docker logs", CommandOutcome::succeed("step 1\nstep 2\n"));
    cloud.on_command("docker ps -a", CommandOutcome::succeed("Up 5 minutes\n"));

    let logs = InstanceOperations::new(&cloud)
        .container_logs("i-1", "skiff-solver", 50)
        .await
        .expect("logs read");

    assert_eq!(logs.logs, "step 1\nstep 2\n");
    assert_eq!(logs.status, "Up 5 minutes");
    assert!(logs.is_running);
    let scripts: Vec<String> = cloud.dispatched().into_iter().map(|c| c.script).collect();
    assert_eq!(scripts[0], "docker logs --tail 50 skiff-solver 2>&1");
}

#[rstest]
#[case(CommandOutcome::fail("Error: No such container: skiff-solver\n", ""))]
#[case(CommandOutcome::succeed("Container not found\n"))]
#[tokio::test(start_paused = true)]
async fn missing_container_is_reported(cloud: FakeCloud, #[case] outcome: CommandOutcome) {
    cloud.on_command("docker logs", outcome);

    let err = InstanceOperations::new(&cloud)
        .container_logs("i-1", "skiff-solver", 10)
        .await
        .expect_err("no container");

    assert!(matches!(
        err,
        OperationError::ContainerNotFound { container } if container == "skiff-solver"
    ));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn exited_container_is_not_running(cloud: FakeCloud) {
    cloud.on_command("docker logs", CommandOutcome::succeed("done\n"));
    cloud.on_command(
        "docker ps -a",
        CommandOutcome::succeed("Exited (0) 2 minutes ago\n"),
    );

    let logs = InstanceOperations::new(&cloud)
        .container_logs("i-1", "skiff-solver", 10)
        .await
        .expect("logs read");

    assert!(!logs.is_running);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn files_are_listed_from_normalised_path(cloud: FakeCloud) {
    cloud.on_command(
        "ls -la",
        CommandOutcome::succeed(
            "total 8\n\
             drwxr-xr-x 2 root root 4096 Jan  5 10:00 .\n\
             -rw-r--r-- 1 root root  120 Jan  5 10:01 out.csv\n",
        ),
    );

    let entries = InstanceOperations::new(&cloud)
        .list_files("i-1", "workspace", Some("skiff-solver"))
        .await
        .expect("listing read");

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "/workspace/out.csv");
    let script = cloud.dispatched().pop().expect("one command").script;
    assert!(script.contains("docker exec skiff-solver ls -la /workspace"), "{script}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stopped_container_blocks_listing(cloud: FakeCloud) {
    cloud.on_command("ls -la", CommandOutcome::succeed("Container is stopped\n"));

    let err = InstanceOperations::new(&cloud)
        .list_files("i-1", "/workspace", Some("skiff-solver"))
        .await
        .expect_err("stopped");

    assert!(matches!(err, OperationError::ContainerStopped { .. }));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_host_listing_is_an_error(cloud: FakeCloud) {
    cloud.on_command(
        "ls -la",
        CommandOutcome::fail("", "ls: cannot access '/nope': No such file or directory\n"),
    );

    let err = InstanceOperations::new(&cloud)
        .list_files("i-1", "/nope", None)
        .await
        .expect_err("listing fails");

    assert!(err.to_string().contains("cannot access"), "{err}");
}

fn launch_request(tags: Vec<Tag>) -> RunInstancesRequest {
    RunInstancesRequest {
        image_id: String::from("ami-cpu-x86"),
        instance_type: String::from("c5.large"),
        min_count: 1,
        max_count: 1,
        iam_instance_profile: IamInstanceProfileSpec {
            name: String::from("skiff-instance-profile"),
        },
        security_groups: Vec::new(),
        security_group_ids: Vec::new(),
        subnet_id: None,
        placement: None,
        block_device_mappings: Vec::new(),
        user_data: None,
        tag_specifications: vec![TagSpecification {
            resource_type: String::from("instance"),
            tags,
        }],
    }
}

#[rstest]
#[tokio::test]
async fn listed_instances_are_managed_and_live(cloud: FakeCloud) {
    let managed = launch_request(vec![
        Tag::new("Name", "skiff-solver"),
        Tag::new(MANAGED_TAG_KEY, MANAGED_TAG_VALUE),
    ]);
    let kept = cloud.run_instance(&managed).await.expect("launch");
    let gone = cloud.run_instance(&managed).await.expect("launch");
    cloud.terminate_instance(&gone).await.expect("terminate");
    cloud
        .run_instance(&launch_request(vec![Tag::new("Name", "other")]))
        .await
        .expect("launch");

    let instances = InstanceOperations::new(&cloud)
        .list_instances()
        .await
        .expect("listing");

    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, kept);
    assert_eq!(instances[0].name.as_deref(), Some("skiff-solver"));
    assert_eq!(instances[0].state, "pending");
}

#[rstest]
#[tokio::test]
async fn terminate_issues_one_call(cloud: FakeCloud) {
    InstanceOperations::new(&cloud)
        .terminate("i-0abc")
        .await
        .expect_err("unknown instance");
    assert_eq!(cloud.terminations(), vec![String::from("i-0abc")]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn clearing_retries_manifest_list_references(cloud: FakeCloud) {
    cloud.add_registry_image("solver", "sha256:a", &["latest"], None);
    cloud.add_registry_image("solver", "sha256:b", &[], None);
    cloud.add_registry_image("solver", "sha256:c", &[], None);
    cloud.block_image_deletion("solver", "sha256:b", MANIFEST_LIST_REFERENCE, 2);
    let started = Instant::now();

    let deleted = InstanceOperations::new(&cloud)
        .clear_repository("solver")
        .await
        .expect("repository cleared");

    assert_eq!(deleted, 3);
    assert!(cloud.registry_digests("solver").is_empty());
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn references_that_never_clear_fail_after_five_rounds(cloud: FakeCloud) {
    cloud.add_registry_image("solver", "sha256:a", &[], None);
    cloud.block_image_deletion("solver", "sha256:a", MANIFEST_LIST_REFERENCE, 100);

    let err = InstanceOperations::new(&cloud)
        .clear_repository("solver")
        .await
        .expect_err("still referenced");

    assert!(matches!(err, OperationError::DeleteFailed { .. }));
    let rounds = cloud
        .calls()
        .iter()
        .filter(|call| *call == "batch_delete_images")
        .count();
    assert_eq!(rounds, 5);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn other_refusals_fail_immediately(cloud: FakeCloud) {
    cloud.add_registry_image("solver", "sha256:a", &[], None);
    cloud.block_image_deletion("solver", "sha256:a", "KmsException", 1);

    let err = InstanceOperations::new(&cloud)
        .clear_repository("solver")
        .await
        .expect_err("refused");

    assert!(err.to_string().contains("KmsException"), "{err}");
}

#[rstest]
#[tokio::test]
async fn unknown_repository_is_reported(cloud: FakeCloud) {
    let err = InstanceOperations::new(&cloud)
        .clear_repository("missing")
        .await
        .expect_err("no repository");

    assert!(matches!(
        err,
        OperationError::RepositoryNotFound { repository } if repository == "missing"
    ));
}

#[rstest]
#[tokio::test]
async fn empty_repository_clears_nothing(cloud: FakeCloud) {
    cloud.add_repository("solver");

    let deleted = InstanceOperations::new(&cloud)
        .clear_repository("solver")
        .await
        .expect("nothing to delete");

    assert_eq!(deleted, 0);
    assert!(cloud.mutations().is_empty());
}

#[rstest]
#[tokio::test]
async fn push_login_creates_missing_repository(cloud: FakeCloud) {
    let creds = InstanceOperations::new(&cloud)
        .prepare_push("solver")
        .await
        .expect("push prepared");

    assert!(cloud.has_repository("solver"));
    assert_eq!(cloud.mutations(), vec![String::from("create_repository")]);
    assert_eq!(creds.registry, "123456789012.dkr.ecr.us-east-1.amazonaws.com");
    assert_eq!(
        creds.image_uri,
        "123456789012.dkr.ecr.us-east-1.amazonaws.com/solver"
    );
    assert_eq!(creds.username, "AWS");
    assert_eq!(creds.password, "fake-registry-password");
    assert!(!format!("{creds:?}").contains("fake-registry-password"));
}

#[rstest]
#[tokio::test]
async fn push_login_reuses_existing_repository(cloud: FakeCloud) {
    cloud.add_repository("solver");

    let creds = InstanceOperations::new(&cloud)
        .prepare_push("solver")
        .await
        .expect("push prepared");

    assert_eq!(creds.repository, "solver");
    assert!(cloud.mutations().is_empty());
}

struct Workspace {
    _tmp: tempfile::TempDir,
    root: camino::Utf8PathBuf,
}

impl Workspace {
    fn dir(&self) -> cap_std::fs_utf8::Dir {
        cap_std::fs_utf8::Dir::open_ambient_dir(&self.root, cap_std::ambient_authority())
            .expect("open workspace")
    }
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
    Workspace { _tmp: tmp, root }
}

fn staging() -> StagingBucket {
    StagingBucket::for_account("123456789012", "us-east-1")
}

fn transfer(local: camino::Utf8PathBuf, remote: &str, container: Option<&str>) -> FileTransfer {
    FileTransfer {
        instance_id: String::from("i-1"),
        local_path: local,
        remote_path: remote.to_owned(),
        container: container.map(str::to_owned),
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn upload_creates_expiring_bucket_and_cleans_up(cloud: FakeCloud, workspace: Workspace) {
    workspace.dir().write("input.csv", b"a,b\n1,2\n").expect("write input");
    let bucket = staging();

    let receipt = InstanceOperations::new(&cloud)
        .upload(
            &bucket,
            &transfer(workspace.root.join("input.csv"), "/workspace/", Some("skiff-solver")),
        )
        .await
        .expect("upload succeeds");

    assert_eq!(receipt.destination, "/workspace/input.csv");
    assert_eq!(receipt.bytes, 8);
    assert!(cloud.has_bucket(&bucket.name));
    assert_eq!(cloud.bucket_expiration(&bucket.name), Some(STAGING_EXPIRY_DAYS));
    assert!(cloud.object_keys(&bucket.name).is_empty());
    assert_eq!(
        cloud.mutations(),
        vec![
            String::from("create_bucket"),
            String::from("put_expiration_rule"),
            String::from("put_object"),
            String::from("send_command"),
            String::from("delete_object"),
        ]
    );
    let script = cloud.dispatched().pop().expect("one command").script;
    assert!(script.contains("curl -fsS"));
    assert!(script.contains("X-Amz-Expires=3600"));
    assert!(script.contains("docker cp"));
    assert!(script.contains("'skiff-solver:/workspace/input.csv'"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn upload_reuses_existing_bucket(cloud: FakeCloud, workspace: Workspace) {
    workspace.dir().write("model.bin", b"weights").expect("write input");
    let bucket = staging();
    cloud.add_bucket(&bucket.name);

    let receipt = InstanceOperations::new(&cloud)
        .upload(&bucket, &transfer(workspace.root.join("model.bin"), "/opt/model.bin", None))
        .await
        .expect("upload succeeds");

    assert_eq!(receipt.destination, "/opt/model.bin");
    assert_eq!(cloud.position("create_bucket"), None);
    let script = cloud.dispatched().pop().expect("one command").script;
    assert!(!script.contains("docker"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_local_file_touches_nothing(cloud: FakeCloud, workspace: Workspace) {
    let err = InstanceOperations::new(&cloud)
        .upload(&staging(), &transfer(workspace.root.join("absent.csv"), "/tmp/", None))
        .await
        .expect_err("nothing to upload");

    assert!(matches!(err, OperationError::LocalFileNotFound { .. }));
    assert!(cloud.mutations().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn upload_into_missing_container_still_discards_object(
    cloud: FakeCloud,
    workspace: Workspace,
) {
    workspace.dir().write("input.csv", b"x").expect("write input");
    cloud.on_command("curl", CommandOutcome::fail("", "Container not found: ghost\n"));
    let bucket = staging();

    let err = InstanceOperations::new(&cloud)
        .upload(&bucket, &transfer(workspace.root.join("input.csv"), "/tmp/", Some("ghost")))
        .await
        .expect_err("container is missing");

    assert!(matches!(
        err,
        OperationError::ContainerNotFound { ref container } if container == "ghost"
    ));
    assert!(cloud.position("delete_object").is_some());
    assert!(cloud.object_keys(&bucket.name).is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn download_into_directory_keeps_remote_name(cloud: FakeCloud, workspace: Workspace) {
    cloud.serve_remote_file("/workspace/result.txt", b"42\n");
    let bucket = staging();

    let receipt = InstanceOperations::new(&cloud)
        .download(
            &bucket,
            &transfer(workspace.root.clone(), "/workspace/result.txt", Some("skiff-solver")),
        )
        .await
        .expect("download succeeds");

    assert_eq!(receipt.destination, workspace.root.join("result.txt").as_str());
    assert_eq!(receipt.bytes, 3);
    assert_eq!(
        workspace.dir().read_to_string("result.txt").expect("downloaded file"),
        "42\n"
    );
    assert!(cloud.object_keys(&bucket.name).is_empty());
    let script = cloud.dispatched().pop().expect("one command").script;
    assert!(script.contains("'skiff-solver:/workspace/result.txt'"));
    assert!(script.contains("aws s3 cp"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_remote_file_is_reported(cloud: FakeCloud, workspace: Workspace) {
    cloud.on_command("aws s3 cp", CommandOutcome::fail("", "No such file: /tmp/none.txt\n"));

    let err = InstanceOperations::new(&cloud)
        .download(&staging(), &transfer(workspace.root.join("none.txt"), "/tmp/none.txt", None))
        .await
        .expect_err("remote file is missing");

    assert!(matches!(
        err,
        OperationError::RemoteFileNotFound { ref path } if path == "/tmp/none.txt"
    ));
    assert!(cloud.position("delete_object").is_some());
}

#[rstest]
#[case("/")]
#[case("/workspace/..")]
#[tokio::test(start_paused = true)]
async fn download_rejects_paths_without_file_name(
    cloud: FakeCloud,
    workspace: Workspace,
    #[case] remote: &str,
) {
    let err = InstanceOperations::new(&cloud)
        .download(&staging(), &transfer(workspace.root.clone(), remote, None))
        .await
        .expect_err("no file name");

    assert!(matches!(err, OperationError::InvalidRemotePath { .. }));
    assert!(cloud.mutations().is_empty());
}
