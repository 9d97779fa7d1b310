//! Shell script builders for commands sent through the command channel.
//!
//! Every interpolated value is escaped with `shell_escape`. Scripts that
//! create state remove any previous copy first so they can be re-run.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Directory on the host mounted into the workload container.
pub const HOST_WORKSPACE_DIR: &str = "/home/ec2-user/simulations";

/// Mount point of [`HOST_WORKSPACE_DIR`] inside the container.
pub const CONTAINER_WORKSPACE_DIR: &str = "/workspace";

/// Marker printed when a container-scoped command finds the container down.
pub const CONTAINER_STOPPED_MARKER: &str = "Container is stopped";

fn quoted(value: &str) -> Cow<'_, str> {
    escape(value.into())
}

/// Trivial command used to test command-channel reachability.
#[must_use]
pub const fn readiness_probe() -> &'static str {
    "echo ready"
}

/// Installs and starts the container runtime.
#[must_use]
pub fn install_runtime(gpu: bool) -> String {
    let mut script = String::from(
        "set -e
if command -v docker >/dev/null 2>&1; then
  echo \"Container runtime already present\"
elif command -v dnf >/dev/null 2>&1; then
  dnf install -y docker
elif command -v yum >/dev/null 2>&1; then
  yum install -y docker
else
  apt-get update -y
  DEBIAN_FRONTEND=noninteractive apt-get install -y docker.io
fi
systemctl enable --now docker
usermod -aG docker ec2-user 2>/dev/null || true
",
    );
    if gpu {
        script.push_str(
            "if command -v nvidia-ctk >/dev/null 2>&1; then
  nvidia-ctk runtime configure --runtime=docker
  systemctl restart docker
fi
",
        );
    }
    script.push_str("docker --version\n");
    script
}

/// Writes the region into the instance's provider CLI configuration.
#[must_use]
pub fn configure_credentials(region: &str) -> String {
    let config_body = format!("[default]\nregion = {region}\noutput = json\n");
    let config = quoted(&config_body);
    format!(
        "set -e
for dir in /root/.aws /home/ec2-user/.aws; do
  mkdir -p \"$dir\"
  printf '%s' {config} > \"$dir/config\"
done
chown -R ec2-user:ec2-user /home/ec2-user/.aws 2>/dev/null || true
aws sts get-caller-identity --region {region_arg} --output text --query Arn
",
        region_arg = quoted(region),
    )
}

/// Parameters for starting the workload container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkloadLaunch<'a> {
    /// Registry host (`<account>.dkr.ecr.<region>.amazonaws.com`).
    pub registry_host: &'a str,
    /// Region of the registry.
    pub region: &'a str,
    /// Fully qualified image reference.
    pub image_uri: &'a str,
    /// Container name.
    pub container_name: &'a str,
    /// Expose GPUs to the container.
    pub gpu: bool,
}

/// Logs in to the registry, pulls the image and (re)starts the container.
#[must_use]
pub fn pull_and_start(launch: &WorkloadLaunch<'_>) -> String {
    let name = quoted(launch.container_name);
    let image = quoted(launch.image_uri);
    let gpus = if launch.gpu { " --gpus all" } else { "" };
    format!(
        "set -e
aws ecr get-login-password --region {region} | docker login --username AWS --password-stdin {host}
docker pull {image}
docker rm -f {name} >/dev/null 2>&1 || true
mkdir -p {host_dir}
docker run -d --name {name} --restart unless-stopped{gpus} -v {host_dir}:{container_dir} {image}
docker ps --filter {filter} --format '{{{{.Status}}}}'
",
        region = quoted(launch.region),
        host = quoted(launch.registry_host),
        host_dir = HOST_WORKSPACE_DIR,
        container_dir = CONTAINER_WORKSPACE_DIR,
        filter = quoted(&format!("name=^{}$", launch.container_name)),
    )
}

/// Runs `command` inside the named container.
#[must_use]
pub fn exec_in_container(container_name: &str, command: &str) -> String {
    format!(
        "docker exec {} sh -c {}",
        quoted(container_name),
        quoted(command)
    )
}

/// Prints the last `tail` log lines of the named container.
#[must_use]
pub fn container_logs(container_name: &str, tail: u32) -> String {
    format!("docker logs --tail {tail} {} 2>&1", quoted(container_name))
}

/// Prints the status column of the named container, if it exists.
#[must_use]
pub fn container_status(container_name: &str) -> String {
    format!(
        "docker ps -a --filter {} --format '{{{{.Status}}}}'",
        quoted(&format!("name=^{container_name}$"))
    )
}

/// Lists a directory on the host or inside a running container.
#[must_use]
pub fn list_directory(path: &str, container_name: Option<&str>) -> String {
    let target = quoted(path);
    match container_name {
        None => format!("ls -la {target}"),
        Some(container) => {
            let name = quoted(container);
            let pattern = format!("name=^{container}$");
            let filter = quoted(&pattern);
            format!(
                "if docker ps --filter {filter} --format '{{{{.Names}}}}' | grep -q .; then
  docker exec {name} ls -la {target}
else
  echo {marker}
fi
",
                marker = quoted(CONTAINER_STOPPED_MARKER),
            )
        }
    }
}

/// Host directory under which container transfers are staged.
pub const HOST_TRANSFER_DIR: &str = "/tmp/skiff-transfers";

/// Fails the script with a "Container not found" line unless the named
/// container exists.
fn require_container(container: &str) -> String {
    format!(
        "if ! docker ps -a --filter {filter} --format '{{{{.Names}}}}' | grep -q .; then
  echo {missing} >&2
  exit 1
fi
",
        filter = quoted(&format!("name=^{container}$")),
        missing = quoted(&format!("Container not found: {container}")),
    )
}

/// Fetches `url` into `destination` on the host, or inside `container`.
///
/// Container targets are staged under [`HOST_TRANSFER_DIR`] and removed
/// whether or not the copy succeeds.
#[must_use]
pub fn fetch_from_url(
    url: &str,
    destination: &str,
    container: Option<&str>,
    transfer_id: &str,
) -> String {
    let url_arg = quoted(url);
    let dest = quoted(destination);
    match container {
        None => format!(
            "set -e
mkdir -p \"$(dirname {dest})\"
curl -fsS -o {dest} {url_arg}
"
        ),
        Some(name) => {
            let stage_dir = format!("{HOST_TRANSFER_DIR}/{transfer_id}");
            let staged = format!("{stage_dir}/payload");
            format!(
                "set -e
{check}trap 'rm -rf {stage_dir}' EXIT
mkdir -p {stage_dir}
curl -fsS -o {staged_arg} {url_arg}
docker cp {staged_arg} {target}
",
                check = require_container(name),
                staged_arg = quoted(&staged),
                target = quoted(&format!("{name}:{destination}")),
            )
        }
    }
}

/// Copies `source` from the host, or from inside `container`, to the
/// storage location `target` (`s3://bucket/key`).
#[must_use]
pub fn push_to_storage(
    source: &str,
    target: &str,
    region: &str,
    container: Option<&str>,
    transfer_id: &str,
) -> String {
    let copy = |path: &str| {
        format!(
            "aws s3 cp {} {} --region {} --only-show-errors\n",
            quoted(path),
            quoted(target),
            quoted(region)
        )
    };
    match container {
        None => format!(
            "set -e
if [ ! -f {src} ]; then
  echo {missing} >&2
  exit 1
fi
{copy}",
            src = quoted(source),
            missing = quoted(&format!("No such file: {source}")),
            copy = copy(source),
        ),
        Some(name) => {
            let stage_dir = format!("{HOST_TRANSFER_DIR}/{transfer_id}");
            let staged = format!("{stage_dir}/payload");
            format!(
                "set -e
{check}trap 'rm -rf {stage_dir}' EXIT
mkdir -p {stage_dir}
docker cp {from} {staged_arg}
{copy}",
                check = require_container(name),
                from = quoted(&format!("{name}:{source}")),
                staged_arg = quoted(&staged),
                copy = copy(&staged),
            )
        }
    }
}

/// Derives the workload container name from a repository name.
#[must_use]
pub fn container_name(repository: &str) -> String {
    let slug = slugify(repository);
    if slug.is_empty() {
        return String::from("skiff-workload");
    }
    format!("skiff-{slug}")
}

/// Lower-cases `value` and collapses runs of other characters into `-`.
#[must_use]
pub fn slugify(value: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_owned()
}
