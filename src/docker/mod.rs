mod error;
mod gate;

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::env::Environment;

pub use error::DockerError;
pub use gate::MutationGate;

pub const MIN_DOCKER_MAJOR: u64 = 24;

/// Image for the detached helper container that recreates this service
/// during a self-update. The running container cannot `up -d` itself; the
/// helper outlives it and finishes the job.
const TRAMPOLINE_IMAGE: &str = "docker:cli";

/// Dropped from every pull/up cycle alongside our own service.
const LEGACY_UPDATER: &str = "watchtower";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Docker version (\d+)\.(\d+)\.(\d+)").expect("static regex")
    })
}

/// Driver for the container-runtime CLI. All mutating operations serialize
/// behind the [`MutationGate`].
#[derive(Clone)]
pub struct DockerClient {
    env: Arc<Environment>,
    gate: MutationGate,
}

impl DockerClient {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            gate: MutationGate::new(),
        }
    }

    pub fn gate(&self) -> &MutationGate {
        &self.gate
    }

    /// Raw invocation of the runtime CLI from the compose directory.
    /// Returns captured stdout and stderr; a non-empty stderr is logged but
    /// left to the caller to judge.
    pub async fn run(&self, args: &[String]) -> Result<(String, String), DockerError> {
        let command = format!("docker {}", args.join(" "));
        debug!(%command, "running");

        let output = Command::new("docker")
            .args(args)
            .current_dir(&self.env.compose_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| DockerError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            debug!(%command, %stderr, "runtime stderr");
        }
        if !output.status.success() {
            return Err(DockerError::Failed { command, stderr });
        }
        Ok((stdout, stderr))
    }

    async fn run_compose(&self, args: &[&str]) -> Result<(String, String), DockerError> {
        let mut full = self.env.compose_base_args();
        full.extend(args.iter().map(|a| a.to_string()));
        self.run(&full).await
    }

    /// Probes `docker -v` and enforces the minimum supported major version.
    /// Holds the gate for the duration of the probe.
    pub async fn version(&self) -> Result<(u64, u64, u64), DockerError> {
        let _permit = self.gate.acquire().await;

        let output = Command::new("docker")
            .arg("-v")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => DockerError::RuntimeMissing,
                _ => DockerError::Spawn {
                    command: "docker -v".to_string(),
                    source,
                },
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let first_line = stdout.lines().next().unwrap_or_default();
        let version = parse_version(first_line)
            .ok_or_else(|| DockerError::RuntimeUnparseable(first_line.to_string()))?;
        if version.0 < MIN_DOCKER_MAJOR {
            return Err(DockerError::RuntimeTooOld(version.0, version.1, version.2));
        }
        Ok(version)
    }

    /// Services defined in the compose project.
    pub async fn configured_services(&self) -> Result<Vec<String>, DockerError> {
        let (stdout, _) = self.run_compose(&["config", "--services"]).await?;
        Ok(service_lines(&stdout))
    }

    /// Services with a container, optionally restricted to running ones.
    pub async fn started_services(&self, running_only: bool) -> Result<Vec<String>, DockerError> {
        let mut args = vec!["ps", "--services"];
        if running_only {
            args.extend(["--status", "running"]);
        }
        let (stdout, _) = self.run_compose(&args).await?;
        Ok(service_lines(&stdout))
    }

    /// Pulls and recreates every configured service except this one, then
    /// optionally prunes dangling images and hands a self-update over to the
    /// trampoline container.
    pub async fn pull_and_update(
        &self,
        self_update: bool,
        skip_pull: bool,
    ) -> Result<(), DockerError> {
        let services: Vec<String> = self
            .configured_services()
            .await?
            .into_iter()
            .filter(|name| name != &self.env.service_name && name != LEGACY_UPDATER)
            .collect();

        let _permit = self.gate.acquire().await;

        if !skip_pull {
            let mut args = vec!["pull"];
            args.extend(services.iter().map(String::as_str));
            if let Err(err) = self.run_compose(&args).await {
                error!(%err, "pull failed");
            }
        }

        let mut args = vec!["up", "-d"];
        args.extend(services.iter().map(String::as_str));
        args.push("--remove-orphans");
        if let Err(err) = self.run_compose(&args).await {
            error!(%err, "up failed");
        }

        if !self.env.skip_image_prune {
            // give the runtime a moment to release replaced images
            sleep(Duration::from_secs(1)).await;
            if let Err(err) = self
                .run(&image_prune_args().map(str::to_string).to_vec())
                .await
            {
                error!(%err, "image prune failed");
            }
        }

        if self_update {
            info!(service = %self.env.service_name, "self-update requested");
            if let Err(err) = self.run_compose(&["pull", &self.env.service_name]).await {
                error!(%err, "pull of own image failed");
            }
            if let Err(err) = self.spawn_trampoline().await {
                error!(%err, "failed to launch self-update container");
            }
        }

        Ok(())
    }

    pub async fn image_prune(&self) -> Result<(), DockerError> {
        let _permit = self.gate.acquire().await;
        self.run(&image_prune_args().map(str::to_string).to_vec())
            .await?;
        Ok(())
    }

    /// Launches the detached helper that recreates this service from outside.
    async fn spawn_trampoline(&self) -> Result<(), DockerError> {
        let compose_dir = self.env.compose_dir.display().to_string();
        let mount_compose = format!("{compose_dir}:{compose_dir}");
        let mount_socket = format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}");

        let mut args: Vec<String> = Vec::new();
        for arg in [
            "run",
            "-d",
            "--rm",
            "-v",
            mount_compose.as_str(),
            "-v",
            mount_socket.as_str(),
            "-w",
            compose_dir.as_str(),
            TRAMPOLINE_IMAGE,
            "docker",
        ] {
            args.push(arg.to_string());
        }
        args.extend(self.env.compose_base_args());
        args.push("up".to_string());
        args.push("-d".to_string());
        args.push(self.env.service_name.clone());

        self.run(&args).await?;
        Ok(())
    }
}

fn image_prune_args() -> [&'static str; 4] {
    ["image", "prune", "-a", "-f"]
}

fn parse_version(line: &str) -> Option<(u64, u64, u64)> {
    let caps = version_re().captures(line)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    let patch = caps.get(3)?.as_str().parse().ok()?;
    Some((major, minor, patch))
}

fn service_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("Docker version 27.3.1, build ce12230", Some((27, 3, 1)))]
    #[case("Docker version 24.0.0", Some((24, 0, 0)))]
    #[case("Docker version 24.0", None)]
    #[case("podman version 4.9.3", None)]
    #[case("", None)]
    fn version_parsing(#[case] line: &str, #[case] expected: Option<(u64, u64, u64)>) {
        assert_eq!(parse_version(line), expected);
    }

    #[test]
    fn service_lines_skip_blanks() {
        let out = "ping-probe\n\n  \nrapp\n";
        assert_eq!(service_lines(out), vec!["ping-probe", "rapp"]);
    }
}
