//! [`ContainerRuntime`] backed by the `docker` command line client.

use std::{
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use shipwright_core::{
    runtime::{image_ref, ContainerRuntime},
    RegistryAuth, RunOutput,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct DockerCli {
    docker_bin: String,
    run_timeout: Duration,
    pull_inactivity: Duration,
}

impl DockerCli {
    pub fn new(run_timeout: Duration, pull_inactivity: Duration) -> Self {
        Self {
            docker_bin: "docker".to_string(),
            run_timeout,
            pull_inactivity,
        }
    }

    pub fn with_binary(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    /// `docker version` succeeds, i.e. the daemon is reachable.
    pub async fn available(&self) -> bool {
        Command::new(&self.docker_bin)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn login(&self, auth: &RegistryAuth) -> Result<()> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["login", "--username", &auth.username, "--password-stdin"]);
        if !auth.server_address.is_empty() {
            cmd.arg(&auth.server_address);
        }
        let mut child = cmd
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker login")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(auth.password.as_bytes())
                .await
                .context("failed to pass registry password")?;
        }
        let out = child.wait_with_output().await.context("docker login")?;
        if !out.status.success() {
            bail!(
                "registry login failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        debug!(user = %auth.username, registry = %auth.server_address, "registry login ok");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str, tag: &str, auth: &RegistryAuth) -> Result<String> {
        if !auth.is_anonymous() {
            self.login(auth).await?;
        }
        let reference = image_ref(image, tag);
        info!(image = %reference, "pulling image");

        let mut child = Command::new(&self.docker_bin)
            .args(["pull", &reference])
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker pull")?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut lines = Vec::new();
        let mut errors = Vec::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        // A pull that goes quiet for too long is abandoned; a slow but
        // progressing one is not.
        while !(stdout_done && stderr_done) {
            let next = async {
                tokio::select! {
                    line = stdout_reader.next_line(), if !stdout_done => (true, line),
                    line = stderr_reader.next_line(), if !stderr_done => (false, line),
                }
            };
            let (is_stdout, line) = match tokio::time::timeout(self.pull_inactivity, next).await {
                Ok(v) => v,
                Err(_) => bail!(
                    "docker pull of {reference} made no progress for {}s",
                    self.pull_inactivity.as_secs()
                ),
            };
            match (is_stdout, line.context("error reading docker pull output")?) {
                (true, Some(l)) => lines.push(l),
                (false, Some(l)) => errors.push(l),
                (true, None) => stdout_done = true,
                (false, None) => stderr_done = true,
            }
        }

        let status = child.wait().await.context("failed to wait for docker pull")?;
        if !status.success() {
            let msg = if errors.is_empty() { lines.join("\n") } else { errors.join("\n") };
            bail!("{}", msg.trim());
        }
        Ok(last_status_line(&lines).to_string())
    }

    async fn run(&self, image: &str, tag: &str, args: &[String], env: &[String]) -> Result<RunOutput> {
        let name = format!(
            "shipwright-{}-{}",
            std::process::id(),
            RUN_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let argv = run_args(&name, &image_ref(image, tag), args, env);
        debug!(container = %name, ?args, "docker run");

        let child = Command::new(&self.docker_bin)
            .args(&argv)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker run")?;

        let out = match tokio::time::timeout(self.run_timeout, child.wait_with_output()).await {
            Ok(out) => out.context("failed to wait for docker run")?,
            Err(_elapsed) => {
                warn!(container = %name, timeout_s = self.run_timeout.as_secs(), "container timed out");
                let _ = Command::new(&self.docker_bin)
                    .args(["rm", "-f", &name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                bail!("container timed out after {}s", self.run_timeout.as_secs());
            }
        };

        let mut output = out.stdout;
        output.extend_from_slice(&out.stderr);
        Ok(RunOutput {
            exit_code: out.status.code().map(i64::from).unwrap_or(-1),
            output,
        })
    }
}

/// `docker run` argv for a throwaway container.
pub fn run_args(name: &str, image: &str, args: &[String], env: &[String]) -> Vec<String> {
    let mut argv = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    for e in env {
        argv.push("-e".to_string());
        argv.push(e.clone());
    }
    argv.push(image.to_string());
    argv.extend_from_slice(args);
    argv
}

/// The `Status: ...` summary a pull ends with, or the last non-empty line.
pub fn last_status_line(lines: &[String]) -> &str {
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("Status:"))
        .or_else(|| lines.iter().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_args_put_env_before_image() {
        let argv = run_args(
            "shipwright-1-0",
            "ops/devops:latest",
            &strings(&["ansible-playbook", "site.yml"]),
            &strings(&["ANSIBLE_STDOUT_CALLBACK=json"]),
        );
        assert_eq!(
            argv,
            strings(&[
                "run",
                "--rm",
                "--name",
                "shipwright-1-0",
                "-e",
                "ANSIBLE_STDOUT_CALLBACK=json",
                "ops/devops:latest",
                "ansible-playbook",
                "site.yml",
            ])
        );
    }

    #[test]
    fn status_line_is_found_before_digest() {
        let lines = strings(&[
            "latest: Pulling from ops/devops",
            "Digest: sha256:abc",
            "Status: Image is up to date for ops/devops:latest",
            "docker.io/ops/devops:latest",
        ]);
        assert_eq!(
            last_status_line(&lines),
            "Status: Image is up to date for ops/devops:latest"
        );
    }

    #[test]
    fn status_line_falls_back_to_last_line() {
        let lines = strings(&["something odd", "  ", ""]);
        assert_eq!(last_status_line(&lines), "something odd");
        assert_eq!(last_status_line(&[]), "");
    }

    #[tokio::test]
    async fn missing_binary_fails_cleanly() {
        let docker = DockerCli::new(Duration::from_secs(1), Duration::from_secs(1))
            .with_binary("/nonexistent/docker");
        assert!(!docker.available().await);
        let err = docker
            .run("img", "latest", &[], &[])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn docker run"));
    }
}
