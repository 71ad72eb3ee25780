use crate::{
    errors::RuntimeError,
    runtime::{pty, ContainerId, Runtime, Shell},
};
use async_trait::async_trait;
use sandterm_protocol::TerminalSize;
use std::process::Stdio;
use tokio::{process::Command, task};

/// Image used when none is configured
pub const DEFAULT_IMAGE: &str = "webenv-sandbox";

/// Container runtime that drives the `docker` command line tool
///
/// Every container is started with no network, a read-only root filesystem,
/// RAM-backed `/tmp` and `/root`, all capabilities dropped, and CPU, memory
/// and process-count ceilings. The container itself only runs `sleep
/// infinity`; terminals are separate `docker exec` processes.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    program: String,
    image: String,
    cpus: String,
    memory: String,
    pids_limit: u32,
    scratch_size: String,
    shell: String,
}

/// Setup for a [DockerRuntime], starting at [DockerRuntime::builder()]
#[derive(Debug, Clone)]
pub struct DockerRuntimeBuilder {
    runtime: DockerRuntime,
}

impl DockerRuntimeBuilder {
    /// Path or name of the docker executable
    pub fn program<S: Into<String>>(mut self, program: S) -> Self {
        self.runtime.program = program.into();
        self
    }

    /// Image the sandbox containers are created from
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.runtime.image = image.into();
        self
    }

    /// CPU ceiling, in docker's `--cpus` format
    pub fn cpus<S: Into<String>>(mut self, cpus: S) -> Self {
        self.runtime.cpus = cpus.into();
        self
    }

    /// Memory ceiling, in docker's `--memory` format
    pub fn memory<S: Into<String>>(mut self, memory: S) -> Self {
        self.runtime.memory = memory.into();
        self
    }

    /// Maximum number of processes inside one container
    pub fn pids_limit(mut self, limit: u32) -> Self {
        self.runtime.pids_limit = limit;
        self
    }

    /// Size of each RAM-backed scratch directory, like `64m`
    pub fn scratch_size<S: Into<String>>(mut self, size: S) -> Self {
        self.runtime.scratch_size = size.into();
        self
    }

    /// Shell executed for each terminal
    pub fn shell<S: Into<String>>(mut self, shell: S) -> Self {
        self.runtime.shell = shell.into();
        self
    }

    pub fn build(self) -> DockerRuntime {
        self.runtime
    }
}

impl DockerRuntime {
    /// A runtime with the default hardening profile and the given image
    pub fn new<S: Into<String>>(image: S) -> Self {
        DockerRuntime::builder().image(image).build()
    }

    pub fn builder() -> DockerRuntimeBuilder {
        DockerRuntimeBuilder {
            runtime: DockerRuntime {
                program: "docker".to_string(),
                image: DEFAULT_IMAGE.to_string(),
                cpus: "0.5".to_string(),
                memory: "256m".to_string(),
                pids_limit: 128,
                scratch_size: "64m".to_string(),
                shell: "/bin/bash".to_string(),
            },
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments for `docker` that create one sandbox container
    pub fn run_args(&self) -> Vec<String> {
        let scratch = |dir: &str| format!("{}:rw,exec,nosuid,size={}", dir, self.scratch_size);
        vec![
            "run".to_string(),
            "-d".to_string(),
            "--network=none".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            "--cap-drop=ALL".to_string(),
            format!("--cpus={}", self.cpus),
            format!("--memory={}", self.memory),
            format!("--pids-limit={}", self.pids_limit),
            "--log-driver=none".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            scratch("/tmp"),
            "--tmpfs".to_string(),
            scratch("/root"),
            self.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]
    }

    /// Arguments for `docker` that attach an interactive shell
    pub fn exec_args(&self, id: &ContainerId) -> Vec<String> {
        vec![
            "exec".to_string(),
            "-it".to_string(),
            id.to_string(),
            self.shell.clone(),
        ]
    }

    async fn docker(&self, args: &[String]) -> Result<String, RuntimeError> {
        log::trace!("{} {:?}", self.program, args);
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn already_gone(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::CommandFailed { stderr, .. } => stderr.contains("No such container"),
        _ => false,
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create(&self) -> Result<ContainerId, RuntimeError> {
        let stdout = self.docker(&self.run_args()).await?;
        match stdout.lines().last().map(str::trim) {
            Some(id) if !id.is_empty() => {
                log::info!("created sandbox container {}", id);
                Ok(ContainerId::new(id))
            }
            _ => Err(RuntimeError::MissingContainerId),
        }
    }

    async fn destroy(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let args = ["rm".to_string(), "-f".to_string(), id.to_string()];
        match self.docker(&args).await {
            Ok(_) => {
                log::info!("removed sandbox container {}", id);
                Ok(())
            }
            Err(err) if already_gone(&err) => {
                log::debug!("sandbox container {} was already gone", id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn exec(&self, id: &ContainerId, size: TerminalSize) -> Result<Shell, RuntimeError> {
        let program = self.program.clone();
        let args = self.exec_args(id);
        log::debug!("exec {} {:?} at {}", program, args, size);
        task::spawn_blocking(move || pty::spawn(&program, &args, size)).await?
    }
}
