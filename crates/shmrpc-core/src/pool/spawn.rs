//! Starting worker processes.

use crate::config::EndpointOptions;
use crate::error::{Result, ShmRpcError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Everything a worker needs to start serving, passed as one JSON argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub port: u16,
    pub name: String,
    /// Spawn sequence number within the manager's lifetime.
    pub generation: u64,
    #[serde(default)]
    pub options: EndpointOptions,
}

impl WorkerSpec {
    pub fn new(port: u16, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
            generation: 0,
            options: EndpointOptions::default(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ShmRpcError::Config {
            field: "worker spec".to_string(),
            message: e.to_string(),
        })
    }
}

/// Strategy used by the manager to launch a worker.
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker for `spec` and return its PID.
    fn spawn(&self, spec: &WorkerSpec) -> Result<u32>;
}

/// Launch `program args... <spec-json>`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    env: HashMap<String, String>,
    log_file: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            log_file: None,
        }
    }

    /// Re-run the current executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append worker stdout/stderr to a file instead of inheriting them.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> Result<u32> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(spec.to_json()?);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());

        if let Some(ref log_file) = self.log_file {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent).ok();
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .map_err(|e| ShmRpcError::Io {
                    message: format!("open worker log {}", log_file.display()),
                    source: Some(e),
                })?;
            let stdout_file = file.try_clone()?;
            cmd.stdout(Stdio::from(stdout_file));
            cmd.stderr(Stdio::from(file));
        }

        debug!("Spawning worker: {:?}", cmd);
        let child = cmd.spawn().map_err(|e| ShmRpcError::Io {
            message: format!("spawn worker {}", self.program.display()),
            source: Some(e),
        })?;

        // The child handle is dropped; the manager reaps by PID.
        let pid = child.id();
        info!(
            "Spawned worker {} for {} on port {} (generation {})",
            pid, spec.name, spec.port, spec.generation
        );
        Ok(pid)
    }
}
