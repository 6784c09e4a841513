use anyhow::{Result, anyhow};
use genapply_core::SandboxConfig;
use genapply_policy::{CommandPolicy, PolicyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0) && !self.timed_out
    }
}

/// Runs one program with arguments, without a shell.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], cwd: &Path, timeout: Duration)
    -> Result<CommandOutput>;
}

#[derive(Debug, Default)]
pub struct PlatformCommandRunner;

impl CommandRunner for PlatformCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut child = spawn_program(program, args, cwd)?;

        let status = child.wait_timeout(timeout)?;
        let timed_out = status.is_none();
        if timed_out {
            child.kill()?;
        }
        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out,
        })
    }
}

fn spawn_program(program: &str, args: &[String], cwd: &Path) -> Result<Child> {
    let mut errors = Vec::new();
    for candidate in candidate_programs(program) {
        let mut command = Command::new(&candidate);
        command
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{candidate}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn '{program}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

#[cfg(target_os = "windows")]
fn candidate_programs(program: &str) -> Vec<String> {
    vec![format!("{program}.cmd"), format!("{program}.exe"), program.to_string()]
}

#[cfg(not(target_os = "windows"))]
fn candidate_programs(program: &str) -> Vec<String> {
    vec![program.to_string()]
}

#[derive(Debug)]
pub enum SandboxError {
    /// No sandbox session is active for this server.
    Inactive,
    NotAllowed(PolicyError),
    Failed(anyhow::Error),
}

/// The command-execution session exposed over `/api/run-command`.
#[derive(Clone)]
pub struct SandboxSession {
    active: bool,
    root: PathBuf,
    policy: CommandPolicy,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SandboxSession {
    pub fn new(root: PathBuf, cfg: &SandboxConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            active: cfg.enabled,
            root,
            policy: CommandPolicy::new(cfg),
            runner,
            timeout: Duration::from_secs(cfg.timeout_seconds),
        }
    }

    pub fn run(&self, cmd: &str, args: &[String]) -> Result<CommandOutput, SandboxError> {
        if !self.active {
            return Err(SandboxError::Inactive);
        }
        let line = std::iter::once(cmd)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.policy
            .check_command(&line)
            .map_err(SandboxError::NotAllowed)?;
        tracing::info!(command = %line, "sandbox command");
        self.runner
            .run(cmd, args, &self.root, self.timeout)
            .map_err(SandboxError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(enabled: bool) -> SandboxSession {
        let cfg = SandboxConfig {
            enabled,
            ..SandboxConfig::default()
        };
        SandboxSession::new(PathBuf::from("."), &cfg, Arc::new(PlatformCommandRunner))
    }

    #[test]
    fn inactive_session_runs_nothing() {
        let err = session(false).run("ls", &[]).expect_err("inactive");
        assert!(matches!(err, SandboxError::Inactive));
    }

    #[test]
    fn arguments_count_against_the_allowlist() {
        let err = session(true)
            .run("npm", &["publish".to_string()])
            .expect_err("not allowlisted");
        assert!(matches!(err, SandboxError::NotAllowed(PolicyError::CommandNotAllowed)));
        let err = session(true)
            .run("ls", &["; rm -rf /".to_string()])
            .expect_err("metacharacters");
        assert!(matches!(err, SandboxError::NotAllowed(_)));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn platform_runner_captures_output() {
        let out = PlatformCommandRunner
            .run(
                "sh",
                &["-c".to_string(), "echo genapply; exit 3".to_string()],
                Path::new("."),
                Duration::from_secs(5),
            )
            .expect("run");
        assert_eq!(out.status, Some(3));
        assert!(out.stdout.contains("genapply"));
        assert!(!out.success());
    }
}
