//! Local and remote (ssh) command execution.

use log::{debug, warn};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Ssh;
use crate::error::{BerthError, ConfigError};

/// Stderr lines ssh prints on every call that carry no information.
const STDERR_NOISE: &[&str] = &["unable to resolve host"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{} {} failed (exit status {}): {}", .cmd, .args.join(" "), status_text(.status), .output)]
pub struct CmdError {
    pub cmd: String,
    pub args: Vec<String>,
    pub output: String,
    pub status: Option<i32>,
}

fn status_text(status: &Option<i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

/// Runs a program to completion.
pub trait CommandExecutor: Send + Sync + 'static + Clone {
    fn execute(
        &self,
        name: &str,
        args: &[String],
    ) -> impl Future<Output = std::io::Result<CommandOutput>> + Send;
}

/// Spawns real processes. Dropping the returned future kills the child.
#[derive(Clone, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    async fn execute(&self, name: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(name)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status.code(),
        })
    }
}

pub trait FileReader: Send + Sync {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;
}

#[derive(Clone, Default)]
pub struct LocalFs;

impl FileReader for LocalFs {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// Drops known-noise lines, keeping the remaining lines verbatim.
pub fn filter_stderr(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .split_inclusive('\n')
        .filter(|line| !STDERR_NOISE.iter().any(|noise| line.contains(noise)))
        .collect()
}

/// Builds and runs commands against container addresses over ssh.
#[derive(Clone)]
pub struct RemoteExec<E: CommandExecutor> {
    executor: E,
    fs: Arc<dyn FileReader>,
    ssh: Ssh,
}

impl<E: CommandExecutor> RemoteExec<E> {
    pub fn new(executor: E, fs: Arc<dyn FileReader>, ssh: Ssh) -> Self {
        Self { executor, fs, ssh }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Commands that authorize our public key inside a container and start
    /// its ssh daemon.
    pub fn provision_commands(&self) -> Result<Vec<String>, BerthError> {
        let path = self.ssh.public_key_path();
        let key = self
            .fs
            .read_to_string(&path)
            .map_err(|source| ConfigError::KeyNotFound {
                path: path.clone(),
                source,
            })?;
        let add_key = self
            .ssh
            .add_key_cmd
            .as_deref()
            .ok_or(ConfigError::MissingAddKeyCommand)?;
        Ok(vec![
            format!("{add_key} {}", key.trim_end()),
            format!("{} -D", self.ssh.sshd_path()),
        ])
    }

    /// `<address> -l <user> -o "StrictHostKeyChecking no" [-i <key>] -- <command...>`
    pub fn ssh_args(&self, address: &str, command: &[&str]) -> Result<Vec<String>, ConfigError> {
        let user = self
            .ssh
            .user
            .as_deref()
            .ok_or(ConfigError::NoUserConfigured)?;
        let mut args = vec![
            address.to_string(),
            "-l".to_string(),
            user.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking no".to_string(),
        ];
        if let Some(key) = &self.ssh.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("--".to_string());
        args.extend(command.iter().map(|c| c.to_string()));
        Ok(args)
    }

    /// Runs `command` on `address`. Stderr is noise-filtered before being
    /// written out or returned as the error detail.
    pub async fn ssh(
        &self,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        address: &str,
        command: &[&str],
    ) -> Result<(), BerthError> {
        let args = self.ssh_args(address, command)?;
        debug!("ssh {}", args.join(" "));
        let output = self.executor.execute("ssh", &args).await?;
        let filtered = filter_stderr(&output.stderr);
        stderr.write_all(filtered.as_bytes())?;
        if !output.success() {
            return Err(CmdError {
                cmd: "ssh".to_string(),
                args,
                output: filtered,
                status: output.status,
            }
            .into());
        }
        stdout.write_all(&output.stdout)?;
        Ok(())
    }

    /// Runs a local command, returning its stdout.
    pub async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>, BerthError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.executor.execute(cmd, &args).await?;
        if !output.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(CmdError {
                cmd: cmd.to_string(),
                args,
                output: String::from_utf8_lossy(&combined).into_owned(),
                status: output.status,
            }
            .into());
        }
        Ok(output.stdout)
    }

    /// Forgets the host key recorded for `address`. Failures are logged only.
    pub async fn revoke_key(&self, address: &str) {
        if address.is_empty() {
            return;
        }
        if let Err(e) = self.run_cmd("ssh-keygen", &["-R", address]).await {
            warn!("failed to revoke ssh key of {address}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryFs, RecordingExecutor};
    use std::path::PathBuf;

    fn ssh_config() -> Ssh {
        Ssh {
            user: Some("ubuntu".to_string()),
            add_key_cmd: Some("/var/lib/tsuru/add-key".to_string()),
            ..Default::default()
        }
    }

    fn remote(executor: RecordingExecutor, fs: MemoryFs, ssh: Ssh) -> RemoteExec<RecordingExecutor> {
        RemoteExec::new(executor, Arc::new(fs), ssh)
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_provision_commands_with_configured_key() {
        let fs = MemoryFs::default().with_file("/opt/me/id_dsa.pub", "ssh-rsa ohwait! me@machine");
        let ssh = Ssh {
            public_key: Some(PathBuf::from("/opt/me/id_dsa.pub")),
            ..ssh_config()
        };
        let commands = remote(RecordingExecutor::default(), fs, ssh)
            .provision_commands()
            .unwrap();
        assert_eq!(
            commands,
            vec![
                "/var/lib/tsuru/add-key ssh-rsa ohwait! me@machine".to_string(),
                "/usr/sbin/sshd -D".to_string(),
            ]
        );
    }

    #[test]
    fn test_provision_commands_default_key_file() {
        let home = std::env::var("HOME").unwrap_or_default();
        let fs = MemoryFs::default().with_file(
            Path::new(&home).join(".ssh").join("id_rsa.pub"),
            "ssh-rsa ohwait! me@machine\n",
        );
        let commands = remote(RecordingExecutor::default(), fs, ssh_config())
            .provision_commands()
            .unwrap();
        assert_eq!(commands[0], "/var/lib/tsuru/add-key ssh-rsa ohwait! me@machine");
    }

    #[test]
    fn test_provision_commands_custom_sshd_path() {
        let fs = MemoryFs::default().with_file("/opt/me/id_dsa.pub", "ssh-rsa key");
        let ssh = Ssh {
            public_key: Some(PathBuf::from("/opt/me/id_dsa.pub")),
            sshd_path: Some("/usr/local/sbin/sshd".to_string()),
            ..ssh_config()
        };
        let commands = remote(RecordingExecutor::default(), fs, ssh)
            .provision_commands()
            .unwrap();
        assert_eq!(commands[1], "/usr/local/sbin/sshd -D");
    }

    #[test]
    fn test_provision_commands_key_not_found() {
        let err = remote(RecordingExecutor::default(), MemoryFs::default(), ssh_config())
            .provision_commands()
            .unwrap_err();
        match err {
            BerthError::Configuration(ConfigError::KeyNotFound { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_provision_commands_missing_add_key_command() {
        let fs = MemoryFs::default().with_file("/opt/me/id_dsa.pub", "ssh-rsa key");
        let ssh = Ssh {
            public_key: Some(PathBuf::from("/opt/me/id_dsa.pub")),
            add_key_cmd: None,
            ..ssh_config()
        };
        let err = remote(RecordingExecutor::default(), fs, ssh)
            .provision_commands()
            .unwrap_err();
        assert!(matches!(
            err,
            BerthError::Configuration(ConfigError::MissingAddKeyCommand)
        ));
    }

    #[tokio::test]
    async fn test_ssh() {
        let executor = RecordingExecutor::default().with_output(". ..");
        let exec = remote(executor.clone(), MemoryFs::default(), ssh_config());
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());

        exec.ssh(&mut stdout, &mut stderr, "10.10.10.10", &["ls", "-a"])
            .await
            .unwrap();

        assert_eq!(stdout, b". ..");
        assert!(executor.executed(
            "ssh",
            &strings(&[
                "10.10.10.10",
                "-l",
                "ubuntu",
                "-o",
                "StrictHostKeyChecking no",
                "--",
                "ls",
                "-a",
            ])
        ));
    }

    #[tokio::test]
    async fn test_ssh_with_private_key() {
        let executor = RecordingExecutor::default().with_output(". ..");
        let ssh = Ssh {
            private_key: Some(PathBuf::from("/opt/me/id_dsa")),
            ..ssh_config()
        };
        let exec = remote(executor.clone(), MemoryFs::default(), ssh);
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());

        exec.ssh(&mut stdout, &mut stderr, "10.10.10.13", &["ls", "-a"])
            .await
            .unwrap();

        assert!(executor.executed(
            "ssh",
            &strings(&[
                "10.10.10.13",
                "-l",
                "ubuntu",
                "-o",
                "StrictHostKeyChecking no",
                "-i",
                "/opt/me/id_dsa",
                "--",
                "ls",
                "-a",
            ])
        ));
    }

    #[tokio::test]
    async fn test_ssh_without_user_configured() {
        let executor = RecordingExecutor::default();
        let ssh = Ssh {
            user: None,
            ..ssh_config()
        };
        let exec = remote(executor.clone(), MemoryFs::default(), ssh);
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        let err = exec
            .ssh(&mut stdout, &mut stderr, "127.0.0.1", &["ls", "-a"])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BerthError::Configuration(ConfigError::NoUserConfigured)
        ));
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_ssh_command_failure() {
        let executor = RecordingExecutor::default().failing("failed");
        let exec = remote(executor, MemoryFs::default(), ssh_config());
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        let err = exec
            .ssh(&mut stdout, &mut stderr, "10.10.10.10", &["ls", "-a"])
            .await
            .unwrap_err();
        assert!(stdout.is_empty());
        assert_eq!(stderr, b"failed");
        match err {
            BerthError::RemoteExec(e) => {
                assert_eq!(e.cmd, "ssh");
                assert_eq!(e.output, "failed");
                assert_eq!(e.status, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ssh_filters_stderr() {
        let executor =
            RecordingExecutor::default().failing("failed\nunable to resolve host abcdef");
        let exec = remote(executor, MemoryFs::default(), ssh_config());
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        let err = exec
            .ssh(&mut stdout, &mut stderr, "10.10.10.10", &["ls", "-a"])
            .await
            .unwrap_err();
        assert!(stdout.is_empty());
        assert_eq!(stderr, b"failed\n");
        assert!(matches!(err, BerthError::RemoteExec(e) if e.output == "failed\n"));
    }

    #[tokio::test]
    async fn test_run_cmd_error() {
        let executor = RecordingExecutor::default().failing("f1 f2 f3");
        let exec = remote(executor, MemoryFs::default(), ssh_config());
        let err = exec.run_cmd("ls", &["-a"]).await.unwrap_err();
        match err {
            BerthError::RemoteExec(e) => {
                assert_eq!(e.cmd, "ls");
                assert_eq!(e.args, vec!["-a".to_string()]);
                assert_eq!(e.output, "f1 f2 f3");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_revoke_key_swallows_failure() {
        let executor = RecordingExecutor::default().failing("no such host");
        let exec = remote(executor.clone(), MemoryFs::default(), ssh_config());
        exec.revoke_key("10.10.10.10").await;
        assert!(executor.executed("ssh-keygen", &strings(&["-R", "10.10.10.10"])));
    }

    #[test]
    fn test_filter_stderr_keeps_other_lines() {
        assert_eq!(
            filter_stderr(b"a\nsudo: unable to resolve host x\nb\n"),
            "a\nb\n"
        );
        assert_eq!(filter_stderr(b""), "");
    }
}
