use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;

use crate::error::{NetworkError, NetworkResult};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a program and fail with `NetworkError::Command` on a non-zero exit.
    pub async fn run(program: &str, args: &[&str]) -> NetworkResult<String> {
        let result = Self::execute(program, args).await?;
        if !result.success {
            return Err(NetworkError::Command {
                cmd: format!("{} {}", program, args.join(" ")),
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result.stdout)
    }

    pub async fn execute(program: &str, args: &[&str]) -> NetworkResult<CommandResult> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Run a program feeding `input` on stdin, as `nft -f -` expects.
    pub async fn run_with_stdin(program: &str, args: &[&str], input: &str) -> NetworkResult<()> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NetworkError::Command {
                cmd: format!("{} {}", program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Search `PATH` for an executable.
    pub fn find_in_path(command: &str) -> Option<std::path::PathBuf> {
        if command.contains('/') {
            let path = Path::new(command);
            return path.is_file().then(|| path.to_path_buf());
        }

        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|candidate| candidate.is_file())
    }

    pub fn is_command_available(command: &str) -> bool {
        Self::find_in_path(command).is_some()
    }
}
