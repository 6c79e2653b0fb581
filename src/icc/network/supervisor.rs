use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::process::Child;
use tracing::debug;

use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::utils::{CommandExecutor, ProcessUtils};

/// How long `stop` waits after SIGTERM before escalating.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch a helper process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdout_log: Option<PathBuf>,
    pub stderr_log: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub apparmor_profile: Option<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    /// Program and arguments actually exec'd, with the AppArmor wrapper applied.
    pub fn command_line(&self) -> (String, Vec<String>) {
        match &self.apparmor_profile {
            Some(profile) => {
                let mut args = vec!["-p".to_string(), profile.clone(), "--".to_string(), self.program.clone()];
                args.extend(self.args.iter().cloned());
                ("aa-exec".to_string(), args)
            }
            None => (self.program.clone(), self.args.clone()),
        }
    }
}

/// A running (or previously running) helper process.
#[derive(Debug)]
pub struct Subprocess {
    pid: i32,
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

/// Outcome of a bounded wait on a freshly spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Still running when the deadline passed.
    Running,
    Exited(Option<i32>),
}

impl Subprocess {
    pub fn new(pid: i32, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            pid,
            program: program.into(),
            args,
            child: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether `argv` of a live process belongs to this subprocess. Programs
    /// launched through `aa-exec` are matched on the wrapped program.
    pub fn matches_cmdline(&self, argv: &[String]) -> bool {
        let Some(first) = argv.first() else {
            return false;
        };
        let running = base_name(first);
        if running == base_name(&self.program) {
            return true;
        }
        if base_name(&self.program) != "aa-exec" {
            return false;
        }
        self.args
            .iter()
            .skip_while(|arg| arg.as_str() != "--")
            .nth(1)
            .map_or(false, |wrapped| base_name(wrapped) == running)
    }

    /// Write the PID file: the PID, then the program and each argument on its own line.
    pub async fn save(&self, path: &Path) -> NetworkResult<()> {
        let mut content = format!("{}\n{}\n", self.pid, self.program);
        for arg in &self.args {
            content.push_str(arg);
            content.push('\n');
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed writing PID file {}", path.display()))
    }

    /// Re-attach to a process from its PID file.
    pub async fn import(path: &Path) -> NetworkResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Could not read pid file {}", path.display()))?;
        parse_pid_file(&content)
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parse_pid_file(content: &str) -> NetworkResult<Subprocess> {
    let mut lines = content.lines();
    let pid = lines
        .next()
        .and_then(|l| l.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| NetworkError::Subprocess("Invalid PID file".to_string()))?;
    let program = lines.next().unwrap_or_default().to_string();
    let args = lines.map(String::from).collect();
    Ok(Subprocess::new(pid, program, args))
}

/// Spawns, waits on and stops helper processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, spec: &ProcessSpec) -> NetworkResult<Subprocess>;

    /// Wait up to `deadline` for the process to exit.
    async fn wait(&self, process: &mut Subprocess, deadline: Duration) -> WaitOutcome;

    /// Terminate the process. Returns false if it was not running.
    async fn stop(&self, process: &mut Subprocess) -> NetworkResult<bool>;

    fn is_available(&self, program: &str) -> bool;

    /// Output of `<program> --version`.
    async fn version(&self, program: &str) -> NetworkResult<String>;
}

/// Runs real processes with tokio.
#[derive(Debug, Default)]
pub struct SystemProcessRunner;

fn open_log(path: &Option<PathBuf>) -> NetworkResult<Stdio> {
    match path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed opening log file {}", path.display()))?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn spawn(&self, spec: &ProcessSpec) -> NetworkResult<Subprocess> {
        let (program, args) = spec.command_line();

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(open_log(&spec.stdout_log)?)
            .stderr(open_log(&spec.stderr_log)?);
        if let Some(uid) = spec.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }

        let child = cmd.spawn().map_err(|e| {
            NetworkError::Subprocess(format!("Failed to run: {} {}: {}", program, args.join(" "), e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| NetworkError::Subprocess(format!("{} exited before reporting a PID", program)))?;

        debug!(program = %program, pid, "Spawned subprocess");
        Ok(Subprocess {
            pid: pid as i32,
            program,
            args,
            child: Some(child),
        })
    }

    async fn wait(&self, process: &mut Subprocess, deadline: Duration) -> WaitOutcome {
        match process.child.as_mut() {
            Some(child) => match tokio::time::timeout(deadline, child.wait()).await {
                Err(_) => WaitOutcome::Running,
                Ok(Ok(status)) => WaitOutcome::Exited(status.code()),
                Ok(Err(_)) => WaitOutcome::Exited(None),
            },
            None => {
                tokio::time::sleep(deadline).await;
                if ProcessUtils::is_process_running(process.pid) {
                    WaitOutcome::Running
                } else {
                    WaitOutcome::Exited(None)
                }
            }
        }
    }

    async fn stop(&self, process: &mut Subprocess) -> NetworkResult<bool> {
        if let Some(child) = process.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(false);
            }
            let _ = ProcessUtils::send_signal(process.pid, Signal::SIGTERM);
            if tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
                child.kill().await?;
            }
            return Ok(true);
        }

        // The PID may have been reused since the file was written
        match ProcessUtils::cmdline(process.pid) {
            Some(argv) if process.matches_cmdline(&argv) => {}
            Some(argv) => {
                debug!(
                    pid = process.pid,
                    expected = %process.program,
                    found = %argv.first().map(String::as_str).unwrap_or(""),
                    "PID now belongs to another process"
                );
                return Ok(false);
            }
            None => return Ok(false),
        }

        ProcessUtils::terminate_process(process.pid, STOP_TIMEOUT)
            .await
            .map_err(NetworkError::Subprocess)
    }

    fn is_available(&self, program: &str) -> bool {
        CommandExecutor::is_command_available(program)
    }

    async fn version(&self, program: &str) -> NetworkResult<String> {
        CommandExecutor::run(program, &["--version"]).await
    }
}

/// Persist a freshly spawned process. On failure the process is killed before the error is returned.
pub async fn save_or_kill(
    runner: &dyn ProcessRunner,
    process: &mut Subprocess,
    pid_path: &Path,
) -> NetworkResult<()> {
    if let Err(e) = process.save(pid_path).await {
        if let Err(kill_err) = runner.stop(process).await {
            return Err(NetworkError::Subprocess(format!(
                "Could not kill subprocess while handling saving error: {}: {}",
                e, kill_err
            )));
        }
        return Err(NetworkError::Subprocess(format!(
            "Failed to save subprocess details: {}",
            e
        )));
    }
    Ok(())
}

/// Stop the process recorded in `pid_path`, if any. A process that is already gone is fine.
pub async fn kill_from_pid_file(runner: &dyn ProcessRunner, pid_path: &Path) -> NetworkResult<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let mut process = Subprocess::import(pid_path).await?;
    match runner.stop(&mut process).await {
        Ok(running) => {
            if !running {
                debug!(pid = process.pid(), "Subprocess already stopped");
            }
            Ok(())
        }
        Err(e) => Err(NetworkError::Subprocess(format!(
            "Unable to kill {}: {}",
            process.program(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_apparmor_wrapper() {
        let mut spec = ProcessSpec::new("dnsmasq", vec!["--keep-in-foreground".to_string()]);
        assert_eq!(spec.command_line().0, "dnsmasq");

        spec.apparmor_profile = Some("quilt_dnsmasq-br0".to_string());
        let (program, args) = spec.command_line();
        assert_eq!(program, "aa-exec");
        assert_eq!(args, vec!["-p", "quilt_dnsmasq-br0", "--", "dnsmasq", "--keep-in-foreground"]);
    }

    #[tokio::test]
    async fn test_save_and_import() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dnsmasq.pid");

        let process = Subprocess::new(4242, "dnsmasq", vec!["--strict-order".to_string(), "-s".to_string()]);
        process.save(&path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("4242\n"));

        let imported = Subprocess::import(&path).await.unwrap();
        assert_eq!(imported.pid(), 4242);
        assert_eq!(imported.program(), "dnsmasq");
        assert_eq!(imported.args(), &["--strict-order", "-s"]);
    }

    #[test]
    fn test_invalid_pid_file() {
        assert!(parse_pid_file("").is_err());
        assert!(parse_pid_file("abc\n").is_err());
        assert!(parse_pid_file("-1\n").is_err());
    }

    #[tokio::test]
    async fn test_spawn_wait_stop() {
        let runner = SystemProcessRunner;
        let mut process = runner
            .spawn(&ProcessSpec::new("sleep", vec!["30".to_string()]))
            .await
            .unwrap();

        let outcome = runner.wait(&mut process, Duration::from_millis(100)).await;
        assert_eq!(outcome, WaitOutcome::Running);
        assert!(runner.stop(&mut process).await.unwrap());
        assert!(!runner.stop(&mut process).await.unwrap());
    }

    #[tokio::test]
    async fn test_early_exit_observed() {
        let runner = SystemProcessRunner;
        let mut process = runner
            .spawn(&ProcessSpec::new("false", Vec::new()))
            .await
            .unwrap();
        let outcome = runner.wait(&mut process, Duration::from_millis(500)).await;
        assert_eq!(outcome, WaitOutcome::Exited(Some(1)));
    }

    #[tokio::test]
    async fn test_save_failure_kills_process() {
        let runner = SystemProcessRunner;
        let mut process = runner
            .spawn(&ProcessSpec::new("sleep", vec!["30".to_string()]))
            .await
            .unwrap();
        let pid = process.pid();

        let err = save_or_kill(&runner, &mut process, Path::new("/nonexistent/dir/x.pid"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to save subprocess details"));
        assert!(!ProcessUtils::is_process_running(pid));
    }

    #[tokio::test]
    async fn test_kill_missing_pid_file() {
        let dir = tempdir().unwrap();
        kill_from_pid_file(&SystemProcessRunner, &dir.path().join("forkdns.pid"))
            .await
            .unwrap();
    }

    #[test]
    fn test_matches_cmdline() {
        let argv = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();

        let dnsmasq = Subprocess::new(10, "dnsmasq", vec!["--keep-in-foreground".to_string()]);
        assert!(dnsmasq.matches_cmdline(&argv(&["dnsmasq", "--keep-in-foreground"])));
        assert!(dnsmasq.matches_cmdline(&argv(&["/usr/sbin/dnsmasq"])));
        assert!(!dnsmasq.matches_cmdline(&argv(&["sleep", "30"])));
        assert!(!dnsmasq.matches_cmdline(&[]));

        let forkdns = Subprocess::new(11, "/usr/bin/quilt-netd", vec!["forkdns".to_string()]);
        assert!(forkdns.matches_cmdline(&argv(&["/usr/bin/quilt-netd", "forkdns"])));

        let wrapped = Subprocess::new(
            12,
            "aa-exec",
            argv(&["-p", "quilt_dnsmasq-br0", "--", "dnsmasq", "--strict-order"]),
        );
        assert!(wrapped.matches_cmdline(&argv(&["dnsmasq", "--strict-order"])));
        assert!(!wrapped.matches_cmdline(&argv(&["sleep"])));
    }

    #[tokio::test]
    async fn test_kill_leaves_reused_pid_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dnsmasq.pid");

        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        Subprocess::new(pid, "dnsmasq", vec!["--keep-in-foreground".to_string()])
            .save(&path)
            .await
            .unwrap();

        kill_from_pid_file(&SystemProcessRunner, &path).await.unwrap();
        assert!(child.try_wait().unwrap().is_none());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_from_pid_file_stops_recorded_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dnsmasq.pid");

        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        Subprocess::new(pid, "sleep", vec!["30".to_string()])
            .save(&path)
            .await
            .unwrap();

        let reaper = tokio::spawn(async move { child.wait().await });
        kill_from_pid_file(&SystemProcessRunner, &path).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), reaper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
