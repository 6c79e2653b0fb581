use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

pub struct ProcessUtils;

impl ProcessUtils {
    /// Check if a process is still running
    pub fn is_process_running(pid: i32) -> bool {
        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            // Exists but owned by someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Arguments of a live process, None when it is gone or unreadable.
    pub fn cmdline(pid: i32) -> Option<Vec<String>> {
        let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
        Some(
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        )
    }

    pub fn send_signal(pid: i32, sig: Signal) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(pid), sig)
    }

    /// SIGTERM, poll for exit up to `timeout`, then SIGKILL.
    /// Returns false when the process was already gone.
    pub async fn terminate_process(pid: i32, timeout: Duration) -> Result<bool, String> {
        if !Self::is_process_running(pid) {
            return Ok(false);
        }

        match Self::send_signal(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(false),
            Err(e) => return Err(format!("Failed to send SIGTERM to process {}: {}", pid, e)),
        }

        let step = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while waited < timeout {
            tokio::time::sleep(step).await;
            waited += step;
            if !Self::is_process_running(pid) {
                return Ok(true);
            }
        }

        match Self::send_signal(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(format!("Failed to send SIGKILL to process {}: {}", pid, e)),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        if Self::is_process_running(pid) {
            return Err(format!("Process {} refused to die even after SIGKILL", pid));
        }
        Ok(true)
    }
}
