use std::time::Duration;

use crate::cli::CliError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a tracked process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after the polite signal.
    Graceful,
    /// Had to be killed after the grace period.
    Killed,
    /// Was already gone before any signal was sent.
    AlreadyExited,
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn raw_pid(pid: u32) -> Option<libc::pid_t> {
    // 0 and negative values address process groups, never a single process.
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Some(raw) = raw_pid(pid) else {
        return false;
    };
    let result = unsafe { libc::kill(raw, 0) };
    let exists = if result == 0 {
        true
    } else {
        matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(code) if code == libc::EPERM
        )
    };
    exists && !is_zombie(pid)
}

/// An exited but unreaped child still answers `kill(pid, 0)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) {
            Ok(h) => h,
            Err(_) => return false,
        };
        let mut exit_code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut exit_code).is_ok();
        let _ = CloseHandle(handle);
        ok && exit_code == 259
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// SIGTERM, wait up to `grace` for the process to go away, then SIGKILL.
#[cfg(unix)]
pub fn terminate_process(pid: u32, grace: Duration) -> Result<Termination, CliError> {
    let Some(raw) = raw_pid(pid) else {
        return Ok(Termination::AlreadyExited);
    };
    if !is_process_running(pid) {
        return Ok(Termination::AlreadyExited);
    }

    tracing::info!(pid, "sending SIGTERM");
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(Termination::AlreadyExited);
        }
        return Err(CliError::Io(err));
    }

    if wait_for_exit(pid, grace) {
        return Ok(Termination::Graceful);
    }

    tracing::warn!(pid, grace_ms = grace.as_millis(), "process did not stop gracefully, sending SIGKILL");
    unsafe {
        libc::kill(raw, libc::SIGKILL);
    }
    wait_for_exit(pid, POLL_INTERVAL * 10);
    Ok(Termination::Killed)
}

#[cfg(windows)]
pub fn terminate_process(pid: u32, grace: Duration) -> Result<Termination, CliError> {
    if !is_process_running(pid) {
        return Ok(Termination::AlreadyExited);
    }
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
    wait_for_exit(pid, grace);
    Ok(Termination::Killed)
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let attempts = (timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1);
    for _ in 0..attempts {
        if !is_process_running(pid) {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    !is_process_running(pid)
}
