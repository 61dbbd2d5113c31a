// Process-group signalling and parent-death wiring for spawned children.
// Every child we start leads its own process group, so signalling the group
// reaches anything the shell forked.

// Highest signal number on the platforms we build for.
const MAX_SIGNAL: libc::c_int = 64;

/// Sends `signal` to the process group led by `pid`.
///
/// The group id equals the leader's pid. It stays addressable after the
/// leader is reaped only while another member is alive, so callers must not
/// signal a group once they know it is empty. Errors are returned to the
/// caller; most callers ignore them because the group may already be gone.
pub(crate) fn signal_process_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if pgid <= 1 {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    if unsafe { libc::killpg(pgid, signal) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Sets a death signal for the child process so it receives SIGTERM when the
/// parent exits. Runs between fork and exec.
#[cfg(target_os = "linux")]
pub(crate) fn set_parent_death(parent_pid: libc::pid_t) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        // The parent already died between fork and prctl.
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_parent_death(_parent_pid: libc::pid_t) {}

/// Recovers the signal number from the `strsignal(3)` text a pty child
/// reports for a signal death (`"Killed"`, or `"Signal 42"` when libc has
/// no description).
pub(crate) fn signal_from_description(description: &str) -> Option<libc::c_int> {
    if let Some(number) = description.strip_prefix("Signal ") {
        return number.trim().parse().ok();
    }
    (1..=MAX_SIGNAL).find(|&signal| {
        let name = unsafe { libc::strsignal(signal) };
        !name.is_null() && unsafe { std::ffi::CStr::from_ptr(name) }.to_bytes() == description.as_bytes()
    })
}
