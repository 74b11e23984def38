//! Process liveness probe backing every staleness check.

/// Return true iff the process exists and is not a zombie.
///
/// Any error other than "no such process" conservatively counts as alive so
/// transient failures never evict live agents.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    // A reaped-but-unwaited child still answers kill(0); treat it as gone.
    #[cfg(target_os = "linux")]
    if is_zombie(pid) {
        return false;
    }

    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Read the state field from `/proc/<pid>/stat`. The command name can
/// contain spaces and parentheses, so the state is the first token after
/// the last ')'.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let Some(pos) = stat.rfind(')') else {
        return false;
    };
    stat[pos + 1..].trim_start().starts_with('Z')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_dead() {
        assert!(!is_alive(0));
    }

    #[test]
    fn exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn running_child_is_alive() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();
        assert!(is_alive(pid));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
