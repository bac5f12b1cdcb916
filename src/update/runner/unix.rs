use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use super::schedule;
use crate::update::error::LaunchError;

/// Start the script in a transient systemd unit.
#[cfg(target_os = "linux")]
pub(super) fn schedule_task(task: &str, script: &Path) -> Result<(), LaunchError> {
    let user = !nix::unistd::getuid().is_root();

    // fails when no unit by that name is loaded
    if let Err(e) = schedule::systemctl_reset_failed(task, user).run() {
        log::debug!("reset-failed for {task}: {e}");
    }

    schedule::systemd_run(task, script, user).run()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(super) fn schedule_task(_task: &str, _script: &Path) -> Result<(), LaunchError> {
    Err(LaunchError::Unsupported("scheduled_task"))
}

/// `/bin/sh <script>` as the leader of a new session with no stdio.
///
/// A reaper thread collects the exit status if this process is still alive
/// when the script finishes.
pub(super) fn spawn_detached(script: &Path) -> Result<u32, LaunchError> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir("/");

    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: "/bin/sh".to_string(),
        source,
    })?;
    let pid = child.id();

    let reaper = thread::Builder::new()
        .name("update-script-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => log::debug!("update script {pid} exited with {status}"),
            Err(e) => log::debug!("failed to wait for update script {pid}: {e}"),
        });
    if let Err(e) = reaper {
        log::warn!("Failed to start reaper for update script {pid}: {e}");
    }

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Pid, getsid};
    use std::fs;
    use std::time::{Duration, Instant};

    #[test]
    fn detached_script_leads_its_own_session() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = dir.path().join("detached.sh");
        fs::write(
            &script,
            format!("echo $$ > '{}.tmp'\nmv '{0}.tmp' '{0}'\nsleep 2\n", pid_file.display()),
        )
        .unwrap();

        let pid = spawn_detached(&script).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pid_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let reported: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert_eq!(reported as u32, pid);

        let child_session = getsid(Some(Pid::from_raw(reported))).unwrap();
        assert_eq!(child_session, Pid::from_raw(reported));
        assert_ne!(child_session, getsid(None).unwrap());
    }
}
