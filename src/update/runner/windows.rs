use std::path::Path;

use super::schedule;
use crate::update::error::LaunchError;

/// Register and start a one-shot SYSTEM task for the script.
pub(super) fn schedule_task(task: &str, script: &Path) -> Result<(), LaunchError> {
    // leftover from an earlier attempt; absent is fine
    if let Err(e) = schedule::schtasks_delete(task).run() {
        log::debug!("schtasks /Delete {task}: {e}");
    }

    schedule::schtasks_create(task, script).run()?;
    schedule::schtasks_run(task).run()?;
    Ok(())
}

/// Create the script's process through WMI so it has no parent in our tree.
///
/// Tries `wmic` first, then PowerShell CIM on hosts where wmic was removed.
pub(super) fn spawn_detached(script: &Path) -> Result<u32, LaunchError> {
    let wmic = schedule::wmic_create(script);
    match wmic.run() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return schedule::parse_wmic_output(&stdout).ok_or_else(|| LaunchError::NoProcess {
                program: wmic.program.to_string(),
                output: stdout.trim().to_string(),
            });
        }
        Err(e) => log::warn!("wmic process creation failed, trying PowerShell: {e}"),
    }

    let ps = schedule::powershell_cim_create(script);
    let output = ps.run()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    schedule::parse_powershell_output(&stdout).ok_or_else(|| LaunchError::NoProcess {
        program: ps.program.to_string(),
        output: stdout.trim().to_string(),
    })
}
