//! Hand-off to the freshly committed executable.
//!
//! The updating process cannot start the new binary and then clean up after
//! itself, because it is about to exit. Instead it writes a tiny shell (or
//! batch) script and starts it detached. The script waits out a grace period,
//! starts the live executable, waits again, removes the backup and finally
//! deletes itself.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Result, UpdateError};

/// A relaunch helper that has been started.
#[derive(Debug, Clone)]
pub struct Relaunch {
    pub script: PathBuf,
    pub pid: u32,
}

/// Write the helper script for `exe`/`backup` into `script_dir` and start it
/// detached. The caller should exit shortly afterwards.
pub fn launch(exe: &Path, backup: &Path, grace: Duration, script_dir: &Path) -> Result<Relaunch> {
    let script = write_script(exe, backup, grace, script_dir)?;
    let child = spawn_detached(&script).map_err(|e| UpdateError::io(&script, e))?;
    tracing::info!(script = %script.display(), pid = child.id(), "relauncher started");
    Ok(Relaunch {
        script,
        pid: child.id(),
    })
}

/// Write the platform helper script and make it executable.
pub fn write_script(exe: &Path, backup: &Path, grace: Duration, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| UpdateError::io(dir, e))?;
    let script = dir.join(format!(
        "selfpatch-relaunch-{}.{}",
        std::process::id(),
        SCRIPT_EXT
    ));
    std::fs::write(&script, render_script(exe, backup, grace))
        .map_err(|e| UpdateError::io(&script, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| UpdateError::io(&script, e))?;
    }
    Ok(script)
}

#[cfg(not(windows))]
const SCRIPT_EXT: &str = "sh";
#[cfg(windows)]
const SCRIPT_EXT: &str = "bat";

/// Whole seconds, at least one; `sleep`/`timeout` take integers.
fn grace_secs(grace: Duration) -> u64 {
    let secs = grace.as_secs() + u64::from(grace.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(not(windows))]
pub fn render_script(exe: &Path, backup: &Path, grace: Duration) -> String {
    let secs = grace_secs(grace);
    format!(
        "#!/bin/sh\n\
         sleep {secs}\n\
         {exe} >/dev/null 2>&1 &\n\
         sleep {secs}\n\
         rm -f {backup}\n\
         rm -f \"$0\"\n",
        exe = sh_quote(&exe.to_string_lossy()),
        backup = sh_quote(&backup.to_string_lossy()),
    )
}

#[cfg(windows)]
pub fn render_script(exe: &Path, backup: &Path, grace: Duration) -> String {
    let secs = grace_secs(grace);
    format!(
        "@echo off\r\n\
         timeout /t {secs} /nobreak >nul\r\n\
         start \"\" \"{exe}\"\r\n\
         timeout /t {secs} /nobreak >nul\r\n\
         if exist \"{backup}\" del /f /q \"{backup}\"\r\n\
         (goto) 2>nul & del \"%~f0\"\r\n",
        exe = exe.display(),
        backup = backup.display(),
    )
}

/// Single-quote for POSIX sh.
#[cfg(not(windows))]
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(not(windows))]
fn spawn_detached(script: &Path) -> std::io::Result<std::process::Child> {
    use std::os::unix::process::CommandExt;
    Command::new("/bin/sh")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
}

#[cfg(windows)]
fn spawn_detached(script: &Path) -> std::io::Result<std::process::Child> {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    Command::new("cmd")
        .arg("/C")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
        .spawn()
}
