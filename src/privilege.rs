//! Elevated-privilege detection and launching.
//!
//! Some executables can only be started with administrator rights. When a
//! direct spawn fails with the platform's "elevation required" error the
//! supervisor relaunches through the facility implemented here. Processes
//! started this way are not our children: no pipes, no handle, and at best a
//! PID found by name.
use std::{
    io,
    path::Path,
    process::{Command, Stdio},
};

use tracing::debug;

/// Platform elevation facility. Implemented by [`SystemElevation`]; tests substitute fakes.
pub trait Elevation: Send + Sync {
    /// Whether this process already runs with elevated privileges.
    fn is_elevated(&self) -> bool;

    /// Whether `err`, returned by a spawn, means elevation is required.
    fn elevation_required(&self, err: &io::Error) -> bool;

    /// Starts `executable` elevated and detached. Returns once the facility has handed it off.
    fn launch(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> io::Result<()>;
}

/// Elevation through the host OS: `sudo` on Unix, UAC (`RunAs`) on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemElevation;

#[cfg(unix)]
impl Elevation for SystemElevation {
    fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn elevation_required(&self, err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::EPERM)
    }

    fn launch(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> io::Result<()> {
        let mut cmd = Command::new("sudo");
        cmd.arg("-n").arg("-b").arg("--").arg(executable).args(args);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        run_launcher(cmd, executable)
    }
}

#[cfg(windows)]
impl Elevation for SystemElevation {
    fn is_elevated(&self) -> bool {
        use std::os::windows::process::CommandExt;

        Command::new("net")
            .arg("session")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .status()
            .is_ok_and(|status| status.success())
    }

    fn elevation_required(&self, err: &io::Error) -> bool {
        err.raw_os_error() == Some(crate::constants::WINDOWS_ERROR_ELEVATION_REQUIRED)
    }

    fn launch(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> io::Result<()> {
        use std::os::windows::process::CommandExt;

        let mut script = format!(
            "Start-Process -FilePath {} -Verb RunAs -WindowStyle Hidden",
            powershell_quote(&executable.to_string_lossy())
        );
        if !args.is_empty() {
            let quoted: Vec<String> = args.iter().map(|arg| powershell_quote(arg)).collect();
            script.push_str(&format!(" -ArgumentList @({})", quoted.join(",")));
        }
        if let Some(dir) = working_dir {
            script.push_str(&format!(
                " -WorkingDirectory {}",
                powershell_quote(&dir.to_string_lossy())
            ));
        }

        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .creation_flags(CREATE_NO_WINDOW);

        run_launcher(cmd, executable)
    }
}

/// `CREATE_NO_WINDOW` process creation flag.
#[cfg(windows)]
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg(windows)]
fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn run_launcher(mut cmd: Command, executable: &Path) -> io::Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    debug!("launching {} elevated", executable.display());
    let mut launcher = cmd.spawn()?;

    match crate::supervisor::wait_with_timeout(
        &mut launcher,
        crate::constants::ELEVATED_LAUNCH_TIMEOUT,
    )? {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(io::Error::other(format!(
            "elevated launch of {} exited with {status}",
            executable.display()
        ))),
        None => {
            let _ = launcher.kill();
            let _ = launcher.wait();
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("elevated launch of {} did not return", executable.display()),
            ))
        }
    }
}
