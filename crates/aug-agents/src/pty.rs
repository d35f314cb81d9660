//! Pseudo-TTY subprocess capture.
//!
//! Phase drivers are spawned through a PTY so that their progress rendering
//! still works; the byte stream is teed to the parent's stdout and to a
//! per-phase log file. SIGINT is inherited through the controlling terminal.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Run a command under a PTY, streaming output to stdout and `log_path`.
/// Returns the child's exit status, or an error after `timeout`.
pub fn run_with_pty(mut command: Command, log_path: &Path, timeout: Duration) -> Result<ExitStatus> {
    let (master, slave) = open_pty()?;

    let slave_clone = slave.try_clone().context("cloning pty slave")?;
    let slave_clone2 = slave.try_clone().context("cloning pty slave")?;
    command
        .stdin(Stdio::from(slave))
        .stdout(Stdio::from(slave_clone))
        .stderr(Stdio::from(slave_clone2));

    let mut child = command.spawn().context("spawning phase driver")?;

    let mut master_file = File::from(master);
    let mut log_file = File::create(log_path)
        .with_context(|| format!("creating phase log {}", log_path.display()))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1024];
    let mut exit: Option<ExitStatus> = None;

    loop {
        if readable(&master_file, Duration::from_millis(100))? {
            match master_file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(&buf[..n]);
                    let _ = stdout.flush();
                    let _ = log_file.write_all(&buf[..n]);
                }
                // The child exited and the pty closed.
                Err(_) => break,
            }
        }

        if exit.is_none() {
            if let Some(status) = child.try_wait()? {
                exit = Some(status);
                // Drain whatever is still buffered, then stop.
                while readable(&master_file, Duration::from_millis(50))? {
                    match master_file.read(&mut buf) {
                        Ok(n) if n > 0 => {
                            let mut stdout = std::io::stdout();
                            let _ = stdout.write_all(&buf[..n]);
                            let _ = log_file.write_all(&buf[..n]);
                        }
                        _ => break,
                    }
                }
                break;
            }
        }

        if Instant::now() > deadline {
            warn!(log = %log_path.display(), "phase driver exceeded its time budget, killing");
            let _ = child.kill();
            bail!("phase driver timed out after {}s", timeout.as_secs());
        }
    }

    match exit {
        Some(status) => Ok(status),
        None => Ok(child.wait()?),
    }
}

/// Open a pty pair via `openpty(3)`.
fn open_pty() -> Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    if rc != 0 {
        bail!("openpty failed: {}", std::io::Error::last_os_error());
    }
    // Safety: openpty returned two fresh, owned descriptors.
    unsafe { Ok((OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))) }
}

/// Poll one fd for readability via `select(2)`.
fn readable(file: &File, timeout: Duration) -> Result<bool> {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    let mut read_set = unsafe { std::mem::zeroed::<libc::fd_set>() };
    unsafe {
        libc::FD_ZERO(&mut read_set);
        libc::FD_SET(fd, &mut read_set);
    }
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let rc = unsafe {
        libc::select(
            fd + 1,
            &mut read_set,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut tv,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        bail!("select failed: {err}");
    }
    Ok(rc > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_captures_output_and_exit() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("phase.log");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo tee-me; exit 3"]);
        let status = run_with_pty(cmd, &log, Duration::from_secs(10)).unwrap();

        assert_eq!(status.code(), Some(3));
        let captured = std::fs::read_to_string(&log).unwrap();
        assert!(captured.contains("tee-me"));
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("phase.log");

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let result = run_with_pty(cmd, &log, Duration::from_millis(300));
        assert!(result.is_err());
    }
}
