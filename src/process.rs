use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// CPU time and memory consumed by one finished child process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub system_time: Duration,
    pub user_time: Duration,
    /// Peak resident set size in KiB.
    pub max_rss: i64,
}

pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub usage: ResourceUsage,
    /// Set when stderr could not be written to the diagnostics sink. The rest
    /// of the stream was still drained, so the child ran to completion.
    pub capture_error: Option<io::Error>,
}

/// Spawns shell commands and reports how they exited and what they consumed.
pub trait ProcessRunner: Send + Sync {
    /// Runs `command` through the system command interpreter, streaming its
    /// stderr into `diagnostics` until it exits.
    fn run_shell(
        &self,
        command: &str,
        work_dir: &Path,
        diagnostics: &mut (dyn Write + Send),
    ) -> anyhow::Result<ProcessOutcome>;
}

/// Runs commands on the local machine.
///
/// Commands are passed to the interpreter verbatim. Schemes are trusted input,
/// which lets them use pipes and other shell constructs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn shell_command(command: &str) -> Command {
        if cfg!(windows) {
            let mut shell = Command::new("cmd");
            shell.arg("/C").arg(command);
            shell
        } else {
            let mut shell = Command::new("sh");
            shell.arg("-c").arg(command);
            shell
        }
    }
}

impl ProcessRunner for SystemRunner {
    fn run_shell(
        &self,
        command: &str,
        work_dir: &Path,
        diagnostics: &mut (dyn Write + Send),
    ) -> anyhow::Result<ProcessOutcome> {
        let mut shell = Self::shell_command(command);

        if !work_dir.as_os_str().is_empty() {
            shell.current_dir(work_dir);
        }

        let mut child = shell
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Unable to spawn encoder subprocess")?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Unable to access stderr for encoder subprocess"))?;

        std::thread::scope(|scope| -> anyhow::Result<ProcessOutcome> {
            let copier = scope.spawn(move || drain(&mut stderr, diagnostics));

            let mut outcome =
                wait_with_usage(&mut child).context("Unable to wait for encoder subprocess")?;

            match copier.join() {
                Ok(copied) => outcome.capture_error = copied.err(),
                Err(error) => {
                    return Err(anyhow!("Encoder output capture panicked: {:?}", error));
                }
            }

            Ok(outcome)
        })
    }
}

/// Copies `reader` into `writer` until EOF. After a failed write the rest of
/// the stream is discarded so the writing end never sees a closed pipe.
fn drain(reader: &mut impl Read, writer: &mut (dyn Write + Send)) -> io::Result<u64> {
    match io::copy(reader, writer) {
        Ok(copied) => Ok(copied),
        Err(error) => {
            io::copy(reader, &mut io::sink())?;
            Err(error)
        }
    }
}

#[cfg(unix)]
fn timeval_to_duration(time: libc::timeval) -> Duration {
    let seconds = u64::try_from(time.tv_sec).unwrap_or_default();
    let micros = u64::try_from(time.tv_usec).unwrap_or_default();

    Duration::from_secs(seconds) + Duration::from_micros(micros)
}

/// Reaps the child with `wait4` so its own resource usage is reported.
#[cfg(unix)]
fn wait_with_usage(child: &mut Child) -> anyhow::Result<ProcessOutcome> {
    use std::os::unix::process::ExitStatusExt;

    let pid = libc::pid_t::try_from(child.id()).context("Child process id out of range")?;
    let mut status: libc::c_int = 0;
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();

    loop {
        // SAFETY: `status` and `usage` are valid for writes, and the child has
        // not been reaped yet because `Child::wait` is never called on it.
        #[allow(unsafe_code)]
        let result = unsafe { libc::wait4(pid, &mut status, 0, usage.as_mut_ptr()) };

        if result == pid {
            break;
        }

        let error = io::Error::last_os_error();

        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error).context("wait4 failed");
        }
    }

    // SAFETY: wait4 returned successfully, so the kernel filled in `usage`.
    #[allow(unsafe_code)]
    let usage = unsafe { usage.assume_init() };

    // macOS reports bytes, Linux and the BSDs report KiB.
    let max_rss = i64::from(usage.ru_maxrss);
    let max_rss = if cfg!(target_os = "macos") {
        max_rss / 1024
    } else {
        max_rss
    };

    Ok(ProcessOutcome {
        status: ExitStatus::from_raw(status),
        usage: ResourceUsage {
            system_time: timeval_to_duration(usage.ru_stime),
            user_time: timeval_to_duration(usage.ru_utime),
            max_rss,
        },
        capture_error: None,
    })
}

/// Targets without `wait4` only report the exit status.
#[cfg(not(unix))]
fn wait_with_usage(child: &mut Child) -> anyhow::Result<ProcessOutcome> {
    let status = child.wait().context("Unable to wait for child process")?;

    Ok(ProcessOutcome {
        status,
        usage: ResourceUsage::default(),
        capture_error: None,
    })
}
