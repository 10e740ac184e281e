//! Launching and supervising external tools.
//!
//! Two modes are provided: [`run`] for short-lived commands where only the
//! exit status and captured output matter (parted, mkfs, umount, lsblk), and
//! [`spawn_streaming`] for long-running commands whose output must be parsed
//! line by line as it arrives (the dd burn script). Both enforce bounded
//! waits; a command that outlives its timeout is killed and reported as
//! [`ProcessErrorKind::TimedOut`] rather than left to hang the caller.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{ProcessError, ProcessErrorKind};

/// Captured result of a short-lived command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Runs a command to completion with a bounded wait.
///
/// The child is killed if it exceeds `timeout`. Output is captured, not
/// streamed.
pub fn run(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, ProcessError> {
    debug!(program, ?args, "running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessError::FailedToStart(program.to_string(), e))?;

    let pid = child.id();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(ProcessError::Io(e)),
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
            kill_pid(pid);
            Err(ProcessError::TimedOut(program.to_string(), timeout))
        }
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

/// Notification from a streaming child process.
///
/// `Line` events carry combined stdout/stderr output; exactly one `Exited`
/// or `Failed` event terminates the stream.
#[derive(Debug)]
pub enum ProcessEvent {
    Line(String),
    /// The process exited; `None` means it was terminated by a signal.
    Exited(Option<i32>),
    Failed(ProcessErrorKind),
}

/// Handle to a streaming child, shared between the supervising consumer and
/// whoever may need to terminate it.
#[derive(Clone)]
pub struct ChildHandle {
    inner: Arc<Mutex<Child>>,
}

impl ChildHandle {
    /// Forcibly terminates the child. Safe to call after exit.
    pub fn kill(&self) {
        let _ = self.inner.lock().unwrap().kill();
    }
}

/// Spawns a command and streams its output as [`ProcessEvent`]s.
///
/// One reader thread drains each of stdout and stderr so the pipes never
/// fill; a waiter thread polls for exit and sends the terminal event after
/// the readers have finished, preserving line-before-exit ordering.
pub fn spawn_streaming(
    program: &str,
    args: &[&str],
) -> Result<(ChildHandle, Receiver<ProcessEvent>), ProcessError> {
    debug!(program, ?args, "spawning streaming command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessError::FailedToStart(program.to_string(), e))?;

    let (tx, rx) = mpsc::channel();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut readers = Vec::new();
    if let Some(out) = stdout {
        readers.push(spawn_line_reader(out, tx.clone()));
    }
    if let Some(err) = stderr {
        readers.push(spawn_line_reader(err, tx.clone()));
    }

    let handle = ChildHandle {
        inner: Arc::new(Mutex::new(child)),
    };

    let waiter_handle = handle.clone();
    thread::spawn(move || {
        let status = loop {
            match waiter_handle.inner.lock().unwrap().try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            thread::sleep(Duration::from_millis(100));
        };

        // Let the readers drain any output still buffered in the pipes.
        for reader in readers {
            let _ = reader.join();
        }

        let event = match status {
            Ok(status) => ProcessEvent::Exited(status.code()),
            Err(_) => ProcessEvent::Failed(ProcessErrorKind::Crashed),
        };
        let _ = tx.send(event);
    });

    Ok((handle, rx))
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(
    stream: R,
    tx: Sender<ProcessEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(ProcessEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_output_and_status() {
        let output = run("sh", &["-c", "echo hello"], Duration::from_secs(5)).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn run_reports_nonzero_exit() {
        let output = run("sh", &["-c", "exit 3"], Duration::from_secs(5)).unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code(), 3);
    }

    #[test]
    fn run_kills_on_timeout() {
        let err = run("sleep", &["10"], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut(_, _)));
    }

    #[test]
    fn run_reports_missing_program() {
        let err = run("definitely-not-a-real-tool", &[], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ProcessError::FailedToStart(_, _)));
    }

    #[test]
    fn streaming_delivers_lines_then_exit() {
        let (_handle, rx) =
            spawn_streaming("sh", &["-c", "echo one; echo two 1>&2"]).unwrap();

        let mut lines = Vec::new();
        let mut exit = None;
        for event in rx.iter() {
            match event {
                ProcessEvent::Line(l) => lines.push(l),
                ProcessEvent::Exited(code) => {
                    exit = Some(code);
                    break;
                }
                ProcessEvent::Failed(kind) => panic!("unexpected failure: {kind:?}"),
            }
        }

        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(exit, Some(Some(0)));
    }

    #[test]
    fn streaming_kill_reports_signal_exit() {
        let (handle, rx) = spawn_streaming("sleep", &["10"]).unwrap();
        handle.kill();

        let mut exit = None;
        for event in rx.iter() {
            if let ProcessEvent::Exited(code) = event {
                exit = Some(code);
                break;
            }
        }
        assert_eq!(exit, Some(None));
    }
}
