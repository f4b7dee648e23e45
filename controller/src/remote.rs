pub mod slurm;

use once_cell::sync::Lazy;
use std::{
    io::{self, Read, Write},
    process::{ChildStdin, Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum RemoteExecutionError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to talk to the remote process: {0}")]
    Io(#[from] std::io::Error),
    #[error("Remote command on {host} did not finish within {timeout:?}")]
    Timeout { host: String, timeout: Duration },
    #[error("Remote command failed with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("Remote command on {host} stopped reading its input (status {status:?}, {source}): {stderr}")]
    InputRejected {
        host: String,
        status: Option<i32>,
        stderr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unexpected output from `{command}`: {output:?}")]
    InvalidOutput { command: String, output: String },
}

/// hostname of the machine the controller runs on, the default head-node
pub static LOCAL_HOSTNAME: Lazy<Option<String>> = Lazy::new(|| {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
});

/// login name of the user running the controller
pub static CURRENT_USER: Lazy<Option<String>> = Lazy::new(|| {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
});

/// Runs shell commands on the cluster head-node
pub trait RemoteShell {
    /// run `command` and return its stdout, feeding `stdin` to it when given
    fn run(&self, command: &str, stdin: Option<&str>) -> Result<String, RemoteExecutionError>;
}

/// Non-interactive ssh session per command
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: &'static str,
    // everything before the command itself, e.g. the ssh options and the host
    leading: Vec<String>,
    host: String,
    timeout: Duration,
}

/// the head-node is pre-provisioned and trusted, host keys are not pinned
const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
];

impl SshExecutor {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        let host = host.into();
        let leading = SSH_OPTIONS
            .iter()
            .map(|option| option.to_string())
            .chain([host.clone()])
            .collect();

        Self {
            program: "ssh",
            leading,
            host,
            timeout,
        }
    }

    /// run commands with the local `sh` instead of on a remote host
    #[cfg(test)]
    fn local(timeout: Duration) -> Self {
        Self {
            program: "sh",
            leading: vec!["-c".to_string()],
            host: "localhost".to_string(),
            timeout,
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();

        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_string(&mut buffer) {
                warn!(error = ?error, "Failed to read output of the remote process");
            }
        }

        buffer
    })
}

/// write `input` on its own thread so a remote side that stops reading can't block past the timeout
fn feed(pipe: Option<ChildStdin>, input: Option<&str>) -> Option<thread::JoinHandle<io::Result<()>>> {
    let (mut pipe, input) = (pipe?, input?.to_string());

    Some(thread::spawn(move || {
        pipe.write_all(input.as_bytes())
        // pipe is dropped here, closing the remote command's stdin
    }))
}

impl RemoteShell for SshExecutor {
    #[instrument(level = "debug", skip(self, stdin), fields(host = %self.host))]
    fn run(&self, command: &str, stdin: Option<&str>) -> Result<String, RemoteExecutionError> {
        let mut handle = Command::new(self.program)
            .args(&self.leading)
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RemoteExecutionError::Spawn {
                program: self.program,
                source,
            })?;

        // read both pipes concurrently so a chatty remote side can't fill a pipe and stall
        let stdout = drain(handle.stdout.take());
        let stderr = drain(handle.stderr.take());
        let writer = feed(handle.stdin.take(), stdin);

        debug!("Waiting on {} process {}", self.program, handle.id());
        let status = match handle.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            outcome => {
                // never leave the child behind, whether it hung or waiting failed
                if let Err(error) = handle.kill() {
                    warn!(error = ?error, "Failed to kill the remote process");
                }
                handle.wait()?;

                return Err(match outcome {
                    Err(error) => error.into(),
                    _ => RemoteExecutionError::Timeout {
                        host: self.host.clone(),
                        timeout: self.timeout,
                    },
                });
            }
        };

        let written = writer
            .and_then(|writer| writer.join().ok())
            .unwrap_or(Ok(()));
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        trace!(stdout = %stdout, stderr = %stderr, "Remote command finished");

        if let Err(source) = written {
            return Err(RemoteExecutionError::InputRejected {
                host: self.host.clone(),
                status: status.code(),
                stderr: stderr.trim().to_string(),
                source,
            });
        }

        if status.success() {
            Ok(stdout)
        } else {
            Err(RemoteExecutionError::Failed {
                status: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }
}
