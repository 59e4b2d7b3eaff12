//! Execution of external tools behind the [ProcessRunner] capability.
//!
//! Everything that shells out (dump tools, `systemctl`, database clients) goes
//! through a [ProcessRunner], so callers can be exercised with a fake runner.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use derive_more::{Display, Error};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One invocation of an external program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Program name, looked up in `PATH`.
    pub program: String,
    pub args: Vec<String>,
    /// File connected to the standard input of the program.
    pub stdin: Option<PathBuf>,
    /// File receiving the standard output instead of capturing it.
    pub stdout: Option<PathBuf>,
    /// Upper bound for the runtime. The program is killed once it expires.
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line for log output.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(stdin) = &self.stdin {
            line.push_str(&format!(" < {}", stdin.display()));
        }
        if let Some(stdout) = &self.stdout {
            line.push_str(&format!(" > {}", stdout.display()));
        }
        line
    }
}

/// Output of a successful [Invocation].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Captured standard output. Empty if it was redirected to a file.
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Display, Error)]
/// Errors on running an external program.
pub enum ProcessError {
    /// The program could not be started, e.g. because it is not installed.
    #[display("Unable to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    /// Redirecting standard input or output failed.
    #[display("Unable to redirect {} for {program}: {source}", path.display())]
    Redirect {
        program: String,
        path: PathBuf,
        source: io::Error,
    },
    /// The program exited unsuccessfully.
    #[display("{program} exited with {}: {}", code.map_or("a signal".to_string(), |c| format!("status {c}")), stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The program was killed after exceeding its timeout.
    #[display("{program} did not finish within {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    /// Waiting for the program failed.
    #[display("Waiting for {program} failed: {source}")]
    Wait { program: String, source: io::Error },
}

/// Capability to run external programs.
pub trait ProcessRunner {
    /// Runs the [Invocation] to completion.
    ///
    /// A non-zero exit status is reported as [ProcessError::Failed].
    fn run(&self, invocation: &Invocation) -> Result<Captured, ProcessError>;
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for &R {
    fn run(&self, invocation: &Invocation) -> Result<Captured, ProcessError> {
        (**self).run(invocation)
    }
}

/// [ProcessRunner] spawning real processes using [Command].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<Captured, ProcessError> {
        let program = invocation.program.clone();
        let redirect = |path: &PathBuf, source| ProcessError::Redirect {
            program: program.clone(),
            path: path.clone(),
            source,
        };

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).stderr(Stdio::piped());

        match &invocation.stdin {
            Some(path) => command.stdin(File::open(path).map_err(|e| redirect(path, e))?),
            None => command.stdin(Stdio::null()),
        };
        match &invocation.stdout {
            Some(path) => command.stdout(File::create(path).map_err(|e| redirect(path, e))?),
            None => command.stdout(Stdio::piped()),
        };

        log::trace!(target: "process", "Running: {}", invocation.command_line());
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        // drain both pipes concurrently, a full pipe would block the child
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = wait(&mut child, invocation.timeout).map_err(|source| ProcessError::Wait {
            program: program.clone(),
            source,
        })?;

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        match status {
            None => Err(ProcessError::TimedOut {
                program,
                timeout: invocation.timeout.unwrap_or_default(),
            }),
            Some(status) if !status.success() => Err(ProcessError::Failed {
                program,
                code: status.code(),
                stderr,
            }),
            Some(_) => {
                // relay stderr
                if !stderr.trim().is_empty() {
                    log::warn!(target: "process", "{program}: {}", stderr.trim_end());
                }
                Ok(Captured { stdout, stderr })
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Waits for the child. Returns [None] if it got killed because of the timeout.
fn wait(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            // the child may have exited in the meantime
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
