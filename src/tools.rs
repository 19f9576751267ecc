//! External tool invocation.

use std::{
    ffi::OsString,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use failure::ResultExt;

use crate::{error::Kind, Result};

/// Interval between two checks of a running tool.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Invocation of an external tool.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl Invocation {
    /// Creates an invocation of the given program.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Adds an argument.
    pub fn arg<A: Into<OsString>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds a path argument.
    pub fn path_arg<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.args.push(path.as_ref().as_os_str().to_owned());
        self
    }

    /// Sets the working directory of the tool.
    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Gets the program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Gets the arguments, lossily converted to strings.
    pub fn args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Gets the working directory.
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_ref().map(PathBuf::as_path)
    }
}

/// Output of a successful tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external tools.
pub trait ToolRunner: Send + Sync {
    /// Runs the invocation. A non zero exit status is a `Kind::ExternalTool` error.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes of the current process.
#[derive(Debug, Clone)]
pub struct SystemTools {
    timeout: Duration,
}

impl SystemTools {
    /// Creates a runner killing tools running longer than the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ToolRunner for SystemTools {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        debug!(
            "running `{} {}`",
            invocation.program(),
            invocation.args().join(" ")
        );

        let mut command = Command::new(invocation.program());
        let _ = command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = invocation.cwd() {
            let _ = command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|_| format!("could not execute `{}`", invocation.program()))?;

        // A full pipe blocks the child, so both are drained while waiting.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_timeout(&mut child, self.timeout, invocation.program());
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let status = status?;

        if !status.success() {
            return Err(Kind::ExternalTool {
                tool: invocation.program().to_owned(),
                stderr: if stderr.trim().is_empty() {
                    format!("exited with {}", status)
                } else {
                    stderr.trim().to_owned()
                },
            }
            .into());
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = Vec::new();
            if pipe.read_to_end(&mut bytes).is_ok() {
                buffer = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
        buffer
    })
}

fn wait_with_timeout(child: &mut Child, timeout: Duration, program: &str) -> Result<ExitStatus> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            warn!("`{}` timed out and was killed", program);
            return Err(Kind::Timeout {
                what: program.to_owned(),
                seconds: timeout.as_secs(),
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    }
}
