//! Flasher subprocess
//!
//! [`ProcessRunner`] is the seam between the update state machine and the
//! operating system, so the machine can be exercised with a scripted fake.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::UpdateRequest;

/// Everything the flasher needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashInvocation {
    pub program: String,
    pub port: String,
    pub baud: u32,
    pub image_path: PathBuf,
    pub verify: bool,
}

impl FlashInvocation {
    pub fn new(program: impl Into<String>, request: &UpdateRequest) -> Self {
        Self {
            program: program.into(),
            port: request.port.clone(),
            baud: request.baud,
            image_path: request.image_path.clone(),
            verify: request.verify,
        }
    }

    /// stm32flash command line: write, optional verify, then jump to 0x0
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            self.image_path.display().to_string(),
            "-b".to_string(),
            self.baud.to_string(),
        ];
        if self.verify {
            args.push("-v".to_string());
        }
        args.extend(["-g".to_string(), "0x0".to_string(), self.port.clone()]);
        args
    }
}

/// A running flasher
#[allow(async_fn_in_trait)]
pub trait FlashProcess: Send {
    /// Next line of output, or `None` once output is closed
    async fn next_line(&mut self) -> Option<String>;

    /// Ask the process to terminate
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for exit and return the exit code (-1 when killed by a signal)
    async fn wait(&mut self) -> io::Result<i32>;
}

/// Launches flasher processes
pub trait ProcessRunner {
    type Process: FlashProcess;

    fn spawn(&mut self, invocation: &FlashInvocation) -> io::Result<Self::Process>;
}

/// Runs the real stm32flash binary
#[derive(Debug, Default, Clone)]
pub struct Stm32FlashRunner;

impl ProcessRunner for Stm32FlashRunner {
    type Process = Stm32FlashProcess;

    fn spawn(&mut self, invocation: &FlashInvocation) -> io::Result<Self::Process> {
        let args = invocation.args();
        debug!("Launching {} {}", invocation.program, args.join(" "));

        let mut child = Command::new(&invocation.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("flasher stdout not captured"))?;
        let stderr = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = err.read_to_string(&mut text).await;
                text
            })
        });

        Ok(Stm32FlashProcess {
            child,
            lines: LineReader::new(stdout),
            stderr,
        })
    }
}

/// Splits a byte stream on `\n` or `\r`; stm32flash redraws progress with `\r`
struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            eof: false,
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Some(text);
            }

            if self.eof {
                if self.pending.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.pending);
                return Some(String::from_utf8_lossy(&rest).trim().to_string());
            }

            let mut chunk = [0u8; 256];
            match self.inner.read(&mut chunk).await {
                Ok(0) | Err(_) => self.eof = true,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
            }
        }
    }
}

/// Handle to a spawned stm32flash
pub struct Stm32FlashProcess {
    child: Child,
    lines: LineReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
}

impl FlashProcess for Stm32FlashProcess {
    async fn next_line(&mut self) -> Option<String> {
        self.lines.next_line().await
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            if let Some(stderr) = self.stderr.take() {
                if let Ok(text) = stderr.await {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        warn!("flasher: {}", line.trim());
                    }
                }
            }
        }
        Ok(code)
    }
}
