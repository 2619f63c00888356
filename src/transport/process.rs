// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Upstream process transport with Zombie Process Protection.
//!
//! Spawns the stdio JSON-RPC server and frames newline-delimited messages over
//! its standard streams. The child is bound to the gateway: it is killed when
//! the transport is dropped and, on Linux, when the gateway process dies.
//!
//! Four background tasks own the child's handles:
//! - writer: drains the FIFO send queue into stdin
//! - reader: decodes stdout with [`NdjsonCodec`]
//! - stderr drain: keeps a rolling tail for diagnostics
//! - supervisor: waits for exit (or a close request) and raises `Closed`

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::{Frame, NdjsonCodec};
use super::{Inbound, InboundReceiver, Transport};
use crate::constants::limits;
use crate::error::TransportError;
use crate::jsonrpc::Message;

/// What to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Run `program` (plus args) as a command line through the platform shell.
    pub shell: bool,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// A full command line, executed through the shell.
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self {
            program: command_line.into(),
            shell: true,
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build(&self) -> Command {
        let mut command = if self.shell {
            let mut line = self.program.clone();
            for arg in &self.args {
                line.push(' ');
                line.push_str(arg);
            }
            #[cfg(windows)]
            let mut c = {
                let mut c = Command::new("cmd");
                c.arg("/C");
                c
            };
            #[cfg(not(windows))]
            let mut c = {
                let mut c = Command::new("sh");
                c.arg("-c");
                c
            };
            c.arg(line);
            c
        } else {
            let mut c = Command::new(&self.program);
            c.args(&self.args);
            c
        };

        command
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // ------------------------------------------------------------------
        // LINUX: PR_SET_PDEATHSIG
        // ------------------------------------------------------------------
        #[cfg(target_os = "linux")]
        // SAFETY: prctl is async-signal-safe and only touches the calling
        // (child) process. PR_SET_PDEATHSIG with SIGKILL makes the kernel kill
        // the child if the gateway dies. The constants come from libc.
        unsafe {
            command.pre_exec(|| {
                let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                if ret != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        command
    }
}

struct WriteJob {
    message: Message,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Exit {
    code: Option<i32>,
}

/// Last N bytes written to the child's stderr.
#[derive(Debug)]
struct StderrTail {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl StderrTail {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.capacity);
        self.bytes.drain(..excess);
    }
}

pub struct ProcessTransport {
    command: ProcessCommand,
    grace: Duration,
    inbound: Arc<Inbound>,
    started: AtomicBool,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    pid: Mutex<Option<u32>>,
    /// Close requested: the writer releases stdin.
    shutdown: CancellationToken,
    /// The child is gone.
    exited: CancellationToken,
    exit: Arc<watch::Sender<Option<Exit>>>,
    stderr: Arc<Mutex<StderrTail>>,
}

impl ProcessTransport {
    pub fn new(command: ProcessCommand) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            command,
            grace: Duration::from_millis(limits::CLOSE_GRACE_MS),
            inbound: Arc::new(Inbound::new()),
            started: AtomicBool::new(false),
            writer: Mutex::new(None),
            kill_tx: Mutex::new(None),
            pid: Mutex::new(None),
            shutdown: CancellationToken::new(),
            exited: CancellationToken::new(),
            exit: Arc::new(exit),
            stderr: Arc::new(Mutex::new(StderrTail {
                bytes: VecDeque::new(),
                capacity: limits::STDERR_CAPTURE_BYTES,
            })),
        }
    }

    /// Time between SIGTERM and SIGKILL on close.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Exit code once the child has exited. `None` while running, or when the
    /// child was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.borrow().and_then(|exit| exit.code)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Raw bytes of the most recent stderr output.
    pub fn stderr_tail(&self) -> Vec<u8> {
        lock(&self.stderr).bytes.iter().copied().collect()
    }

    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let mut exit = self.exit.subscribe();
        let exited = tokio::time::timeout(limit, exit.wait_for(Option::is_some))
            .await
            .is_ok();
        exited
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        debug!(
            program = %self.command.program,
            args = ?self.command.args,
            shell = self.command.shell,
            "Spawning upstream process"
        );

        let mut child = match self.command.build().spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn upstream process: {}", e);
                self.started.store(false, Ordering::SeqCst);
                let event = TransportError::Spawn(std::io::Error::new(e.kind(), e.to_string()));
                self.inbound.error(event);
                return Err(TransportError::Spawn(e));
            }
        };

        let pid = child.id();
        *lock(&self.pid) = pid;
        info!(pid = ?pid, "Upstream process started");

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(TransportError::Io(std::io::Error::other(
                "child stdio was not piped",
            )));
        };

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        *lock(&self.writer) = Some(writer_tx);
        tokio::spawn(write_loop(
            stdin,
            writer_rx,
            self.shutdown.clone(),
            self.exited.clone(),
        ));

        let reader = tokio::spawn(read_loop(stdout, Arc::clone(&self.inbound)));
        tokio::spawn(drain_stderr(stderr, Arc::clone(&self.stderr)));

        let (kill_tx, kill_rx) = oneshot::channel();
        *lock(&self.kill_tx) = Some(kill_tx);

        let inbound = Arc::clone(&self.inbound);
        let exited = self.exited.clone();
        let exit = Arc::clone(&self.exit);
        let grace = self.grace;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx => terminate(&mut child, grace).await,
            };
            let code = status.and_then(|s| s.code());
            info!(pid = ?pid, code = ?code, "Upstream process exited");
            exited.cancel();

            // Let the reader deliver whatever the child wrote before exiting.
            let abort = reader.abort_handle();
            if tokio::time::timeout(Duration::from_millis(limits::READER_DRAIN_MS), reader)
                .await
                .is_err()
            {
                debug!("Upstream stdout still open after exit, abandoning reader");
                abort.abort();
            }

            exit.send_replace(Some(Exit { code }));
            inbound.close();
        });

        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        if self.exited.is_cancelled() || self.shutdown.is_cancelled() {
            return Err(TransportError::ProcessClosed);
        }
        let (ack, done) = oneshot::channel();
        {
            let writer = lock(&self.writer);
            let Some(writer) = writer.as_ref() else {
                return Err(TransportError::NotStarted);
            };
            writer
                .send(WriteJob { message, ack })
                .map_err(|_| TransportError::ProcessClosed)?;
        }
        done.await.unwrap_or(Err(TransportError::ProcessClosed))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            self.inbound.close();
            return Ok(());
        }
        self.shutdown.cancel();
        if let Some(kill) = lock(&self.kill_tx).take() {
            let _ = kill.send(());
        }
        let limit = self.grace + Duration::from_millis(limits::READER_DRAIN_MS) * 2;
        if !self.wait_for_exit(limit).await {
            warn!(pid = ?self.pid(), "Upstream process did not exit in time");
            self.inbound.close();
        }
        Ok(())
    }

    fn take_inbound(&self) -> Option<InboundReceiver> {
        self.inbound.take()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        // Dropping kill_tx wakes the supervisor, which terminates the child.
        self.shutdown.cancel();
    }
}

async fn write_loop(
    stdin: ChildStdin,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    shutdown: CancellationToken,
    exited: CancellationToken,
) {
    let mut sink = FramedWrite::new(stdin, NdjsonCodec::new());
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = exited.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        match sink.send(&job.message).await {
            Ok(()) => {
                let _ = job.ack.send(Ok(()));
            }
            Err(TransportError::Serialize(e)) => {
                let _ = job.ack.send(Err(TransportError::Serialize(e)));
            }
            Err(e) => {
                debug!("Upstream stdin write failed: {}", e);
                let _ = job.ack.send(Err(TransportError::ProcessClosed));
                break;
            }
        }
    }

    // Releasing stdin signals EOF to the child.
    drop(sink);
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        let _ = job.ack.send(Err(TransportError::ProcessClosed));
    }
}

async fn read_loop(stdout: ChildStdout, inbound: Arc<Inbound>) {
    let mut framed = FramedRead::new(stdout, NdjsonCodec::new());
    while let Some(frame) = framed.next().await {
        match frame {
            Ok(Frame::Message(message)) => {
                if inbound.message(message).is_err() {
                    break;
                }
            }
            Ok(Frame::Malformed(e)) => {
                warn!("Skipping malformed line from upstream: {}", e);
                inbound.error(e);
            }
            Err(e) => {
                error!("Upstream read error: {}", e);
                inbound.error(e);
                break;
            }
        }
    }
    debug!("Upstream stdout closed");
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<StderrTail>>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                lock(&tail).push(&line);
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    debug!(target: "lilith_gateway::upstream_stderr", "{}", text);
                }
            }
            Err(_) => break,
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to upstream process {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("Failed to send SIGTERM to {}: {}", pid, e);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status.ok();
        }
        warn!("Upstream process {} ignored SIGTERM, killing", pid);
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill upstream process: {}", e);
    }
    child.wait().await.ok()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
