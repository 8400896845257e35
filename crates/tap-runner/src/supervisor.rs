//! Child process supervision - spawning, readiness detection and teardown

use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::matcher::{LineBuffer, LineMatcher, ReadinessMatch, ReadinessPattern};

/// Time a child gets between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Output still buffered in the pipes when a watched process exits is read
/// for at most this long.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;
const EXIT_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One read from a child's stdout or stderr.
#[derive(Debug)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// How a tracked process ended.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub command: String,
    pub pid: Option<u32>,
    pub status: Option<ExitStatus>,
    /// True when the exit followed a kill request from this side.
    pub requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// A terminate request was delivered to a running process.
    Signalled,
    /// Termination was already requested earlier.
    AlreadyRequested,
    /// The process had already exited; nothing was sent.
    AlreadyExited,
}

/// Handle to one spawned process.
///
/// The [`Child`] itself lives in a monitor task that reaps it and publishes
/// its exit. Dropping the handle counts as a kill request.
#[derive(Debug)]
pub struct ChildProcessHandle {
    command: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    output: Option<mpsc::UnboundedReceiver<OutputChunk>>,
}

impl ChildProcessHandle {
    /// Spawn `command` with piped stdout/stderr.
    ///
    /// Every stderr line is echoed to our own stderr as `<command> | <line>`.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        command: &str,
        args: &[String],
        exits: Option<broadcast::Sender<ProcessExit>>,
        grace: Duration,
    ) -> RunnerResult<Self> {
        debug!("Spawning: {} {}", command, args.join(" "));

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::ProcessSpawn {
                command: command.to_string(),
                source,
            })?;

        let pid = child.id();
        info!("Started {} (pid: {})", command, display_pid(pid));

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(
                command.to_string(),
                OutputStream::Stdout,
                stdout,
                output_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(
                command.to_string(),
                OutputStream::Stderr,
                stderr,
                output_tx,
            ));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(
            child,
            command.to_string(),
            pid,
            kill_rx,
            exit_tx,
            exits,
            grace,
        ));

        Ok(Self {
            command: command.to_string(),
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
            output: Some(output_rx),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit details, once the monitor has reaped the process.
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut exit_rx = self.exit_rx.clone();
        let exit = match exit_rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit
    }

    /// Stop capturing output. The pipes keep being drained (and stderr
    /// echoed) so the child never blocks on a full pipe.
    pub fn release_output(&mut self) {
        self.output = None;
    }

    /// Ask the monitor to terminate the process.
    ///
    /// Safe to call any number of times: a process that already exited, or
    /// that was already asked to stop, is not signalled again.
    pub fn kill(&mut self) -> KillOutcome {
        if self.has_exited() {
            return KillOutcome::AlreadyExited;
        }
        match self.kill_tx.take() {
            Some(kill_tx) => match kill_tx.send(()) {
                Ok(()) => KillOutcome::Signalled,
                // monitor already reaped the child
                Err(()) => KillOutcome::AlreadyExited,
            },
            None => KillOutcome::AlreadyRequested,
        }
    }

    /// Watch stdout and stderr until a complete line matches `pattern`.
    ///
    /// Each stream gets its own [`LineMatcher`]. If the process exits, or
    /// both streams close, before a match the wait fails with
    /// [`RunnerError::ReadinessTimeout`]. Output capture ends either way.
    pub async fn wait_for_ready(
        &mut self,
        pattern: &ReadinessPattern,
    ) -> RunnerResult<ReadinessMatch> {
        let mut output = self
            .output
            .take()
            .ok_or_else(|| RunnerError::OutputReleased(self.command.clone()))?;
        let mut matchers = StreamMatchers::new(pattern);
        let mut exit_rx = self.exit_rx.clone();

        debug!("Waiting for {} to print `{}`", self.command, pattern.as_str());

        let found = loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Some(chunk) => {
                        if let Some(found) = matchers.observe(&chunk) {
                            break Some(found);
                        }
                    }
                    None => {
                        // pipes close before the monitor has reaped the child
                        let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, exited(&mut exit_rx))
                            .await;
                        break None;
                    }
                },
                _ = exited(&mut exit_rx) => {
                    break tokio::time::timeout(EXIT_DRAIN_GRACE, matchers.drain(&mut output))
                        .await
                        .ok()
                        .flatten();
                }
            }
        };

        match found {
            Some(found) => {
                info!("{} is ready at {}", self.command, found.url());
                Ok(found)
            }
            None => Err(RunnerError::ReadinessTimeout {
                command: self.command.clone(),
                status: self.exit().and_then(|exit| exit.status),
            }),
        }
    }
}

async fn exited(exit_rx: &mut watch::Receiver<Option<ProcessExit>>) {
    let _ = exit_rx.wait_for(|exit| exit.is_some()).await;
}

struct StreamMatchers {
    stdout: LineMatcher,
    stderr: LineMatcher,
}

impl StreamMatchers {
    fn new(pattern: &ReadinessPattern) -> Self {
        Self {
            stdout: LineMatcher::new(pattern.clone()),
            stderr: LineMatcher::new(pattern.clone()),
        }
    }

    fn observe(&mut self, chunk: &OutputChunk) -> Option<ReadinessMatch> {
        match chunk.stream {
            OutputStream::Stdout => self.stdout.observe(&chunk.bytes),
            OutputStream::Stderr => self.stderr.observe(&chunk.bytes),
        }
    }

    async fn drain(
        &mut self,
        output: &mut mpsc::UnboundedReceiver<OutputChunk>,
    ) -> Option<ReadinessMatch> {
        while let Some(chunk) = output.recv().await {
            if let Some(found) = self.observe(&chunk) {
                return Some(found);
            }
        }
        None
    }
}

async fn pump<R>(
    command: String,
    stream: OutputStream,
    mut reader: R,
    output_tx: mpsc::UnboundedSender<OutputChunk>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut forwarding = true;
    let mut echo = StderrEcho::new(&command, io::stderr());

    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                debug!("Reading {:?} of {} failed: {}", stream, command, e);
                break;
            }
        };
        let bytes = &buf[..read];

        if stream == OutputStream::Stderr {
            echo.feed(bytes);
        }

        if forwarding
            && output_tx
                .send(OutputChunk {
                    stream,
                    bytes: bytes.to_vec(),
                })
                .is_err()
        {
            forwarding = false;
        }
    }

    if stream == OutputStream::Stderr {
        echo.finish();
    }
}

/// Prefixes each complete stderr line of a child with its command name.
struct StderrEcho<'a, W: Write> {
    command: &'a str,
    lines: LineBuffer,
    out: W,
}

impl<'a, W: Write> StderrEcho<'a, W> {
    fn new(command: &'a str, out: W) -> Self {
        Self {
            command,
            lines: LineBuffer::new(),
            out,
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        for line in self.lines.push(bytes) {
            self.write(&line);
        }
    }

    /// Flush a last line the child never terminated.
    fn finish(&mut self) {
        if let Some(line) = self.lines.take_remainder() {
            self.write(&line);
        }
    }

    fn write(&mut self, line: &str) {
        // losing our own stderr is not worth failing the run over
        let _ = writeln!(self.out, "{} | {}", self.command, line);
    }
}

async fn monitor(
    mut child: Child,
    command: String,
    pid: Option<u32>,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    exits: Option<broadcast::Sender<ProcessExit>>,
    grace: Duration,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        // a dropped handle is treated like an explicit kill
        _ = kill_rx => (terminate(&mut child, &command, grace).await, true),
    };

    let exit = ProcessExit {
        command,
        pid,
        status,
        requested,
    };
    if requested {
        debug!("{} stopped ({})", exit.command, display_status(status));
    } else {
        info!("{} process exited with {}", exit.command, display_status(status));
    }

    exit_tx.send_replace(Some(exit.clone()));
    if let Some(exits) = exits {
        let _ = exits.send(exit);
    }
}

async fn terminate(child: &mut Child, command: &str, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    info!("Stopping {} (pid: {})", command, display_pid(child.id()));

    // Try graceful shutdown first
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                    return status.ok();
                }
                warn!("{} ignored SIGTERM for {:?}, killing", command, grace);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!("Failed to kill {}: {}", command, e);
    }
    child.wait().await.ok()
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map(|pid| pid.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn display_status(status: Option<ExitStatus>) -> String {
    status
        .map(|status| status.to_string())
        .unwrap_or_else(|| "unknown status".to_string())
}

/// Index of a process tracked by a [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(usize);

/// Owns every child process of a run and tears them all down exactly once.
#[derive(Debug)]
pub struct ProcessSupervisor {
    children: Vec<ChildProcessHandle>,
    exits: broadcast::Sender<ProcessExit>,
    grace: Duration,
    shut_down: bool,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_TERMINATE_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        let (exits, _) = broadcast::channel(EXIT_EVENT_CAPACITY);
        Self {
            children: Vec::new(),
            exits,
            grace,
            shut_down: false,
        }
    }

    pub fn spawn(&mut self, command: &str, args: &[String]) -> RunnerResult<ProcessId> {
        let handle =
            ChildProcessHandle::spawn(command, args, Some(self.exits.clone()), self.grace)?;
        self.children.push(handle);
        Ok(ProcessId(self.children.len() - 1))
    }

    pub fn get(&self, id: ProcessId) -> &ChildProcessHandle {
        &self.children[id.0]
    }

    pub fn get_mut(&mut self, id: ProcessId) -> &mut ChildProcessHandle {
        &mut self.children[id.0]
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub async fn wait_for_ready(
        &mut self,
        id: ProcessId,
        pattern: &ReadinessPattern,
    ) -> RunnerResult<ReadinessMatch> {
        self.get_mut(id).wait_for_ready(pattern).await
    }

    pub fn kill(&mut self, id: ProcessId) -> KillOutcome {
        self.get_mut(id).kill()
    }

    /// Exit notifications for every tracked process, including ones spawned
    /// after subscribing.
    pub fn subscribe_exits(&self) -> broadcast::Receiver<ProcessExit> {
        self.exits.subscribe()
    }

    /// A tracked process that has already exited without being asked to.
    pub fn unexpected_exit(&self) -> Option<ProcessExit> {
        self.children
            .iter()
            .filter_map(ChildProcessHandle::exit)
            .find(|exit| !exit.requested)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Terminate every tracked process that is still running and wait for
    /// them to be reaped.
    ///
    /// Only the first call does anything; it returns how many processes were
    /// signalled.
    pub async fn shutdown(&mut self) -> usize {
        if self.shut_down {
            debug!("Supervisor already shut down");
            return 0;
        }
        self.shut_down = true;

        let mut signalled = 0;
        for child in &mut self.children {
            if child.kill() == KillOutcome::Signalled {
                signalled += 1;
            }
        }

        // SIGTERM grace plus time for the SIGKILL to land
        let deadline = self.grace + Duration::from_secs(2);
        for child in &self.children {
            if tokio::time::timeout(deadline, child.wait()).await.is_err() {
                warn!("{} did not exit within {:?}", child.command(), deadline);
            }
        }

        if signalled > 0 {
            info!("Stopped {} child process(es)", signalled);
        }
        signalled
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for the next exit that nobody asked for.
pub async fn next_unexpected_exit(exits: &mut broadcast::Receiver<ProcessExit>) -> ProcessExit {
    loop {
        match exits.recv().await {
            Ok(exit) if !exit.requested => return exit,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} process exit notification(s)", skipped);
            }
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn kill_after_exit_sends_nothing() {
        let mut handle =
            ChildProcessHandle::spawn("sh", &sh("exit 0"), None, DEFAULT_TERMINATE_GRACE)
                .unwrap();
        let exit = handle.wait().await.unwrap();
        assert!(!exit.requested);

        assert_eq!(handle.kill(), KillOutcome::AlreadyExited);
        assert_eq!(handle.kill(), KillOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn second_kill_is_not_resent() {
        let mut handle =
            ChildProcessHandle::spawn("sh", &sh("sleep 30"), None, DEFAULT_TERMINATE_GRACE)
                .unwrap();
        assert_eq!(handle.kill(), KillOutcome::Signalled);
        assert_eq!(handle.kill(), KillOutcome::AlreadyRequested);

        let exit = handle.wait().await.unwrap();
        assert!(exit.requested);
        assert_eq!(handle.kill(), KillOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn released_output_cannot_be_watched() {
        let mut handle =
            ChildProcessHandle::spawn("sh", &sh("sleep 30"), None, DEFAULT_TERMINATE_GRACE)
                .unwrap();
        handle.release_output();
        let err = handle
            .wait_for_ready(&ReadinessPattern::listening())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::OutputReleased(_)));
        handle.kill();
    }
}
