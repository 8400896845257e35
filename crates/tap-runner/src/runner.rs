//! Main test runner that orchestrates the service, the browser and the watchdog

use std::any::Any;
use std::io::{self, Write};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::browser::BrowserBackend;
use crate::error::{RunnerError, RunnerResult};
use crate::matcher::ReadinessPattern;
use crate::poller::{PollerConfig, ResultPoller};
use crate::supervisor::{next_unexpected_exit, ProcessSupervisor};
use crate::tap::TapAggregator;
use crate::watchdog::Watchdog;

/// Upper bound on closing the browser session during teardown.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A service to start before the browser run.
#[derive(Debug, Clone)]
pub struct ServiceCommand {
    pub program: String,
    pub args: Vec<String>,
    pub readiness: ReadinessPattern,
}

impl ServiceCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            readiness: ReadinessPattern::listening(),
        }
    }
}

/// What the browser should be pointed at.
#[derive(Debug, Clone)]
pub enum Target {
    /// A server that is already running.
    Url(String),
    /// Start this service and use the URL from its readiness line.
    Service(ServiceCommand),
}

/// Owns every resource of one run and guarantees its teardown.
pub struct Orchestrator<B: BrowserBackend, W: Write + Send> {
    run_name: String,
    supervisor: ProcessSupervisor,
    backend: B,
    tap: TapAggregator<W>,
    poller: PollerConfig,
    watchdog: Option<Watchdog>,
    diagnostics: Box<dyn Write + Send>,
    handle_interrupts: bool,
    cleaned_up: bool,
}

impl<B: BrowserBackend, W: Write + Send> Orchestrator<B, W> {
    pub fn new(run_name: impl Into<String>, backend: B, tap: TapAggregator<W>) -> Self {
        Self {
            run_name: run_name.into(),
            supervisor: ProcessSupervisor::new(),
            backend,
            tap,
            poller: PollerConfig::default(),
            watchdog: None,
            diagnostics: Box::new(io::stderr()),
            handle_interrupts: false,
            cleaned_up: false,
        }
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Where fatal diagnostics such as the watchdog reason go (stderr by
    /// default).
    pub fn with_diagnostics(mut self, diagnostics: impl Write + Send + 'static) -> Self {
        self.diagnostics = Box::new(diagnostics);
        self
    }

    /// Treat Ctrl-C as a fatal error that still runs teardown.
    pub fn handle_interrupts(mut self, enabled: bool) -> Self {
        self.handle_interrupts = enabled;
        self
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn tap(&self) -> &TapAggregator<W> {
        &self.tap
    }

    pub fn into_output(self) -> W {
        self.tap.into_inner()
    }

    /// Run to completion and return the failure count.
    ///
    /// Whatever the outcome, the session is closed and every child process
    /// is stopped before this returns.
    pub async fn execute(&mut self, target: Target) -> RunnerResult<usize> {
        let outcome = self.guarded(target).await;

        if let Err(RunnerError::GlobalTimeout(_)) = &outcome {
            if let Some(watchdog) = &self.watchdog {
                error!("Watchdog expired after {:?}", watchdog.ceiling());
                let reason = watchdog.reason();
                if let Err(e) = self.tap.bail_out(&reason) {
                    warn!("Failed to write bail out: {}", e);
                }
                let _ = writeln!(self.diagnostics, "{}", reason);
            }
        }

        self.cleanup().await;
        outcome
    }

    /// [`execute`](Self::execute) on its own task.
    ///
    /// A panic anywhere in the run comes back as [`RunnerError::Panicked`]
    /// instead of unwinding into the caller. Dropping the panicked run's
    /// process handles still asks every child to stop.
    pub async fn execute_isolated(mut self, target: Target) -> RunnerResult<usize>
    where
        B: 'static,
        B::Page: 'static,
        W: 'static,
    {
        let run = tokio::spawn(async move { self.execute(target).await });
        match run.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!("Run panicked: {}", message);
                Err(RunnerError::Panicked(message))
            }
            Err(e) => Err(RunnerError::Panicked(e.to_string())),
        }
    }

    /// Close the session and stop all child processes. Runs once.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, self.backend.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to close browser session: {}", e),
            Err(_) => warn!("Closing browser session timed out"),
        }
        self.supervisor.shutdown().await;
        debug!("Cleanup complete");
    }

    async fn guarded(&mut self, target: Target) -> RunnerResult<usize> {
        let watchdog = self.watchdog;
        let handle_interrupts = self.handle_interrupts;

        tokio::select! {
            outcome = self.drive(target) => outcome,
            _ = async {
                match watchdog {
                    Some(watchdog) => watchdog.expired().await,
                    None => std::future::pending().await,
                }
            } => Err(RunnerError::GlobalTimeout(
                watchdog.map(|w| w.ceiling()).unwrap_or_default(),
            )),
            _ = async {
                if handle_interrupts {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Cannot listen for interrupts: {}", e);
                        std::future::pending::<()>().await;
                    }
                } else {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received interrupt");
                Err(RunnerError::Interrupted)
            }
        }
    }

    async fn drive(&mut self, target: Target) -> RunnerResult<usize> {
        self.tap.emit_preamble(&self.run_name)?;

        let url = match target {
            Target::Url(url) => url,
            Target::Service(service) => {
                let id = self.supervisor.spawn(&service.program, &service.args)?;
                let ready = self
                    .supervisor
                    .wait_for_ready(id, &service.readiness)
                    .await?;
                ready.url().to_string()
            }
        };

        let mut exits = self.supervisor.subscribe_exits();
        if let Some(exit) = self.supervisor.unexpected_exit() {
            return Err(RunnerError::UnexpectedExit {
                command: exit.command,
                status: exit.status,
            });
        }

        let Self {
            supervisor,
            backend,
            tap,
            poller,
            ..
        } = self;

        tokio::select! {
            outcome = run_browser(&url, backend, supervisor, tap, poller) => outcome,
            exit = next_unexpected_exit(&mut exits) => Err(RunnerError::UnexpectedExit {
                command: exit.command,
                status: exit.status,
            }),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}

/// Launch the automation backend, open `url` and drain its result log.
///
/// The session is closed before returning, whether polling succeeded or not.
pub async fn run_browser<B, W>(
    url: &str,
    backend: &mut B,
    supervisor: &mut ProcessSupervisor,
    tap: &mut TapAggregator<W>,
    poller: &PollerConfig,
) -> RunnerResult<usize>
where
    B: BrowserBackend,
    W: Write + Send,
{
    backend.launch(supervisor).await?;

    let mut page = backend.open(url).await?;
    let polled = ResultPoller::new(poller.clone())
        .run(&mut page, tap)
        .await;
    let closed = backend.close().await;

    polled?;
    closed?;

    info!("Test run complete");
    Ok(tap.finish())
}

