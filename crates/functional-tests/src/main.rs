//! Browser functional test harness
//!
//! Starts the functional test server with `dotnet`, waits for its
//! `Now listening on:` line, runs the browser tests against that URL and exits
//! with the number of failures. The whole run is capped at ten minutes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use selenium_tap_runner::selenium::SeleniumServerConfig;
use selenium_tap_runner::watchdog::DEFAULT_CEILING;
use selenium_tap_runner::{
    exit_code, Orchestrator, RunnerError, RunnerOptions, SeleniumBackend, ServiceCommand,
    TapAggregator, Target, Watchdog,
};

/// Extra time the hard-stop thread gives the async teardown.
const HARD_STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "run-functional-tests")]
#[command(about = "Run the browser functional tests against a freshly started server")]
struct Args {
    /// Launch the Release build instead of Debug
    #[arg(long)]
    release: bool,

    /// Functional tests project directory (contains `bin/`)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Target framework folder of the build output
    #[arg(long, default_value = "netcoreapp2.1")]
    framework: String,

    /// Server assembly to launch
    #[arg(long, default_value = "FunctionalTests.dll")]
    server_assembly: String,

    /// Command used to launch the server assembly
    #[arg(long, env = "DOTNET", default_value = "dotnet")]
    dotnet: String,

    /// Name reported in the TAP stream
    #[arg(long, default_value = "SignalR Browser Functional Tests")]
    run_name: String,

    /// Browser to launch
    #[arg(long, default_value = "chrome")]
    browser: String,

    /// Run the browser headless (`--headless false` to watch it)
    #[arg(
        long,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    headless: bool,

    /// Port for the Selenium server
    #[arg(long, env = "SELENIUM_PORT", default_value = "4444")]
    selenium_port: u16,

    /// Directory containing Selenium binaries
    #[arg(
        long,
        env = "SELENIUM_DIR",
        default_value = "../selenium-tap-runner/node_modules/selenium-standalone/.selenium"
    )]
    selenium_dir: PathBuf,

    /// Write the chrome driver log to this file
    #[arg(long)]
    chrome_driver_log: Option<PathBuf>,

    /// Enable verbose chrome driver logging
    #[arg(long)]
    chrome_driver_log_verbose: bool,
}

impl Args {
    fn configuration(&self) -> &'static str {
        if self.release {
            "Release"
        } else {
            "Debug"
        }
    }
}

/// `<project>/bin/<configuration>/<framework>/<assembly>`
fn server_path(
    project_dir: &Path,
    configuration: &str,
    framework: &str,
    assembly: &str,
) -> PathBuf {
    project_dir
        .join("bin")
        .join(configuration)
        .join(framework)
        .join(assembly)
}

fn resolve_server(args: &Args) -> anyhow::Result<PathBuf> {
    let path = server_path(
        &args.project_dir,
        args.configuration(),
        &args.framework,
        &args.server_assembly,
    );
    ensure!(
        path.is_file(),
        "server assembly not found at {} (build the {} configuration first)",
        path.display(),
        args.configuration()
    );
    path.canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Don't let us hang the build: the watchdog starts before anything else
    let watchdog = Watchdog::start(DEFAULT_CEILING);
    watchdog.arm_hard_stop(HARD_STOP_GRACE);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let server = match resolve_server(&args) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let options = RunnerOptions {
        browser: args.browser.clone(),
        headless: args.headless,
        server: SeleniumServerConfig {
            selenium_dir: args.selenium_dir.clone(),
            port: args.selenium_port,
            chrome_driver_log_file: args.chrome_driver_log.clone(),
            chrome_verbose_logging: args.chrome_driver_log_verbose,
            ..Default::default()
        },
        ..Default::default()
    };

    let service = ServiceCommand::new(args.dotnet.clone(), vec![server.display().to_string()]);

    let runner = Orchestrator::new(
        args.run_name.clone(),
        SeleniumBackend::new(options),
        TapAggregator::stdout(),
    )
    .with_watchdog(watchdog)
    .handle_interrupts(true);

    match runner.execute_isolated(Target::Service(service)).await {
        Ok(failures) => ExitCode::from(exit_code(failures)),
        // the bail out reason is already on stdout and stderr
        Err(RunnerError::GlobalTimeout(_)) => ExitCode::FAILURE,
        Err(e) => {
            error!("Run aborted: {}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
