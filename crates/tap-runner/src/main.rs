//! Selenium TAP runner entry point
//!
//! Points a browser at an already running server and streams the page's
//! TAP results to stdout. Exits with the number of failed tests.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use selenium_tap_runner::selenium::SeleniumServerConfig;
use selenium_tap_runner::{
    exit_code, Orchestrator, RunnerOptions, SeleniumBackend, TapAggregator, Target,
};

#[derive(Parser, Debug)]
#[command(name = "selenium-tap-runner")]
#[command(about = "Run browser tests against a server and report them as TAP")]
#[command(version)]
struct Args {
    /// The URL of the server to test against
    #[arg(long)]
    url: String,

    /// The name of the test run
    #[arg(long)]
    name: String,

    /// The browser to launch
    #[arg(short, long, default_value = "chrome")]
    browser: String,

    /// Run the browser headless
    #[arg(long)]
    headless: bool,

    /// Write the chrome driver log to this file
    #[arg(long)]
    chrome_driver_log: Option<PathBuf>,

    /// Enable verbose chrome driver logging
    #[arg(long)]
    chrome_driver_log_verbose: bool,

    /// The port on which to launch the Selenium server
    #[arg(short = 'p', long, env = "SELENIUM_PORT", default_value = "4444")]
    selenium_port: u16,

    /// The directory containing Selenium binaries
    #[arg(
        long,
        env = "SELENIUM_DIR",
        default_value = "node_modules/selenium-standalone/.selenium"
    )]
    selenium_dir: PathBuf,

    /// Connect to a Selenium server that is already running
    #[arg(long)]
    no_launch_server: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // stdout carries the TAP stream, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let options = RunnerOptions {
        browser: args.browser,
        headless: args.headless,
        server: SeleniumServerConfig {
            selenium_dir: args.selenium_dir,
            port: args.selenium_port,
            chrome_driver_log_file: args.chrome_driver_log,
            chrome_verbose_logging: args.chrome_driver_log_verbose,
            ..Default::default()
        },
        launch_server: !args.no_launch_server,
        ..Default::default()
    };

    let runner = Orchestrator::new(
        args.name,
        SeleniumBackend::new(options),
        TapAggregator::stdout(),
    )
    .handle_interrupts(true);

    // Child processes still running after a panic are killed when the
    // runtime drops their tasks on return.
    match runner.execute_isolated(Target::Url(args.url)).await {
        Ok(failures) => ExitCode::from(exit_code(failures)),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
