//! Selenium standalone server management

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{RunnerError, RunnerResult};
use crate::supervisor::{ProcessId, ProcessSupervisor};

/// Configuration for launching the Selenium server
#[derive(Debug, Clone)]
pub struct SeleniumServerConfig {
    /// Directory holding the server jar and browser drivers
    /// (the layout `selenium-standalone install` produces)
    pub selenium_dir: PathBuf,

    /// Port for the hub
    pub port: u16,

    /// Java executable
    pub java: String,

    /// Write the chrome driver log to this file
    pub chrome_driver_log_file: Option<PathBuf>,

    /// Ask the chrome driver for verbose logging
    pub chrome_verbose_logging: bool,

    /// How long to wait for the hub to answer
    pub startup_timeout: Duration,
}

impl Default for SeleniumServerConfig {
    fn default() -> Self {
        Self {
            selenium_dir: PathBuf::from("node_modules/selenium-standalone/.selenium"),
            port: 4444,
            java: "java".to_string(),
            chrome_driver_log_file: None,
            chrome_verbose_logging: false,
            startup_timeout: Duration::from_secs(60),
        }
    }
}

impl SeleniumServerConfig {
    /// WebDriver endpoint of the hub.
    pub fn hub_url(&self) -> String {
        hub_url(self.port)
    }
}

pub fn hub_url(port: u16) -> String {
    format!("http://localhost:{}/wd/hub", port)
}

/// JVM system properties for driver logging.
pub fn java_args(config: &SeleniumServerConfig) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(log_file) = &config.chrome_driver_log_file {
        args.push(format!("-Dwebdriver.chrome.logfile={}", log_file.display()));
    }

    if config.chrome_verbose_logging {
        args.push("-Dwebdriver.chrome.verboseLogging=true".to_string());
    }

    args
}

/// Find the selenium server jar under `dir`.
pub fn locate_server_jar(dir: &Path) -> RunnerResult<PathBuf> {
    let mut jars: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let name = file_name(path);
            name.ends_with(".jar") && name.contains("server")
        })
        .collect();
    jars.sort();

    jars.pop().ok_or_else(|| {
        RunnerError::AutomationSetup(format!(
            "no selenium server jar under {}. Install with: npx selenium-standalone install",
            dir.display()
        ))
    })
}

/// Find a driver executable (e.g. `chromedriver`) under `dir`.
pub fn locate_driver(dir: &Path, driver: &str) -> Option<PathBuf> {
    let mut drivers: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let name = file_name(path);
            name.contains(driver) && !name.ends_with(".zip") && !name.ends_with(".gz")
        })
        .collect();
    drivers.sort();
    drivers.pop()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Full java command line for the server.
pub fn launch_args(config: &SeleniumServerConfig) -> RunnerResult<Vec<String>> {
    let jar = locate_server_jar(&config.selenium_dir)?;
    let mut args = java_args(config);

    for (property, driver) in [
        ("webdriver.chrome.driver", "chromedriver"),
        ("webdriver.gecko.driver", "geckodriver"),
    ] {
        if let Some(path) = locate_driver(&config.selenium_dir, driver) {
            args.push(format!("-D{}={}", property, path.display()));
        }
    }

    args.push("-jar".to_string());
    args.push(jar.display().to_string());
    args.push("-port".to_string());
    args.push(config.port.to_string());
    Ok(args)
}

/// Start the server under `supervisor` and wait until the hub answers.
pub async fn start_server(
    config: &SeleniumServerConfig,
    supervisor: &mut ProcessSupervisor,
) -> RunnerResult<ProcessId> {
    info!("Starting selenium server...");
    debug!("Using selenium dir: {}", config.selenium_dir.display());
    debug!("Using selenium port: {}", config.port);

    let args = launch_args(config)?;
    let id = supervisor
        .spawn(&config.java, &args)
        .map_err(|e| RunnerError::AutomationSetup(e.to_string()))?;
    // the server is chatty; its stderr is still echoed
    supervisor.get_mut(id).release_output();

    wait_for_hub(config, supervisor, id).await?;
    info!("Started selenium server");
    Ok(id)
}

/// Poll the hub status endpoint until it responds.
async fn wait_for_hub(
    config: &SeleniumServerConfig,
    supervisor: &ProcessSupervisor,
    id: ProcessId,
) -> RunnerResult<()> {
    let status_url = format!("{}/status", config.hub_url());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    let start = Instant::now();
    let mut attempts = 0;

    while start.elapsed() < config.startup_timeout {
        attempts += 1;

        if let Some(exit) = supervisor.get(id).exit() {
            return Err(RunnerError::AutomationSetup(format!(
                "selenium server exited during startup ({})",
                exit.status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "unknown status".to_string())
            )));
        }

        match client.get(&status_url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                warn!("Hub status returned {}", resp.status());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for selenium server to start...");
                }
                // Connection refused is expected while the server is starting
                if !e.is_connect() {
                    warn!("Hub status error: {}", e);
                }
            }
        }

        sleep(Duration::from_millis(250)).await;
    }

    Err(RunnerError::AutomationSetup(format!(
        "selenium hub at {} not ready after {} attempts",
        status_url, attempts
    )))
}
