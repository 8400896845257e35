//! Selenium TAP Runner
//!
//! Runs browser functional tests against a server and reports them as a TAP
//! stream:
//! - Spawns the service under test and waits for its readiness line
//! - Starts a Selenium server and drives a browser over WebDriver
//! - Drains the TAP lines the page renders into the DOM until it signals
//!   completion
//! - Bounds the whole run with a watchdog and tears everything down on every
//!   exit path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ProcessSupervisor                                          │
//! │    ├── spawn(command, args) -> ProcessId                    │
//! │    ├── wait_for_ready(id, pattern) -> url   (LineMatcher)   │
//! │    └── shutdown()                           (once)          │
//! │  BrowserBackend (Selenium + WebDriver)                      │
//! │    ├── launch(supervisor)                                   │
//! │    ├── open(url) -> DomResultLog                            │
//! │    └── close()                                              │
//! │  ResultPoller: Polling -> FinalDrain -> Done                │
//! │    └── TapAggregator -> stdout, failure count               │
//! │  Watchdog: 10 minute ceiling, "Bail out!"                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod error;
pub mod matcher;
pub mod poller;
pub mod runner;
pub mod selenium;
pub mod supervisor;
pub mod tap;
pub mod watchdog;
pub mod webdriver;

pub use browser::{BrowserBackend, DomProtocol, RunnerOptions, SeleniumBackend};
pub use error::{RunnerError, RunnerResult};
pub use matcher::{LineMatcher, ReadinessMatch, ReadinessPattern};
pub use poller::{PollState, PollerConfig, ResultPoller, ResultSource};
pub use runner::{Orchestrator, ServiceCommand, Target};
pub use supervisor::{ChildProcessHandle, KillOutcome, ProcessSupervisor};
pub use tap::TapAggregator;
pub use watchdog::Watchdog;

/// Map a failure count to a process exit code.
///
/// Counts above 255 would wrap on Unix, so they are clamped.
pub fn exit_code(failures: usize) -> u8 {
    failures.min(255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_the_failure_count() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(2), 2);
        assert_eq!(exit_code(256), 255);
    }
}
