//! Global run-time ceiling

use std::io::Write;
use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

/// Ten minutes, the longest a full browser run is allowed to take.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(10 * 60);

/// A single deadline for the whole run.
///
/// [`expired`](Watchdog::expired) is raced against the run so teardown still
/// happens; [`arm_hard_stop`](Watchdog::arm_hard_stop) is the backstop for a
/// run that cannot even reach teardown.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    ceiling: Duration,
    deadline: Instant,
}

impl Watchdog {
    pub fn start(ceiling: Duration) -> Self {
        Self {
            ceiling,
            deadline: Instant::now() + ceiling,
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Resolves when the ceiling is reached.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }

    /// Reason text for the `Bail out!` line.
    pub fn reason(&self) -> String {
        format!(
            "Tests took more than {} to run. Aborting.",
            describe(self.ceiling)
        )
    }

    /// Exit the process from a plain OS thread once `ceiling + grace` has
    /// passed, whatever the async side is doing.
    pub fn arm_hard_stop(&self, grace: Duration) {
        let limit = self.remaining() + grace;
        let reason = self.reason();
        std::thread::spawn(move || {
            std::thread::sleep(limit);
            error!("Watchdog hard stop after {:?}", limit);
            eprintln!("{}", reason);
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "Bail out! {}", reason);
            let _ = stdout.flush();
            std::process::exit(1);
        });
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::start(DEFAULT_CEILING)
    }
}

fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => format!("{}ms", duration.as_millis()),
        60 => "1 minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_the_default_ceiling() {
        let watchdog = Watchdog::start(DEFAULT_CEILING);
        assert_eq!(
            watchdog.reason(),
            "Tests took more than 10 minutes to run. Aborting."
        );
    }

    #[test]
    fn describes_short_ceilings() {
        assert_eq!(describe(Duration::from_secs(1)), "1 second");
        assert_eq!(describe(Duration::from_secs(90)), "90 seconds");
        assert_eq!(describe(Duration::from_millis(250)), "250ms");
    }

    #[tokio::test(start_paused = true)]
    async fn expires_at_the_ceiling() {
        let watchdog = Watchdog::start(Duration::from_secs(600));
        let start = Instant::now();
        watchdog.expired().await;
        assert!(start.elapsed() >= Duration::from_secs(600));
        assert_eq!(watchdog.remaining(), Duration::ZERO);
    }
}
