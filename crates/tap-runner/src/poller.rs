//! Incremental draining of the page's result log
//!
//! The page under test appends TAP lines to a list and flips a completion
//! flag when it is done. [`ResultPoller`] reads that list one index at a time:
//!
//! ```text
//!   Polling ──(flag set)──> FinalDrain ──(index absent)──> Done
//!     │  ▲
//!     └──┘ fetch next index, or wait `poll_interval` if absent
//! ```
//!
//! The final drain picks up entries written between the last negative flag
//! check and the flag becoming visible. The cursor only moves past entries
//! that were actually read, so every index is forwarded once and in order.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::tap::TapAggregator;

/// A page exposing an indexed result log and a completion flag.
#[async_trait]
pub trait ResultSource: Send {
    /// Whether the page has finished adding entries.
    async fn is_complete(&mut self) -> RunnerResult<bool>;

    /// Text of the entry at `index`, or `None` if it does not exist yet.
    async fn entry(&mut self, index: usize) -> RunnerResult<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause after a poll that found nothing new.
    pub poll_interval: Duration,

    /// Give up after this many consecutive empty polls (None = never; the
    /// watchdog bounds the run instead).
    pub max_idle_polls: Option<u64>,

    /// Transient read failures tolerated at one index during the final drain
    /// before the drain ends.
    pub max_drain_retries: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_idle_polls: None,
            max_drain_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling,
    FinalDrain,
    Done,
}

enum Fetch {
    Entry(String),
    Absent,
    Unreadable,
}

pub struct ResultPoller {
    config: PollerConfig,
    state: PollState,
    cursor: usize,
    idle_polls: u64,
    drain_retries: u32,
}

impl ResultPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            state: PollState::Polling,
            cursor: 0,
            idle_polls: 0,
            drain_retries: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Index of the next entry to read; equals the number consumed so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Run until [`PollState::Done`]. Returns the number of entries consumed.
    pub async fn run<S, W>(
        &mut self,
        source: &mut S,
        tap: &mut TapAggregator<W>,
    ) -> RunnerResult<usize>
    where
        S: ResultSource + ?Sized,
        W: Write + Send,
    {
        while self.step(source, tap).await? != PollState::Done {}
        info!("Result log drained: {} entries", self.cursor);
        Ok(self.cursor)
    }

    /// Perform one iteration of the state machine and return the new state.
    pub async fn step<S, W>(
        &mut self,
        source: &mut S,
        tap: &mut TapAggregator<W>,
    ) -> RunnerResult<PollState>
    where
        S: ResultSource + ?Sized,
        W: Write + Send,
    {
        match self.state {
            PollState::Polling => {
                let complete = match source.is_complete().await {
                    Ok(complete) => complete,
                    Err(e) if e.is_transient() => {
                        debug!("Completion flag unreadable, retrying: {}", e);
                        false
                    }
                    Err(e) => return Err(e),
                };

                if complete {
                    debug!("Completion flag set at index {}, draining", self.cursor);
                    self.state = PollState::FinalDrain;
                    return Ok(self.state);
                }

                match self.fetch(source).await? {
                    Fetch::Entry(text) => {
                        self.forward(tap, &text)?;
                        tokio::task::yield_now().await;
                    }
                    Fetch::Absent | Fetch::Unreadable => self.idle().await?,
                }
            }
            PollState::FinalDrain => match self.fetch(source).await? {
                Fetch::Entry(text) => self.forward(tap, &text)?,
                Fetch::Absent => self.state = PollState::Done,
                Fetch::Unreadable => {
                    self.drain_retries += 1;
                    if self.drain_retries > self.config.max_drain_retries {
                        warn!(
                            "Entry {} still unreadable after {} retries, ending drain",
                            self.cursor, self.config.max_drain_retries
                        );
                        self.state = PollState::Done;
                    } else {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            },
            PollState::Done => {}
        }
        Ok(self.state)
    }

    async fn fetch<S>(&mut self, source: &mut S) -> RunnerResult<Fetch>
    where
        S: ResultSource + ?Sized,
    {
        match source.entry(self.cursor).await {
            Ok(Some(text)) => Ok(Fetch::Entry(text)),
            Ok(None) => Ok(Fetch::Absent),
            Err(e) if e.is_transient() => {
                debug!("Entry {} unreadable, retrying: {}", self.cursor, e);
                Ok(Fetch::Unreadable)
            }
            Err(e) => Err(e),
        }
    }

    fn forward<W: Write>(&mut self, tap: &mut TapAggregator<W>, text: &str) -> RunnerResult<()> {
        tap.consume(text)?;
        self.cursor += 1;
        self.idle_polls = 0;
        self.drain_retries = 0;
        Ok(())
    }

    async fn idle(&mut self) -> RunnerResult<()> {
        self.idle_polls += 1;
        if let Some(max) = self.config.max_idle_polls {
            if self.idle_polls >= max {
                return Err(RunnerError::PollExhausted(self.idle_polls));
            }
        }
        tokio::time::sleep(self.config.poll_interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Log that publishes one more entry every `reveal_every` reads.
    struct GrowingLog {
        entries: Vec<String>,
        visible: usize,
        reads: usize,
        reveal_every: usize,
        complete_when_visible: usize,
        requested: Vec<usize>,
    }

    impl GrowingLog {
        fn new(entries: &[&str], reveal_every: usize) -> Self {
            Self {
                entries: entries.iter().map(|e| e.to_string()).collect(),
                visible: 0,
                reads: 0,
                reveal_every,
                complete_when_visible: entries.len(),
                requested: Vec::new(),
            }
        }

        fn tick(&mut self) {
            self.reads += 1;
            if self.reads % self.reveal_every == 0 && self.visible < self.entries.len() {
                self.visible += 1;
            }
        }
    }

    #[async_trait]
    impl ResultSource for GrowingLog {
        async fn is_complete(&mut self) -> RunnerResult<bool> {
            self.tick();
            Ok(self.visible >= self.complete_when_visible)
        }

        async fn entry(&mut self, index: usize) -> RunnerResult<Option<String>> {
            self.requested.push(index);
            assert!(index <= self.visible, "index {} requested before it could exist", index);
            Ok(self.entries.get(index).filter(|_| index < self.visible).cloned())
        }
    }

    /// Replies from a fixed script of (complete, entry) answers.
    struct ScriptedLog {
        complete: VecDeque<RunnerResult<bool>>,
        entries: VecDeque<RunnerResult<Option<String>>>,
    }

    #[async_trait]
    impl ResultSource for ScriptedLog {
        async fn is_complete(&mut self) -> RunnerResult<bool> {
            self.complete.pop_front().unwrap_or(Ok(true))
        }

        async fn entry(&mut self, _index: usize) -> RunnerResult<Option<String>> {
            self.entries.pop_front().unwrap_or(Ok(None))
        }
    }

    fn stale() -> RunnerError {
        RunnerError::WebDriver {
            error: "stale element reference".into(),
            message: "element is not attached to the page document".into(),
        }
    }

    fn lines(tap: TapAggregator<Vec<u8>>) -> Vec<String> {
        String::from_utf8(tap.into_inner())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn consumes_every_entry_once_in_order() {
        let entries = ["ok 1 - a", "not ok 2 - b", "ok 3 - c", "# done"];
        for reveal_every in 1..=4 {
            let mut log = GrowingLog::new(&entries, reveal_every);
            let mut tap = TapAggregator::new(Vec::new());
            let mut poller = ResultPoller::new(PollerConfig::default());

            let consumed = poller.run(&mut log, &mut tap).await.unwrap();

            assert_eq!(consumed, 4);
            assert_eq!(poller.state(), PollState::Done);
            assert_eq!(tap.failures(), 1);
            assert_eq!(lines(tap), entries);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn final_drain_collects_entries_written_before_the_flag() {
        // Flag flips while indexes 1..=3 are already in the list but unread.
        let mut log = ScriptedLog {
            complete: VecDeque::from(vec![Ok(false), Ok(true)]),
            entries: VecDeque::from(vec![
                Ok(Some("ok 1 - a".to_string())),
                Ok(Some("ok 2 - b".to_string())),
                Ok(Some("not ok 3 - c".to_string())),
                Ok(Some("ok 4 - d".to_string())),
                Ok(None),
            ]),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let mut poller = ResultPoller::new(PollerConfig::default());

        assert_eq!(poller.step(&mut log, &mut tap).await.unwrap(), PollState::Polling);
        assert_eq!(poller.cursor(), 1);
        assert_eq!(poller.step(&mut log, &mut tap).await.unwrap(), PollState::FinalDrain);

        poller.run(&mut log, &mut tap).await.unwrap();
        assert_eq!(poller.cursor(), 4);
        assert_eq!(tap.failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn final_drain_retries_an_entry_still_being_written() {
        // Index 3 exists but its text is not readable on the first attempt.
        let mut log = ScriptedLog {
            complete: VecDeque::from(vec![Ok(false), Ok(false), Ok(false), Ok(true)]),
            entries: VecDeque::from(vec![
                Ok(Some("ok 1".to_string())),
                Ok(Some("ok 2".to_string())),
                Ok(Some("ok 3".to_string())),
                Err(stale()),
                Ok(Some("not ok 4".to_string())),
                Ok(None),
            ]),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let mut poller = ResultPoller::new(PollerConfig::default());

        poller.run(&mut log, &mut tap).await.unwrap();

        assert_eq!(poller.cursor(), 4);
        assert_eq!(lines(tap), ["ok 1", "ok 2", "ok 3", "not ok 4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_entry_is_retried_not_counted() {
        let mut log = ScriptedLog {
            complete: VecDeque::from(vec![Ok(false), Err(stale()), Ok(false), Ok(true)]),
            entries: VecDeque::from(vec![
                Err(stale()),
                Ok(None),
                Ok(Some("ok 1 - eventually".to_string())),
                Ok(None),
            ]),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let mut poller = ResultPoller::new(PollerConfig::default());

        poller.run(&mut log, &mut tap).await.unwrap();

        assert_eq!(tap.failures(), 0);
        assert_eq!(lines(tap), ["ok 1 - eventually"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_polls_wait_for_the_interval() {
        let mut log = ScriptedLog {
            complete: VecDeque::from(vec![Ok(false), Ok(false), Ok(true)]),
            entries: VecDeque::from(vec![Ok(None), Ok(None), Ok(None)]),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let config = PollerConfig {
            poll_interval: Duration::from_millis(200),
            ..Default::default()
        };
        let mut poller = ResultPoller::new(config);

        let start = tokio::time::Instant::now();
        poller.run(&mut log, &mut tap).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ceiling_stops_a_stuck_page() {
        let mut log = ScriptedLog {
            complete: (0..10).map(|_| Ok(false)).collect(),
            entries: (0..10).map(|_| Ok(None)).collect(),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let mut poller = ResultPoller::new(PollerConfig {
            max_idle_polls: Some(3),
            ..Default::default()
        });

        let err = poller.run(&mut log, &mut tap).await.unwrap_err();
        assert!(matches!(err, RunnerError::PollExhausted(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_propagate() {
        let mut log = ScriptedLog {
            complete: VecDeque::from(vec![Err(RunnerError::WebDriver {
                error: "invalid session id".into(),
                message: "session deleted".into(),
            })]),
            entries: VecDeque::new(),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let mut poller = ResultPoller::new(PollerConfig::default());

        assert!(poller.run(&mut log, &mut tap).await.is_err());
        assert_eq!(poller.state(), PollState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn done_issues_no_reads() {
        let mut log = ScriptedLog {
            complete: VecDeque::from(vec![Ok(true)]),
            entries: VecDeque::from(vec![Ok(None)]),
        };
        let mut tap = TapAggregator::new(Vec::new());
        let mut poller = ResultPoller::new(PollerConfig::default());
        poller.run(&mut log, &mut tap).await.unwrap();

        log.entries.push_back(Ok(Some("ok 1 - late".to_string())));
        assert_eq!(poller.step(&mut log, &mut tap).await.unwrap(), PollState::Done);
        assert_eq!(log.entries.len(), 1);
        assert_eq!(tap.consumed(), 0);
    }
}
