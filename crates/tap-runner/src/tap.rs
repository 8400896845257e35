//! TAP version 13 output

use std::io::{self, Write};

use crate::error::RunnerResult;

/// Prefix that marks a failed test line.
pub const FAILURE_PREFIX: &str = "not ok";

/// Whether a result line reports a failure.
///
/// Anchored, case-sensitive prefix check; directives and comments are not
/// failures.
pub fn is_failure(line: &str) -> bool {
    line.starts_with(FAILURE_PREFIX)
}

/// Writes the TAP stream and counts failures.
pub struct TapAggregator<W: Write> {
    out: W,
    failures: usize,
    consumed: usize,
}

impl TapAggregator<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TapAggregator<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            failures: 0,
            consumed: 0,
        }
    }

    /// Version line followed by a comment naming the run.
    pub fn emit_preamble(&mut self, run_name: &str) -> RunnerResult<()> {
        writeln!(self.out, "TAP version 13")?;
        writeln!(self.out, "# {}", run_name)?;
        self.out.flush()?;
        Ok(())
    }

    /// Record one result line and write it through verbatim.
    pub fn consume(&mut self, line: &str) -> RunnerResult<()> {
        if is_failure(line) {
            self.failures += 1;
        }
        self.consumed += 1;
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        Ok(())
    }

    /// Abort the stream with a `Bail out!` directive.
    pub fn bail_out(&mut self, reason: &str) -> RunnerResult<()> {
        writeln!(self.out, "Bail out! {}", reason)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Final failure count.
    pub fn finish(&self) -> usize {
        self.failures
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ok 1 - works", false)]
    #[test_case("not ok 2 - broken", true)]
    #[test_case("# diagnostic", false)]
    #[test_case("Not ok 3 - wrong case", false)]
    #[test_case(" not ok 4 - indented", false)]
    #[test_case("not ok", true)]
    #[test_case("ok 5 - not ok in description", false)]
    fn classifies_lines(line: &str, failure: bool) {
        assert_eq!(is_failure(line), failure);
    }

    #[test]
    fn writes_preamble_and_lines_verbatim() {
        let mut tap = TapAggregator::new(Vec::new());
        tap.emit_preamble("SignalR Browser Functional Tests").unwrap();
        tap.consume("ok 1 - a").unwrap();
        tap.consume("not ok 2 - b").unwrap();
        tap.consume("# skipped: c").unwrap();

        assert_eq!(tap.finish(), 1);
        assert_eq!(tap.consumed(), 3);
        let text = String::from_utf8(tap.into_inner()).unwrap();
        assert_eq!(
            text,
            "TAP version 13\n# SignalR Browser Functional Tests\nok 1 - a\nnot ok 2 - b\n# skipped: c\n"
        );
    }

    #[test]
    fn finish_does_not_write() {
        let mut tap = TapAggregator::new(Vec::new());
        tap.consume("not ok 1 - x").unwrap();
        let before = tap.out.len();
        assert_eq!(tap.finish(), 1);
        assert_eq!(tap.finish(), 1);
        assert_eq!(tap.into_inner().len(), before);
    }

    #[test]
    fn bail_out_line() {
        let mut tap = TapAggregator::new(Vec::new());
        tap.bail_out("Tests took more than 10 minutes to run. Aborting.")
            .unwrap();
        let text = String::from_utf8(tap.into_inner()).unwrap();
        assert_eq!(
            text,
            "Bail out! Tests took more than 10 minutes to run. Aborting.\n"
        );
    }
}
