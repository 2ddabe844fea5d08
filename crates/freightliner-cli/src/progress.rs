//! Progress reporting module with TTY detection.
//!
//! This module provides a [`Reporter`] implementation that prints leveled
//! lines, using a spinner in TTY mode and falling back to plain lines when
//! stderr is not a terminal (piped output, CI logs).

use std::time::Instant;

use atty::Stream;
use freightliner::reporter::Reporter;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stderr is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stderr)
}

/// Leveled-line [`Reporter`] for the `freightliner` binary. In TTY mode,
/// lines print above a spinner tracking elapsed time; otherwise every line
/// goes straight to stderr.
pub struct CliReporter {
    spinner: Option<ProgressBar>,
    start_time: Instant,
}

impl CliReporter {
    pub fn new() -> Self {
        let spinner = if is_tty() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {elapsed_precise} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(std::time::Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    fn emit(&self, level: &str, msg: &str) {
        match &self.spinner {
            Some(pb) => pb.println(format!("[{level}] {msg}")),
            None => eprintln!("[{level}] {msg}"),
        }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        self.emit("info", msg);
        if let Some(pb) = &self.spinner {
            pb.set_message(msg.to_string());
        }
    }

    fn warn(&mut self, msg: &str) {
        self.emit("warn", msg);
    }

    fn error(&mut self, msg: &str) {
        self.emit("error", msg);
    }
}

impl Drop for CliReporter {
    fn drop(&mut self) {
        if let Some(pb) = self.spinner.take() {
            let elapsed = self.start_time.elapsed();
            pb.finish_with_message(format!("done in {elapsed:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_tty_returns_bool() {
        let result = is_tty();
        assert!(matches!(result, true | false));
    }

    #[test]
    fn reporter_methods_are_callable_without_a_tty() {
        // Test runs are never attached to a real stderr TTY, so this
        // exercises the non-spinner branch.
        let mut reporter = CliReporter::new();
        reporter.info("starting");
        reporter.warn("heads up");
        reporter.error("boom");
    }
}
