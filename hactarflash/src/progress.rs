//! Status reporting from a flashing run.
//!
//! Protocol clients and the orchestrator never print. They hand
//! [`StatusLine`]s and [`VerifyProgress`] records to a [`ProgressSink`],
//! and every line is mirrored into the `log` facade.

use log::{debug, error, info, warn};

/// Severity of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Normal progress.
    Info,
    /// Recoverable problem, usually followed by a retry.
    Warning,
    /// Stage failure.
    Error,
    /// Detail for troubleshooting.
    Debug,
}

/// One human-readable status message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// Severity.
    pub severity: Severity,
    /// Message text.
    pub text: String,
    /// The line is a progress update that overwrites the previous line.
    pub replace_previous: bool,
}

impl StatusLine {
    /// A line appended after the previous one.
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            replace_previous: false,
        }
    }

    /// A progress update replacing the previous line.
    pub fn replacing(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            replace_previous: true,
        }
    }
}

/// Verification state after one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyProgress {
    /// Address of the chunk just checked.
    pub address: u32,
    /// Percentage of the region checked so far.
    pub percent: u8,
    /// The chunk did not match.
    pub failed: bool,
}

/// Part of a target's update a client has entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Erasing flash, including the erase check.
    Erasing,
    /// Writing image data.
    Writing,
    /// Checking written data.
    Verifying,
}

/// Receives status from a flashing run.
pub trait ProgressSink {
    /// A status line.
    fn status(&mut self, line: StatusLine);

    /// Full verification advanced by one chunk.
    fn verify(&mut self, _progress: VerifyProgress) {}

    /// Overall completion of the current stage.
    fn percent(&mut self, _stage: &str, _percent: u8) {}

    /// A client moved on to `phase`.
    fn phase(&mut self, _phase: Phase) {}
}

impl dyn ProgressSink + '_ {
    fn emit(&mut self, line: StatusLine) {
        if line.replace_previous {
            debug!("{}", line.text);
        } else {
            match line.severity {
                Severity::Info => info!("{}", line.text),
                Severity::Warning => warn!("{}", line.text),
                Severity::Error => error!("{}", line.text),
                Severity::Debug => debug!("{}", line.text),
            }
        }
        self.status(line);
    }

    /// Append an info line.
    pub fn info(&mut self, text: impl Into<String>) {
        self.emit(StatusLine::new(Severity::Info, text));
    }

    /// Append a warning line.
    pub fn warning(&mut self, text: impl Into<String>) {
        self.emit(StatusLine::new(Severity::Warning, text));
    }

    /// Append an error line.
    pub fn error(&mut self, text: impl Into<String>) {
        self.emit(StatusLine::new(Severity::Error, text));
    }

    /// Append a debug line.
    pub fn debug(&mut self, text: impl Into<String>) {
        self.emit(StatusLine::new(Severity::Debug, text));
    }

    /// Replace the previous line with an info-level progress update.
    pub fn update(&mut self, text: impl Into<String>) {
        self.emit(StatusLine::replacing(Severity::Info, text));
    }
}

/// Sink that keeps nothing; the `log` mirror is the only output.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn status(&mut self, _line: StatusLine) {}
}

/// Sink that records everything, for inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    /// Status lines in arrival order.
    pub lines: Vec<StatusLine>,
    /// Verification records in arrival order.
    pub verifies: Vec<VerifyProgress>,
    /// `(stage, percent)` updates in arrival order.
    pub percents: Vec<(String, u8)>,
    /// Phase changes in arrival order.
    pub phases: Vec<Phase>,
}

impl RecordingSink {
    /// Whether any recorded line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .iter()
            .any(|line| {
                line.text
                    .contains(needle)
            })
    }
}

impl ProgressSink for RecordingSink {
    fn status(&mut self, line: StatusLine) {
        self.lines
            .push(line);
    }

    fn verify(&mut self, progress: VerifyProgress) {
        self.verifies
            .push(progress);
    }

    fn percent(&mut self, stage: &str, percent: u8) {
        self.percents
            .push((stage.to_string(), percent));
    }

    fn phase(&mut self, phase: Phase) {
        self.phases
            .push(phase);
    }
}

/// `done` out of `total` as a whole percentage, 100 when `total` is zero.
pub(crate) fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let wide = |n: usize| u128::from(u64::try_from(n).unwrap_or(u64::MAX));
    let percent = wide(done.min(total)) * 100 / wide(total);
    u8::try_from(percent).unwrap_or(100)
}
