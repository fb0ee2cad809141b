//! Progress reporting for long runs.

/// Receives progress from a programming or test run.
///
/// All methods default to doing nothing, so a sink only implements what it
/// displays.
pub trait ProgressSink {
    /// One free-text log line (`->> SET EN_12V=ON`, `<<- EN_12V=ON`, ...).
    fn line(&mut self, _text: &str) {}

    /// Short phrase describing the current phase.
    fn status(&mut self, _text: &str) {}

    /// Overall progress, 0..=100.
    fn percent(&mut self, _value: u8) {}

    /// Progress of the current flash write, 0..=100.
    fn flash_percent(&mut self, _value: u8) {}

    /// Progress of the test plan, 0..=100.
    fn test_percent(&mut self, _value: u8) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Sink that records every event, for tests and log capture.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    /// Lines received.
    pub lines: Vec<String>,
    /// Status phrases received.
    pub statuses: Vec<String>,
    /// Overall percentages received.
    pub percents: Vec<u8>,
    /// Flash percentages received.
    pub flash_percents: Vec<u8>,
    /// Test percentages received.
    pub test_percents: Vec<u8>,
}

impl ProgressSink for RecordingSink {
    fn line(&mut self, text: &str) {
        self.lines.push(text.to_string());
    }

    fn status(&mut self, text: &str) {
        self.statuses.push(text.to_string());
    }

    fn percent(&mut self, value: u8) {
        self.percents.push(value);
    }

    fn flash_percent(&mut self, value: u8) {
        self.flash_percents.push(value);
    }

    fn test_percent(&mut self, value: u8) {
        self.test_percents.push(value);
    }
}
