//! Decouples engine output from any particular presentation (§7b of the
//! design doc). The CLI's progress bars and a test's in-memory collector
//! both implement the same three-method surface.

pub trait Reporter: Send {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards everything. Used by embedders that don't want progress output
/// and by tests that don't care about it.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

#[cfg(test)]
pub(crate) struct CollectingReporter {
    pub info: Vec<String>,
    pub warn: Vec<String>,
    pub error: Vec<String>,
}

#[cfg(test)]
impl CollectingReporter {
    pub(crate) fn new() -> Self {
        Self {
            info: Vec::new(),
            warn: Vec::new(),
            error: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.info.push(msg.to_string());
    }
    fn warn(&mut self, msg: &str) {
        self.warn.push(msg.to_string());
    }
    fn error(&mut self, msg: &str) {
        self.error.push(msg.to_string());
    }
}
