//! Construction-time reporting.
//!
//! Layer builders describe what they built through a [`Reporter`] supplied by
//! the caller instead of writing to a process-wide stream.

use tracing::{info, warn};

pub trait Reporter {
    /// Called once per constructed layer with its one-line summary.
    fn layer_built(&mut self, index: usize, summary: &str);

    /// Recovered, non-fatal conditions (e.g. an unknown option that fell back
    /// to its default).
    fn notice(&mut self, message: &str);
}

/// Forwards reports to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn layer_built(&mut self, index: usize, summary: &str) {
        info!(layer = index, "{summary}");
    }

    fn notice(&mut self, message: &str) {
        warn!("{message}");
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    pub layers: Vec<(usize, String)>,
    pub notices: Vec<String>,
}

impl Reporter for CollectingReporter {
    fn layer_built(&mut self, index: usize, summary: &str) {
        self.layers.push((index, summary.to_string()));
    }

    fn notice(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }
}
