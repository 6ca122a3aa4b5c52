use std::time::Instant;

// A guard to record the time between creation and drop as a histogram entry, in milliseconds
pub struct TimingGuard {
    name: &'static str,
    labels: Vec<(&'static str, String)>,
    start: Instant,
}

pub fn timing_guard(name: &'static str) -> TimingGuard {
    TimingGuard {
        name,
        labels: Vec::new(),
        start: Instant::now(),
    }
}

impl TimingGuard {
    pub fn label(mut self, key: &'static str, value: &str) -> Self {
        self.labels.push((key, value.to_owned()));
        self
    }

    // Report now rather than at end of scope.
    pub fn fin(self) {}
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let labels: Vec<(&'static str, String)> = std::mem::take(&mut self.labels);
        metrics::histogram!(self.name, labels.as_slice()).record(self.start.elapsed().as_millis() as f64);
    }
}
