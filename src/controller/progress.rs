//! Operator-visible progress lines for a running deployment

use async_trait::async_trait;

/// Sink for human-readable progress of one rollout
///
/// Implementations persist each line immediately so a status poller sees
/// monotonic progress. Failing to persist a line never fails the rollout.
#[async_trait]
pub trait ProgressLog: Send + Sync {
    async fn log(&self, line: String);
}

/// Collects lines in memory for tests
#[cfg(test)]
#[derive(Default)]
pub struct RecordingProgress {
    lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl RecordingProgress {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.lines().iter().any(|l| l.contains(fragment))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ProgressLog for RecordingProgress {
    async fn log(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}
