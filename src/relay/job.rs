use std::fmt::{Display, Formatter};

use tokio::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Admitted,
    Resolving,
    Transcoding,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Admitted, Resolving) => true,
            (Resolving, Transcoding) => true,
            (Transcoding, Streaming) => true,
            (Streaming, Completed) => true,
            (Resolving | Transcoding | Streaming, Cancelled) => true,
            (Admitted | Resolving | Transcoding | Streaming, Failed) => true,
            _ => false,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Admitted => "admitted",
            Self::Resolving => "resolving",
            Self::Transcoding => "transcoding",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One request's resolve → transcode → stream lifecycle.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    locator: String,
    state: JobState,
    acquired_at: Instant,
    bytes_sent: u64,
}

impl Job {
    pub fn new(locator: &str, acquired_at: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            locator: locator.to_string(),
            state: JobState::Admitted,
            acquired_at,
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn elapsed(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn record_sent(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    /// Moves to `next`, refusing transitions the lifecycle does not allow.
    /// Returns whether the transition happened.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            log::error!(
                "Job {}: illegal transition {} -> {}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        log::debug!("Job {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        true
    }

    pub fn outcome(&self) -> JobOutcome {
        JobOutcome {
            id: self.id,
            state: self.state,
            bytes_sent: self.bytes_sent,
            elapsed: self.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub id: Uuid,
    pub state: JobState,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

impl Display for JobOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job {} {} after {:?}, {} bytes",
            self.id, self.state, self.elapsed, self.bytes_sent
        )
    }
}
