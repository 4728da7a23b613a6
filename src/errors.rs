use thiserror::Error;

use crate::registry::SubscriberKey;

/// Boxed error a subscriber may return from [`Subscriber::reset`](crate::Subscriber::reset).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One subscriber whose `reset()` failed during an eviction batch.
#[derive(Debug)]
pub struct ResetFailure {
    pub key: SubscriberKey,
    pub reason: String,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LivenessError {
    /// The subscriber is already under supervision.
    #[error("subscriber already registered under key {key}")]
    AlreadyRegistered { key: SubscriberKey },

    /// Activity was signalled through a handle whose entry is gone.
    #[error("no active entry for key {key}")]
    NotRegistered { key: SubscriberKey },

    #[error("sweep period must be greater than zero")]
    InvalidSweepPeriod,

    /// `shutdown()` found entries or a running sweep timer.
    #[error("registry leaked {remaining} subscriber(s), timer active: {timer_active}")]
    Leaked {
        remaining: usize,
        timer_active: bool,
    },

    /// Every eviction of the batch ran, but some resets failed.
    #[error("{} subscriber reset(s) failed", failures.len())]
    ResetFailed { failures: Vec<ResetFailure> },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LivenessError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LivenessError::AlreadyRegistered { .. } => "liveness_already_registered",
            LivenessError::NotRegistered { .. } => "liveness_not_registered",
            LivenessError::InvalidSweepPeriod => "liveness_invalid_sweep_period",
            LivenessError::Leaked { .. } => "liveness_leaked",
            LivenessError::ResetFailed { .. } => "liveness_reset_failed",
            LivenessError::Io(_) => "liveness_io",
        }
    }
}
