use crossbeam_channel::{Sender, TrySendError};

use crate::{errors::BoxError, registry::TimeOutBatch};

/// Capability every supervised entity must provide.
///
/// A subscriber is identified by its `Arc` allocation: the same `Arc` (or any
/// clone of it) can be registered only once at a time.
///
/// ### Example
/// ```rust
/// use sand_liveness::{BoxError, Subscriber};
///
/// struct Session;
///
/// impl Subscriber for Session {
///     fn reset(&self) -> Result<(), BoxError> {
///         // drop buffered state, close the socket...
///         Ok(())
///     }
/// }
/// ```
pub trait Subscriber: Send + Sync + 'static {
    /// Called once when the registry evicts this subscriber for silence.
    ///
    /// The entry is already gone from the registry when this runs, so the
    /// subscriber may register itself again from here.
    fn reset(&self) -> Result<(), BoxError>;

    /// Called after each recorded activity, registration included.
    fn on_observed(&self) {}
}

/// Receives the batch of subscribers evicted by one sweep pass.
///
/// Observers run on the thread driving the sweep, after the evicted entries
/// have been removed and before their `reset()` calls.
pub trait TimeOutObserver: Send + Sync + 'static {
    fn on_time_out(&self, batch: &TimeOutBatch);
}

impl<F> TimeOutObserver for F
where
    F: Fn(&TimeOutBatch) + Send + Sync + 'static,
{
    fn on_time_out(&self, batch: &TimeOutBatch) {
        (self)(batch)
    }
}

/// Never blocks the sweep: a full or disconnected channel drops the batch
/// with a warning.
impl TimeOutObserver for Sender<TimeOutBatch> {
    fn on_time_out(&self, batch: &TimeOutBatch) {
        match self.try_send(batch.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                log::warn!(
                    "time out observer channel full, dropped batch of {}",
                    batch.len()
                );
            }
            Err(TrySendError::Disconnected(batch)) => {
                log::warn!(
                    "time out observer channel disconnected, dropped batch of {}",
                    batch.len()
                );
            }
        }
    }
}
