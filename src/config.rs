use std::time::Duration;

pub(crate) const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_millis(1000);
pub(crate) const DEFAULT_TIME_OUT: Duration = Duration::from_millis(1000);

/// Settings shared by every subscriber of a [`LivenessRegistry`](crate::LivenessRegistry).
#[derive(Clone, Debug)]
pub struct LivenessConfig {
    refresh_duration: Duration,
    default_time_out: Duration,
    thread_name: String,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            refresh_duration: DEFAULT_SWEEP_PERIOD,
            default_time_out: DEFAULT_TIME_OUT,
            thread_name: "liveness-sweep".to_string(),
        }
    }
}
impl LivenessConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Period between two sweep passes.
    pub fn get_timer_loop_refreshing_duration(&self) -> Duration {
        self.refresh_duration
    }
    /// Timeout applied when a subscriber registers with a zero timeout.
    pub fn get_default_time_out(&self) -> Duration {
        self.default_time_out
    }
    pub fn get_thread_name(&self) -> &str {
        &self.thread_name
    }
    /// Sets the sweep cadence. A zero period is rejected when the registry is built.
    pub fn frequence(mut self, frequence_duration: Duration) -> Self {
        self.refresh_duration = frequence_duration;
        self
    }
    /// Sets the fallback timeout. Zero is ignored and keeps the previous value.
    pub fn default_time_out(mut self, time_out: Duration) -> Self {
        if !time_out.is_zero() {
            self.default_time_out = time_out;
        }
        self
    }
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub(crate) fn effective_time_out(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.default_time_out
        } else {
            requested
        }
    }
}
