mod clock;
mod config;
mod errors;
mod registry;
mod subscriber;
mod timer_loop;

pub use clock::{Clock, ClockTick, ManualClock, MonotonicClock};
pub use config::LivenessConfig;
pub use errors::{BoxError, LivenessError, ResetFailure};
pub use registry::{
    ClockEvent, ExpiredEntry, KeepAlive, LivenessRegistry, LivenessRegistryBuilder,
    SubscriberKey, TimeOutBatch,
};
pub use subscriber::{Subscriber, TimeOutObserver};

pub mod prelude {
    pub use super::{
        BoxError, ClockEvent, KeepAlive, LivenessConfig, LivenessError, LivenessRegistry,
        Subscriber, TimeOutBatch,
    };
}
