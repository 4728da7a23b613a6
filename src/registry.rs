pub use keep_alive::KeepAlive;
pub use main_type::{LivenessRegistry, LivenessRegistryBuilder};
pub(crate) use main_type::RegistryCore;
pub use subscriber_key::SubscriberKey;
pub use time_update::{ClockEvent, ExpiredEntry, TimeOutBatch};

mod main_type {
    use std::{
        marker::PhantomData,
        panic::{AssertUnwindSafe, catch_unwind},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    };

    use crate::{
        clock::{Clock, ClockTick, MonotonicClock},
        config::LivenessConfig,
        errors::{LivenessError, ResetFailure},
        subscriber::{Subscriber, TimeOutObserver},
        timer_loop::TimerLoop,
    };

    use super::{
        entry::{SubscriberEntry, Table, identity_of},
        keep_alive::KeepAlive,
        subscriber_key::SubscriberKey,
        time_update::{ExpiredEntry, TimeOutBatch},
    };

    /// State shared between the registry handles, the keep-alive handles and
    /// the sweep thread.
    pub(crate) struct RegistryCore<S: Subscriber + ?Sized> {
        table: Mutex<Table<S>>,
        clock: Arc<dyn Clock>,
        observers: Vec<Arc<dyn TimeOutObserver>>,
        config: LivenessConfig,
    }

    impl<S: Subscriber + ?Sized> RegistryCore<S> {
        fn lock_table(&self) -> MutexGuard<'_, Table<S>> {
            match self.table.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    log::debug!("liveness table lock poisoned, recovering");
                    poisoned.into_inner()
                }
            }
        }

        pub(crate) fn record_activity(&self, key: SubscriberKey) -> Result<(), LivenessError> {
            let subscriber = {
                let mut table = self.lock_table();
                let now = self.clock.now();
                let entry = table
                    .entries
                    .get_mut(&key)
                    .ok_or(LivenessError::NotRegistered { key })?;
                entry.touch(now);
                entry.subscriber.clone()
            };
            subscriber.on_observed();
            Ok(())
        }

        pub(crate) fn contains(&self, key: SubscriberKey) -> bool {
            self.lock_table().entries.contains_key(&key)
        }

        /// One sweep pass. With `epoch` set, the pass only runs if that epoch
        /// is the active sweep timer; `None` is returned otherwise.
        pub(crate) fn sweep_pass(
            &self,
            epoch: Option<u64>,
        ) -> Option<Result<TimeOutBatch, LivenessError>> {
            let (batch, evicted) = {
                let mut table = self.lock_table();
                if let Some(epoch) = epoch {
                    if table.timer_epoch() != Some(epoch) {
                        return None;
                    }
                }
                let now = self.clock.now();

                let mut expired_queue: Vec<SubscriberKey> = vec![];
                for entry in table.entries.values_mut() {
                    entry.visit_count += 1;
                    if entry.is_expired(now) {
                        expired_queue.push(entry.key);
                    }
                }

                let mut expired = Vec::with_capacity(expired_queue.len());
                let mut evicted = Vec::with_capacity(expired_queue.len());
                for key in expired_queue {
                    if let Some(entry) = table.remove(key) {
                        expired.push(ExpiredEntry::new(
                            entry.key,
                            entry.time_out,
                            entry.visit_count,
                            now.saturating_since(entry.last_seen),
                        ));
                        evicted.push(entry.subscriber);
                    }
                }
                table.stop_timer_if_idle();
                table.check_timer_invariant();

                log::trace!(
                    "sweep at {:.3}ms: {} expired, {} remaining",
                    now.as_millis_f64(),
                    expired.len(),
                    table.entries.len()
                );
                (TimeOutBatch::new(now, expired), evicted)
            };

            if batch.is_empty() {
                return Some(Ok(batch));
            }

            for observer in &self.observers {
                if catch_unwind(AssertUnwindSafe(|| observer.on_time_out(&batch))).is_err() {
                    log::error!("time out observer panicked on a batch of {}", batch.len());
                }
            }

            let mut failures = vec![];
            for (expired, subscriber) in batch.entries().iter().zip(evicted) {
                log::info!(
                    "subscriber {} evicted, {}",
                    expired.key(),
                    describe_silence(expired.silence(), expired.time_out())
                );
                let reason = match catch_unwind(AssertUnwindSafe(|| subscriber.reset())) {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => panic_message(&*panic),
                };
                log::error!("reset of subscriber {} failed: {}", expired.key(), reason);
                failures.push(ResetFailure {
                    key: expired.key(),
                    reason,
                });
            }

            if failures.is_empty() {
                Some(Ok(batch))
            } else {
                Some(Err(LivenessError::ResetFailed { failures }))
            }
        }
    }

    fn describe_silence(silence: Duration, time_out: Duration) -> String {
        format!("silent {silence:?} (time out {time_out:?})")
    }

    fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
        if let Some(msg) = panic.downcast_ref::<&str>() {
            format!("panicked: {msg}")
        } else if let Some(msg) = panic.downcast_ref::<String>() {
            format!("panicked: {msg}")
        } else {
            "panicked".to_string()
        }
    }

    pub struct LivenessRegistryBuilder<S: Subscriber + ?Sized> {
        observers: Vec<Arc<dyn TimeOutObserver>>,
        clock: Option<Arc<dyn Clock>>,
        config: LivenessConfig,
        phantom_data: PhantomData<fn(Arc<S>)>,
    }
    impl<S: Subscriber + ?Sized> LivenessRegistryBuilder<S> {
        /// Adds an observer receiving every non-empty time out batch.
        pub fn with_time_out_event(&mut self, observer: impl TimeOutObserver) -> &mut Self {
            self.observers.push(Arc::new(observer));
            self
        }
        /// Replaces the default [`MonotonicClock`].
        pub fn with_clock(&mut self, clock: impl Clock) -> &mut Self {
            self.clock = Some(Arc::new(clock));
            self
        }
        /// Builds the registry, taking the observers, clock and config out of
        /// the builder.
        pub fn build(&mut self) -> Result<LivenessRegistry<S>, LivenessError> {
            if self.config.get_timer_loop_refreshing_duration().is_zero() {
                return Err(LivenessError::InvalidSweepPeriod);
            }
            let clock = self
                .clock
                .take()
                .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
            Ok(LivenessRegistry {
                inner: Arc::new(RegistryCore {
                    table: Mutex::new(Table::new()),
                    clock,
                    observers: std::mem::take(&mut self.observers),
                    config: std::mem::take(&mut self.config),
                }),
            })
        }
    }

    /// Supervises subscribers and evicts the ones that stay silent past their
    /// time out.
    ///
    /// Cloning is cheap; every clone drives the same table. The sweep thread
    /// only runs while at least one subscriber is registered.
    pub struct LivenessRegistry<S: Subscriber + ?Sized> {
        inner: Arc<RegistryCore<S>>,
    }
    impl<S: Subscriber + ?Sized> Clone for LivenessRegistry<S> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<S: Subscriber + ?Sized> LivenessRegistry<S> {
        /// Creates a new [`LivenessRegistryBuilder`].
        ///
        /// ### Example
        /// ```rust
        /// use std::{sync::Arc, time::Duration};
        /// use sand_liveness::{BoxError, LivenessConfig, LivenessRegistry, Subscriber};
        ///
        /// struct Peer;
        /// impl Subscriber for Peer {
        ///     fn reset(&self) -> Result<(), BoxError> {
        ///         Ok(())
        ///     }
        /// }
        ///
        /// let registry = LivenessRegistry::<Peer>::new(LivenessConfig::default())
        ///     .with_time_out_event(|batch: &sand_liveness::TimeOutBatch| {
        ///         println!("{} peer(s) timed out", batch.len());
        ///     })
        ///     .build()
        ///     .unwrap();
        ///
        /// let peer = Arc::new(Peer);
        /// let keep_alive = registry.register(peer.clone(), Duration::from_secs(10)).unwrap();
        /// keep_alive.signal_activity().unwrap();
        /// registry.unregister(&peer);
        /// registry.shutdown().unwrap();
        /// ```
        pub fn new(config: LivenessConfig) -> LivenessRegistryBuilder<S> {
            LivenessRegistryBuilder {
                observers: vec![],
                clock: None,
                config,
                phantom_data: PhantomData,
            }
        }

        /// Puts `subscriber` under supervision.
        ///
        /// A zero `time_out` falls back to the configured default. The
        /// returned [`KeepAlive`] must be signalled whenever the subscriber
        /// shows activity. Starts the sweep thread if the table was empty.
        pub fn register(
            &self,
            subscriber: Arc<S>,
            time_out: Duration,
        ) -> Result<KeepAlive<S>, LivenessError> {
            let time_out = self.inner.config.effective_time_out(time_out);
            let key = {
                let mut table = self.inner.lock_table();
                if let Some(key) = table.key_of(identity_of(&subscriber)) {
                    return Err(LivenessError::AlreadyRegistered { key });
                }
                let key = table.next_key();
                let now = self.inner.clock.now();
                table.insert(SubscriberEntry::new(key, subscriber.clone(), time_out, now));

                if table.timer.is_none() {
                    let epoch = table.next_epoch();
                    match TimerLoop::run(&self.inner.config, Arc::downgrade(&self.inner), epoch) {
                        Ok(timer) => table.timer = Some(timer),
                        Err(e) => {
                            table.remove(key);
                            table.check_timer_invariant();
                            return Err(e.into());
                        }
                    }
                }
                table.check_timer_invariant();
                key
            };
            log::debug!("subscriber {key} registered, time out {time_out:?}");
            subscriber.on_observed();
            Ok(KeepAlive::new(key, Arc::downgrade(&self.inner)))
        }

        /// Removes `subscriber` without resetting it. No-op if it is not registered.
        pub fn unregister(&self, subscriber: &Arc<S>) {
            let mut table = self.inner.lock_table();
            let Some(key) = table.key_of(identity_of(subscriber)) else {
                return;
            };
            table.remove(key);
            table.stop_timer_if_idle();
            table.check_timer_invariant();
            log::debug!("subscriber {key} unregistered");
        }

        /// Runs one sweep pass immediately, on the calling thread.
        ///
        /// The sweep thread calls this on its own cadence; calling it by hand
        /// is useful with a [`ManualClock`](crate::ManualClock).
        pub fn sweep(&self) -> Result<TimeOutBatch, LivenessError> {
            self.inner
                .sweep_pass(None)
                .unwrap_or_else(|| Ok(TimeOutBatch::new(self.now(), vec![])))
        }

        /// Checks that every subscriber was unregistered and the sweep thread
        /// is stopped. Remaining entries are left untouched.
        pub fn shutdown(&self) -> Result<(), LivenessError> {
            let table = self.inner.lock_table();
            let remaining = table.entries.len();
            let timer_active = table.timer.is_some();
            if remaining > 0 || timer_active {
                log::warn!(
                    "liveness registry shut down with {remaining} subscriber(s), timer active: {timer_active}"
                );
                return Err(LivenessError::Leaked {
                    remaining,
                    timer_active,
                });
            }
            log::debug!("liveness registry shut down cleanly");
            Ok(())
        }

        pub fn subscriber_count(&self) -> usize {
            self.inner.lock_table().entries.len()
        }

        pub fn is_registered(&self, subscriber: &Arc<S>) -> bool {
            self.inner
                .lock_table()
                .key_of(identity_of(subscriber))
                .is_some()
        }

        /// Whether the sweep thread is currently scheduled.
        pub fn timer_active(&self) -> bool {
            self.inner.lock_table().timer.is_some()
        }

        /// Current tick of the registry's clock.
        pub fn now(&self) -> ClockTick {
            self.inner.clock.now()
        }

        pub fn config(&self) -> &LivenessConfig {
            &self.inner.config
        }
    }
}

mod entry {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
        time::Duration,
    };

    use crate::{clock::ClockTick, subscriber::Subscriber, timer_loop::SweepTimer};

    use super::subscriber_key::SubscriberKey;

    /// Address of the subscriber's allocation. Stable while the registry holds
    /// its `Arc`, which is as long as the entry exists.
    pub(crate) fn identity_of<S: ?Sized>(subscriber: &Arc<S>) -> usize {
        Arc::as_ptr(subscriber).cast::<()>() as usize
    }

    pub(crate) struct SubscriberEntry<S: ?Sized> {
        pub(crate) key: SubscriberKey,
        pub(crate) subscriber: Arc<S>,
        pub(crate) time_out: Duration,
        pub(crate) last_seen: ClockTick,
        pub(crate) visit_count: u64,
    }

    impl<S: ?Sized> SubscriberEntry<S> {
        pub(crate) fn new(
            key: SubscriberKey,
            subscriber: Arc<S>,
            time_out: Duration,
            now: ClockTick,
        ) -> Self {
            Self {
                key,
                subscriber,
                time_out,
                last_seen: now,
                visit_count: 0,
            }
        }
        pub(crate) fn touch(&mut self, now: ClockTick) {
            self.last_seen = self.last_seen.max(now);
        }
        /// Strictly past the time out; an entry exactly at the boundary survives.
        pub(crate) fn is_expired(&self, now: ClockTick) -> bool {
            now.saturating_since(self.last_seen) > self.time_out
        }
    }

    pub(crate) struct Table<S: Subscriber + ?Sized> {
        pub(crate) entries: BTreeMap<SubscriberKey, SubscriberEntry<S>>,
        by_identity: HashMap<usize, SubscriberKey>,
        pub(crate) timer: Option<SweepTimer>,
        last_key: u64,
        last_epoch: u64,
    }

    impl<S: Subscriber + ?Sized> Table<S> {
        pub(crate) fn new() -> Self {
            Self {
                entries: BTreeMap::new(),
                by_identity: HashMap::new(),
                timer: None,
                last_key: 0,
                last_epoch: 0,
            }
        }
        pub(crate) fn next_key(&mut self) -> SubscriberKey {
            self.last_key += 1;
            SubscriberKey::new(self.last_key)
        }
        pub(crate) fn next_epoch(&mut self) -> u64 {
            self.last_epoch += 1;
            self.last_epoch
        }
        pub(crate) fn key_of(&self, identity: usize) -> Option<SubscriberKey> {
            self.by_identity.get(&identity).copied()
        }
        pub(crate) fn insert(&mut self, entry: SubscriberEntry<S>) {
            self.by_identity
                .insert(identity_of(&entry.subscriber), entry.key);
            self.entries.insert(entry.key, entry);
        }
        pub(crate) fn remove(&mut self, key: SubscriberKey) -> Option<SubscriberEntry<S>> {
            let entry = self.entries.remove(&key)?;
            self.by_identity.remove(&identity_of(&entry.subscriber));
            Some(entry)
        }
        pub(crate) fn timer_epoch(&self) -> Option<u64> {
            self.timer.as_ref().map(SweepTimer::epoch)
        }
        /// Dropping the timer disconnects its stop channel; the thread exits
        /// on its next wake-up.
        pub(crate) fn stop_timer_if_idle(&mut self) {
            if self.entries.is_empty() {
                if let Some(timer) = self.timer.take() {
                    log::debug!("sweep timer {} stopped", timer.epoch());
                }
            }
        }
        pub(crate) fn check_timer_invariant(&self) {
            debug_assert_eq!(
                self.timer.is_some(),
                !self.entries.is_empty(),
                "sweep timer must run iff subscribers are registered"
            );
            debug_assert_eq!(self.entries.len(), self.by_identity.len());
        }
    }

}

mod keep_alive {
    use std::sync::Weak;

    use crate::{errors::LivenessError, subscriber::Subscriber};

    use super::{main_type::RegistryCore, subscriber_key::SubscriberKey};

    /// Activity handle returned by [`LivenessRegistry::register`](super::LivenessRegistry::register).
    ///
    /// Signal it whenever the subscriber is known to be alive. Once the
    /// subscriber is unregistered or evicted the handle is dead: keys are
    /// never reused, so it can not refresh a later registration.
    pub struct KeepAlive<S: Subscriber + ?Sized> {
        key: SubscriberKey,
        registry: Weak<RegistryCore<S>>,
    }

    impl<S: Subscriber + ?Sized> Clone for KeepAlive<S> {
        fn clone(&self) -> Self {
            Self {
                key: self.key,
                registry: self.registry.clone(),
            }
        }
    }

    impl<S: Subscriber + ?Sized> std::fmt::Debug for KeepAlive<S> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("KeepAlive").field("key", &self.key).finish()
        }
    }

    impl<S: Subscriber + ?Sized> KeepAlive<S> {
        pub(crate) fn new(key: SubscriberKey, registry: Weak<RegistryCore<S>>) -> Self {
            Self { key, registry }
        }
        pub fn key(&self) -> SubscriberKey {
            self.key
        }
        /// Records activity now and calls the subscriber's `on_observed`.
        ///
        /// Fails with [`LivenessError::NotRegistered`] once the entry is gone.
        pub fn signal_activity(&self) -> Result<(), LivenessError> {
            match self.registry.upgrade() {
                Some(registry) => registry.record_activity(self.key),
                None => Err(LivenessError::NotRegistered { key: self.key }),
            }
        }
        /// Whether the entry behind this handle still exists.
        pub fn is_alive(&self) -> bool {
            self.registry
                .upgrade()
                .is_some_and(|registry| registry.contains(self.key))
        }
    }
}

mod subscriber_key {
    use std::fmt::Display;

    /// Identity of one registration. Assigned in increasing order, never reused.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SubscriberKey(u64);

    impl SubscriberKey {
        pub(crate) fn new(raw: u64) -> Self {
            Self(raw)
        }
        pub fn get(&self) -> u64 {
            self.0
        }
    }

    impl Display for SubscriberKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "#{}", self.0)
        }
    }
}

mod time_update {
    use std::{fmt::Display, time::Duration};

    use crate::clock::ClockTick;

    use super::subscriber_key::SubscriberKey;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ClockEvent {
        TimeOut,
    }

    impl Display for ClockEvent {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::TimeOut => {
                    write!(f, "subscriber time out")
                }
            }
        }
    }

    /// One subscriber evicted by a sweep pass.
    #[derive(Clone, Debug)]
    pub struct ExpiredEntry {
        key: SubscriberKey,
        time_out: Duration,
        visit_count: u64,
        silence: Duration,
    }

    impl ExpiredEntry {
        pub(crate) fn new(
            key: SubscriberKey,
            time_out: Duration,
            visit_count: u64,
            silence: Duration,
        ) -> Self {
            Self {
                key,
                time_out,
                visit_count,
                silence,
            }
        }
        pub fn key(&self) -> SubscriberKey {
            self.key
        }
        pub fn time_out(&self) -> Duration {
            self.time_out
        }
        /// Sweep passes the entry went through, the evicting one included.
        pub fn visit_count(&self) -> u64 {
            self.visit_count
        }
        /// Silence measured at the sweep tick.
        pub fn silence(&self) -> Duration {
            self.silence
        }
    }

    /// Everything one sweep pass evicted, in key order.
    #[derive(Clone, Debug)]
    pub struct TimeOutBatch {
        event: ClockEvent,
        swept_at: ClockTick,
        entries: Vec<ExpiredEntry>,
    }

    impl TimeOutBatch {
        pub(crate) fn new(swept_at: ClockTick, entries: Vec<ExpiredEntry>) -> Self {
            Self {
                event: ClockEvent::TimeOut,
                swept_at,
                entries,
            }
        }
        pub fn event(&self) -> ClockEvent {
            self.event
        }
        /// The single tick every entry of the pass was compared against.
        pub fn swept_at(&self) -> ClockTick {
            self.swept_at
        }
        pub fn entries(&self) -> &[ExpiredEntry] {
            &self.entries
        }
        pub fn keys(&self) -> impl Iterator<Item = SubscriberKey> + '_ {
            self.entries.iter().map(ExpiredEntry::key)
        }
        pub fn len(&self) -> usize {
            self.entries.len()
        }
        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }
    }
}
