use std::{
    sync::Weak,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Sender, select};

use crate::{config::LivenessConfig, registry::RegistryCore, subscriber::Subscriber};

/// Handle on a running sweep thread. Dropping it stops the thread.
pub(crate) struct SweepTimer {
    epoch: u64,
    _stop: Sender<()>,
    _handle: JoinHandle<()>,
}

impl SweepTimer {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub(crate) struct TimerLoop;

impl TimerLoop {
    /// Spawns the sweep thread. Each period it runs one sweep pass over the
    /// registry, as long as `epoch` is still the registry's active timer.
    ///
    /// The thread exits when the returned [`SweepTimer`] is dropped, when the
    /// registry is dropped, or when a newer timer has replaced it.
    pub(crate) fn run<S: Subscriber + ?Sized>(
        config: &LivenessConfig,
        registry: Weak<RegistryCore<S>>,
        epoch: u64,
    ) -> std::io::Result<SweepTimer> {
        let refresh_duration = config.get_timer_loop_refreshing_duration();
        let (stop_sender, stop_receiver) = crossbeam_channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(config.get_thread_name().to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(refresh_duration);
                log::debug!("sweep timer {epoch} started, period {refresh_duration:?}");
                loop {
                    select! {
                        recv(stop_receiver) -> _ => break,
                        recv(ticker) -> _ => {}
                    }
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    match registry.sweep_pass(Some(epoch)) {
                        None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("sweep timer {epoch}: {} [{}]", e, e.as_label());
                        }
                    }
                }
                log::trace!("sweep timer {epoch} exited");
            })?;

        Ok(SweepTimer {
            epoch,
            _stop: stop_sender,
            _handle: handle,
        })
    }
}
