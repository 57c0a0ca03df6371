//! A background thread that expires timed-out transactions and periodically schedules event
//! delivery on the worker.
use std::{
    sync::{
        mpsc::{RecvTimeoutError, Sender, SyncSender},
        Arc,
    },
    time::{Duration, Instant},
};

use rand::{thread_rng, Rng};

use crate::{session::Shared, worker::Job, Error, Result};

/// Upper bound on how long the thread sleeps between checks.
const TICK: Duration = Duration::from_millis(250);
/// Randomized amount subtracted from each flush period, so that many clients started at the same
/// time do not hit the backend in lockstep.
const FLUSH_JITTER: Duration = Duration::from_millis(500);

pub(crate) struct Housekeeper {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the housekeeping thread.
    stop_sender: SyncSender<()>,
}

impl Housekeeper {
    pub fn start(shared: Arc<Shared>, jobs: Sender<Job>) -> std::io::Result<Housekeeper> {
        // Buffer size of 1 is enough: a second stop command can be dropped.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("splyt-housekeeper".to_owned())
            .spawn(move || {
                let mut next_flush = Instant::now() + jitter(shared.events.flush_period(), FLUSH_JITTER);

                loop {
                    let now = Instant::now();
                    let wait = shared
                        .transactions
                        .next_deadline()
                        .map_or(TICK, |deadline| deadline.saturating_duration_since(now).min(TICK));

                    match stop_receiver.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) => {
                            log::debug!(target: "splyt", "housekeeping thread received stop command");
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "splyt", "housekeeping thread received disconnected");
                            return;
                        }
                    }

                    let now = Instant::now();
                    let mut flush = shared.expire_transactions(now);
                    if now >= next_flush {
                        flush |= !shared.events.is_empty();
                        next_flush = now + jitter(shared.events.flush_period(), FLUSH_JITTER);
                    }

                    if flush && shared.is_ready() && !shared.events.is_paused() && jobs.send(Job::Flush).is_err() {
                        // The worker is gone; nothing left to schedule for.
                        return;
                    }
                }
            })?;

        Ok(Housekeeper {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means the thread already exited or another stop command is pending.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle.join().map_err(|_| Error::Unknown)?;
        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
