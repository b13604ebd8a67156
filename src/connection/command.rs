//! Client-side request objects.
//!
//! A [`Command`] pairs a sent request with a single-resolution slot. The
//! slot is settled exactly once: by the matching reply, by an unmatched
//! protocol error, or by connection teardown. Settling it twice is a
//! programming error and reports [`Error::AlreadyResolved`] instead of
//! silently overwriting the first result.

use crate::error::Error;
use crate::proto::Reply;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

enum SlotState {
    Pending,
    Ready(Result<Reply, Error>),
    Taken,
}

struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

/// Settles a command's slot. Held by the connection's correlation map.
pub(crate) struct Resolver {
    slot: Arc<Slot>,
}

impl Resolver {
    /// Settle the slot and wake the waiter.
    pub(crate) fn resolve(self, result: Result<Reply, Error>) -> Result<(), Error> {
        let mut state = self.slot.state.lock().expect("poisoned command slot");
        match *state {
            SlotState::Pending => {
                *state = SlotState::Ready(result);
                self.slot.cv.notify_all();
                Ok(())
            }
            SlotState::Ready(_) | SlotState::Taken => Err(Error::AlreadyResolved),
        }
    }
}

/// An outstanding request. Await its reply with [`Command::wait`], or drop
/// it to fire-and-forget (the slot is still settled, nobody reads it).
pub struct Command {
    id: u64,
    slot: Arc<Slot>,
}

impl Command {
    pub(crate) fn new(id: u64) -> (Command, Resolver) {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState::Pending),
            cv: Condvar::new(),
        });
        (
            Command {
                id,
                slot: Arc::clone(&slot),
            },
            Resolver { slot },
        )
    }

    /// Request id this command correlates to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the caller until the slot is settled.
    pub fn wait(self) -> Result<Reply, Error> {
        let mut state = self.slot.state.lock().expect("poisoned command slot");
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Pending => {
                    *state = SlotState::Pending;
                    state = self.slot.cv.wait(state).expect("poisoned command slot");
                }
                SlotState::Ready(result) => return result,
                SlotState::Taken => return Err(Error::AlreadyResolved),
            }
        }
    }

    /// Like [`Command::wait`] but gives up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Reply, Error> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.slot.state.lock().expect("poisoned command slot");
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Pending => {
                    *state = SlotState::Pending;
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(Error::RecvTimeout);
                    }
                    let (guard, _) = self
                        .slot
                        .cv
                        .wait_timeout(state, deadline - now)
                        .expect("poisoned command slot");
                    state = guard;
                }
                SlotState::Ready(result) => return result,
                SlotState::Taken => return Err(Error::AlreadyResolved),
            }
        }
    }
}
