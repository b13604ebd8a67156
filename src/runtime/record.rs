//! Per-thread records of the injected runtime.
//!
//! A fixed-capacity arena of slots, one per traced thread, guarded by a
//! single table lock for lookup/insert. Each record carries its own mutex
//! and condvar, so unrelated threads' call data can be mutated
//! concurrently. Slots are recycled through a generation counter; a stale
//! handle never resolves to a recycled slot.

use crate::error::Error;
use crate::proto::{DebugCommand, FunctionCall};
use crate::runtime::policy::{ExecutionMode, HaltPolicy};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Hard cap on simultaneously traced threads. Exceeding it is fatal to
/// the debug session.
pub const MAX_THREADS: usize = 64;

/// Generation-checked reference to an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHandle {
    index: usize,
    generation: u32,
}

/// Mutable per-thread state, guarded by the record's own mutex.
pub struct RecordState {
    pub mode: ExecutionMode,
    pub halt_policy: HaltPolicy,
    /// The call currently intercepted on this thread, superseded (and its
    /// buffers dropped) by the next interception.
    pub current_call: Option<FunctionCall>,
    /// Commands awaiting the intercepting thread, strictly FIFO.
    pub queue: VecDeque<DebugCommand>,
    /// Set at teardown; wakes and releases any blocked thread.
    pub shutdown: bool,
}

/// One traced thread's record. Lives until process teardown.
pub struct ThreadRecord {
    thread_id: u64,
    state: Mutex<RecordState>,
    cv: Condvar,
}

impl ThreadRecord {
    fn new(thread_id: u64, mode: ExecutionMode, halt_policy: HaltPolicy) -> Self {
        Self {
            thread_id,
            state: Mutex::new(RecordState {
                mode,
                halt_policy,
                current_call: None,
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Lock this record's state. The aggregation path holds several of
    /// these guards at once, always acquired in increasing slot order.
    pub fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().expect("poisoned thread record")
    }

    /// Queue a command for the intercepting thread and wake it.
    pub fn push_command(&self, command: DebugCommand) {
        let mut state = self.lock_state();
        state.queue.push_back(command);
        self.cv.notify_one();
    }

    /// Block until a command is queued, then dequeue exactly one.
    ///
    /// Returns `None` when the record was shut down while waiting.
    pub fn await_command(&self) -> Option<DebugCommand> {
        let mut state = self.lock_state();
        loop {
            if let Some(command) = state.queue.pop_front() {
                return Some(command);
            }
            if state.shutdown {
                return None;
            }
            state = self.cv.wait(state).expect("poisoned thread record");
        }
    }

    /// Install a freshly intercepted call, dropping the previous one.
    pub fn install_call(&self, call: FunctionCall) {
        let mut state = self.lock_state();
        state.current_call = Some(call);
    }

    pub fn current_call(&self) -> Option<FunctionCall> {
        self.lock_state().current_call.clone()
    }

    pub fn execution(&self) -> (ExecutionMode, HaltPolicy) {
        let state = self.lock_state();
        (state.mode, state.halt_policy.clone())
    }

    pub fn set_execution(&self, mode: ExecutionMode, halt_policy: HaltPolicy) {
        let mut state = self.lock_state();
        state.mode = mode;
        state.halt_policy = halt_policy;
    }

    /// Wake any blocked intercepting thread and make it abandon the call.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shutdown = true;
        self.cv.notify_all();
    }
}

struct Slot {
    generation: u32,
    record: Option<Arc<ThreadRecord>>,
}

/// The global record table: bounded arena + one lookup/insert lock.
pub struct RecordTable {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::with_capacity(MAX_THREADS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                record: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            capacity,
        }
    }

    /// Find the record for `thread_id`, creating it lazily on first
    /// observation. Repeated lookups return the same record instance.
    pub fn lookup_or_insert(
        &self,
        thread_id: u64,
        mode: ExecutionMode,
        halt_policy: HaltPolicy,
    ) -> Result<(RecordHandle, Arc<ThreadRecord>), Error> {
        let mut slots = self.slots.lock().expect("poisoned record table");

        let mut free = None;
        for (index, slot) in slots.iter().enumerate() {
            match &slot.record {
                Some(record) if record.thread_id() == thread_id => {
                    return Ok((
                        RecordHandle {
                            index,
                            generation: slot.generation,
                        },
                        Arc::clone(record),
                    ));
                }
                Some(_) => {}
                None => {
                    if free.is_none() {
                        free = Some(index);
                    }
                }
            }
        }

        let index = free.ok_or(Error::ThreadLimit(self.capacity))?;
        let record = Arc::new(ThreadRecord::new(thread_id, mode, halt_policy));
        slots[index].record = Some(Arc::clone(&record));
        Ok((
            RecordHandle {
                index,
                generation: slots[index].generation,
            },
            record,
        ))
    }

    /// Find an existing record without inserting.
    pub fn get(&self, thread_id: u64) -> Option<Arc<ThreadRecord>> {
        let slots = self.slots.lock().expect("poisoned record table");
        slots.iter().find_map(|slot| {
            slot.record
                .as_ref()
                .filter(|r| r.thread_id() == thread_id)
                .cloned()
        })
    }

    /// Resolve a handle; fails when the slot was recycled since.
    pub fn resolve(&self, handle: RecordHandle) -> Option<Arc<ThreadRecord>> {
        let slots = self.slots.lock().expect("poisoned record table");
        let slot = slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.clone()
    }

    /// Recycle the slot occupied by `thread_id`, bumping its generation.
    /// The record itself stays alive for any holder of its `Arc`.
    pub fn release(&self, thread_id: u64) {
        let mut slots = self.slots.lock().expect("poisoned record table");
        for slot in slots.iter_mut() {
            let matches = slot
                .record
                .as_ref()
                .is_some_and(|r| r.thread_id() == thread_id);
            if matches {
                if let Some(record) = slot.record.take() {
                    record.shutdown();
                }
                slot.generation = slot.generation.wrapping_add(1);
                return;
            }
        }
    }

    /// All live records in increasing slot order. The aggregation handler
    /// relies on this order for its multi-lock traversal.
    pub fn snapshot_in_order(&self) -> Vec<Arc<ThreadRecord>> {
        let slots = self.slots.lock().expect("poisoned record table");
        slots
            .iter()
            .filter_map(|slot| slot.record.clone())
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().expect("poisoned record table");
        slots.iter().filter(|s| s.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut every record down (process teardown).
    pub fn shutdown_all(&self) {
        for record in self.snapshot_in_order() {
            record.shutdown();
        }
    }
}

impl Default for RecordTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> (ExecutionMode, HaltPolicy) {
        (ExecutionMode::Interactive, HaltPolicy::All)
    }

    #[test]
    fn lookup_is_idempotent() {
        let table = RecordTable::new();
        let (mode, policy) = defaults();
        let (h1, r1) = table.lookup_or_insert(7, mode, policy.clone()).unwrap();
        let (h2, r2) = table.lookup_or_insert(7, mode, policy).unwrap();
        assert_eq!(h1, h2);
        assert!(Arc::ptr_eq(&r1, &r2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn new_record_starts_running() {
        let table = RecordTable::new();
        let (mode, policy) = defaults();
        let (_, record) = table.lookup_or_insert(1, mode, policy).unwrap();
        let state = record.lock_state();
        assert!(state.queue.is_empty());
        assert!(state.current_call.is_none());
        assert!(!state.shutdown);
    }

    #[test]
    fn capacity_overflow_is_thread_limit() {
        let table = RecordTable::with_capacity(2);
        let (mode, policy) = defaults();
        table.lookup_or_insert(1, mode, policy.clone()).unwrap();
        table.lookup_or_insert(2, mode, policy.clone()).unwrap();
        assert!(matches!(
            table.lookup_or_insert(3, mode, policy),
            Err(Error::ThreadLimit(2))
        ));
    }

    #[test]
    fn release_recycles_slot_and_invalidates_handles() {
        let table = RecordTable::with_capacity(2);
        let (mode, policy) = defaults();
        let (handle, _) = table.lookup_or_insert(1, mode, policy.clone()).unwrap();
        table.release(1);
        assert!(table.resolve(handle).is_none());

        // the freed slot is reusable
        let (handle2, record2) = table.lookup_or_insert(9, mode, policy).unwrap();
        assert_eq!(record2.thread_id(), 9);
        assert!(table.resolve(handle2).is_some());
    }

    #[test]
    fn commands_dequeue_fifo() {
        let table = RecordTable::new();
        let (mode, policy) = defaults();
        let (_, record) = table.lookup_or_insert(7, mode, policy).unwrap();
        record.push_command(DebugCommand::ReportCurrentCall);
        record.push_command(DebugCommand::CallOriginalAndProceed);
        assert_eq!(
            record.await_command(),
            Some(DebugCommand::ReportCurrentCall)
        );
        assert_eq!(
            record.await_command(),
            Some(DebugCommand::CallOriginalAndProceed)
        );
    }

    #[test]
    fn await_wakes_on_push_from_other_thread() {
        let table = RecordTable::new();
        let (mode, policy) = defaults();
        let (_, record) = table.lookup_or_insert(3, mode, policy).unwrap();

        let waiter = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || record.await_command())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        record.push_command(DebugCommand::StopExecution);
        assert_eq!(waiter.join().unwrap(), Some(DebugCommand::StopExecution));
    }

    #[test]
    fn shutdown_releases_blocked_waiter() {
        let table = RecordTable::new();
        let (mode, policy) = defaults();
        let (_, record) = table.lookup_or_insert(4, mode, policy).unwrap();

        let waiter = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || record.await_command())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        record.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
    }
}
