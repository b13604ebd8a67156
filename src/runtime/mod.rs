//! Injected runtime: the debuggee-side half of a debug session.
//!
//! Holds the per-thread record table and the execution defaults, accepts
//! controller connections, and drives the halt decision around each
//! intercepted call. The context is explicit (no global state): create it
//! once at library load, tear it down at process exit.

pub mod dispatch;
pub mod policy;
pub mod record;

pub use dispatch::RuntimeDispatcher;
pub use policy::{keep_executing, ExecutionMode, HaltPolicy};
pub use record::{RecordHandle, RecordTable, ThreadRecord, MAX_THREADS};

use crate::classify::CallClassifier;
use crate::config::{Config, StartMode};
use crate::connection::{Connection, Handle};
use crate::error::Error;
use crate::proto::{Envelope, FunctionCall, Reply, ReplyData};
use crate::{gl_debug, gl_info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Hard cap on concurrent controller sessions.
pub const MAX_CONNECTIONS: usize = 8;

/// What the interception shim should do with the original call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallAction {
    /// Execute the original call and keep running.
    Proceed,
    /// Execute the original call, then ask again for the same interception.
    ExecuteAndAsk,
    /// Abandon the call; the session is shutting down.
    Abort,
}

/// Process-wide runtime context. Replaces the legacy global server state
/// with an explicitly passed object and an init/teardown lifecycle.
pub struct RuntimeContext {
    records: RecordTable,
    classifier: Box<dyn CallClassifier>,
    /// Execution defaults applied to newly observed threads.
    defaults: Mutex<(ExecutionMode, HaltPolicy)>,
    sessions: AtomicUsize,
    program: String,
}

impl RuntimeContext {
    pub fn new(config: &Config, classifier: Box<dyn CallClassifier>) -> Self {
        let mode = match config.start_mode {
            StartMode::Interactive => ExecutionMode::Interactive,
            StartMode::Unattended => ExecutionMode::Unattended,
        };
        // stderr belongs to the host process; a fully silenced
        // configuration must gate our logging wholesale
        if config.log_level == log::LevelFilter::Off {
            crate::log::disable();
        } else {
            crate::log::enable();
        }

        let program = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "?".to_string());

        Self {
            records: RecordTable::new(),
            classifier,
            defaults: Mutex::new((mode, HaltPolicy::All)),
            sessions: AtomicUsize::new(0),
            program,
        }
    }

    pub fn records(&self) -> &RecordTable {
        &self.records
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn default_execution(&self) -> (ExecutionMode, HaltPolicy) {
        self.defaults.lock().expect("poisoned defaults").clone()
    }

    pub fn set_default_execution(&self, mode: ExecutionMode, policy: HaltPolicy) {
        *self.defaults.lock().expect("poisoned defaults") = (mode, policy);
    }

    /// Run a controller session over `transport`. Enforces the session cap
    /// and releases the slot when the connection closes.
    pub fn accept_session(
        self: &Arc<Self>,
        transport: crate::transport::Transport,
    ) -> Result<Connection, Error> {
        let active = self.sessions.fetch_add(1, Ordering::SeqCst);
        if active >= MAX_CONNECTIONS {
            self.sessions.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ConnectionLimit(MAX_CONNECTIONS));
        }

        let peer = transport.peer().to_string();
        let connection = Connection::over(transport, RuntimeDispatcher::new(Arc::clone(self)))?;
        let sessions = Arc::clone(self);
        connection.on_close(move |reason| {
            sessions.sessions.fetch_sub(1, Ordering::SeqCst);
            gl_info!(target: "runtime", "session with {peer} ended: {reason}");
        });
        Ok(connection)
    }

    /// Decision function consulted around every intercepted call.
    pub fn keep_executing(&self, thread_id: u64, func_name: &str) -> Result<bool, Error> {
        let (mode, policy) = self.default_execution();
        let (_, record) = self.records.lookup_or_insert(thread_id, mode, policy)?;
        let (mode, policy) = record.execution();
        Ok(keep_executing(
            mode,
            &policy,
            func_name,
            self.classifier.classify(func_name),
        ))
    }

    /// Entry point of the interception shim.
    ///
    /// Installs `call` as the thread's current call (the previous call's
    /// buffers are dropped), then either proceeds immediately or blocks the
    /// calling thread on its own record until a command arrives.
    ///
    /// The shim must execute the original call on this same thread; only
    /// the halt decision lives here.
    pub fn intercept(
        &self,
        session: Option<&Handle>,
        call: FunctionCall,
    ) -> Result<CallAction, Error> {
        let (mode, policy) = self.default_execution();
        let (_, record) = self
            .records
            .lookup_or_insert(call.thread_id, mode, policy)?;

        let name = call.name.clone();
        record.install_call(call);

        let (mode, policy) = record.execution();
        if keep_executing(mode, &policy, &name, self.classifier.classify(&name)) {
            return Ok(CallAction::Proceed);
        }

        gl_debug!(
            target: "runtime",
            "thread {} halted at {name}",
            record.thread_id()
        );

        loop {
            let Some(command) = record.await_command() else {
                return Ok(CallAction::Abort);
            };

            match command {
                crate::proto::DebugCommand::CallOriginalAndProceed => {
                    return Ok(CallAction::Proceed)
                }
                crate::proto::DebugCommand::CallOriginal => return Ok(CallAction::ExecuteAndAsk),
                crate::proto::DebugCommand::ReportCurrentCall => {
                    if let Some(session) = session {
                        let calls = record.current_call().into_iter().collect();
                        let note = Envelope::reply_to(
                            crate::proto::NOTIFY_ID,
                            Reply::ok("current call", ReplyData::Calls(calls)),
                        );
                        session.send_async(note)?;
                    }
                }
                crate::proto::DebugCommand::StopExecution => return Ok(CallAction::Abort),
            }
        }
    }

    /// Deliver a command to one thread's queue, or to all of them when
    /// `thread_id` is [`crate::proto::ALL_THREADS`].
    pub fn deliver_command(
        &self,
        thread_id: u64,
        command: crate::proto::DebugCommand,
    ) -> Result<usize, Error> {
        if thread_id == crate::proto::ALL_THREADS {
            let records = self.records.snapshot_in_order();
            for record in &records {
                record.push_command(command);
            }
            return Ok(records.len());
        }

        let (mode, policy) = self.default_execution();
        let (_, record) = self.records.lookup_or_insert(thread_id, mode, policy)?;
        record.push_command(command);
        Ok(1)
    }

    /// Aggregate the current call of every traced thread.
    ///
    /// Locks every record in increasing slot order and keeps all the locks
    /// until the reply is written, so the snapshot never observes
    /// partially-updated per-thread state. The added latency is the price
    /// of the ordering invariant.
    pub fn snapshot_all_calls(&self, session: &Handle, request_id: u64) -> Result<(), Error> {
        let records = self.records.snapshot_in_order();
        let guards: Vec<_> = records.iter().map(|r| r.lock_state()).collect();

        let calls: Vec<FunctionCall> = guards
            .iter()
            .filter_map(|state| state.current_call.clone())
            .collect();

        let reply = Envelope::reply_to(
            request_id,
            Reply::ok("current calls", ReplyData::Calls(calls)),
        );
        // synchronous send under the record locks, then unlock
        session.send_sync(&reply)?;
        drop(guards);
        Ok(())
    }

    /// Handle inbound non-reply traffic: see [`dispatch`].
    pub fn dispatch(
        &self,
        session: &Handle,
        envelope: Envelope,
    ) -> Result<Option<Envelope>, Error> {
        dispatch::dispatch(self, session, envelope)
    }

    /// Tear the runtime down: release every blocked thread.
    pub fn teardown(&self) {
        self.records.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BuiltinClassifier;

    #[test]
    fn silenced_config_gates_logging() {
        let mut config = Config::default();

        config.log_level = log::LevelFilter::Off;
        let _ctx = RuntimeContext::new(&config, Box::new(BuiltinClassifier));
        assert!(!crate::log::is_enabled());

        config.log_level = log::LevelFilter::Info;
        let _ctx = RuntimeContext::new(&config, Box::new(BuiltinClassifier));
        assert!(crate::log::is_enabled());
    }
}
