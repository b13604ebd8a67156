//! Controller side: ptrace lifecycle of the debuggee plus the debug
//! session towards its injected runtime.

pub mod process;
pub mod tracer;

pub use process::{Child, DebugConfig, Installed, Template};
pub use tracer::{ProcessState, StatusWait, Tick};

use crate::connection::{CloseReason, Command, Connection, Handle, InboundHandler};
use crate::error::Error;
use crate::proto::{
    Body, DebugCommand, Envelope, ErrorCode, Execution, FunctionCall, ProcessInfo, Reply,
    ReplyData,
};
use crate::transport::Endpoint;
use crate::{gl_debug, gl_info, gl_warn};
use nix::sys;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use os_pipe::PipeWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long synchronous controller requests wait for the runtime.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Observer of debuggee lifecycle events. Callbacks fire on the
/// status-wait thread and never after [`Process::kill`] returns.
pub trait ProcessEventHook: Send + Sync + 'static {
    fn on_state(&self, old: ProcessState, new: ProcessState);
    fn on_new_child(&self, parent: Pid, child: Pid);
}

/// Hook that ignores everything.
pub struct NopHook;

impl ProcessEventHook for NopHook {
    fn on_state(&self, _: ProcessState, _: ProcessState) {}
    fn on_new_child(&self, _: Pid, _: Pid) {}
}

/// A traced debuggee process and its state machine.
pub struct Process {
    pid: Pid,
    config: DebugConfig,
    state: Arc<Mutex<ProcessState>>,
    end: Arc<AtomicBool>,
    hook: Arc<dyn ProcessEventHook>,
    wait_thread: Option<JoinHandle<()>>,
    session: Option<Session>,
}

impl Process {
    /// Launch `config.program` under trace.
    ///
    /// Launch failures (fork, exec, missing initial stop) are reported
    /// here, synchronously; afterwards all state changes flow through the
    /// hook.
    pub fn launch<H: ProcessEventHook>(
        config: DebugConfig,
        stdout: PipeWriter,
        stderr: PipeWriter,
        hook: H,
    ) -> Result<Self, Error> {
        let template = Child::new(config.clone(), stdout, stderr);
        let installed = template.install()?;
        Self::start(installed, config, hook)
    }

    /// Attach to an already running process by pid.
    pub fn attach<H: ProcessEventHook>(
        pid: Pid,
        stdout: PipeWriter,
        stderr: PipeWriter,
        hook: H,
    ) -> Result<Self, Error> {
        let installed = Child::from_external(pid, stdout, stderr)?;
        let config = installed.config().clone();
        Self::start(installed, config, hook)
    }

    fn start<H: ProcessEventHook>(
        child: Child<Installed>,
        config: DebugConfig,
        hook: H,
    ) -> Result<Self, Error> {
        let pid = child.pid();
        // the first stop was consumed by installation, options are legal now
        child.apply_trace_options()?;

        let state = Arc::new(Mutex::new(ProcessState::Init));
        let end = Arc::new(AtomicBool::new(false));
        let hook: Arc<dyn ProcessEventHook> = Arc::new(hook);

        let mut process = Self {
            pid,
            config,
            state: Arc::clone(&state),
            end: Arc::clone(&end),
            hook: Arc::clone(&hook),
            wait_thread: None,
            session: None,
        };
        process.transition(ProcessState::Stopped);

        let wait_thread = std::thread::Builder::new()
            .name("gldbg-wait".to_string())
            .spawn(move || wait_loop(pid, state, end, hook))?;
        process.wait_thread = Some(wait_thread);

        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().expect("poisoned process state")
    }

    fn transition(&self, new: ProcessState) {
        let old = {
            let mut state = self.state.lock().expect("poisoned process state");
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            self.hook.on_state(old, new);
        }
    }

    /// Resume the debuggee. Valid only from `Stopped` or `Trapped`.
    ///
    /// Failure to continue escalates the process to `Invalid` and leaves
    /// the error to the caller.
    pub fn advance(&self) -> Result<(), Error> {
        let state = self.state();
        if !matches!(state, ProcessState::Stopped | ProcessState::Trapped) {
            return Err(Error::NotStopped(state.name()));
        }

        match sys::ptrace::cont(self.pid, None) {
            Ok(()) => {
                self.transition(ProcessState::Running);
                Ok(())
            }
            Err(e) => {
                self.transition(ProcessState::Invalid);
                Err(Error::Ptrace(e))
            }
        }
    }

    /// Stop the debuggee immediately with `SIGSTOP`. The cooperative halt
    /// at the next intercepted call goes through the runtime instead
    /// ([`Session::send_command`]).
    pub fn stop(&self) -> Result<(), Error> {
        sys::signal::kill(self.pid, Signal::SIGSTOP).map_err(|e| Error::Syscall("kill", e))
    }

    /// Bind the debug session towards this process' injected runtime.
    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Kill the debuggee and join the status-wait thread. No state
    /// callback fires after this returns.
    pub fn kill(&mut self) -> Result<(), Error> {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.end.store(true, Ordering::SeqCst);

        if !self.state().is_terminal() {
            match sys::signal::kill(self.pid, Signal::SIGKILL) {
                Ok(()) | Err(nix::Error::ESRCH) => {}
                Err(e) => return Err(Error::Syscall("kill", e)),
            }
        }

        if let Some(wait_thread) = self.wait_thread.take() {
            let _ = wait_thread.join();
        }
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

fn wait_loop(
    pid: Pid,
    state: Arc<Mutex<ProcessState>>,
    end: Arc<AtomicBool>,
    hook: Arc<dyn ProcessEventHook>,
) {
    let wait = StatusWait::new(pid);

    let set_state = |new: ProcessState| {
        let old = {
            let mut state = state.lock().expect("poisoned process state");
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            gl_debug!(target: "tracer", "debuggee {pid}: {} -> {}", old.name(), new.name());
            hook.on_state(old, new);
        }
        new
    };

    loop {
        if end.load(Ordering::SeqCst) && state.lock().expect("poisoned process state").is_terminal()
        {
            return;
        }

        match wait.tick() {
            Ok(Tick::Nothing) => continue,
            Ok(Tick::NewChild(parent, child)) => {
                gl_info!(target: "tracer", "new traced child {child} of {parent}");
                hook.on_new_child(parent, child);
            }
            Ok(Tick::Misbehaved(stopped, signal)) => {
                gl_warn!(target: "tracer", "debuggee {stopped} stopped by {signal}, killing it");
                // still alive in signal-delivery-stop; the kill shows up
                // as a regular signal termination on a later tick, which
                // also reaps the debuggee
                match sys::signal::kill(stopped, Signal::SIGKILL) {
                    Ok(()) | Err(nix::Error::ESRCH) => {}
                    Err(e) => {
                        gl_warn!(target: "tracer", "failed to kill misbehaving {stopped}: {e}");
                        set_state(ProcessState::Invalid);
                        return;
                    }
                }
            }
            Ok(Tick::State(new)) => {
                if set_state(new).is_terminal() {
                    return;
                }
            }
            Err(e) => {
                gl_warn!(target: "tracer", "status wait failed for {pid}: {e}");
                set_state(ProcessState::Invalid);
                return;
            }
        }
    }
}

/// Controller endpoint of a debug session: wraps the connection to the
/// injected runtime with typed operations.
pub struct Session {
    connection: Connection,
}

/// Inbound handler on the controller: only fire-and-forget notifications
/// from the runtime are expected here.
struct ControllerInbound;

impl InboundHandler for ControllerInbound {
    fn handle(&self, conn: &Handle, envelope: Envelope) -> Result<Option<Envelope>, Error> {
        match envelope.body {
            Body::Reply(reply) => {
                // notification (id 0): surfaced via logs only
                gl_info!(
                    target: "debugger",
                    "notification from {}: {} ({:?})",
                    conn.peer(),
                    reply.message,
                    reply.error
                );
                Ok(None)
            }
            body => {
                gl_warn!(
                    target: "debugger",
                    "unexpected {} request from runtime {}",
                    body.kind(),
                    conn.peer()
                );
                Ok(Some(Envelope::reply_to(
                    envelope.id,
                    Reply::error(ErrorCode::Generic, "not a server"),
                )))
            }
        }
    }
}

impl Session {
    /// Connect to the runtime's endpoint and perform the announce
    /// handshake.
    pub fn establish(endpoint: &Endpoint, client_name: &str) -> Result<Self, Error> {
        let connection = Connection::connect(endpoint, ControllerInbound)?;
        connection.establish(client_name)?;
        Ok(Self { connection })
    }

    /// Run a session over an already-open connection (tests, embedding).
    pub fn over(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Queue a debug command for one thread (`0` broadcasts to all).
    /// Fire-and-forget: the addressed thread produces the effect.
    pub fn send_command(&self, thread_id: u64, command: DebugCommand) -> Result<(), Error> {
        self.connection
            .notify(Body::DebugCommand { thread_id, command })
    }

    /// Fetch the current intercepted call of `thread_id`, or of every
    /// thread at once for `0`.
    pub fn current_calls(&self, thread_id: u64) -> Result<Vec<FunctionCall>, Error> {
        let reply = self
            .connection
            .request(Body::FunctionCall { thread_id })?
            .wait_timeout(REQUEST_TIMEOUT)?;
        match reply.error {
            ErrorCode::None => match reply.data {
                ReplyData::Calls(calls) => Ok(calls),
                _ => Err(Error::InvalidOperation(
                    "function call reply without call data".to_string(),
                )),
            },
            code => Err(Error::Rejected(format!("{code:?}: {}", reply.message))),
        }
    }

    /// Adjust execution mode / halt policy of one thread (or all for `0`).
    pub fn set_execution(&self, execution: Execution) -> Result<(), Error> {
        let reply = self
            .connection
            .request(Body::Execution(execution))?
            .wait_timeout(REQUEST_TIMEOUT)?;
        match reply.error {
            ErrorCode::None => Ok(()),
            code => Err(Error::Rejected(format!("{code:?}: {}", reply.message))),
        }
    }

    /// Query the debuggee process description.
    pub fn process_info(&self) -> Result<ProcessInfo, Error> {
        let reply = self
            .connection
            .request(Body::ProcessInfo)?
            .wait_timeout(REQUEST_TIMEOUT)?;
        match reply.data {
            ReplyData::ProcessInfo(info) => Ok(info),
            _ => Err(Error::Rejected(format!(
                "{:?}: {}",
                reply.error, reply.message
            ))),
        }
    }

    /// Issue an asynchronous request; the caller decides when to await.
    pub fn request(&self, body: Body) -> Result<Command, Error> {
        self.connection.request(body)
    }

    /// Close the session, failing all outstanding commands.
    pub fn close(mut self) -> CloseReason {
        self.connection.close();
        CloseReason::Local
    }
}
