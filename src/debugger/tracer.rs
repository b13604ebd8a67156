//! Status-wait translation: one blocking `waitpid` tick becomes one
//! [`Tick`], consumed by the controller's wait loop.

use crate::error::Error;
use crate::error::Error::{Ptrace, Waitpid};
use crate::gl_warn;
use nix::errno::Errno;
use nix::libc;
use nix::libc::pid_t;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Debuggee process state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Unrecoverable OS error; reachable from any state.
    Invalid,
    Init,
    Running,
    /// Stopped by `SIGSTOP`.
    Stopped,
    /// Stopped by a trace trap.
    Trapped,
    /// Exited normally with code.
    Exited(i32),
    /// Terminated by a signal, or misbehaved under a fatal one.
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Invalid | ProcessState::Exited(_) | ProcessState::Killed
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessState::Invalid => "invalid",
            ProcessState::Init => "init",
            ProcessState::Running => "running",
            ProcessState::Stopped => "stopped",
            ProcessState::Trapped => "trapped",
            ProcessState::Exited(_) => "exited",
            ProcessState::Killed => "killed",
        }
    }
}

/// One observation of the wait loop.
#[derive(Clone, Copy, Debug)]
pub enum Tick {
    /// Debuggee state changed.
    State(ProcessState),
    /// A fork/vfork/clone produced a new traced child.
    NewChild(Pid, Pid),
    /// Stopped by a signal the debuggee cannot be resumed from. It is
    /// still alive in signal-delivery-stop and must be put down.
    Misbehaved(Pid, Signal),
    /// Status observed but not actionable; wait again.
    Nothing,
}

/// Blocking status-wait over the traced process and its children.
pub struct StatusWait {
    proc_id: Pid,
}

impl StatusWait {
    pub fn new(proc_pid: Pid) -> Self {
        Self { proc_id: proc_pid }
    }

    /// Block until the OS reports a status change and translate it.
    ///
    /// Errors other than "interrupted" (retry) escalate to the caller,
    /// which must treat them as [`ProcessState::Invalid`]; "no such child"
    /// is treated identically.
    pub fn tick(&self) -> Result<Tick, Error> {
        let status = match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => status,
            Err(Errno::EINTR) => return Ok(Tick::Nothing),
            Err(e) => return Err(Waitpid(e)),
        };

        Ok(self.translate(status))
    }

    /// Map a raw wait status onto the process state machine.
    pub fn translate(&self, status: WaitStatus) -> Tick {
        match status {
            WaitStatus::Exited(pid, code) => {
                if pid == self.proc_id {
                    Tick::State(ProcessState::Exited(code))
                } else {
                    // a non-main thread or child went away
                    Tick::Nothing
                }
            }

            WaitStatus::Signaled(_, _, _) => Tick::State(ProcessState::Killed),

            WaitStatus::PtraceEvent(pid, _, code) => match code {
                libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                    match sys::ptrace::getevent(pid) {
                        Ok(child) => Tick::NewChild(pid, Pid::from_raw(child as pid_t)),
                        Err(e) => {
                            gl_warn!(target: "tracer", "getevent failed after clone event: {e}");
                            Tick::Nothing
                        }
                    }
                }
                // not actionable trace events; keep waiting
                libc::PTRACE_EVENT_EXEC
                | libc::PTRACE_EVENT_EXIT
                | libc::PTRACE_EVENT_STOP
                | libc::PTRACE_EVENT_VFORK_DONE
                | libc::PTRACE_EVENT_SECCOMP => Tick::Nothing,
                _ => {
                    gl_warn!(target: "tracer", "unsupported ptrace event, code: {code}");
                    Tick::Nothing
                }
            },

            WaitStatus::Stopped(_, Signal::SIGTRAP) => Tick::State(ProcessState::Trapped),
            WaitStatus::Stopped(_, Signal::SIGSTOP) => Tick::State(ProcessState::Stopped),
            // any other stop signal means the debuggee misbehaved
            WaitStatus::Stopped(pid, signal) => Tick::Misbehaved(pid, signal),

            WaitStatus::Continued(_) => Tick::State(ProcessState::Running),

            status => {
                gl_warn!(target: "tracer", "unexpected wait status: {status:?}");
                Tick::Nothing
            }
        }
    }

    /// Resume the debuggee. Valid only from a stop.
    pub fn advance(&self, pid: Pid) -> Result<(), Error> {
        sys::ptrace::cont(pid, None).map_err(Ptrace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait(pid: i32) -> StatusWait {
        StatusWait::new(Pid::from_raw(pid))
    }

    #[test]
    fn exit_of_the_main_process_is_terminal() {
        let tick = wait(10).translate(WaitStatus::Exited(Pid::from_raw(10), 3));
        assert!(matches!(tick, Tick::State(ProcessState::Exited(3))));
    }

    #[test]
    fn exit_of_other_children_is_ignored() {
        let tick = wait(10).translate(WaitStatus::Exited(Pid::from_raw(11), 0));
        assert!(matches!(tick, Tick::Nothing));
    }

    #[test]
    fn signal_termination_is_killed() {
        let tick = wait(10).translate(WaitStatus::Signaled(
            Pid::from_raw(10),
            Signal::SIGKILL,
            false,
        ));
        assert!(matches!(tick, Tick::State(ProcessState::Killed)));
    }

    #[test]
    fn trap_and_stop_signals_map_to_their_states() {
        let w = wait(10);
        assert!(matches!(
            w.translate(WaitStatus::Stopped(Pid::from_raw(10), Signal::SIGTRAP)),
            Tick::State(ProcessState::Trapped)
        ));
        assert!(matches!(
            w.translate(WaitStatus::Stopped(Pid::from_raw(10), Signal::SIGSTOP)),
            Tick::State(ProcessState::Stopped)
        ));
    }

    #[test]
    fn fatal_signals_mean_misbehaving_debuggee() {
        let w = wait(10);
        for signal in [Signal::SIGHUP, Signal::SIGILL, Signal::SIGFPE, Signal::SIGSEGV] {
            assert!(matches!(
                w.translate(WaitStatus::Stopped(Pid::from_raw(10), signal)),
                Tick::Misbehaved(_, s) if s == signal
            ));
        }
    }

    #[test]
    fn exec_and_exit_events_are_not_actionable() {
        let w = wait(10);
        for code in [libc::PTRACE_EVENT_EXEC, libc::PTRACE_EVENT_EXIT] {
            let tick = w.translate(WaitStatus::PtraceEvent(
                Pid::from_raw(10),
                Signal::SIGTRAP,
                code,
            ));
            assert!(matches!(tick, Tick::Nothing));
        }
    }

    #[test]
    fn continued_means_running() {
        let tick = wait(10).translate(WaitStatus::Continued(Pid::from_raw(10)));
        assert!(matches!(tick, Tick::State(ProcessState::Running)));
    }
}
