//! Controller integration: launch/attach real children under trace and
//! drive the process state machine. Serial: the status-wait loop reaps
//! any traced child of the test process.

use gldbg::debugger::{DebugConfig, NopHook, Process, ProcessEventHook, ProcessState};
use gldbg::error::Error;
use nix::sys::signal;
use nix::unistd::Pid;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct RecordingHook {
    transitions: Arc<Mutex<Vec<(ProcessState, ProcessState)>>>,
}

impl ProcessEventHook for RecordingHook {
    fn on_state(&self, old: ProcessState, new: ProcessState) {
        self.transitions.lock().unwrap().push((old, new));
    }

    fn on_new_child(&self, _: Pid, _: Pid) {}
}

fn launch<H: ProcessEventHook>(config: DebugConfig, hook: H) -> Result<Process, Error> {
    let (_stdout_reader, stdout_writer) = os_pipe::pipe().unwrap();
    let (_stderr_reader, stderr_writer) = os_pipe::pipe().unwrap();
    Process::launch(config, stdout_writer, stderr_writer, hook)
}

fn wait_until_terminal(process: &Process) {
    for _ in 0..1000 {
        if process.state().is_terminal() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("debuggee did not reach a terminal state");
}

#[test]
#[serial]
fn launch_runs_to_exit() {
    let hook = RecordingHook::default();
    let transitions = Arc::clone(&hook.transitions);

    let mut process = launch(DebugConfig::new("sleep").with_args(["0.2"]), hook).unwrap();
    assert_eq!(process.state(), ProcessState::Stopped);

    process.advance().unwrap();
    assert_eq!(process.state(), ProcessState::Running);

    wait_until_terminal(&process);
    assert_eq!(process.state(), ProcessState::Exited(0));
    process.kill().unwrap();

    let transitions = transitions.lock().unwrap();
    let terminal: Vec<_> = transitions
        .iter()
        .filter(|(_, new)| new.is_terminal())
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].1, ProcessState::Exited(0));
}

#[test]
#[serial]
fn advance_requires_a_stopped_debuggee() {
    let mut process = launch(DebugConfig::new("sleep").with_args(["5"]), NopHook).unwrap();

    process.advance().unwrap();
    let err = process.advance().unwrap_err();
    assert!(matches!(err, Error::NotStopped("running")));

    process.kill().unwrap();
}

#[test]
#[serial]
fn kill_reaps_the_debuggee() {
    let mut process = launch(DebugConfig::new("sleep").with_args(["60"]), NopHook).unwrap();
    let pid = process.pid();

    process.advance().unwrap();
    process.kill().unwrap();

    assert!(process.state().is_terminal());
    // reaped by the status-wait loop before kill() returned
    assert_eq!(signal::kill(pid, None), Err(nix::Error::ESRCH));
}

#[test]
#[serial]
fn fatal_signal_debuggee_is_put_down() {
    let hook = RecordingHook::default();
    let transitions = Arc::clone(&hook.transitions);

    let config = DebugConfig::new("sh").with_args(["-c", "kill -s SEGV $$; sleep 30"]);
    let mut process = launch(config, hook).unwrap();
    let pid = process.pid();

    process.advance().unwrap();
    wait_until_terminal(&process);
    assert_eq!(process.state(), ProcessState::Killed);

    process.kill().unwrap();
    // the segfaulting debuggee must not survive the controller
    assert_eq!(signal::kill(pid, None), Err(nix::Error::ESRCH));

    let transitions = transitions.lock().unwrap();
    let terminal = transitions.iter().filter(|(_, new)| new.is_terminal());
    assert_eq!(terminal.count(), 1);
}

#[test]
#[serial]
fn kill_is_idempotent_after_exit() {
    let mut process = launch(DebugConfig::new("sleep").with_args(["0.1"]), NopHook).unwrap();

    process.advance().unwrap();
    wait_until_terminal(&process);
    assert_eq!(process.state(), ProcessState::Exited(0));

    process.kill().unwrap();
    process.kill().unwrap();
}

#[test]
#[serial]
fn missing_program_fails_to_launch() {
    assert!(matches!(
        launch(DebugConfig::new("/nonexistent/gldbg-test-binary"), NopHook),
        Err(Error::ProcessNotStarted)
    ));
}

#[test]
#[serial]
fn attach_to_a_running_process() {
    let child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);
    // give the child a moment to exec before the pid lookup
    std::thread::sleep(Duration::from_millis(100));

    let (_stdout_reader, stdout_writer) = os_pipe::pipe().unwrap();
    let (_stderr_reader, stderr_writer) = os_pipe::pipe().unwrap();
    let mut process = Process::attach(pid, stdout_writer, stderr_writer, NopHook).unwrap();

    assert_eq!(process.pid(), pid);
    assert_eq!(process.state(), ProcessState::Stopped);

    process.advance().unwrap();
    process.kill().unwrap();
    assert!(process.state().is_terminal());
}
