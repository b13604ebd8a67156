//! Debuggee process instantiation: fork/traceme/exec launch and
//! attach-by-pid.

use crate::error::Error;
use crate::error::Error::{Ptrace, Waitpid};
use crate::gl_warn;
use nix::sys;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use os_pipe::PipeWriter;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use sysinfo::{RefreshKind, System};

/// Launch-time parameters of a debuggee.
#[derive(Clone, Debug)]
pub struct DebugConfig {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub trace_fork: bool,
    pub trace_exec: bool,
    pub trace_clone: bool,
}

impl DebugConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            workdir: None,
            trace_fork: true,
            trace_exec: true,
            trace_clone: true,
        }
    }

    pub fn with_args<A: IntoIterator<Item = I>, I: Into<String>>(mut self, args: A) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Ptrace trace options selected by this config, plus exit-kill so an
    /// aborted controller never leaves an orphaned, still-traced debuggee.
    pub fn trace_options(&self) -> Options {
        let mut options = Options::PTRACE_O_EXITKILL;
        if self.trace_fork {
            options |= Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK;
        }
        if self.trace_exec {
            options |= Options::PTRACE_O_TRACEEXEC;
        }
        if self.trace_clone {
            options |= Options::PTRACE_O_TRACECLONE;
        }
        options
    }
}

/// Process state (typestate).
pub trait State {}

/// Process running and attached with `ptrace`.
pub struct Installed;

impl State for Installed {}

/// Process prepared for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// Debuggee child process.
pub struct Child<S: State> {
    config: DebugConfig,
    stdout: PipeWriter,
    stderr: PipeWriter,
    pid: Option<Pid>,
    external: bool,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create a new process template, but don't start it.
    ///
    /// # Arguments
    ///
    /// * `config`: program, arguments and trace flags
    /// * `stdout`: stdout pipe
    /// * `stderr`: stderr pipe
    pub fn new(config: DebugConfig, stdout: PipeWriter, stderr: PipeWriter) -> Child<Template> {
        Self {
            config,
            stdout,
            stderr,
            pid: None,
            external: false,
            _p: PhantomData,
        }
    }

    /// Instantiate the debuggee with the caller as tracer.
    ///
    /// The child requests tracing, optionally changes its working directory
    /// (failure is a warning, not fatal) and executes the target; the exec
    /// raises an implicit trap. The parent confirms the initial stop; any
    /// other wait status kills the child and fails the launch.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let mut debuggee_cmd = Command::new(&self.config.program);
        debuggee_cmd
            .args(&self.config.args)
            .stdout(self.stdout.try_clone()?)
            .stderr(self.stderr.try_clone()?);

        if let Some(workdir) = self.config.workdir.clone() {
            if workdir.is_dir() {
                debuggee_cmd.current_dir(workdir);
            } else {
                gl_warn!(
                    target: "debugger",
                    "workdir {} does not exist, debuggee keeps the controller's cwd",
                    workdir.display()
                );
            }
        }

        unsafe {
            debuggee_cmd.pre_exec(move || {
                sys::ptrace::traceme()?;
                Ok(())
            });
        }

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child: pid }) => {
                let status = waitpid(pid, None).map_err(Waitpid)?;
                let stopped = matches!(
                    status,
                    WaitStatus::Stopped(_, Signal::SIGTRAP)
                        | WaitStatus::Stopped(_, Signal::SIGSTOP)
                );
                if !stopped {
                    let _ = sys::signal::kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                    return Err(Error::ProcessNotStarted);
                }

                Ok(Child {
                    config: self.config.clone(),
                    stdout: self.stdout.try_clone()?,
                    stderr: self.stderr.try_clone()?,
                    pid: Some(pid),
                    external: false,
                    _p: PhantomData,
                })
            }
            Ok(ForkResult::Child) => {
                let err = debuggee_cmd.exec();
                // reached only when exec itself failed
                eprintln!("run debuggee fail with: {err}");
                std::process::exit(101);
            }
            Err(e) => Err(Error::Syscall("fork", e)),
        }
    }
}

impl Child<Installed> {
    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.expect("installed child has a pid")
    }

    /// Apply trace options. Valid only after the first observed stop.
    pub fn apply_trace_options(&self) -> Result<(), Error> {
        sys::ptrace::setoptions(self.pid(), self.config.trace_options()).map_err(Ptrace)
    }

    /// Create [`Child`] from an already running external process.
    ///
    /// # Arguments
    ///
    /// * `pid`: an external process pid
    /// * `stdout`: stdout pipe, kept only for a possible restart
    /// * `stderr`: stderr pipe, kept only for a possible restart
    pub fn from_external(pid: Pid, stdout: PipeWriter, stderr: PipeWriter) -> Result<Self, Error> {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());

        let external_process = System::process(&sys, sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(Error::AttachedProcessNotFound(pid))?;

        let program = external_process
            .exe()
            .ok_or(Error::AttachedProcessNotFound(pid))?
            .to_string_lossy()
            .to_string();
        let workdir = external_process.cwd().map(ToOwned::to_owned);

        // the kernel reports an empty cmdline for some processes
        let args = external_process.cmd().get(1..).unwrap_or_default().to_vec();
        let mut config = DebugConfig::new(program).with_args(args);
        config.workdir = workdir;

        sys::ptrace::seize(pid, config.trace_options()).map_err(Error::Attach)?;
        sys::ptrace::interrupt(pid).map_err(Error::Attach)?;
        waitpid(pid, None).map_err(Error::Attach)?;

        Ok(Self {
            config,
            stdout,
            stderr,
            pid: Some(pid),
            external: true,
            _p: PhantomData,
        })
    }
}

impl<S: State> Child<S> {
    /// Return a program name.
    pub fn program(&self) -> &str {
        self.config.program.as_str()
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    /// True when process was attached by its pid, false elsewhere.
    pub fn is_external(&self) -> bool {
        self.external
    }
}
