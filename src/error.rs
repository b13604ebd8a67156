use crate::connection::CloseReason;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- transport errors ------------------------------------------
    #[error("frame length {0} exceeds maximum of {1} bytes")]
    FrameTooLarge(usize, usize),
    #[error("peer closed the stream mid-frame ({got} of {want} bytes)")]
    ShortRead { got: usize, want: usize },
    #[error("receive timed out")]
    RecvTimeout,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("response correlates to no outstanding request (id {0})")]
    UnknownRequest(u64),
    #[error("first message on a connection must be an announce")]
    AnnounceExpected,
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("connection closed ({0})")]
    ConnectionClosed(CloseReason),
    #[error("announce rejected by peer: {0}")]
    Rejected(String),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),

    // --------------------------------- resource-limit errors -------------------------------------
    #[error("traced thread limit reached ({0} records)")]
    ThreadLimit(usize),
    #[error("connection limit reached ({0} sessions)")]
    ConnectionLimit(usize),

    // --------------------------------- internal errors -------------------------------------------
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("command result already resolved")]
    AlreadyResolved,

    // --------------------------------- debuggee process errors -----------------------------------
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error("operation requires a stopped debuggee (state: {0})")]
    NotStopped(&'static str),
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
}

impl Error {
    /// Return a hint to an interface - continue the session after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::FrameTooLarge(_, _) => false,
            Error::ShortRead { .. } => false,
            Error::RecvTimeout => false,
            Error::UnknownRequest(_) => false,
            Error::AnnounceExpected => false,
            Error::Malformed(_) => false,
            Error::ConnectionClosed(_) => false,
            Error::Rejected(_) => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,
            Error::ProcessNotStarted => false,
            Error::NotStopped(_) => false,

            // currently fatal errors
            Error::Syscall(_, _) => true,
            Error::ThreadLimit(_) => true,
            Error::ConnectionLimit(_) => true,
            Error::InvalidOperation(_) => true,
            Error::AlreadyResolved => true,
            Error::AttachedProcessNotFound(_) => true,
            Error::Attach(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
