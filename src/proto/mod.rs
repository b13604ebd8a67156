//! Wire protocol: typed message envelopes and protocol constants.
//!
//! Every frame on the wire is `[u32 LE length][length bytes of bincode
//! payload]` (see [`codec`]). The payload is always an [`Envelope`]. The
//! first envelope on any connection must carry [`Body::Announce`]; the
//! receiver verifies the protocol identifier and the major version before
//! anything else is accepted.

pub mod codec;

use serde::{Deserialize, Serialize};

/// Protocol identifier, carried in every announce.
pub const PROTO_ID: u64 = 0xBEAF;

pub const VERSION_MAJOR: u16 = 0;
pub const VERSION_MINOR: u16 = 0;
pub const VERSION_REVISION: u16 = 1;

/// Greeting sent in a successful announce reply.
pub const WELCOME: &str = "Welcome dude!";

/// Upper bound for a single frame payload. Larger lengths are a protocol
/// violation and tear the connection down without reading the payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// `thread_id` value addressing all traced threads at once.
pub const ALL_THREADS: u64 = 0;

/// Envelope id used by fire-and-forget notifications. Request ids start
/// at 1, so a reply carrying this id correlates to nothing and is handed
/// to the inbound handler instead.
pub const NOTIFY_ID: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl Version {
    pub fn current() -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            revision: VERSION_REVISION,
        }
    }
}

/// Verdict codes carried in replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    None,
    HeaderMismatch,
    VersionMismatch,
    Generic,
}

/// Closed set of argument/return value type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    Struct,
    Pointer,
    Bitfield,
    Enum,
    Bool,
}

impl DebugType {
    /// Byte width of a value of this type as captured in the debuggee.
    ///
    /// Total over the whole enum; `Struct` has no intrinsic width and
    /// reports zero (its raw bytes carry their own length).
    pub fn size_of(self) -> usize {
        match self {
            DebugType::Char | DebugType::UChar | DebugType::Bool => 1,
            DebugType::Short | DebugType::UShort => 2,
            DebugType::Int
            | DebugType::UInt
            | DebugType::Float
            | DebugType::Bitfield
            | DebugType::Enum => 4,
            DebugType::Long | DebugType::ULong | DebugType::Double | DebugType::Pointer => 8,
            DebugType::Struct => 0,
        }
    }
}

/// Three-way outcome of comparing two captured values.
///
/// `Struct` values cannot be compared field-blind; they yield
/// [`Comparison::NotComparable`] rather than a false-positive equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Differs,
    NotComparable,
}

/// Compare two raw values of the same type tag.
pub fn compare_values(ty: DebugType, lhs: &[u8], rhs: &[u8]) -> Comparison {
    if ty == DebugType::Struct {
        return Comparison::NotComparable;
    }
    if lhs == rhs {
        Comparison::Equal
    } else {
        Comparison::Differs
    }
}

/// One captured argument of an intercepted call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionArgument {
    /// Address of the argument storage inside the debuggee.
    pub address: u64,
    pub type_tag: DebugType,
    pub data: Vec<u8>,
}

/// An intercepted library call, captured by the injected runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub thread_id: u64,
    pub arguments: Vec<FunctionArgument>,
    pub return_type: DebugType,
    pub return_value: Vec<u8>,
}

/// Handshake payload, first message on every connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    /// Must equal [`PROTO_ID`].
    pub id: u64,
    pub client_name: String,
    pub version: Version,
}

/// Debuggee process description, reply data for a PROCESS_INFO request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub program: String,
    pub threads: u32,
}

/// Execution-mode adjustment addressed to one thread (or all of them).
///
/// `mode` and `policy` travel as raw discriminants; the runtime validates
/// them at the boundary and answers `InvalidOperation` for out-of-range
/// values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub thread_id: u64,
    pub mode: u8,
    pub policy: u8,
    /// Halt target name, meaningful only for the user-defined policy.
    pub target: Option<String>,
}

/// Commands interpreted by a blocked intercepting thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugCommand {
    /// Execute the original call and run until the next interception.
    CallOriginalAndProceed,
    /// Execute the original call, stay halted at the same interception.
    CallOriginal,
    /// Re-send the current call description; stays halted.
    ReportCurrentCall,
    /// Abandon the call and halt the thread for teardown.
    StopExecution,
}

/// Reply data, by request kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplyData {
    None,
    ProcessInfo(ProcessInfo),
    Calls(Vec<FunctionCall>),
}

/// Server → client response, correlated to its request by envelope id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub error: ErrorCode,
    pub message: String,
    pub data: ReplyData,
}

impl Reply {
    pub fn ok(message: impl Into<String>, data: ReplyData) -> Self {
        Self {
            error: ErrorCode::None,
            message: message.into(),
            data,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code,
            message: message.into(),
            data: ReplyData::None,
        }
    }
}

/// Message payload. Variant order fixes the wire type indices:
/// ANNOUNCE(0), PROCESS_INFO(1), GL_FUNCTIONS(2), FUNCTION_CALL(3),
/// EXECUTION(4), DEBUG_COMMAND(5), replies last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Announce(Announce),
    ProcessInfo,
    GlFunctions,
    FunctionCall { thread_id: u64 },
    Execution(Execution),
    DebugCommand { thread_id: u64, command: DebugCommand },
    Reply(Reply),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Announce(_) => "announce",
            Body::ProcessInfo => "process_info",
            Body::GlFunctions => "gl_functions",
            Body::FunctionCall { .. } => "function_call",
            Body::Execution(_) => "execution",
            Body::DebugCommand { .. } => "debug_command",
            Body::Reply(_) => "reply",
        }
    }
}

/// A framed protocol message.
///
/// `id` is process-unique and strictly increasing for requests; a reply
/// carries the id of the request it answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub body: Body,
}

impl Envelope {
    pub fn new(id: u64, body: Body) -> Self {
        Self { id, body }
    }

    /// Reply envelope answering request `id`.
    pub fn reply_to(id: u64, reply: Reply) -> Self {
        Self {
            id,
            body: Body::Reply(reply),
        }
    }
}
