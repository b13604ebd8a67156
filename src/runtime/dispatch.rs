//! Inbound message dispatch for the injected runtime.
//!
//! One exhaustive match over the closed message set: every variant has a
//! compile-time-checked arm, so an unhandled kind answers with a generic
//! error instead of a crash. The first message on a connection must be an
//! announce; anything else ends the connection.

use crate::connection::{Handle, InboundHandler};
use crate::error::Error;
use crate::proto::{
    Announce, Body, Envelope, ErrorCode, ProcessInfo, Reply, ReplyData, ALL_THREADS, PROTO_ID,
    VERSION_MAJOR, WELCOME,
};
use crate::runtime::policy::{ExecutionMode, HaltPolicy};
use crate::runtime::RuntimeContext;
use crate::{gl_info, gl_warn};
use std::sync::Arc;

/// Connection-side adapter: routes inbound envelopes into the runtime.
pub struct RuntimeDispatcher {
    ctx: Arc<RuntimeContext>,
}

impl RuntimeDispatcher {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }
}

impl InboundHandler for RuntimeDispatcher {
    fn handle(&self, conn: &Handle, envelope: Envelope) -> Result<Option<Envelope>, Error> {
        dispatch(&self.ctx, conn, envelope)
    }
}

pub fn dispatch(
    ctx: &RuntimeContext,
    conn: &Handle,
    envelope: Envelope,
) -> Result<Option<Envelope>, Error> {
    let id = envelope.id;

    // handshake gate: nothing but an announce passes on an unverified link
    if !conn.is_verified() && !matches!(envelope.body, Body::Announce(_)) {
        conn.end_connection();
        return Err(Error::AnnounceExpected);
    }

    match envelope.body {
        Body::Announce(announce) => Ok(Some(handle_announce(conn, id, announce))),

        Body::ProcessInfo => {
            let info = ProcessInfo {
                pid: std::process::id(),
                program: ctx.program().to_string(),
                threads: ctx.records().len() as u32,
            };
            Ok(Some(Envelope::reply_to(
                id,
                Reply::ok("process info", ReplyData::ProcessInfo(info)),
            )))
        }

        // no handler for the function-list query in this design
        Body::GlFunctions => Ok(Some(Envelope::reply_to(
            id,
            Reply::error(ErrorCode::Generic, "not implemented"),
        ))),

        Body::FunctionCall { thread_id } => {
            if thread_id == ALL_THREADS {
                // ordered multi-lock aggregation, replies synchronously itself
                ctx.snapshot_all_calls(conn, id)?;
                return Ok(None);
            }

            let calls: Vec<_> = ctx
                .records()
                .get(thread_id)
                .and_then(|record| record.current_call())
                .into_iter()
                .collect();
            if calls.is_empty() {
                return Ok(Some(Envelope::reply_to(
                    id,
                    Reply::error(
                        ErrorCode::Generic,
                        format!("no current call for thread {thread_id}"),
                    ),
                )));
            }
            Ok(Some(Envelope::reply_to(
                id,
                Reply::ok("current call", ReplyData::Calls(calls)),
            )))
        }

        Body::Execution(execution) => {
            // raw discriminants are validated here, at the wire boundary
            let mode = ExecutionMode::from_raw(execution.mode)?;
            let policy = HaltPolicy::from_raw(execution.policy, execution.target.clone())?;

            if execution.thread_id == ALL_THREADS {
                ctx.set_default_execution(mode, policy.clone());
                for record in ctx.records().snapshot_in_order() {
                    record.set_execution(mode, policy.clone());
                }
            } else {
                let (d_mode, d_policy) = ctx.default_execution();
                let (_, record) =
                    ctx.records()
                        .lookup_or_insert(execution.thread_id, d_mode, d_policy)?;
                record.set_execution(mode, policy);
            }

            Ok(Some(Envelope::reply_to(
                id,
                Reply::ok("execution mode updated", ReplyData::None),
            )))
        }

        // not answered here: the addressed (possibly broadcast) threads
        // dequeue the command and produce the effect
        Body::DebugCommand { thread_id, command } => {
            let delivered = ctx.deliver_command(thread_id, command)?;
            gl_info!(
                target: "runtime",
                "debug command {command:?} queued for {delivered} thread(s)"
            );
            Ok(None)
        }

        Body::Reply(_) => {
            gl_warn!(target: "runtime", "unexpected reply envelope (id {id}) from {}", conn.peer());
            Ok(Some(Envelope::reply_to(
                id,
                Reply::error(ErrorCode::Generic, "replies cannot be dispatched"),
            )))
        }
    }
}

fn handle_announce(conn: &Handle, id: u64, announce: Announce) -> Envelope {
    if announce.id != PROTO_ID {
        gl_warn!(
            target: "runtime",
            "announce with foreign protocol id {:#x} from {}",
            announce.id,
            conn.peer()
        );
        conn.end_connection();
        return Envelope::reply_to(
            id,
            Reply::error(ErrorCode::HeaderMismatch, "unknown protocol identifier"),
        );
    }

    if announce.version.major != VERSION_MAJOR {
        gl_warn!(
            target: "runtime",
            "announce from {} with major version {} (local {})",
            conn.peer(),
            announce.version.major,
            VERSION_MAJOR
        );
        conn.end_connection();
        return Envelope::reply_to(
            id,
            Reply::error(ErrorCode::VersionMismatch, "protocol major version differs"),
        );
    }

    conn.set_verified();
    gl_info!(
        target: "runtime",
        "client `{}` announced (v{}.{}.{})",
        announce.client_name,
        announce.version.major,
        announce.version.minor,
        announce.version.revision
    );
    Envelope::reply_to(id, Reply::ok(WELCOME, ReplyData::None))
}
