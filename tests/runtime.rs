//! Runtime-side integration: a controller session driving a live
//! `RuntimeContext` over loopback, plus in-process interception flows.

use gldbg::classify::BuiltinClassifier;
use gldbg::config::Config;
use gldbg::connection::{Connection, Handle, InboundHandler};
use gldbg::debugger::Session;
use gldbg::error::Error;
use gldbg::proto::{
    Body, DebugCommand, DebugType, Envelope, ErrorCode, Execution, FunctionCall, ALL_THREADS,
};
use gldbg::runtime::{CallAction, RuntimeContext, MAX_CONNECTIONS};
use gldbg::transport::{Endpoint, Listener};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

fn context() -> Arc<RuntimeContext> {
    Arc::new(RuntimeContext::new(
        &Config::default(),
        Box::new(BuiltinClassifier),
    ))
}

fn call(name: &str, thread_id: u64) -> FunctionCall {
    FunctionCall {
        name: name.into(),
        thread_id,
        arguments: vec![],
        return_type: DebugType::UInt,
        return_value: vec![0, 0, 0, 0],
    }
}

/// Serve one controller session; hands the live server connection back so
/// tests can reach its handle for interception notifications.
fn serve_session(ctx: Arc<RuntimeContext>) -> (Endpoint, mpsc::Receiver<Connection>, JoinHandle<()>) {
    let listener = Listener::bind(&Endpoint::Tcp {
        host: "127.0.0.1".into(),
        port: 0,
    })
    .unwrap();
    let endpoint = listener.local_endpoint().unwrap();
    let (tx, rx) = mpsc::channel();

    let server = std::thread::spawn(move || {
        let transport = listener.accept().unwrap();
        let connection = ctx.accept_session(transport).unwrap();
        let probe = connection.handle();
        tx.send(connection).unwrap();
        while !probe.is_ended() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    (endpoint, rx, server)
}

#[test]
fn session_reports_process_info() {
    let ctx = context();
    let (endpoint, rx, server) = serve_session(Arc::clone(&ctx));

    let session = Session::establish(&endpoint, "runtime-test").unwrap();
    let info = session.process_info().unwrap();
    assert_eq!(info.pid, std::process::id());
    assert_eq!(info.threads, 0);

    session.close();
    drop(rx.recv().unwrap());
    server.join().unwrap();
}

#[test]
fn intercepted_call_is_inspectable_and_released() {
    let ctx = context();
    let (endpoint, rx, server) = serve_session(Arc::clone(&ctx));

    let session = Session::establish(&endpoint, "runtime-test").unwrap();
    let server_conn = rx.recv().unwrap();
    let runtime_handle = server_conn.handle();

    // no interception yet: the query is answered with an error
    assert!(matches!(session.current_calls(7), Err(Error::Rejected(_))));

    // a debuggee thread hits a draw call and blocks (interactive + halt-all)
    let intercepting = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || ctx.intercept(Some(&runtime_handle), call("glDrawArrays", 7)))
    };
    wait_for(|| ctx.records().get(7).is_some_and(|r| r.current_call().is_some()));

    let calls = session.current_calls(7).unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "glDrawArrays");
    assert_eq!(calls[0].thread_id, 7);

    // release it over the wire
    session
        .send_command(7, DebugCommand::CallOriginalAndProceed)
        .unwrap();
    let action = intercepting.join().unwrap().unwrap();
    assert_eq!(action, CallAction::Proceed);

    session.close();
    drop(server_conn);
    server.join().unwrap();
}

#[test]
fn broadcast_execution_change_unblocks_future_calls() {
    let ctx = context();
    let (endpoint, rx, server) = serve_session(Arc::clone(&ctx));

    let session = Session::establish(&endpoint, "runtime-test").unwrap();
    let server_conn = rx.recv().unwrap();

    // switch every thread (and the defaults for unseen ones) to unattended
    session
        .set_execution(Execution {
            thread_id: ALL_THREADS,
            mode: 0,
            policy: 0,
            target: None,
        })
        .unwrap();

    // fresh threads now proceed without blocking
    let a = ctx.intercept(None, call("glDrawArrays", 2)).unwrap();
    let b = ctx.intercept(None, call("glUseProgram", 3)).unwrap();
    assert_eq!(a, CallAction::Proceed);
    assert_eq!(b, CallAction::Proceed);

    // the aggregated snapshot sees both installed calls
    let calls = session.current_calls(ALL_THREADS).unwrap();
    let mut names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["glDrawArrays", "glUseProgram"]);

    session.close();
    drop(server_conn);
    server.join().unwrap();
}

#[test]
fn out_of_range_policy_is_fatal_to_the_session() {
    let ctx = context();
    let (endpoint, rx, server) = serve_session(Arc::clone(&ctx));

    let session = Session::establish(&endpoint, "runtime-test").unwrap();
    let server_conn = rx.recv().unwrap();

    let err = session
        .set_execution(Execution {
            thread_id: 5,
            mode: 1,
            policy: 9,
            target: None,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));

    // the violation ends the runtime side; its owner drops the connection,
    // which propagates the teardown to the controller
    wait_for(|| server_conn.is_ended());
    drop(server_conn);
    wait_for(|| session.connection().is_ended());

    session.close();
    server.join().unwrap();
}

#[test]
fn decision_function_follows_the_thread_execution_state() {
    let ctx = context();

    // interactive + halt-all default: nothing keeps executing
    assert!(!ctx.keep_executing(6, "glDrawArrays").unwrap());
    assert!(!ctx.keep_executing(6, "glVertex3f").unwrap());

    let record = ctx.records().get(6).unwrap();
    record.set_execution(
        gldbg::runtime::ExecutionMode::Interactive,
        gldbg::runtime::HaltPolicy::OnDrawCall,
    );
    assert!(!ctx.keep_executing(6, "glDrawArrays").unwrap());
    assert!(ctx.keep_executing(6, "glVertex3f").unwrap());
}

#[test]
fn unanswered_queries_stay_queued_until_proceed() {
    let ctx = context();

    let intercepting = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || ctx.intercept(None, call("glDrawElements", 9)))
    };
    wait_for(|| ctx.records().get(9).is_some());

    // a report request without a session keeps the thread halted; the
    // proceed behind it releases it
    ctx.deliver_command(9, DebugCommand::ReportCurrentCall)
        .unwrap();
    ctx.deliver_command(9, DebugCommand::CallOriginalAndProceed)
        .unwrap();
    assert_eq!(intercepting.join().unwrap().unwrap(), CallAction::Proceed);
}

#[test]
fn stop_execution_aborts_the_call() {
    let ctx = context();

    let intercepting = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || ctx.intercept(None, call("glDrawArrays", 4)))
    };
    wait_for(|| ctx.records().get(4).is_some());

    ctx.deliver_command(4, DebugCommand::StopExecution).unwrap();
    assert_eq!(intercepting.join().unwrap().unwrap(), CallAction::Abort);
}

#[test]
fn broadcast_command_releases_every_halted_thread() {
    let ctx = context();

    let workers: Vec<_> = [11u64, 12, 13]
        .into_iter()
        .map(|thread_id| {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.intercept(None, call("glDrawArrays", thread_id)))
        })
        .collect();
    wait_for(|| ctx.records().len() == 3);

    let delivered = ctx
        .deliver_command(ALL_THREADS, DebugCommand::CallOriginalAndProceed)
        .unwrap();
    assert_eq!(delivered, 3);
    for worker in workers {
        assert_eq!(worker.join().unwrap().unwrap(), CallAction::Proceed);
    }
}

#[test]
fn teardown_aborts_blocked_threads() {
    let ctx = context();

    let intercepting = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || ctx.intercept(None, call("glBegin", 21)))
    };
    wait_for(|| ctx.records().get(21).is_some());

    ctx.teardown();
    assert_eq!(intercepting.join().unwrap().unwrap(), CallAction::Abort);
}

struct Quiet;

impl InboundHandler for Quiet {
    fn handle(&self, _: &Handle, _: Envelope) -> Result<Option<Envelope>, Error> {
        Ok(None)
    }
}

#[test]
fn session_cap_is_enforced() {
    let ctx = context();
    let listener = Listener::bind(&Endpoint::Tcp {
        host: "127.0.0.1".into(),
        port: 0,
    })
    .unwrap();
    let endpoint = listener.local_endpoint().unwrap();

    let server = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || {
            let mut sessions = Vec::new();
            let mut last = None;
            for _ in 0..=MAX_CONNECTIONS {
                let transport = listener.accept().unwrap();
                match ctx.accept_session(transport) {
                    Ok(connection) => sessions.push(connection),
                    Err(e) => last = Some(e),
                }
            }
            (sessions, last)
        })
    };

    let clients: Vec<_> = (0..=MAX_CONNECTIONS)
        .map(|_| Connection::connect(&endpoint, Quiet).unwrap())
        .collect();

    let (sessions, last) = server.join().unwrap();
    assert_eq!(sessions.len(), MAX_CONNECTIONS);
    assert!(matches!(last, Some(Error::ConnectionLimit(n)) if n == MAX_CONNECTIONS));

    drop(clients);
    drop(sessions);
}

#[test]
fn gl_function_list_is_not_served() {
    let ctx = context();
    let (endpoint, rx, server) = serve_session(ctx);

    let session = Session::establish(&endpoint, "runtime-test").unwrap();
    let reply = session
        .request(Body::GlFunctions)
        .unwrap()
        .wait_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(reply.error, ErrorCode::Generic);

    session.close();
    drop(rx.recv().unwrap());
    server.join().unwrap();
}

fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}
