use anyhow::bail;
use clap::Parser;
use gldbg::config::{self, Config};
use gldbg::debugger::{DebugConfig, Process, ProcessEventHook, ProcessState, Session};
use gldbg::proto::{DebugCommand, ALL_THREADS};
use gldbg::transport::Endpoint;
use gldbg::weak_error;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Attach to a running process instead of launching one.
    #[arg(long)]
    pid: Option<i32>,

    /// Endpoint of the injected runtime, e.g. `tcp://127.0.0.1:60123`
    /// or `unix:///tmp/gldbg.sock`. Defaults to the environment config.
    #[arg(long)]
    endpoint: Option<String>,

    /// Working directory for the debuggee.
    #[arg(long)]
    workdir: Option<String>,

    /// Target program (ignored with --pid).
    debuggee: Option<String>,

    /// Target program arguments.
    #[arg(raw = true)]
    args: Vec<String>,
}

struct PrintHook;

impl ProcessEventHook for PrintHook {
    fn on_state(&self, old: ProcessState, new: ProcessState) {
        println!("debuggee: {} -> {}", old.name(), new.name());
        if let ProcessState::Exited(code) = new {
            println!("debuggee exited with code {code}");
        }
    }

    fn on_new_child(&self, parent: Pid, child: Pid) {
        println!("debuggee: new traced child {child} (parent {parent})");
    }
}

fn parse_endpoint(raw: &str) -> anyhow::Result<Endpoint> {
    if let Some(path) = raw.strip_prefix("unix://") {
        return Ok(Endpoint::Unix { path: path.into() });
    }
    if let Some(addr) = raw.strip_prefix("tcp://") {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("tcp endpoint must be host:port"))?;
        return Ok(Endpoint::Tcp {
            host: host.to_string(),
            port: port.parse()?,
        });
    }
    bail!("unknown endpoint scheme: {raw}")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    config::set(Config::from_env()?);
    let cfg = config::current();

    env_logger::Builder::new()
        .filter_level(cfg.log_level)
        .parse_default_env()
        .init();

    let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
    let (stderr_reader, stderr_writer) = os_pipe::pipe()?;
    drop((stdout_reader, stderr_reader));

    let mut process = match args.pid {
        Some(pid) => Process::attach(
            Pid::from_raw(pid),
            stdout_writer,
            stderr_writer,
            PrintHook,
        )?,
        None => {
            let Some(debuggee) = args.debuggee.as_deref() else {
                bail!("either a debuggee program or --pid is required");
            };
            let mut debug_config = DebugConfig::new(debuggee).with_args(args.args.clone());
            if let Some(workdir) = args.workdir.as_deref() {
                debug_config = debug_config.with_workdir(workdir);
            }
            Process::launch(debug_config, stdout_writer, stderr_writer, PrintHook)?
        }
    };

    println!("debuggee pid {}", process.pid());

    let endpoint = match args.endpoint.as_deref() {
        Some(raw) => parse_endpoint(raw)?,
        None => cfg.endpoint(),
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    process.advance()?;

    // the runtime listens once the debuggee reaches its GL initialization;
    // retry the session until it is up or the debuggee is gone
    let mut session = None;
    for _ in 0..50 {
        if interrupted.load(Ordering::SeqCst) || process.state().is_terminal() {
            break;
        }
        match Session::establish(&endpoint, "gldbg-cli") {
            Ok(s) => {
                session = Some(s);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(200)),
        }
    }

    if let Some(session) = session {
        let info = session.process_info()?;
        println!(
            "runtime up: pid {}, program {}, {} traced thread(s)",
            info.pid, info.program, info.threads
        );
        process.set_session(session);
    } else {
        println!("no runtime session; running debuggee under plain trace");
    }

    while !process.state().is_terminal() {
        if interrupted.load(Ordering::SeqCst) {
            println!("interrupt: killing debuggee");
            break;
        }
        if let Some(session) = process.session() {
            if session.connection().is_ended() {
                println!("runtime session ended");
                break;
            }
            // keep all threads flowing between inspections
            weak_error!(
                session.send_command(ALL_THREADS, DebugCommand::CallOriginalAndProceed),
                "command broadcast failed:"
            );
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    process.kill()?;
    Ok(())
}
