//! daprox binary: a DAP proxy server.
//!
//! Accepts editor-side DAP clients over TCP; one client connection is one
//! debug session, backed by one supervised backend process.

use anyhow::Context;
use clap::Parser;
use daprox::args::Args;
use daprox::codec::{self, FrameDecoder};
use daprox::launch::DebugConfiguration;
use daprox::relay::{DapProxy, SpawnLauncher};
use daprox::supervisor::Timeouts;
use daprox::trace::FileTracer;
use log::{info, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config: DebugConfiguration = match &args.launch_config {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("open {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("parse launch configuration {}", path.display()))?
        }
        None => DebugConfiguration::default(),
    };

    let tracer = match &args.log_file {
        Some(path) => Some(FileTracer::new(path)?),
        None => None,
    };
    if let Some(tracer) = &tracer {
        info!(target: "proxy", "diagnostics go to {}", tracer.path().display());
    }
    if args.trace_dap && tracer.is_none() {
        warn!(target: "proxy", "--trace-dap requires --log-file; tracing disabled");
    }
    let trace_wire = args.trace_dap && tracer.is_some();

    let addr: SocketAddr = args.listen.parse().context("invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "proxy", "daprox listening on {addr}");

    // one editor client at a time; one client == one debug session
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target: "proxy", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "proxy", "editor client connected: {peer}");
        if let Some(tracer) = &tracer {
            tracer.line(&format!("client connected: {peer}"));
        }

        let res = run_session(stream, config.clone(), tracer.clone(), trace_wire);
        if let Err(err) = res {
            warn!(target: "proxy", "session ended with error: {err:#}");
            if let Some(tracer) = &tracer {
                tracer.line(&format!("session error: {err:#}"));
            }
        } else if let Some(tracer) = &tracer {
            tracer.line("session finished OK");
        }
        if let Some(tracer) = &tracer {
            tracer.flush();
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}

/// Pump one editor connection through a proxy until either side closes.
fn run_session(
    stream: TcpStream,
    config: DebugConfiguration,
    tracer: Option<FileTracer>,
    trace_wire: bool,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (mut proxy, outbound) =
        DapProxy::new(config, Box::new(SpawnLauncher), Timeouts::default());

    // writer thread: proxy output → editor socket
    let mut write_half = stream.try_clone().context("clone editor stream")?;
    let writer_tracer = tracer.clone();
    let writer = std::thread::spawn(move || {
        for message in outbound {
            if trace_wire {
                if let (Some(tracer), Ok(line)) =
                    (&writer_tracer, serde_json::to_string(&message))
                {
                    tracer.line(&format!("-> {line}"));
                }
            }
            let frame = codec::encode(&message);
            if let Err(err) = write_half.write_all(&frame).and_then(|()| write_half.flush()) {
                warn!(target: "proxy", "error writing to editor: {err}");
                break;
            }
        }
    });

    // read loop: editor socket → proxy
    let mut read_half = stream;
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match read_half.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.feed(&chunk[..n]);
                while let Some(message) = decoder.next_frame() {
                    if trace_wire {
                        if let (Some(tracer), Ok(line)) =
                            (&tracer, serde_json::to_string(&message))
                        {
                            tracer.line(&format!("<- {line}"));
                        }
                    }
                    proxy.handle_message(message);
                }
            }
            Err(err) => {
                warn!(target: "proxy", "error reading from editor: {err}");
                break;
            }
        }
    }

    proxy.dispose();
    drop(proxy); // releases the editor channel so the writer drains and exits
    let _ = writer.join();
    info!(target: "proxy", "editor client disconnected");
    Ok(())
}
