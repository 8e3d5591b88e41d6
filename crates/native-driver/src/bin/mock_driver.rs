//! Deterministic driver used to exercise the client end to end.
//!
//! Answers every request with `{"root":{"key":<source>}}`, where `<source>` is
//! the decoded request content. Other modes misbehave on purpose.

use std::io::{self, BufRead, Write};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use native_driver::bridge::protocol::{Request, Response};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy)]
enum Mode {
    Simple,
    /// Sleep before each answer.
    Slow(Duration),
    /// Report a failure for every request.
    Fail,
    /// Stream bytes without ever ending a line.
    Flood,
    /// Answer this many requests, then exit.
    ExitAfter(usize),
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!(
                "Usage: mock-driver [simple | slow [--delay-ms <ms>] | fail | flood | exit-after <n>]"
            );
            process::exit(2);
        }
    };

    tracing::debug!(?mode, "mock driver ready");
    if let Err(e) = run(mode) {
        tracing::error!("mock driver failed: {e:#}");
        process::exit(1);
    }
}

/// Stdout carries the protocol, so logs go to stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("MOCK_DRIVER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            _ => "warn",
        };
        EnvFilter::new(format!("mock_driver={level}"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut rest = args.iter().skip(1).map(String::as_str);

    let mode = match rest.next() {
        None | Some("simple") => Mode::Simple,
        Some("slow") => {
            let delay_ms = match (rest.next(), rest.next()) {
                (None, _) => 3000,
                (Some("--delay-ms"), Some(ms)) => ms
                    .parse()
                    .map_err(|_| format!("invalid --delay-ms value: {ms}"))?,
                (Some(flag), _) => return Err(format!("unexpected argument: {flag}")),
            };
            Mode::Slow(Duration::from_millis(delay_ms))
        }
        Some("fail") => Mode::Fail,
        Some("flood") => Mode::Flood,
        Some("exit-after") => {
            let n = rest.next().ok_or("exit-after requires a count")?;
            Mode::ExitAfter(n.parse().map_err(|_| format!("invalid count: {n}"))?)
        }
        Some(other) => return Err(format!("unknown mode: {other}")),
    };

    if let Some(extra) = rest.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(mode)
}

fn run(mode: Mode) -> anyhow::Result<()> {
    let stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    if let Mode::Flood = mode {
        return flood(&mut stdout);
    }

    for (answered, line) in stdin.lines().enumerate() {
        let line = line.context("failed to read request")?;

        if let Mode::ExitAfter(limit) = mode
            && answered >= limit
        {
            tracing::debug!(answered, "exiting on purpose");
            return Ok(());
        }
        if let Mode::Slow(delay) = mode {
            thread::sleep(delay);
        }

        let response = respond(mode, &line);
        serde_json::to_writer(&mut stdout, &response).context("failed to encode response")?;
        stdout.write_all(b"\n")?;
        stdout.flush().context("failed to flush response")?;
    }

    tracing::debug!("stdin closed, exiting");
    Ok(())
}

fn respond(mode: Mode, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Response::Failure {
                message: format!("invalid request: {e}"),
            };
        }
    };

    let source = match request.encoding.decode(&request.content) {
        Ok(source) => source,
        Err(e) => {
            return Response::Failure {
                message: format!("invalid content: {e}"),
            };
        }
    };

    match mode {
        Mode::Fail => Response::Failure {
            message: format!("cannot parse {source:?}"),
        },
        _ => Response::Success {
            ast: json!({ "root": { "key": source } }),
        },
    }
}

fn flood(stdout: &mut impl Write) -> anyhow::Result<()> {
    let chunk = [b'x'; 1024];
    loop {
        stdout.write_all(&chunk).context("flood write failed")?;
        stdout.flush()?;
        thread::sleep(Duration::from_millis(5));
    }
}
