//! batch-dispatch: run a JSONL batch against an OpenAI-compatible endpoint.
//!
//! Usage:
//!   batch-dispatch run --input <requests.jsonl> [--config <file>] [--base-url <url>]
//!                      [--model <name>] [--output <results.jsonl>]
//!   batch-dispatch version
//!   batch-dispatch help

use ai_batch_dispatch::progress::FnProgressSink;
use ai_batch_dispatch::transport::{HttpChatProvider, HttpProviderConfig};
use ai_batch_dispatch::{BatchDispatcher, BatchStatus, DispatchConfig, Request};
use anyhow::{bail, Context};
use futures::StreamExt;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"batch-dispatch: run LLM completion batches

USAGE:
    batch-dispatch <COMMAND> [OPTIONS]

COMMANDS:
    run --input <file>          Dispatch one request per JSONL line
        [--config <file>]       Dispatch config (.yaml/.yml/.json)
        [--base-url <url>]      Provider base URL (default https://api.openai.com/v1)
        [--model <name>]        Model name (default gpt-4o-mini)
        [--output <file>]       Write responses as JSONL (default stdout)
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    AI_BATCH_API_KEY            Bearer token for the provider
    AI_BATCH_MAX_CONCURRENCY    Overrides max_concurrent_requests
    AI_BATCH_RPM                Overrides requests_per_minute
    AI_BATCH_MAX_RETRIES        Overrides max_retries
    RUST_LOG                    Log filter (e.g. ai_batch_dispatch=debug)

Ctrl-C cancels the batch; responses finished so far are still written."#
    );
}

fn cmd_version() {
    println!("batch-dispatch {}", env!("CARGO_PKG_VERSION"));
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn read_requests(path: &PathBuf) -> anyhow::Result<Vec<Request>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open input {}", path.display()))?;
    let mut requests = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid request", path.display(), lineno + 1))?;
        requests.push(request);
    }
    Ok(requests)
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let Some(input) = flag_value(args, "--input") else {
        bail!("run requires --input <requests.jsonl>");
    };
    let requests = read_requests(&PathBuf::from(input))?;

    let config = match flag_value(args, "--config") {
        Some(path) => DispatchConfig::from_path(path)?,
        None => DispatchConfig::default(),
    }
    .apply_env_overrides();

    let mut provider_config = HttpProviderConfig::default();
    if let Some(url) = flag_value(args, "--base-url") {
        provider_config.base_url = url.to_string();
    }
    if let Some(model) = flag_value(args, "--model") {
        provider_config.model = model.to_string();
    }
    let provider = HttpChatProvider::new(provider_config)?;
    let dispatcher = Arc::new(BatchDispatcher::new(config, Arc::new(provider))?);

    let sink = Arc::new(FnProgressSink::new(
        |id: &str, _content: &str, error: Option<&str>| match error {
            None => eprintln!("  ok    {id}"),
            Some(e) => eprintln!("  fail  {id}: {e}"),
        },
    ));

    eprintln!("Dispatching {} request(s)...", requests.len());
    let mut handle = dispatcher.dispatch(requests, sink);
    let mut states = handle.states();

    let interrupt = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling batch...");
                dispatcher.cancel();
            }
        })
    };

    let mut last = handle.latest();
    while let Some(state) = states.next().await {
        last = state;
    }
    interrupt.abort();
    dispatcher.close().await;

    let mut ids: Vec<&String> = last.responses.keys().collect();
    ids.sort();
    let out: Box<dyn Write> = match flag_value(args, "--output") {
        Some(path) => Box::new(
            std::fs::File::create(path).with_context(|| format!("cannot create {path}"))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    let mut out = BufWriter::new(out);
    for id in ids {
        serde_json::to_writer(&mut out, &last.responses[id])?;
        writeln!(out)?;
    }
    out.flush()?;

    eprintln!(
        "{:?}: {}/{} completed, {} failed",
        last.status,
        last.completed_count,
        last.total_count,
        last.failed_count()
    );
    match last.status {
        BatchStatus::Completed if last.failed_count() == 0 => Ok(()),
        BatchStatus::Completed | BatchStatus::Cancelled => std::process::exit(2),
        _ => bail!(last.error.unwrap_or_else(|| "batch failed".to_string())),
    }
}
