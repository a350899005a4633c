//! scatter-ctl — operator CLI for the object store and peer lists.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};

use scatter_core::config::ScatterConfig;
use scatter_core::{Endpoint, ObjectId};
use scatter_services::remote::format_http_date;
use scatter_services::{
    peer_string_lists, publish_peer_list, ObjectStore, PeerListKind, WorkDistributor,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_id(s: &str) -> Result<ObjectId> {
    s.parse().with_context(|| format!("invalid object id {s:?}"))
}

fn open_store(config: &ScatterConfig) -> Result<ObjectStore> {
    ObjectStore::from_config(&config.store).context("failed to open object store")
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_put(config: &ScatterConfig, id: &str, path: &str) -> Result<()> {
    let id = if id == "-" { ObjectId::random() } else { parse_id(id)? };
    let data = std::fs::read(path).with_context(|| format!("failed to read file: {path}"))?;
    let store = open_store(config)?;
    if store.put(&id, &data).await? {
        println!("{id}");
    } else {
        println!("{id} (already present)");
    }
    Ok(())
}

async fn cmd_get(config: &ScatterConfig, id: &str, timeout: Duration) -> Result<()> {
    let id = parse_id(id)?;
    let data = open_store(config)?.load(&id, timeout).await?;
    std::io::stdout()
        .write_all(&data)
        .context("failed to write to stdout")?;
    Ok(())
}

async fn cmd_rm(config: &ScatterConfig, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    open_store(config)?.erase(&id).await?;
    println!("erased {id}");
    Ok(())
}

async fn cmd_stat(config: &ScatterConfig, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let store = open_store(config)?;
    let local = store.local_path(&id);

    println!("═══════════════════════════════════════");
    println!("  Object {}", id.short());
    println!("═══════════════════════════════════════");
    println!("  Id        : {id}");
    println!("  Temporary : {}", id.is_temporary());
    println!("  Exists    : {}", store.exists(&id).await?);
    println!("  Cached    : {}", local.exists());
    println!("  Path      : {}", local.display());
    match store.get_mtime(&id).await? {
        Some(mtime) => println!("  Modified  : {}", format_http_date(mtime)),
        None => println!("  Modified  : -"),
    }
    Ok(())
}

async fn cmd_peers_show(config: &ScatterConfig, timeout: Duration) -> Result<()> {
    let store = open_store(config)?;
    let lists = peer_string_lists(&store, timeout).await?;

    println!("═══════════════════════════════════════");
    println!("  Peer Lists");
    println!("═══════════════════════════════════════");
    for (name, peers) in [("Clients", &lists.clients), ("Workers", &lists.workers)] {
        println!("  {name} ({})", peers.len());
        if peers.is_empty() {
            println!("    (none)");
        }
        for peer in peers {
            println!("    {peer}");
        }
    }
    Ok(())
}

async fn cmd_peers_publish(config: &ScatterConfig, kind: &str, peers: &[&str]) -> Result<()> {
    let kind: PeerListKind = kind.parse()?;
    let endpoints = peers
        .iter()
        .map(|p| p.parse::<Endpoint>().with_context(|| format!("invalid endpoint {p:?}")))
        .collect::<Result<Vec<_>>>()?;
    publish_peer_list(&open_store(config)?, kind, &endpoints).await?;
    println!("published {} {} endpoint(s)", endpoints.len(), kind.name());
    Ok(())
}

async fn cmd_submit(config: &ScatterConfig, id: &str, command: &str, timeout: Duration) -> Result<()> {
    let id = parse_id(id)?;
    let mut distributor = WorkDistributor::from_config(config).await?;
    let request_id = distributor.send_request(id, command.as_bytes().to_vec()).await?;
    tracing::debug!(request_id, resource = %id, "request submitted");
    let response = distributor
        .receive_response(timeout)
        .await?
        .with_context(|| format!("no response to request {request_id:#018x} within {timeout:?}"))?;
    println!("{}", response.into_result()?);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = ScatterConfig::write_default_if_missing()?;
    println!("{}", path.display());
    Ok(())
}

fn print_usage() {
    println!("Usage: scatter-ctl [--timeout <secs>] <command>");
    println!();
    println!("Commands:");
    println!("  put <id|-> <file>                     Store a file (- = random id)");
    println!("  get <id>                              Write an object to stdout");
    println!("  rm <id>                               Erase an object");
    println!("  stat <id>                             Show object metadata");
    println!("  peers show                            Print both peer lists");
    println!("  peers publish <client|worker> <ep>... Replace a peer list");
    println!("  submit <id> <command>                 Run one work request");
    println!("  id random                             Print a fresh object id");
    println!("  id derive <input-id> <command>        Print the output id for a request");
    println!("  config init                           Write the default config file");
    println!();
    println!("Options:");
    println!("  --timeout <secs>   Wait for objects and responses (default: {DEFAULT_TIMEOUT_SECS})");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--timeout" {
            i += 1;
            let secs: u64 = args
                .get(i)
                .context("--timeout requires a value")?
                .parse()
                .context("--timeout must be a number of seconds")?;
            timeout = Duration::from_secs(secs);
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    let config = ScatterConfig::load()?;

    match remaining.as_slice() {
        ["put", id, file]                     => cmd_put(&config, id, file).await,
        ["get", id]                           => cmd_get(&config, id, timeout).await,
        ["rm", id]                            => cmd_rm(&config, id).await,
        ["stat", id]                          => cmd_stat(&config, id).await,
        ["peers"] | ["peers", "show"]         => cmd_peers_show(&config, timeout).await,
        ["peers", "publish", kind, peers @ ..] => cmd_peers_publish(&config, kind, peers).await,
        ["submit", id, command]               => cmd_submit(&config, id, command, timeout).await,
        ["id", "random"]                      => { println!("{}", ObjectId::random()); Ok(()) }
        ["id", "derive", input, command]      => {
            println!("{}", ObjectId::derive(&parse_id(input)?, command.as_bytes()));
            Ok(())
        }
        ["config", "init"]                    => cmd_config_init(),
        ["help"] | ["--help"] | ["-h"] | []   => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
