use std::net::TcpListener;
use std::sync::Arc;

use clap::Parser;

use cxdb::config::Config;
use cxdb::metrics::Metrics;
use cxdb::proto::server::{ServerShared, start_server};
use cxdb::proto::session::SessionIds;
use cxdb::registry::Registry;
use cxdb::store::Store;
use cxdb::{http, telemetry};

/// Context store server: binary protocol plus HTTP read gateway.
#[derive(Debug, Parser)]
#[command(name = "cxdb", version)]
struct Cli {
    /// Data directory (overrides CXDB_DATA_DIR).
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Binary protocol bind address (overrides CXDB_BIND).
    #[arg(long)]
    bind: Option<String>,

    /// HTTP gateway bind address (overrides CXDB_HTTP_BIND).
    #[arg(long)]
    http_bind: Option<String>,

    /// Reject APPEND_TURN for types missing from the registry.
    #[arg(long)]
    strict_types: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    if let Err(err) = run(cli) {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> cxdb::Result<()> {
    let mut config = Config::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(http_bind) = cli.http_bind {
        config.http_bind_addr = http_bind;
    }
    if cli.strict_types {
        config.strict_types = true;
    }

    tracing::info!(
        data_dir = %config.data_dir.display(),
        bind = %config.bind_addr,
        http_bind = %config.http_bind_addr,
        strict_types = config.strict_types,
        "starting cxdb"
    );

    let store = Arc::new(Store::open(&config.data_dir, config.max_payload_bytes)?);
    let registry = Arc::new(Registry::open(&config.registry_dir())?);
    let metrics = Arc::new(Metrics::new());
    tracing::info!(
        turns = store.turns.turn_count(),
        blobs = store.blobs.count(),
        types = registry.type_count(),
        "store recovered"
    );

    let http_handle = http::start_http(
        &config.http_bind_addr,
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    )?;
    tracing::info!(addr = %http_handle.local_addr, "http gateway listening");

    let listener = TcpListener::bind(&config.bind_addr)?;
    let shared = Arc::new(ServerShared {
        store,
        registry,
        metrics,
        strict_types: config.strict_types,
        max_inflight_per_conn: config.max_inflight_per_conn,
        session_ids: SessionIds::new(),
    });
    let server = start_server(listener, shared)?;
    tracing::info!(addr = %server.local_addr, "binary protocol listening");

    server.join();
    http_handle.join();
    Ok(())
}
