//! Milter Engine Daemon Binary
//!
//! Runs a small demonstration filter: it tags every message with a summary
//! header and rejects messages already flagged as spam upstream.

use anyhow::Result;
use async_trait::async_trait;
use bstr::{BStr, BString, ByteSlice};
use clap::Parser;
use milter_engine::capabilities::ActionSet;
use milter_engine::config::{generate_example_config, Config};
use milter_engine::{Milter, PeerAddr, Registry, Server, Session, SmtpReply, Verdict};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

/// Milter Engine Daemon
#[derive(Parser, Debug)]
#[command(name = "milterd")]
#[command(about = "Mail filter daemon speaking the milter protocol")]
#[command(version = milter_engine::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "milterd.yaml")]
    config: PathBuf,

    /// Listening socket, overrides the configuration (e.g. inet:8890@127.0.0.1)
    #[arg(short = 'p', long)]
    connection: Option<String>,

    /// Per-stage timeout in seconds, overrides the configuration
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Increase logging verbosity (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Write the effective configuration to a file and exit
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,
}

/// Per-connection state of the demo filter
#[derive(Debug, Default)]
struct Transaction {
    client: String,
    recipients: usize,
    headers: usize,
    body_bytes: usize,
}

struct Tagger;

#[async_trait]
impl Milter for Tagger {
    type Context = Transaction;

    async fn connect(
        &self,
        session: &mut Session<Transaction>,
        hostname: &BStr,
        address: &PeerAddr,
    ) -> Verdict {
        session.set_context(Transaction {
            client: format!("{hostname} [{address}]"),
            ..Transaction::default()
        });
        Verdict::Continue
    }

    async fn envelope_from(
        &self,
        session: &mut Session<Transaction>,
        _address: &BStr,
        _args: &[BString],
    ) -> Verdict {
        if let Some(tx) = session.context_mut() {
            tx.recipients = 0;
            tx.headers = 0;
            tx.body_bytes = 0;
        }
        Verdict::Continue
    }

    async fn envelope_recipient(
        &self,
        session: &mut Session<Transaction>,
        _address: &BStr,
        _args: &[BString],
    ) -> Verdict {
        if let Some(tx) = session.context_mut() {
            tx.recipients += 1;
        }
        Verdict::Continue
    }

    async fn header(
        &self,
        session: &mut Session<Transaction>,
        name: &BStr,
        value: &BStr,
    ) -> Verdict {
        if let Some(tx) = session.context_mut() {
            tx.headers += 1;
        }
        if name.eq_ignore_ascii_case(b"X-Spam-Flag") && value.trim().eq_ignore_ascii_case(b"YES") {
            match SmtpReply::new("550", Some("5.7.1"), Some("Message flagged as spam")) {
                Ok(reply) => session.set_reply(reply),
                Err(e) => warn!("Bad reply: {}", e),
            }
            return Verdict::Reject;
        }
        Verdict::Continue
    }

    async fn body(&self, session: &mut Session<Transaction>, chunk: &[u8]) -> Verdict {
        if let Some(tx) = session.context_mut() {
            tx.body_bytes += chunk.len();
        }
        Verdict::Continue
    }

    async fn end_of_message(&self, session: &mut Session<Transaction>) -> Verdict {
        let queue_id = session
            .symbol("i")
            .map_or_else(|| "unknown".to_string(), |id| id.to_string());
        let summary = match session.context() {
            Some(tx) => format!(
                "milterd {}; client={}; rcpts={}; headers={}; bytes={}",
                milter_engine::VERSION,
                tx.client,
                tx.recipients,
                tx.headers,
                tx.body_bytes
            ),
            None => format!("milterd {}", milter_engine::VERSION),
        };

        if let Err(e) = session.add_header("X-Milterd", &summary) {
            warn!("Session {}: could not tag {}: {}", session.id(), queue_id, e);
        } else {
            info!("Session {}: tagged {}", session.id(), queue_id);
        }
        Verdict::Continue
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", generate_example_config());
        return Ok(());
    }

    // Load config
    let config_found = args.config.exists();
    let mut config = if config_found {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };
    if let Some(connection) = args.connection {
        config.connection = connection;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }

    if let Some(path) = &args.save_config {
        config.validate()?;
        config.save_to_file(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    // Initialize logging; RUST_LOG wins over --debug
    let level = match args.debug.max(config.debug) {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !config_found {
        info!("No config file found, using defaults");
    }
    info!("Milter Engine {}", milter_engine::VERSION);

    let registry = Registry::new("milterd", Tagger)
        .with_actions(ActionSet::ADD_HEADER);
    let server = Server::new(config, registry)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
        }
        signal.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}
