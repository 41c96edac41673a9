//! mungr - point-to-point media library replication
//!
//! Publish mode diffs a publisher repository against a subscriber and copies
//! what is missing, locally or to a remote daemon. Listen mode runs the
//! subscriber daemon.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mungr::engine::{munge, RunOptions};
use mungr::error::SyncError;
use mungr::model::Repository;
use mungr::server::{ServiceContext, Supervisor};
use mungr::session::{parse_host_port, Session, AUTOMATED_PORT_OFFSET, DEFAULT_PORT};
use mungr::storage::TargetData;
use mungr::transfer::{LocalEndpoint, RemoteEndpoint};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "mungr - replicate a publisher's media libraries to a subscriber"
)]
struct Args {
    /// Publisher repository JSON file
    #[arg(short = 'p', long)]
    publisher: PathBuf,

    /// Subscriber repository JSON file
    #[arg(short = 's', long)]
    subscriber: PathBuf,

    /// Storage targets JSON file; without it the run is forced to dry-run
    #[arg(short = 't', long)]
    targets: Option<PathBuf>,

    /// Write the mismatches report to this file
    #[arg(short = 'm', long)]
    mismatches: Option<PathBuf>,

    /// Write the What's New report to this file
    #[arg(short = 'n', long)]
    whats_new: Option<PathBuf>,

    /// Count and log what would be copied without copying
    #[arg(short = 'D', long)]
    dry_run: bool,

    /// The subscriber is a remote daemon (address from its repository file)
    #[arg(short = 'r', long)]
    remote: bool,

    /// Use the interactive session type instead of the automated one
    #[arg(long)]
    terminal: bool,

    /// Run the subscriber daemon
    #[arg(long)]
    listen: bool,

    /// Bind address for --listen
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Maximum concurrent connections for --listen
    #[arg(long, default_value_t = 10)]
    max_connections: usize,

    /// Daemon banner: ask connecting publishers to pull our collection
    #[arg(long)]
    request_collection: bool,

    /// Daemon banner: ask connecting publishers to pull our targets
    #[arg(long)]
    request_targets: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let code = match run(&args) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<SyncError>() {
                Some(SyncError::AllTargetsExhausted { .. }) => 2,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

fn run(args: &Args) -> Result<()> {
    if args.listen {
        return listen(args);
    }
    publish(args)
}

fn publish(args: &Args) -> Result<()> {
    let mut publisher = Repository::load(&args.publisher)?;
    publisher.validate(true)?;
    let mut subscriber = Repository::load(&args.subscriber)?;
    subscriber.validate(!args.remote)?;

    let mut targets = match &args.targets {
        Some(path) => {
            let td = TargetData::load(path)?;
            td.validate(!args.remote)?;
            Some(td)
        }
        None => None,
    };

    let mut options = RunOptions {
        dry_run: args.dry_run,
        mismatches: args.mismatches.clone(),
        whats_new: args.whats_new.clone(),
    };
    if targets.is_none() && !options.dry_run {
        info!("no targets file given, forcing dry run");
        options.dry_run = true;
    }

    if args.remote {
        let mut session = Session::connect(&publisher, &subscriber, !args.terminal)?;
        session.check_banner()?;
        let base = file_base(&args.subscriber);
        if session.request_collection {
            let received = session.retrieve_remote_data("collection", &base)?;
            subscriber = Repository::load(&received)?;
        }
        if session.request_targets {
            let received = session.retrieve_remote_data("targets", &base)?;
            let td = TargetData::load(&received)?;
            td.validate(false)?;
            targets = Some(td);
        }
        let mut endpoint = RemoteEndpoint::new(session);
        munge(
            &mut publisher,
            &mut subscriber,
            targets.as_ref(),
            &mut endpoint,
            &options,
        )?;
        endpoint.session.disconnect();
    } else {
        let mut endpoint = LocalEndpoint::new(subscriber.flavor);
        munge(
            &mut publisher,
            &mut subscriber,
            targets.as_ref(),
            &mut endpoint,
            &options,
        )?;
    }
    Ok(())
}

fn listen(args: &Args) -> Result<()> {
    let subscriber = Repository::load(&args.subscriber)?;
    subscriber.validate(true)?;
    let publisher = Repository::load(&args.publisher)?;
    publisher.validate(false)?;
    let targets = match &args.targets {
        Some(path) => {
            let td = TargetData::load(path)?;
            td.validate(true)?;
            Some(td)
        }
        None => None,
    };

    let (_, base_port) = parse_host_port(&subscriber.host, DEFAULT_PORT)?;
    let ctx = Arc::new(ServiceContext {
        subscriber,
        publisher_key: publisher.key.clone(),
        targets,
        request_collection: args.request_collection,
        request_targets: args.request_targets,
    });
    let supervisor = Supervisor::new(args.max_connections);

    let interactive = TcpListener::bind((args.bind.as_str(), base_port))
        .with_context(|| format!("binding {}:{}", args.bind, base_port))?;
    let automated_port = base_port + AUTOMATED_PORT_OFFSET;
    let automated = TcpListener::bind((args.bind.as_str(), automated_port))
        .with_context(|| format!("binding {}:{}", args.bind, automated_port))?;

    let stopper = Arc::clone(&supervisor);
    ctrlc::set_handler(move || {
        info!("interrupted, stopping daemon");
        stopper.request_stop();
        // Wake both accept loops so they observe the stop flag.
        for port in [base_port, automated_port] {
            let _ = TcpStream::connect(("127.0.0.1", port));
        }
    })
    .context("setting interrupt handler")?;

    let reaper = Arc::clone(&supervisor);
    let reaper = thread::spawn(move || reaper.reap_loop());

    let auto_supervisor = Arc::clone(&supervisor);
    let auto_ctx = Arc::clone(&ctx);
    let auto = thread::spawn(move || auto_supervisor.listen(automated, auto_ctx, false));

    supervisor.listen(interactive, ctx, true);
    let _ = auto.join();
    let _ = reaper.join();
    Ok(())
}

/// Stem of a JSON file path, used to name retrieved-data files.
fn file_base(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subscriber".to_string())
}
