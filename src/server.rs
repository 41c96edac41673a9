//! Subscriber daemon: connection supervisor, listener loops, and the
//! per-connection command worker.
//!
//! One supervisor serves the whole daemon. It enforces the connection limit,
//! keeps the registry of live connections, and runs a reaper thread that
//! joins finished workers as they signal completion.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::error::SyncError;
use crate::keyed;
use crate::model::Repository;
use crate::session::{HANDSHAKE_AUTOMATED, HANDSHAKE_INTERACTIVE};
use crate::storage::{LocalSpace, SpaceQuery, TargetData};

/// Everything a worker needs to service a session.
pub struct ServiceContext {
    pub subscriber: Repository,
    /// Key the connecting publisher must present during the handshake.
    pub publisher_key: String,
    pub targets: Option<TargetData>,
    /// Ask connecting publishers to pull our collection before their run.
    pub request_collection: bool,
    /// Ask connecting publishers to pull our target definitions.
    pub request_targets: bool,
}

struct ConnectionEntry {
    service: &'static str,
    peer: SocketAddr,
    local_port: u16,
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<u64, ConnectionEntry>,
}

/// Daemon-wide connection supervisor. Shared via `Arc` between the listener
/// loops, the workers, and the reaper.
pub struct Supervisor {
    registry: Mutex<Registry>,
    reap: Condvar,
    max_connections: usize,
    next_id: AtomicU64,
    total: AtomicU64,
    stop: AtomicBool,
}

impl Supervisor {
    pub fn new(max_connections: usize) -> Arc<Supervisor> {
        info!("starting connection supervisor, {} max", max_connections);
        Arc::new(Supervisor {
            registry: Mutex::new(Registry::default()),
            reap: Condvar::new(),
            max_connections,
            next_id: AtomicU64::new(1),
            total: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        })
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Politely stop the daemon: listeners exit after their next accept and
    /// the reaper finishes joining what remains.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.reap.notify_all();
    }

    /// Admit or deny one accepted socket. Denied sockets get a plain-text
    /// line (the peer is not authenticated yet, so no keyed codec) and are
    /// dropped without ever being registered.
    pub fn add(
        this: &Arc<Supervisor>,
        mut socket: TcpStream,
        ctx: Arc<ServiceContext>,
        interactive: bool,
    ) {
        let peer = match socket.peer_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!("dropping connection without a peer address: {}", e);
                return;
            }
        };
        let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        let service: &'static str = if interactive { "terminal" } else { "automated" };

        let mut registry = this.registry.lock();
        if registry.connections.len() >= this.max_connections {
            info!("maximum connections ({}) exceeded", this.max_connections);
            info!("connection refused from {}", peer);
            let _ = socket.write_all(b"Connection request denied; maximum users exceeded\r\n");
            let _ = socket.flush();
            return;
        }

        let id = this.next_id.fetch_add(1, Ordering::SeqCst);
        let done = Arc::new(AtomicBool::new(false));
        info!("session opened {} port {}", peer, local_port);

        let supervisor = Arc::clone(this);
        let worker_done = Arc::clone(&done);
        let handle = thread::spawn(move || {
            if let Err(e) = worker(&mut socket, &ctx, &supervisor, interactive) {
                warn!("session {} ended: {}", peer, e);
            }
            worker_done.store(true, Ordering::SeqCst);
            supervisor.end();
        });

        registry.connections.insert(
            id,
            ConnectionEntry {
                service,
                peer,
                local_port,
                done,
                handle: Some(handle),
            },
        );
        this.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by a worker on exit to wake the reaper.
    fn end(&self) {
        self.reap.notify_all();
    }

    /// Join and remove finished connections until a stop is requested. Wakes
    /// coalesce: every pass rescans the whole registry. A stop still drains
    /// whatever has already finished before the loop exits.
    pub fn reap_loop(&self) {
        let mut registry = self.registry.lock();
        loop {
            let finished: Vec<u64> = registry
                .connections
                .iter()
                .filter(|(_, c)| c.done.load(Ordering::SeqCst))
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                if let Some(mut entry) = registry.connections.remove(&id) {
                    if let Some(handle) = entry.handle.take() {
                        let _ = handle.join();
                    }
                    info!(
                        "{} closed {} port {}",
                        entry.service, entry.peer, entry.local_port
                    );
                }
            }
            if self.stopping() {
                break;
            }
            self.reap.wait(&mut registry);
        }
        info!("stopped connection supervisor");
    }

    pub fn active_connections(&self) -> usize {
        self.registry.lock().connections.len()
    }

    /// Human-readable daemon statistics, served by the `status` command.
    pub fn dump_statistics(&self) -> String {
        let registry = self.registry.lock();
        let mut out = format!("Version {}\n", env!("CARGO_PKG_VERSION"));
        out.push_str(&format!(
            "Active connections: {}\n",
            registry.connections.len()
        ));
        for entry in registry.connections.values() {
            out.push_str(&format!(
                "  {} to {} port {}\n",
                entry.service, entry.peer, entry.local_port
            ));
        }
        out.push_str(&format!(
            "  Total connections since started: {}\n",
            self.total.load(Ordering::SeqCst)
        ));
        out.push_str(&format!(
            "  Maximum allowed connections: {}",
            self.max_connections
        ));
        out
    }

    /// Accept loop for one listener. Runs until `request_stop`.
    pub fn listen(
        self: Arc<Self>,
        listener: TcpListener,
        ctx: Arc<ServiceContext>,
        interactive: bool,
    ) {
        let service = if interactive { "terminal" } else { "automated" };
        match listener.local_addr() {
            Ok(a) => info!("{} service listening on {}", service, a),
            Err(_) => info!("{} service listening", service),
        }
        for stream in listener.incoming() {
            if self.stopping() {
                break;
            }
            match stream {
                Ok(socket) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        warn!("set_nodelay: {}", e);
                    }
                    Supervisor::add(&self, socket, Arc::clone(&ctx), interactive);
                }
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    error!("accept failed: {}", e);
                }
            }
        }
        info!("{} service stopped", service);
    }
}

/// Server half of the handshake followed by the command loop. Any error drops
/// the connection; command-level failures reply `error <message>` and keep
/// the session alive.
fn worker(
    stream: &mut TcpStream,
    ctx: &ServiceContext,
    supervisor: &Supervisor,
    interactive: bool,
) -> Result<(), SyncError> {
    let key = ctx.subscriber.key.clone();
    let key = key.as_bytes();

    keyed::write_line(stream, key, "HELO")?;
    let opening = keyed::read_line(stream, key)?;
    let expected = if interactive {
        HANDSHAKE_INTERACTIVE
    } else {
        HANDSHAKE_AUTOMATED
    };
    if opening != expected {
        return Err(SyncError::Protocol(format!(
            "unexpected opening '{}'",
            opening
        )));
    }

    keyed::write_line(stream, key, &ctx.subscriber.key)?;
    let presented = keyed::read_line(stream, key)?;
    if presented != ctx.publisher_key {
        return Err(SyncError::Protocol("publisher key does not match".into()));
    }
    keyed::write_line(stream, key, ctx.subscriber.flavor.token())?;

    // Post-handshake banner, possibly carrying out-of-band requests.
    if ctx.request_collection || ctx.request_targets {
        let mut banner = String::from("CMD");
        if ctx.request_collection {
            banner.push_str(":RequestCollection");
        }
        if ctx.request_targets {
            banner.push_str(":RequestTargets");
        }
        keyed::write_line(stream, key, &banner)?;
    } else {
        keyed::write_line(stream, key, "Enter 'help' for commands")?;
    }
    info!("session authenticated");

    let mut space = LocalSpace;
    loop {
        // Cooperative stop: finish the in-flight command, then bow out
        // between commands.
        if supervisor.stopping() {
            info!("stop requested, ending session");
            return Ok(());
        }
        let line = match keyed::read_line(stream, key) {
            Ok(l) => l,
            Err(SyncError::Io(e)) => {
                info!("peer disconnected: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v, r),
            None => (line.as_str(), ""),
        };

        let reply = match verb {
            "space" => match space.available_space(rest) {
                Ok(bytes) => bytes.to_string(),
                Err(e) => format!("error {}", e),
            },
            "collection" => match ctx.subscriber.to_json() {
                Ok(json) => json,
                Err(e) => format!("error {}", e),
            },
            "targets" => match &ctx.targets {
                Some(td) => match td.to_json() {
                    Ok(json) => json,
                    Err(e) => format!("error {}", e),
                },
                None => "error no targets defined".to_string(),
            },
            "stat" => stat_reply(rest),
            "mkdir" => match fs::create_dir_all(rest) {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error {}", e),
            },
            "put" => {
                handle_put(stream, key, rest)?;
                continue;
            }
            "commit" => match commit_file(rest) {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error {}", e),
            },
            "status" => supervisor.dump_statistics(),
            "help" => concat!(
                "commands: space <path>, collection, targets, stat <path>, ",
                "mkdir <path>, put <offset> <len> <path>, commit <path>, ",
                "status, help, quit"
            )
            .to_string(),
            "quit" => {
                keyed::write_line(stream, key, "bye")?;
                info!("peer signed off");
                return Ok(());
            }
            _ => format!("error unknown command '{}'", verb),
        };
        keyed::write_line(stream, key, &reply)?;
    }
}

/// `stat <path>` response: kind and size.
fn stat_reply(path: &str) -> String {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => "dir 0".to_string(),
        Ok(meta) => format!("file {}", meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => "missing 0".to_string(),
        Err(e) => format!("error {}", e),
    }
}

/// `commit <path>`: replace the final file with its completed `.part`.
/// Delete-then-rename; a crash between the two leaves only the `.part`,
/// which the next run resumes from byte zero of a fresh transfer.
fn commit_file(path: &str) -> Result<(), SyncError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::rename(format!("{}.part", path), path)?;
    Ok(())
}

/// `put <offset> <len> <path>`: acknowledge, then write the streamed frames
/// into the file at `offset`. The path rides at the end of the line so
/// embedded spaces survive.
fn parse_put(rest: &str) -> Option<(u64, u64, &str)> {
    let (offset, rest) = rest.split_once(' ')?;
    let (len, path) = rest.split_once(' ')?;
    if path.is_empty() {
        return None;
    }
    Some((offset.parse().ok()?, len.parse().ok()?, path))
}

fn handle_put(stream: &mut TcpStream, key: &[u8], rest: &str) -> Result<(), SyncError> {
    let (offset, len, path) = match parse_put(rest) {
        Some(parsed) => parsed,
        None => {
            keyed::write_line(stream, key, "error malformed put")?;
            return Ok(());
        }
    };

    let open = if offset > 0 {
        OpenOptions::new().append(true).open(path)
    } else {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().write(true).create(true).truncate(true).open(path)
    };
    let mut file = match open {
        Ok(f) => f,
        Err(e) => {
            keyed::write_line(stream, key, &format!("error {}", e))?;
            return Ok(());
        }
    };

    keyed::write_line(stream, key, "ok")?;

    let mut written: u64 = 0;
    while written < len {
        let frame = keyed::read_frame(stream, key)?;
        file.write_all(&frame)?;
        written += frame.len() as u64;
    }
    file.flush()?;
    keyed::write_line(stream, key, &format!("ok {}", written))?;
    Ok(())
}
