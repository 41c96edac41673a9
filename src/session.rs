//! Client side of the control protocol: connect, handshake, banner, command
//! round trips.

use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;

use chrono::Local;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::keyed;
use crate::model::{Flavor, Repository};
use crate::storage::SpaceQuery;

/// Default daemon port when a repository's host carries none.
pub const DEFAULT_PORT: u16 = 50271;

/// Automated sessions connect to base+2; the daemon binds both.
pub const AUTOMATED_PORT_OFFSET: u16 = 2;

/// Opening token for an interactive session.
pub const HANDSHAKE_INTERACTIVE: &str = "DribNit";
/// Opening token for an automated (program-to-program) session.
pub const HANDSHAKE_AUTOMATED: &str = "DribNlt";

/// Split `host[:port]` into an address pair. An empty host means loopback;
/// a present but unparseable port is a configuration error. IPv6 literals
/// use brackets when they carry a port (`[::1]:50271`).
pub fn parse_host_port(host: &str, default_port: u16) -> Result<(String, u16), SyncError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Ok(("127.0.0.1".to_string(), default_port));
    }
    if let Some(rest) = trimmed.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| SyncError::Config(format!("bad host address '{}'", trimmed)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| SyncError::Config(format!("bad port '{}' in '{}'", p, trimmed)))?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(SyncError::Config(format!(
                    "bad host address '{}'",
                    trimmed
                )))
            }
        };
        return Ok((addr.to_string(), port));
    }
    // More than one colon without brackets is a bare IPv6 literal.
    if trimmed.matches(':').count() > 1 {
        return Ok((trimmed.to_string(), default_port));
    }
    match trimmed.split_once(':') {
        Some((h, p)) => {
            let host = if h.is_empty() { "127.0.0.1" } else { h };
            let port = p
                .parse::<u16>()
                .map_err(|_| SyncError::Config(format!("bad port '{}' in '{}'", p, trimmed)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), default_port)),
    }
}

/// An authenticated connection to a subscriber daemon. The whole session is
/// keyed with the subscriber's shared key, both directions.
#[derive(Debug)]
pub struct Session {
    stream: Option<TcpStream>,
    my_key: String,
    their_key: String,
    remote_flavor: Flavor,
    /// Daemon asked us to pull its collection before the run.
    pub request_collection: bool,
    /// Daemon asked us to pull its target definitions before the run.
    pub request_targets: bool,
}

impl Session {
    /// Connect and run the client half of the handshake. `automated` selects
    /// the program-to-program port and token.
    pub fn connect(
        publisher: &Repository,
        subscriber: &Repository,
        automated: bool,
    ) -> Result<Session, SyncError> {
        let (host, mut port) = parse_host_port(&subscriber.host, DEFAULT_PORT)?;
        if automated {
            port += AUTOMATED_PORT_OFFSET;
        }
        info!("opening session to {}:{}", host, port);
        let stream = TcpStream::connect((host.as_str(), port))?;
        stream.set_nodelay(true)?;

        let mut session = Session {
            stream: Some(stream),
            my_key: publisher.key.clone(),
            their_key: subscriber.key.clone(),
            remote_flavor: subscriber.flavor,
            request_collection: false,
            request_targets: false,
        };
        session.handshake(automated)?;
        Ok(session)
    }

    fn handshake(&mut self, automated: bool) -> Result<(), SyncError> {
        let hello = self.read()?;
        if hello != "HELO" {
            return Err(SyncError::Protocol(format!(
                "unexpected greeting '{}'",
                hello
            )));
        }
        self.write(if automated {
            HANDSHAKE_AUTOMATED
        } else {
            HANDSHAKE_INTERACTIVE
        })?;

        let offered = self.read()?;
        if offered != self.their_key {
            return Err(SyncError::Protocol(
                "remote subscriber key does not match".into(),
            ));
        }
        let key = self.my_key.clone();
        self.write(&key)?;

        let token = self.read()?;
        self.remote_flavor = Flavor::from_token(&token)
            .ok_or_else(|| SyncError::Protocol(format!("invalid flavor token '{}'", token)))?;
        info!("session authenticated, remote flavor {}", token);
        Ok(())
    }

    /// Read the post-handshake banner. The `CMD` form carries out-of-band
    /// requests the daemon wants serviced before any command traffic.
    pub fn check_banner(&mut self) -> Result<(), SyncError> {
        let banner = self.read()?;
        if banner.starts_with("CMD") {
            self.request_collection = banner.contains(":RequestCollection");
            self.request_targets = banner.contains(":RequestTargets");
            info!(
                "daemon requests: collection={} targets={}",
                self.request_collection, self.request_targets
            );
        }
        Ok(())
    }

    /// Separator flavor the remote end reported during the handshake.
    pub fn remote_flavor(&self) -> Flavor {
        self.remote_flavor
    }

    fn write(&mut self, text: &str) -> Result<(), SyncError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("session not connected".into()))?;
        keyed::write_line(stream, self.their_key.as_bytes(), text)
    }

    fn read(&mut self) -> Result<String, SyncError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("session not connected".into()))?;
        keyed::read_line(stream, self.their_key.as_bytes())
    }

    /// Send one command line and return the single response line. An `error`
    /// response becomes a protocol error.
    pub fn round_trip(&mut self, command: &str) -> Result<String, SyncError> {
        self.write(command)?;
        let reply = self.read()?;
        if let Some(message) = reply.strip_prefix("error ") {
            return Err(SyncError::Protocol(format!(
                "remote rejected '{}': {}",
                command, message
            )));
        }
        Ok(reply)
    }

    /// Read a server-initiated line, such as a `put` completion. An `error`
    /// line becomes a protocol error.
    pub fn read_reply(&mut self) -> Result<String, SyncError> {
        let reply = self.read()?;
        if let Some(message) = reply.strip_prefix("error ") {
            return Err(SyncError::Protocol(message.to_string()));
        }
        Ok(reply)
    }

    /// Stream one binary data frame (used by `put` uploads).
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), SyncError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SyncError::Protocol("session not connected".into()))?;
        keyed::write_frame(stream, self.their_key.as_bytes(), payload)
    }

    /// Run a data-producing command (`collection`, `targets`) and write its
    /// JSON payload to `<base>_<command>-received-<stamp>.json`.
    pub fn retrieve_remote_data(
        &mut self,
        command: &str,
        base: &str,
    ) -> Result<PathBuf, SyncError> {
        let payload = self.round_trip(command)?;
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let path = PathBuf::from(format!("{}_{}-received-{}.json", base, command, stamp));
        let mut file = fs::File::create(&path)?;
        file.write_all(payload.as_bytes())?;
        info!("received {} data written to {}", command, path.display());
        Ok(path)
    }

    /// Polite shutdown; failures only warn since the run is already over.
    pub fn disconnect(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.write("quit") {
            warn!("quit not sent: {}", e);
        } else {
            match self.read() {
                Ok(reply) if reply == "bye" => {}
                Ok(reply) => warn!("unexpected reply to quit: {}", reply),
                Err(e) => warn!("no reply to quit: {}", e),
            }
        }
        self.stream = None;
    }
}

impl SpaceQuery for Session {
    fn available_space(&mut self, path: &str) -> Result<u64, SyncError> {
        let reply = self.round_trip(&format!("space {}", path))?;
        reply
            .trim()
            .parse::<u64>()
            .map_err(|_| SyncError::Protocol(format!("bad space reply '{}'", reply)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
