//! End-to-end tests over real loopback sockets: daemon up, session
//! authenticated, commands and transfers exercised against a temp tree.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use mungr::error::SyncError;
use mungr::model::{Flavor, Item, Library, Repository};
use mungr::server::{ServiceContext, Supervisor};
use mungr::session::Session;
use mungr::storage::SpaceQuery;
use mungr::transfer::{Endpoint, RemoteEndpoint};

const SUB_KEY: &str = "subscriber-secret";
const PUB_KEY: &str = "publisher-secret";

fn subscriber_repo(host: &str) -> Repository {
    let mut r = Repository::new("sub", SUB_KEY, Flavor::Linux);
    r.host = host.to_string();
    r.libraries.push(Library {
        name: "Movies".into(),
        sources: vec![],
        items: vec![],
    });
    r
}

fn publisher_repo() -> Repository {
    Repository::new("pub", PUB_KEY, Flavor::Linux)
}

/// Start an interactive-service daemon on an ephemeral port.
fn start_daemon(request_flags: bool) -> (u16, Arc<Supervisor>) {
    start_daemon_max(request_flags, 10)
}

fn start_daemon_max(request_flags: bool, max: usize) -> (u16, Arc<Supervisor>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let ctx = Arc::new(ServiceContext {
        subscriber: subscriber_repo(""),
        publisher_key: PUB_KEY.to_string(),
        targets: None,
        request_collection: request_flags,
        request_targets: false,
    });
    let supervisor = Supervisor::new(max);
    let reaper = Arc::clone(&supervisor);
    thread::spawn(move || reaper.reap_loop());
    let acceptor = Arc::clone(&supervisor);
    thread::spawn(move || acceptor.listen(listener, ctx, true));
    (port, supervisor)
}

fn connect(port: u16) -> Session {
    let publisher = publisher_repo();
    let subscriber = subscriber_repo(&format!("127.0.0.1:{}", port));
    let mut session = Session::connect(&publisher, &subscriber, false).unwrap();
    session.check_banner().unwrap();
    session
}

#[test]
fn authenticated_session_serves_commands() {
    let (port, _supervisor) = start_daemon(false);
    let tmp = tempfile::tempdir().unwrap();
    let mut session = connect(port);

    // Free space parses as a number (zero is possible on exotic mounts).
    assert!(session
        .available_space(tmp.path().to_str().unwrap())
        .is_ok());

    let status = session.round_trip("status").unwrap();
    assert!(status.contains("Active connections: 1"));
    assert!(status.contains("Maximum allowed connections: 10"));

    let collection = session.round_trip("collection").unwrap();
    let received: Repository = serde_json::from_str(&collection).unwrap();
    assert_eq!(received.description, "sub");

    let err = session.round_trip("frobnicate").unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
    // The connection survives an unknown command.
    assert!(session.round_trip("help").unwrap().contains("commands:"));

    session.disconnect();
}

#[test]
fn banner_carries_out_of_band_requests() {
    let (port, _supervisor) = start_daemon(true);
    let mut session = connect(port);
    assert!(session.request_collection);
    assert!(!session.request_targets);
    session.disconnect();
}

#[test]
fn wrong_publisher_key_is_rejected() {
    let (port, _supervisor) = start_daemon(false);
    let mut publisher = publisher_repo();
    publisher.key = "not-the-key".into();
    let subscriber = subscriber_repo(&format!("127.0.0.1:{}", port));
    // The worker drops the connection after the key check, so the client
    // fails either reading the flavor line or soon after.
    let result = Session::connect(&publisher, &subscriber, false);
    match result {
        Err(_) => {}
        Ok(mut session) => {
            assert!(session.round_trip("status").is_err());
        }
    }
}

#[test]
fn transfer_resumes_a_partial_file() {
    let (port, _supervisor) = start_daemon(false);
    let tmp = tempfile::tempdir().unwrap();

    // 3 MiB source with a position-dependent pattern.
    let src = tmp.path().join("alien.mkv");
    let content: Vec<u8> = (0..3 * 1024 * 1024u32)
        .map(|i| (i % 251) as u8)
        .collect();
    std::fs::write(&src, &content).unwrap();

    // Pre-seed the destination .part with the first 700_000 bytes, as if an
    // earlier run was interrupted.
    let dest_dir = tmp.path().join("vol1/Movies/Alien");
    std::fs::create_dir_all(&dest_dir).unwrap();
    let dest = dest_dir.join("alien.mkv");
    std::fs::write(
        dest_dir.join("alien.mkv.part"),
        &content[..700_000],
    )
    .unwrap();

    let mut endpoint = RemoteEndpoint::new(connect(port));
    let item = Item {
        item_path: "Alien/alien.mkv".into(),
        full_path: src.to_string_lossy().into_owned(),
        library: "Movies".into(),
        directory: false,
        symlink: false,
        size: Some(content.len() as u64),
    };
    endpoint.copy(&item, dest.to_str().unwrap()).unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), content);
    assert!(!dest_dir.join("alien.mkv.part").exists());
    endpoint.session.disconnect();
}

#[test]
fn transfer_creates_directories_from_scratch() {
    let (port, _supervisor) = start_daemon(false);
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("blade.mkv");
    std::fs::write(&src, b"short film").unwrap();

    let dest = tmp.path().join("vol2/Movies/Blade/blade.mkv");
    let mut endpoint = RemoteEndpoint::new(connect(port));
    let item = Item {
        item_path: "Blade/blade.mkv".into(),
        full_path: src.to_string_lossy().into_owned(),
        library: "Movies".into(),
        directory: false,
        symlink: false,
        size: Some(10),
    };
    endpoint.copy(&item, dest.to_str().unwrap()).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"short film");
    endpoint.session.disconnect();
}

#[test]
fn admission_control_denies_over_the_limit() {
    let (port, supervisor) = start_daemon_max(false, 1);
    let session = connect(port);
    assert_eq!(supervisor.active_connections(), 1);

    // The second socket gets the plain-text denial and no handshake.
    let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
    raw.write_all(b"").unwrap();
    let mut line = String::new();
    BufReader::new(&mut raw)
        .read_line(&mut line)
        .unwrap();
    assert_eq!(
        line.trim_end(),
        "Connection request denied; maximum users exceeded"
    );
    assert_eq!(supervisor.active_connections(), 1);

    drop(session);
}
