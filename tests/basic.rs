use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use portknock::challenge::parse_tuples_text;
use portknock::combinations::Combinations;
use portknock::config::Config;
use portknock::error::ProtocolError;
use portknock::http;
use portknock::key::{self, Tuple};
use portknock::knock::{FlushReason, KnockAccumulator, KnockBatch};
use portknock::listener::{BatchSink, HttpReporter, KnockService};
use portknock::marker;
use portknock::query::format_ports;
use portknock::server::Server;
use portknock::session::SessionStore;

fn test_config(marker_dir: &std::path::Path) -> Config {
    Config {
        port_range: 8,
        tuple_size: Some(4),
        tolerance: 0,
        skip_probability: 0,
        marker_dir: marker_dir.to_path_buf(),
        ..Config::default()
    }
}

fn spawn_server(config: &Config) -> (Arc<Server>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(Server::new(config).unwrap());
    let running = server.clone();
    let config = config.clone();
    thread::spawn(move || running.run(listener, &config));
    (server, addr)
}

#[test]
fn generator_enumerates_then_wraps() {
    let generator = Combinations::new(vec![0, 1, 2, 3], 2);
    let expected = vec![
        vec![0, 1],
        vec![0, 2],
        vec![0, 3],
        vec![1, 2],
        vec![1, 3],
        vec![2, 3],
    ];

    let first: Vec<_> = std::iter::from_fn(|| generator.next()).collect();
    assert_eq!(first, expected);
    assert!(generator.next().is_none());

    let again: Vec<_> = (0..6).filter_map(|_| generator.next_wrap()).collect();
    assert_eq!(again, expected);
}

#[test]
fn generator_keeps_duplicate_values() {
    let generator = Combinations::new(vec![0, 1, 1], 2);
    let all: Vec<_> = std::iter::from_fn(|| generator.next()).collect();
    assert_eq!(all, vec![vec![0, 1], vec![0, 1], vec![1, 1]]);
}

#[test]
fn key_codec_vectors() {
    assert_eq!(key::encode(1, &[2, 3, 4, 5, 6, 7, 8, 9]), 0x0102030405060708);
    assert_eq!(key::decode(1, 0x0102030405060708), vec![2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(key::encode(1, &[1, 1, 1, 1, 1, 1, 1, 1]), 0);
}

#[test]
fn session_store_round_trip() {
    let store = SessionStore::new(21380, Duration::from_secs(10));
    let tuples: Vec<Tuple> = vec![vec![21380, 21381, 21382, 21383]];
    let id = store.create_session(tuples.clone());

    let found = store.find_sessions(&tuples);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, id);

    let removal = store.remove_session(id).unwrap();
    assert_eq!(removal.tuples, removal.removed);
    assert!(store.find_sessions(&tuples).is_empty());
}

#[test]
fn session_store_reports_ambiguity() {
    let store = SessionStore::new(21380, Duration::from_secs(10));
    store.create_session(vec![vec![21380, 21381]]);
    store.create_session(vec![vec![21382, 21383]]);

    let mixed = vec![vec![21380, 21381], vec![21382, 21383]];
    assert_eq!(store.find_sessions(&mixed).len(), 2);
    assert_eq!(
        store.match_session(&mixed),
        Err(ProtocolError::AmbiguousSession { count: 2 })
    );
}

#[test]
fn accumulator_completes_on_multiple_of_tuple_size() {
    let acc = KnockAccumulator::new(3, 0, Duration::from_secs(60));
    for round in 0..2u16 {
        assert!(acc.knock(1, 100 + round).is_none());
        assert!(acc.knock(1, 101 + round).is_none());
        let batch = acc.knock(1, 102 + round).unwrap();
        assert_eq!(batch.reason, FlushReason::Complete);
        assert_eq!(batch.ports.len(), 3);
    }
}

#[test]
fn http_challenge_and_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (server, addr) = spawn_server(&config);

    let tuples = parse_tuples_text(&http::get(&addr, "/").unwrap());
    assert_eq!(tuples, vec![vec![21380, 21381, 21382, 21383]]);

    let path = marker::create(dir.path(), 31337, &tuples[0]).unwrap();
    let target = format!("/session?ports={}&pid=31337", format_ports(&tuples[0]));
    let reply = http::get(&addr, &target).unwrap();
    assert!(reply.contains("Removed tuples for session 1, pid 31337"), "{reply}");
    assert!(!path.exists());
    assert!(server.store().is_empty());

    let reply = http::get(&addr, &target).unwrap();
    assert_eq!(reply, "no session found\n");
}

#[test]
fn knock_service_reports_to_server() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (server, addr) = spawn_server(&config);

    let tuples = parse_tuples_text(&http::get(&addr, "/").unwrap());
    let path = marker::create(dir.path(), 4242, &tuples[0]).unwrap();

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let reporter = HttpReporter::new(addr.clone());
        let reported = reported.clone();
        move |batch: KnockBatch| {
            reported.lock().push(batch.clone());
            reporter.submit(batch);
        }
    };
    let resolver = |_: SocketAddr, _: SocketAddr| Some(4242u32);
    let service = KnockService::new(
        KnockAccumulator::new(config.tuple_size(), config.tolerance, config.knock_ttl()),
        resolver,
        sink,
    );

    let remote: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    for &port in &tuples[0] {
        service.observe(SocketAddr::from(([127, 0, 0, 1], port)), remote);
    }

    assert_eq!(reported.lock().len(), 1);
    assert!(marker::wait_removed(
        &path,
        Duration::from_secs(2),
        Duration::from_millis(10)
    ));
    assert!(server.store().is_empty());
    assert_eq!(*server.metrics.confirmations_ok.lock(), 1);
}

#[test]
fn timed_out_partial_batch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        knock_ttl_ms: 0,
        ..test_config(dir.path())
    };
    let (server, addr) = spawn_server(&config);
    let tuples = parse_tuples_text(&http::get(&addr, "/").unwrap());

    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let addr = addr.clone();
        let replies = replies.clone();
        move |batch: KnockBatch| {
            let reply = http::get(&addr, &HttpReporter::target(&batch)).unwrap();
            replies.lock().push((batch.reason, reply));
        }
    };
    let service = KnockService::new(
        KnockAccumulator::new(config.tuple_size(), config.tolerance, config.knock_ttl()),
        |_: SocketAddr, _: SocketAddr| Some(7u32),
        sink,
    );

    // One knock on a port that starts no issued tuple.
    let remote: SocketAddr = "127.0.0.1:50001".parse().unwrap();
    service.observe(SocketAddr::from(([127, 0, 0, 1], tuples[0][3])), remote);

    let replies = replies.lock();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, FlushReason::Timeout);
    assert_eq!(replies[0].1, "no session found\n");
    assert_eq!(server.store().len(), 1);
}
