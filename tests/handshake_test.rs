//! Integration tests for the HELLO/OK/BYE handshake and message flow.
//!
//! Every test runs on a detached tracker: replication is simulated by
//! calling `rescan` until the shared folder has settled.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use foldersock::file_watcher::{FileEvent, FileEventKind};
use foldersock::frame::append_frame;
use foldersock::{Config, Endpoint, Frame, LegState, SettleConfig, SocketError, Tracker};
use tempfile::TempDir;

type Inbox = Arc<Mutex<Vec<(String, String)>>>;

fn setup() -> (TempDir, Tracker) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.settle = SettleConfig::immediate();
    let tracker = Tracker::detached(config).unwrap();
    (dir, tracker)
}

/// Rescan enough times for a handshake round trip to complete.
fn sync(tracker: &Tracker) {
    for _ in 0..4 {
        tracker.rescan();
    }
}

fn inbox(endpoint: &Endpoint) -> Inbox {
    let inbox: Inbox = Arc::default();
    let sink = Arc::clone(&inbox);
    endpoint.on_receive(move |from, text| {
        sink.lock().unwrap().push((from.to_string(), text.to_string()));
    });
    inbox
}

fn received(inbox: &Inbox) -> Vec<(String, String)> {
    inbox.lock().unwrap().clone()
}

fn pair(from: &str, text: &str) -> (String, String) {
    (from.to_string(), text.to_string())
}

/// Build `id` with a recorder for connected peers.
fn initiator(tracker: &Tracker, id: &str) -> (Endpoint, Arc<Mutex<Vec<String>>>) {
    let connected: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&connected);
    let endpoint = Endpoint::builder()
        .id(id)
        .on_connected(move |_endpoint, peer| sink.lock().unwrap().push(peer.to_string()))
        .build(tracker)
        .unwrap();
    (endpoint, connected)
}

#[test]
fn test_handshake_and_first_message() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let h2 = Endpoint::builder().id("h2").build(&tracker).unwrap();
    let h2_inbox = inbox(&h2);
    let (h1, connected) = initiator(&tracker, "h1");

    h1.connect("h2").unwrap();
    assert!(layout.signal_file("h2", "h1").is_file());
    assert_eq!(h1.leg_state("h2"), Some(LegState::GreetingSent));

    sync(&tracker);
    assert!(layout.signal_file("h1", "h2").is_file());
    assert_eq!(h2.leg_state("h1"), Some(LegState::Greeted));
    assert_eq!(h1.leg_state("h2"), Some(LegState::Connected));
    assert_eq!(*connected.lock().unwrap(), vec!["h2".to_string()]);
    assert!(tracker.is_watching(&layout.data_file("h1")));
    assert!(tracker.is_watching(&layout.data_file("h2")));

    h1.send("ping").unwrap();
    sync(&tracker);
    assert_eq!(received(&h2_inbox), vec![pair("h1", "ping")]);
    assert_eq!(h2.leg_state("h1"), Some(LegState::Connected));
}

#[test]
fn test_replies_flow_back() {
    let (_dir, tracker) = setup();
    let server = Endpoint::builder().id("srv").build(&tracker).unwrap();
    let replier = server.downgrade();
    server.on_receive(move |_from, text| {
        if let Some(server) = replier.upgrade() {
            server.send(&format!("{text} from a server<srv>")).unwrap();
        }
    });

    let client = Endpoint::open(&tracker, "srv", |_endpoint, _peer| {}).unwrap();
    let replies = inbox(&client);
    sync(&tracker);

    client.send("hi").unwrap();
    client.send("there").unwrap();
    sync(&tracker);

    assert_eq!(
        received(&replies),
        vec![
            pair("srv", "hi from a server<srv>"),
            pair("srv", "there from a server<srv>"),
        ]
    );
}

#[test]
fn test_payloads_survive_encoding() {
    let (_dir, tracker) = setup();
    let b = Endpoint::builder().id("b").build(&tracker).unwrap();
    let b_inbox = inbox(&b);
    let a = Endpoint::builder().id("a").build(&tracker).unwrap();
    a.connect("b").unwrap();
    sync(&tracker);

    let texts = ["multi\nline", "100% {\"json\": true}", "héllo wörld ✓", ""];
    for text in texts {
        a.send(text).unwrap();
    }
    sync(&tracker);

    let expected: Vec<_> = texts.iter().map(|t| pair("a", t)).collect();
    assert_eq!(received(&b_inbox), expected);
}

#[test]
fn test_messages_buffered_until_receiver_registers() {
    let (_dir, tracker) = setup();
    let h2 = Endpoint::builder().id("h2").build(&tracker).unwrap();
    let h1 = Endpoint::builder().id("h1").build(&tracker).unwrap();
    h1.connect("h2").unwrap();
    sync(&tracker);

    h1.send("one").unwrap();
    h1.send("two").unwrap();
    sync(&tracker);

    let late = inbox(&h2);
    assert_eq!(received(&late), vec![pair("h1", "one"), pair("h1", "two")]);
}

#[test]
fn test_multiple_peers_are_isolated() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let a = Endpoint::builder().id("a").build(&tracker).unwrap();
    let a_inbox = inbox(&a);
    let b = Endpoint::builder().id("b").build(&tracker).unwrap();
    let c = Endpoint::builder().id("c").build(&tracker).unwrap();

    b.connect("a").unwrap();
    c.connect("a").unwrap();
    sync(&tracker);
    assert_eq!(a.peers(), vec!["b".to_string(), "c".to_string()]);

    b.send("from b").unwrap();
    c.send("from c").unwrap();
    sync(&tracker);
    let mut got = received(&a_inbox);
    got.sort();
    assert_eq!(got, vec![pair("b", "from b"), pair("c", "from c")]);

    append_frame(&layout.signal_file("a", "b"), "BYE b").unwrap();
    sync(&tracker);
    assert_eq!(a.leg_state("b"), Some(LegState::Closed));
    assert_eq!(a.leg_state("c"), Some(LegState::Connected));
    assert!(!tracker.is_watching(&layout.data_file("b")));
    assert!(tracker.is_watching(&layout.data_file("c")));

    b.send("ignored").unwrap();
    c.send("still here").unwrap();
    sync(&tracker);
    let got = received(&a_inbox);
    assert_eq!(got.last(), Some(&pair("c", "still here")));
    assert!(!got.contains(&pair("b", "ignored")));
}

#[test]
fn test_one_endpoint_greets_several_peers() {
    let (_dir, tracker) = setup();
    let s1 = Endpoint::builder().id("s1").build(&tracker).unwrap();
    let s2 = Endpoint::builder().id("s2").build(&tracker).unwrap();
    let (client, connected) = initiator(&tracker, "client");

    client.connect(["s1", "s2"]).unwrap();
    sync(&tracker);

    let mut peers = connected.lock().unwrap().clone();
    peers.sort();
    assert_eq!(peers, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(s1.leg_state("client"), Some(LegState::Greeted));
    assert_eq!(s2.leg_state("client"), Some(LegState::Greeted));
}

#[test]
fn test_unsolicited_ok_is_ignored() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let (a, connected) = initiator(&tracker, "a");
    let _x = Endpoint::builder().id("x").build(&tracker).unwrap();

    append_frame(&layout.signal_file("a", "x"), "OK x").unwrap();
    sync(&tracker);

    assert_eq!(a.leg_state("x"), None);
    assert!(connected.lock().unwrap().is_empty());
}

#[test]
fn test_early_ok_does_not_disturb_other_pairs() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let b = Endpoint::builder().id("b").build(&tracker).unwrap();
    let b_inbox = inbox(&b);
    let (a, a_connected) = initiator(&tracker, "a");
    a.connect("b").unwrap();
    sync(&tracker);
    assert_eq!(a.leg_state("b"), Some(LegState::Connected));

    let _d = Endpoint::builder().id("d").build(&tracker).unwrap();
    let (c, c_connected) = initiator(&tracker, "c");

    // The answer replicates before the greeting it answers.
    let early = layout.signal_file("c", "d");
    append_frame(&early, "OK d").unwrap();
    tracker.handle_event(&FileEvent {
        path: early.clone(),
        kind: FileEventKind::Create,
    });
    tracker.handle_change(&early);
    tracker.rescan();

    assert_eq!(c.leg_state("d"), None);
    assert!(c_connected.lock().unwrap().is_empty());
    assert_eq!(a.leg_state("b"), Some(LegState::Connected));
    assert_eq!(*a_connected.lock().unwrap(), vec!["b".to_string()]);

    c.connect("d").unwrap();
    sync(&tracker);
    assert_eq!(c.leg_state("d"), Some(LegState::Connected));
    assert_eq!(*c_connected.lock().unwrap(), vec!["d".to_string()]);

    a.send("still here").unwrap();
    sync(&tracker);
    assert_eq!(received(&b_inbox), vec![pair("a", "still here")]);
    assert_eq!(*a_connected.lock().unwrap(), vec!["b".to_string()]);
}

#[test]
fn test_panicking_receiver_does_not_stall_the_tracker() {
    let (_dir, tracker) = setup();
    let b = Endpoint::builder().id("b").build(&tracker).unwrap();
    let b_inbox: Inbox = Arc::default();
    let sink = Arc::clone(&b_inbox);
    b.on_receive(move |from, text| {
        assert_ne!(text, "boom", "receiver failed");
        sink.lock().unwrap().push((from.to_string(), text.to_string()));
    });
    let (a, _) = initiator(&tracker, "a");
    a.connect("b").unwrap();
    sync(&tracker);

    a.send("boom").unwrap();
    sync(&tracker);
    a.send("after").unwrap();
    sync(&tracker);
    assert_eq!(received(&b_inbox), vec![pair("a", "after")]);

    let d = Endpoint::builder().id("d").build(&tracker).unwrap();
    let d_inbox = inbox(&d);
    let (c, _) = initiator(&tracker, "c");
    c.connect("d").unwrap();
    sync(&tracker);
    c.send("fresh").unwrap();
    sync(&tracker);
    assert_eq!(received(&d_inbox), vec![pair("c", "fresh")]);
}

#[test]
fn test_tokens_must_match_their_signal_file() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let a = Endpoint::builder().id("a").build(&tracker).unwrap();
    let _z = Endpoint::builder().id("z").build(&tracker).unwrap();

    append_frame(&layout.signal_file("a", "y"), "HELLO z").unwrap();
    append_frame(&layout.signal_file("a", "q"), "not a token").unwrap();
    sync(&tracker);

    assert_eq!(a.leg_state("z"), None);
    assert_eq!(a.leg_state("y"), None);
    assert!(!layout.signal_file("z", "a").exists());
}

#[test]
fn test_garbage_lines_do_not_break_the_channel() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let b = Endpoint::builder().id("b").build(&tracker).unwrap();
    let b_inbox = inbox(&b);
    let a = Endpoint::builder().id("a").build(&tracker).unwrap();
    a.connect("b").unwrap();
    sync(&tracker);

    foldersock::layout::append(&layout.data_file("a"), b"{{{ garbage\n").unwrap();
    a.send("after").unwrap();
    sync(&tracker);

    assert_eq!(received(&b_inbox), vec![pair("a", "after")]);
}

#[test]
fn test_crossed_greetings_connect_both_sides() {
    let (_dir, tracker) = setup();
    let (a, a_connected) = initiator(&tracker, "a");
    let (b, b_connected) = initiator(&tracker, "b");

    a.connect("b").unwrap();
    b.connect("a").unwrap();
    sync(&tracker);

    assert_eq!(a.leg_state("b"), Some(LegState::Connected));
    assert_eq!(b.leg_state("a"), Some(LegState::Connected));
    assert_eq!(*a_connected.lock().unwrap(), vec!["b".to_string()]);
    assert_eq!(*b_connected.lock().unwrap(), vec!["a".to_string()]);
}

#[test]
fn test_close_notifies_peer_and_cleans_up() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let server = Endpoint::builder().id("srv").build(&tracker).unwrap();
    let client = Endpoint::builder().id("cli").build(&tracker).unwrap();
    client.connect("srv").unwrap();
    sync(&tracker);
    assert_eq!(server.leg_state("cli"), Some(LegState::Greeted));

    client.close();
    assert!(!layout.endpoint_dir("cli").exists());
    assert!(!layout.signal_file("srv", "cli").exists());

    sync(&tracker);
    assert_eq!(server.leg_state("cli"), Some(LegState::Closed));
    assert!(server.peers().is_empty());
    assert!(!tracker.is_watching(&layout.data_file("cli")));

    client.close();
    assert_eq!(client.send("late"), Err(SocketError::Closed));
    assert!(!server.is_closed());
}

#[test]
fn test_vanished_peer_counts_as_bye() {
    let (_dir, tracker) = setup();
    let layout = tracker.layout().clone();
    let a = Endpoint::builder().id("a").build(&tracker).unwrap();
    let b = Endpoint::builder().id("b").build(&tracker).unwrap();
    b.connect("a").unwrap();
    sync(&tracker);
    assert_eq!(a.leg_state("b"), Some(LegState::Greeted));

    fs::remove_dir_all(layout.endpoint_dir("b")).unwrap();
    sync(&tracker);

    assert_eq!(a.leg_state("b"), Some(LegState::Closed));
    assert!(!a.is_closed());
}

#[test]
fn test_reconnect_after_close() {
    let (_dir, tracker) = setup();
    let server = Endpoint::builder().id("srv").build(&tracker).unwrap();
    let server_inbox = inbox(&server);

    let first = Endpoint::builder().id("c").build(&tracker).unwrap();
    first.connect("srv").unwrap();
    sync(&tracker);
    first.close();
    sync(&tracker);
    assert_eq!(server.leg_state("c"), Some(LegState::Closed));

    let second = Endpoint::builder().id("c").build(&tracker).unwrap();
    second.connect("srv").unwrap();
    sync(&tracker);
    assert_eq!(server.leg_state("c"), Some(LegState::Greeted));

    second.send("again").unwrap();
    sync(&tracker);
    assert_eq!(received(&server_inbox), vec![pair("c", "again")]);
}

#[test]
fn test_duplicate_identity_across_trackers() {
    let (dir, tracker) = setup();
    let _first = Endpoint::builder().id("h1").build(&tracker).unwrap();

    let other = Tracker::detached(Config::with_root(dir.path())).unwrap();
    let second = Endpoint::builder().id("h1").build(&other);
    assert_eq!(second.unwrap_err(), SocketError::DuplicateIdentity("h1".into()));
}

#[test]
fn test_live_tracker_delivers_without_rescan_calls() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.rescan_interval_ms = 20;
    let tracker = Tracker::start(config).unwrap();

    let server = Endpoint::builder().id("srv").build(&tracker).unwrap();
    let server_inbox = inbox(&server);
    let (client, connected) = initiator(&tracker, "cli");
    client.connect("srv").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while connected.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(client.leg_state("srv"), Some(LegState::Connected));

    client.send("live").unwrap();
    while received(&server_inbox).is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received(&server_inbox), vec![pair("cli", "live")]);

    client.close();
    server.close();
}

#[test]
fn test_outbox_replaced_by_sync_client_keeps_leg() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_root(dir.path());
    config.rescan_interval_ms = 0;
    let tracker = Tracker::start(config).unwrap();
    let layout = tracker.layout().clone();

    let server = Endpoint::builder().id("srv").build(&tracker).unwrap();
    let server_inbox = inbox(&server);
    let (client, connected) = initiator(&tracker, "cli");
    client.connect("srv").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while connected.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    client.send("one").unwrap();
    while received(&server_inbox).is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received(&server_inbox), vec![pair("cli", "one")]);

    // Sync clients download into a temporary and rename it into place.
    let outbox = layout.data_file("cli");
    let mut content = fs::read(&outbox).unwrap();
    content.extend(Frame::new("two").encode());
    let temporary = layout.endpoint_dir("cli").join(".data.tmp");
    fs::write(&temporary, content).unwrap();
    fs::rename(&temporary, &outbox).unwrap();

    while received(&server_inbox).len() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received(&server_inbox), vec![pair("cli", "one"), pair("cli", "two")]);
    assert_eq!(server.leg_state("cli"), Some(LegState::Connected));

    client.close();
    server.close();
}
