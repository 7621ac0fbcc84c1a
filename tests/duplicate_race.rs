//! Two senders push the same file name at the same time; exactly one wins.
//!
//! The receiver daemon is real; the senders are driven by hand so both
//! transfers are provably in flight at once.

use bytes::{BufMut, Bytes, BytesMut};
use fileferry::config::{Mode, ReceiverConfig};
use fileferry::transfer::{establish, wire, Link, MsgType, NewFile, Role};
use fileferry::transport::Bus;
use fileferry::{receiver, Shutdown};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn hand_driven_sender(bus: &Bus, ident: &str, port: u16) -> Link {
    let group = bus.group();
    let channel = bus
        .connect(
            &group,
            "127.0.0.1",
            SocketAddr::from(([127, 0, 0, 1], port)),
            0,
        )
        .await
        .unwrap();
    establish(group, channel, Role::Sender, ident, None)
        .await
        .unwrap()
}

fn block_body(offset: u64, payload: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(8 + payload.len());
    body.put_slice(&wire::encode_block_offset(offset));
    body.put_slice(payload);
    body.freeze()
}

async fn expect(link: &Link, want: MsgType) {
    let (ty, _) = timeout(Duration::from_secs(10), link.recv())
        .await
        .expect("timed out")
        .expect("link closed");
    assert_eq!(ty, want);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_same_name_yields_one_winner() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("dest");
    let port = free_port();

    let shutdown = Shutdown::new();
    let rx_config = ReceiverConfig {
        ident: "landing".to_string(),
        destination_dir: dest.clone(),
        duplicate_destinations: vec![],
        unique_duplicates: false,
        freespace_minimum: None,
        space_maximum_percent: None,
        post_command: None,
        mode: Mode::Server,
        listen: vec![SocketAddr::from(([127, 0, 0, 1], port))],
        peers: vec![],
        keepalive: 0,
        reconnect_interval: 1,
        tls: None,
    };
    let rx = tokio::spawn(receiver::run(rx_config, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let bus = Bus::new(None);
    let first = hand_driven_sender(&bus, "tx-one", port).await;
    let second = hand_driven_sender(&bus, "tx-two", port).await;

    let offer = NewFile {
        size: 10,
        block_size: 8192,
        mode: 0o644,
        name: "foo.bin".to_string(),
    };

    // First sender claims the name.
    first.send(MsgType::NewFile, offer.encode()).await.unwrap();
    expect(&first, MsgType::NewFileReady).await;

    // Second sender offers the same name while the first transfer is still
    // open, and is refused in-band (both peers speak version 2).
    second.send(MsgType::NewFile, offer.encode()).await.unwrap();
    expect(&second, MsgType::DuplicateFile).await;

    // The first transfer finishes normally.
    first
        .send(MsgType::FileBlock, block_body(0, b"0123456789"))
        .await
        .unwrap();
    first.send(MsgType::FileComplete, Bytes::new()).await.unwrap();
    expect(&first, MsgType::FileComplete).await;

    assert_eq!(fs::read(dest.join("foo.bin")).unwrap(), b"0123456789");
    // The loser's refusal left no debris behind.
    assert!(!dest.join(".foo.bin").exists());

    // The refused sender's session is still usable for other names.
    let other = NewFile {
        size: 3,
        block_size: 8192,
        mode: 0o644,
        name: "bar.bin".to_string(),
    };
    second.send(MsgType::NewFile, other.encode()).await.unwrap();
    expect(&second, MsgType::NewFileReady).await;
    second
        .send(MsgType::FileBlock, block_body(0, b"abc"))
        .await
        .unwrap();
    second.send(MsgType::FileComplete, Bytes::new()).await.unwrap();
    expect(&second, MsgType::FileComplete).await;
    assert_eq!(fs::read(dest.join("bar.bin")).unwrap(), b"abc");

    first.close();
    second.close();
    bus.shutdown();
    bus.join().await;
    shutdown.trigger();
    timeout(Duration::from_secs(15), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_block_disconnects_the_session() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("dest");
    let port = free_port();

    let shutdown = Shutdown::new();
    let rx_config = ReceiverConfig {
        ident: "landing".to_string(),
        destination_dir: dest.clone(),
        duplicate_destinations: vec![],
        unique_duplicates: false,
        freespace_minimum: None,
        space_maximum_percent: None,
        post_command: None,
        mode: Mode::Server,
        listen: vec![SocketAddr::from(([127, 0, 0, 1], port))],
        peers: vec![],
        keepalive: 0,
        reconnect_interval: 1,
        tls: None,
    };
    let rx = tokio::spawn(receiver::run(rx_config, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let bus = Bus::new(None);
    let link = hand_driven_sender(&bus, "tx-evil", port).await;

    let offer = NewFile {
        size: 4,
        block_size: 8192,
        mode: 0o644,
        name: "short.bin".to_string(),
    };
    link.send(MsgType::NewFile, offer.encode()).await.unwrap();
    expect(&link, MsgType::NewFileReady).await;

    // A block past the declared size must kill the session.
    link.send(MsgType::FileBlock, block_body(2, b"toolong"))
        .await
        .unwrap();
    let died = timeout(Duration::from_secs(10), link.recv()).await.unwrap();
    assert!(died.is_err());

    // Nothing landed and the staging debris is gone.
    assert!(!dest.join("short.bin").exists());
    assert!(!dest.join(".short.bin").exists());

    bus.shutdown();
    bus.join().await;
    shutdown.trigger();
    timeout(Duration::from_secs(15), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_file_name_is_rejected_in_band() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("dest");
    let port = free_port();

    let shutdown = Shutdown::new();
    let rx_config = ReceiverConfig {
        ident: "landing".to_string(),
        destination_dir: dest.clone(),
        duplicate_destinations: vec![],
        unique_duplicates: false,
        freespace_minimum: None,
        space_maximum_percent: None,
        post_command: None,
        mode: Mode::Server,
        listen: vec![SocketAddr::from(([127, 0, 0, 1], port))],
        peers: vec![],
        keepalive: 0,
        reconnect_interval: 1,
        tls: None,
    };
    let rx = tokio::spawn(receiver::run(rx_config, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let bus = Bus::new(None);
    let link = hand_driven_sender(&bus, "tx", port).await;

    for bad in [".sneaky", "a/b"] {
        let offer = NewFile {
            size: 1,
            block_size: 8192,
            mode: 0o644,
            name: bad.to_string(),
        };
        link.send(MsgType::NewFile, offer.encode()).await.unwrap();
        expect(&link, MsgType::RejectFile).await;
    }
    assert!(fs::read_dir(&dest).unwrap().next().is_none());

    bus.shutdown();
    bus.join().await;
    shutdown.trigger();
    timeout(Duration::from_secs(15), rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
