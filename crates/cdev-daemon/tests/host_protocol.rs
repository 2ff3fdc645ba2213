//! Host-router protocol scenarios over socket pairs: handshake timeout,
//! boot replay, diagnostics, and cross-client isolation.

use std::path::Path;
use std::sync::Arc;

use cdev_core::proto::{command, parse_sync, Message, MessageCodec};
use cdev_core::{runtime, DeviceRegistry, UeventMessage};
use cdev_daemon::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

type Peer = Framed<UnixStream, MessageCodec>;

fn fixture_sysfs(root: &Path) {
    let devices = root.join("devices");
    std::fs::create_dir_all(devices.join("a")).unwrap();
    std::fs::write(
        devices.join("a/uevent"),
        "MAJOR=226\nMINOR=0\nDEVNAME=dri/card0\n",
    )
    .unwrap();
    std::os::unix::fs::symlink("../../class/drm", devices.join("a/subsystem")).unwrap();

    std::fs::create_dir_all(devices.join("b")).unwrap();
    std::fs::write(devices.join("b/uevent"), "MAJOR=8\nMINOR=0\nDEVNAME=sda\n").unwrap();
    std::os::unix::fs::symlink("../../class/block", devices.join("b/subsystem")).unwrap();
}

fn make_router(sys_root: &Path, rules_dir: &Path) -> (Arc<Router>, runtime::ShutdownTx) {
    let registry = Arc::new(DeviceRegistry::new(sys_root));
    let (shutdown_tx, shutdown_rx) = runtime::shutdown_channel();
    let router = Router::new(registry, rules_dir.to_path_buf(), false, shutdown_rx);
    (router, shutdown_tx)
}

fn connect(router: &Arc<Router>) -> Peer {
    let (server_side, client_side) = UnixStream::pair().unwrap();
    tokio::spawn(Arc::clone(router).serve_client(server_side));
    Framed::new(client_side, MessageCodec::new())
}

async fn recv(peer: &mut Peer) -> Message {
    peer.next()
        .await
        .expect("connection must stay open")
        .expect("frame must decode")
}

async fn handshake(peer: &mut Peer, name: &str) {
    let hello = recv(peer).await;
    assert_eq!(hello.command, command::HELLO);
    peer.send(Message::new(command::CLIENT_HELLO, name.to_string()))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn s1_silent_client_gets_bye_after_the_handshake_window() {
    let root = tempfile::tempdir().unwrap();
    let (router, _shutdown) = make_router(root.path(), root.path());
    let mut peer = connect(&router);

    let hello = recv(&mut peer).await;
    assert_eq!(hello.command, command::HELLO);

    // Say nothing. Paused time fast-forwards through the 10 s window.
    let bye = recv(&mut peer).await;
    assert_eq!(bye.command, command::BYE);

    // The server closes afterwards.
    assert!(peer.next().await.is_none());
}

#[tokio::test]
async fn s2_boot_replay_brackets_and_per_device_frames() {
    let root = tempfile::tempdir().unwrap();
    fixture_sysfs(root.path());
    let rules = tempfile::tempdir().unwrap();
    let (router, _shutdown) = make_router(root.path(), rules.path());
    let mut peer = connect(&router);

    handshake(&mut peer, "steambox").await;
    peer.send(Message::empty(command::CLIENT_BOOT)).await.unwrap();

    let begin = recv(&mut peer).await;
    assert_eq!(begin.command, command::BEGINCMD);
    assert_eq!(&begin.data[..], b"boot");

    // Device a, then device b: SYNC (default forwarding includes ENV)
    // followed by the add event.
    for devpath in ["/devices/a", "/devices/b"] {
        let sync = recv(&mut peer).await;
        assert_eq!(sync.command, command::SYNC, "{devpath}");
        let (sync_devpath, selector, _buffer) = parse_sync(&sync.data).unwrap();
        assert_eq!(sync_devpath, devpath);
        assert!(selector.env);

        let uevent = recv(&mut peer).await;
        assert_eq!(uevent.command, command::UEVENT);
        let msg = UeventMessage::parse(&uevent.data).unwrap();
        assert_eq!(msg.action, "add");
        assert_eq!(msg.devpath, devpath);
    }

    let end = recv(&mut peer).await;
    assert_eq!(end.command, command::ENDCMD);
    assert_eq!(&end.data[..], b"boot");
}

#[tokio::test]
async fn echo_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let (router, _shutdown) = make_router(root.path(), root.path());
    let mut peer = connect(&router);

    handshake(&mut peer, "box").await;
    peer.send(Message::new(command::CLIENT_ECHO, &b"ping"[..]))
        .await
        .unwrap();

    let reply = recv(&mut peer).await;
    assert_eq!(reply.command, command::ECHO);
    assert_eq!(&reply.data[..], b"ping");
}

#[tokio::test]
async fn bye_is_acknowledged() {
    let root = tempfile::tempdir().unwrap();
    let (router, _shutdown) = make_router(root.path(), root.path());
    let mut peer = connect(&router);

    handshake(&mut peer, "box").await;
    peer.send(Message::new(command::CLIENT_BYE, &b"done"[..]))
        .await
        .unwrap();

    let ack = recv(&mut peer).await;
    assert_eq!(ack.command, command::BYE);
    assert_eq!(&ack.data[..], b"ACK");
    assert!(peer.next().await.is_none());
}

#[tokio::test]
async fn container_names_with_path_tricks_are_refused() {
    let root = tempfile::tempdir().unwrap();
    let (router, _shutdown) = make_router(root.path(), root.path());
    let mut peer = connect(&router);

    let hello = recv(&mut peer).await;
    assert_eq!(hello.command, command::HELLO);
    peer.send(Message::new(command::CLIENT_HELLO, "../evil".to_string()))
        .await
        .unwrap();

    let bye = recv(&mut peer).await;
    assert_eq!(bye.command, command::BYE);
}

#[tokio::test]
async fn one_dead_client_does_not_affect_another() {
    let root = tempfile::tempdir().unwrap();
    fixture_sysfs(root.path());
    let rules = tempfile::tempdir().unwrap();
    let (router, _shutdown) = make_router(root.path(), rules.path());

    let mut first = connect(&router);
    let mut second = connect(&router);
    handshake(&mut first, "one").await;
    handshake(&mut second, "two").await;

    // First client dies unceremoniously.
    drop(first);
    tokio::task::yield_now().await;

    // The second client still gets full service.
    second
        .send(Message::new(command::CLIENT_ECHO, &b"alive?"[..]))
        .await
        .unwrap();
    let reply = recv(&mut second).await;
    assert_eq!(reply.command, command::ECHO);
    assert_eq!(&reply.data[..], b"alive?");

    second.send(Message::empty(command::CLIENT_BOOT)).await.unwrap();
    let begin = recv(&mut second).await;
    assert_eq!(begin.command, command::BEGINCMD);
}

#[tokio::test]
async fn shutdown_sends_bye_to_connected_clients() {
    let root = tempfile::tempdir().unwrap();
    let (router, shutdown) = make_router(root.path(), root.path());
    let mut peer = connect(&router);
    handshake(&mut peer, "box").await;

    shutdown.send(Some("SIGTERM".into())).unwrap();

    let bye = recv(&mut peer).await;
    assert_eq!(bye.command, command::BYE);
    assert_eq!(&bye.data[..], b"SIGTERM");
    assert!(peer.next().await.is_none());
}
