//! Agent lifecycle scenarios against a scripted host: handshake, node
//! materialization (S3/S4), dry-run (S5), and control-driven exit (S6).

use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cdev_agent::{Agent, BulkRequest, ControlRequest};
use cdev_core::proto::{command, Message, MessageCodec};
use cdev_core::{runtime, DeviceRegistry, UeventSocket};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

type Host = Framed<UnixStream, MessageCodec>;

struct Fixture {
    host: Host,
    control_tx: mpsc::Sender<ControlRequest>,
    agent_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _shutdown_tx: runtime::ShutdownTx,
}

fn spawn_agent(dev_root: &Path, rules_dir: &Path, dry: bool, bulk: Option<BulkRequest>) -> Fixture {
    let (host_side, agent_side) = UnixStream::pair().unwrap();
    let registry = Arc::new(DeviceRegistry::new("/nonexistent-sys"));
    let netlink = UeventSocket::open_unbound().expect("netlink socket");
    let (control_tx, control_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = runtime::shutdown_channel();

    let agent = Agent::new(
        registry,
        rules_dir.to_path_buf(),
        dev_root.to_path_buf(),
        dry,
        netlink,
        bulk,
        bulk.is_some(),
    );
    let agent_task = tokio::spawn(async move {
        agent
            .run(agent_side, "steambox", control_rx, shutdown_rx)
            .await
    });

    Fixture {
        host: Framed::new(host_side, MessageCodec::new()),
        control_tx,
        agent_task,
        _shutdown_tx: shutdown_tx,
    }
}

async fn recv(host: &mut Host) -> Message {
    tokio::time::timeout(Duration::from_secs(5), host.next())
        .await
        .expect("agent must answer promptly")
        .expect("connection must stay open")
        .expect("frame must decode")
}

/// Serve the agent's side of the handshake.
async fn greet(fixture: &mut Fixture, expect_dry: bool) {
    fixture
        .host
        .send(Message::empty(command::HELLO))
        .await
        .unwrap();

    let hello = recv(&mut fixture.host).await;
    assert_eq!(hello.command, command::CLIENT_HELLO);
    assert_eq!(&hello.data[..], b"steambox");

    if expect_dry {
        let dry = recv(&mut fixture.host).await;
        assert_eq!(dry.command, command::CLIENT_DRY_RUN);
    }
}

fn sound_uevent(action: &str) -> Vec<u8> {
    format!(
        "{action}@/devices/sound/pcmC0D0p\0\
         ACTION={action}\0\
         DEVPATH=/devices/sound/pcmC0D0p\0\
         SUBSYSTEM=sound\0\
         DEVNAME=snd/pcmC0D0p\0\
         MAJOR=116\0MINOR=24\0GROUP=audio\0"
    )
    .into_bytes()
}

fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[tokio::test]
async fn s3_s4_add_creates_node_remove_cleans_up() {
    if !is_root() {
        eprintln!("skipping: needs CAP_MKNOD");
        return;
    }
    let dev_root = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();
    let mut fixture = spawn_agent(dev_root.path(), rules_dir.path(), false, None);
    greet(&mut fixture, false).await;

    // S3: add materializes the node with resolved mode and group.
    fixture
        .host
        .send(Message::new(command::UEVENT, sound_uevent("add")))
        .await
        .unwrap();
    // S4: remove unlinks it again.
    fixture
        .host
        .send(Message::new(command::UEVENT, sound_uevent("remove")))
        .await
        .unwrap();
    fixture
        .host
        .send(Message::new(command::BYE, &b"test over"[..]))
        .await
        .unwrap();

    let bye = recv(&mut fixture.host).await;
    assert_eq!(bye.command, command::CLIENT_BYE);
    fixture.agent_task.await.unwrap().unwrap();

    // After add + remove the node and its emptied directory are gone.
    assert!(!dev_root.path().join("snd/pcmC0D0p").exists());
    assert!(!dev_root.path().join("snd").exists());
}

#[tokio::test]
async fn s3_node_attributes_after_add() {
    if !is_root() {
        eprintln!("skipping: needs CAP_MKNOD");
        return;
    }
    let dev_root = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();
    let mut fixture = spawn_agent(dev_root.path(), rules_dir.path(), false, None);
    greet(&mut fixture, false).await;

    fixture
        .host
        .send(Message::new(command::UEVENT, sound_uevent("add")))
        .await
        .unwrap();
    fixture
        .host
        .send(Message::new(command::BYE, &b"test over"[..]))
        .await
        .unwrap();
    let _bye = recv(&mut fixture.host).await;
    fixture.agent_task.await.unwrap().unwrap();

    let meta = dev_root
        .path()
        .join("snd/pcmC0D0p")
        .symlink_metadata()
        .expect("node must exist");
    assert_eq!(meta.mode() & 0o7777, 0o660);
    assert_eq!(meta.rdev(), nix::sys::stat::makedev(116, 24));
    // gid is the resolved "audio" group, or 0 when the name is unknown.
    if let Ok(Some(audio)) = nix::unistd::Group::from_name("audio") {
        assert_eq!(meta.gid(), audio.gid.as_raw());
    } else {
        assert_eq!(meta.gid(), 0);
    }
}

#[tokio::test]
async fn s5_dry_run_touches_nothing() {
    let dev_root = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        rules_dir.path().join("10-sound.rules"),
        "SUBSYSTEM==\"sound\", GROUP=\"audio\", TAG+=\"snd\"\n",
    )
    .unwrap();

    let mut fixture = spawn_agent(dev_root.path(), rules_dir.path(), true, None);
    greet(&mut fixture, true).await;

    fixture
        .host
        .send(Message::new(command::UEVENT, sound_uevent("add")))
        .await
        .unwrap();
    fixture
        .host
        .send(Message::new(command::BYE, &b"test over"[..]))
        .await
        .unwrap();
    let bye = recv(&mut fixture.host).await;
    assert_eq!(bye.command, command::CLIENT_BYE);
    fixture.agent_task.await.unwrap().unwrap();

    // No nodes, no directories, nothing.
    assert_eq!(
        std::fs::read_dir(dev_root.path()).unwrap().count(),
        0,
        "dry run must not create filesystem entries"
    );
}

#[tokio::test]
async fn s6_control_exit_closes_the_connection_quickly() {
    let dev_root = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();
    let mut fixture = spawn_agent(dev_root.path(), rules_dir.path(), true, None);
    greet(&mut fixture, true).await;

    fixture
        .control_tx
        .send(ControlRequest::Exit)
        .await
        .unwrap();

    let deadline = Duration::from_secs(1);
    let bye = tokio::time::timeout(deadline, fixture.host.next())
        .await
        .expect("exit must complete within a second")
        .expect("connection open")
        .expect("frame decodes");
    assert_eq!(bye.command, command::CLIENT_BYE);

    let eof = tokio::time::timeout(deadline, fixture.host.next())
        .await
        .expect("close must follow promptly");
    assert!(eof.is_none(), "agent must close the connection");
    fixture.agent_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn boot_only_finishes_at_endcmd() {
    let dev_root = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();
    let mut fixture = spawn_agent(
        dev_root.path(),
        rules_dir.path(),
        true,
        Some(BulkRequest::Boot),
    );
    greet(&mut fixture, true).await;

    let boot = recv(&mut fixture.host).await;
    assert_eq!(boot.command, command::CLIENT_BOOT);

    fixture
        .host
        .send(Message::new(command::BEGINCMD, &b"boot"[..]))
        .await
        .unwrap();
    fixture
        .host
        .send(Message::new(command::ENDCMD, &b"boot"[..]))
        .await
        .unwrap();

    let bye = recv(&mut fixture.host).await;
    assert_eq!(bye.command, command::CLIENT_BYE);
    fixture.agent_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_host_makes_the_agent_give_up() {
    let dev_root = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();
    let mut fixture = spawn_agent(dev_root.path(), rules_dir.path(), true, None);

    // Send nothing; the agent's 10 s handshake window elapses.
    let bye = fixture
        .host
        .next()
        .await
        .expect("agent must speak before leaving")
        .expect("frame decodes");
    assert_eq!(bye.command, command::CLIENT_BYE);
    assert!(fixture.agent_task.await.unwrap().is_err());
}
