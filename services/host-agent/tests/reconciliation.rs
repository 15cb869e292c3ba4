//! Integration tests for the reconciliation flow.
//!
//! These tests drive the loop the way the agent does:
//! 1. An observation arrives (fresh or stale)
//! 2. The loop plans against its forward table
//! 3. The tunnel actor applies the plan over the control channel
//!
//! Uses MockControlChannel to stand in for the SSH master connection, and
//! local echo servers to stand in for the guest half of vsock relays.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use vmfwd_host_agent::actors::{BackoffPolicy, ConnectionStatus, Supervisor, TunnelActor, TunnelConfig, TunnelHandle};
use vmfwd_host_agent::channel::{
    ChannelError, Endpoint, ForwardTuple, MockControlChannel, MockOp, RelayChannel, RelayConn, RelayGuest,
};
use vmfwd_host_agent::observer::{GuestAgent, GuestPortObserver, ObserveError, Observation, ObserverTask};
use vmfwd_host_agent::reconciler::{LoopConfig, ReconciliationLoop};
use vmfwd_host_agent::transport::{HypervisorSocketTransport, LoopbackTransport, TransportCapability};
use vmfwd_host_agent::vsock::{ClaimOnlyProbe, VsockPortAllocator};
use vmfwd_reconcile::{
    DesiredStateStore, ForwardPhase, GuestSocket, GuestSocketSnapshot, InstanceHealth, PortRange, PortRule, PortSpec,
    Protocol, Reconciler, ReconcilerConfig, UnavailableReason,
};

const ANY4: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const LOCAL4: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_tunnel_config() -> TunnelConfig {
    TunnelConfig {
        instance: "test".to_string(),
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        },
        ..TunnelConfig::default()
    }
}

fn bind(port: u16) -> Endpoint {
    Endpoint::Inet(SocketAddr::new(LOCAL4, port))
}

fn tcp(port: u16) -> GuestSocket {
    GuestSocket::tcp(ANY4, port)
}

fn fresh(sockets: impl IntoIterator<Item = GuestSocket>) -> Observation {
    Observation::fresh(GuestSocketSnapshot::new(sockets))
}

fn stale(sockets: impl IntoIterator<Item = GuestSocket>) -> Observation {
    Observation::failed(
        GuestSocketSnapshot::new(sockets),
        ObserveError::Timeout(Duration::from_secs(2)),
    )
}

struct TestAgent {
    _shutdown_tx: watch::Sender<bool>,
    _supervisor: Supervisor,
    channel: MockControlChannel,
    tunnel: TunnelHandle,
    reconciliation: ReconciliationLoop,
}

fn test_agent(store: DesiredStateStore) -> TestAgent {
    let channel = MockControlChannel::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(shutdown_rx);
    let tunnel = TunnelActor::new(test_tunnel_config(), channel.clone(), Arc::new(LoopbackTransport), None)
        .spawn(&mut supervisor);

    let reconciliation = ReconciliationLoop::new(
        "test",
        Reconciler::new(ReconcilerConfig { grace_ticks: 2 }),
        Arc::new(store),
        tunnel.clone(),
        LoopConfig::default(),
    );

    TestAgent {
        _shutdown_tx: shutdown_tx,
        _supervisor: supervisor,
        channel,
        tunnel,
        reconciliation,
    }
}

#[tokio::test]
async fn test_discovered_socket_is_forwarded() {
    let mut agent = test_agent(DesiredStateStore::empty());

    let summary = agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    assert_eq!(summary.added, 1);
    assert!(agent.channel.has_forward(&bind(8080)));

    let key = tcp(8080).default_spec().key();
    assert_eq!(agent.reconciliation.table().phase(&key), Some(ForwardPhase::Active));
    assert_eq!(agent.reconciliation.health(), InstanceHealth::Healthy);
}

#[tokio::test]
async fn test_unchanged_snapshot_is_idempotent() {
    let mut agent = test_agent(DesiredStateStore::empty());

    agent.reconciliation.run_pass(fresh([tcp(8080), tcp(9090)])).await;
    let mutations = agent.channel.mutation_count();

    for _ in 0..3 {
        let summary = agent.reconciliation.run_pass(fresh([tcp(8080), tcp(9090)])).await;
        assert_eq!(summary.added + summary.removed, 0);
    }
    assert_eq!(agent.channel.mutation_count(), mutations);
}

#[tokio::test]
async fn test_removal_waits_for_grace_period() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;

    // missing for two fresh ticks: still forwarded
    for _ in 0..2 {
        let summary = agent.reconciliation.run_pass(fresh([])).await;
        assert_eq!(summary.removed, 0);
        assert!(agent.channel.has_forward(&bind(8080)));
    }

    let summary = agent.reconciliation.run_pass(fresh([])).await;
    assert_eq!(summary.removed, 1);
    assert!(!agent.channel.has_forward(&bind(8080)));
    assert!(agent.reconciliation.table().is_empty());
}

#[tokio::test]
async fn test_flapping_socket_is_not_torn_down() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    let mutations = agent.channel.mutation_count();

    for present in [false, true, false, false, true, false, true] {
        let sockets = if present { vec![tcp(8080)] } else { vec![] };
        agent.reconciliation.run_pass(fresh(sockets)).await;
    }

    assert!(agent.channel.has_forward(&bind(8080)));
    assert_eq!(agent.channel.mutation_count(), mutations);
}

#[tokio::test]
async fn test_stale_snapshots_never_remove() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;

    for _ in 0..10 {
        let summary = agent.reconciliation.run_pass(stale([])).await;
        assert_eq!(summary.removed, 0);
    }
    assert!(agent.channel.has_forward(&bind(8080)));
}

#[tokio::test]
async fn test_guest_unreachable_degrades_health() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;

    for _ in 0..2 {
        agent.reconciliation.run_pass(stale([tcp(8080)])).await;
    }
    assert_eq!(agent.reconciliation.health(), InstanceHealth::Healthy);

    agent.reconciliation.run_pass(stale([tcp(8080)])).await;
    assert_eq!(
        agent.reconciliation.health(),
        InstanceHealth::Degraded {
            failed_rules: 0,
            guest_unreachable: true,
        }
    );

    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    assert_eq!(agent.reconciliation.health(), InstanceHealth::Healthy);
}

#[tokio::test]
async fn test_pinned_forward_survives_empty_snapshots() {
    let pinned = PortSpec::tcp(LOCAL4, 22, LOCAL4, 2222);
    let mut agent = test_agent(DesiredStateStore::new(vec![], vec![pinned]));

    let summary = agent.reconciliation.run_pass(fresh([])).await;
    assert_eq!(summary.added, 1);

    for _ in 0..10 {
        let summary = agent.reconciliation.run_pass(fresh([])).await;
        assert_eq!(summary.removed, 0);
    }
    assert!(agent.channel.has_forward(&bind(2222)));
}

#[tokio::test]
async fn test_ignored_and_remapped_sockets() {
    let store = DesiredStateStore::new(
        vec![
            PortRule::forward(PortRange::new(3000, 3009).unwrap(), LOCAL4, PortRange::new(13000, 13009)),
            PortRule::ignore(PortRange::new(1, 1023).unwrap()),
        ],
        vec![],
    );
    let mut agent = test_agent(store);

    let summary = agent.reconciliation.run_pass(fresh([tcp(22), tcp(3004)])).await;
    assert_eq!(summary.added, 1);
    assert!(agent.channel.has_forward(&bind(13004)));
    assert!(!agent.channel.has_forward(&bind(22)));
}

#[tokio::test]
async fn test_host_endpoint_conflict_keeps_lower_order() {
    // pinned rule claims host 8080 for a different guest port
    let pinned = PortSpec::tcp(LOCAL4, 3000, LOCAL4, 8080);
    let mut agent = test_agent(DesiredStateStore::new(vec![], vec![pinned.clone()]));

    let summary = agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.conflicts, 1);

    let forwards = agent.channel.forwards();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].connect, Endpoint::Inet(SocketAddr::new(LOCAL4, 3000)));

    let table = agent.reconciliation.table();
    assert_eq!(table.phase(&pinned.key()), Some(ForwardPhase::Active));
    assert!(!table.contains(&tcp(8080).default_spec().key()));
}

#[tokio::test]
async fn test_conflict_loser_is_promoted_after_removal() {
    let mut agent = test_agent(DesiredStateStore::empty());
    let winner = tcp(8080);
    let loser = GuestSocket::tcp(IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)), 8080);

    let summary = agent.reconciliation.run_pass(fresh([winner, loser])).await;
    assert_eq!((summary.added, summary.conflicts), (1, 1));

    // the winner lingers through its grace period, then is removed
    for _ in 0..3 {
        agent.reconciliation.run_pass(fresh([loser])).await;
    }
    assert!(!agent.reconciliation.table().contains(&winner.default_spec().key()));

    let summary = agent.reconciliation.run_pass(fresh([loser])).await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.conflicts, 0);
    assert_eq!(
        agent.channel.forwards()[0].connect,
        Endpoint::Inet(SocketAddr::new(loser.address, 8080))
    );
}

#[tokio::test]
async fn test_fatal_rule_is_parked_without_blocking_others() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent
        .channel
        .fail_next(MockOp::Add, ChannelError::PermissionDenied("bind 127.0.0.1:80".into()));

    let summary = agent.reconciliation.run_pass(fresh([tcp(80), tcp(8080)])).await;
    assert_eq!(summary.added, 1);
    assert_eq!(summary.failed, 1);
    assert!(agent.channel.has_forward(&bind(8080)));

    let parked = tcp(80).default_spec().key();
    assert_eq!(agent.reconciliation.table().phase(&parked), Some(ForwardPhase::AddFailedFatal));
    assert_eq!(
        agent.reconciliation.health(),
        InstanceHealth::Degraded {
            failed_rules: 1,
            guest_unreachable: false,
        }
    );

    // parked rules are not retried while their definition is unchanged
    let mutations = agent.channel.mutation_count();
    agent.reconciliation.run_pass(fresh([tcp(80), tcp(8080)])).await;
    assert_eq!(agent.channel.mutation_count(), mutations);
}

// =============================================================================
// Relayed forwards
// =============================================================================

/// Guest half played by local servers, one per protocol.
struct LocalRelayGuest {
    stream_target: SocketAddr,
    datagram_target: SocketAddr,
    open: Mutex<HashMap<u32, Protocol>>,
}

#[async_trait]
impl RelayGuest for LocalRelayGuest {
    async fn open(&self, port: u32, tuple: &ForwardTuple) -> Result<(), ChannelError> {
        self.open.lock().unwrap().insert(port, tuple.protocol);
        Ok(())
    }

    async fn close(&self, port: u32) -> Result<(), ChannelError> {
        self.open.lock().unwrap().remove(&port);
        Ok(())
    }

    fn dial(&self, port: u32) -> io::Result<Box<dyn RelayConn>> {
        let target = match self.open.lock().unwrap().get(&port) {
            Some(Protocol::Tcp) => self.stream_target,
            Some(Protocol::Udp) => self.datagram_target,
            _ => return Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        };
        Ok(Box::new(StdTcpStream::connect(target)?))
    }
}

/// Echoes bytes back on every connection.
fn stream_echo() -> SocketAddr {
    let listener = StdTcpListener::bind((LOCAL4, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || {
                let mut reader = stream.try_clone().unwrap();
                let _ = io::copy(&mut reader, &mut stream);
            });
        }
    });
    addr
}

/// Echoes length-prefixed datagrams back on every connection.
fn datagram_echo() -> SocketAddr {
    let listener = StdTcpListener::bind((LOCAL4, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || loop {
                let mut len = [0u8; 2];
                if stream.read_exact(&mut len).is_err() {
                    break;
                }
                let mut frame = vec![0u8; usize::from(u16::from_be_bytes(len))];
                if stream.read_exact(&mut frame).is_err() {
                    break;
                }
                if stream.write_all(&len).and_then(|()| stream.write_all(&frame)).is_err() {
                    break;
                }
            });
        }
    });
    addr
}

fn free_tcp_port() -> u16 {
    StdTcpListener::bind((LOCAL4, 0)).unwrap().local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind((LOCAL4, 0)).unwrap().local_addr().unwrap().port()
}

struct RelayAgent {
    _shutdown_tx: watch::Sender<bool>,
    _supervisor: Supervisor,
    _claims: TempDir,
    control: MockControlChannel,
    allocator: Arc<VsockPortAllocator>,
    reconciliation: ReconciliationLoop,
}

fn relay_agent(transport: Arc<dyn TransportCapability>) -> RelayAgent {
    let claims = TempDir::new().unwrap();
    let allocator = Arc::new(
        VsockPortAllocator::new(claims.path(), 5000, 5063, 256, Box::new(ClaimOnlyProbe)).unwrap(),
    );
    let control = MockControlChannel::new();
    let guest = LocalRelayGuest {
        stream_target: stream_echo(),
        datagram_target: datagram_echo(),
        open: Mutex::new(HashMap::new()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(shutdown_rx);
    let tunnel = TunnelActor::new(
        test_tunnel_config(),
        RelayChannel::new(control.clone(), guest),
        transport,
        Some(allocator.clone()),
    )
    .spawn(&mut supervisor);

    let reconciliation = ReconciliationLoop::new(
        "test",
        Reconciler::new(ReconcilerConfig { grace_ticks: 2 }),
        Arc::new(DesiredStateStore::empty()),
        tunnel,
        LoopConfig::default(),
    );

    RelayAgent {
        _shutdown_tx: shutdown_tx,
        _supervisor: supervisor,
        _claims: claims,
        control,
        allocator,
        reconciliation,
    }
}

async fn echo_over(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut client = tokio::net::TcpStream::connect((LOCAL4, port)).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

#[tokio::test]
async fn test_vsock_relayed_forward_lifecycle() {
    let mut agent = relay_agent(Arc::new(HypervisorSocketTransport));
    let web = tcp(free_tcp_port());
    let key = web.default_spec().key();

    let summary = agent.reconciliation.run_pass(fresh([web])).await;
    assert_eq!(summary.added, 1);
    assert_eq!(agent.reconciliation.table().phase(&key), Some(ForwardPhase::Active));
    assert_eq!(agent.allocator.held().len(), 1);
    // relayed forwards never touch the control connection
    assert_eq!(agent.control.mutation_count(), 0);

    assert_eq!(echo_over(web.port, b"hello guest").await, b"hello guest");

    for _ in 0..3 {
        agent.reconciliation.run_pass(fresh([])).await;
    }
    assert!(agent.reconciliation.table().is_empty());
    assert!(agent.allocator.held().is_empty());
    assert!(tokio::net::TcpStream::connect((LOCAL4, web.port)).await.is_err());
}

#[tokio::test]
async fn test_udp_is_relayed_beside_loopback_tcp() {
    let mut agent = relay_agent(Arc::new(LoopbackTransport));
    let dns = GuestSocket::new(Protocol::Udp, ANY4, free_udp_port());
    let web = tcp(free_tcp_port());

    let summary = agent.reconciliation.run_pass(fresh([dns, web])).await;
    assert_eq!(summary.added, 2);
    assert_eq!(
        agent.reconciliation.table().phase(&dns.default_spec().key()),
        Some(ForwardPhase::Active)
    );
    assert!(agent.control.has_forward(&bind(web.port)));
    assert_eq!(agent.allocator.held().len(), 1);

    let client = tokio::net::UdpSocket::bind((LOCAL4, 0)).await.unwrap();
    client.send_to(b"lookup", (LOCAL4, dns.port)).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"lookup");
}

#[tokio::test]
async fn test_transient_failure_is_retried_next_pass() {
    let mut agent = test_agent(DesiredStateStore::empty());
    for _ in 0..4 {
        agent
            .channel
            .fail_next(MockOp::Add, ChannelError::Busy("channel busy".into()));
    }

    let summary = agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    assert_eq!(summary.failed, 1);
    let key = tcp(8080).default_spec().key();
    assert_eq!(agent.reconciliation.table().phase(&key), Some(ForwardPhase::AddFailedTransient));

    let summary = agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    assert_eq!(summary.added, 1);
    assert_eq!(agent.reconciliation.table().phase(&key), Some(ForwardPhase::Active));
    assert_eq!(agent.reconciliation.health(), InstanceHealth::Healthy);
}

#[tokio::test]
async fn test_connection_check_requeues_forwards() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080), tcp(9090)])).await;

    agent.channel.set_alive(false);
    assert!(agent.reconciliation.check_connection().await);
    assert_eq!(agent.channel.reconnect_count(), 1);
    assert!(agent.channel.forwards().is_empty());
    assert_eq!(agent.reconciliation.table().count_in(ForwardPhase::Pending), 2);

    let summary = agent.reconciliation.run_pass(fresh([tcp(8080), tcp(9090)])).await;
    assert_eq!(summary.added, 2);
    assert!(agent.channel.has_forward(&bind(8080)));
    assert!(agent.channel.has_forward(&bind(9090)));
}

#[tokio::test]
async fn test_connection_lost_mid_pass() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;

    agent.channel.set_alive(false);
    let summary = agent.reconciliation.run_pass(fresh([tcp(8080), tcp(9090)])).await;
    assert!(summary.connection_reset);
    assert_eq!(agent.channel.reconnect_count(), 1);

    agent.reconciliation.run_pass(fresh([tcp(8080), tcp(9090)])).await;
    assert!(agent.channel.has_forward(&bind(8080)));
    assert!(agent.channel.has_forward(&bind(9090)));
}

#[tokio::test]
async fn test_persistent_connection_loss_reports_unavailable() {
    let mut agent = test_agent(DesiredStateStore::empty());
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;

    agent.channel.set_alive(false);
    agent.channel.fail_reconnects(10);

    for _ in 0..2 {
        assert!(!agent.reconciliation.check_connection().await);
    }
    assert_eq!(agent.tunnel.status(), ConnectionStatus::Reconnecting);
    assert_eq!(agent.reconciliation.health(), InstanceHealth::Healthy);

    assert!(!agent.reconciliation.check_connection().await);
    assert_eq!(agent.tunnel.status(), ConnectionStatus::Unavailable);
    assert_eq!(
        agent.reconciliation.health(),
        InstanceHealth::Unavailable {
            reason: UnavailableReason::ControlConnectionLost,
        }
    );

    // the agent keeps trying and recovers once the connection comes back
    agent.channel.fail_reconnects(0);
    assert!(agent.reconciliation.check_connection().await);
    agent.reconciliation.run_pass(fresh([tcp(8080)])).await;
    assert!(agent.channel.has_forward(&bind(8080)));
    assert_eq!(agent.reconciliation.health(), InstanceHealth::Healthy);
}

struct ScriptedGuest {
    replies: Mutex<VecDeque<Vec<GuestSocket>>>,
}

#[async_trait]
impl GuestAgent for ScriptedGuest {
    async fn list_sockets(&self) -> Result<Vec<GuestSocket>, ObserveError> {
        let mut replies = self.replies.lock().unwrap();
        // the last reply repeats
        if replies.len() > 1 {
            Ok(replies.pop_front().unwrap())
        } else {
            Ok(replies.front().cloned().unwrap_or_default())
        }
    }
}

#[tokio::test]
async fn test_observer_drives_reconciliation_loop() {
    let agent = test_agent(DesiredStateStore::empty());
    let channel = agent.channel.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let guest = ScriptedGuest {
        replies: Mutex::new(VecDeque::from([vec![tcp(8080)], vec![tcp(8080), tcp(9090)]])),
    };
    let (tx, rx) = mpsc::channel(1);
    let observer = ObserverTask::new(
        GuestPortObserver::new(guest),
        Duration::from_millis(10),
        Duration::from_millis(100),
    )
    .spawn(tx, shutdown_rx.clone());
    let reconciliation = tokio::spawn(agent.reconciliation.run(rx, shutdown_rx));

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        while !(channel.has_forward(&bind(8080)) && channel.has_forward(&bind(9090))) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), observer)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), reconciliation)
        .await
        .unwrap()
        .unwrap();
}
