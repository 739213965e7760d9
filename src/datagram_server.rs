//! Datagram Server Core.
//!
//! One component type parametrized by `bind_port` and `join_group`
//! serves both the port-1900, group-joining notify role and the
//! ephemeral-port, no-group-join search role, avoiding type-level
//! duplication between the two.
//!
//! Socket setup (`SO_REUSEADDR`, multicast TTL, optional bind-to-device)
//! follows the `ssdp_sockets` function in `ssdp/mod.rs`; the state
//! machine replaces a nullable `Option<Arc<UdpSocket>>` field with the
//! explicit `Idle/Open/Running` variants.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};

use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::iface::{AddressMode, InterfaceBinding};

/// Socket read timeout / receive-loop poll interval.
const RECV_TIMEOUT: Duration = Duration::from_millis(750);
/// Ready-wait bound for `send`.
const READY_WAIT: Duration = Duration::from_millis(500);
const MULTICAST_TTL: u32 = 4;

/// Collaborator interface consumed by the core: invoked for each accepted
/// datagram, in receive order, from a single-threaded loop.
pub trait Receiver: Send + Sync + 'static {
    fn on_receive(&self, source: SocketAddr, data: &[u8]);
}

/// A one-shot-per-incarnation readiness signal: never reused
/// across task incarnations, replaced on each `start`.
struct ReadyLatch {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadyLatch {
    fn new() -> Arc<Self> {
        Arc::new(ReadyLatch {
            ready: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn signal(&self) {
        self.ready.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for readiness. Returns `false` on timeout.
    async fn wait(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => self.is_ready(),
            _ = tokio::time::sleep(timeout) => self.is_ready(),
        }
    }
}

struct RunningTask {
    cancel_tx: watch::Sender<bool>,
    ready: Arc<ReadyLatch>,
    handle: tokio::task::JoinHandle<()>,
}

enum ServerState {
    Idle,
    Open(Arc<UdpSocket>),
    Running(Arc<UdpSocket>, RunningTask),
}

/// Per-(interface, mode, role) multicast-socket owner. `bind_port` selects the role: `0` is the
/// ephemeral/search role, `1900` is the notify role which joins the
/// multicast group in its receive loop.
pub struct DatagramServer<R: Receiver> {
    binding: InterfaceBinding,
    bind_port: u16,
    receiver: Arc<R>,
    executors: Arc<Executors>,
    state: ServerState,
}

impl<R: Receiver> DatagramServer<R> {
    pub fn new(binding: InterfaceBinding, bind_port: u16, receiver: Arc<R>, executors: Arc<Executors>) -> Self {
        DatagramServer {
            binding,
            bind_port,
            receiver,
            executors,
            state: ServerState::Idle,
        }
    }

    pub fn binding(&self) -> &InterfaceBinding {
        &self.binding
    }

    /// True once this server has an open socket.
    pub fn is_open(&self) -> bool {
        !matches!(self.state, ServerState::Idle)
    }

    /// Idempotent re-open: closes any prior socket first, then binds a
    /// fresh multicast-capable socket with TTL=4 and the outgoing
    /// interface set.
    pub async fn open(&mut self) -> Result<()> {
        self.close().await;

        let socket = build_socket(&self.binding, self.bind_port)?;
        self.state = ServerState::Open(Arc::new(socket));
        debug!(target: "upnp", "Opened datagram socket on {} ({}:{})", self.binding.interface_name, self.binding.address, self.bind_port);
        Ok(())
    }

    /// Stops any running receive task, then releases the socket.
    /// Idempotent and safe to call from any state.
    pub async fn close(&mut self) {
        self.stop().await;
        if matches!(self.state, ServerState::Open(_) | ServerState::Running(..)) {
            self.state = ServerState::Idle;
        }
    }

    /// Starts the receive loop. Requires an open socket
    /// (`Error::InvalidState` otherwise); idempotent re-start (stops any
    /// prior task first).
    pub async fn start(&mut self) -> Result<()> {
        let socket = match &self.state {
            ServerState::Idle => return Err(Error::InvalidState("not open".into())),
            ServerState::Open(s) => s.clone(),
            ServerState::Running(s, _) => {
                let s = s.clone();
                self.stop().await;
                s
            }
        };

        let join_group = self.bind_port == 1900;
        let task_name = format!(
            "-ssdp-{}-{}-{}",
            if join_group { "notify" } else { "search" },
            self.binding.interface_name,
            self.binding.address
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ready = ReadyLatch::new();

        let loop_socket = socket.clone();
        let loop_ready = ready.clone();
        let loop_receiver = self.receiver.clone();
        let loop_binding = self.binding.clone();
        let loop_name = task_name.clone();

        let handle = self.executors.submit_server(async move {
            debug!(target: "upnp", "Receive task{} starting.", loop_name);
            run_receive_loop(loop_socket, join_group, &loop_binding, loop_ready, cancel_rx, loop_receiver).await;
            debug!(target: "upnp", "Receive task{} done.", loop_name);
        });

        self.state = ServerState::Running(
            socket,
            RunningTask {
                cancel_tx,
                ready,
                handle,
            },
        );
        Ok(())
    }

    /// Signals the receive task to cancel; returns immediately. The loop
    /// observes cancellation at the next iteration or recv-timeout
    /// boundary. Idempotent.
    pub async fn stop(&mut self) {
        if let ServerState::Running(socket, task) = std::mem::replace(&mut self.state, ServerState::Idle) {
            let _ = task.cancel_tx.send(true);
            let _ = task.handle.await;
            self.state = ServerState::Open(socket);
        }
    }

    /// Dispatches a send to the I/O pool. The worker waits up to 500ms
    /// for the receive task to signal ready; if it's not ready (or no
    /// task exists), the send is silently dropped. IO errors are logged and swallowed — UDP is best-effort.
    pub fn send(&self, payload: Vec<u8>) {
        let (socket, ready) = match &self.state {
            ServerState::Running(socket, task) => (socket.clone(), task.ready.clone()),
            _ => {
                trace!(target: "upnp", "send() with no running receive task, dropping.");
                return;
            }
        };
        let dest = self.binding.mode.group_socket_addr();

        self.executors.submit_io(async move {
            if !ready.wait(READY_WAIT).await {
                trace!(target: "upnp", "send() timed out waiting for ready, dropping.");
                return;
            }
            if let Err(e) = socket.send_to(&payload, dest).await {
                warn!(target: "upnp", "Failed to send SSDP datagram: {e}");
            }
        });
    }
}

async fn run_receive_loop(
    socket: Arc<UdpSocket>,
    join_group: bool,
    binding: &InterfaceBinding,
    ready: Arc<ReadyLatch>,
    mut cancel_rx: watch::Receiver<bool>,
    receiver: Arc<dyn Receiver>,
) {
    if join_group {
        if let Err(e) = join_multicast(&socket, binding) {
            warn!(target: "upnp", "Failed to join SSDP multicast group: {e}");
        }
    }

    ready.signal();

    let mut buf = [0u8; 1500];

    loop {
        if *cancel_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            recv = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => {
                match recv {
                    Err(_elapsed) => continue,
                    Ok(Err(e)) => {
                        warn!(target: "upnp", "Receive loop terminating on IO error: {e}");
                        break;
                    }
                    Ok(Ok((len, source))) => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                        receiver.on_receive(source, &buf[..len]);
                    }
                }
            }
        }
    }

    if join_group {
        if let Err(e) = leave_multicast(&socket, binding) {
            trace!(target: "upnp", "Failed to leave SSDP multicast group (best-effort): {e}");
        }
    }
}

fn join_multicast(socket: &UdpSocket, binding: &InterfaceBinding) -> std::io::Result<()> {
    match binding.mode {
        AddressMode::Ipv4 => {
            let iface = match binding.address {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(Ipv4Addr::new(239, 255, 255, 250), iface)
        }
        AddressMode::Ipv6LinkLocal => {
            let index = interface_index(&binding.interface_name).unwrap_or(0);
            socket.join_multicast_v6(&Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c), index)
        }
    }
}

fn leave_multicast(socket: &UdpSocket, binding: &InterfaceBinding) -> std::io::Result<()> {
    match binding.mode {
        AddressMode::Ipv4 => {
            let iface = match binding.address {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.leave_multicast_v4(Ipv4Addr::new(239, 255, 255, 250), iface)
        }
        AddressMode::Ipv6LinkLocal => {
            let index = interface_index(&binding.interface_name).unwrap_or(0);
            socket.leave_multicast_v6(&Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c), index)
        }
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(name).ok()
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

fn build_socket(binding: &InterfaceBinding, bind_port: u16) -> Result<UdpSocket> {
    let domain = match binding.mode {
        AddressMode::Ipv4 => Domain::IPV4,
        AddressMode::Ipv6LinkLocal => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr: SocketAddr = match binding.mode {
        AddressMode::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), bind_port),
        AddressMode::Ipv6LinkLocal => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), bind_port),
    };
    socket.bind(&bind_addr.into())?;

    match binding.mode {
        AddressMode::Ipv4 => {
            socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
            if let IpAddr::V4(v4) = binding.address {
                let _ = socket.set_multicast_if_v4(&v4);
            }
        }
        AddressMode::Ipv6LinkLocal => {
            socket.set_multicast_hops_v6(MULTICAST_TTL)?;
            if let Some(index) = interface_index(&binding.interface_name) {
                let _ = socket.set_multicast_if_v6(index);
            }
        }
    }

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket)?;
    Ok(tokio_socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::AddressMode;
    use std::sync::Mutex;

    fn loopback_binding(port_role_port: u16) -> InterfaceBinding {
        let _ = port_role_port;
        InterfaceBinding {
            interface_name: "lo".into(),
            address: "127.0.0.1".parse().unwrap(),
            mode: AddressMode::Ipv4,
            prefix_len: 8,
        }
    }

    struct RecordingReceiver {
        received: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl RecordingReceiver {
        fn new() -> Arc<Self> {
            Arc::new(RecordingReceiver {
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl Receiver for RecordingReceiver {
        fn on_receive(&self, source: SocketAddr, data: &[u8]) {
            self.received.lock().unwrap().push((source, data.to_vec()));
        }
    }

    #[tokio::test]
    async fn open_start_stop_close_never_invokes_receiver() {
        let receiver = RecordingReceiver::new();
        let executors = Arc::new(Executors::new());
        let mut server = DatagramServer::new(loopback_binding(0), 0, receiver.clone(), executors);

        server.open().await.unwrap();
        server.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop().await;
        server.close().await;

        assert!(!server.is_open());
        assert!(receiver.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_without_open_is_invalid_state() {
        let receiver = RecordingReceiver::new();
        let executors = Arc::new(Executors::new());
        let mut server = DatagramServer::new(loopback_binding(0), 0, receiver, executors);

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn reopen_while_open_is_idempotent() {
        let receiver = RecordingReceiver::new();
        let executors = Arc::new(Executors::new());
        let mut server = DatagramServer::new(loopback_binding(0), 0, receiver, executors);

        server.open().await.unwrap();
        server.open().await.unwrap();
        assert!(server.is_open());
        server.close().await;
    }

    #[tokio::test]
    async fn send_before_open_is_a_noop() {
        let receiver = RecordingReceiver::new();
        let executors = Arc::new(Executors::new());
        let server = DatagramServer::new(loopback_binding(0), 0, receiver, executors);

        // No socket, no task: send must not panic and must not transmit.
        server.send(b"M-SEARCH".to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn send_before_ready_drops_silently() {
        let receiver = RecordingReceiver::new();
        let executors = Arc::new(Executors::new());
        let mut server = DatagramServer::new(loopback_binding(0), 0, receiver, executors);

        server.open().await.unwrap();
        server.start().await.unwrap();
        // Immediately send; readiness is nearly instantaneous for bind_port=0
        // but the call must never panic even if the race goes the other way.
        server.send(b"M-SEARCH".to_vec());
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.close().await;
    }
}
