//! Voice relay
//!
//! A single UDP socket. Clients announce themselves with HELLO after
//! authenticating over the control channel; the relay keeps its own
//! address table keyed by client id and forwards every VOICE datagram,
//! unmodified, to the clients listening on the sender's frequency.
//!
//! All per-datagram failures are local: log and drop. The relay only
//! stops on a stop signal or a failed bind.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vcs_protocol::{PacketType, VoicePacket, BUFFER_SIZE};
use vcs_state::{AdminState, BannedState, Registry, Service, SettingsState};

use crate::metrics::METRICS;

/// How often idle bindings are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A binding is dropped after this much silence.
const BINDING_MAX_IDLE: Duration = Duration::from_secs(60);

/// Payloads at or below this size are discarded as junk.
const MIN_VOICE_PAYLOAD: usize = 5;

/// One voice client's UDP endpoint.
#[derive(Debug, Clone)]
struct UdpBinding {
    addr: SocketAddr,
    last_seen: Instant,
}

/// The relay. Shared as `Arc<VoiceServer>` between the receive loop, the
/// per-datagram tasks and the sweep task.
pub struct VoiceServer {
    registry: Arc<Registry>,
    settings: Arc<SettingsState>,
    banned: Arc<BannedState>,
    admin: Arc<AdminState>,
    bindings: DashMap<Uuid, UdpBinding>,
    local_addr: std::sync::OnceLock<SocketAddr>,
}

impl VoiceServer {
    pub fn new(
        registry: Arc<Registry>,
        settings: Arc<SettingsState>,
        banned: Arc<BannedState>,
        admin: Arc<AdminState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            settings,
            banned,
            admin,
            bindings: DashMap::new(),
            local_addr: std::sync::OnceLock::new(),
        })
    }

    /// The address the relay actually bound, once running. Useful when
    /// the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind and serve until the stop signal fires. Returns an error only
    /// when the socket cannot be bound.
    pub async fn run(
        self: Arc<Self>,
        bind: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let socket = match UdpSocket::bind(bind).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.admin.set_error(Service::Voice, e.to_string());
                return Err(e).context(format!("failed to bind voice socket on {bind}"));
            }
        };

        if let Ok(addr) = socket.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        self.admin.set_running(Service::Voice, true);
        info!(address = %bind, "voice server started");

        let sweeper = Arc::clone(&self);
        let mut sweep_stop = stop.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sweep_stop.changed() => break,
                    _ = interval.tick() => {
                        sweeper.sweep_bindings(BINDING_MAX_IDLE);
                    }
                }
            }
        });

        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("stopping voice server");
                    break;
                }
                result = socket.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            // Transient recv errors (e.g. ICMP unreachable
                            // surfacing on some platforms) do not stop the
                            // relay.
                            error!(error = %e, "error reading udp socket");
                            continue;
                        }
                    };
                    METRICS.datagrams_received.inc();

                    if self.banned.is_ip_banned(addr.ip()) {
                        warn!(ip = %addr.ip(), "banned client attempted voice contact");
                        continue;
                    }

                    let data = Bytes::copy_from_slice(&buf[..len]);
                    let server = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        server.handle_datagram(socket, data, addr).await;
                    });
                }
            }
        }

        sweep_handle.abort();
        self.bindings.clear();
        self.admin.set_running(Service::Voice, false);
        info!("voice server stopped");
        Ok(())
    }

    async fn handle_datagram(&self, socket: Arc<UdpSocket>, data: Bytes, addr: SocketAddr) {
        let packet = match VoicePacket::parse(&data) {
            Ok(packet) => packet,
            Err(e) => {
                METRICS.parse_errors.inc();
                debug!(from = %addr, error = %e, "dropping malformed voice packet");
                return;
            }
        };

        match packet.packet_type {
            PacketType::Hello => self.handle_hello(&socket, &packet, addr).await,
            PacketType::Keepalive => self.handle_keepalive(&socket, &packet, addr).await,
            PacketType::Bye => self.handle_bye(&packet),
            PacketType::Voice => self.handle_voice(socket, &packet, data).await,
            other => {
                debug!(packet_type = %other, from = %addr, "dropping unexpected packet type");
            }
        }
    }

    async fn handle_hello(&self, socket: &UdpSocket, packet: &VoicePacket, addr: SocketAddr) {
        let sender = packet.sender_id;
        if !self.registry.contains(sender) {
            warn!(sender_id = %sender, "hello from unknown client");
            return;
        }

        info!(sender_id = %sender, addr = %addr, "voice client connected");
        self.bindings.insert(sender, UdpBinding { addr, last_seen: Instant::now() });
        METRICS.voice_clients.set(self.bindings.len() as i64);

        let ack = VoicePacket::hello_ack(sender).serialize();
        if let Err(e) = socket.send_to(&ack, addr).await {
            warn!(to = %addr, error = %e, "failed to send hello ack");
        }
    }

    async fn handle_keepalive(&self, socket: &UdpSocket, packet: &VoicePacket, addr: SocketAddr) {
        let sender = packet.sender_id;
        match self.bindings.get_mut(&sender) {
            Some(mut binding) => binding.last_seen = Instant::now(),
            None => {
                warn!(sender_id = %sender, "keepalive from unknown client");
                return;
            }
        }

        let echo = VoicePacket::keepalive(sender).serialize();
        if let Err(e) = socket.send_to(&echo, addr).await {
            warn!(to = %addr, error = %e, "failed to send keepalive echo");
        }
    }

    fn handle_bye(&self, packet: &VoicePacket) {
        if self.bindings.remove(&packet.sender_id).is_some() {
            info!(sender_id = %packet.sender_id, "voice client disconnected");
            METRICS.voice_clients.set(self.bindings.len() as i64);
        }
    }

    async fn handle_voice(&self, socket: Arc<UdpSocket>, packet: &VoicePacket, data: Bytes) {
        let sender = packet.sender_id;

        let sender_addr = match self.bindings.get_mut(&sender) {
            Some(mut binding) => {
                binding.last_seen = Instant::now();
                binding.addr
            }
            None => {
                warn!(sender_id = %sender, "voice packet from unknown client");
                return;
            }
        };
        self.registry.touch(sender);

        if packet.payload.len() <= MIN_VOICE_PAYLOAD {
            debug!(sender_id = %sender, size = packet.payload.len(), "ignoring tiny voice payload");
            return;
        }

        // Test frequencies loop the datagram back to the sender so clients
        // can hear themselves; nobody else receives it.
        if self.settings.is_test_frequency(packet.frequency_khz) {
            if let Err(e) = socket.send_to(&data, sender_addr).await {
                warn!(to = %sender_addr, error = %e, "failed to echo test frequency packet");
            }
            return;
        }

        self.fan_out(socket, packet, data).await;
    }

    /// Forward the original datagram bytes to every eligible listener.
    async fn fan_out(&self, socket: Arc<UdpSocket>, packet: &VoicePacket, data: Bytes) {
        let sender = packet.sender_id;
        let frequency = packet.frequency_khz;
        let is_global = self.settings.is_global_frequency(frequency);

        for client in self.registry.all_clients() {
            if client.id == sender {
                continue;
            }
            if !self.registry.is_listening_on(client.id, sender, frequency, is_global) {
                continue;
            }
            let Some(addr) = self.bindings.get(&client.id).map(|b| b.addr) else {
                continue;
            };

            // Sends are independent and best-effort; one failing receiver
            // must not hold up the rest.
            let socket = Arc::clone(&socket);
            let data = data.clone();
            tokio::spawn(async move {
                match socket.send_to(&data, addr).await {
                    Ok(_) => METRICS.packets_relayed.inc(),
                    Err(e) => warn!(to = %addr, error = %e, "failed to forward voice packet"),
                }
            });
        }
    }

    /// Drop bindings that have been silent for `max_idle`. Returns how
    /// many were evicted.
    pub fn sweep_bindings(&self, max_idle: Duration) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|id, binding| {
            let keep = binding.last_seen.elapsed() < max_idle;
            if !keep {
                info!(client_id = %id, addr = %binding.addr, "removed inactive voice client");
            }
            keep
        });
        let evicted = before - self.bindings.len();
        if evicted > 0 {
            METRICS.voice_clients.set(self.bindings.len() as i64);
        }
        evicted
    }

    /// Whether a client currently has a live UDP binding.
    pub fn has_binding(&self, id: Uuid) -> bool {
        self.bindings.contains_key(&id)
    }

    /// Force a client's binding out, e.g. on kick or ban.
    pub fn drop_binding(&self, id: Uuid) {
        if self.bindings.remove(&id).is_some() {
            METRICS.voice_clients.set(self.bindings.len() as i64);
        }
    }

    /// The IP a client's voice traffic comes from, for ban entries.
    pub fn binding_ip(&self, id: Uuid) -> Option<std::net::IpAddr> {
        self.bindings.get(&id).map(|b| b.addr.ip())
    }
}
