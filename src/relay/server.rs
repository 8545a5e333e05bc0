//! Relay loop
//!
//! A single-threaded `poll(2)` reactor over two sockets:
//!
//! - the client-facing socket, where external clients send their video and
//!   receive the composited grid back
//! - the pipeline-facing socket, where the compositor delivers its output
//!
//! Each wake handles at most one datagram per socket, client traffic first,
//! then runs the idle sweep if it is due. All session state is owned here,
//! so nothing needs locking.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::Serialize;
use tracing::{debug, info, trace};

use super::compositor::Compositor;
use super::endpoint::InternalEndpoints;
use super::identity::{ClientAddr, EndpointIndex};
use super::session::{SessionInfo, SessionTable};
use super::slots::SlotGrid;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::utils::{bind_udp_socket, LogThrottler};
use crate::warn_throttled;

/// Traffic and lifecycle counters since startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Datagrams received from clients
    pub client_datagrams: u64,
    /// Client datagrams forwarded to an internal endpoint
    pub forwarded: u64,
    /// Client datagrams dropped because no session could be created
    pub refused: u64,
    /// Datagrams received from the compositor
    pub fanout_datagrams: u64,
    /// Individual sends of compositor output to clients
    pub fanout_sends: u64,
    /// Failed sends to an endpoint or a client
    pub send_errors: u64,
    /// Failed receives on either socket
    pub recv_errors: u64,
    /// Sessions created
    pub admissions: u64,
    /// Sessions removed for being idle
    pub evictions: u64,
    /// Idle sweeps run
    pub sweeps: u64,
}

/// Serializable view of the whole relay
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub client_addr: SocketAddr,
    pub pipeline_addr: SocketAddr,
    pub sessions: Vec<SessionInfo>,
    pub stats: RelayStats,
}

pub struct RelayServer<C: Compositor> {
    client_socket: UdpSocket,
    pipeline_socket: UdpSocket,
    client_addr: SocketAddr,
    pipeline_addr: SocketAddr,
    endpoints: InternalEndpoints,
    table: SessionTable,
    compositor: C,
    buffer: Vec<u8>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    last_sweep: Instant,
    stats: RelayStats,
    throttler: LogThrottler,
}

impl<C: Compositor> RelayServer<C> {
    /// Bind every socket and wire the endpoints to the compositor
    ///
    /// Any failure here is a startup failure; nothing is retried.
    pub fn bind(config: &RelayConfig, mut compositor: C) -> Result<Self> {
        config.validate()?;
        let bind_ip = config.bind_ip()?;
        let internal_ip = config.internal_ip()?;

        let client_socket = bind_udp_socket(SocketAddr::new(bind_ip, config.client_port))?;
        let client_addr = client_socket.local_addr()?;

        let pipeline_socket = bind_udp_socket(SocketAddr::new(internal_ip, 0))?;
        let pipeline_addr = pipeline_socket.local_addr()?;

        let endpoints = InternalEndpoints::bind(internal_ip)?;
        endpoints.attach(&mut compositor);
        compositor.set_output_port(pipeline_addr.port());

        info!("Listening for clients on {}", client_addr);
        info!("Receiving compositor output on {}", pipeline_addr);

        Ok(Self {
            client_socket,
            pipeline_socket,
            client_addr,
            pipeline_addr,
            endpoints,
            table: SessionTable::new(SlotGrid::new(config.tile_width, config.tile_height)),
            compositor,
            buffer: vec![0u8; config.buffer_size],
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
            last_sweep: Instant::now(),
            stats: RelayStats::default(),
            throttler: LogThrottler::default(),
        })
    }

    /// Run until the process is terminated
    ///
    /// Only a failing `poll` call ends the loop.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Relay loop started (idle timeout {:?}, sweep every {:?})",
            self.idle_timeout, self.sweep_interval
        );
        loop {
            let wait = self.next_wait(Instant::now());
            self.poll_once(wait)?;
        }
    }

    /// One wake cycle: wait up to `max_wait`, then client datagram,
    /// compositor datagram and sweep, in that order
    pub fn poll_once(&mut self, max_wait: Duration) -> Result<()> {
        let (client_ready, pipeline_ready) = {
            let mut fds = [
                PollFd::new(self.client_socket.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.pipeline_socket.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(poll_timeout_ms(max_wait))) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            (is_readable(&fds[0]), is_readable(&fds[1]))
        };

        let now = Instant::now();
        if client_ready {
            self.handle_client_datagram(now);
        }
        if pipeline_ready {
            self.handle_pipeline_datagram();
        }
        self.maybe_sweep(now);
        Ok(())
    }

    /// Time left until the next sweep is due
    pub fn next_wait(&self, now: Instant) -> Duration {
        self.sweep_interval
            .saturating_sub(now.saturating_duration_since(self.last_sweep))
    }

    fn handle_client_datagram(&mut self, now: Instant) {
        let (len, from) = match self.client_socket.recv_from(&mut self.buffer) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.stats.recv_errors += 1;
                warn_throttled!(
                    self.throttler,
                    "recv_client",
                    "Failed to receive from client: {}",
                    e
                );
                return;
            }
        };
        let addr = ClientAddr::from(from);
        self.stats.client_datagrams += 1;

        match self.table.admit(addr, now, &mut self.compositor) {
            Ok(admission) if admission.is_new() => {
                self.stats.admissions += 1;
                // A client refused earlier is reported again if refused later
                self.throttler.clear(&refused_key(addr));
                self.log_active_clients(now);
            }
            Ok(_) => {}
            Err(e) => {
                self.stats.refused += 1;
                let key = refused_key(addr);
                warn_throttled!(
                    self.throttler,
                    &key,
                    "Dropping datagrams from {}: {}",
                    addr,
                    e
                );
                return;
            }
        }
        self.table.touch(&addr, now);

        let Some(endpoint) = self.table.route_of(&addr) else {
            return;
        };
        self.table.record_datagram(&addr, len);
        self.forward(addr, endpoint, len);
    }

    fn forward(&mut self, from: ClientAddr, endpoint: EndpointIndex, len: usize) {
        let Some(target) = self.endpoints.addr(endpoint) else {
            return;
        };
        match self.client_socket.send_to(&self.buffer[..len], target) {
            Ok(_) => {
                self.stats.forwarded += 1;
                trace!("Forwarded {} bytes from {} to {}", len, from, endpoint);
            }
            Err(e) => {
                self.stats.send_errors += 1;
                warn_throttled!(
                    self.throttler,
                    "send_endpoint",
                    "Failed to forward datagram from {} to {}: {}",
                    from,
                    endpoint,
                    e
                );
            }
        }
    }

    fn handle_pipeline_datagram(&mut self) {
        // The sender is always taken to be the compositor
        let len = match self.pipeline_socket.recv_from(&mut self.buffer) {
            Ok((len, _)) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.stats.recv_errors += 1;
                warn_throttled!(
                    self.throttler,
                    "recv_pipeline",
                    "Failed to receive from compositor: {}",
                    e
                );
                return;
            }
        };
        self.stats.fanout_datagrams += 1;

        for addr in self.table.addrs() {
            match self
                .client_socket
                .send_to(&self.buffer[..len], addr.socket_addr())
            {
                Ok(_) => self.stats.fanout_sends += 1,
                Err(e) => {
                    self.stats.send_errors += 1;
                    warn_throttled!(
                        self.throttler,
                        "send_client",
                        "Failed to send to client {}: {}",
                        addr,
                        e
                    );
                }
            }
        }
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < self.sweep_interval {
            return;
        }
        self.last_sweep = now;
        self.stats.sweeps += 1;
        self.throttler.prune(now);

        let evicted = self
            .table
            .sweep(now, self.idle_timeout, &mut self.compositor);
        if evicted.is_empty() {
            return;
        }
        self.stats.evictions += evicted.len() as u64;

        let moved = self.table.compact(&mut self.compositor);
        debug!(
            "Sweep evicted {} client(s), compaction moved {}",
            evicted.len(),
            moved
        );
        self.log_active_clients(now);
    }

    fn log_active_clients(&self, now: Instant) {
        info!("Active clients: {}", self.table.len());
        for session in self.table.iter() {
            info!(
                "  {} -> {} ({}), {} datagrams, {} bytes, idle {:?}",
                session.addr,
                session.endpoint,
                session.slot,
                session.datagrams_in,
                session.bytes_in,
                session.idle_for(now)
            );
        }
        debug!(stats = ?self.stats, "Relay counters");
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        let now = Instant::now();
        RelaySnapshot {
            client_addr: self.client_addr,
            pipeline_addr: self.pipeline_addr,
            sessions: self.table.iter().map(|s| s.info(now)).collect(),
            stats: self.stats.clone(),
        }
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn pipeline_addr(&self) -> SocketAddr {
        self.pipeline_addr
    }

    pub fn endpoint_addr(&self, index: EndpointIndex) -> Option<SocketAddr> {
        self.endpoints.addr(index)
    }

    pub fn endpoint_socket(&self, index: EndpointIndex) -> Option<&UdpSocket> {
        self.endpoints.socket(index)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }
}

/// Poll timeout in whole milliseconds, rounded up so a wait shorter than
/// one millisecond does not become a busy loop
fn poll_timeout_ms(max_wait: Duration) -> u16 {
    max_wait.as_micros().div_ceil(1000).min(u16::MAX as u128) as u16
}

fn refused_key(addr: ClientAddr) -> String {
    format!("refused:{}", addr)
}

fn is_readable(fd: &PollFd<'_>) -> bool {
    // POLLERR is included so a pending socket error is drained by recv
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
}
