//! Client session table
//!
//! The authoritative record of who is connected, which internal endpoint
//! each client feeds, and which grid slot it is shown in. The table owns
//! both pools so that admission and eviction always acquire and release
//! them together.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use super::compositor::Compositor;
use super::endpoint::EndpointPool;
use super::identity::{ClientAddr, EndpointIndex, SlotIndex};
use super::slots::{SlotAllocator, SlotGrid};
use crate::error::{RelayError, Result};

/// One active external client
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub addr: ClientAddr,
    pub endpoint: EndpointIndex,
    pub slot: SlotIndex,
    pub admitted_at: Instant,
    pub last_activity: Instant,
    pub datagrams_in: u64,
    pub bytes_in: u64,
}

impl ClientSession {
    fn new(addr: ClientAddr, endpoint: EndpointIndex, slot: SlotIndex, now: Instant) -> Self {
        Self {
            addr,
            endpoint,
            slot,
            admitted_at: now,
            last_activity: now,
            datagrams_in: 0,
            bytes_in: 0,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            addr: self.addr,
            endpoint: self.endpoint,
            slot: self.slot,
            idle_ms: self.idle_for(now).as_millis() as u64,
            connected_ms: now.saturating_duration_since(self.admitted_at).as_millis() as u64,
            datagrams_in: self.datagrams_in,
            bytes_in: self.bytes_in,
        }
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub addr: ClientAddr,
    pub endpoint: EndpointIndex,
    pub slot: SlotIndex,
    pub idle_ms: u64,
    pub connected_ms: u64,
    pub datagrams_in: u64,
    pub bytes_in: u64,
}

/// Outcome of a successful [`SessionTable::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The client already had a session
    Existing(EndpointIndex),
    /// A new session was created
    Admitted(EndpointIndex),
}

impl Admission {
    pub fn endpoint(&self) -> EndpointIndex {
        match self {
            Admission::Existing(e) | Admission::Admitted(e) => *e,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Active sessions keyed by client address
#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<ClientAddr, ClientSession>,
    endpoints: EndpointPool,
    slots: SlotAllocator,
}

impl SessionTable {
    pub fn new(grid: SlotGrid) -> Self {
        Self {
            sessions: BTreeMap::new(),
            endpoints: EndpointPool::new(),
            slots: SlotAllocator::new(grid),
        }
    }

    /// Look up or create the session for `addr`
    ///
    /// A new session needs both a free endpoint and a free slot. When
    /// either is exhausted nothing is recorded, so the next datagram from
    /// the same client simply tries again.
    pub fn admit(
        &mut self,
        addr: ClientAddr,
        now: Instant,
        compositor: &mut dyn Compositor,
    ) -> Result<Admission> {
        if let Some(session) = self.sessions.get(&addr) {
            return Ok(Admission::Existing(session.endpoint));
        }

        let endpoint = self
            .endpoints
            .acquire()
            .ok_or(RelayError::CapacityExhausted {
                resource: "internal endpoint",
            })?;

        let Some(slot) = self.slots.acquire(endpoint, compositor) else {
            if let Err(e) = self.endpoints.release(endpoint) {
                error!("Failed to return {} to the pool: {}", endpoint, e);
            }
            return Err(RelayError::CapacityExhausted {
                resource: "display slot",
            });
        };

        self.sessions
            .insert(addr, ClientSession::new(addr, endpoint, slot, now));
        info!("Client {} admitted on {} ({})", addr, endpoint, slot);
        Ok(Admission::Admitted(endpoint))
    }

    /// Refresh the activity time of an existing session
    pub fn touch(&mut self, addr: &ClientAddr, now: Instant) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.last_activity = now;
        }
    }

    /// Count an inbound datagram against an existing session
    pub fn record_datagram(&mut self, addr: &ClientAddr, len: usize) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.datagrams_in += 1;
            session.bytes_in += len as u64;
        }
    }

    /// Endpoint that datagrams from `addr` are forwarded to
    pub fn route_of(&self, addr: &ClientAddr) -> Option<EndpointIndex> {
        self.sessions.get(addr).map(|s| s.endpoint)
    }

    /// Evict every session idle for strictly longer than `idle_threshold`
    ///
    /// Returns the evicted addresses in address order. Their endpoints and
    /// slots are free again when this returns; run [`compact`](Self::compact)
    /// afterwards if anything was evicted.
    pub fn sweep(
        &mut self,
        now: Instant,
        idle_threshold: Duration,
        compositor: &mut dyn Compositor,
    ) -> Vec<ClientAddr> {
        let expired: Vec<ClientAddr> = self
            .sessions
            .values()
            .filter(|s| s.idle_for(now) > idle_threshold)
            .map(|s| s.addr)
            .collect();

        for addr in &expired {
            let Some(session) = self.sessions.remove(addr) else {
                continue;
            };
            if let Err(e) = self
                .slots
                .release(session.slot, session.endpoint, compositor)
            {
                error!("Failed to release {} of {}: {}", session.slot, addr, e);
            }
            if let Err(e) = self.endpoints.release(session.endpoint) {
                error!("Failed to release {} of {}: {}", session.endpoint, addr, e);
            }
            info!(
                "Client {} evicted after {:?} idle ({} datagrams, {} bytes)",
                addr,
                session.idle_for(now),
                session.datagrams_in,
                session.bytes_in
            );
        }

        expired
    }

    /// Pack active sessions into the lowest slots. Returns the number moved.
    pub fn compact(&mut self, compositor: &mut dyn Compositor) -> usize {
        self.slots.compact(
            self.sessions
                .values_mut()
                .map(|session| (session.endpoint, &mut session.slot)),
            compositor,
        )
    }

    pub fn get(&self, addr: &ClientAddr) -> Option<&ClientSession> {
        self.sessions.get(addr)
    }

    /// Sessions in address order
    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn addrs(&self) -> impl Iterator<Item = &ClientAddr> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// How many more clients can be admitted right now
    pub fn remaining_capacity(&self) -> usize {
        self.endpoints.available().min(self.slots.free_count())
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(SlotGrid::default())
    }
}
