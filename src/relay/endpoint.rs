//! Internal endpoints feeding the compositor inputs
//!
//! Each endpoint is a local UDP socket bound once at startup. Endpoint `i`
//! is handed to compositor input `i`, which reads from it; the relay
//! forwards a client's datagrams to the endpoint given on admission.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::AsFd;

use tracing::info;

use super::compositor::Compositor;
use super::identity::{EndpointIndex, MAX_CLIENTS};
use crate::error::{RelayError, Result};
use crate::utils::bind_udp_socket;

/// The fixed set of bound internal endpoint sockets
#[derive(Debug)]
pub struct InternalEndpoints {
    sockets: Vec<UdpSocket>,
    addrs: Vec<SocketAddr>,
}

impl InternalEndpoints {
    /// Bind [`MAX_CLIENTS`] sockets on ephemeral ports of `ip`
    pub fn bind(ip: IpAddr) -> Result<Self> {
        let mut sockets = Vec::with_capacity(MAX_CLIENTS);
        let mut addrs = Vec::with_capacity(MAX_CLIENTS);

        for _ in 0..MAX_CLIENTS {
            let socket = bind_udp_socket(SocketAddr::new(ip, 0))?;
            addrs.push(socket.local_addr()?);
            sockets.push(socket);
        }

        Ok(Self { sockets, addrs })
    }

    /// Hand each endpoint socket to the compositor input it feeds
    pub fn attach(&self, compositor: &mut dyn Compositor) {
        for (i, (socket, addr)) in self.sockets.iter().zip(&self.addrs).enumerate() {
            compositor.attach_input(EndpointIndex(i), *addr, socket.as_fd());
            info!("Internal endpoint {} bound on {}", EndpointIndex(i), addr);
        }
    }

    pub fn addr(&self, index: EndpointIndex) -> Option<SocketAddr> {
        self.addrs.get(index.0).copied()
    }

    pub fn socket(&self, index: EndpointIndex) -> Option<&UdpSocket> {
        self.sockets.get(index.0)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Free list of endpoint indices
///
/// A stack: the most recently released endpoint is handed out next.
/// Initially yields 0, 1, 2, 3 in that order.
#[derive(Debug, Clone)]
pub struct EndpointPool {
    free: Vec<EndpointIndex>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            free: (0..MAX_CLIENTS).rev().map(EndpointIndex).collect(),
        }
    }

    /// Take a free endpoint, or `None` when all are assigned
    pub fn acquire(&mut self) -> Option<EndpointIndex> {
        self.free.pop()
    }

    /// Return an endpoint to the free list
    pub fn release(&mut self, index: EndpointIndex) -> Result<()> {
        if index.0 >= MAX_CLIENTS || self.free.contains(&index) {
            return Err(RelayError::EndpointAlreadyFree(index.0));
        }
        self.free.push(index);
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

    use crate::relay::compositor::{GridPoint, LayoutCompositor};

    /// Records which descriptor each input was attached to
    #[derive(Default)]
    struct FdRecorder {
        attached: Vec<(EndpointIndex, RawFd)>,
    }

    impl Compositor for FdRecorder {
        fn attach_input(
            &mut self,
            input: EndpointIndex,
            _addr: SocketAddr,
            socket: BorrowedFd<'_>,
        ) {
            self.attached.push((input, socket.as_raw_fd()));
        }

        fn set_output_port(&mut self, _port: u16) {}

        fn set_position(&mut self, _input: EndpointIndex, _point: GridPoint) {}

        fn set_alpha(&mut self, _input: EndpointIndex, _alpha: f64) {}
    }

    #[test]
    fn test_pool_acquisition_order() {
        let mut pool = EndpointPool::new();
        let taken: Vec<usize> = std::iter::from_fn(|| pool.acquire()).map(|e| e.0).collect();
        assert_eq!(taken, vec![0, 1, 2, 3]);
        assert_eq!(pool.available(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_pool_reuses_last_released() {
        let mut pool = EndpointPool::new();
        for _ in 0..MAX_CLIENTS {
            pool.acquire();
        }
        pool.release(EndpointIndex(2)).unwrap();
        pool.release(EndpointIndex(0)).unwrap();
        assert_eq!(pool.acquire(), Some(EndpointIndex(0)));
        assert_eq!(pool.acquire(), Some(EndpointIndex(2)));
    }

    #[test]
    fn test_pool_rejects_double_release() {
        let mut pool = EndpointPool::new();
        let endpoint = pool.acquire().unwrap();
        pool.release(endpoint).unwrap();
        assert!(matches!(
            pool.release(endpoint),
            Err(RelayError::EndpointAlreadyFree(0))
        ));
        assert!(pool.release(EndpointIndex(MAX_CLIENTS)).is_err());
        assert_eq!(pool.available(), MAX_CLIENTS);
    }

    #[test]
    fn test_bind_internal_endpoints() {
        let endpoints = InternalEndpoints::bind("127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(endpoints.len(), MAX_CLIENTS);

        let mut ports: Vec<u16> = (0..MAX_CLIENTS)
            .map(|i| endpoints.addr(EndpointIndex(i)).unwrap().port())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), MAX_CLIENTS);
        assert!(endpoints.addr(EndpointIndex(MAX_CLIENTS)).is_none());

        let mut compositor = LayoutCompositor::new();
        endpoints.attach(&mut compositor);
        assert_eq!(
            compositor.layout(EndpointIndex(3)).unwrap().addr,
            endpoints.addr(EndpointIndex(3))
        );
    }

    #[test]
    fn test_attach_hands_over_bound_sockets() {
        let endpoints = InternalEndpoints::bind("127.0.0.1".parse().unwrap()).unwrap();
        let mut recorder = FdRecorder::default();
        endpoints.attach(&mut recorder);

        assert_eq!(recorder.attached.len(), MAX_CLIENTS);
        for (input, fd) in recorder.attached {
            assert_eq!(fd, endpoints.socket(input).unwrap().as_raw_fd());
        }
    }
}
