//! Host tunnel capability and host port allocation

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::domain::container::{PortForward, ServiceHandle, TunnelHandle};
use crate::error::{Error, Result};

#[async_trait]
pub trait HostTunnel: Send + Sync {
    /// Forward each host port to its service port
    async fn start(&self, service: &ServiceHandle, forwards: &[PortForward])
        -> Result<TunnelHandle>;

    /// Host-reachable address of a forwarded host port
    async fn external_endpoint(&self, tunnel: &TunnelHandle, host_port: u16) -> Result<String>;

    /// Address of a service port on the service network
    async fn internal_endpoint(&self, service: &ServiceHandle, port: u16) -> Result<String>;
}

/// Hands out host ports from a fixed range
///
/// Candidates start at a random offset and are tried by binding them, so
/// ports in use on the host are skipped. A port stays reserved until it is
/// released; callers release it once a tunnel is bound to it, after which
/// the bind check keeps it from being handed out again.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Allocator over the half-open range `[start, end)`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a free host port
    pub fn allocate(&self) -> Result<u16> {
        let span = self.end.saturating_sub(self.start);
        if span == 0 {
            return Err(self.exhausted());
        }

        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| Error::Internal("port allocator poisoned".to_string()))?;

        let offset = rand::thread_rng().gen_range(0..span);
        for i in 0..span {
            let port = self.start + (offset + i) % span;
            if reserved.contains(&port) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                reserved.insert(port);
                debug!("Allocated host port {}", port);
                return Ok(port);
            }
        }

        Err(self.exhausted())
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.remove(&port);
        }
    }

    fn exhausted(&self) -> Error {
        Error::PortExhausted {
            start: self.start,
            end: self.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_within_range() {
        let allocator = PortAllocator::new(42000, 42100);
        for _ in 0..10 {
            let port = allocator.allocate().unwrap();
            assert!((42000..42100).contains(&port));
        }
    }

    #[test]
    fn test_never_hands_out_same_port_twice() {
        let allocator = PortAllocator::new(42200, 42205);
        let mut seen = HashSet::new();
        while let Ok(port) = allocator.allocate() {
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert!(seen.len() <= 5);
        assert!(matches!(
            allocator.allocate(),
            Err(Error::PortExhausted { start: 42200, end: 42205 })
        ));
    }

    #[test]
    fn test_skips_ports_bound_on_host() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let allocator = PortAllocator::new(port, port + 1);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let allocator = PortAllocator::new(42300, 42301);
        let port = allocator.allocate().unwrap();
        assert!(allocator.allocate().is_err());
        allocator.release(port);
        assert_eq!(allocator.allocate().unwrap(), port);
    }

    #[test]
    fn test_empty_range() {
        let allocator = PortAllocator::new(5000, 5000);
        assert!(allocator.allocate().is_err());
    }
}
