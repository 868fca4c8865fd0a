//! Port allocation for render workers.
//!
//! Availability is checked by binding a listener on the loopback interface and
//! dropping it straight away. Scans are ascending and deterministic.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

/// Errors from explicit port checks.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Port {port} is already in use")]
    InUse { port: u16 },
}

/// Finds free ports in the worker range.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    bind_addr: Ipv4Addr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub const fn new() -> Self {
        Self {
            bind_addr: Ipv4Addr::LOCALHOST,
        }
    }

    /// Whether a listener can currently be bound to `port`.
    pub fn is_available(&self, port: u16) -> bool {
        match TcpListener::bind((self.bind_addr, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!(port, error = %e, "Port bind failed");
                false
            }
        }
    }

    /// Like [`is_available`](Self::is_available) but reports the busy port.
    pub fn check(&self, port: u16) -> Result<u16, PortError> {
        if self.is_available(port) {
            Ok(port)
        } else {
            Err(PortError::InUse { port })
        }
    }

    /// First available port in `start..=end`, or `None` if all are busy.
    pub fn find_available(&self, start: u16, end: u16) -> Option<u16> {
        self.find_available_excluding(start, end, &[])
    }

    /// First available port in `start..=end` that is not in `claimed`.
    ///
    /// `claimed` holds ports owned by running records: a worker may not have
    /// bound its port yet, so a bind alone cannot see it.
    pub fn find_available_excluding(&self, start: u16, end: u16, claimed: &[u16]) -> Option<u16> {
        (start..=end).find(|port| !claimed.contains(port) && self.is_available(*port))
    }

    /// Number of ports in `start..=end` that could be handed out right now.
    pub fn count_available(&self, start: u16, end: u16, claimed: &[u16]) -> usize {
        (start..=end)
            .filter(|port| !claimed.contains(port) && self.is_available(*port))
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Bind an OS-chosen port and hand back both the listener and its number.
    fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn bound_port_is_unavailable() {
        let allocator = PortAllocator::new();
        let (listener, port) = occupied_port();

        assert!(!allocator.is_available(port));
        assert!(matches!(allocator.check(port), Err(PortError::InUse { port: p }) if p == port));

        drop(listener);
        assert!(allocator.is_available(port));
        assert_eq!(allocator.check(port).unwrap(), port);
    }

    #[test]
    fn single_port_range_exhausts() {
        let allocator = PortAllocator::new();
        let (listener, port) = occupied_port();

        assert_eq!(allocator.find_available(port, port), None);
        assert_eq!(allocator.count_available(port, port, &[]), 0);

        drop(listener);
        assert_eq!(allocator.find_available(port, port), Some(port));
    }

    #[test]
    fn claimed_ports_are_skipped_in_order() {
        let allocator = PortAllocator::new();
        let start = 23_411;
        let end = 23_414;

        let first = allocator.find_available(start, end).unwrap();
        let next = allocator
            .find_available_excluding(start, end, &[first])
            .unwrap();

        assert!(next > first);
        assert_eq!(
            allocator.count_available(start, end, &[first]) + 1,
            allocator.count_available(start, end, &[])
        );
    }

    #[test]
    fn everything_claimed_yields_none() {
        let allocator = PortAllocator::new();
        assert_eq!(
            allocator.find_available_excluding(23_420, 23_421, &[23_420, 23_421]),
            None
        );
    }
}
