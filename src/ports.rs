//! Ephemeral port allocation for backend listeners.
//!
//! The allocator is an arena keyed by port number. Reservation is a single
//! atomic insert-if-absent on a `DashSet`, so two concurrent callers can never
//! be handed the same port and exhaustion is detected without blocking.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Hands out and reclaims unique ports.
pub trait PortAllocator: Send + Sync + 'static {
    /// Reserve a free port.
    ///
    /// # Errors
    ///
    /// `Error::ResourceExhausted` if every port is assigned. Never blocks.
    fn reserve(&self) -> Result<u16>;

    /// Return a port to the pool. Releasing a free port is a no-op.
    fn release(&self, port: u16);
}

/// Allocator over an inclusive port range.
///
/// A rotating cursor spreads reservations across the range so a port that
/// was just released is not handed out again while others are free.
#[derive(Debug)]
pub struct RangePortAllocator {
    first: u16,
    size: usize,
    cursor: AtomicUsize,
    reserved: DashSet<u16>,
}

impl RangePortAllocator {
    /// Create an allocator for `first..=last`.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the range is empty or starts at port 0.
    pub fn new(first: u16, last: u16) -> Result<Self> {
        if first == 0 || last < first {
            return Err(Error::Config(format!(
                "Invalid backend port range {first}..={last}"
            )));
        }
        Ok(Self {
            first,
            size: usize::from(last - first) + 1,
            cursor: AtomicUsize::new(0),
            reserved: DashSet::new(),
        })
    }

    /// Number of ports currently reserved.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.reserved.len()
    }

    /// Total number of ports in the range.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.size
    }

    fn port_at(&self, slot: usize) -> u16 {
        // slot < size <= u16::MAX - first + 1, so the sum fits.
        self.first + u16::try_from(slot % self.size).unwrap_or(0)
    }

    #[allow(clippy::cast_precision_loss)]
    fn report_usage(&self) {
        telemetry_metrics::gauge!("broker_ports_in_use").set(self.reserved.len() as f64);
    }
}

impl PortAllocator for RangePortAllocator {
    fn reserve(&self) -> Result<u16> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.size {
            let port = self.port_at(start.wrapping_add(offset));
            if self.reserved.insert(port) {
                debug!(port, "Port reserved");
                self.report_usage();
                return Ok(port);
            }
        }
        Err(Error::ResourceExhausted(format!(
            "All {} backend ports are in use",
            self.size
        )))
    }

    fn release(&self, port: u16) {
        if self.reserved.remove(&port).is_some() {
            debug!(port, "Port released");
            self.report_usage();
        } else {
            trace!(port, "Release of unreserved port ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn rejects_inverted_or_zero_range() {
        assert!(RangePortAllocator::new(2000, 1999).is_err());
        assert!(RangePortAllocator::new(0, 10).is_err());
        assert!(RangePortAllocator::new(5000, 5000).is_ok());
    }

    #[test]
    fn reserves_within_range() {
        let alloc = RangePortAllocator::new(40000, 40003).unwrap();
        for _ in 0..4 {
            let p = alloc.reserve().unwrap();
            assert!((40000..=40003).contains(&p));
        }
        assert_eq!(alloc.in_use(), 4);
    }

    #[test]
    fn exhaustion_fails_fast() {
        let alloc = RangePortAllocator::new(40000, 40001).unwrap();
        alloc.reserve().unwrap();
        alloc.reserve().unwrap();
        assert!(matches!(alloc.reserve(), Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn double_release_is_harmless() {
        // GIVEN: two reservations
        let alloc = RangePortAllocator::new(40000, 40009).unwrap();
        let a = alloc.reserve().unwrap();
        let b = alloc.reserve().unwrap();
        // WHEN: releasing `a` twice
        alloc.release(a);
        alloc.release(a);
        // THEN: `b` is still held
        assert_eq!(alloc.in_use(), 1);
        assert!(alloc.reserved.contains(&b));
    }

    #[test]
    fn released_port_can_be_reserved_again() {
        let alloc = RangePortAllocator::new(40000, 40000).unwrap();
        let p = alloc.reserve().unwrap();
        assert!(alloc.reserve().is_err());
        alloc.release(p);
        assert_eq!(alloc.reserve().unwrap(), p);
    }

    #[test]
    fn release_outside_range_is_ignored() {
        let alloc = RangePortAllocator::new(40000, 40001).unwrap();
        alloc.release(1);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn concurrent_reservations_are_unique() {
        // GIVEN: exactly as many ports as callers
        let alloc = Arc::new(RangePortAllocator::new(41000, 41063).unwrap());
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || alloc.reserve().unwrap())
            })
            .collect();
        // THEN: every caller got a distinct port
        let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ports.len(), 64);
        assert!(alloc.reserve().is_err());
    }

    #[test]
    fn range_ending_at_u16_max_is_supported() {
        let alloc = RangePortAllocator::new(65534, 65535).unwrap();
        let a = alloc.reserve().unwrap();
        let b = alloc.reserve().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.capacity(), 2);
    }
}
