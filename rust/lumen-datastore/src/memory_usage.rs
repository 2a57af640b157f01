//! Memory and address space reporting.

use serde::Serialize;
use std::ops::AddAssign;

/// Byte counts for a store.
///
/// `used_bytes` includes dead and held bytes; live bytes are
/// `used_bytes - dead_bytes - hold_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub allocated_bytes: usize,
    pub used_bytes: usize,
    pub dead_bytes: usize,
    pub hold_bytes: usize,
}

impl MemoryUsage {
    pub fn live_bytes(&self) -> usize {
        self.used_bytes - self.dead_bytes - self.hold_bytes
    }

    pub fn inc_allocated_bytes(&mut self, bytes: usize) {
        self.allocated_bytes += bytes;
    }

    pub fn inc_used_bytes(&mut self, bytes: usize) {
        self.used_bytes += bytes;
    }

    pub fn inc_dead_bytes(&mut self, bytes: usize) {
        self.dead_bytes += bytes;
    }

    pub fn inc_hold_bytes(&mut self, bytes: usize) {
        self.hold_bytes += bytes;
    }
}

impl AddAssign for MemoryUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.allocated_bytes += rhs.allocated_bytes;
        self.used_bytes += rhs.used_bytes;
        self.dead_bytes += rhs.dead_bytes;
        self.hold_bytes += rhs.hold_bytes;
    }
}

/// How much of a handle encoding's buffer-id space is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddressSpace {
    used: usize,
    limit: usize,
}

impl AddressSpace {
    /// # Panics
    /// Panics if `used > limit`.
    pub fn new(used: usize, limit: usize) -> Self {
        assert!(used <= limit, "address space usage {used} exceeds limit {limit}");
        Self { used, limit }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Fraction of the address space in use, in `0.0..=1.0`.
    pub fn usage(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_usage_accumulates() {
        let mut total = MemoryUsage::default();
        let mut part = MemoryUsage::default();
        part.inc_allocated_bytes(100);
        part.inc_used_bytes(60);
        part.inc_dead_bytes(10);
        part.inc_hold_bytes(5);
        total += part;
        total += part;
        assert_eq!(total.allocated_bytes, 200);
        assert_eq!(total.live_bytes(), 90);
    }

    #[test]
    fn test_address_space_usage() {
        let space = AddressSpace::new(2, 8);
        assert_eq!(space.used(), 2);
        assert_eq!(space.limit(), 8);
        assert!((space.usage() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    #[should_panic(expected = "exceeds limit")]
    fn test_address_space_over_limit_panics() {
        let _ = AddressSpace::new(9, 8);
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_string(&AddressSpace::new(1, 4)).unwrap();
        assert_eq!(json, r#"{"used":1,"limit":4}"#);
    }
}
