// Public port allocation
// One allocator per kind (TCP, UDP) over the configured range. The
// allocator has its own lock and never touches the registry.

use fxtunnel_config::PortRange;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Allocation failures
#[derive(Debug, PartialEq, Eq)]
pub enum PortError {
    /// The requested port is outside the configured range
    OutOfRange(u16),
    /// The requested port is already bound
    Taken(u16),
    /// No ports left in the range
    Exhausted,
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::OutOfRange(p) => write!(f, "port {} is outside the configured range", p),
            PortError::Taken(p) => write!(f, "port {} is already in use", p),
            PortError::Exhausted => write!(f, "no free ports in the configured range"),
        }
    }
}

/// Free-set port allocator over an inclusive range
pub struct PortAllocator {
    range: PortRange,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> PortAllocator {
        let free: BTreeSet<u16> = (range.min..=range.max).collect();
        PortAllocator { range, free: Mutex::new(free) }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Take a specific port. Fails if it is outside the range or held.
    pub fn allocate_exact(&self, port: u16) -> Result<u16, PortError> {
        if !self.range.contains(port) {
            return Err(PortError::OutOfRange(port));
        }
        let mut free = self.free.lock().unwrap();
        if free.remove(&port) {
            Ok(port)
        } else {
            Err(PortError::Taken(port))
        }
    }

    /// Take the lowest free port
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut free = self.free.lock().unwrap();
        match free.iter().next().copied() {
            Some(port) => {
                free.remove(&port);
                Ok(port)
            }
            None => Err(PortError::Exhausted),
        }
    }

    /// Return a port to the free set
    pub fn release(&self, port: u16) {
        if self.range.contains(port) {
            self.free.lock().unwrap().insert(port);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_range() -> PortAllocator {
        PortAllocator::new(PortRange { min: 15_000, max: 15_003 })
    }

    #[test]
    fn test_exact_allocation_and_release() {
        let alloc = small_range();
        assert_eq!(alloc.allocate_exact(15_001), Ok(15_001));
        assert_eq!(alloc.allocate_exact(15_001), Err(PortError::Taken(15_001)));
        alloc.release(15_001);
        assert_eq!(alloc.allocate_exact(15_001), Ok(15_001));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let alloc = small_range();
        assert_eq!(alloc.allocate_exact(80), Err(PortError::OutOfRange(80)));
        assert_eq!(alloc.allocate_exact(15_004), Err(PortError::OutOfRange(15_004)));
    }

    #[test]
    fn test_auto_allocation_exhausts() {
        let alloc = small_range();
        let mut taken = Vec::new();
        for _ in 0..4 {
            taken.push(alloc.allocate().unwrap());
        }
        assert_eq!(alloc.allocate(), Err(PortError::Exhausted));

        // Released ports become allocatable again
        alloc.release(taken[2]);
        assert_eq!(alloc.allocate(), Ok(taken[2]));
    }

    #[test]
    fn test_release_outside_range_is_ignored() {
        let alloc = small_range();
        alloc.release(9_999);
        assert_eq!(alloc.free_count(), 4);
    }
}
