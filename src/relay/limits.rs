//! Relay resource limits.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::RelayError;

/// Bounds applied to relayed circuits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayLimits {
    /// Concurrent circuits across the whole relay.
    pub max_circuits: Option<usize>,
    /// Bytes relayed per circuit, both directions combined.
    pub max_data_per_circuit: Option<u64>,
    /// Lifetime of a single circuit.
    pub max_duration: Option<Duration>,
}

impl RelayLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }
}

/// Counts open circuits against `max_circuits`.
#[derive(Debug, Clone)]
pub(crate) struct CircuitSlots {
    active: Arc<AtomicUsize>,
    max: Option<usize>,
}

impl CircuitSlots {
    pub(crate) fn new(max: Option<usize>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Take a slot; the slot is released when the guard drops.
    pub(crate) fn acquire(&self) -> Result<CircuitSlot, RelayError> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if let Some(max) = self.max {
                if current >= max {
                    return Err(RelayError::ResourceExceeded(format!(
                        "circuit limit of {max} reached"
                    )));
                }
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(CircuitSlot {
                        active: self.active.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct CircuitSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for CircuitSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-circuit byte allowance shared by both directions.
#[derive(Debug)]
pub(crate) struct DataBudget {
    used: AtomicU64,
    max: Option<u64>,
}

impl DataBudget {
    pub(crate) fn new(max: Option<u64>) -> Self {
        Self {
            used: AtomicU64::new(0),
            max,
        }
    }

    /// Account for `bytes` about to be forwarded.
    pub(crate) fn charge(&self, bytes: u64) -> Result<(), RelayError> {
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        match self.max {
            Some(max) if used > max => Err(RelayError::ResourceExceeded(format!(
                "circuit data limit of {max} bytes reached"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unlimited() {
        assert!(RelayLimits::unlimited().is_unlimited());
        let limits = RelayLimits {
            max_circuits: Some(1),
            ..Default::default()
        };
        assert!(!limits.is_unlimited());
    }

    #[test]
    fn test_slots_release_on_drop() {
        let slots = CircuitSlots::new(Some(2));
        let a = slots.acquire().unwrap();
        let _b = slots.acquire().unwrap();
        assert!(matches!(
            slots.acquire(),
            Err(RelayError::ResourceExceeded(_))
        ));
        drop(a);
        assert_eq!(slots.active(), 1);
        assert!(slots.acquire().is_ok());
    }

    #[test]
    fn test_unbounded_slots() {
        let slots = CircuitSlots::new(None);
        let guards: Vec<_> = (0..100).map(|_| slots.acquire().unwrap()).collect();
        assert_eq!(slots.active(), 100);
        drop(guards);
        assert_eq!(slots.active(), 0);
    }

    #[test]
    fn test_data_budget() {
        let budget = DataBudget::new(Some(10));
        budget.charge(6).unwrap();
        budget.charge(4).unwrap();
        assert!(budget.charge(1).is_err());

        let unlimited = DataBudget::new(None);
        unlimited.charge(u32::MAX as u64).unwrap();
        assert_eq!(unlimited.used(), u32::MAX as u64);
    }
}
