//! Routing table id allocation.

use std::collections::BTreeSet;

use crate::error::{EgressError, Result};
use crate::policy::{Family, TableRange};

/// Hands out unused table ids from a [`TableRange`].
///
/// The set of used ids is rebuilt from the kernel every pass; nothing is
/// persisted between passes.
#[derive(Debug)]
pub struct TableAllocator {
    family: Family,
    range: TableRange,
    used: BTreeSet<u32>,
}

impl TableAllocator {
    pub fn new(family: Family, range: TableRange, used: impl IntoIterator<Item = u32>) -> Self {
        Self {
            family,
            range,
            used: used.into_iter().collect(),
        }
    }

    /// Lowest free id, marked as used.
    pub fn allocate(&mut self) -> Result<u32> {
        let table = self
            .range
            .iter()
            .find(|table| !self.used.contains(table))
            .ok_or(EgressError::ResourceExhausted {
                family: self.family,
                start: self.range.start(),
                end: self.range.end(),
            })?;
        self.used.insert(table);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_free() {
        let used = [15100, 15102, 254];
        let mut allocator = TableAllocator::new(Family::V4, TableRange::default(), used);
        assert_eq!(allocator.allocate().unwrap(), 15101);
        assert_eq!(allocator.allocate().unwrap(), 15103);
    }

    #[test]
    fn test_exhausted() {
        let range = TableRange::new(15100, 15101).unwrap();
        let mut allocator = TableAllocator::new(Family::V6, range, [15101]);
        assert_eq!(allocator.allocate().unwrap(), 15100);
        assert!(matches!(
            allocator.allocate(),
            Err(EgressError::ResourceExhausted {
                family: Family::V6,
                start: 15100,
                end: 15101,
            })
        ));
    }
}
