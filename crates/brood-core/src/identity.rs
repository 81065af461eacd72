//! B-ary helper numbering and spawn budget allocation
//!
//! Identities are a pure function of `(parent, sibling_index)`:
//! the k-th child of helper `i` is `i * B + 1 + k`, where `B` is the
//! numbering base of the director tree. The base is fixed for the whole
//! tree and bounds every helper's breadth, which keeps the mapping
//! injective without any shared counter.
//!
//! ```text
//!            0
//!      /     |     \          B = 3
//!     1      2      3
//!   / | \  / | \  / | \
//!  4  5 6 7  8 9 10 11 12
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{BroodError, Result};
use crate::types::{HelperId, SpawnBudget, DEFAULT_BREADTH, DIRECTOR};

/// Numbering scheme for one director tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Numbering {
    base: u32,
}

impl Numbering {
    /// Create a numbering with the given base (the tree's maximum breadth)
    pub fn new(base: u32) -> Result<Self> {
        if base == 0 {
            return Err(BroodError::InvalidBudget(
                "numbering base must be at least 1".to_string(),
            ));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Identity of the `index`-th child of `parent` (0-indexed)
    pub fn nth_child(&self, parent: HelperId, index: u32) -> Result<HelperId> {
        if index >= self.base {
            return Err(BroodError::TooManySiblings {
                parent,
                index,
                breadth: self.base,
            });
        }
        parent
            .checked_mul(u64::from(self.base))
            .and_then(|n| n.checked_add(1 + u64::from(index)))
            .ok_or(BroodError::IdentityOverflow(parent))
    }

    /// Inclusive range of identities reserved for `parent`'s children
    pub fn children_range(&self, parent: HelperId) -> Result<(HelperId, HelperId)> {
        let first = self.nth_child(parent, 0)?;
        let last = self.nth_child(parent, self.base - 1)?;
        Ok((first, last))
    }

    /// Parent of `id`, or `None` for the director
    pub fn parent_of(&self, id: HelperId) -> Option<HelperId> {
        if id == DIRECTOR {
            return None;
        }
        Some((id - 1) / u64::from(self.base))
    }

    /// 0-based position of `id` among its parent's children
    pub fn sibling_index_of(&self, id: HelperId) -> u32 {
        if id == DIRECTOR {
            return 0;
        }
        // Always < base, so the cast is lossless
        ((id - 1) % u64::from(self.base)) as u32
    }

    /// Depth of `id` in the tree (director = 0)
    pub fn depth_of(&self, id: HelperId) -> u32 {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            current = parent;
            depth += 1;
        }
        depth
    }

    /// True if `ancestor` lies strictly above `id`
    pub fn is_ancestor_of(&self, ancestor: HelperId, id: HelperId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            if parent == ancestor {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Allocate a child identity and its budget.
    ///
    /// `requested_breadth` defaults to the parent's breadth and may not
    /// exceed the numbering base. `requested_depth` defaults to
    /// `parent.depth - 1` and may not exceed it.
    pub fn allocate_child(
        &self,
        parent: HelperId,
        sibling_index: u32,
        parent_budget: SpawnBudget,
        requested_breadth: Option<u32>,
        requested_depth: Option<u32>,
    ) -> Result<(HelperId, SpawnBudget)> {
        if parent_budget.depth == 0 {
            return Err(BroodError::BudgetExhausted(parent));
        }
        if sibling_index >= parent_budget.breadth {
            return Err(BroodError::TooManySiblings {
                parent,
                index: sibling_index,
                breadth: parent_budget.breadth,
            });
        }

        let max_depth = parent_budget.depth - 1;
        let depth = requested_depth.unwrap_or(max_depth);
        if depth > max_depth {
            return Err(BroodError::InvalidBudget(format!(
                "requested depth {} exceeds {} allowed below helper {}",
                depth, max_depth, parent
            )));
        }

        let breadth = requested_breadth.unwrap_or(parent_budget.breadth.min(self.base));
        if breadth > self.base {
            return Err(BroodError::InvalidBudget(format!(
                "requested breadth {} exceeds configured maximum {}",
                breadth, self.base
            )));
        }

        let id = self.nth_child(parent, sibling_index)?;
        Ok((id, SpawnBudget::new(depth, breadth)))
    }
}

impl Default for Numbering {
    fn default() -> Self {
        Self {
            base: DEFAULT_BREADTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn numbering(base: u32) -> Numbering {
        Numbering::new(base).unwrap()
    }

    #[test]
    fn test_children_of_director() {
        let n = numbering(3);
        assert_eq!(n.nth_child(0, 0).unwrap(), 1);
        assert_eq!(n.nth_child(0, 2).unwrap(), 3);
        assert_eq!(n.children_range(1).unwrap(), (4, 6));
        assert_eq!(n.children_range(3).unwrap(), (10, 12));
    }

    #[test]
    fn test_relationships_recoverable_from_identity() {
        let n = numbering(3);
        assert_eq!(n.parent_of(0), None);
        assert_eq!(n.parent_of(1), Some(0));
        assert_eq!(n.parent_of(6), Some(1));
        assert_eq!(n.parent_of(10), Some(3));
        assert_eq!(n.sibling_index_of(8), 1);
        assert_eq!(n.depth_of(0), 0);
        assert_eq!(n.depth_of(2), 1);
        assert_eq!(n.depth_of(12), 2);
        assert!(n.is_ancestor_of(0, 12));
        assert!(n.is_ancestor_of(3, 12));
        assert!(!n.is_ancestor_of(1, 12));
        assert!(!n.is_ancestor_of(12, 12));
    }

    #[test]
    fn test_allocation_is_injective() {
        let n = numbering(4);
        let mut seen = HashSet::new();
        for parent in 0..200u64 {
            for index in 0..4 {
                let id = n.nth_child(parent, index).unwrap();
                assert!(seen.insert(id), "collision at ({}, {})", parent, index);
                assert_eq!(n.parent_of(id), Some(parent));
                assert_eq!(n.sibling_index_of(id), index);
            }
        }
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let n = numbering(4);
        let budget = SpawnBudget::new(3, 4);
        let a = n.allocate_child(5, 2, budget, None, None).unwrap();
        let b = n.allocate_child(5, 2, budget, None, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_depth_zero_always_exhausted() {
        let n = numbering(4);
        let budget = SpawnBudget::new(0, 4);
        for index in 0..4 {
            let err = n.allocate_child(7, index, budget, None, None).unwrap_err();
            assert!(matches!(err, BroodError::BudgetExhausted(7)));
        }
    }

    #[test]
    fn test_director_scenario_breadth_limit() {
        // director depth=2 breadth=3; child gets depth=1 and cannot take a 4th sibling slot
        let n = numbering(3);
        let director = SpawnBudget::new(2, 3);
        let (child, child_budget) = n.allocate_child(0, 0, director, Some(3), None).unwrap();
        assert_eq!(child, 1);
        assert_eq!(child_budget, SpawnBudget::new(1, 3));

        for index in 0..3 {
            assert!(n.allocate_child(child, index, child_budget, None, None).is_ok());
        }
        let err = n
            .allocate_child(child, 3, child_budget, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            BroodError::TooManySiblings {
                parent: 1,
                index: 3,
                breadth: 3
            }
        ));
    }

    #[test]
    fn test_requested_depth_bounded_by_parent() {
        let n = numbering(4);
        let budget = SpawnBudget::new(2, 4);
        let (_, child) = n.allocate_child(0, 0, budget, None, Some(0)).unwrap();
        assert_eq!(child.depth, 0);
        let err = n.allocate_child(0, 0, budget, None, Some(2)).unwrap_err();
        assert!(matches!(err, BroodError::InvalidBudget(_)));
    }

    #[test]
    fn test_requested_breadth_not_bounded_by_parent_breadth() {
        let n = numbering(4);
        let budget = SpawnBudget::new(2, 1);
        let (_, child) = n.allocate_child(0, 0, budget, Some(4), None).unwrap();
        assert_eq!(child.breadth, 4);
        let err = n.allocate_child(0, 0, budget, Some(5), None).unwrap_err();
        assert!(matches!(err, BroodError::InvalidBudget(_)));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let n = numbering(4);
        let err = n.nth_child(u64::MAX / 2, 0).unwrap_err();
        assert!(matches!(err, BroodError::IdentityOverflow(_)));
    }

    #[test]
    fn test_zero_base_rejected() {
        assert!(Numbering::new(0).is_err());
    }
}
