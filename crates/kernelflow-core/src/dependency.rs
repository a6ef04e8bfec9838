//! Dependency computation between computational elements.
//!
//! Every element keeps an *active argument set*: the array operands that can
//! still order it before a later element. When a new element arrives, each
//! live element compares its active set against the newcomer's. Shared
//! operands become ordering edges and are removed from the older element's
//! active set, since the newcomer now carries the ordering for any later
//! access through its own active set.
//!
//! Two strategies are available:
//!
//! - [`DefaultDependencyComputation`]: any shared operand is a dependency.
//! - [`WithConstDependencyComputation`]: operands that are read-only in both
//!   elements never conflict. A write read by the newcomer stays active so
//!   that every later reader is also ordered after it.

use std::fmt;

use crate::argument::{ArgumentDescriptor, ArgumentId};
use crate::config::DependencyPolicy;

/// Active argument set of one element.
///
/// Kept sorted by identity and free of duplicates so that lookups are
/// logarithmic and results do not depend on argument order.
#[derive(Debug, Clone, Default)]
pub struct ActiveArgumentSet {
    arguments: Vec<ArgumentDescriptor>,
}

impl ActiveArgumentSet {
    /// Build the initial set from an element's argument list.
    ///
    /// Only array operands are kept. An array passed several times is kept
    /// once, and it is const only if every occurrence is const.
    pub fn from_arguments(arguments: &[ArgumentDescriptor]) -> Self {
        let mut set = Self {
            arguments: Vec::with_capacity(arguments.len()),
        };
        set.merge(arguments);
        set
    }

    /// Insert operands, keeping the set sorted and the mutable occurrence.
    fn merge(&mut self, arguments: &[ArgumentDescriptor]) {
        for arg in arguments.iter().filter(|a| a.is_array()) {
            match self
                .arguments
                .binary_search_by(|entry| entry.identity().cmp(&arg.identity()))
            {
                Ok(pos) => {
                    if !arg.is_const() {
                        self.arguments[pos] = *arg;
                    }
                }
                Err(pos) => self.arguments.insert(pos, *arg),
            }
        }
    }

    /// Look up the active operand with the given identity.
    pub fn get(&self, identity: ArgumentId) -> Option<&ArgumentDescriptor> {
        self.arguments
            .binary_search_by(|entry| entry.identity().cmp(&identity))
            .ok()
            .map(|pos| &self.arguments[pos])
    }

    /// Whether an operand with the same identity is still active.
    pub fn contains(&self, arg: &ArgumentDescriptor) -> bool {
        self.get(arg.identity()).is_some()
    }

    /// Number of active operands.
    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    /// Whether no operand is active.
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Iterate over the active operands in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &ArgumentDescriptor> {
        self.arguments.iter()
    }

    /// Split the set: operands matching `conflicts` are returned, the rest stay.
    fn consume<F>(&mut self, mut conflicts: F) -> Vec<ArgumentDescriptor>
    where
        F: FnMut(&ArgumentDescriptor) -> bool,
    {
        let (dependencies, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.arguments)
            .into_iter()
            .partition(|arg| conflicts(arg));
        self.arguments = remaining;
        dependencies
    }
}

/// Strategy computing which operands order two elements.
pub trait DependencyComputation: Send + fmt::Debug {
    /// Operands that can still create dependencies.
    fn active_arguments(&self) -> &ActiveArgumentSet;

    /// Compute the operands shared with a newer element.
    ///
    /// `other` is the newer element's active set. Operands returned here are
    /// removed from this element's active set.
    fn compute_dependencies(&mut self, other: &ActiveArgumentSet) -> Vec<ArgumentDescriptor>;

    /// Put back operands previously returned by `compute_dependencies`.
    ///
    /// Used when the newer element is withdrawn or fails before it could
    /// carry the ordering forward.
    fn restore(&mut self, arguments: &[ArgumentDescriptor]);

    /// Whether this element could still order a future element.
    fn has_possible_dependencies(&self) -> bool {
        !self.active_arguments().is_empty()
    }
}

/// Any operand shared by the two elements is a dependency.
#[derive(Debug, Clone)]
pub struct DefaultDependencyComputation {
    active: ActiveArgumentSet,
}

impl DefaultDependencyComputation {
    /// Create the strategy from an argument list.
    pub fn new(arguments: &[ArgumentDescriptor]) -> Self {
        Self {
            active: ActiveArgumentSet::from_arguments(arguments),
        }
    }
}

impl DependencyComputation for DefaultDependencyComputation {
    fn active_arguments(&self) -> &ActiveArgumentSet {
        &self.active
    }

    fn compute_dependencies(&mut self, other: &ActiveArgumentSet) -> Vec<ArgumentDescriptor> {
        self.active.consume(|arg| other.contains(arg))
    }

    fn restore(&mut self, arguments: &[ArgumentDescriptor]) {
        self.active.merge(arguments);
    }
}

/// Shared operands are dependencies unless both accesses are read-only.
#[derive(Debug, Clone)]
pub struct WithConstDependencyComputation {
    active: ActiveArgumentSet,
}

impl WithConstDependencyComputation {
    /// Create the strategy from an argument list.
    pub fn new(arguments: &[ArgumentDescriptor]) -> Self {
        Self {
            active: ActiveArgumentSet::from_arguments(arguments),
        }
    }
}

impl DependencyComputation for WithConstDependencyComputation {
    fn active_arguments(&self) -> &ActiveArgumentSet {
        &self.active
    }

    /// A write followed by a read is a dependency, but the write stays
    /// active: later readers do not conflict with the newer read and must
    /// still be ordered after the write.
    fn compute_dependencies(&mut self, other: &ActiveArgumentSet) -> Vec<ArgumentDescriptor> {
        let mut dependencies = Vec::new();
        self.active
            .arguments
            .retain(|arg| match other.get(arg.identity()) {
                Some(other_arg) if arg.is_const() && other_arg.is_const() => true,
                Some(other_arg) => {
                    dependencies.push(*arg);
                    other_arg.is_const()
                }
                None => true,
            });
        dependencies
    }

    fn restore(&mut self, arguments: &[ArgumentDescriptor]) {
        self.active.merge(arguments);
    }
}

/// Build the strategy selected by the dependency policy.
pub fn dependency_computation(
    policy: DependencyPolicy,
    arguments: &[ArgumentDescriptor],
) -> Box<dyn DependencyComputation> {
    match policy {
        DependencyPolicy::Default => Box::new(DefaultDependencyComputation::new(arguments)),
        DependencyPolicy::WithConst => Box::new(WithConstDependencyComputation::new(arguments)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::{ArrayHandle, ArrayId};

    fn array(id: u64) -> ArrayHandle {
        ArrayHandle::root_array(ArrayId(id))
    }

    fn w(id: u64) -> ArgumentDescriptor {
        ArgumentDescriptor::mut_array(array(id))
    }

    fn r(id: u64) -> ArgumentDescriptor {
        ArgumentDescriptor::const_array(array(id))
    }

    fn ids(args: &[ArgumentDescriptor]) -> Vec<ArgumentId> {
        args.iter().map(|a| a.identity()).collect()
    }

    #[test]
    fn test_empty_arguments_have_no_possible_dependencies() {
        let dep = DefaultDependencyComputation::new(&[]);
        assert!(!dep.has_possible_dependencies());

        let scalars_only = DefaultDependencyComputation::new(&[ArgumentDescriptor::scalar(1)]);
        assert!(!scalars_only.has_possible_dependencies());
    }

    #[test]
    fn test_shared_argument_is_consumed() {
        let mut k1 = DefaultDependencyComputation::new(&[w(1), w(2)]);
        let k2 = DefaultDependencyComputation::new(&[w(1)]);

        let deps = k1.compute_dependencies(k2.active_arguments());
        assert_eq!(ids(&deps), vec![ArgumentId::Array(ArrayId(1))]);
        assert_eq!(k1.active_arguments().len(), 1);
        assert!(k1.active_arguments().contains(&w(2)));

        // The consumed argument no longer orders later elements.
        let k3 = DefaultDependencyComputation::new(&[r(1)]);
        assert!(k1.compute_dependencies(k3.active_arguments()).is_empty());
    }

    #[test]
    fn test_disjoint_sets_have_no_dependencies() {
        let mut a = DefaultDependencyComputation::new(&[w(1)]);
        let b = DefaultDependencyComputation::new(&[w(2)]);
        assert!(a.compute_dependencies(b.active_arguments()).is_empty());
        assert!(a.has_possible_dependencies());
    }

    #[test]
    fn test_result_is_order_independent() {
        let mut a = DefaultDependencyComputation::new(&[w(3), w(1), w(2)]);
        let mut b = DefaultDependencyComputation::new(&[w(2), w(3), w(1)]);
        let other = DefaultDependencyComputation::new(&[w(1), w(2), w(3)]);

        let da = a.compute_dependencies(other.active_arguments());
        let db = b.compute_dependencies(other.active_arguments());
        assert_eq!(ids(&da), ids(&db));
    }

    #[test]
    fn test_default_strategy_orders_const_reads() {
        let mut a = DefaultDependencyComputation::new(&[r(1)]);
        let b = DefaultDependencyComputation::new(&[r(1)]);
        assert_eq!(a.compute_dependencies(b.active_arguments()).len(), 1);
    }

    #[test]
    fn test_const_reads_do_not_conflict() {
        let mut a = WithConstDependencyComputation::new(&[r(1)]);
        let b = WithConstDependencyComputation::new(&[r(1)]);
        assert!(a.compute_dependencies(b.active_arguments()).is_empty());
        // Still active: a later writer must be ordered after this read.
        assert!(a.has_possible_dependencies());

        let c = WithConstDependencyComputation::new(&[w(1)]);
        assert_eq!(a.compute_dependencies(c.active_arguments()).len(), 1);
        assert!(!a.has_possible_dependencies());
    }

    #[test]
    fn test_write_stays_active_for_later_readers() {
        let mut writer = WithConstDependencyComputation::new(&[w(1)]);
        let reader1 = WithConstDependencyComputation::new(&[r(1)]);
        let reader2 = WithConstDependencyComputation::new(&[r(1)]);

        assert_eq!(writer.compute_dependencies(reader1.active_arguments()).len(), 1);
        assert_eq!(writer.compute_dependencies(reader2.active_arguments()).len(), 1);

        // A later writer consumes it.
        let writer2 = WithConstDependencyComputation::new(&[w(1)]);
        assert_eq!(writer.compute_dependencies(writer2.active_arguments()).len(), 1);
        assert!(!writer.has_possible_dependencies());
    }

    #[test]
    fn test_mixed_access_keeps_mutable_occurrence() {
        // Array 1 read and written by the same element counts as a write.
        let set = ActiveArgumentSet::from_arguments(&[r(1), w(1), r(2)]);
        assert_eq!(set.len(), 2);
        assert!(!set.get(ArgumentId::Array(ArrayId(1))).unwrap().is_const());
        assert!(set.get(ArgumentId::Array(ArrayId(2))).unwrap().is_const());
    }

    #[test]
    fn test_restore_returns_consumed_arguments() {
        let mut k1 = DefaultDependencyComputation::new(&[w(1), r(2)]);
        let k2 = DefaultDependencyComputation::new(&[w(1), w(2)]);
        let deps = k1.compute_dependencies(k2.active_arguments());
        assert!(!k1.has_possible_dependencies());

        k1.restore(&deps);
        assert_eq!(k1.active_arguments().len(), 2);
        assert!(k1.active_arguments().get(ArgumentId::Array(ArrayId(2))).unwrap().is_const());
    }

    #[test]
    fn test_policy_factory() {
        let mut with_const = dependency_computation(DependencyPolicy::WithConst, &[r(1)]);
        let other = ActiveArgumentSet::from_arguments(&[r(1)]);
        assert!(with_const.compute_dependencies(&other).is_empty());

        let mut default = dependency_computation(DependencyPolicy::Default, &[r(1)]);
        assert_eq!(default.compute_dependencies(&other).len(), 1);
    }
}
