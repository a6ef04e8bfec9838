//! Argument descriptors for computational elements.
//!
//! A descriptor names one operand of a computation. Equality and hashing are
//! identity based: two descriptors that refer to the same memory allocation
//! compare equal whichever element created them, which is what the
//! dependency computation relies on.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of a managed array (or array view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(pub u64);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a managed array as seen by callers.
///
/// `id` is the array or view the caller holds; `root` is the allocation that
/// owns the memory. Views share their root's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayHandle {
    id: ArrayId,
    root: ArrayId,
}

impl ArrayHandle {
    pub(crate) fn root_array(id: ArrayId) -> Self {
        Self { id, root: id }
    }

    pub(crate) fn view(id: ArrayId, root: ArrayId) -> Self {
        Self { id, root }
    }

    /// Id of this array or view.
    pub fn id(&self) -> ArrayId {
        self.id
    }

    /// Id of the allocation owning the memory.
    pub fn root(&self) -> ArrayId {
        self.root
    }

    /// Returns true if this handle refers to a view.
    pub fn is_view(&self) -> bool {
        self.id != self.root
    }
}

/// Identity of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArgumentId {
    /// Memory-backed array, identified by its root allocation.
    Array(ArrayId),
    /// By-value operand, identified by a caller-chosen tag.
    Value(u64),
}

/// Descriptor for one operand of a computational element.
#[derive(Debug, Clone, Copy)]
pub struct ArgumentDescriptor {
    identity: ArgumentId,
    array: Option<ArrayId>,
    is_const: bool,
}

impl ArgumentDescriptor {
    /// Describe an array operand.
    pub fn array(handle: ArrayHandle, is_const: bool) -> Self {
        Self {
            identity: ArgumentId::Array(handle.root()),
            array: Some(handle.id()),
            is_const,
        }
    }

    /// Describe a read-only array operand.
    pub fn const_array(handle: ArrayHandle) -> Self {
        Self::array(handle, true)
    }

    /// Describe a read-write array operand.
    pub fn mut_array(handle: ArrayHandle) -> Self {
        Self::array(handle, false)
    }

    /// Describe a by-value operand.
    pub fn scalar(tag: u64) -> Self {
        Self {
            identity: ArgumentId::Value(tag),
            array: None,
            is_const: true,
        }
    }

    /// Identity used for equality.
    pub fn identity(&self) -> ArgumentId {
        self.identity
    }

    /// The array or view this operand refers to, if memory-backed.
    pub fn array_id(&self) -> Option<ArrayId> {
        self.array
    }

    /// Root allocation of the operand, if memory-backed.
    pub fn root_array(&self) -> Option<ArrayId> {
        match self.identity {
            ArgumentId::Array(root) => Some(root),
            ArgumentId::Value(_) => None,
        }
    }

    /// Whether the operand is memory-backed.
    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    /// Whether the operand is read-only.
    pub fn is_const(&self) -> bool {
        self.is_const
    }
}

impl PartialEq for ArgumentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for ArgumentDescriptor {}

impl Hash for ArgumentDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl fmt::Display for ArgumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = if self.is_const { "const " } else { "" };
        match (self.identity, self.array) {
            (ArgumentId::Array(root), Some(id)) if root != id => {
                write!(f, "{}array {} (view of {})", access, id, root)
            }
            (ArgumentId::Array(root), _) => write!(f, "{}array {}", access, root),
            (ArgumentId::Value(tag), _) => write!(f, "value #{}", tag),
        }
    }
}
