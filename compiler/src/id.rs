// id.rs — Stable identifiers for graph, type, block and function entities
//
// Every IR entity is addressed by a dense integer index into the arena
// that owns it. Indices are never reused within one arena, so an id that
// is stored in a use-list, a GVN key or a schedule always names the same
// entity (possibly dead).

use std::fmt;

/// Index of a node in a [`crate::graph::Graph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Index of an interned type in a [`crate::types::TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Index of a basic block produced by global code motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of a function inside a [`crate::graph::Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

macro_rules! index_impls {
    ($($ty:ident => $prefix:literal),* $(,)?) => {$(
        impl $ty {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    )*};
}

index_impls! {
    NodeId => "n",
    TypeId => "t",
    BlockId => "b",
    FuncId => "f",
}

/// Allocator for function and block ids. Produces monotonically increasing
/// ids in allocation order, ensuring deterministic assignment.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_func: u32,
    next_block: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_func(&mut self) -> FuncId {
        let id = FuncId(self.next_func);
        self.next_func += 1;
        id
    }

    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_func(), FuncId(0));
        assert_eq!(ids.alloc_func(), FuncId(1));
        assert_eq!(ids.alloc_block(), BlockId(0));
        assert_eq!(ids.alloc_block(), BlockId(1));
    }

    #[test]
    fn display_uses_prefixes() {
        assert_eq!(NodeId(12).to_string(), "n12");
        assert_eq!(BlockId(3).to_string(), "b3");
        assert_eq!(FuncId(0).to_string(), "f0");
        assert_eq!(TypeId(7).to_string(), "t7");
    }
}
