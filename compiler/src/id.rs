// id.rs - Stable identifiers for the instruction graph
//
// Instructions and computations live in module-owned arenas and are addressed
// by these IDs. IDs are allocated monotonically and never reused, so an ID
// held across a rewrite either still names the same node or names a removed
// one (which the module reports as an error), never a different node.

use std::fmt;

/// Stable identifier for an instruction in a module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

/// Stable identifier for a computation in a module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompId(pub u32);

/// Index of an instruction inside a detached (not yet installed) computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub usize);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

impl fmt::Display for CompId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation order, ensuring deterministic assignment.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_instr: u32,
    next_comp: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_instr(&mut self) -> InstrId {
        let id = InstrId(self.next_instr);
        self.next_instr += 1;
        id
    }

    pub fn alloc_comp(&mut self) -> CompId {
        let id = CompId(self.next_comp);
        self.next_comp += 1;
        id
    }
}
