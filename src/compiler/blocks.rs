//! Compile-time block stack and exception-handler bookkeeping.
//!
//! The block stack mirrors the interpreter's frame block stack, but only
//! at compile time: blocks are pushed when emission enters a loop or a
//! protected region and popped as it leaves. Popping a try block
//! transforms it into its handler block, which `POP_EXCEPT` later retires.
//!
//! Handlers form a tree rooted at the function-level handler (whose
//! "body" is the epilogue's null return). Each handler owns a
//! raise-and-free label chain, one label per count of spilled object
//! entries, emitted as a fall-through chain of decrefs ahead of the
//! handler's exception trampoline.

use crate::ilgen::{Label, MachineType};

/// What one shadow-stack entry holds at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// A refcount-bearing object pointer.
    Object,
    /// An unboxed machine value of the given type.
    Value(MachineType),
}

/// A lexical protected region on the compile-time block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Loop,
    /// A try body guarded by the handler with this id.
    Try { handler: usize },
    /// The handler body a popped try block turned into.
    Handler { handler: usize },
}

/// One entry of the compile-time block stack.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub kind: BlockKind,
    /// Offset execution resumes at once the block is left.
    pub end_offset: usize,
    /// Loop-head offset `CONTINUE_LOOP` returns to (loops only).
    pub continue_offset: usize,
    /// Shadow-stack depth when the block was entered.
    pub entry_depth: usize,
}

/// One exception handler and its raise-and-free chain.
#[derive(Debug)]
pub struct ExceptionHandler {
    pub parent: Option<usize>,
    /// Shadow depth at try entry; raising frees everything above it.
    pub base_depth: usize,
    /// Shadow kinds below the handler's triple, fixed at try entry.
    pub base_kinds: Vec<StackKind>,
    /// First opcode of the handler body; `None` means the function-level
    /// handler whose body is the epilogue's null return.
    pub body_pc: Option<usize>,
    /// Raise-and-free entry labels indexed by spilled-object count.
    pub raise_labels: Vec<Label>,
}

impl ExceptionHandler {
    /// The function-level handler.
    pub fn root() -> Self {
        Self {
            parent: None,
            base_depth: 0,
            base_kinds: Vec::new(),
            body_pc: None,
            raise_labels: Vec::new(),
        }
    }

    pub fn nested(
        parent: usize,
        base_kinds: Vec<StackKind>,
        body_pc: usize,
    ) -> Self {
        Self {
            parent: Some(parent),
            base_depth: base_kinds.len(),
            base_kinds,
            body_pc: Some(body_pc),
            raise_labels: Vec::new(),
        }
    }
}
