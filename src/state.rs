//! Per-opcode interpreter state: the analyzer's stack and locals.
//!
//! A state captures what is known about the evaluation stack and every
//! local slot immediately before an opcode executes. Stacks are plain
//! vectors (nearly every instruction perturbs them); locals snapshots share
//! their spine through [`CowVec`] because most opcodes leave them alone.

use crate::cowvec::CowVec;
use crate::sources::{SourceArena, SourceId};
use crate::values::{merge_kinds, AbstractValueKind};
use crate::CompileError;

/// A stack slot: an abstract kind plus the identity of its producer.
///
/// `source` is `None` only for synthesized pushes that are never observed
/// by the instruction graph (e.g. the exception triple at handler entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueWithSource {
    pub kind: AbstractValueKind,
    pub source: Option<SourceId>,
}

impl ValueWithSource {
    pub fn new(kind: AbstractValueKind, source: SourceId) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }

    pub fn without_source(kind: AbstractValueKind) -> Self {
        Self { kind, source: None }
    }

    /// Merge two slots at a control-flow join.
    pub fn merge_with(self, other: ValueWithSource, arena: &mut SourceArena) -> ValueWithSource {
        ValueWithSource {
            kind: merge_kinds(self.kind, other.kind),
            source: arena.merge(self.source, other.source),
        }
    }
}

/// What is known about one local variable slot.
///
/// Four states fall out of the pair:
/// definitely assigned with a known kind; definitely assigned, kind
/// unknown (`Any`); assigned on some paths only (`maybe_undefined`); and
/// definitely unassigned (`Undefined` + `maybe_undefined`). The fourth
/// combination, `Undefined` kind with `maybe_undefined` cleared, would
/// mean the undefined marker leaked into a real value and is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbstractLocalInfo {
    pub value: ValueWithSource,
    pub maybe_undefined: bool,
}

impl AbstractLocalInfo {
    pub fn new(value: ValueWithSource, maybe_undefined: bool) -> Self {
        debug_assert!(
            !(value.kind == AbstractValueKind::Undefined && !maybe_undefined),
            "Undefined local marked definitely assigned"
        );
        Self {
            value,
            maybe_undefined,
        }
    }

    /// A slot that has never been written.
    pub fn undefined() -> Self {
        Self {
            value: ValueWithSource::without_source(AbstractValueKind::Undefined),
            maybe_undefined: true,
        }
    }

    pub fn merge_with(self, other: AbstractLocalInfo, arena: &mut SourceArena) -> AbstractLocalInfo {
        AbstractLocalInfo {
            value: self.value.merge_with(other.value, arena),
            maybe_undefined: self.maybe_undefined || other.maybe_undefined,
        }
    }
}

/// The analyzer's state before one opcode: evaluation stack plus locals.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterState {
    stack: Vec<ValueWithSource>,
    locals: CowVec<AbstractLocalInfo>,
}

impl InterpreterState {
    /// Fresh state with an empty stack and `local_count` unassigned locals.
    pub fn new(local_count: usize) -> Self {
        Self {
            stack: Vec::new(),
            locals: CowVec::new(local_count, AbstractLocalInfo::undefined()),
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn push(&mut self, value: ValueWithSource) {
        self.stack.push(value);
    }

    /// Pop the top of stack, marking its source escaped: the consumer is
    /// not unbox-capable, so the value needs its boxed representation.
    pub fn pop(&mut self, arena: &mut SourceArena) -> Result<ValueWithSource, CompileError> {
        let value = self.pop_no_escape()?;
        if let Some(source) = value.source {
            arena.escape(source);
        }
        Ok(value)
    }

    /// Pop without touching escape state (unbox-capable consumers).
    pub fn pop_no_escape(&mut self) -> Result<ValueWithSource, CompileError> {
        self.stack.pop().ok_or(CompileError::StackUnderflow)
    }

    /// Slot `index` counted from the bottom of the stack.
    pub fn peek(&self, index: usize) -> &ValueWithSource {
        &self.stack[index]
    }

    /// Slot counted from the top: `peek_top(0)` is TOS.
    pub fn peek_top(&self, depth: usize) -> Result<&ValueWithSource, CompileError> {
        self.stack
            .len()
            .checked_sub(1 + depth)
            .map(|i| &self.stack[i])
            .ok_or(CompileError::StackUnderflow)
    }

    pub fn stack(&self) -> &[ValueWithSource] {
        &self.stack
    }

    pub fn get_local(&self, index: usize) -> AbstractLocalInfo {
        *self.locals.get(index)
    }

    pub fn replace_local(&mut self, index: usize, info: AbstractLocalInfo) {
        self.locals.replace(index, info);
    }

    /// Merge `other` into this state. Returns whether anything changed.
    ///
    /// Stacks that disagree in depth mean the bytecode is malformed and
    /// abort the analysis.
    pub fn merge_from(
        &mut self,
        other: &InterpreterState,
        arena: &mut SourceArena,
    ) -> Result<bool, CompileError> {
        if self.stack.len() != other.stack.len() {
            return Err(CompileError::StackDepthMismatch {
                expected: self.stack.len(),
                found: other.stack.len(),
            });
        }
        let mut changed = false;
        for (slot, incoming) in self.stack.iter_mut().zip(other.stack.iter()) {
            let merged = slot.merge_with(*incoming, arena);
            if merged != *slot {
                *slot = merged;
                changed = true;
            }
        }
        for i in 0..self.locals.len() {
            let merged = self.locals.get(i).merge_with(other.get_local(i), arena);
            if merged != *self.locals.get(i) {
                self.locals.replace(i, merged);
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AbstractValueKind::*;

    fn vws(arena: &mut SourceArena, kind: AbstractValueKind, pc: usize) -> ValueWithSource {
        let source = arena.new_intermediate(pc);
        ValueWithSource::new(kind, source)
    }

    #[test]
    fn test_pop_marks_escape() {
        let mut arena = SourceArena::new();
        let mut state = InterpreterState::new(0);
        let v = vws(&mut arena, Integer, 0);
        state.push(v);
        let popped = state.pop(&mut arena).unwrap();
        assert!(arena.is_escaped(popped.source.unwrap()));
    }

    #[test]
    fn test_pop_no_escape_leaves_source() {
        let mut arena = SourceArena::new();
        let mut state = InterpreterState::new(0);
        let v = vws(&mut arena, Integer, 0);
        state.push(v);
        let popped = state.pop_no_escape().unwrap();
        assert!(!arena.is_escaped(popped.source.unwrap()));
    }

    #[test]
    fn test_pop_empty_underflows() {
        let mut arena = SourceArena::new();
        let mut state = InterpreterState::new(0);
        assert!(matches!(
            state.pop(&mut arena),
            Err(CompileError::StackUnderflow)
        ));
    }

    #[test]
    fn test_merge_depth_mismatch_is_fatal() {
        let mut arena = SourceArena::new();
        let mut a = InterpreterState::new(0);
        let b = InterpreterState::new(0);
        a.push(vws(&mut arena, Integer, 0));
        assert!(matches!(
            a.merge_from(&b, &mut arena),
            Err(CompileError::StackDepthMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_joins_kinds() {
        let mut arena = SourceArena::new();
        let mut a = InterpreterState::new(1);
        let mut b = InterpreterState::new(1);
        a.push(vws(&mut arena, Integer, 0));
        b.push(vws(&mut arena, Float, 2));
        let changed = a.merge_from(&b, &mut arena).unwrap();
        assert!(changed);
        assert_eq!(a.peek(0).kind, Any);
        // a second identical merge is a no-op
        let changed = a.merge_from(&b, &mut arena).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_local_merge_propagates_maybe_undefined() {
        let mut arena = SourceArena::new();
        let mut a = InterpreterState::new(1);
        let mut b = InterpreterState::new(1);
        let av = vws(&mut arena, Integer, 0);
        a.replace_local(0, AbstractLocalInfo::new(av, false));
        let bv = vws(&mut arena, Integer, 2);
        b.replace_local(0, AbstractLocalInfo::new(bv, true));
        a.merge_from(&b, &mut arena).unwrap();
        let merged = a.get_local(0);
        assert_eq!(merged.value.kind, Integer);
        assert!(merged.maybe_undefined);
    }

    #[test]
    fn test_undefined_is_merge_identity_for_locals() {
        let mut arena = SourceArena::new();
        let mut a = InterpreterState::new(1);
        let b = InterpreterState::new(1);
        let av = vws(&mut arena, List, 0);
        a.replace_local(0, AbstractLocalInfo::new(av, false));
        a.merge_from(&b, &mut arena).unwrap();
        let merged = a.get_local(0);
        assert_eq!(merged.value.kind, List);
        assert!(merged.maybe_undefined);
    }
}
