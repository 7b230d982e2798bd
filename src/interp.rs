//! Abstract interpretation of bytecode.
//!
//! The abstract interpreter performs static analysis of the byte code to
//! determine what kinds are known. It walks the instruction stream updating
//! an abstract stack and locals according to the opcode being performed;
//! when it encounters a branch it merges the current state into the state
//! at the branch target, and if the merge produced a new starting state the
//! target is queued for another pass. The analysis is complete when the
//! work queue empties.
//!
//! The results, one [`InterpreterState`] per reached opcode index,
//! capturing the state *before* that opcode executes, plus a function-wide
//! return kind, feed the instruction graph and the IL driver.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::bytecode::{decode, CodeObject, Decoded, Opcode};
use crate::sources::{SourceArena, SourceId};
use crate::state::{AbstractLocalInfo, InterpreterState, ValueWithSource};
use crate::values::{merge_kinds, AbstractValue, AbstractValueKind};
use crate::CompileError;

/// Span of a lexical block recorded during preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Offset of the SETUP_* instruction that opened the block.
    pub start: usize,
    /// Offset execution resumes at once the block is left.
    pub end: usize,
}

/// What simulation of one opcode decided about control flow.
enum Flow {
    /// Fall through to the next instruction.
    Next,
    /// Unconditional transfer; the sweep ends.
    End,
}

/// The abstract interpreter and its analysis products.
pub struct AbstractInterpreter<'a> {
    code: &'a CodeObject,
    instructions: Vec<Decoded>,
    /// byte offset -> position in `instructions`
    index_map: HashMap<usize, usize>,
    arena: SourceArena,
    /// State before each reached opcode.
    states: HashMap<usize, InterpreterState>,
    /// The intermediate source produced at each opcode, if any.
    opcode_sources: HashMap<usize, SourceId>,
    /// SETUP_* end offset -> start offset.
    block_starts: HashMap<usize, usize>,
    /// BREAK_LOOP offset -> enclosing loop span.
    break_to: HashMap<usize, BlockSpan>,
    /// Every branch target; the driver allocates a label per entry.
    jumps_to: HashSet<usize>,
    return_kind: AbstractValueKind,
}

impl<'a> AbstractInterpreter<'a> {
    /// Decode and preprocess a code object. The returned interpreter has
    /// not run yet; call [`interpret`](Self::interpret).
    pub fn new(code: &'a CodeObject) -> Result<Self, CompileError> {
        let instructions = decode(&code.bytecode)?;
        if instructions.is_empty() {
            return Err(CompileError::MalformedBytecode(
                "empty bytecode".to_string(),
            ));
        }
        let index_map: HashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(pos, instr)| (instr.index, pos))
            .collect();
        let mut interp = Self {
            code,
            instructions,
            index_map,
            arena: SourceArena::new(),
            states: HashMap::new(),
            opcode_sources: HashMap::new(),
            block_starts: HashMap::new(),
            break_to: HashMap::new(),
            jumps_to: HashSet::new(),
            return_kind: AbstractValueKind::Undefined,
        };
        interp.preprocess()?;
        Ok(interp)
    }

    /// One linear scan: block spans, break targets, jump targets.
    fn preprocess(&mut self) -> Result<(), CompileError> {
        let mut open_blocks: Vec<(Opcode, BlockSpan)> = Vec::new();
        for instr in &self.instructions {
            if let Some(target) = instr.jump_target() {
                self.jumps_to.insert(target);
            }
            match instr.opcode {
                Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                    let span = BlockSpan {
                        start: instr.index,
                        end: instr.jump_target().expect("SETUP_* is a relative jump"),
                    };
                    self.block_starts.insert(span.end, span.start);
                    open_blocks.push((instr.opcode, span));
                }
                Opcode::PopBlock => {
                    open_blocks.pop().ok_or_else(|| {
                        CompileError::BadBlockNesting(format!(
                            "POP_BLOCK at {} with no open block",
                            instr.index
                        ))
                    })?;
                }
                Opcode::BreakLoop => {
                    let span = open_blocks
                        .iter()
                        .rev()
                        .find(|(op, _)| *op == Opcode::SetupLoop)
                        .map(|(_, span)| *span)
                        .ok_or_else(|| {
                            CompileError::BadBlockNesting(format!(
                                "BREAK_LOOP at {} outside any loop",
                                instr.index
                            ))
                        })?;
                    self.break_to.insert(instr.index, span);
                    self.jumps_to.insert(span.end);
                }
                _ => {}
            }
        }
        for &target in &self.jumps_to {
            if !self.index_map.contains_key(&target) {
                return Err(CompileError::MalformedBytecode(format!(
                    "branch to offset {} which is not an instruction start",
                    target
                )));
            }
        }
        Ok(())
    }

    /// State on function entry: empty stack; parameters definitely
    /// assigned with unknown kinds, every other local unassigned.
    fn initial_state(&self) -> InterpreterState {
        let mut state = InterpreterState::new(self.code.local_count());
        for i in 0..self.code.arg_count.min(self.code.local_count()) {
            state.replace_local(
                i,
                AbstractLocalInfo::new(
                    ValueWithSource::without_source(AbstractValueKind::Any),
                    false,
                ),
            );
        }
        state
    }

    /// Merge `state` into the recorded state at `index`. Returns whether
    /// the recorded state changed (or was newly created).
    fn update_start_state(
        &mut self,
        index: usize,
        state: &InterpreterState,
    ) -> Result<bool, CompileError> {
        match self.states.get_mut(&index) {
            Some(existing) => existing.merge_from(state, &mut self.arena),
            None => {
                self.states.insert(index, state.clone());
                Ok(true)
            }
        }
    }

    /// Merge into a branch target and queue it if anything changed.
    fn enqueue(
        &mut self,
        target: usize,
        state: &InterpreterState,
        queue: &mut VecDeque<usize>,
    ) -> Result<(), CompileError> {
        if !self.index_map.contains_key(&target) {
            return Err(CompileError::MalformedBytecode(format!(
                "branch to offset {} which is not an instruction start",
                target
            )));
        }
        if self.update_start_state(target, state)? {
            queue.push_back(target);
        }
        Ok(())
    }

    /// Run the fixed-point analysis.
    pub fn interpret(&mut self) -> Result<(), CompileError> {
        let mut queue: VecDeque<usize> = VecDeque::new();
        let initial = self.initial_state();
        let entry = self.instructions[0].index;
        self.states.insert(entry, initial);
        queue.push_back(entry);

        while let Some(start) = queue.pop_front() {
            let mut pos = *self
                .index_map
                .get(&start)
                .expect("queued offsets are instruction starts");
            let mut state = self.states[&start].clone();
            loop {
                let instr = self.instructions[pos];
                if instr.index != start {
                    // Entering this pc mid-sweep: merge our state in and
                    // stop if it adds nothing new.
                    if !self.update_start_state(instr.index, &state)? {
                        break;
                    }
                    state = self.states[&instr.index].clone();
                }
                match self.simulate(instr, &mut state, &mut queue)? {
                    Flow::Next => {
                        pos += 1;
                        if pos >= self.instructions.len() {
                            return Err(CompileError::MalformedBytecode(
                                "control fell off the end of the bytecode".to_string(),
                            ));
                        }
                    }
                    Flow::End => break,
                }
            }
        }
        Ok(())
    }

    /// Pop `count` operands, bottom-of-group first, recording consumption
    /// positions and (optionally) escaping each popped source.
    fn pop_operands(
        &mut self,
        state: &mut InterpreterState,
        pc: usize,
        count: usize,
        escape: bool,
    ) -> Result<Vec<ValueWithSource>, CompileError> {
        let mut operands = Vec::with_capacity(count);
        for _ in 0..count {
            let value = if escape {
                state.pop(&mut self.arena)?
            } else {
                state.pop_no_escape()?
            };
            operands.push(value);
        }
        operands.reverse();
        for (position, value) in operands.iter().enumerate() {
            if let Some(source) = value.source {
                self.arena.add_consumer(source, pc, position);
            }
        }
        Ok(operands)
    }

    /// Push the intermediate produced by the opcode at `pc`.
    fn push_intermediate(
        &mut self,
        state: &mut InterpreterState,
        pc: usize,
        kind: AbstractValueKind,
    ) {
        let source = self.arena.new_intermediate(pc);
        self.opcode_sources.insert(pc, source);
        state.push(ValueWithSource::new(kind, source));
    }

    /// The exception triple pushed on entry to a handler: traceback,
    /// value, type, with the type on top.
    fn push_exception_triple(state: &mut InterpreterState) {
        state.push(ValueWithSource::without_source(AbstractValueKind::Any));
        state.push(ValueWithSource::without_source(AbstractValueKind::Any));
        state.push(ValueWithSource::without_source(AbstractValueKind::Type));
    }

    /// Simulate one opcode against `state`, queueing branch successors.
    fn simulate(
        &mut self,
        instr: Decoded,
        state: &mut InterpreterState,
        queue: &mut VecDeque<usize>,
    ) -> Result<Flow, CompileError> {
        use Opcode::*;
        let pc = instr.index;
        let oparg = instr.oparg;
        match instr.opcode {
            Nop | ExtendedArg => {}
            PopTop => {
                self.pop_operands(state, pc, 1, true)?;
            }
            RotTwo => {
                let ops = self.pop_operands(state, pc, 2, false)?;
                state.push(ops[1]);
                state.push(ops[0]);
            }
            RotThree => {
                let ops = self.pop_operands(state, pc, 3, false)?;
                state.push(ops[2]);
                state.push(ops[0]);
                state.push(ops[1]);
            }
            DupTop => {
                let top = state.pop_no_escape()?;
                state.push(top);
                state.push(top);
            }
            UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert => {
                let escape = !instr.opcode.supports_unboxing();
                let ops = self.pop_operands(state, pc, 1, escape)?;
                let kind = AbstractValue::of(ops[0].kind).unary(instr.opcode);
                self.push_intermediate(state, pc, kind);
            }
            BinaryPower | BinaryMultiply | BinaryModulo | BinaryAdd | BinarySubtract
            | BinaryFloorDivide | BinaryTrueDivide | BinaryLshift | BinaryRshift | BinaryAnd
            | BinaryXor | BinaryOr => {
                let escape = !instr.opcode.supports_unboxing();
                let ops = self.pop_operands(state, pc, 2, escape)?;
                let kind = AbstractValue::of(ops[0].kind).binary(instr.opcode, ops[1].kind);
                self.push_intermediate(state, pc, kind);
            }
            BinarySubscr => {
                let ops = self.pop_operands(state, pc, 2, true)?;
                let kind = AbstractValue::of(ops[0].kind).subscript(ops[1].kind);
                self.push_intermediate(state, pc, kind);
            }
            StoreSubscr => {
                self.pop_operands(state, pc, 3, true)?;
            }
            CompareOp => {
                let ops = self.pop_operands(state, pc, 2, false)?;
                let kind = AbstractValue::of(ops[0].kind).compare(ops[1].kind);
                self.push_intermediate(state, pc, kind);
            }
            ContainsOp => {
                let ops = self.pop_operands(state, pc, 2, true)?;
                let kind = AbstractValue::of(ops[1].kind).contains();
                self.push_intermediate(state, pc, kind);
            }
            GetIter => {
                let ops = self.pop_operands(state, pc, 1, true)?;
                let kind = AbstractValue::of(ops[0].kind).iter();
                self.push_intermediate(state, pc, kind);
            }
            ForIter => {
                // Exhausted path: the iterator is popped and control moves
                // to the jump target.
                let mut exhausted = state.clone();
                let iterator = exhausted.pop(&mut self.arena)?;
                if let Some(source) = iterator.source {
                    self.arena.add_consumer(source, pc, 0);
                }
                let target = instr.jump_target().expect("FOR_ITER is a relative jump");
                self.enqueue(target, &exhausted, queue)?;
                // Fall-through path: the iterator yielded a value.
                let yielded = AbstractValue::of(state.peek_top(0)?.kind).iter_next();
                self.push_intermediate(state, pc, yielded);
            }
            LoadConst => {
                let constant = self.code.consts.get(oparg as usize).ok_or_else(|| {
                    CompileError::MalformedBytecode(format!(
                        "LOAD_CONST {} out of range at {}",
                        oparg, pc
                    ))
                })?;
                let source = self.arena.new_const(pc, oparg as usize);
                self.opcode_sources.insert(pc, source);
                state.push(ValueWithSource::new(constant.kind(), source));
            }
            LoadAssertionError => {
                self.push_intermediate(state, pc, AbstractValueKind::Type);
            }
            LoadFast => {
                let index = oparg as usize;
                if index >= state.local_count() {
                    return Err(CompileError::MalformedBytecode(format!(
                        "LOAD_FAST {} out of range at {}",
                        index, pc
                    )));
                }
                let local = state.get_local(index);
                let source = self.arena.new_local(pc, index);
                self.opcode_sources.insert(pc, source);
                let kind = if local.value.kind == AbstractValueKind::Undefined {
                    AbstractValueKind::Any
                } else {
                    local.value.kind
                };
                state.push(ValueWithSource::new(kind, source));
            }
            StoreFast => {
                let index = oparg as usize;
                if index >= state.local_count() {
                    return Err(CompileError::MalformedBytecode(format!(
                        "STORE_FAST {} out of range at {}",
                        index, pc
                    )));
                }
                let ops = self.pop_operands(state, pc, 1, true)?;
                state.replace_local(index, AbstractLocalInfo::new(ops[0], false));
            }
            BuildTuple | BuildList | BuildSet | BuildMap | BuildSlice => {
                let count = match instr.opcode {
                    BuildMap => 2 * oparg as usize,
                    _ => oparg as usize,
                };
                self.pop_operands(state, pc, count, true)?;
                let kind = match instr.opcode {
                    BuildTuple => AbstractValueKind::Tuple,
                    BuildList => AbstractValueKind::List,
                    BuildSet => AbstractValueKind::Set,
                    BuildMap => AbstractValueKind::Dict,
                    _ => AbstractValueKind::Slice,
                };
                self.push_intermediate(state, pc, kind);
            }
            ListAppend | ListExtend | SetUpdate | DictUpdate => {
                // The container stays at depth oparg; only the operand pops.
                self.pop_operands(state, pc, 1, true)?;
                state.peek_top(oparg as usize - 1)?;
            }
            UnpackSequence => {
                self.pop_operands(state, pc, 1, true)?;
                let source = self.arena.new_intermediate(pc);
                self.opcode_sources.insert(pc, source);
                for _ in 0..oparg {
                    state.push(ValueWithSource::new(AbstractValueKind::Any, source));
                }
            }
            CallFunction => {
                let ops = self.pop_operands(state, pc, oparg as usize + 1, true)?;
                let kind = AbstractValue::of(ops[0].kind).call();
                self.push_intermediate(state, pc, kind);
            }
            JumpForward | JumpAbsolute => {
                let target = instr.jump_target().expect("jump has a target");
                self.enqueue(target, state, queue)?;
                return Ok(Flow::End);
            }
            PopJumpIfFalse | PopJumpIfTrue => {
                self.pop_operands(state, pc, 1, false)?;
                let target = instr.jump_target().expect("jump has a target");
                self.enqueue(target, state, queue)?;
            }
            JumpIfFalseOrPop | JumpIfTrueOrPop => {
                // Jump path keeps the operand; fall-through pops it. Truth
                // testing observes the object either way.
                if let Some(source) = state.peek_top(0)?.source {
                    self.arena.escape(source);
                }
                let target = instr.jump_target().expect("jump has a target");
                let jump_state = state.clone();
                self.enqueue(target, &jump_state, queue)?;
                self.pop_operands(state, pc, 1, true)?;
            }
            SetupLoop => {}
            SetupExcept | SetupFinally => {
                let target = instr.jump_target().expect("SETUP_* is a relative jump");
                let mut handler_state = state.clone();
                Self::push_exception_triple(&mut handler_state);
                self.enqueue(target, &handler_state, queue)?;
            }
            PopBlock => {}
            PopExcept => {
                self.pop_operands(state, pc, 3, true)?;
            }
            BreakLoop => {
                let span = *self.break_to.get(&pc).ok_or_else(|| {
                    CompileError::BadBlockNesting(format!(
                        "BREAK_LOOP at {} outside any loop",
                        pc
                    ))
                })?;
                let depth = self
                    .states
                    .get(&span.start)
                    .map(InterpreterState::stack_size)
                    .ok_or_else(|| {
                        CompileError::BadBlockNesting(format!(
                            "BREAK_LOOP at {} before its loop header",
                            pc
                        ))
                    })?;
                let mut exit_state = state.clone();
                while exit_state.stack_size() > depth {
                    exit_state.pop(&mut self.arena)?;
                }
                self.enqueue(span.end, &exit_state, queue)?;
                return Ok(Flow::End);
            }
            ContinueLoop => {
                let target = oparg as usize;
                let depth = self
                    .states
                    .get(&target)
                    .map(InterpreterState::stack_size)
                    .ok_or_else(|| {
                        CompileError::MalformedBytecode(format!(
                            "CONTINUE_LOOP at {} targets unvisited offset {}",
                            pc, target
                        ))
                    })?;
                let mut loop_state = state.clone();
                while loop_state.stack_size() > depth {
                    loop_state.pop(&mut self.arena)?;
                }
                self.enqueue(target, &loop_state, queue)?;
                return Ok(Flow::End);
            }
            RaiseVarargs => {
                self.pop_operands(state, pc, oparg as usize, true)?;
                return Ok(Flow::End);
            }
            ReturnValue => {
                let ops = self.pop_operands(state, pc, 1, true)?;
                self.return_kind = merge_kinds(self.return_kind, ops[0].kind);
                return Ok(Flow::End);
            }
        }
        Ok(Flow::Next)
    }

    // ------------------------------------------------------------------
    // Results consumed downstream
    // ------------------------------------------------------------------

    /// The stack before the opcode at `pc`, if the opcode was reached.
    pub fn get_stack_info(&self, pc: usize) -> Option<&[ValueWithSource]> {
        self.states.get(&pc).map(InterpreterState::stack)
    }

    /// The full state before the opcode at `pc`.
    pub fn get_state(&self, pc: usize) -> Option<&InterpreterState> {
        self.states.get(&pc)
    }

    /// What is known about local `index` before the opcode at `pc`.
    pub fn get_local_info(&self, pc: usize, index: usize) -> Option<AbstractLocalInfo> {
        self.states.get(&pc).map(|s| s.get_local(index))
    }

    /// Whether the result of the opcode at `pc` must stay boxed: true
    /// unless every consumer of the result supports unboxed input.
    pub fn should_box(&self, pc: usize) -> bool {
        let Some(&source) = self.opcode_sources.get(&pc) else {
            return true;
        };
        let consumers = self.arena.consumers(source);
        if consumers.is_empty() {
            return true;
        }
        consumers.keys().any(|&consumer_pc| {
            self.index_map
                .get(&consumer_pc)
                .map(|&pos| !self.instructions[pos].opcode.supports_unboxing())
                .unwrap_or(true)
        })
    }

    /// Whether the frame's last-instruction slot can stay stale across the
    /// opcode at `pc`: only when the opcode cannot reach a raise.
    pub fn can_skip_lasti_update(&self, pc: usize) -> bool {
        self.index_map
            .get(&pc)
            .map(|&pos| !self.instructions[pos].opcode.can_raise())
            .unwrap_or(false)
    }

    /// Merged kind over every `RETURN_VALUE` reached by the analysis.
    pub fn return_info(&self) -> AbstractValueKind {
        self.return_kind
    }

    /// The decoded instruction stream (terminating indices only).
    pub fn instructions(&self) -> &[Decoded] {
        &self.instructions
    }

    /// Position of the instruction at byte offset `pc`.
    pub fn position_of(&self, pc: usize) -> Option<usize> {
        self.index_map.get(&pc).copied()
    }

    pub fn arena(&self) -> &SourceArena {
        &self.arena
    }

    /// Every branch target in the function.
    pub fn jump_targets(&self) -> &HashSet<usize> {
        &self.jumps_to
    }

    /// SETUP_* end offset -> start offset.
    pub fn block_starts(&self) -> &HashMap<usize, usize> {
        &self.block_starts
    }

    /// BREAK_LOOP offset -> the loop it leaves.
    pub fn break_targets(&self) -> &HashMap<usize, BlockSpan> {
        &self.break_to
    }

    /// Render every reached state, for debugging the analysis.
    #[cfg(feature = "graph-dump")]
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut offsets: Vec<usize> = self.states.keys().copied().collect();
        offsets.sort_unstable();
        for pc in offsets {
            let state = &self.states[&pc];
            let instr = self.instructions[self.index_map[&pc]];
            let stack: Vec<&str> = state.stack().iter().map(|v| v.kind.describe()).collect();
            let _ = writeln!(
                out,
                "{:4} {:<20} stack=[{}]",
                pc,
                instr.opcode.name(),
                stack.join(", ")
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{assemble, Const};

    fn code_of(instrs: &[(Opcode, u32)], consts: Vec<Const>, locals: usize) -> CodeObject {
        CodeObject::new(
            "test",
            assemble(instrs),
            consts,
            (0..locals).map(|i| format!("v{}", i)).collect(),
            0,
        )
    }

    fn analyzed(code: &CodeObject) -> AbstractInterpreter<'_> {
        let mut interp = AbstractInterpreter::new(code).unwrap();
        interp.interpret().unwrap();
        interp
    }

    #[test]
    fn test_straight_line_arithmetic() {
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1), Const::Int(2)],
            0,
        );
        let interp = analyzed(&code);
        assert_eq!(interp.get_stack_info(0).unwrap().len(), 0);
        assert_eq!(interp.get_stack_info(2).unwrap().len(), 1);
        let before_add = interp.get_stack_info(4).unwrap();
        assert_eq!(before_add.len(), 2);
        assert_eq!(before_add[0].kind, AbstractValueKind::Integer);
        assert_eq!(before_add[1].kind, AbstractValueKind::Integer);
        let before_ret = interp.get_stack_info(6).unwrap();
        assert_eq!(before_ret[0].kind, AbstractValueKind::Integer);
        assert_eq!(interp.return_info(), AbstractValueKind::Integer);
    }

    #[test]
    fn test_mixed_arithmetic_promotes() {
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryMultiply, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(3), Const::Float(0.5)],
            0,
        );
        let interp = analyzed(&code);
        assert_eq!(interp.return_info(), AbstractValueKind::Float);
    }

    #[test]
    fn test_branch_merge_joins_kinds() {
        // 0: LOAD_CONST 0 (bool)     selector
        // 2: POP_JUMP_IF_FALSE 8
        // 4: LOAD_CONST 1 (int)
        // 6: JUMP_FORWARD +2 -> 10
        // 8: LOAD_CONST 2 (float)
        // 10: RETURN_VALUE
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 8),
                (Opcode::LoadConst, 1),
                (Opcode::JumpForward, 2),
                (Opcode::LoadConst, 2),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Bool(true), Const::Int(1), Const::Float(2.0)],
            0,
        );
        let interp = analyzed(&code);
        let before_ret = interp.get_stack_info(10).unwrap();
        assert_eq!(before_ret.len(), 1);
        assert_eq!(before_ret[0].kind, AbstractValueKind::Any);
        assert_eq!(interp.return_info(), AbstractValueKind::Any);
    }

    #[test]
    fn test_for_iter_two_successors() {
        // 0: LOAD_CONST 0 (tuple)
        // 2: GET_ITER
        // 4: FOR_ITER +4 -> 10
        // 6: POP_TOP
        // 8: JUMP_ABSOLUTE 4
        // 10: LOAD_CONST 1 (None)
        // 12: RETURN_VALUE
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::GetIter, 0),
                (Opcode::ForIter, 4),
                (Opcode::PopTop, 0),
                (Opcode::JumpAbsolute, 4),
                (Opcode::LoadConst, 1),
                (Opcode::ReturnValue, 0),
            ],
            vec![
                Const::Tuple(vec![Const::Int(1), Const::Int(2)]),
                Const::None,
            ],
            0,
        );
        let interp = analyzed(&code);
        // before FOR_ITER: just the iterator
        assert_eq!(interp.get_stack_info(4).unwrap().len(), 1);
        assert_eq!(
            interp.get_stack_info(4).unwrap()[0].kind,
            AbstractValueKind::Iterable
        );
        // fall-through has the yielded value on top of the iterator
        assert_eq!(interp.get_stack_info(6).unwrap().len(), 2);
        // exhausted path popped the iterator
        assert_eq!(interp.get_stack_info(10).unwrap().len(), 0);
    }

    #[test]
    fn test_store_load_local_tracks_kind() {
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::StoreFast, 0),
                (Opcode::LoadFast, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(5)],
            1,
        );
        let interp = analyzed(&code);
        let local_before_store = interp.get_local_info(2, 0).unwrap();
        assert_eq!(local_before_store.value.kind, AbstractValueKind::Undefined);
        assert!(local_before_store.maybe_undefined);
        let local_after_store = interp.get_local_info(4, 0).unwrap();
        assert_eq!(local_after_store.value.kind, AbstractValueKind::Integer);
        assert!(!local_after_store.maybe_undefined);
        assert_eq!(interp.return_info(), AbstractValueKind::Integer);
    }

    #[test]
    fn test_handler_entry_has_exception_triple() {
        // 0: SETUP_EXCEPT +6 -> 8
        // 2: LOAD_CONST 0
        // 4: POP_TOP
        // 6: POP_BLOCK ... falls into handler-skip region; keep it simple
        //    and just return inside the try.
        // 8: (handler) POP_TOP x3, LOAD_CONST, RETURN
        let code = code_of(
            &[
                (Opcode::SetupExcept, 6),
                (Opcode::PopBlock, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
                (Opcode::PopTop, 0),
                (Opcode::PopTop, 0),
                (Opcode::PopTop, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1)],
            0,
        );
        let interp = analyzed(&code);
        let handler_stack = interp.get_stack_info(8).unwrap();
        assert_eq!(handler_stack.len(), 3);
        assert_eq!(handler_stack[2].kind, AbstractValueKind::Type);
    }

    #[test]
    fn test_depth_mismatch_rejected() {
        // One path pushes an extra value before the join.
        // 0: LOAD_CONST 0
        // 2: POP_JUMP_IF_FALSE 8
        // 4: LOAD_CONST 0
        // 6: JUMP_FORWARD +0 -> 8      (joins with depth 1)
        // 8: LOAD_CONST 0              (reached with depth 0 from the jump)
        // 10: RETURN_VALUE
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 8),
                (Opcode::LoadConst, 0),
                (Opcode::JumpForward, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Bool(true)],
            0,
        );
        let mut interp = AbstractInterpreter::new(&code).unwrap();
        assert!(matches!(
            interp.interpret(),
            Err(CompileError::StackDepthMismatch { .. })
        ));
    }

    #[test]
    fn test_idempotent_analysis() {
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::PopJumpIfFalse, 8),
                (Opcode::LoadConst, 1),
                (Opcode::JumpForward, 2),
                (Opcode::LoadConst, 2),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Bool(true), Const::Int(1), Const::Float(2.0)],
            0,
        );
        let a = analyzed(&code);
        let b = analyzed(&code);
        for instr in a.instructions() {
            let sa = a.get_stack_info(instr.index).map(|s| {
                s.iter().map(|v| v.kind).collect::<Vec<_>>()
            });
            let sb = b.get_stack_info(instr.index).map(|s| {
                s.iter().map(|v| v.kind).collect::<Vec<_>>()
            });
            assert_eq!(sa, sb, "state mismatch at {}", instr.index);
        }
    }

    #[test]
    fn test_should_box_follows_consumers() {
        // int + int feeding RETURN_VALUE: the add's consumers cannot take
        // unboxed input, so its result must box. The LOAD_CONSTs feed the
        // add, which can, so they need not.
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1), Const::Int(2)],
            0,
        );
        let interp = analyzed(&code);
        assert!(!interp.should_box(0));
        assert!(!interp.should_box(2));
        assert!(interp.should_box(4));
    }

    #[test]
    fn test_can_skip_lasti_update() {
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1), Const::Int(2)],
            0,
        );
        let interp = analyzed(&code);
        assert!(interp.can_skip_lasti_update(0));
        assert!(!interp.can_skip_lasti_update(4));
    }

    #[test]
    fn test_unreachable_code_has_no_state() {
        let code = code_of(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
                (Opcode::LoadConst, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::None],
            0,
        );
        let interp = analyzed(&code);
        assert!(interp.get_stack_info(4).is_none());
    }
}
