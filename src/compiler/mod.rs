//! Bytecode-to-IL driver.
//!
//! Consumes the analyzer and the instruction graph and emits IL through
//! the [`IlGen`] façade, in ascending opcode order. The driver maintains a
//! compile-time shadow stack mirroring the interpreter's (each entry
//! tagged object or machine value), a block stack for loops and protected
//! regions, and a tree of exception handlers with raise-and-free tails.
//! Boxed vs. unboxed operand strategies follow the instruction graph's
//! escape bits, with conversions inserted along `Unbox`/`Box` edges and
//! guard paths emitted where an unboxed assumption can fail at runtime
//! (a zero divisor under integer true division).
//!
//! Any malformed shape discovered during emission is a compile-time fatal
//! error: the compile is abandoned and the host keeps interpreting.

pub mod blocks;

use std::collections::HashMap;

use crate::bytecode::{CodeObject, CompareKind, Const, Decoded, Opcode};
use crate::graph::{EdgeTransition, InstructionGraph};
use crate::ilgen::{BranchKind, CraneliftIlGen, IlGen, JitMethod, Label, LocalId, MachineType};
use crate::interp::AbstractInterpreter;
use crate::runtime::{self, FRAME_LASTI_OFFSET, FRAME_LOCALS_OFFSET};
use crate::values::AbstractValueKind;
use crate::CompileError;

use blocks::{BlockInfo, BlockKind, ExceptionHandler, StackKind};

const PTR_SIZE: i32 = 8;

/// Bounds on a single compile. Exceeding either aborts cleanly and the
/// host falls back to interpretation.
#[derive(Debug, Clone)]
pub struct CompileBudget {
    /// Maximum number of decoded bytecode instructions.
    pub max_instructions: usize,
    /// Maximum number of emitted IL instructions.
    pub max_il_size: usize,
}

impl Default for CompileBudget {
    fn default() -> Self {
        Self {
            max_instructions: 10_000,
            max_il_size: 500_000,
        }
    }
}

/// Counters collected while compiling one function.
#[derive(Debug, Default, Clone)]
pub struct CompileStats {
    pub instructions_processed: usize,
    pub unboxed_instructions: usize,
    pub edges: usize,
    pub handlers: usize,
}

/// One compile job: analysis, graph, and emission for a single function.
pub struct Compiler<'a> {
    code: &'a CodeObject,
    interp: AbstractInterpreter<'a>,
    graph: InstructionGraph,
}

impl<'a> Compiler<'a> {
    /// Run the analysis passes. Fails on malformed bytecode.
    pub fn new(code: &'a CodeObject) -> Result<Self, CompileError> {
        let mut interp = AbstractInterpreter::new(code)?;
        interp.interpret()?;
        let graph = InstructionGraph::new(&interp);
        Ok(Self {
            code,
            interp,
            graph,
        })
    }

    /// Emit and lower the function to native code.
    pub fn compile(self, budget: CompileBudget) -> Result<JitMethod, CompileError> {
        self.compile_with_stats(budget).map(|(method, _)| method)
    }

    /// Like [`compile`](Self::compile), returning emission counters too.
    pub fn compile_with_stats(
        self,
        budget: CompileBudget,
    ) -> Result<(JitMethod, CompileStats), CompileError> {
        runtime::init();
        if self.interp.instructions().len() > budget.max_instructions {
            return Err(CompileError::BudgetExceeded(format!(
                "{} instructions exceed the limit of {}",
                self.interp.instructions().len(),
                budget.max_instructions
            )));
        }
        let gen = CraneliftIlGen::new(
            self.code.name.clone(),
            MachineType::Ptr,
            vec![MachineType::Ptr, MachineType::Ptr],
        );
        let stats = CompileStats {
            instructions_processed: self.interp.instructions().len(),
            unboxed_instructions: self.graph.instructions().filter(|i| i.escape).count(),
            edges: self.graph.edges().len(),
            handlers: 0,
        };
        let mut emitter = Emitter::new(self.code, &self.interp, &self.graph, gen);
        emitter.emit_function()?;
        let handlers = emitter.handlers.len();
        let method = emitter.gen.compile(&budget)?;
        let stats = CompileStats { handlers, ..stats };
        Ok((method, stats))
    }

    /// The completed analysis, for inspection.
    pub fn analysis(&self) -> &AbstractInterpreter<'a> {
        &self.interp
    }

    /// The instruction graph, for inspection.
    pub fn graph(&self) -> &InstructionGraph {
        &self.graph
    }
}

/// Emission state for one function.
struct Emitter<'a, G: IlGen> {
    code: &'a CodeObject,
    interp: &'a AbstractInterpreter<'a>,
    graph: &'a InstructionGraph,
    gen: G,
    /// pc -> label, allocated on demand.
    labels: HashMap<usize, Label>,
    /// Shadow kinds recorded at the first branch to each target pc.
    target_shadow: HashMap<usize, Vec<StackKind>>,
    shadow: Vec<StackKind>,
    blocks: Vec<BlockInfo>,
    handlers: Vec<ExceptionHandler>,
    current_handler: usize,
    /// Handler-body pc -> handler id, for tail placement.
    handler_bodies: HashMap<usize, usize>,
    /// Shared object locals for spilling the stack ahead of a raise.
    spill_locals: Vec<LocalId>,
    /// Scratch aggregate for container building, unpacking, calls, and
    /// the exception triple.
    scratch: LocalId,
    temps: HashMap<(MachineType, usize), LocalId>,
    ret_local: LocalId,
    ret_label: Label,
    null_label: Label,
    terminated: bool,
}

impl<'a, G: IlGen> Emitter<'a, G> {
    fn new(
        code: &'a CodeObject,
        interp: &'a AbstractInterpreter<'a>,
        graph: &'a InstructionGraph,
        mut gen: G,
    ) -> Self {
        let scratch_bytes = Self::scratch_bytes(interp.instructions());
        let scratch = gen.define_value_local(scratch_bytes);
        let ret_local = gen.define_local(MachineType::Ptr);
        let ret_label = gen.define_label();
        let null_label = gen.define_label();
        Self {
            code,
            interp,
            graph,
            gen,
            labels: HashMap::new(),
            target_shadow: HashMap::new(),
            shadow: Vec::new(),
            blocks: Vec::new(),
            handlers: vec![ExceptionHandler::root()],
            current_handler: 0,
            handler_bodies: HashMap::new(),
            spill_locals: Vec::new(),
            scratch,
            temps: HashMap::new(),
            ret_local,
            ret_label,
            null_label,
            terminated: false,
        }
    }

    /// Scratch size covering the widest build/unpack/call plus the
    /// exception triple.
    fn scratch_bytes(instructions: &[Decoded]) -> u32 {
        let mut slots: u32 = 3;
        for instr in instructions {
            let needed = match instr.opcode {
                Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildSet => instr.oparg,
                Opcode::BuildMap => instr.oparg * 2,
                Opcode::UnpackSequence | Opcode::CallFunction => instr.oparg,
                _ => 0,
            };
            slots = slots.max(needed);
        }
        slots * PTR_SIZE as u32
    }

    fn label_of(&mut self, pc: usize) -> Label {
        if let Some(&label) = self.labels.get(&pc) {
            return label;
        }
        let label = self.gen.define_label();
        self.labels.insert(pc, label);
        label
    }

    fn temp(&mut self, ty: MachineType, slot: usize) -> LocalId {
        if let Some(&local) = self.temps.get(&(ty, slot)) {
            return local;
        }
        let local = self.gen.define_local(ty);
        self.temps.insert((ty, slot), local);
        local
    }

    fn ensure_spill_locals(&mut self, count: usize) {
        while self.spill_locals.len() < count {
            let local = self.gen.define_local(MachineType::Ptr);
            self.spill_locals.push(local);
        }
    }

    /// The raise-and-free entry for the current handler at `objects`
    /// spilled object entries, allocating the chain up to it.
    fn raise_label(&mut self, handler: usize, objects: usize) -> Label {
        while self.handlers[handler].raise_labels.len() <= objects {
            let label = self.gen.define_label();
            self.handlers[handler].raise_labels.push(label);
        }
        self.handlers[handler].raise_labels[objects]
    }

    /// Record (or verify) the shadow kinds flowing into a branch target.
    fn record_target(&mut self, pc: usize, kinds: Vec<StackKind>) -> Result<(), CompileError> {
        match self.target_shadow.get(&pc) {
            Some(existing) => {
                if *existing != kinds {
                    return Err(CompileError::Codegen(format!(
                        "inconsistent stack kinds at branch target {}",
                        pc
                    )));
                }
            }
            None => {
                self.target_shadow.insert(pc, kinds);
            }
        }
        Ok(())
    }

    fn push_object(&mut self) {
        self.shadow.push(StackKind::Object);
    }

    fn push_value(&mut self, ty: MachineType) {
        self.shadow.push(StackKind::Value(ty));
    }

    fn pop_shadow(&mut self) -> Result<StackKind, CompileError> {
        self.shadow.pop().ok_or(CompileError::StackUnderflow)
    }

    /// Emission-side of a raise: on the error path, free everything above
    /// the current handler's base (spilling objects into the shared
    /// locals, discarding machine values) and enter the matching
    /// raise-and-free tail. Leaves the driver's shadow untouched: this
    /// code runs only when the guarding branch was taken.
    fn branch_raise(&mut self, skip_top: usize) {
        let handler = self.current_handler;
        let base = self.handlers[handler].base_depth;
        let live: Vec<StackKind> =
            self.shadow[base..self.shadow.len() - skip_top].to_vec();
        let objects = live
            .iter()
            .filter(|kind| matches!(kind, StackKind::Object))
            .count();
        self.ensure_spill_locals(objects);
        let mut next = objects;
        for kind in live.iter().rev() {
            match kind {
                StackKind::Object => {
                    next -= 1;
                    let local = self.spill_locals[next];
                    self.gen.st_loc(local);
                }
                StackKind::Value(_) => self.gen.pop(),
            }
        }
        let label = self.raise_label(handler, objects);
        self.gen.branch(BranchKind::Always, label);
    }

    /// After an object-producing helper call: branch to the raise chain
    /// when the result is null. The shadow stack must already reflect the
    /// consumed operands and not yet the result.
    fn error_check(&mut self) {
        let ok = self.gen.define_label();
        self.gen.dup();
        self.gen.branch(BranchKind::True, ok);
        self.gen.pop();
        self.branch_raise(0);
        self.gen.mark_label(ok);
    }

    /// After an int-producing helper call: branch to the raise chain on
    /// -1, otherwise discard the status.
    fn int_error_check(&mut self) {
        let ok = self.gen.define_label();
        self.gen.dup();
        self.gen.ld_i4(-1);
        self.gen.branch(BranchKind::NotEqual, ok);
        self.gen.pop();
        self.branch_raise(0);
        self.gen.mark_label(ok);
        self.gen.pop();
    }

    /// Keep the frame's last-instruction slot current ahead of anything
    /// that can raise.
    fn update_lasti(&mut self, pc: usize) {
        self.gen.ld_i4(pc as i32);
        self.gen.ld_arg(0);
        self.gen.st_ind(MachineType::Int32, FRAME_LASTI_OFFSET);
    }

    /// Free shadow entries above `depth` on the main path (loop exits).
    fn free_stack_to(&mut self, depth: usize) -> Result<(), CompileError> {
        while self.shadow.len() > depth {
            match self.pop_shadow()? {
                StackKind::Object => self.gen.emit_call(runtime::METHOD_DECREF),
                StackKind::Value(_) => self.gen.pop(),
            }
        }
        Ok(())
    }

    /// Emit a handler's raise-and-free chain followed by its exception
    /// trampoline. Placed immediately before the handler body so the
    /// body label's stack shape is bound by the trampoline's branch.
    fn emit_handler_tail(&mut self, handler: usize) -> Result<(), CompileError> {
        if self.handlers[handler].raise_labels.is_empty() {
            if self.handlers[handler].base_depth == 0 {
                self.raise_label(handler, 0);
            } else {
                return Err(CompileError::Codegen(
                    "exception handler with live stack but no raise sites".to_string(),
                ));
            }
        }
        let labels = self.handlers[handler].raise_labels.clone();
        for objects in (0..labels.len()).rev() {
            self.gen.mark_label(labels[objects]);
            if objects > 0 {
                let local = self.spill_locals[objects - 1];
                self.gen.ld_loc(local);
                self.gen.emit_call(runtime::METHOD_XDECREF);
            }
        }
        match self.handlers[handler].body_pc {
            None => {
                self.gen.branch(BranchKind::Always, self.null_label);
            }
            Some(body_pc) => {
                // Fetch the pending exception and enter the body with the
                // triple pushed (traceback, value, type).
                self.gen.ld_loc(self.scratch);
                self.gen.emit_call(runtime::METHOD_FETCH_EXC);
                for slot in 0..3 {
                    self.gen.ld_loc(self.scratch);
                    self.gen.ld_ind(MachineType::Ptr, slot * PTR_SIZE);
                }
                let mut kinds = self.handlers[handler].base_kinds.clone();
                kinds.extend([StackKind::Object; 3]);
                self.record_target(body_pc, kinds)?;
                let label = self.label_of(body_pc);
                self.gen.branch(BranchKind::Always, label);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Unboxed operand handling
    // -----------------------------------------------------------------

    /// Machine representation for an escapable kind.
    fn repr_of(kind: AbstractValueKind) -> MachineType {
        match kind {
            AbstractValueKind::Float => MachineType::Float64,
            AbstractValueKind::Bool => MachineType::Int32,
            _ => MachineType::Int64,
        }
    }

    fn unbox_token(kind: AbstractValueKind) -> u32 {
        match kind {
            AbstractValueKind::Float => runtime::METHOD_UNBOX_FLOAT,
            AbstractValueKind::Bool => runtime::METHOD_UNBOX_BOOL,
            _ => runtime::METHOD_UNBOX_INT,
        }
    }

    /// Convert the machine value on top of stack from `from` to `to`.
    fn convert_top(&mut self, from: MachineType, to: MachineType) {
        if from == to {
            return;
        }
        match (from, to) {
            (MachineType::Int32, MachineType::Int64) => self.gen.conv_i8(),
            (MachineType::Int64, MachineType::Float64) => self.gen.conv_r8(),
            (MachineType::Int32, MachineType::Float64) => {
                self.gen.conv_i8();
                self.gen.conv_r8();
            }
            _ => {}
        }
    }

    /// Bring the top `count` stack slots into unboxed form for an escaped
    /// instruction, following the inbound edges' transitions, and
    /// normalize them to `target` when one is given. Updates the shadow
    /// in place (entries stay on the stack).
    fn prepare_unboxed_operands(
        &mut self,
        pc: usize,
        count: usize,
        target: Option<MachineType>,
    ) -> Result<(), CompileError> {
        let edges = self.graph.edges_to(pc);
        if edges.len() != count {
            return Err(CompileError::Codegen(format!(
                "instruction at {} has {} inbound edges, expected {}",
                pc,
                edges.len(),
                count
            )));
        }
        if self.shadow.len() < count {
            return Err(CompileError::StackUnderflow);
        }
        // Top of stack first (highest position).
        let top_index = self.shadow.len() - 1;
        let prepare_one = |emitter: &mut Self, slot: usize, edge_index: usize| {
            let edge = edges[edge_index];
            let current = emitter.shadow[slot];
            let repr = match (edge.transition, current) {
                (EdgeTransition::Unbox, StackKind::Object) => {
                    emitter.gen.emit_call(Self::unbox_token(edge.kind));
                    Self::repr_of(edge.kind)
                }
                (_, StackKind::Value(ty)) => ty,
                (transition, kind) => {
                    return Err(CompileError::Codegen(format!(
                        "operand at {} has transition {:?} but stack holds {:?}",
                        pc, transition, kind
                    )))
                }
            };
            let final_ty = target.unwrap_or(repr);
            emitter.convert_top(repr, final_ty);
            emitter.shadow[slot] = StackKind::Value(final_ty);
            Ok(())
        };
        match count {
            1 => prepare_one(self, top_index, 0)?,
            2 => {
                prepare_one(self, top_index, 1)?;
                let lower = self.shadow[top_index - 1];
                let lower_needs_work = match lower {
                    StackKind::Object => true,
                    StackKind::Value(ty) => target.map(|t| t != ty).unwrap_or(false),
                };
                if lower_needs_work {
                    let StackKind::Value(top_ty) = self.shadow[top_index] else {
                        return Err(CompileError::Codegen(
                            "unboxed operand expected on top of stack".to_string(),
                        ));
                    };
                    let stash = self.temp(top_ty, 0);
                    self.gen.st_loc(stash);
                    prepare_one(self, top_index - 1, 0)?;
                    self.gen.ld_loc(stash);
                }
            }
            _ => {
                return Err(CompileError::Codegen(
                    "unboxed instructions take at most two operands".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Box the escaped result on top of stack when an outbound edge says
    /// its consumer needs the object representation.
    fn box_result_if_needed(&mut self, pc: usize) -> Result<(), CompileError> {
        let edges = self.graph.edges_from(pc);
        let needs_box = edges
            .iter()
            .any(|e| e.transition == EdgeTransition::Box);
        if !needs_box {
            return Ok(());
        }
        let StackKind::Value(ty) = self.pop_shadow()? else {
            return Err(CompileError::Codegen(
                "box transition on an already-boxed value".to_string(),
            ));
        };
        let token = match ty {
            MachineType::Float64 => runtime::METHOD_BOX_FLOAT,
            MachineType::Int32 => runtime::METHOD_BOX_BOOL,
            _ => runtime::METHOD_BOX_INT,
        };
        self.gen.emit_call(token);
        self.push_object();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Function emission
    // -----------------------------------------------------------------

    fn emit_function(&mut self) -> Result<(), CompileError> {
        let instructions: Vec<Decoded> = self.interp.instructions().to_vec();
        for instr in instructions {
            let pc = instr.index;
            if self.interp.get_state(pc).is_none() {
                // Unreachable; nothing branches here.
                continue;
            }
            if self.interp.jump_targets().contains(&pc) {
                self.enter_target(pc)?;
            } else if self.terminated {
                continue;
            }
            if !self.interp.can_skip_lasti_update(pc) {
                self.update_lasti(pc);
            }
            self.emit_instruction(instr)?;
        }
        self.emit_epilogue()?;
        Ok(())
    }

    /// Bind the label for a jump-target pc, reconciling the shadow stack
    /// with whatever flowed in.
    fn enter_target(&mut self, pc: usize) -> Result<(), CompileError> {
        if let Some(&handler) = self.handler_bodies.get(&pc) {
            if !self.terminated {
                return Err(CompileError::BadBlockNesting(format!(
                    "fell through into exception handler at {}",
                    pc
                )));
            }
            self.emit_handler_tail(handler)?;
        }
        if self.terminated {
            let kinds = self.target_shadow.get(&pc).cloned().ok_or_else(|| {
                CompileError::Codegen(format!("no recorded stack shape for target {}", pc))
            })?;
            self.shadow = kinds;
        } else {
            self.record_target(pc, self.shadow.clone())?;
        }
        let expected = self
            .interp
            .get_state(pc)
            .map(|state| state.stack_size())
            .unwrap_or(0);
        if self.shadow.len() != expected {
            return Err(CompileError::StackDepthMismatch {
                expected,
                found: self.shadow.len(),
            });
        }
        let label = self.label_of(pc);
        self.gen.mark_label(label);
        self.terminated = false;
        Ok(())
    }

    fn emit_epilogue(&mut self) -> Result<(), CompileError> {
        // Normal return: the value was stashed in ret_local.
        self.gen.mark_label(self.ret_label);
        self.gen.ld_loc(self.ret_local);
        self.gen.ret();
        // Exception epilogue: null with the error slot already set.
        self.gen.mark_label(self.null_label);
        self.gen.ld_ptr(0);
        self.gen.ret();
        self.emit_handler_tail(0)
    }

    /// Token for a boxed binary opcode.
    fn binary_token(opcode: Opcode) -> u32 {
        match opcode {
            Opcode::BinaryAdd => runtime::METHOD_ADD,
            Opcode::BinarySubtract => runtime::METHOD_SUBTRACT,
            Opcode::BinaryMultiply => runtime::METHOD_MULTIPLY,
            Opcode::BinaryTrueDivide => runtime::METHOD_TRUE_DIVIDE,
            Opcode::BinaryFloorDivide => runtime::METHOD_FLOOR_DIVIDE,
            Opcode::BinaryModulo => runtime::METHOD_MODULO,
            Opcode::BinaryPower => runtime::METHOD_POWER,
            Opcode::BinaryLshift => runtime::METHOD_LSHIFT,
            Opcode::BinaryRshift => runtime::METHOD_RSHIFT,
            Opcode::BinaryAnd => runtime::METHOD_AND,
            Opcode::BinaryOr => runtime::METHOD_OR,
            Opcode::BinaryXor => runtime::METHOD_XOR,
            Opcode::BinarySubscr => runtime::METHOD_SUBSCR,
            _ => unreachable!("not a binary opcode"),
        }
    }

    fn compare_branch_kind(oparg: u32) -> Result<BranchKind, CompileError> {
        Ok(match CompareKind::from_oparg(oparg) {
            Some(CompareKind::Lt) => BranchKind::Less,
            Some(CompareKind::Le) => BranchKind::LessEqual,
            Some(CompareKind::Eq) => BranchKind::Equal,
            Some(CompareKind::Ne) => BranchKind::NotEqual,
            Some(CompareKind::Gt) => BranchKind::Greater,
            Some(CompareKind::Ge) => BranchKind::GreaterEqual,
            None => {
                return Err(CompileError::MalformedBytecode(format!(
                    "bad COMPARE_OP argument {}",
                    oparg
                )))
            }
        })
    }

    /// Target machine type for an escaped instruction's operands.
    fn unboxed_target(&self, pc: usize) -> MachineType {
        let float = self
            .graph
            .edges_to(pc)
            .iter()
            .any(|e| e.kind == AbstractValueKind::Float);
        if float {
            MachineType::Float64
        } else {
            MachineType::Int64
        }
    }

    fn emit_instruction(&mut self, instr: Decoded) -> Result<(), CompileError> {
        let pc = instr.index;
        let oparg = instr.oparg;
        let escaped = self.graph.is_escaped(pc);
        match instr.opcode {
            Opcode::Nop | Opcode::ExtendedArg => {}

            Opcode::PopTop => match self.pop_shadow()? {
                StackKind::Object => self.gen.emit_call(runtime::METHOD_DECREF),
                StackKind::Value(_) => self.gen.pop(),
            },

            Opcode::DupTop => {
                let top = *self.shadow.last().ok_or(CompileError::StackUnderflow)?;
                self.gen.dup();
                if top == StackKind::Object {
                    self.gen.dup();
                    self.gen.emit_call(runtime::METHOD_INCREF);
                }
                self.shadow.push(top);
            }

            Opcode::RotTwo => {
                let b = self.pop_shadow()?;
                let a = self.pop_shadow()?;
                let tb = self.temp(Self::kind_ty(b), 0);
                let ta = self.temp(Self::kind_ty(a), 1);
                self.gen.st_loc(tb);
                self.gen.st_loc(ta);
                self.gen.ld_loc(tb);
                self.gen.ld_loc(ta);
                self.shadow.push(b);
                self.shadow.push(a);
            }

            Opcode::RotThree => {
                let c = self.pop_shadow()?;
                let b = self.pop_shadow()?;
                let a = self.pop_shadow()?;
                let tc = self.temp(Self::kind_ty(c), 0);
                let tb = self.temp(Self::kind_ty(b), 1);
                let ta = self.temp(Self::kind_ty(a), 2);
                self.gen.st_loc(tc);
                self.gen.st_loc(tb);
                self.gen.st_loc(ta);
                self.gen.ld_loc(tc);
                self.gen.ld_loc(ta);
                self.gen.ld_loc(tb);
                self.shadow.push(c);
                self.shadow.push(a);
                self.shadow.push(b);
            }

            Opcode::LoadConst => {
                let constant = &self.code.consts[oparg as usize];
                if escaped {
                    match constant {
                        Const::Int(i) => {
                            self.gen.ld_i8(*i);
                            self.push_value(MachineType::Int64);
                        }
                        Const::Float(f) => {
                            self.gen.ld_r8(*f);
                            self.push_value(MachineType::Float64);
                        }
                        Const::Bool(b) => {
                            self.gen.ld_i4(*b as i32);
                            self.push_value(MachineType::Int32);
                        }
                        other => {
                            return Err(CompileError::Codegen(format!(
                                "constant {:?} cannot be unboxed",
                                other
                            )))
                        }
                    }
                    self.box_result_if_needed(pc)?;
                } else {
                    let id = runtime::intern_const(constant);
                    self.gen.ld_i4(id as i32);
                    self.gen.emit_call(runtime::METHOD_LOAD_CONST);
                    self.push_object();
                }
            }

            Opcode::LoadFast => {
                let index = oparg as usize;
                let maybe_undefined = self
                    .interp
                    .get_local_info(pc, index)
                    .map(|info| info.maybe_undefined)
                    .unwrap_or(true);
                self.gen.ld_arg(0);
                self.gen.ld_ind(MachineType::Ptr, FRAME_LOCALS_OFFSET);
                self.gen.ld_ind(MachineType::Ptr, index as i32 * PTR_SIZE);
                if maybe_undefined {
                    let ok = self.gen.define_label();
                    self.gen.dup();
                    self.gen.branch(BranchKind::True, ok);
                    self.gen.pop();
                    self.gen.ld_i4(index as i32);
                    self.gen.emit_call(runtime::METHOD_UNBOUND_LOCAL);
                    self.branch_raise(0);
                    self.gen.mark_label(ok);
                }
                self.gen.dup();
                self.gen.emit_call(runtime::METHOD_INCREF);
                self.push_object();
            }

            Opcode::StoreFast => {
                let index = oparg as usize;
                self.pop_shadow()?;
                self.gen.ld_arg(0);
                self.gen.ld_ind(MachineType::Ptr, FRAME_LOCALS_OFFSET);
                self.gen.dup();
                self.gen.ld_ind(MachineType::Ptr, index as i32 * PTR_SIZE);
                self.gen.emit_call(runtime::METHOD_XDECREF);
                self.gen.st_ind(MachineType::Ptr, index as i32 * PTR_SIZE);
            }

            Opcode::UnaryPositive | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let token = match instr.opcode {
                    Opcode::UnaryPositive => runtime::METHOD_UNARY_POSITIVE,
                    Opcode::UnaryNot => runtime::METHOD_UNARY_NOT,
                    _ => runtime::METHOD_UNARY_INVERT,
                };
                self.pop_shadow()?;
                self.gen.emit_call(token);
                self.error_check();
                self.push_object();
            }

            Opcode::UnaryNegative => {
                if escaped {
                    let target = self.unboxed_target(pc);
                    self.prepare_unboxed_operands(pc, 1, Some(target))?;
                    self.gen.neg();
                    self.box_result_if_needed(pc)?;
                } else {
                    self.pop_shadow()?;
                    self.gen.emit_call(runtime::METHOD_UNARY_NEGATIVE);
                    self.error_check();
                    self.push_object();
                }
            }

            Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryMultiply
            | Opcode::BinaryTrueDivide
                if escaped =>
            {
                let target = self.unboxed_target(pc);
                self.prepare_unboxed_operands(pc, 2, Some(target))?;
                if instr.opcode == Opcode::BinaryTrueDivide {
                    self.emit_unboxed_true_divide(target)?;
                } else {
                    match instr.opcode {
                        Opcode::BinaryAdd => self.gen.add(),
                        Opcode::BinarySubtract => self.gen.sub(),
                        _ => self.gen.mul(),
                    }
                    self.pop_shadow()?;
                    self.pop_shadow()?;
                    self.push_value(target);
                }
                self.box_result_if_needed(pc)?;
            }

            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr => {
                self.pop_shadow()?;
                self.pop_shadow()?;
                self.gen.emit_call(Self::binary_token(instr.opcode));
                self.error_check();
                self.push_object();
            }

            Opcode::CompareOp => {
                if escaped {
                    let target = self.unboxed_target(pc);
                    self.prepare_unboxed_operands(pc, 2, Some(target))?;
                    self.gen.compare(Self::compare_branch_kind(oparg)?);
                    self.pop_shadow()?;
                    self.pop_shadow()?;
                    self.push_value(MachineType::Int32);
                    self.box_result_if_needed(pc)?;
                } else {
                    Self::compare_branch_kind(oparg)?;
                    self.pop_shadow()?;
                    self.pop_shadow()?;
                    self.gen.ld_i4(oparg as i32);
                    self.gen.emit_call(runtime::METHOD_RICHCMP);
                    self.error_check();
                    self.push_object();
                }
            }

            Opcode::ContainsOp => {
                self.pop_shadow()?;
                self.pop_shadow()?;
                self.gen.ld_i4(oparg as i32);
                self.gen.emit_call(runtime::METHOD_CONTAINS);
                self.error_check();
                self.push_object();
            }

            Opcode::StoreSubscr => {
                self.pop_shadow()?;
                self.pop_shadow()?;
                self.pop_shadow()?;
                self.gen.emit_call(runtime::METHOD_STORE_SUBSCR);
                self.int_error_check();
            }

            Opcode::GetIter => {
                self.pop_shadow()?;
                self.gen.emit_call(runtime::METHOD_GETITER);
                self.error_check();
                self.push_object();
            }

            Opcode::ForIter => {
                let target = instr.jump_target().expect("FOR_ITER has a target");
                let got = self.gen.define_label();
                let no_err = self.gen.define_label();
                self.gen.dup();
                self.gen.emit_call(runtime::METHOD_ITERNEXT);
                self.gen.dup();
                self.gen.branch(BranchKind::True, got);
                self.gen.pop();
                self.gen.emit_call(runtime::METHOD_ERR_OCCURRED);
                self.gen.ld_i4(0);
                self.gen.branch(BranchKind::Equal, no_err);
                self.branch_raise(0);
                self.gen.mark_label(no_err);
                // Exhausted: drop the iterator, jump past the loop.
                self.gen.emit_call(runtime::METHOD_DECREF);
                let exhausted = self.pop_shadow()?;
                debug_assert_eq!(exhausted, StackKind::Object);
                self.record_target(target, self.shadow.clone())?;
                let label = self.label_of(target);
                self.gen.branch(BranchKind::Always, label);
                self.push_object(); // the iterator, on the live path
                self.gen.mark_label(got);
                self.push_object(); // the yielded value
            }

            Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildSet | Opcode::BuildMap => {
                let count = match instr.opcode {
                    Opcode::BuildMap => oparg as usize * 2,
                    _ => oparg as usize,
                };
                for slot in (0..count).rev() {
                    self.pop_shadow()?;
                    self.gen.ld_loc(self.scratch);
                    self.gen.st_ind(MachineType::Ptr, slot as i32 * PTR_SIZE);
                }
                self.gen.ld_loc(self.scratch);
                self.gen.ld_i8(oparg as i64);
                let (token, can_fail) = match instr.opcode {
                    Opcode::BuildTuple => (runtime::METHOD_TUPLE_FROM_BUFFER, false),
                    Opcode::BuildList => (runtime::METHOD_LIST_FROM_BUFFER, false),
                    Opcode::BuildSet => (runtime::METHOD_SET_FROM_BUFFER, true),
                    _ => (runtime::METHOD_MAP_FROM_BUFFER, true),
                };
                self.gen.emit_call(token);
                if can_fail {
                    self.error_check();
                }
                self.push_object();
            }

            Opcode::BuildSlice => {
                if oparg != 2 && oparg != 3 {
                    return Err(CompileError::MalformedBytecode(format!(
                        "BUILD_SLICE with argument {}",
                        oparg
                    )));
                }
                if oparg == 2 {
                    self.gen.emit_call(runtime::METHOD_LOAD_NONE);
                    self.push_object();
                }
                self.gen.emit_call(runtime::METHOD_BUILD_SLICE);
                self.pop_shadow()?;
                self.pop_shadow()?;
                self.pop_shadow()?;
                self.push_object();
            }

            Opcode::ListAppend | Opcode::ListExtend | Opcode::SetUpdate | Opcode::DictUpdate => {
                if oparg != 1 {
                    return Err(CompileError::MalformedBytecode(format!(
                        "{} expects the container under the operand",
                        instr.opcode.name()
                    )));
                }
                let token = match instr.opcode {
                    Opcode::ListAppend => runtime::METHOD_LIST_APPEND,
                    Opcode::ListExtend => runtime::METHOD_LIST_EXTEND,
                    Opcode::SetUpdate => runtime::METHOD_SET_UPDATE,
                    _ => runtime::METHOD_DICT_UPDATE,
                };
                let stash = self.temp(MachineType::Ptr, 0);
                self.gen.st_loc(stash);
                self.pop_shadow()?;
                self.gen.dup();
                self.gen.ld_loc(stash);
                self.gen.emit_call(token);
                self.int_error_check();
            }

            Opcode::UnpackSequence => {
                let count = oparg as usize;
                self.pop_shadow()?;
                self.gen.ld_loc(self.scratch);
                self.gen.ld_i8(count as i64);
                self.gen.emit_call(runtime::METHOD_UNPACK_SEQUENCE);
                self.int_error_check();
                for slot in (0..count).rev() {
                    self.gen.ld_loc(self.scratch);
                    self.gen.ld_ind(MachineType::Ptr, slot as i32 * PTR_SIZE);
                    self.push_object();
                }
            }

            Opcode::CallFunction => {
                let count = oparg as usize;
                for slot in (0..count).rev() {
                    self.pop_shadow()?;
                    self.gen.ld_loc(self.scratch);
                    self.gen.st_ind(MachineType::Ptr, slot as i32 * PTR_SIZE);
                }
                self.pop_shadow()?;
                self.gen.ld_loc(self.scratch);
                self.gen.ld_i8(count as i64);
                self.gen.emit_call(runtime::METHOD_CALL_FUNCTION);
                self.error_check();
                self.push_object();
            }

            Opcode::LoadAssertionError => {
                self.gen.emit_call(runtime::METHOD_LOAD_ASSERTION_ERROR);
                self.push_object();
            }

            Opcode::JumpForward | Opcode::JumpAbsolute => {
                let target = instr.jump_target().expect("jump has a target");
                self.record_target(target, self.shadow.clone())?;
                let label = self.label_of(target);
                self.gen.branch(BranchKind::Always, label);
                self.terminated = true;
            }

            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let target = instr.jump_target().expect("jump has a target");
                let jump_true = instr.opcode == Opcode::PopJumpIfTrue;
                if escaped {
                    self.prepare_unboxed_operands(pc, 1, None)?;
                    self.pop_shadow()?;
                    self.record_target(target, self.shadow.clone())?;
                    let label = self.label_of(target);
                    self.gen
                        .branch(if jump_true { BranchKind::True } else { BranchKind::False }, label);
                } else {
                    self.pop_shadow()?;
                    let stash = self.temp(MachineType::Int32, 0);
                    self.gen.dup();
                    self.gen.emit_call(runtime::METHOD_TRUTH);
                    self.gen.st_loc(stash);
                    self.gen.emit_call(runtime::METHOD_DECREF);
                    self.gen.ld_loc(stash);
                    self.record_target(target, self.shadow.clone())?;
                    let label = self.label_of(target);
                    self.gen
                        .branch(if jump_true { BranchKind::True } else { BranchKind::False }, label);
                }
            }

            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let target = instr.jump_target().expect("jump has a target");
                let jump_true = instr.opcode == Opcode::JumpIfTrueOrPop;
                self.gen.dup();
                self.gen.emit_call(runtime::METHOD_TRUTH);
                // Jump path keeps the operand on the stack.
                self.record_target(target, self.shadow.clone())?;
                let label = self.label_of(target);
                self.gen
                    .branch(if jump_true { BranchKind::True } else { BranchKind::False }, label);
                // Fall-through pops and releases it.
                self.gen.emit_call(runtime::METHOD_DECREF);
                self.pop_shadow()?;
            }

            Opcode::SetupLoop => {
                let end = instr.jump_target().expect("SETUP_LOOP has a target");
                self.blocks.push(BlockInfo {
                    kind: BlockKind::Loop,
                    end_offset: end,
                    continue_offset: instr.next_index(),
                    entry_depth: self.shadow.len(),
                });
            }

            Opcode::SetupExcept | Opcode::SetupFinally => {
                let body_pc = instr.jump_target().expect("SETUP_* has a target");
                let handler = self.handlers.len();
                self.handlers.push(ExceptionHandler::nested(
                    self.current_handler,
                    self.shadow.clone(),
                    body_pc,
                ));
                self.handler_bodies.insert(body_pc, handler);
                self.blocks.push(BlockInfo {
                    kind: BlockKind::Try { handler },
                    end_offset: body_pc,
                    continue_offset: 0,
                    entry_depth: self.shadow.len(),
                });
                self.current_handler = handler;
            }

            Opcode::PopBlock => {
                let block = self.blocks.pop().ok_or_else(|| {
                    CompileError::BadBlockNesting(format!(
                        "POP_BLOCK at {} with no open block",
                        pc
                    ))
                })?;
                if let BlockKind::Try { handler } = block.kind {
                    // Leaving the try body turns the block into its
                    // handler region; raises below this point unwind to
                    // the enclosing handler.
                    self.current_handler =
                        self.handlers[handler].parent.expect("nested handler has parent");
                    self.blocks.push(BlockInfo {
                        kind: BlockKind::Handler { handler },
                        end_offset: block.end_offset,
                        continue_offset: 0,
                        entry_depth: block.entry_depth,
                    });
                }
            }

            Opcode::PopExcept => {
                for _ in 0..3 {
                    self.pop_shadow()?;
                    self.gen.emit_call(runtime::METHOD_DECREF);
                }
                if matches!(
                    self.blocks.last().map(|b| b.kind),
                    Some(BlockKind::Handler { .. })
                ) {
                    self.blocks.pop();
                }
            }

            Opcode::BreakLoop => {
                let loop_block = self
                    .blocks
                    .iter()
                    .rev()
                    .find(|b| b.kind == BlockKind::Loop)
                    .cloned()
                    .ok_or_else(|| {
                        CompileError::BadBlockNesting(format!(
                            "BREAK_LOOP at {} outside any loop",
                            pc
                        ))
                    })?;
                self.free_stack_to(loop_block.entry_depth)?;
                self.record_target(loop_block.end_offset, self.shadow.clone())?;
                let label = self.label_of(loop_block.end_offset);
                self.gen.branch(BranchKind::Always, label);
                self.terminated = true;
            }

            Opcode::ContinueLoop => {
                let target = oparg as usize;
                let depth = self
                    .interp
                    .get_state(target)
                    .map(|state| state.stack_size())
                    .ok_or_else(|| {
                        CompileError::MalformedBytecode(format!(
                            "CONTINUE_LOOP at {} targets unreachable offset {}",
                            pc, target
                        ))
                    })?;
                self.free_stack_to(depth)?;
                self.record_target(target, self.shadow.clone())?;
                let label = self.label_of(target);
                self.gen.branch(BranchKind::Always, label);
                self.terminated = true;
            }

            Opcode::RaiseVarargs => {
                match oparg {
                    0 => {
                        self.gen.emit_call(runtime::METHOD_RERAISE);
                        self.gen.pop();
                    }
                    1 => {
                        self.gen.emit_call(runtime::METHOD_RAISE);
                        self.gen.pop();
                        self.pop_shadow()?;
                    }
                    _ => {
                        return Err(CompileError::MalformedBytecode(format!(
                            "RAISE_VARARGS with {} arguments is not supported",
                            oparg
                        )))
                    }
                }
                self.branch_raise(0);
                self.terminated = true;
            }

            Opcode::ReturnValue => {
                let top = self.pop_shadow()?;
                if top != StackKind::Object {
                    return Err(CompileError::Codegen(
                        "return value must be boxed".to_string(),
                    ));
                }
                self.gen.st_loc(self.ret_local);
                self.free_stack_to(0)?;
                self.gen.branch(BranchKind::Always, self.ret_label);
                self.terminated = true;
            }
        }
        Ok(())
    }

    /// Unboxed true division with a zero-divisor guard branching into the
    /// raise chain.
    fn emit_unboxed_true_divide(&mut self, target: MachineType) -> Result<(), CompileError> {
        let ok = self.gen.define_label();
        self.gen.dup();
        if target == MachineType::Float64 {
            self.gen.ld_r8(0.0);
        } else {
            self.gen.ld_i8(0);
        }
        self.gen.branch(BranchKind::NotEqual, ok);
        // Guard failed: discard both operands and raise.
        self.gen.pop();
        self.gen.pop();
        self.gen.emit_call(runtime::METHOD_ZERO_DIVISION_ERROR);
        self.branch_raise(2);
        self.gen.mark_label(ok);
        if target == MachineType::Float64 {
            self.gen.div();
        } else {
            self.gen.emit_call(runtime::METHOD_INT_TRUE_DIVIDE);
        }
        self.pop_shadow()?;
        self.pop_shadow()?;
        self.push_value(MachineType::Float64);
        Ok(())
    }

    fn kind_ty(kind: StackKind) -> MachineType {
        match kind {
            StackKind::Object => MachineType::Ptr,
            StackKind::Value(ty) => ty,
        }
    }
}
