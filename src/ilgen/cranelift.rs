//! Cranelift-backed IL generator.
//!
//! The façade records a linear IL stream; [`CraneliftIlGen::compile`]
//! lowers it through `cranelift_frontend::FunctionBuilder` in one pass and
//! hands the blob to a `JITModule`. The IL's evaluation stack maps onto
//! SSA by giving every label's block one parameter per live stack slot:
//! branches pass the stack as block arguments, and marking a label reloads
//! it from the parameters.
//!
//! Helper tokens resolve through the process-wide registry: symbols are
//! registered on the `JITBuilder`, declared as imports, and every emitted
//! call is recorded with its IL offset. Native call-site offsets are read
//! back from the finalized buffer's relocations.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, AbiParam, Block, ExternalName, FuncRef, Function, InstBuilder, MemFlags, StackSlot,
    StackSlotData, StackSlotKind, UserFuncName, Value,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{Context, FinalizedRelocTarget};
use cranelift_entity::EntityRef;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use target_lexicon::Triple;

use super::{BranchKind, CallSite, IlGen, JitMethod, Label, LocalId, MachineType};
use crate::compiler::CompileBudget;
use crate::runtime;
use crate::CompileError;

/// Default byte size of a `ValueClass` scratch local.
const DEFAULT_VALUE_LOCAL_BYTES: u32 = 64;

/// One recorded façade instruction.
#[derive(Debug, Clone, Copy)]
enum IlOp {
    Mark(Label),
    LdI4(i32),
    LdU4(u32),
    LdI8(i64),
    LdR8(f64),
    LdPtr(usize),
    LdArg(usize),
    LdLoc(LocalId),
    StLoc(LocalId),
    Dup,
    Pop,
    LdInd(MachineType, i32),
    StInd(MachineType, i32),
    Branch(BranchKind, Label),
    Compare(BranchKind),
    Call(u32),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Not,
    ConvR8,
    ConvI8,
    Ret,
}

#[derive(Debug, Clone, Copy)]
enum LocalDef {
    Scalar(MachineType),
    Aggregate(u32),
}

/// IL generator that lowers through cranelift.
pub struct CraneliftIlGen {
    name: String,
    ret_type: MachineType,
    params: Vec<MachineType>,
    ops: Vec<IlOp>,
    label_count: u32,
    locals: Vec<LocalDef>,
}

fn machine_to_cl(ty: MachineType) -> types::Type {
    match ty {
        MachineType::Int32 => types::I32,
        MachineType::Int64 => types::I64,
        MachineType::Float64 => types::F64,
        MachineType::Ptr => types::I64,
        MachineType::ValueClass => types::I64,
    }
}

impl CraneliftIlGen {
    /// New generator for a function with the given return and parameter
    /// machine types.
    pub fn new(name: impl Into<String>, ret_type: MachineType, params: Vec<MachineType>) -> Self {
        runtime::init();
        Self {
            name: name.into(),
            ret_type,
            params,
            ops: Vec::new(),
            label_count: 0,
            locals: Vec::new(),
        }
    }
}

impl IlGen for CraneliftIlGen {
    fn define_label(&mut self) -> Label {
        let label = Label(self.label_count);
        self.label_count += 1;
        label
    }

    fn mark_label(&mut self, label: Label) {
        self.ops.push(IlOp::Mark(label));
    }

    fn define_local(&mut self, ty: MachineType) -> LocalId {
        if ty == MachineType::ValueClass {
            return self.define_value_local(DEFAULT_VALUE_LOCAL_BYTES);
        }
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDef::Scalar(ty));
        id
    }

    fn define_value_local(&mut self, bytes: u32) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDef::Aggregate(bytes.max(8)));
        id
    }

    fn ld_i4(&mut self, value: i32) {
        self.ops.push(IlOp::LdI4(value));
    }

    fn ld_u4(&mut self, value: u32) {
        self.ops.push(IlOp::LdU4(value));
    }

    fn ld_i8(&mut self, value: i64) {
        self.ops.push(IlOp::LdI8(value));
    }

    fn ld_r8(&mut self, value: f64) {
        self.ops.push(IlOp::LdR8(value));
    }

    fn ld_ptr(&mut self, value: usize) {
        self.ops.push(IlOp::LdPtr(value));
    }

    fn ld_arg(&mut self, index: usize) {
        self.ops.push(IlOp::LdArg(index));
    }

    fn ld_loc(&mut self, local: LocalId) {
        self.ops.push(IlOp::LdLoc(local));
    }

    fn st_loc(&mut self, local: LocalId) {
        self.ops.push(IlOp::StLoc(local));
    }

    fn dup(&mut self) {
        self.ops.push(IlOp::Dup);
    }

    fn pop(&mut self) {
        self.ops.push(IlOp::Pop);
    }

    fn ld_ind(&mut self, ty: MachineType, offset: i32) {
        self.ops.push(IlOp::LdInd(ty, offset));
    }

    fn st_ind(&mut self, ty: MachineType, offset: i32) {
        self.ops.push(IlOp::StInd(ty, offset));
    }

    fn branch(&mut self, kind: BranchKind, label: Label) {
        self.ops.push(IlOp::Branch(kind, label));
    }

    fn compare(&mut self, kind: BranchKind) {
        self.ops.push(IlOp::Compare(kind));
    }

    fn emit_call(&mut self, token: u32) {
        self.ops.push(IlOp::Call(token));
    }

    fn add(&mut self) {
        self.ops.push(IlOp::Add);
    }

    fn sub(&mut self) {
        self.ops.push(IlOp::Sub);
    }

    fn mul(&mut self) {
        self.ops.push(IlOp::Mul);
    }

    fn div(&mut self) {
        self.ops.push(IlOp::Div);
    }

    fn mod_(&mut self) {
        self.ops.push(IlOp::Mod);
    }

    fn neg(&mut self) {
        self.ops.push(IlOp::Neg);
    }

    fn lshift(&mut self) {
        self.ops.push(IlOp::Shl);
    }

    fn rshift(&mut self) {
        self.ops.push(IlOp::Shr);
    }

    fn bit_and(&mut self) {
        self.ops.push(IlOp::And);
    }

    fn bit_or(&mut self) {
        self.ops.push(IlOp::Or);
    }

    fn bit_xor(&mut self) {
        self.ops.push(IlOp::Xor);
    }

    fn not_(&mut self) {
        self.ops.push(IlOp::Not);
    }

    fn conv_r8(&mut self) {
        self.ops.push(IlOp::ConvR8);
    }

    fn conv_i8(&mut self) {
        self.ops.push(IlOp::ConvI8);
    }

    fn ret(&mut self) {
        self.ops.push(IlOp::Ret);
    }

    fn il_offset(&self) -> u32 {
        self.ops.len() as u32
    }

    fn compile(self, budget: &CompileBudget) -> Result<JitMethod, CompileError> {
        if self.ops.len() > budget.max_il_size {
            return Err(CompileError::BudgetExceeded(format!(
                "{} IL instructions exceed the limit of {}",
                self.ops.len(),
                budget.max_il_size
            )));
        }

        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CompileError::Codegen(e.to_string()))?;
        let isa_builder = cranelift_codegen::isa::lookup(Triple::host())
            .map_err(|e| CompileError::Codegen(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CompileError::Codegen(e.to_string()))?;

        let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for proto in runtime::helpers_table().values() {
            jit_builder.symbol(proto.name, proto.address as *const u8);
        }
        let mut module = JITModule::new(jit_builder);

        // Declare every referenced helper as an import.
        let mut token_func_ids: HashMap<u32, FuncId> = HashMap::new();
        for op in &self.ops {
            if let IlOp::Call(token) = op {
                if token_func_ids.contains_key(token) {
                    continue;
                }
                let proto = runtime::helper(*token).ok_or_else(|| {
                    CompileError::Codegen(format!("unregistered helper token {}", token))
                })?;
                let mut sig = module.make_signature();
                for &param in proto.params {
                    sig.params.push(AbiParam::new(machine_to_cl(param)));
                }
                if let Some(ret) = proto.ret {
                    sig.returns.push(AbiParam::new(machine_to_cl(ret)));
                }
                let func_id = module
                    .declare_function(proto.name, Linkage::Import, &sig)
                    .map_err(|e| CompileError::Codegen(e.to_string()))?;
                token_func_ids.insert(*token, func_id);
            }
        }

        let mut sig = module.make_signature();
        for &param in &self.params {
            sig.params.push(AbiParam::new(machine_to_cl(param)));
        }
        sig.returns.push(AbiParam::new(machine_to_cl(self.ret_type)));
        let func_id = module
            .declare_function(&self.name, Linkage::Export, &sig)
            .map_err(|e| CompileError::Codegen(e.to_string()))?;

        let mut ctx = Context::new();
        ctx.func = Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
        let mut builder_ctx = FunctionBuilderContext::new();

        let mut il_call_sites: Vec<(u32, u32)> = Vec::new();
        {
            let mut token_refs: HashMap<u32, FuncRef> = HashMap::new();
            for (&token, &id) in &token_func_ids {
                token_refs.insert(token, module.declare_func_in_func(id, &mut ctx.func));
            }
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            let mut lowerer = Lowerer::new(
                &mut builder,
                &self.params,
                &self.locals,
                self.ret_type,
                token_refs,
            );
            lowerer.run(&self.ops, &mut il_call_sites)?;
            builder.seal_all_blocks();
            builder.finalize();
        }

        module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CompileError::Codegen(e.to_string()))?;

        // Pair native call offsets with the recorded IL offsets, per token
        // in code order.
        let mut native_per_token: HashMap<u32, Vec<u32>> = HashMap::new();
        if let Some(compiled) = ctx.compiled_code() {
            let id_to_token: HashMap<FuncId, u32> =
                token_func_ids.iter().map(|(&t, &id)| (id, t)).collect();
            for reloc in compiled.buffer.relocs() {
                if let FinalizedRelocTarget::ExternalName(ExternalName::User(user_ref)) =
                    reloc.target
                {
                    let user = &ctx.func.params.user_named_funcs()[user_ref];
                    let target_id = FuncId::from_u32(user.index);
                    if let Some(&token) = id_to_token.get(&target_id) {
                        native_per_token.entry(token).or_default().push(reloc.offset);
                    }
                }
            }
        }
        for offsets in native_per_token.values_mut() {
            offsets.sort_unstable();
        }
        let mut taken_per_token: HashMap<u32, usize> = HashMap::new();
        let mut call_sites = Vec::with_capacity(il_call_sites.len());
        let mut symbols: HashMap<String, u32> = HashMap::new();
        for (token, il_offset) in il_call_sites {
            let slot = taken_per_token.entry(token).or_insert(0);
            let native_offset = native_per_token
                .get(&token)
                .and_then(|offsets| offsets.get(*slot))
                .copied()
                .unwrap_or(0);
            *slot += 1;
            call_sites.push(CallSite {
                token,
                native_offset,
                il_offset,
            });
            if let Some(proto) = runtime::helper(token) {
                symbols.entry(proto.name.to_string()).or_insert(native_offset);
            }
        }
        call_sites.sort_by_key(|site| site.native_offset);

        module
            .finalize_definitions()
            .map_err(|e| CompileError::Codegen(e.to_string()))?;
        let addr = module.get_finalized_function(func_id);

        Ok(JitMethod::new(addr, call_sites, symbols, module))
    }
}

/// Per-label lowering state.
#[derive(Default, Clone)]
struct LabelInfo {
    block: Option<Block>,
    stack_types: Option<Vec<types::Type>>,
}

/// One-pass lowering of the IL stream into a cranelift function.
struct Lowerer<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    stack: Vec<Value>,
    labels: Vec<LabelInfo>,
    arg_vars: Vec<Variable>,
    local_vars: HashMap<u32, Variable>,
    local_slots: HashMap<u32, StackSlot>,
    token_refs: HashMap<u32, FuncRef>,
    ret_type: MachineType,
    terminated: bool,
}

impl<'a, 'b> Lowerer<'a, 'b> {
    fn new(
        builder: &'a mut FunctionBuilder<'b>,
        params: &[MachineType],
        locals: &[LocalDef],
        ret_type: MachineType,
        token_refs: HashMap<u32, FuncRef>,
    ) -> Self {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);

        let mut var_index = 0;
        let entry_params = builder.block_params(entry).to_vec();
        let mut arg_vars = Vec::with_capacity(params.len());
        for (i, &param) in params.iter().enumerate() {
            let var = Variable::new(var_index);
            var_index += 1;
            builder.declare_var(var, machine_to_cl(param));
            builder.def_var(var, entry_params[i]);
            arg_vars.push(var);
        }

        let mut local_vars = HashMap::new();
        let mut local_slots = HashMap::new();
        for (i, def) in locals.iter().enumerate() {
            match def {
                LocalDef::Scalar(ty) => {
                    let cl_ty = machine_to_cl(*ty);
                    let var = Variable::new(var_index);
                    var_index += 1;
                    builder.declare_var(var, cl_ty);
                    let zero = if cl_ty == types::F64 {
                        builder.ins().f64const(0.0)
                    } else {
                        builder.ins().iconst(cl_ty, 0)
                    };
                    builder.def_var(var, zero);
                    local_vars.insert(i as u32, var);
                }
                LocalDef::Aggregate(bytes) => {
                    let slot = builder.create_sized_stack_slot(StackSlotData::new(
                        StackSlotKind::ExplicitSlot,
                        *bytes,
                        3,
                    ));
                    local_slots.insert(i as u32, slot);
                }
            }
        }

        Self {
            builder,
            stack: Vec::new(),
            labels: Vec::new(),
            arg_vars,
            local_vars,
            local_slots,
            token_refs,
            ret_type,
            terminated: false,
        }
    }

    fn value_type(&self, value: Value) -> types::Type {
        self.builder.func.dfg.value_type(value)
    }

    fn pop_value(&mut self) -> Result<Value, CompileError> {
        self.stack.pop().ok_or_else(|| {
            CompileError::Codegen("IL evaluation stack underflow".to_string())
        })
    }

    fn label_info(&mut self, label: Label) -> &mut LabelInfo {
        if self.labels.len() <= label.0 as usize {
            self.labels.resize(label.0 as usize + 1, LabelInfo::default());
        }
        &mut self.labels[label.0 as usize]
    }

    /// The label's block, binding its parameter types to the current stack
    /// shape on first reference.
    fn target_block(&mut self, label: Label) -> Result<Block, CompileError> {
        let stack_types: Vec<types::Type> =
            self.stack.iter().map(|&v| self.value_type(v)).collect();
        let info = self.label_info(label).clone();
        let block = match info.block {
            Some(block) => block,
            None => {
                let block = self.builder.create_block();
                self.label_info(label).block = Some(block);
                block
            }
        };
        match info.stack_types {
            Some(bound) => {
                if bound != stack_types {
                    return Err(CompileError::Codegen(
                        "inconsistent stack shape at branch target".to_string(),
                    ));
                }
            }
            None => {
                for &ty in &stack_types {
                    self.builder.append_block_param(block, ty);
                }
                self.label_info(label).stack_types = Some(stack_types);
            }
        }
        Ok(block)
    }

    /// Continuation block mirroring the current stack, for the fall-through
    /// side of a conditional branch.
    fn continuation_block(&mut self) -> Block {
        let block = self.builder.create_block();
        for i in 0..self.stack.len() {
            let ty = self.value_type(self.stack[i]);
            self.builder.append_block_param(block, ty);
        }
        block
    }

    fn condition(&mut self, kind: BranchKind) -> Result<Value, CompileError> {
        match kind {
            BranchKind::True | BranchKind::False => {
                let value = self.pop_value()?;
                let cond = if self.value_type(value) == types::F64 {
                    let zero = self.builder.ins().f64const(0.0);
                    self.builder.ins().fcmp(FloatCC::NotEqual, value, zero)
                } else {
                    value
                };
                Ok(cond)
            }
            BranchKind::Always => unreachable!("Always has no condition"),
            _ => {
                let b = self.pop_value()?;
                let a = self.pop_value()?;
                self.compare_values(kind, a, b)
            }
        }
    }

    fn compare_values(
        &mut self,
        kind: BranchKind,
        a: Value,
        b: Value,
    ) -> Result<Value, CompileError> {
        if self.value_type(a) != self.value_type(b) {
            return Err(CompileError::Codegen(
                "comparison operands have mismatched machine types".to_string(),
            ));
        }
        if self.value_type(a) == types::F64 {
            let cc = match kind {
                BranchKind::Equal => FloatCC::Equal,
                BranchKind::NotEqual => FloatCC::NotEqual,
                BranchKind::Less => FloatCC::LessThan,
                BranchKind::LessEqual | BranchKind::LessEqualUnsigned => FloatCC::LessThanOrEqual,
                BranchKind::Greater => FloatCC::GreaterThan,
                BranchKind::GreaterEqual => FloatCC::GreaterThanOrEqual,
                _ => {
                    return Err(CompileError::Codegen(
                        "truth branch kind used as comparison".to_string(),
                    ))
                }
            };
            Ok(self.builder.ins().fcmp(cc, a, b))
        } else {
            let cc = match kind {
                BranchKind::Equal => IntCC::Equal,
                BranchKind::NotEqual => IntCC::NotEqual,
                BranchKind::Less => IntCC::SignedLessThan,
                BranchKind::LessEqual => IntCC::SignedLessThanOrEqual,
                BranchKind::Greater => IntCC::SignedGreaterThan,
                BranchKind::GreaterEqual => IntCC::SignedGreaterThanOrEqual,
                BranchKind::LessEqualUnsigned => IntCC::UnsignedLessThanOrEqual,
                _ => {
                    return Err(CompileError::Codegen(
                        "truth branch kind used as comparison".to_string(),
                    ))
                }
            };
            Ok(self.builder.ins().icmp(cc, a, b))
        }
    }

    fn run(
        &mut self,
        ops: &[IlOp],
        il_call_sites: &mut Vec<(u32, u32)>,
    ) -> Result<(), CompileError> {
        for (il_offset, op) in ops.iter().enumerate() {
            // Skip unreachable emission until the next label mark.
            if self.terminated && !matches!(op, IlOp::Mark(_)) {
                continue;
            }
            match *op {
                IlOp::Mark(label) => self.lower_mark(label)?,
                IlOp::LdI4(v) => {
                    let value = self.builder.ins().iconst(types::I32, v as i64);
                    self.stack.push(value);
                }
                IlOp::LdU4(v) => {
                    // Same bit pattern; iconst wants the I32 immediate in
                    // signed range.
                    let value = self.builder.ins().iconst(types::I32, v as i32 as i64);
                    self.stack.push(value);
                }
                IlOp::LdI8(v) => {
                    let value = self.builder.ins().iconst(types::I64, v);
                    self.stack.push(value);
                }
                IlOp::LdR8(v) => {
                    let value = self.builder.ins().f64const(v);
                    self.stack.push(value);
                }
                IlOp::LdPtr(v) => {
                    let value = self.builder.ins().iconst(types::I64, v as i64);
                    self.stack.push(value);
                }
                IlOp::LdArg(index) => {
                    let var = *self.arg_vars.get(index).ok_or_else(|| {
                        CompileError::Codegen(format!("ld_arg {} out of range", index))
                    })?;
                    let value = self.builder.use_var(var);
                    self.stack.push(value);
                }
                IlOp::LdLoc(local) => {
                    if let Some(&slot) = self.local_slots.get(&local.0) {
                        let addr = self.builder.ins().stack_addr(types::I64, slot, 0);
                        self.stack.push(addr);
                    } else {
                        let var = *self.local_vars.get(&local.0).ok_or_else(|| {
                            CompileError::Codegen(format!("unknown local {}", local.0))
                        })?;
                        let value = self.builder.use_var(var);
                        self.stack.push(value);
                    }
                }
                IlOp::StLoc(local) => {
                    let value = self.pop_value()?;
                    let var = *self.local_vars.get(&local.0).ok_or_else(|| {
                        CompileError::Codegen(format!(
                            "store to non-scalar local {}",
                            local.0
                        ))
                    })?;
                    self.builder.def_var(var, value);
                }
                IlOp::Dup => {
                    let top = *self.stack.last().ok_or_else(|| {
                        CompileError::Codegen("dup on empty IL stack".to_string())
                    })?;
                    self.stack.push(top);
                }
                IlOp::Pop => {
                    self.pop_value()?;
                }
                IlOp::LdInd(ty, offset) => {
                    let addr = self.pop_value()?;
                    let value =
                        self.builder
                            .ins()
                            .load(machine_to_cl(ty), MemFlags::new(), addr, offset);
                    self.stack.push(value);
                }
                IlOp::StInd(ty, offset) => {
                    let addr = self.pop_value()?;
                    let value = self.pop_value()?;
                    debug_assert_eq!(self.value_type(value), machine_to_cl(ty));
                    self.builder.ins().store(MemFlags::new(), value, addr, offset);
                }
                IlOp::Branch(BranchKind::Always, label) => {
                    let args = self.stack.clone();
                    let block = self.target_block(label)?;
                    self.builder.ins().jump(block, &args);
                    self.terminated = true;
                }
                IlOp::Branch(kind, label) => {
                    let cond = self.condition(kind)?;
                    let args = self.stack.clone();
                    let target = self.target_block(label)?;
                    let cont = self.continuation_block();
                    if kind == BranchKind::False {
                        self.builder.ins().brif(cond, cont, &args, target, &args);
                    } else {
                        self.builder.ins().brif(cond, target, &args, cont, &args);
                    }
                    self.builder.switch_to_block(cont);
                    self.stack = self.builder.block_params(cont).to_vec();
                }
                IlOp::Compare(kind) => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let cond = self.compare_values(kind, a, b)?;
                    let widened = self.builder.ins().uextend(types::I32, cond);
                    self.stack.push(widened);
                }
                IlOp::Call(token) => {
                    let proto = runtime::helper(token).ok_or_else(|| {
                        CompileError::Codegen(format!("unregistered helper token {}", token))
                    })?;
                    let func_ref = *self.token_refs.get(&token).expect("token declared");
                    if self.stack.len() < proto.params.len() {
                        return Err(CompileError::Codegen(format!(
                            "call to {} with too few operands",
                            proto.name
                        )));
                    }
                    let args = self.stack.split_off(self.stack.len() - proto.params.len());
                    let call = self.builder.ins().call(func_ref, &args);
                    let results = self.builder.inst_results(call);
                    if proto.ret.is_some() {
                        self.stack.push(results[0]);
                    }
                    il_call_sites.push((token, il_offset as u32));
                }
                IlOp::Add => self.lower_arith(|builder, a, b, float| {
                    if float {
                        builder.ins().fadd(a, b)
                    } else {
                        builder.ins().iadd(a, b)
                    }
                })?,
                IlOp::Sub => self.lower_arith(|builder, a, b, float| {
                    if float {
                        builder.ins().fsub(a, b)
                    } else {
                        builder.ins().isub(a, b)
                    }
                })?,
                IlOp::Mul => self.lower_arith(|builder, a, b, float| {
                    if float {
                        builder.ins().fmul(a, b)
                    } else {
                        builder.ins().imul(a, b)
                    }
                })?,
                IlOp::Div => self.lower_arith(|builder, a, b, float| {
                    if float {
                        builder.ins().fdiv(a, b)
                    } else {
                        builder.ins().sdiv(a, b)
                    }
                })?,
                IlOp::Mod => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    if self.value_type(a) == types::F64 {
                        return Err(CompileError::Codegen(
                            "machine modulo is integer-only".to_string(),
                        ));
                    }
                    let value = self.builder.ins().srem(a, b);
                    self.stack.push(value);
                }
                IlOp::Neg => {
                    let a = self.pop_value()?;
                    let value = if self.value_type(a) == types::F64 {
                        self.builder.ins().fneg(a)
                    } else {
                        self.builder.ins().ineg(a)
                    };
                    self.stack.push(value);
                }
                IlOp::Shl => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let value = self.builder.ins().ishl(a, b);
                    self.stack.push(value);
                }
                IlOp::Shr => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let value = self.builder.ins().sshr(a, b);
                    self.stack.push(value);
                }
                IlOp::And => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let value = self.builder.ins().band(a, b);
                    self.stack.push(value);
                }
                IlOp::Or => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let value = self.builder.ins().bor(a, b);
                    self.stack.push(value);
                }
                IlOp::Xor => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    let value = self.builder.ins().bxor(a, b);
                    self.stack.push(value);
                }
                IlOp::Not => {
                    let a = self.pop_value()?;
                    let zero = if self.value_type(a) == types::F64 {
                        let zero = self.builder.ins().f64const(0.0);
                        self.builder.ins().fcmp(FloatCC::Equal, a, zero)
                    } else {
                        let ty = self.value_type(a);
                        let zero = self.builder.ins().iconst(ty, 0);
                        self.builder.ins().icmp(IntCC::Equal, a, zero)
                    };
                    let widened = self.builder.ins().uextend(types::I32, zero);
                    self.stack.push(widened);
                }
                IlOp::ConvR8 => {
                    let a = self.pop_value()?;
                    let value = self.builder.ins().fcvt_from_sint(types::F64, a);
                    self.stack.push(value);
                }
                IlOp::ConvI8 => {
                    let a = self.pop_value()?;
                    let value = if self.value_type(a) == types::I64 {
                        a
                    } else {
                        self.builder.ins().sextend(types::I64, a)
                    };
                    self.stack.push(value);
                }
                IlOp::Ret => {
                    let value = self.pop_value()?;
                    debug_assert_eq!(self.value_type(value), machine_to_cl(self.ret_type));
                    self.builder.ins().return_(&[value]);
                    self.terminated = true;
                }
            }
        }
        if !self.terminated {
            return Err(CompileError::Codegen(
                "IL stream does not end in a terminator".to_string(),
            ));
        }
        Ok(())
    }

    fn lower_mark(&mut self, label: Label) -> Result<(), CompileError> {
        if !self.terminated {
            // Fall-through: enter the label's block with the live stack.
            let args = self.stack.clone();
            let block = self.target_block(label)?;
            self.builder.ins().jump(block, &args);
        }
        let info = self.label_info(label).clone();
        let block = match info.block {
            Some(block) => block,
            None => {
                // Marked before any reference while unreachable: give it an
                // empty stack shape.
                let block = self.builder.create_block();
                self.label_info(label).block = Some(block);
                self.label_info(label).stack_types = Some(Vec::new());
                block
            }
        };
        self.builder.switch_to_block(block);
        self.stack = self.builder.block_params(block).to_vec();
        self.terminated = false;
        Ok(())
    }

    fn lower_arith(
        &mut self,
        emit: impl FnOnce(&mut FunctionBuilder<'_>, Value, Value, bool) -> Value,
    ) -> Result<(), CompileError> {
        let b = self.pop_value()?;
        let a = self.pop_value()?;
        if self.value_type(a) != self.value_type(b) {
            return Err(CompileError::Codegen(
                "arithmetic operands have mismatched machine types".to_string(),
            ));
        }
        let float = self.value_type(a) == types::F64;
        let value = emit(self.builder, a, b, float);
        self.stack.push(value);
        Ok(())
    }
}
