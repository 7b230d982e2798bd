//! Runtime support: helper tokens, the process-wide registry, the error
//! slot, and the frame ABI emitted code is compiled against.
//!
//! The compiler core never holds object pointers; it refers to runtime
//! functionality exclusively through stable token ids resolved here. The
//! registry is initialized once under a one-shot barrier before any
//! compile and is read-only afterwards.
//!
//! Emitted functions have the calling convention
//! `extern "C" fn(*mut Frame, *mut ThreadState) -> *mut PyObj`, returning
//! null with the thread's error slot set to signal an exception, matching
//! the host interpreter's contract.

pub mod helpers;
pub mod object;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::{Lazy, OnceCell};

use crate::bytecode::Const;
use crate::ilgen::MachineType;
use object::{alloc, decref, ExcKind, ObjKind, ObjPtr};

// ---------------------------------------------------------------------
// Helper tokens
// ---------------------------------------------------------------------

pub const METHOD_INCREF: u32 = 1;
pub const METHOD_DECREF: u32 = 2;
pub const METHOD_XDECREF: u32 = 3;
pub const METHOD_ADD: u32 = 10;
pub const METHOD_SUBTRACT: u32 = 11;
pub const METHOD_MULTIPLY: u32 = 12;
pub const METHOD_TRUE_DIVIDE: u32 = 13;
pub const METHOD_FLOOR_DIVIDE: u32 = 14;
pub const METHOD_MODULO: u32 = 15;
pub const METHOD_POWER: u32 = 16;
pub const METHOD_LSHIFT: u32 = 17;
pub const METHOD_RSHIFT: u32 = 18;
pub const METHOD_AND: u32 = 19;
pub const METHOD_OR: u32 = 20;
pub const METHOD_XOR: u32 = 21;
pub const METHOD_RICHCMP: u32 = 25;
pub const METHOD_CONTAINS: u32 = 26;
pub const METHOD_UNARY_POSITIVE: u32 = 30;
pub const METHOD_UNARY_NEGATIVE: u32 = 31;
pub const METHOD_UNARY_NOT: u32 = 32;
pub const METHOD_UNARY_INVERT: u32 = 33;
pub const METHOD_TRUTH: u32 = 35;
pub const METHOD_SUBSCR: u32 = 40;
pub const METHOD_STORE_SUBSCR: u32 = 41;
pub const METHOD_GETITER: u32 = 45;
pub const METHOD_ITERNEXT: u32 = 46;
pub const METHOD_LIST_FROM_BUFFER: u32 = 50;
pub const METHOD_TUPLE_FROM_BUFFER: u32 = 51;
pub const METHOD_SET_FROM_BUFFER: u32 = 52;
pub const METHOD_MAP_FROM_BUFFER: u32 = 53;
pub const METHOD_BUILD_SLICE: u32 = 54;
pub const METHOD_LIST_APPEND: u32 = 55;
pub const METHOD_LIST_EXTEND: u32 = 56;
pub const METHOD_SET_UPDATE: u32 = 57;
pub const METHOD_DICT_UPDATE: u32 = 58;
pub const METHOD_UNPACK_SEQUENCE: u32 = 60;
pub const METHOD_CALL_FUNCTION: u32 = 61;
pub const METHOD_LOAD_CONST: u32 = 65;
pub const METHOD_LOAD_NONE: u32 = 66;
pub const METHOD_LOAD_ASSERTION_ERROR: u32 = 67;
pub const METHOD_RAISE: u32 = 70;
pub const METHOD_RERAISE: u32 = 71;
pub const METHOD_FETCH_EXC: u32 = 72;
pub const METHOD_ERR_OCCURRED: u32 = 73;
pub const METHOD_ZERO_DIVISION_ERROR: u32 = 74;
pub const METHOD_UNBOUND_LOCAL: u32 = 75;
pub const METHOD_BOX_INT: u32 = 80;
pub const METHOD_BOX_FLOAT: u32 = 81;
pub const METHOD_BOX_BOOL: u32 = 82;
pub const METHOD_UNBOX_INT: u32 = 83;
pub const METHOD_UNBOX_FLOAT: u32 = 84;
pub const METHOD_UNBOX_BOOL: u32 = 85;
pub const METHOD_INT_TRUE_DIVIDE: u32 = 90;

/// A registered helper: symbol name, native address, and prototype.
#[derive(Debug, Clone)]
pub struct HelperProto {
    pub name: &'static str,
    pub address: usize,
    pub params: &'static [MachineType],
    pub ret: Option<MachineType>,
}

static REGISTRY: OnceCell<HashMap<u32, HelperProto>> = OnceCell::new();

/// Register every helper. Idempotent; must run before any compile.
pub fn init() {
    REGISTRY.get_or_init(|| {
        use MachineType::*;
        let mut table = HashMap::new();
        let mut register =
            |token: u32,
             name: &'static str,
             address: usize,
             params: &'static [MachineType],
             ret: Option<MachineType>| {
                table.insert(
                    token,
                    HelperProto {
                        name,
                        address,
                        params,
                        ret,
                    },
                );
            };
        register(
            METHOD_INCREF,
            "pyjit_incref",
            helpers::helper_incref as usize,
            &[Ptr],
            None,
        );
        register(
            METHOD_DECREF,
            "pyjit_decref",
            helpers::helper_decref as usize,
            &[Ptr],
            None,
        );
        register(
            METHOD_XDECREF,
            "pyjit_xdecref",
            helpers::helper_xdecref as usize,
            &[Ptr],
            None,
        );
        register(
            METHOD_ADD,
            "pyjit_add",
            helpers::helper_add as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_SUBTRACT,
            "pyjit_subtract",
            helpers::helper_subtract as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_MULTIPLY,
            "pyjit_multiply",
            helpers::helper_multiply as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_TRUE_DIVIDE,
            "pyjit_true_divide",
            helpers::helper_true_divide as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_FLOOR_DIVIDE,
            "pyjit_floor_divide",
            helpers::helper_floor_divide as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_MODULO,
            "pyjit_modulo",
            helpers::helper_modulo as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_POWER,
            "pyjit_power",
            helpers::helper_power as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_LSHIFT,
            "pyjit_lshift",
            helpers::helper_lshift as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_RSHIFT,
            "pyjit_rshift",
            helpers::helper_rshift as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_AND,
            "pyjit_and",
            helpers::helper_bit_and as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_OR,
            "pyjit_or",
            helpers::helper_bit_or as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_XOR,
            "pyjit_xor",
            helpers::helper_bit_xor as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_RICHCMP,
            "pyjit_richcmp",
            helpers::helper_richcmp as usize,
            &[Ptr, Ptr, Int32],
            Some(Ptr),
        );
        register(
            METHOD_CONTAINS,
            "pyjit_contains",
            helpers::helper_contains as usize,
            &[Ptr, Ptr, Int32],
            Some(Ptr),
        );
        register(
            METHOD_UNARY_POSITIVE,
            "pyjit_unary_positive",
            helpers::helper_unary_positive as usize,
            &[Ptr],
            Some(Ptr),
        );
        register(
            METHOD_UNARY_NEGATIVE,
            "pyjit_unary_negative",
            helpers::helper_unary_negative as usize,
            &[Ptr],
            Some(Ptr),
        );
        register(
            METHOD_UNARY_NOT,
            "pyjit_unary_not",
            helpers::helper_unary_not as usize,
            &[Ptr],
            Some(Ptr),
        );
        register(
            METHOD_UNARY_INVERT,
            "pyjit_unary_invert",
            helpers::helper_unary_invert as usize,
            &[Ptr],
            Some(Ptr),
        );
        register(
            METHOD_TRUTH,
            "pyjit_truth",
            helpers::helper_truth as usize,
            &[Ptr],
            Some(Int32),
        );
        register(
            METHOD_SUBSCR,
            "pyjit_subscr",
            helpers::helper_subscr as usize,
            &[Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_STORE_SUBSCR,
            "pyjit_store_subscr",
            helpers::helper_store_subscr as usize,
            &[Ptr, Ptr, Ptr],
            Some(Int32),
        );
        register(
            METHOD_GETITER,
            "pyjit_getiter",
            helpers::helper_getiter as usize,
            &[Ptr],
            Some(Ptr),
        );
        register(
            METHOD_ITERNEXT,
            "pyjit_iternext",
            helpers::helper_iternext as usize,
            &[Ptr],
            Some(Ptr),
        );
        register(
            METHOD_LIST_FROM_BUFFER,
            "pyjit_list_from_buffer",
            helpers::helper_list_from_buffer as usize,
            &[Ptr, Int64],
            Some(Ptr),
        );
        register(
            METHOD_TUPLE_FROM_BUFFER,
            "pyjit_tuple_from_buffer",
            helpers::helper_tuple_from_buffer as usize,
            &[Ptr, Int64],
            Some(Ptr),
        );
        register(
            METHOD_SET_FROM_BUFFER,
            "pyjit_set_from_buffer",
            helpers::helper_set_from_buffer as usize,
            &[Ptr, Int64],
            Some(Ptr),
        );
        register(
            METHOD_MAP_FROM_BUFFER,
            "pyjit_map_from_buffer",
            helpers::helper_map_from_buffer as usize,
            &[Ptr, Int64],
            Some(Ptr),
        );
        register(
            METHOD_BUILD_SLICE,
            "pyjit_build_slice",
            helpers::helper_build_slice as usize,
            &[Ptr, Ptr, Ptr],
            Some(Ptr),
        );
        register(
            METHOD_LIST_APPEND,
            "pyjit_list_append",
            helpers::helper_list_append as usize,
            &[Ptr, Ptr],
            Some(Int32),
        );
        register(
            METHOD_LIST_EXTEND,
            "pyjit_list_extend",
            helpers::helper_list_extend as usize,
            &[Ptr, Ptr],
            Some(Int32),
        );
        register(
            METHOD_SET_UPDATE,
            "pyjit_set_update",
            helpers::helper_set_update as usize,
            &[Ptr, Ptr],
            Some(Int32),
        );
        register(
            METHOD_DICT_UPDATE,
            "pyjit_dict_update",
            helpers::helper_dict_update as usize,
            &[Ptr, Ptr],
            Some(Int32),
        );
        register(
            METHOD_UNPACK_SEQUENCE,
            "pyjit_unpack_sequence",
            helpers::helper_unpack_sequence as usize,
            &[Ptr, Ptr, Int64],
            Some(Int32),
        );
        register(
            METHOD_CALL_FUNCTION,
            "pyjit_call_function",
            helpers::helper_call_function as usize,
            &[Ptr, Ptr, Int64],
            Some(Ptr),
        );
        register(
            METHOD_LOAD_CONST,
            "pyjit_load_const",
            helpers::helper_load_const as usize,
            &[Int32],
            Some(Ptr),
        );
        register(
            METHOD_LOAD_NONE,
            "pyjit_load_none",
            helpers::helper_load_none as usize,
            &[],
            Some(Ptr),
        );
        register(
            METHOD_LOAD_ASSERTION_ERROR,
            "pyjit_load_assertion_error",
            helpers::helper_load_assertion_error as usize,
            &[],
            Some(Ptr),
        );
        register(
            METHOD_RAISE,
            "pyjit_raise",
            helpers::helper_raise as usize,
            &[Ptr],
            Some(Int32),
        );
        register(
            METHOD_RERAISE,
            "pyjit_reraise",
            helpers::helper_reraise as usize,
            &[],
            Some(Int32),
        );
        register(
            METHOD_FETCH_EXC,
            "pyjit_fetch_exc",
            helpers::helper_fetch_exc as usize,
            &[Ptr],
            None,
        );
        register(
            METHOD_ERR_OCCURRED,
            "pyjit_err_occurred",
            helpers::helper_err_occurred as usize,
            &[],
            Some(Int32),
        );
        register(
            METHOD_ZERO_DIVISION_ERROR,
            "pyjit_zero_division_error",
            helpers::helper_zero_division_error as usize,
            &[],
            None,
        );
        register(
            METHOD_UNBOUND_LOCAL,
            "pyjit_unbound_local",
            helpers::helper_unbound_local as usize,
            &[Int32],
            None,
        );
        register(
            METHOD_BOX_INT,
            "pyjit_box_int",
            helpers::helper_box_int as usize,
            &[Int64],
            Some(Ptr),
        );
        register(
            METHOD_BOX_FLOAT,
            "pyjit_box_float",
            helpers::helper_box_float as usize,
            &[Float64],
            Some(Ptr),
        );
        register(
            METHOD_BOX_BOOL,
            "pyjit_box_bool",
            helpers::helper_box_bool as usize,
            &[Int32],
            Some(Ptr),
        );
        register(
            METHOD_UNBOX_INT,
            "pyjit_unbox_int",
            helpers::helper_unbox_int as usize,
            &[Ptr],
            Some(Int64),
        );
        register(
            METHOD_UNBOX_FLOAT,
            "pyjit_unbox_float",
            helpers::helper_unbox_float as usize,
            &[Ptr],
            Some(Float64),
        );
        register(
            METHOD_UNBOX_BOOL,
            "pyjit_unbox_bool",
            helpers::helper_unbox_bool as usize,
            &[Ptr],
            Some(Int32),
        );
        register(
            METHOD_INT_TRUE_DIVIDE,
            "pyjit_int_true_divide",
            helpers::helper_int_true_divide as usize,
            &[Int64, Int64],
            Some(Float64),
        );
        table
    });
}

/// Prototype for a token, if registered.
pub fn helper(token: u32) -> Option<&'static HelperProto> {
    REGISTRY.get().and_then(|table| table.get(&token))
}

/// The full registry, for backend symbol registration.
pub fn helpers_table() -> &'static HashMap<u32, HelperProto> {
    init();
    REGISTRY.get().expect("registry initialized")
}

// ---------------------------------------------------------------------
// Error slot
// ---------------------------------------------------------------------

thread_local! {
    static CURRENT_ERROR: Cell<ObjPtr> = const { Cell::new(std::ptr::null_mut()) };
}

/// Record an exception of `kind` as the thread's current error.
pub fn set_error(kind: ExcKind, msg: &str) {
    set_error_obj(alloc(ObjKind::Exception {
        kind,
        msg: msg.to_string(),
    }));
}

/// Install an owned exception instance as the current error, replacing
/// any pending one.
pub(crate) fn set_error_obj(exc: ObjPtr) {
    CURRENT_ERROR.with(|slot| {
        let old = slot.replace(exc);
        if !old.is_null() {
            unsafe { decref(old) };
        }
    });
}

/// Whether an error is pending on this thread.
pub fn error_occurred() -> bool {
    CURRENT_ERROR.with(|slot| !slot.get().is_null())
}

/// Take the pending exception object, clearing the slot.
pub(crate) fn take_error_obj() -> Option<ObjPtr> {
    CURRENT_ERROR.with(|slot| {
        let exc = slot.replace(std::ptr::null_mut());
        if exc.is_null() {
            None
        } else {
            Some(exc)
        }
    })
}

/// Take and decode the pending error, for hosts and tests.
pub fn take_error() -> Option<(ExcKind, String)> {
    take_error_obj().map(|exc| unsafe {
        let decoded = match &(*exc).kind {
            ObjKind::Exception { kind, msg } => (*kind, msg.clone()),
            _ => (ExcKind::RuntimeError, String::new()),
        };
        decref(exc);
        decoded
    })
}

// ---------------------------------------------------------------------
// Constant pool
// ---------------------------------------------------------------------

static CONST_POOL: Lazy<Mutex<Vec<Const>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Intern a constant, returning its pool id. Ids are process-lifetime;
/// emitted code references constants only through them.
pub fn intern_const(value: &Const) -> u32 {
    let mut pool = CONST_POOL.lock().expect("const pool lock");
    if let Some(existing) = pool.iter().position(|c| c == value) {
        return existing as u32;
    }
    pool.push(value.clone());
    (pool.len() - 1) as u32
}

fn const_to_obj(value: &Const) -> ObjPtr {
    match value {
        Const::None => alloc(ObjKind::None),
        Const::Bool(b) => alloc(ObjKind::Bool(*b)),
        Const::Int(i) => alloc(ObjKind::Int(*i)),
        Const::Float(f) => alloc(ObjKind::Float(*f)),
        Const::Str(s) => alloc(ObjKind::Str(s.clone())),
        Const::Bytes(v) => alloc(ObjKind::Bytes(v.clone())),
        Const::ByteArray(v) => alloc(ObjKind::ByteArray(std::cell::RefCell::new(v.clone()))),
        Const::Tuple(items) => alloc(ObjKind::Tuple(items.iter().map(const_to_obj).collect())),
    }
}

/// Materialize pool entry `id` as a fresh object reference. Mutable
/// constants (bytearray) come back as independent copies every load.
pub(crate) fn const_from_pool(id: u32) -> ObjPtr {
    let pool = CONST_POOL.lock().expect("const pool lock");
    match pool.get(id as usize) {
        Some(value) => const_to_obj(value),
        None => {
            set_error(ExcKind::RuntimeError, "constant pool id out of range");
            std::ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------
// Frame ABI
// ---------------------------------------------------------------------

/// The frame object emitted code receives. Field offsets are part of the
/// compiled ABI; keep them in sync with the driver's constants.
#[repr(C)]
pub struct Frame {
    /// Byte offset of the most recently executed instruction.
    pub lasti: i32,
    /// Pointer to the local variable slots; null means unassigned.
    pub localsplus: *mut ObjPtr,
}

/// Offset of `Frame::lasti`.
pub const FRAME_LASTI_OFFSET: i32 = 0;
/// Offset of `Frame::localsplus`.
pub const FRAME_LOCALS_OFFSET: i32 = 8;

/// Opaque host thread state handed through to emitted code.
#[repr(C)]
pub struct ThreadState {
    _reserved: usize,
}

impl ThreadState {
    pub fn new() -> Self {
        Self { _reserved: 0 }
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Signature of a compiled function.
pub type EvalFn = unsafe extern "C" fn(*mut Frame, *mut ThreadState) -> ObjPtr;

/// Invoke a compiled method with the given argument objects (references
/// stolen), returning the result or the decoded exception.
///
/// This is the embedding shim used by hosts and tests: it owns the frame,
/// seeds the first slots with `args`, and releases whatever the locals
/// hold after the call returns.
pub fn invoke(
    method: &crate::ilgen::JitMethod,
    args: Vec<ObjPtr>,
    local_count: usize,
) -> Result<ObjPtr, (ExcKind, String)> {
    let mut slots: Vec<ObjPtr> = vec![std::ptr::null_mut(); local_count.max(args.len())];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = arg;
    }
    let mut frame = Frame {
        lasti: 0,
        localsplus: slots.as_mut_ptr(),
    };
    let mut tstate = ThreadState::new();
    let entry: EvalFn = unsafe { method.cast() };
    let result = unsafe { entry(&mut frame, &mut tstate) };
    for slot in slots {
        if !slot.is_null() {
            unsafe { decref(slot) };
        }
    }
    if result.is_null() {
        Err(take_error().unwrap_or((ExcKind::RuntimeError, "error slot empty".to_string())))
    } else {
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip() {
        init();
        let proto = helper(METHOD_INT_TRUE_DIVIDE).unwrap();
        assert_eq!(proto.name, "pyjit_int_true_divide");
        assert_eq!(proto.params.len(), 2);
        assert_eq!(proto.ret, Some(MachineType::Float64));
        assert_ne!(proto.address, 0);
    }

    #[test]
    fn test_error_slot_round_trip() {
        assert!(!error_occurred());
        set_error(ExcKind::ValueError, "boom");
        assert!(error_occurred());
        let (kind, msg) = take_error().unwrap();
        assert_eq!(kind, ExcKind::ValueError);
        assert_eq!(msg, "boom");
        assert!(!error_occurred());
    }

    #[test]
    fn test_const_pool_interns_and_materializes() {
        let id = intern_const(&Const::Int(42));
        let same = intern_const(&Const::Int(42));
        assert_eq!(id, same);
        let obj = const_from_pool(id);
        unsafe {
            assert!(matches!((*obj).kind, ObjKind::Int(42)));
            decref(obj);
        }
    }

    #[test]
    fn test_bytearray_consts_are_copies() {
        let id = intern_const(&Const::ByteArray(b"ab".to_vec()));
        let a = const_from_pool(id);
        let b = const_from_pool(id);
        assert_ne!(a, b);
        unsafe {
            if let ObjKind::ByteArray(bytes) = &(*a).kind {
                bytes.borrow_mut()[0] = b'z';
            }
            if let ObjKind::ByteArray(bytes) = &(*b).kind {
                assert_eq!(bytes.borrow()[0], b'a');
            }
            decref(a);
            decref(b);
        }
    }
}
