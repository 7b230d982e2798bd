//! End-to-end tests: hand-assembled code objects compiled to native code
//! and invoked, with results compared against the host interpreter's
//! behavior for the same source.

use pyjit::bytecode::{assemble, CodeObject, Const, Opcode};
use pyjit::runtime::object::{decref, repr, ExcKind, ObjPtr};
use pyjit::runtime::{self};

fn compile_fn(
    name: &str,
    instrs: &[(Opcode, u32)],
    consts: Vec<Const>,
    varnames: &[&str],
    arg_count: usize,
) -> pyjit::JitMethod {
    let code = CodeObject::new(
        name,
        assemble(instrs),
        consts,
        varnames.iter().map(|s| s.to_string()).collect(),
        arg_count,
    );
    pyjit::compile(&code).expect("function should compile")
}

fn invoke_expecting_value(method: &pyjit::JitMethod, args: Vec<ObjPtr>, locals: usize) -> String {
    let result = runtime::invoke(method, args, locals).expect("function should not raise");
    let out = unsafe { repr(result) };
    unsafe { decref(result) };
    out
}

fn invoke_expecting_error(
    method: &pyjit::JitMethod,
    args: Vec<ObjPtr>,
    locals: usize,
) -> (ExcKind, String) {
    runtime::invoke(method, args, locals).expect_err("function should raise")
}

// def f(): return [1, *[2], 3, 4]
#[test]
fn test_list_display_with_unpacking() {
    let method = compile_fn(
        "list_display",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::BuildList, 1),
            (Opcode::LoadConst, 1),
            (Opcode::BuildList, 1),
            (Opcode::ListExtend, 1),
            (Opcode::LoadConst, 2),
            (Opcode::ListAppend, 1),
            (Opcode::LoadConst, 3),
            (Opcode::ListAppend, 1),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(1), Const::Int(2), Const::Int(3), Const::Int(4)],
        &[],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 0), "[1, 2, 3, 4]");
}

// def f(): l = [4, 3, 2, 1, 0]; return l[::-1]
#[test]
fn test_list_slice_reversal() {
    let method = compile_fn(
        "slice_reverse",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::LoadConst, 2),
            (Opcode::LoadConst, 3),
            (Opcode::LoadConst, 4),
            (Opcode::BuildList, 5),
            (Opcode::StoreFast, 0),
            (Opcode::LoadFast, 0),
            (Opcode::LoadConst, 5),
            (Opcode::LoadConst, 5),
            (Opcode::LoadConst, 6),
            (Opcode::BuildSlice, 3),
            (Opcode::BinarySubscr, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![
            Const::Int(4),
            Const::Int(3),
            Const::Int(2),
            Const::Int(1),
            Const::Int(0),
            Const::None,
            Const::Int(-1),
        ],
        &["l"],
        0,
    );
    assert_eq!(
        invoke_expecting_value(&method, vec![], 1),
        "[0, 1, 2, 3, 4]"
    );
}

// def f(): return {'c': 'carrot', **{'b': 'banana'}, 'a': 'apple'}
#[test]
fn test_dict_display_insertion_order() {
    let method = compile_fn(
        "dict_display",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BuildMap, 1),
            (Opcode::LoadConst, 2),
            (Opcode::LoadConst, 3),
            (Opcode::BuildMap, 1),
            (Opcode::DictUpdate, 1),
            (Opcode::LoadConst, 4),
            (Opcode::LoadConst, 5),
            (Opcode::BuildMap, 1),
            (Opcode::DictUpdate, 1),
            (Opcode::ReturnValue, 0),
        ],
        vec![
            Const::Str("c".into()),
            Const::Str("carrot".into()),
            Const::Str("b".into()),
            Const::Str("banana".into()),
            Const::Str("a".into()),
            Const::Str("apple".into()),
        ],
        &[],
        0,
    );
    assert_eq!(
        invoke_expecting_value(&method, vec![], 0),
        "{'c': 'carrot', 'b': 'banana', 'a': 'apple'}"
    );
}

// def f(): assert 1 == 2
#[test]
fn test_failing_assert_raises() {
    let method = compile_fn(
        "failing_assert",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::CompareOp, 2),
            (Opcode::PopJumpIfTrue, 12),
            (Opcode::LoadAssertionError, 0),
            (Opcode::RaiseVarargs, 1),
            (Opcode::LoadConst, 2),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(1), Const::Int(2), Const::None],
        &[],
        0,
    );
    let (kind, _) = invoke_expecting_error(&method, vec![], 0);
    assert_eq!(kind, ExcKind::AssertionError);
}

// def f(): return 'The train to Oxford leaves at 3pm'[-1:3:-2]
#[test]
fn test_string_slice_with_negative_step() {
    let method = compile_fn(
        "string_slice",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::LoadConst, 2),
            (Opcode::LoadConst, 3),
            (Opcode::BuildSlice, 3),
            (Opcode::BinarySubscr, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![
            Const::Str("The train to Oxford leaves at 3pm".into()),
            Const::Int(-1),
            Const::Int(3),
            Const::Int(-2),
        ],
        &[],
        0,
    );
    assert_eq!(
        invoke_expecting_value(&method, vec![], 0),
        "'m3t ealdox tnat'"
    );
}

// def f(): x = bytearray(b'12'); return x[2]
#[test]
fn test_bytearray_index_out_of_range() {
    let method = compile_fn(
        "bytearray_oob",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::StoreFast, 0),
            (Opcode::LoadFast, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BinarySubscr, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::ByteArray(b"12".to_vec()), Const::Int(2)],
        &["x"],
        0,
    );
    let (kind, _) = invoke_expecting_error(&method, vec![], 1);
    assert_eq!(kind, ExcKind::IndexError);
}

// def f(): return 1.5 * 2.0 + 3.0: runs entirely on unboxed doubles
#[test]
fn test_unboxed_float_arithmetic() {
    let method = compile_fn(
        "float_arith",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BinaryMultiply, 0),
            (Opcode::LoadConst, 2),
            (Opcode::BinaryAdd, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Float(1.5), Const::Float(2.0), Const::Float(3.0)],
        &[],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 0), "6.0");
}

// def f(): return 10 / 5: integer true division produces a float
#[test]
fn test_int_true_division() {
    let method = compile_fn(
        "int_div",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BinaryTrueDivide, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(10), Const::Int(5)],
        &[],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 0), "2.0");
}

// def f(): return 1 / 0: the unboxed division guard must still raise
#[test]
fn test_division_by_zero_raises() {
    let method = compile_fn(
        "div_zero",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BinaryTrueDivide, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(1), Const::Int(0)],
        &[],
        0,
    );
    let (kind, _) = invoke_expecting_error(&method, vec![], 0);
    assert_eq!(kind, ExcKind::ZeroDivisionError);
}

// def f(): return 2 if 1 < 2 else 3: unboxed compare feeding the branch
#[test]
fn test_conditional_expression() {
    let method = compile_fn(
        "conditional",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::CompareOp, 0),
            (Opcode::PopJumpIfFalse, 12),
            (Opcode::LoadConst, 2),
            (Opcode::ReturnValue, 0),
            (Opcode::LoadConst, 3),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(1), Const::Int(2), Const::Int(2), Const::Int(3)],
        &[],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 0), "2");
}

// def f():
//     total = 0
//     for x in (1, 2, 3):
//         total = total + x
//     return total
#[test]
fn test_for_loop_accumulates() {
    let method = compile_fn(
        "loop_sum",
        &[
            (Opcode::LoadConst, 0),    // 0
            (Opcode::StoreFast, 0),    // 2
            (Opcode::LoadConst, 1),    // 4
            (Opcode::GetIter, 0),      // 6
            (Opcode::ForIter, 12),     // 8 -> 22 when exhausted
            (Opcode::StoreFast, 1),    // 10
            (Opcode::LoadFast, 0),     // 12
            (Opcode::LoadFast, 1),     // 14
            (Opcode::BinaryAdd, 0),    // 16
            (Opcode::StoreFast, 0),    // 18
            (Opcode::JumpAbsolute, 8), // 20
            (Opcode::LoadFast, 0),     // 22
            (Opcode::ReturnValue, 0),  // 24
        ],
        vec![
            Const::Int(0),
            Const::Tuple(vec![Const::Int(1), Const::Int(2), Const::Int(3)]),
        ],
        &["total", "x"],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 2), "6");
}

// def f():
//     try:
//         x = b'12'[5]
//     except:
//         pass
//     return 42
#[test]
fn test_exception_caught_by_handler() {
    let method = compile_fn(
        "try_except",
        &[
            (Opcode::SetupExcept, 12),  // 0 -> handler at 14
            (Opcode::LoadConst, 0),     // 2
            (Opcode::LoadConst, 1),     // 4
            (Opcode::BinarySubscr, 0),  // 6
            (Opcode::StoreFast, 0),     // 8
            (Opcode::PopBlock, 0),      // 10
            (Opcode::JumpForward, 6),   // 12 -> 20
            (Opcode::PopTop, 0),        // 14
            (Opcode::PopTop, 0),        // 16
            (Opcode::PopTop, 0),        // 18
            (Opcode::LoadConst, 2),     // 20
            (Opcode::ReturnValue, 0),   // 22
        ],
        vec![
            Const::Bytes(b"12".to_vec()),
            Const::Int(5),
            Const::Int(42),
        ],
        &["x"],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 1), "42");
}

// def f():
//     i = 3
//     while True:
//         i = i - 1
//         if i == 0:
//             break
//     return i
#[test]
fn test_while_loop_with_break() {
    let method = compile_fn(
        "loop_break",
        &[
            (Opcode::LoadConst, 0),        // 0
            (Opcode::StoreFast, 0),        // 2
            (Opcode::SetupLoop, 22),       // 4 -> 28
            (Opcode::LoadFast, 0),         // 6
            (Opcode::LoadConst, 1),        // 8
            (Opcode::BinarySubtract, 0),   // 10
            (Opcode::StoreFast, 0),        // 12
            (Opcode::LoadFast, 0),         // 14
            (Opcode::LoadConst, 2),        // 16
            (Opcode::CompareOp, 2),        // 18
            (Opcode::PopJumpIfFalse, 24),  // 20
            (Opcode::BreakLoop, 0),        // 22
            (Opcode::JumpAbsolute, 6),     // 24
            (Opcode::PopBlock, 0),         // 26 (unreachable: while True)
            (Opcode::LoadFast, 0),         // 28
            (Opcode::ReturnValue, 0),      // 30
        ],
        vec![Const::Int(3), Const::Int(1), Const::Int(0)],
        &["i"],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 1), "0");
}

// def f(): return x: never assigned
#[test]
fn test_unbound_local_raises() {
    let method = compile_fn(
        "unbound",
        &[(Opcode::LoadFast, 0), (Opcode::ReturnValue, 0)],
        vec![],
        &["x"],
        0,
    );
    let (kind, _) = invoke_expecting_error(&method, vec![], 1);
    assert_eq!(kind, ExcKind::UnboundLocalError);
}

// def f(a, b): return a * b
#[test]
fn test_arguments_multiply() {
    let method = compile_fn(
        "mul_args",
        &[
            (Opcode::LoadFast, 0),
            (Opcode::LoadFast, 1),
            (Opcode::BinaryMultiply, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![],
        &["a", "b"],
        2,
    );
    let args = vec![
        runtime::object::alloc(runtime::object::ObjKind::Int(6)),
        runtime::object::alloc(runtime::object::ObjKind::Int(7)),
    ];
    assert_eq!(invoke_expecting_value(&method, args, 2), "42");
}

// def f(): l = [0]; l[0] = 5; return l
#[test]
fn test_store_subscript() {
    let method = compile_fn(
        "store_subscr",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::BuildList, 1),
            (Opcode::StoreFast, 0),
            (Opcode::LoadConst, 1),
            (Opcode::LoadFast, 0),
            (Opcode::LoadConst, 0),
            (Opcode::StoreSubscr, 0),
            (Opcode::LoadFast, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(0), Const::Int(5)],
        &["l"],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 1), "[5]");
}

// def f(): a, b = (1, 2); return a + b
#[test]
fn test_unpack_sequence() {
    let method = compile_fn(
        "unpack",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::UnpackSequence, 2),
            (Opcode::StoreFast, 0),
            (Opcode::StoreFast, 1),
            (Opcode::LoadFast, 0),
            (Opcode::LoadFast, 1),
            (Opcode::BinaryAdd, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Tuple(vec![Const::Int(1), Const::Int(2)])],
        &["a", "b"],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 2), "3");
}

// def f(): raise AssertionError('nope')
#[test]
fn test_raise_constructed_exception() {
    let method = compile_fn(
        "raise_with_message",
        &[
            (Opcode::LoadAssertionError, 0),
            (Opcode::LoadConst, 0),
            (Opcode::CallFunction, 1),
            (Opcode::RaiseVarargs, 1),
            (Opcode::LoadConst, 1),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Str("nope".into()), Const::None],
        &[],
        0,
    );
    let (kind, msg) = invoke_expecting_error(&method, vec![], 0);
    assert_eq!(kind, ExcKind::AssertionError);
    assert_eq!(msg, "nope");
}

// def f(): return 2 in {1, 2, 3}
#[test]
fn test_set_membership() {
    let method = compile_fn(
        "set_contains",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::LoadConst, 2),
            (Opcode::LoadConst, 3),
            (Opcode::BuildSet, 3),
            (Opcode::ContainsOp, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Int(2), Const::Int(1), Const::Int(2), Const::Int(3)],
        &[],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 0), "True");
}

// def f(): return b'' in b'x'
// The empty subsequence is a member of every bytes object.
#[test]
fn test_empty_bytes_membership() {
    let method = compile_fn(
        "empty_bytes_contains",
        &[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::ContainsOp, 0),
            (Opcode::ReturnValue, 0),
        ],
        vec![Const::Bytes(Vec::new()), Const::Bytes(b"x".to_vec())],
        &[],
        0,
    );
    assert_eq!(invoke_expecting_value(&method, vec![], 0), "True");
}

// Unsupported shapes abandon compilation instead of panicking.
#[test]
fn test_malformed_function_returns_none() {
    let code = CodeObject::new("bad", vec![255, 0], vec![], vec![], 0);
    assert!(pyjit::compile(&code).is_none());
}
