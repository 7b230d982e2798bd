//! Runtime helper functions invoked from emitted code.
//!
//! Every helper is an `extern "C"` function registered in the token
//! registry. The reference-handling convention matches the host's JIT
//! helpers: value-consuming helpers *steal* their operand references;
//! query helpers (`truth`, `iternext`) borrow. Object-producing helpers
//! return null with the thread's error slot set on failure; int-producing
//! helpers return -1.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;

use super::object::{
    alloc, decref, eq, hashable, incref, repr, truthy, ExcKind, ObjKind, ObjPtr, PyObj,
};
use super::{const_from_pool, set_error, set_error_obj, take_error_obj};

// ---------------------------------------------------------------------
// Reference counting
// ---------------------------------------------------------------------

pub extern "C" fn helper_incref(obj: ObjPtr) {
    unsafe { incref(obj) }
}

pub extern "C" fn helper_decref(obj: ObjPtr) {
    unsafe { decref(obj) }
}

pub extern "C" fn helper_xdecref(obj: ObjPtr) {
    if !obj.is_null() {
        unsafe { decref(obj) }
    }
}

// ---------------------------------------------------------------------
// Numeric plumbing
// ---------------------------------------------------------------------

/// The numeric value of an object, promoting bool to int.
unsafe fn as_number(obj: ObjPtr) -> Option<Num> {
    match &(*obj).kind {
        ObjKind::Bool(b) => Some(Num::Int(*b as i64)),
        ObjKind::Int(i) => Some(Num::Int(*i)),
        ObjKind::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn type_error(msg: &str) -> ObjPtr {
    set_error(ExcKind::TypeError, msg);
    std::ptr::null_mut()
}

/// Floor division with the host's sign rules.
fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Modulo with the host's sign rules: the result takes the divisor's sign.
fn mod_i64(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

fn mod_f64(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

fn repeat_seq<T: Clone>(items: &[T], count: i64) -> Vec<T> {
    if count <= 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(items.len() * count as usize);
    for _ in 0..count {
        out.extend_from_slice(items);
    }
    out
}

macro_rules! binary_helper {
    ($name:ident, $a:ident, $b:ident, $body:expr) => {
        pub extern "C" fn $name($a: ObjPtr, $b: ObjPtr) -> ObjPtr {
            unsafe {
                let result: ObjPtr = $body;
                decref($a);
                decref($b);
                result
            }
        }
    };
}

binary_helper!(helper_add, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => alloc(ObjKind::Int(x.wrapping_add(y))),
        (Some(x), Some(y)) => {
            let (x, y) = (num_f64(x), num_f64(y));
            alloc(ObjKind::Float(x + y))
        }
        _ => match (&(*a).kind, &(*b).kind) {
            (ObjKind::Str(x), ObjKind::Str(y)) => {
                let mut s = x.clone();
                s.push_str(y);
                alloc(ObjKind::Str(s))
            }
            (ObjKind::Bytes(x), ObjKind::Bytes(y)) => {
                let mut v = x.clone();
                v.extend_from_slice(y);
                alloc(ObjKind::Bytes(v))
            }
            (ObjKind::List(x), ObjKind::List(y)) => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().copied());
                for &item in &items {
                    incref(item);
                }
                alloc(ObjKind::List(RefCell::new(items)))
            }
            (ObjKind::Tuple(x), ObjKind::Tuple(y)) => {
                let mut items = x.clone();
                items.extend(y.iter().copied());
                for &item in &items {
                    incref(item);
                }
                alloc(ObjKind::Tuple(items))
            }
            _ => type_error("unsupported operand type(s) for +"),
        },
    }
});

fn num_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

binary_helper!(helper_subtract, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => alloc(ObjKind::Int(x.wrapping_sub(y))),
        (Some(x), Some(y)) => alloc(ObjKind::Float(num_f64(x) - num_f64(y))),
        _ => type_error("unsupported operand type(s) for -"),
    }
});

binary_helper!(helper_multiply, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => alloc(ObjKind::Int(x.wrapping_mul(y))),
        (Some(x), Some(y)) => alloc(ObjKind::Float(num_f64(x) * num_f64(y))),
        _ => {
            // sequence repetition, in either operand order
            let (seq, count) = match (as_number(a), as_number(b)) {
                (None, Some(Num::Int(n))) => (a, Some(n)),
                (Some(Num::Int(n)), None) => (b, Some(n)),
                _ => (a, None),
            };
            match (count, &(*seq).kind) {
                (Some(n), ObjKind::Str(s)) => {
                    alloc(ObjKind::Str(s.repeat(n.max(0) as usize)))
                }
                (Some(n), ObjKind::Bytes(v)) => alloc(ObjKind::Bytes(repeat_seq(v, n))),
                (Some(n), ObjKind::List(items)) => {
                    let repeated = repeat_seq(&items.borrow(), n);
                    for &item in &repeated {
                        incref(item);
                    }
                    alloc(ObjKind::List(RefCell::new(repeated)))
                }
                (Some(n), ObjKind::Tuple(items)) => {
                    let repeated = repeat_seq(items, n);
                    for &item in &repeated {
                        incref(item);
                    }
                    alloc(ObjKind::Tuple(repeated))
                }
                _ => type_error("unsupported operand type(s) for *"),
            }
        }
    }
});

binary_helper!(helper_true_divide, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => {
            let y = num_f64(y);
            if y == 0.0 {
                set_error(ExcKind::ZeroDivisionError, "division by zero");
                std::ptr::null_mut()
            } else {
                alloc(ObjKind::Float(num_f64(x) / y))
            }
        }
        _ => type_error("unsupported operand type(s) for /"),
    }
});

binary_helper!(helper_floor_divide, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => {
            if y == 0 {
                set_error(ExcKind::ZeroDivisionError, "integer division or modulo by zero");
                std::ptr::null_mut()
            } else {
                alloc(ObjKind::Int(floor_div_i64(x, y)))
            }
        }
        (Some(x), Some(y)) => {
            let y = num_f64(y);
            if y == 0.0 {
                set_error(ExcKind::ZeroDivisionError, "float floor division by zero");
                std::ptr::null_mut()
            } else {
                alloc(ObjKind::Float((num_f64(x) / y).floor()))
            }
        }
        _ => type_error("unsupported operand type(s) for //"),
    }
});

binary_helper!(helper_modulo, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => {
            if y == 0 {
                set_error(ExcKind::ZeroDivisionError, "integer division or modulo by zero");
                std::ptr::null_mut()
            } else {
                alloc(ObjKind::Int(mod_i64(x, y)))
            }
        }
        (Some(x), Some(y)) => {
            let y = num_f64(y);
            if y == 0.0 {
                set_error(ExcKind::ZeroDivisionError, "float modulo");
                std::ptr::null_mut()
            } else {
                alloc(ObjKind::Float(mod_f64(num_f64(x), y)))
            }
        }
        _ => type_error("unsupported operand type(s) for %"),
    }
});

binary_helper!(helper_power, a, b, {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => {
            if y >= 0 {
                alloc(ObjKind::Int(x.wrapping_pow(y.min(u32::MAX as i64) as u32)))
            } else {
                alloc(ObjKind::Float((x as f64).powi(y as i32)))
            }
        }
        (Some(x), Some(y)) => alloc(ObjKind::Float(num_f64(x).powf(num_f64(y)))),
        _ => type_error("unsupported operand type(s) for **"),
    }
});

macro_rules! int_binary_helper {
    ($name:ident, $opname:literal, $x:ident, $y:ident, $body:expr) => {
        binary_helper!($name, a, b, {
            match (as_number(a), as_number(b)) {
                (Some(Num::Int($x)), Some(Num::Int($y))) => $body,
                _ => type_error(concat!("unsupported operand type(s) for ", $opname)),
            }
        });
    };
}

int_binary_helper!(helper_lshift, "<<", x, y, {
    if y < 0 {
        set_error(ExcKind::ValueError, "negative shift count");
        std::ptr::null_mut()
    } else {
        alloc(ObjKind::Int(x.wrapping_shl(y as u32)))
    }
});

int_binary_helper!(helper_rshift, ">>", x, y, {
    if y < 0 {
        set_error(ExcKind::ValueError, "negative shift count");
        std::ptr::null_mut()
    } else {
        alloc(ObjKind::Int(x.wrapping_shr(y as u32)))
    }
});

int_binary_helper!(helper_bit_and, "&", x, y, { alloc(ObjKind::Int(x & y)) });
int_binary_helper!(helper_bit_or, "|", x, y, { alloc(ObjKind::Int(x | y)) });
int_binary_helper!(helper_bit_xor, "^", x, y, { alloc(ObjKind::Int(x ^ y)) });

// ---------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------

/// Total-order comparison where one exists; `None` means unorderable.
unsafe fn order(a: ObjPtr, b: ObjPtr) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => return Some(x.cmp(&y)),
        (Some(x), Some(y)) => return num_f64(x).partial_cmp(&num_f64(y)),
        _ => {}
    }
    match (&(*a).kind, &(*b).kind) {
        (ObjKind::Str(x), ObjKind::Str(y)) => Some(x.cmp(y)),
        (ObjKind::Bytes(x), ObjKind::Bytes(y)) => Some(x.cmp(y)),
        (ObjKind::List(x), ObjKind::List(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            order_seq(&x, &y)
        }
        (ObjKind::Tuple(x), ObjKind::Tuple(y)) => order_seq(x, y),
        _ => None,
    }
}

unsafe fn order_seq(x: &[ObjPtr], y: &[ObjPtr]) -> Option<Ordering> {
    for (&i, &j) in x.iter().zip(y.iter()) {
        match order(i, j)? {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(x.len().cmp(&y.len()))
}

pub extern "C" fn helper_richcmp(a: ObjPtr, b: ObjPtr, op: i32) -> ObjPtr {
    unsafe {
        let result = match op {
            2 => Some(eq(a, b)),
            3 => Some(!eq(a, b)),
            _ => match order(a, b) {
                Some(ordering) => Some(match op {
                    0 => ordering == Ordering::Less,
                    1 => ordering != Ordering::Greater,
                    4 => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }),
                None => None,
            },
        };
        decref(a);
        decref(b);
        match result {
            Some(value) => alloc(ObjKind::Bool(value)),
            None => type_error("'<' not supported between instances"),
        }
    }
}

pub extern "C" fn helper_contains(item: ObjPtr, container: ObjPtr, invert: i32) -> ObjPtr {
    unsafe {
        let found = match (&(*container).kind, &(*item).kind) {
            (ObjKind::Str(haystack), ObjKind::Str(needle)) => Some(haystack.contains(needle)),
            (ObjKind::Bytes(haystack), ObjKind::Bytes(needle)) => {
                // the empty subsequence is contained in everything
                Some(
                    needle.is_empty()
                        || haystack.windows(needle.len()).any(|w| w == &needle[..]),
                )
            }
            (ObjKind::Dict(entries), _) => {
                Some(entries.borrow().iter().any(|&(key, _)| eq(key, item)))
            }
            _ => snapshot(container).map(|items| {
                let found = items.iter().any(|&member| eq(member, item));
                for member in items {
                    decref(member);
                }
                found
            }),
        };
        decref(item);
        decref(container);
        match found {
            Some(mut value) => {
                if invert != 0 {
                    value = !value;
                }
                alloc(ObjKind::Bool(value))
            }
            None => type_error("argument of type is not iterable"),
        }
    }
}

// ---------------------------------------------------------------------
// Unary operations and truth
// ---------------------------------------------------------------------

pub extern "C" fn helper_unary_negative(obj: ObjPtr) -> ObjPtr {
    unsafe {
        let result = match as_number(obj) {
            Some(Num::Int(i)) => alloc(ObjKind::Int(i.wrapping_neg())),
            Some(Num::Float(f)) => alloc(ObjKind::Float(-f)),
            None => type_error("bad operand type for unary -"),
        };
        decref(obj);
        result
    }
}

pub extern "C" fn helper_unary_positive(obj: ObjPtr) -> ObjPtr {
    unsafe {
        let result = match as_number(obj) {
            Some(Num::Int(i)) => alloc(ObjKind::Int(i)),
            Some(Num::Float(f)) => alloc(ObjKind::Float(f)),
            None => type_error("bad operand type for unary +"),
        };
        decref(obj);
        result
    }
}

pub extern "C" fn helper_unary_not(obj: ObjPtr) -> ObjPtr {
    unsafe {
        let result = alloc(ObjKind::Bool(!truthy(obj)));
        decref(obj);
        result
    }
}

pub extern "C" fn helper_unary_invert(obj: ObjPtr) -> ObjPtr {
    unsafe {
        let result = match as_number(obj) {
            Some(Num::Int(i)) => alloc(ObjKind::Int(!i)),
            _ => type_error("bad operand type for unary ~"),
        };
        decref(obj);
        result
    }
}

/// Truth test; borrows its operand.
pub extern "C" fn helper_truth(obj: ObjPtr) -> i32 {
    unsafe { truthy(obj) as i32 }
}

// ---------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------

/// The adjusted index range a slice selects over a sequence of length `n`.
fn slice_range(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<(i64, i64, i64), ()> {
    let step = step.unwrap_or(1);
    if step == 0 {
        set_error(ExcKind::ValueError, "slice step cannot be zero");
        return Err(());
    }
    Ok((start.unwrap_or(i64::MIN), stop.unwrap_or(i64::MIN), step))
}

/// Clamp a raw slice bound the way the host does.
fn adjust_bound(raw: i64, n: i64, step: i64, is_start: bool) -> i64 {
    if raw == i64::MIN {
        // missing bound
        return if step > 0 {
            if is_start {
                0
            } else {
                n
            }
        } else if is_start {
            n - 1
        } else {
            -1
        };
    }
    let mut bound = raw;
    if bound < 0 {
        bound += n;
        if bound < 0 {
            bound = if step < 0 { -1 } else { 0 };
        }
    } else if bound >= n {
        bound = if step < 0 { n - 1 } else { n };
    }
    bound
}

/// The element indices a slice object selects over length `n`.
unsafe fn slice_element_indices(slice: &PyObj, n: i64) -> Result<Vec<usize>, ()> {
    let ObjKind::Slice { start, stop, step } = &slice.kind else {
        set_error(ExcKind::TypeError, "indices must be integers or slices");
        return Err(());
    };
    let bound_of = |obj: ObjPtr| -> Result<Option<i64>, ()> {
        match unsafe { &(*obj).kind } {
            ObjKind::None => Ok(None),
            ObjKind::Int(i) => Ok(Some(*i)),
            ObjKind::Bool(b) => Ok(Some(*b as i64)),
            _ => {
                set_error(ExcKind::TypeError, "slice indices must be integers or None");
                Err(())
            }
        }
    };
    let (start, stop, step) = slice_range(bound_of(*start)?, bound_of(*stop)?, bound_of(*step)?)?;
    let start = adjust_bound(start, n, step, true);
    let stop = adjust_bound(stop, n, step, false);
    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        indices.push(i as usize);
        i += step;
    }
    Ok(indices)
}

unsafe fn int_index(obj: ObjPtr) -> Option<i64> {
    match &(*obj).kind {
        ObjKind::Int(i) => Some(*i),
        ObjKind::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn index_error() -> ObjPtr {
    set_error(ExcKind::IndexError, "index out of range");
    std::ptr::null_mut()
}

/// Normalize a (possibly negative) index against length `n`.
fn normalize_index(mut i: i64, n: i64) -> Option<usize> {
    if i < 0 {
        i += n;
    }
    if i < 0 || i >= n {
        None
    } else {
        Some(i as usize)
    }
}

binary_helper!(helper_subscr, obj, index, {
    match &(*obj).kind {
        ObjKind::List(items) => {
            if let Some(i) = int_index(index) {
                let items = items.borrow();
                match normalize_index(i, items.len() as i64) {
                    Some(i) => {
                        incref(items[i]);
                        items[i]
                    }
                    None => index_error(),
                }
            } else {
                let items = items.borrow();
                match slice_element_indices(&*index, items.len() as i64) {
                    Ok(picked) => {
                        let selected: Vec<ObjPtr> = picked.iter().map(|&i| items[i]).collect();
                        for &item in &selected {
                            incref(item);
                        }
                        alloc(ObjKind::List(RefCell::new(selected)))
                    }
                    Err(()) => std::ptr::null_mut(),
                }
            }
        }
        ObjKind::Tuple(items) => {
            if let Some(i) = int_index(index) {
                match normalize_index(i, items.len() as i64) {
                    Some(i) => {
                        incref(items[i]);
                        items[i]
                    }
                    None => index_error(),
                }
            } else {
                match slice_element_indices(&*index, items.len() as i64) {
                    Ok(picked) => {
                        let selected: Vec<ObjPtr> = picked.iter().map(|&i| items[i]).collect();
                        for &item in &selected {
                            incref(item);
                        }
                        alloc(ObjKind::Tuple(selected))
                    }
                    Err(()) => std::ptr::null_mut(),
                }
            }
        }
        ObjKind::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            if let Some(i) = int_index(index) {
                match normalize_index(i, chars.len() as i64) {
                    Some(i) => alloc(ObjKind::Str(chars[i].to_string())),
                    None => {
                        set_error(ExcKind::IndexError, "string index out of range");
                        std::ptr::null_mut()
                    }
                }
            } else {
                match slice_element_indices(&*index, chars.len() as i64) {
                    Ok(picked) => {
                        alloc(ObjKind::Str(picked.iter().map(|&i| chars[i]).collect()))
                    }
                    Err(()) => std::ptr::null_mut(),
                }
            }
        }
        ObjKind::Bytes(v) => subscr_bytes(v, index, false),
        ObjKind::ByteArray(v) => subscr_bytes(&v.borrow(), index, true),
        ObjKind::Dict(entries) => {
            let entries = entries.borrow();
            match entries.iter().find(|&&(key, _)| eq(key, index)) {
                Some(&(_, value)) => {
                    incref(value);
                    value
                }
                None => {
                    set_error(ExcKind::KeyError, &repr(index));
                    std::ptr::null_mut()
                }
            }
        }
        _ => type_error("object is not subscriptable"),
    }
});

unsafe fn subscr_bytes(v: &[u8], index: ObjPtr, is_bytearray: bool) -> ObjPtr {
    if let Some(i) = int_index(index) {
        match normalize_index(i, v.len() as i64) {
            Some(i) => alloc(ObjKind::Int(v[i] as i64)),
            None => {
                set_error(ExcKind::IndexError, "index out of range");
                std::ptr::null_mut()
            }
        }
    } else {
        match slice_element_indices(&*index, v.len() as i64) {
            Ok(picked) => {
                let selected: Vec<u8> = picked.iter().map(|&i| v[i]).collect();
                if is_bytearray {
                    alloc(ObjKind::ByteArray(RefCell::new(selected)))
                } else {
                    alloc(ObjKind::Bytes(selected))
                }
            }
            Err(()) => std::ptr::null_mut(),
        }
    }
}

pub extern "C" fn helper_store_subscr(value: ObjPtr, obj: ObjPtr, index: ObjPtr) -> i32 {
    unsafe {
        let status = match &(*obj).kind {
            ObjKind::List(items) => {
                if let Some(i) = int_index(index) {
                    let mut items = items.borrow_mut();
                    match normalize_index(i, items.len() as i64) {
                        Some(i) => {
                            let old = items[i];
                            incref(value);
                            items[i] = value;
                            decref(old);
                            0
                        }
                        None => {
                            set_error(ExcKind::IndexError, "list assignment index out of range");
                            -1
                        }
                    }
                } else {
                    set_error(ExcKind::TypeError, "list indices must be integers");
                    -1
                }
            }
            ObjKind::Dict(entries) => {
                let mut entries = entries.borrow_mut();
                if let Some(entry) = entries.iter_mut().find(|(key, _)| eq(*key, index)) {
                    let old = entry.1;
                    incref(value);
                    entry.1 = value;
                    decref(old);
                } else if !hashable(index) {
                    set_error(ExcKind::TypeError, "unhashable type");
                    drop(entries);
                    decref(value);
                    decref(obj);
                    decref(index);
                    return -1;
                } else {
                    incref(index);
                    incref(value);
                    entries.push((index, value));
                }
                0
            }
            ObjKind::ByteArray(bytes) => match (int_index(index), int_index(value)) {
                (Some(i), Some(byte)) if (0..=255).contains(&byte) => {
                    let mut bytes = bytes.borrow_mut();
                    match normalize_index(i, bytes.len() as i64) {
                        Some(i) => {
                            bytes[i] = byte as u8;
                            0
                        }
                        None => {
                            set_error(ExcKind::IndexError, "bytearray index out of range");
                            -1
                        }
                    }
                }
                _ => {
                    set_error(ExcKind::ValueError, "byte must be in range(0, 256)");
                    -1
                }
            },
            _ => {
                set_error(ExcKind::TypeError, "object does not support item assignment");
                -1
            }
        };
        decref(value);
        decref(obj);
        decref(index);
        status
    }
}

// ---------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------

/// New references to an iterable's elements in iteration order.
unsafe fn snapshot(obj: ObjPtr) -> Option<Vec<ObjPtr>> {
    let items = match &(*obj).kind {
        ObjKind::List(items) | ObjKind::Set(items) => {
            let items = items.borrow().clone();
            for &item in &items {
                incref(item);
            }
            items
        }
        ObjKind::Tuple(items) => {
            for &item in items {
                incref(item);
            }
            items.clone()
        }
        ObjKind::Str(s) => s
            .chars()
            .map(|c| alloc(ObjKind::Str(c.to_string())))
            .collect(),
        ObjKind::Bytes(v) => v.iter().map(|&b| alloc(ObjKind::Int(b as i64))).collect(),
        ObjKind::ByteArray(v) => v
            .borrow()
            .iter()
            .map(|&b| alloc(ObjKind::Int(b as i64)))
            .collect(),
        ObjKind::Dict(entries) => {
            let keys: Vec<ObjPtr> = entries.borrow().iter().map(|&(key, _)| key).collect();
            for &key in &keys {
                incref(key);
            }
            keys
        }
        _ => return None,
    };
    Some(items)
}

pub extern "C" fn helper_getiter(obj: ObjPtr) -> ObjPtr {
    unsafe {
        let result = match snapshot(obj) {
            Some(items) => alloc(ObjKind::SeqIter {
                items,
                pos: Cell::new(0),
            }),
            None => type_error("object is not iterable"),
        };
        decref(obj);
        result
    }
}

/// Next element or null on exhaustion (no error set). Borrows the
/// iterator; a null return with the error slot set means a real failure.
pub extern "C" fn helper_iternext(iter: ObjPtr) -> ObjPtr {
    unsafe {
        match &(*iter).kind {
            ObjKind::SeqIter { items, pos } => {
                let i = pos.get();
                if i < items.len() {
                    pos.set(i + 1);
                    incref(items[i]);
                    items[i]
                } else {
                    std::ptr::null_mut()
                }
            }
            _ => type_error("iter() returned non-iterator"),
        }
    }
}

// ---------------------------------------------------------------------
// Container builders
// ---------------------------------------------------------------------

/// Read `count` owned references out of a scratch buffer.
unsafe fn drain_buffer(buffer: *mut ObjPtr, count: i64) -> Vec<ObjPtr> {
    (0..count as usize).map(|i| *buffer.add(i)).collect()
}

pub extern "C" fn helper_list_from_buffer(buffer: *mut ObjPtr, count: i64) -> ObjPtr {
    unsafe { alloc(ObjKind::List(RefCell::new(drain_buffer(buffer, count)))) }
}

pub extern "C" fn helper_tuple_from_buffer(buffer: *mut ObjPtr, count: i64) -> ObjPtr {
    unsafe { alloc(ObjKind::Tuple(drain_buffer(buffer, count))) }
}

pub extern "C" fn helper_set_from_buffer(buffer: *mut ObjPtr, count: i64) -> ObjPtr {
    unsafe {
        let items = drain_buffer(buffer, count);
        let mut members: Vec<ObjPtr> = Vec::new();
        for item in items {
            if !hashable(item) {
                set_error(ExcKind::TypeError, "unhashable type");
                decref(item);
                for member in members {
                    decref(member);
                }
                return std::ptr::null_mut();
            }
            if members.iter().any(|&member| eq(member, item)) {
                decref(item);
            } else {
                members.push(item);
            }
        }
        alloc(ObjKind::Set(RefCell::new(members)))
    }
}

/// Insert an owned key/value pair with the host's dict semantics: an
/// existing key keeps its position, a new key appends.
unsafe fn dict_insert(entries: &mut Vec<(ObjPtr, ObjPtr)>, key: ObjPtr, value: ObjPtr) {
    if let Some(entry) = entries.iter_mut().find(|(existing, _)| eq(*existing, key)) {
        let old = entry.1;
        entry.1 = value;
        decref(old);
        decref(key);
    } else {
        entries.push((key, value));
    }
}

pub extern "C" fn helper_map_from_buffer(buffer: *mut ObjPtr, pairs: i64) -> ObjPtr {
    unsafe {
        let mut entries: Vec<(ObjPtr, ObjPtr)> = Vec::new();
        for i in 0..pairs as usize {
            let key = *buffer.add(2 * i);
            let value = *buffer.add(2 * i + 1);
            if !hashable(key) {
                set_error(ExcKind::TypeError, "unhashable type");
                decref(key);
                decref(value);
                for (k, v) in entries {
                    decref(k);
                    decref(v);
                }
                return std::ptr::null_mut();
            }
            dict_insert(&mut entries, key, value);
        }
        alloc(ObjKind::Dict(RefCell::new(entries)))
    }
}

pub extern "C" fn helper_build_slice(start: ObjPtr, stop: ObjPtr, step: ObjPtr) -> ObjPtr {
    alloc(ObjKind::Slice { start, stop, step })
}

/// Append to a list; borrows the list, steals the item.
pub extern "C" fn helper_list_append(list: ObjPtr, item: ObjPtr) -> i32 {
    unsafe {
        match &(*list).kind {
            ObjKind::List(items) => {
                items.borrow_mut().push(item);
                0
            }
            _ => {
                set_error(ExcKind::TypeError, "list_append on non-list");
                decref(item);
                -1
            }
        }
    }
}

pub extern "C" fn helper_list_extend(list: ObjPtr, iterable: ObjPtr) -> i32 {
    unsafe {
        let status = match (&(*list).kind, snapshot(iterable)) {
            (ObjKind::List(items), Some(new_items)) => {
                items.borrow_mut().extend(new_items);
                0
            }
            (_, Some(new_items)) => {
                for item in new_items {
                    decref(item);
                }
                set_error(ExcKind::TypeError, "list_extend on non-list");
                -1
            }
            (_, None) => {
                set_error(ExcKind::TypeError, "value is not iterable");
                -1
            }
        };
        decref(iterable);
        status
    }
}

pub extern "C" fn helper_set_update(set: ObjPtr, iterable: ObjPtr) -> i32 {
    unsafe {
        let status = match (&(*set).kind, snapshot(iterable)) {
            (ObjKind::Set(members), Some(new_items)) => {
                let mut status = 0;
                for item in new_items {
                    if !hashable(item) {
                        set_error(ExcKind::TypeError, "unhashable type");
                        decref(item);
                        status = -1;
                        break;
                    }
                    let mut members = members.borrow_mut();
                    if members.iter().any(|&member| eq(member, item)) {
                        decref(item);
                    } else {
                        members.push(item);
                    }
                }
                status
            }
            (_, Some(new_items)) => {
                for item in new_items {
                    decref(item);
                }
                set_error(ExcKind::TypeError, "set_update on non-set");
                -1
            }
            (_, None) => {
                set_error(ExcKind::TypeError, "value is not iterable");
                -1
            }
        };
        decref(iterable);
        status
    }
}

pub extern "C" fn helper_dict_update(dict: ObjPtr, other: ObjPtr) -> i32 {
    unsafe {
        let status = match (&(*dict).kind, &(*other).kind) {
            (ObjKind::Dict(entries), ObjKind::Dict(incoming)) => {
                for &(key, value) in incoming.borrow().iter() {
                    incref(key);
                    incref(value);
                    dict_insert(&mut entries.borrow_mut(), key, value);
                }
                0
            }
            _ => {
                set_error(ExcKind::TypeError, "argument must be a mapping");
                -1
            }
        };
        decref(other);
        status
    }
}

// ---------------------------------------------------------------------
// Unpacking and calls
// ---------------------------------------------------------------------

pub extern "C" fn helper_unpack_sequence(seq: ObjPtr, buffer: *mut ObjPtr, count: i64) -> i32 {
    unsafe {
        let Some(items) = snapshot(seq) else {
            set_error(ExcKind::TypeError, "cannot unpack non-iterable");
            decref(seq);
            return -1;
        };
        decref(seq);
        if items.len() != count as usize {
            set_error(
                ExcKind::ValueError,
                if items.len() < count as usize {
                    "not enough values to unpack"
                } else {
                    "too many values to unpack"
                },
            );
            for item in items {
                decref(item);
            }
            return -1;
        }
        for (i, item) in items.into_iter().enumerate() {
            *buffer.add(i) = item;
        }
        0
    }
}

pub extern "C" fn helper_call_function(callable: ObjPtr, buffer: *mut ObjPtr, nargs: i64) -> ObjPtr {
    unsafe {
        let args = drain_buffer(buffer, nargs);
        let result = match &(*callable).kind {
            ObjKind::ExcType(kind) => {
                let msg = args
                    .first()
                    .and_then(|&arg| match &(*arg).kind {
                        ObjKind::Str(s) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                alloc(ObjKind::Exception { kind: *kind, msg })
            }
            _ => type_error("object is not callable"),
        };
        for arg in args {
            decref(arg);
        }
        decref(callable);
        result
    }
}

// ---------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------

pub extern "C" fn helper_load_const(id: i32) -> ObjPtr {
    const_from_pool(id as u32)
}

pub extern "C" fn helper_load_none() -> ObjPtr {
    alloc(ObjKind::None)
}

pub extern "C" fn helper_load_assertion_error() -> ObjPtr {
    alloc(ObjKind::ExcType(ExcKind::AssertionError))
}

// ---------------------------------------------------------------------
// Raising and the error slot
// ---------------------------------------------------------------------

pub extern "C" fn helper_raise(exc: ObjPtr) -> i32 {
    unsafe {
        match &(*exc).kind {
            ObjKind::ExcType(kind) => {
                set_error(*kind, "");
                decref(exc);
            }
            ObjKind::Exception { .. } => {
                // the instance becomes the current error, reference moved
                set_error_obj(exc);
            }
            _ => {
                decref(exc);
                set_error(
                    ExcKind::TypeError,
                    "exceptions must derive from BaseException",
                );
            }
        }
        -1
    }
}

pub extern "C" fn helper_reraise() -> i32 {
    if !super::error_occurred() {
        set_error(ExcKind::RuntimeError, "No active exception to re-raise");
    }
    -1
}

/// Move the current exception into `buffer` as the handler-entry triple
/// (traceback, value, type, with the type on top), clearing the error slot.
pub extern "C" fn helper_fetch_exc(buffer: *mut ObjPtr) {
    unsafe {
        let exc = take_error_obj().unwrap_or_else(|| {
            alloc(ObjKind::Exception {
                kind: ExcKind::RuntimeError,
                msg: "no current exception".to_string(),
            })
        });
        let kind = match &(*exc).kind {
            ObjKind::Exception { kind, .. } => *kind,
            _ => ExcKind::RuntimeError,
        };
        *buffer = alloc(ObjKind::None);
        *buffer.add(1) = exc;
        *buffer.add(2) = alloc(ObjKind::ExcType(kind));
    }
}

pub extern "C" fn helper_err_occurred() -> i32 {
    super::error_occurred() as i32
}

pub extern "C" fn helper_zero_division_error() {
    set_error(ExcKind::ZeroDivisionError, "division by zero");
}

pub extern "C" fn helper_unbound_local(_index: i32) {
    set_error(
        ExcKind::UnboundLocalError,
        "local variable referenced before assignment",
    );
}

// ---------------------------------------------------------------------
// Boxing
// ---------------------------------------------------------------------

pub extern "C" fn helper_box_int(value: i64) -> ObjPtr {
    alloc(ObjKind::Int(value))
}

pub extern "C" fn helper_box_float(value: f64) -> ObjPtr {
    alloc(ObjKind::Float(value))
}

pub extern "C" fn helper_box_bool(value: i32) -> ObjPtr {
    alloc(ObjKind::Bool(value != 0))
}

/// Steal a boxed integer and return its machine value.
pub extern "C" fn helper_unbox_int(obj: ObjPtr) -> i64 {
    unsafe {
        let value = match &(*obj).kind {
            ObjKind::Int(i) => *i,
            ObjKind::Bool(b) => *b as i64,
            other => {
                debug_assert!(false, "unbox_int on {:?}", other);
                0
            }
        };
        decref(obj);
        value
    }
}

pub extern "C" fn helper_unbox_float(obj: ObjPtr) -> f64 {
    unsafe {
        let value = match &(*obj).kind {
            ObjKind::Float(f) => *f,
            ObjKind::Int(i) => *i as f64,
            other => {
                debug_assert!(false, "unbox_float on {:?}", other);
                0.0
            }
        };
        decref(obj);
        value
    }
}

pub extern "C" fn helper_unbox_bool(obj: ObjPtr) -> i32 {
    unsafe {
        let value = truthy(obj) as i32;
        decref(obj);
        value
    }
}

/// Integer true division on machine values; the emitted guard has already
/// ruled out a zero divisor.
pub extern "C" fn helper_int_true_divide(a: i64, b: i64) -> f64 {
    a as f64 / b as f64
}
