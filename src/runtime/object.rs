//! Boxed object model used by emitted code.
//!
//! This is the in-crate stand-in for the embedding host's object system:
//! a refcounted tagged value with the container, string, and exception
//! shapes the runtime helpers need. Compiled code holds `*mut PyObj` and
//! manipulates references exclusively through the helpers; nothing here is
//! thread-safe on its own; the host's interpreter lock is assumed held
//! around every emitted call, exactly as it is for the host's own objects.

use std::cell::{Cell, RefCell};
use std::fmt::Write as _;

/// Raw object pointer as seen by emitted code.
pub type ObjPtr = *mut PyObj;

/// Exception classes the runtime can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    AssertionError,
    IndexError,
    KeyError,
    TypeError,
    ValueError,
    ZeroDivisionError,
    UnboundLocalError,
    RuntimeError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::AssertionError => "AssertionError",
            ExcKind::IndexError => "IndexError",
            ExcKind::KeyError => "KeyError",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::UnboundLocalError => "UnboundLocalError",
            ExcKind::RuntimeError => "RuntimeError",
        }
    }
}

/// The value payload of an object.
#[derive(Debug)]
pub enum ObjKind {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    ByteArray(RefCell<Vec<u8>>),
    List(RefCell<Vec<ObjPtr>>),
    Tuple(Vec<ObjPtr>),
    /// Insertion-ordered; membership by value equality.
    Set(RefCell<Vec<ObjPtr>>),
    /// Insertion-ordered association vector, like the host's dict.
    Dict(RefCell<Vec<(ObjPtr, ObjPtr)>>),
    Slice {
        start: ObjPtr,
        stop: ObjPtr,
        step: ObjPtr,
    },
    /// Snapshot iterator over a sequence's elements.
    SeqIter {
        items: Vec<ObjPtr>,
        pos: Cell<usize>,
    },
    /// An exception class used as a value (e.g. `AssertionError`).
    ExcType(ExcKind),
    /// A raised exception instance.
    Exception { kind: ExcKind, msg: String },
}

/// A heap object: refcount plus payload.
#[derive(Debug)]
pub struct PyObj {
    refs: Cell<usize>,
    pub kind: ObjKind,
}

/// Allocate a fresh object with refcount 1.
pub fn alloc(kind: ObjKind) -> ObjPtr {
    Box::into_raw(Box::new(PyObj {
        refs: Cell::new(1),
        kind,
    }))
}

/// Bump an object's refcount.
///
/// # Safety
///
/// `obj` must point to a live allocation from [`alloc`].
pub unsafe fn incref(obj: ObjPtr) {
    let cell = &(*obj).refs;
    cell.set(cell.get() + 1);
}

/// Drop one reference, deallocating (and releasing children) at zero.
///
/// # Safety
///
/// `obj` must point to a live allocation from [`alloc`].
pub unsafe fn decref(obj: ObjPtr) {
    let refs = &(*obj).refs;
    debug_assert!(refs.get() > 0);
    refs.set(refs.get() - 1);
    if refs.get() == 0 {
        let boxed = Box::from_raw(obj);
        match boxed.kind {
            ObjKind::List(items) | ObjKind::Set(items) => {
                for item in items.into_inner() {
                    decref(item);
                }
            }
            ObjKind::Tuple(items) | ObjKind::SeqIter { items, .. } => {
                for item in items {
                    decref(item);
                }
            }
            ObjKind::Dict(entries) => {
                for (key, value) in entries.into_inner() {
                    decref(key);
                    decref(value);
                }
            }
            ObjKind::Slice { start, stop, step } => {
                decref(start);
                decref(stop);
                decref(step);
            }
            _ => {}
        }
    }
}

/// Current refcount, for tests.
///
/// # Safety
///
/// `obj` must point to a live allocation from [`alloc`].
pub unsafe fn refcount(obj: ObjPtr) -> usize {
    (*obj).refs.get()
}

/// Value equality, the way the host compares for `==`, `in`, and dict
/// keys. Identity short-circuits; mismatched kinds are unequal except for
/// numeric cross-kind comparison.
///
/// # Safety
///
/// Both pointers must be live.
pub unsafe fn eq(a: ObjPtr, b: ObjPtr) -> bool {
    if a == b {
        return true;
    }
    match (&(*a).kind, &(*b).kind) {
        (ObjKind::None, ObjKind::None) => true,
        (ObjKind::Bool(x), ObjKind::Bool(y)) => x == y,
        (ObjKind::Int(x), ObjKind::Int(y)) => x == y,
        (ObjKind::Float(x), ObjKind::Float(y)) => x == y,
        (ObjKind::Int(x), ObjKind::Float(y)) | (ObjKind::Float(y), ObjKind::Int(x)) => {
            *x as f64 == *y
        }
        (ObjKind::Bool(x), ObjKind::Int(y)) | (ObjKind::Int(y), ObjKind::Bool(x)) => {
            (*x as i64) == *y
        }
        (ObjKind::Str(x), ObjKind::Str(y)) => x == y,
        (ObjKind::Bytes(x), ObjKind::Bytes(y)) => x == y,
        (ObjKind::ByteArray(x), ObjKind::ByteArray(y)) => *x.borrow() == *y.borrow(),
        (ObjKind::Tuple(x), ObjKind::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(&i, &j)| eq(i, j))
        }
        (ObjKind::List(x), ObjKind::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(&i, &j)| eq(i, j))
        }
        (ObjKind::ExcType(x), ObjKind::ExcType(y)) => x == y,
        _ => false,
    }
}

/// Whether an object can serve as a set member or dict key.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn hashable(obj: ObjPtr) -> bool {
    !matches!(
        (*obj).kind,
        ObjKind::List(_) | ObjKind::Set(_) | ObjKind::Dict(_) | ObjKind::ByteArray(_)
    )
}

/// Truth value, per the host's rules.
///
/// # Safety
///
/// `obj` must be live.
pub unsafe fn truthy(obj: ObjPtr) -> bool {
    match &(*obj).kind {
        ObjKind::None => false,
        ObjKind::Bool(b) => *b,
        ObjKind::Int(i) => *i != 0,
        ObjKind::Float(f) => *f != 0.0,
        ObjKind::Str(s) => !s.is_empty(),
        ObjKind::Bytes(b) => !b.is_empty(),
        ObjKind::ByteArray(b) => !b.borrow().is_empty(),
        ObjKind::List(items) | ObjKind::Set(items) => !items.borrow().is_empty(),
        ObjKind::Tuple(items) => !items.is_empty(),
        ObjKind::Dict(entries) => !entries.borrow().is_empty(),
        _ => true,
    }
}

/// Host-style display form, for tests and dumps.
///
/// # Safety
///
/// `obj` must be live (recursively).
pub unsafe fn repr(obj: ObjPtr) -> String {
    match &(*obj).kind {
        ObjKind::None => "None".to_string(),
        ObjKind::Bool(true) => "True".to_string(),
        ObjKind::Bool(false) => "False".to_string(),
        ObjKind::Int(i) => i.to_string(),
        ObjKind::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:.1}", f)
            } else {
                f.to_string()
            }
        }
        ObjKind::Str(s) => format!("'{}'", s),
        ObjKind::Bytes(b) => format!("b{:?}", String::from_utf8_lossy(b)),
        ObjKind::ByteArray(b) => {
            format!("bytearray(b{:?})", String::from_utf8_lossy(&b.borrow()))
        }
        ObjKind::List(items) => {
            let parts: Vec<String> = items.borrow().iter().map(|&i| repr(i)).collect();
            format!("[{}]", parts.join(", "))
        }
        ObjKind::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|&i| repr(i)).collect();
            if parts.len() == 1 {
                format!("({},)", parts[0])
            } else {
                format!("({})", parts.join(", "))
            }
        }
        ObjKind::Set(items) => {
            let parts: Vec<String> = items.borrow().iter().map(|&i| repr(i)).collect();
            format!("{{{}}}", parts.join(", "))
        }
        ObjKind::Dict(entries) => {
            let mut out = String::from("{");
            for (i, (k, v)) in entries.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: {}", repr(*k), repr(*v));
            }
            out.push('}');
            out
        }
        ObjKind::Slice { start, stop, step } => {
            format!("slice({}, {}, {})", repr(*start), repr(*stop), repr(*step))
        }
        ObjKind::SeqIter { .. } => "<iterator>".to_string(),
        ObjKind::ExcType(kind) => format!("<class '{}'>", kind.name()),
        ObjKind::Exception { kind, msg } => format!("{}({:?})", kind.name(), msg),
    }
}
