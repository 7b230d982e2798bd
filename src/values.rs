//! Abstract value lattice.
//!
//! Compile-time approximations of runtime value kinds. Each kind knows the
//! result kind of the operations the bytecode can apply to it, so the
//! analyzer can push precise kinds without ever touching a live object.
//!
//! Values are process-lifetime singletons interned in a static table;
//! anything mutable about a stack slot (escape state, consumers) lives in
//! its [`crate::sources`] entry, never here. Any combination with
//! user-overridable semantics degrades to [`AbstractValueKind::Any`].

use once_cell::sync::Lazy;

use crate::bytecode::Opcode;

/// The closed set of value kinds the analyzer tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbstractValueKind {
    /// Merge identity; also the kind of a definitely-unassigned local.
    Undefined,
    /// Top of the lattice: nothing is known.
    Any,
    Integer,
    Float,
    Bool,
    Bytes,
    String,
    List,
    Tuple,
    Set,
    Dict,
    Function,
    Slice,
    Type,
    None,
    Complex,
    Code,
    Module,
    Bytearray,
    Memoryview,
    Iterable,
}

/// Every kind, in interning order.
pub const ALL_KINDS: [AbstractValueKind; 21] = [
    AbstractValueKind::Undefined,
    AbstractValueKind::Any,
    AbstractValueKind::Integer,
    AbstractValueKind::Float,
    AbstractValueKind::Bool,
    AbstractValueKind::Bytes,
    AbstractValueKind::String,
    AbstractValueKind::List,
    AbstractValueKind::Tuple,
    AbstractValueKind::Set,
    AbstractValueKind::Dict,
    AbstractValueKind::Function,
    AbstractValueKind::Slice,
    AbstractValueKind::Type,
    AbstractValueKind::None,
    AbstractValueKind::Complex,
    AbstractValueKind::Code,
    AbstractValueKind::Module,
    AbstractValueKind::Bytearray,
    AbstractValueKind::Memoryview,
    AbstractValueKind::Iterable,
];

impl AbstractValueKind {
    /// Whether the kind behaves as a number under arithmetic.
    fn is_numeric(self) -> bool {
        matches!(
            self,
            AbstractValueKind::Integer
                | AbstractValueKind::Float
                | AbstractValueKind::Bool
                | AbstractValueKind::Complex
        )
    }

    /// Bool participates in arithmetic as an integer.
    fn arith_kind(self) -> AbstractValueKind {
        if self == AbstractValueKind::Bool {
            AbstractValueKind::Integer
        } else {
            self
        }
    }

    /// Kind name as shown in dumps.
    pub fn describe(self) -> &'static str {
        match self {
            AbstractValueKind::Undefined => "undefined",
            AbstractValueKind::Any => "any",
            AbstractValueKind::Integer => "int",
            AbstractValueKind::Float => "float",
            AbstractValueKind::Bool => "bool",
            AbstractValueKind::Bytes => "bytes",
            AbstractValueKind::String => "str",
            AbstractValueKind::List => "list",
            AbstractValueKind::Tuple => "tuple",
            AbstractValueKind::Set => "set",
            AbstractValueKind::Dict => "dict",
            AbstractValueKind::Function => "function",
            AbstractValueKind::Slice => "slice",
            AbstractValueKind::Type => "type",
            AbstractValueKind::None => "None",
            AbstractValueKind::Complex => "complex",
            AbstractValueKind::Code => "code",
            AbstractValueKind::Module => "module",
            AbstractValueKind::Bytearray => "bytearray",
            AbstractValueKind::Memoryview => "memoryview",
            AbstractValueKind::Iterable => "iterable",
        }
    }
}

/// Whether values of this kind may live unboxed in a machine register.
pub fn supports_escaping(kind: AbstractValueKind) -> bool {
    matches!(
        kind,
        AbstractValueKind::Integer | AbstractValueKind::Float | AbstractValueKind::Bool
    )
}

/// Join of two kinds under merge. `Undefined` is the identity; unequal
/// kinds with no representable join become `Any`.
pub fn merge_kinds(a: AbstractValueKind, b: AbstractValueKind) -> AbstractValueKind {
    if a == b {
        a
    } else if a == AbstractValueKind::Undefined {
        b
    } else if b == AbstractValueKind::Undefined {
        a
    } else {
        AbstractValueKind::Any
    }
}

/// An interned abstract value. Carries no state beyond its kind; all
/// operation tables are pure functions of kind pairs.
#[derive(Debug, PartialEq, Eq)]
pub struct AbstractValue {
    kind: AbstractValueKind,
}

static VALUES: Lazy<Vec<AbstractValue>> = Lazy::new(|| {
    ALL_KINDS
        .iter()
        .map(|&kind| AbstractValue { kind })
        .collect()
});

impl AbstractValue {
    /// The interned singleton for a kind.
    pub fn of(kind: AbstractValueKind) -> &'static AbstractValue {
        let idx = ALL_KINDS
            .iter()
            .position(|&k| k == kind)
            .expect("kind table covers every kind");
        &VALUES[idx]
    }

    pub fn kind(&self) -> AbstractValueKind {
        self.kind
    }

    /// Result kind of a binary opcode with `self` on the left.
    ///
    /// Commutative where the host language is commutative; any combination
    /// with user-overridable semantics yields `Any`.
    pub fn binary(&self, opcode: Opcode, other: AbstractValueKind) -> AbstractValueKind {
        use AbstractValueKind::*;
        let (a, b) = (self.kind, other);
        if a == Any || b == Any {
            return Any;
        }
        match opcode {
            Opcode::BinaryAdd => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) => Integer,
                (Integer, Float) | (Float, Integer) | (Float, Float) => Float,
                (Complex, x) | (x, Complex) if x.is_numeric() || x == Complex => Complex,
                (String, String) => String,
                (Bytes, Bytes) => Bytes,
                // mixed bytes/bytearray concatenation takes the left
                // operand's type, so only the symmetric case is committed
                (Bytearray, Bytearray) => Bytearray,
                (List, List) => List,
                (Tuple, Tuple) => Tuple,
                _ => Any,
            },
            Opcode::BinarySubtract => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) => Integer,
                (Integer, Float) | (Float, Integer) | (Float, Float) => Float,
                (Complex, x) | (x, Complex) if x.is_numeric() || x == Complex => Complex,
                (Set, Set) => Set,
                _ => Any,
            },
            Opcode::BinaryMultiply => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) => Integer,
                (Integer, Float) | (Float, Integer) | (Float, Float) => Float,
                (Complex, x) | (x, Complex) if x.is_numeric() || x == Complex => Complex,
                (String, Integer) | (Integer, String) => String,
                (Bytes, Integer) | (Integer, Bytes) => Bytes,
                (List, Integer) | (Integer, List) => List,
                (Tuple, Integer) | (Integer, Tuple) => Tuple,
                _ => Any,
            },
            Opcode::BinaryTrueDivide => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) | (Integer, Float) | (Float, Integer) | (Float, Float) => Float,
                (Complex, x) | (x, Complex) if x.is_numeric() || x == Complex => Complex,
                _ => Any,
            },
            Opcode::BinaryFloorDivide => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) => Integer,
                (Integer, Float) | (Float, Integer) | (Float, Float) => Float,
                _ => Any,
            },
            Opcode::BinaryModulo => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) => Integer,
                (Integer, Float) | (Float, Integer) | (Float, Float) => Float,
                // printf-style formatting
                (String, _) => String,
                (Bytes, _) => Bytes,
                _ => Any,
            },
            // Negative integer exponents produce floats, so the result of a
            // power is only pinned down for float bases.
            Opcode::BinaryPower => match (a.arith_kind(), b.arith_kind()) {
                (Float, Integer) | (Float, Float) => Float,
                (Complex, x) | (x, Complex) if x.is_numeric() || x == Complex => Complex,
                _ => Any,
            },
            Opcode::BinaryLshift | Opcode::BinaryRshift => match (a.arith_kind(), b.arith_kind()) {
                (Integer, Integer) => Integer,
                _ => Any,
            },
            Opcode::BinaryAnd | Opcode::BinaryOr | Opcode::BinaryXor => {
                match (a, b) {
                    (Bool, Bool) => Bool,
                    _ => match (a.arith_kind(), b.arith_kind()) {
                        (Integer, Integer) => Integer,
                        (Set, Set) => Set,
                        _ => Any,
                    },
                }
            }
            _ => Any,
        }
    }

    /// Result kind of a unary opcode.
    pub fn unary(&self, opcode: Opcode) -> AbstractValueKind {
        use AbstractValueKind::*;
        match opcode {
            // `not` produces a real bool no matter the operand
            Opcode::UnaryNot => Bool,
            Opcode::UnaryPositive | Opcode::UnaryNegative => match self.kind {
                Integer | Bool => Integer,
                Float => Float,
                Complex => Complex,
                _ => Any,
            },
            Opcode::UnaryInvert => match self.kind {
                Integer | Bool => Integer,
                _ => Any,
            },
            _ => Any,
        }
    }

    /// Result kind of a rich comparison against `other`.
    pub fn compare(&self, other: AbstractValueKind) -> AbstractValueKind {
        use AbstractValueKind::*;
        // Comparisons are overridable on arbitrary objects; only commit for
        // kinds whose comparisons the host defines itself.
        let defined = |k: AbstractValueKind| {
            matches!(
                k,
                Integer | Float | Bool | String | Bytes | Bytearray | List | Tuple | Set | None
            )
        };
        if defined(self.kind) && defined(other) {
            Bool
        } else {
            Any
        }
    }

    /// Result kind of `x in self`.
    pub fn contains(&self) -> AbstractValueKind {
        use AbstractValueKind::*;
        match self.kind {
            List | Tuple | Set | Dict | String | Bytes | Bytearray | Iterable => Bool,
            _ => Any,
        }
    }

    /// Result kind of `self[index]`.
    pub fn subscript(&self, index: AbstractValueKind) -> AbstractValueKind {
        use AbstractValueKind::*;
        match (self.kind, index) {
            (List, Slice) => List,
            (Tuple, Slice) => Tuple,
            (String, Integer) | (String, Slice) => String,
            (Bytes, Integer) | (Bytearray, Integer) => Integer,
            (Bytes, Slice) => Bytes,
            (Bytearray, Slice) => Bytearray,
            // element kinds are not tracked
            (List, Integer) | (Tuple, Integer) | (Dict, _) => Any,
            _ => Any,
        }
    }

    /// Result kind of `iter(self)`.
    pub fn iter(&self) -> AbstractValueKind {
        use AbstractValueKind::*;
        match self.kind {
            List | Tuple | Set | Dict | String | Bytes | Bytearray | Iterable => Iterable,
            _ => Any,
        }
    }

    /// Kind of the values an iterator over `self` yields.
    pub fn iter_next(&self) -> AbstractValueKind {
        use AbstractValueKind::*;
        match self.kind {
            String => String,
            Bytes | Bytearray => Integer,
            _ => Any,
        }
    }

    /// Result kind of calling `self`.
    pub fn call(&self) -> AbstractValueKind {
        AbstractValueKind::Any
    }

    /// Whether values of this kind are always hashable.
    pub fn is_hashable(&self) -> bool {
        use AbstractValueKind::*;
        matches!(
            self.kind,
            Integer | Float | Bool | String | Bytes | None | Complex | Function | Type | Code
                | Module
        )
    }

    /// Whether values of this kind are mutable containers.
    pub fn is_mutable(&self) -> bool {
        use AbstractValueKind::*;
        matches!(self.kind, List | Set | Dict | Bytearray | Memoryview | Module)
    }

    /// Whether truth-testing this kind can never yield false.
    pub fn is_always_truthy(&self) -> bool {
        use AbstractValueKind::*;
        matches!(self.kind, Function | Type | Code | Module | Slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AbstractValueKind::*;

    #[test]
    fn test_interned_singletons() {
        let a = AbstractValue::of(Integer);
        let b = AbstractValue::of(Integer);
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.kind(), Integer);
    }

    #[test]
    fn test_binary_numeric_promotion() {
        let int = AbstractValue::of(Integer);
        assert_eq!(int.binary(Opcode::BinaryAdd, Integer), Integer);
        assert_eq!(int.binary(Opcode::BinaryAdd, Float), Float);
        assert_eq!(int.binary(Opcode::BinaryTrueDivide, Integer), Float);
        let float = AbstractValue::of(Float);
        assert_eq!(float.binary(Opcode::BinaryAdd, Integer), Float);
        // commutativity
        for op in [Opcode::BinaryAdd, Opcode::BinaryMultiply] {
            for a in ALL_KINDS {
                for b in ALL_KINDS {
                    assert_eq!(
                        AbstractValue::of(a).binary(op, b),
                        AbstractValue::of(b).binary(op, a),
                        "{:?} {:?} {:?}",
                        a,
                        op,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn test_binary_sequences() {
        assert_eq!(AbstractValue::of(String).binary(Opcode::BinaryAdd, String), String);
        assert_eq!(AbstractValue::of(List).binary(Opcode::BinaryAdd, List), List);
        assert_eq!(AbstractValue::of(String).binary(Opcode::BinaryMultiply, Integer), String);
        assert_eq!(AbstractValue::of(List).binary(Opcode::BinaryAdd, Tuple), Any);
    }

    #[test]
    fn test_any_is_absorbing() {
        for op in [
            Opcode::BinaryAdd,
            Opcode::BinarySubtract,
            Opcode::BinaryMultiply,
            Opcode::BinaryTrueDivide,
        ] {
            for k in ALL_KINDS {
                assert_eq!(AbstractValue::of(Any).binary(op, k), Any);
                assert_eq!(AbstractValue::of(k).binary(op, Any), Any);
            }
        }
    }

    #[test]
    fn test_merge_algebra() {
        for a in ALL_KINDS {
            for b in ALL_KINDS {
                // commutative
                assert_eq!(merge_kinds(a, b), merge_kinds(b, a));
                // idempotent
                assert_eq!(merge_kinds(a, a), a);
            }
            // Undefined is the identity
            assert_eq!(merge_kinds(Undefined, a), a);
        }
        assert_eq!(merge_kinds(Integer, Float), Any);
    }

    #[test]
    fn test_unary() {
        assert_eq!(AbstractValue::of(Integer).unary(Opcode::UnaryNegative), Integer);
        assert_eq!(AbstractValue::of(Bool).unary(Opcode::UnaryNegative), Integer);
        assert_eq!(AbstractValue::of(Float).unary(Opcode::UnaryNegative), Float);
        assert_eq!(AbstractValue::of(List).unary(Opcode::UnaryNot), Bool);
        assert_eq!(AbstractValue::of(Any).unary(Opcode::UnaryNot), Bool);
    }

    #[test]
    fn test_subscript() {
        assert_eq!(AbstractValue::of(String).subscript(Slice), String);
        assert_eq!(AbstractValue::of(List).subscript(Slice), List);
        assert_eq!(AbstractValue::of(Bytearray).subscript(Integer), Integer);
        assert_eq!(AbstractValue::of(List).subscript(Integer), Any);
    }

    #[test]
    fn test_predicates() {
        assert!(AbstractValue::of(Integer).is_hashable());
        assert!(!AbstractValue::of(List).is_hashable());
        assert!(AbstractValue::of(Dict).is_mutable());
        assert!(!AbstractValue::of(Tuple).is_mutable());
        assert!(AbstractValue::of(Function).is_always_truthy());
        assert!(!AbstractValue::of(Integer).is_always_truthy());
        assert!(supports_escaping(Integer));
        assert!(!supports_escaping(List));
    }
}
