//! NaN-boxed values.
//!
//! IEEE 754 quiet NaN leaves 50 payload bits unused once the quiet bits
//! `0x7FFC` are set. Every quill value fits in one `Copy` u64:
//!
//! ```text
//! double            any bit pattern where (bits & QNAN) != QNAN
//! null/false/true   QNAN | 1, 2, 3
//! integer           QNAN | 1 << 48 | 48-bit two's complement payload
//! char              QNAN | 2 << 48 | code point
//! type              QNAN | 3 << 48 | ValueType discriminant
//! object            SIGN | QNAN | 48-bit pointer to a HeapObject
//! ```

pub mod object;

use std::fmt;
use std::ptr::NonNull;

pub use object::{
    Builtin, BuiltinFn, Cleanup, Closure, Function, HeapObject, Map, Payload,
};

const SIGN: u64 = 0x8000_0000_0000_0000;
const QNAN: u64 = 0x7FFC_0000_0000_0000;
const OBJECT: u64 = SIGN | QNAN;
const TAG_SHIFT: u32 = 48;
const TAG_MASK: u64 = 0x0003_0000_0000_0000;
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_SINGLETON: u64 = 0;
const TAG_INT: u64 = 1;
const TAG_CHAR: u64 = 2;
const TAG_TYPE: u64 = 3;

const BITS_NULL: u64 = QNAN | 1;
const BITS_FALSE: u64 = QNAN | 2;
const BITS_TRUE: u64 = QNAN | 3;

/// Canonical NaN; outside the tagged space.
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

pub const INT_MAX: i64 = (1 << 47) - 1;
pub const INT_MIN: i64 = -(1 << 47);

/// Dynamic type discriminator. Also the payload of `Type` values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null = 0,
    Boolean,
    Integer,
    Decimal,
    Char,
    Type,
    String,
    Error,
    List,
    Map,
    Function,
    Closure,
    Builtin,
    Bounded,
    Pointer,
}

impl ValueType {
    pub const ALL: [ValueType; 15] = [
        ValueType::Null,
        ValueType::Boolean,
        ValueType::Integer,
        ValueType::Decimal,
        ValueType::Char,
        ValueType::Type,
        ValueType::String,
        ValueType::Error,
        ValueType::List,
        ValueType::Map,
        ValueType::Function,
        ValueType::Closure,
        ValueType::Builtin,
        ValueType::Bounded,
        ValueType::Pointer,
    ];

    pub fn from_u8(code: u8) -> Option<ValueType> {
        ValueType::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "Null",
            ValueType::Boolean => "Boolean",
            ValueType::Integer => "Integer",
            ValueType::Decimal => "Decimal",
            ValueType::Char => "Char",
            ValueType::Type => "Type",
            ValueType::String => "String",
            ValueType::Error => "Error",
            ValueType::List => "List",
            ValueType::Map => "Map",
            ValueType::Function => "Function",
            ValueType::Closure => "Closure",
            ValueType::Builtin => "Builtin",
            ValueType::Bounded => "Bounded",
            ValueType::Pointer => "Pointer",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const NULL: Value = Value(BITS_NULL);
    pub const TRUE: Value = Value(BITS_TRUE);
    pub const FALSE: Value = Value(BITS_FALSE);

    #[inline]
    pub fn boolean(b: bool) -> Self {
        if b { Value::TRUE } else { Value::FALSE }
    }

    /// Integers outside the 48-bit range become decimals.
    #[inline]
    pub fn int(n: i64) -> Self {
        if (INT_MIN..=INT_MAX).contains(&n) {
            Value(QNAN | (TAG_INT << TAG_SHIFT) | (n as u64 & PAYLOAD_MASK))
        } else {
            Value::decimal(n as f64)
        }
    }

    #[inline]
    pub fn decimal(d: f64) -> Self {
        if d.is_nan() {
            Value(CANONICAL_NAN)
        } else {
            Value(d.to_bits())
        }
    }

    #[inline]
    pub fn char(c: char) -> Self {
        Value(QNAN | (TAG_CHAR << TAG_SHIFT) | c as u64)
    }

    #[inline]
    pub fn type_tag(ty: ValueType) -> Self {
        Value(QNAN | (TAG_TYPE << TAG_SHIFT) | ty as u64)
    }

    /// Box a heap object pointer. Registration with the memory manager is
    /// the caller's job.
    pub(crate) fn from_object(ptr: NonNull<HeapObject>) -> Self {
        Value(OBJECT | (ptr.as_ptr() as u64 & PAYLOAD_MASK))
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    fn tag(self) -> Option<u64> {
        if self.0 & OBJECT == QNAN {
            Some((self.0 & TAG_MASK) >> TAG_SHIFT)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_decimal(self) -> bool {
        self.0 & QNAN != QNAN
    }

    #[inline]
    pub fn is_object(self) -> bool {
        self.0 & OBJECT == OBJECT
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == BITS_NULL
    }

    #[inline]
    pub fn is_int(self) -> bool {
        self.tag() == Some(TAG_INT)
    }

    pub fn as_int(self) -> Option<i64> {
        if self.is_int() {
            Some(((self.0 << 16) as i64) >> 16)
        } else {
            None
        }
    }

    pub fn as_decimal(self) -> Option<f64> {
        if self.is_decimal() { Some(f64::from_bits(self.0)) } else { None }
    }

    /// Integer or decimal, widened to f64.
    pub fn as_number(self) -> Option<f64> {
        self.as_int().map(|n| n as f64).or_else(|| self.as_decimal())
    }

    pub fn as_bool(self) -> Option<bool> {
        match self.0 {
            BITS_TRUE => Some(true),
            BITS_FALSE => Some(false),
            _ => None,
        }
    }

    pub fn as_char(self) -> Option<char> {
        if self.tag() == Some(TAG_CHAR) {
            char::from_u32((self.0 & PAYLOAD_MASK) as u32)
        } else {
            None
        }
    }

    pub fn as_type(self) -> Option<ValueType> {
        if self.tag() == Some(TAG_TYPE) {
            ValueType::from_u8((self.0 & PAYLOAD_MASK) as u8)
        } else {
            None
        }
    }

    pub(crate) fn object_ptr(self) -> Option<NonNull<HeapObject>> {
        if self.is_object() {
            NonNull::new((self.0 & PAYLOAD_MASK) as *mut HeapObject)
        } else {
            None
        }
    }

    /// Borrow the heap object behind an object value.
    ///
    /// Object values stay valid while they are reachable from a GC root;
    /// the memory manager never moves objects, it only frees unreachable
    /// ones during `sweep`.
    #[inline]
    pub fn as_object(&self) -> Option<&HeapObject> {
        // SAFETY: the pointer was produced from a leaked Box<HeapObject> in
        // `MemoryManager::alloc` and is only freed by `sweep` once no root
        // reaches it.
        self.object_ptr().map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub fn value_type(self) -> ValueType {
        if self.is_decimal() {
            return ValueType::Decimal;
        }
        if let Some(obj) = self.as_object() {
            return obj.kind();
        }
        match self.tag() {
            Some(TAG_INT) => ValueType::Integer,
            Some(TAG_CHAR) => ValueType::Char,
            Some(TAG_TYPE) => ValueType::Type,
            Some(TAG_SINGLETON) if self.0 == BITS_NULL => ValueType::Null,
            _ => ValueType::Boolean,
        }
    }

    pub fn is(self, ty: ValueType) -> bool {
        self.value_type() == ty
    }

    /// Null, `false`, integer 0 and Error values are falsy.
    pub fn is_falsy(self) -> bool {
        match self.0 {
            BITS_NULL | BITS_FALSE => true,
            _ if self.is_int() => self.as_int() == Some(0),
            _ => self.is(ValueType::Error),
        }
    }

    /// String content of a String or Error object.
    pub fn as_str(&self) -> Option<std::cell::Ref<'_, str>> {
        let obj = self.as_object()?;
        std::cell::Ref::filter_map(obj.payload(), |p| match p {
            Payload::String(s) | Payload::Error(s) => Some(s.as_str()),
            _ => None,
        })
        .ok()
    }

    fn write_nested(&self, f: &mut fmt::Formatter<'_>, depth: usize, quoted: bool) -> fmt::Result {
        if let Some(n) = self.as_int() {
            return write!(f, "{n}");
        }
        if let Some(d) = self.as_decimal() {
            return write!(f, "{d:?}");
        }
        if let Some(b) = self.as_bool() {
            return write!(f, "{b}");
        }
        if self.is_null() {
            return f.write_str("null");
        }
        if let Some(c) = self.as_char() {
            return if quoted { write!(f, "{c:?}") } else { write!(f, "{c}") };
        }
        if let Some(ty) = self.as_type() {
            return f.write_str(ty.name());
        }
        let Some(obj) = self.as_object() else {
            return write!(f, "<value {:#x}>", self.0);
        };
        if depth > 16 {
            return f.write_str("...");
        }
        match &*obj.payload() {
            Payload::String(s) => {
                if quoted { write!(f, "{s:?}") } else { f.write_str(s) }
            }
            Payload::Error(msg) => write!(f, "error: {msg}"),
            Payload::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.write_nested(f, depth + 1, true)?;
                }
                f.write_str("]")
            }
            Payload::Map(map) => {
                f.write_str("{")?;
                for (i, (key, val)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: ")?;
                    val.write_nested(f, depth + 1, true)?;
                }
                f.write_str("}")
            }
            Payload::Function(func) => write!(f, "<function {}>", func.display_name()),
            Payload::Closure(closure) => match closure.function.as_object().map(|o| o.payload()) {
                Some(p) => match &*p {
                    Payload::Function(func) => write!(f, "<function {}>", func.display_name()),
                    _ => f.write_str("<closure>"),
                },
                None => f.write_str("<closure>"),
            },
            Payload::Builtin(b) => write!(f, "<builtin {}>", b.name),
            Payload::Bounded { .. } => f.write_str("<bounded>"),
            Payload::Pointer(p) => write!(f, "<pointer {:p}>", *p),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_nested(f, 0, false)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_nested(f, 0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_round_trip() {
        for d in [0.0, -0.0, 1.5, -3.25, f64::INFINITY, f64::NEG_INFINITY, f64::MAX] {
            let v = Value::decimal(d);
            assert!(v.is_decimal());
            assert_eq!(v.as_decimal(), Some(d));
            assert_eq!(v.value_type(), ValueType::Decimal);
        }
        let nan = Value::decimal(f64::NAN);
        assert!(nan.is_decimal());
        assert!(nan.as_decimal().unwrap().is_nan());
    }

    #[test]
    fn integers_sign_extend() {
        for n in [0, 1, -1, 42, -42, INT_MAX, INT_MIN] {
            let v = Value::int(n);
            assert_eq!(v.as_int(), Some(n));
            assert_eq!(v.value_type(), ValueType::Integer);
            assert!(!v.is_decimal());
        }
    }

    #[test]
    fn integers_out_of_range_become_decimals() {
        let v = Value::int(INT_MAX + 1);
        assert_eq!(v.value_type(), ValueType::Decimal);
        assert_eq!(v.as_decimal(), Some((INT_MAX + 1) as f64));
    }

    #[test]
    fn singletons_decode_uniquely() {
        assert_eq!(Value::NULL.value_type(), ValueType::Null);
        assert_eq!(Value::TRUE.value_type(), ValueType::Boolean);
        assert_eq!(Value::FALSE.value_type(), ValueType::Boolean);
        assert_eq!(Value::TRUE.as_bool(), Some(true));
        assert_eq!(Value::NULL.as_bool(), None);
        assert_eq!(Value::NULL.as_int(), None);
    }

    #[test]
    fn chars_and_types() {
        let c = Value::char('λ');
        assert_eq!(c.as_char(), Some('λ'));
        assert_eq!(c.value_type(), ValueType::Char);
        for ty in ValueType::ALL {
            let v = Value::type_tag(ty);
            assert_eq!(v.as_type(), Some(ty));
            assert_eq!(v.value_type(), ValueType::Type);
        }
    }

    #[test]
    fn falsiness() {
        assert!(Value::NULL.is_falsy());
        assert!(Value::FALSE.is_falsy());
        assert!(Value::int(0).is_falsy());
        assert!(!Value::int(7).is_falsy());
        assert!(!Value::TRUE.is_falsy());
        assert!(!Value::decimal(0.5).is_falsy());
        assert!(!Value::char('a').is_falsy());
    }

    #[test]
    fn display_scalars() {
        assert_eq!(Value::int(7).to_string(), "7");
        assert_eq!(Value::decimal(2.0).to_string(), "2.0");
        assert_eq!(Value::NULL.to_string(), "null");
        assert_eq!(Value::type_tag(ValueType::Map).to_string(), "Map");
    }
}
