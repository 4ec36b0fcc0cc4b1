//! Operator semantics: arithmetic, comparison, INDEX/SET/SIZE and type
//! casts.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::{RuntimeErrorKind, VmResult};
use crate::bytecode::Op;
use crate::interpreter::Interpreter;
use crate::value::{Map, Payload, Value, ValueType};

fn symbol(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div => "/",
        Op::Mod => "%",
        Op::LShift => "<<",
        Op::RShift => ">>",
        Op::And => "&",
        Op::Or => "|",
        Op::LAnd => "and",
        Op::LOr => "or",
        Op::Eq => "==",
        Op::Ne => "!=",
        Op::Lt => "<",
        Op::Le => "<=",
        Op::Gt => ">",
        Op::Ge => ">=",
        other => other.name(),
    }
}

fn unsupported(op: Op, left: Value, right: Value) -> RuntimeErrorKind {
    RuntimeErrorKind::UnsupportedOperator { op: symbol(op), left: left.value_type(), right: right.value_type() }
}

fn compare(op: Op, ordering: Option<Ordering>) -> Option<Value> {
    let ordering = ordering?;
    let result = match op {
        Op::Lt => ordering == Ordering::Less,
        Op::Le => ordering != Ordering::Greater,
        Op::Gt => ordering == Ordering::Greater,
        Op::Ge => ordering != Ordering::Less,
        _ => return None,
    };
    Some(Value::boolean(result))
}

/// Content equality for numbers, strings, errors and scalars; identity
/// for every other object.
pub(crate) fn values_equal(left: Value, right: Value) -> bool {
    if let (Some(x), Some(y)) = (left.as_int(), right.as_int()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (left.as_number(), right.as_number()) {
        return x == y;
    }
    if left.bits() == right.bits() {
        return true;
    }
    let kind = left.value_type();
    if kind != right.value_type() || !matches!(kind, ValueType::String | ValueType::Error) {
        return false;
    }
    match (left.as_str(), right.as_str()) {
        (Some(a), Some(b)) => *a == *b,
        _ => false,
    }
}

fn int_op(op: Op, x: i64, y: i64) -> Result<Value, RuntimeErrorKind> {
    // i64 overflow falls back to f64; Value::int promotes past 48 bits.
    let checked = |r: Option<i64>, f: fn(f64, f64) -> f64| match r {
        Some(n) => Value::int(n),
        None => Value::decimal(f(x as f64, y as f64)),
    };
    Ok(match op {
        Op::Add => checked(x.checked_add(y), |a, b| a + b),
        Op::Sub => checked(x.checked_sub(y), |a, b| a - b),
        Op::Mul => checked(x.checked_mul(y), |a, b| a * b),
        Op::Div => {
            if y == 0 {
                return Err(RuntimeErrorKind::DivisionByZero);
            }
            Value::int(x / y)
        }
        Op::Mod => {
            if y == 0 {
                return Err(RuntimeErrorKind::DivisionByZero);
            }
            Value::int(x % y)
        }
        Op::LShift => {
            let shift = y.clamp(0, 63) as u32;
            match x.checked_shl(shift).filter(|r| r >> shift == x) {
                Some(n) => Value::int(n),
                None => Value::decimal(x as f64 * 2f64.powi(shift as i32)),
            }
        }
        Op::RShift => Value::int(x >> y.clamp(0, 63)),
        Op::And => Value::int(x & y),
        Op::Or => Value::int(x | y),
        _ => match compare(op, Some(x.cmp(&y))) {
            Some(v) => v,
            None => return Err(unsupported(op, Value::int(x), Value::int(y))),
        },
    })
}

fn decimal_op(op: Op, left: Value, right: Value, x: f64, y: f64) -> Result<Value, RuntimeErrorKind> {
    Ok(match op {
        Op::Add => Value::decimal(x + y),
        Op::Sub => Value::decimal(x - y),
        Op::Mul => Value::decimal(x * y),
        Op::Div => Value::decimal(x / y),
        Op::Mod => Value::decimal(x % y),
        _ => match compare(op, x.partial_cmp(&y)) {
            Some(v) => v,
            None if matches!(op, Op::Lt | Op::Le | Op::Gt | Op::Ge) => Value::FALSE,
            None => return Err(unsupported(op, left, right)),
        },
    })
}

/// Position `i` in a sequence of `len`, negative counting from the end.
fn element_position(i: i64, len: usize) -> Option<usize> {
    let i = if i < 0 { len as i64 + i } else { i };
    usize::try_from(i).ok().filter(|&i| i < len)
}

/// Slice bound: negative `b` means `len + 1 + b`, clamped to the sequence.
fn slice_bound(b: i64, len: usize) -> usize {
    let b = if b < 0 { len as i64 + 1 + b } else { b };
    b.clamp(0, len as i64) as usize
}

impl Interpreter {
    pub(super) fn negate(&mut self, v: Value) -> VmResult<Value> {
        if let Some(n) = v.as_int() {
            return Ok(Value::int(-n));
        }
        if let Some(d) = v.as_decimal() {
            return Ok(Value::decimal(-d));
        }
        Err(RuntimeErrorKind::UnsupportedUnary { op: "-", operand: v.value_type() }.into())
    }

    pub(super) fn binary(&mut self, op: Op, left: Value, right: Value) -> VmResult<Value> {
        match op {
            Op::Eq => return Ok(Value::boolean(values_equal(left, right))),
            Op::Ne => return Ok(Value::boolean(!values_equal(left, right))),
            Op::LAnd => return Ok(Value::boolean(!left.is_falsy() && !right.is_falsy())),
            Op::LOr => return Ok(Value::boolean(!left.is_falsy() || !right.is_falsy())),
            _ => {}
        }
        if let (Some(x), Some(y)) = (left.as_int(), right.as_int()) {
            return Ok(int_op(op, x, y)?);
        }
        if let (Some(x), Some(y)) = (left.as_number(), right.as_number()) {
            return Ok(decimal_op(op, left, right, x, y)?);
        }

        match (left.value_type(), right.value_type()) {
            (ValueType::String, ValueType::String) => {
                let (a, b) = match (left.as_str(), right.as_str()) {
                    (Some(a), Some(b)) => (a.to_string(), b.to_string()),
                    _ => return Err(unsupported(op, left, right).into()),
                };
                if op == Op::Add {
                    return Ok(self.heap.string(a + &b));
                }
                if let Some(v) = compare(op, Some(a.cmp(&b))) {
                    return Ok(v);
                }
            }
            (ValueType::Char, ValueType::Char) => {
                if let Some(v) = compare(op, left.as_char().partial_cmp(&right.as_char())) {
                    return Ok(v);
                }
            }
            (ValueType::List, ValueType::List) if op == Op::Add => {
                let mut items = self.list_items(left);
                items.extend(self.list_items(right));
                return Ok(self.heap.list(items));
            }
            _ if matches!(op, Op::And | Op::Or) => {
                let (l, r) = (!left.is_falsy(), !right.is_falsy());
                return Ok(Value::boolean(if op == Op::And { l && r } else { l || r }));
            }
            _ => {}
        }
        Err(unsupported(op, left, right).into())
    }

    fn list_items(&self, list: Value) -> Vec<Value> {
        match list.as_object().map(|o| o.payload()) {
            Some(p) => match &*p {
                Payload::List(items) => items.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// `container[index]`.
    pub(super) fn index(&mut self, container: Value, index: Value) -> VmResult<Value> {
        let bad = || RuntimeErrorKind::BadIndex { container: container.value_type(), index: index.value_type() };
        let obj = container.as_object().ok_or_else(bad)?;

        enum Found {
            Value(Value),
            Text(String),
            Hook(Value),
        }
        let found = match (&*obj.payload(), index.as_int()) {
            (Payload::List(items), Some(i)) => {
                Found::Value(element_position(i, items.len()).map(|p| items[p]).unwrap_or(Value::NULL))
            }
            (Payload::String(s), Some(i)) => {
                let len = s.chars().count();
                match element_position(i, len).and_then(|p| s.chars().nth(p)) {
                    Some(c) => Found::Text(c.to_string()),
                    None => Found::Value(Value::NULL),
                }
            }
            (Payload::Map(map), Some(i)) => match usize::try_from(i).ok().and_then(|p| map.key_at(p)) {
                Some(key) => Found::Text(key.to_string()),
                None => Found::Value(Value::NULL),
            },
            (Payload::Map(map), None) if index.is(ValueType::String) => {
                let key = index.as_str().map(|k| k.to_string()).unwrap_or_default();
                match (map.get(&key), map.get("__index__")) {
                    (Some(v), _) => Found::Value(v),
                    (None, Some(hook)) => Found::Hook(hook),
                    (None, None) => Found::Value(Value::NULL),
                }
            }
            _ => return Err(bad().into()),
        };

        match found {
            Found::Value(v) => Ok(v),
            Found::Text(s) => Ok(self.heap.string(s)),
            Found::Hook(hook) => self.call_nested(hook, &[container, index]),
        }
    }

    /// `container[start:end]` for strings and lists.
    pub(super) fn slice(&mut self, container: Value, start: Value, end: Value) -> VmResult<Value> {
        let (Some(a), Some(b)) = (start.as_int(), end.as_int()) else {
            let index = if start.is_int() { end } else { start };
            return Err(RuntimeErrorKind::BadIndex { container: container.value_type(), index: index.value_type() }.into());
        };
        let bad = || RuntimeErrorKind::BadIndex { container: container.value_type(), index: ValueType::Integer };
        let obj = container.as_object().ok_or_else(bad)?;

        enum Part {
            Text(String),
            Items(Vec<Value>),
        }
        let part = match &*obj.payload() {
            Payload::String(s) => {
                let len = s.chars().count();
                let (from, to) = (slice_bound(a, len), slice_bound(b, len));
                Part::Text(s.chars().skip(from).take(to.saturating_sub(from)).collect())
            }
            Payload::List(items) => {
                let (from, to) = (slice_bound(a, items.len()), slice_bound(b, items.len()));
                Part::Items(items.get(from..to.max(from)).map(<[Value]>::to_vec).unwrap_or_default())
            }
            _ => return Err(bad().into()),
        };
        match part {
            Part::Text(text) => Ok(self.heap.string(text)),
            Part::Items(items) => {
                let items = items.into_iter().map(|v| self.deep_clone(v)).collect();
                Ok(self.heap.list(items))
            }
        }
    }

    /// `container[index] = value`.
    pub(super) fn set_index(&mut self, container: Value, index: Value, value: Value) -> VmResult<()> {
        let bad = || RuntimeErrorKind::BadIndex { container: container.value_type(), index: index.value_type() };
        let obj = container.as_object().ok_or_else(bad)?;

        let hook = match &*obj.payload() {
            Payload::Map(map) => map.get("__set_index__"),
            _ => None,
        };
        if let Some(hook) = hook {
            self.call_nested(hook, &[container, index, value])?;
            return Ok(());
        }

        let replacement = if container.is(ValueType::String) {
            match (value.as_int(), value.as_char(), value.as_str()) {
                (Some(code), _, _) => Some(
                    u32::try_from(code)
                        .ok()
                        .and_then(char::from_u32)
                        .map(String::from)
                        .ok_or(RuntimeErrorKind::InvalidCast { from: ValueType::Integer, to: ValueType::Char })?,
                ),
                (None, Some(c), _) => Some(c.to_string()),
                (None, None, Some(s)) if value.is(ValueType::String) => Some(s.to_string()),
                _ => {
                    return Err(RuntimeErrorKind::BadElement { container: ValueType::String, value: value.value_type() }
                        .into());
                }
            }
        } else {
            None
        };

        let mut payload = obj.payload_mut();
        match (&mut *payload, index.as_int()) {
            (Payload::List(items), Some(i)) => {
                let len = items.len();
                let at = element_position(i, len)
                    .ok_or(RuntimeErrorKind::IndexOutOfBounds { container: ValueType::List, index: i, len })?;
                items[at] = value;
            }
            (Payload::String(s), Some(i)) => {
                let len = s.chars().count();
                let at = element_position(i, len)
                    .ok_or(RuntimeErrorKind::IndexOutOfBounds { container: ValueType::String, index: i, len })?;
                let replacement = replacement.unwrap_or_default();
                let mut out: String = s.chars().take(at).collect();
                out.push_str(&replacement);
                out.extend(s.chars().skip(at + 1));
                *s = out;
            }
            (Payload::Map(map), None) if index.is(ValueType::String) => {
                let key = index.as_str().map(|k| k.to_string()).unwrap_or_default();
                map.insert(key, value);
            }
            _ => return Err(bad().into()),
        }
        Ok(())
    }

    /// Length of a string (in characters), list or map.
    pub(crate) fn size(&self, container: Value) -> VmResult<usize> {
        let no_length = || RuntimeErrorKind::NoLength(container.value_type());
        let obj = container.as_object().ok_or_else(no_length)?;
        match &*obj.payload() {
            Payload::String(s) => Ok(s.chars().count()),
            Payload::List(items) => Ok(items.len()),
            Payload::Map(map) => Ok(map.len()),
            _ => Err(no_length().into()),
        }
    }

    /// Copy strings, lists and maps recursively; everything else is
    /// shared. Shared substructure and cycles are preserved.
    pub(crate) fn deep_clone(&mut self, value: Value) -> Value {
        let mut seen = HashMap::new();
        self.clone_into(value, &mut seen)
    }

    fn clone_into(&mut self, value: Value, seen: &mut HashMap<u64, Value>) -> Value {
        if let Some(&copy) = seen.get(&value.bits()) {
            return copy;
        }
        let Some(obj) = value.as_object() else { return value };
        let shape = match &*obj.payload() {
            Payload::String(s) => Payload::String(s.clone()),
            Payload::List(items) => Payload::List(items.clone()),
            Payload::Map(map) => Payload::Map(map.clone()),
            _ => return value,
        };
        let copy = self.heap.alloc(shape);
        seen.insert(value.bits(), copy);

        let children: Vec<Value> = match copy.as_object().map(|o| o.payload()) {
            Some(p) => match &*p {
                Payload::List(items) => items.clone(),
                Payload::Map(map) => map.values().collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        if children.is_empty() {
            return copy;
        }
        let cloned: Vec<Value> = children.into_iter().map(|c| self.clone_into(c, seen)).collect();
        if let Some(obj) = copy.as_object() {
            match &mut *obj.payload_mut() {
                Payload::List(items) => *items = cloned,
                Payload::Map(map) => {
                    let keys: Vec<String> = map.keys().map(str::to_string).collect();
                    let mut rebuilt = Map::new();
                    for (key, v) in keys.into_iter().zip(cloned) {
                        rebuilt.insert(key, v);
                    }
                    *map = rebuilt;
                }
                _ => {}
            }
        }
        copy
    }

    /// Calling a type value: `Integer(x)`, `String(x)`, `Error(...)`, ...
    pub(super) fn cast(&mut self, target: ValueType, args: &[Value]) -> VmResult<Value> {
        if target == ValueType::Error {
            let message: String = args.iter().map(|a| a.to_string()).collect();
            return Ok(self.heap.error(message));
        }
        let [x] = args else {
            return Err(RuntimeErrorKind::Arity { callee: target.name().to_string(), expected: 1, got: args.len() }.into());
        };
        let x = *x;
        let invalid = || RuntimeErrorKind::InvalidCast { from: x.value_type(), to: target };

        let result = match target {
            ValueType::Integer => {
                if x.is_int() {
                    x
                } else if let Some(d) = x.as_decimal() {
                    if !d.is_finite() {
                        return Err(invalid().into());
                    }
                    Value::int(d.trunc() as i64)
                } else if let Some(b) = x.as_bool() {
                    Value::int(i64::from(b))
                } else if let Some(c) = x.as_char() {
                    Value::int(i64::from(u32::from(c)))
                } else if x.is(ValueType::String) {
                    let text = x.as_str().map(|s| s.trim().to_string()).unwrap_or_default();
                    match text.parse::<i64>() {
                        Ok(n) => Value::int(n),
                        Err(_) => match text.parse::<f64>() {
                            Ok(d) if d.is_finite() => Value::int(d.trunc() as i64),
                            _ => return Err(RuntimeErrorKind::NotANumber(text).into()),
                        },
                    }
                } else {
                    return Err(invalid().into());
                }
            }
            ValueType::Decimal => {
                if let Some(d) = x.as_number() {
                    Value::decimal(d)
                } else if let Some(b) = x.as_bool() {
                    Value::decimal(if b { 1.0 } else { 0.0 })
                } else if x.is(ValueType::String) {
                    let text = x.as_str().map(|s| s.trim().to_string()).unwrap_or_default();
                    match text.parse::<f64>() {
                        Ok(d) => Value::decimal(d),
                        Err(_) => return Err(RuntimeErrorKind::NotANumber(text).into()),
                    }
                } else {
                    return Err(invalid().into());
                }
            }
            ValueType::String => {
                let text = match x.as_object().map(|o| o.payload()) {
                    Some(p) => match &*p {
                        Payload::List(items) => items.iter().map(|v| v.to_string()).collect(),
                        _ => x.to_string(),
                    },
                    None => x.to_string(),
                };
                self.heap.string(text)
            }
            ValueType::Char => {
                if x.as_char().is_some() {
                    x
                } else if let Some(c) = x.as_int().and_then(|n| u32::try_from(n).ok()).and_then(char::from_u32) {
                    Value::char(c)
                } else {
                    let single = x
                        .as_str()
                        .filter(|_| x.is(ValueType::String))
                        .and_then(|s| {
                            let mut chars = s.chars();
                            match (chars.next(), chars.next()) {
                                (Some(c), None) => Some(c),
                                _ => None,
                            }
                        });
                    Value::char(single.ok_or_else(invalid)?)
                }
            }
            ValueType::Boolean => Value::boolean(!x.is_falsy()),
            ValueType::Type => Value::type_tag(x.value_type()),
            _ => return Err(invalid().into()),
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_and_bounds() {
        assert_eq!(element_position(0, 3), Some(0));
        assert_eq!(element_position(-1, 3), Some(2));
        assert_eq!(element_position(3, 3), None);
        assert_eq!(element_position(-4, 3), None);
        assert_eq!(slice_bound(-1, 5), 5);
        assert_eq!(slice_bound(-2, 5), 4);
        assert_eq!(slice_bound(9, 5), 5);
        assert_eq!(slice_bound(-20, 5), 0);
    }

    #[test]
    fn integer_operators() {
        assert_eq!(int_op(Op::Sub, 2, 5).unwrap().as_int(), Some(-3));
        assert_eq!(int_op(Op::RShift, -8, 1).unwrap().as_int(), Some(-4));
        assert_eq!(int_op(Op::Le, 2, 2).unwrap(), Value::TRUE);
        assert_eq!(int_op(Op::Div, 1, 0).unwrap_err(), RuntimeErrorKind::DivisionByZero);
        assert!(int_op(Op::Mul, i64::MAX, 2).unwrap().is_decimal());
    }

    #[test]
    fn decimal_comparisons_with_nan_are_false() {
        let nan = Value::decimal(f64::NAN);
        assert_eq!(decimal_op(Op::Lt, nan, nan, f64::NAN, 1.0).unwrap(), Value::FALSE);
        assert!(!values_equal(nan, nan));
    }

    #[test]
    fn deep_clone_copies_nested_containers() {
        let mut interp = Interpreter::new();
        let inner = interp.list(vec![Value::int(1)]);
        let outer = interp.list(vec![inner, inner]);
        let copy = interp.deep_clone(outer);
        assert_ne!(copy.bits(), outer.bits());
        assert_eq!(copy.to_string(), outer.to_string());
        let first = interp.index(copy, Value::int(0)).unwrap();
        let second = interp.index(copy, Value::int(1)).unwrap();
        assert_ne!(first.bits(), inner.bits());
        assert_eq!(first.bits(), second.bits());
    }

    #[test]
    fn deep_clone_handles_cycles() {
        let mut interp = Interpreter::new();
        let list = interp.list(Vec::new());
        if let Some(obj) = list.as_object() {
            if let Payload::List(items) = &mut *obj.payload_mut() {
                items.push(list);
            }
        }
        let copy = interp.deep_clone(list);
        let inner = interp.index(copy, Value::int(0)).unwrap();
        assert_eq!(inner.bits(), copy.bits());
    }
}
