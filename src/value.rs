use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter, Write};
use std::sync::Arc;

use ordered_float::OrderedFloat;
use regex::Regex;

use crate::ast::MacroDef;

/// Outcome of a host method invocation: the host either produces a value or
/// reports a failure message, which the evaluator wraps as a host error with
/// template position context.
pub type HostResult = Result<Value, String>;

/// Protocol by which the evaluator reads and invokes host-supplied objects.
///
/// Every method except [`is_truthy`](HostObject::is_truthy) and
/// [`render`](HostObject::render) defaults to *missing*/*unsupported*, so an
/// implementation only overrides the capabilities it has. Reflection over a
/// concrete host type lives entirely behind this trait; the evaluator never
/// downcasts.
pub trait HostObject: Debug + Send + Sync {
    /// Named property lookup. `None` means the property is missing.
    fn get_property(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Keyed lookup (`$obj[expr]`). `None` means the key is missing.
    fn get_index(&self, _key: &Value) -> Option<Value> {
        None
    }

    /// Named method invocation. `None` means no such method; `Some(Err(_))`
    /// is a host failure that propagates even through quiet references.
    fn invoke(&self, _name: &str, _args: &[Value]) -> Option<HostResult> {
        None
    }

    /// Invocation of the object itself, for callables bound directly in the
    /// context (`$transform("x")`).
    fn call(&self, _args: &[Value]) -> Option<HostResult> {
        None
    }

    /// A finite ordered view for `#foreach`. `None` means not iterable.
    fn iterate(&self) -> Option<Vec<Value>> {
        None
    }

    /// Property assignment via `#set($obj.name = value)`. Returning `false`
    /// reports the target as unsupported.
    fn set_property(&self, _name: &str, _value: Value) -> bool {
        false
    }

    /// Keyed assignment via `#set($obj[key] = value)`.
    fn set_index(&self, _key: &Value, _value: Value) -> bool {
        false
    }

    /// Truth value in boolean contexts. Hosts with an "empty" notion
    /// override this.
    fn is_truthy(&self) -> bool {
        true
    }

    /// Text emitted when a reference resolves to this object.
    fn render(&self) -> String {
        format!("{:?}", self)
    }
}

/// A block bound by `#define` (or a macro-shaped closure); re-rendered in
/// the referencing namespace each time it is read. Opaque to hosts.
#[derive(Clone, Debug)]
pub struct MacroValue(pub(crate) Arc<MacroDef>);

/// An inclusive integer range literal, `[lo..hi]`. Iteration descends when
/// `end < start`, so `[5..-2]` yields 5, 4, ..., -2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        self.start.abs_diff(self.end) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> {
        let (start, end, step) = if self.end < self.start {
            (self.start, self.end, -1)
        } else {
            (self.start, self.end, 1)
        };
        std::iter::successors(Some(start), move |&v| {
            if v == end {
                None
            } else {
                Some(v + step)
            }
        })
    }
}

/// The dynamic value model shared by the context, the evaluator, and the
/// host-object protocol.
///
/// Maps preserve insertion order and compare order-sensitively; lookup is a
/// linear scan over the pairs.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    Seq(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Range(Range),
    Macro(MacroValue),
    Object(Arc<dyn HostObject>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Seq(_) => "list",
            Value::Map(_) => "map",
            Value::Range(_) => "range",
            Value::Macro(_) => "macro",
            Value::Object(_) => "object",
        }
    }

    pub fn float(v: f64) -> Value {
        Value::Float(OrderedFloat(v))
    }

    pub fn seq(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Seq(items.into_iter().collect())
    }

    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Value
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn object(obj: impl HostObject + 'static) -> Value {
        Value::Object(Arc::new(obj))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => v.0 != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Seq(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Range(r) => !r.is_empty(),
            Value::Macro(_) => true,
            Value::Object(obj) => obj.is_truthy(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(v.0),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            // Numeric kinds compare numerically across the Int/Float divide.
            (Value::Int(a), Value::Float(b)) => *a as f64 == b.0,
            (Value::Float(a), Value::Int(b)) => a.0 == *b as f64,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Macro(a), Value::Macro(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Ordering across values where one exists: numeric pairs numerically,
/// strings lexicographically. Everything else is unordered.
pub(crate) fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Some(a.cmp(b));
    }
    None
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write_float(f, v.0),
            Value::Str(s) => f.write_str(s),
            Value::Seq(_) | Value::Map(_) | Value::Range(_) => write_nested(self, f),
            Value::Macro(_) => Ok(()),
            Value::Object(obj) => f.write_str(&obj.render()),
        }
    }
}

// Integral floats keep one decimal so `100.0 / 50` renders as "2.0".
fn write_float(out: &mut dyn Write, v: f64) -> fmt::Result {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        write!(out, "{:.1}", v)
    } else {
        write!(out, "{}", v)
    }
}

// Inside containers strings are double-quoted, so a map renders JSON-ish:
// {"k": 1, "x": "y"}.
fn write_nested(value: &Value, f: &mut Formatter<'_>) -> fmt::Result {
    match value {
        Value::Str(s) => write!(f, "\"{}\"", s),
        Value::Seq(items) => {
            f.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_nested(item, f)?;
            }
            f.write_char(']')
        }
        Value::Map(entries) => {
            f.write_char('{')?;
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_nested(k, f)?;
                f.write_str(": ")?;
                write_nested(v, f)?;
            }
            f.write_char('}')
        }
        Value::Range(r) => {
            f.write_char('[')?;
            for (i, v) in r.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", v)?;
            }
            f.write_char(']')
        }
        other => Display::fmt(other, f),
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(OrderedFloat(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Seq(v)
    }
}

/// Failure reported by a value-protocol operation, before template position
/// context is attached by the evaluator.
#[derive(Debug)]
pub(crate) enum OpError {
    /// Evaluation failure (type mismatch, arity, bad index kind, ...).
    Exec(String),
    /// Failure surfaced by host code through the protocol.
    Host(String),
}

pub(crate) type OpResult<T> = Result<T, OpError>;

fn exec<T>(message: impl Into<String>) -> OpResult<T> {
    Err(OpError::Exec(message.into()))
}

/// Property lookup, `$obj.name`. `Ok(None)` is *missing*.
///
/// On maps the entry keyed by the literal name wins, shadowing built-in
/// methods. On host objects the protocol chain is: `get_property`, then a
/// zero-argument method of the same name, then the bean accessors
/// `get_name`, `getName`, `isName` in that order.
pub(crate) fn get_property(value: &Value, name: &str) -> OpResult<Option<Value>> {
    match value {
        Value::Map(entries) => Ok(lookup_map(entries, &Value::Str(name.to_string()))),
        Value::Object(obj) => {
            if let Some(found) = obj.get_property(name) {
                return Ok(Some(found));
            }
            for candidate in accessor_names(name) {
                if let Some(outcome) = obj.invoke(&candidate, &[]) {
                    return outcome.map(Some).map_err(OpError::Host);
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn accessor_names(name: &str) -> Vec<String> {
    let mut capitalized = String::with_capacity(name.len());
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        capitalized.extend(first.to_uppercase());
        capitalized.push_str(chars.as_str());
    }
    vec![
        name.to_string(),
        format!("get_{}", name),
        format!("get{}", capitalized),
        format!("is{}", capitalized),
    ]
}

/// Keyed lookup, `$obj[key]`. `Ok(None)` is *missing*: an absent map key,
/// an out-of-range or negative sequence/string index.
pub(crate) fn get_index(value: &Value, key: &Value) -> OpResult<Option<Value>> {
    match value {
        Value::Seq(items) => match key {
            Value::Int(i) => Ok(usize::try_from(*i).ok().and_then(|i| items.get(i).cloned())),
            other => exec(format!("list index must be an integer, got {}", other.kind())),
        },
        Value::Map(entries) => Ok(lookup_map(entries, key)),
        Value::Str(s) => match key {
            Value::Int(i) => Ok(usize::try_from(*i)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|ch| Value::Str(ch.to_string()))),
            other => exec(format!(
                "string index must be an integer, got {}",
                other.kind()
            )),
        },
        Value::Object(obj) => Ok(obj.get_index(key)),
        other => exec(format!("cannot index into {}", other.kind())),
    }
}

fn lookup_map(entries: &[(Value, Value)], key: &Value) -> Option<Value> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

/// Finite ordered view for `#foreach`. Maps yield their keys in insertion
/// order; strings iterate by character. `None` means not iterable.
pub(crate) fn iterate(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Seq(items) => Some(items.clone()),
        Value::Map(entries) => Some(entries.iter().map(|(k, _)| k.clone()).collect()),
        Value::Range(r) => Some(r.iter().map(Value::Int).collect()),
        Value::Str(s) => Some(s.chars().map(|ch| Value::Str(ch.to_string())).collect()),
        Value::Object(obj) => obj.iterate(),
        _ => None,
    }
}

/// Built-in methods on the primitive kinds, mirroring the Java-flavoured
/// helpers Velocity exposes. `Ok(None)` means the kind has no such method.
pub(crate) fn builtin_method(value: &Value, name: &str, args: &[Value]) -> OpResult<Option<Value>> {
    match (value, name) {
        (Value::Str(s), "length") => {
            expect_arity("length", args, 0)?;
            Ok(Some(Value::Int(s.chars().count() as i64)))
        }
        (Value::Str(s), "startsWith") => {
            expect_arity("startsWith", args, 1)?;
            let prefix = expect_str("startsWith", &args[0])?;
            Ok(Some(Value::Bool(s.starts_with(prefix))))
        }
        (Value::Str(s), "replaceAll") => {
            expect_arity("replaceAll", args, 2)?;
            let pattern = expect_str("replaceAll", &args[0])?;
            let replacement = expect_str("replaceAll", &args[1])?;
            let re = Regex::new(pattern)
                .map_err(|e| OpError::Exec(format!("invalid pattern in replaceAll: {}", e)))?;
            Ok(Some(Value::Str(
                re.replace_all(s, replacement).into_owned(),
            )))
        }
        (Value::Seq(items), "size") => {
            expect_arity("size", args, 0)?;
            Ok(Some(Value::Int(items.len() as i64)))
        }
        (Value::Seq(_), "get") => {
            expect_arity("get", args, 1)?;
            get_index(value, &args[0]).map(|found| Some(found.unwrap_or(Value::Null)))
        }
        (Value::Seq(items), "contains") => {
            expect_arity("contains", args, 1)?;
            Ok(Some(Value::Bool(items.contains(&args[0]))))
        }
        (Value::Map(entries), "size") => {
            expect_arity("size", args, 0)?;
            Ok(Some(Value::Int(entries.len() as i64)))
        }
        (Value::Map(entries), "get") => {
            expect_arity("get", args, 1)?;
            Ok(Some(lookup_map(entries, &args[0]).unwrap_or(Value::Null)))
        }
        (Value::Map(entries), "keySet") => {
            expect_arity("keySet", args, 0)?;
            Ok(Some(Value::Seq(
                entries.iter().map(|(k, _)| k.clone()).collect(),
            )))
        }
        _ => Ok(None),
    }
}

fn expect_arity(name: &str, args: &[Value], want: usize) -> OpResult<()> {
    if args.len() == want {
        Ok(())
    } else {
        exec(format!(
            "{}() expects {} argument(s), got {}",
            name,
            want,
            args.len()
        ))
    }
}

fn expect_str<'a>(name: &str, arg: &'a Value) -> OpResult<&'a str> {
    match arg {
        Value::Str(s) => Ok(s),
        other => exec(format!(
            "{}() expects a string argument, got {}",
            name,
            other.kind()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert_eq!(Value::Int(1), Value::float(1.0));
        assert_ne!(Value::Int(1), Value::Str("1".into()));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn unlike_kinds_are_unordered() {
        assert_eq!(
            compare_values(&Value::Str("5".into()), &Value::Int(3)),
            None
        );
        assert_eq!(
            compare_values(&Value::Int(2), &Value::float(2.5)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn display_keeps_integral_float_decimal() {
        assert_eq!(Value::float(2.0).to_string(), "2.0");
        assert_eq!(Value::float(2.5).to_string(), "2.5");
        assert_eq!(Value::Int(7).to_string(), "7");
    }

    #[test]
    fn containers_quote_inner_strings() {
        let v = Value::seq([Value::Int(1), Value::Str("a".into())]);
        assert_eq!(v.to_string(), "[1, \"a\"]");
        let m = Value::map([("k", Value::Int(2))]);
        assert_eq!(m.to_string(), "{\"k\": 2}");
    }

    #[test]
    fn range_iterates_both_directions() {
        let asc: Vec<i64> = Range { start: 1, end: 3 }.iter().collect();
        assert_eq!(asc, vec![1, 2, 3]);
        let desc: Vec<i64> = Range { start: 2, end: -2 }.iter().collect();
        assert_eq!(desc, vec![2, 1, 0, -1, -2]);
    }

    #[test]
    fn map_iteration_yields_keys_in_insertion_order() {
        let m = Value::map([("b", 1), ("a", 2)]);
        let keys = iterate(&m).expect("iterable");
        assert_eq!(keys, vec![Value::Str("b".into()), Value::Str("a".into())]);
    }

    #[test]
    fn negative_and_out_of_range_indexes_are_missing() {
        let seq = Value::seq([Value::Int(10)]);
        assert!(get_index(&seq, &Value::Int(-1)).expect("ok").is_none());
        assert!(get_index(&seq, &Value::Int(5)).expect("ok").is_none());
        assert!(get_index(&seq, &Value::Str("x".into())).is_err());
    }

    #[test]
    fn replace_all_is_regex_based() {
        let s = Value::Str("foobar123bab".into());
        let out = builtin_method(&s, "replaceAll", &["ba.".into(), "foo".into()])
            .expect("ok")
            .expect("method");
        assert_eq!(out, Value::Str("foofoo123foo".into()));
    }
}
