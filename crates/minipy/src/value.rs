//! Runtime values and their Python-compatible rendering.

use std::fmt;

use crate::error::{ExcKind, Exception};
use crate::interp::OutputStream;

/// Functions the interpreter implements natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Int,
    Float,
    Bool,
    Abs,
    Min,
    Max,
    Sum,
    Range,
    Repr,
    /// Loops forever, yielding to the host on every turn.
    LoopForever,
    /// Busy-waits natively without ever yielding to the host.
    Spin,
    Sleep,
    Time,
    Monotonic,
    Write(OutputStream),
    Flush(OutputStream),
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "print" => Builtin::Print,
            "len" => Builtin::Len,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sum" => Builtin::Sum,
            "range" => Builtin::Range,
            "repr" => Builtin::Repr,
            "loop_forever" => Builtin::LoopForever,
            "spin" => Builtin::Spin,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Range => "range",
            Builtin::Repr => "repr",
            Builtin::LoopForever => "loop_forever",
            Builtin::Spin => "spin",
            Builtin::Sleep => "sleep",
            Builtin::Time => "time",
            Builtin::Monotonic => "monotonic",
            Builtin::Write(_) => "write",
            Builtin::Flush(_) => "flush",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Sys,
    Time,
}

impl Module {
    pub fn name(self) -> &'static str {
        match self {
            Module::Sys => "sys",
            Module::Time => "time",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Range { start: i64, stop: i64, step: i64 },
    Builtin(Builtin),
    Module(Module),
    Stream(OutputStream),
    ExcType(ExcKind),
    Exception(Exception),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Range { .. } => "range",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Module(_) => "module",
            Value::Stream(_) => "TextIOWrapper",
            Value::ExcType(_) => "type",
            Value::Exception(exc) => exc.kind.name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Range { .. } => self.range_len() > 0,
            _ => true,
        }
    }

    /// Number of elements in a range value; zero for anything else.
    pub(crate) fn range_len(&self) -> i64 {
        let Value::Range { start, stop, step } = *self else {
            return 0;
        };
        let (lo, hi, step) = if step > 0 {
            (start as i128, stop as i128, step as i128)
        } else {
            (stop as i128, start as i128, -(step as i128))
        };
        if hi <= lo {
            0
        } else {
            ((hi - lo + step - 1) / step) as i64
        }
    }

    /// Numeric view used by arithmetic; booleans behave as 0 and 1.
    pub(crate) fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(n) => Some(Number::Int(*n)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    pub(crate) fn as_int(&self, what: &str) -> Result<i64, Exception> {
        match self {
            Value::Bool(b) => Ok(*b as i64),
            Value::Int(n) => Ok(*n),
            other => Err(Exception::type_error(format!(
                "{} must be an integer, not '{}'",
                what,
                other.type_name()
            ))),
        }
    }

    /// Python `==`.
    pub fn py_eq(&self, other: &Value) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a.to_f64_eq(b);
        }
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (
                Value::Range {
                    start: a,
                    stop: b,
                    step: c,
                },
                Value::Range {
                    start: x,
                    stop: y,
                    step: z,
                },
            ) => (a, b, c) == (x, y, z),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Stream(a), Value::Stream(b)) => a == b,
            (Value::ExcType(a), Value::ExcType(b)) => a == b,
            _ => false,
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => repr_str(s),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Exception(exc) if exc.message.is_empty() => format!("{}()", exc.kind),
            Value::Exception(exc) => format!("{}({})", exc.kind, repr_str(&exc.message)),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => f.write_str(s),
            Value::List(_) => f.write_str(&self.repr()),
            Value::Range { start, stop, step } if *step == 1 => {
                write!(f, "range({}, {})", start, stop)
            }
            Value::Range { start, stop, step } => {
                write!(f, "range({}, {}, {})", start, stop, step)
            }
            Value::Builtin(b) => write!(f, "<built-in function {}>", b.name()),
            Value::Module(m) => write!(f, "<module '{}' (built-in)>", m.name()),
            Value::Stream(OutputStream::Stdout) => f.write_str("<_io.TextIOWrapper name='<stdout>'>"),
            Value::Stream(OutputStream::Stderr) => f.write_str("<_io.TextIOWrapper name='<stderr>'>"),
            Value::ExcType(kind) => write!(f, "<class '{}'>", kind),
            Value::Exception(exc) => f.write_str(&exc.message),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub(crate) fn to_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    fn to_f64_eq(self, other: Number) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (a, b) => a.to_f64() == b.to_f64(),
        }
    }
}

fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Shortest round-trip float text, spelled the way Python spells it.
pub(crate) fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let magnitude = x.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let text = format!("{:e}", x);
        let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    }
    let text = format!("{}", x);
    if text.contains('.') {
        text
    } else {
        format!("{}.0", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(3.0), "3.0");
        assert_eq!(format_float(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1.5e-5), "1.5e-05");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn test_str_and_repr() {
        let s = Value::Str("it's".into());
        assert_eq!(s.to_string(), "it's");
        assert_eq!(s.repr(), "\"it's\"");
        let list = Value::List(vec![Value::Int(1), Value::Str("a".into()), Value::None]);
        assert_eq!(list.to_string(), "[1, 'a', None]");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::List(vec![Value::None]).truthy());
        assert!(!Value::Range {
            start: 5,
            stop: 5,
            step: 1
        }
        .truthy());
    }

    #[test]
    fn test_range_len() {
        let r = |start, stop, step| Value::Range { start, stop, step }.range_len();
        assert_eq!(r(0, 10, 1), 10);
        assert_eq!(r(0, 10, 3), 4);
        assert_eq!(r(10, 0, -2), 5);
        assert_eq!(r(0, 10, -1), 0);
    }

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(1).py_eq(&Value::Str("1".into())));
    }
}
