//! Tree-walking evaluator.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::ast::{BinOp, CmpOp, Expr, Stmt, StmtKind, UnaryOp};
use crate::error::{ExcKind, Exception};
use crate::parser::parse;
use crate::value::{Builtin, Module, Number, Value};

/// Longest string or list a repetition may build.
const MAX_SEQUENCE_LEN: usize = 1 << 27;

/// Bounds evaluator recursion well inside an engine thread's stack.
const MAX_EVAL_DEPTH: usize = 1000;

/// Granularity of `time.sleep`, so a sleeping program still notices a stop request.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// The embedder's side of a running program.
pub trait Host {
    /// Receives text written by `print` or `sys.<stream>.write`.
    fn write(&mut self, stream: OutputStream, text: &str);

    /// Called before every statement, on every loop iteration, and while
    /// sleeping. An error aborts the program with that exception.
    fn checkpoint(&mut self) -> Result<(), Exception>;
}

enum Flow {
    Normal,
    Break,
    Continue,
}

#[derive(Default)]
pub struct Interpreter {
    globals: HashMap<String, Value>,
    /// Current expression evaluation depth
    depth: usize,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and run `source` against the persistent globals.
    ///
    /// Bindings made before an exception escapes are kept.
    pub fn run(&mut self, source: &str, host: &mut dyn Host) -> Result<(), Exception> {
        let program = parse(source)?;
        self.exec_block(&program, host)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Drop every global binding.
    pub fn reset(&mut self) {
        self.globals.clear();
    }

    fn exec_block(&mut self, body: &[Stmt], host: &mut dyn Host) -> Result<Flow, Exception> {
        for stmt in body {
            host.checkpoint().map_err(|e| e.at_line(stmt.line))?;
            match self.exec(stmt, host).map_err(|e| e.at_line(stmt.line))? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, host: &mut dyn Host) -> Result<Flow, Exception> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, host)?;
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, host)?;
                self.globals.insert(target.clone(), value);
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self.lookup(target)?;
                let rhs = self.eval(value, host)?;
                let result = binary(*op, &current, &rhs)?;
                self.globals.insert(target.clone(), result);
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond, host)?.truthy() {
                        return self.exec_block(body, host);
                    }
                }
                return self.exec_block(orelse, host);
            }
            StmtKind::While { cond, body } => loop {
                host.checkpoint()?;
                if !self.eval(cond, host)?.truthy() {
                    break;
                }
                if let Flow::Break = self.exec_block(body, host)? {
                    break;
                }
            },
            StmtKind::For { var, iter, body } => {
                let iterable = self.eval(iter, host)?;
                self.exec_for(var, iterable, body, host)?;
            }
            StmtKind::Import { module, alias } => {
                let value = match module.as_str() {
                    "sys" => Value::Module(Module::Sys),
                    "time" => Value::Module(Module::Time),
                    other => {
                        return Err(Exception::new(
                            ExcKind::ModuleNotFoundError,
                            format!("No module named '{}'", other),
                        ))
                    }
                };
                self.globals.insert(alias.clone(), value);
            }
            StmtKind::Raise(None) => {
                return Err(Exception::new(
                    ExcKind::RuntimeError,
                    "No active exception to reraise",
                ))
            }
            StmtKind::Raise(Some(expr)) => {
                return Err(match self.eval(expr, host)? {
                    Value::ExcType(kind) => Exception::new(kind, ""),
                    Value::Exception(exc) => exc,
                    _ => Exception::type_error("exceptions must derive from BaseException"),
                })
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &mut self,
        var: &str,
        iterable: Value,
        body: &[Stmt],
        host: &mut dyn Host,
    ) -> Result<(), Exception> {
        let step_into =
            |interp: &mut Self, item: Value, host: &mut dyn Host| -> Result<Flow, Exception> {
                host.checkpoint()?;
                interp.globals.insert(var.to_string(), item);
                interp.exec_block(body, host)
            };
        match iterable {
            Value::Range { start, step, .. } => {
                let len = iterable.range_len();
                for i in 0..len {
                    let item = Value::Int(start + i * step);
                    if let Flow::Break = step_into(self, item, host)? {
                        break;
                    }
                }
            }
            Value::List(items) => {
                for item in items {
                    if let Flow::Break = step_into(self, item, host)? {
                        break;
                    }
                }
            }
            Value::Str(s) => {
                for c in s.chars() {
                    if let Flow::Break = step_into(self, Value::Str(c.to_string()), host)? {
                        break;
                    }
                }
            }
            other => {
                return Err(Exception::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, Exception> {
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        if let Some(kind) = ExcKind::from_name(name) {
            return Ok(Value::ExcType(kind));
        }
        Err(Exception::new(
            ExcKind::NameError,
            format!("name '{}' is not defined", name),
        ))
    }

    fn eval(&mut self, expr: &Expr, host: &mut dyn Host) -> Result<Value, Exception> {
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(Exception::new(
                ExcKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.depth += 1;
        let value = self.eval_expr(expr, host);
        self.depth -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr, host: &mut dyn Host) -> Result<Value, Exception> {
        Ok(match expr {
            Expr::Int(n) => Value::Int(*n),
            Expr::Float(f) => Value::Float(*f),
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::None => Value::None,
            Expr::Name(name) => self.lookup(name)?,
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, host)?);
                }
                Value::List(values)
            }
            Expr::Unary { op, operand } => unary(*op, self.eval(operand, host)?)?,
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, host)?;
                let right = self.eval(right, host)?;
                binary(*op, &left, &right)?
            }
            Expr::Compare { left, rest } => {
                let mut left = self.eval(left, host)?;
                for (op, right) in rest {
                    let right = self.eval(right, host)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Value::Bool(true)
            }
            Expr::Chain { first, rest } => {
                let mut acc = self.eval(first, host)?;
                for (op, operand) in rest {
                    let operand = self.eval(operand, host)?;
                    acc = binary(*op, &acc, &operand)?;
                }
                acc
            }
            Expr::And(operands) => {
                let mut value = Value::Bool(true);
                for operand in operands {
                    value = self.eval(operand, host)?;
                    if !value.truthy() {
                        break;
                    }
                }
                value
            }
            Expr::Or(operands) => {
                let mut value = Value::Bool(false);
                for operand in operands {
                    value = self.eval(operand, host)?;
                    if value.truthy() {
                        break;
                    }
                }
                value
            }
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs, host)?,
            Expr::Attribute { value, attr } => attribute(&self.eval(value, host)?, attr)?,
            Expr::Index { value, index } => {
                let value = self.eval(value, host)?;
                let index = self.eval(index, host)?;
                subscript(&value, &index)?
            }
        })
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        host: &mut dyn Host,
    ) -> Result<Value, Exception> {
        // `name.append(x)` mutates the binding in place; values are otherwise immutable.
        if let Expr::Attribute { value, attr } = func {
            if let (Expr::Name(name), "append") = (value.as_ref(), attr.as_str()) {
                if let Some(Value::List(_)) = self.globals.get(name) {
                    let [arg] = args else {
                        return Err(Exception::type_error(format!(
                            "list.append() takes exactly one argument ({} given)",
                            args.len()
                        )));
                    };
                    let item = self.eval(arg, host)?;
                    if let Some(Value::List(items)) = self.globals.get_mut(name) {
                        items.push(item);
                    }
                    return Ok(Value::None);
                }
            }
        }

        let callee = self.eval(func, host)?;
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            positional.push(self.eval(arg, host)?);
        }
        let mut keywords = Vec::with_capacity(kwargs.len());
        for (name, arg) in kwargs {
            keywords.push((name.as_str(), self.eval(arg, host)?));
        }

        match callee {
            Value::Builtin(builtin) => call_builtin(builtin, positional, keywords, host),
            Value::ExcType(kind) => {
                reject_keywords(kind.name(), &keywords)?;
                let message = match positional.as_slice() {
                    [] => String::new(),
                    [arg] => arg.to_string(),
                    many => Value::List(many.to_vec()).to_string(),
                };
                Ok(Value::Exception(Exception::new(kind, message)))
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }
}

fn reject_keywords(name: &str, keywords: &[(&str, Value)]) -> Result<(), Exception> {
    match keywords.first() {
        Some((key, _)) => Err(Exception::type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            name, key
        ))),
        None => Ok(()),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Exception> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {}", min)
        } else if args.len() < min {
            format!("at least {}", min)
        } else {
            format!("at most {}", max)
        };
        let noun = if min == max && min == 1 {
            "argument"
        } else {
            "arguments"
        };
        return Err(Exception::type_error(format!(
            "{}() takes {} {} ({} given)",
            name,
            expected,
            noun,
            args.len()
        )));
    }
    Ok(())
}

fn iterate(value: &Value) -> Result<Vec<Value>, Exception> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Range { start, step, .. } => {
            let len = value.range_len();
            if len as usize > MAX_SEQUENCE_LEN {
                return Err(Exception::new(ExcKind::OverflowError, "range is too large"));
            }
            Ok((0..len).map(|i| Value::Int(start + i * step)).collect())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn call_builtin(
    builtin: Builtin,
    args: Vec<Value>,
    keywords: Vec<(&str, Value)>,
    host: &mut dyn Host,
) -> Result<Value, Exception> {
    let name = builtin.name();
    if builtin != Builtin::Print && builtin != Builtin::Sum {
        reject_keywords(name, &keywords)?;
    }

    match builtin {
        Builtin::Print => {
            let mut sep = " ".to_string();
            let mut end = "\n".to_string();
            let mut stream = OutputStream::Stdout;
            for (key, value) in keywords {
                match (key, value) {
                    ("sep", Value::Str(s)) => sep = s,
                    ("end", Value::Str(s)) => end = s,
                    ("sep" | "end" | "file" | "flush", Value::None) => {}
                    ("file", Value::Stream(s)) => stream = s,
                    ("flush", _) => {}
                    ("sep" | "end", other) => {
                        return Err(Exception::type_error(format!(
                            "{} must be None or a string, not {}",
                            key,
                            other.type_name()
                        )))
                    }
                    ("file", other) => {
                        return Err(Exception::new(
                            ExcKind::AttributeError,
                            format!("'{}' object has no attribute 'write'", other.type_name()),
                        ))
                    }
                    (key, _) => {
                        return Err(Exception::type_error(format!(
                            "'{}' is an invalid keyword argument for print()",
                            key
                        )))
                    }
                }
            }
            let parts: Vec<String> = args.iter().map(Value::to_string).collect();
            let mut text = parts.join(&sep);
            text.push_str(&end);
            host.write(stream, &text);
            Ok(Value::None)
        }
        Builtin::Write(stream) => {
            arity(name, &args, 1, 1)?;
            let Value::Str(text) = &args[0] else {
                return Err(Exception::type_error(format!(
                    "write() argument must be str, not {}",
                    args[0].type_name()
                )));
            };
            host.write(stream, text);
            Ok(Value::Int(text.chars().count() as i64))
        }
        Builtin::Flush(_) => {
            arity(name, &args, 0, 0)?;
            Ok(Value::None)
        }
        Builtin::Len => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count() as i64,
                Value::List(items) => items.len() as i64,
                range @ Value::Range { .. } => range.range_len(),
                other => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(len))
        }
        Builtin::Str => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Str(args.first().map(Value::to_string).unwrap_or_default()))
        }
        Builtin::Repr => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].repr()))
        }
        Builtin::Bool => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Builtin::Int => {
            arity(name, &args, 0, 1)?;
            let Some(arg) = args.first() else {
                return Ok(Value::Int(0));
            };
            match arg {
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Float(f) => float_to_int(*f),
                Value::Str(s) => s
                    .trim()
                    .replace('_', "")
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| {
                        Exception::value_error(format!(
                            "invalid literal for int() with base 10: {}",
                            arg.repr()
                        ))
                    }),
                other => Err(Exception::type_error(format!(
                    "int() argument must be a string or a real number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Float => {
            arity(name, &args, 0, 1)?;
            let Some(arg) = args.first() else {
                return Ok(Value::Float(0.0));
            };
            if let Some(n) = arg.as_number() {
                return Ok(Value::Float(n.to_f64()));
            }
            match arg {
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    Exception::value_error(format!(
                        "could not convert string to float: {}",
                        arg.repr()
                    ))
                }),
                other => Err(Exception::type_error(format!(
                    "float() argument must be a string or a real number, not '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Abs => {
            arity(name, &args, 1, 1)?;
            match args[0].as_number() {
                Some(Number::Int(n)) => n.checked_abs().map(Value::Int).ok_or_else(overflow),
                Some(Number::Float(f)) => Ok(Value::Float(f.abs())),
                None => Err(Exception::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    args[0].type_name()
                ))),
            }
        }
        Builtin::Min | Builtin::Max => {
            if args.is_empty() {
                return Err(Exception::type_error(format!(
                    "{} expected at least 1 argument, got 0",
                    name
                )));
            }
            let candidates = if args.len() == 1 {
                iterate(&args[0])?
            } else {
                args
            };
            let mut iter = candidates.into_iter();
            let Some(mut best) = iter.next() else {
                return Err(Exception::value_error(format!(
                    "{}() arg is an empty sequence",
                    name
                )));
            };
            let op = if builtin == Builtin::Min {
                CmpOp::Lt
            } else {
                CmpOp::Gt
            };
            for candidate in iter {
                if compare(op, &candidate, &best)? {
                    best = candidate;
                }
            }
            Ok(best)
        }
        Builtin::Sum => {
            arity(name, &args, 1, 2)?;
            let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
            for (key, value) in keywords {
                if key != "start" {
                    return reject_keywords(name, &[(key, value)]).map(|_| Value::None);
                }
                total = value;
            }
            for item in iterate(&args[0])? {
                total = binary(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Range => {
            arity(name, &args, 1, 3)?;
            let ints: Vec<i64> = args
                .iter()
                .map(|a| a.as_int("range() argument"))
                .collect::<Result<_, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked"),
            };
            if step == 0 {
                return Err(Exception::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        Builtin::LoopForever => {
            arity(name, &args, 0, 0)?;
            loop {
                host.checkpoint()?;
            }
        }
        Builtin::Spin => {
            arity(name, &args, 1, 1)?;
            let deadline = Instant::now() + seconds(&args[0])?;
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            Ok(Value::None)
        }
        Builtin::Sleep => {
            arity(name, &args, 1, 1)?;
            let deadline = Instant::now() + seconds(&args[0])?;
            loop {
                host.checkpoint()?;
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep(SLEEP_SLICE.min(deadline - now));
            }
            Ok(Value::None)
        }
        Builtin::Time => {
            arity(name, &args, 0, 0)?;
            let elapsed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Ok(Value::Float(elapsed.as_secs_f64()))
        }
        Builtin::Monotonic => {
            arity(name, &args, 0, 0)?;
            Ok(Value::Float(monotonic_origin().elapsed().as_secs_f64()))
        }
    }
}

fn monotonic_origin() -> Instant {
    static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

fn seconds(value: &Value) -> Result<Duration, Exception> {
    let secs = value
        .as_number()
        .ok_or_else(|| {
            Exception::type_error(format!(
                "'{}' object cannot be interpreted as a number of seconds",
                value.type_name()
            ))
        })?
        .to_f64();
    if secs.is_nan() {
        return Err(Exception::value_error("Invalid value NaN (not a number)"));
    }
    if secs < 0.0 {
        return Err(Exception::value_error("sleep length must be non-negative"));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Exception::new(ExcKind::OverflowError, "sleep length is too large"))
}

fn overflow() -> Exception {
    Exception::new(ExcKind::OverflowError, "integer result too large")
}

fn float_to_int(f: f64) -> Result<Value, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let truncated = f.trunc();
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(overflow());
    }
    Ok(Value::Int(truncated as i64))
}

fn attribute(value: &Value, attr: &str) -> Result<Value, Exception> {
    let found = match (value, attr) {
        (Value::Module(Module::Sys), "stdout") => Some(Value::Stream(OutputStream::Stdout)),
        (Value::Module(Module::Sys), "stderr") => Some(Value::Stream(OutputStream::Stderr)),
        (Value::Module(Module::Time), "sleep") => Some(Value::Builtin(Builtin::Sleep)),
        (Value::Module(Module::Time), "time") => Some(Value::Builtin(Builtin::Time)),
        (Value::Module(Module::Time), "monotonic") => Some(Value::Builtin(Builtin::Monotonic)),
        (Value::Stream(s), "write") => Some(Value::Builtin(Builtin::Write(*s))),
        (Value::Stream(s), "flush") => Some(Value::Builtin(Builtin::Flush(*s))),
        (Value::Exception(exc), "args") if exc.message.is_empty() => Some(Value::List(vec![])),
        (Value::Exception(exc), "args") => Some(Value::List(vec![Value::Str(exc.message.clone())])),
        _ => None,
    };
    found.ok_or_else(|| {
        let message = match value {
            Value::Module(m) => format!("module '{}' has no attribute '{}'", m.name(), attr),
            other => format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                attr
            ),
        };
        Exception::new(ExcKind::AttributeError, message)
    })
}

fn subscript(value: &Value, index: &Value) -> Result<Value, Exception> {
    let (Value::Int(_) | Value::Bool(_)) = index else {
        return Err(Exception::type_error(format!(
            "{} indices must be integers, not {}",
            value.type_name(),
            index.type_name()
        )));
    };
    let i = index.as_int("index")?;
    let resolve = |len: i64| -> Option<i64> {
        let i = if i < 0 { i + len } else { i };
        (0..len).contains(&i).then_some(i)
    };
    let out_of_range = |what: &str| {
        Exception::new(
            ExcKind::IndexError,
            format!("{} index out of range", what),
        )
    };
    match value {
        Value::List(items) => resolve(items.len() as i64)
            .map(|i| items[i as usize].clone())
            .ok_or_else(|| out_of_range("list")),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            resolve(chars.len() as i64)
                .map(|i| Value::Str(chars[i as usize].to_string()))
                .ok_or_else(|| out_of_range("string"))
        }
        Value::Range { start, step, .. } => resolve(value.range_len())
            .map(|i| Value::Int(start + i * step))
            .ok_or_else(|| out_of_range("range object")),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, operand: Value) -> Result<Value, Exception> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg | UnaryOp::Pos => {
            let symbol = if op == UnaryOp::Neg { "-" } else { "+" };
            match (op, operand.as_number()) {
                (UnaryOp::Neg, Some(Number::Int(n))) => {
                    n.checked_neg().map(Value::Int).ok_or_else(overflow)
                }
                (UnaryOp::Neg, Some(Number::Float(f))) => Ok(Value::Float(-f)),
                (_, Some(Number::Int(n))) => Ok(Value::Int(n)),
                (_, Some(Number::Float(f))) => Ok(Value::Float(f)),
                (_, None) => Err(Exception::type_error(format!(
                    "bad operand type for unary {}: '{}'",
                    symbol,
                    operand.type_name()
                ))),
            }
        }
    }
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, Exception> {
    let times = times.max(0) as usize;
    if items.len().saturating_mul(times) > MAX_SEQUENCE_LEN {
        return Err(Exception::new(
            ExcKind::OverflowError,
            "repeated sequence is too long",
        ));
    }
    Ok((0..times).flat_map(|_| items.iter().cloned()).collect())
}

fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, Exception> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return arithmetic(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::Str(_), other) => Err(Exception::type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            other.type_name()
        ))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            Ok(Value::List(a.iter().chain(b).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), n @ (Value::Int(_) | Value::Bool(_)))
        | (BinOp::Mul, n @ (Value::Int(_) | Value::Bool(_)), Value::Str(s)) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(repeat(&chars, n.as_int("count")?)?.into_iter().collect()))
        }
        (BinOp::Mul, Value::List(items), n @ (Value::Int(_) | Value::Bool(_)))
        | (BinOp::Mul, n @ (Value::Int(_) | Value::Bool(_)), Value::List(items)) => {
            Ok(Value::List(repeat(items, n.as_int("count")?)?))
        }
        _ => Err(Exception::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn arithmetic(op: BinOp, a: Number, b: Number) -> Result<Value, Exception> {
    if let (Number::Int(a), Number::Int(b)) = (a, b) {
        return int_arithmetic(op, a, b);
    }
    let (a, b) = (a.to_f64(), b.to_f64());
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(Exception::zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(Exception::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(Exception::zero_division("float modulo by zero"));
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(Exception::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            let result = a.powf(b);
            if result.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(Exception::new(
                    ExcKind::OverflowError,
                    "(34, 'Numerical result out of range')",
                ));
            }
            result
        }
    };
    Ok(Value::Float(result))
}

fn int_arithmetic(op: BinOp, a: i64, b: i64) -> Result<Value, Exception> {
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(Exception::zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(Exception::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            a.checked_div(b).map(|q| {
                if (a % b != 0) && ((a < 0) != (b < 0)) {
                    q - 1
                } else {
                    q
                }
            })
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Exception::zero_division("integer modulo by zero"));
            }
            a.checked_rem(b).map(|r| {
                if r != 0 && ((r < 0) != (b < 0)) {
                    r + b
                } else {
                    r
                }
            })
        }
        BinOp::Pow => {
            if b < 0 {
                return arithmetic(op, Number::Float(a as f64), Number::Float(b as f64));
            }
            u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp))
        }
    };
    result.map(Value::Int).ok_or_else(overflow)
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Exception> {
    use std::cmp::Ordering;

    let ordering = |left: &Value, right: &Value| -> Result<Option<Ordering>, Exception> {
        order(left, right).ok_or_else(|| {
            let symbol = match op {
                CmpOp::Lt => "<",
                CmpOp::LtE => "<=",
                CmpOp::Gt => ">",
                _ => ">=",
            };
            Exception::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                symbol,
                left.type_name(),
                right.type_name()
            ))
        })
    };

    Ok(match op {
        CmpOp::Eq => left.py_eq(right),
        CmpOp::NotEq => !left.py_eq(right),
        CmpOp::Lt => ordering(left, right)? == Some(Ordering::Less),
        CmpOp::LtE => matches!(
            ordering(left, right)?,
            Some(Ordering::Less | Ordering::Equal)
        ),
        CmpOp::Gt => ordering(left, right)? == Some(Ordering::Greater),
        CmpOp::GtE => matches!(
            ordering(left, right)?,
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    })
}

/// `None` when the two values are not orderable; `Some(None)` for NaN.
fn order(left: &Value, right: &Value) -> Option<Option<std::cmp::Ordering>> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return Some(match (a, b) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.to_f64().partial_cmp(&b.to_f64()),
        });
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(Some(a.cmp(b))),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b) {
                if !x.py_eq(y) {
                    return order(x, y);
                }
            }
            Some(Some(a.len().cmp(&b.len())))
        }
        _ => None,
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.iter().any(|x| x.py_eq(item))),
        Value::Range { start, stop, step } => {
            let Some(Number::Int(n)) = item.as_number() else {
                return Ok(false);
            };
            let in_bounds = if *step > 0 {
                *start <= n && n < *stop
            } else {
                *stop < n && n <= *start
            };
            Ok(in_bounds && (n as i128 - *start as i128) % *step as i128 == 0)
        }
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Module(_), Value::Module(_))
        | (Value::Builtin(_), Value::Builtin(_))
        | (Value::Stream(_), Value::Stream(_))
        | (Value::ExcType(_), Value::ExcType(_)) => left.py_eq(right),
        _ => false,
    }
}
