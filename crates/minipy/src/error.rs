//! Exceptions raised by minipy programs.

/// Exception classes known to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    Exception,
    AttributeError,
    IndexError,
    KeyboardInterrupt,
    ModuleNotFoundError,
    NameError,
    OverflowError,
    RecursionError,
    RuntimeError,
    SyntaxError,
    TypeError,
    ValueError,
    ZeroDivisionError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::Exception => "Exception",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::IndexError => "IndexError",
            ExcKind::KeyboardInterrupt => "KeyboardInterrupt",
            ExcKind::ModuleNotFoundError => "ModuleNotFoundError",
            ExcKind::NameError => "NameError",
            ExcKind::OverflowError => "OverflowError",
            ExcKind::RecursionError => "RecursionError",
            ExcKind::RuntimeError => "RuntimeError",
            ExcKind::SyntaxError => "SyntaxError",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
        }
    }

    /// Resolve a builtin exception class by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Exception" => ExcKind::Exception,
            "AttributeError" => ExcKind::AttributeError,
            "IndexError" => ExcKind::IndexError,
            "KeyboardInterrupt" => ExcKind::KeyboardInterrupt,
            "ModuleNotFoundError" => ExcKind::ModuleNotFoundError,
            "NameError" => ExcKind::NameError,
            "OverflowError" => ExcKind::OverflowError,
            "RecursionError" => ExcKind::RecursionError,
            "RuntimeError" => ExcKind::RuntimeError,
            "SyntaxError" => ExcKind::SyntaxError,
            "TypeError" => ExcKind::TypeError,
            "ValueError" => ExcKind::ValueError,
            "ZeroDivisionError" => ExcKind::ZeroDivisionError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ExcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A raised exception, with the source line it escaped from.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", self.summary())]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
    pub line: Option<usize>,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    /// The exception raised when a host asks a running program to stop.
    pub fn interrupt() -> Self {
        Self::new(ExcKind::KeyboardInterrupt, "")
    }

    pub fn syntax(message: impl Into<String>, line: usize) -> Self {
        Self {
            kind: ExcKind::SyntaxError,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcKind::ValueError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ExcKind::ZeroDivisionError, message)
    }

    pub fn is_interrupt(&self) -> bool {
        self.kind == ExcKind::KeyboardInterrupt
    }

    /// Attach a line number unless an inner statement already did.
    pub(crate) fn at_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    /// `Kind: message`, or just `Kind` when there is no message.
    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.kind.name().to_string()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }

    /// Render the exception the way an interactive session would print it.
    pub fn format_traceback(&self) -> String {
        let line = self.line.unwrap_or(1);
        if self.kind == ExcKind::SyntaxError {
            return format!("  File \"<exec>\", line {}\n{}\n", line, self.summary());
        }
        format!(
            "Traceback (most recent call last):\n  File \"<exec>\", line {}, in <module>\n{}\n",
            line,
            self.summary()
        )
    }
}
