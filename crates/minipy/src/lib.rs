//! minipy - a small embeddable interpreter for a Python-flavoured subset.
//!
//! The interpreter is deliberately tiny: statements (`if`/`elif`/`else`,
//! `while`, `for ... in`, assignment, `import`, `raise`, `pass`, `break`,
//! `continue`), expressions over ints, floats, strings, booleans, lists and
//! ranges, and a handful of builtins (`print`, `len`, `range`, ...).
//!
//! Embedders talk to a running program through the [`Host`] trait:
//!
//! - `write` receives everything the program prints, tagged with its stream
//! - `checkpoint` is called before every statement and on every loop
//!   iteration; returning an exception (usually [`Exception::interrupt`])
//!   aborts evaluation at that point
//!
//! Globals persist across [`Interpreter::run`] calls on the same instance,
//! which is what a notebook session expects.
//!
//! ```ignore
//! let mut interp = minipy::Interpreter::new();
//! interp.run("x = 40\nprint(x + 2)", &mut host)?;
//! ```

mod ast;
mod error;
mod interp;
mod lexer;
mod parser;
mod value;

pub use error::{ExcKind, Exception};
pub use interp::{Host, Interpreter, OutputStream};
pub use value::Value;
