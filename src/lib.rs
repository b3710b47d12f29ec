//! Tinder — a minimalist embeddable scripting language for deterministic
//! interactive fiction and event-driven logic.
//!
//! The host application compiles scripts with [`Firestarter`] and runs them
//! with an [`Interpreter`] against a host-supplied [`Crucible`] variable
//! environment.  Scripts talk to the host by reading and writing Crucible
//! variables and by raising control signals ([`Outcome`]): yield, import,
//! halt, or a fatal [`Burn`].
//!
//! The language is PEG-defined (see [`grammar`]); sources compile to a flat
//! line table with labels, a constant pool, and a source map.  Execution is
//! single-threaded and cooperative: one script instance is re-entered by the
//! host only after it has raised a signal.
//!
//! # Quick start
//!
//! ```rust
//! use tinder::{Crucible, Firestarter, Interpreter, Outcome, Value};
//!
//! let script = Firestarter::new()
//!     .compile("set a to 2\nset b to a + 3\n\"answer=[[b]]\"")
//!     .unwrap();
//! let mut env = Crucible::new();
//! let mut interp = Interpreter::new(&script);
//! assert_eq!(interp.run(&mut env, None).unwrap(), Outcome::Done);
//! assert_eq!(env.get("OUTPUT"), Some(Value::Str("answer=5\n".into())));
//! ```
//!
//! # Suspension and resumption
//!
//! ```rust
//! use tinder::{Crucible, Firestarter, Interpreter, Library, Outcome, Value};
//!
//! let script = Firestarter::new()
//!     .compile("import math\nset r to math.sqrt(16)")
//!     .unwrap();
//! let mut env = Crucible::new();
//! let mut interp = Interpreter::new(&script);
//!
//! let Outcome::Imported(request) = interp.run(&mut env, None).unwrap() else {
//!     panic!("expected an import request");
//! };
//! Library::new("math")
//!     .pure_func("sqrt", |_env, args| {
//!         Ok(Value::Num(args[0].as_num().unwrap_or(0.0).sqrt()))
//!     })
//!     .install(&mut env, &request)
//!     .unwrap();
//! assert_eq!(interp.run(&mut env, None).unwrap(), Outcome::Done);
//! assert_eq!(env.get("r"), Some(Value::Num(4.0)));
//! ```

mod ast;
mod eval;

pub mod compiler;
pub mod crucible;
pub mod error;
pub mod grammar;
pub mod interp;
pub mod library;
pub mod preprocess;
pub mod signal;
pub mod value;

// Re-exports for convenience.
pub use compiler::{CompiledScript, Firestarter};
pub use crucible::{dunder, is_dunder, Crucible};
pub use error::{Burn, CompileError, ParseError};
pub use interp::{Interpreter, INPUT, OUTPUT};
pub use library::{Callable, Handle, ImportRequest, Library};
pub use preprocess::Preprocessor;
pub use signal::{Flow, Outcome, Signal};
pub use value::{Map, Value};
