//! Opaque host values and the library-import contract.
//!
//! The core treats host libraries as bags of [`Callable`]s: it resolves them
//! through the Crucible, calls them with the environment as an implicit first
//! argument, and otherwise never looks inside.  Permission checks, catalogs
//! and discovery are the host's business; the only thing the core raises is
//! an [`ImportRequest`] for the host to answer.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::crucible::Crucible;
use crate::error::Burn;
use crate::signal::Flow;
use crate::value::{Map, Value};

/// Signature of a host-provided function.
///
/// The environment is passed as an implicit first argument; the return value
/// replaces the call site.  A callable may raise a signal (yield, halt,
/// import) through the `Flow` error channel, which suspends the script after
/// the current line.
pub type HostFn = dyn Fn(&mut Crucible, &[Value]) -> Result<Value, Flow> + Send + Sync;

/// A host function wrapped as a script value.
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    pure: bool,
    func: Arc<HostFn>,
}

impl Callable {
    pub fn new(name: impl Into<String>, func: impl Fn(&mut Crucible, &[Value]) -> Result<Value, Flow> + Send + Sync + 'static) -> Self {
        Callable {
            name: name.into().into(),
            pure: false,
            func: Arc::new(func),
        }
    }

    /// A callable the host declares statically safe: no side effects,
    /// deterministic for the same inputs.  The compiler may fold calls to it
    /// over constant arguments.
    pub fn pure_fn(name: impl Into<String>, func: impl Fn(&mut Crucible, &[Value]) -> Result<Value, Flow> + Send + Sync + 'static) -> Self {
        Callable {
            name: name.into().into(),
            pure: true,
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    pub fn invoke(&self, env: &mut Crucible, args: &[Value]) -> Result<Value, Flow> {
        (self.func)(env, args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("pure", &self.pure)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

/// An opaque host value carried through the Crucible untouched.
#[derive(Clone)]
pub struct Handle {
    tag: Arc<str>,
    object: Arc<dyn Any + Send + Sync>,
}

impl Handle {
    pub fn new(tag: impl Into<String>, object: impl Any + Send + Sync) -> Self {
        Handle {
            tag: tag.into().into(),
            object: Arc::new(object),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("tag", &self.tag).finish_non_exhaustive()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

// ── Import requests ───────────────────────────────────────────────────────────

/// Payload of an `Imported` signal: what the script asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRequest {
    /// Library name after `import` / `from`.
    pub library: String,
    /// `import lib as name` binds the library under `name`.
    pub alias: Option<String>,
    /// `from lib import a, b` injects only these symbols, unqualified.
    pub symbols: Option<Vec<String>>,
}

// ── Library builder ───────────────────────────────────────────────────────────

/// A named set of callables a host exposes to scripts.
///
/// Hosts answer an [`Outcome::Imported`](crate::signal::Outcome) by building
/// (or caching) a `Library` and calling [`Library::install`] with the request.
#[derive(Debug, Clone, Default)]
pub struct Library {
    name: String,
    entries: Vec<(String, Value)>,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Library {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a host function under `name`.
    pub fn func(mut self, name: impl Into<String> + Clone, func: impl Fn(&mut Crucible, &[Value]) -> Result<Value, Flow> + Send + Sync + 'static) -> Self {
        let callable = Callable::new(name.clone(), func);
        self.entries.push((name.into(), Value::Callable(callable)));
        self
    }

    /// Add a statically-safe host function under `name`.
    pub fn pure_func(mut self, name: impl Into<String> + Clone, func: impl Fn(&mut Crucible, &[Value]) -> Result<Value, Flow> + Send + Sync + 'static) -> Self {
        let callable = Callable::pure_fn(name.clone(), func);
        self.entries.push((name.into(), Value::Callable(callable)));
        self
    }

    /// Add a plain value (a constant table, a handle, …).
    pub fn value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.entries.push((name.into(), value));
        self
    }

    /// Inject this library into `env` as `request` asked: the whole library
    /// as a mapping under its (possibly aliased) name, or individual symbols
    /// for a `from … import` request.
    pub fn install(&self, env: &mut Crucible, request: &ImportRequest) -> Result<(), Burn> {
        match &request.symbols {
            Some(symbols) => {
                for symbol in symbols {
                    let value = self
                        .entries
                        .iter()
                        .find(|(name, _)| name == symbol)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| {
                            Burn::fatal(format!(
                                "library '{}' has no symbol '{symbol}'",
                                self.name
                            ))
                        })?;
                    env.set(symbol, value)?;
                }
            }
            None => {
                let map: Map = self
                    .entries
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                let bind_as = request.alias.as_deref().unwrap_or(&request.library);
                env.set(bind_as, Value::Map(map))?;
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
