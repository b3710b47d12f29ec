//! The control signals a running script exchanges with its host.
//!
//! The interpreter never unwinds across the host boundary; each call to
//! [`Interpreter::run`](crate::interp::Interpreter::run) returns an
//! [`Outcome`] the host matches on.  Internally, instruction execution and
//! host callables use [`Flow`] to carry either a fatal or a signal up to the
//! step loop without threading two error channels everywhere.

use crate::error::Burn;
use crate::library::ImportRequest;
use crate::value::Value;

/// What a completed `run` call observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The program counter ran off the end of the line table.
    Done,
    /// The script executed `stop` (or a library raised a halt).
    Halted,
    /// The script suspended (`yield`, `input`, or a yielding library call).
    /// The host may update the Crucible, then re-enter; execution resumes at
    /// the next line.
    Yielded(Option<Value>),
    /// The script requested a library.  The host injects bindings and
    /// re-enters; execution resumes at the next line.
    Imported(ImportRequest),
}

/// A non-local exit raised while executing a single instruction.
#[derive(Debug, Clone)]
pub enum Signal {
    Yielded(Option<Value>),
    Imported(ImportRequest),
    Halted,
}

/// Either a runtime fatal or a signal; the error side of instruction and
/// callable execution.
#[derive(Debug, Clone)]
pub enum Flow {
    Burn(Burn),
    Signal(Signal),
}

impl From<Burn> for Flow {
    fn from(burn: Burn) -> Self {
        Flow::Burn(burn)
    }
}

impl From<Signal> for Flow {
    fn from(signal: Signal) -> Self {
        Flow::Signal(signal)
    }
}
