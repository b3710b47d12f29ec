//! Error types for parsing, compilation, and execution.
//!
//! Three families, matching the phases of a script's life:
//!
//! - [`ParseError`] — the grammar failed to match; carries the source
//!   position of the furthest failure.
//! - [`CompileError`] — the parse succeeded but lowering failed (unresolved
//!   label, duplicate constant, malformed directive, …).
//! - [`Burn`] — a runtime fatal.  Burns carry a `kind` name; scripts can
//!   intercept a kind with `catch "Kind" at label`.

use thiserror::Error;

/// Grammar failure with the position of the furthest partial match.
#[derive(Debug, Clone, Error)]
#[error("parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    /// Render the error with the offending source line and a caret.
    pub fn render(&self, source: &str) -> String {
        let text = source.lines().nth(self.line.saturating_sub(1)).unwrap_or("");
        let caret = " ".repeat(self.column.saturating_sub(1)) + "^";
        format!("{self}\n{text}\n{caret}")
    }
}

/// Compilation failure.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("line {line}: unresolved label '{label}'")]
    UnresolvedLabel { label: String, line: u32 },

    #[error("line {line}: duplicate label '{label}'")]
    DuplicateLabel { label: String, line: u32 },

    #[error("line {line}: duplicate constant '{name}'")]
    DuplicateConstant { name: String, line: u32 },

    #[error("line {line}: constant '{name}' is not a constant expression: {message}")]
    NonConstant {
        name: String,
        message: String,
        line: u32,
    },

    #[error("line {line}: {message}")]
    Malformed { message: String, line: u32 },

    #[error("line {line}: '{delimiter}' outside of its block")]
    StrayBlock { delimiter: String, line: u32 },

    #[error("line {line}: unterminated '{block}' block")]
    Unterminated { block: String, line: u32 },
}

/// The catchable kind name carried by every ordinary runtime fatal.
pub const BURN: &str = "TinderBurn";

/// A runtime fatal.
///
/// The `kind` is the name `catch` matches against; core failures use
/// [`BURN`], host libraries may raise their own kinds.
#[derive(Debug, Clone, Error)]
#[error("{kind} at line {line}: {message}")]
pub struct Burn {
    pub kind: String,
    pub message: String,
    pub line: u32,
}

impl Burn {
    /// An ordinary fatal of kind [`BURN`].  The interpreter fills in the line.
    pub fn fatal(message: impl Into<String>) -> Self {
        Burn {
            kind: BURN.to_owned(),
            message: message.into(),
            line: 0,
        }
    }

    /// A fatal with a custom catchable kind.
    pub fn named(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Burn {
            kind: kind.into(),
            message: message.into(),
            line: 0,
        }
    }

    pub(crate) fn at(mut self, line: u32) -> Self {
        if self.line == 0 {
            self.line = line;
        }
        self
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
