//! Firestarter: lowers typed source lines into a flat, executable script.
//!
//! The compiler walks the AST once, desugaring block constructs into labels
//! and internal jumps, then resolves every label in a second pass:
//!
//! - `if` / `else if` / `else` / `endif` become guard branches to a shared
//!   end label;
//! - `for init; cond; step` becomes init, a header branch, the body, the
//!   step, and a back-edge; `for cond` is the same without init/step;
//! - `foreach` becomes a cursor initializer, a header marker that advances
//!   the cursor (or exits), the body, and a back-edge;
//! - `break` / `continue` become jumps to the innermost loop's exit or
//!   continue point;
//! - `# name or target` becomes a fallthrough marker.
//!
//! Pure expressions fold into the constant pool at compile time; `const`
//! declarations are always evaluated here and later uses become direct pool
//! references.  Internal branches never touch the return stack — only the
//! script-level `jump` instruction does.

use std::collections::HashMap;

use tracing::debug;

use crate::ast::{self, Expr, LineKind, Place, SetSource, SourceLine, Stmt, Target};
use crate::crucible::Crucible;
use crate::error::CompileError;
use crate::eval::{eval, EvalCtx};
use crate::grammar::tinder_grammar;
use crate::library::{Callable, ImportRequest};
use crate::preprocess::Preprocessor;
use crate::signal::Flow;
use crate::value::Value;

// ── Compiled form ─────────────────────────────────────────────────────────────

/// A branch destination.  Compilation emits synthetic or named destinations;
/// resolution rewrites every one to an instruction index.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dest {
    /// Compiler-internal label id, resolved in the second pass.
    Synth(usize),
    /// User label name, resolved in the second pass.
    Named(String),
    /// Resolved instruction index.
    Pc(usize),
}

impl Dest {
    pub(crate) fn pc(&self) -> usize {
        match self {
            Dest::Pc(pc) => *pc,
            // Resolution rewrites every destination; anything else is a
            // compiler defect surfaced loudly.
            other => panic!("unresolved branch destination {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    Set { targets: Vec<Target>, source: SetSource },
    Inc { target: Target, by: Option<Expr> },
    Dec { target: Target, by: Option<Expr> },
    Swap { a: Target, b: Target },
    Put { value: Expr, place: Place, target: Target },
    Write { value: Expr, target: Option<Target> },
    Input { prompt: Expr, target: Option<Target> },
    Call(Expr),
    Jump(Expr),
    Return,
    Yield(Option<Expr>),
    Stop,
    Import(ImportRequest),
    DefineConst { name: String, index: usize },
    Catch { kind: String, label: String },
    /// Evaluate the collection and arm the foreach cursor dunders.
    IterInit { coll: Expr },
    /// Loop header: advance the cursor and bind, or leave for `exit`.
    ForeachHead {
        var: String,
        second: Option<String>,
        exit: Dest,
    },
    /// Loop exit: restore the saved cursor dunders.
    ForeachExit,
    /// Or-label marker: on fallthrough arrival, continue at `target`.
    OrMark { target: Dest },
    /// Internal conditional branch: records `__CONDITION__`, jumps to
    /// `target` when the condition is falsey.  Never pushes the return stack.
    Branch { cond: Expr, target: Dest },
    /// Internal unconditional branch.  Never pushes the return stack.
    Goto(Dest),
}

/// One executable line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Instruction {
    pub op: Op,
    pub guard: Option<Expr>,
    pub else_guard: bool,
    pub line: u32,
}

/// The executable artifact: flat instructions, label index, constant pool,
/// and a source map for diagnostics.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub(crate) lines: Vec<Instruction>,
    pub(crate) labels: HashMap<String, usize>,
    pub(crate) constants: Vec<Value>,
    pub(crate) source_map: Vec<u32>,
}

impl CompiledScript {
    /// Number of executable lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The instruction index a label resolves to.
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// The source line number of an instruction.
    pub fn source_line(&self, pc: usize) -> Option<u32> {
        self.source_map.get(pc).copied()
    }
}

// ── Firestarter ───────────────────────────────────────────────────────────────

/// The compiler.  Holds the optional preprocessor and the host's compile-time
/// bindings used for constant folding.
#[derive(Debug, Default)]
pub struct Firestarter {
    preprocessor: Preprocessor,
    statics: Crucible,
}

impl Firestarter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply compile-time bindings.  Calls to callables flagged pure fold
    /// over constant arguments; nothing else is read from these bindings at
    /// run time.
    pub fn with_statics(statics: Crucible) -> Self {
        Firestarter {
            preprocessor: Preprocessor::new(),
            statics,
        }
    }

    /// The line-macro preprocessor, applied before parsing.
    pub fn preprocessor_mut(&mut self) -> &mut Preprocessor {
        &mut self.preprocessor
    }

    /// Compile source text into an executable script.
    pub fn compile(&self, source: &str) -> Result<CompiledScript, CompileError> {
        let mut source = if self.preprocessor.is_empty() {
            source.to_owned()
        } else {
            self.preprocessor.process(source)
        };
        if !source.ends_with('\n') {
            source.push('\n');
        }

        let grammar = tinder_grammar();
        let tree = grammar.parse(&source)?;
        let lines = ast::lower(&tree, grammar, &source)?;

        let mut emit = Emitter {
            statics: self.statics.clone(),
            lines: Vec::new(),
            labels: HashMap::new(),
            synth: Vec::new(),
            constants: Vec::new(),
            const_names: HashMap::new(),
            blocks: Vec::new(),
        };
        for line in &lines {
            emit.line(line)?;
        }
        if let Some(block) = emit.blocks.last() {
            return Err(CompileError::Unterminated {
                block: block.kind_name().to_owned(),
                line: block.line(),
            });
        }
        emit.resolve()?;

        debug!(
            instructions = emit.lines.len(),
            labels = emit.labels.len(),
            constants = emit.constants.len(),
            "compiled script"
        );

        let source_map = emit.lines.iter().map(|i| i.line).collect();
        Ok(CompiledScript {
            lines: emit.lines,
            labels: emit.labels,
            constants: emit.constants,
            source_map,
        })
    }
}

// ── Emission ──────────────────────────────────────────────────────────────────

enum Block {
    If {
        end: usize,
        next: Option<usize>,
        line: u32,
    },
    Loop {
        header: usize,
        continue_at: usize,
        exit: usize,
        step: Option<Stmt>,
        foreach: bool,
        line: u32,
    },
}

impl Block {
    fn kind_name(&self) -> &'static str {
        match self {
            Block::If { .. } => "if",
            Block::Loop { foreach: true, .. } => "foreach",
            Block::Loop { .. } => "for",
        }
    }

    fn line(&self) -> u32 {
        match self {
            Block::If { line, .. } | Block::Loop { line, .. } => *line,
        }
    }
}

struct Emitter {
    statics: Crucible,
    lines: Vec<Instruction>,
    labels: HashMap<String, usize>,
    synth: Vec<Option<usize>>,
    constants: Vec<Value>,
    const_names: HashMap<String, usize>,
    blocks: Vec<Block>,
}

impl Emitter {
    fn push(&mut self, op: Op, line: u32) {
        self.lines.push(Instruction {
            op,
            guard: None,
            else_guard: false,
            line,
        });
    }

    fn new_synth(&mut self) -> usize {
        self.synth.push(None);
        self.synth.len() - 1
    }

    fn place_synth(&mut self, id: usize) {
        self.synth[id] = Some(self.lines.len());
    }

    fn intern(&mut self, value: Value) -> usize {
        match self.constants.iter().position(|c| *c == value) {
            Some(index) => index,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        }
    }

    fn line(&mut self, source: &SourceLine) -> Result<(), CompileError> {
        let line = source.line;
        match &source.kind {
            LineKind::Label { name, fallthrough } => {
                if self.labels.contains_key(name) {
                    return Err(CompileError::DuplicateLabel {
                        label: name.clone(),
                        line,
                    });
                }
                self.labels.insert(name.clone(), self.lines.len());
                if let Some(target) = fallthrough {
                    self.push(
                        Op::OrMark {
                            target: Dest::Named(target.clone()),
                        },
                        line,
                    );
                }
            }

            LineKind::Import(request) => self.push(Op::Import(request.clone()), line),

            LineKind::Const { name, expr } => {
                if self.const_names.contains_key(name) {
                    return Err(CompileError::DuplicateConstant {
                        name: name.clone(),
                        line,
                    });
                }
                let folded = self.fold(expr.clone(), line)?;
                let index = match folded {
                    Expr::Const(index) => index,
                    other => {
                        // Constants are always evaluated at compile time,
                        // even when the expression reads static bindings.
                        let value = self.eval_static(&other).map_err(|message| {
                            CompileError::NonConstant {
                                name: name.clone(),
                                message,
                                line,
                            }
                        })?;
                        self.intern(value)
                    }
                };
                self.const_names.insert(name.clone(), index);
                self.push(
                    Op::DefineConst {
                        name: name.clone(),
                        index,
                    },
                    line,
                );
            }

            LineKind::Catch { kind, label } => self.push(
                Op::Catch {
                    kind: kind.clone(),
                    label: label.clone(),
                },
                line,
            ),

            LineKind::Stmt {
                stmt,
                guard,
                else_guard,
            } => {
                let op = self.stmt_op(stmt, line)?;
                let guard = match guard {
                    Some(expr) => Some(self.fold(expr.clone(), line)?),
                    None => None,
                };
                self.lines.push(Instruction {
                    op,
                    guard,
                    else_guard: *else_guard,
                    line,
                });
            }

            LineKind::If(cond) => {
                let next = self.new_synth();
                let end = self.new_synth();
                let cond = self.fold(cond.clone(), line)?;
                self.push(
                    Op::Branch {
                        cond,
                        target: Dest::Synth(next),
                    },
                    line,
                );
                self.blocks.push(Block::If {
                    end,
                    next: Some(next),
                    line,
                });
            }

            LineKind::ElseIf(cond) => {
                let Some(Block::If { end, next, .. }) = self.blocks.last_mut() else {
                    return Err(CompileError::StrayBlock {
                        delimiter: "else if".into(),
                        line,
                    });
                };
                let end = *end;
                let previous = next.take().ok_or(CompileError::StrayBlock {
                    delimiter: "else if".into(),
                    line,
                })?;
                self.push(Op::Goto(Dest::Synth(end)), line);
                self.place_synth(previous);
                let fresh = self.new_synth();
                let cond = self.fold(cond.clone(), line)?;
                self.push(
                    Op::Branch {
                        cond,
                        target: Dest::Synth(fresh),
                    },
                    line,
                );
                match self.blocks.last_mut() {
                    Some(Block::If { next, .. }) => *next = Some(fresh),
                    _ => unreachable!(),
                }
            }

            LineKind::Else => {
                let Some(Block::If { end, next, .. }) = self.blocks.last_mut() else {
                    return Err(CompileError::StrayBlock {
                        delimiter: "else".into(),
                        line,
                    });
                };
                let end = *end;
                let previous = next.take().ok_or(CompileError::StrayBlock {
                    delimiter: "else".into(),
                    line,
                })?;
                self.push(Op::Goto(Dest::Synth(end)), line);
                self.place_synth(previous);
            }

            LineKind::EndIf => match self.blocks.pop() {
                Some(Block::If { end, next, .. }) => {
                    if let Some(next) = next {
                        self.place_synth(next);
                    }
                    self.place_synth(end);
                }
                _ => {
                    return Err(CompileError::StrayBlock {
                        delimiter: "endif".into(),
                        line,
                    })
                }
            },

            LineKind::For { init, cond, step } => {
                if let Some((target, expr)) = init {
                    let op = self.stmt_op(
                        &Stmt::Set {
                            targets: vec![target.clone()],
                            source: SetSource::Values(vec![expr.clone()]),
                        },
                        line,
                    )?;
                    self.push(op, line);
                }
                let header = self.new_synth();
                let exit = self.new_synth();
                self.place_synth(header);
                let cond = self.fold(cond.clone(), line)?;
                self.push(
                    Op::Branch {
                        cond,
                        target: Dest::Synth(exit),
                    },
                    line,
                );
                let continue_at = if step.is_some() {
                    self.new_synth()
                } else {
                    header
                };
                self.blocks.push(Block::Loop {
                    header,
                    continue_at,
                    exit,
                    step: step.clone(),
                    foreach: false,
                    line,
                });
            }

            LineKind::Foreach { var, second, coll } => {
                let coll = self.fold(coll.clone(), line)?;
                self.push(Op::IterInit { coll }, line);
                let header = self.new_synth();
                let exit = self.new_synth();
                self.place_synth(header);
                self.push(
                    Op::ForeachHead {
                        var: var.clone(),
                        second: second.clone(),
                        exit: Dest::Synth(exit),
                    },
                    line,
                );
                self.blocks.push(Block::Loop {
                    header,
                    continue_at: header,
                    exit,
                    step: None,
                    foreach: true,
                    line,
                });
            }

            LineKind::EndFor => {
                let Some(Block::Loop {
                    header,
                    continue_at,
                    exit,
                    step,
                    foreach,
                    ..
                }) = self.blocks.pop()
                else {
                    return Err(CompileError::StrayBlock {
                        delimiter: "endfor".into(),
                        line,
                    });
                };
                if let Some(step) = step {
                    self.place_synth(continue_at);
                    let op = self.stmt_op(&step, line)?;
                    self.push(op, line);
                }
                self.push(Op::Goto(Dest::Synth(header)), line);
                self.place_synth(exit);
                if foreach {
                    self.push(Op::ForeachExit, line);
                }
            }

        }
        Ok(())
    }

    fn innermost_loop(&self) -> Option<(usize, usize)> {
        self.blocks.iter().rev().find_map(|block| match block {
            Block::Loop {
                continue_at, exit, ..
            } => Some((*continue_at, *exit)),
            _ => None,
        })
    }

    fn stmt_op(&mut self, stmt: &Stmt, line: u32) -> Result<Op, CompileError> {
        Ok(match stmt {
            Stmt::Set { targets, source } => Op::Set {
                targets: self.fold_targets(targets, line)?,
                source: match source {
                    SetSource::Values(values) => {
                        let folded: Result<Vec<Expr>, CompileError> = values
                            .iter()
                            .map(|v| self.fold(v.clone(), line))
                            .collect();
                        SetSource::Values(folded?)
                    }
                    SetSource::Unpack(expr) => SetSource::Unpack(self.fold(expr.clone(), line)?),
                },
            },
            Stmt::Inc { target, by } => Op::Inc {
                target: self.fold_target(target, line)?,
                by: self.fold_opt(by, line)?,
            },
            Stmt::Dec { target, by } => Op::Dec {
                target: self.fold_target(target, line)?,
                by: self.fold_opt(by, line)?,
            },
            Stmt::Swap { a, b } => Op::Swap {
                a: self.fold_target(a, line)?,
                b: self.fold_target(b, line)?,
            },
            Stmt::Put {
                value,
                place,
                target,
            } => Op::Put {
                value: self.fold(value.clone(), line)?,
                place: *place,
                target: self.fold_target(target, line)?,
            },
            Stmt::Write { value, target } => Op::Write {
                value: self.fold(value.clone(), line)?,
                target: match target {
                    Some(t) => Some(self.fold_target(t, line)?),
                    None => None,
                },
            },
            Stmt::Input { prompt, target } => Op::Input {
                prompt: self.fold(prompt.clone(), line)?,
                target: match target {
                    Some(t) => Some(self.fold_target(t, line)?),
                    None => None,
                },
            },
            Stmt::Call(expr) => Op::Call(self.fold(expr.clone(), line)?),
            Stmt::Jump(expr) => Op::Jump(self.fold(expr.clone(), line)?),
            Stmt::Return => Op::Return,
            Stmt::Yield(expr) => Op::Yield(self.fold_opt(expr, line)?),
            Stmt::Stop => Op::Stop,
            Stmt::Break => {
                let exit = self
                    .innermost_loop()
                    .map(|(_, exit)| exit)
                    .ok_or(CompileError::StrayBlock {
                        delimiter: "break".into(),
                        line,
                    })?;
                Op::Goto(Dest::Synth(exit))
            }
            Stmt::Continue => {
                let continue_at = self
                    .innermost_loop()
                    .map(|(continue_at, _)| continue_at)
                    .ok_or(CompileError::StrayBlock {
                        delimiter: "continue".into(),
                        line,
                    })?;
                Op::Goto(Dest::Synth(continue_at))
            }
        })
    }

    fn fold_opt(
        &mut self,
        expr: &Option<Expr>,
        line: u32,
    ) -> Result<Option<Expr>, CompileError> {
        match expr {
            Some(expr) => Ok(Some(self.fold(expr.clone(), line)?)),
            None => Ok(None),
        }
    }

    fn fold_target(&mut self, target: &Target, line: u32) -> Result<Target, CompileError> {
        Ok(match target {
            Target::Name(name) => Target::Name(name.clone()),
            Target::Indirect(expr) => Target::Indirect(self.fold(expr.clone(), line)?),
        })
    }

    fn fold_targets(
        &mut self,
        targets: &[Target],
        line: u32,
    ) -> Result<Vec<Target>, CompileError> {
        targets.iter().map(|t| self.fold_target(t, line)).collect()
    }

    // ── Constant folding ──────────────────────────────────────────────────────

    /// Fold a pure expression into the constant pool; otherwise fold its
    /// pure subexpressions and return the rest unchanged.
    fn fold(&mut self, expr: Expr, line: u32) -> Result<Expr, CompileError> {
        let expr = self.substitute_consts(expr);
        if self.is_pure(&expr) {
            let value = self.eval_static(&expr).map_err(|message| {
                CompileError::Malformed { message, line }
            })?;
            return Ok(Expr::Const(self.intern(value)));
        }
        Ok(match expr {
            Expr::Unary(op, inner) => Expr::Unary(op, Box::new(self.fold(*inner, line)?)),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                op,
                Box::new(self.fold(*lhs, line)?),
                Box::new(self.fold(*rhs, line)?),
            ),
            Expr::Call { callee, args } => {
                let folded: Result<Vec<Expr>, CompileError> =
                    args.into_iter().map(|a| self.fold(a, line)).collect();
                Expr::Call {
                    callee: Box::new(self.fold(*callee, line)?),
                    args: folded?,
                }
            }
            Expr::Array(items) => {
                let folded: Result<Vec<Expr>, CompileError> =
                    items.into_iter().map(|i| self.fold(i, line)).collect();
                Expr::Array(folded?)
            }
            Expr::Table(pairs) => {
                let mut folded = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    folded.push((key, self.fold(value, line)?));
                }
                Expr::Table(folded)
            }
            Expr::Indirect(inner) => Expr::Indirect(Box::new(self.fold(*inner, line)?)),
            other => other,
        })
    }

    /// Rewrite references to declared constants into pool references, so
    /// purity analysis and static evaluation see them as constants.
    fn substitute_consts(&self, expr: Expr) -> Expr {
        match expr {
            Expr::Path(segs) => {
                if let [ast::Seg::Name(name)] = segs.as_slice() {
                    if let Some(&index) = self.const_names.get(name) {
                        return Expr::Const(index);
                    }
                }
                Expr::Path(segs)
            }
            Expr::Unary(op, inner) => Expr::Unary(op, Box::new(self.substitute_consts(*inner))),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                op,
                Box::new(self.substitute_consts(*lhs)),
                Box::new(self.substitute_consts(*rhs)),
            ),
            Expr::Call { callee, args } => Expr::Call {
                // The callee is left alone: a path to a static callable must
                // stay a path for `static_callee` to resolve it.
                callee,
                args: args
                    .into_iter()
                    .map(|a| self.substitute_consts(a))
                    .collect(),
            },
            Expr::Array(items) => Expr::Array(
                items
                    .into_iter()
                    .map(|i| self.substitute_consts(i))
                    .collect(),
            ),
            Expr::Table(pairs) => Expr::Table(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, self.substitute_consts(v)))
                    .collect(),
            ),
            Expr::Indirect(inner) => {
                Expr::Indirect(Box::new(self.substitute_consts(*inner)))
            }
            other => other,
        }
    }

    /// Purity: no identifier reads, no calls except to statically-safe
    /// callables over pure arguments.
    fn is_pure(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Literal(_) | Expr::Const(_) => true,
            Expr::Interp(_) | Expr::Indirect(_) => false,
            Expr::Path(segs) => match segs.as_slice() {
                [ast::Seg::Name(name)] => self.const_names.contains_key(name),
                _ => false,
            },
            Expr::Unary(_, inner) => self.is_pure(inner),
            Expr::Binary(_, lhs, rhs) => self.is_pure(lhs) && self.is_pure(rhs),
            Expr::Call { callee, args } => {
                args.iter().all(|a| self.is_pure(a)) && self.static_callee(callee).is_some()
            }
            Expr::Array(items) => items.iter().all(|i| self.is_pure(i)),
            Expr::Table(pairs) => pairs.iter().all(|(_, v)| self.is_pure(v)),
        }
    }

    /// Resolve a callee path through the static bindings to a pure callable.
    fn static_callee(&self, callee: &Expr) -> Option<Callable> {
        let Expr::Path(segs) = callee else {
            return None;
        };
        let name: Vec<&str> = segs
            .iter()
            .map(|seg| match seg {
                ast::Seg::Name(name) => Some(name.as_str()),
                ast::Seg::Index(_) => None,
            })
            .collect::<Option<Vec<&str>>>()?;
        let value = self.statics.get(&name.join("."))?;
        match value {
            Value::Callable(callable) if callable.is_pure() => Some(callable),
            _ => None,
        }
    }

    /// Evaluate an expression at compile time against the static bindings.
    fn eval_static(&mut self, expr: &Expr) -> Result<Value, String> {
        let mut env = self.statics.clone();
        let mut ctx = EvalCtx {
            env: &mut env,
            consts: &self.constants,
        };
        match eval(expr, &mut ctx) {
            Ok(value) => Ok(value),
            Err(Flow::Burn(burn)) => Err(burn.message),
            Err(Flow::Signal(_)) => Err("expression raised a signal at compile time".into()),
        }
    }

    // ── Resolution ────────────────────────────────────────────────────────────

    /// Second pass: rewrite every destination to an instruction index and
    /// validate static jump/catch targets.
    fn resolve(&mut self) -> Result<(), CompileError> {
        let synth = std::mem::take(&mut self.synth);
        let labels = self.labels.clone();
        let resolve_dest = |dest: &mut Dest, line: u32| -> Result<(), CompileError> {
            let pc = match dest {
                Dest::Pc(pc) => *pc,
                Dest::Synth(id) => synth[*id].ok_or(CompileError::Malformed {
                    message: "internal label was never placed".into(),
                    line,
                })?,
                Dest::Named(name) => {
                    labels
                        .get(name.as_str())
                        .copied()
                        .ok_or(CompileError::UnresolvedLabel {
                            label: name.clone(),
                            line,
                        })?
                }
            };
            *dest = Dest::Pc(pc);
            Ok(())
        };

        let mut static_jumps: Vec<(usize, usize)> = Vec::new();
        for (pc, instruction) in self.lines.iter_mut().enumerate() {
            let line = instruction.line;
            match &mut instruction.op {
                Op::Branch { target, .. }
                | Op::Goto(target)
                | Op::OrMark { target }
                | Op::ForeachHead { exit: target, .. } => resolve_dest(target, line)?,
                Op::Catch { label, .. } => {
                    if !labels.contains_key(label.as_str()) {
                        return Err(CompileError::UnresolvedLabel {
                            label: label.clone(),
                            line,
                        });
                    }
                }
                Op::Jump(expr) => {
                    // A jump whose target folded to a string is static:
                    // resolve it now and rewrite to the line index.
                    if let Expr::Const(index) = expr {
                        if let Some(Value::Str(name)) = self.constants.get(*index) {
                            let target = labels.get(name.as_str()).copied().ok_or_else(|| {
                                CompileError::UnresolvedLabel {
                                    label: name.clone(),
                                    line,
                                }
                            })?;
                            static_jumps.push((pc, target));
                        }
                    }
                }
                _ => {}
            }
        }
        for (pc, target) in static_jumps {
            let index = self.intern(Value::Num(target as f64));
            self.lines[pc].op = Op::Jump(Expr::Const(index));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> CompiledScript {
        Firestarter::new().compile(src).unwrap()
    }

    #[test]
    fn linear_lines_in_order() {
        let script = compile("set a to 2\nset b to 3\n");
        assert_eq!(script.len(), 2);
        assert_eq!(script.source_line(0), Some(1));
        assert_eq!(script.source_line(1), Some(2));
    }

    #[test]
    fn plain_label_emits_no_instruction() {
        let script = compile("set a to 1\n# here\nset b to 2\n");
        assert_eq!(script.len(), 2);
        assert_eq!(script.label("here"), Some(1));
    }

    #[test]
    fn or_label_emits_marker() {
        let script = compile("# end or retry\nstop\n# retry\nset a to 1\n");
        assert_eq!(script.label("end"), Some(0));
        assert_eq!(script.label("retry"), Some(2));
        let Op::OrMark { target } = &script.lines[0].op else {
            panic!("expected a marker: {:?}", script.lines[0].op);
        };
        assert_eq!(target.pc(), 2);
    }

    #[test]
    fn literals_fold_into_the_pool() {
        let script = compile("set a to 2 + 3\n");
        let Op::Set {
            source: SetSource::Values(values),
            ..
        } = &script.lines[0].op
        else {
            panic!();
        };
        let Expr::Const(index) = values[0] else {
            panic!("folding failed: {:?}", values[0]);
        };
        assert_eq!(script.constants[index], Value::Num(5.0));
    }

    #[test]
    fn identifiers_do_not_fold() {
        let script = compile("set b to a + 3\n");
        let Op::Set {
            source: SetSource::Values(values),
            ..
        } = &script.lines[0].op
        else {
            panic!();
        };
        assert!(matches!(values[0], Expr::Binary(..)));
    }

    #[test]
    fn const_declares_and_later_uses_reference_the_pool() {
        let script = compile("const MAX = 2 + 3\nset a to MAX\n");
        let Op::DefineConst { index, .. } = script.lines[0].op else {
            panic!();
        };
        assert_eq!(script.constants[index], Value::Num(5.0));
        let Op::Set {
            source: SetSource::Values(values),
            ..
        } = &script.lines[1].op
        else {
            panic!();
        };
        assert_eq!(values[0], Expr::Const(index));
    }

    #[test]
    fn duplicate_const_is_a_compile_error() {
        let err = Firestarter::new()
            .compile("const A = 1\nconst A = 2\n")
            .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateConstant { .. }));
    }

    #[test]
    fn duplicate_label_is_a_compile_error() {
        let err = Firestarter::new().compile("# a\n# a\n").unwrap_err();
        assert!(matches!(err, CompileError::DuplicateLabel { .. }));
    }

    #[test]
    fn static_jump_targets_must_resolve() {
        let err = Firestarter::new().compile("jump \"nowhere\"\n").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedLabel { .. }));
        // A resolvable string target compiles and is rewritten to an index.
        let script = compile("jump \"done\"\n# done\n");
        let Op::Jump(Expr::Const(index)) = &script.lines[0].op else {
            panic!();
        };
        assert_eq!(script.constants[*index], Value::Num(1.0));
    }

    #[test]
    fn runtime_jump_targets_are_deferred() {
        // An identifier target may be a variable holding a label; deferred.
        let script = compile("jump where\n");
        assert!(matches!(&script.lines[0].op, Op::Jump(Expr::Path(_))));
    }

    #[test]
    fn catch_requires_a_known_label() {
        let err = Firestarter::new()
            .compile("catch \"TinderBurn\" at missing\n")
            .unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedLabel { .. }));
    }

    #[test]
    fn if_desugars_to_branches() {
        let script = compile("if a\nset x to 1\nendif\nset y to 2\n");
        let Op::Branch { target, .. } = &script.lines[0].op else {
            panic!("expected a branch: {:?}", script.lines[0].op);
        };
        // Branch skips over the body to the end of the block.
        assert_eq!(target.pc(), 2);
    }

    #[test]
    fn if_else_desugars() {
        let script = compile("if a\nset x to 1\nelse\nset x to 2\nendif\n");
        // branch(!a → 3), set, goto(end=4), set
        assert_eq!(script.len(), 4);
        let Op::Branch { target, .. } = &script.lines[0].op else {
            panic!();
        };
        assert_eq!(target.pc(), 3);
        let Op::Goto(end) = &script.lines[2].op else {
            panic!();
        };
        assert_eq!(end.pc(), 4);
    }

    #[test]
    fn stray_delimiters_are_errors() {
        assert!(matches!(
            Firestarter::new().compile("endif\n").unwrap_err(),
            CompileError::StrayBlock { .. }
        ));
        assert!(matches!(
            Firestarter::new().compile("break\n").unwrap_err(),
            CompileError::StrayBlock { .. }
        ));
        assert!(matches!(
            Firestarter::new().compile("if a\nset x to 1\n").unwrap_err(),
            CompileError::Unterminated { .. }
        ));
    }

    #[test]
    fn counted_for_desugars() {
        let script = compile("for i = 0; i < 3; inc i\nset x to i\nendfor\n");
        // set i, branch, body, inc i, goto header
        assert_eq!(script.len(), 5);
        assert!(matches!(script.lines[0].op, Op::Set { .. }));
        let Op::Branch { target, .. } = &script.lines[1].op else {
            panic!();
        };
        assert_eq!(target.pc(), 5);
        assert!(matches!(script.lines[3].op, Op::Inc { .. }));
        let Op::Goto(header) = &script.lines[4].op else {
            panic!();
        };
        assert_eq!(header.pc(), 1);
    }

    #[test]
    fn foreach_desugars_with_cursor_markers() {
        let script = compile("foreach item in bag\nwrite item\nendfor\n");
        assert!(matches!(script.lines[0].op, Op::IterInit { .. }));
        let Op::ForeachHead { exit, .. } = &script.lines[1].op else {
            panic!();
        };
        // Exit points at the cursor-restoring marker.
        assert_eq!(exit.pc(), 4);
        assert!(matches!(script.lines[4].op, Op::ForeachExit));
        let Op::Goto(header) = &script.lines[3].op else {
            panic!();
        };
        assert_eq!(header.pc(), 1);
    }

    #[test]
    fn pure_static_calls_fold() {
        let mut statics = Crucible::new();
        statics
            .set(
                "double",
                Value::Callable(Callable::pure_fn("double", |_, args| {
                    Ok(Value::Num(args[0].as_num().unwrap_or(0.0) * 2.0))
                })),
            )
            .unwrap();
        let script = Firestarter::with_statics(statics)
            .compile("set x to double(21)\n")
            .unwrap();
        let Op::Set {
            source: SetSource::Values(values),
            ..
        } = &script.lines[0].op
        else {
            panic!();
        };
        let Expr::Const(index) = values[0] else {
            panic!("pure call did not fold: {:?}", values[0]);
        };
        assert_eq!(script.constants[index], Value::Num(42.0));
    }

    #[test]
    fn impure_calls_never_fold() {
        let mut statics = Crucible::new();
        statics
            .set(
                "now",
                Value::Callable(Callable::new("now", |_, _| Ok(Value::Num(0.0)))),
            )
            .unwrap();
        let script = Firestarter::with_statics(statics)
            .compile("set x to now()\n")
            .unwrap();
        let Op::Set {
            source: SetSource::Values(values),
            ..
        } = &script.lines[0].op
        else {
            panic!();
        };
        assert!(matches!(values[0], Expr::Call { .. }));
    }

    #[test]
    fn guard_is_kept_on_the_instruction() {
        let script = compile("stop if done\n");
        assert!(script.lines[0].guard.is_some());
        assert!(matches!(script.lines[0].op, Op::Stop));
    }

    #[test]
    fn preprocessor_runs_before_parsing() {
        let mut firestarter = Firestarter::new();
        firestarter
            .preprocessor_mut()
            .pattern("shout $text", "write $text");
        let script = firestarter.compile("shout \"hi\"\n").unwrap();
        assert!(matches!(script.lines[0].op, Op::Write { .. }));
    }
}
