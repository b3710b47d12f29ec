//! The instruction interpreter.
//!
//! Executes a [`CompiledScript`] against a host-owned [`Crucible`].  Each
//! call to [`Interpreter::run`] steps until the script finishes, halts,
//! yields, imports, or burns; the host matches on the returned [`Outcome`]
//! and re-enters to resume.  The interpreter never unwinds across the host
//! boundary and never destroys the Crucible.
//!
//! Observable state lives in the dunder variables: `__LINE__` tracks the
//! current source line (writing it jumps to an instruction index),
//! `__CONDITION__` records the last guard result (the flat `else` form
//! inspects it), `__JUMPED__`/`__STACK__` mirror the return stack, and
//! `__ITER__`/`__INDEX__`/`__LENGTH__` carry the innermost foreach cursor.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::ast::{Expr, Place, SetSource, Target};
use crate::compiler::{CompiledScript, Instruction, Op};
use crate::crucible::{dunder, Crucible};
use crate::error::Burn;
use crate::eval::{eval, indirect_name, EvalCtx};
use crate::signal::{Flow, Outcome, Signal};
use crate::value::{Map, Value};

/// Outcome of executing one instruction.
enum Exec {
    /// Advance to the next line.
    Next,
    /// The instruction set the program counter itself.
    Jumped,
    /// Suspend and surface a signal to the host.
    Signal(Signal),
}

/// Saved cursor dunders of an enclosing foreach, restored at its exit.
type CursorSave = [Option<Value>; 3];

/// A script execution in progress.
///
/// Borrows the compiled script; the host keeps it and may run many
/// interpreters over the same script concurrently (each with its own
/// Crucible).
pub struct Interpreter<'s> {
    script: &'s CompiledScript,
    pc: usize,
    return_stack: Vec<usize>,
    interrupts: HashMap<String, String>,
    cursor_saves: Vec<CursorSave>,
    arrived_by_jump: bool,
    budget: Option<usize>,
    started: bool,
}

impl<'s> Interpreter<'s> {
    pub fn new(script: &'s CompiledScript) -> Self {
        Interpreter {
            script,
            pc: 0,
            return_stack: Vec::new(),
            interrupts: HashMap::new(),
            cursor_saves: Vec::new(),
            arrived_by_jump: false,
            budget: None,
            started: false,
        }
    }

    /// Bound the number of instructions a single `run` call may execute.
    /// Exceeding the budget raises a fatal the script can `catch`.
    pub fn with_budget(mut self, steps: usize) -> Self {
        self.budget = Some(steps);
        self
    }

    /// The current program counter (an index into the line table).
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Execute until the script finishes or raises a signal.
    ///
    /// `carry` is applied to the Crucible before the first step, so a host
    /// answering a `Yielded` can deliver values with the re-entry.  Passing
    /// anything but a mapping (or `None`) is an error.
    pub fn run(&mut self, env: &mut Crucible, carry: Option<Value>) -> Result<Outcome, Burn> {
        if !self.started {
            self.started = true;
            env.set_raw(dunder::LINE, Value::Num(0.0));
            env.set_raw(dunder::STACK, Value::List(Vec::new()));
        }
        match carry {
            None => {}
            Some(Value::Map(map)) => {
                for (key, value) in map.iter() {
                    env.set(key, value.clone())?;
                }
            }
            Some(other) => {
                return Err(Burn::fatal(format!(
                    "resume carry must be a mapping, got {}",
                    other.type_name()
                )))
            }
        }

        let script = self.script;
        let mut steps = 0usize;
        loop {
            if self.pc >= script.lines.len() {
                debug!(steps, "script finished");
                return Ok(Outcome::Done);
            }
            let instruction: &Instruction = &script.lines[self.pc];
            let line = instruction.line;
            if let Some(budget) = self.budget {
                if steps >= budget {
                    return Err(Burn::fatal("instruction budget exhausted").at(line));
                }
            }
            steps += 1;
            env.set_raw(dunder::LINE, Value::Num(line as f64));

            // Flat `else`: runs only when the last recorded condition was
            // falsey.  Lexical adjacency is not required.
            if instruction.else_guard {
                let last = env
                    .get(dunder::CONDITION)
                    .map(|v| v.truthy())
                    .unwrap_or(false);
                if last {
                    self.pc += 1;
                    self.arrived_by_jump = false;
                    continue;
                }
            }

            if let Some(guard) = &instruction.guard {
                let passed = match self.eval_in(guard, env) {
                    Ok(value) => value.truthy(),
                    Err(flow) => match self.divert(flow, line, env)? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    },
                };
                env.set_raw(dunder::CONDITION, Value::Bool(passed));
                if !passed {
                    self.pc += 1;
                    self.arrived_by_jump = false;
                    continue;
                }
            }

            match self.exec(&instruction.op, env) {
                Ok(Exec::Next) => {
                    self.pc += 1;
                    self.arrived_by_jump = false;
                }
                Ok(Exec::Jumped) => {}
                Ok(Exec::Signal(signal)) => {
                    self.pc += 1;
                    self.arrived_by_jump = false;
                    trace!(pc = self.pc, "signal raised");
                    return Ok(match signal {
                        Signal::Yielded(carry) => Outcome::Yielded(carry),
                        Signal::Imported(request) => Outcome::Imported(request),
                        Signal::Halted => Outcome::Halted,
                    });
                }
                Err(flow) => {
                    if let Some(outcome) = self.divert(flow, line, env)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Route a raised flow: signals suspend, burns consult the interrupt
    /// table.  Returns `Ok(None)` when a handler took the burn and execution
    /// continues at its label.
    fn divert(
        &mut self,
        flow: Flow,
        line: u32,
        env: &mut Crucible,
    ) -> Result<Option<Outcome>, Burn> {
        match flow {
            Flow::Signal(signal) => {
                self.pc += 1;
                self.arrived_by_jump = false;
                Ok(Some(match signal {
                    Signal::Yielded(carry) => Outcome::Yielded(carry),
                    Signal::Imported(request) => Outcome::Imported(request),
                    Signal::Halted => Outcome::Halted,
                }))
            }
            Flow::Burn(burn) => {
                let burn = burn.at(line);
                let Some(label) = self.interrupts.get(&burn.kind) else {
                    return Err(burn);
                };
                let Some(target) = self.script.labels.get(label).copied() else {
                    return Err(burn);
                };
                debug!(kind = %burn.kind, label = %label, "burn diverted to handler");
                let mut detail = Map::new();
                detail.insert("kind", Value::Str(burn.kind.clone()));
                detail.insert("message", Value::Str(burn.message.clone()));
                detail.insert("line", Value::Num(burn.line as f64));
                env.set_raw(dunder::ERROR, Value::Map(detail));
                self.pc = target;
                self.arrived_by_jump = true;
                Ok(None)
            }
        }
    }

    fn eval_in(&self, expr: &Expr, env: &mut Crucible) -> Result<Value, Flow> {
        let mut ctx = EvalCtx {
            env,
            consts: &self.script.constants,
        };
        eval(expr, &mut ctx)
    }

    /// The variable name an assignment target resolves to.
    fn target_name(&self, target: &Target, env: &mut Crucible) -> Result<String, Flow> {
        match target {
            Target::Name(name) => Ok(name.clone()),
            Target::Indirect(expr) => {
                let value = self.eval_in(expr, env)?;
                Ok(indirect_name(&value)?)
            }
        }
    }

    fn exec(&mut self, op: &Op, env: &mut Crucible) -> Result<Exec, Flow> {
        match op {
            Op::Set { targets, source } => {
                let values = match source {
                    SetSource::Values(exprs) => {
                        let mut values = Vec::with_capacity(exprs.len());
                        for expr in exprs {
                            values.push(self.eval_in(expr, env)?);
                        }
                        values
                    }
                    SetSource::Unpack(expr) => match self.eval_in(expr, env)? {
                        Value::List(items) => items,
                        Value::Map(map) => map.iter().map(|(_, v)| v.clone()).collect(),
                        other => {
                            return Err(Burn::fatal(format!(
                                "cannot unpack a {}",
                                other.type_name()
                            ))
                            .into())
                        }
                    },
                };
                let mut jumped = false;
                for (i, target) in targets.iter().enumerate() {
                    let value = match source {
                        // Zip; the last value replicates over extra names.
                        SetSource::Values(_) => values
                            .get(i)
                            .or_else(|| values.last())
                            .cloned()
                            .unwrap_or(Value::None),
                        // Unpack; missing slots become none.
                        SetSource::Unpack(_) => values.get(i).cloned().unwrap_or(Value::None),
                    };
                    let name = self.target_name(target, env)?;
                    if name == dunder::LINE {
                        jumped = self.jump_to_index(&value)?;
                    } else {
                        env.set(&name, value)?;
                    }
                }
                Ok(if jumped { Exec::Jumped } else { Exec::Next })
            }

            Op::Inc { target, by } | Op::Dec { target, by } => {
                let name = self.target_name(target, env)?;
                let current = env
                    .get(&name)
                    .ok_or_else(|| Burn::fatal(format!("variable '{name}' not found")))?;
                let Some(current) = current.as_num() else {
                    return Err(Burn::fatal(format!(
                        "cannot step a {}",
                        env.get(&name).map(|v| v.type_name()).unwrap_or("none")
                    ))
                    .into());
                };
                let amount = match by {
                    Some(expr) => self
                        .eval_in(expr, env)?
                        .as_num()
                        .ok_or_else(|| Burn::fatal("step amount must be a number"))?,
                    None => 1.0,
                };
                let next = if matches!(op, Op::Inc { .. }) {
                    current + amount
                } else {
                    current - amount
                };
                env.set(&name, Value::Num(next))?;
                Ok(Exec::Next)
            }

            Op::Swap { a, b } => {
                let name_a = self.target_name(a, env)?;
                let name_b = self.target_name(b, env)?;
                let value_a = env
                    .get(&name_a)
                    .ok_or_else(|| Burn::fatal(format!("variable '{name_a}' not found")))?;
                let value_b = env
                    .get(&name_b)
                    .ok_or_else(|| Burn::fatal(format!("variable '{name_b}' not found")))?;
                env.set(&name_a, value_b)?;
                if let Err(burn) = env.set(&name_b, value_a.clone()) {
                    // Undo the first half so the exchange stays atomic.
                    env.set_raw(&name_a, value_a);
                    return Err(burn.into());
                }
                Ok(Exec::Next)
            }

            Op::Put {
                value,
                place,
                target,
            } => {
                let name = self.target_name(target, env)?;
                let item = self.eval_in(value, env)?;
                let current = env
                    .get(&name)
                    .ok_or_else(|| Burn::fatal(format!("variable '{name}' not found")))?;
                let Value::List(mut items) = current else {
                    return Err(Burn::fatal(format!(
                        "cannot put into a {}",
                        current_type(env, &name)
                    ))
                    .into());
                };
                match place {
                    Place::Before => items.insert(0, item),
                    Place::After => items.push(item),
                }
                env.set(&name, Value::List(items))?;
                Ok(Exec::Next)
            }

            Op::Write { value, target } => {
                let text = self.eval_in(value, env)?.coerce_str();
                let name = match target {
                    Some(target) => self.target_name(target, env)?,
                    None => OUTPUT.to_owned(),
                };
                self.append_line(env, &name, &text)?;
                Ok(Exec::Next)
            }

            Op::Input { prompt, target } => {
                let text = self.eval_in(prompt, env)?.coerce_str();
                self.append_line(env, OUTPUT, &text)?;
                let name = match target {
                    Some(target) => self.target_name(target, env)?,
                    None => INPUT.to_owned(),
                };
                let mut carry = Map::new();
                carry.insert("prompt", Value::Str(text));
                carry.insert("target", Value::Str(name));
                Ok(Exec::Signal(Signal::Yielded(Some(Value::Map(carry)))))
            }

            Op::Call(expr) => {
                let result = self.eval_in(expr, env)?;
                // `call f` without arguments invokes the resolved callable.
                if let Value::Callable(callable) = result {
                    callable.invoke(env, &[])?;
                }
                Ok(Exec::Next)
            }

            Op::Jump(expr) => {
                let target = self.jump_target(expr, env)?;
                let resume = self.pc + 1;
                self.return_stack.push(resume);
                env.set_raw(dunder::JUMPED, Value::Num(resume as f64));
                self.sync_stack(env);
                self.pc = target;
                self.arrived_by_jump = true;
                Ok(Exec::Jumped)
            }

            Op::Return => {
                let target = self
                    .return_stack
                    .pop()
                    .ok_or_else(|| Burn::fatal("return with an empty stack"))?;
                self.sync_stack(env);
                self.pc = target;
                self.arrived_by_jump = true;
                Ok(Exec::Jumped)
            }

            Op::Yield(expr) => {
                let carry = match expr {
                    Some(expr) => Some(self.eval_in(expr, env)?),
                    None => None,
                };
                Ok(Exec::Signal(Signal::Yielded(carry)))
            }

            Op::Stop => Ok(Exec::Signal(Signal::Halted)),

            Op::Import(request) => Ok(Exec::Signal(Signal::Imported(request.clone()))),

            Op::DefineConst { name, index } => {
                let value = self
                    .script
                    .constants
                    .get(*index)
                    .cloned()
                    .unwrap_or(Value::None);
                env.define_const(name, value)?;
                Ok(Exec::Next)
            }

            Op::Catch { kind, label } => {
                self.interrupts.insert(kind.clone(), label.clone());
                Ok(Exec::Next)
            }

            Op::IterInit { coll } => {
                let value = self.eval_in(coll, env)?;
                let Some(length) = value.len() else {
                    return Err(Burn::fatal(format!(
                        "cannot iterate a {}",
                        value.type_name()
                    ))
                    .into());
                };
                self.cursor_saves.push([
                    env.get(dunder::ITER),
                    env.get(dunder::INDEX),
                    env.get(dunder::LENGTH),
                ]);
                env.set_raw(dunder::ITER, value);
                env.set_raw(dunder::INDEX, Value::Num(0.0));
                env.set_raw(dunder::LENGTH, Value::Num(length as f64));
                Ok(Exec::Next)
            }

            Op::ForeachHead { var, second, exit } => {
                let index = env
                    .get(dunder::INDEX)
                    .and_then(|v| v.as_num())
                    .unwrap_or(0.0) as usize;
                let length = env
                    .get(dunder::LENGTH)
                    .and_then(|v| v.as_num())
                    .unwrap_or(0.0) as usize;
                if index >= length {
                    self.pc = exit.pc();
                    self.arrived_by_jump = false;
                    return Ok(Exec::Jumped);
                }
                let container = env.get(dunder::ITER).unwrap_or(Value::None);
                let (first, rest) = match &container {
                    Value::List(items) => {
                        let item = items.get(index).cloned().unwrap_or(Value::None);
                        match second {
                            Some(_) => (Value::Num(index as f64), Some(item)),
                            None => (item, None),
                        }
                    }
                    Value::Map(map) => match map.entry_at(index) {
                        Some((key, value)) => match second {
                            Some(_) => (Value::Str(key.clone()), Some(value.clone())),
                            None => (Value::Str(key.clone()), None),
                        },
                        None => (Value::None, second.as_ref().map(|_| Value::None)),
                    },
                    Value::Str(text) => {
                        let ch = text
                            .chars()
                            .nth(index)
                            .map(|c| Value::Str(c.to_string()))
                            .unwrap_or(Value::None);
                        match second {
                            Some(_) => (Value::Num(index as f64), Some(ch)),
                            None => (ch, None),
                        }
                    }
                    other => {
                        return Err(Burn::fatal(format!(
                            "cannot iterate a {}",
                            other.type_name()
                        ))
                        .into())
                    }
                };
                env.set(var, first)?;
                if let (Some(second), Some(value)) = (second, rest) {
                    env.set(second, value)?;
                }
                env.set_raw(dunder::INDEX, Value::Num((index + 1) as f64));
                Ok(Exec::Next)
            }

            Op::ForeachExit => {
                if let Some(saved) = self.cursor_saves.pop() {
                    let names = [dunder::ITER, dunder::INDEX, dunder::LENGTH];
                    for (name, value) in names.into_iter().zip(saved) {
                        match value {
                            Some(value) => env.set_raw(name, value),
                            None => {
                                env.unset(name);
                            }
                        }
                    }
                }
                Ok(Exec::Next)
            }

            Op::OrMark { target } => {
                if self.arrived_by_jump {
                    Ok(Exec::Next)
                } else {
                    self.pc = target.pc();
                    Ok(Exec::Jumped)
                }
            }

            Op::Branch { cond, target } => {
                let passed = self.eval_in(cond, env)?.truthy();
                env.set_raw(dunder::CONDITION, Value::Bool(passed));
                if passed {
                    Ok(Exec::Next)
                } else {
                    self.pc = target.pc();
                    self.arrived_by_jump = false;
                    Ok(Exec::Jumped)
                }
            }

            Op::Goto(target) => {
                self.pc = target.pc();
                self.arrived_by_jump = false;
                Ok(Exec::Jumped)
            }
        }
    }

    /// Resolve a jump target expression: label name first, then a variable
    /// holding a label name or line index, then indirect.
    fn jump_target(&self, expr: &Expr, env: &mut Crucible) -> Result<usize, Flow> {
        if let Some(name) = expr.as_name() {
            if let Some(pc) = self.script.labels.get(name) {
                return Ok(*pc);
            }
            let value = env
                .get(name)
                .ok_or_else(|| Burn::fatal(format!("jump target '{name}' not found")))?;
            return Ok(self.index_of(&value)?);
        }
        if let Expr::Indirect(inner) = expr {
            let value = self.eval_in(inner, env)?;
            return Ok(self.index_of(&value)?);
        }
        let value = self.eval_in(expr, env)?;
        Ok(self.index_of(&value)?)
    }

    /// Interpret a value as a jump destination.
    fn index_of(&self, value: &Value) -> Result<usize, Burn> {
        match value {
            Value::Num(n) => {
                let index = *n as usize;
                if *n < 0.0 || index > self.script.lines.len() {
                    return Err(Burn::fatal(format!("jump index {n} out of range")));
                }
                Ok(index)
            }
            Value::Str(name) => self
                .script
                .labels
                .get(name)
                .copied()
                .ok_or_else(|| Burn::fatal(format!("unknown label '{name}'"))),
            other => Err(Burn::fatal(format!(
                "jump target must be a label or line, got {}",
                other.type_name()
            ))),
        }
    }

    /// Writing `__LINE__` is the dynamic-jump primitive.
    fn jump_to_index(&mut self, value: &Value) -> Result<bool, Flow> {
        let target = self.index_of(value)?;
        self.pc = target;
        self.arrived_by_jump = true;
        Ok(true)
    }

    fn sync_stack(&self, env: &mut Crucible) {
        let stack = self
            .return_stack
            .iter()
            .map(|pc| Value::Num(*pc as f64))
            .collect();
        env.set_raw(dunder::STACK, Value::List(stack));
    }

    fn append_line(&self, env: &mut Crucible, name: &str, text: &str) -> Result<(), Flow> {
        let mut current = match env.get(name) {
            Some(value) => value.coerce_str(),
            None => String::new(),
        };
        current.push_str(text);
        current.push('\n');
        env.set(name, Value::Str(current))?;
        Ok(())
    }
}

fn current_type(env: &Crucible, name: &str) -> &'static str {
    env.get(name).map(|v| v.type_name()).unwrap_or("none")
}

/// The implicit output variable `write` appends to.
pub const OUTPUT: &str = "OUTPUT";
/// The implicit variable `input` fills on resume.
pub const INPUT: &str = "INPUT";

// ── Tests ─────────────────────────────────────────────────────────────────────
