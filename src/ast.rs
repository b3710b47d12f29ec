//! Typed AST lowered from the grammar's parse tree.
//!
//! The grammar produces one flattened node per source line; this module turns
//! those into [`SourceLine`]s the compiler can linearize.  Expression nodes
//! become [`Expr`] trees here; constant folding and pool interning happen
//! later, in the compiler.

use crate::error::CompileError;
use crate::grammar::{Grammar, Node, ParseTree};
use crate::library::ImportRequest;
use crate::value::Value;

// ── Expressions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    At,
    From,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// One segment of a dotted path.
#[derive(Debug, Clone, PartialEq)]
pub enum Seg {
    Name(String),
    Index(usize),
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Lit(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// An unfolded literal; the compiler interns these into the pool.
    Literal(Value),
    /// A constant-pool reference, produced by folding.
    Const(usize),
    /// A string with `[[NAME]]` fragments, concatenated at runtime.
    Interp(Vec<Fragment>),
    /// Identifier or dot chain.
    Path(Vec<Seg>),
    /// `@expr` — the inner value names the real target.
    Indirect(Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Array(Vec<Expr>),
    Table(Vec<(String, Expr)>),
}

impl Expr {
    /// A single-segment path, if that is what this is.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Expr::Path(segs) => match segs.as_slice() {
                [Seg::Name(name)] => Some(name),
                _ => None,
            },
            _ => None,
        }
    }
}

// ── Statements and lines ──────────────────────────────────────────────────────

/// An assignment destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A (possibly dotted) name.
    Name(String),
    /// `@expr` — the evaluated value names the variable.
    Indirect(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetSource {
    /// `set a, b to x, y` — values zipped onto targets.
    Values(Vec<Expr>),
    /// `set a, b from coll` — unpacked from a sequence or mapping.
    Unpack(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
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
    Break,
    Continue,
}

/// One source line, typed.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Label {
        name: String,
        fallthrough: Option<String>,
    },
    Import(ImportRequest),
    Const {
        name: String,
        expr: Expr,
    },
    Catch {
        kind: String,
        label: String,
    },
    Stmt {
        stmt: Stmt,
        guard: Option<Expr>,
        else_guard: bool,
    },
    If(Expr),
    ElseIf(Expr),
    Else,
    EndIf,
    For {
        init: Option<(Target, Expr)>,
        cond: Expr,
        step: Option<Stmt>,
    },
    Foreach {
        var: String,
        second: Option<String>,
        coll: Expr,
    },
    EndFor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub line: u32,
    pub kind: LineKind,
}

// ── Lowering ──────────────────────────────────────────────────────────────────

/// Lower a parse tree into typed source lines.
pub fn lower(tree: &ParseTree, grammar: &Grammar, src: &str) -> Result<Vec<SourceLine>, CompileError> {
    let cx = Cx { grammar, src };
    let mut lines = Vec::with_capacity(tree.lines.len());
    for (line, node) in &tree.lines {
        let kind = cx.line(node, *line)?;
        lines.push(SourceLine { line: *line, kind });
    }
    Ok(lines)
}

struct Cx<'a> {
    grammar: &'a Grammar,
    src: &'a str,
}

impl<'a> Cx<'a> {
    fn name(&self, node: &Node) -> &str {
        node.name(self.grammar)
    }

    fn text(&self, node: &Node) -> &str {
        node.text(self.src)
    }

    fn malformed(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError::Malformed {
            message: message.into(),
            line,
        }
    }

    fn child<'n>(&self, node: &'n Node, idx: usize, line: u32) -> Result<&'n Node, CompileError> {
        node.children
            .get(idx)
            .ok_or_else(|| self.malformed(line, format!("incomplete {}", self.name(node))))
    }

    fn line(&self, node: &Node, line: u32) -> Result<LineKind, CompileError> {
        Ok(match self.name(node) {
            "Label" => {
                let name = self.text(self.child(node, 0, line)?).to_owned();
                let fallthrough = node
                    .children
                    .get(1)
                    .and_then(|f| f.children.first())
                    .map(|n| self.text(n).to_owned());
                LineKind::Label { name, fallthrough }
            }
            "Import" => {
                let library = self.text(self.child(node, 0, line)?).to_owned();
                let alias = node
                    .children
                    .get(1)
                    .and_then(|a| a.children.first())
                    .map(|n| self.text(n).to_owned());
                LineKind::Import(ImportRequest {
                    library,
                    alias,
                    symbols: None,
                })
            }
            "FromImport" => {
                let library = self.text(self.child(node, 0, line)?).to_owned();
                let symbols = node.children[1..]
                    .iter()
                    .map(|n| self.text(n).to_owned())
                    .collect();
                LineKind::Import(ImportRequest {
                    library,
                    alias: None,
                    symbols: Some(symbols),
                })
            }
            "Const" => LineKind::Const {
                name: self.text(self.child(node, 0, line)?).to_owned(),
                expr: self.expr(self.child(node, 1, line)?, line)?,
            },
            "Catch" => LineKind::Catch {
                kind: string_content(self.text(self.child(node, 0, line)?)),
                label: self.text(self.child(node, 1, line)?).to_owned(),
            },
            "If" => LineKind::If(self.expr(self.child(node, 0, line)?, line)?),
            "ElseIf" => LineKind::ElseIf(self.expr(self.child(node, 0, line)?, line)?),
            "Else" => match node.children.first() {
                None => LineKind::Else,
                Some(statement) => {
                    let LineKind::Stmt { stmt, guard, .. } = self.line(statement, line)? else {
                        return Err(self.malformed(line, "else expects a statement"));
                    };
                    LineKind::Stmt {
                        stmt,
                        guard,
                        else_guard: true,
                    }
                }
            },
            "EndIf" => LineKind::EndIf,
            "Foreach" => {
                let var = self.text(self.child(node, 0, line)?).to_owned();
                let (second, coll) = if node.children.len() > 2 {
                    (
                        Some(self.text(self.child(node, 1, line)?).to_owned()),
                        self.expr(self.child(node, 2, line)?, line)?,
                    )
                } else {
                    (None, self.expr(self.child(node, 1, line)?, line)?)
                };
                LineKind::Foreach { var, second, coll }
            }
            "For" => {
                let head = self.child(node, 0, line)?;
                if self.name(head) == "ForClauses" {
                    let init_node = self.child(head, 0, line)?;
                    let target = self.target(self.child(init_node, 0, line)?, line)?;
                    let init_expr = self.expr(self.child(init_node, 1, line)?, line)?;
                    let cond = self.expr(self.child(head, 1, line)?, line)?;
                    let step = self.stmt(self.child(head, 2, line)?, line)?;
                    LineKind::For {
                        init: Some((target, init_expr)),
                        cond,
                        step: Some(step),
                    }
                } else {
                    LineKind::For {
                        init: None,
                        cond: self.expr(head, line)?,
                        step: None,
                    }
                }
            }
            "EndFor" => LineKind::EndFor,
            "Statement" => {
                let stmt = self.stmt(self.child(node, 0, line)?, line)?;
                let guard = match node.children.get(1) {
                    Some(guard) => Some(self.expr(self.child(guard, 0, line)?, line)?),
                    None => None,
                };
                LineKind::Stmt {
                    stmt,
                    guard,
                    else_guard: false,
                }
            }
            other => return Err(self.malformed(line, format!("unexpected line node '{other}'"))),
        })
    }

    fn stmt(&self, node: &Node, line: u32) -> Result<Stmt, CompileError> {
        Ok(match self.name(node) {
            "Set" => {
                let list = self.child(node, 0, line)?;
                let targets: Result<Vec<Target>, CompileError> = list
                    .children
                    .iter()
                    .map(|t| self.target(t, line))
                    .collect();
                let source_node = self.child(node, 1, line)?;
                let source = match self.name(source_node) {
                    "SetTo" => {
                        let exprs: Result<Vec<Expr>, CompileError> = self
                            .child(source_node, 0, line)?
                            .children
                            .iter()
                            .map(|e| self.expr(e, line))
                            .collect();
                        SetSource::Values(exprs?)
                    }
                    _ => SetSource::Unpack(self.expr(self.child(source_node, 0, line)?, line)?),
                };
                Stmt::Set {
                    targets: targets?,
                    source,
                }
            }
            "Inc" | "Dec" => {
                let target = self.target(self.child(node, 0, line)?, line)?;
                let by = match node.children.get(1) {
                    Some(by) => Some(self.expr(self.child(by, 0, line)?, line)?),
                    None => None,
                };
                if self.name(node) == "Inc" {
                    Stmt::Inc { target, by }
                } else {
                    Stmt::Dec { target, by }
                }
            }
            "Swap" => Stmt::Swap {
                a: self.target(self.child(node, 0, line)?, line)?,
                b: self.target(self.child(node, 1, line)?, line)?,
            },
            "Put" => {
                let value = self.expr(self.child(node, 0, line)?, line)?;
                let place = match self.text(self.child(node, 1, line)?) {
                    "before" => Place::Before,
                    _ => Place::After,
                };
                let target = self.target(self.child(node, 2, line)?, line)?;
                Stmt::Put {
                    value,
                    place,
                    target,
                }
            }
            "Write" | "Input" => {
                let value = self.expr(self.child(node, 0, line)?, line)?;
                let target = match node.children.get(1) {
                    Some(to) => Some(self.target(self.child(to, 0, line)?, line)?),
                    None => None,
                };
                if self.name(node) == "Write" {
                    Stmt::Write { value, target }
                } else {
                    Stmt::Input {
                        prompt: value,
                        target,
                    }
                }
            }
            "CallS" => Stmt::Call(self.expr(self.child(node, 0, line)?, line)?),
            "JumpS" => Stmt::Jump(self.expr(self.child(node, 0, line)?, line)?),
            "Return" => Stmt::Return,
            "Yield" => Stmt::Yield(match node.children.first() {
                Some(expr) => Some(self.expr(expr, line)?),
                None => None,
            }),
            "Stop" => Stmt::Stop,
            "Break" => Stmt::Break,
            "Continue" => Stmt::Continue,
            "Bare" => Stmt::Write {
                value: self.string_expr(self.child(node, 0, line)?),
                target: None,
            },
            other => return Err(self.malformed(line, format!("unexpected statement '{other}'"))),
        })
    }

    fn target(&self, node: &Node, line: u32) -> Result<Target, CompileError> {
        Ok(match self.name(node) {
            "Indirect" => Target::Indirect(self.expr(self.child(node, 0, line)?, line)?),
            "Path" => Target::Name(self.path_name(node)),
            other => return Err(self.malformed(line, format!("invalid target '{other}'"))),
        })
    }

    fn path_name(&self, node: &Node) -> String {
        let mut name = String::new();
        for (i, seg) in node.children.iter().enumerate() {
            if i > 0 {
                name.push('.');
            }
            name.push_str(self.text(seg));
        }
        name
    }

    fn expr(&self, node: &Node, line: u32) -> Result<Expr, CompileError> {
        Ok(match self.name(node) {
            "Indirect" => Expr::Indirect(Box::new(self.expr(self.child(node, 0, line)?, line)?)),
            "OrExpr" => self.fold_uniform(node, BinOp::Or, line)?,
            "AndExpr" => self.fold_uniform(node, BinOp::And, line)?,
            "CmpExpr" | "MemExpr" | "AddExpr" | "MulExpr" => self.fold_ops(node, line)?,
            "Unary" => {
                if node.children.len() == 1 {
                    self.expr(self.child(node, 0, line)?, line)?
                } else {
                    let op = match self.name(self.child(node, 0, line)?) {
                        "NotOp" => UnaryOp::Not,
                        _ => UnaryOp::Neg,
                    };
                    let inner = self.expr(self.child(node, 1, line)?, line)?;
                    Expr::Unary(op, Box::new(inner))
                }
            }
            "Postfix" => {
                let callee = self.expr(self.child(node, 0, line)?, line)?;
                match node.children.get(1) {
                    None => callee,
                    Some(call_args) => {
                        let args = match call_args.children.first() {
                            None => Vec::new(),
                            Some(list) => {
                                let args: Result<Vec<Expr>, CompileError> = list
                                    .children
                                    .iter()
                                    .map(|e| self.expr(e, line))
                                    .collect();
                                args?
                            }
                        };
                        Expr::Call {
                            callee: Box::new(callee),
                            args,
                        }
                    }
                }
            }
            "Group" => self.expr(self.child(node, 0, line)?, line)?,
            "Path" => {
                let mut segs = Vec::with_capacity(node.children.len());
                for seg in &node.children {
                    segs.push(match self.name(seg) {
                        "Index" => Seg::Index(self.text(seg).parse().unwrap_or(0)),
                        _ => Seg::Name(self.text(seg).to_owned()),
                    });
                }
                Expr::Path(segs)
            }
            "Number" => Expr::Literal(Value::Num(self.text(node).parse().unwrap_or(0.0))),
            "String" => self.string_expr(node),
            "Boolean" => Expr::Literal(Value::Bool(self.text(node) == "true")),
            "NoneLit" => Expr::Literal(Value::None),
            "Array" => match node.children.first() {
                None => Expr::Array(Vec::new()),
                Some(list) => {
                    let items: Result<Vec<Expr>, CompileError> =
                        list.children.iter().map(|e| self.expr(e, line)).collect();
                    Expr::Array(items?)
                }
            },
            "TableLit" => {
                let mut pairs = Vec::with_capacity(node.children.len());
                for pair in &node.children {
                    let key_node = self.child(pair, 0, line)?;
                    let key = match self.name(key_node) {
                        "String" => string_content(self.text(key_node)),
                        _ => self.text(key_node).to_owned(),
                    };
                    pairs.push((key, self.expr(self.child(pair, 1, line)?, line)?));
                }
                Expr::Table(pairs)
            }
            other => return Err(self.malformed(line, format!("unexpected expression '{other}'"))),
        })
    }

    /// Fold `OrExpr`/`AndExpr` children (operands only; the operator is
    /// implied by the rule).
    fn fold_uniform(&self, node: &Node, op: BinOp, line: u32) -> Result<Expr, CompileError> {
        let mut expr = self.expr(self.child(node, 0, line)?, line)?;
        for rhs in &node.children[1..] {
            let rhs = self.expr(rhs, line)?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    /// Fold operand/op/operand/op/… children left-associatively.
    fn fold_ops(&self, node: &Node, line: u32) -> Result<Expr, CompileError> {
        let mut expr = self.expr(self.child(node, 0, line)?, line)?;
        let mut i = 1;
        while i + 1 < node.children.len() {
            let op = bin_op(self.text(&node.children[i]))
                .ok_or_else(|| self.malformed(line, "unknown operator"))?;
            let rhs = self.expr(self.child(node, i + 1, line)?, line)?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
            i += 2;
        }
        Ok(expr)
    }

    fn string_expr(&self, node: &Node) -> Expr {
        let content = string_content(self.text(node));
        let fragments = split_interpolation(&content);
        match fragments {
            None => Expr::Literal(Value::Str(content)),
            Some(fragments) => Expr::Interp(fragments),
        }
    }
}

/// Map an operator spelling (symbolic or alias) to its op.
fn bin_op(text: &str) -> Option<BinOp> {
    let spelled: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(match spelled.as_str() {
        "+" | "plus" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" | "times" => BinOp::Mul,
        "/" => BinOp::Div,
        "//" | "div" => BinOp::IntDiv,
        "%" | "mod" => BinOp::Rem,
        "==" | "is" => BinOp::Eq,
        "!=" | "is not" => BinOp::Ne,
        "<" | "less than" => BinOp::Lt,
        ">" | "greater than" => BinOp::Gt,
        "<=" => BinOp::Le,
        ">=" => BinOp::Ge,
        "in" => BinOp::In,
        "at" => BinOp::At,
        "from" => BinOp::From,
        _ => return None,
    })
}

/// Strip quotes and process backslash escapes of a string literal.
fn string_content(text: &str) -> String {
    let inner = if text.len() >= 2 {
        &text[1..text.len() - 1]
    } else {
        text
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split `[[NAME]]` interpolation fragments out of a string.  Returns `None`
/// when the string has no well-formed fragment.
fn split_interpolation(content: &str) -> Option<Vec<Fragment>> {
    let mut fragments = Vec::new();
    let mut rest = content;
    let mut found = false;
    loop {
        match rest.find("[[") {
            None => break,
            Some(open) => {
                let Some(close) = rest[open + 2..].find("]]") else {
                    break;
                };
                let name = rest[open + 2..open + 2 + close].trim();
                if name.is_empty() || !is_identifier(name) {
                    // Not an interpolation; keep the brackets literal.
                    let split = open + 2;
                    if !rest[..split].is_empty() {
                        fragments.push(Fragment::Lit(rest[..split].to_owned()));
                    }
                    rest = &rest[split..];
                    continue;
                }
                if open > 0 {
                    fragments.push(Fragment::Lit(rest[..open].to_owned()));
                }
                fragments.push(Fragment::Var(name.to_owned()));
                rest = &rest[open + 2 + close + 2..];
                found = true;
            }
        }
    }
    if !found {
        return None;
    }
    if !rest.is_empty() {
        fragments.push(Fragment::Lit(rest.to_owned()));
    }
    Some(fragments)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::tinder_grammar;

    fn lower_src(src: &str) -> Vec<SourceLine> {
        let grammar = tinder_grammar();
        let mut source = src.to_owned();
        if !source.ends_with('\n') {
            source.push('\n');
        }
        let tree = grammar.parse(&source).unwrap();
        lower(&tree, grammar, &source).unwrap()
    }

    #[test]
    fn set_to_lowering() {
        let lines = lower_src("set a to 2");
        let LineKind::Stmt { stmt, guard, .. } = &lines[0].kind else {
            panic!("not a statement: {:?}", lines[0]);
        };
        assert!(guard.is_none());
        let Stmt::Set { targets, source } = stmt else {
            panic!("not a set: {stmt:?}");
        };
        assert_eq!(targets, &[Target::Name("a".into())]);
        assert_eq!(
            source,
            &SetSource::Values(vec![Expr::Literal(Value::Num(2.0))])
        );
    }

    #[test]
    fn arithmetic_precedence() {
        let lines = lower_src("set x to 2 + 3 * 4");
        let LineKind::Stmt { stmt, .. } = &lines[0].kind else {
            panic!();
        };
        let Stmt::Set {
            source: SetSource::Values(values),
            ..
        } = stmt
        else {
            panic!();
        };
        // + at the top, * nested.
        let Expr::Binary(BinOp::Add, _, rhs) = &values[0] else {
            panic!("expected Add at the top: {:?}", values[0]);
        };
        assert!(matches!(**rhs, Expr::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn operator_aliases() {
        let lines = lower_src("jump done if tries is not 3");
        let LineKind::Stmt { guard, .. } = &lines[0].kind else {
            panic!();
        };
        assert!(matches!(
            guard.as_ref().unwrap(),
            Expr::Binary(BinOp::Ne, _, _)
        ));
    }

    #[test]
    fn membership_below_comparison() {
        // `x in y == z` parses as `(x in y) == z`.
        let lines = lower_src("set r to x in y == z");
        let LineKind::Stmt { stmt, .. } = &lines[0].kind else {
            panic!();
        };
        let Stmt::Set {
            source: SetSource::Values(values),
            ..
        } = stmt
        else {
            panic!();
        };
        let Expr::Binary(BinOp::Eq, lhs, _) = &values[0] else {
            panic!("expected Eq at the top: {:?}", values[0]);
        };
        assert!(matches!(**lhs, Expr::Binary(BinOp::In, _, _)));
    }

    #[test]
    fn label_with_fallthrough() {
        let lines = lower_src("# end or retry");
        assert_eq!(
            lines[0].kind,
            LineKind::Label {
                name: "end".into(),
                fallthrough: Some("retry".into()),
            }
        );
    }

    #[test]
    fn import_forms() {
        let lines = lower_src("import math as m\nfrom text import upper, lower");
        let LineKind::Import(request) = &lines[0].kind else {
            panic!();
        };
        assert_eq!(request.library, "math");
        assert_eq!(request.alias.as_deref(), Some("m"));
        let LineKind::Import(request) = &lines[1].kind else {
            panic!();
        };
        assert_eq!(
            request.symbols,
            Some(vec!["upper".to_owned(), "lower".to_owned()])
        );
    }

    #[test]
    fn catch_directive() {
        let lines = lower_src("catch \"TinderBurn\" at handler");
        assert_eq!(
            lines[0].kind,
            LineKind::Catch {
                kind: "TinderBurn".into(),
                label: "handler".into(),
            }
        );
    }

    #[test]
    fn bare_string_is_write() {
        let lines = lower_src("\"hello\"");
        let LineKind::Stmt { stmt, .. } = &lines[0].kind else {
            panic!();
        };
        assert_eq!(
            stmt,
            &Stmt::Write {
                value: Expr::Literal(Value::Str("hello".into())),
                target: None,
            }
        );
    }

    #[test]
    fn interpolation_splits() {
        let lines = lower_src("\"answer=[[b]]!\"");
        let LineKind::Stmt {
            stmt: Stmt::Write { value, .. },
            ..
        } = &lines[0].kind
        else {
            panic!();
        };
        assert_eq!(
            value,
            &Expr::Interp(vec![
                Fragment::Lit("answer=".into()),
                Fragment::Var("b".into()),
                Fragment::Lit("!".into()),
            ])
        );
    }

    #[test]
    fn flat_else_statement() {
        let lines = lower_src("else write \"no\"");
        let LineKind::Stmt { else_guard, .. } = &lines[0].kind else {
            panic!();
        };
        assert!(else_guard);
    }

    #[test]
    fn block_else_is_a_delimiter() {
        let lines = lower_src("else");
        assert_eq!(lines[0].kind, LineKind::Else);
    }

    #[test]
    fn counted_for() {
        let lines = lower_src("for tries = 0; tries < 3; inc tries");
        let LineKind::For { init, step, .. } = &lines[0].kind else {
            panic!("{:?}", lines[0]);
        };
        assert!(init.is_some());
        assert!(matches!(step, Some(Stmt::Inc { .. })));
    }

    #[test]
    fn while_style_for() {
        let lines = lower_src("for hp > 0");
        let LineKind::For { init, step, cond } = &lines[0].kind else {
            panic!();
        };
        assert!(init.is_none() && step.is_none());
        assert!(matches!(cond, Expr::Binary(BinOp::Gt, _, _)));
    }

    #[test]
    fn foreach_pair_form() {
        let lines = lower_src("foreach k, v in inventory");
        assert!(matches!(
            &lines[0].kind,
            LineKind::Foreach { var, second: Some(second), .. }
                if var == "k" && second == "v"
        ));
    }

    #[test]
    fn indirect_scopes_over_membership() {
        let lines = lower_src("jump @INPUT from { q: \"quit\", _: \"invalid\" }");
        let LineKind::Stmt {
            stmt: Stmt::Jump(expr),
            ..
        } = &lines[0].kind
        else {
            panic!();
        };
        let Expr::Indirect(inner) = expr else {
            panic!("expected indirect at the top: {expr:?}");
        };
        assert!(matches!(**inner, Expr::Binary(BinOp::From, _, _)));
    }

    #[test]
    fn dot_chain_path() {
        let lines = lower_src("set r to player.stats.0");
        let LineKind::Stmt {
            stmt:
                Stmt::Set {
                    source: SetSource::Values(values),
                    ..
                },
            ..
        } = &lines[0].kind
        else {
            panic!();
        };
        assert_eq!(
            values[0],
            Expr::Path(vec![
                Seg::Name("player".into()),
                Seg::Name("stats".into()),
                Seg::Index(0),
            ])
        );
    }

    #[test]
    fn call_with_args() {
        let lines = lower_src("call math.sqrt(16)");
        let LineKind::Stmt {
            stmt: Stmt::Call(Expr::Call { callee, args }),
            ..
        } = &lines[0].kind
        else {
            panic!("{:?}", lines[0].kind);
        };
        assert!(matches!(**callee, Expr::Path(_)));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn comments_vanish() {
        let lines = lower_src("`` a comment\nset a to 1 `` trailing");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, 2);
    }

    #[test]
    fn source_lines_are_recorded() {
        let lines = lower_src("set a to 1\n\nset b to 2");
        assert_eq!(lines[0].line, 1);
        assert_eq!(lines[1].line, 3);
    }
}
