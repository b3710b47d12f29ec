//! Generic PEG engine and the grammar-text loader.
//!
//! A [`Grammar`] is a flat rule table; every reference is an index, so there
//! is no shared-pointer rule graph to manage.  Rules carry a priority from
//! the grammar text:
//!
//! | Marker   | Priority | Effect on the parse tree                    |
//! |----------|----------|---------------------------------------------|
//! | `<-`     | keep     | node retained                               |
//! | `->`     | inline   | children promoted into the parent           |
//! | `--`     | hide     | matched but discarded                       |
//! | `[Name]` | strict   | no implicit whitespace skipping inside      |
//!
//! Between tokens the engine skips runs of spaces and tabs; newlines are only
//! consumed where a rule matches them explicitly.  A strict rule suspends the
//! interior skipping (the position it starts at is still found with the
//! caller's skipping, so strictness governs the rule's own innards).
//!
//! Matching is ordered and deterministic: choice takes the first branch that
//! succeeds, and a failed top-level match reports the furthest position any
//! sub-rule reached.
//!
//! The engine is language-agnostic.  The Tinder grammar itself is a grammar
//! text embedded at build time (`src/tinder.peg`), parsed once by the
//! hand-built bootstrap meta-grammar below and cached.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ParseError;

// ── Patterns ──────────────────────────────────────────────────────────────────

/// One grammar expression.
#[derive(Debug, Clone)]
enum Pat {
    /// Literal text.
    Lit(String),
    /// Anchored regular expression.
    Rx(Regex),
    /// Reference to another rule by table index.
    Ref(usize),
    /// All in order.
    Seq(Vec<Pat>),
    /// First that matches.
    Choice(Vec<Pat>),
    Star(Box<Pat>),
    Plus(Box<Pat>),
    Opt(Box<Pat>),
    /// `&e` — must match, consumes nothing.
    And(Box<Pat>),
    /// `!e` — must not match, consumes nothing.
    Not(Box<Pat>),
}

/// How a matched rule appears in the flattened tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prio {
    Keep,
    Inline,
    Hide,
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    prio: Prio,
    strict: bool,
    pat: Pat,
}

// ── Parse tree ────────────────────────────────────────────────────────────────

/// A node of the flattened parse tree.  `start`/`end` are byte offsets into
/// the source; children are the retained named sub-matches.
#[derive(Debug, Clone)]
pub struct Node {
    rule: usize,
    pub start: usize,
    pub end: usize,
    pub children: Vec<Node>,
}

impl Node {
    /// The name of the rule that produced this node.
    pub fn name<'g>(&self, grammar: &'g Grammar) -> &'g str {
        &grammar.rules[self.rule].name
    }

    /// The matched source text.
    pub fn text<'s>(&self, src: &'s str) -> &'s str {
        &src[self.start..self.end]
    }
}

/// The flattened result of parsing: one retained node per source line, with
/// its 1-based source line number.
#[derive(Debug)]
pub struct ParseTree {
    pub lines: Vec<(u32, Node)>,
}

// ── Grammar ───────────────────────────────────────────────────────────────────

/// A compiled grammar: rule table plus the root rule (the first one in the
/// grammar text).  The root is matched repeatedly until the input is consumed.
#[derive(Debug)]
pub struct Grammar {
    rules: Vec<Rule>,
    root: usize,
}

impl Grammar {
    /// Compile a grammar text (`Name <- expression` lines) into a rule table.
    pub fn from_source(text: &str) -> Result<Grammar, ParseError> {
        let meta = bootstrap();
        let mut owned;
        let text = if text.ends_with('\n') {
            text
        } else {
            owned = text.to_owned();
            owned.push('\n');
            owned.as_str()
        };
        let tree = meta.parse(text)?;
        build_grammar(meta, text, &tree)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Parse `src`, matching the root rule until the input is consumed, and
    /// flatten the result by rule priority.
    pub fn parse(&self, src: &str) -> Result<ParseTree, ParseError> {
        let mut run = Run {
            rules: &self.rules,
            src,
            furthest: 0,
            expected: None,
        };
        let mut pos = 0;
        let mut lines = Vec::new();
        while pos < src.len() {
            match run.rule(self.root, pos, true) {
                Some(node) if node.end > pos => {
                    pos = node.end;
                    for flat in self.flatten(node) {
                        let line = line_of(src, flat.start) as u32;
                        lines.push((line, flat));
                    }
                }
                _ => return Err(run.error()),
            }
        }
        Ok(ParseTree { lines })
    }

    fn flatten(&self, node: Node) -> Vec<Node> {
        match self.rules[node.rule].prio {
            Prio::Hide => Vec::new(),
            Prio::Inline => node
                .children
                .into_iter()
                .flat_map(|child| self.flatten(child))
                .collect(),
            Prio::Keep => {
                let Node {
                    rule,
                    start,
                    end,
                    children,
                } = node;
                let children = children
                    .into_iter()
                    .flat_map(|child| self.flatten(child))
                    .collect();
                vec![Node {
                    rule,
                    start,
                    end,
                    children,
                }]
            }
        }
    }
}

/// 1-based line number of a byte offset.
pub fn line_of(src: &str, pos: usize) -> usize {
    src[..pos.min(src.len())].bytes().filter(|&b| b == b'\n').count() + 1
}

fn column_of(src: &str, pos: usize) -> usize {
    let pos = pos.min(src.len());
    match src[..pos].rfind('\n') {
        Some(nl) => pos - nl,
        None => pos + 1,
    }
}

// ── Matcher ───────────────────────────────────────────────────────────────────

struct Span {
    start: usize,
    end: usize,
    children: Vec<Node>,
}

struct Run<'g, 's> {
    rules: &'g [Rule],
    src: &'s str,
    furthest: usize,
    expected: Option<String>,
}

impl<'g, 's> Run<'g, 's> {
    fn skip_ws(&self, mut pos: usize) -> usize {
        let bytes = self.src.as_bytes();
        while matches!(bytes.get(pos), Some(b' ' | b'\t')) {
            pos += 1;
        }
        pos
    }

    fn fail(&mut self, pos: usize, ctx: usize) {
        if pos >= self.furthest {
            self.furthest = pos;
            self.expected = Some(self.rules[ctx].name.clone());
        }
    }

    fn error(&self) -> ParseError {
        let expected = self.expected.as_deref().unwrap_or("input");
        ParseError {
            line: line_of(self.src, self.furthest),
            column: column_of(self.src, self.furthest),
            message: format!("expected {expected}"),
        }
    }

    fn rule(&mut self, idx: usize, pos: usize, skip: bool) -> Option<Node> {
        let rules = self.rules;
        let rule = &rules[idx];
        // A strict rule still starts after the caller's skipping.
        let pos = if skip && rule.strict {
            self.skip_ws(pos)
        } else {
            pos
        };
        let skip = skip && !rule.strict;
        let span = self.pat(&rule.pat, pos, skip, idx)?;
        Some(Node {
            rule: idx,
            start: span.start,
            end: span.end,
            children: span.children,
        })
    }

    fn pat(&mut self, pat: &Pat, pos: usize, skip: bool, ctx: usize) -> Option<Span> {
        match pat {
            Pat::Lit(text) => {
                let at = if skip { self.skip_ws(pos) } else { pos };
                if self.src[at.min(self.src.len())..].starts_with(text.as_str()) {
                    Some(Span {
                        start: at,
                        end: at + text.len(),
                        children: Vec::new(),
                    })
                } else {
                    self.fail(at, ctx);
                    None
                }
            }
            Pat::Rx(regex) => {
                let at = if skip { self.skip_ws(pos) } else { pos };
                match regex.find(&self.src[at.min(self.src.len())..]) {
                    Some(found) => Some(Span {
                        start: at,
                        end: at + found.end(),
                        children: Vec::new(),
                    }),
                    None => {
                        self.fail(at, ctx);
                        None
                    }
                }
            }
            Pat::Ref(idx) => {
                let node = self.rule(*idx, pos, skip)?;
                Some(Span {
                    start: node.start,
                    end: node.end,
                    children: vec![node],
                })
            }
            Pat::Seq(items) => {
                let mut children = Vec::new();
                let mut at = pos;
                let mut start = None;
                for item in items {
                    let span = self.pat(item, at, skip, ctx)?;
                    // Zero-width matches (predicates, empty optionals) must
                    // not define the span start; it would reach back before
                    // skipped whitespace.
                    if span.end > span.start {
                        start.get_or_insert(span.start);
                    }
                    at = span.end;
                    children.extend(span.children);
                }
                Some(Span {
                    start: start.unwrap_or(at),
                    end: at,
                    children,
                })
            }
            Pat::Choice(items) => {
                for item in items {
                    if let Some(span) = self.pat(item, pos, skip, ctx) {
                        return Some(span);
                    }
                }
                None
            }
            Pat::Star(inner) => {
                let mut children = Vec::new();
                let mut at = pos;
                let mut start = None;
                while let Some(span) = self.pat(inner, at, skip, ctx) {
                    if span.end == at {
                        break; // zero-width match would loop forever
                    }
                    if span.end > span.start {
                        start.get_or_insert(span.start);
                    }
                    at = span.end;
                    children.extend(span.children);
                }
                Some(Span {
                    start: start.unwrap_or(at),
                    end: at,
                    children,
                })
            }
            Pat::Plus(inner) => {
                let first = self.pat(inner, pos, skip, ctx)?;
                let mut start = (first.end > first.start).then_some(first.start);
                let mut at = first.end;
                let mut children = first.children;
                while let Some(span) = self.pat(inner, at, skip, ctx) {
                    if span.end == at {
                        break;
                    }
                    if span.end > span.start {
                        start.get_or_insert(span.start);
                    }
                    at = span.end;
                    children.extend(span.children);
                }
                Some(Span {
                    start: start.unwrap_or(at),
                    end: at,
                    children,
                })
            }
            Pat::Opt(inner) => match self.pat(inner, pos, skip, ctx) {
                Some(span) => Some(span),
                None => Some(Span {
                    start: pos,
                    end: pos,
                    children: Vec::new(),
                }),
            },
            Pat::And(inner) => {
                self.pat(inner, pos, skip, ctx)?;
                Some(Span {
                    start: pos,
                    end: pos,
                    children: Vec::new(),
                })
            }
            Pat::Not(inner) => match self.pat(inner, pos, skip, ctx) {
                Some(_) => {
                    self.fail(pos, ctx);
                    None
                }
                None => Some(Span {
                    start: pos,
                    end: pos,
                    children: Vec::new(),
                }),
            },
        }
    }
}

// ── Bootstrap meta-grammar ────────────────────────────────────────────────────

fn anchored(body: &str) -> Regex {
    match Regex::new(&format!(r"\A(?:{body})")) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid grammar regex '{body}': {err}"),
    }
}

fn lit(text: &str) -> Pat {
    Pat::Lit(text.to_owned())
}

fn rx(body: &str) -> Pat {
    Pat::Rx(anchored(body))
}

/// The grammar that parses grammar texts.  Hand-built once; rule indices are
/// written against the order below.
fn bootstrap() -> &'static Grammar {
    static META: OnceLock<Grammar> = OnceLock::new();
    META.get_or_init(|| {
        let names = [
            ("Line", Prio::Inline),      // 0
            ("Comment", Prio::Hide),     // 1
            ("Newline", Prio::Hide),     // 2
            ("Rule", Prio::Keep),        // 3
            ("Strict", Prio::Keep),      // 4
            ("Arrow", Prio::Keep),       // 5
            ("Choice", Prio::Keep),      // 6
            ("Seq", Prio::Keep),         // 7
            ("Term", Prio::Inline),      // 8
            ("AndPred", Prio::Keep),     // 9
            ("NotPred", Prio::Keep),     // 10
            ("Quant", Prio::Keep),       // 11
            ("Suffix", Prio::Keep),      // 12
            ("Primary", Prio::Inline),   // 13
            ("Group", Prio::Keep),       // 14
            ("Str", Prio::Keep),         // 15
            ("Rx", Prio::Keep),          // 16
            ("NameRef", Prio::Keep),     // 17
            ("Name", Prio::Keep),        // 18
        ];
        const LINE: usize = 0;
        const COMMENT: usize = 1;
        const NEWLINE: usize = 2;
        const RULE: usize = 3;
        const STRICT: usize = 4;
        const ARROW: usize = 5;
        const CHOICE: usize = 6;
        const SEQ: usize = 7;
        const TERM: usize = 8;
        const ANDPRED: usize = 9;
        const NOTPRED: usize = 10;
        const QUANT: usize = 11;
        const SUFFIX: usize = 12;
        const PRIMARY: usize = 13;
        const GROUP: usize = 14;
        const STR: usize = 15;
        const RX: usize = 16;
        const NAMEREF: usize = 17;
        const NAME: usize = 18;

        let pats = vec![
            // Line -> Rule? Comment? Newline
            Pat::Seq(vec![
                Pat::Opt(Box::new(Pat::Ref(RULE))),
                Pat::Opt(Box::new(Pat::Ref(COMMENT))),
                Pat::Ref(NEWLINE),
            ]),
            rx(r"#[^\n]*"),
            rx(r"\r\n|\n|\r"),
            // Rule <- (Strict / Name) Arrow Choice
            Pat::Seq(vec![
                Pat::Choice(vec![Pat::Ref(STRICT), Pat::Ref(NAME)]),
                Pat::Ref(ARROW),
                Pat::Ref(CHOICE),
            ]),
            Pat::Seq(vec![lit("["), Pat::Ref(NAME), lit("]")]),
            Pat::Choice(vec![lit("<-"), lit("--"), lit("->")]),
            // Choice <- Seq ("/" Seq)*
            Pat::Seq(vec![
                Pat::Ref(SEQ),
                Pat::Star(Box::new(Pat::Seq(vec![lit("/"), Pat::Ref(SEQ)]))),
            ]),
            Pat::Plus(Box::new(Pat::Ref(TERM))),
            Pat::Choice(vec![
                Pat::Ref(ANDPRED),
                Pat::Ref(NOTPRED),
                Pat::Ref(QUANT),
            ]),
            Pat::Seq(vec![lit("&"), Pat::Ref(QUANT)]),
            Pat::Seq(vec![lit("!"), Pat::Ref(QUANT)]),
            // Quant <- Primary Suffix?
            Pat::Seq(vec![Pat::Ref(PRIMARY), Pat::Opt(Box::new(Pat::Ref(SUFFIX)))]),
            Pat::Choice(vec![lit("*"), lit("+"), lit("?")]),
            Pat::Choice(vec![
                Pat::Ref(STR),
                Pat::Ref(RX),
                Pat::Ref(GROUP),
                Pat::Ref(NAMEREF),
            ]),
            Pat::Seq(vec![lit("("), Pat::Ref(CHOICE), lit(")")]),
            rx(r#""(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*'"#),
            rx(r#"~"(?:[^"\\\n]|\\.)*"|~'(?:[^'\\\n]|\\.)*'"#),
            rx(r"[A-Za-z_][A-Za-z0-9_]*"),
            rx(r"[A-Za-z_][A-Za-z0-9_]*"),
        ];

        let rules = names
            .iter()
            .zip(pats)
            .map(|((name, prio), pat)| Rule {
                name: (*name).to_owned(),
                prio: *prio,
                strict: false,
                pat,
            })
            .collect();
        Grammar {
            rules,
            root: LINE,
        }
    })
}

// ── Grammar-text compilation ──────────────────────────────────────────────────

fn build_grammar(meta: &Grammar, text: &str, tree: &ParseTree) -> Result<Grammar, ParseError> {
    struct Decl<'t> {
        name: String,
        prio: Prio,
        strict: bool,
        choice: &'t Node,
        line: u32,
    }

    let mut decls: Vec<Decl> = Vec::new();
    for (line, node) in &tree.lines {
        if node.name(meta) != "Rule" {
            continue;
        }
        let head = &node.children[0];
        let (name, strict) = match head.name(meta) {
            "Strict" => (head.children[0].text(text).to_owned(), true),
            _ => (head.text(text).to_owned(), false),
        };
        let prio = match node.children[1].text(text) {
            "--" => Prio::Hide,
            "->" => Prio::Inline,
            _ => Prio::Keep,
        };
        decls.push(Decl {
            name,
            prio,
            strict,
            choice: &node.children[2],
            line: *line,
        });
    }
    if decls.is_empty() {
        return Err(ParseError {
            line: 1,
            column: 1,
            message: "grammar defines no rules".into(),
        });
    }

    // Duplicate rule names would silently shadow; reject them.
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(decls.len());
    for (i, decl) in decls.iter().enumerate() {
        if index.insert(decl.name.as_str(), i).is_some() {
            return Err(ParseError {
                line: decl.line as usize,
                column: 1,
                message: format!("grammar rule '{}' is defined twice", decl.name),
            });
        }
    }

    fn build(
        meta: &Grammar,
        text: &str,
        node: &Node,
        index: &HashMap<&str, usize>,
        line: u32,
    ) -> Result<Pat, ParseError> {
        let pat = match node.name(meta) {
            "Choice" => {
                let alts: Result<Vec<Pat>, ParseError> = node
                    .children
                    .iter()
                    .map(|child| build(meta, text, child, index, line))
                    .collect();
                let mut alts = alts?;
                if alts.len() == 1 {
                    alts.remove(0)
                } else {
                    Pat::Choice(alts)
                }
            }
            "Seq" => {
                let items: Result<Vec<Pat>, ParseError> = node
                    .children
                    .iter()
                    .map(|child| build(meta, text, child, index, line))
                    .collect();
                let mut items = items?;
                if items.len() == 1 {
                    items.remove(0)
                } else {
                    Pat::Seq(items)
                }
            }
            "AndPred" => Pat::And(Box::new(build(meta, text, &node.children[0], index, line)?)),
            "NotPred" => Pat::Not(Box::new(build(meta, text, &node.children[0], index, line)?)),
            "Quant" => {
                let inner = build(meta, text, &node.children[0], index, line)?;
                match node.children.get(1).map(|suffix| suffix.text(text)) {
                    Some("*") => Pat::Star(Box::new(inner)),
                    Some("+") => Pat::Plus(Box::new(inner)),
                    Some("?") => Pat::Opt(Box::new(inner)),
                    _ => inner,
                }
            }
            "Group" => build(meta, text, &node.children[0], index, line)?,
            "Str" => Pat::Lit(unescape(strip_quotes(node.text(text)))),
            "Rx" => {
                let body = strip_quotes(&node.text(text)[1..]);
                match Regex::new(&format!(r"\A(?:{body})")) {
                    Ok(regex) => Pat::Rx(regex),
                    Err(err) => {
                        return Err(ParseError {
                            line: line as usize,
                            column: 1,
                            message: format!("invalid regex in grammar: {err}"),
                        })
                    }
                }
            }
            "NameRef" => {
                let name = node.text(text);
                match index.get(name) {
                    Some(&idx) => Pat::Ref(idx),
                    None => {
                        return Err(ParseError {
                            line: line as usize,
                            column: 1,
                            message: format!("grammar rule '{name}' is not defined"),
                        })
                    }
                }
            }
            other => {
                return Err(ParseError {
                    line: line as usize,
                    column: 1,
                    message: format!("unexpected grammar node '{other}'"),
                })
            }
        };
        Ok(pat)
    }

    let mut rules = Vec::with_capacity(decls.len());
    for decl in &decls {
        let pat = build(meta, text, decl.choice, &index, decl.line)?;
        rules.push(Rule {
            name: decl.name.clone(),
            prio: decl.prio,
            strict: decl.strict,
            pat,
        });
    }

    Ok(Grammar { rules, root: 0 })
}

fn strip_quotes(text: &str) -> &str {
    let text = text.trim();
    if text.len() >= 2 {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
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

// ── The Tinder grammar ────────────────────────────────────────────────────────

/// The Tinder script grammar, compiled from the embedded grammar text on
/// first use.  The text is fixed at build time; failing to compile it is a
/// packaging defect, not a runtime condition.
pub fn tinder_grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        match Grammar::from_source(include_str!("tinder.peg")) {
            Ok(grammar) => grammar,
            Err(err) => panic!("embedded tinder.peg failed to compile: {err}"),
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
