//! Line-level macro expansion, applied before parsing.
//!
//! Two macro forms:
//!
//! - word macros: every occurrence of a bare name is replaced by its body;
//! - pattern macros: a whole-line template with `$var` placeholders, e.g.
//!   pattern `repeat $n` expanding to `for i = 0; i < $n; inc i`.
//!
//! Expansion is textual and single-pass per line, in registration order.

use regex::Regex;

#[derive(Debug)]
enum Macro {
    Word {
        regex: Regex,
        body: String,
    },
    Pattern {
        regex: Regex,
        placeholders: Vec<String>,
        template: String,
    },
}

/// An ordered set of line macros.
#[derive(Debug, Default)]
pub struct Preprocessor {
    macros: Vec<Macro>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// Register a word macro: `name` → `body` at word boundaries.
    pub fn define(&mut self, name: &str, body: impl Into<String>) -> &mut Self {
        if let Ok(regex) = Regex::new(&format!(r"\b{}\b", regex::escape(name))) {
            self.macros.push(Macro::Word {
                regex,
                body: body.into(),
            });
        }
        self
    }

    /// Register a pattern macro.  `pattern` may contain `$var` placeholders;
    /// a line matching the whole pattern is replaced by `template` with each
    /// `$var` substituted.
    pub fn pattern(&mut self, pattern: &str, template: impl Into<String>) -> &mut Self {
        let placeholder = match Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)") {
            Ok(regex) => regex,
            Err(_) => return self,
        };
        let placeholders: Vec<String> = placeholder
            .captures_iter(pattern)
            .map(|cap| cap[1].to_owned())
            .collect();
        let mut escaped = regex::escape(pattern);
        for name in &placeholders {
            escaped = escaped.replace(&format!(r"\${name}"), "(.+?)");
        }
        if let Ok(regex) = Regex::new(&format!(r"\A{escaped}\z")) {
            self.macros.push(Macro::Pattern {
                regex,
                placeholders,
                template: template.into(),
            });
        }
        self
    }

    /// Expand all macros over each line of `source`.
    pub fn process(&self, source: &str) -> String {
        if self.macros.is_empty() {
            return source.to_owned();
        }
        let mut output = Vec::new();
        for line in source.split('\n') {
            let mut line = line.to_owned();
            for macro_ in &self.macros {
                match macro_ {
                    Macro::Word { regex, body } => {
                        line = regex
                            .replace_all(&line, regex::NoExpand(body.as_str()))
                            .into_owned();
                    }
                    Macro::Pattern {
                        regex,
                        placeholders,
                        template,
                    } => {
                        if let Some(caps) = regex.captures(line.trim()) {
                            let mut expanded = template.clone();
                            for (i, name) in placeholders.iter().enumerate() {
                                let captured = caps.get(i + 1).map(|m| m.as_str().trim()).unwrap_or("");
                                expanded = expanded.replace(&format!("${name}"), captured);
                            }
                            line = expanded;
                        }
                    }
                }
            }
            output.push(line);
        }
        output.join("\n")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_macro_replaces_at_boundaries() {
        let mut pre = Preprocessor::new();
        pre.define("GOLD", "player.gold");
        assert_eq!(pre.process("inc GOLD by 5"), "inc player.gold by 5");
        // No replacement inside larger words.
        assert_eq!(pre.process("set GOLDEN to 1"), "set GOLDEN to 1");
    }

    #[test]
    fn pattern_macro_rewrites_whole_line() {
        let mut pre = Preprocessor::new();
        pre.pattern("say $text", "write $text to OUTPUT");
        assert_eq!(pre.process("say \"hi\""), "write \"hi\" to OUTPUT");
        // Non-matching lines pass through.
        assert_eq!(pre.process("set a to 1"), "set a to 1");
    }

    #[test]
    fn pattern_with_multiple_placeholders() {
        let mut pre = Preprocessor::new();
        pre.pattern("give $who $what", "put $what after $who");
        assert_eq!(pre.process("give bag \"rope\""), "put \"rope\" after bag");
    }

    #[test]
    fn macros_apply_in_order() {
        let mut pre = Preprocessor::new();
        pre.define("HP", "stats.hp");
        pre.pattern("heal $n", "inc HP by $n");
        // Single pass per line: pattern output is not re-scanned by the
        // earlier word macro.
        assert_eq!(pre.process("heal 3"), "inc HP by 3");
    }

    #[test]
    fn empty_preprocessor_is_identity() {
        let pre = Preprocessor::new();
        assert!(pre.is_empty());
        assert_eq!(pre.process("set a to 1\n"), "set a to 1\n");
    }
}
