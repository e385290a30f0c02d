//! DBATS-style key-pattern globs.
//!
//! The pattern language is similar to shell filename globbing, except that
//! hierarchical components are separated by `.` instead of `/`:
//!
//! - `*` matches any run of characters except `.`
//! - `?` matches any one character except `.`
//! - `[...]` matches any one character in the class (never `.`); a leading `^`
//!   negates the class, `a-z` ranges are allowed
//! - `{a,b,c}` matches any one string in the comma-separated list
//! - `(...)` is a capturing group used for aggregation grouping; groups must
//!   not nest
//! - `\x` removes the special meaning of a glob metacharacter
//! - any other character matches itself
//!
//! Translation produces a regex anchored at both ends whose capturing groups
//! correspond positionally to the pattern's parenthesized subexpressions.

use regex::Regex;

use crate::SentryError;

/// Characters that are special in the regex output and need escaping.
const RE_META: &str = ".^$*+?{}[]|()";

/// Characters that may legally follow a `\` escape in a glob.
const GLOB_META: &str = "*?{}[]()";

fn user(msg: impl Into<String>) -> SentryError {
    SentryError::user(msg.into())
}

/// Convert a key-pattern glob to an anchored regex string.
pub fn glob_to_regex(glob: &str) -> Result<String, SentryError> {
    let g: Vec<char> = glob.chars().collect();
    let mut regex = String::from("^");
    let mut i = 0;
    let mut parens = 0;
    while i < g.len() {
        match g[i] {
            '\\' => {
                i += 1;
                if i >= g.len() {
                    return Err(user("illegal trailing '\\' in pattern"));
                } else if !GLOB_META.contains(g[i]) {
                    return Err(user(format!("illegal escape '\\{}' in pattern", g[i])));
                }
                if RE_META.contains(g[i]) {
                    regex.push('\\');
                }
                regex.push(g[i]);
                i += 1;
            }
            '*' => {
                regex.push_str("[^.]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^.]");
                i += 1;
            }
            '[' => {
                regex.push('[');
                i += 1;
                if i < g.len() && g[i] == '^' {
                    // a negated class must also exclude the key separator
                    regex.push_str("^.");
                    i += 1;
                }
                loop {
                    if i >= g.len() {
                        return Err(user("unmatched '[' in pattern"));
                    }
                    if g[i] == '\\' && i + 1 < g.len() {
                        regex.push(g[i]);
                        regex.push(g[i + 1]);
                        i += 2;
                    } else {
                        regex.push(g[i]);
                        i += 1;
                        if g[i - 1] == ']' {
                            break;
                        }
                    }
                }
            }
            '{' => {
                // non-capturing alternation
                regex.push_str("(?:");
                i += 1;
                loop {
                    if i >= g.len() {
                        return Err(user("unmatched '{' in pattern"));
                    } else if g[i] == '\\' {
                        if i + 1 >= g.len() {
                            return Err(user("illegal trailing '\\' in pattern"));
                        }
                        regex.push(g[i]);
                        regex.push(g[i + 1]);
                        i += 2;
                    } else if g[i] == ',' {
                        regex.push('|');
                        i += 1;
                    } else if g[i] == '}' {
                        regex.push(')');
                        i += 1;
                        break;
                    } else if ".*{}[]()".contains(g[i]) {
                        return Err(user(format!(
                            "illegal character '{}' inside {{}} in pattern",
                            g[i]
                        )));
                    } else {
                        if RE_META.contains(g[i]) {
                            regex.push('\\');
                        }
                        regex.push(g[i]);
                        i += 1;
                    }
                }
            }
            '(' => {
                if parens > 0 {
                    return Err(user("illegal nested parentheses in pattern"));
                }
                parens += 1;
                regex.push('(');
                i += 1;
            }
            ')' if parens > 0 => {
                parens -= 1;
                regex.push(')');
                i += 1;
            }
            c => {
                if RE_META.contains(c) {
                    regex.push('\\');
                }
                regex.push(c);
                i += 1;
            }
        }
    }
    if parens > 0 {
        return Err(user("unmatched '(' in pattern"));
    }
    regex.push('$');
    Ok(regex)
}

/// Translate and compile a glob in one step.
pub fn compile(glob: &str) -> Result<Regex, SentryError> {
    let regex = glob_to_regex(glob)?;
    Regex::new(&regex).map_err(|e| user(format!("bad pattern '{glob}': {e}")))
}

/// A glob pre-split around its `(...)` groups, used to synthesize output keys.
///
/// Rendering substitutes each captured substring, in order, for the
/// corresponding parenthesized span; all other pattern text (including glob
/// metacharacters) is carried into the output verbatim.
#[derive(Debug, Clone)]
pub struct GroupTemplate {
    /// Literal chunks between group spans; always one more than the group count
    parts: Vec<String>,
}

impl GroupTemplate {
    /// Split a glob around its capturing groups.
    ///
    /// Expects a glob already accepted by [`glob_to_regex`]; malformed input
    /// still reports a user error.
    pub fn parse(glob: &str) -> Result<Self, SentryError> {
        let g: Vec<char> = glob.chars().collect();
        let mut parts = Vec::new();
        let mut chunk = String::new();
        let mut i = 0;
        let mut in_group = false;
        while i < g.len() {
            match g[i] {
                '\\' => {
                    if i + 1 >= g.len() {
                        return Err(user("illegal trailing '\\' in pattern"));
                    }
                    if !in_group {
                        chunk.push(g[i]);
                        chunk.push(g[i + 1]);
                    }
                    i += 2;
                }
                '(' => {
                    if in_group {
                        return Err(user("illegal nested parentheses in pattern"));
                    }
                    in_group = true;
                    i += 1;
                }
                ')' if in_group => {
                    in_group = false;
                    parts.push(std::mem::take(&mut chunk));
                    i += 1;
                }
                c => {
                    if !in_group {
                        chunk.push(c);
                    }
                    i += 1;
                }
            }
        }
        if in_group {
            return Err(user("unmatched '(' in pattern"));
        }
        parts.push(chunk);
        Ok(Self { parts })
    }

    /// Number of capturing groups in the pattern.
    pub fn group_count(&self) -> usize {
        self.parts.len() - 1
    }

    /// Substitute captured substrings into the pattern's group positions.
    pub fn render(&self, captured: &[&str]) -> String {
        let mut out = String::with_capacity(self.parts.iter().map(String::len).sum());
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push_str(captured.get(i - 1).copied().unwrap_or(""));
            }
            out.push_str(part);
        }
        out
    }
}
