//! Glob-to-regex translation for rule match patterns.
//!
//! Recognized syntax:
//!
//! - `*` — any characters, zero or more
//! - `+` — any characters, one or more
//! - `?` — exactly one character
//! - `[...]` / `[^...]` / `[!...]` — character groups, ranges allowed
//! - `{a,b,...}` — alternation of arbitrary sub-expressions, nestable
//! - `a|b` — top-level alternation
//! - `\x` — strip any special meaning from `x`
//!
//! Different from Bourne-shell globbing, a pattern compiles down to a
//! single anchored regular expression; `{a,b}*` matched against
//! `["a.txt", "d.txt"]` yields `["a.txt"]`, which is the desirable outcome
//! in a rules file anyway.

use regex::Regex;

/// Errors from pattern translation.
#[derive(Debug, thiserror::Error)]
pub enum GlobError {
    /// `[` without a closing `]`, or a stray `]`.
    #[error("unbalanced brackets at column {0}")]
    UnbalancedBracket(usize),

    /// `{` without a closing `}`, or a stray `}`.
    #[error("unbalanced braces at column {0}")]
    UnbalancedBrace(usize),

    /// Pattern ends in the middle of an escape.
    #[error("pattern ends with a dangling escape")]
    TrailingEscape,

    /// The translated expression failed to compile (pathological input).
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

fn push_literal(out: &mut String, c: char) {
    if ".^$*+?()[]{}|\\".contains(c) {
        out.push('\\');
    }
    out.push(c);
}

/// Translate a glob pattern into an anchored regular expression.
pub fn translate(pattern: &str) -> Result<String, GlobError> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("^(?:");

    let mut escaped = false;
    let mut in_class = false;
    let mut class_start = false;
    let mut brace_depth = 0usize;
    let mut last_open_bracket = 0;
    let mut last_open_brace = 0;

    for (column, c) in pattern.char_indices() {
        if escaped {
            if in_class {
                if "\\]^[".contains(c) {
                    out.push('\\');
                }
                out.push(c);
            } else {
                push_literal(&mut out, c);
            }
            escaped = false;
            continue;
        }

        if c == '\\' {
            escaped = true;
            continue;
        }

        if in_class {
            if class_start {
                if c == '^' || c == '!' {
                    out.push('^');
                } else {
                    if "\\]^[".contains(c) {
                        out.push('\\');
                    }
                    out.push(c);
                }
                class_start = false;
            } else if c == ']' {
                out.push(']');
                in_class = false;
            } else {
                if "\\^[".contains(c) {
                    out.push('\\');
                }
                out.push(c);
            }
            continue;
        }

        match c {
            '[' => {
                in_class = true;
                class_start = true;
                last_open_bracket = column;
                out.push('[');
            }
            ']' => return Err(GlobError::UnbalancedBracket(column)),
            '{' => {
                brace_depth += 1;
                last_open_brace = column;
                out.push_str("(?:");
            }
            '}' => {
                if brace_depth == 0 {
                    return Err(GlobError::UnbalancedBrace(column));
                }
                brace_depth -= 1;
                out.push(')');
            }
            ',' if brace_depth > 0 => out.push('|'),
            '|' => out.push('|'),
            '*' => out.push_str(".*"),
            '+' => out.push_str(".+"),
            '?' => out.push('.'),
            other => push_literal(&mut out, other),
        }
    }

    if escaped {
        return Err(GlobError::TrailingEscape);
    }
    if in_class {
        return Err(GlobError::UnbalancedBracket(last_open_bracket));
    }
    if brace_depth > 0 {
        return Err(GlobError::UnbalancedBrace(last_open_brace));
    }

    out.push_str(")$");
    Ok(out)
}

/// Compile a glob pattern to an anchored [`Regex`].
pub fn compile(pattern: &str) -> Result<Regex, GlobError> {
    Ok(Regex::new(&translate(pattern)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, input: &str) -> bool {
        compile(pattern).unwrap().is_match(input)
    }

    #[test]
    fn star_and_question_mark() {
        assert!(matches("sd*", "sda"));
        assert!(matches("sd*", "sd"));
        assert!(!matches("sd+", "sd"));
        assert!(matches("sd?", "sda"));
        assert!(!matches("sd?", "sda1"));
        assert!(!matches("sd?", "sd"));
    }

    #[test]
    fn matches_are_anchored() {
        assert!(!matches("sda", "XsdaX"));
        assert!(!matches("sd*", "asda"));
    }

    #[test]
    fn character_groups() {
        assert!(matches("sd[a-c]", "sdb"));
        assert!(!matches("sd[a-c]", "sdd"));
        assert!(matches("sd[^a-c]", "sdd"));
        assert!(matches("sd[!a-c]", "sdd"));
        assert!(!matches("sd[!a-c]", "sda"));
    }

    #[test]
    fn brace_alternation() {
        assert!(matches("{sda,sdb}1", "sda1"));
        assert!(matches("{sda,sdb}1", "sdb1"));
        assert!(!matches("{sda,sdb}1", "sdc1"));
        assert!(matches("card{0,1{0,1}}", "card11"));
    }

    #[test]
    fn top_level_alternation() {
        assert!(matches("sda|sdb", "sdb"));
        assert!(!matches("sda|sdb", "sdab"));
    }

    #[test]
    fn escapes_strip_special_meaning() {
        assert!(matches(r"a\*b", "a*b"));
        assert!(!matches(r"a\*b", "aXb"));
        assert!(matches(r"a\|b", "a|b"));
        assert!(matches(r"100\+", "100+"));
    }

    #[test]
    fn literal_regex_metacharacters_are_quoted() {
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "aXb"));
        assert!(matches("ttyS0(new)", "ttyS0(new)"));
    }

    #[test]
    fn commas_outside_braces_are_literal() {
        assert!(matches("a,b", "a,b"));
    }

    #[test]
    fn unbalanced_patterns_are_rejected() {
        assert!(matches!(translate("a[bc"), Err(GlobError::UnbalancedBracket(1))));
        assert!(matches!(translate("a]bc"), Err(GlobError::UnbalancedBracket(1))));
        assert!(matches!(translate("a{b,c"), Err(GlobError::UnbalancedBrace(1))));
        assert!(matches!(translate("ab}c"), Err(GlobError::UnbalancedBrace(2))));
        assert!(matches!(translate("ab\\"), Err(GlobError::TrailingEscape)));
    }
}
