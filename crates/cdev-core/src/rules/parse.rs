//! Rules file parsing.
//!
//! A rules file holds one rule per line; a rule is a comma-separated list
//! of clauses `NAME{arg} OP "value"`. Lines starting with `#` and blank
//! lines are skipped. Operators: `=` `+=` `-=` assign, `==` `!=` glob
//! match, `===` `!==` string compare, `~=` `!~` regex search.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::{
    glob, Assignment, Clause, Condition, ConditionKey, Dialect, EmitDirective, EmitOption,
    Forward, MatchOp, Matcher, Rule, RuleSet, SetOp,
};

/// Errors from rules loading.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    /// A clause failed to parse.
    #[error("{file}:{line}: {msg}")]
    Syntax {
        /// File the error occurred in.
        file: String,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        msg: String,
    },

    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The expression for one clause.
static CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*([A-Za-z_][A-Za-z0-9_-]*)(?:\{([^}]*)\})?\s*(===|!==|==|!=|~=|!~|\+=|-=|=)\s*"([^"]*)"\s*$"#,
    )
    .unwrap()
});

/// Split a rule line into clauses on commas outside quoted values.
fn split_clauses(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

/// Parse rules from a string. `name` is used in diagnostics.
pub fn parse_str(name: &str, content: &str, dialect: Dialect) -> Result<RuleSet, RulesError> {
    let mut rules = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut clauses = Vec::new();
        for part in split_clauses(line) {
            let caps = CLAUSE_RE.captures(part).ok_or_else(|| RulesError::Syntax {
                file: name.to_string(),
                line: lineno,
                msg: format!("could not parse clause {part:?}"),
            })?;

            let clause = build_clause(
                dialect,
                &caps[1],
                caps.get(2).map(|m| m.as_str()),
                &caps[3],
                &caps[4],
            )
            .map_err(|msg| RulesError::Syntax {
                file: name.to_string(),
                line: lineno,
                msg,
            })?;
            clauses.push(clause);
        }

        if !clauses.is_empty() {
            rules.push(Rule {
                clauses,
                line: lineno,
            });
        }
    }

    Ok(RuleSet {
        name: name.to_string(),
        rules,
    })
}

/// Parse one rules file.
pub fn parse_file(path: &Path, dialect: Dialect) -> Result<RuleSet, RulesError> {
    let content = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&path.display().to_string(), &content, dialect)
}

/// Load every file in a rules directory in lexical order. Files that fail
/// to parse are logged and excluded; a missing directory yields an empty
/// preset.
pub fn load_rules_dir(dir: &Path, dialect: Dialect) -> Vec<RuleSet> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "could not open rules directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut presets = Vec::new();
    for path in paths {
        match parse_file(&path, dialect) {
            Ok(ruleset) => presets.push(ruleset),
            Err(err) => warn!(%err, "skipping unparsable rules file"),
        }
    }
    presets
}

fn is_condition_name(dialect: Dialect, name: &str) -> bool {
    matches!(
        name,
        "ACTION" | "KERNEL" | "SUBSYSTEM" | "DRIVER" | "KERNELS" | "SUBSYSTEMS" | "DRIVERS"
            | "ENV" | "ENVS" | "ATTR" | "ATTRS"
    ) || (dialect == Dialect::Filter && name == "SOURCE")
}

fn is_assignment_name(dialect: Dialect, name: &str) -> bool {
    match dialect {
        Dialect::Filter => matches!(name, "TARGET" | "CGROUP" | "FORWARD" | "ACTION"),
        Dialect::Client => matches!(name, "USER" | "GROUP" | "MODE" | "ENV" | "TAG" | "SYMLINK"),
    }
}

fn build_clause(
    dialect: Dialect,
    name: &str,
    arg: Option<&str>,
    op: &str,
    value: &str,
) -> Result<Clause, String> {
    match op {
        "=" => build_assignment(dialect, name, arg, SetOp::Assign, value),
        "+=" => build_assignment(dialect, name, arg, SetOp::Extend, value),
        "-=" => build_assignment(dialect, name, arg, SetOp::Subtract, value),
        _ => {
            let op = match op {
                "==" => MatchOp::Glob,
                "!=" => MatchOp::NotGlob,
                "===" => MatchOp::Eq,
                "!==" => MatchOp::NotEq,
                "~=" => MatchOp::Regex,
                "!~" => MatchOp::NotRegex,
                other => return Err(format!("unknown operator {other:?}")),
            };
            build_condition(dialect, name, arg, op, value)
        }
    }
}

fn no_arg(name: &str, arg: Option<&str>) -> Result<(), String> {
    if arg.is_some() {
        return Err(format!("{name} takes no argument"));
    }
    Ok(())
}

fn build_condition(
    dialect: Dialect,
    name: &str,
    arg: Option<&str>,
    op: MatchOp,
    value: &str,
) -> Result<Clause, String> {
    let key = match name {
        "ACTION" => {
            no_arg(name, arg)?;
            ConditionKey::Action
        }
        "SOURCE" if dialect == Dialect::Filter => {
            no_arg(name, arg)?;
            ConditionKey::Source
        }
        "KERNEL" | "SUBSYSTEM" | "DRIVER" => {
            no_arg(name, arg)?;
            ConditionKey::Property(name.to_string())
        }
        "KERNELS" | "SUBSYSTEMS" | "DRIVERS" => {
            no_arg(name, arg)?;
            // Matched against the hierarchy under the singular name.
            ConditionKey::PropertyTree(name[..name.len() - 1].to_string())
        }
        "ENV" => ConditionKey::Env(require_arg(name, arg)?),
        "ENVS" => ConditionKey::EnvTree(require_arg(name, arg)?),
        "ATTR" => ConditionKey::Attr(require_arg(name, arg)?),
        "ATTRS" => ConditionKey::AttrTree(require_arg(name, arg)?),
        other if is_assignment_name(dialect, other) => {
            return Err(format!("cannot match against {other}"));
        }
        other => return Err(format!("unknown name {other}")),
    };

    let matcher = match op {
        MatchOp::Eq | MatchOp::NotEq => Matcher::Literal(value.to_string()),
        MatchOp::Glob | MatchOp::NotGlob => Matcher::Pattern(
            glob::compile(value).map_err(|e| format!("bad pattern {value:?}: {e}"))?,
        ),
        MatchOp::Regex | MatchOp::NotRegex => Matcher::Pattern(
            Regex::new(value).map_err(|e| format!("bad regex {value:?}: {e}"))?,
        ),
    };

    Ok(Clause::Condition(Condition { key, op, matcher }))
}

fn require_arg(name: &str, arg: Option<&str>) -> Result<String, String> {
    arg.filter(|a| !a.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| format!("{name} expects an argument"))
}

fn build_assignment(
    dialect: Dialect,
    name: &str,
    arg: Option<&str>,
    op: SetOp,
    value: &str,
) -> Result<Clause, String> {
    let assignment = match (dialect, name) {
        (Dialect::Filter, "TARGET") => {
            no_arg(name, arg)?;
            let allow = match value.to_ascii_lowercase().as_str() {
                "allow" => true,
                "deny" => false,
                other => return Err(format!("unknown TARGET {other:?}")),
            };
            match op {
                SetOp::Assign => Assignment::Target { stop: true, allow },
                SetOp::Extend => Assignment::Target { stop: false, allow },
                SetOp::Subtract => {
                    return Err("can only assign (=) or extend (+=) TARGET".into());
                }
            }
        }
        (Dialect::Filter, "CGROUP") => {
            no_arg(name, arg)?;
            if op != SetOp::Assign {
                return Err("can only assign (=) to CGROUP".into());
            }
            if value.is_empty() {
                return Err("CGROUP needs a controller name".into());
            }
            Assignment::CGroup(value.to_ascii_lowercase())
        }
        (Dialect::Filter, "FORWARD") => {
            no_arg(name, arg)?;
            let forward = match value.to_ascii_lowercase().as_str() {
                "env" => Forward::Env,
                "tags" => Forward::Tags,
                other => return Err(format!("unknown value for FORWARD: {other}")),
            };
            Assignment::Forward { op, value: forward }
        }
        (Dialect::Filter, "ACTION") => {
            if op != SetOp::Extend {
                return Err("ACTION can only be extended (+=)".into());
            }
            Assignment::Emit(parse_emit(arg, value)?)
        }
        (Dialect::Client, "USER") => {
            no_arg(name, arg)?;
            require_plain_assign(name, op)?;
            Assignment::User(value.to_string())
        }
        (Dialect::Client, "GROUP") => {
            no_arg(name, arg)?;
            require_plain_assign(name, op)?;
            Assignment::Group(value.to_string())
        }
        (Dialect::Client, "MODE") => {
            no_arg(name, arg)?;
            require_plain_assign(name, op)?;
            let mode = u32::from_str_radix(value, 8)
                .map_err(|_| "MODE must be an octal integral number".to_string())?;
            Assignment::Mode(mode)
        }
        (Dialect::Client, "ENV") => {
            require_plain_assign(name, op)?;
            Assignment::DeviceEnv {
                key: require_arg(name, arg)?,
                value: value.to_string(),
            }
        }
        (Dialect::Client, "TAG") => {
            no_arg(name, arg)?;
            Assignment::Tag {
                op,
                value: value.to_string(),
            }
        }
        (Dialect::Client, "SYMLINK") => {
            no_arg(name, arg)?;
            Assignment::Symlink {
                op,
                value: value.to_string(),
            }
        }
        (_, other) if is_condition_name(dialect, other) => {
            return Err(format!("cannot assign to {other}"));
        }
        (_, other) => return Err(format!("unknown name {other}")),
    };

    Ok(Clause::Assignment(assignment))
}

fn require_plain_assign(name: &str, op: SetOp) -> Result<(), String> {
    if op == SetOp::Assign {
        Ok(())
    } else {
        Err(format!("can only assign (=) to {name}"))
    }
}

/// Parse the argument of an emit directive: `what` or `options::what`,
/// options separated by `:`.
fn parse_emit(arg: Option<&str>, action: &str) -> Result<EmitDirective, String> {
    let (options, what) = match arg {
        None => (BTreeSet::new(), None),
        Some(arg) => match arg.split_once("::") {
            Some((opts, what)) => {
                let mut options = BTreeSet::new();
                for opt in opts.split(':').filter(|o| !o.is_empty()) {
                    match opt.to_ascii_lowercase().as_str() {
                        "queue" => options.insert(EmitOption::Queue),
                        "noenv" => options.insert(EmitOption::NoEnv),
                        other => return Err(format!("unknown emit option {other:?}")),
                    };
                }
                (options, Some(what.to_string()))
            }
            None => (BTreeSet::new(), Some(arg.to_string())),
        },
    };

    Ok(EmitDirective {
        what,
        action: action.to_string(),
        options,
    })
}
