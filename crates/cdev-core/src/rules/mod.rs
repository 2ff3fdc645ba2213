//! The rules engine.
//!
//! Both daemons consume compiled [`RuleSet`]s; the grammar is shared and a
//! [`Dialect`] selects which names are legal. The host's filter dialect
//! decides whether an event is forwarded to a container and with what side
//! effects; the agent's client dialect decides how a device node is
//! materialized.
//!
//! Evaluation is infallible and cooperative: [`RuleSet::apply`] yields to
//! the scheduler between rules, so callers can bound a pathological ruleset
//! with an ordinary timeout and keep whatever the context accumulated up to
//! the cancellation point.

mod glob;
mod parse;

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;

use crate::device::{DeviceRegistry, SharedDevice, SyncSelector};

pub use glob::GlobError;
pub use parse::{load_rules_dir, parse_file, parse_str, RulesError};

/// Where an event entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Generated from walking sysfs (boot/shutdown replay).
    Sys,
    /// From the udev netlink multicast group.
    Udev,
    /// From the kernel netlink multicast group.
    Kernel,
}

impl EventSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sys => "sys",
            Self::Udev => "udev",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State components a filter ruleset may forward across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Forward {
    /// The udev environment overlay.
    Env,
    /// The tag set.
    Tags,
}

/// Options on an emit directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EmitOption {
    /// Defer the secondary event through the client's work queue.
    Queue,
    /// Strip the environment overlay from the secondary event.
    NoEnv,
}

/// A request for a secondary synthetic event, set by
/// `ACTION{[options::]what} += "action"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitDirective {
    /// Subpath below the current device's syspath; `None`, `""` and `"."`
    /// all mean "the current device".
    pub what: Option<String>,
    /// Action of the secondary event.
    pub action: String,
    /// Emit options.
    pub options: BTreeSet<EmitOption>,
}

/// Per-event rule execution context: one explicit record carrying every
/// field either dialect may touch.
#[derive(Debug)]
pub struct RuleContext {
    /// The target device.
    pub device: SharedDevice,
    /// Event action (`add`, `remove`, ...).
    pub action: String,
    /// Where the event came from.
    pub source: EventSource,
    /// Whether the event survives filtering. Starts true; a rule may drop
    /// the event by clearing it.
    pub result: bool,
    /// Device-node owner override (client dialect).
    pub user: Option<String>,
    /// Device-node group override (client dialect).
    pub group: Option<String>,
    /// Device-node mode override (client dialect).
    pub mode: Option<u32>,
    /// Cgroup controllers to update (filter dialect).
    pub cgroups: BTreeSet<String>,
    /// State components to ship with the event (filter dialect).
    pub forward: BTreeSet<Forward>,
    /// Pending secondary event (filter dialect).
    pub emit: Option<EmitDirective>,
    /// Devices whose mutable state was touched and must be flushed.
    pub modified: Vec<SharedDevice>,
    /// Set when a `TARGET=` assignment ends the ruleset early.
    done: bool,
}

impl RuleContext {
    /// Fresh context for one event. `result` starts true and `forward`
    /// defaults to the environment component.
    #[must_use]
    pub fn new(device: SharedDevice, action: impl Into<String>, source: EventSource) -> Self {
        Self {
            device,
            action: action.into(),
            source,
            result: true,
            user: None,
            group: None,
            mode: None,
            cgroups: BTreeSet::new(),
            forward: BTreeSet::from([Forward::Env]),
            emit: None,
            modified: Vec::new(),
            done: false,
        }
    }

    /// The sync selector implied by the forward set.
    #[must_use]
    pub fn forward_selector(&self) -> SyncSelector {
        SyncSelector {
            env: self.forward.contains(&Forward::Env),
            tags: self.forward.contains(&Forward::Tags),
        }
    }

    fn device_modified(&mut self, dev: &SharedDevice) {
        if !self.modified.iter().any(|d| std::sync::Arc::ptr_eq(d, dev)) {
            self.modified.push(std::sync::Arc::clone(dev));
        }
    }
}

/// Which rule vocabulary a file is parsed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Host-side forwarding decisions (`TARGET`, `CGROUP`, `FORWARD`, ...).
    Filter,
    /// Container-side node policy (`USER`, `MODE`, `SYMLINK`, ...).
    Client,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchOp {
    /// `==` — glob match.
    Glob,
    /// `!=` — glob mismatch.
    NotGlob,
    /// `===` — string equality.
    Eq,
    /// `!==` — string inequality.
    NotEq,
    /// `~=` — regex search.
    Regex,
    /// `!~` — regex non-match.
    NotRegex,
}

/// Assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetOp {
    /// `=` — replace.
    Assign,
    /// `+=` — extend.
    Extend,
    /// `-=` — subtract.
    Subtract,
}

#[derive(Debug)]
pub(crate) enum Matcher {
    Literal(String),
    Pattern(Regex),
}

/// What a condition's left-hand side reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConditionKey {
    Action,
    Source,
    /// A device property (with environment fallback): `KERNEL`,
    /// `SUBSYSTEM`, `DRIVER`.
    Property(String),
    /// Same, matched against the device and all of its parents.
    PropertyTree(String),
    Env(String),
    EnvTree(String),
    Attr(String),
    AttrTree(String),
}

#[derive(Debug)]
pub(crate) struct Condition {
    pub(crate) key: ConditionKey,
    pub(crate) op: MatchOp,
    pub(crate) matcher: Matcher,
}

impl Condition {
    fn check(&self, lvalue: Option<&str>) -> bool {
        match (&self.op, &self.matcher) {
            (MatchOp::Eq, Matcher::Literal(lit)) => lvalue == Some(lit.as_str()),
            (MatchOp::NotEq, Matcher::Literal(lit)) => lvalue != Some(lit.as_str()),
            (MatchOp::Glob | MatchOp::Regex, Matcher::Pattern(re)) => {
                lvalue.is_some_and(|v| re.is_match(v))
            }
            (MatchOp::NotGlob | MatchOp::NotRegex, Matcher::Pattern(re)) => {
                lvalue.map_or(true, |v| !re.is_match(v))
            }
            // The parser pairs operators and matchers; other combinations
            // cannot be constructed.
            _ => false,
        }
    }

    fn device_lvalue(&self, dev: &SharedDevice) -> Option<String> {
        match &self.key {
            ConditionKey::Property(name) | ConditionKey::PropertyTree(name) => {
                let dev = dev.read().unwrap_or_else(|e| e.into_inner());
                dev.get(name).map(ToString::to_string)
            }
            ConditionKey::Env(key) | ConditionKey::EnvTree(key) => {
                let dev = dev.read().unwrap_or_else(|e| e.into_inner());
                dev.environment().get(key).cloned()
            }
            ConditionKey::Attr(name) | ConditionKey::AttrTree(name) => {
                let mut dev = dev.write().unwrap_or_else(|e| e.into_inner());
                dev.sysattr(name)
            }
            ConditionKey::Action | ConditionKey::Source => None,
        }
    }

    fn matches(&self, ctx: &RuleContext, registry: &DeviceRegistry) -> bool {
        match &self.key {
            ConditionKey::Action => self.check(Some(&ctx.action)),
            ConditionKey::Source => self.check(Some(ctx.source.as_str())),
            ConditionKey::Property(_) | ConditionKey::Env(_) | ConditionKey::Attr(_) => {
                self.check(self.device_lvalue(&ctx.device).as_deref())
            }
            ConditionKey::PropertyTree(_)
            | ConditionKey::EnvTree(_)
            | ConditionKey::AttrTree(_) => {
                // Match against the whole hierarchy.
                let mut current = std::sync::Arc::clone(&ctx.device);
                loop {
                    if self.check(self.device_lvalue(&current).as_deref()) {
                        return true;
                    }
                    let parent = {
                        let dev = current.read().unwrap_or_else(|e| e.into_inner());
                        registry.parent_of(&dev)
                    };
                    match parent {
                        Some(parent) => current = parent,
                        None => return false,
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum Assignment {
    /// `TARGET` — the filter verdict. `=` ends the ruleset, `+=` continues.
    Target { stop: bool, allow: bool },
    /// `CGROUP` — request a cgroup controller update.
    CGroup(String),
    /// `FORWARD` — adjust the state components shipped with the event.
    Forward { op: SetOp, value: Forward },
    /// `ACTION{...} +=` — request a secondary event.
    Emit(EmitDirective),
    User(String),
    Group(String),
    Mode(u32),
    /// `ENV{K} =` — write the device's environment overlay.
    DeviceEnv { key: String, value: String },
    Tag { op: SetOp, value: String },
    Symlink { op: SetOp, value: String },
}

impl Assignment {
    fn apply(&self, ctx: &mut RuleContext) {
        match self {
            Self::Target { stop, allow } => {
                ctx.result = *allow;
                if *stop {
                    ctx.done = true;
                }
            }
            Self::CGroup(name) => {
                ctx.cgroups.insert(name.clone());
            }
            Self::Forward { op, value } => match op {
                SetOp::Assign => {
                    ctx.forward.clear();
                    ctx.forward.insert(*value);
                }
                SetOp::Extend => {
                    ctx.forward.insert(*value);
                }
                SetOp::Subtract => {
                    ctx.forward.remove(value);
                }
            },
            Self::Emit(directive) => ctx.emit = Some(directive.clone()),
            Self::User(user) => ctx.user = Some(user.clone()),
            Self::Group(group) => ctx.group = Some(group.clone()),
            Self::Mode(mode) => ctx.mode = Some(*mode),
            Self::DeviceEnv { key, value } => {
                {
                    let mut dev = ctx.device.write().unwrap_or_else(|e| e.into_inner());
                    dev.environment_mut().insert(key.clone(), value.clone());
                }
                let device = std::sync::Arc::clone(&ctx.device);
                ctx.device_modified(&device);
            }
            Self::Tag { op, value } => {
                {
                    let mut dev = ctx.device.write().unwrap_or_else(|e| e.into_inner());
                    apply_set_op(dev.tags_mut(), *op, value);
                }
                let device = std::sync::Arc::clone(&ctx.device);
                ctx.device_modified(&device);
            }
            Self::Symlink { op, value } => {
                {
                    let mut dev = ctx.device.write().unwrap_or_else(|e| e.into_inner());
                    apply_set_op(dev.devlinks_mut(), *op, value);
                }
                let device = std::sync::Arc::clone(&ctx.device);
                ctx.device_modified(&device);
            }
        }
    }
}

fn apply_set_op(set: &mut BTreeSet<String>, op: SetOp, value: &str) {
    match op {
        SetOp::Assign => {
            set.clear();
            set.insert(value.to_string());
        }
        SetOp::Extend => {
            set.insert(value.to_string());
        }
        SetOp::Subtract => {
            set.remove(value);
        }
    }
}

#[derive(Debug)]
pub(crate) enum Clause {
    Condition(Condition),
    Assignment(Assignment),
}

/// One rule: a conjunction of conditions and assignments, applied left to
/// right. The first failing condition ends the rule.
#[derive(Debug)]
pub struct Rule {
    pub(crate) clauses: Vec<Clause>,
    pub(crate) line: usize,
}

impl Rule {
    fn apply(&self, ctx: &mut RuleContext, registry: &DeviceRegistry) {
        for clause in &self.clauses {
            match clause {
                Clause::Condition(cond) => {
                    if !cond.matches(ctx, registry) {
                        tracing::trace!(line = self.line, "rule condition failed");
                        return;
                    }
                }
                Clause::Assignment(assignment) => assignment.apply(ctx),
            }
        }
    }
}

/// A compiled rules file.
#[derive(Debug)]
pub struct RuleSet {
    /// Name for diagnostics, normally the file path.
    pub name: String,
    pub(crate) rules: Vec<Rule>,
}

impl RuleSet {
    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule to the context, in order. Yields to the scheduler
    /// between rules so the caller can wrap the call in a timeout; on
    /// cancellation the context keeps everything applied so far.
    pub async fn apply(&self, ctx: &mut RuleContext, registry: &DeviceRegistry) {
        ctx.done = false;
        for rule in &self.rules {
            rule.apply(ctx, registry);
            if ctx.done {
                break;
            }
            tokio::task::yield_now().await;
        }
        ctx.done = false;
    }
}
