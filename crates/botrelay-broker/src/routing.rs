//! Routing rules: subject key → Processor identity.
//!
//! Rules are keyed `user_<id>`, `group_<id>`, `bot_<id>` or a bare id.
//! Exact keys are checked first; patterns containing `*` are compiled with
//! `globset` and scanned in insertion order only when no exact key matched.
//! With overlapping wildcards the earliest inserted rule wins.

use std::collections::HashMap;

use botrelay_core::{Event, ProcessorId, RelayError, Result};
use botrelay_settings::RuleEntry;
use globset::{Glob, GlobMatcher};
use parking_lot::RwLock;

/// Outcome of [`RoutingRules::resolve_target`].
#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision<T> {
    /// A rule matched and its target is online.
    Matched(T),
    /// A rule matched but its target is not registered.
    TargetOffline(ProcessorId),
    /// No rule applies.
    NoRule,
}

struct WildcardRule {
    pattern: String,
    matcher: GlobMatcher,
    target: ProcessorId,
}

#[derive(Default)]
struct RuleSet {
    exact: HashMap<String, ProcessorId>,
    wildcards: Vec<WildcardRule>,
}

impl RuleSet {
    fn insert(&mut self, pattern: String, target: ProcessorId) -> Result<()> {
        if is_wildcard(&pattern) {
            let matcher = compile(&pattern)?;
            if let Some(rule) = self.wildcards.iter_mut().find(|r| r.pattern == pattern) {
                rule.matcher = matcher;
                rule.target = target;
            } else {
                self.wildcards.push(WildcardRule {
                    pattern,
                    matcher,
                    target,
                });
            }
        } else {
            let _ = self.exact.insert(pattern, target);
        }
        Ok(())
    }

    fn lookup(&self, candidates: &[String]) -> Option<&ProcessorId> {
        candidates
            .iter()
            .find_map(|key| self.exact.get(key))
            .or_else(|| {
                self.wildcards
                    .iter()
                    .find(|rule| candidates.iter().any(|key| rule.matcher.is_match(key)))
                    .map(|rule| &rule.target)
            })
    }
}

/// Shared routing-rule store.
///
/// Mutated by external callers; the broker only reads under the shared lock.
#[derive(Default)]
pub struct RoutingRules {
    inner: RwLock<RuleSet>,
}

impl RoutingRules {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from configured rules.
    pub fn from_entries(entries: &[RuleEntry]) -> Result<Self> {
        let rules = Self::new();
        rules.replace_all(entries.iter().map(|e| (e.pattern.clone(), e.target.clone())))?;
        Ok(rules)
    }

    /// Add or overwrite a rule.
    pub fn set(&self, pattern: impl Into<String>, target: impl Into<ProcessorId>) -> Result<()> {
        self.inner.write().insert(pattern.into(), target.into())
    }

    /// Remove a rule. Returns whether it existed.
    pub fn remove(&self, pattern: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.exact.remove(pattern).is_some() {
            return true;
        }
        let before = inner.wildcards.len();
        inner.wildcards.retain(|r| r.pattern != pattern);
        inner.wildcards.len() != before
    }

    /// Swap the whole rule set. Nothing changes if any pattern is invalid.
    pub fn replace_all<I, P, T>(&self, rules: I) -> Result<()>
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<String>,
        T: Into<ProcessorId>,
    {
        let mut next = RuleSet::default();
        for (pattern, target) in rules {
            next.insert(pattern.into(), target.into())?;
        }
        *self.inner.write() = next;
        Ok(())
    }

    /// Target for `event`, ignoring whether it is online.
    pub fn lookup(&self, event: &Event) -> Option<ProcessorId> {
        let candidates = candidate_keys(event);
        self.inner.read().lookup(&candidates).cloned()
    }

    /// Resolve a live target for `event`.
    ///
    /// `online` maps a rule target to its live connection, if any.
    pub fn resolve_target<T>(&self, event: &Event, online: impl FnOnce(&ProcessorId) -> Option<T>) -> RouteDecision<T> {
        match self.lookup(event) {
            None => RouteDecision::NoRule,
            Some(target) => match online(&target) {
                Some(conn) => RouteDecision::Matched(conn),
                None => RouteDecision::TargetOffline(target),
            },
        }
    }

    /// Rules as `(pattern, target)`: exact ones sorted, then wildcards in order.
    pub fn snapshot(&self) -> Vec<(String, ProcessorId)> {
        let inner = self.inner.read();
        let mut exact: Vec<_> = inner
            .exact
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        exact.sort();
        exact.extend(
            inner
                .wildcards
                .iter()
                .map(|r| (r.pattern.clone(), r.target.clone())),
        );
        exact
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.exact.len() + inner.wildcards.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rule keys to try for `event`, most specific subject first.
pub fn candidate_keys(event: &Event) -> Vec<String> {
    let mut keys = Vec::with_capacity(6);
    let subjects = [
        ("user_", event.user_id.as_deref()),
        ("group_", event.group_id.as_deref()),
        ("bot_", event.self_id.as_deref()),
    ];
    for (prefix, id) in subjects {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            keys.push(format!("{prefix}{id}"));
            keys.push(id.to_owned());
        }
    }
    keys
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|err| RelayError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: err.kind().to_string(),
        })
}
