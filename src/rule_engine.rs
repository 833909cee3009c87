//! Component F: the rule engine.
//!
//! Pure and synchronously testable by design (§4.F/§8 property 4): given a snapshot of the
//! enabled rule set, [`RuleEngine::resolve`] is a deterministic function of `(instance_id,
//! chat_name)`. The engine itself only owns the cache and the refresh-on-signal wiring;
//! resolution logic lives in a free function so it can be proptested without any lock.

use regex::Regex;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain_types::{ChatName, ErrorKind, InstanceId, PlatformId, Priority, RuleId};
use crate::storage::RuleRow;

/// Failures raised while compiling or resolving rules.
#[derive(Debug, Error)]
pub enum RuleEngineError {
    /// A rule's `chat_pattern` declared `regex:` but the expression does not compile.
    #[error("invalid regex pattern in rule {rule_id}: {source}")]
    InvalidPattern {
        /// The offending rule.
        rule_id: RuleId,
        /// Why `regex::Regex::new` rejected it.
        #[source]
        source: regex::Error,
    },
}

impl RuleEngineError {
    /// All rule engine failures are configuration errors: a rule was authored badly.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigError
    }
}

/// How specifically a rule's pattern pins down a chat name, used as the priority tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Specificity {
    Wildcard,
    Regex,
    Literal,
}

/// A rule with its `chat_pattern` pre-parsed, so matching never re-parses per call.
#[derive(Debug, Clone)]
struct CompiledRule {
    rule_id: RuleId,
    instance_scope: String,
    platform_id: PlatformId,
    priority: Priority,
    only_at_messages: bool,
    matcher: Matcher,
    specificity: Specificity,
}

#[derive(Debug, Clone)]
enum Matcher {
    Wildcard,
    Regex(std::sync::Arc<Regex>),
    Literal(String),
}

impl CompiledRule {
    fn compile(row: &RuleRow) -> Result<Self, RuleEngineError> {
        let (matcher, specificity) = if row.chat_pattern == "*" {
            (Matcher::Wildcard, Specificity::Wildcard)
        } else if let Some(expr) = row.chat_pattern.strip_prefix("regex:") {
            let regex = Regex::new(expr).map_err(|source| RuleEngineError::InvalidPattern {
                rule_id: row.rule_id,
                source,
            })?;
            (Matcher::Regex(std::sync::Arc::new(regex)), Specificity::Regex)
        } else {
            (Matcher::Literal(row.chat_pattern.clone()), Specificity::Literal)
        };

        Ok(Self {
            rule_id: row.rule_id,
            instance_scope: row.instance_scope.clone(),
            platform_id: row.platform_id,
            priority: row.priority,
            only_at_messages: row.only_at_messages,
            matcher,
            specificity,
        })
    }

    fn in_scope(&self, instance_id: &InstanceId) -> bool {
        self.instance_scope == "*" || self.instance_scope == instance_id.as_ref()
    }

    fn matches(&self, chat_name: &ChatName) -> bool {
        match &self.matcher {
            Matcher::Wildcard => true,
            Matcher::Regex(re) => re.is_match(chat_name.as_ref()),
            Matcher::Literal(literal) => literal == chat_name.as_ref(),
        }
    }
}

/// The outcome of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRule {
    /// The winning rule's id.
    pub rule_id: RuleId,
    /// The platform it routes to.
    pub platform_id: PlatformId,
    /// Whether the rule restricts itself to @-mention messages (left to the dispatcher or a
    /// future caller to honor; the engine itself does not filter on message content).
    pub only_at_messages: bool,
}

/// Conservatively reports whether two rule rows could both match some `(instance_id,
/// chat_name)` pair. Per §9's open question, this is the conservative check the source also
/// used: a `regex:` pattern is assumed to overlap with anything rather than computing true
/// regex-language intersection. Literal patterns only overlap on exact equality, and a
/// wildcard overlaps with everything. Used at rule-creation time to warn operators of
/// potentially ambiguous rule sets; it never rejects a rule.
#[must_use]
pub fn patterns_may_conflict(a: &RuleRow, b: &RuleRow) -> bool {
    let scopes_overlap =
        a.instance_scope == "*" || b.instance_scope == "*" || a.instance_scope == b.instance_scope;
    if !scopes_overlap {
        return false;
    }

    match (pattern_specificity(&a.chat_pattern), pattern_specificity(&b.chat_pattern)) {
        (Specificity::Literal, Specificity::Literal) => a.chat_pattern == b.chat_pattern,
        _ => true,
    }
}

fn pattern_specificity(pattern: &str) -> Specificity {
    if pattern == "*" {
        Specificity::Wildcard
    } else if pattern.starts_with("regex:") {
        Specificity::Regex
    } else {
        Specificity::Literal
    }
}

/// Finds every enabled rule in `existing` whose scope and pattern conservatively overlap with
/// `candidate`, excluding `candidate` itself by id. Callers (the management HTTP surface) log
/// the result as a warning rather than refusing the write, matching §9's recorded decision.
#[must_use]
pub fn find_conflicts(existing: &[RuleRow], candidate: &RuleRow) -> Vec<RuleId> {
    existing
        .iter()
        .filter(|other| other.rule_id != candidate.rule_id && patterns_may_conflict(other, candidate))
        .map(|other| other.rule_id)
        .collect()
}

/// Ranks and returns the highest-priority matching rule for `(instance_id, chat_name)`, or
/// `None` if no enabled rule's scope and pattern both match. Pure: given the same `rules`
/// slice and inputs, always returns the same answer (§8 property 4).
#[must_use]
fn resolve_against(
    rules: &[CompiledRule],
    instance_id: &InstanceId,
    chat_name: &ChatName,
) -> Option<ResolvedRule> {
    rules
        .iter()
        .filter(|r| r.in_scope(instance_id) && r.matches(chat_name))
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.specificity.cmp(&b.specificity))
                .then(b.rule_id.cmp(&a.rule_id))
        })
        .map(|r| ResolvedRule {
            rule_id: r.rule_id,
            platform_id: r.platform_id,
            only_at_messages: r.only_at_messages,
        })
}

/// Caches the compiled, enabled rule set and answers resolution queries against it. Rebuilt
/// wholesale whenever the config registry signals a rule mutation (§4.B).
pub struct RuleEngine {
    compiled: RwLock<Vec<CompiledRule>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Builds an engine with an empty cache; call [`RuleEngine::refresh`] before first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            compiled: RwLock::new(Vec::new()),
        }
    }

    /// Recompiles the cache from a fresh set of enabled rule rows. Rules with an
    /// uncompilable `regex:` pattern are dropped with a warning rather than poisoning the
    /// whole cache; callers that want stricter behavior should validate at rule-creation time
    /// instead (this is where §9's conservative conflict check would also be run).
    pub async fn refresh(&self, rows: &[RuleRow]) {
        let mut compiled = Vec::with_capacity(rows.len());
        for row in rows {
            match CompiledRule::compile(row) {
                Ok(rule) => compiled.push(rule),
                Err(e) => tracing::warn!(error = %e, rule_id = %row.rule_id, "dropping uncompilable rule"),
            }
        }
        *self.compiled.write().await = compiled;
    }

    /// Resolves the highest-priority matching rule for `(instance_id, chat_name)` against the
    /// currently cached rule set.
    pub async fn resolve(&self, instance_id: &InstanceId, chat_name: &ChatName) -> Option<ResolvedRule> {
        let compiled = self.compiled.read().await;
        resolve_against(&compiled, instance_id, chat_name)
    }
}
