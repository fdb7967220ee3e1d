//! Compiled rule engine for event routing.
//!
//! Rules pair a boolean `when` expression over the normalized event with
//! an ordered list of emit topics and a target driver. The engine
//! compiles the full set up front, evaluates events without side
//! effects, and supports atomic hot reload.
//!
//! ```
//! use githook_rules::{RuleDef, RuleEngine};
//! use serde_json::json;
//!
//! let engine = RuleEngine::compile(
//!     vec![RuleDef {
//!         id: "pr-ready".into(),
//!         when: r#"action == "opened" && pull_request.draft == false"#.into(),
//!         emit: vec!["pr.opened.ready".into()],
//!         driver_id: "amqp-1".into(),
//!     }],
//!     false,
//! )
//! .unwrap();
//!
//! let event = json!({"action": "opened", "pull_request": {"draft": false}});
//! let matches = engine.evaluate(&event);
//! assert_eq!(matches.len(), 1);
//! assert_eq!(matches[0].topics, vec!["pr.opened.ready"]);
//! ```

mod eval;
mod lexer;
mod parser;

use githook_core::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub use parser::{BinOp, Expr};

/// Input to compilation: one declarative routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    /// Rule id, unique within the set.
    pub id: String,
    /// Boolean expression over the normalized event.
    pub when: String,
    /// Ordered emit topics.
    pub emit: Vec<String>,
    /// Driver the matched topics publish through.
    pub driver_id: String,
}

/// One matched rule with its (deduplicated) emit topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Matched rule id.
    pub rule_id: String,
    /// The rule's `when` source, for the event log.
    pub when: String,
    /// Emit topics this rule contributes, after cross-rule dedup.
    pub topics: Vec<String>,
    /// Target driver id.
    pub driver_id: String,
}

struct CompiledRule {
    def: RuleDef,
    expr: Expr,
}

/// An immutable compiled rule set.
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
    strict: bool,
}

impl CompiledRules {
    /// Compile `defs` in order.
    ///
    /// # Errors
    ///
    /// In strict mode the first invalid `when` aborts with
    /// [`Error::RuleCompile`]; otherwise invalid rules are discarded with
    /// a warning.
    pub fn compile(defs: Vec<RuleDef>, strict: bool) -> Result<Self> {
        let mut rules = Vec::with_capacity(defs.len());
        for def in defs {
            match parser::parse(&def.when) {
                Ok(expr) => rules.push(CompiledRule { def, expr }),
                Err(message) if strict => {
                    return Err(Error::RuleCompile {
                        rule_id: def.id,
                        message,
                    });
                }
                Err(message) => {
                    warn!(rule_id = %def.id, error = %message, "discarding invalid rule");
                }
            }
        }
        Ok(Self { rules, strict })
    }

    /// Evaluate `event` against every rule, in order.
    ///
    /// Emit topics are deduplicated across rules; the first rule to name
    /// a topic keeps it. Rules whose evaluation errors are skipped in
    /// lenient mode.
    ///
    /// # Errors
    ///
    /// [`Error::RuleEval`] on an evaluation error in strict mode.
    pub fn try_evaluate(&self, event: &Value) -> Result<Vec<RuleMatch>> {
        let mut seen_topics: HashSet<&str> = HashSet::new();
        let mut matches = Vec::new();

        for rule in &self.rules {
            let matched = match eval::evaluate(&rule.expr, event) {
                Ok(v) => v.truthy(),
                Err(message) if self.strict => {
                    return Err(Error::RuleEval {
                        rule_id: rule.def.id.clone(),
                        message,
                    });
                }
                Err(message) => {
                    warn!(rule_id = %rule.def.id, error = %message, "rule evaluation failed");
                    false
                }
            };
            if !matched {
                continue;
            }

            let topics: Vec<String> = rule
                .def
                .emit
                .iter()
                .filter(|t| seen_topics.insert(t.as_str()))
                .cloned()
                .collect();
            matches.push(RuleMatch {
                rule_id: rule.def.id.clone(),
                when: rule.def.when.clone(),
                topics,
                driver_id: rule.def.driver_id.clone(),
            });
        }
        Ok(matches)
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rule compiled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Rule engine with atomic hot reload.
///
/// Evaluations grab an `Arc` to the current compiled set and finish on
/// it even if a reload swaps the set mid-flight.
pub struct RuleEngine {
    current: RwLock<Arc<CompiledRules>>,
    strict: bool,
}

impl RuleEngine {
    /// Compile `defs` and wrap them for hot reload.
    ///
    /// # Errors
    ///
    /// See [`CompiledRules::compile`].
    pub fn compile(defs: Vec<RuleDef>, strict: bool) -> Result<Self> {
        let compiled = CompiledRules::compile(defs, strict)?;
        Ok(Self {
            current: RwLock::new(Arc::new(compiled)),
            strict,
        })
    }

    /// Evaluate `event` against the current set (lenient result shape).
    ///
    /// Strict-mode evaluation errors surface through
    /// [`RuleEngine::try_evaluate`]; this convenience form returns an
    /// empty match list in that case.
    #[must_use]
    pub fn evaluate(&self, event: &Value) -> Vec<RuleMatch> {
        self.try_evaluate(event).unwrap_or_default()
    }

    /// Evaluate `event` against the current set.
    ///
    /// # Errors
    ///
    /// [`Error::RuleEval`] in strict mode when a rule errors.
    pub fn try_evaluate(&self, event: &Value) -> Result<Vec<RuleMatch>> {
        let compiled = Arc::clone(&self.current.read());
        compiled.try_evaluate(event)
    }

    /// Atomically replace the rule set.
    ///
    /// In-flight evaluations complete on the set they started with.
    ///
    /// # Errors
    ///
    /// See [`CompiledRules::compile`]; on error the old set stays active.
    pub fn swap(&self, defs: Vec<RuleDef>) -> Result<()> {
        let compiled = Arc::new(CompiledRules::compile(defs, self.strict)?);
        *self.current.write() = compiled;
        Ok(())
    }

    /// Snapshot of the current compiled set.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CompiledRules> {
        Arc::clone(&self.current.read())
    }
}

/// Parse a single expression; exposed so callers can validate a `when`
/// before persisting it.
///
/// # Errors
///
/// [`Error::RuleCompile`] with the parser diagnostic.
pub fn check_expression(when: &str) -> Result<()> {
    parser::parse(when).map(|_| ()).map_err(|message| {
        Error::RuleCompile {
            rule_id: String::new(),
            message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, when: &str, emit: &[&str]) -> RuleDef {
        RuleDef {
            id: id.into(),
            when: when.into(),
            emit: emit.iter().map(|s| (*s).to_string()).collect(),
            driver_id: "d1".into(),
        }
    }

    #[test]
    fn matches_in_rule_order_with_topic_dedup() {
        let engine = RuleEngine::compile(
            vec![
                rule("r1", r#"action == "opened""#, &["a", "b"]),
                rule("r2", "pull_request.number > 5", &["b", "c"]),
            ],
            true,
        )
        .unwrap();

        let event = json!({"action": "opened", "pull_request": {"number": 7}});
        let matches = engine.evaluate(&event);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].topics, vec!["a", "b"]);
        assert_eq!(matches[1].topics, vec!["c"]);
    }

    #[test]
    fn missing_paths_compare_as_null() {
        let engine = RuleEngine::compile(
            vec![
                rule("head", r#"head_commit.id != """#, &["push"]),
                rule("suite", r#"check_suite.head_commit.id != """#, &["suite"]),
            ],
            true,
        )
        .unwrap();

        // Neither path exists: null != "" is true, both match.
        let matches = engine.evaluate(&json!({"action": "x"}));
        assert_eq!(matches.len(), 2);

        // Present but empty string: no match.
        let matches = engine.evaluate(&json!({"head_commit": {"id": ""}}));
        assert_eq!(
            matches.iter().map(|m| m.rule_id.as_str()).collect::<Vec<_>>(),
            vec!["suite"]
        );
    }

    #[test]
    fn strict_compile_aborts_on_first_bad_rule() {
        let err = RuleEngine::compile(
            vec![rule("ok", "action == \"x\"", &["t"]), rule("bad", "action ==", &["t"])],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, Error::RuleCompile { ref rule_id, .. } if rule_id == "bad"));
    }

    #[test]
    fn lenient_compile_discards_bad_rules() {
        let engine = RuleEngine::compile(
            vec![rule("bad", "&& nope", &["t"]), rule("ok", "true", &["t"])],
            false,
        )
        .unwrap();
        assert_eq!(engine.snapshot().len(), 1);
        assert_eq!(engine.evaluate(&json!({})).len(), 1);
    }

    #[test]
    fn swap_replaces_atomically() {
        let engine = RuleEngine::compile(vec![rule("r1", "true", &["old"])], true).unwrap();
        let before = engine.snapshot();

        engine.swap(vec![rule("r2", "true", &["new"])]).unwrap();

        // The old snapshot still evaluates against the old set.
        let old_matches = before.try_evaluate(&json!({})).unwrap();
        assert_eq!(old_matches[0].topics, vec!["old"]);

        let new_matches = engine.evaluate(&json!({}));
        assert_eq!(new_matches[0].topics, vec!["new"]);
    }

    #[test]
    fn failed_swap_keeps_old_set() {
        let engine = RuleEngine::compile(vec![rule("r1", "true", &["old"])], true).unwrap();
        assert!(engine.swap(vec![rule("bad", "((", &["x"])]).is_err());
        assert_eq!(engine.evaluate(&json!({}))[0].topics, vec!["old"]);
    }

    #[test]
    fn evaluation_is_deterministic_across_threads() {
        let engine = std::sync::Arc::new(
            RuleEngine::compile(
                vec![
                    rule("r1", "commits[1] == null", &["single"]),
                    rule("r2", r#"repository.full_name == "o/r""#, &["repo"]),
                ],
                true,
            )
            .unwrap(),
        );
        let event = json!({"commits": [{"id": "a"}, {"id": "b"}], "repository": {"full_name": "o/r"}});

        let expected = engine.evaluate(&event);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = std::sync::Arc::clone(&engine);
                let event = event.clone();
                std::thread::spawn(move || engine.evaluate(&event))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    }
}
