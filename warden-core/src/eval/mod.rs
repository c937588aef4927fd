//! Authorization evaluation.
//!
//! [`PolicyEvaluator`] is the seam between the replicated state and the
//! policy engine: the state machine only ever asks "does this model allow
//! this request". [`MatcherEvaluator`] is the built-in implementation and
//! covers boolean matchers over request/policy fields with role lookups.

mod matcher;

pub use matcher::Expr;

use std::collections::BTreeMap;

use crate::error::{PolicyError, Result};
use crate::model::Model;

/// Request definition entry used for evaluation.
const REQUEST_KEY: &str = "r";
/// Policy definition entry used for evaluation.
const POLICY_KEY: &str = "p";
/// Matcher entry used for evaluation.
const MATCHER_KEY: &str = "m";
/// Effect entry used for evaluation.
const EFFECT_KEY: &str = "e";
/// Optional policy field carrying a rule's effect.
const EFFECT_TOKEN: &str = "p_eft";

/// Decides whether a model allows a request.
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate `request` (one value per request field) against `model`.
    fn evaluate(&self, model: &Model, request: &[String]) -> Result<bool>;
}

/// How matching rule effects combine into a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Allow if any matching rule allows.
    AllowOverride,
    /// Allow unless a matching rule denies.
    DenyOverride,
    /// Allow if any matching rule allows and none denies.
    AllowAndDeny,
}

impl Effect {
    /// Recognize an effect expression, ignoring whitespace.
    pub fn parse(value: &str) -> Result<Self> {
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        match compact.as_str() {
            "some(where(p.eft==allow))" => Ok(Effect::AllowOverride),
            "!some(where(p.eft==deny))" => Ok(Effect::DenyOverride),
            "some(where(p.eft==allow))&&!some(where(p.eft==deny))" => Ok(Effect::AllowAndDeny),
            _ => Err(PolicyError::UnsupportedEffect(value.to_string())),
        }
    }

    fn decide(self, allowed: bool, denied: bool) -> bool {
        match self {
            Effect::AllowOverride => allowed,
            Effect::DenyOverride => !denied,
            Effect::AllowAndDeny => allowed && !denied,
        }
    }
}

/// Built-in evaluator for boolean matcher expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatcherEvaluator;

impl MatcherEvaluator {
    /// Create an evaluator.
    pub fn new() -> Self {
        Self
    }
}

impl PolicyEvaluator for MatcherEvaluator {
    fn evaluate(&self, model: &Model, request: &[String]) -> Result<bool> {
        let missing = |sec: &str, ptype: &str| PolicyError::AssertionNotFound {
            sec: sec.to_string(),
            ptype: ptype.to_string(),
        };

        let request_def = model
            .get(REQUEST_KEY, REQUEST_KEY)
            .ok_or_else(|| missing(REQUEST_KEY, REQUEST_KEY))?;
        let policy_def = model
            .get(POLICY_KEY, POLICY_KEY)
            .ok_or_else(|| missing(POLICY_KEY, POLICY_KEY))?;
        let matcher = model
            .get(MATCHER_KEY, MATCHER_KEY)
            .ok_or_else(|| missing(MATCHER_KEY, MATCHER_KEY))?;
        let effect = model
            .get(EFFECT_KEY, EFFECT_KEY)
            .ok_or_else(|| missing(EFFECT_KEY, EFFECT_KEY))?;

        if request.len() != request_def.tokens.len() {
            return Err(PolicyError::RequestArity {
                expected: request_def.tokens.len(),
                actual: request.len(),
            });
        }

        let effect = Effect::parse(&effect.value)?;
        let expr = Expr::parse(&matcher.value)?;

        let mut bindings: BTreeMap<&str, &str> = request_def
            .tokens
            .iter()
            .map(String::as_str)
            .zip(request.iter().map(String::as_str))
            .collect();

        let mut allowed = false;
        let mut denied = false;
        for row in &policy_def.policy {
            if row.len() != policy_def.tokens.len() {
                return Err(PolicyError::PolicyArity {
                    row: row.clone(),
                    expected: policy_def.tokens.len(),
                });
            }
            for (token, value) in policy_def.tokens.iter().zip(row) {
                bindings.insert(token.as_str(), value.as_str());
            }

            if !expr.matches(model, &bindings)? {
                continue;
            }
            match bindings.get(EFFECT_TOKEN).copied().unwrap_or("allow") {
                "deny" => denied = true,
                _ => allowed = true,
            }
            if effect == Effect::AllowOverride && allowed {
                break;
            }
        }

        Ok(effect.decide(allowed, denied))
    }
}
