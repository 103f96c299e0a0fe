// src/rules.rs
//
// Trigger rules evaluated against every inbound frame.
// A rule pairs a predicate (identifier match plus optional payload/mask
// match) with an action from a closed set. Validation happens when a rule
// list is assigned, never during evaluation.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::frame::{CanId, Frame, MAX_PAYLOAD_LEN};

// ============================================================================
// Types
// ============================================================================

/// What a matching rule does. Closed set: unknown kinds fail
/// deserialization, so a loaded rule list can always be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Transmit a response frame on the bus.
    TransmitResponse { id: CanId, payload: Vec<u8> },
    /// Append an annotation line to the bus log.
    AnnotateLog { text: String },
}

/// User-defined trigger/action pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Identifier the inbound frame must carry.
    pub match_id: CanId,
    /// Optional payload match. When `mask` is present the comparison is
    /// `(frame.payload & mask) == (payload & mask)` byte-wise; without a
    /// mask the payload must match exactly.
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub mask: Option<Vec<u8>>,
    /// First match wins when true (the default); a non-exclusive match
    /// lets evaluation continue to later rules.
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    pub action: RuleAction,
}

fn default_exclusive() -> bool {
    true
}

impl CanRule {
    /// Does this rule's predicate match the frame?
    /// Length mismatches fail the match; they are never an error here.
    fn matches(&self, frame: &Frame) -> bool {
        if frame.id != self.match_id {
            return false;
        }
        match (&self.payload, &self.mask) {
            (None, _) => true,
            (Some(payload), None) => frame.payload == *payload,
            (Some(payload), Some(mask)) => {
                if frame.payload.len() < mask.len() {
                    return false;
                }
                mask.iter()
                    .zip(payload.iter())
                    .zip(frame.payload.iter())
                    .all(|((m, p), f)| (f & m) == (p & m))
            }
        }
    }
}

// ============================================================================
// RuleEngine
// ============================================================================

/// Ordered rule list with pure evaluation.
///
/// Identical frame + identical rule list ⇒ identical actions in identical
/// order. The engine holds no state beyond the list itself.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<CanRule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule list. All-or-nothing: the first invalid rule
    /// rejects the whole incoming list and the previous list stays live.
    pub fn set_rules(&mut self, rules: Vec<CanRule>) -> EngineResult<()> {
        for rule in &rules {
            validate_rule(rule)?;
        }
        self.rules = rules;
        Ok(())
    }

    pub fn rules(&self) -> &[CanRule] {
        &self.rules
    }

    /// Evaluate a frame against the list in registration order, collecting
    /// the actions of matching rules. Stops after the first exclusive match.
    pub fn evaluate(&self, frame: &Frame) -> Vec<RuleAction> {
        let mut actions = Vec::new();
        for rule in &self.rules {
            if rule.matches(frame) {
                actions.push(rule.action.clone());
                if rule.exclusive {
                    break;
                }
            }
        }
        actions
    }
}

/// Load-time validation: mask shape and payload lengths.
fn validate_rule(rule: &CanRule) -> EngineResult<()> {
    let invalid = |reason: &str| EngineError::InvalidRule {
        id: rule.id.clone(),
        reason: reason.to_string(),
    };

    if let Some(payload) = &rule.payload {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(invalid("match payload exceeds 8 bytes"));
        }
    }
    match (&rule.payload, &rule.mask) {
        (None, Some(_)) => return Err(invalid("mask requires a match payload")),
        (Some(payload), Some(mask)) if payload.len() != mask.len() => {
            return Err(invalid("mask and match payload lengths differ"))
        }
        _ => {}
    }
    if let RuleAction::TransmitResponse { payload, .. } = &rule.action {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(invalid("response payload exceeds 8 bytes"));
        }
    }
    Ok(())
}
