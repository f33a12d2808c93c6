//! Authorization: turn (claims, parsed request) into an allow / deny / filter decision.

pub mod cedar;
pub mod filter;

use crate::claims::Claims;
use crate::mcp::parser::{ParsedRequest, RequestKind};
use cedar::{EntityRequest, PolicyEngine, PolicySnapshot, Verdict};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Methods that carry no access-control meaning. Enforced before any policy lookup.
pub const ALWAYS_ALLOWED_METHODS: &[&str] = &["ping", "progress/update", "initialize"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Tool,
    Prompt,
    Resource,
}

impl Feature {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Prompt => "prompt",
            Self::Resource => "resource",
        }
    }

    /// Cedar entity type of an addressable item of this feature.
    #[must_use]
    pub fn entity_type(self) -> &'static str {
        match self {
            Self::Tool => "Tool",
            Self::Prompt => "Prompt",
            Self::Resource => "Resource",
        }
    }

    /// Operation that decides whether a listed item is visible.
    #[must_use]
    pub fn use_operation(self) -> Operation {
        match self {
            Self::Tool => Operation::Call,
            Self::Prompt => Operation::Get,
            Self::Resource => Operation::Read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Call,
    Get,
    Read,
    List,
}

/// Cedar action id for a feature/operation pair.
#[must_use]
pub fn action_name(feature: Feature, op: Operation) -> &'static str {
    match (feature, op) {
        (Feature::Tool, Operation::List) => "list_tools",
        (Feature::Prompt, Operation::List) => "list_prompts",
        (Feature::Resource, Operation::List) => "list_resources",
        (Feature::Tool, _) => "call_tool",
        (Feature::Prompt, _) => "get_prompt",
        (Feature::Resource, _) => "read_resource",
    }
}

const METHOD_FEATURES: &[(&str, Feature, Operation)] = &[
    ("tools/call", Feature::Tool, Operation::Call),
    ("tools/list", Feature::Tool, Operation::List),
    ("prompts/get", Feature::Prompt, Operation::Get),
    ("prompts/list", Feature::Prompt, Operation::List),
    ("resources/read", Feature::Resource, Operation::Read),
    ("resources/subscribe", Feature::Resource, Operation::Read),
    ("resources/unsubscribe", Feature::Resource, Operation::Read),
    ("resources/list", Feature::Resource, Operation::List),
    ("resources/templates/list", Feature::Resource, Operation::List),
];

/// Feature/operation for an MCP method; `None` means the method is unmapped.
#[must_use]
pub fn feature_operation(method: &str) -> Option<(Feature, Operation)> {
    METHOD_FEATURES
        .iter()
        .find(|(m, _, _)| *m == method)
        .map(|(_, f, o)| (*f, *o))
}

/// Per-item predicate for list-shaped results, bound to one policy snapshot.
#[derive(Clone)]
pub struct ListFilter {
    snapshot: Arc<PolicySnapshot>,
    principal: Arc<Claims>,
    feature: Feature,
}

impl ListFilter {
    #[must_use]
    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Whether the principal may see the item with this identifier. Errors deny.
    #[must_use]
    pub fn permits(&self, item_id: &str) -> bool {
        let req = EntityRequest {
            principal: &self.principal,
            action: action_name(self.feature, self.feature.use_operation()),
            resource_type: self.feature.entity_type(),
            resource_id: item_id,
            arguments: None,
        };
        match self.snapshot.evaluate(&req) {
            Ok(Verdict::Permit { .. }) => true,
            Ok(Verdict::Forbid { .. }) => false,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    item = %item_id,
                    "list item evaluation failed; hiding item"
                );
                false
            }
        }
    }
}

impl fmt::Debug for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListFilter")
            .field("principal", &self.principal.subject)
            .field("feature", &self.feature)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Allow,
    Deny,
    AllowFiltered(ListFilter),
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub outcome: Outcome,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Allow,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_deny(&self) -> bool {
        matches!(self.outcome, Outcome::Deny)
    }

    #[must_use]
    pub fn list_filter(&self) -> Option<&ListFilter> {
        match &self.outcome {
            Outcome::AllowFiltered(f) => Some(f),
            _ => None,
        }
    }

    /// Stable label (`allow`, `deny`, `allow_filtered`) for logs and comparisons.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.outcome {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
            Outcome::AllowFiltered(_) => "allow_filtered",
        }
    }
}

pub struct Authorizer {
    engine: Arc<PolicyEngine>,
    skip_methods: BTreeSet<String>,
}

impl Authorizer {
    /// `passthrough_methods` extends [`ALWAYS_ALLOWED_METHODS`]; each entry is logged.
    #[must_use]
    pub fn new(engine: Arc<PolicyEngine>, passthrough_methods: &[String]) -> Self {
        let mut skip_methods: BTreeSet<String> = ALWAYS_ALLOWED_METHODS
            .iter()
            .map(|m| (*m).to_string())
            .collect();
        for m in passthrough_methods {
            if skip_methods.insert(m.clone()) {
                tracing::warn!(method = %m, "method configured to bypass authorization");
            }
        }
        Self {
            engine,
            skip_methods,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn authorize(&self, claims: &Arc<Claims>, kind: &RequestKind) -> PolicyDecision {
        match kind {
            RequestKind::StreamEstablishment => {
                PolicyDecision::allow("stream establishment is not authorized per message")
            }
            RequestKind::Unparsed => PolicyDecision::allow("no MCP operation to authorize"),
            RequestKind::Malformed { method } if self.skip_methods.contains(method) => {
                PolicyDecision::allow(format!("method {method} skips authorization"))
            }
            RequestKind::Malformed { method } => {
                PolicyDecision::deny(format!("malformed JSON-RPC envelope for method {method:?}"))
            }
            RequestKind::Mcp(parsed) => self.authorize_parsed(claims, parsed),
        }
    }

    fn authorize_parsed(&self, claims: &Arc<Claims>, parsed: &ParsedRequest) -> PolicyDecision {
        if parsed.is_batch {
            return PolicyDecision::deny("batch requests cannot be authorized per item");
        }
        if self.skip_methods.contains(&parsed.method) {
            return PolicyDecision::allow(format!("method {} skips authorization", parsed.method));
        }
        let Some((feature, op)) = feature_operation(&parsed.method) else {
            return PolicyDecision::deny(format!(
                "method {:?} has no authorization mapping",
                parsed.method
            ));
        };

        let snapshot = self.engine.snapshot();
        if op == Operation::List {
            return PolicyDecision {
                outcome: Outcome::AllowFiltered(ListFilter {
                    snapshot,
                    principal: Arc::clone(claims),
                    feature,
                }),
                reason: format!("{} list results filtered per item", feature.as_str()),
            };
        }

        let req = EntityRequest {
            principal: claims,
            action: action_name(feature, op),
            resource_type: feature.entity_type(),
            resource_id: &parsed.resource_id,
            arguments: Some(&parsed.arguments),
        };
        match self.engine.evaluate(&snapshot, &req) {
            Ok(Verdict::Permit { policies }) => {
                PolicyDecision::allow(format!("permitted by {}", policies.join(", ")))
            }
            Ok(Verdict::Forbid { reason }) => PolicyDecision::deny(reason),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    method = %parsed.method,
                    subject = %claims.subject,
                    "policy evaluation fault; denying"
                );
                PolicyDecision::deny(format!("policy evaluation fault: {e}"))
            }
        }
    }
}
