//! Compiled Cedar policy set with atomic reload.

use crate::claims::Claims;
use crate::error::PolicyError;
use arc_swap::ArcSwap;
use cedar_policy::{
    Authorizer, Context, Decision, Entities, Entity, EntityId, EntityTypeName, EntityUid,
    PolicySet, Request, RestrictedExpression,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const PRINCIPAL_TYPE: &str = "Client";
pub const ACTION_TYPE: &str = "Action";
pub const ROLE_TYPE: &str = "Role";

/// Policy text plus optional static entities, as loaded from config.
#[derive(Debug, Clone, Default)]
pub struct PolicySource {
    pub policies: Vec<String>,
    /// Cedar entities JSON array.
    pub entities_json: Option<String>,
}

/// One immutable, compiled generation of the policy set.
pub struct PolicySnapshot {
    authorizer: Authorizer,
    policies: PolicySet,
    entities: Entities,
}

/// The entity tuple handed to Cedar for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EntityRequest<'a> {
    pub principal: &'a Claims,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub arguments: Option<&'a Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Permit { policies: Vec<String> },
    Forbid { reason: String },
}

impl PolicySnapshot {
    /// Parse and compile a policy source.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Compile`] for policy syntax errors and
    /// [`PolicyError::Entities`] for malformed entity JSON.
    pub fn compile(source: &PolicySource) -> Result<Self, PolicyError> {
        let text = source.policies.join("\n");
        let policies =
            PolicySet::from_str(&text).map_err(|e| PolicyError::Compile(e.to_string()))?;
        let entities = match source.entities_json.as_deref() {
            Some(json) if !json.trim().is_empty() => Entities::from_json_str(json, None)
                .map_err(|e| PolicyError::Entities(e.to_string()))?,
            _ => Entities::empty(),
        };
        Ok(Self {
            authorizer: Authorizer::new(),
            policies,
            entities,
        })
    }

    #[must_use]
    pub fn policy_count(&self) -> usize {
        self.policies.policies().count()
    }

    /// Evaluate one entity tuple. Default-deny: no matching permit means forbid.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Entity`] when the tuple cannot be expressed as Cedar entities.
    pub fn evaluate(&self, req: &EntityRequest<'_>) -> Result<Verdict, PolicyError> {
        if req.resource_id.is_empty() {
            return Err(PolicyError::Entity("empty resource id".to_string()));
        }
        let principal = uid(PRINCIPAL_TYPE, &req.principal.subject)?;
        let action = uid(ACTION_TYPE, req.action)?;
        let resource = uid(req.resource_type, req.resource_id)?;
        let context = build_context(req.principal, req.arguments)?;
        let request = Request::new(principal.clone(), action, resource.clone(), context, None)
            .map_err(|e| PolicyError::Entity(e.to_string()))?;
        let entities = self.request_entities(req, principal, resource)?;

        let response = self
            .authorizer
            .is_authorized(&request, &self.policies, &entities);
        let determining: Vec<String> = response
            .diagnostics()
            .reason()
            .map(ToString::to_string)
            .collect();
        let errors: Vec<String> = response
            .diagnostics()
            .errors()
            .map(ToString::to_string)
            .collect();

        Ok(match response.decision() {
            Decision::Allow => Verdict::Permit {
                policies: determining,
            },
            Decision::Deny if !errors.is_empty() => Verdict::Forbid {
                reason: format!("policy evaluation errors: {}", errors.join("; ")),
            },
            Decision::Deny if determining.is_empty() => Verdict::Forbid {
                reason: "no policy permits this action".to_string(),
            },
            Decision::Deny => Verdict::Forbid {
                reason: format!("forbidden by policy: {}", determining.join(", ")),
            },
        })
    }

    fn request_entities(
        &self,
        req: &EntityRequest<'_>,
        principal: EntityUid,
        resource: EntityUid,
    ) -> Result<Entities, PolicyError> {
        let mut built = Vec::new();

        let mut parents = HashSet::new();
        for role in &req.principal.roles {
            let role_uid = uid(ROLE_TYPE, role)?;
            if parents.insert(role_uid.clone()) {
                built.push(entity(role_uid, HashMap::new(), HashSet::new())?);
            }
        }

        let mut principal_attrs = HashMap::new();
        if let Some(name) = &req.principal.name {
            principal_attrs.insert(
                "name".to_string(),
                RestrictedExpression::new_string(name.clone()),
            );
        }
        if let Some(issuer) = &req.principal.issuer {
            principal_attrs.insert(
                "issuer".to_string(),
                RestrictedExpression::new_string(issuer.clone()),
            );
        }
        built.push(entity(principal, principal_attrs, parents)?);

        let mut resource_attrs = HashMap::new();
        resource_attrs.insert(
            "name".to_string(),
            RestrictedExpression::new_string(req.resource_id.to_string()),
        );
        built.push(entity(resource, resource_attrs, HashSet::new())?);

        // Static entities win over request-built ones with the same uid.
        let fresh: Vec<Entity> = built
            .into_iter()
            .filter(|e| self.entities.get(&e.uid()).is_none())
            .collect();
        self.entities
            .clone()
            .add_entities(fresh, None)
            .map_err(|e| PolicyError::Entity(e.to_string()))
    }
}

fn uid(type_name: &str, id: &str) -> Result<EntityUid, PolicyError> {
    let ty = EntityTypeName::from_str(type_name)
        .map_err(|e| PolicyError::Entity(format!("invalid entity type {type_name}: {e}")))?;
    let id = EntityId::from_str(id)
        .map_err(|e| PolicyError::Entity(format!("invalid entity id: {e}")))?;
    Ok(EntityUid::from_type_name_and_id(ty, id))
}

fn entity(
    uid: EntityUid,
    attrs: HashMap<String, RestrictedExpression>,
    parents: HashSet<EntityUid>,
) -> Result<Entity, PolicyError> {
    Entity::new(uid, attrs, parents).map_err(|e| PolicyError::Entity(e.to_string()))
}

fn build_context(
    claims: &Claims,
    arguments: Option<&Map<String, Value>>,
) -> Result<Context, PolicyError> {
    let mut pairs: Vec<(String, RestrictedExpression)> = Vec::new();
    for (k, v) in &claims.raw {
        if let Some(expr) = json_to_expr(v)? {
            pairs.push((format!("claim_{k}"), expr));
        }
    }
    for (k, v) in arguments.into_iter().flatten() {
        if let Some(expr) = json_to_expr(v)? {
            pairs.push((format!("arg_{k}"), expr));
        }
    }
    Context::from_pairs(pairs).map_err(|e| PolicyError::Entity(e.to_string()))
}

/// JSON → Cedar value. Nulls are dropped; non-integral numbers become strings.
fn json_to_expr(value: &Value) -> Result<Option<RestrictedExpression>, PolicyError> {
    Ok(match value {
        Value::Null => None,
        Value::Bool(b) => Some(RestrictedExpression::new_bool(*b)),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => RestrictedExpression::new_long(i),
            None => RestrictedExpression::new_string(n.to_string()),
        }),
        Value::String(s) => Some(RestrictedExpression::new_string(s.clone())),
        Value::Array(items) => {
            let mut exprs = Vec::with_capacity(items.len());
            for item in items {
                if let Some(e) = json_to_expr(item)? {
                    exprs.push(e);
                }
            }
            Some(RestrictedExpression::new_set(exprs))
        }
        Value::Object(obj) => {
            let mut fields = Vec::with_capacity(obj.len());
            for (k, v) in obj {
                if let Some(e) = json_to_expr(v)? {
                    fields.push((k.clone(), e));
                }
            }
            Some(
                RestrictedExpression::new_record(fields)
                    .map_err(|e| PolicyError::Entity(e.to_string()))?,
            )
        }
    })
}

/// Holds the current [`PolicySnapshot`]; readers never block a reload.
pub struct PolicyEngine {
    current: ArcSwap<PolicySnapshot>,
    evaluations: AtomicU64,
}

impl PolicyEngine {
    /// Compile the initial policy set.
    ///
    /// # Errors
    ///
    /// Any compile error is returned; the engine is never constructed half-loaded.
    pub fn new(source: &PolicySource) -> Result<Self, PolicyError> {
        let snapshot = PolicySnapshot::compile(source)?;
        let count = snapshot.policy_count();
        if count == 0 {
            tracing::warn!("policy set is empty; every protected request will be denied");
        }
        tracing::info!(policy_count = count, "policy set compiled");
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            evaluations: AtomicU64::new(0),
        })
    }

    /// Compile a new policy set and swap it in. On error the current set stays active.
    ///
    /// # Errors
    ///
    /// Returns the compile error of the rejected policy set.
    pub fn reload(&self, source: &PolicySource) -> Result<(), PolicyError> {
        let snapshot = PolicySnapshot::compile(source)?;
        tracing::info!(policy_count = snapshot.policy_count(), "policy set reloaded");
        self.current.store(Arc::new(snapshot));
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Evaluate against the current snapshot, counting the evaluation.
    ///
    /// # Errors
    ///
    /// See [`PolicySnapshot::evaluate`].
    pub fn evaluate(
        &self,
        snapshot: &PolicySnapshot,
        req: &EntityRequest<'_>,
    ) -> Result<Verdict, PolicyError> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        snapshot.evaluate(req)
    }

    /// Number of top-level entity evaluations performed so far.
    #[must_use]
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(sub: &str, roles: &[&str]) -> Claims {
        let mut raw = Map::new();
        raw.insert("sub".to_string(), json!(sub));
        raw.insert("dept".to_string(), json!("eng"));
        Claims {
            subject: sub.to_string(),
            name: Some(sub.to_string()),
            issuer: Some("test".to_string()),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            raw,
        }
    }

    fn engine(policies: &[&str]) -> PolicyEngine {
        PolicyEngine::new(&PolicySource {
            policies: policies.iter().map(|p| (*p).to_string()).collect(),
            entities_json: None,
        })
        .expect("compile")
    }

    fn call<'a>(
        c: &'a Claims,
        tool: &'a str,
        args: Option<&'a Map<String, Value>>,
    ) -> EntityRequest<'a> {
        EntityRequest {
            principal: c,
            action: "call_tool",
            resource_type: "Tool",
            resource_id: tool,
            arguments: args,
        }
    }

    fn permitted(snap: &PolicySnapshot, req: &EntityRequest<'_>) -> bool {
        match snap.evaluate(req) {
            Ok(Verdict::Permit { .. }) => true,
            Ok(Verdict::Forbid { .. }) => false,
            Err(e) => panic!("evaluation failed: {e}"),
        }
    }

    #[test]
    fn permit_by_principal_and_resource() {
        let e = engine(&[
            r#"permit(principal == Client::"alice", action == Action::"call_tool", resource == Tool::"weather");"#,
        ]);
        let snap = e.snapshot();
        let alice = claims("alice", &[]);
        let bob = claims("bob", &[]);
        assert!(permitted(&snap, &call(&alice, "weather", None)));
        assert!(!permitted(&snap, &call(&bob, "weather", None)));
        assert!(!permitted(&snap, &call(&alice, "other", None)));
    }

    #[test]
    fn role_membership_and_context_attributes() {
        let e = engine(&[
            r#"permit(principal in Role::"ops", action == Action::"call_tool", resource) when { context.claim_dept == "eng" && context.arg_region == "us" };"#,
        ]);
        let snap = e.snapshot();
        let ops = claims("carol", &["ops"]);
        let mut args = Map::new();
        args.insert("region".to_string(), json!("us"));
        assert!(permitted(&snap, &call(&ops, "deploy", Some(&args))));

        args.insert("region".to_string(), json!("eu"));
        assert!(!permitted(&snap, &call(&ops, "deploy", Some(&args))));

        let dev = claims("dave", &["dev"]);
        args.insert("region".to_string(), json!("us"));
        assert!(!permitted(&snap, &call(&dev, "deploy", Some(&args))));
    }

    #[test]
    fn forbid_overrides_permit() {
        let e = engine(&[
            r#"permit(principal, action, resource);"#,
            r#"forbid(principal, action == Action::"call_tool", resource == Tool::"rm");"#,
        ]);
        let snap = e.snapshot();
        let c = claims("alice", &[]);
        match snap.evaluate(&call(&c, "rm", None)) {
            Ok(Verdict::Forbid { reason }) => assert!(reason.contains("forbidden by policy")),
            other => panic!("expected forbid, got {other:?}"),
        }
    }

    #[test]
    fn empty_resource_id_is_an_error() {
        let e = engine(&[r#"permit(principal, action, resource);"#]);
        let c = claims("alice", &[]);
        assert!(e.snapshot().evaluate(&call(&c, "", None)).is_err());
    }

    #[test]
    fn compile_errors_are_reported() {
        let err = PolicyEngine::new(&PolicySource {
            policies: vec!["permit(principal, action".to_string()],
            entities_json: None,
        });
        assert!(matches!(err, Err(PolicyError::Compile(_))));

        let err = PolicyEngine::new(&PolicySource {
            policies: vec![],
            entities_json: Some("{not json".to_string()),
        });
        assert!(matches!(err, Err(PolicyError::Entities(_))));
    }

    #[test]
    fn reload_swaps_atomically_and_keeps_old_set_on_error() {
        let e = engine(&[r#"forbid(principal, action, resource);"#]);
        let c = claims("alice", &[]);
        let before = e.snapshot();

        e.reload(&PolicySource {
            policies: vec![r#"permit(principal, action, resource);"#.to_string()],
            entities_json: None,
        })
        .expect("reload");
        assert!(permitted(&e.snapshot(), &call(&c, "x", None)));
        // An already-taken snapshot is unaffected by the swap.
        assert!(!permitted(&before, &call(&c, "x", None)));

        assert!(e
            .reload(&PolicySource {
                policies: vec!["nonsense".to_string()],
                entities_json: None,
            })
            .is_err());
        assert!(permitted(&e.snapshot(), &call(&c, "x", None)));
    }

    #[test]
    fn static_entities_take_precedence() {
        let e = PolicyEngine::new(&PolicySource {
            policies: vec![
                r#"permit(principal in Role::"admin", action, resource);"#.to_string(),
            ],
            entities_json: Some(
                r#"[{"uid": {"type": "Client", "id": "root"}, "attrs": {}, "parents": [{"type": "Role", "id": "admin"}]},
                    {"uid": {"type": "Role", "id": "admin"}, "attrs": {}, "parents": []}]"#
                    .to_string(),
            ),
        })
        .expect("compile");
        let root = claims("root", &[]);
        let other = claims("other", &[]);
        let snap = e.snapshot();
        assert!(permitted(&snap, &call(&root, "x", None)));
        assert!(!permitted(&snap, &call(&other, "x", None)));
    }

    #[test]
    fn json_conversion_drops_nulls_and_stringifies_floats() {
        let args = json!({"a": null, "b": 1.5, "c": [1, null, "x"], "d": {"e": true}});
        let Value::Object(args) = args else { unreachable!() };
        let e = engine(&[
            r#"permit(principal, action, resource) when { context.arg_b == "1.5" && context.arg_c.contains(1) && context.arg_d.e && !(context has arg_a) };"#,
        ]);
        let c = claims("alice", &[]);
        assert!(permitted(&e.snapshot(), &call(&c, "t", Some(&args))));
    }
}
