//! Command application logic.

use crate::command::{
    Command, CommandError, CommandKind, EnforcePayload, MetadataDeletePayload, MetadataSetPayload,
    PoliciesPayload, ProtocolError, RemoveFilteredPolicyPayload, SetModelPayload,
    UpdatePoliciesPayload, UpdatePolicyPayload,
};
use crate::state::metadata::MetadataStore;
use crate::types::RaftRequest;
use warden_core::{Model, PolicyError, PolicyEvaluator};

use super::StateMachineData;
use super::types::StoreResponse;

/// Apply one committed log entry.
///
/// Payloads are decoded before the namespace is looked up, so an entry this
/// node cannot understand fails the same way whether or not its namespace
/// exists. `Err` means the entry is undecodable and the replica must stop.
pub fn apply_command(
    data: &mut StateMachineData,
    metadata: &MetadataStore,
    evaluator: &dyn PolicyEvaluator,
    request: &RaftRequest,
) -> Result<StoreResponse, ProtocolError> {
    let cmd = Command::decode(request)?;
    let ns = cmd.namespace.as_str();

    tracing::debug!(command = cmd.kind.name(), namespace = ns, "applying command");

    let response: StoreResponse = match cmd.kind {
        CommandKind::CreateNamespace => data.enforcers.create(ns).into(),

        CommandKind::SetModel => {
            let p: SetModelPayload = cmd.decode_payload()?;
            apply_set_model(data, ns, &p.text).into()
        }

        CommandKind::AddPolicies => {
            let p: PoliciesPayload = cmd.decode_payload()?;
            with_model(data, ns, |m| m.add_policies(&p.sec, &p.ptype, p.rules).map(drop))
        }

        CommandKind::UpdatePolicy => {
            let p: UpdatePolicyPayload = cmd.decode_payload()?;
            with_model(data, ns, |m| {
                m.update_policies(&p.sec, &p.ptype, &[p.old_rule], &[p.new_rule])
            })
        }

        CommandKind::UpdatePolicies => {
            let p: UpdatePoliciesPayload = cmd.decode_payload()?;
            with_model(data, ns, |m| {
                m.update_policies(&p.sec, &p.ptype, &p.old_rules, &p.new_rules)
            })
        }

        CommandKind::RemovePolicies => {
            let p: PoliciesPayload = cmd.decode_payload()?;
            with_model(data, ns, |m| {
                m.remove_policies(&p.sec, &p.ptype, &p.rules).map(drop)
            })
        }

        CommandKind::RemoveFilteredPolicy => {
            let p: RemoveFilteredPolicyPayload = cmd.decode_payload()?;
            with_model(data, ns, |m| {
                m.remove_filtered_policy(&p.sec, &p.ptype, p.field_index, &p.field_values)
                    .map(drop)
            })
        }

        CommandKind::ClearPolicy => with_model(data, ns, |m| {
            m.clear_policy();
            Ok(())
        }),

        CommandKind::Enforce => {
            let p: EnforcePayload = cmd.decode_payload()?;
            apply_enforce(data, evaluator, ns, &p)
        }

        CommandKind::MetadataSet => {
            let p: MetadataSetPayload = cmd.decode_payload()?;
            if metadata.merge(p.node_id, &p.data) {
                tracing::debug!(node_id = p.node_id, "metadata updated");
            }
            StoreResponse::ok()
        }

        CommandKind::MetadataDelete => {
            let p: MetadataDeletePayload = cmd.decode_payload()?;
            metadata.delete(p.node_id);
            StoreResponse::ok()
        }
    };

    if let Some(error) = &response.error {
        tracing::debug!(command = cmd.kind.name(), namespace = ns, %error, "command rejected");
    }
    Ok(response)
}

fn apply_set_model(data: &mut StateMachineData, ns: &str, text: &str) -> Result<(), CommandError> {
    let enforcer = data.enforcers.get_mut(ns)?;
    let model = Model::from_text(text)?;
    enforcer.set_model(model);
    Ok(())
}

/// Run a rule operation against a namespace's model.
fn with_model(
    data: &mut StateMachineData,
    ns: &str,
    op: impl FnOnce(&mut Model) -> Result<(), PolicyError>,
) -> StoreResponse {
    let result = data
        .enforcers
        .get_mut(ns)
        .and_then(|enforcer| op(enforcer.model_mut()).map_err(CommandError::from));
    result.into()
}

fn apply_enforce(
    data: &StateMachineData,
    evaluator: &dyn PolicyEvaluator,
    ns: &str,
    payload: &EnforcePayload,
) -> StoreResponse {
    let request = match decode_params(&payload.params) {
        Ok(request) => request,
        Err(e) => return StoreResponse::err(e),
    };

    let Some(enforcer) = data.enforcers.get(ns) else {
        return StoreResponse::err(CommandError::NamespaceNotExist);
    };

    match evaluator.evaluate(enforcer.model(), &request) {
        Ok(allowed) => StoreResponse::decision(allowed),
        Err(e) => StoreResponse::err(e.into()),
    }
}

/// Decode JSON-encoded request values.
///
/// Strings are used as-is; any other JSON value is compared by its
/// canonical JSON text.
fn decode_params(params: &[Vec<u8>]) -> Result<Vec<String>, CommandError> {
    params
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| {
                CommandError::MalformedPayload(format!("request value {i}: {e}"))
            })?;
            Ok(match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ReadConsistency;
    use std::collections::BTreeMap;
    use warden_core::MatcherEvaluator;

    const MODEL: &str = "
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
";

    struct Harness {
        data: StateMachineData,
        metadata: MetadataStore,
        evaluator: MatcherEvaluator,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                data: StateMachineData::default(),
                metadata: MetadataStore::new(),
                evaluator: MatcherEvaluator::new(),
            }
        }

        fn apply(&mut self, cmd: Command) -> StoreResponse {
            let request = cmd.encode().expect("encode");
            apply_command(&mut self.data, &self.metadata, &self.evaluator, &request)
                .expect("apply")
        }

        fn rules(&mut self, kind: CommandKind, sec: &str, rules: &[&[&str]]) -> StoreResponse {
            let payload = PoliciesPayload {
                sec: sec.into(),
                ptype: sec.into(),
                rules: rules.iter().map(|r| row(r)).collect(),
            };
            self.apply(Command::with_payload(kind, "acme", &payload, 0).expect("cmd"))
        }

        fn enforce(&mut self, ns: &str, request: &[&str]) -> StoreResponse {
            let payload = EnforcePayload {
                params: request
                    .iter()
                    .map(|v| serde_json::to_vec(v).expect("param"))
                    .collect(),
                level: ReadConsistency::Strong,
                freshness_ms: 0,
            };
            self.apply(Command::with_payload(CommandKind::Enforce, ns, &payload, 0).expect("cmd"))
        }

        fn seeded() -> Self {
            let mut h = Self::new();
            h.apply(Command::bare(CommandKind::CreateNamespace, "acme"));
            let model = SetModelPayload { text: MODEL.into() };
            let resp = h.apply(
                Command::with_payload(CommandKind::SetModel, "acme", &model, 150).expect("cmd"),
            );
            assert_eq!(resp, StoreResponse::ok());
            h
        }

        fn policy(&self) -> &[Vec<String>] {
            self.data
                .enforcers
                .get("acme")
                .expect("acme")
                .model()
                .policy("p", "p")
        }
    }

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_acme_scenario() {
        let mut h = Harness::seeded();
        assert!(h.rules(CommandKind::AddPolicies, "p", &[&["alice", "data1", "read"]]).error.is_none());
        assert!(h.rules(CommandKind::AddPolicies, "g", &[&["alice", "admin"]]).error.is_none());

        assert_eq!(h.enforce("acme", &["alice", "data1", "read"]), StoreResponse::decision(true));
        assert_eq!(h.enforce("acme", &["bob", "data1", "read"]), StoreResponse::decision(false));
    }

    #[test]
    fn test_create_twice_leaves_model_unchanged() {
        let mut h = Harness::seeded();
        h.rules(CommandKind::AddPolicies, "p", &[&["alice", "data1", "read"]]);
        let before = h.data.enforcers.clone();

        let resp = h.apply(Command::bare(CommandKind::CreateNamespace, "acme"));
        assert_eq!(resp.error, Some(CommandError::NamespaceExists));
        assert_eq!(h.data.enforcers, before);
    }

    #[test]
    fn test_missing_namespace() {
        let mut h = Harness::new();
        let model = SetModelPayload { text: MODEL.into() };
        let cmds = [
            Command::with_payload(CommandKind::SetModel, "ghost", &model, 0).expect("cmd"),
            Command::bare(CommandKind::ClearPolicy, "ghost"),
        ];
        for cmd in cmds {
            assert_eq!(h.apply(cmd).error, Some(CommandError::NamespaceNotExist));
        }
        assert_eq!(
            h.enforce("ghost", &["alice", "data1", "read"]).error,
            Some(CommandError::NamespaceNotExist)
        );
        assert!(h.data.enforcers.is_empty());
    }

    #[test]
    fn test_update_and_remove() {
        let mut h = Harness::seeded();
        h.rules(
            CommandKind::AddPolicies,
            "p",
            &[&["alice", "data1", "read"], &["bob", "data2", "write"], &["carol", "data1", "read"]],
        );

        let update = UpdatePolicyPayload {
            sec: "p".into(),
            ptype: "p".into(),
            old_rule: row(&["bob", "data2", "write"]),
            new_rule: row(&["bob", "data2", "read"]),
        };
        let resp = h.apply(
            Command::with_payload(CommandKind::UpdatePolicy, "acme", &update, 0).expect("cmd"),
        );
        assert!(resp.error.is_none());
        assert_eq!(h.policy()[1], row(&["bob", "data2", "read"]));

        let filter = RemoveFilteredPolicyPayload {
            sec: "p".into(),
            ptype: "p".into(),
            field_index: 1,
            field_values: row(&["data1", "read"]),
        };
        h.apply(
            Command::with_payload(CommandKind::RemoveFilteredPolicy, "acme", &filter, 0)
                .expect("cmd"),
        );
        assert_eq!(h.policy(), &[row(&["bob", "data2", "read"])]);

        h.rules(CommandKind::RemovePolicies, "p", &[&["bob", "data2", "read"]]);
        assert!(h.policy().is_empty());
    }

    #[test]
    fn test_update_missing_rule_is_engine_error() {
        let mut h = Harness::seeded();
        let update = UpdatePoliciesPayload {
            sec: "p".into(),
            ptype: "p".into(),
            old_rules: vec![row(&["nobody", "x", "y"])],
            new_rules: vec![row(&["a", "b", "c"])],
        };
        let resp = h.apply(
            Command::with_payload(CommandKind::UpdatePolicies, "acme", &update, 0).expect("cmd"),
        );
        assert!(matches!(resp.error, Some(CommandError::Engine(_))));
        assert!(h.policy().is_empty());
    }

    #[test]
    fn test_empty_filter_clears_grouping_section() {
        let mut h = Harness::seeded();
        h.rules(CommandKind::AddPolicies, "p", &[&["admin", "data1", "read"]]);
        h.rules(CommandKind::AddPolicies, "g", &[&["alice", "admin"], &["bob", "admin"]]);
        assert_eq!(h.enforce("acme", &["alice", "data1", "read"]), StoreResponse::decision(true));

        let filter = RemoveFilteredPolicyPayload {
            sec: "g".into(),
            ptype: "g".into(),
            field_index: 0,
            field_values: Vec::new(),
        };
        let resp = h.apply(
            Command::with_payload(CommandKind::RemoveFilteredPolicy, "acme", &filter, 0)
                .expect("cmd"),
        );
        assert!(resp.error.is_none());

        let model = h.data.enforcers.get("acme").expect("acme").model();
        assert!(model.policy("g", "g").is_empty());
        assert!(!model.has_link("g", "alice", "admin", None));
        assert_eq!(h.enforce("acme", &["alice", "data1", "read"]), StoreResponse::decision(false));
        assert_eq!(h.policy(), &[row(&["admin", "data1", "read"])]);
    }

    #[test]
    fn test_update_with_repeated_old_rule_changes_nothing() {
        let mut h = Harness::seeded();
        h.rules(
            CommandKind::AddPolicies,
            "p",
            &[&["alice", "d", "read"], &["bob", "d", "write"]],
        );
        let before = h.data.enforcers.clone();

        let update = UpdatePoliciesPayload {
            sec: "p".into(),
            ptype: "p".into(),
            old_rules: vec![row(&["alice", "d", "read"]), row(&["alice", "d", "read"])],
            new_rules: vec![row(&["x", "d", "read"]), row(&["y", "d", "read"])],
        };
        let resp = h.apply(
            Command::with_payload(CommandKind::UpdatePolicies, "acme", &update, 0).expect("cmd"),
        );
        assert!(matches!(resp.error, Some(CommandError::Engine(_))));
        assert_eq!(h.data.enforcers, before);
    }

    #[test]
    fn test_invalid_model_is_engine_error() {
        let mut h = Harness::seeded();
        let model = SetModelPayload {
            text: "[matchers]\nm = r.sub == p.sub\n".into(),
        };
        let resp =
            h.apply(Command::with_payload(CommandKind::SetModel, "acme", &model, 0).expect("cmd"));
        assert!(matches!(resp.error, Some(CommandError::Engine(_))));
        assert!(!h.data.enforcers.get("acme").expect("acme").model().is_empty());
    }

    #[test]
    fn test_clear_policy() {
        let mut h = Harness::seeded();
        h.rules(CommandKind::AddPolicies, "p", &[&["alice", "data1", "read"]]);
        h.rules(CommandKind::AddPolicies, "g", &[&["alice", "admin"]]);

        assert!(h.apply(Command::bare(CommandKind::ClearPolicy, "acme")).error.is_none());
        assert!(h.policy().is_empty());
        assert_eq!(h.enforce("acme", &["alice", "data1", "read"]), StoreResponse::decision(false));
    }

    #[test]
    fn test_malformed_params_are_request_errors() {
        let mut h = Harness::seeded();
        let payload = EnforcePayload {
            params: vec![b"\"alice\"".to_vec(), b"{broken".to_vec(), b"\"read\"".to_vec()],
            level: ReadConsistency::None,
            freshness_ms: 0,
        };
        let resp =
            h.apply(Command::with_payload(CommandKind::Enforce, "acme", &payload, 0).expect("cmd"));
        assert!(matches!(resp.error, Some(CommandError::MalformedPayload(_))));
    }

    #[test]
    fn test_metadata_commands() {
        let mut h = Harness::new();
        let data = BTreeMap::from([("api_addr".to_string(), "10.0.0.2:4001".to_string())]);

        h.apply(Command::metadata_set(2, data.clone(), 0).expect("cmd"));
        let once = h.metadata.read_all();
        h.apply(Command::metadata_set(2, data, 0).expect("cmd"));
        assert_eq!(h.metadata.read_all(), once);

        h.apply(Command::metadata_delete(2).expect("cmd"));
        assert!(h.metadata.read_all().is_empty());
    }

    #[test]
    fn test_undecodable_payload_is_fatal() {
        let mut h = Harness::seeded();
        let cmd = Command {
            kind: CommandKind::AddPolicies,
            namespace: "acme".into(),
            payload: b"[1, 2, 3]".to_vec(),
            compressed: false,
        };
        let request = cmd.encode().expect("encode");
        let result = apply_command(&mut h.data, &h.metadata, &h.evaluator, &request);
        assert!(matches!(result, Err(ProtocolError::Payload { .. })));
    }

    #[test]
    fn test_unknown_envelope_is_fatal() {
        let mut h = Harness::new();
        let request = RaftRequest(b"{\"kind\":\"delete_namespace\"}".to_vec());
        let result = apply_command(&mut h.data, &h.metadata, &h.evaluator, &request);
        assert!(matches!(result, Err(ProtocolError::Envelope(_))));
    }
}
