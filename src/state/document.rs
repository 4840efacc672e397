use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// The declared-state document exchanged with agentcore. Produced by the
/// projection, consumed (after validation) by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StateDocument {
    pub probes: Vec<ProbeState>,
    pub agents: Vec<AgentState>,
    pub configs: Vec<NamedConfigState>,
    pub agent_token: TokenField,
    pub agentcore_token: TokenField,
    pub agentcore_zone_id: i64,
    pub socat_target_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ra: Option<RemoteAccessState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProbeState {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentState {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeSection>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NamedConfigState {
    pub name: String,
    pub like: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
}

/// The only service fields the controller sees and controls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ComposeSection {
    pub image: String,
    #[serde(default)]
    pub environment: Mapping,
}

/// A token is either a fresh 32-hex value or a boolean describing the stored
/// one: `true` keeps it, `false` means nothing is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TokenField {
    Token(String),
    Stored(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RemoteAccessState {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Unix seconds; the reconciler only honors a bounded future window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogRequest {
    pub name: String,
    #[serde(default)]
    pub start: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrReply {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn token_field_accepts_bool_and_string() {
        let doc: TokenField = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(doc, TokenField::Stored(true));
        let doc: TokenField = serde_json::from_value(json!("00112233445566778899aabbccddeeff")).unwrap();
        assert_eq!(
            doc,
            TokenField::Token("00112233445566778899aabbccddeeff".to_string())
        );
    }

    #[test]
    fn unknown_probe_field_is_rejected() {
        let err = serde_json::from_value::<ProbeState>(json!({
            "key": "ping",
            "enabled": true,
            "bogus": 1,
        }))
        .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn use_field_round_trips_under_wire_name() {
        let probe: ProbeState = serde_json::from_value(json!({
            "key": "ping",
            "compose": {"image": "ghcr.io/infrasonar/ping-probe", "environment": {}},
            "use": "other",
            "enabled": true,
        }))
        .unwrap();
        assert_eq!(probe.use_.as_deref(), Some("other"));

        let value = serde_json::to_value(&probe).unwrap();
        assert_eq!(value.get("use").unwrap(), "other");
        assert!(value.get("use_").is_none());
    }

    #[test]
    fn log_request_start_defaults_to_zero() {
        let req: LogRequest = serde_json::from_value(json!({"name": "ping-probe"})).unwrap();
        assert_eq!(req.start, 0);
        let err = serde_json::from_value::<LogRequest>(json!({"name": "x", "start": -1}));
        assert!(err.is_err());
    }
}
