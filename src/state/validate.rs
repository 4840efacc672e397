use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::env::Environment;
use crate::store::Manifests;

use super::document::{StateDocument, TokenField};
use super::error::ValidationError;
use super::secrets::revert_secrets;
use super::{AGENT_ENV_VARS, AGENT_KEYS, RA_MAX_WINDOW};

fn key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[_A-Za-z][_0-9A-Za-z]{0,40}$").expect("static regex"))
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{32}$").expect("static regex"))
}

/// Checks an incoming declared-state document against the current manifests
/// and restores masked secrets in place. On success the document is safe to
/// hand to the reconciler.
pub fn sanity_check(
    doc: &mut StateDocument,
    manifests: &Manifests,
    env: &Environment,
) -> Result<(), ValidationError> {
    let mut seen: HashSet<String> = HashSet::new();
    for probe in &doc.probes {
        if !seen.insert(probe.key.clone()) {
            return Err(ValidationError::new(format!(
                "duplicate probe key or config name: {}",
                probe.key
            )));
        }
    }
    for config in &doc.configs {
        if !seen.insert(config.name.clone()) {
            return Err(ValidationError::new(format!(
                "duplicate probe key or config name: {}",
                config.name
            )));
        }
    }
    let known = seen;

    let configs = empty_or(manifests.configs_map());

    for probe in &mut doc.probes {
        let key = probe.key.clone();
        if !key_re().is_match(&key) {
            return Err(ValidationError::new(format!("invalid probe key '{key}'")));
        }

        if probe.enabled {
            let compose = probe.compose.as_ref().ok_or_else(|| {
                ValidationError::new(format!("missing \"compose\" in probe {key}"))
            })?;
            check_image(&compose.image, &format!("ghcr.io/infrasonar/{key}-probe"), env)
                .map_err(|img| ValidationError::new(format!("invalid probe image: {img}")))?;
            check_environment(&compose.environment)?;

            match (&probe.config, &probe.use_) {
                (Some(_), Some(_)) => {
                    return Err(ValidationError::new(format!(
                        "both \"use\" and \"config\" for probe {key}"
                    )))
                }
                (None, None) => {
                    return Err(ValidationError::new(format!(
                        "missing \"use\" or \"config\" for probe {key}"
                    )))
                }
                _ => {}
            }
        } else if probe.config.is_some() && probe.use_.is_some() {
            return Err(ValidationError::new(format!(
                "both \"use\" and \"config\" for probe {key}"
            )));
        }

        if let Some(use_) = &probe.use_ {
            if use_ == &key || !known.contains(use_.as_str()) {
                return Err(ValidationError::new(format!(
                    "invalid \"use\" value for probe {key}"
                )));
            }
        }

        if let Some(config) = &mut probe.config {
            if !config.is_mapping() {
                return Err(ValidationError::new(format!(
                    "invalid \"config\" for probe {key}"
                )));
            }
            revert_secrets(config, current_config(configs, &key))?;
        }
    }

    for agent in &doc.agents {
        let key = &agent.key;
        if !AGENT_KEYS.contains(&key.as_str()) {
            return Err(ValidationError::new(format!("invalid agent key '{key}'")));
        }
        if agent.enabled {
            let compose = agent.compose.as_ref().ok_or_else(|| {
                ValidationError::new(format!("missing \"compose\" in agent {key}"))
            })?;
            check_image(&compose.image, &format!("ghcr.io/infrasonar/{key}-agent"), env)
                .map_err(|img| ValidationError::new(format!("invalid agent image: {img}")))?;
            check_agent_environment(key, &compose.environment)?;
        } else if agent.compose.is_some() {
            return Err(ValidationError::new(format!(
                "unexpected \"compose\" for disabled agent {key}"
            )));
        }
    }

    for config in &mut doc.configs {
        let name = config.name.clone();
        if !key_re().is_match(&name) {
            return Err(ValidationError::new(format!("invalid config name '{name}'")));
        }
        if !key_re().is_match(&config.like) {
            return Err(ValidationError::new(format!(
                "invalid \"like\" value for config {name}"
            )));
        }
        match (&config.config, &config.use_) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::new(format!(
                    "both \"use\" and \"config\" for config {name}"
                )))
            }
            (None, None) => {
                return Err(ValidationError::new(format!(
                    "missing \"use\" or \"config\" for config {name}"
                )))
            }
            _ => {}
        }
        if let Some(use_) = &config.use_ {
            if use_ == &name || !known.contains(use_.as_str()) {
                return Err(ValidationError::new(format!(
                    "invalid \"use\" value for config {name}"
                )));
            }
        }
        if let Some(value) = &mut config.config {
            if !value.is_mapping() {
                return Err(ValidationError::new(format!(
                    "invalid \"config\" for config {name}"
                )));
            }
            revert_secrets(value, current_config(configs, &name))?;
        }
    }

    check_token("agent_token", &doc.agent_token, &manifests.env.agent_token)?;
    check_token(
        "agentcore_token",
        &doc.agentcore_token,
        &manifests.env.agentcore_token,
    )?;

    if !(0..=9).contains(&doc.agentcore_zone_id) {
        return Err(ValidationError::new(format!(
            "invalid agentcore_zone_id: {}",
            doc.agentcore_zone_id
        )));
    }

    if let Some(ra) = &doc.ra {
        if ra.enabled == Some(true) {
            let until = ra.until.ok_or_else(|| {
                ValidationError::new("missing \"until\" for remote access")
            })?;
            let window = until - chrono::Utc::now().timestamp();
            if window > RA_MAX_WINDOW {
                return Err(ValidationError::new(
                    "invalid \"until\" for remote access (more than 3 days ahead)",
                ));
            }
        }
    }

    Ok(())
}

fn empty_or(mapping: Option<&Mapping>) -> &Mapping {
    static EMPTY: OnceLock<Mapping> = OnceLock::new();
    mapping.unwrap_or_else(|| EMPTY.get_or_init(Mapping::new))
}

fn current_config<'a>(configs: &'a Mapping, key: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    configs
        .get(key)
        .and_then(|entry| entry.get("config"))
        .unwrap_or(&NULL)
}

fn check_image<'a>(image: &'a str, prefix: &str, env: &Environment) -> Result<(), &'a str> {
    if env.use_development || image.starts_with(prefix) {
        Ok(())
    } else {
        Err(image)
    }
}

fn check_environment(environment: &Mapping) -> Result<(), ValidationError> {
    for (key, value) in environment {
        let valid_key = key
            .as_str()
            .map(|k| !k.is_empty() && k == k.to_uppercase())
            .unwrap_or(false);
        if !valid_key {
            return Err(ValidationError::new(
                "environment keys must be uppercase strings",
            ));
        }
        if !matches!(value, Value::String(_) | Value::Number(_)) {
            return Err(ValidationError::new(
                "environment values must be number or string",
            ));
        }
    }
    Ok(())
}

fn check_agent_environment(agent: &str, environment: &Mapping) -> Result<(), ValidationError> {
    for (key, value) in environment {
        let key = key.as_str().unwrap_or_default();
        if !AGENT_ENV_VARS.contains(&key) {
            return Err(ValidationError::new(format!(
                "invalid environment variable {key} for agent {agent}"
            )));
        }
        // a null or empty value clears the variable instead of setting it
        if value.is_null() || value.as_str().is_some_and(str::is_empty) {
            continue;
        }
        let valid = match key {
            "LOG_LEVEL" => value.as_str().is_some_and(|v| {
                matches!(
                    v.to_lowercase().as_str(),
                    "debug" | "info" | "warning" | "error" | "critical"
                )
            }),
            "LOG_COLORIZED" => match value {
                Value::Number(n) => n.as_i64().is_some_and(|n| n == 0 || n == 1),
                Value::String(s) => s == "0" || s == "1",
                _ => false,
            },
            _ => false,
        };
        if !valid {
            return Err(ValidationError::new(format!(
                "invalid value for environment variable {key}"
            )));
        }
    }
    Ok(())
}

fn check_token(
    name: &str,
    token: &TokenField,
    stored: &str,
) -> Result<(), ValidationError> {
    match token {
        TokenField::Token(value) => {
            if !token_re().is_match(value) {
                return Err(ValidationError::new(format!("invalid {name}")));
            }
        }
        TokenField::Stored(true) => {
            if stored.is_empty() {
                return Err(ValidationError::new(format!(
                    "got a boolean {name} but missing in current state"
                )));
            }
        }
        TokenField::Stored(false) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rstest::rstest;
    use serde_json::json;

    use crate::store::EnvData;

    use super::*;

    const TOKEN: &str = "00112233445566778899aabbccddeeff";

    fn environment(use_development: bool) -> Environment {
        Environment {
            agentcore_host: "127.0.0.1".to_string(),
            agentcore_port: 8770,
            compose_file: PathBuf::from("/docker/docker-compose.yml"),
            env_file: PathBuf::from("/docker/.env"),
            config_file: PathBuf::from("/config/infrasonar.yaml"),
            compose_dir: PathBuf::from("/docker"),
            use_development,
            skip_image_prune: false,
            data_path: PathBuf::from("./data"),
            service_name: "rapp".to_string(),
            project_name: "infrasonar".to_string(),
            allow_remote_access: false,
        }
    }

    fn manifests() -> Manifests {
        Manifests {
            compose: serde_yaml::from_str("services: {}\n").unwrap(),
            configs: serde_yaml::from_str("ping:\n  config:\n    password: xyz\n").unwrap(),
            env: EnvData {
                agentcore_token: TOKEN.to_string(),
                agent_token: TOKEN.to_string(),
                agentcore_zone_id: 0,
                socat_target_addr: String::new(),
            },
        }
    }

    fn doc(mut patch: serde_json::Value) -> StateDocument {
        let mut base = json!({
            "probes": [],
            "agents": [],
            "configs": [],
            "agent_token": true,
            "agentcore_token": true,
            "agentcore_zone_id": 0,
            "socat_target_addr": "",
        });
        base.as_object_mut()
            .unwrap()
            .append(patch.as_object_mut().unwrap());
        serde_json::from_value(base).unwrap()
    }

    fn probe(key: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut item = json!({
            "key": key,
            "compose": {
                "image": format!("ghcr.io/infrasonar/{key}-probe"),
                "environment": {},
            },
            "enabled": true,
        });
        item.as_object_mut()
            .unwrap()
            .append(extra.clone().as_object_mut().unwrap());
        item
    }

    fn check(doc_value: &mut StateDocument) -> Result<(), ValidationError> {
        sanity_check(doc_value, &manifests(), &environment(false))
    }

    #[test]
    fn empty_document_passes() {
        assert!(check(&mut doc(json!({}))).is_ok());
    }

    #[test]
    fn use_self_reference_is_rejected() {
        let mut d = doc(json!({"probes": [probe("ping", json!({"use": "ping"}))]}));
        let err = check(&mut d).unwrap_err();
        assert_eq!(err.0, "invalid \"use\" value for probe ping");
    }

    #[test]
    fn use_unknown_target_is_rejected() {
        let mut d = doc(json!({"probes": [probe("ping", json!({"use": "nosuch"}))]}));
        let err = check(&mut d).unwrap_err();
        assert_eq!(err.0, "invalid \"use\" value for probe ping");
    }

    #[test]
    fn use_other_probe_is_accepted() {
        let mut d = doc(json!({"probes": [
            probe("ping", json!({"config": {}})),
            probe("tcp", json!({"use": "ping"})),
        ]}));
        assert!(check(&mut d).is_ok());
    }

    #[rstest]
    #[case(10)]
    #[case(-1)]
    fn zone_out_of_range_is_rejected(#[case] zone: i64) {
        let mut d = doc(json!({"agentcore_zone_id": zone}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("agentcore_zone_id"));
    }

    #[test]
    fn both_use_and_config_is_rejected() {
        let mut d = doc(json!({"probes": [
            probe("ping", json!({"use": "tcp", "config": {}})),
            probe("tcp", json!({"config": {}})),
        ]}));
        let err = check(&mut d).unwrap_err();
        assert_eq!(err.0, "both \"use\" and \"config\" for probe ping");
    }

    #[test]
    fn enabled_probe_without_config_or_use_is_rejected() {
        let mut d = doc(json!({"probes": [probe("ping", json!({}))]}));
        let err = check(&mut d).unwrap_err();
        assert_eq!(err.0, "missing \"use\" or \"config\" for probe ping");
    }

    #[test]
    fn foreign_probe_image_is_rejected() {
        let mut item = probe("ping", json!({"config": {}}));
        item["compose"]["image"] = json!("docker.io/evil/ping-probe");
        let mut d = doc(json!({"probes": [item]}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.starts_with("invalid probe image"));
    }

    #[test]
    fn development_mode_allows_foreign_registry() {
        let mut item = probe("ping", json!({"config": {}}));
        item["compose"]["image"] = json!("registry.local/ping-probe");
        let mut d = doc(json!({"probes": [item]}));
        assert!(sanity_check(&mut d, &manifests(), &environment(true)).is_ok());
    }

    #[rstest]
    #[case("pi ng")]
    #[case("0ping")]
    #[case("way-too-long-for-a-probe-key-identifier-value")]
    fn invalid_probe_keys_are_rejected(#[case] key: &str) {
        let mut item = probe(key, json!({"config": {}}));
        item["compose"]["image"] = json!(format!("ghcr.io/infrasonar/{key}-probe"));
        let mut d = doc(json!({"probes": [item]}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("invalid probe key"), "{}", err.0);
    }

    #[test]
    fn duplicate_probe_and_config_name_is_rejected() {
        let mut d = doc(json!({
            "probes": [probe("ping", json!({"config": {}}))],
            "configs": [{"name": "ping", "like": "ping", "config": {}}],
        }));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("duplicate"), "{}", err.0);
    }

    #[test]
    fn unknown_agent_key_is_rejected() {
        let mut d = doc(json!({"agents": [{"key": "speedtest", "enabled": false}]}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("invalid agent key"), "{}", err.0);
    }

    #[test]
    fn disabled_agent_with_compose_is_rejected() {
        let mut d = doc(json!({"agents": [{
            "key": "docker",
            "enabled": false,
            "compose": {"image": "ghcr.io/infrasonar/docker-agent", "environment": {}},
        }]}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("disabled agent docker"), "{}", err.0);
    }

    #[test]
    fn agent_env_outside_allow_list_is_rejected() {
        let mut d = doc(json!({"agents": [{
            "key": "docker",
            "enabled": true,
            "compose": {
                "image": "ghcr.io/infrasonar/docker-agent",
                "environment": {"HOSTNAME": "x"},
            },
        }]}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("HOSTNAME"), "{}", err.0);
    }

    #[rstest]
    #[case(json!("info"), true)]
    #[case(json!("verbose"), false)]
    #[case(json!(""), true)]
    fn agent_log_level_values(#[case] value: serde_json::Value, #[case] ok: bool) {
        let mut d = doc(json!({"agents": [{
            "key": "docker",
            "enabled": true,
            "compose": {
                "image": "ghcr.io/infrasonar/docker-agent",
                "environment": {"LOG_LEVEL": value},
            },
        }]}));
        assert_eq!(check(&mut d).is_ok(), ok);
    }

    #[test]
    fn fresh_token_must_be_32_hex() {
        let mut d = doc(json!({"agent_token": "not-a-token"}));
        let err = check(&mut d).unwrap_err();
        assert_eq!(err.0, "invalid agent_token");
    }

    #[test]
    fn keep_token_without_stored_value_is_rejected() {
        let mut d = doc(json!({}));
        let mut current = manifests();
        current.env.agent_token.clear();
        let err = sanity_check(&mut d, &current, &environment(false)).unwrap_err();
        assert!(err.0.contains("agent_token"), "{}", err.0);
    }

    #[test]
    fn boolean_secret_is_restored_from_current_state() {
        let mut d = doc(json!({"probes": [
            probe("ping", json!({"config": {"password": true}})),
        ]}));
        check(&mut d).unwrap();
        let config = d.probes[0].config.as_ref().unwrap();
        assert_eq!(config.get("password").and_then(Value::as_str), Some("xyz"));
    }

    #[test]
    fn boolean_secret_without_current_value_is_rejected() {
        let mut d = doc(json!({"probes": [
            probe("tcp", json!({"config": {"password": true}})),
        ]}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("missing in current state"), "{}", err.0);
    }

    #[test]
    fn remote_access_window_beyond_three_days_is_rejected() {
        let until = chrono::Utc::now().timestamp() + RA_MAX_WINDOW + 60;
        let mut d = doc(json!({"ra": {
            "allowed": true,
            "enabled": true,
            "until": until,
            "info": "",
        }}));
        let err = check(&mut d).unwrap_err();
        assert!(err.0.contains("until"), "{}", err.0);
    }

    #[test]
    fn short_remote_access_window_passes_validation() {
        let until = chrono::Utc::now().timestamp() + 30;
        let mut d = doc(json!({"ra": {
            "allowed": true,
            "enabled": true,
            "until": until,
            "info": "",
        }}));
        assert!(check(&mut d).is_ok());
    }
}
