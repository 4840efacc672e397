use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_yaml::{Mapping, Value};

use crate::env::Environment;
use crate::store::Manifests;

use super::document::{StateDocument, TokenField};
use super::{
    AGENT_SUFFIX, PROBE_SUFFIX, RA_MAX_WINDOW, RA_MIN_WINDOW, RA_SENTINEL, RA_SERVICE,
    RA_UNTIL_KEY, SELENIUM_SERVICE, SOCAT_SERVICE, TEMPLATE_KEY,
};

/// Applies a validated declared-state document to the in-memory manifests.
/// The caller persists the result; nothing here touches the runtime.
pub fn apply(manifests: &mut Manifests, doc: &StateDocument, env: &Environment, now: DateTime<Utc>) {
    let template = manifests
        .compose
        .get(TEMPLATE_KEY)
        .cloned()
        .unwrap_or(Value::Mapping(Mapping::new()));

    apply_probes(manifests, doc, &template);
    apply_agents(manifests, doc, &template);
    apply_named_configs(manifests, doc);
    apply_side_services(manifests, doc, env, now);
    apply_env(manifests, doc);
}

fn apply_probes(manifests: &mut Manifests, doc: &StateDocument, template: &Value) {
    let enabled: HashSet<&str> = doc
        .probes
        .iter()
        .filter(|p| p.enabled)
        .map(|p| p.key.as_str())
        .collect();

    if let Some(services) = manifests.services_mut() {
        let stale: Vec<Value> = services
            .iter()
            .filter_map(|(name, _)| {
                let key = name.as_str()?.strip_suffix(PROBE_SUFFIX)?;
                (!enabled.contains(key)).then(|| name.clone())
            })
            .collect();
        for name in stale {
            services.remove(&name);
        }
    }

    for probe in &doc.probes {
        let service_name = format!("{}{PROBE_SUFFIX}", probe.key);

        if !probe.enabled {
            if let Some(services) = manifests.services_mut() {
                services.remove(service_name.as_str());
            }
            if let Some(configs) = manifests.configs_map_mut() {
                match configs.get_mut(probe.key.as_str()).and_then(Value::as_mapping_mut) {
                    Some(entry) => {
                        entry.insert(Value::from("enabled"), Value::Bool(false));
                    }
                    None => {
                        let mut entry = Mapping::new();
                        entry.insert(Value::from("enabled"), Value::Bool(false));
                        configs.insert(Value::String(probe.key.clone()), Value::Mapping(entry));
                    }
                }
            }
            continue;
        }

        let Some(compose) = &probe.compose else {
            continue; // enforced by validation
        };
        if let Some(services) = manifests.services_mut() {
            services.insert(
                Value::String(service_name),
                service_from_template(template, &compose.image, &compose.environment),
            );
        }

        if let Some(configs) = manifests.configs_map_mut() {
            let assets = configs
                .get(probe.key.as_str())
                .and_then(|entry| entry.get("assets"))
                .cloned();

            let mut entry = Mapping::new();
            if let Some(assets) = assets {
                entry.insert(Value::from("assets"), assets);
            }
            if let Some(use_) = &probe.use_ {
                entry.insert(Value::from("use"), Value::String(use_.clone()));
            } else if let Some(config) = &probe.config {
                if config.as_mapping().is_some_and(|m| !m.is_empty()) {
                    entry.insert(Value::from("config"), config.clone());
                }
            }
            configs.insert(Value::String(probe.key.clone()), Value::Mapping(entry));
        }
    }
}

fn apply_agents(manifests: &mut Manifests, doc: &StateDocument, template: &Value) {
    let Some(services) = manifests.services_mut() else {
        return;
    };
    for agent in &doc.agents {
        let service_name = format!("{}{AGENT_SUFFIX}", agent.key);
        if !agent.enabled {
            services.remove(service_name.as_str());
            continue;
        }
        let Some(compose) = &agent.compose else {
            continue; // enforced by validation
        };
        // empty values clear a variable rather than setting an empty one
        let mut environment = Mapping::new();
        for (key, value) in &compose.environment {
            let empty = value.is_null()
                || value.as_str().map(str::is_empty).unwrap_or(false);
            if !empty {
                environment.insert(key.clone(), value.clone());
            }
        }
        services.insert(
            Value::String(service_name),
            service_from_template(template, &compose.image, &environment),
        );
    }
}

fn apply_named_configs(manifests: &mut Manifests, doc: &StateDocument) {
    let Some(configs) = manifests.configs_map_mut() else {
        return;
    };

    let mut leftovers: HashSet<String> = configs
        .iter()
        .filter_map(|(name, entry)| {
            entry.get("like")?.as_str()?;
            Some(name.as_str()?.to_string())
        })
        .collect();

    for config in &doc.configs {
        leftovers.remove(&config.name);

        let assets = configs
            .get(config.name.as_str())
            .and_then(|entry| entry.get("assets"))
            .cloned();

        let mut entry = Mapping::new();
        entry.insert(Value::from("like"), Value::String(config.like.clone()));
        if let Some(assets) = assets {
            entry.insert(Value::from("assets"), assets);
        }
        if let Some(use_) = &config.use_ {
            entry.insert(Value::from("use"), Value::String(use_.clone()));
        } else if let Some(value) = &config.config {
            if value.as_mapping().is_some_and(|m| !m.is_empty()) {
                entry.insert(Value::from("config"), value.clone());
            }
        }
        configs.insert(Value::String(config.name.clone()), Value::Mapping(entry));
    }

    for name in leftovers {
        configs.remove(name.as_str());
    }
}

fn apply_side_services(
    manifests: &mut Manifests,
    doc: &StateDocument,
    env: &Environment,
    now: DateTime<Utc>,
) {
    let needs_selenium = doc
        .probes
        .iter()
        .any(|p| p.enabled && p.key == SELENIUM_SERVICE);
    let needs_socat = !doc.socat_target_addr.is_empty();

    if let Some(services) = manifests.services_mut() {
        if needs_selenium {
            if !services.contains_key(SELENIUM_SERVICE) {
                services.insert(Value::from(SELENIUM_SERVICE), selenium_service());
            }
        } else {
            services.remove(SELENIUM_SERVICE);
        }

        if needs_socat {
            if !services.contains_key(SOCAT_SERVICE) {
                services.insert(Value::from(SOCAT_SERVICE), socat_service());
            }
        } else {
            services.remove(SOCAT_SERVICE);
        }
    }

    let ra_until = doc.ra.as_ref().and_then(|ra| {
        (ra.enabled == Some(true)).then_some(ra.until).flatten()
    });
    let grant = env.allow_remote_access
        && ra_until.is_some_and(|until| {
            let window = until - now.timestamp();
            window > RA_MIN_WINDOW && window <= RA_MAX_WINDOW
        });

    if grant {
        let until = ra_until.unwrap_or_default();
        let stamp = DateTime::<Utc>::from_timestamp(until, 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Some(configs) = manifests.configs_map_mut() {
            configs.insert(Value::from(RA_UNTIL_KEY), Value::String(stamp));
        }
        if let Some(services) = manifests.services_mut() {
            if !services.contains_key(RA_SERVICE) {
                services.insert(Value::from(RA_SERVICE), ra_service());
            }
        }
    } else {
        let removed = manifests
            .services_mut()
            .and_then(|services| services.remove(RA_SERVICE));
        if removed.is_some() {
            if let Some(configs) = manifests.configs_map_mut() {
                configs.insert(Value::from(RA_UNTIL_KEY), Value::String(RA_SENTINEL.to_string()));
            }
        }
    }
}

fn apply_env(manifests: &mut Manifests, doc: &StateDocument) {
    apply_token(&mut manifests.env.agent_token, &doc.agent_token);
    apply_token(&mut manifests.env.agentcore_token, &doc.agentcore_token);
    manifests.env.agentcore_zone_id = doc.agentcore_zone_id;
    manifests.env.socat_target_addr = doc.socat_target_addr.clone();
}

fn apply_token(stored: &mut String, token: &TokenField) {
    match token {
        TokenField::Token(value) => *stored = value.clone(),
        TokenField::Stored(true) => {}
        TokenField::Stored(false) => stored.clear(),
    }
}

/// New service spec: the reusable template with `image` and `environment`
/// overlaid.
fn service_from_template(template: &Value, image: &str, environment: &Mapping) -> Value {
    let mut service = template.as_mapping().cloned().unwrap_or_default();
    service.remove("image");
    service.remove("environment");
    service.insert(Value::from("image"), Value::String(image.to_string()));
    if !environment.is_empty() {
        service.insert(
            Value::from("environment"),
            Value::Mapping(environment.clone()),
        );
    }
    Value::Mapping(service)
}

fn static_service(content: &str) -> Value {
    serde_yaml::from_str(content).expect("static service spec")
}

fn selenium_service() -> Value {
    static_service(
        "image: selenium/standalone-chrome\nrestart: always\nshm_size: 2gb\n",
    )
}

fn socat_service() -> Value {
    static_service(
        "image: alpine/socat\ncommand: TCP-LISTEN:8162,fork,reuseaddr TCP:${SOCAT_TARGET_ADDR}\nnetwork_mode: host\nrestart: always\n",
    )
}

fn ra_service() -> Value {
    static_service(
        "image: ghcr.io/infrasonar/ra\nenvironment:\n  TOKEN: ${AGENTCORE_TOKEN}\nnetwork_mode: host\nrestart: always\n",
    )
}
