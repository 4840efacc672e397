pub mod document;
mod error;
mod reconcile;
mod secrets;
mod validate;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::docker::DockerClient;
use crate::env::Environment;
use crate::logview::{LogPage, LogViews, PAGE_LIMIT};
use crate::store::{ManifestStore, Manifests};

use document::{
    AgentState, ComposeSection, NamedConfigState, ProbeState, RemoteAccessState, StateDocument,
    TokenField,
};

pub use error::{StateError, ValidationError};

pub const PROBE_SUFFIX: &str = "-probe";
pub const AGENT_SUFFIX: &str = "-agent";

/// Built-in collector containers.
pub const AGENT_KEYS: [&str; 2] = ["docker", "discovery"];

/// Environment variables the controller may set on agent services.
pub const AGENT_ENV_VARS: [&str; 2] = ["LOG_LEVEL", "LOG_COLORIZED"];

pub const TEMPLATE_KEY: &str = "x-infrasonar-template";

pub const RA_SERVICE: &str = "ra";
pub const SOCAT_SERVICE: &str = "socat";
pub const SELENIUM_SERVICE: &str = "selenium";

/// Configurations-manifest key holding the remote-access expiry stamp.
pub const RA_UNTIL_KEY: &str = "__ra_until__";
pub const RA_SENTINEL: &str = "1970-01-01T00:00:00Z";

/// A remote-access grant must end within three days and must leave at least
/// a minute of usable window.
pub const RA_MIN_WINDOW: i64 = 55;
pub const RA_MAX_WINDOW: i64 = 259_200;

const REAPER_INTERVAL: Duration = Duration::from_secs(5);

const RA_INFO: &str = "Remote access lets InfraSonar support reach this appliance through a \
reverse tunnel for at most three days. The tunnel container is removed \
automatically when the time window expires. Enabling it requires \
ALLOW_REMOTE_ACCESS=1 on the appliance itself.";

/// The declared-state core: owns the in-memory manifests and coordinates
/// the runtime driver, the manifest store and the log views. One per
/// process, handed to the protocol dispatcher at startup.
pub struct State {
    env: Arc<Environment>,
    docker: DockerClient,
    store: ManifestStore,
    manifests: Mutex<Manifests>,
    logviews: LogViews,
}

impl State {
    /// Loads the manifests and runs the startup self-test: a trial
    /// projection, a trial write round-trip, a runtime version probe and a
    /// check that the compose project has services at all.
    pub async fn init(env: Arc<Environment>) -> Result<Arc<Self>, StateError> {
        let store = ManifestStore::new(&env);
        let manifests = store.load()?;
        let state = Arc::new(Self {
            docker: DockerClient::new(Arc::clone(&env)),
            store,
            manifests: Mutex::new(manifests),
            logviews: LogViews::new(),
            env,
        });

        {
            let manifests = state.manifests.lock().await;
            let _ = project(&manifests, &state.env);
            state.store.write(&manifests)?;
        }

        let (major, minor, patch) = state.docker.version().await?;
        info!("docker version: {major}.{minor}.{patch}");

        let started = state.docker.started_services(false).await?;
        if started.is_empty() {
            return Err(StateError::NoServices);
        }

        Ok(state)
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn docker(&self) -> &DockerClient {
        &self.docker
    }

    /// Projects the current manifests into the wire document.
    pub async fn get(&self) -> StateDocument {
        let manifests = self.manifests.lock().await;
        project(&manifests, &self.env)
    }

    /// Validates and merges a pushed document, then persists all three
    /// files. The caller is expected to schedule an [`State::update`]
    /// afterwards; a failed write leaves the previous on-disk state intact.
    pub async fn set(&self, mut doc: StateDocument) -> Result<(), StateError> {
        let _permit = self.docker.gate().acquire().await;
        let mut manifests = self.manifests.lock().await;
        validate::sanity_check(&mut doc, &manifests, &self.env)?;
        reconcile::apply(&mut manifests, &doc, &self.env, Utc::now());
        self.store.write(&manifests)?;
        Ok(())
    }

    /// Runs a pull-and-update cycle, drops every log view (their containers
    /// may have been replaced) and reloads the manifests from disk.
    pub async fn update(&self, self_update: bool, skip_pull: bool) -> Result<(), StateError> {
        self.docker.pull_and_update(self_update, skip_pull).await?;
        self.logviews.stop_all();
        let manifests = self.store.load()?;
        *self.manifests.lock().await = manifests;
        Ok(())
    }

    /// One page of container logs, creating the live tail on first use.
    pub async fn get_log(&self, name: &str, start: usize) -> Result<LogPage, StateError> {
        if let Some(view) = self.logviews.get(name) {
            return Ok(view.get_lines(start, PAGE_LIMIT));
        }

        let running = self.docker.started_services(true).await?;
        if !running.iter().any(|service| service == name) {
            return Err(StateError::NoSuchService(name.to_string()));
        }

        let _permit = self.docker.gate().acquire().await;
        // a concurrent request may have created the view while we waited
        if let Some(view) = self.logviews.get(name) {
            return Ok(view.get_lines(start, PAGE_LIMIT));
        }
        let view = self.logviews.start(name, &self.env).await?;
        Ok(view.get_lines(start, PAGE_LIMIT))
    }

    pub fn shutdown(&self) {
        self.logviews.stop_all();
    }

    async fn reap_remote_access(&self) -> Result<(), StateError> {
        let expired = {
            let manifests = self.manifests.lock().await;
            let present = manifests
                .services()
                .is_some_and(|services| services.contains_key(RA_SERVICE));
            present && !until_is_future(&manifests)
        };
        if !expired {
            return Ok(());
        }

        info!("remote access expired, removing the tunnel container");
        {
            let _permit = self.docker.gate().acquire().await;
            let mut manifests = self.manifests.lock().await;
            expire_remote_access(&mut manifests);
            self.store.write(&manifests)?;
        }
        self.update(false, true).await
    }
}

/// Background task enforcing the remote-access time bound.
pub async fn remote_access_reaper(state: Arc<State>) {
    loop {
        sleep(REAPER_INTERVAL).await;
        if let Err(err) = state.reap_remote_access().await {
            error!("remote access reaper failed: {err}");
        }
    }
}

fn expire_remote_access(manifests: &mut Manifests) {
    if let Some(services) = manifests.services_mut() {
        services.remove(RA_SERVICE);
    }
    if let Some(configs) = manifests.configs_map_mut() {
        configs.insert(
            Value::from(RA_UNTIL_KEY),
            Value::String(RA_SENTINEL.to_string()),
        );
    }
}

fn until_is_future(manifests: &Manifests) -> bool {
    manifests
        .configs_map()
        .and_then(|configs| configs.get(RA_UNTIL_KEY))
        .and_then(Value::as_str)
        .and_then(parse_until)
        .is_some_and(|until| until > Utc::now())
}

fn parse_until(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The `get` projection: manifests in, wire document out. Secrets are
/// masked, agent environments are filtered to the controllable variables
/// and inconsistent entries are logged and skipped.
fn project(manifests: &Manifests, env: &Environment) -> StateDocument {
    static EMPTY: std::sync::OnceLock<Mapping> = std::sync::OnceLock::new();
    let empty = EMPTY.get_or_init(Mapping::new);

    let services = manifests.services().unwrap_or(empty);
    let configs = manifests.configs_map().unwrap_or(empty);

    let mut probes = Vec::new();
    for (name, service) in services {
        let Some(name) = name.as_str() else { continue };
        let Some(key) = name.strip_suffix(PROBE_SUFFIX) else {
            continue;
        };
        let entry = configs.get(key).and_then(Value::as_mapping);
        if entry.is_some_and(|e| e.get("enabled").and_then(Value::as_bool) == Some(false)) {
            warn!(probe = key, "service present but config disabled, skipping");
            continue;
        }
        let Some(image) = service.get("image").and_then(Value::as_str) else {
            warn!(service = name, "service without image, skipping");
            continue;
        };
        let environment = service
            .get("environment")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();

        let use_ = entry
            .and_then(|e| e.get("use"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let config = match &use_ {
            Some(_) => None,
            None => {
                let mut config = entry
                    .and_then(|e| e.get("config"))
                    .cloned()
                    .unwrap_or(Value::Mapping(Mapping::new()));
                if !config.is_mapping() {
                    warn!(probe = key, "invalid config, skipping");
                    continue;
                }
                secrets::replace_secrets(&mut config);
                Some(config)
            }
        };

        probes.push(ProbeState {
            key: key.to_string(),
            compose: Some(ComposeSection {
                image: image.to_string(),
                environment,
            }),
            config,
            use_,
            enabled: true,
        });
    }

    // disabled probes survive only in the configurations manifest
    for (key, entry) in configs {
        let Some(key) = key.as_str() else { continue };
        if key == RA_UNTIL_KEY {
            continue;
        }
        let Some(entry) = entry.as_mapping() else {
            continue;
        };
        if entry.get("like").and_then(Value::as_str).is_some() {
            continue;
        }
        if entry.get("enabled").and_then(Value::as_bool) != Some(false) {
            continue;
        }
        if services.contains_key(format!("{key}{PROBE_SUFFIX}")) {
            continue;
        }

        let use_ = entry
            .get("use")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let config = match &use_ {
            Some(_) => None,
            None => entry.get("config").and_then(Value::as_mapping).map(|m| {
                let mut config = Value::Mapping(m.clone());
                secrets::replace_secrets(&mut config);
                config
            }),
        };

        probes.push(ProbeState {
            key: key.to_string(),
            compose: None,
            config,
            use_,
            enabled: false,
        });
    }

    let mut agents = Vec::new();
    for key in AGENT_KEYS {
        let service = services
            .get(format!("{key}{AGENT_SUFFIX}"))
            .and_then(Value::as_mapping);
        match service {
            Some(service) => {
                let image = service
                    .get("image")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut environment = Mapping::new();
                if let Some(vars) = service.get("environment").and_then(Value::as_mapping) {
                    for (name, value) in vars {
                        let controllable = name
                            .as_str()
                            .is_some_and(|n| AGENT_ENV_VARS.contains(&n));
                        if controllable {
                            environment.insert(name.clone(), value.clone());
                        }
                    }
                }
                agents.push(AgentState {
                    key: key.to_string(),
                    compose: Some(ComposeSection { image, environment }),
                    enabled: true,
                });
            }
            None => agents.push(AgentState {
                key: key.to_string(),
                compose: None,
                enabled: false,
            }),
        }
    }

    let mut named = Vec::new();
    for (name, entry) in configs {
        let Some(name) = name.as_str() else { continue };
        let Some(entry) = entry.as_mapping() else {
            continue;
        };
        let Some(like) = entry
            .get("like")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };

        let use_ = entry
            .get("use")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let config = match &use_ {
            Some(_) => None,
            None => {
                let mut config = entry
                    .get("config")
                    .cloned()
                    .unwrap_or(Value::Mapping(Mapping::new()));
                if !config.is_mapping() {
                    warn!(config = name, "invalid config, skipping");
                    continue;
                }
                secrets::replace_secrets(&mut config);
                Some(config)
            }
        };

        named.push(NamedConfigState {
            name: name.to_string(),
            like: like.to_string(),
            config,
            use_,
        });
    }

    let ra = RemoteAccessState {
        allowed: env.allow_remote_access,
        enabled: Some(services.contains_key(RA_SERVICE)),
        until: configs
            .get(RA_UNTIL_KEY)
            .and_then(Value::as_str)
            .and_then(parse_until)
            .map(|dt| dt.timestamp()),
        info: RA_INFO.to_string(),
    };

    StateDocument {
        probes,
        agents,
        configs: named,
        agent_token: TokenField::Stored(!manifests.env.agent_token.is_empty()),
        agentcore_token: TokenField::Stored(!manifests.env.agentcore_token.is_empty()),
        agentcore_zone_id: manifests.env.agentcore_zone_id,
        socat_target_addr: manifests.env.socat_target_addr.clone(),
        ra: Some(ra),
    }
}
