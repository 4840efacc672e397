pub mod env_file;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::env::Environment;

const COMPOSE_BANNER: &str = "\
## InfraSonar docker-compose.yml file
##
## !! This file is managed by InfraSonar !!

";

const CONFIG_BANNER: &str = "\
## WARNING: InfraSonar will make `password` and `secret` values unreadable but
## this must not be regarded as true encryption as the encryption key is
## publicly available.
##
## Example configuration for `myprobe` collector:
##
##  myprobe:
##    config:
##      username: alice
##      password: \"secret password\"
##    assets:
##    - id: [12345, 34567]
##      config:
##        username: bob
##        password: \"my secret\"
##
## !! This file is managed by InfraSonar !!
##
## It's okay to add custom probe configuration for when you want to
## specify the \"_use\" value for assets. The appliance toolkit will not
## overwrite these custom probe configurations. You can also add additional
## assets configurations for managed probes.

";

/// Retired auto-updater; scrubbed from the compose document on load.
const LEGACY_UPDATER: &str = "watchtower";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} must hold a mapping at the top level")]
    NotAMapping(PathBuf),

    #[error("broken env file ({path}: {reason})")]
    EnvFile { path: PathBuf, reason: String },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Typed view of the env file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvData {
    pub agentcore_token: String,
    pub agent_token: String,
    pub agentcore_zone_id: i64,
    pub socat_target_addr: String,
}

/// The three on-disk documents, held in memory between reloads.
#[derive(Debug, Clone)]
pub struct Manifests {
    pub compose: Value,
    pub configs: Value,
    pub env: EnvData,
}

impl Manifests {
    pub fn services(&self) -> Option<&Mapping> {
        self.compose.get("services")?.as_mapping()
    }

    pub fn services_mut(&mut self) -> Option<&mut Mapping> {
        self.compose.get_mut("services")?.as_mapping_mut()
    }

    pub fn configs_map(&self) -> Option<&Mapping> {
        self.configs.as_mapping()
    }

    pub fn configs_map_mut(&mut self) -> Option<&mut Mapping> {
        self.configs.as_mapping_mut()
    }
}

/// Loads and saves the compose manifest, the configurations manifest and the
/// env file. Every write goes through a uniquely named sibling temp file and
/// a rename, so a crash leaves either the old or the new content intact.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    compose_file: PathBuf,
    config_file: PathBuf,
    env_file: PathBuf,
}

impl ManifestStore {
    pub fn new(env: &Environment) -> Self {
        Self {
            compose_file: env.compose_file.clone(),
            config_file: env.config_file.clone(),
            env_file: env.env_file.clone(),
        }
    }

    pub fn load(&self) -> Result<Manifests, StoreError> {
        let mut compose = read_yaml(&self.compose_file)?;
        if !compose.is_mapping() {
            return Err(StoreError::NotAMapping(self.compose_file.clone()));
        }
        strip_legacy(&mut compose);

        let mut configs = read_yaml(&self.config_file)?;
        if configs.is_null() {
            // fresh install, nothing configured yet
            configs = Value::Mapping(Mapping::new());
        }
        if !configs.is_mapping() {
            return Err(StoreError::NotAMapping(self.config_file.clone()));
        }

        let env = self.load_env()?;
        Ok(Manifests {
            compose,
            configs,
            env,
        })
    }

    fn load_env(&self) -> Result<EnvData, StoreError> {
        let content = fs::read_to_string(&self.env_file).map_err(|source| StoreError::Read {
            path: self.env_file.clone(),
            source,
        })?;
        let values = env_file::parse(&content);

        let zone_raw = values
            .get(env_file::AGENTCORE_ZONE_ID)
            .map(String::as_str)
            .unwrap_or_default();
        let agentcore_zone_id = if zone_raw.is_empty() {
            0
        } else {
            zone_raw.parse().map_err(|_| StoreError::EnvFile {
                path: self.env_file.clone(),
                reason: format!("invalid {}: `{zone_raw}`", env_file::AGENTCORE_ZONE_ID),
            })?
        };

        Ok(EnvData {
            agentcore_token: values
                .get(env_file::AGENTCORE_TOKEN)
                .cloned()
                .unwrap_or_default(),
            agent_token: values
                .get(env_file::AGENT_TOKEN)
                .cloned()
                .unwrap_or_default(),
            agentcore_zone_id,
            socat_target_addr: values
                .get(env_file::SOCAT_TARGET_ADDR)
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub fn write(&self, manifests: &Manifests) -> Result<(), StoreError> {
        let env_content = env_file::serialize(&[
            (
                env_file::AGENTCORE_TOKEN,
                manifests.env.agentcore_token.clone(),
            ),
            (env_file::AGENT_TOKEN, manifests.env.agent_token.clone()),
            (
                env_file::AGENTCORE_ZONE_ID,
                manifests.env.agentcore_zone_id.to_string(),
            ),
            (
                env_file::SOCAT_TARGET_ADDR,
                manifests.env.socat_target_addr.clone(),
            ),
        ]);
        atomic_write(&self.env_file, &env_content)?;

        let compose_content = format!(
            "{COMPOSE_BANNER}{}",
            to_yaml(&self.compose_file, &manifests.compose)?
        );
        atomic_write(&self.compose_file, &compose_content)?;

        let config_content = format!(
            "{CONFIG_BANNER}{}",
            to_yaml(&self.config_file, &manifests.configs)?
        );
        atomic_write(&self.config_file, &config_content)?;

        Ok(())
    }
}

fn read_yaml(path: &Path) -> Result<Value, StoreError> {
    let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn to_yaml(path: &Path, value: &Value) -> Result<String, StoreError> {
    serde_yaml::to_string(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })
}

fn atomic_write(path: &Path, content: &str) -> Result<(), StoreError> {
    let write_err = |source: io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(content.as_bytes()).map_err(write_err)?;
    tmp.persist(path)
        .map_err(|persist| write_err(persist.error))?;
    Ok(())
}

/// Removes the retired updater service and every `labels` key from the
/// services and from the reusable template.
fn strip_legacy(compose: &mut Value) {
    if let Some(services) = compose
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
    {
        services.remove(LEGACY_UPDATER);
        for (_, service) in services.iter_mut() {
            if let Some(service) = service.as_mapping_mut() {
                service.remove("labels");
            }
        }
    }
    if let Some(template) = compose
        .get_mut("x-infrasonar-template")
        .and_then(Value::as_mapping_mut)
    {
        template.remove("labels");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const COMPOSE: &str = r#"
services:
  ping-probe:
    image: ghcr.io/infrasonar/ping-probe
    labels:
      com.centurylinklabs.watchtower.enable: "true"
  watchtower:
    image: containrrr/watchtower
  rapp:
    image: ghcr.io/infrasonar/rapp
x-infrasonar-template:
  restart: always
  labels:
    com.centurylinklabs.watchtower.enable: "true"
"#;

    const CONFIGS: &str = r#"
ping:
  config:
    interval: 5
"#;

    const ENV: &str = "AGENTCORE_TOKEN=0123456789abcdef0123456789abcdef\nAGENT_TOKEN=\nAGENTCORE_ZONE_ID=1\nSOCAT_TARGET_ADDR=\n";

    fn store_in(dir: &TempDir) -> ManifestStore {
        fs::write(dir.path().join("docker-compose.yml"), COMPOSE).unwrap();
        fs::write(dir.path().join("infrasonar.yaml"), CONFIGS).unwrap();
        fs::write(dir.path().join(".env"), ENV).unwrap();
        ManifestStore {
            compose_file: dir.path().join("docker-compose.yml"),
            config_file: dir.path().join("infrasonar.yaml"),
            env_file: dir.path().join(".env"),
        }
    }

    #[test]
    fn load_strips_legacy_service_and_labels() {
        let dir = TempDir::new().unwrap();
        let manifests = store_in(&dir).load().unwrap();

        let services = manifests.services().unwrap();
        assert!(!services.contains_key(LEGACY_UPDATER));
        let probe = services.get("ping-probe").unwrap().as_mapping().unwrap();
        assert!(!probe.contains_key("labels"));

        let template = manifests
            .compose
            .get("x-infrasonar-template")
            .unwrap()
            .as_mapping()
            .unwrap();
        assert!(!template.contains_key("labels"));
    }

    #[test]
    fn load_reads_env_values() {
        let dir = TempDir::new().unwrap();
        let manifests = store_in(&dir).load().unwrap();
        assert_eq!(
            manifests.env.agentcore_token,
            "0123456789abcdef0123456789abcdef"
        );
        assert_eq!(manifests.env.agent_token, "");
        assert_eq!(manifests.env.agentcore_zone_id, 1);
    }

    #[test]
    fn write_round_trips_with_banner() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let manifests = store.load().unwrap();
        store.write(&manifests).unwrap();

        let content = fs::read_to_string(dir.path().join("docker-compose.yml")).unwrap();
        assert!(content.starts_with("## InfraSonar docker-compose.yml file"));
        let content = fs::read_to_string(dir.path().join("infrasonar.yaml")).unwrap();
        assert!(content.contains("managed by InfraSonar"));

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.env, manifests.env);
        assert_eq!(reloaded.compose, manifests.compose);
        assert_eq!(reloaded.configs, manifests.configs);
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let manifests = store.load().unwrap();
        store.write(&manifests).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3, "unexpected files: {names:?}");
    }

    #[test]
    fn broken_env_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(dir.path().join(".env"), "AGENTCORE_ZONE_ID=nope\n").unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::EnvFile { .. }));
    }
}
