use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("invalid value for {name}: `{value}`")]
    InvalidValue { name: &'static str, value: String },
}

/// Process configuration resolved once at startup.
///
/// `LOG_LEVEL` and `LOG_COLORIZED` are consumed by [`crate::logging`]
/// directly and are not part of this struct.
#[derive(Debug, Clone)]
pub struct Environment {
    pub agentcore_host: String,
    pub agentcore_port: u16,
    pub compose_file: PathBuf,
    pub env_file: PathBuf,
    pub config_file: PathBuf,
    /// Directory holding the compose file; working directory for every
    /// container-runtime invocation.
    pub compose_dir: PathBuf,
    pub use_development: bool,
    pub skip_image_prune: bool,
    pub data_path: PathBuf,
    /// Compose service name of this container.
    pub service_name: String,
    pub project_name: String,
    pub allow_remote_access: bool,
}

impl Environment {
    pub fn from_env() -> Result<Self, EnvError> {
        let compose_file =
            PathBuf::from(var_or("COMPOSE_FILE", "/docker/docker-compose.yml"));
        let compose_dir = compose_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Self {
            agentcore_host: var_or("AGENTCORE_HOST", "127.0.0.1"),
            agentcore_port: parse_var("AGENTCORE_PORT", 8770)?,
            env_file: PathBuf::from(var_or("ENV_FILE", "/docker/.env")),
            config_file: PathBuf::from(var_or("CONFIG_FILE", "/config/infrasonar.yaml")),
            use_development: flag_var("USE_DEVELOPMENT")?,
            skip_image_prune: flag_var("SKIP_IMAGE_PRUNE")?,
            data_path: PathBuf::from(var_or("DATA_PATH", "./data")),
            service_name: var_or("SERVICE_NAME", "rapp"),
            project_name: var_or("PROJECT_NAME", "infrasonar"),
            allow_remote_access: flag_var("ALLOW_REMOTE_ACCESS")?,
            compose_file,
            compose_dir,
        })
    }

    /// Leading arguments for every `docker compose` invocation. Pinning the
    /// project name keeps service identity stable even when the compose file
    /// is mounted on a path that differs from the host path.
    pub fn compose_base_args(&self) -> Vec<String> {
        vec![
            "compose".to_string(),
            "-p".to_string(),
            self.project_name.clone(),
            "--progress".to_string(),
            "plain".to_string(),
        ]
    }
}

fn var_or(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, EnvError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| EnvError::InvalidValue { name, value: v }),
        _ => Ok(default),
    }
}

/// `0`/`1` style switch; absent or empty means off.
fn flag_var(name: &'static str) -> Result<bool, EnvError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => match v.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(EnvError::InvalidValue { name, value: v }),
        },
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_vars() {
        // Only defaults are exercised here; the variables themselves are
        // covered by deployment smoke tests to keep this free of global
        // process state.
        let environment = Environment::from_env().unwrap();
        assert_eq!(environment.agentcore_port, 8770);
        assert_eq!(environment.service_name, "rapp");
        assert_eq!(environment.project_name, "infrasonar");
        assert_eq!(
            environment.compose_dir,
            environment.compose_file.parent().unwrap()
        );
    }

    #[test]
    fn compose_base_args_pin_project() {
        let environment = Environment::from_env().unwrap();
        let args = environment.compose_base_args();
        assert_eq!(args[0], "compose");
        assert_eq!(args[1], "-p");
        assert_eq!(args[2], environment.project_name);
    }
}
