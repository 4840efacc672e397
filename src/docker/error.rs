use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("docker binary not found")]
    RuntimeMissing,

    #[error("docker too old: v{0}.{1}.{2}")]
    RuntimeTooOld(u64, u64, u64),

    #[error("unable to read docker version from `{0}`")]
    RuntimeUnparseable(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Failed { command: String, stderr: String },
}
