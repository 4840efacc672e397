pub mod cli;
pub mod connector;
pub mod docker;
pub mod env;
pub mod logging;
pub mod logview;
pub mod net;
pub mod protocol;
pub mod state;
pub mod store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
