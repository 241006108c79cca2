pub mod config;
pub mod server;

use std::sync::Arc;

use self::config::Config;

/// In order to let integration tests use the controller as a crate and
/// start it directly, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    server::start(&config).await
}
