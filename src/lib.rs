pub mod api;
pub mod config;
pub mod notify;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use crate::{
    config::Config,
    notify::Notifier,
    server::{Registry, ServerContext},
    statistics::Statistics,
};

use service::SlotMaps;

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "remsim-server.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests start the server the same way
/// the binary does, the main function body lives here.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let ctx = Arc::new(ServerContext {
        registry: Registry::default(),
        slotmaps: SlotMaps::default(),
        notifier: Notifier::default(),
        statistics: Statistics::default(),
        config,
    });

    server::start(&ctx).await?;
    api::start_server(ctx).await
}
