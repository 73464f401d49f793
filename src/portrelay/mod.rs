pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod relay;
pub mod scan;
pub mod supervisor;
pub mod telemetry;

pub async fn run(args: config::Args) -> anyhow::Result<()> {
    app::run(args).await
}
