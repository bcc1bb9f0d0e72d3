use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod dbus_interface;
mod engine;
mod render;
mod session;

use config::{BusKind, Config};
use controller::Controller;
use dbus_interface::RollcallService;

const BUS_NAME: &str = "org.rollcall.Rollcall1";
const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        timeout_secs = config.timeout.as_secs(),
        policy = ?config.match_policy,
        "configuration loaded"
    );

    let controller = Controller::new(config.clone());

    // The bus comes up first so Status() reports "loading" while models load.
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(
            OBJECT_PATH,
            RollcallService {
                controller: controller.clone(),
            },
        )?
        .build()
        .await?;
    tracing::info!(bus = ?config.bus, name = BUS_NAME, "D-Bus interface registered");

    load_and_start_engine(config, controller).await;

    tracing::info!("rollcalld ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

/// Load the model bundles off the runtime and hand the engine to the controller.
/// Failure leaves the daemon up with recognition disabled.
async fn load_and_start_engine(config: Config, controller: Controller) {
    let loaded = tokio::task::spawn_blocking(move || {
        let models = engine::load_models(&config)?;
        engine::spawn_engine(&config, models)
    })
    .await;

    match loaded {
        Ok(Ok(handle)) => {
            let camera = handle.camera().map(str::to_string);
            controller.models_ready(Arc::new(handle), camera).await;
        }
        Ok(Err(e)) => controller.models_failed(e.to_string()).await,
        Err(e) => controller.models_failed(format!("model loader panicked: {e}")).await,
    }
}
