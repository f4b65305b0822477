use std::sync::atomic::Ordering;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pvgpu_backend::{BackendService, Config};
use pvgpu_protocol::{PVGPU_VERSION_MAJOR, PVGPU_VERSION_MINOR};

fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("PVGPU backend service starting...");
    info!(
        "protocol version: {}.{}",
        PVGPU_VERSION_MAJOR, PVGPU_VERSION_MINOR
    );

    // Optional config file path as the first argument.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    info!("configuration loaded: {:?}", config);

    let mut service = BackendService::new(config);

    let shutdown = service.shutdown_flag();
    ctrlc::set_handler(move || {
        info!("ctrl-c received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .expect("error setting ctrl-c handler");

    service.init_link()?;
    service.perform_handshake()?;
    service.init_renderer()?;
    service.start_link_reader()?;

    info!("backend service ready, processing commands...");
    let result = service.run_loop();

    service.publish_shutdown();
    info!("backend service shutting down");
    service.join_reader();

    result
}
