use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use solarflow_bt_manager::config::{Cli, RunMode};
use solarflow_bt_manager::{BluestTransport, Bridge, MqttPublisher, Publisher, TelemetrySink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter());
    debug!(os = std::env::consts::OS, arch = std::env::consts::ARCH, version = env!("CARGO_PKG_VERSION"), "starting");

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(errors) => {
            error!("configuration errors:");
            for err in errors {
                error!("  - {err}");
            }
            info!("run with -h for usage information");
            return Ok(ExitCode::FAILURE);
        }
    };

    match &config.mode {
        RunMode::CloudDisconnect { .. } => info!("disconnecting Solarflow Hub from Zendure Cloud"),
        RunMode::CloudConnect { .. } => info!("connecting Solarflow Hub back to Zendure Cloud"),
        RunMode::InfoOnly | RunMode::Continuous => {}
    }

    let publisher = config.mqtt.as_ref().map(|settings| Arc::new(MqttPublisher::connect(settings)));
    let sink = Arc::new(TelemetrySink::new(
        publisher.clone().map(|publisher| publisher as Arc<dyn Publisher>),
        config.product_id.clone(),
        config.device_id.clone(),
    ));
    let transport = Arc::new(BluestTransport::new().await.context("opening Bluetooth adapter")?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted by user, exiting");
                cancel.cancel();
            }
        });
    }

    let result = Bridge::new(transport, sink, &config).run(&cancel).await;

    if let Some(publisher) = publisher {
        publisher.disconnect().await;
    }

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!(%err, "run failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}
