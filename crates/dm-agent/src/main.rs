//! Device management agent: runs one managed endpoint over MQTT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dm_engine::firmware::{CommandInstaller, HttpDownloader};
use dm_engine::{
    CommandActionHandler, DeviceData, DeviceFirmware, DeviceInfo, EndpointConfig, ManagedEndpoint,
    MqttTransport, MqttTransportConfig, Transport,
};
use serde::Deserialize;

/// Take part in cloud device management over MQTT.
#[derive(Parser, Debug)]
#[command(name = "dm-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "dm-agent.toml")]
    config: PathBuf,

    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Seconds to wait for the broker connection.
    #[arg(long, default_value_t = 30)]
    connect_timeout: u64,
}

/// Initial firmware description.
#[derive(Debug, Deserialize)]
struct FirmwareSection {
    version: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
    endpoint: EndpointConfig,
    mqtt: MqttTransportConfig,
    #[serde(default)]
    device_info: DeviceInfo,
    #[serde(default)]
    firmware: Option<FirmwareSection>,
}

impl AgentConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: AgentConfig =
            toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.endpoint = config.endpoint.with_env_overrides();
        config.endpoint.validate()?;
        Ok(config)
    }

    fn device_data(&self) -> DeviceData {
        let mut builder = DeviceData::builder(&self.endpoint.type_id, &self.endpoint.device_id)
            .device_info(self.device_info.clone());
        if let Some(fw) = &self.firmware {
            let mut firmware = DeviceFirmware::new(&fw.version);
            if let Some(name) = &fw.name {
                firmware = firmware.with_name(name);
            }
            builder = builder.firmware(firmware);
        }
        builder.build()
    }
}

fn init_logging(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn wait_connected(transport: &dyn Transport, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !transport.is_connected() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let config = AgentConfig::load(&args.config)?;
    tracing::info!(
        type_id = %config.endpoint.type_id,
        device = %config.endpoint.device_id,
        host = %config.mqtt.host,
        "starting device management agent"
    );

    let transport = Arc::new(MqttTransport::connect(config.mqtt.clone()));
    if !wait_connected(&*transport, Duration::from_secs(args.connect_timeout)).await {
        anyhow::bail!("MQTT broker {}:{} not reachable", config.mqtt.host, config.mqtt.port);
    }

    let endpoint = Arc::new(
        ManagedEndpoint::builder(config.endpoint.clone(), transport.clone())
            .device_data(config.device_data())
            .action_handler(Arc::new(CommandActionHandler::new(config.endpoint.action.clone())))
            .firmware_downloader(Arc::new(HttpDownloader::new(
                config.endpoint.firmware.progress_step_bytes,
            )?))
            .firmware_installer(Arc::new(CommandInstaller::new(config.endpoint.firmware.clone())))
            .build()?,
    );
    endpoint.manage().await.context("Manage request failed")?;

    // Re-manage with the remaining lifetime after a reconnect.
    let watcher = {
        let endpoint = endpoint.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut was_connected = true;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let connected = transport.is_connected();
                if connected && !was_connected && endpoint.is_managed() {
                    let lifetime = endpoint.remaining_lifetime();
                    if let Err(e) = endpoint.manage_for(lifetime).await {
                        tracing::warn!("Re-manage after reconnect failed: {}", e);
                    }
                }
                was_connected = connected;
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    watcher.abort();

    if let Err(e) = endpoint.unmanage().await {
        tracing::warn!("Unmanage failed: {}", e);
    }
    transport.shutdown().await;
    Ok(())
}
