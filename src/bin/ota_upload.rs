// ota-upload - command-line front end for chunked OTA uploads
//
// Sends a firmware image to a Bluetooth LE peripheral, or prints the frames
// it would send.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use ota_gatt::ble::platform::GattPlatform;
use ota_gatt::ble::simulated::{SimGattPlatform, SimPeripheral};
use ota_gatt::protocol::image::OtaImage;
use ota_gatt::protocol::reassembly::ReassemblyLimits;
use ota_gatt::protocol::{split_with, HEADER_LEN, MAX_PAYLOAD_SIZE};
use ota_gatt::{OtaConfig, OtaSession};

#[derive(Parser)]
#[command(name = "ota-upload")]
#[command(about = "Chunked OTA upload over a BLE GATT characteristic", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Payload bytes per frame (overrides the configuration)
    #[arg(long, global = true)]
    mtu: Option<usize>,

    /// Delay after each chunk write, in milliseconds
    #[arg(long, global = true)]
    delay_ms: Option<u64>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a payload to the single matching peripheral
    Send {
        file: PathBuf,
        /// Treat FILE as extractor JSON and pack it as an OTA image
        #[arg(long)]
        image: bool,
        /// Only consider peripherals advertising this name
        #[arg(short, long)]
        target: Option<String>,
        /// Upload to an in-process simulated peripheral
        #[arg(long)]
        simulate: bool,
    },
    /// Print the frames a payload splits into, without sending
    Frames {
        file: PathBuf,
        #[arg(long)]
        image: bool,
    },
    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let mut config = match &cli.config {
        Some(path) => OtaConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => OtaConfig::default(),
    };
    if let Some(mtu) = cli.mtu {
        config.mtu = mtu;
    }
    if let Some(ms) = cli.delay_ms {
        config.chunk_delay = Some(Duration::from_millis(ms));
    }

    match cli.command {
        Commands::Send {
            file,
            image,
            target,
            simulate,
        } => {
            if target.is_some() {
                config.target_name = target;
            }
            config.validate().context("Invalid configuration")?;
            let payload = read_payload(&file, image).await?;

            let platform = if simulate {
                simulated_platform(&config).await
            } else {
                hardware_platform().await?
            };
            let session = OtaSession::new(platform, config);
            let report = session
                .run_detailed(&payload)
                .await
                .context("OTA upload failed")?;

            println!(
                "Sent {} bytes in {} chunks to {} ({})",
                report.bytes, report.chunks, report.peripheral.name, report.peripheral.id
            );
            println!(
                "Attempts: pair {}, connect {}, send {}",
                report.pair_attempts, report.connect_attempts, report.send_attempts
            );
            if let Some(value) = report.read_back {
                println!("Read back: {}", hex::encode(value));
            }
        }
        Commands::Frames { file, image } => {
            config.validate().context("Invalid configuration")?;
            let payload = read_payload(&file, image).await?;
            let frames = split_with(&payload, config.mtu, config.checksum)
                .context("Payload cannot be framed")?;
            for frame in &frames {
                println!(
                    "{:3}/{} {:3} bytes  {}",
                    frame.header.cur_chunk,
                    frame.header.num_chunks,
                    frame.encoded_len(),
                    hex::encode(frame.encode())
                );
            }
        }
        Commands::InitConfig { path } => {
            config
                .save(&path)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote default configuration to {:?}", path);
        }
    }

    Ok(())
}

async fn read_payload(path: &Path, image: bool) -> Result<Vec<u8>> {
    if image {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let image = OtaImage::from_json(&json).context("Invalid image description")?;
        info!(
            "Image: entrypoint {:#06x}, {} code bytes, {} loads",
            image.entrypoint,
            image.code.len(),
            image.loads.len()
        );
        Ok(image.to_payload()?)
    } else {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))
    }
}

/// A single simulated peripheral sized to accept whatever the
/// configuration sends.
async fn simulated_platform(config: &OtaConfig) -> Arc<dyn GattPlatform> {
    let name = config.target_name.clone().unwrap_or_else(|| "OTA-SIM".to_string());
    let peripheral = SimPeripheral::ota_target(&name)
        .with_limits(
            ReassemblyLimits {
                max_chunk_len: config.mtu,
                max_blob_size: MAX_PAYLOAD_SIZE,
            },
            config.checksum,
        )
        .with_max_write_len(config.att_mtu.unwrap_or(config.mtu + HEADER_LEN));

    let platform = SimGattPlatform::new();
    platform.add_peripheral(peripheral).await;
    platform
}

#[cfg(feature = "ble-central")]
async fn hardware_platform() -> Result<Arc<dyn GattPlatform>> {
    let platform = ota_gatt::ble::central::BtleplugPlatform::new()
        .await
        .context("Failed to open Bluetooth adapter")?;
    Ok(platform)
}

#[cfg(not(feature = "ble-central"))]
async fn hardware_platform() -> Result<Arc<dyn GattPlatform>> {
    anyhow::bail!("No BLE backend compiled in; rebuild with --features ble-central or pass --simulate")
}
