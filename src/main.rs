//! CLI Entry Point for edge-link
//!
//! Offline tools work on files and need no radio:
//! - `pack`: turn exported classifier weights into a device model blob
//! - `inspect`: validate a blob and print its header and labels
//! - `decode-frame`: decode one hex-encoded sensor notification
//! - `config`: print the effective configuration
//! - `demo`: run connect, stream, link loss and upload against a simulated board
//!
//! With the `ble` feature the same flows run against real hardware:
//! - `info`, `stream`, `upload`
//!
//! # Usage
//!
//! ```bash
//! edge-link pack --weights gestures.json --out gestures.bin
//! edge-link inspect gestures.bin
//! edge-link --config lab.toml upload gestures.bin
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use edge_link::config::{LinkConfig, DEFAULT_CONFIG_PATH};
use edge_link::link::{ConnectOutcome, ConnectionState};
use edge_link::logging;
use edge_link::model::{pack, DenseLayer, DeviceWeights, ModelBlob, SimpleNet};
use edge_link::protocol::{
    decode_sensor_frame, RawSample, UploadPhase, UploadResultCode, UploadStatus, NN_HIDDEN_SIZE,
    NN_INPUT_SIZE, SENSOR_CHAR_UUID,
};
use edge_link::transport::mock::{MockCentral, MockPeripheral};
use edge_link::transport::BleCentral;
use edge_link::{ConnectionManager, StreamMultiplexer, UploadProgress, UploadService};

#[derive(Parser)]
#[command(name = "edge-link")]
#[command(about = "Host tools for the Edge AI sensor board", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack exported weights into a device model blob
    Pack {
        /// JSON file with `labels` and two dense `layers` ({kernel, bias})
        #[arg(long)]
        weights: PathBuf,

        /// Output blob path
        #[arg(long)]
        out: PathBuf,
    },

    /// Validate a model blob and print its contents
    Inspect {
        /// Blob file
        file: PathBuf,
    },

    /// Decode one hex-encoded sensor frame
    DecodeFrame {
        /// 34 hex digits, spaces allowed
        hex: String,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Exercise the whole link against a simulated board
    Demo,

    /// Read the device descriptor
    #[cfg(feature = "ble")]
    Info,

    /// Print streamed records for a while
    #[cfg(feature = "ble")]
    Stream {
        /// How long to stream
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Stream on-device inference results instead of raw frames
        #[arg(long)]
        inference: bool,
    },

    /// Upload a model blob
    #[cfg(feature = "ble")]
    Upload {
        /// Blob file produced by `pack`
        file: PathBuf,
    },
}

/// Weight export consumed by `pack`.
#[derive(Deserialize)]
struct WeightsFile {
    labels: Vec<String>,
    /// Hidden then output layer
    layers: Vec<DenseLayer>,
}

impl WeightsFile {
    /// Checks that the exported layers chain into one classifier.
    fn into_network(self) -> Result<(SimpleNet, Vec<String>)> {
        let mut layers = self.layers.into_iter();
        let (Some(hidden), Some(output), None) = (layers.next(), layers.next(), layers.next())
        else {
            bail!("expected exactly two dense layers (hidden, output)");
        };
        Ok((SimpleNet::from_layers(hidden, output)?, self.labels))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LinkConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config).context("Failed to initialise logging")?;

    match cli.command {
        Commands::Pack { weights, out } => pack_weights(&weights, &out),
        Commands::Inspect { file } => inspect(&file),
        Commands::DecodeFrame { hex } => decode_frame(&hex),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Demo => demo(config).await,
        #[cfg(feature = "ble")]
        Commands::Info => ble::info(config).await,
        #[cfg(feature = "ble")]
        Commands::Stream { seconds, inference } => ble::stream(config, seconds, inference).await,
        #[cfg(feature = "ble")]
        Commands::Upload { file } => ble::upload(config, &file).await,
    }
}

fn pack_weights(weights: &Path, out: &Path) -> Result<()> {
    let text = std::fs::read_to_string(weights)
        .with_context(|| format!("Failed to read {}", weights.display()))?;
    let export: WeightsFile = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", weights.display()))?;

    let (net, labels) = export.into_network()?;
    let device = DeviceWeights::extract(&net)?;
    let blob = pack(&device, &labels)?;
    std::fs::write(out, blob.as_bytes())
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!(
        "Packed {} classes into {} ({} bytes, CRC-32 {:#010x})",
        blob.class_count(),
        out.display(),
        blob.len(),
        blob.crc32()
    );
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let blob = ModelBlob::from_bytes(bytes.into())?;
    let model = ModelBlob::parse(blob.as_bytes())?;

    println!("Model blob: {}", file.display());
    println!("  Size:    {} bytes", blob.len());
    println!("  CRC-32:  {:#010x}", blob.crc32());
    println!("  Layout:  {NN_INPUT_SIZE} -> {NN_HIDDEN_SIZE} -> {}", model.class_count);
    for (i, label) in model.labels.iter().enumerate() {
        println!("  Class {i}: {label}");
    }

    let baseline = model.predict(&[0.0; NN_INPUT_SIZE])?;
    println!(
        "  Zero input predicts class {} ({:.1}%)",
        baseline.class_index,
        baseline.confidence * 100.0
    );
    Ok(())
}

/// Parses hex digits, ignoring whitespace.
fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    let digits: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() {
        bail!("Invalid hex: non-ASCII input");
    }
    if digits.len() % 2 != 0 {
        bail!("Invalid hex: odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .context("Invalid hex")
}

fn decode_frame(hex: &str) -> Result<()> {
    let bytes = parse_hex(hex)?;
    match decode_sensor_frame(&bytes) {
        Some(frame) => {
            println!("{}", serde_json::to_string_pretty(&frame)?);
            Ok(())
        }
        None => bail!("not a valid sensor frame (length or checksum mismatch)"),
    }
}

/// Prints every milestone, but chunk progress only once per 10%.
fn progress_printer() -> impl Fn(UploadProgress) + Send + Sync {
    let last_decile = AtomicUsize::new(usize::MAX);
    move |progress| {
        if let UploadProgress::Uploading { sent, total } = &progress {
            let decile = sent * 10 / (*total).max(1);
            if last_decile.swap(decile, Ordering::Relaxed) == decile {
                return;
            }
        }
        println!("  {progress}");
    }
}

async fn demo(config: LinkConfig) -> Result<()> {
    println!("Edge Link demo (simulated board)");

    let board = MockPeripheral::edge_ai(format!("{}-demo", config.discovery.name_prefix));
    let central: Arc<dyn BleCentral> = Arc::new(MockCentral::new(board.clone()));
    let manager = ConnectionManager::open(central, config)?;

    if manager.connect().await? == ConnectOutcome::Cancelled {
        return Ok(());
    }
    let info = manager.get_device_info().await?;
    println!(
        "Connected: firmware {}, {:?}, window {} @ {} Hz",
        info.firmware_version(),
        info.variant,
        info.window_size,
        info.sample_rate_hz
    );

    let streams = StreamMultiplexer::new(manager.clone());
    streams
        .start_sensor_stream(|frame| {
            println!(
                "  frame {:5}  accel {:+.2} {:+.2} {:+.2} g",
                frame.sequence, frame.accel[0], frame.accel[1], frame.accel[2]
            );
        })
        .await?;
    for sequence in [0u16, 1, 2, 5, 6] {
        let sample = RawSample {
            accel: [0, 0, 8192],
            gyro: [0; 3],
            sequence,
            timestamp_ms: sequence * 20,
        };
        board.notify(SENSOR_CHAR_UUID, sample.to_frame().to_vec());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("Stream stats: {:?}", streams.stats());

    println!("Dropping the link...");
    board.drop_link("supervision timeout");
    let mut status = manager.subscribe_status();
    status
        .wait_for(|s| s.state == ConnectionState::Reconnecting)
        .await
        .context("Status channel closed")?;
    println!("  state: {}", manager.state());
    let settled = status
        .wait_for(|s| s.state != ConnectionState::Reconnecting)
        .await
        .context("Status channel closed")?
        .clone();
    if !settled.is_connected() {
        bail!("reconnect failed: {:?}", settled.last_error);
    }
    println!("Reconnected; sensor stream still active: {:?}", streams.active_mode());
    streams.stop_sensor_stream().await?;

    let net = SimpleNet::new(NN_INPUT_SIZE, NN_HIDDEN_SIZE, 3, 42);
    let labels = vec!["rest".to_string(), "wave".to_string(), "shake".to_string()];
    let blob = pack(&DeviceWeights::extract(&net)?, &labels)?;
    board.push_status(UploadStatus {
        phase: UploadPhase::Complete,
        progress: 100,
        code: UploadResultCode::Success,
    });
    println!("Uploading model ({} bytes)", blob.len());
    UploadService::new(manager.clone())
        .upload_model(&blob, progress_printer())
        .await?;

    manager.close().await;
    println!("Done");
    Ok(())
}

#[cfg(feature = "ble")]
mod ble {
    use super::*;
    use edge_link::transport::btle::BtleCentral;

    async fn connected(config: LinkConfig) -> Result<Option<ConnectionManager>> {
        let central: Arc<dyn BleCentral> = Arc::new(BtleCentral::new().await?);
        let manager = ConnectionManager::open(central, config)?;
        match manager.connect().await? {
            ConnectOutcome::Cancelled => Ok(None),
            _ => Ok(Some(manager)),
        }
    }

    pub async fn info(config: LinkConfig) -> Result<()> {
        let Some(manager) = connected(config).await? else {
            return Ok(());
        };
        let info = manager.get_device_info().await?;
        let device_config = manager.read_config().await?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        println!("{}", serde_json::to_string_pretty(&device_config)?);
        manager.close().await;
        Ok(())
    }

    pub async fn stream(config: LinkConfig, seconds: u64, inference: bool) -> Result<()> {
        let Some(manager) = connected(config).await? else {
            return Ok(());
        };
        let streams = StreamMultiplexer::new(manager.clone());
        if inference {
            streams
                .start_inference(|r| println!("class {} ({}%)", r.class_index, r.confidence))
                .await?;
        } else {
            streams
                .start_sensor_stream(|f| {
                    println!(
                        "{:5} {:+.3} {:+.3} {:+.3} {:+.1} {:+.1} {:+.1}",
                        f.sequence, f.accel[0], f.accel[1], f.accel[2], f.gyro[0], f.gyro[1], f.gyro[2]
                    )
                })
                .await?;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }

        if inference {
            streams.stop_inference().await?;
        } else {
            streams.stop_sensor_stream().await?;
        }
        eprintln!("{}", serde_json::to_string(&streams.stats())?);
        manager.close().await;
        Ok(())
    }

    pub async fn upload(config: LinkConfig, file: &Path) -> Result<()> {
        let bytes =
            std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        let blob = ModelBlob::from_bytes(bytes.into())?;
        let Some(manager) = connected(config).await? else {
            return Ok(());
        };
        let result = UploadService::new(manager.clone())
            .upload_model(&blob, progress_printer())
            .await;
        manager.close().await;
        result.context("Model upload failed")
    }
}
