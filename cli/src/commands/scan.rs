//! `layerscan scan` command.
//!
//! Obtains the image from the container runtime, exports it, builds its
//! package inventory and hands it to the remote scanner, printing every
//! result as it arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use futures::StreamExt;
use layerscan_core::config::ScanConfig;
use layerscan_core::error::ScanError;
use layerscan_core::message::ScanStartMessage;
use layerscan_runtime::{
    inventory_from_file, Broker, BrokerMessage, DockerClient, ImageInventory, MemoryBroker,
    MqttBroker, ScanCorrelator,
};

use crate::output;

#[derive(Args)]
pub struct ScanArgs {
    /// Image name (e.g., "debian:11", "registry.local:5000/app:v2")
    pub image: String,

    /// Keep the exported image archive at this path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Host name reported to the scanner (defaults to the image name)
    #[arg(long)]
    pub host_name: Option<String>,

    /// Docker engine socket
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    pub broker_host: Option<String>,

    /// Broker port
    #[arg(long)]
    pub broker_port: Option<u16>,

    /// Seconds without progress before a scan is considered stalled
    #[arg(long)]
    pub scan_timeout: Option<u64>,

    /// Build the scan request and print it without contacting a broker
    #[arg(long)]
    pub dry_run: bool,
}

impl ScanArgs {
    /// Apply command line overrides on top of the loaded configuration.
    fn apply(&self, mut config: ScanConfig) -> Result<ScanConfig, ScanError> {
        if let Some(socket) = &self.socket {
            config.docker.socket_path = socket.clone();
        }
        if let Some(host) = &self.broker_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }
        if let Some(timeout) = self.scan_timeout {
            config.scan.scan_timeout_secs = timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn execute(args: ScanArgs, config: ScanConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.apply(config)?;
    let docker = DockerClient::new(&config.docker);
    docker.ping().await?;
    tracing::debug!(socket = %docker.socket_path().display(), "Container runtime reachable");

    let details = docker.ensure_image(&args.image).await?;
    println!("Image {} ({})", args.image, output::short_id(&details.id));

    // The temp dir must outlive the archive parsing below.
    let (archive_path, _scratch) = match &args.output {
        Some(path) => (path.clone(), None),
        None => {
            let scratch = tempfile::tempdir()?;
            (scratch.path().join("image.tar"), Some(scratch))
        }
    };

    let size = docker.export_image(&args.image, &archive_path).await?;
    println!("Exported {} to {}", output::format_bytes(size), archive_path.display());

    let path = archive_path.clone();
    let inventory = tokio::task::spawn_blocking(move || inventory_from_file(&path)).await??;

    let Some(inventory) = inventory else {
        println!(
            "Image {} has no OS release or dpkg database, nothing to scan",
            args.image
        );
        return Ok(());
    };
    print_summary(&inventory);

    let host_name = args.host_name.clone().unwrap_or_else(|| args.image.clone());

    if args.dry_run {
        let published = dry_run(&config, &host_name, &inventory).await?;
        let request = ScanStartMessage::load(&published.payload)?;
        println!("Would publish to {}:", published.topic);
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    let broker: Arc<dyn Broker> = Arc::new(MqttBroker::connect(&config.broker).await?);
    let correlator = match ScanCorrelator::connect(broker.clone(), config.scan.clone()).await {
        Ok(correlator) => correlator,
        Err(e) => {
            let _ = broker.disconnect().await;
            return Err(e.into());
        }
    };

    let scanned = run_scan(&correlator, &host_name, &inventory).await;
    let shutdown = correlator.shutdown().await;

    let count = scanned?;
    shutdown?;
    println!("Scan complete: {} results", count);
    Ok(())
}

fn print_summary(inventory: &ImageInventory) {
    println!("Tags:     {}", inventory.tags.join(", "));
    println!("Layers:   {}", inventory.layers.len());
    println!(
        "OS:       {} ({})",
        inventory.operating_system(),
        inventory.os_release
    );
    println!("Packages: {}", inventory.packages.len());
}

/// Start the scan and print results until it finishes or Ctrl-C.
async fn run_scan(
    correlator: &ScanCorrelator,
    host_name: &str,
    inventory: &ImageInventory,
) -> Result<usize, ScanError> {
    let scan_id = correlator
        .start_scan(host_name, &inventory.operating_system(), inventory.package_list())
        .await?;
    println!("Started scan {}", scan_id);

    let mut results = correlator.stream_results(&scan_id)?;
    let mut count = 0;
    loop {
        let next = tokio::select! {
            next = results.next() => next,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(scan_id = %scan_id, "Interrupted, cancelling scan");
                correlator.cancel();
                continue;
            }
        };

        match next {
            Some(Ok(result)) => {
                println!("{}", output::result_line(&result));
                count += 1;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(count),
        }
    }
}

/// Publish the start request to an in-memory broker and return it.
async fn dry_run(
    config: &ScanConfig,
    host_name: &str,
    inventory: &ImageInventory,
) -> Result<BrokerMessage, ScanError> {
    let memory = Arc::new(MemoryBroker::new(config.broker.channel_capacity));
    let mut tap = memory.tap();
    let correlator = ScanCorrelator::connect(memory.clone(), config.scan.clone()).await?;

    let started = correlator
        .start_scan(host_name, &inventory.operating_system(), inventory.package_list())
        .await;
    correlator.cancel();
    correlator.shutdown().await?;
    started?;

    tap.recv()
        .await
        .map_err(|e| ScanError::Broker(format!("Start request not captured: {}", e)))
}
