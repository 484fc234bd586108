use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use inkdev_core::config::ConfigBuilder;
use inkdev_core::prelude::CancellationToken;
use inkdev_devices::factory::ConnectOptions;
use inkdev_devices::link::ServiceProfile;
use inkdev_devices::services::file_transfer::{BoundedRetry, FileTransferEvent, TransferControl};
use inkdev_devices::transform::Point;
use inkdev_devices::transports::sim::SimFile;
use inkdev_devices::transports::{SimulatedConnector, SimulatedDevice};
use inkdev_devices::{
    DeviceDescriptor, DeviceFactory, DeviceModel, InkDocument, InkPoint, Layer, Result, Stroke,
    TransportKind,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn page(strokes: usize) -> InkDocument {
    let now = Utc::now();
    let strokes = (0..strokes)
        .map(|s| {
            Stroke::new(
                (0..8)
                    .map(|i| InkPoint::new(Point::new(f64::from(i) * 50.0, s as f64 * 300.0), now))
                    .collect(),
            )
        })
        .collect();
    InkDocument::new(now, vec![Layer { strokes }])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // inkdev.toml and INKDEV__SECTION__KEY variables override the defaults
    let config = ConfigBuilder::new()
        .with_config_file("inkdev.toml")
        .with_environment_prefix("INKDEV")
        .build()?;
    inkdev_core::logging::init_from_config(&config.logging)?;

    let slate = DeviceDescriptor::new("ble:c4:2a:91", "Bamboo Slate", TransportKind::Ble, DeviceModel::SmartPad);
    let connector = SimulatedConnector::new(TransportKind::Ble);
    let ctl = connector.add(
        SimulatedDevice::new(slate.clone())
            .with_service(ServiceProfile::FileTransfer)
            .with_file(SimFile::new(page(2)))
            .with_file(SimFile::new(page(5)).failing(2)),
    );
    let factory = DeviceFactory::new().with_connector(connector);

    let cancel = CancellationToken::new();
    let device = factory
        .create_device(&slate, &ConnectOptions::from_config(&config)?, &cancel)
        .await?
        .into_device()
        .context("declined")?;
    let transfer = device.file_transfer().context("no file transfer service")?;

    let mut events = transfer.subscribe_events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                FileTransferEvent::StartingFileDownload { files } => info!("Downloading {} pages", files),
                FileTransferEvent::ServiceError { message } => warn!("Transfer error: {}", message),
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |result: Result<InkDocument>| {
        let tx = tx.clone();
        async move {
            match result {
                Ok(document) => {
                    let _ = tx.send(document);
                }
                Err(e) => warn!("Page failed: {}", e),
            }
            TransferControl::Continue
        }
    };
    transfer
        .start(
            BoundedRetry::from_config(handler, &config.file_transfer),
            config.file_transfer.allow_partial,
            &cancel,
        )
        .await?;

    for _ in 0..2 {
        let document = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .context("transfer stopped")?;
        info!("Received {}", document.description());
    }

    // A page finished while we are connected
    ctl.add_file(SimFile::new(page(1)));
    let document = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .context("transfer stopped")?;
    info!("Received {}", document.description());

    transfer.stop(&cancel).await?;
    device.close().await?;
    Ok(())
}
