use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use inkdev_core::prelude::CancellationToken;
use inkdev_devices::export::save_csv;
use inkdev_devices::factory::ConnectOptions;
use inkdev_devices::link::ServiceProfile;
use inkdev_devices::services::realtime::{RealTimeEvent, SequenceTracker};
use inkdev_devices::transform::{device_to_view, Point};
use inkdev_devices::transports::{SimulatedConnector, SimulatedDevice};
use inkdev_devices::{
    DeviceDescriptor, DeviceFactory, DeviceModel, InkPoint, InkSample, PointPhase, TransportKind,
};
use tokio::time::timeout;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    inkdev_core::logging::init()?;

    let pad = DeviceDescriptor::new("usb:056a:0357", "Intuos Pro", TransportKind::Usb, DeviceModel::SmartPad);
    let connector = SimulatedConnector::new(TransportKind::Usb);
    let ctl = connector.add(SimulatedDevice::new(pad.clone()).with_service(ServiceProfile::RealTimeInk));
    let factory = DeviceFactory::new().with_connector(connector);

    let cancel = CancellationToken::new();
    let device = factory
        .create_device(&pad, &ConnectOptions::default(), &cancel)
        .await?
        .into_device()
        .context("declined")?;

    let ink = device.real_time_ink().context("no real-time ink service")?;
    ink.set_transform(device_to_view(21600, 14800, 10));
    let mut events = ink.subscribe();
    ink.start(&cancel).await?;

    // Pretend to draw a short line
    let now = Utc::now();
    for i in 0..20u32 {
        let phase = match i {
            0 => PointPhase::Begin,
            19 => PointPhase::End,
            _ => PointPhase::Move,
        };
        let point = InkPoint::new(Point::new(1000.0 + 100.0 * f64::from(i), 2000.0), now)
            .with_sequence(i)
            .with_pressure(0.5);
        ctl.send_sample(InkSample::new(phase, point));
    }

    let mut tracker = SequenceTracker::new();
    let mut captured = Vec::new();
    while captured.len() < 20 {
        match timeout(Duration::from_secs(1), events.recv()).await? {
            Some(RealTimeEvent::Point(sample)) => {
                tracker.observe_sample(&sample);
                captured.push(sample);
            }
            Some(other) => info!("{:?}", other),
            None => break,
        }
    }
    info!("Captured {} points, {} dropped", captured.len(), tracker.dropped());

    ink.stop(&cancel).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("capture.csv");
    let rows = save_csv(&path, &captured).await?;
    info!("Wrote {} rows to {}", rows, path.display());

    device.close().await?;
    Ok(())
}
