use std::time::Duration;

use anyhow::Context;
use inkdev_core::config::ConfigBuilder;
use inkdev_core::prelude::CancellationToken;
use inkdev_devices::device::PairingDecision;
use inkdev_devices::properties::{device, smart_pad};
use inkdev_devices::transports::sim::HandshakeStep;
use inkdev_devices::transports::{SimulatedConnector, SimulatedDevice, SimulatedDiscovery};
use inkdev_devices::{
    ConnectOptions, DeviceDescriptor, DeviceFactory, DeviceModel, DeviceStatus, DeviceWatcher,
    Session, TransportKind, WatcherEvent,
};
use tokio::time::timeout;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let slate = DeviceDescriptor::new("ble:c4:2a:91", "Bamboo Slate", TransportKind::Ble, DeviceModel::SmartPad);

    // A pad that asks the user to tap its button before it talks to us
    let connector = SimulatedConnector::new(TransportKind::Ble);
    connector.add(
        SimulatedDevice::new(slate.clone())
            .with_handshake(vec![
                HandshakeStep::Status(DeviceStatus::ExpectingConnectionConfirmation),
                HandshakeStep::Status(DeviceStatus::Idle),
            ])
            .with_property(device::NAME, "Bamboo Slate".into())
            .with_property(smart_pad::BATTERY_LEVEL, 87u32.into()),
    );

    // inkdev.toml and INKDEV__SECTION__KEY variables override the defaults
    let mut config = ConfigBuilder::new()
        .with_config_file("inkdev.toml")
        .with_environment_prefix("INKDEV")
        .build()?;
    inkdev_core::logging::init_from_config(&config.logging)?;

    let data_dir = tempfile::tempdir()?;
    config.general.data_dir = data_dir.path().to_string_lossy().into_owned();

    let options = ConnectOptions::from_config(&config)?
        .with_status_observer(|status| {
            let prompt = status.prompt();
            if !prompt.is_empty() {
                info!("{}", prompt);
            }
        })
        .with_pairing_mode_handler(|device: DeviceDescriptor| async move {
            info!("{} entered pairing mode, keeping it", device);
            PairingDecision::Keep
        });
    let session = Session::new(config, DeviceFactory::new().with_connector(connector))?.with_options(options);

    // Scan until the pad shows up
    let watcher = DeviceWatcher::new(SimulatedDiscovery::new(TransportKind::Ble).with_device(slate.clone()));
    let mut events = watcher.subscribe();
    watcher.start();
    let found = loop {
        match timeout(Duration::from_secs(5), events.recv()).await? {
            Some(WatcherEvent::DeviceAdded(descriptor)) => break descriptor,
            Some(other) => info!("Watcher: {:?}", other),
            None => anyhow::bail!("watcher closed"),
        }
    };
    watcher.stop().await;
    info!("Found {}", found);

    let cancel = CancellationToken::new();
    let pad = session
        .connect(&found, &cancel)
        .await?
        .into_device()
        .context("pairing was declined")?;

    let keys = [device::NAME, smart_pad::BATTERY_LEVEL, device::SERIAL_NUMBER];
    for (key, value) in pad.get_properties(&keys, &cancel).await {
        match value {
            Ok(value) => info!("{} = {}", key, value),
            Err(e) => info!("{} unavailable: {}", key, e),
        }
    }

    session.disconnect().await?;

    // The descriptor was persisted, so the next start needs no confirmation
    if let Some(outcome) = session.restore(&cancel).await? {
        let pad = outcome.into_device().context("restore declined")?;
        info!("Restored {} with status {}", pad.descriptor(), pad.status());
    }
    session.forget().await?;
    Ok(())
}
