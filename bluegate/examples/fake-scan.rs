use std::time::Duration;

use bluegate::characteristic::CharacteristicProperties;
use bluegate::fake::{FakeAdapter, FakeCharacteristic, FakeDevice, FakeService};
use bluegate::session::{Backend, SessionConfig};
use bluegate::uuid::{to_short_string, uuid_from_u16};
use bluegate::Event;
use futures::StreamExt;
use log::{info, warn};

const HEART_RATE_SERVICE: u16 = 0x180D;
const HEART_RATE_MEASUREMENT: u16 = 0x2A37;

fn heart_rate_monitor() -> FakeDevice {
    let service = to_short_string(&uuid_from_u16(HEART_RATE_SERVICE));
    let measurement = to_short_string(&uuid_from_u16(HEART_RATE_MEASUREMENT));
    FakeDevice::new("hrm-1").with_name("Fake HRM")
                            .with_address("e2:4f:91:0c:5a:33")
                            .with_rssi(-48)
                            .with_manufacturer_data(&[0x59, 0x00])
                            .with_service(FakeService::new(&service)
                                .with_characteristic(FakeCharacteristic::new(&measurement,
                                    CharacteristicProperties::NOTIFY)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder().filter_level(log::LevelFilter::Warn) // Default Log Level
                                          .parse_default_env()
                                          .init();

    let adapter = FakeAdapter::new();
    let hrm = adapter.add_device(heart_rate_monitor());
    let service = to_short_string(&uuid_from_u16(HEART_RATE_SERVICE));
    let measurement = to_short_string(&uuid_from_u16(HEART_RATE_MEASUREMENT));

    let mut config = SessionConfig::new();
    config.set_backend(Backend::Fake(adapter.clone()))
          .set_operation_timeout(Some(Duration::from_secs(10)))
          .set_scan_duration(Some(Duration::from_secs(2)));
    let session = config.start().await?;
    let mut events = Box::pin(session.events()?);

    session.start_scanning().await?;

    let mut beats = 0;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), events.next()).await {
        println!("{}", serde_json::to_string(&event)?);

        match event {
            Event::DeviceDiscovered { peripheral } if peripheral.id == hrm => {
                session.connect(&hrm).await?;
            }
            Event::Connected { .. } => {
                for descriptor in session.list_services(&hrm).await? {
                    info!("Service {}: {} characteristic(s)", descriptor.uuid, descriptor.characteristics.len());
                }
                session.subscribe_notify(&hrm, &service, &measurement).await?;

                // Flags byte then the heart rate in beats per minute
                let adapter = adapter.clone();
                let id = hrm.clone();
                let (service, measurement) = (service.clone(), measurement.clone());
                tokio::spawn(async move {
                    for bpm in [72u8, 72, 75, 79, 81] {
                        adapter.notify(&id, &service, &measurement, &[0x00, bpm]);
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    adapter.disconnect_remote(&id);
                });
            }
            Event::NotificationData { hex, .. } => {
                beats += 1;
                if let Ok(bytes) = hex::decode(&hex) {
                    if let Some(bpm) = bytes.get(1) {
                        println!("Heart rate: {} bpm", bpm);
                    }
                }
            }
            Event::Disconnected { reason, .. } => {
                warn!("Heart rate monitor disconnected ({:?}) after {} measurement(s)", reason, beats);
                break;
            }
            _ => {}
        }
    }

    session.shutdown().await;
    Ok(())
}
