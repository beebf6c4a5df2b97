//! BLE GATT transport over `btleplug`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Advertisement;
use crate::transport::{Endpoint, Inbound, Transport, TransportFuture};

/// GATT connection to one peripheral.
pub struct BleTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristics: Option<BTreeSet<Characteristic>>,
    tasks: Vec<JoinHandle<()>>,
    connected: bool,
}

impl BleTransport {
    /// Wraps a peripheral found by `adapter`.
    #[must_use]
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
            characteristics: None,
            tasks: Vec::new(),
            connected: false,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .iter()
            .flatten()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicMissing {
                uuid: uuid.to_string(),
            })
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn characteristic_uuid(endpoint: Endpoint) -> Result<Uuid> {
    match endpoint {
        Endpoint::Characteristic(uuid) => Ok(uuid),
        Endpoint::Port(_) => Err(Error::CharacteristicMissing {
            uuid: endpoint.to_string(),
        }),
    }
}

impl Transport for BleTransport {
    fn connect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.connected {
                return Ok(());
            }
            let address = self.peripheral.address();
            tracing::debug!("connecting to {}", address);
            self.peripheral.connect().await.map_err(|e| match e {
                btleplug::Error::DeviceNotFound => Error::TransportNotFound {
                    address: address.to_string(),
                },
                other => Error::Ble(other),
            })?;

            if self.characteristics.is_none() {
                self.peripheral.discover_services().await?;
                self.characteristics = Some(self.peripheral.characteristics());
            }
            self.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.stop_tasks();
            if self.connected {
                self.connected = false;
                if let Err(e) = self.peripheral.disconnect().await {
                    tracing::warn!("failed to disconnect peripheral: {}", e);
                }
            }
            Ok(())
        })
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.characteristics
            .iter()
            .flatten()
            .map(|c| Endpoint::Characteristic(c.uuid))
            .collect()
    }

    fn write(&mut self, endpoint: Endpoint, data: Bytes) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let characteristic = self.characteristic(characteristic_uuid(endpoint)?)?;
            let write_type = if characteristic
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
            {
                WriteType::WithoutResponse
            } else {
                WriteType::WithResponse
            };
            self.peripheral
                .write(&characteristic, &data, write_type)
                .await?;
            Ok(())
        })
    }

    fn read(&mut self, endpoint: Endpoint) -> TransportFuture<'_, Bytes> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let characteristic = self.characteristic(characteristic_uuid(endpoint)?)?;
            let value = self.peripheral.read(&characteristic).await?;
            Ok(Bytes::from(value))
        })
    }

    fn subscribe(
        &mut self,
        endpoint: Endpoint,
        sender: mpsc::Sender<Inbound>,
    ) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let uuid = characteristic_uuid(endpoint)?;
            let characteristic = self.characteristic(uuid)?;
            self.peripheral.subscribe(&characteristic).await?;

            let mut notifications = self.peripheral.notifications().await?;
            let tx = sender.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != uuid {
                        continue;
                    }
                    if tx
                        .send(Inbound::Packet(Bytes::from(notification.value)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));

            let mut events = self.adapter.events().await?;
            let id = self.peripheral.id();
            self.tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(gone) = event {
                        if gone == id {
                            let _ = sender.send(Inbound::Closed).await;
                            break;
                        }
                    }
                }
            }));
            Ok(())
        })
    }

    fn clear_cache(&mut self) {
        tracing::debug!("dropping cached services of {}", self.peripheral.address());
        self.characteristics = None;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Scans for advertising controllers on the first adapter.
pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    /// Opens the first Bluetooth adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::transport("no Bluetooth adapter found"))?;
        Ok(Self { adapter })
    }

    /// Scans for `duration` and returns every advertisement seen.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            found.push(Advertisement::Ble {
                address: properties.address.to_string(),
                name: properties.local_name,
                manufacturer_data: properties.manufacturer_data.into_iter().collect::<BTreeMap<_, _>>(),
                services: properties.services,
            });
        }
        tracing::debug!("scan found {} peripheral(s)", found.len());
        Ok(found)
    }

    /// Creates a transport for a previously scanned address.
    pub async fn transport(&self, address: &str) -> Result<BleTransport> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address)
                || peripheral.id().to_string() == address
            {
                return Ok(BleTransport::new(self.adapter.clone(), peripheral));
            }
        }
        Err(Error::TransportNotFound {
            address: address.to_string(),
        })
    }
}
