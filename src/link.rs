//! # Heart Rate Link
//!
//! The transport seam between the supervisor and the BLE stack. The
//! supervisor only ever talks to a `HeartRateLink`; `BtleplugLink` is the
//! real implementation and `link_mock` provides a scripted one.
//!
//! A link owns the open connection exclusively. `disconnect` must leave it
//! in a state where `connect` can be called again, including after a
//! `connect` that failed or was abandoned part way.

use std::pin::Pin;
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral as PlatformPeripheral};
use futures::{future, Stream, StreamExt};
use crate::device_scanner::{first_adapter, matches_address};
use crate::error::{ConnectError, LinkError, SubscribeError};
use crate::heart_rate::HEART_RATE_MEASUREMENT_UUID;

/// Raw Heart Rate Measurement payloads; the stream ends when the link drops
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

#[async_trait]
pub trait HeartRateLink: Send {
    /// Opens the transport connection
    async fn connect(&mut self) -> Result<(), LinkError>;

    /// Subscribes to heart-rate notifications on an open connection
    async fn subscribe(&mut self) -> Result<NotificationStream, LinkError>;

    /// Releases the transport. Never fails; errors are logged.
    async fn disconnect(&mut self);
}

const PERIPHERAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn transport_error(e: btleplug::Error) -> LinkError {
    match e {
        btleplug::Error::PermissionDenied => {
            LinkError::Unrecoverable("Bluetooth permission denied".to_string())
        }
        btleplug::Error::DeviceNotFound => LinkError::Connect(ConnectError::DeviceUnreachable),
        btleplug::Error::TimedOut(_) => LinkError::Connect(ConnectError::Timeout),
        other => LinkError::Connect(ConnectError::TransportRejected(other.to_string())),
    }
}

/// `HeartRateLink` over btleplug, addressed by MAC address or platform id
pub struct BtleplugLink {
    address: String,
    connect_timeout: Duration,
    adapter: Option<Adapter>,
    peripheral: Option<PlatformPeripheral>,
}

impl BtleplugLink {
    /// The adapter is opened lazily on the first `connect`.
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            adapter: None,
            peripheral: None,
        }
    }

    async fn adapter(&mut self) -> Result<Adapter, LinkError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = first_adapter().await?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn known_peripheral(&self, adapter: &Adapter) -> Result<Option<PlatformPeripheral>, LinkError> {
        let peripherals = adapter.peripherals().await.map_err(transport_error)?;
        Ok(peripherals
            .into_iter()
            .find(|p| matches_address(p, &self.address)))
    }

    /// Finds the peripheral, scanning for it if the stack has not seen it yet
    async fn find_peripheral(&self, adapter: &Adapter) -> Result<PlatformPeripheral, LinkError> {
        if let Some(peripheral) = self.known_peripheral(adapter).await? {
            return Ok(peripheral);
        }

        log::debug!("{} not known yet, scanning for it", self.address);
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(transport_error)?;

        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let found = loop {
            if let Some(peripheral) = self.known_peripheral(adapter).await? {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(PERIPHERAL_POLL_INTERVAL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }
        found.ok_or(LinkError::Connect(ConnectError::DeviceUnreachable))
    }
}

#[async_trait]
impl HeartRateLink for BtleplugLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let adapter = self.adapter().await?;
        let peripheral = self.find_peripheral(&adapter).await?;

        // Held before connecting so `disconnect` can tear down an attempt that
        // timed out or was cancelled mid-flight.
        self.peripheral = Some(peripheral.clone());

        let already_connected = peripheral.is_connected().await.unwrap_or(false);
        if !already_connected {
            // BlueZ can block forever on an out-of-range device.
            tokio::time::timeout(self.connect_timeout, peripheral.connect())
                .await
                .map_err(|_| LinkError::Connect(ConnectError::Timeout))?
                .map_err(transport_error)?;
        }

        log::info!("Connected to {}", self.address);
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<NotificationStream, LinkError> {
        let adapter = self.adapter().await?;
        let peripheral = self
            .peripheral
            .clone()
            .ok_or(LinkError::Connect(ConnectError::DeviceUnreachable))?;

        tokio::time::timeout(self.connect_timeout, peripheral.discover_services())
            .await
            .map_err(|_| LinkError::Connect(ConnectError::Timeout))?
            .map_err(transport_error)?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == HEART_RATE_MEASUREMENT_UUID)
            .ok_or(LinkError::Subscribe(SubscribeError::CharacteristicNotFound))?;

        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(LinkError::Subscribe(SubscribeError::NotSupported));
        }

        log::info!("Subscribing to characteristic {:?}", characteristic.uuid);
        peripheral.subscribe(&characteristic).await.map_err(|e| match e {
            btleplug::Error::NotSupported(_) => LinkError::Subscribe(SubscribeError::NotSupported),
            other => transport_error(other),
        })?;

        let notifications = peripheral.notifications().await.map_err(transport_error)?;

        // The notification stream does not end reliably on every platform when
        // the device goes away, so the adapter's disconnect event ends it too.
        let events = adapter.events().await.map_err(transport_error)?;
        let id = peripheral.id();
        let lost = async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        break;
                    }
                }
            }
        };

        let payloads = notifications
            .filter_map(|n| future::ready((n.uuid == HEART_RATE_MEASUREMENT_UUID).then_some(n.value)))
            .take_until(lost);

        Ok(Box::pin(payloads))
    }

    async fn disconnect(&mut self) {
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        match tokio::time::timeout(self.connect_timeout, peripheral.disconnect()).await {
            Ok(Ok(())) => log::info!("Disconnected from {}", self.address),
            Ok(Err(e)) => log::debug!("Disconnect from {} reported: {}", self.address, e),
            Err(_) => log::warn!("Disconnect from {} timed out", self.address),
        }
    }
}
