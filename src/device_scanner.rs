//! # Device Scanner
//!
//! Time-boxed discovery of peripherals advertising the Heart Rate Service.
//! A scan never fails just because nothing answered: an empty list is a valid
//! result. Only a missing or broken adapter is an error.

use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::{Stream, StreamExt};
use crate::config::Config;
use crate::error::ScanError;
use crate::heart_rate::HEART_RATE_SERVICE_UUID;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    pub address: String,
    pub display_name: Option<String>,
}

impl PeripheralDescriptor {
    pub fn new(address: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            address: address.into(),
            display_name,
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unknown")
    }
}

/// Anything that can produce a list of nearby peripherals
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<PeripheralDescriptor>, ScanError>;
}

/// Discovery results in first-seen order, one entry per address.
#[derive(Debug, Default)]
pub struct DiscoveryLog {
    found: Vec<PeripheralDescriptor>,
}

impl DiscoveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting. Returns `true` the first time an address is seen.
    ///
    /// A repeat sighting only fills in a display name that was missing.
    pub fn record(&mut self, descriptor: PeripheralDescriptor) -> bool {
        match self
            .found
            .iter_mut()
            .find(|known| known.address.eq_ignore_ascii_case(&descriptor.address))
        {
            Some(known) => {
                if known.display_name.is_none() {
                    known.display_name = descriptor.display_name;
                }
                false
            }
            None => {
                self.found.push(descriptor);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    pub fn into_peripherals(self) -> Vec<PeripheralDescriptor> {
        self.found
    }
}

/// Feeds sightings from `sightings` into `log` until `duration` elapses or the stream ends.
pub async fn collect_for<S>(log: &mut DiscoveryLog, sightings: S, duration: Duration)
where
    S: Stream<Item = PeripheralDescriptor>,
{
    let deadline = tokio::time::Instant::now() + duration;
    let mut sightings = std::pin::pin!(sightings);
    while let Ok(Some(descriptor)) = tokio::time::timeout_at(deadline, sightings.next()).await {
        if log.record(descriptor.clone()) {
            log::info!("Found {} - {}", descriptor.label(), descriptor.address);
        }
    }
}

/// Opens the first Bluetooth adapter on the system
pub async fn first_adapter() -> Result<Adapter, ScanError> {
    let manager = Manager::new().await.map_err(|e| {
        log::error!("Failed to create BLE manager: {}", e);
        ScanError::AdapterUnavailable
    })?;

    let adapters = manager.adapters().await.map_err(|e| {
        log::error!("Failed to get adapters: {}", e);
        ScanError::AdapterUnavailable
    })?;

    adapters.into_iter().next().ok_or(ScanError::AdapterUnavailable)
}

/// Address shown to the operator. macOS hides MAC addresses, so the platform id stands in.
pub fn peripheral_address(peripheral: &PlatformPeripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

/// Whether the operator-supplied `wanted` names this peripheral
pub fn matches_address(peripheral: &PlatformPeripheral, wanted: &str) -> bool {
    let wanted = wanted.trim();
    peripheral.address().to_string().eq_ignore_ascii_case(wanted)
        || peripheral.id().to_string().eq_ignore_ascii_case(wanted)
}

async fn describe(
    peripheral: &PlatformPeripheral,
    require_service: bool,
) -> Option<PeripheralDescriptor> {
    let props = peripheral.properties().await.ok()??;
    if require_service && !props.services.contains(&HEART_RATE_SERVICE_UUID) {
        return None;
    }
    Some(PeripheralDescriptor::new(peripheral_address(peripheral), props.local_name))
}

/// One time-boxed scan over the system's first adapter
#[derive(Debug, Clone)]
pub struct ScanSession {
    duration: Duration,
    service_filter: bool,
}

impl ScanSession {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            service_filter: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.scan_duration()).service_filter(config.filter_heart_rate_service)
    }

    /// Only report peripherals advertising the Heart Rate Service
    pub fn service_filter(mut self, enabled: bool) -> Self {
        self.service_filter = enabled;
        self
    }

    pub async fn scan(&self) -> Result<Vec<PeripheralDescriptor>, ScanError> {
        let adapter = first_adapter().await?;
        let events = adapter
            .events()
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to subscribe to adapter events: {}", e)))?;

        let filter = if self.service_filter {
            ScanFilter {
                services: vec![HEART_RATE_SERVICE_UUID],
            }
        } else {
            ScanFilter::default()
        };

        log::info!("Scanning for {}s...", self.duration.as_secs());
        adapter
            .start_scan(filter)
            .await
            .map_err(|e| ScanError::ScanFailed(format!("Failed to start scan: {}", e)))?;

        let require_service = self.service_filter;
        let sightings = events.filter_map(|event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                describe(&peripheral, require_service).await
            }
        });

        let mut log = DiscoveryLog::new();
        collect_for(&mut log, sightings, self.duration).await;

        if let Err(e) = adapter.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }

        // Peripherals the stack already knew about may never raise a discovery event.
        match adapter.peripherals().await {
            Ok(known) => {
                for peripheral in known {
                    if let Some(descriptor) = describe(&peripheral, require_service).await {
                        log.record(descriptor);
                    }
                }
            }
            Err(e) => log::warn!("Failed to list known peripherals: {}", e),
        }

        log::info!("Scan finished, {} device(s) found", log.len());
        Ok(log.into_peripherals())
    }
}

#[async_trait]
impl Discovery for ScanSession {
    async fn discover(&self) -> Result<Vec<PeripheralDescriptor>, ScanError> {
        self.scan().await
    }
}

/// Scans for nearby heart-rate peripherals for `duration`
pub async fn scan(duration: Duration) -> Result<Vec<PeripheralDescriptor>, ScanError> {
    ScanSession::new(duration).scan().await
}
