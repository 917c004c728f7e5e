//! Heart-rate monitor client for BLE Heart Rate Service peripherals.
//!
//! Scan for a strap, pick an address, and a supervisor keeps a connection to
//! it alive, decoding every Heart Rate Measurement notification into a
//! bounded rolling history the consumer drains at its own pace.

pub mod config;
pub mod connection;
pub mod delivery;
pub mod device_scanner;
pub mod error;
pub mod heart_rate;
pub mod link;
pub mod link_mock;
pub mod sample_buffer;
pub mod state;
pub mod supervisor;

pub use config::Config;
pub use connection::{ConnectionManager, MonitorSession};
pub use delivery::{EventReceiver, EventSender, LifecycleEvent};
pub use device_scanner::{scan, PeripheralDescriptor, ScanSession};
pub use error::{ConnectError, DecodeError, FatalReason, ScanError, SessionError, SubscribeError};
pub use heart_rate::{decode, Sample};
pub use link::{BtleplugLink, HeartRateLink};
pub use sample_buffer::SampleBuffer;
pub use state::{ConnectionState, RetryPolicy};
pub use supervisor::{ConnectionSupervisor, SupervisorHandle};
