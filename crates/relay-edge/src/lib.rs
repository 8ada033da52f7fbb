//! Edge side of the relay: a [`DeliveryClient`] holding the push stream open
//! and a [`CommandExecutor`] that drives the physical device.

pub mod client;
pub mod error;
pub mod executor;
pub mod stream;

pub use client::{DeliveryClient, DispatchOutcome, SessionEnd};
pub use error::{EdgeError, Result};
pub use executor::{CommandExecutor, DeviceDriver};
pub use stream::{CommandStream, Connector, HttpConnector, SseEvent, SseParser};
