//! Fiscal-device gateway.
//!
//! A long-running local service that mediates between business applications
//! (REST clients and an MQTT broker) and a fleet of Datecs fiscal printers
//! and DatecsPay card-payment pinpads attached by serial cable or LAN. It
//! serialises concurrent requests per device, speaks the Datecs fiscal and
//! DatecsPay pinpad wire protocols, enforces transactional sequencing on
//! fiscal operations, and reports structured failures.

pub mod adapters;
pub mod api;
pub mod applog;
pub mod datecs;
pub mod db;
pub mod error;
pub mod models;
pub mod mqtt;
pub mod pinpad;
pub mod queue;
pub mod service;
pub mod settings;
pub mod transport;

pub use error::{GatewayError, Result};
