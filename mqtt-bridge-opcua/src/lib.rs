//! MQTT bridge for OPC UA servers.
//!
//! This bridge subscribes to the variables listed in a tag catalog,
//! publishes their values to MQTT, and writes commands received on MQTT
//! back to the server.
//!
//! # Topics
//!
//! ```text
//! <prefix>/<path>               current value (retained per configuration)
//! <prefix>/<path>/set           commands for read/write tags
//! <prefix>/<path>/status        "ok" after a successful write
//! <prefix>/<path>/error         write or decode failure text
//! <prefix>/meta/availability    retained "online" / "offline"
//! ```
//!
//! When the catalog is empty the address space can be browsed once at
//! startup to export the variables and generate a catalog.

pub mod catalog;
pub mod client;
pub mod config;
pub mod device;
pub mod discovery;
pub mod payload;
pub mod router;
pub mod security;
pub mod session;
