//! rsp-mqtt-adapter: bridges an RSP controller and its sensors to a
//! device-management host over MQTT.
//!
//! The controller speaks JSON-RPC 2.0 over an MQTT broker. The adapter sends
//! read commands on the command topic and correlates the answers arriving on
//! the response topic, and turns the notifications on the incoming topics into
//! readings for the host. Connection handling, reconnect supervision and
//! request correlation live in the `rsp_mqtt` crate.
//!
//! ## Modules
//!
//! * `config`: TOML application configuration (`[logger]` and the flat
//!   `[protocol]` property map) and its typed `DriverConfig` form.
//!
//! * `core`: runtime components:
//!   - the driver owning the MQTT session lifecycle
//!   - the incoming data listener
//!   - the tag decoder ring (SGTIN and bit-packed tags to URIs)
//!   - host interfaces for readings and sensor registration
//!
//! * `logger`: `tracing` initialization with console and journald outputs.

pub mod config;
pub mod core;
pub mod logger;
