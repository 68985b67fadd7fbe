//! SAT>IP client core.
//!
//! Discovers SAT>IP tuner servers on the local network, negotiates RTSP
//! streaming sessions, receives MPEG-TS over RTP (unicast, multicast or
//! interleaved in RTSP/TCP) and hands a continuous transport-stream byte
//! pipe plus tuning and signal metadata to a host receiver application.
//!
//! The host-facing surface is [`device::DeviceSet`] /
//! [`device::SatipDevice`]: fixed at startup, one logical DVB tuner each.
//! Everything else (discovery, server registry, the shared poller, the
//! per-tuner state machines) runs on background tasks.

pub mod channel;
pub mod command;
pub mod config;
pub mod device;
pub mod discover;
pub mod error;
pub mod logging;
pub mod params;
pub mod poller;
pub mod server;
pub mod socket;
pub mod source;
pub mod tuner;

pub use channel::{ChannelDescriptor, ChannelPids};
pub use config::SatipConfig;
pub use device::{DeviceSet, SatipDevice};
pub use error::{Result, SatipError};
pub use source::Source;
