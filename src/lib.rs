#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

//! avlink
//!
//! Protocol engine for A/V hardware controlled over a serial line: video
//! switchers, projectors and similar devices that speak either terminated text
//! commands or checksummed binary frames.
//!
//! Main pieces:
//! - frequency-weighted polling (`RequestScheduler`)
//! - one-request-in-flight link discipline with command priority and timeouts
//! - stream reassembly for text lines and binary frame resynchronization
//! - first-match response rules that update a typed, versioned state model
//! - drivers for Extron SIS switchers and NEC projectors
//!
//! ```no_run
//! use std::sync::Arc;
//! use avlink::{devices, open_serial, DeviceConfig, DeviceEngine, Value};
//!
//! # async fn demo() -> Result<(), avlink::LinkError> {
//! let cfg = DeviceConfig::from_path("switcher.toml".as_ref())?;
//! let protocol = Arc::new(devices::protocol_for(&cfg.driver)?);
//! let (engine, handle) = DeviceEngine::new(&cfg.name, protocol, &cfg.serial)?;
//! let port = open_serial(&cfg.serial)?;
//! tokio::spawn(engine.run(port));
//! handle.state_set("input", Value::from("2")).await?;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod config;
pub mod devices;
pub mod discipline;
pub mod engine;
pub mod error;
pub mod frame;
pub mod matcher;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod value;

pub use config::{DeviceConfig, Parity, SerialSettings};
pub use engine::{DeviceEngine, DeviceHandle};
pub use error::LinkError;
pub use frame::Frame;
pub use matcher::{ErrorText, Matcher, Message};
pub use protocol::{Framing, Protocol, ProtocolBuilder};
pub use state::{DeviceStateModel, Notifications, SharedState, StateChange};
pub use transport::open_serial;
pub use value::{Value, VarType};
