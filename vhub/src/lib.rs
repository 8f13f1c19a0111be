//! Client library for Blackmagic Videohub routing matrices.
//!
//! A [`DeviceClient`] keeps a live mirror of one hub's state — ports,
//! labels, locks, routes — over its TCP control protocol, reconnecting
//! forever and correlating commands with the device's FIFO `ACK`/`NAK`
//! replies. An [`Aggregate`] chains several physically cabled hubs into
//! one virtual fabric, discovering the cabling from label coincidences
//! and planning multi-hop routes across it.
//!
//! # Quick start
//!
//! ```no_run
//! use vhub::{Aggregate, DeviceConfig};
//!
//! # async fn demo() -> vhub::Result<()> {
//! // Two hubs, upstream first; outputs labeled like downstream inputs
//! // are treated as cables between them.
//! let fabric = Aggregate::connect([
//!     DeviceConfig::new("10.0.0.5"),
//!     DeviceConfig::new("10.0.0.6"),
//! ]);
//!
//! fabric.route_output("CAM 1", "PGM").await?;
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod device;
mod error;
mod event;
mod port;

pub use aggregate::{Aggregate, AggregateEvent, AggregatePort, AggregateRoute, Link};
pub use device::{DeviceClient, DeviceConfig};
pub use error::{Error, Result};
pub use event::DeviceEvent;
pub use port::{DeviceInfo, Lock, Port, PortKind, PortSelector, RouteView};
pub use vhub_proto as proto;
