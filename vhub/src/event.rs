//! Change notifications emitted by a device client.

use crate::port::{DeviceInfo, Port, PortKind, RouteView};

/// A notification from one device client.
///
/// Delivered over a `tokio::sync::broadcast` channel; a subscriber that
/// falls behind loses the oldest events, never the device state itself
/// (state is always re-readable from the client).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceEvent {
    /// TCP connection established.
    Connected,
    /// Connection closed; all port state has been wiped.
    Closed,
    /// Keep-alive deadline exceeded; the connection is being force-closed.
    Timeout,
    /// Protocol preamble received.
    Protocol(String),
    /// Device descriptor updated (`None` when the device reports absent).
    Device(Option<DeviceInfo>),
    /// One port's label changed.
    Label {
        /// Port kind.
        kind: PortKind,
        /// The updated port.
        port: Port,
    },
    /// A label batch finished with at least one change.
    Labels {
        /// Port kind.
        kind: PortKind,
        /// Full updated port list of that kind.
        ports: Vec<Port>,
    },
    /// One destination's route changed.
    Route {
        /// Destination kind (`Output`, `Monitor`, or `Serial`).
        kind: PortKind,
        /// Destination port id.
        dest: u32,
        /// New source port id.
        src: u32,
    },
    /// A routing batch finished with at least one change.
    Routes {
        /// Destination kind.
        kind: PortKind,
        /// Full derived route list for that kind.
        routes: Vec<RouteView>,
    },
    /// One destination's lock state changed.
    Lock {
        /// Destination kind.
        kind: PortKind,
        /// The updated port.
        port: Port,
    },
    /// A lock batch finished with at least one change.
    Locks {
        /// Destination kind.
        kind: PortKind,
        /// Full updated port list of that kind.
        ports: Vec<Port>,
    },
}
