//! Per-device protocol engine: connection lifecycle, keep-alive, command
//! queue, and the mirrored port/route/lock state for one physical hub.
//!
//! One tokio task owns the TCP connection and is the only writer of the
//! device state; callers read snapshots and submit commands. The task
//! reconnects forever: transport errors back off for a random
//! [1000 ms, 4000 ms) delay, a graceful close retries immediately.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};
use vhub_proto::{Block, DEFAULT_PORT, Value, Verb};

use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::port::{self, DeviceInfo, Lock, Port, PortKind, PortMap, PortSelector, RouteView};

/// Slack added to the keep-alive interval before a missing `ACK` counts
/// as a dead connection.
const ACK_GRACE: Duration = Duration::from_millis(1000);

/// Reconnect backoff bounds after a transport error.
const BACKOFF_MIN_MS: u64 = 1000;
const BACKOFF_SPREAD_MS: u64 = 3000;

/// Connection parameters for one hub device.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use vhub::{DeviceClient, DeviceConfig};
///
/// let dev = DeviceClient::connect(
///     DeviceConfig::new("10.0.0.5").keepalive(Duration::from_secs(5)),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Hostname or address of the device.
    pub host: String,
    /// Control port (default 9990).
    pub port: u16,
    /// Keep-alive ping interval; `Duration::ZERO` disables keep-alive.
    pub keepalive: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            keepalive: Duration::from_secs(5),
        }
    }
}

impl DeviceConfig {
    /// A config for the given host with default port and keep-alive.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Sets the control port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the keep-alive interval (`Duration::ZERO` disables).
    #[must_use]
    pub const fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }
}

/// Mirrored state of one device, owned by its connection task.
#[derive(Debug, Default)]
struct State {
    /// Protocol version from the preamble. Survives reconnects.
    version: Option<String>,
    /// Device descriptor, `None` until reported present.
    info: Option<DeviceInfo>,
    inputs: PortMap,
    outputs: PortMap,
    monitors: PortMap,
    serials: PortMap,
    /// Outbound FIFO; each `ACK`/`NAK` settles the head. `None` entries
    /// are fire-and-forget pings.
    pending: VecDeque<Option<oneshot::Sender<Result<()>>>>,
    /// Sender into the current connection's write task.
    writer: Option<mpsc::UnboundedSender<String>>,
    /// Timestamp of the most recent `ACK`; unset until the first one.
    last_ack: Option<Instant>,
}

/// Source kind feeding destinations of `kind`.
const fn source_kind(kind: PortKind) -> PortKind {
    match kind {
        PortKind::Serial => PortKind::Serial,
        _ => PortKind::Input,
    }
}

impl State {
    fn ports(&self, kind: PortKind) -> &PortMap {
        match kind {
            PortKind::Input => &self.inputs,
            PortKind::Output => &self.outputs,
            PortKind::Monitor => &self.monitors,
            PortKind::Serial => &self.serials,
        }
    }

    fn ports_mut(&mut self, kind: PortKind) -> &mut PortMap {
        match kind {
            PortKind::Input => &mut self.inputs,
            PortKind::Output => &mut self.outputs,
            PortKind::Monitor => &mut self.monitors,
            PortKind::Serial => &mut self.serials,
        }
    }

    /// Drops all port and descriptor state. The protocol version is kept.
    fn wipe_ports(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        self.monitors.clear();
        self.serials.clear();
        self.info = None;
    }

    /// Derived `{to, from}` pairs for every destination of `kind`.
    fn route_views(&self, kind: PortKind) -> Vec<RouteView> {
        let sources = self.ports(source_kind(kind));
        self.ports(kind)
            .values()
            .map(|to| RouteView {
                to: to.clone(),
                from: to.source().and_then(|id| sources.get(&id).cloned()),
            })
            .collect()
    }

    /// Applies one `<dest> <src>` routing entry. Returns false on no-op.
    ///
    /// Keeps the single-source invariant: the destination is delisted from
    /// every source that still claims it before the new link is recorded.
    fn route_one(&mut self, kind: PortKind, dest_id: u32, src_id: u32) -> bool {
        let src_kind = source_kind(kind);
        port::entry(self.ports_mut(kind), dest_id);
        port::entry(self.ports_mut(src_kind), src_id);

        let current = self.ports(kind).get(&dest_id).and_then(Port::source);
        if current == Some(src_id) {
            return false;
        }

        for source in self.ports_mut(src_kind).values_mut() {
            source.route.retain(|&d| d != dest_id);
        }
        port::entry(self.ports_mut(src_kind), src_id).route.push(dest_id);
        port::entry(self.ports_mut(kind), dest_id).route = vec![src_id];
        true
    }

    fn apply_labels(&mut self, kind: PortKind, block: &Block, events: &mut Vec<DeviceEvent>) {
        let mut changed = false;
        for (id, value) in block.indexed() {
            let p = port::entry(self.ports_mut(kind), id);
            let label = value.to_string();
            if p.label != label {
                p.label = label;
                events.push(DeviceEvent::Label {
                    kind,
                    port: p.clone(),
                });
                changed = true;
            }
        }
        if changed {
            events.push(DeviceEvent::Labels {
                kind,
                ports: self.ports(kind).values().cloned().collect(),
            });
        }
    }

    fn apply_routes(&mut self, kind: PortKind, block: &Block, events: &mut Vec<DeviceEvent>) {
        let mut changed = false;
        for (dest, value) in block.indexed() {
            let Some(src) = value.as_int().and_then(|n| u32::try_from(n).ok()) else {
                continue;
            };
            if self.route_one(kind, dest, src) {
                events.push(DeviceEvent::Route { kind, dest, src });
                changed = true;
            }
        }
        if changed {
            events.push(DeviceEvent::Routes {
                kind,
                routes: self.route_views(kind),
            });
        }
    }

    fn apply_locks(&mut self, kind: PortKind, block: &Block, events: &mut Vec<DeviceEvent>) {
        let mut changed = false;
        for (id, value) in block.indexed() {
            let lock = Lock::from_wire(&value.to_string());
            let p = port::entry(self.ports_mut(kind), id);
            if p.lock != lock {
                p.lock = lock;
                events.push(DeviceEvent::Lock {
                    kind,
                    port: p.clone(),
                });
                changed = true;
            }
        }
        if changed {
            events.push(DeviceEvent::Locks {
                kind,
                ports: self.ports(kind).values().cloned().collect(),
            });
        }
    }
}

/// State plus the event channel, shared between the connection task and
/// client handles.
#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<DeviceEvent>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A client for one physical hub device.
///
/// Cheap to clone; all clones share the same connection task. The task is
/// spawned by [`DeviceClient::connect`] and retries forever — there is no
/// terminal disconnected state.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    shared: Arc<Shared>,
}

impl DeviceClient {
    /// Creates the client and immediately starts connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: DeviceConfig) -> Self {
        let client = Self::detached();
        let shared = Arc::clone(&client.shared);
        drop(tokio::spawn(run_loop(config, shared)));
        client
    }

    /// A client with no connection task, for seeding state in tests.
    pub(crate) fn detached() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// Subscribes to this device's change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// True while a socket is open to the device.
    pub fn connected(&self) -> bool {
        lock(&self.shared.state).writer.is_some()
    }

    /// Protocol version from the preamble, if seen.
    pub fn version(&self) -> Option<String> {
        lock(&self.shared.state).version.clone()
    }

    /// Device descriptor, if the device reported itself present.
    pub fn info(&self) -> Option<DeviceInfo> {
        lock(&self.shared.state).info.clone()
    }

    /// Snapshot of the ports of one kind, ordered by id.
    pub fn ports(&self, kind: PortKind) -> Vec<Port> {
        lock(&self.shared.state).ports(kind).values().cloned().collect()
    }

    /// Snapshot of the input ports.
    pub fn inputs(&self) -> Vec<Port> {
        self.ports(PortKind::Input)
    }

    /// Snapshot of the output ports.
    pub fn outputs(&self) -> Vec<Port> {
        self.ports(PortKind::Output)
    }

    /// Snapshot of the monitoring output ports.
    pub fn monitors(&self) -> Vec<Port> {
        self.ports(PortKind::Monitor)
    }

    /// Snapshot of the serial ports.
    pub fn serials(&self) -> Vec<Port> {
        self.ports(PortKind::Serial)
    }

    /// Finds a port of `kind` by id or label (first label match wins).
    pub fn find(&self, kind: PortKind, sel: impl Into<PortSelector>) -> Option<Port> {
        port::find(lock(&self.shared.state).ports(kind), &sel.into())
    }

    /// Finds an input by id or label.
    pub fn find_input(&self, sel: impl Into<PortSelector>) -> Option<Port> {
        self.find(PortKind::Input, sel)
    }

    /// Finds an output by id or label.
    pub fn find_output(&self, sel: impl Into<PortSelector>) -> Option<Port> {
        self.find(PortKind::Output, sel)
    }

    /// Finds a monitoring output by id or label.
    pub fn find_monitor(&self, sel: impl Into<PortSelector>) -> Option<Port> {
        self.find(PortKind::Monitor, sel)
    }

    /// Finds a serial port by id or label.
    pub fn find_serial(&self, sel: impl Into<PortSelector>) -> Option<Port> {
        self.find(PortKind::Serial, sel)
    }

    /// Derived routes for destinations of `kind`.
    pub fn routes(&self, kind: PortKind) -> Vec<RouteView> {
        lock(&self.shared.state).route_views(kind)
    }

    /// Derived routes for the video outputs.
    pub fn output_routes(&self) -> Vec<RouteView> {
        self.routes(PortKind::Output)
    }

    /// Derived routes for the monitoring outputs.
    pub fn monitor_routes(&self) -> Vec<RouteView> {
        self.routes(PortKind::Monitor)
    }

    /// Derived routes for the serial ports.
    pub fn serial_routes(&self) -> Vec<RouteView> {
        self.routes(PortKind::Serial)
    }

    /// Renames an input port.
    pub async fn label_input(&self, sel: impl Into<PortSelector>, label: &str) -> Result<()> {
        self.label(PortKind::Input, sel.into(), label).await
    }

    /// Renames an output port.
    pub async fn label_output(&self, sel: impl Into<PortSelector>, label: &str) -> Result<()> {
        self.label(PortKind::Output, sel.into(), label).await
    }

    /// Renames a monitoring output port.
    pub async fn label_monitor(&self, sel: impl Into<PortSelector>, label: &str) -> Result<()> {
        self.label(PortKind::Monitor, sel.into(), label).await
    }

    /// Renames a serial port.
    pub async fn label_serial(&self, sel: impl Into<PortSelector>, label: &str) -> Result<()> {
        self.label(PortKind::Serial, sel.into(), label).await
    }

    /// Routes an input to an output.
    ///
    /// Succeeds without touching the wire when the output is already fed
    /// by that input.
    pub async fn route_output(
        &self,
        src: impl Into<PortSelector>,
        dest: impl Into<PortSelector>,
    ) -> Result<()> {
        self.route(PortKind::Output, src.into(), dest.into()).await
    }

    /// Routes an input to a monitoring output.
    pub async fn route_monitor(
        &self,
        src: impl Into<PortSelector>,
        dest: impl Into<PortSelector>,
    ) -> Result<()> {
        self.route(PortKind::Monitor, src.into(), dest.into()).await
    }

    /// Routes a serial port to another serial port.
    pub async fn route_serial(
        &self,
        src: impl Into<PortSelector>,
        dest: impl Into<PortSelector>,
    ) -> Result<()> {
        self.route(PortKind::Serial, src.into(), dest.into()).await
    }

    /// Locks or unlocks an output.
    pub async fn lock_output(&self, sel: impl Into<PortSelector>, locked: bool) -> Result<()> {
        self.set_lock(PortKind::Output, sel.into(), locked).await
    }

    /// Locks or unlocks a monitoring output.
    pub async fn lock_monitor(&self, sel: impl Into<PortSelector>, locked: bool) -> Result<()> {
        self.set_lock(PortKind::Monitor, sel.into(), locked).await
    }

    /// Locks or unlocks a serial port.
    pub async fn lock_serial(&self, sel: impl Into<PortSelector>, locked: bool) -> Result<()> {
        self.set_lock(PortKind::Serial, sel.into(), locked).await
    }

    async fn label(&self, kind: PortKind, sel: PortSelector, label: &str) -> Result<()> {
        let id = self
            .find(kind, sel)
            .ok_or(Error::NotFound(kind_name(kind)))?
            .id;
        self.submit(Block::single(label_verb(kind), id, label)).await
    }

    async fn route(&self, kind: PortKind, src: PortSelector, dest: PortSelector) -> Result<()> {
        let (src, dest) = {
            let st = lock(&self.shared.state);
            let src = port::find(st.ports(source_kind(kind)), &src)
                .ok_or(Error::NotFound(kind_name(source_kind(kind))))?;
            let dest =
                port::find(st.ports(kind), &dest).ok_or(Error::NotFound(kind_name(kind)))?;
            (src, dest)
        };
        if dest.source() == Some(src.id) {
            return Ok(());
        }
        self.submit(Block::single(route_verb(kind), dest.id, src.id))
            .await
    }

    async fn set_lock(&self, kind: PortKind, sel: PortSelector, locked: bool) -> Result<()> {
        let id = self
            .find(kind, sel)
            .ok_or(Error::NotFound(kind_name(kind)))?
            .id;
        let code = if locked { Lock::Locked } else { Lock::Unlocked };
        self.submit(Block::single(lock_verb(kind), id, code.wire()))
            .await
    }

    /// Queues a command and waits for its positional `ACK`/`NAK`.
    async fn submit(&self, block: Block) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = lock(&self.shared.state);
            let Some(writer) = st.writer.as_ref() else {
                return Err(Error::NotConnected);
            };
            if writer.send(vhub_proto::serialize(&block)).is_err() {
                return Err(Error::NotConnected);
            }
            st.pending.push_back(Some(tx));
        }
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Feeds a raw block straight into state application, for tests.
    #[cfg(test)]
    pub(crate) fn apply_text(&self, text: &str) {
        if let Some(block) = vhub_proto::parse(text) {
            apply(&self.shared, &block);
        }
    }
}

const fn kind_name(kind: PortKind) -> &'static str {
    match kind {
        PortKind::Input => "input",
        PortKind::Output => "output",
        PortKind::Monitor => "monitor",
        PortKind::Serial => "serial",
    }
}

const fn label_verb(kind: PortKind) -> Verb {
    match kind {
        PortKind::Input => Verb::InputLabels,
        PortKind::Output => Verb::OutputLabels,
        PortKind::Monitor => Verb::MonitoringOutputLabels,
        PortKind::Serial => Verb::SerialPortLabels,
    }
}

const fn route_verb(kind: PortKind) -> Verb {
    match kind {
        PortKind::Monitor => Verb::VideoMonitoringOutputRouting,
        PortKind::Serial => Verb::SerialPortRouting,
        _ => Verb::VideoOutputRouting,
    }
}

const fn lock_verb(kind: PortKind) -> Verb {
    match kind {
        PortKind::Monitor => Verb::MonitoringOutputLocks,
        PortKind::Serial => Verb::SerialPortLocks,
        _ => Verb::VideoOutputLocks,
    }
}

/// Connection task: connect, run a session, tear down, repeat forever.
async fn run_loop(config: DeviceConfig, shared: Arc<Shared>) {
    let addr = format!("{}:{}", config.host, config.port);
    loop {
        let clean = match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let clean = session(&shared, stream, config.keepalive).await;
                teardown(&shared);
                clean
            }
            Err(e) => {
                warn!(%addr, error = %e, "connect failed");
                false
            }
        };
        if !clean {
            let delay = Duration::from_millis(BACKOFF_MIN_MS + fastrand::u64(..BACKOFF_SPREAD_MS));
            debug!(?delay, "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Drives one live connection. Returns true for a clean end (peer EOF or
/// a keep-alive forced close), false for a transport error.
async fn session(shared: &Arc<Shared>, stream: TcpStream, keepalive: Duration) -> bool {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut writer_task = tokio::spawn(write_loop(write_half, rx));

    {
        let mut st = lock(&shared.state);
        st.writer = Some(tx.clone());
        st.last_ack = None;
    }
    debug!("connected");
    let _ = shared.events.send(DeviceEvent::Connected);

    let mut lines = BufReader::new(read_half).lines();
    let mut block = String::new();
    let mut tick = (keepalive > Duration::ZERO)
        .then(|| tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive));

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        if !block.is_empty() {
                            handle_block(shared, &block);
                            block.clear();
                        }
                    } else {
                        block.push_str(&line);
                        block.push('\n');
                    }
                }
                Ok(None) => {
                    debug!("peer closed connection");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "read failed");
                    return false;
                }
            },
            _ = maybe_tick(tick.as_mut()) => {
                let stale = lock(&shared.state)
                    .last_ack
                    .is_some_and(|at| at.elapsed() > keepalive + ACK_GRACE);
                if stale {
                    warn!("keep-alive timeout, forcing close");
                    let _ = shared.events.send(DeviceEvent::Timeout);
                    return true;
                }
                let mut st = lock(&shared.state);
                st.pending.push_back(None);
                let _ = tx.send(vhub_proto::serialize(&Block::ping()));
            }
            _ = &mut writer_task => {
                warn!("write side failed");
                return false;
            }
        }
    }
}

/// Writes serialized blocks to the socket until the channel closes or a
/// write fails.
async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(data) = rx.recv().await {
        if half.write_all(data.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Ticks the keep-alive interval, or parks forever when disabled.
async fn maybe_tick(tick: Option<&mut tokio::time::Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Session teardown: discard the queue, wipe state, notify.
///
/// Pending completions are dropped, which surfaces to callers as
/// [`Error::ConnectionLost`].
fn teardown(shared: &Arc<Shared>) {
    {
        let mut st = lock(&shared.state);
        st.writer = None;
        st.last_ack = None;
        st.pending.clear();
        st.wipe_ports();
    }
    let _ = shared.events.send(DeviceEvent::Closed);
}

fn handle_block(shared: &Arc<Shared>, text: &str) {
    match vhub_proto::parse(text) {
        Some(block) => apply(shared, &block),
        None => debug!(block = text, "ignoring unrecognized block"),
    }
}

/// Applies one received block to the device state and emits the resulting
/// notifications.
fn apply(shared: &Arc<Shared>, block: &Block) {
    let mut events = Vec::new();
    {
        let mut st = lock(&shared.state);

        // Replies settle the queue head positionally; with nothing
        // pending they are ignored.
        if block.is_reply() {
            if let Some(done) = st.pending.pop_front() {
                if block.verb == Verb::Ack {
                    st.last_ack = Some(Instant::now());
                    if let Some(tx) = done {
                        let _ = tx.send(Ok(()));
                    }
                } else if let Some(tx) = done {
                    let _ = tx.send(Err(Error::Rejected));
                }
            }
            return;
        }

        match block.verb {
            Verb::ProtocolPreamble => {
                if let Some(version) = block.find("version") {
                    let version = version.to_string();
                    st.version = Some(version.clone());
                    events.push(DeviceEvent::Protocol(version));
                }
            }
            Verb::VideohubDevice => {
                // Port counts may change on reconfiguration; start over.
                st.wipe_ports();
                let present = block
                    .find("device_present")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if present {
                    st.info = Some(DeviceInfo {
                        model: block
                            .find("model_name")
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        inputs: count(block, "video_inputs"),
                        outputs: count(block, "video_outputs"),
                        monitors: count(block, "video_monitoring_outputs"),
                        serials: count(block, "serial_ports"),
                    });
                }
                events.push(DeviceEvent::Device(st.info.clone()));
            }
            Verb::InputLabels => st.apply_labels(PortKind::Input, block, &mut events),
            Verb::OutputLabels => st.apply_labels(PortKind::Output, block, &mut events),
            Verb::MonitoringOutputLabels => st.apply_labels(PortKind::Monitor, block, &mut events),
            Verb::SerialPortLabels => st.apply_labels(PortKind::Serial, block, &mut events),
            Verb::VideoOutputRouting => st.apply_routes(PortKind::Output, block, &mut events),
            Verb::VideoMonitoringOutputRouting => {
                st.apply_routes(PortKind::Monitor, block, &mut events);
            }
            Verb::SerialPortRouting => st.apply_routes(PortKind::Serial, block, &mut events),
            Verb::VideoOutputLocks => st.apply_locks(PortKind::Output, block, &mut events),
            Verb::MonitoringOutputLocks => st.apply_locks(PortKind::Monitor, block, &mut events),
            Verb::SerialPortLocks => st.apply_locks(PortKind::Serial, block, &mut events),
            Verb::Ack | Verb::Nak | Verb::Ping => {}
        }
    }
    for event in events {
        let _ = shared.events.send(event);
    }
}

/// Reads a named count field, defaulting to zero.
fn count(block: &Block, key: &str) -> u32 {
    block
        .find(key)
        .and_then(Value::as_int)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn seed_small_hub(dev: &DeviceClient) {
        dev.apply_text("INPUT LABELS:\n0 CAM1\n1 CAM2\n");
        dev.apply_text("OUTPUT LABELS:\n0 PGM\n1 AUX\n");
    }

    fn config_for(addr: std::net::SocketAddr, keepalive: Duration) -> DeviceConfig {
        DeviceConfig::new(addr.ip().to_string())
            .port(addr.port())
            .keepalive(keepalive)
    }

    async fn next_event(rx: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within 5s")
            .expect("event channel closed")
    }

    fn blocks_in(buf: &[u8]) -> usize {
        buf.windows(2).filter(|w| w == b"\n\n").count()
    }

    #[test]
    fn descriptor_populates_and_notifies() {
        let dev = DeviceClient::detached();
        let mut rx = dev.subscribe();
        dev.apply_text(
            "VIDEOHUB DEVICE:\nDevice present: true\nModel name: Hub\nVideo inputs: 2\nVideo outputs: 2\n",
        );
        let info = dev.info().expect("descriptor");
        assert_eq!(info.model, "Hub");
        assert_eq!(info.inputs, 2);
        assert_eq!(info.outputs, 2);
        assert_eq!(info.monitors, 0);
        match rx.try_recv().expect("device event") {
            DeviceEvent::Device(Some(d)) => assert_eq!(d, info),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn absent_device_wipes_state() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        dev.apply_text("VIDEOHUB DEVICE:\nDevice present: true\nModel name: Hub\n");
        assert!(dev.info().is_some());
        dev.apply_text("VIDEOHUB DEVICE:\nDevice present: false\n");
        assert!(dev.info().is_none());
        assert!(dev.inputs().is_empty());
        assert!(dev.outputs().is_empty());
    }

    #[test]
    fn protocol_preamble_recorded() {
        let dev = DeviceClient::detached();
        let mut rx = dev.subscribe();
        dev.apply_text("PROTOCOL PREAMBLE:\nVersion: 2.8\n");
        assert_eq!(dev.version().as_deref(), Some("2.8"));
        assert!(matches!(
            rx.try_recv().expect("protocol event"),
            DeviceEvent::Protocol(v) if v == "2.8"
        ));
    }

    #[test]
    fn label_events_per_item_and_batched() {
        let dev = DeviceClient::detached();
        let mut rx = dev.subscribe();
        dev.apply_text("INPUT LABELS:\n0 CAM1\n1 CAM2\n");
        assert!(matches!(
            rx.try_recv().expect("item"),
            DeviceEvent::Label { kind: PortKind::Input, port } if port.label == "CAM1"
        ));
        assert!(matches!(
            rx.try_recv().expect("item"),
            DeviceEvent::Label { kind: PortKind::Input, port } if port.label == "CAM2"
        ));
        assert!(matches!(
            rx.try_recv().expect("batch"),
            DeviceEvent::Labels { kind: PortKind::Input, ports } if ports.len() == 2
        ));
        // Unchanged labels are a no-op, no events.
        dev.apply_text("INPUT LABELS:\n0 CAM1\n1 CAM2\n");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn routing_updates_both_sides_and_notifies() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        let mut rx = dev.subscribe();
        dev.apply_text("VIDEO OUTPUT ROUTING:\n0 1\n");
        assert_eq!(dev.find_output(0u32).expect("output").route, vec![1]);
        assert!(dev.find_input(1u32).expect("input").route.contains(&0));
        assert!(matches!(
            rx.try_recv().expect("route event"),
            DeviceEvent::Route { kind: PortKind::Output, dest: 0, src: 1 }
        ));
        assert!(matches!(
            rx.try_recv().expect("routes event"),
            DeviceEvent::Routes { kind: PortKind::Output, routes }
                if routes.iter().any(|r| r.to.id == 0
                    && r.from.as_ref().is_some_and(|f| f.id == 1))
        ));
    }

    #[test]
    fn single_source_invariant_holds() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        dev.apply_text("VIDEO OUTPUT ROUTING:\n0 1\n");
        dev.apply_text("VIDEO OUTPUT ROUTING:\n0 0\n1 0\n");
        // Output 0 rewired to input 0; input 1 must no longer claim it.
        assert_eq!(dev.find_output(0u32).expect("output").route, vec![0]);
        assert!(dev.find_input(1u32).expect("input").route.is_empty());
        // Input 0 feeds both outputs now.
        let feeder = dev.find_input(0u32).expect("input");
        assert!(feeder.route.contains(&0) && feeder.route.contains(&1));
        for view in dev.output_routes() {
            assert!(view.to.route.len() <= 1);
        }
    }

    #[test]
    fn lock_state_mirrors_wire_codes() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        let mut rx = dev.subscribe();
        dev.apply_text("VIDEO OUTPUT LOCKS:\n0 L\n1 O\n");
        assert_eq!(dev.find_output(0u32).expect("output").lock, Lock::Locked);
        assert_eq!(dev.find_output(1u32).expect("output").lock, Lock::Owned);
        assert!(matches!(
            rx.try_recv().expect("lock event"),
            DeviceEvent::Lock { kind: PortKind::Output, .. }
        ));
    }

    #[tokio::test]
    async fn submit_without_connection_fails_fast() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        assert!(matches!(
            dev.label_input(0u32, "X").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            dev.lock_output(0u32, true).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn selector_miss_is_synchronous_not_found() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        assert!(matches!(
            dev.route_output("NOPE", 0u32).await,
            Err(Error::NotFound("input"))
        ));
        assert!(matches!(
            dev.label_monitor(7u32, "X").await,
            Err(Error::NotFound("monitor"))
        ));
    }

    #[tokio::test]
    async fn established_route_short_circuits() {
        let dev = DeviceClient::detached();
        seed_small_hub(&dev);
        dev.apply_text("VIDEO OUTPUT ROUTING:\n0 1\n");
        // Already routed: succeeds without a connection, so no command
        // can have been issued.
        dev.route_output(1u32, 0u32).await.expect("no-op");
        dev.route_output("CAM2", "PGM").await.expect("no-op by label");
    }

    #[tokio::test]
    async fn fifo_replies_settle_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"INPUT LABELS:\n0 A\n1 B\n\nOUTPUT LABELS:\n0 X\n1 Y\n\n")
                .await
                .expect("seed");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            while blocks_in(&buf) < 3 {
                let n = sock.read(&mut chunk).await.expect("read");
                assert!(n > 0, "client closed early");
                buf.extend_from_slice(&chunk[..n]);
            }
            sock.write_all(b"ACK\n\nNAK\n\nACK\n\n").await.expect("replies");
            // Keep the socket open while the client settles.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let dev = DeviceClient::connect(config_for(addr, Duration::ZERO));
        let mut rx = dev.subscribe();
        loop {
            if let DeviceEvent::Labels {
                kind: PortKind::Output,
                ..
            } = next_event(&mut rx).await
            {
                break;
            }
        }

        let (a, b, c) = tokio::join!(
            dev.route_output(1u32, 0u32),
            dev.route_output(0u32, 1u32),
            dev.route_output(1u32, 1u32),
        );
        assert!(a.is_ok());
        assert!(matches!(b, Err(Error::Rejected)));
        assert!(c.is_ok());
        server.await.expect("server");
    }

    #[tokio::test]
    async fn reconnects_after_close_and_wipes_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let dev = DeviceClient::connect(config_for(addr, Duration::ZERO));
        let mut rx = dev.subscribe();

        let (mut sock, _) = listener.accept().await.expect("accept");
        assert!(matches!(next_event(&mut rx).await, DeviceEvent::Connected));
        sock.write_all(
            b"VIDEOHUB DEVICE:\nDevice present: true\nModel name: Hub\nVideo inputs: 1\nVideo outputs: 1\n\n",
        )
        .await
        .expect("descriptor");
        loop {
            if let DeviceEvent::Device(Some(_)) = next_event(&mut rx).await {
                break;
            }
        }
        assert!(dev.info().is_some());

        drop(sock);
        loop {
            if let DeviceEvent::Closed = next_event(&mut rx).await {
                break;
            }
        }
        assert!(dev.info().is_none());
        assert!(!dev.connected());

        // Graceful close retries without backoff.
        let (_sock2, _) = listener.accept().await.expect("re-accept");
        loop {
            if let DeviceEvent::Connected = next_event(&mut rx).await {
                break;
            }
        }
        assert!(dev.connected());
    }

    #[tokio::test]
    async fn keepalive_timeout_forces_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            let mut acked = false;
            loop {
                let n = sock.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    return;
                }
                buf.extend_from_slice(&chunk[..n]);
                // Answer the first ping, then go silent.
                if !acked && buf.windows(5).any(|w| w == b"PING:") {
                    sock.write_all(b"ACK\n\n").await.expect("ack");
                    acked = true;
                }
            }
        });

        let dev = DeviceClient::connect(config_for(addr, Duration::from_millis(100)));
        let mut rx = dev.subscribe();
        loop {
            if let DeviceEvent::Timeout = next_event(&mut rx).await {
                break;
            }
        }
        // The forced close tears the session down like any other close.
        loop {
            if let DeviceEvent::Closed = next_event(&mut rx).await {
                break;
            }
        }
        server.await.expect("server");
    }
}
