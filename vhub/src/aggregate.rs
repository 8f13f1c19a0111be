//! Multi-device aggregation: several cabled hubs presented as one fabric.
//!
//! Devices are held in physical pipeline order, upstream first. Cabling
//! between them is never configured explicitly; it is discovered from
//! label coincidences — an output on an upstream device sharing its label
//! with an input on a downstream device is assumed to be a physical cable.
//! Those link ports are hidden from the public port lists, and cross-device
//! routes are planned as chains of single-device route commands.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use crate::device::{DeviceClient, DeviceConfig};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::port::{Port, PortKind, PortSelector};

/// A discovered cabling relation, recorded on the upstream device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Pipeline index of the downstream device.
    pub downstream: usize,
    /// Labels shared by an upstream output and a downstream input.
    ///
    /// Order is significant: the planner tries pairs front to back and
    /// rotates a consumed pair to the tail so later routes spread across
    /// the remaining cables first.
    pub pairs: Vec<String>,
}

/// A port tagged with the index of the device that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatePort {
    /// Pipeline index of the owning device.
    pub device: usize,
    /// The port itself.
    pub port: Port,
}

/// A flattened cross-device route, intermediate link hops hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRoute {
    /// The public output.
    pub to: AggregatePort,
    /// The true origin input feeding it, if resolvable.
    pub from: Option<AggregatePort>,
}

/// Fabric-level notifications.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AggregateEvent {
    /// Every device is now connected.
    Connected,
    /// At least one device dropped after all were connected.
    Closed,
    /// The public input list changed.
    InputLabels(Vec<AggregatePort>),
    /// The public output list changed.
    OutputLabels(Vec<AggregatePort>),
    /// The flattened route list changed.
    OutputRoutes(Vec<AggregateRoute>),
}

/// One step of a routing plan: route `input` to `output` on `device`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hop {
    device: usize,
    input: PortSelector,
    output: PortSelector,
}

#[derive(Debug)]
struct Inner {
    /// Device clients in pipeline order, upstream first.
    devices: Vec<DeviceClient>,
    /// Link graph, indexed by upstream device.
    links: Mutex<Vec<Vec<Link>>>,
    /// Last observed all-connected state, for edge detection.
    all_connected: Mutex<bool>,
    events: broadcast::Sender<AggregateEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A virtual routing fabric over several physically chained hub devices.
///
/// Cheap to clone; clones share the underlying devices and link graph.
#[derive(Debug, Clone)]
pub struct Aggregate {
    inner: Arc<Inner>,
}

impl Aggregate {
    /// Builds one device client per config, in pipeline order, and starts
    /// watching their state for link discovery.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(configs: impl IntoIterator<Item = DeviceConfig>) -> Self {
        let agg = Self::with_devices(configs.into_iter().map(DeviceClient::connect).collect());
        for device in &agg.inner.devices {
            let rx = device.subscribe();
            let inner = Arc::clone(&agg.inner);
            drop(tokio::spawn(watch(inner, rx)));
        }
        agg
    }

    fn with_devices(devices: Vec<DeviceClient>) -> Self {
        let links = Mutex::new(vec![Vec::new(); devices.len()]);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                devices,
                links,
                all_connected: Mutex::new(false),
                events,
            }),
        }
    }

    /// An aggregate over detached devices, for seeding state in tests.
    #[cfg(test)]
    pub(crate) fn detached(count: usize) -> Self {
        Self::with_devices((0..count).map(|_| DeviceClient::detached()).collect())
    }

    /// The underlying device clients, in pipeline order.
    pub fn devices(&self) -> &[DeviceClient] {
        &self.inner.devices
    }

    /// Subscribes to fabric-level notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AggregateEvent> {
        self.inner.events.subscribe()
    }

    /// True when every device has an open connection.
    pub fn connected(&self) -> bool {
        self.inner.devices.iter().all(DeviceClient::connected)
    }

    /// The selectable inputs of the fabric: every device's inputs minus
    /// internal cabling ports.
    pub fn inputs(&self) -> Vec<AggregatePort> {
        self.inner.filtered(PortKind::Input)
    }

    /// The selectable outputs of the fabric, each tagged with its owning
    /// device.
    pub fn outputs(&self) -> Vec<AggregatePort> {
        self.inner.filtered(PortKind::Output)
    }

    /// Flattened routes for every public output, link hops resolved away.
    pub fn routes(&self) -> Vec<AggregateRoute> {
        self.inner.routes()
    }

    /// Routes the input selected by `src` to the output selected by
    /// `dest`, crossing devices through discovered links as needed.
    ///
    /// The plan executes strictly in upstream-to-downstream order; a hop
    /// is only issued once the previous one was acknowledged. The first
    /// rejection aborts the rest; hops already applied are not rolled
    /// back.
    pub async fn route_output(
        &self,
        src: impl Into<PortSelector>,
        dest: impl Into<PortSelector>,
    ) -> Result<()> {
        let plan = self.inner.plan(&src.into(), &dest.into())?;
        for hop in plan {
            self.inner.devices[hop.device]
                .route_output(hop.input, hop.output)
                .await?;
        }
        Ok(())
    }
}

impl Inner {
    /// Recomputes the link graph from the current label sets.
    ///
    /// Unlabeled ports never link; a blank label is a port nobody has
    /// named, not a shared cable.
    fn rebuild_links(&self) {
        let mut all = Vec::with_capacity(self.devices.len());
        for (i, upstream) in self.devices.iter().enumerate() {
            let outputs = upstream.outputs();
            let mut dev_links = Vec::new();
            for (j, downstream) in self.devices.iter().enumerate().skip(i + 1) {
                let pairs: Vec<String> = outputs
                    .iter()
                    .filter(|o| {
                        !o.label.is_empty() && downstream.find_input(o.label.as_str()).is_some()
                    })
                    .map(|o| o.label.clone())
                    .collect();
                if !pairs.is_empty() {
                    dev_links.push(Link {
                        downstream: j,
                        pairs,
                    });
                }
            }
            all.push(dev_links);
        }
        *lock(&self.links) = all;
    }

    /// Every label consumed by internal cabling, across the whole graph.
    fn link_labels(&self) -> Vec<String> {
        lock(&self.links)
            .iter()
            .flatten()
            .flat_map(|l| l.pairs.iter().cloned())
            .collect()
    }

    fn filtered(&self, kind: PortKind) -> Vec<AggregatePort> {
        let labels = self.link_labels();
        self.devices
            .iter()
            .enumerate()
            .flat_map(|(device, dev)| {
                dev.ports(kind)
                    .into_iter()
                    .map(move |port| AggregatePort { device, port })
            })
            .filter(|ap| !labels.contains(&ap.port.label))
            .collect()
    }

    fn routes(&self) -> Vec<AggregateRoute> {
        let labels = self.link_labels();
        self.filtered(PortKind::Output)
            .into_iter()
            .filter_map(|out| self.resolve_route(out, &labels))
            .collect()
    }

    /// Follows an output's source chain upstream through link cabling
    /// until a non-link origin is reached or the chain dead-ends.
    fn resolve_route(&self, to: AggregatePort, link_labels: &[String]) -> Option<AggregateRoute> {
        let src_id = to.port.source()?;
        let mut from_dev = to.device;
        let mut from = self.devices[from_dev].find_input(src_id)?;
        while link_labels.contains(&from.label) {
            let Some((udev, uout)) = self.find_output(&from.label) else {
                break;
            };
            let Some(next) = uout
                .source()
                .and_then(|id| self.devices[udev].find_input(id))
            else {
                break;
            };
            from_dev = udev;
            from = next;
        }
        Some(AggregateRoute {
            to,
            from: Some(AggregatePort {
                device: from_dev,
                port: from,
            }),
        })
    }

    /// First device (pipeline order) owning an output with this label.
    fn find_output(&self, label: &str) -> Option<(usize, Port)> {
        self.devices
            .iter()
            .enumerate()
            .find_map(|(i, dev)| dev.find_output(label).map(|p| (i, p)))
    }

    /// Computes the ordered hop list for a cross-device route.
    fn plan(&self, src: &PortSelector, dest: &PortSelector) -> Result<Vec<Hop>> {
        let start = self
            .devices
            .iter()
            .position(|dev| dev.find_input(src.clone()).is_some())
            .ok_or(Error::NotFound("input"))?;
        let mut links = lock(&self.links);
        self.find_route(start, std::slice::from_ref(src), dest, &mut links)
            .ok_or_else(|| Error::Unreachable(selector_text(dest)))
    }

    /// Depth-first search over the link graph.
    ///
    /// `candidates` are the inputs available on `device` for this leg —
    /// the caller's selector at the start, a link's pair labels once the
    /// search has crossed a cable.
    fn find_route(
        &self,
        device: usize,
        candidates: &[PortSelector],
        dest: &PortSelector,
        links: &mut Vec<Vec<Link>>,
    ) -> Option<Vec<Hop>> {
        // Base case: the output lives on this device.
        if let Some(output) = self.devices[device].find_output(dest.clone()) {
            let input = self.find_best(device, candidates, output.id)?;
            return Some(vec![Hop {
                device,
                input,
                output: dest.clone(),
            }]);
        }

        // Otherwise try each cable to a downstream device in turn.
        for li in 0..links[device].len() {
            let (downstream, pair_sels) = {
                let link = &links[device][li];
                let sels: Vec<PortSelector> = link
                    .pairs
                    .iter()
                    .map(|p| PortSelector::Label(p.clone()))
                    .collect();
                (link.downstream, sels)
            };
            let Some(deep) = self.find_route(downstream, &pair_sels, dest, links) else {
                continue;
            };

            // The input chosen downstream names the cable, which is this
            // device's output label.
            let PortSelector::Label(cable) = deep[0].input.clone() else {
                continue;
            };

            // Rotate the consumed pair to the tail so the next search
            // prefers untouched cables.
            let link = &mut links[device][li];
            if let Some(pos) = link.pairs.iter().position(|p| p == &cable) {
                let used = link.pairs.remove(pos);
                link.pairs.push(used);
            }

            let Some(output) = self.devices[device].find_output(cable.as_str()) else {
                continue;
            };
            let Some(input) = self.find_best(device, candidates, output.id) else {
                continue;
            };
            let mut plan = vec![Hop {
                device,
                input,
                output: PortSelector::Label(cable),
            }];
            plan.extend(deep);
            return Some(plan);
        }

        debug!(device, "no viable link for route");
        None
    }

    /// Tie-break policy for choosing which candidate input feeds an
    /// output on one device.
    fn find_best(
        &self,
        device: usize,
        candidates: &[PortSelector],
        output_id: u32,
    ) -> Option<PortSelector> {
        if candidates.is_empty() {
            return None;
        }
        let dev = &self.devices[device];
        let output = dev.find_output(output_id)?;

        // A lone candidate is used unconditionally.
        if candidates.len() == 1 {
            return Some(candidates[0].clone());
        }

        // Keep the current feeder when it is already a candidate; the
        // wiring is correct and churn costs a glitch on live signals.
        if let Some(feeder) = output.source().and_then(|id| dev.find_input(id))
            && candidates.iter().any(|c| matches_port(c, &feeder))
        {
            return Some(PortSelector::Label(feeder.label));
        }

        // Prefer an idle input over stealing one already feeding
        // something else.
        for c in candidates {
            if let Some(input) = dev.find_input(c.clone())
                && input.route.is_empty()
            {
                return Some(c.clone());
            }
        }

        Some(candidates[0].clone())
    }
}

fn matches_port(sel: &PortSelector, port: &Port) -> bool {
    match sel {
        PortSelector::Id(id) => *id == port.id,
        PortSelector::Label(label) => label == &port.label,
    }
}

fn selector_text(sel: &PortSelector) -> String {
    match sel {
        PortSelector::Id(id) => id.to_string(),
        PortSelector::Label(label) => label.clone(),
    }
}

/// Per-device event pump: rebuilds the link graph on any state change and
/// re-emits fabric-level notifications.
async fn watch(inner: Arc<Inner>, mut rx: broadcast::Receiver<DeviceEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                inner.rebuild_links();
                let out = match event {
                    DeviceEvent::Labels {
                        kind: PortKind::Input,
                        ..
                    } => Some(AggregateEvent::InputLabels(inner.filtered(PortKind::Input))),
                    DeviceEvent::Labels {
                        kind: PortKind::Output,
                        ..
                    } => Some(AggregateEvent::OutputLabels(inner.filtered(PortKind::Output))),
                    DeviceEvent::Routes {
                        kind: PortKind::Output,
                        ..
                    } => Some(AggregateEvent::OutputRoutes(inner.routes())),
                    DeviceEvent::Connected | DeviceEvent::Closed => {
                        let now = inner.devices.iter().all(DeviceClient::connected);
                        let mut last = lock(&inner.all_connected);
                        (*last != now).then(|| {
                            *last = now;
                            if now {
                                AggregateEvent::Connected
                            } else {
                                AggregateEvent::Closed
                            }
                        })
                    }
                    _ => None,
                };
                if let Some(out) = out {
                    let _ = inner.events.send(out);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => inner.rebuild_links(),
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
