//! Narrow abstraction over the external publish/subscribe value bus.
//!
//! The aggregation core never talks to a transport directly: it reads
//! locally cached last-known values through [`ValueBus::get`] and upserts
//! pack-level outputs through [`ValueBus::publish`]. A production
//! implementation wraps the real transport; [`MemoryBus`] backs the same
//! trait with in-memory maps for unit testing.

use crate::merge::Value;
use std::collections::BTreeMap;

/// Identifier of a peer service on the bus.
pub type PeerId = String;

/// Role of a peer, as far as the control law cares.
///
/// A dual-role device (e.g. a combined charger/inverter) is returned by
/// the transport under every class it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceClass {
    /// A battery bank contributing telemetry to the pack.
    Battery,
    /// A charge source whose output voltage feeds the cable-drop term.
    Charger,
    /// A load whose discharge current feeds the charge-current ceiling.
    Inverter,
}

/// Well-known telemetry and output paths.
pub mod paths {
    pub const DC_VOLTAGE: &str = "/Dc/0/Voltage";
    pub const DC_CURRENT: &str = "/Dc/0/Current";
    pub const MAX_CELL_VOLTAGE: &str = "/System/MaxCellVoltage";
    pub const MIN_CELL_VOLTAGE: &str = "/System/MinCellVoltage";
    pub const CELL_VOLTAGE_DIFF: &str = "/Voltages/Diff";
    pub const SOC: &str = "/Soc";
    pub const MAX_CHARGE_VOLTAGE: &str = "/Info/MaxChargeVoltage";
    pub const MAX_CHARGE_CURRENT: &str = "/Info/MaxChargeCurrent";
    pub const BALANCING: &str = "/Ess/Balancing";
    pub const CHGMODE: &str = "/Ess/Chgmode";
    pub const THROTTLING: &str = "/Ess/Throttling";
    pub const FORCE_SOC: &str = "/Debug/ForceSoc";

    /// Telemetry paths every bank is subscribed to.
    pub const BANK_TELEMETRY: [&str; 6] = [
        DC_VOLTAGE,
        DC_CURRENT,
        MAX_CELL_VOLTAGE,
        MIN_CELL_VOLTAGE,
        CELL_VOLTAGE_DIFF,
        SOC,
    ];
}

/// The value-bus operations the aggregation core consumes.
///
/// `get` must be a non-blocking read of a locally cached last-known value;
/// nothing inside a control tick may wait on I/O. Change notifications
/// flow the other way: the transport delivers them by calling into the
/// aggregator, so they are not part of this trait.
pub trait ValueBus {
    /// Last-known value of `path` on `peer`, if any.
    fn get(&self, peer: &str, path: &str) -> Option<Value>;

    /// Idempotent upsert of a pack-level output value.
    fn publish(&mut self, path: &str, value: Value);

    /// Peers currently registered under a service class.
    fn enumerate(&self, class: ServiceClass) -> Vec<PeerId>;

    /// Registers interest in change notifications for `paths` on `peer`.
    fn subscribe(&mut self, peer: &str, paths: &[&str]);
}

/// In-memory bus double.
///
/// Tests seed peer values with [`set`](Self::set) and inspect pack
/// outputs with [`published`](Self::published). Deterministic iteration
/// order (BTreeMap) keeps discovery and fan-in reproducible.
#[derive(Debug, Default)]
pub struct MemoryBus {
    peers: BTreeMap<PeerId, (ServiceClass, BTreeMap<String, Value>)>,
    published: BTreeMap<String, Value>,
    subscriptions: Vec<(PeerId, Vec<String>)>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer under a service class.
    pub fn add_peer(&mut self, peer: &str, class: ServiceClass) {
        self.peers
            .insert(peer.to_string(), (class, BTreeMap::new()));
    }

    /// Sets a peer's value for a path, as the transport cache would after
    /// a change notification.
    pub fn set(&mut self, peer: &str, path: &str, value: impl Into<Value>) {
        let entry = self
            .peers
            .get_mut(peer)
            .unwrap_or_else(|| panic!("unknown peer {peer}"));
        entry.1.insert(path.to_string(), value.into());
    }

    /// Last value published for a pack-level path.
    pub fn published(&self, path: &str) -> Option<&Value> {
        self.published.get(path)
    }

    /// Recorded subscriptions, in registration order.
    pub fn subscriptions(&self) -> &[(PeerId, Vec<String>)] {
        &self.subscriptions
    }
}

impl ValueBus for MemoryBus {
    fn get(&self, peer: &str, path: &str) -> Option<Value> {
        self.peers.get(peer)?.1.get(path).cloned()
    }

    fn publish(&mut self, path: &str, value: Value) {
        self.published.insert(path.to_string(), value);
    }

    fn enumerate(&self, class: ServiceClass) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, (c, _))| *c == class)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn subscribe(&mut self, peer: &str, paths: &[&str]) {
        self.subscriptions.push((
            peer.to_string(),
            paths.iter().map(|p| p.to_string()).collect(),
        ));
    }
}
