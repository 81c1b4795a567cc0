//! Pack-level aggregation and charge governance.
//!
//! The aggregator owns the configured banks, drives their controllers
//! once per tick, merges per-bank telemetry into pack-level values, and
//! publishes the charge ceilings and the (possibly virtualized) SOC the
//! downstream ESS acts on.
//!
//! Everything runs on one thread: the embedding service interleaves
//! [`Aggregator::tick`] with [`Aggregator::handle_bank_value_changed`]
//! on its event loop, so no locking is needed as long as each call runs
//! to completion before the next is dispatched.

use crate::bank::Bank;
use crate::bus::{paths, PeerId, ServiceClass, ValueBus};
use crate::config::PackConfig;
use crate::errors::PackError;
use crate::filter::ExpFilter;
use crate::merge::{combine, round3, MergePolicy, MergeTable, Value};
use chrono::{Local, Timelike};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Orchestrates the per-bank controllers and the cross-bank merge.
pub struct Aggregator<B: ValueBus> {
    config: PackConfig,
    bus: B,
    banks: Vec<Bank>,
    chargers: Vec<PeerId>,
    inverters: Vec<PeerId>,
    merge_table: MergeTable,
    /// Last-known value per bank and path, fed only by change
    /// notifications from the event loop.
    cache: HashMap<PeerId, HashMap<String, Value>>,
    turned_off: bool,
    turn_on_soc: f64,
    force_soc: f64,
    maxcc_filter: ExpFilter,
    last_charge_voltage: Option<f64>,
    last_max_cc: Option<i64>,
}

impl<B: ValueBus> Aggregator<B> {
    /// Discovers peers and builds the bank controllers.
    ///
    /// Topology is fixed here for the process lifetime: a bank count
    /// other than the configured one, or a missing charger/inverter
    /// class, is fatal.
    pub fn new(config: PackConfig, mut bus: B) -> Result<Self, PackError> {
        let bank_peers = bus.enumerate(ServiceClass::Battery);
        if bank_peers.len() != config.num_banks {
            return Err(PackError::ConfigurationMismatch {
                expected: config.num_banks,
                found: bank_peers.len(),
            });
        }
        let chargers = bus.enumerate(ServiceClass::Charger);
        if chargers.is_empty() {
            return Err(PackError::MissingPeers(ServiceClass::Charger));
        }
        let inverters = bus.enumerate(ServiceClass::Inverter);
        if inverters.is_empty() {
            return Err(PackError::MissingPeers(ServiceClass::Inverter));
        }

        for peer in &bank_peers {
            bus.subscribe(peer, &paths::BANK_TELEMETRY);
        }
        info!(
            banks = bank_peers.len(),
            chargers = chargers.len(),
            inverters = inverters.len(),
            "discovery complete"
        );

        let banks = bank_peers.iter().map(|p| Bank::new(p, &config)).collect();
        let maxcc_filter = ExpFilter::new(10.0 * config.cges100(), config.max_cc_filter_k);

        Ok(Self {
            config,
            bus,
            banks,
            chargers,
            inverters,
            merge_table: MergeTable::standard(),
            cache: HashMap::new(),
            turned_off: false,
            turn_on_soc: 0.0,
            force_soc: 0.0,
            maxcc_filter,
            last_charge_voltage: None,
            last_max_cc: None,
        })
    }

    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    /// True while the pack is virtually turned off.
    pub fn turned_off(&self) -> bool {
        self.turned_off
    }

    /// SOC the pack must recover to before the virtual turn-off releases.
    pub fn turn_on_soc(&self) -> f64 {
        self.turn_on_soc
    }

    /// Manual SOC override; non-zero replaces the computed value
    /// unconditionally.
    pub fn set_force_soc(&mut self, soc: f64) {
        info!(soc, "manual SOC override changed");
        self.force_soc = soc;
        self.bus.publish(paths::FORCE_SOC, Value::Float(soc));
    }

    /// Runs one control tick against the local wall clock.
    pub fn tick(&mut self) {
        self.tick_at_hour(Local::now().hour());
    }

    /// Runs one control tick; `local_hour` feeds the midnight balance
    /// reset and is split out so tests control the clock.
    pub fn tick_at_hour(&mut self, local_hour: u32) {
        let cvavg = self.charger_voltage_average();

        // Fleet predicates from the states going into this tick.
        let all_bulk = self.banks.iter().all(Bank::in_bulk);
        let all_balanced = self.banks.iter().all(Bank::is_balanced);
        let all_floating = self.banks.iter().all(Bank::is_floating);
        let synchronized = all_bulk || all_floating || all_balanced;

        let mut balancing = Vec::new();
        let mut throttling = false;
        let mut any_balancing = false;
        let mut turn_off = false;
        let mut soc_sum = 0.0;
        let mut est_sum = 0.0;

        for bank in &mut self.banks {
            bank.update(&self.bus, cvavg, all_floating, &self.config);

            // Only announce balancers while the fleet is split across
            // states; a synchronized fleet would just be noise.
            if !synchronized && (bank.is_balancing() || bank.is_balanced()) {
                balancing.push(Value::from(bank.id()));
            }

            if bank.is_balanced() && local_hour == 0 {
                info!(bank = %bank.id(), "midnight, re-arming balance timer");
                bank.reset_daily(&self.config);
            }

            throttling |= bank.is_throttling();
            any_balancing |= bank.is_balancing();
            turn_off |= bank.turn_off();
            soc_sum += bank.telemetry().reported_soc;
            est_sum += bank.estimated_soc();
        }

        let bank_count = self.banks.len() as f64;
        let (avg_soc, est_soc) = if self.banks.is_empty() {
            (0.0, 0.0)
        } else {
            (soc_sum / bank_count, est_sum / bank_count)
        };

        let chgmode = if any_balancing {
            "balancing"
        } else if all_floating {
            "floating"
        } else {
            "bulk"
        };

        self.bus.publish(paths::BALANCING, Value::List(balancing));
        self.bus.publish(paths::CHGMODE, Value::from(chgmode));
        self.bus.publish(paths::THROTTLING, Value::Bool(throttling));

        // Only discharge contributions count against the charge budget.
        let mut load_current = 0.0;
        for inverter in &self.inverters {
            match self
                .bus
                .get(inverter, paths::DC_CURRENT)
                .and_then(|v| v.as_f64())
            {
                Some(i) => load_current += i.min(0.0),
                None => debug!(peer = %inverter, "no inverter current reading"),
            }
        }

        // Charge-current ceiling tapers quadratically to near-zero as the
        // pack fills, offset by what the inverter is already drawing.
        let cc_target = 5.0 * self.config.cges100()
            + self.config.cges2() * (1.0 - (est_soc / 99.0).powi(2))
            - load_current;
        self.maxcc_filter.update(cc_target);

        // The weakest bank governs the pack charge voltage.
        let mut charge_voltage = self
            .banks
            .iter()
            .map(Bank::charge_voltage)
            .fold(f64::INFINITY, f64::min);
        if !charge_voltage.is_finite() {
            charge_voltage = 0.0;
        }
        let ceiling = self.config.max_charging_voltage();
        if charge_voltage > ceiling {
            info!(charge_voltage, ceiling, "capping pack charge voltage");
            charge_voltage = ceiling;
        }

        let cv = round3(charge_voltage);
        if self.last_charge_voltage != Some(cv) {
            self.bus.publish(paths::MAX_CHARGE_VOLTAGE, Value::Float(cv));
            self.last_charge_voltage = Some(cv);
        }
        let cc = self.maxcc_filter.value().round() as i64;
        if self.last_max_cc != Some(cc) {
            self.bus.publish(paths::MAX_CHARGE_CURRENT, Value::Int(cc));
            self.last_max_cc = Some(cc);
        }

        debug!(
            cvavg,
            load_current,
            est_soc,
            avg_soc,
            charge_voltage = cv,
            max_charge_current = cc,
            chgmode,
            "pack tick"
        );

        self.virtualize_soc(turn_off, avg_soc);
    }

    /// Transport callback: a bank telemetry value changed. Updates the
    /// last-known-value cache and recomputes the published value for the
    /// path from scratch across all banks.
    pub fn handle_bank_value_changed(&mut self, peer: &str, path: &str, value: Value) {
        if !self.banks.iter().any(|b| b.peer() == peer) {
            debug!(peer = %peer, "ignoring notification from unknown peer");
            return;
        }
        self.cache
            .entry(peer.to_string())
            .or_default()
            .insert(path.to_string(), value.clone());

        match self.merge_table.policy(path) {
            // Aggregator-owned and administrative paths are never
            // mirrored from bank updates.
            MergePolicy::Own | MergePolicy::Ignore => {}
            MergePolicy::Identity => self.bus.publish(path, value),
            policy => {
                let values: Vec<Value> = self
                    .banks
                    .iter()
                    .filter_map(|bank| {
                        self.cache
                            .get(bank.peer())
                            .and_then(|paths| paths.get(path))
                            .cloned()
                    })
                    .collect();
                if let Some(merged) = combine(policy, &values, self.banks.len()) {
                    self.bus.publish(path, merged);
                }
            }
        }
    }

    /// Transport callback: a battery peer appeared after startup.
    /// Always fatal; the caller is expected to exit and let the
    /// supervisor restart the process against the new topology.
    pub fn handle_bank_added(&self, peer: &str) -> PackError {
        error!(peer = %peer, "battery bank appeared after startup");
        PackError::BankAppeared(peer.to_string())
    }

    /// Transport callback: a previously discovered bank disappeared.
    /// Always fatal, as above.
    pub fn handle_bank_removed(&self, peer: &str) -> PackError {
        error!(peer = %peer, "battery bank disappeared after startup");
        PackError::BankDisappeared(peer.to_string())
    }

    /// Average output voltage of the currently reporting chargers.
    /// Absent and zero readings are skipped; no reporting chargers at
    /// all yields 0.0.
    fn charger_voltage_average(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for charger in &self.chargers {
            match self
                .bus
                .get(charger, paths::DC_VOLTAGE)
                .and_then(|v| v.as_f64())
            {
                Some(v) if v != 0.0 => {
                    sum += v;
                    n += 1;
                }
                _ => {}
            }
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    /// Turn-off hysteresis and fake-SOC publication.
    ///
    /// On the rising edge of any bank's turn-off flag the pack latches
    /// off and the release SOC is fixed; it is never recomputed while
    /// latched. While off, the published SOC is deflated so the ESS
    /// stops discharging without any hardware disconnect.
    fn virtualize_soc(&mut self, turn_off: bool, avg_soc: f64) {
        if turn_off {
            if !self.turned_off {
                self.turned_off = true;
                self.turn_on_soc = (avg_soc + 10.0).max(self.config.ess_min_soc + 10.0);
                warn!(
                    avg_soc,
                    turn_on_soc = self.turn_on_soc,
                    "cell cutoff reached, virtually turning pack off"
                );
            }
        } else if self.turned_off && avg_soc >= self.turn_on_soc {
            info!(avg_soc, "pack recovered, releasing virtual turn-off");
            self.turned_off = false;
        }

        let fake_soc = if self.force_soc != 0.0 {
            self.force_soc
        } else if self.turned_off {
            // Low enough that the ESS stops discharging, high enough
            // that it does not start an emergency charge.
            avg_soc.min(self.config.ess_min_soc).max(6.0)
        } else {
            // Keep the pack visible as alive while on.
            avg_soc.max(self.config.ess_min_soc + 4.0)
        };

        debug!(
            turn_off,
            turned_off = self.turned_off,
            avg_soc,
            turn_on_soc = self.turn_on_soc,
            fake_soc,
            "soc virtualization"
        );
        self.bus.publish(paths::SOC, Value::Float(fake_soc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn bus_with_topology(banks: usize) -> MemoryBus {
        let mut bus = MemoryBus::new();
        for i in 0..banks {
            bus.add_peer(&format!("battery.b{i}"), ServiceClass::Battery);
        }
        bus.add_peer("charger.c0", ServiceClass::Charger);
        bus.add_peer("inverter.i0", ServiceClass::Inverter);
        bus
    }

    fn seed_bank(bus: &mut MemoryBus, peer: &str, u: f64, i: f64, ucell: f64, soc: f64) {
        bus.set(peer, paths::DC_VOLTAGE, u);
        bus.set(peer, paths::DC_CURRENT, i);
        bus.set(peer, paths::MAX_CELL_VOLTAGE, ucell);
        bus.set(peer, paths::MIN_CELL_VOLTAGE, ucell - 0.004);
        bus.set(peer, paths::CELL_VOLTAGE_DIFF, 0.004);
        bus.set(peer, paths::SOC, soc);
    }

    #[test]
    fn test_bank_count_mismatch_is_fatal() {
        let bus = bus_with_topology(2);
        let config = PackConfig {
            num_banks: 3,
            ..PackConfig::default()
        };
        match Aggregator::new(config, bus) {
            Err(PackError::ConfigurationMismatch { expected, found }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("expected configuration mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_charger_class_is_fatal() {
        let mut bus = MemoryBus::new();
        bus.add_peer("battery.b0", ServiceClass::Battery);
        bus.add_peer("inverter.i0", ServiceClass::Inverter);
        match Aggregator::new(PackConfig::default(), bus) {
            Err(PackError::MissingPeers(ServiceClass::Charger)) => {}
            other => panic!("expected missing chargers, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_discovery_subscribes_bank_telemetry() {
        let bus = bus_with_topology(2);
        let aggregator = Aggregator::new(
            PackConfig {
                num_banks: 2,
                ..PackConfig::default()
            },
            bus,
        )
        .unwrap();
        let subs = aggregator.bus().subscriptions();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|(_, paths)| paths.len() == 6));
    }

    #[test]
    fn test_topology_change_callbacks_are_fatal() {
        let bus = bus_with_topology(1);
        let aggregator = Aggregator::new(PackConfig::default(), bus).unwrap();
        assert!(matches!(
            aggregator.handle_bank_added("battery.b9"),
            PackError::BankAppeared(_)
        ));
        assert!(matches!(
            aggregator.handle_bank_removed("battery.b0"),
            PackError::BankDisappeared(_)
        ));
    }

    #[test]
    fn test_merge_sum_recomputes_across_banks() {
        let bus = bus_with_topology(2);
        let mut aggregator = Aggregator::new(
            PackConfig {
                num_banks: 2,
                ..PackConfig::default()
            },
            bus,
        )
        .unwrap();

        aggregator.handle_bank_value_changed("battery.b0", paths::DC_CURRENT, Value::Float(4.0));
        assert_eq!(
            aggregator.bus().published(paths::DC_CURRENT),
            Some(&Value::Float(4.0))
        );

        aggregator.handle_bank_value_changed("battery.b1", paths::DC_CURRENT, Value::Float(-1.5));
        assert_eq!(
            aggregator.bus().published(paths::DC_CURRENT),
            Some(&Value::Float(2.5))
        );

        // Re-delivering the same notification changes nothing.
        aggregator.handle_bank_value_changed("battery.b1", paths::DC_CURRENT, Value::Float(-1.5));
        assert_eq!(
            aggregator.bus().published(paths::DC_CURRENT),
            Some(&Value::Float(2.5))
        );
    }

    #[test]
    fn test_merge_own_paths_never_overwritten() {
        let bus = bus_with_topology(1);
        let mut aggregator = Aggregator::new(PackConfig::default(), bus).unwrap();
        aggregator.bus_mut().publish(paths::SOC, Value::Float(42.0));

        aggregator.handle_bank_value_changed("battery.b0", paths::SOC, Value::Float(13.0));
        assert_eq!(
            aggregator.bus().published(paths::SOC),
            Some(&Value::Float(42.0))
        );
    }

    #[test]
    fn test_merge_identity_default_last_writer_wins() {
        let bus = bus_with_topology(2);
        let mut aggregator = Aggregator::new(
            PackConfig {
                num_banks: 2,
                ..PackConfig::default()
            },
            bus,
        )
        .unwrap();
        aggregator.handle_bank_value_changed("battery.b0", "/Custom/Path", Value::from("a"));
        aggregator.handle_bank_value_changed("battery.b1", "/Custom/Path", Value::from("b"));
        assert_eq!(
            aggregator.bus().published("/Custom/Path"),
            Some(&Value::from("b"))
        );
    }

    #[test]
    fn test_unknown_peer_notification_ignored() {
        let bus = bus_with_topology(1);
        let mut aggregator = Aggregator::new(PackConfig::default(), bus).unwrap();
        aggregator.handle_bank_value_changed("solar.x", paths::DC_CURRENT, Value::Float(9.0));
        assert_eq!(aggregator.bus().published(paths::DC_CURRENT), None);
    }

    #[test]
    fn test_charge_voltage_published_only_on_change() {
        let mut bus = bus_with_topology(1);
        seed_bank(&mut bus, "battery.b0", 53.0, 5.0, 3.32, 70.0);
        bus.set("charger.c0", paths::DC_VOLTAGE, 53.2);
        bus.set("inverter.i0", paths::DC_CURRENT, -2.0);

        let mut aggregator = Aggregator::new(PackConfig::default(), bus).unwrap();
        aggregator.tick_at_hour(12);
        assert!(aggregator.bus().published(paths::MAX_CHARGE_VOLTAGE).is_some());

        // Let the integrator run into its clamp so the computed voltage
        // is steady, then plant a sentinel: an unchanged value must not
        // be republished over it.
        for _ in 0..600 {
            aggregator.tick_at_hour(12);
        }
        aggregator
            .bus_mut()
            .publish(paths::MAX_CHARGE_VOLTAGE, Value::Text("sentinel".into()));
        aggregator.tick_at_hour(12);
        assert_eq!(
            aggregator.bus().published(paths::MAX_CHARGE_VOLTAGE),
            Some(&Value::Text("sentinel".into()))
        );
    }

    #[test]
    fn test_zero_reporting_chargers_average_to_zero() {
        let mut bus = bus_with_topology(1);
        seed_bank(&mut bus, "battery.b0", 53.0, 5.0, 3.32, 70.0);
        bus.set("charger.c0", paths::DC_VOLTAGE, 0.0);
        let aggregator = Aggregator::new(PackConfig::default(), bus).unwrap();
        assert_eq!(aggregator.charger_voltage_average(), 0.0);
    }

    #[test]
    fn test_force_soc_overrides_published_value() {
        let mut bus = bus_with_topology(1);
        seed_bank(&mut bus, "battery.b0", 53.0, 5.0, 3.32, 70.0);
        bus.set("charger.c0", paths::DC_VOLTAGE, 53.2);
        bus.set("inverter.i0", paths::DC_CURRENT, 0.0);

        let mut aggregator = Aggregator::new(PackConfig::default(), bus).unwrap();
        aggregator.set_force_soc(55.0);
        aggregator.tick_at_hour(12);
        assert_eq!(
            aggregator.bus().published(paths::SOC),
            Some(&Value::Float(55.0))
        );

        aggregator.set_force_soc(0.0);
        aggregator.tick_at_hour(12);
        assert_eq!(
            aggregator.bus().published(paths::SOC),
            Some(&Value::Float(70.0))
        );
    }
}
