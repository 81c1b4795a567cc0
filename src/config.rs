//! Pack configuration and derived capacity thresholds.

use crate::errors::PackError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the virtual pack and its per-bank controllers.
///
/// All fields have working defaults; a deployment overrides the ones it
/// cares about in a JSON file loaded with [`PackConfig::load`]. The
/// defaults describe a single 90 Ah 16-cell LiFePO4 bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Expected number of battery banks on the bus.
    pub num_banks: usize,
    /// Rated capacity per bank [Ah].
    pub capacity_ah: f64,
    /// Cells in series per bank.
    pub num_cells: u32,
    /// Time to keep balancing after cells converge, before floating [s].
    pub balance_time_s: u32,
    /// Per-cell setpoint while balancing and while pulling stragglers up [V].
    pub cell_pull: f64,
    /// Per-cell setpoint once the whole fleet floats [V].
    pub cell_float: f64,
    /// Absolute per-cell ceiling the charger may command [V].
    pub max_charging_cell_voltage: f64,
    /// Estimated SOC required to enter balancing [%].
    pub balance_soc_threshold: f64,
    /// Cell spread below which the balance timer runs down [V].
    pub balancer_cell_diff: f64,
    /// Reported-SOC drop ending balancing [%].
    pub delta_soc_balance: f64,
    /// Reported-SOC drop ending floating [%].
    pub delta_soc_float: f64,
    /// Minimum SOC configured in the downstream ESS [%].
    pub ess_min_soc: f64,
    /// Proportional gain of the charge-voltage loop.
    pub kp: f64,
    /// Integral gain of the charge-voltage loop.
    pub ki: f64,
    /// Integrator clamp, discharging direction.
    pub ysum_min: f64,
    /// Integrator clamp, charging direction (tighter: anti-windup is
    /// asymmetric on purpose, overshooting upward is the dangerous case).
    pub ysum_max: f64,
    /// Smoothing coefficient of the max-charge-current filter.
    pub max_cc_filter_k: f64,
    /// Current history window length [samples].
    pub history_len: usize,
    /// Aggregator tick interval [s].
    pub tick_interval_s: u64,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            num_banks: 1,
            capacity_ah: 90.0,
            num_cells: 16,
            balance_time_s: 300,
            cell_pull: 3.380,
            cell_float: 3.335,
            max_charging_cell_voltage: 3.55,
            balance_soc_threshold: 99.0,
            balancer_cell_diff: 0.005,
            delta_soc_balance: 0.1,
            delta_soc_float: 2.5,
            ess_min_soc: 10.0,
            kp: 0.75,
            ki: 0.02,
            ysum_min: -1.5,
            ysum_max: 0.75,
            max_cc_filter_k: 0.25,
            history_len: 30,
            tick_interval_s: 1,
        }
    }
}

impl PackConfig {
    /// Loads configuration from a JSON file, filling unset fields with
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PackError> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// 1% of one bank's rated capacity [A].
    pub fn c100(&self) -> f64 {
        self.capacity_ah / 100.0
    }

    /// 50% of one bank's rated capacity [A].
    pub fn c2(&self) -> f64 {
        self.capacity_ah / 2.0
    }

    /// Rated capacity of the whole pack [Ah].
    pub fn pack_capacity(&self) -> f64 {
        self.capacity_ah * self.num_banks as f64
    }

    /// 1% of pack capacity [A], floored at 1 A.
    pub fn cges100(&self) -> f64 {
        (self.pack_capacity() / 100.0).max(1.0)
    }

    /// 50% of pack capacity [A].
    pub fn cges2(&self) -> f64 {
        self.pack_capacity() / 2.0
    }

    /// Headroom between the pull setpoint and the per-cell ceiling [V].
    pub fn voltage_range(&self) -> f64 {
        self.max_charging_cell_voltage - self.cell_pull
    }

    /// Lower knee of the voltage fullness ramp [V].
    pub fn umin(&self) -> f64 {
        self.cell_float - 0.020
    }

    /// Hard ceiling for the pack charge voltage [V].
    pub fn max_charging_voltage(&self) -> f64 {
        self.num_cells as f64 * self.max_charging_cell_voltage
    }
}
