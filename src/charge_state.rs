//! Per-bank charge state machine.
//!
//! Three states with guarded transitions evaluated in fixed precedence
//! each tick:
//!
//! 1. Bulk → Balancing once the current history is full and the estimated
//!    SOC reaches the balance threshold.
//! 2. Balancing → Floating when the balance timer runs out. The timer only
//!    counts down while the cell spread is inside tolerance.
//! 3. Balancing → Bulk on discharge (tight threshold).
//! 4. Floating → Bulk on discharge (loose threshold).
//!
//! The first true guard wins; if none fire the tick is a no-op. Refused
//! transitions are not errors.

use crate::config::PackConfig;
use std::fmt;
use tracing::{debug, info};

/// Charge phase of one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    Bulk,
    Balancing,
    Floating,
}

impl fmt::Display for ChargeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChargeState::Bulk => write!(f, "bulk"),
            ChargeState::Balancing => write!(f, "balancing"),
            ChargeState::Floating => write!(f, "floating"),
        }
    }
}

/// Per-tick telemetry the transition guards read.
#[derive(Debug, Clone, Copy)]
pub struct GuardInputs {
    /// True once the bank's current history window is full.
    pub history_full: bool,
    /// Estimated SOC from the fullness factors [%].
    pub estimated_soc: f64,
    /// Spread between highest and lowest cell [V].
    pub cell_voltage_diff: f64,
    /// SOC as reported by the bank's own BMS [%].
    pub reported_soc: f64,
}

/// Explicit tagged state plus guarded transition step.
#[derive(Debug, Clone)]
pub struct ChargeMachine {
    state: ChargeState,
    balance_timer: u32,
    start_soc: f64,
}

impl ChargeMachine {
    pub fn new(config: &PackConfig) -> Self {
        Self {
            state: ChargeState::Bulk,
            balance_timer: config.balance_time_s,
            start_soc: 0.0,
        }
    }

    pub fn state(&self) -> ChargeState {
        self.state
    }

    pub fn in_bulk(&self) -> bool {
        self.state == ChargeState::Bulk
    }

    pub fn is_balancing(&self) -> bool {
        self.state == ChargeState::Balancing
    }

    pub fn is_floating(&self) -> bool {
        self.state == ChargeState::Floating
    }

    /// True once the balance timer has run out.
    pub fn is_balanced(&self) -> bool {
        self.balance_timer == 0
    }

    /// Charging is throttled in every state past bulk.
    pub fn is_throttling(&self) -> bool {
        !self.in_bulk()
    }

    /// Seconds left on the balance timer.
    pub fn balance_timer(&self) -> u32 {
        self.balance_timer
    }

    /// Re-arms the balance timer. Invoked once per local day while the
    /// bank reports balanced, so every day ends in a fresh balancing pass.
    pub fn reset_daily(&mut self, config: &PackConfig) {
        self.balance_timer = config.balance_time_s;
    }

    /// Runs one transition cycle. Guards are evaluated in fixed
    /// precedence; the first true guard wins. Returns the state entered,
    /// or `None` if no guard fired.
    pub fn step(&mut self, inputs: &GuardInputs, config: &PackConfig) -> Option<ChargeState> {
        let next = match self.state {
            ChargeState::Bulk => self
                .charge_complete(inputs, config)
                .then_some(ChargeState::Balancing),
            ChargeState::Balancing => {
                if self.balanced(inputs, config) {
                    Some(ChargeState::Floating)
                } else if self.discharged(inputs, config.delta_soc_balance) {
                    Some(ChargeState::Bulk)
                } else {
                    None
                }
            }
            ChargeState::Floating => self
                .discharged(inputs, config.delta_soc_float)
                .then_some(ChargeState::Bulk),
        };

        if let Some(next) = next {
            info!(
                from = %self.state,
                to = %next,
                reported_soc = inputs.reported_soc,
                "charge state transition"
            );
            self.state = next;
            if matches!(next, ChargeState::Balancing | ChargeState::Floating) {
                self.start_soc = inputs.reported_soc;
            }
        }
        next
    }

    /// Bulk charging is done once the smoothed current is trustworthy and
    /// the estimated SOC has reached the balance threshold.
    fn charge_complete(&self, inputs: &GuardInputs, config: &PackConfig) -> bool {
        if !inputs.history_full {
            debug!("holding bulk, current history still filling");
            return false;
        }
        inputs.estimated_soc >= config.balance_soc_threshold
    }

    /// Counts the balance timer down while the cell spread is inside
    /// tolerance; fires once it reaches zero.
    fn balanced(&mut self, inputs: &GuardInputs, config: &PackConfig) -> bool {
        if self.balance_timer > 0 && inputs.cell_voltage_diff < config.balancer_cell_diff {
            self.balance_timer -= 1;
        }
        self.balance_timer == 0
    }

    /// Watermark discharge guard. The watermark follows the reported SOC
    /// upward; the guard fires when the shortfall against the watermark
    /// exceeds `delta`.
    fn discharged(&mut self, inputs: &GuardInputs, delta: f64) -> bool {
        if inputs.reported_soc > self.start_soc {
            self.start_soc = inputs.reported_soc;
            return false;
        }
        inputs.reported_soc < self.start_soc - delta
    }
}
