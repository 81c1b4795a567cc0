//! Cross-bank value merging.
//!
//! Every telemetry path a bank publishes is assigned exactly one
//! [`MergePolicy`]. When a bank reports a changed value, the pack-level
//! value for that path is recomputed from scratch over every bank's
//! last-known value. The O(n) recompute is deliberate: it stays correct
//! under missed or re-ordered notifications, which an incremental
//! accumulator would not.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// A dynamically typed value on the bus.
///
/// Variant order matters for untagged deserialization: integers must be
/// tried before floats so whole numbers keep their kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Numeric view; `None` for non-numeric kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Truthiness for the boolean-combining policies. Numbers are true
    /// when non-zero, text and lists when non-empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// How the per-bank values of one path combine into the pack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Numeric add; lists and strings concatenate.
    Sum,
    /// Numeric sum divided by bank count, rounded to 3 decimals.
    Average,
    /// Numeric maximum across banks.
    Max,
    /// Numeric minimum across banks.
    Min,
    /// Boolean AND across banks.
    AllSet,
    /// Boolean OR across banks.
    OneSet,
    /// Computed by the aggregator itself; bank updates never overwrite it.
    Own,
    /// Administrative metadata, not mirrored.
    Ignore,
    /// Last writer wins (the default for unassigned paths).
    Identity,
}

/// Static path-to-policy table, built once at configuration time.
#[derive(Debug, Clone, Default)]
pub struct MergeTable {
    policies: HashMap<String, MergePolicy>,
}

impl MergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a policy to a path. Each path is covered exactly once.
    ///
    /// # Panics
    /// Panics if the path already has a policy; a double assignment is a
    /// table-construction bug.
    pub fn assign(&mut self, path: &str, policy: MergePolicy) {
        let previous = self.policies.insert(path.to_string(), policy);
        assert!(
            previous.is_none(),
            "merge policy for {path} assigned more than once"
        );
    }

    /// Policy for a path; unassigned paths default to last-writer-wins.
    pub fn policy(&self, path: &str) -> MergePolicy {
        self.policies
            .get(path)
            .copied()
            .unwrap_or(MergePolicy::Identity)
    }

    /// Number of explicitly assigned paths.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The standard table for BMS-style bank telemetry.
    pub fn standard() -> Self {
        let mut table = Self::new();

        for path in [
            "/Info/MaxDischargeCurrent",
            "/Dc/0/Current",
            "/Dc/0/Power",
            "/InstalledCapacity",
            "/ConsumedAmphours",
            "/Capacity",
            "/System/NrOfModulesOnline",
            "/System/NrOfModulesOffline",
            "/System/NrOfModulesBlockingCharge",
            "/System/NrOfModulesBlockingDischarge",
            "/Alarms/CellImbalance",
            "/Alarms/HighCellVoltage",
            "/Alarms/HighChargeCurrent",
            "/Alarms/HighChargeTemperature",
            "/Alarms/HighDischargeCurrent",
            "/Alarms/HighTemperature",
            "/Alarms/HighVoltage",
            "/Alarms/InternalFailure",
            "/Alarms/InternalFailure_alarm",
            "/Alarms/LowCellVoltage",
            "/Alarms/LowChargeTemperature",
            "/Alarms/LowSoc",
            "/Alarms/LowTemperature",
            "/Alarms/LowVoltage",
            "/Alarms/BmsCable",
        ] {
            table.assign(path, MergePolicy::Sum);
        }

        for path in [
            "/Info/MaxChargeVoltage",
            "/Info/MaxChargeCurrent",
            "/Ess/Balancing",
            "/Ess/Chgmode",
            "/Ess/Throttling",
            "/Soc",
            "/Debug/ForceSoc",
        ] {
            table.assign(path, MergePolicy::Own);
        }

        for path in ["/System/MinCellTemperature", "/System/MinCellVoltage"] {
            table.assign(path, MergePolicy::Min);
        }

        for path in [
            "/Info/BatteryLowVoltage",
            "/Dc/0/Voltage",
            "/Dc/0/Temperature",
            "/System/MaxCellTemperature",
            "/System/MaxCellVoltage",
            "/Voltages/Diff",
        ] {
            table.assign(path, MergePolicy::Max);
        }

        for path in [
            "/Io/AllowToCharge",
            "/Io/AllowToDischarge",
            "/Io/AllowToBalance",
        ] {
            table.assign(path, MergePolicy::AllSet);
        }

        for path in [
            "/Mgmt/ProcessName",
            "/Mgmt/ProcessVersion",
            "/Mgmt/Connection",
            "/DeviceInstance",
            "/ProductId",
            "/ProductName",
            "/FirmwareVersion",
            "/HardwareVersion",
            "/Connected",
            "/Dc/0/MidVoltage",
            "/Dc/0/MidVoltageDeviation",
            "/History/ChargeCycles",
            "/History/TotalAhDrawn",
            "/System/NrOfCellsPerBattery",
        ] {
            table.assign(path, MergePolicy::Ignore);
        }

        table
    }
}

/// Combines the per-bank values of one path under a policy.
///
/// `values` holds the last-known value of each currently-reporting bank;
/// banks with no cached value yet are simply absent. `bank_count` is the
/// configured bank count, used as the Average divisor. Returns `None`
/// when nothing can be published (no values, a non-combining policy, or a
/// kind mismatch).
pub fn combine(policy: MergePolicy, values: &[Value], bank_count: usize) -> Option<Value> {
    if values.is_empty() {
        return None;
    }
    match policy {
        MergePolicy::Sum => sum(values),
        MergePolicy::Average => {
            if bank_count == 0 {
                return None;
            }
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            Some(Value::Float(round3(total / bank_count as f64)))
        }
        MergePolicy::Max => numeric_fold(values, f64::max),
        MergePolicy::Min => numeric_fold(values, f64::min),
        MergePolicy::AllSet => Some(Value::Bool(values.iter().all(Value::is_truthy))),
        MergePolicy::OneSet => Some(Value::Bool(values.iter().any(Value::is_truthy))),
        MergePolicy::Own | MergePolicy::Ignore | MergePolicy::Identity => None,
    }
}

pub(crate) fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Kind-dependent sum: numbers add, lists and strings concatenate. The
/// first value picks the kind; values of another kind are skipped with a
/// warning.
fn sum(values: &[Value]) -> Option<Value> {
    match values.first()? {
        Value::Int(_) | Value::Float(_) => {
            let mut acc = 0.0;
            let mut all_int = true;
            for v in values {
                match v {
                    Value::Int(i) => acc += *i as f64,
                    Value::Float(f) => {
                        all_int = false;
                        acc += f;
                    }
                    other => warn!(?other, "skipping non-numeric value in sum"),
                }
            }
            Some(if all_int {
                Value::Int(acc as i64)
            } else {
                Value::Float(acc)
            })
        }
        Value::Text(_) => {
            let mut acc = String::new();
            for v in values {
                match v {
                    Value::Text(s) => acc.push_str(s),
                    other => warn!(?other, "skipping non-text value in sum"),
                }
            }
            Some(Value::Text(acc))
        }
        Value::List(_) => {
            let mut acc = Vec::new();
            for v in values {
                match v {
                    Value::List(l) => acc.extend(l.iter().cloned()),
                    other => warn!(?other, "skipping non-list value in sum"),
                }
            }
            Some(Value::List(acc))
        }
        Value::Bool(_) => {
            warn!("sum policy over boolean values has no meaning");
            None
        }
    }
}

fn numeric_fold(values: &[Value], f: impl Fn(f64, f64) -> f64) -> Option<Value> {
    let mut acc: Option<f64> = None;
    let mut all_int = true;
    for v in values {
        let x = match v {
            Value::Int(i) => *i as f64,
            Value::Float(x) => {
                all_int = false;
                *x
            }
            other => {
                warn!(?other, "skipping non-numeric value in min/max");
                continue;
            }
        };
        acc = Some(match acc {
            Some(a) => f(a, x),
            None => x,
        });
    }
    acc.map(|a| {
        if all_int {
            Value::Int(a as i64)
        } else {
            Value::Float(a)
        }
    })
}
