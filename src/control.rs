//! Pure helpers for the per-bank charge control law.
//!
//! These functions carry no state; the per-bank controller in
//! [`crate::bank`] composes them once per tick.

/// Lower knee of the dynamic cell cutoff voltage band [V].
pub const CUTOFF_BASE: f64 = 3.1;

/// Width of the dynamic cutoff band [V].
pub const CUTOFF_RANGE: f64 = 0.25;

/// Voltage fullness factor.
///
/// 0 for cell voltages at or below `umin`, ramping linearly to 1 as the
/// measured max cell voltage `u` reaches the per-cell target `bcv`, and 1
/// above it. `umin` sits a little below the float setpoint so a resting
/// pack never reads as empty.
pub fn fu(u: f64, bcv: f64, umin: f64) -> f64 {
    if u < umin {
        return 0.0;
    }
    ((u - umin) / (bcv - umin)).min(1.0)
}

/// Tail-current fullness factor.
///
/// 1 while the current magnitude is at or below `c100` (1% of rated
/// capacity), decaying linearly to 0 as it reaches `c2` (50% of rated
/// capacity). A full cell can only sustain a trickle at the target
/// voltage, so a shrinking tail current indicates a full pack.
pub fn fi(i: f64, c100: f64, c2: f64) -> f64 {
    let i = i.abs();
    if i > c2 {
        0.0
    } else if i < c100 {
        1.0
    } else {
        1.0 - (i - c100) / (c2 - c100)
    }
}

/// Dynamic per-cell cutoff voltage [V].
///
/// The cutoff rises toward [`CUTOFF_BASE`] as discharge current shrinks
/// and drops toward `CUTOFF_BASE - CUTOFF_RANGE` under heavy discharge,
/// so a sagging cell under load is not mistaken for an empty one. With no
/// current reading the cutoff stays at the base.
pub fn cell_cutoff(pack_current: f64, capacity_ah: f64) -> f64 {
    if pack_current == 0.0 {
        return CUTOFF_BASE;
    }
    (CUTOFF_BASE + CUTOFF_RANGE * (pack_current / capacity_ah))
        .clamp(CUTOFF_BASE - CUTOFF_RANGE, CUTOFF_BASE)
}
