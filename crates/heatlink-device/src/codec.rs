//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Word decoding helpers for controller registers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use heatlink_common::config::Scale;
use serde_json::Value;

/// Raw values above this are negative temperatures in two's complement.
pub const SIGNED_FOLD_THRESHOLD: u16 = 30_000;

pub fn fold_signed(raw: u16) -> i32 {
    if raw > SIGNED_FOLD_THRESHOLD {
        i32::from(raw) - 65_536
    } else {
        i32::from(raw)
    }
}

pub fn compose_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Multiplier picked by a decimal-place selector register.
pub fn decimal_multiplier(selector: u16) -> Option<f64> {
    match selector {
        1 => Some(100.0),
        2 => Some(10.0),
        3 => Some(1.0),
        4 => Some(0.1),
        _ => None,
    }
}

/// Bits of `word`, least significant first.
pub fn expand_bits(word: u16, count: u8) -> impl Iterator<Item = u8> {
    (0..count.min(16)).map(move |bit| ((word >> bit) & 1) as u8)
}

/// Apply an optional scale. `selector` is the multiplier already resolved for
/// [`Scale::DecimalSelector`].
pub fn scale_value(value: i64, scale: Option<Scale>, selector: Option<f64>) -> Value {
    let factor = match scale {
        None => return Value::from(value),
        Some(Scale::Divisor(divisor)) => 1.0 / divisor,
        Some(Scale::Multiplier(multiplier)) => multiplier,
        Some(Scale::DecimalSelector(_)) => match selector {
            Some(multiplier) => multiplier,
            None => return Value::from(value),
        },
    };
    number(value as f64 * factor)
}

/// Whole numbers stay integers on the wire.
pub fn number(value: f64) -> Value {
    let rounded = (value * 1_000.0).round() / 1_000.0;
    if rounded.fract() == 0.0 && rounded.abs() < i64::MAX as f64 {
        Value::from(rounded as i64)
    } else {
        Value::from(rounded)
    }
}
