//! Raw ↔ normalized position conversion.
//!
//! | mode | normalize | inverted |
//! |------|-----------|----------|
//! | raw | `raw` | `min + max - raw` |
//! | 0..100 | `(raw - min) / (max - min) * 100`, clamped | `100 - v` |
//! | -100..100 | `(raw - center) / half * 100`, clamped | `-v` |
//! | degrees | `(raw - center) * 360 / 4095` | `-v` |
//!
//! `center = (min + max) / 2` and `half = (max - min) / 2` are computed in
//! floating point. `denormalize` is the exact inverse, rounded and clamped
//! into `[min, max]`.

use crate::consts::DEGREES_RESOLUTION;

use super::types::{MotorCalibration, NormMode};

/// Convert a raw encoder reading into the servo's engineering unit.
pub fn normalize(raw: u16, cal: &MotorCalibration) -> f64 {
    let raw = raw as f64;
    let (min, max) = (cal.range_min as f64, cal.range_max as f64);
    let span = (max - min).max(1.0);
    let center = cal.center();
    let inverted = cal.drive_mode.is_inverted();

    match cal.norm_mode {
        NormMode::Raw => {
            if inverted {
                min + max - raw
            } else {
                raw
            }
        }
        NormMode::RangeZeroToHundred => {
            let v = ((raw - min) / span * 100.0).clamp(0.0, 100.0);
            if inverted { 100.0 - v } else { v }
        }
        NormMode::RangeMinusHundredToHundred => {
            let v = ((raw - center) / (span / 2.0) * 100.0).clamp(-100.0, 100.0);
            if inverted { -v } else { v }
        }
        NormMode::Degrees => {
            let v = (raw - center) * 360.0 / DEGREES_RESOLUTION;
            if inverted { -v } else { v }
        }
    }
}

/// Convert an engineering value back into a raw goal position within the
/// calibrated range.
pub fn denormalize(value: f64, cal: &MotorCalibration) -> u16 {
    let (min, max) = (cal.range_min as f64, cal.range_max as f64);
    let span = (max - min).max(1.0);
    let center = cal.center();
    let inverted = cal.drive_mode.is_inverted();

    let raw = match cal.norm_mode {
        NormMode::Raw => {
            if inverted {
                min + max - value
            } else {
                value
            }
        }
        NormMode::RangeZeroToHundred => {
            let v = if inverted { 100.0 - value } else { value };
            v / 100.0 * span + min
        }
        NormMode::RangeMinusHundredToHundred => {
            let v = if inverted { -value } else { value };
            v / 100.0 * (span / 2.0) + center
        }
        NormMode::Degrees => {
            let v = if inverted { -value } else { value };
            v * DEGREES_RESOLUTION / 360.0 + center
        }
    };

    if !raw.is_finite() {
        return center.round() as u16;
    }
    raw.round().clamp(min, max.max(min)) as u16
}

/// Radians → degrees, the scale used by the controller's joint API.
#[inline]
pub fn radians_to_degrees(rad: f64) -> f64 {
    rad * 180.0 / std::f64::consts::PI
}

/// Degrees → radians.
#[inline]
pub fn degrees_to_radians(deg: f64) -> f64 {
    deg * std::f64::consts::PI / 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::types::DriveMode;
    use proptest::prelude::*;

    fn cal(mode: NormMode, drive: DriveMode, min: u16, max: u16) -> MotorCalibration {
        MotorCalibration {
            id: 1,
            drive_mode: drive,
            homing_offset: 0,
            range_min: min,
            range_max: max,
            norm_mode: mode,
        }
    }

    #[test]
    fn test_degrees_center_is_zero() {
        let c = cal(NormMode::Degrees, DriveMode::Normal, 500, 3500);
        assert_eq!(normalize(2000, &c), 0.0);
        let top = normalize(3500, &c);
        assert!((top - 1500.0 * 360.0 / 4095.0).abs() < 1e-9);
        assert!((top - 131.868).abs() < 1e-3);
    }

    #[test]
    fn test_zero_to_hundred_midpoint() {
        let c = cal(NormMode::RangeZeroToHundred, DriveMode::Normal, 500, 3500);
        assert_eq!(normalize(2000, &c), 50.0);
        assert_eq!(normalize(500, &c), 0.0);
        assert_eq!(normalize(3500, &c), 100.0);
    }

    #[test]
    fn test_zero_to_hundred_clamps() {
        let c = cal(NormMode::RangeZeroToHundred, DriveMode::Normal, 500, 3500);
        assert_eq!(normalize(100, &c), 0.0);
        assert_eq!(normalize(4000, &c), 100.0);
    }

    #[test]
    fn test_inverted_modes() {
        let deg = cal(NormMode::Degrees, DriveMode::Inverted, 500, 3500);
        assert!(normalize(3500, &deg) < 0.0);

        let pct = cal(NormMode::RangeZeroToHundred, DriveMode::Inverted, 500, 3500);
        assert_eq!(normalize(500, &pct), 100.0);

        let raw = cal(NormMode::Raw, DriveMode::Inverted, 500, 3500);
        assert_eq!(normalize(600, &raw), 3400.0);
    }

    #[test]
    fn test_minus_hundred_to_hundred() {
        let c = cal(NormMode::RangeMinusHundredToHundred, DriveMode::Normal, 1000, 3000);
        assert_eq!(normalize(2000, &c), 0.0);
        assert_eq!(normalize(3000, &c), 100.0);
        assert_eq!(normalize(1000, &c), -100.0);
        assert_eq!(normalize(0, &c), -100.0);
    }

    #[test]
    fn test_denormalize_clamps_into_range() {
        let c = cal(NormMode::Degrees, DriveMode::Normal, 500, 3500);
        assert_eq!(denormalize(720.0, &c), 3500);
        assert_eq!(denormalize(-720.0, &c), 500);
        assert_eq!(denormalize(f64::NAN, &c), 2000);
    }

    #[test]
    fn test_radian_scale() {
        assert!((radians_to_degrees(std::f64::consts::FRAC_PI_2) - 90.0).abs() < 1e-12);
        assert!((degrees_to_radians(180.0) - std::f64::consts::PI).abs() < 1e-12);
    }

    fn any_mode() -> impl Strategy<Value = NormMode> {
        prop_oneof![
            Just(NormMode::Raw),
            Just(NormMode::RangeZeroToHundred),
            Just(NormMode::RangeMinusHundredToHundred),
            Just(NormMode::Degrees),
        ]
    }

    fn any_drive() -> impl Strategy<Value = DriveMode> {
        prop_oneof![Just(DriveMode::Normal), Just(DriveMode::Inverted)]
    }

    proptest! {
        #[test]
        fn prop_roundtrip_within_one_count(
            mode in any_mode(),
            drive in any_drive(),
            (min, max, raw) in (0u16..4095).prop_flat_map(|min| (Just(min), (min + 1)..=4095u16))
                .prop_flat_map(|(min, max)| (Just(min), Just(max), min..=max)),
        ) {
            let c = cal(mode, drive, min, max);
            let back = denormalize(normalize(raw, &c), &c);
            prop_assert!((back as i32 - raw as i32).abs() <= 1,
                "mode={mode:?} drive={drive:?} range=[{min},{max}] raw={raw} back={back}");
        }

        #[test]
        fn prop_denormalize_stays_in_range(
            mode in any_mode(),
            drive in any_drive(),
            value in -1.0e6f64..1.0e6,
        ) {
            let c = cal(mode, drive, 700, 3100);
            let raw = denormalize(value, &c);
            prop_assert!((700..=3100).contains(&raw));
        }
    }
}
