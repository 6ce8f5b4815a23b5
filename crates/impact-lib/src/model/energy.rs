//! Pure energy and embodied-emission formulas
//!
//! All functions are deterministic and side-effect free apart from the
//! warning emitted when the reserved time has to be inferred.

use crate::window::TimeWindow;
use tracing::warn;

/// Fixed memory power draw in W/GB
pub const MEMORY_WATTS_PER_GB: f64 = 0.38;

/// Expected hardware lifespan (EL) in hours, 4 years
pub const DEFAULT_LIFESPAN_HOURS: f64 = 35_040.0;

/// Fraction of TDP drawn at a given utilization percentage
///
/// | utilization | coefficient |
/// |---|---|
/// | 0 | 0.0 |
/// | (0, 10) | 0.12 |
/// | [10, 50) | 0.32 |
/// | [50, 100) | 0.75 |
/// | >= 100 | 1.02 |
pub fn tdp_coefficient(util_percent: f64) -> f64 {
    if util_percent.is_nan() || util_percent <= 0.0 {
        0.0
    } else if util_percent < 10.0 {
        0.12
    } else if util_percent < 50.0 {
        0.32
    } else if util_percent < 100.0 {
        0.75
    } else {
        1.02
    }
}

/// CPU energy in kWh over `duration_hours`
///
/// Returns 0 when `tdp_watts` or `core_count` is not positive.
pub fn calculate_ecpu(cpu_util_percent: f64, tdp_watts: f64, core_count: f64, duration_hours: f64) -> f64 {
    package_energy_kwh(cpu_util_percent, tdp_watts, core_count, duration_hours)
}

/// GPU energy in kWh, same tiers and formula as the CPU
pub fn calculate_egpu(gpu_util_percent: f64, gpu_tdp_watts: f64, gpu_count: f64, duration_hours: f64) -> f64 {
    package_energy_kwh(gpu_util_percent, gpu_tdp_watts, gpu_count, duration_hours)
}

fn package_energy_kwh(util_percent: f64, tdp_watts: f64, units: f64, duration_hours: f64) -> f64 {
    if !(tdp_watts > 0.0) || !(units > 0.0) || !(duration_hours > 0.0) {
        return 0.0;
    }
    let power_w = tdp_watts * tdp_coefficient(util_percent);
    units * power_w * duration_hours / 1000.0
}

/// Memory energy in kWh with the default per-GB draw
///
/// No duration factor: the observation is already a window average in GB.
pub fn calculate_emem(avg_memory_gb: f64) -> f64 {
    memory_energy_kwh(avg_memory_gb, MEMORY_WATTS_PER_GB)
}

/// Memory energy in kWh for a given per-GB draw
pub fn memory_energy_kwh(avg_memory_gb: f64, watts_per_gb: f64) -> f64 {
    if !(avg_memory_gb > 0.0) || !(watts_per_gb > 0.0) {
        return 0.0;
    }
    watts_per_gb * avg_memory_gb / 1000.0
}

/// Embodied-emission share in gCO2e
///
/// `M = TE * (TR / EL) * (RR / total)`, with TE converted from kg to g.
/// Zero denominators resolve to 0.
pub fn calculate_m(
    embodied_carbon_kg: f64,
    time_reserved_hours: f64,
    reserved_units: f64,
    total_units: f64,
    lifespan_hours: f64,
) -> f64 {
    if !(total_units > 0.0) || !(lifespan_hours > 0.0) {
        return 0.0;
    }
    let embodied_g = embodied_carbon_kg * 1000.0;
    embodied_g * (time_reserved_hours / lifespan_hours) * (reserved_units / total_units)
}

/// Reserved time (TR) for a resource, falling back to the window length
pub fn time_reserved_or_window(time_reserved_hours: Option<f64>, window: &TimeWindow, resource: &str) -> f64 {
    match time_reserved_hours {
        Some(hours) => hours,
        None => {
            warn!(
                resource = %resource,
                timespan = %window.timespan(),
                "time reserved unknown, defaulting to the full window"
            );
            window.hours()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(tdp_coefficient(0.0), 0.0);
        assert_eq!(tdp_coefficient(0.01), 0.12);
        assert_eq!(tdp_coefficient(9.99), 0.12);
        assert_eq!(tdp_coefficient(10.0), 0.32);
        assert_eq!(tdp_coefficient(49.9), 0.32);
        assert_eq!(tdp_coefficient(50.0), 0.75);
        assert_eq!(tdp_coefficient(99.9), 0.75);
        assert_eq!(tdp_coefficient(100.0), 1.02);
        assert_eq!(tdp_coefficient(140.0), 1.02);
        assert_eq!(tdp_coefficient(f64::NAN), 0.0);
    }

    #[test]
    fn test_ecpu_at_fifty_percent() {
        // 50 is the inclusive lower bound of the 0.75 tier
        let e = calculate_ecpu(50.0, 200.0, 2.0, 1.0);
        assert!((e - 0.3).abs() < EPS);
    }

    #[test]
    fn test_ecpu_zero_utilization() {
        for (tdp, cores, hours) in [(200.0, 2.0, 1.0), (95.0, 64.0, 24.0), (1.0, 1.0, 0.1)] {
            assert_eq!(calculate_ecpu(0.0, tdp, cores, hours), 0.0);
        }
    }

    #[test]
    fn test_ecpu_monotonic_in_utilization() {
        let mut previous = 0.0;
        let mut util = 0.0;
        while util <= 120.0 {
            let e = calculate_ecpu(util, 180.0, 4.0, 1.0);
            assert!(e >= previous, "energy decreased at {}%", util);
            previous = e;
            util += 0.5;
        }
    }

    #[test]
    fn test_ecpu_fails_soft() {
        assert_eq!(calculate_ecpu(80.0, 0.0, 2.0, 1.0), 0.0);
        assert_eq!(calculate_ecpu(80.0, -5.0, 2.0, 1.0), 0.0);
        assert_eq!(calculate_ecpu(80.0, 200.0, 0.0, 1.0), 0.0);
        assert_eq!(calculate_egpu(80.0, 300.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_egpu_matches_cpu_formula() {
        let e = calculate_egpu(100.0, 300.0, 1.0, 2.0);
        assert!((e - 300.0 * 1.02 * 2.0 / 1000.0).abs() < EPS);
    }

    #[test]
    fn test_emem_has_no_duration_factor() {
        assert!((calculate_emem(16.0) - 0.38 * 16.0 / 1000.0).abs() < EPS);
        assert_eq!(calculate_emem(0.0), 0.0);
        assert_eq!(memory_energy_kwh(8.0, 0.0), 0.0);
    }

    #[test]
    fn test_m_linear_and_inverse() {
        let base = calculate_m(1200.0, 1.0, 2.0, 16.0, DEFAULT_LIFESPAN_HOURS);
        assert!((base - 1_200_000.0 * (1.0 / 35_040.0) * (2.0 / 16.0)).abs() < 1e-9);

        let double_te = calculate_m(2400.0, 1.0, 2.0, 16.0, DEFAULT_LIFESPAN_HOURS);
        assert!((double_te - 2.0 * base).abs() < 1e-9);

        let triple_rr = calculate_m(1200.0, 1.0, 6.0, 16.0, DEFAULT_LIFESPAN_HOURS);
        assert!((triple_rr - 3.0 * base).abs() < 1e-9);

        let double_total = calculate_m(1200.0, 1.0, 2.0, 32.0, DEFAULT_LIFESPAN_HOURS);
        assert!((double_total - base / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_m_division_guard() {
        assert_eq!(calculate_m(1200.0, 1.0, 2.0, 0.0, DEFAULT_LIFESPAN_HOURS), 0.0);
        assert_eq!(calculate_m(1200.0, 1.0, 2.0, 16.0, 0.0), 0.0);
    }

    #[test]
    fn test_time_reserved_defaults_to_window() {
        let window = TimeWindow::new("PT2H", "PT5M").unwrap();
        assert_eq!(time_reserved_or_window(Some(0.5), &window, "vm"), 0.5);
        assert!((time_reserved_or_window(None, &window, "vm") - 2.0).abs() < EPS);
    }
}
