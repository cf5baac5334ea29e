//! System memory observer used by admission control.
//!
//! [`MemoryMonitor`] reports used/total/available memory and owns the single
//! threshold constant the admission math compares against. It never mutates
//! anything. The `Fixed` variant injects deterministic readings so admission
//! behaviour is testable without a 128 GB box.

use std::sync::Mutex;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A point-in-time memory reading in GB plus usage percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
}

/// Memory observer: live sysinfo probe or a fixed test fixture.
pub enum MemoryMonitor {
    Live {
        threshold_percent: f64,
        system: Mutex<System>,
    },
    Fixed {
        threshold_percent: f64,
        reading: Mutex<MemoryReading>,
    },
}

impl MemoryMonitor {
    pub fn new(threshold_percent: f64) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        Self::Live {
            threshold_percent,
            system: Mutex::new(system),
        }
    }

    /// Fixture with explicit total/used GB; available is the difference.
    pub fn fixed(threshold_percent: f64, total_gb: f64, used_gb: f64) -> Self {
        Self::Fixed {
            threshold_percent,
            reading: Mutex::new(fixed_reading(total_gb, used_gb)),
        }
    }

    /// Replace the fixture reading. Panics on the live variant.
    pub fn set_fixed_usage(&self, total_gb: f64, used_gb: f64) {
        match self {
            Self::Fixed { reading, .. } => {
                *reading.lock().expect("memory reading lock poisoned") =
                    fixed_reading(total_gb, used_gb);
            }
            Self::Live { .. } => panic!("set_fixed_usage called on a live memory monitor"),
        }
    }

    pub fn threshold_percent(&self) -> f64 {
        match self {
            Self::Live {
                threshold_percent, ..
            }
            | Self::Fixed {
                threshold_percent, ..
            } => *threshold_percent,
        }
    }

    pub fn reading(&self) -> MemoryReading {
        match self {
            Self::Live { system, .. } => {
                let mut system = system.lock().expect("sysinfo lock poisoned");
                system.refresh_memory();
                let total_gb = system.total_memory() as f64 / BYTES_PER_GB;
                let used_gb = system.used_memory() as f64 / BYTES_PER_GB;
                let available_gb = system.available_memory() as f64 / BYTES_PER_GB;
                MemoryReading {
                    total_gb,
                    used_gb,
                    available_gb,
                    usage_percent: percent(used_gb, total_gb),
                }
            }
            Self::Fixed { reading, .. } => *reading.lock().expect("memory reading lock poisoned"),
        }
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.reading().total_gb
    }

    pub fn used_memory_gb(&self) -> f64 {
        self.reading().used_gb
    }

    pub fn usage_percent(&self) -> f64 {
        self.reading().usage_percent
    }

    /// Convert a GB amount into system-wide percent. Used by admission math.
    pub fn percent_from_gb(&self, value_gb: f64) -> f64 {
        let total = self.total_memory_gb();
        if total <= 0.0 {
            return 0.0;
        }
        (value_gb / total) * 100.0
    }
}

fn fixed_reading(total_gb: f64, used_gb: f64) -> MemoryReading {
    MemoryReading {
        total_gb,
        used_gb,
        available_gb: (total_gb - used_gb).max(0.0),
        usage_percent: percent(used_gb, total_gb),
    }
}

fn percent(used_gb: f64, total_gb: f64) -> f64 {
    if total_gb <= 0.0 {
        0.0
    } else {
        (used_gb / total_gb) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_monitor_reports_injected_values() {
        let monitor = MemoryMonitor::fixed(90.0, 128.0, 51.2);
        let reading = monitor.reading();
        assert_eq!(reading.total_gb, 128.0);
        assert_eq!(reading.used_gb, 51.2);
        assert!((reading.usage_percent - 40.0).abs() < 1e-9);
        assert_eq!(monitor.threshold_percent(), 90.0);
    }

    #[test]
    fn percent_from_gb_scales_against_total() {
        let monitor = MemoryMonitor::fixed(90.0, 128.0, 0.0);
        assert!((monitor.percent_from_gb(32.0) - 25.0).abs() < 1e-9);
        assert_eq!(monitor.percent_from_gb(0.0), 0.0);
    }

    #[test]
    fn zero_total_never_divides_by_zero() {
        let monitor = MemoryMonitor::fixed(90.0, 0.0, 0.0);
        assert_eq!(monitor.usage_percent(), 0.0);
        assert_eq!(monitor.percent_from_gb(10.0), 0.0);
    }

    #[test]
    fn fixture_reading_can_be_replaced() {
        let monitor = MemoryMonitor::fixed(90.0, 128.0, 10.0);
        monitor.set_fixed_usage(128.0, 120.0);
        assert!(monitor.usage_percent() > 90.0);
    }

    #[test]
    fn live_monitor_reports_plausible_values() {
        let monitor = MemoryMonitor::new(90.0);
        let reading = monitor.reading();
        assert!(reading.total_gb > 0.0);
        assert!(reading.used_gb >= 0.0);
        assert!(reading.usage_percent >= 0.0 && reading.usage_percent <= 100.0);
    }
}
