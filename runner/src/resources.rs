use std::{thread, time::Duration};
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::debug;

/// window the CPU utilization is averaged over
pub const SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// Source of the free core estimate used for admission control
/// (kept as an enum like the executors, a fixed value makes admission deterministic)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreSampler {
    /// sample the utilization of this host
    System { window: Duration },
    /// always report the same number of free cores
    Fixed(usize),
}

impl Default for CoreSampler {
    fn default() -> Self {
        Self::System {
            window: SAMPLE_WINDOW,
        }
    }
}

impl CoreSampler {
    pub fn free_cores(&self) -> usize {
        match self {
            Self::System { window } => free_cores(*window),
            Self::Fixed(cores) => *cores,
        }
    }
}

/// Estimate the number of idle physical cores of this host.
///
/// This blocks for `window` and is an instantaneous, noisy reading, not a reservation.
pub fn free_cores(window: Duration) -> usize {
    let mut system = System::new();

    system.refresh_cpu();
    thread::sleep(window.max(MINIMUM_CPU_UPDATE_INTERVAL));
    system.refresh_cpu();

    let utilization = f64::from(system.global_cpu_info().cpu_usage()) / 100.0;
    let physical = system
        .physical_core_count()
        .unwrap_or_else(|| system.cpus().len());
    let free = estimate_free_cores(utilization, physical);

    debug!(
        utilization = utilization,
        physical = physical,
        "Sampled {free} free cores"
    );

    free
}

fn estimate_free_cores(utilization: f64, physical: usize) -> usize {
    ((1.0 - utilization.clamp(0.0, 1.0)) * physical as f64).round() as usize
}
