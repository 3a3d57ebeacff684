//! Simulation tunables.

use serde::{Deserialize, Serialize};

/// Tunable simulation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationParameters {
    /// CFL condition number bounding per-substep displacement (in cells).
    pub cfl_number: f64,
    /// Lower bound on the substep length (seconds).
    pub min_time_step: f64,
    /// Upper bound on the substep length (seconds).
    pub max_time_step: f64,
    /// Fluid density.
    pub density: f64,
    /// Max-norm tolerance for the pressure solve.
    pub pressure_solve_tolerance: f64,
    /// Iteration cap for the preconditioned conjugate gradient loop.
    pub max_pressure_iterations: usize,
    /// Worker count for the particle-advance partition. Zero means use the
    /// available hardware parallelism.
    pub particle_workers: usize,
    /// Seed for the marker-particle jitter RNG. Runs are deterministic for a
    /// fixed seed.
    pub seed: u64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            cfl_number: 5.0,
            min_time_step: 1.0 / 1200.0,
            max_time_step: 1.0 / 15.0,
            density: 20.0,
            pressure_solve_tolerance: 1e-6,
            max_pressure_iterations: 200,
            particle_workers: 0,
            seed: 0,
        }
    }
}

impl SimulationParameters {
    /// Resolved particle-advance worker count.
    pub fn resolved_particle_workers(&self) -> usize {
        if self.particle_workers > 0 {
            self.particle_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
