//! Per-substep stage timing.

use std::time::{Duration, Instant};

use log::info;

/// Wall-clock durations for one substep of the pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepTimings {
    pub classify_cells: Duration,
    pub extrapolate: Duration,
    pub body_forces: Duration,
    pub advect_velocity: Duration,
    pub pressure_solve: Duration,
    pub apply_pressure: Duration,
    pub advance_particles: Duration,
    pub total: Duration,
}

impl StepTimings {
    /// Log the per-stage durations and a percentage breakdown.
    pub fn log_breakdown(&self, frame: u32, dt: f64, fluid_cell_count: usize) {
        info!("frame {} substep dt = {:.6}s, {} fluid cells", frame, dt, fluid_cell_count);

        let stages = [
            ("update fluid cells", self.classify_cells),
            ("extrapolate velocities", self.extrapolate),
            ("apply body forces", self.body_forces),
            ("advect velocity field", self.advect_velocity),
            ("update pressure grid", self.pressure_solve),
            ("apply pressure", self.apply_pressure),
            ("advance marker particles", self.advance_particles),
        ];

        let total = self.total.as_secs_f64().max(1e-12);
        for (name, duration) in stages {
            let secs = duration.as_secs_f64();
            info!(
                "  {:<26} {:>9.4}s  {:>5.1}%",
                name,
                secs,
                100.0 * secs / total
            );
        }
        info!("  {:<26} {:>9.4}s", "substep total", self.total.as_secs_f64());
    }
}

/// Measure a closure's wall-clock time.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let result = f();
    (result, start.elapsed())
}
