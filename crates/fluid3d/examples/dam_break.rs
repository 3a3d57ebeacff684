//! Dam break diagnostic run.
//!
//! Collapses a column of water in a closed box and prints per-frame stats.
//! Run with `RUST_LOG=info` to see the per-substep stage breakdown.

use fluid3d::{DVec3, FluidSimulation};

fn main() {
    env_logger::init();

    let mut sim = FluidSimulation::new(32, 32, 32, 1.0);
    sim.add_fluid_cuboid_corners(DVec3::new(1.0, 1.0, 1.0), DVec3::new(16.0, 24.0, 30.0));
    sim.set_body_force(DVec3::new(0.0, -9.8, 0.0));
    sim.run();

    println!(
        "grid: {}x{}x{}, dx = {}",
        sim.width(),
        sim.height(),
        sim.depth(),
        sim.dx()
    );
    println!("particles: {}\n", sim.particles.len());

    let frame_dt = 1.0 / 30.0;
    for frame in 0..90 {
        sim.update(frame_dt);

        let (min_x, max_x) = sim
            .particles
            .list
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.position.x), hi.max(p.position.x))
            });
        let mean_y: f64 = sim
            .particles
            .list
            .iter()
            .map(|p| p.position.y)
            .sum::<f64>()
            / sim.particles.len() as f64;
        let max_velocity = sim.velocity.max_velocity_magnitude();

        println!(
            "frame {:>3} | spread x: {:>5.2}..{:<5.2} | mean y: {:>5.2} | max |v|: {:>6.2}",
            frame, min_x, max_x, mean_y, max_velocity
        );
    }
}
