//! 3D Eulerian-Lagrangian simulation of incompressible free-surface flow.
//!
//! The fluid is represented jointly by a staggered MAC velocity grid and a
//! population of massless marker particles. Each frame is split into
//! CFL-bounded substeps; a substep classifies fluid cells from the markers,
//! extrapolates velocities into the surrounding air, applies body forces,
//! advects the velocity field semi-Lagrangianly, projects out divergence
//! with a MIC(0)-preconditioned conjugate gradient solve, and finally
//! advances the marker particles through the corrected field.
//!
//! # Example
//!
//! ```
//! use fluid3d::FluidSimulation;
//! use glam::DVec3;
//!
//! let mut sim = FluidSimulation::new(16, 16, 16, 0.5);
//! sim.add_fluid_cuboid(DVec3::new(0.5, 0.5, 0.5), DVec3::new(7.0, 3.0, 7.0));
//! sim.set_body_force(DVec3::new(0.0, -9.8, 0.0));
//!
//! sim.run();
//! sim.update(1.0 / 30.0);
//!
//! let positions = sim.marker_particles();
//! assert!(!positions.is_empty());
//! ```

pub mod advection;
pub mod config;
pub mod extrapolation;
pub mod field;
pub mod geometry;
pub mod grid;
pub mod mac;
pub mod particle;
pub mod pressure;
pub mod timing;

pub use config::SimulationParameters;
pub use field::{ImplicitFluidField, ImplicitPoint};
pub use glam::DVec3;
pub use grid::{Grid3D, GridIndex, Material, MaterialGrid};
pub use mac::MacVelocityField;
pub use particle::{MarkerParticle, MarkerParticles};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;

use crate::timing::{timed, StepTimings};

/// The simulator. Owns every grid and the particle set.
pub struct FluidSimulation {
    width: usize,
    height: usize,
    depth: usize,
    dx: f64,

    pub params: SimulationParameters,

    pub materials: MaterialGrid,
    pub velocity: MacVelocityField,
    pub pressure: Grid3D<f64>,
    pub layers: Grid3D<i32>,
    pub particles: MarkerParticles,
    pub fluid_cells: Vec<GridIndex>,

    fluid_field: ImplicitFluidField,
    cell_to_solve_index: FxHashMap<usize, usize>,
    body_force: DVec3,
    rng: ChaCha8Rng,

    frame: u32,
    initialized: bool,
    running: bool,
    fluid_seeded: bool,
}

impl FluidSimulation {
    /// Create a simulation over `width x height x depth` cubic cells of
    /// side `dx`.
    pub fn new(width: usize, height: usize, depth: usize, dx: f64) -> Self {
        Self::with_parameters(width, height, depth, dx, SimulationParameters::default())
    }

    pub fn with_parameters(
        width: usize,
        height: usize,
        depth: usize,
        dx: f64,
        params: SimulationParameters,
    ) -> Self {
        assert!(dx > 0.0, "cell size must be positive, got {}", dx);
        assert!(
            width >= 3 && height >= 3 && depth >= 3,
            "domain must be at least 3 cells on every axis to fit the solid shell"
        );

        let seed = params.seed;
        Self {
            width,
            height,
            depth,
            dx,
            params,
            materials: MaterialGrid::new(width, height, depth),
            velocity: MacVelocityField::new(width, height, depth, dx),
            pressure: Grid3D::new(width, height, depth, 0.0),
            layers: Grid3D::new(width, height, depth, -1),
            particles: MarkerParticles::new(),
            fluid_cells: Vec::new(),
            fluid_field: ImplicitFluidField::new(),
            cell_to_solve_index: FxHashMap::default(),
            body_force: DVec3::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            frame: 0,
            initialized: false,
            running: false,
            fluid_seeded: false,
        }
    }

    // ========== Accessors ==========

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether any fluid was seeded at initialization.
    pub fn has_fluid(&self) -> bool {
        self.fluid_seeded
    }

    pub fn body_force(&self) -> DVec3 {
        self.body_force
    }

    // ========== Scene setup ==========

    /// Add a spherical implicit fluid primitive (world-space center, radius).
    pub fn add_implicit_fluid_point(&mut self, center: DVec3, radius: f64) {
        self.fluid_field.add_point(center, radius);
    }

    /// Add a fluid cuboid from its minimum corner and extents.
    pub fn add_fluid_cuboid(&mut self, min: DVec3, extents: DVec3) {
        self.fluid_field.add_cuboid(min, extents);
    }

    /// Add a fluid cuboid spanning two opposite corners.
    pub fn add_fluid_cuboid_corners(&mut self, p1: DVec3, p2: DVec3) {
        let min = p1.min(p2);
        let extents = (p2 - p1).abs();
        self.fluid_field.add_cuboid(min, extents);
    }

    pub fn set_body_force(&mut self, force: DVec3) {
        self.body_force = force;
    }

    pub fn add_body_force(&mut self, force: DVec3) {
        self.body_force += force;
    }

    // ========== Readout ==========

    /// Positions of every marker particle.
    pub fn marker_particles(&self) -> Vec<DVec3> {
        self.particles.positions()
    }

    /// Positions of every `skip`-th marker particle.
    pub fn marker_particles_every(&self, skip: usize) -> Vec<DVec3> {
        self.particles.positions_every(skip)
    }

    /// Seeded implicit point primitives, for replay.
    pub fn implicit_points(&self) -> Vec<ImplicitPoint> {
        self.fluid_field.implicit_points()
    }

    // ========== Lifecycle ==========

    /// Start (or resume) the simulation. The first call seals the domain
    /// boundary and seeds marker particles from the implicit fluid field.
    pub fn run(&mut self) {
        if !self.initialized {
            self.initialize();
        }
        self.running = true;
    }

    /// Toggle the paused state. Has no effect before the first `run`.
    pub fn pause(&mut self) {
        if !self.initialized {
            return;
        }
        self.running = !self.running;
    }

    /// Rendering hook; the core draws nothing.
    pub fn draw(&self) {}

    /// Advance one frame of duration `dt_frame`, internally split into
    /// CFL-bounded substeps. Does nothing until `run`, or when no fluid was
    /// seeded.
    pub fn update(&mut self, dt_frame: f64) {
        if !self.running || !self.initialized || !self.fluid_seeded {
            return;
        }

        let mut time_left = dt_frame;
        while time_left > 0.0 {
            let mut dt = self.cfl_time_step();
            if dt > time_left {
                dt = time_left;
            }
            time_left -= dt;
            self.step_fluid(dt);
        }

        self.frame += 1;
    }

    /// CFL-bounded substep length, clamped to the configured range.
    pub fn cfl_time_step(&self) -> f64 {
        let max_velocity = self.velocity.max_velocity_magnitude();
        (self.params.cfl_number * self.dx / max_velocity)
            .clamp(self.params.min_time_step, self.params.max_time_step)
    }

    // ========== Initialization ==========

    fn initialize(&mut self) {
        self.materials.seal_boundary();
        self.seed_fluid();
        self.initialized = true;
    }

    /// Mark every air cell whose center lies inside the implicit field as
    /// fluid, seeding eight jittered marker particles per cell.
    fn seed_fluid(&mut self) {
        self.fluid_seeded = !self.fluid_field.is_empty();
        if !self.fluid_seeded {
            return;
        }

        for k in 0..self.depth {
            for j in 0..self.height {
                for i in 0..self.width {
                    let center = self.materials.cell_center(i, j, k, self.dx);
                    if self.fluid_field.is_inside(center)
                        && self.materials.is_air(i as i64, j as i64, k as i64)
                    {
                        self.materials.set(i, j, k, Material::Fluid);
                        self.seed_cell_particles(i, j, k);
                    }
                }
            }
        }
    }

    fn seed_cell_particles(&mut self, i: usize, j: usize, k: usize) {
        let q = 0.25 * self.dx;
        let c = self.materials.cell_center(i, j, k, self.dx);

        let points = [
            DVec3::new(c.x - q, c.y - q, c.z - q),
            DVec3::new(c.x + q, c.y - q, c.z - q),
            DVec3::new(c.x + q, c.y - q, c.z + q),
            DVec3::new(c.x - q, c.y - q, c.z + q),
            DVec3::new(c.x - q, c.y + q, c.z - q),
            DVec3::new(c.x + q, c.y + q, c.z - q),
            DVec3::new(c.x + q, c.y + q, c.z + q),
            DVec3::new(c.x - q, c.y + q, c.z + q),
        ];

        // Keep the jitter strictly inside the cell so the cached index is
        // valid from the start
        let jitter = 0.25 * self.dx - 1e-6 * self.dx;
        for point in points {
            let jit = DVec3::new(
                self.rng.gen_range(-jitter..jitter),
                self.rng.gen_range(-jitter..jitter),
                self.rng.gen_range(-jitter..jitter),
            );
            self.particles
                .list
                .push(MarkerParticle::new(point + jit, i, j, k));
        }
    }

    // ========== Substep pipeline ==========

    fn step_fluid(&mut self, dt: f64) {
        let start = std::time::Instant::now();
        let mut timings = StepTimings::default();

        timings.classify_cells = timed(|| self.update_fluid_cells()).1;

        timings.extrapolate = timed(|| {
            extrapolation::extrapolate_fluid_velocities(
                &mut self.velocity,
                &self.materials,
                &mut self.layers,
                &self.fluid_cells,
                self.params.cfl_number,
            );
        })
        .1;

        timings.body_forces = timed(|| self.apply_body_forces(dt)).1;

        timings.advect_velocity = timed(|| {
            advection::advect_velocity_field(&mut self.velocity, &self.materials, dt);
        })
        .1;

        timings.pressure_solve = timed(|| {
            pressure::update_pressure_grid(
                &mut self.pressure,
                &self.velocity,
                &self.materials,
                &self.fluid_cells,
                &self.cell_to_solve_index,
                &self.params,
                dt,
            );
        })
        .1;

        timings.apply_pressure = timed(|| {
            pressure::apply_pressure_to_velocity_field(
                &mut self.velocity,
                &self.pressure,
                &self.materials,
                self.params.density,
                dt,
            );
        })
        .1;

        let workers = self.params.resolved_particle_workers();
        timings.advance_particles = timed(|| {
            advection::advance_marker_particles(
                &mut self.particles,
                &self.velocity,
                &self.materials,
                dt,
                workers,
            );
        })
        .1;

        timings.total = start.elapsed();
        timings.log_breakdown(self.frame, dt, self.fluid_cells.len());
    }

    /// Derive FLUID cells from marker occupancy and rebuild the solve
    /// ordering. Runs at the top of every substep.
    pub fn update_fluid_cells(&mut self) {
        for k in 0..self.depth {
            for j in 0..self.height {
                for i in 0..self.width {
                    if self.materials.get(i, j, k) == Material::Fluid {
                        self.materials.set(i, j, k, Material::Air);
                    }
                }
            }
        }

        for particle in &self.particles.list {
            let cell = particle.cell;
            assert!(
                !self
                    .materials
                    .is_solid(cell.i as i64, cell.j as i64, cell.k as i64),
                "marker particle in solid cell ({}, {}, {}) at {:?}",
                cell.i,
                cell.j,
                cell.k,
                particle.position
            );
            self.materials.set(cell.i, cell.j, cell.k, Material::Fluid);
        }

        self.fluid_cells.clear();
        for k in 0..self.depth {
            for j in 0..self.height {
                for i in 0..self.width {
                    if self.materials.get(i, j, k) == Material::Fluid {
                        self.fluid_cells.push(GridIndex::new(i, j, k));
                    }
                }
            }
        }

        self.cell_to_solve_index.clear();
        for (idx, cell) in self.fluid_cells.iter().enumerate() {
            self.cell_to_solve_index
                .insert(self.materials.cells.index(cell.i, cell.j, cell.k), idx);
        }
    }

    /// Add `g * dt` to every face velocity that borders fluid or has been
    /// extrapolated this substep.
    fn apply_body_forces(&mut self, dt: f64) {
        let force = self.body_force;
        let velocity = &mut self.velocity;
        let materials = &self.materials;
        let layers = &self.layers;

        if force.x.abs() > 0.0 {
            for k in 0..velocity.depth {
                for j in 0..velocity.height {
                    for i in 0..=velocity.width {
                        if materials.face_borders_material_u(i, j, k, Material::Fluid)
                            || extrapolation::face_extrapolated_u(layers, i, j, k)
                        {
                            velocity.add_u(i, j, k, force.x * dt);
                        }
                    }
                }
            }
        }

        if force.y.abs() > 0.0 {
            for k in 0..velocity.depth {
                for j in 0..=velocity.height {
                    for i in 0..velocity.width {
                        if materials.face_borders_material_v(i, j, k, Material::Fluid)
                            || extrapolation::face_extrapolated_v(layers, i, j, k)
                        {
                            velocity.add_v(i, j, k, force.y * dt);
                        }
                    }
                }
            }
        }

        if force.z.abs() > 0.0 {
            for k in 0..=velocity.depth {
                for j in 0..velocity.height {
                    for i in 0..velocity.width {
                        if materials.face_borders_material_w(i, j, k, Material::Fluid)
                            || extrapolation::face_extrapolated_w(layers, i, j, k)
                        {
                            velocity.add_w(i, j, k, force.z * dt);
                        }
                    }
                }
            }
        }
    }
}
