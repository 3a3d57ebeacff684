//! Semi-Lagrangian velocity advection and marker-particle advance.
//!
//! Face velocities are advected by tracing backwards through the current
//! field with RK4 and sampling at the trace end point. The three component
//! sweeps only read the live field and write disjoint temp buffers, so they
//! run concurrently; particles are partitioned into contiguous ranges across
//! the worker pool.

use glam::DVec3;
use log::warn;
use rayon::prelude::*;

use crate::geometry::{position_in_grid, position_to_cell, resolve_solid_collision};
use crate::grid::{GridIndex, Material, MaterialGrid};
use crate::mac::MacVelocityField;
use crate::particle::{MarkerParticle, MarkerParticles};

// ========== Runge-Kutta integrators ==========

/// Second-order step through the velocity field.
pub fn rk2(field: &MacVelocityField, p0: DVec3, v0: DVec3, dt: f64) -> DVec3 {
    let k1 = v0;
    let k2 = field.velocity_at(p0 + 0.5 * dt * k1);
    p0 + dt * k2
}

/// Third-order step through the velocity field.
pub fn rk3(field: &MacVelocityField, p0: DVec3, v0: DVec3, dt: f64) -> DVec3 {
    let k1 = v0;
    let k2 = field.velocity_at(p0 + 0.5 * dt * k1);
    let k3 = field.velocity_at(p0 + 0.75 * dt * k2);
    p0 + (dt / 9.0) * (2.0 * k1 + 3.0 * k2 + 4.0 * k3)
}

/// Fourth-order step through the velocity field.
pub fn rk4(field: &MacVelocityField, p0: DVec3, v0: DVec3, dt: f64) -> DVec3 {
    let k1 = v0;
    let k2 = field.velocity_at(p0 + 0.5 * dt * k1);
    let k3 = field.velocity_at(p0 + 0.5 * dt * k2);
    let k4 = field.velocity_at(p0 + dt * k3);
    p0 + (dt / 6.0) * (k1 + 2.0 * k2 + 2.0 * k3 + k4)
}

/// One RK4 step with solid handling. On collision the end point is moved to
/// the wall and nudged back along the face normal. Returns the end point and
/// whether a collision stopped the step.
fn integrate_velocity(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    p0: DVec3,
    v0: DVec3,
    dt: f64,
) -> (DVec3, bool) {
    let dx = field.dx;
    let mut p1 = rk4(field, p0, v0, dt);

    let (ni, nj, nk) = position_to_cell(p1, dx);
    if !materials.is_solid(ni, nj, nk) {
        return (p1, false);
    }

    let (point, normal) = resolve_solid_collision(p0, p1, materials, dx);
    p1 = point + 0.01 * dx * normal;

    let (ni, nj, nk) = position_to_cell(p1, dx);
    if materials.is_solid(ni, nj, nk) {
        p1 = p0;
    }

    (p1, true)
}

/// Trace backwards through the field for `dt`, subdividing so no sub-step
/// moves farther than one cell. Returns the velocity at the trace end point.
fn trace_velocity_backwards(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    mut p0: DVec3,
    mut v0: DVec3,
    dt: f64,
) -> DVec3 {
    let dx = field.dx;
    let mut v1 = v0;

    let mut time_left = dt;
    while time_left > 0.0 {
        // |v0| of zero gives an unbounded step, capped by time_left
        let step = (dx / v0.length()).min(time_left);
        let (p1, collided) = integrate_velocity(field, materials, p0, v0, -step);
        v1 = field.velocity_at(p1);
        if collided {
            break;
        }

        p0 = p1;
        v0 = v1;
        time_left -= step;
    }

    v1
}

// ========== Velocity field advection ==========

fn advect_faces_u(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    dt: f64,
) -> Vec<(usize, f64)> {
    let mut writes = Vec::new();
    for k in 0..field.depth {
        for j in 0..field.height {
            for i in 0..=field.width {
                if materials.face_borders_material_u(i, j, k, Material::Fluid) {
                    let p0 = field.u_position(i, j, k);
                    let v0 = field.velocity_at_u_face(i, j, k);
                    let v1 = trace_velocity_backwards(field, materials, p0, v0, dt);
                    writes.push((field.u_index(i, j, k), v1.x));
                }
            }
        }
    }
    writes
}

fn advect_faces_v(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    dt: f64,
) -> Vec<(usize, f64)> {
    let mut writes = Vec::new();
    for k in 0..field.depth {
        for j in 0..=field.height {
            for i in 0..field.width {
                if materials.face_borders_material_v(i, j, k, Material::Fluid) {
                    let p0 = field.v_position(i, j, k);
                    let v0 = field.velocity_at_v_face(i, j, k);
                    let v1 = trace_velocity_backwards(field, materials, p0, v0, dt);
                    writes.push((field.v_index(i, j, k), v1.y));
                }
            }
        }
    }
    writes
}

fn advect_faces_w(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    dt: f64,
) -> Vec<(usize, f64)> {
    let mut writes = Vec::new();
    for k in 0..=field.depth {
        for j in 0..field.height {
            for i in 0..field.width {
                if materials.face_borders_material_w(i, j, k, Material::Fluid) {
                    let p0 = field.w_position(i, j, k);
                    let v0 = field.velocity_at_w_face(i, j, k);
                    let v1 = trace_velocity_backwards(field, materials, p0, v0, dt);
                    writes.push((field.w_index(i, j, k), v1.z));
                }
            }
        }
    }
    writes
}

/// Advect every face velocity bordering a fluid cell. The three component
/// sweeps read the same live field and produce disjoint write sets, so they
/// run as three parallel tasks on the rayon pool; the results are committed
/// once all sweeps have finished.
pub fn advect_velocity_field(field: &mut MacVelocityField, materials: &MaterialGrid, dt: f64) {
    field.reset_temp();

    let shared = &*field;
    let (u_writes, (v_writes, w_writes)) = rayon::join(
        || advect_faces_u(shared, materials, dt),
        || {
            rayon::join(
                || advect_faces_v(shared, materials, dt),
                || advect_faces_w(shared, materials, dt),
            )
        },
    );

    for (idx, value) in u_writes {
        field.set_temp_u_linear(idx, value);
    }
    for (idx, value) in v_writes {
        field.set_temp_v_linear(idx, value);
    }
    for (idx, value) in w_writes {
        field.set_temp_w_linear(idx, value);
    }

    field.commit_temp();
}

// ========== Marker particle advance ==========

fn advance_particle(
    particle: &mut MarkerParticle,
    field: &MacVelocityField,
    materials: &MaterialGrid,
    dt: f64,
) {
    let dx = field.dx;
    let v0 = field.velocity_at(particle.position);
    let mut p = rk4(field, particle.position, v0, dt);

    if !position_in_grid(p, materials, dx) {
        return;
    }

    let (mut i, mut j, mut k) = position_to_cell(p, dx);
    if materials.is_solid(i, j, k) {
        let (point, normal) = resolve_solid_collision(particle.position, p, materials, dx);
        p = point + 0.001 * dx * normal;
        (i, j, k) = position_to_cell(p, dx);
    }

    if !materials.is_solid(i, j, k) {
        particle.position = p;
        particle.cell = GridIndex::new(i as usize, j as usize, k as usize);
    } else {
        warn!(
            "particle advance still in solid cell ({}, {}, {}): p = {:?}, from {:?}",
            i, j, k, p, particle.position
        );
    }
}

/// Advance all marker particles one substep. The particle array is split
/// into `workers` contiguous ranges so the partition (and the result) is
/// independent of scheduling.
pub fn advance_marker_particles(
    particles: &mut MarkerParticles,
    field: &MacVelocityField,
    materials: &MaterialGrid,
    dt: f64,
    workers: usize,
) {
    if particles.is_empty() {
        return;
    }

    let workers = workers.max(1);
    let chunk = (particles.len() + workers - 1) / workers;
    particles.list.par_chunks_mut(chunk).for_each(|range| {
        for particle in range {
            advance_particle(particle, field, materials, dt);
        }
    });
}
