//! Pressure projection.
//!
//! One linear unknown per fluid cell, ordered by the fluid cell list. The
//! system matrix is the standard 7-point Poisson stencil scaled by
//! dt / (rho * dx^2): off-diagonals of -scale between fluid neighbors, and a
//! diagonal of scale times the cell's non-solid neighbor count. Only the
//! three +axis coefficient grids are stored; the diagonal is recomputed on
//! the fly and `A * s` is formed directly from the coefficient grids.
//!
//! The solver is preconditioned conjugate gradient with a Modified
//! Incomplete Cholesky (MIC(0)) preconditioner applied through two
//! triangular sweeps over the fluid cell ordering. A plain conjugate
//! gradient over the same matrix application is kept as a validation path.

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::config::SimulationParameters;
use crate::grid::{Grid3D, GridIndex, Material, MaterialGrid};
use crate::mac::MacVelocityField;

/// MIC(0) tuning constant.
const MIC_TUNING: f64 = 0.97;
/// MIC(0) safety constant.
const MIC_SAFETY: f64 = 0.25;

/// The three +axis off-diagonal coefficient grids of the symmetric system
/// matrix. `plus_i` at (i, j, k) couples cell (i, j, k) with (i+1, j, k).
pub struct MatrixCoefficients {
    pub plus_i: Grid3D<f64>,
    pub plus_j: Grid3D<f64>,
    pub plus_k: Grid3D<f64>,
}

impl MatrixCoefficients {
    fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            plus_i: Grid3D::new(width, height, depth, 0.0),
            plus_j: Grid3D::new(width, height, depth, 0.0),
            plus_k: Grid3D::new(width, height, depth, 0.0),
        }
    }
}

/// Map from cell coordinates to position in the fluid cell ordering.
struct SolveIndexMap<'a> {
    map: &'a FxHashMap<usize, usize>,
    width: usize,
    height: usize,
    depth: usize,
}

impl SolveIndexMap<'_> {
    #[inline]
    fn get(&self, i: i64, j: i64, k: i64) -> Option<usize> {
        if i < 0
            || j < 0
            || k < 0
            || i >= self.width as i64
            || j >= self.height as i64
            || k >= self.depth as i64
        {
            return None;
        }
        let key =
            i as usize + self.width * j as usize + self.width * self.height * k as usize;
        self.map.get(&key).copied()
    }
}

/// Diagonal entry for a fluid cell: scale times its non-solid neighbor count.
#[inline]
fn diagonal(materials: &MaterialGrid, i: usize, j: usize, k: usize, scale: f64) -> f64 {
    scale * materials.non_solid_neighbor_count(i, j, k) as f64
}

/// Negative divergence right-hand side, with the solid-boundary outflow
/// terms folded in. Returns the per-fluid-cell vector and max |b|.
fn negative_divergence(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
) -> (Vec<f64>, f64) {
    let scale = 1.0 / field.dx;
    // solids are stationary
    let u_solid = 0.0;

    let mut b = Vec::with_capacity(fluid_cells.len());
    let mut max_divergence = 0.0f64;

    for cell in fluid_cells {
        let (i, j, k) = (cell.i as i64, cell.j as i64, cell.k as i64);

        let mut value = -scale
            * (field.u(i + 1, j, k) - field.u(i, j, k)
                + field.v(i, j + 1, k) - field.v(i, j, k)
                + field.w(i, j, k + 1) - field.w(i, j, k));

        if materials.is_solid(i - 1, j, k) {
            value -= scale * (field.u(i, j, k) - u_solid);
        }
        if materials.is_solid(i + 1, j, k) {
            value += scale * (field.u(i + 1, j, k) - u_solid);
        }
        if materials.is_solid(i, j - 1, k) {
            value -= scale * (field.v(i, j, k) - u_solid);
        }
        if materials.is_solid(i, j + 1, k) {
            value += scale * (field.v(i, j + 1, k) - u_solid);
        }
        if materials.is_solid(i, j, k - 1) {
            value -= scale * (field.w(i, j, k) - u_solid);
        }
        if materials.is_solid(i, j, k + 1) {
            value += scale * (field.w(i, j, k + 1) - u_solid);
        }

        max_divergence = max_divergence.max(value.abs());
        b.push(value);
    }

    (b, max_divergence)
}

/// Off-diagonal coefficients: -scale between each pair of fluid neighbors.
fn assemble_coefficients(
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
    scale: f64,
) -> MatrixCoefficients {
    let mut coefficients =
        MatrixCoefficients::new(materials.width(), materials.height(), materials.depth());

    for cell in fluid_cells {
        let (i, j, k) = (cell.i as i64, cell.j as i64, cell.k as i64);
        if materials.is_fluid(i + 1, j, k) {
            coefficients.plus_i.set(cell.i, cell.j, cell.k, -scale);
        }
        if materials.is_fluid(i, j + 1, k) {
            coefficients.plus_j.set(cell.i, cell.j, cell.k, -scale);
        }
        if materials.is_fluid(i, j, k + 1) {
            coefficients.plus_k.set(cell.i, cell.j, cell.k, -scale);
        }
    }

    coefficients
}

/// MIC(0) preconditioner vector, one entry per fluid cell, computed in the
/// fluid cell ordering (lexicographic, so every referenced neighbor entry is
/// already final).
fn build_preconditioner(
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
    coefficients: &MatrixCoefficients,
    scale: f64,
) -> Grid3D<f64> {
    let a = coefficients;
    let mut precon = Grid3D::new(materials.width(), materials.height(), materials.depth(), 0.0);

    for cell in fluid_cells {
        let (i, j, k) = (cell.i as i64, cell.j as i64, cell.k as i64);

        let p_im1 = precon.get_or(i - 1, j, k, 0.0);
        let p_jm1 = precon.get_or(i, j - 1, k, 0.0);
        let p_km1 = precon.get_or(i, j, k - 1, 0.0);

        let v1 = a.plus_i.get_or(i - 1, j, k, 0.0) * p_im1;
        let v2 = a.plus_j.get_or(i, j - 1, k, 0.0) * p_jm1;
        let v3 = a.plus_k.get_or(i, j, k - 1, 0.0) * p_km1;

        let diag = diagonal(materials, cell.i, cell.j, cell.k, scale);
        let mut e = diag
            - v1 * v1
            - v2 * v2
            - v3 * v3
            - MIC_TUNING
                * (a.plus_i.get_or(i - 1, j, k, 0.0)
                    * (a.plus_j.get_or(i - 1, j, k, 0.0) + a.plus_k.get_or(i - 1, j, k, 0.0))
                    * p_im1
                    * p_im1
                    + a.plus_j.get_or(i, j - 1, k, 0.0)
                        * (a.plus_i.get_or(i, j - 1, k, 0.0) + a.plus_k.get_or(i, j - 1, k, 0.0))
                        * p_jm1
                        * p_jm1
                    + a.plus_k.get_or(i, j, k - 1, 0.0)
                        * (a.plus_i.get_or(i, j, k - 1, 0.0) + a.plus_j.get_or(i, j, k - 1, 0.0))
                        * p_km1
                        * p_km1);

        if e < MIC_SAFETY * diag {
            e = diag;
        }

        if e.abs() > 1e-9 {
            precon.set(cell.i, cell.j, cell.k, 1.0 / e.sqrt());
        }
    }

    precon
}

/// Apply the MIC(0) preconditioner: two triangular sweeps over the fluid
/// cell ordering.
fn apply_preconditioner(
    residual: &[f64],
    fluid_cells: &[GridIndex],
    index_map: &SolveIndexMap,
    coefficients: &MatrixCoefficients,
    precon: &Grid3D<f64>,
) -> Vec<f64> {
    let a = coefficients;
    let n = fluid_cells.len();

    // Forward sweep: solve the lower-triangular factor.
    let mut q = vec![0.0; n];
    for (idx, cell) in fluid_cells.iter().enumerate() {
        let (i, j, k) = (cell.i as i64, cell.j as i64, cell.k as i64);

        let q_at = |i, j, k| index_map.get(i, j, k).map_or(0.0, |s| q[s]);
        let t = residual[idx]
            - a.plus_i.get_or(i - 1, j, k, 0.0)
                * precon.get_or(i - 1, j, k, 0.0)
                * q_at(i - 1, j, k)
            - a.plus_j.get_or(i, j - 1, k, 0.0)
                * precon.get_or(i, j - 1, k, 0.0)
                * q_at(i, j - 1, k)
            - a.plus_k.get_or(i, j, k - 1, 0.0)
                * precon.get_or(i, j, k - 1, 0.0)
                * q_at(i, j, k - 1);

        q[idx] = t * precon.get(cell.i, cell.j, cell.k);
    }

    // Backward sweep: solve the transposed factor.
    let mut z = vec![0.0; n];
    for (idx, cell) in fluid_cells.iter().enumerate().rev() {
        let (i, j, k) = (cell.i as i64, cell.j as i64, cell.k as i64);
        let p = precon.get(cell.i, cell.j, cell.k);

        let z_at = |i, j, k| index_map.get(i, j, k).map_or(0.0, |s| z[s]);
        let t = q[idx]
            - a.plus_i.get(cell.i, cell.j, cell.k) * p * z_at(i + 1, j, k)
            - a.plus_j.get(cell.i, cell.j, cell.k) * p * z_at(i, j + 1, k)
            - a.plus_k.get(cell.i, cell.j, cell.k) * p * z_at(i, j, k + 1);

        z[idx] = t * p;
    }

    z
}

/// `A * s` formed directly from the coefficient grids and the fluid mask.
fn apply_matrix(
    s: &[f64],
    fluid_cells: &[GridIndex],
    index_map: &SolveIndexMap,
    coefficients: &MatrixCoefficients,
    materials: &MaterialGrid,
    scale: f64,
) -> Vec<f64> {
    let a = coefficients;
    let mut out = Vec::with_capacity(s.len());

    for (idx, cell) in fluid_cells.iter().enumerate() {
        let (i, j, k) = (cell.i as i64, cell.j as i64, cell.k as i64);

        let mut t = diagonal(materials, cell.i, cell.j, cell.k, scale) * s[idx];

        if let Some(n) = index_map.get(i - 1, j, k) {
            t += a.plus_i.get_or(i - 1, j, k, 0.0) * s[n];
        }
        if let Some(n) = index_map.get(i + 1, j, k) {
            t += a.plus_i.get(cell.i, cell.j, cell.k) * s[n];
        }
        if let Some(n) = index_map.get(i, j - 1, k) {
            t += a.plus_j.get_or(i, j - 1, k, 0.0) * s[n];
        }
        if let Some(n) = index_map.get(i, j + 1, k) {
            t += a.plus_j.get(cell.i, cell.j, cell.k) * s[n];
        }
        if let Some(n) = index_map.get(i, j, k - 1) {
            t += a.plus_k.get_or(i, j, k - 1, 0.0) * s[n];
        }
        if let Some(n) = index_map.get(i, j, k + 1) {
            t += a.plus_k.get(cell.i, cell.j, cell.k) * s[n];
        }

        out.push(t);
    }

    out
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn max_abs(v: &[f64]) -> f64 {
    v.iter().fold(0.0f64, |acc, x| acc.max(x.abs()))
}

/// Preconditioned conjugate gradient with max-norm stopping. Returns the
/// best-effort solution if the iteration cap is hit.
#[allow(clippy::too_many_arguments)]
fn solve_system(
    b: &[f64],
    fluid_cells: &[GridIndex],
    index_map: &SolveIndexMap,
    coefficients: &MatrixCoefficients,
    precon: &Grid3D<f64>,
    materials: &MaterialGrid,
    scale: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    let mut r = b.to_vec();

    let mut z = apply_preconditioner(&r, fluid_cells, index_map, coefficients, precon);
    let mut s = z.clone();
    let mut sigma = dot(&z, &r);

    for iteration in 0..max_iterations {
        let t = apply_matrix(&s, fluid_cells, index_map, coefficients, materials, scale);
        let alpha = sigma / dot(&t, &s);

        for idx in 0..n {
            x[idx] += alpha * s[idx];
            r[idx] -= alpha * t[idx];
        }

        let residual = max_abs(&r);
        if residual < tolerance {
            debug!(
                "pressure solve converged after {} iterations, residual {:.3e}",
                iteration + 1,
                residual
            );
            return x;
        }

        if (iteration + 1) % 10 == 0 {
            debug!("pressure iteration {}, residual {:.3e}", iteration + 1, residual);
        }

        z = apply_preconditioner(&r, fluid_cells, index_map, coefficients, precon);
        let sigma_new = dot(&z, &r);
        let beta = sigma_new / sigma;
        for idx in 0..n {
            s[idx] = z[idx] + beta * s[idx];
        }
        sigma = sigma_new;
    }

    warn!(
        "pressure solve hit the iteration limit ({}), residual {:.3e}",
        max_iterations,
        max_abs(&r)
    );
    x
}

/// Plain conjugate gradient over the same on-the-fly matrix. Slower than the
/// MIC(0) path; kept as a validation reference.
pub fn solve_system_unpreconditioned(
    b: &[f64],
    fluid_cells: &[GridIndex],
    cell_map: &FxHashMap<usize, usize>,
    coefficients: &MatrixCoefficients,
    materials: &MaterialGrid,
    scale: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Vec<f64> {
    let index_map = SolveIndexMap {
        map: cell_map,
        width: materials.width(),
        height: materials.height(),
        depth: materials.depth(),
    };

    let n = b.len();
    let mut x = vec![0.0; n];
    let mut r = b.to_vec();
    let mut s = r.clone();
    let mut sigma = dot(&r, &r);

    for _ in 0..max_iterations {
        let t = apply_matrix(&s, fluid_cells, &index_map, coefficients, materials, scale);
        let alpha = sigma / dot(&t, &s);

        for idx in 0..n {
            x[idx] += alpha * s[idx];
            r[idx] -= alpha * t[idx];
        }

        if max_abs(&r) < tolerance {
            return x;
        }

        let sigma_new = dot(&r, &r);
        let beta = sigma_new / sigma;
        for idx in 0..n {
            s[idx] = r[idx] + beta * s[idx];
        }
        sigma = sigma_new;
    }

    x
}

/// Public entry point for assembling the coefficients of the current fluid
/// configuration. Shared by the solver paths and the tests.
pub fn coefficients_for(
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
    scale: f64,
) -> MatrixCoefficients {
    assemble_coefficients(materials, fluid_cells, scale)
}

/// Right-hand side of the current configuration. Shared with the tests.
pub fn negative_divergence_for(
    field: &MacVelocityField,
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
) -> (Vec<f64>, f64) {
    negative_divergence(field, materials, fluid_cells)
}

/// Solve for pressures and write them into the pressure grid. Skips the
/// solve entirely when the velocity field is already divergence-free to
/// within tolerance.
pub fn update_pressure_grid(
    pressure: &mut Grid3D<f64>,
    field: &MacVelocityField,
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
    cell_map: &FxHashMap<usize, usize>,
    params: &SimulationParameters,
    dt: f64,
) {
    pressure.fill(0.0);
    if fluid_cells.is_empty() {
        return;
    }

    let (b, max_divergence) = negative_divergence(field, materials, fluid_cells);
    if max_divergence < params.pressure_solve_tolerance {
        debug!(
            "max divergence {:.3e} under tolerance, skipping pressure solve",
            max_divergence
        );
        return;
    }

    let scale = dt / (params.density * field.dx * field.dx);
    let coefficients = assemble_coefficients(materials, fluid_cells, scale);
    let precon = build_preconditioner(materials, fluid_cells, &coefficients, scale);
    let index_map = SolveIndexMap {
        map: cell_map,
        width: materials.width(),
        height: materials.height(),
        depth: materials.depth(),
    };

    let pressures = solve_system(
        &b,
        fluid_cells,
        &index_map,
        &coefficients,
        &precon,
        materials,
        scale,
        params.pressure_solve_tolerance,
        params.max_pressure_iterations,
    );

    for (idx, cell) in fluid_cells.iter().enumerate() {
        pressure.set(cell.i, cell.j, cell.k, pressures[idx]);
    }
}

/// Subtract the pressure gradient from every face velocity bordering fluid.
/// Faces against solid cells use a ghost pressure that pins the face-normal
/// velocity to the solid's (zero) velocity.
pub fn apply_pressure_to_velocity_field(
    field: &mut MacVelocityField,
    pressure: &Grid3D<f64>,
    materials: &MaterialGrid,
    density: f64,
    dt: f64,
) {
    field.reset_temp();

    let scale = dt / (density * field.dx);
    let inv_scale = 1.0 / scale;
    let u_solid = 0.0;

    for k in 0..field.depth {
        for j in 0..field.height {
            for i in 0..=field.width {
                if !materials.face_borders_material_u(i, j, k, Material::Fluid) {
                    continue;
                }
                let (ci, cj, ck) = (i as i64 - 1, j as i64, k as i64);
                let u = field.u(i as i64, j as i64, k as i64);

                let (p0, p1) = if !materials.is_solid(ci, cj, ck)
                    && !materials.is_solid(ci + 1, cj, ck)
                {
                    (
                        pressure.get_or(ci, cj, ck, 0.0),
                        pressure.get_or(ci + 1, cj, ck, 0.0),
                    )
                } else if materials.is_solid(ci, cj, ck) {
                    let p1 = pressure.get_or(ci + 1, cj, ck, 0.0);
                    (p1 - inv_scale * (u - u_solid), p1)
                } else {
                    let p0 = pressure.get_or(ci, cj, ck, 0.0);
                    (p0, p0 + inv_scale * (u - u_solid))
                };

                field.set_temp_u(i, j, k, u - scale * (p1 - p0));
            }
        }
    }

    for k in 0..field.depth {
        for j in 0..=field.height {
            for i in 0..field.width {
                if !materials.face_borders_material_v(i, j, k, Material::Fluid) {
                    continue;
                }
                let (ci, cj, ck) = (i as i64, j as i64 - 1, k as i64);
                let v = field.v(i as i64, j as i64, k as i64);

                let (p0, p1) = if !materials.is_solid(ci, cj, ck)
                    && !materials.is_solid(ci, cj + 1, ck)
                {
                    (
                        pressure.get_or(ci, cj, ck, 0.0),
                        pressure.get_or(ci, cj + 1, ck, 0.0),
                    )
                } else if materials.is_solid(ci, cj, ck) {
                    let p1 = pressure.get_or(ci, cj + 1, ck, 0.0);
                    (p1 - inv_scale * (v - u_solid), p1)
                } else {
                    let p0 = pressure.get_or(ci, cj, ck, 0.0);
                    (p0, p0 + inv_scale * (v - u_solid))
                };

                field.set_temp_v(i, j, k, v - scale * (p1 - p0));
            }
        }
    }

    for k in 0..=field.depth {
        for j in 0..field.height {
            for i in 0..field.width {
                if !materials.face_borders_material_w(i, j, k, Material::Fluid) {
                    continue;
                }
                let (ci, cj, ck) = (i as i64, j as i64, k as i64 - 1);
                let w = field.w(i as i64, j as i64, k as i64);

                let (p0, p1) = if !materials.is_solid(ci, cj, ck)
                    && !materials.is_solid(ci, cj, ck + 1)
                {
                    (
                        pressure.get_or(ci, cj, ck, 0.0),
                        pressure.get_or(ci, cj, ck + 1, 0.0),
                    )
                } else if materials.is_solid(ci, cj, ck) {
                    let p1 = pressure.get_or(ci, cj, ck + 1, 0.0);
                    (p1 - inv_scale * (w - u_solid), p1)
                } else {
                    let p0 = pressure.get_or(ci, cj, ck, 0.0);
                    (p0, p0 + inv_scale * (w - u_solid))
                };

                field.set_temp_w(i, j, k, w - scale * (p1 - p0));
            }
        }
    }

    field.commit_temp();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Material;

    /// Sealed box with a block of fluid cells; returns the grid and the
    /// fluid cell list in lexicographic order with its index map.
    fn fluid_block(
        n: usize,
        range: std::ops::Range<usize>,
    ) -> (MaterialGrid, Vec<GridIndex>, FxHashMap<usize, usize>) {
        let mut materials = MaterialGrid::new(n, n, n);
        materials.seal_boundary();

        let mut fluid_cells = Vec::new();
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    if range.contains(&i) && range.contains(&j) && range.contains(&k) {
                        materials.set(i, j, k, Material::Fluid);
                        fluid_cells.push(GridIndex::new(i, j, k));
                    }
                }
            }
        }

        let mut map = FxHashMap::default();
        for (idx, cell) in fluid_cells.iter().enumerate() {
            map.insert(materials.cells.index(cell.i, cell.j, cell.k), idx);
        }

        (materials, fluid_cells, map)
    }

    #[test]
    fn test_divergence_zero_for_still_field() {
        let (materials, fluid_cells, _) = fluid_block(8, 2..6);
        let field = MacVelocityField::new(8, 8, 8, 1.0);

        let (b, max_divergence) = negative_divergence(&field, &materials, &fluid_cells);
        assert_eq!(max_divergence, 0.0);
        assert!(b.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_divergence_sees_outflow() {
        let (materials, fluid_cells, map) = fluid_block(8, 2..6);
        let mut field = MacVelocityField::new(8, 8, 8, 1.0);

        // Outflow through the +x face of cell (4, 4, 4)
        field.set_u(5, 4, 4, 1.0);

        let (b, max_divergence) = negative_divergence(&field, &materials, &fluid_cells);
        assert!(max_divergence > 0.0);

        let idx = map[&materials.cells.index(4, 4, 4)];
        assert_eq!(b[idx], -1.0);
    }

    #[test]
    fn test_matrix_is_symmetric() {
        let (materials, fluid_cells, map) = fluid_block(8, 2..6);
        let scale = 1.0;
        let coefficients = assemble_coefficients(&materials, &fluid_cells, scale);
        let index_map = SolveIndexMap {
            map: &map,
            width: 8,
            height: 8,
            depth: 8,
        };

        let n = fluid_cells.len();
        // Probe symmetry with basis vectors: (A e_p)[q] == (A e_q)[p]
        for (p, q) in [(0, 1), (3, 17), (n - 2, n - 1), (5, 40)] {
            let mut ep = vec![0.0; n];
            ep[p] = 1.0;
            let mut eq = vec![0.0; n];
            eq[q] = 1.0;

            let aep = apply_matrix(&ep, &fluid_cells, &index_map, &coefficients, &materials, scale);
            let aeq = apply_matrix(&eq, &fluid_cells, &index_map, &coefficients, &materials, scale);
            assert!(
                (aep[q] - aeq[p]).abs() < 1e-12,
                "A[{},{}] = {} but A[{},{}] = {}",
                q,
                p,
                aep[q],
                p,
                q,
                aeq[p]
            );
        }
    }

    #[test]
    fn test_pcg_solves_system() {
        let (materials, fluid_cells, map) = fluid_block(8, 2..6);
        let mut field = MacVelocityField::new(8, 8, 8, 1.0);

        // A lumpy velocity field over the fluid block
        for k in 2..6 {
            for j in 2..6 {
                for i in 2..=6 {
                    field.set_u(i, j, k, ((i * 7 + j * 3 + k) % 5) as f64 * 0.2 - 0.4);
                }
            }
        }

        let (b, _) = negative_divergence(&field, &materials, &fluid_cells);
        let scale = 1.0;
        let coefficients = assemble_coefficients(&materials, &fluid_cells, scale);
        let precon = build_preconditioner(&materials, &fluid_cells, &coefficients, scale);
        let index_map = SolveIndexMap {
            map: &map,
            width: 8,
            height: 8,
            depth: 8,
        };

        let x = solve_system(
            &b,
            &fluid_cells,
            &index_map,
            &coefficients,
            &precon,
            &materials,
            scale,
            1e-9,
            200,
        );

        // Residual check: A x == b in the max norm
        let ax = apply_matrix(&x, &fluid_cells, &index_map, &coefficients, &materials, scale);
        let residual = ax
            .iter()
            .zip(&b)
            .fold(0.0f64, |acc, (l, r)| acc.max((l - r).abs()));
        assert!(residual < 1e-8, "residual = {:.3e}", residual);
    }

    #[test]
    fn test_pcg_matches_plain_cg() {
        let (materials, fluid_cells, map) = fluid_block(8, 3..6);
        let mut field = MacVelocityField::new(8, 8, 8, 1.0);
        for k in 3..6 {
            for j in 3..6 {
                for i in 3..=6 {
                    field.set_u(i, j, k, (i as f64 - 4.0) * 0.3);
                }
            }
        }

        let (b, _) = negative_divergence(&field, &materials, &fluid_cells);
        let scale = 0.5;
        let coefficients = assemble_coefficients(&materials, &fluid_cells, scale);
        let precon = build_preconditioner(&materials, &fluid_cells, &coefficients, scale);
        let index_map = SolveIndexMap {
            map: &map,
            width: 8,
            height: 8,
            depth: 8,
        };

        let x_mic = solve_system(
            &b,
            &fluid_cells,
            &index_map,
            &coefficients,
            &precon,
            &materials,
            scale,
            1e-10,
            300,
        );
        let x_cg = solve_system_unpreconditioned(
            &b,
            &fluid_cells,
            &map,
            &coefficients,
            &materials,
            scale,
            1e-10,
            300,
        );

        for (a, b) in x_mic.iter().zip(&x_cg) {
            assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_update_skips_trivial_solve() {
        let (materials, fluid_cells, map) = fluid_block(8, 2..6);
        let field = MacVelocityField::new(8, 8, 8, 1.0);
        let mut pressure = Grid3D::new(8, 8, 8, 1.0);

        let params = SimulationParameters::default();
        update_pressure_grid(
            &mut pressure,
            &field,
            &materials,
            &fluid_cells,
            &map,
            &params,
            0.01,
        );

        // Zeroed, and nothing solved
        assert!(pressure.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_projection_zeroes_divergence() {
        let (materials, fluid_cells, map) = fluid_block(8, 2..6);
        let mut field = MacVelocityField::new(8, 8, 8, 1.0);
        for k in 2..6 {
            for j in 2..6 {
                for i in 2..=6 {
                    field.set_u(i, j, k, ((i + 2 * j + 3 * k) % 7) as f64 * 0.1);
                }
            }
        }

        let params = SimulationParameters {
            density: 20.0,
            ..Default::default()
        };
        let dt = 0.01;

        let mut pressure = Grid3D::new(8, 8, 8, 0.0);
        update_pressure_grid(
            &mut pressure,
            &field,
            &materials,
            &fluid_cells,
            &map,
            &params,
            dt,
        );
        apply_pressure_to_velocity_field(&mut field, &pressure, &materials, params.density, dt);

        let (_, max_divergence) = negative_divergence(&field, &materials, &fluid_cells);
        assert!(
            max_divergence < 1e-4,
            "post-projection divergence = {:.3e}",
            max_divergence
        );
    }

    #[test]
    fn test_projection_pins_solid_faces() {
        // Fluid block flush against the floor: faces between fluid and the
        // solid shell must end with zero normal velocity.
        let mut materials = MaterialGrid::new(6, 6, 6);
        materials.seal_boundary();

        let mut fluid_cells = Vec::new();
        for k in 1..5 {
            for j in 1..3 {
                for i in 1..5 {
                    materials.set(i, j, k, Material::Fluid);
                    fluid_cells.push(GridIndex::new(i, j, k));
                }
            }
        }
        let mut map = FxHashMap::default();
        for (idx, cell) in fluid_cells.iter().enumerate() {
            map.insert(materials.cells.index(cell.i, cell.j, cell.k), idx);
        }

        let mut field = MacVelocityField::new(6, 6, 6, 1.0);
        // Everything sinking, including through the floor faces
        for k in 1..5 {
            for j in 1..=3 {
                for i in 1..5 {
                    field.set_v(i, j, k, -1.0);
                }
            }
        }

        let params = SimulationParameters::default();
        let dt = 0.01;
        let mut pressure = Grid3D::new(6, 6, 6, 0.0);
        update_pressure_grid(
            &mut pressure,
            &field,
            &materials,
            &fluid_cells,
            &map,
            &params,
            dt,
        );
        apply_pressure_to_velocity_field(&mut field, &pressure, &materials, params.density, dt);

        // Floor faces (between solid row j=0 and fluid row j=1)
        for k in 1..5 {
            for i in 1..5 {
                let v = field.v(i as i64, 1, k as i64);
                assert!(v.abs() < 1e-9, "floor face v = {:.3e} at ({}, {})", v, i, k);
            }
        }
    }
}
