//! Staggered MAC velocity field.
//!
//! Velocity components live on cell faces:
//! - u (X-component) on YZ faces at x = i * dx, array size (width+1) x height x depth
//! - v (Y-component) on XZ faces at y = j * dx, array size width x (height+1) x depth
//! - w (Z-component) on XY faces at z = k * dx, array size width x height x (depth+1)
//!
//! Each component carries a parallel temp buffer for read-from-current,
//! write-to-next staging. Only faces written through `set_temp_*` since the
//! last reset are copied into the live arrays by `commit_temp`, so a stage
//! can rewrite a sparse subset of faces without disturbing the rest.

use glam::DVec3;

#[derive(Clone, Debug)]
pub struct MacVelocityField {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub dx: f64,

    u: Vec<f64>,
    v: Vec<f64>,
    w: Vec<f64>,

    temp_u: Vec<f64>,
    temp_v: Vec<f64>,
    temp_w: Vec<f64>,
    temp_u_set: Vec<bool>,
    temp_v_set: Vec<bool>,
    temp_w_set: Vec<bool>,
}

impl MacVelocityField {
    pub fn new(width: usize, height: usize, depth: usize, dx: f64) -> Self {
        assert!(dx > 0.0, "cell size must be positive, got {}", dx);

        let u_count = (width + 1) * height * depth;
        let v_count = width * (height + 1) * depth;
        let w_count = width * height * (depth + 1);

        Self {
            width,
            height,
            depth,
            dx,
            u: vec![0.0; u_count],
            v: vec![0.0; v_count],
            w: vec![0.0; w_count],
            temp_u: vec![0.0; u_count],
            temp_v: vec![0.0; v_count],
            temp_w: vec![0.0; w_count],
            temp_u_set: vec![false; u_count],
            temp_v_set: vec![false; v_count],
            temp_w_set: vec![false; w_count],
        }
    }

    // ========== Index functions ==========

    #[inline]
    pub fn u_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + (self.width + 1) * j + (self.width + 1) * self.height * k
    }

    #[inline]
    pub fn v_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.width * j + self.width * (self.height + 1) * k
    }

    #[inline]
    pub fn w_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.width * j + self.width * self.height * k
    }

    #[inline]
    pub fn in_range_u(&self, i: i64, j: i64, k: i64) -> bool {
        i >= 0
            && i <= self.width as i64
            && j >= 0
            && j < self.height as i64
            && k >= 0
            && k < self.depth as i64
    }

    #[inline]
    pub fn in_range_v(&self, i: i64, j: i64, k: i64) -> bool {
        i >= 0
            && i < self.width as i64
            && j >= 0
            && j <= self.height as i64
            && k >= 0
            && k < self.depth as i64
    }

    #[inline]
    pub fn in_range_w(&self, i: i64, j: i64, k: i64) -> bool {
        i >= 0
            && i < self.width as i64
            && j >= 0
            && j < self.height as i64
            && k >= 0
            && k <= self.depth as i64
    }

    // ========== Reads (zero outside range) ==========

    #[inline]
    pub fn u(&self, i: i64, j: i64, k: i64) -> f64 {
        if self.in_range_u(i, j, k) {
            self.u[self.u_index(i as usize, j as usize, k as usize)]
        } else {
            0.0
        }
    }

    #[inline]
    pub fn v(&self, i: i64, j: i64, k: i64) -> f64 {
        if self.in_range_v(i, j, k) {
            self.v[self.v_index(i as usize, j as usize, k as usize)]
        } else {
            0.0
        }
    }

    #[inline]
    pub fn w(&self, i: i64, j: i64, k: i64) -> f64 {
        if self.in_range_w(i, j, k) {
            self.w[self.w_index(i as usize, j as usize, k as usize)]
        } else {
            0.0
        }
    }

    // ========== Writes ==========

    #[inline]
    pub fn set_u(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_u(i as i64, j as i64, k as i64));
        let idx = self.u_index(i, j, k);
        self.u[idx] = value;
    }

    #[inline]
    pub fn set_v(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_v(i as i64, j as i64, k as i64));
        let idx = self.v_index(i, j, k);
        self.v[idx] = value;
    }

    #[inline]
    pub fn set_w(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_w(i as i64, j as i64, k as i64));
        let idx = self.w_index(i, j, k);
        self.w[idx] = value;
    }

    #[inline]
    pub fn add_u(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_u(i as i64, j as i64, k as i64));
        let idx = self.u_index(i, j, k);
        self.u[idx] += value;
    }

    #[inline]
    pub fn add_v(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_v(i as i64, j as i64, k as i64));
        let idx = self.v_index(i, j, k);
        self.v[idx] += value;
    }

    #[inline]
    pub fn add_w(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_w(i as i64, j as i64, k as i64));
        let idx = self.w_index(i, j, k);
        self.w[idx] += value;
    }

    // ========== Temp buffer staging ==========

    #[inline]
    pub fn set_temp_u(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_u(i as i64, j as i64, k as i64));
        let idx = self.u_index(i, j, k);
        self.temp_u[idx] = value;
        self.temp_u_set[idx] = true;
    }

    #[inline]
    pub fn set_temp_v(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_v(i as i64, j as i64, k as i64));
        let idx = self.v_index(i, j, k);
        self.temp_v[idx] = value;
        self.temp_v_set[idx] = true;
    }

    #[inline]
    pub fn set_temp_w(&mut self, i: usize, j: usize, k: usize, value: f64) {
        assert!(self.in_range_w(i as i64, j as i64, k as i64));
        let idx = self.w_index(i, j, k);
        self.temp_w[idx] = value;
        self.temp_w_set[idx] = true;
    }

    #[inline]
    pub(crate) fn set_temp_u_linear(&mut self, idx: usize, value: f64) {
        self.temp_u[idx] = value;
        self.temp_u_set[idx] = true;
    }

    #[inline]
    pub(crate) fn set_temp_v_linear(&mut self, idx: usize, value: f64) {
        self.temp_v[idx] = value;
        self.temp_v_set[idx] = true;
    }

    #[inline]
    pub(crate) fn set_temp_w_linear(&mut self, idx: usize, value: f64) {
        self.temp_w[idx] = value;
        self.temp_w_set[idx] = true;
    }

    /// Zero the temp buffers and forget which faces were staged.
    pub fn reset_temp(&mut self) {
        self.temp_u.fill(0.0);
        self.temp_v.fill(0.0);
        self.temp_w.fill(0.0);
        self.temp_u_set.fill(false);
        self.temp_v_set.fill(false);
        self.temp_w_set.fill(false);
    }

    /// Move staged temp values into the live arrays.
    pub fn commit_temp(&mut self) {
        for (idx, set) in self.temp_u_set.iter_mut().enumerate() {
            if *set {
                self.u[idx] = self.temp_u[idx];
                *set = false;
            }
        }
        for (idx, set) in self.temp_v_set.iter_mut().enumerate() {
            if *set {
                self.v[idx] = self.temp_v[idx];
                *set = false;
            }
        }
        for (idx, set) in self.temp_w_set.iter_mut().enumerate() {
            if *set {
                self.w[idx] = self.temp_w[idx];
                *set = false;
            }
        }
    }

    // ========== Face positions ==========

    /// World position of the U face center at (i, j, k).
    #[inline]
    pub fn u_position(&self, i: usize, j: usize, k: usize) -> DVec3 {
        DVec3::new(
            i as f64 * self.dx,
            (j as f64 + 0.5) * self.dx,
            (k as f64 + 0.5) * self.dx,
        )
    }

    /// World position of the V face center at (i, j, k).
    #[inline]
    pub fn v_position(&self, i: usize, j: usize, k: usize) -> DVec3 {
        DVec3::new(
            (i as f64 + 0.5) * self.dx,
            j as f64 * self.dx,
            (k as f64 + 0.5) * self.dx,
        )
    }

    /// World position of the W face center at (i, j, k).
    #[inline]
    pub fn w_position(&self, i: usize, j: usize, k: usize) -> DVec3 {
        DVec3::new(
            (i as f64 + 0.5) * self.dx,
            (j as f64 + 0.5) * self.dx,
            k as f64 * self.dx,
        )
    }

    // ========== Sampling ==========

    /// Trilinearly interpolated velocity at an arbitrary world position.
    ///
    /// Each component is interpolated on its own face lattice; faces outside
    /// the arrays contribute zero.
    pub fn velocity_at(&self, p: DVec3) -> DVec3 {
        let inv = 1.0 / self.dx;
        let x = self.sample_component(p.x * inv, p.y * inv - 0.5, p.z * inv - 0.5, Component::U);
        let y = self.sample_component(p.x * inv - 0.5, p.y * inv, p.z * inv - 0.5, Component::V);
        let z = self.sample_component(p.x * inv - 0.5, p.y * inv - 0.5, p.z * inv, Component::W);
        DVec3::new(x, y, z)
    }

    fn sample_component(&self, gx: f64, gy: f64, gz: f64, component: Component) -> f64 {
        let i0 = gx.floor() as i64;
        let j0 = gy.floor() as i64;
        let k0 = gz.floor() as i64;

        let fx = gx - i0 as f64;
        let fy = gy - j0 as f64;
        let fz = gz - k0 as f64;

        let value = |i, j, k| match component {
            Component::U => self.u(i, j, k),
            Component::V => self.v(i, j, k),
            Component::W => self.w(i, j, k),
        };

        trilerp(
            value(i0, j0, k0),
            value(i0, j0, k0 + 1),
            value(i0, j0 + 1, k0),
            value(i0, j0 + 1, k0 + 1),
            value(i0 + 1, j0, k0),
            value(i0 + 1, j0, k0 + 1),
            value(i0 + 1, j0 + 1, k0),
            value(i0 + 1, j0 + 1, k0 + 1),
            fx,
            fy,
            fz,
        )
    }

    /// Full velocity vector at the center of U face (i, j, k). The U
    /// component is the stored face value; V and W are averaged from the
    /// four nearest faces of their own lattices.
    pub fn velocity_at_u_face(&self, i: usize, j: usize, k: usize) -> DVec3 {
        let (i, j, k) = (i as i64, j as i64, k as i64);
        let vx = self.u(i, j, k);
        let vy = 0.25
            * (self.v(i - 1, j, k) + self.v(i - 1, j + 1, k) + self.v(i, j, k) + self.v(i, j + 1, k));
        let vz = 0.25
            * (self.w(i - 1, j, k) + self.w(i - 1, j, k + 1) + self.w(i, j, k) + self.w(i, j, k + 1));
        DVec3::new(vx, vy, vz)
    }

    /// Full velocity vector at the center of V face (i, j, k).
    pub fn velocity_at_v_face(&self, i: usize, j: usize, k: usize) -> DVec3 {
        let (i, j, k) = (i as i64, j as i64, k as i64);
        let vx = 0.25
            * (self.u(i, j - 1, k) + self.u(i + 1, j - 1, k) + self.u(i, j, k) + self.u(i + 1, j, k));
        let vy = self.v(i, j, k);
        let vz = 0.25
            * (self.w(i, j - 1, k) + self.w(i, j - 1, k + 1) + self.w(i, j, k) + self.w(i, j, k + 1));
        DVec3::new(vx, vy, vz)
    }

    /// Full velocity vector at the center of W face (i, j, k).
    pub fn velocity_at_w_face(&self, i: usize, j: usize, k: usize) -> DVec3 {
        let (i, j, k) = (i as i64, j as i64, k as i64);
        let vx = 0.25
            * (self.u(i, j, k - 1) + self.u(i + 1, j, k - 1) + self.u(i, j, k) + self.u(i + 1, j, k));
        let vy = 0.25
            * (self.v(i, j, k - 1) + self.v(i, j + 1, k - 1) + self.v(i, j, k) + self.v(i, j + 1, k));
        let vz = self.w(i, j, k);
        DVec3::new(vx, vy, vz)
    }

    /// Maximum velocity magnitude over interior face centers. Used by the
    /// CFL time-step bound.
    pub fn max_velocity_magnitude(&self) -> f64 {
        let mut max_sq: f64 = 0.0;

        for k in 0..self.depth {
            for j in 0..self.height {
                for i in 1..self.width {
                    max_sq = max_sq.max(self.velocity_at_u_face(i, j, k).length_squared());
                }
            }
        }

        for k in 0..self.depth {
            for j in 1..self.height {
                for i in 0..self.width {
                    max_sq = max_sq.max(self.velocity_at_v_face(i, j, k).length_squared());
                }
            }
        }

        for k in 1..self.depth {
            for j in 0..self.height {
                for i in 0..self.width {
                    max_sq = max_sq.max(self.velocity_at_w_face(i, j, k).length_squared());
                }
            }
        }

        max_sq.sqrt()
    }
}

#[derive(Clone, Copy)]
enum Component {
    U,
    V,
    W,
}

#[inline]
#[allow(clippy::too_many_arguments)]
fn trilerp(
    v000: f64,
    v001: f64,
    v010: f64,
    v011: f64,
    v100: f64,
    v101: f64,
    v110: f64,
    v111: f64,
    fx: f64,
    fy: f64,
    fz: f64,
) -> f64 {
    let v00 = v000 + fx * (v100 - v000);
    let v01 = v001 + fx * (v101 - v001);
    let v10 = v010 + fx * (v110 - v010);
    let v11 = v011 + fx * (v111 - v011);

    let v0 = v00 + fy * (v10 - v00);
    let v1 = v01 + fy * (v11 - v01);

    v0 + fz * (v1 - v0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_sizes() {
        let field = MacVelocityField::new(4, 5, 6, 1.0);
        assert!(field.in_range_u(4, 4, 5));
        assert!(!field.in_range_u(5, 0, 0));
        assert!(field.in_range_v(3, 5, 5));
        assert!(!field.in_range_v(0, 6, 0));
        assert!(field.in_range_w(3, 4, 6));
        assert!(!field.in_range_w(0, 0, 7));
    }

    #[test]
    fn test_out_of_range_reads_zero() {
        let mut field = MacVelocityField::new(4, 4, 4, 1.0);
        field.set_u(2, 1, 1, 3.5);
        assert_eq!(field.u(2, 1, 1), 3.5);
        assert_eq!(field.u(-1, 1, 1), 0.0);
        assert_eq!(field.u(2, 4, 1), 0.0);
    }

    #[test]
    fn test_face_positions() {
        let field = MacVelocityField::new(4, 4, 4, 1.0);
        assert_eq!(field.u_position(0, 0, 0), DVec3::new(0.0, 0.5, 0.5));
        assert_eq!(field.u_position(1, 0, 0), DVec3::new(1.0, 0.5, 0.5));
        assert_eq!(field.v_position(0, 0, 0), DVec3::new(0.5, 0.0, 0.5));
        assert_eq!(field.w_position(0, 0, 0), DVec3::new(0.5, 0.5, 0.0));
    }

    #[test]
    fn test_sampling_at_face_center_returns_stored_value() {
        let mut field = MacVelocityField::new(8, 8, 8, 0.5);
        field.set_u(3, 2, 4, 1.75);
        field.set_v(3, 2, 4, -0.5);
        field.set_w(3, 2, 4, 0.25);

        let at_u = field.velocity_at(field.u_position(3, 2, 4));
        assert!((at_u.x - 1.75).abs() < 1e-12);

        let at_v = field.velocity_at(field.v_position(3, 2, 4));
        assert!((at_v.y + 0.5).abs() < 1e-12);

        let at_w = field.velocity_at(field.w_position(3, 2, 4));
        assert!((at_w.z - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_sampling_interpolates_between_faces() {
        let mut field = MacVelocityField::new(4, 4, 4, 1.0);
        field.set_u(1, 1, 1, 2.0);
        field.set_u(2, 1, 1, 4.0);

        // Midway between the two U faces, transversely centered on the cell
        let p = DVec3::new(1.5, 1.5, 1.5);
        let v = field.velocity_at(p);
        assert!((v.x - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_temp_commit_only_touches_staged_faces() {
        let mut field = MacVelocityField::new(4, 4, 4, 1.0);
        field.set_u(1, 1, 1, 5.0);
        field.set_u(2, 1, 1, 7.0);

        field.reset_temp();
        field.set_temp_u(1, 1, 1, -1.0);
        field.commit_temp();

        assert_eq!(field.u(1, 1, 1), -1.0);
        // Not staged, so untouched
        assert_eq!(field.u(2, 1, 1), 7.0);
    }

    #[test]
    fn test_face_center_velocity_averages_transverse_components() {
        let mut field = MacVelocityField::new(4, 4, 4, 1.0);
        field.set_u(2, 1, 1, 1.0);
        field.set_v(1, 1, 1, 2.0);
        field.set_v(1, 2, 1, 2.0);
        field.set_v(2, 1, 1, 4.0);
        field.set_v(2, 2, 1, 4.0);

        let v = field.velocity_at_u_face(2, 1, 1);
        assert!((v.x - 1.0).abs() < 1e-12);
        assert!((v.y - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_velocity_magnitude() {
        let mut field = MacVelocityField::new(4, 4, 4, 1.0);
        assert_eq!(field.max_velocity_magnitude(), 0.0);

        field.set_v(2, 2, 2, -6.0);
        let max = field.max_velocity_magnitude();
        assert!(max >= 6.0 && max < 6.1, "max = {}", max);
    }
}
