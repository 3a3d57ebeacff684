//! Implicit description of the initial fluid region.
//!
//! The field is a union of sphere and axis-aligned cuboid primitives. Cells
//! whose centers fall inside it are seeded with marker particles when the
//! simulation starts.

use glam::DVec3;

/// Spherical fluid primitive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImplicitPoint {
    pub center: DVec3,
    pub radius: f64,
}

/// Axis-aligned cuboid fluid primitive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FluidCuboid {
    pub min: DVec3,
    pub extents: DVec3,
}

impl FluidCuboid {
    fn contains(&self, p: DVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.min.x + self.extents.x
            && p.y >= self.min.y
            && p.y <= self.min.y + self.extents.y
            && p.z >= self.min.z
            && p.z <= self.min.z + self.extents.z
    }
}

/// Union of implicit fluid primitives.
#[derive(Clone, Debug, Default)]
pub struct ImplicitFluidField {
    points: Vec<ImplicitPoint>,
    cuboids: Vec<FluidCuboid>,
}

impl ImplicitFluidField {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, center: DVec3, radius: f64) {
        assert!(radius > 0.0, "implicit point radius must be positive");
        self.points.push(ImplicitPoint { center, radius });
    }

    pub fn add_cuboid(&mut self, min: DVec3, extents: DVec3) {
        assert!(
            extents.x >= 0.0 && extents.y >= 0.0 && extents.z >= 0.0,
            "cuboid extents must be non-negative"
        );
        self.cuboids.push(FluidCuboid { min, extents });
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn cuboid_count(&self) -> usize {
        self.cuboids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.cuboids.is_empty()
    }

    /// Seeded point primitives, for replay.
    pub fn implicit_points(&self) -> Vec<ImplicitPoint> {
        self.points.clone()
    }

    /// Whether a world position lies inside any primitive.
    pub fn is_inside(&self, p: DVec3) -> bool {
        self.points
            .iter()
            .any(|ip| (p - ip.center).length_squared() <= ip.radius * ip.radius)
            || self.cuboids.iter().any(|c| c.contains(p))
    }
}
