//! Marker particles.

use glam::DVec3;

use crate::grid::GridIndex;

/// A massless Lagrangian tracer. The cached cell index always equals
/// `floor(position / dx)` and that cell is never solid.
#[derive(Clone, Copy, Debug)]
pub struct MarkerParticle {
    pub position: DVec3,
    pub cell: GridIndex,
}

impl MarkerParticle {
    pub fn new(position: DVec3, i: usize, j: usize, k: usize) -> Self {
        Self {
            position,
            cell: GridIndex::new(i, j, k),
        }
    }
}

/// Contiguous collection of marker particles.
#[derive(Clone, Debug, Default)]
pub struct MarkerParticles {
    pub list: Vec<MarkerParticle>,
}

impl MarkerParticles {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Positions of every `skip`-th particle, starting at the first.
    pub fn positions_every(&self, skip: usize) -> Vec<DVec3> {
        assert!(skip > 0, "skip must be at least 1");
        self.list.iter().step_by(skip).map(|p| p.position).collect()
    }

    pub fn positions(&self) -> Vec<DVec3> {
        self.positions_every(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_every() {
        let mut particles = MarkerParticles::new();
        for n in 0..10 {
            particles
                .list
                .push(MarkerParticle::new(DVec3::splat(n as f64), 0, 0, 0));
        }

        let all = particles.positions();
        assert_eq!(all.len(), 10);

        let every_third = particles.positions_every(3);
        assert_eq!(every_third.len(), 4);
        assert_eq!(every_third[1].x, 3.0);
    }
}
