//! Cell geometry and solid-boundary collision resolution.
//!
//! Positions map to cells by flooring `p / dx`. Collision queries work on
//! axis-aligned cell faces: when an integration step lands inside a solid
//! cell, the segment from the last known good position is intersected with
//! the nearest face of a neighboring solid and the caller nudges the result
//! back along the face normal.

use glam::DVec3;
use log::error;

use crate::grid::{Material, MaterialGrid};

/// Tolerance for point-on-face tests and walk chunks.
pub const FACE_EPS: f64 = 1e-5;

/// Axis-aligned rectangle on the boundary of a cell, with outward normal.
#[derive(Clone, Copy, Debug)]
pub struct CellFace {
    pub normal: DVec3,
    pub min: DVec3,
    pub max: DVec3,
}

/// Cell containing a world position.
#[inline]
pub fn position_to_cell(p: DVec3, dx: f64) -> (i64, i64, i64) {
    let inv = 1.0 / dx;
    (
        (p.x * inv).floor() as i64,
        (p.y * inv).floor() as i64,
        (p.z * inv).floor() as i64,
    )
}

/// World-space center of cell (i, j, k).
#[inline]
pub fn cell_center(i: i64, j: i64, k: i64, dx: f64) -> DVec3 {
    DVec3::new(
        (i as f64 + 0.5) * dx,
        (j as f64 + 0.5) * dx,
        (k as f64 + 0.5) * dx,
    )
}

/// Whether a position lies inside the simulation domain.
#[inline]
pub fn position_in_grid(p: DVec3, materials: &MaterialGrid, dx: f64) -> bool {
    p.x >= 0.0
        && p.x < materials.width() as f64 * dx
        && p.y >= 0.0
        && p.y < materials.height() as f64 * dx
        && p.z >= 0.0
        && p.z < materials.depth() as f64 * dx
}

/// Face of cell (i, j, k) with the given unit outward normal.
pub fn cell_face(i: i64, j: i64, k: i64, normal: DVec3, dx: f64) -> CellFace {
    let trans = if normal.x.abs() > 0.5 {
        0.5 * dx * DVec3::new(0.0, 1.0, 1.0)
    } else if normal.y.abs() > 0.5 {
        0.5 * dx * DVec3::new(1.0, 0.0, 1.0)
    } else {
        0.5 * dx * DVec3::new(1.0, 1.0, 0.0)
    };

    let c = cell_center(i, j, k, dx);
    CellFace {
        normal,
        min: c + 0.5 * dx * normal - trans,
        max: c + 0.5 * dx * normal + trans,
    }
}

const FACE_NORMALS: [DVec3; 6] = [
    DVec3::new(-1.0, 0.0, 0.0),
    DVec3::new(1.0, 0.0, 0.0),
    DVec3::new(0.0, -1.0, 0.0),
    DVec3::new(0.0, 1.0, 0.0),
    DVec3::new(0.0, 0.0, -1.0),
    DVec3::new(0.0, 0.0, 1.0),
];

/// Whether `p` lies on the face plane (within tolerance along the normal,
/// left-closed right-open in the transverse extent).
pub fn point_on_face(p: DVec3, f: &CellFace) -> bool {
    if f.normal.x.abs() > 0.5 {
        (p.x - f.min.x).abs() < FACE_EPS
            && p.y >= f.min.y
            && p.y < f.max.y
            && p.z >= f.min.z
            && p.z < f.max.z
    } else if f.normal.y.abs() > 0.5 {
        (p.y - f.min.y).abs() < FACE_EPS
            && p.x >= f.min.x
            && p.x < f.max.x
            && p.z >= f.min.z
            && p.z < f.max.z
    } else {
        (p.z - f.min.z).abs() < FACE_EPS
            && p.x >= f.min.x
            && p.x < f.max.x
            && p.y >= f.min.y
            && p.y < f.max.y
    }
}

/// Intersection of the line through `p0` along `dir` with the face plane,
/// if it lands on the face rectangle.
fn line_face_intersection(p0: DVec3, dir: DVec3, f: &CellFace) -> Option<DVec3> {
    let dot = dir.dot(f.normal);
    if dot.abs() < 1e-30 {
        // parallel, or p0 already on the plane
        return None;
    }

    let d = (f.min - p0).dot(f.normal) / dot;
    let intersect = p0 + d * dir;

    point_on_face(intersect, f).then_some(intersect)
}

#[inline]
fn cells_are_neighbors(a: (i64, i64, i64), b: (i64, i64, i64)) -> bool {
    (a.0 - b.0).abs() <= 1 && (a.1 - b.1).abs() <= 1 && (a.2 - b.2).abs() <= 1
}

/// If `p` lies on a face between a solid cell and a non-solid cell, return
/// that face with the normal pointing away from the solid.
fn point_on_solid_boundary(p: DVec3, materials: &MaterialGrid, dx: f64) -> Option<CellFace> {
    let (i, j, k) = position_to_cell(p, dx);
    if !materials.cells.in_bounds(i, j, k) {
        return None;
    }

    let cell_is_solid = materials.is_solid(i, j, k);
    for normal in FACE_NORMALS {
        let face = cell_face(i, j, k, normal, dx);
        if !point_on_face(p, &face) {
            continue;
        }

        // Staggered index of the face and the cell on its far side
        let (borders_solid, far) = if normal.x < -0.5 {
            let f = (i as usize, j as usize, k as usize);
            (
                materials.face_borders_material_u(f.0, f.1, f.2, Material::Solid),
                (i - 1, j, k),
            )
        } else if normal.x > 0.5 {
            let f = ((i + 1) as usize, j as usize, k as usize);
            (
                materials.face_borders_material_u(f.0, f.1, f.2, Material::Solid),
                (i + 1, j, k),
            )
        } else if normal.y < -0.5 {
            let f = (i as usize, j as usize, k as usize);
            (
                materials.face_borders_material_v(f.0, f.1, f.2, Material::Solid),
                (i, j - 1, k),
            )
        } else if normal.y > 0.5 {
            let f = (i as usize, (j + 1) as usize, k as usize);
            (
                materials.face_borders_material_v(f.0, f.1, f.2, Material::Solid),
                (i, j + 1, k),
            )
        } else if normal.z < -0.5 {
            let f = (i as usize, j as usize, k as usize);
            (
                materials.face_borders_material_w(f.0, f.1, f.2, Material::Solid),
                (i, j, k - 1),
            )
        } else {
            let f = (i as usize, j as usize, (k + 1) as usize);
            (
                materials.face_borders_material_w(f.0, f.1, f.2, Material::Solid),
                (i, j, k + 1),
            )
        };

        if !borders_solid {
            continue;
        }

        // Normal must point from the solid side into the open side
        let face = if cell_is_solid {
            cell_face(i, j, k, normal, dx)
        } else {
            cell_face(far.0, far.1, far.2, -normal, dx)
        };
        return Some(face);
    }

    None
}

/// Faces of 26-neighbor solid cells whose normals oppose the travel
/// direction (obtuse angle means a head-on collision is possible).
fn collision_candidate_faces(
    i: i64,
    j: i64,
    k: i64,
    dir: DVec3,
    materials: &MaterialGrid,
    dx: f64,
) -> Vec<CellFace> {
    let mut faces = Vec::new();
    for nk in k - 1..=k + 1 {
        for nj in j - 1..=j + 1 {
            for ni in i - 1..=i + 1 {
                if ni == i && nj == j && nk == k {
                    continue;
                }
                if !materials.cells.in_bounds(ni, nj, nk) || !materials.is_solid(ni, nj, nk) {
                    continue;
                }
                for normal in FACE_NORMALS {
                    if normal.dot(dir) < 0.0 {
                        faces.push(cell_face(ni, nj, nk, normal, dx));
                    }
                }
            }
        }
    }
    faces
}

/// Closest face intersection between `p0` (non-solid cell) and `p1` (a
/// 26-neighboring solid cell).
fn find_face_collision(
    p0: DVec3,
    p1: DVec3,
    materials: &MaterialGrid,
    dx: f64,
) -> Option<(DVec3, DVec3)> {
    let (i, j, k) = position_to_cell(p0, dx);
    let dir = (p1 - p0).normalize();

    let mut closest: Option<(DVec3, DVec3)> = None;
    let mut min_dist_sq = f64::INFINITY;

    for face in collision_candidate_faces(i, j, k, dir, materials, dx) {
        let Some(intersect) = line_face_intersection(p0, dir, &face) else {
            continue;
        };

        let dist_sq = (intersect - p0).length_squared();
        if dist_sq < min_dist_sq {
            min_dist_sq = dist_sq;
            closest = Some((intersect, face.normal));
        }
    }

    closest
}

/// Resolve a segment that starts in a non-solid cell and ends inside a solid
/// cell. Returns the collision point on the solid's face and the face normal
/// pointing out of the solid. The caller is expected to nudge the point a
/// small distance along the normal before converting it back to a cell index.
pub fn resolve_solid_collision(
    mut p0: DVec3,
    mut p1: DVec3,
    materials: &MaterialGrid,
    dx: f64,
) -> (DVec3, DVec3) {
    // p0 may sit exactly on a boundary face, in which case its cell index
    // could already resolve to the solid side.
    if let Some(face) = point_on_solid_boundary(p0, materials, dx) {
        return (p0, face.normal);
    }

    let (mut fi, mut fj, mut fk) = position_to_cell(p0, dx);
    let (mut si, mut sj, mut sk) = position_to_cell(p1, dx);
    assert!(
        !materials.is_solid(fi, fj, fk),
        "collision segment starts in a solid cell ({}, {}, {})",
        fi,
        fj,
        fk
    );
    assert!(
        materials.is_solid(si, sj, sk),
        "collision segment must end in a solid cell, got ({}, {}, {})",
        si,
        sj,
        sk
    );

    let dir = (p1 - p0).normalize();

    // The cells may not be neighbors. Walk the segment back from p1 in
    // chunks just under one cell until the pair straddles the wall.
    let mut steps = 1;
    while !cells_are_neighbors((fi, fj, fk), (si, sj, sk)) {
        p0 = p1 - (dx - FACE_EPS) * dir;
        let (ni, nj, nk) = position_to_cell(p0, dx);

        if materials.is_solid(ni, nj, nk) {
            p1 = p0;
            si = ni;
            sj = nj;
            sk = nk;
        } else {
            fi = ni;
            fj = nj;
            fk = nk;
        }

        steps += 1;
        assert!(
            steps < 100,
            "collision walk failed to converge: p0 = {:?}, p1 = {:?}, dir = {:?}",
            p0,
            p1,
            dir
        );
        assert!(
            !(fi == si && fj == sj && fk == sk),
            "collision walk collapsed to a single cell ({}, {}, {})",
            fi,
            fj,
            fk
        );
    }

    match find_face_collision(p0, p1, materials, dx) {
        Some((point, normal)) => {
            // The nudged point must resolve to a non-solid cell
            let probe = point + 0.001 * dx * normal;
            let (i, j, k) = position_to_cell(probe, dx);
            if materials.is_solid(i, j, k) {
                error!(
                    "solid collision left point inside solid: p0 = {:?}, p1 = {:?}, \
                     dir = {:?}, cells ({}, {}, {}) -> ({}, {}, {})",
                    p0, p1, dir, fi, fj, fk, si, sj, sk
                );
            }
            assert!(
                !materials.is_solid(i, j, k),
                "post-collision point still in solid cell ({}, {}, {})",
                i,
                j,
                k
            );
            (point, normal)
        }
        None => {
            error!(
                "no face collision found: p0 = {:?}, p1 = {:?}, dir = {:?}, \
                 cells ({}, {}, {}) -> ({}, {}, {})",
                p0, p1, dir, fi, fj, fk, si, sj, sk
            );
            (p0, DVec3::ZERO)
        }
    }
}
