//! Velocity extrapolation into the air cells around the fluid.
//!
//! Semi-Lagrangian traces sample the velocity field a few cells outside the
//! fluid, so before advection the face velocities are extended outward layer
//! by layer: layer 0 is the fluid itself, layer n is the ring of non-solid
//! cells 6-adjacent to layer n-1. Faces of each new layer receive the mean
//! of their already-valid face neighbors.

use crate::grid::{Grid3D, GridIndex, Material, MaterialGrid};
use crate::mac::MacVelocityField;

/// Number of extrapolation layers for a given CFL number. Two extra layers
/// cover the sampling stencil reaching past the last traced cell.
pub fn layer_count(cfl_number: f64) -> i32 {
    cfl_number.ceil() as i32 + 2
}

#[inline]
fn layer_at(layers: &Grid3D<i32>, i: i64, j: i64, k: i64) -> i32 {
    layers.get_or(i, j, k, -1)
}

#[inline]
pub(crate) fn face_borders_layer_u(layers: &Grid3D<i32>, i: usize, j: usize, k: usize, layer: i32) -> bool {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    layer_at(layers, i - 1, j, k) == layer || layer_at(layers, i, j, k) == layer
}

#[inline]
pub(crate) fn face_borders_layer_v(layers: &Grid3D<i32>, i: usize, j: usize, k: usize, layer: i32) -> bool {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    layer_at(layers, i, j - 1, k) == layer || layer_at(layers, i, j, k) == layer
}

#[inline]
pub(crate) fn face_borders_layer_w(layers: &Grid3D<i32>, i: usize, j: usize, k: usize, layer: i32) -> bool {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    layer_at(layers, i, j, k - 1) == layer || layer_at(layers, i, j, k) == layer
}

#[inline]
pub(crate) fn face_extrapolated_u(layers: &Grid3D<i32>, i: usize, j: usize, k: usize) -> bool {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    layer_at(layers, i - 1, j, k) >= 1 || layer_at(layers, i, j, k) >= 1
}

#[inline]
pub(crate) fn face_extrapolated_v(layers: &Grid3D<i32>, i: usize, j: usize, k: usize) -> bool {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    layer_at(layers, i, j - 1, k) >= 1 || layer_at(layers, i, j, k) >= 1
}

#[inline]
pub(crate) fn face_extrapolated_w(layers: &Grid3D<i32>, i: usize, j: usize, k: usize) -> bool {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    layer_at(layers, i, j, k - 1) >= 1 || layer_at(layers, i, j, k) >= 1
}

/// Zero every face velocity that does not border a fluid cell.
fn reset_non_fluid_faces(field: &mut MacVelocityField, materials: &MaterialGrid) {
    for k in 0..field.depth {
        for j in 0..field.height {
            for i in 0..=field.width {
                if !materials.face_borders_material_u(i, j, k, Material::Fluid) {
                    field.set_u(i, j, k, 0.0);
                }
            }
        }
    }

    for k in 0..field.depth {
        for j in 0..=field.height {
            for i in 0..field.width {
                if !materials.face_borders_material_v(i, j, k, Material::Fluid) {
                    field.set_v(i, j, k, 0.0);
                }
            }
        }
    }

    for k in 0..=field.depth {
        for j in 0..field.height {
            for i in 0..field.width {
                if !materials.face_borders_material_w(i, j, k, Material::Fluid) {
                    field.set_w(i, j, k, 0.0);
                }
            }
        }
    }
}

/// Rebuild the layer grid: fluid cells are layer 0, each subsequent layer is
/// the ring of unvisited non-solid cells 6-adjacent to the previous one.
fn update_layers(
    layers: &mut Grid3D<i32>,
    materials: &MaterialGrid,
    fluid_cells: &[GridIndex],
    num_layers: i32,
) {
    layers.fill(-1);
    for cell in fluid_cells {
        layers.set(cell.i, cell.j, cell.k, 0);
    }

    for layer in 1..=num_layers {
        mark_layer(layers, materials, layer);
    }
}

fn mark_layer(layers: &mut Grid3D<i32>, materials: &MaterialGrid, layer: i32) {
    for k in 0..layers.depth {
        for j in 0..layers.height {
            for i in 0..layers.width {
                if layers.get(i, j, k) != layer - 1 || materials.is_solid(i as i64, j as i64, k as i64)
                {
                    continue;
                }

                let (i, j, k) = (i as i64, j as i64, k as i64);
                let neighbors = [
                    (i - 1, j, k),
                    (i + 1, j, k),
                    (i, j - 1, k),
                    (i, j + 1, k),
                    (i, j, k - 1),
                    (i, j, k + 1),
                ];
                for (ni, nj, nk) in neighbors {
                    if layers.in_bounds(ni, nj, nk)
                        && layers.get_or(ni, nj, nk, 0) == -1
                        && !materials.is_solid(ni, nj, nk)
                    {
                        layers.set(ni as usize, nj as usize, nk as usize, layer);
                    }
                }
            }
        }
    }
}

/// Mean of the 6-adjacent U faces that border a layer `layer - 1` cell.
fn extrapolated_value_u(
    field: &MacVelocityField,
    layers: &Grid3D<i32>,
    i: usize,
    j: usize,
    k: usize,
    layer: i32,
) -> f64 {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    let neighbors = [
        (i - 1, j, k),
        (i + 1, j, k),
        (i, j - 1, k),
        (i, j + 1, k),
        (i, j, k - 1),
        (i, j, k + 1),
    ];

    let mut sum = 0.0;
    let mut count = 0;
    for (ni, nj, nk) in neighbors {
        if field.in_range_u(ni, nj, nk)
            && face_borders_layer_u(layers, ni as usize, nj as usize, nk as usize, layer - 1)
        {
            sum += field.u(ni, nj, nk);
            count += 1;
        }
    }

    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn extrapolated_value_v(
    field: &MacVelocityField,
    layers: &Grid3D<i32>,
    i: usize,
    j: usize,
    k: usize,
    layer: i32,
) -> f64 {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    let neighbors = [
        (i - 1, j, k),
        (i + 1, j, k),
        (i, j - 1, k),
        (i, j + 1, k),
        (i, j, k - 1),
        (i, j, k + 1),
    ];

    let mut sum = 0.0;
    let mut count = 0;
    for (ni, nj, nk) in neighbors {
        if field.in_range_v(ni, nj, nk)
            && face_borders_layer_v(layers, ni as usize, nj as usize, nk as usize, layer - 1)
        {
            sum += field.v(ni, nj, nk);
            count += 1;
        }
    }

    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn extrapolated_value_w(
    field: &MacVelocityField,
    layers: &Grid3D<i32>,
    i: usize,
    j: usize,
    k: usize,
    layer: i32,
) -> f64 {
    let (i, j, k) = (i as i64, j as i64, k as i64);
    let neighbors = [
        (i - 1, j, k),
        (i + 1, j, k),
        (i, j - 1, k),
        (i, j + 1, k),
        (i, j, k - 1),
        (i, j, k + 1),
    ];

    let mut sum = 0.0;
    let mut count = 0;
    for (ni, nj, nk) in neighbors {
        if field.in_range_w(ni, nj, nk)
            && face_borders_layer_w(layers, ni as usize, nj as usize, nk as usize, layer - 1)
        {
            sum += field.w(ni, nj, nk);
            count += 1;
        }
    }

    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Fill faces of one layer from the committed values of the previous layer.
/// Staged through the temp buffers so every face in the layer reads the same
/// source values.
fn extrapolate_layer(
    field: &mut MacVelocityField,
    materials: &MaterialGrid,
    layers: &Grid3D<i32>,
    layer: i32,
) {
    field.reset_temp();

    for k in 0..field.depth {
        for j in 0..field.height {
            for i in 0..=field.width {
                if face_borders_layer_u(layers, i, j, k, layer)
                    && !face_borders_layer_u(layers, i, j, k, layer - 1)
                    && !materials.face_borders_material_u(i, j, k, Material::Solid)
                {
                    let value = extrapolated_value_u(field, layers, i, j, k, layer);
                    field.set_temp_u(i, j, k, value);
                }
            }
        }
    }

    for k in 0..field.depth {
        for j in 0..=field.height {
            for i in 0..field.width {
                if face_borders_layer_v(layers, i, j, k, layer)
                    && !face_borders_layer_v(layers, i, j, k, layer - 1)
                    && !materials.face_borders_material_v(i, j, k, Material::Solid)
                {
                    let value = extrapolated_value_v(field, layers, i, j, k, layer);
                    field.set_temp_v(i, j, k, value);
                }
            }
        }
    }

    for k in 0..=field.depth {
        for j in 0..field.height {
            for i in 0..field.width {
                if face_borders_layer_w(layers, i, j, k, layer)
                    && !face_borders_layer_w(layers, i, j, k, layer - 1)
                    && !materials.face_borders_material_w(i, j, k, Material::Solid)
                {
                    let value = extrapolated_value_w(field, layers, i, j, k, layer);
                    field.set_temp_w(i, j, k, value);
                }
            }
        }
    }

    field.commit_temp();
}

/// Run the full extrapolation pass for one substep. Returns the number of
/// layers built.
pub fn extrapolate_fluid_velocities(
    field: &mut MacVelocityField,
    materials: &MaterialGrid,
    layers: &mut Grid3D<i32>,
    fluid_cells: &[GridIndex],
    cfl_number: f64,
) -> i32 {
    reset_non_fluid_faces(field, materials);

    let num_layers = layer_count(cfl_number);
    update_layers(layers, materials, fluid_cells, num_layers);

    for layer in 1..=num_layers {
        extrapolate_layer(field, materials, layers, layer);
    }

    num_layers
}
