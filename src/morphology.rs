//! Binary morphology on `[z, y, x]` boolean grids with 6-connectivity.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, Axis, Zip};
use std::collections::VecDeque;

const NEIGHBOURS: [(isize, isize, isize); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

#[inline]
fn offset(index: (usize, usize, usize), delta: (isize, isize, isize), dim: (usize, usize, usize)) -> Option<(usize, usize, usize)> {
    let z = index.0.checked_add_signed(delta.0)?;
    let y = index.1.checked_add_signed(delta.1)?;
    let x = index.2.checked_add_signed(delta.2)?;
    (z < dim.0 && y < dim.1 && x < dim.2).then_some((z, y, x))
}

fn step(mask: &Array3<bool>, grow: bool) -> Array3<bool> {
    let dim = mask.dim();
    let mut out = Array3::from_elem(dim, false);
    Zip::indexed(&mut out).par_for_each(|index, value| {
        let centre = mask[index];
        *value = if grow {
            centre || NEIGHBOURS
                .iter()
                .any(|&d| offset(index, d, dim).is_some_and(|n| mask[n]))
        } else {
            // voxels on the grid border erode
            centre && NEIGHBOURS
                .iter()
                .all(|&d| offset(index, d, dim).is_some_and(|n| mask[n]))
        };
    });
    out
}

pub fn dilate(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    (0..radius).fold(mask.clone(), |m, _| step(&m, true))
}

pub fn erode(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    (0..radius).fold(mask.clone(), |m, _| step(&m, false))
}

pub fn open(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    dilate(&erode(mask, radius), radius)
}

/// Closing on a padded copy, so objects touching the border do not shrink.
pub fn close(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let (d, h, w) = mask.dim();
    let mut padded = Array3::from_elem((d + 2 * radius, h + 2 * radius, w + 2 * radius), false);
    padded
        .slice_mut(ndarray::s![radius..radius + d, radius..radius + h, radius..radius + w])
        .assign(mask);
    let closed = erode(&dilate(&padded, radius), radius);
    closed
        .slice(ndarray::s![radius..radius + d, radius..radius + h, radius..radius + w])
        .to_owned()
}

/// Fill every background region not connected to the grid border.
pub fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let dim = mask.dim();
    let mut outside = Array3::from_elem(dim, false);
    let mut queue = VecDeque::new();

    for ((z, y, x), &set) in mask.indexed_iter() {
        let border = z == 0 || y == 0 || x == 0 || z + 1 == dim.0 || y + 1 == dim.1 || x + 1 == dim.2;
        if border && !set {
            outside[[z, y, x]] = true;
            queue.push_back((z, y, x));
        }
    }
    while let Some(index) = queue.pop_front() {
        for &d in &NEIGHBOURS {
            if let Some(n) = offset(index, d, dim) {
                if !mask[n] && !outside[n] {
                    outside[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }
    outside.mapv(|o| !o)
}

/// 2D hole filling in every plane along `axis`.
pub fn fill_holes_slicewise(mask: &Array3<bool>, axis: Axis) -> Array3<bool> {
    let mut out = mask.clone();
    out.axis_iter_mut(axis).into_par_iter().for_each(|mut plane| {
        let filled = fill_holes_2d(&plane.to_owned());
        plane.assign(&filled);
    });
    out
}

fn fill_holes_2d(mask: &Array2<bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    let mut outside = Array2::from_elem((h, w), false);
    let mut queue = VecDeque::new();
    for ((y, x), &set) in mask.indexed_iter() {
        if (y == 0 || x == 0 || y + 1 == h || x + 1 == w) && !set {
            outside[[y, x]] = true;
            queue.push_back((y, x));
        }
    }
    while let Some((y, x)) = queue.pop_front() {
        let candidates = [
            (y.wrapping_sub(1), x),
            (y + 1, x),
            (y, x.wrapping_sub(1)),
            (y, x + 1),
        ];
        for (ny, nx) in candidates {
            if ny < h && nx < w && !mask[[ny, nx]] && !outside[[ny, nx]] {
                outside[[ny, nx]] = true;
                queue.push_back((ny, nx));
            }
        }
    }
    outside.mapv(|o| !o)
}

/// One 6-connected component.
#[derive(Clone, Debug)]
pub struct Component {
    pub label: u32,
    pub size: usize,
    /// Mean voxel index `(z, y, x)`.
    pub centroid: [f64; 3],
}

/// Label 6-connected components (label 0 is background), in scan order.
pub fn label_components(mask: &Array3<bool>) -> (Array3<u32>, Vec<Component>) {
    let dim = mask.dim();
    let mut labels = Array3::<u32>::zeros(dim);
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for ((z, y, x), &set) in mask.indexed_iter() {
        if !set || labels[[z, y, x]] != 0 {
            continue;
        }
        let label = components.len() as u32 + 1;
        labels[[z, y, x]] = label;
        queue.push_back((z, y, x));
        let mut size = 0usize;
        let mut sum = [0.0_f64; 3];
        while let Some(index) = queue.pop_front() {
            size += 1;
            sum[0] += index.0 as f64;
            sum[1] += index.1 as f64;
            sum[2] += index.2 as f64;
            for &d in &NEIGHBOURS {
                if let Some(n) = offset(index, d, dim) {
                    if mask[n] && labels[n] == 0 {
                        labels[n] = label;
                        queue.push_back(n);
                    }
                }
            }
        }
        components.push(Component {
            label,
            size,
            centroid: sum.map(|s| s / size as f64),
        });
    }
    (labels, components)
}

/// Keep only the largest component.
pub fn largest_component(mask: &Array3<bool>) -> Array3<bool> {
    let (labels, components) = label_components(mask);
    match components.iter().max_by_key(|c| c.size) {
        Some(largest) => labels.mapv(|l| l == largest.label),
        None => mask.clone(),
    }
}
