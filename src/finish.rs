//! Mesh cleanup, smoothing and decimation.

use crate::config::FinishingOptions;
use crate::mesh::{Mesh, RenderSpace};

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

const MIN_FACE_AREA: f64 = 1e-18;

pub struct MeshFinisher {
    options: FinishingOptions,
}

impl MeshFinisher {
    pub fn new(options: FinishingOptions) -> Self {
        Self { options }
    }

    /// Clean, keep the dominant components, smooth, decimate and recompute
    /// normals. The result never has fewer than `min_vertices` vertices unless
    /// the cleaned input already had fewer.
    pub fn finish(&self, mesh: Mesh<RenderSpace>) -> Mesh<RenderSpace> {
        let (vertices, faces) = mesh.into_parts();
        let input_faces = faces.len();
        let (vertices, faces) = clean(vertices, faces);
        let (vertices, faces) = keep_main_components(vertices, faces, self.options.min_vertices);

        let vertices = taubin_smooth(
            vertices,
            &faces,
            self.options.smoothing_iterations,
            self.options.taubin_lambda,
            self.options.taubin_mu,
        );

        let target_faces = ((1.0 - self.options.target_reduction) * faces.len() as f64).ceil() as usize;
        let (vertices, faces) = if target_faces < faces.len() && vertices.len() > self.options.min_vertices {
            Decimator::new(&vertices, &faces).run(target_faces, self.options.min_vertices)
        } else {
            (vertices, faces)
        };

        debug!(
            input_faces,
            faces = faces.len(),
            vertices = vertices.len(),
            "Finished mesh"
        );
        let mut mesh = Mesh::<RenderSpace>::new(vertices, faces);
        mesh.compute_normals();
        mesh
    }
}

fn triangle_normal(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> Vector3<f64> {
    (b - a).cross(&(c - a))
}

/// Drop invalid, degenerate and duplicate faces, then unreferenced vertices.
pub fn clean(vertices: Vec<Vector3<f64>>, faces: Vec<[u32; 3]>) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
    let n = vertices.len();
    let mut seen = HashSet::new();
    let faces: Vec<[u32; 3]> = faces
        .into_iter()
        .filter(|f| {
            if f.iter().any(|&i| i as usize >= n) || f[0] == f[1] || f[1] == f[2] || f[0] == f[2] {
                return false;
            }
            let [a, b, c] = f.map(|i| &vertices[i as usize]);
            if triangle_normal(a, b, c).norm() < MIN_FACE_AREA {
                return false;
            }
            let mut key = *f;
            key.sort_unstable();
            seen.insert(key)
        })
        .collect();
    compact(&vertices, &faces)
}

/// Keep only referenced vertices, renumbered in their original order.
fn compact(vertices: &[Vector3<f64>], faces: &[[u32; 3]]) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
    let mut remap = vec![u32::MAX; vertices.len()];
    let mut used = vec![false; vertices.len()];
    for f in faces {
        for &i in f {
            used[i as usize] = true;
        }
    }
    let mut kept = Vec::new();
    for (i, v) in vertices.iter().enumerate() {
        if used[i] {
            remap[i] = kept.len() as u32;
            kept.push(*v);
        }
    }
    let faces = faces.iter().map(|f| f.map(|i| remap[i as usize])).collect();
    (kept, faces)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Keep the largest connected component, adding the next largest ones until
/// `min_vertices` is reached.
fn keep_main_components(
    vertices: Vec<Vector3<f64>>,
    faces: Vec<[u32; 3]>,
    min_vertices: usize,
) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
    let mut parent: Vec<usize> = (0..vertices.len()).collect();
    for f in &faces {
        let a = find(&mut parent, f[0] as usize);
        for &i in &f[1..] {
            let b = find(&mut parent, i as usize);
            if a != b {
                parent[b] = a;
            }
        }
    }

    let mut sizes: HashMap<usize, usize> = HashMap::new();
    for i in 0..vertices.len() {
        *sizes.entry(find(&mut parent, i)).or_default() += 1;
    }
    if sizes.len() <= 1 {
        return (vertices, faces);
    }

    let mut ranked: Vec<(usize, usize)> = sizes.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut keep = HashSet::new();
    let mut total = 0;
    for (root, size) in &ranked {
        keep.insert(*root);
        total += size;
        if total >= min_vertices {
            break;
        }
    }
    debug!(components = ranked.len(), kept = keep.len(), "Mesh components");

    let faces: Vec<[u32; 3]> = faces
        .into_iter()
        .filter(|f| keep.contains(&find(&mut parent, f[0] as usize)))
        .collect();
    compact(&vertices, &faces)
}

fn vertex_neighbours(count: usize, faces: &[[u32; 3]]) -> Vec<Vec<u32>> {
    let mut neighbours: Vec<Vec<u32>> = vec![Vec::new(); count];
    for f in faces {
        for k in 0..3 {
            let (a, b) = (f[k], f[(k + 1) % 3]);
            neighbours[a as usize].push(b);
            neighbours[b as usize].push(a);
        }
    }
    for list in &mut neighbours {
        list.sort_unstable();
        list.dedup();
    }
    neighbours
}

/// Taubin lambda/mu smoothing with uniform Laplacian weights. Shrinks far
/// less than plain Laplacian smoothing.
pub fn taubin_smooth(
    mut vertices: Vec<Vector3<f64>>,
    faces: &[[u32; 3]],
    iterations: usize,
    lambda: f64,
    mu: f64,
) -> Vec<Vector3<f64>> {
    let neighbours = vertex_neighbours(vertices.len(), faces);
    let step = |positions: &[Vector3<f64>], factor: f64| -> Vec<Vector3<f64>> {
        positions
            .par_iter()
            .zip(neighbours.par_iter())
            .map(|(p, adjacent)| {
                if adjacent.is_empty() {
                    return *p;
                }
                let centroid = adjacent
                    .iter()
                    .fold(Vector3::zeros(), |acc, &j| acc + positions[j as usize])
                    / adjacent.len() as f64;
                p + (centroid - p) * factor
            })
            .collect()
    };
    for _ in 0..iterations {
        vertices = step(&vertices, lambda);
        vertices = step(&vertices, mu);
    }
    vertices
}

/// Quadric error metric edge-collapse decimation.
struct Decimator {
    positions: Vec<Vector3<f64>>,
    quadrics: Vec<Matrix4<f64>>,
    faces: Vec<[u32; 3]>,
    face_alive: Vec<bool>,
    vertex_faces: Vec<Vec<usize>>,
    vertex_alive: Vec<bool>,
    versions: Vec<u32>,
    heap: BinaryHeap<Reverse<(OrderedFloat<f64>, u32, u32, u32, u32)>>,
}

impl Decimator {
    fn new(vertices: &[Vector3<f64>], faces: &[[u32; 3]]) -> Self {
        let mut quadrics = vec![Matrix4::zeros(); vertices.len()];
        let mut vertex_faces = vec![Vec::new(); vertices.len()];
        for (fi, f) in faces.iter().enumerate() {
            let [a, b, c] = f.map(|i| vertices[i as usize]);
            if let Some(n) = triangle_normal(&a, &b, &c).try_normalize(f64::EPSILON) {
                let plane = Vector4::new(n.x, n.y, n.z, -n.dot(&a));
                let q = plane * plane.transpose();
                for &i in f {
                    quadrics[i as usize] += q;
                }
            }
            for &i in f {
                vertex_faces[i as usize].push(fi);
            }
        }

        let mut decimator = Self {
            positions: vertices.to_vec(),
            quadrics,
            faces: faces.to_vec(),
            face_alive: vec![true; faces.len()],
            vertex_faces,
            vertex_alive: vec![true; vertices.len()],
            versions: vec![0; vertices.len()],
            heap: BinaryHeap::new(),
        };
        let mut edges = HashSet::new();
        for f in faces {
            for k in 0..3 {
                let (a, b) = (f[k], f[(k + 1) % 3]);
                edges.insert((a.min(b), a.max(b)));
            }
        }
        let mut edges: Vec<(u32, u32)> = edges.into_iter().collect();
        edges.sort_unstable();
        for (a, b) in edges {
            decimator.push_edge(a, b);
        }
        decimator
    }

    /// Minimiser of the combined quadric, or the best of the endpoints and
    /// midpoint when the system is singular.
    fn optimal_position(&self, a: u32, b: u32) -> (Vector3<f64>, f64) {
        let q = self.quadrics[a as usize] + self.quadrics[b as usize];
        let error = |p: &Vector3<f64>| {
            let h = Vector4::new(p.x, p.y, p.z, 1.0);
            (h.transpose() * q * h)[(0, 0)].max(0.0)
        };

        let system: Matrix3<f64> = q.fixed_view::<3, 3>(0, 0).into_owned();
        let rhs = -q.fixed_view::<3, 1>(0, 3).into_owned();
        let (pa, pb) = (self.positions[a as usize], self.positions[b as usize]);
        if let Some(p) = system.lu().solve(&rhs) {
            // reject solutions far outside the edge neighbourhood
            if (p - (pa + pb) / 2.0).norm() <= 2.0 * (pa - pb).norm() {
                return (p, error(&p));
            }
        }
        [pa, pb, (pa + pb) / 2.0]
            .into_iter()
            .map(|p| (p, error(&p)))
            .min_by(|x, y| x.1.total_cmp(&y.1))
            .unwrap_or((pa, 0.0))
    }

    fn push_edge(&mut self, a: u32, b: u32) {
        let (_, cost) = self.optimal_position(a, b);
        self.heap.push(Reverse((
            OrderedFloat(cost),
            a,
            b,
            self.versions[a as usize],
            self.versions[b as usize],
        )));
    }

    fn neighbours(&self, v: u32) -> HashSet<u32> {
        self.vertex_faces[v as usize]
            .iter()
            .flat_map(|&fi| self.faces[fi])
            .filter(|&i| i != v)
            .collect()
    }

    /// Collapsing `a`-`b` keeps the surface manifold and flips no face.
    fn can_collapse(&self, a: u32, b: u32, target: &Vector3<f64>) -> bool {
        let shared_faces = self.vertex_faces[a as usize]
            .iter()
            .filter(|&&fi| self.faces[fi].contains(&b))
            .count();
        let common = self.neighbours(a).intersection(&self.neighbours(b)).count();
        if shared_faces != 2 || common != 2 {
            return false;
        }

        [a, b].iter().all(|&moved| {
            self.vertex_faces[moved as usize].iter().all(|&fi| {
                let f = self.faces[fi];
                if f.contains(&a) && f.contains(&b) {
                    return true;
                }
                let [p, q, r] = f.map(|i| self.positions[i as usize]);
                let before = triangle_normal(&p, &q, &r);
                let moved_to = f.map(|i| if i == moved { *target } else { self.positions[i as usize] });
                let after = triangle_normal(&moved_to[0], &moved_to[1], &moved_to[2]);
                after.norm() > MIN_FACE_AREA && before.dot(&after) > 0.0
            })
        })
    }

    /// Merge `b` into `a` at `target`.
    fn collapse(&mut self, a: u32, b: u32, target: Vector3<f64>) -> usize {
        let mut removed = 0;
        let b_faces = std::mem::take(&mut self.vertex_faces[b as usize]);
        for fi in b_faces {
            if !self.face_alive[fi] {
                continue;
            }
            if self.faces[fi].contains(&a) {
                self.face_alive[fi] = false;
                removed += 1;
                for i in self.faces[fi] {
                    if i != b {
                        self.vertex_faces[i as usize].retain(|&f| f != fi);
                    }
                }
            } else {
                for i in &mut self.faces[fi] {
                    if *i == b {
                        *i = a;
                    }
                }
                self.vertex_faces[a as usize].push(fi);
            }
        }

        self.positions[a as usize] = target;
        let qb = self.quadrics[b as usize];
        self.quadrics[a as usize] += qb;
        self.vertex_alive[b as usize] = false;
        self.versions[a as usize] += 1;

        let mut around: Vec<u32> = self.neighbours(a).into_iter().collect();
        around.sort_unstable();
        for n in around {
            self.push_edge(a.min(n), a.max(n));
        }
        removed
    }

    fn run(mut self, target_faces: usize, min_vertices: usize) -> (Vec<Vector3<f64>>, Vec<[u32; 3]>) {
        let mut alive_faces = self.faces.len();
        let mut alive_vertices = self.positions.len();

        while alive_faces > target_faces && alive_vertices > min_vertices {
            let Some(Reverse((_, a, b, va, vb))) = self.heap.pop() else {
                break;
            };
            if !self.vertex_alive[a as usize]
                || !self.vertex_alive[b as usize]
                || self.versions[a as usize] != va
                || self.versions[b as usize] != vb
            {
                continue;
            }
            let (target, _) = self.optimal_position(a, b);
            if !self.can_collapse(a, b, &target) {
                continue;
            }
            alive_faces -= self.collapse(a, b, target);
            alive_vertices -= 1;
        }

        let faces: Vec<[u32; 3]> = self
            .faces
            .iter()
            .zip(&self.face_alive)
            .filter(|(_, alive)| **alive)
            .map(|(f, _)| *f)
            .collect();
        compact(&self.positions, &faces)
    }
}
