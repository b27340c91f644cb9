//! Binary STL and glTF 2.0 binary (GLB) encoding of a [`MeshAsset`], plus the
//! JSON reconstruction report.

use crate::enums::Tissue;
use crate::error::ReconError;
use crate::job::{Stage, Warning};
use crate::mesh::{MeshAsset, TissueGroup};

use nalgebra::Vector3;
use serde::Serialize;
use serde_json::{Value, json};

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const BYTE: u32 = 5120;
const UNSIGNED_SHORT: u32 = 5123;
const UNSIGNED_INT: u32 = 5125;
const FLOAT: u32 = 5126;
const TRIANGLES: u32 = 4;

const QUANTIZATION_EXTENSION: &str = "KHR_mesh_quantization";

/// Binary STL of every face in the asset.
pub fn encode_stl(asset: &MeshAsset) -> Result<Vec<u8>, ReconError> {
    let mesh = asset.mesh();
    let vertices = mesh.vertices();
    let triangles = mesh.faces().iter().map(|face| {
        let [a, b, c] = face.map(|i| vertices[i as usize]);
        let normal = (b - a)
            .cross(&(c - a))
            .try_normalize(f64::EPSILON)
            .unwrap_or_else(Vector3::z);
        stl_io::Triangle {
            normal: stl_io::Normal::new(to_f32(&normal)),
            vertices: [
                stl_io::Vertex::new(to_f32(&a)),
                stl_io::Vertex::new(to_f32(&b)),
                stl_io::Vertex::new(to_f32(&c)),
            ],
        }
    });

    let mut out = Vec::with_capacity(84 + 50 * mesh.face_count());
    stl_io::write_stl(&mut out, triangles).map_err(|e| ReconError::Export(e.to_string()))?;
    Ok(out)
}

fn to_f32(v: &Vector3<f64>) -> [f32; 3] {
    [v.x as f32, v.y as f32, v.z as f32]
}

fn material_color(tissue: Tissue) -> [f32; 4] {
    match tissue {
        Tissue::Bone => [0.89, 0.85, 0.79, 1.0],
        Tissue::Muscle => [0.72, 0.25, 0.22, 1.0],
    }
}

/// Accumulates the BIN chunk and the buffer views and accessors that
/// describe it.
#[derive(Default)]
struct GltfBuilder {
    bin: Vec<u8>,
    buffer_views: Vec<Value>,
    accessors: Vec<Value>,
}

impl GltfBuilder {
    fn push_view(&mut self, bytes: &[u8], stride: Option<usize>, target: u32) -> usize {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let mut view = json!({
            "buffer": 0,
            "byteOffset": self.bin.len(),
            "byteLength": bytes.len(),
            "target": target,
        });
        if let Some(stride) = stride {
            view["byteStride"] = json!(stride);
        }
        self.bin.extend_from_slice(bytes);
        self.buffer_views.push(view);
        self.buffer_views.len() - 1
    }

    fn push_accessor(&mut self, accessor: Value) -> usize {
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }
}

/// Encode the asset as GLB with one node and mesh per tissue. With
/// `quantize`, positions are stored as normalized `u16` and normals as
/// normalized `i8`, and the node transform restores the original extent.
pub fn encode_glb(asset: &MeshAsset, quantize: bool) -> Result<Vec<u8>, ReconError> {
    let mut full = asset.mesh().clone();
    if full.normals().is_none() {
        full.compute_normals();
    }
    let all_normals = full.normals().unwrap_or_default();

    let mut builder = GltfBuilder::default();
    let mut nodes = Vec::new();
    let mut meshes = Vec::new();
    let mut materials = Vec::new();

    for group in asset.groups() {
        let (vertices, faces) = asset.group_mesh(group);
        if faces.is_empty() {
            continue;
        }
        let normals = &all_normals[group.vertices.clone()];
        let (min, max) = bounds(&vertices);

        let mut node = json!({ "name": group.tissue.name(), "mesh": meshes.len() });
        let (position, normal) = if quantize {
            let extent = max - min;
            let scale = extent.map(|e| if e > 0.0 { e } else { 1.0 });
            let quantized: Vec<u16> = vertices
                .iter()
                .flat_map(|v| {
                    let t = (v - min).component_div(&scale);
                    [t.x, t.y, t.z].map(|c| (c.clamp(0.0, 1.0) * 65535.0).round() as u16)
                })
                .collect();
            let q_min: Vec<u16> = (0..3)
                .map(|a| quantized.iter().skip(a).step_by(3).copied().min().unwrap_or(0))
                .collect();
            let q_max: Vec<u16> = (0..3)
                .map(|a| quantized.iter().skip(a).step_by(3).copied().max().unwrap_or(0))
                .collect();
            // u16 VEC3 rows padded to a 4-byte stride
            let padded: Vec<u16> = quantized
                .chunks_exact(3)
                .flat_map(|c| [c[0], c[1], c[2], 0])
                .collect();
            let view = builder.push_view(bytemuck::cast_slice(&padded), Some(8), ARRAY_BUFFER);
            let position = builder.push_accessor(json!({
                "bufferView": view,
                "componentType": UNSIGNED_SHORT,
                "normalized": true,
                "count": vertices.len(),
                "type": "VEC3",
                "min": q_min,
                "max": q_max,
            }));

            let packed: Vec<i8> = normals
                .iter()
                .flat_map(|n| {
                    let q = n.map(|c| (c.clamp(-1.0, 1.0) * 127.0).round() as i8);
                    [q.x, q.y, q.z, 0]
                })
                .collect();
            let view = builder.push_view(bytemuck::cast_slice(&packed), Some(4), ARRAY_BUFFER);
            let normal = builder.push_accessor(json!({
                "bufferView": view,
                "componentType": BYTE,
                "normalized": true,
                "count": normals.len(),
                "type": "VEC3",
            }));

            node["translation"] = json!([min.x, min.y, min.z]);
            node["scale"] = json!([scale.x, scale.y, scale.z]);
            (position, normal)
        } else {
            let floats: Vec<f32> = vertices.iter().flat_map(to_f32).collect();
            let view = builder.push_view(bytemuck::cast_slice(&floats), None, ARRAY_BUFFER);
            let position = builder.push_accessor(json!({
                "bufferView": view,
                "componentType": FLOAT,
                "count": vertices.len(),
                "type": "VEC3",
                "min": to_f32(&min),
                "max": to_f32(&max),
            }));
            let floats: Vec<f32> = normals.iter().flat_map(to_f32).collect();
            let view = builder.push_view(bytemuck::cast_slice(&floats), None, ARRAY_BUFFER);
            let normal = builder.push_accessor(json!({
                "bufferView": view,
                "componentType": FLOAT,
                "count": normals.len(),
                "type": "VEC3",
            }));
            (position, normal)
        };

        let indices: Vec<u32> = faces.iter().flatten().copied().collect();
        let view = builder.push_view(bytemuck::cast_slice(&indices), None, ELEMENT_ARRAY_BUFFER);
        let indices = builder.push_accessor(json!({
            "bufferView": view,
            "componentType": UNSIGNED_INT,
            "count": faces.len() * 3,
            "type": "SCALAR",
        }));

        let material = materials.len();
        materials.push(json!({
            "name": group.tissue.name(),
            "pbrMetallicRoughness": {
                "baseColorFactor": material_color(group.tissue),
                "metallicFactor": 0.0,
                "roughnessFactor": 0.8,
            },
            "doubleSided": false,
        }));
        meshes.push(json!({
            "name": group.tissue.name(),
            "primitives": [{
                "attributes": { "POSITION": position, "NORMAL": normal },
                "indices": indices,
                "material": material,
                "mode": TRIANGLES,
            }],
        }));
        nodes.push(node);
    }

    while builder.bin.len() % 4 != 0 {
        builder.bin.push(0);
    }
    let mut document = json!({
        "asset": { "version": "2.0", "generator": concat!("dicom-mesh ", env!("CARGO_PKG_VERSION")) },
        "scene": 0,
        "scenes": [{ "nodes": (0..nodes.len()).collect::<Vec<_>>() }],
        "nodes": nodes,
        "meshes": meshes,
        "materials": materials,
        "accessors": builder.accessors,
        "bufferViews": builder.buffer_views,
        "buffers": [{ "byteLength": builder.bin.len() }],
    });
    if quantize {
        document["extensionsUsed"] = json!([QUANTIZATION_EXTENSION]);
        document["extensionsRequired"] = json!([QUANTIZATION_EXTENSION]);
    }

    let mut json_chunk = serde_json::to_vec(&document).map_err(|e| ReconError::Export(e.to_string()))?;
    while json_chunk.len() % 4 != 0 {
        json_chunk.push(b' ');
    }

    let total = 12 + 8 + json_chunk.len() + 8 + builder.bin.len();
    let total = u32::try_from(total)
        .map_err(|_| ReconError::Export(format!("GLB of {total} bytes exceeds the format limit")))?;
    let mut out = Vec::with_capacity(total as usize);
    for word in [GLB_MAGIC, GLB_VERSION, total, json_chunk.len() as u32, CHUNK_JSON] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(&json_chunk);
    out.extend_from_slice(&(builder.bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&builder.bin);
    Ok(out)
}

fn bounds(vertices: &[Vector3<f64>]) -> (Vector3<f64>, Vector3<f64>) {
    match vertices.first() {
        Some(first) => vertices
            .iter()
            .fold((*first, *first), |(min, max), v| (min.inf(v), max.sup(v))),
        None => (Vector3::zeros(), Vector3::zeros()),
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TissueSummary {
    pub tissue: Tissue,
    pub vertices: usize,
    pub faces: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub seconds: f64,
}

/// Summary written next to the exported meshes.
#[derive(Clone, Debug, Serialize)]
pub struct ReconstructionReport {
    pub job_id: String,
    pub stacks_detected: usize,
    pub volumes_fused: usize,
    /// Render-space bounds, in metres.
    pub bounds_min: [f64; 3],
    pub bounds_max: [f64; 3],
    pub extent: [f64; 3],
    pub tissues: Vec<TissueSummary>,
    pub timings: Vec<StageTiming>,
    pub warnings: Vec<Warning>,
}

impl ReconstructionReport {
    pub fn new(
        job_id: impl Into<String>,
        asset: &MeshAsset,
        stacks_detected: usize,
        volumes_fused: usize,
        timings: Vec<StageTiming>,
        warnings: Vec<Warning>,
    ) -> Self {
        let (min, max) = asset
            .mesh()
            .bounds()
            .unwrap_or((Vector3::zeros(), Vector3::zeros()));
        let tissues = asset
            .groups()
            .iter()
            .map(|TissueGroup { tissue, vertices, faces }| TissueSummary {
                tissue: *tissue,
                vertices: vertices.len(),
                faces: faces.len(),
            })
            .collect();
        Self {
            job_id: job_id.into(),
            stacks_detected,
            volumes_fused,
            bounds_min: min.into(),
            bounds_max: max.into(),
            extent: (max - min).into(),
            tissues,
            timings,
            warnings,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ReconError> {
        serde_json::to_vec_pretty(self).map_err(|e| ReconError::Export(e.to_string()))
    }
}
