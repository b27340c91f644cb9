//! # DICOM-mesh library
//!
//! This crate turns a set of DICOM image slices into triangle meshes of
//! selected tissues, ready for a 3D viewer.
//!
//! It builds on the dicom-rs ecosystem to read the slices and takes them
//! through a fixed sequence of stages:
//!  - Stack classification by reference frame and plane normal
//!  - Slice sequencing along the normal, with outlier removal
//!  - Volume standardization (bias correction, canonical orientation,
//!    adaptive isotropic resampling)
//!  - Rigid multi-plane registration and max-fusion
//!  - Tissue segmentation (gradient based for bone, clustering for muscle)
//!  - Surface extraction with a single bake into render coordinates
//!  - Mesh finishing (cleanup, Taubin smoothing, quadric decimation)
//!
//! Results are exported as binary STL and binary glTF, together with a
//! JSON report of extents, per-tissue counts and warnings.
//!
//! Per-stack, per-volume and per-tissue failures are recorded as warnings on
//! the [`Job`] and processing continues with what is left. Only running out
//! of usable input fails the Job.
//!
//! If the environment supports it, DICOM files are decoded in parallel and
//! registration and segmentation fan out with rayon.
//!
//! # Coordinates
//!
//! Volumes live in patient LPS millimetres. Meshes are produced in render
//! space, `(-x, z, y)` of LPS scaled to metres, a right-handed frame with
//! +Y up. The conversion happens once, inside [`SurfaceExtractor`], and the
//! [`Mesh`] type carries its space as a type parameter.
//!
//! # Examples
//!
//! ## Reconstructing bone from a directory of slices
//!
//! ```no_run
//! # use dicom_mesh::{CancellationToken, Job, JobOutcome, Pipeline, ReconOptions, Stage, VolumeLoader};
//! # use std::path::PathBuf;
//! let slices = VolumeLoader::load_slices_from_directory(&PathBuf::from("dicom"))
//!     .expect("should have loaded files from directory");
//! let pipeline = Pipeline::new(ReconOptions::default()).expect("default options are valid");
//! let mut job = Job::new("example", slices);
//! let progress = |stage: Stage, fraction: f32| println!("{stage:?}: {:.0}%", fraction * 100.0);
//! match job.run(&pipeline, &progress, &CancellationToken::new()) {
//!     JobOutcome::Succeeded(output) => std::fs::write("mesh.glb", &output.glb).unwrap(),
//!     JobOutcome::Failed { error, .. } => eprintln!("{error}"),
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod enums;
pub mod error;
pub mod export;
pub mod filters;
pub mod finish;
mod interpolator;
pub mod job;
pub mod mesh;
pub mod morphology;
pub mod register;
pub mod segment;
pub mod sequencer;
pub mod slice;
pub mod standardize;
pub mod surface;
pub mod volume;
pub mod volume_loader;

pub use classifier::{Stack, StackClassifier};
pub use config::ReconOptions;
pub use enums::{Interpolation, Orientation, SortBy, Tissue};
pub use error::{GeometryError, ReconError};
pub use export::{ReconstructionReport, encode_glb, encode_stl};
pub use finish::MeshFinisher;
pub use job::{CancellationToken, Job, JobOutcome, JobOutput, JobState, Pipeline, ProgressSink, Stage, Warning};
pub use mesh::{IndexSpace, Mesh, MeshAsset, RenderSpace};
pub use register::{MultiPlaneRegistrator, RigidTransform};
pub use segment::TissueSegmenter;
pub use sequencer::{SliceSequence, SliceSequencer};
pub use slice::Slice;
pub use standardize::VolumeStandardizer;
pub use surface::SurfaceExtractor;
pub use volume::{Geometry, Mask, Volume};
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
