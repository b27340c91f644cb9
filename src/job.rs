//! One reconstruction request, from unordered slices to exported meshes.

use crate::classifier::StackClassifier;
use crate::config::ReconOptions;
use crate::error::ReconError;
use crate::export::{ReconstructionReport, StageTiming, encode_glb, encode_stl};
use crate::finish::MeshFinisher;
use crate::mesh::MeshAsset;
use crate::register::{Fusion, MultiPlaneRegistrator};
use crate::segment::TissueSegmenter;
use crate::sequencer::SliceSequencer;
use crate::slice::Slice;
use crate::standardize::VolumeStandardizer;
use crate::surface::SurfaceExtractor;

use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use web_time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Classify,
    Sequence,
    Standardize,
    Register,
    Segment,
    Extract,
    Finish,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Classify,
        Stage::Sequence,
        Stage::Standardize,
        Stage::Register,
        Stage::Segment,
        Stage::Extract,
        Stage::Finish,
        Stage::Export,
    ];

    /// Share of the overall progress bar.
    fn weight(self) -> f32 {
        match self {
            Stage::Classify => 0.02,
            Stage::Sequence => 0.03,
            Stage::Standardize => 0.25,
            Stage::Register => 0.25,
            Stage::Segment => 0.2,
            Stage::Extract => 0.1,
            Stage::Finish => 0.1,
            Stage::Export => 0.05,
        }
    }

    /// Overall fraction at which this stage starts.
    fn start(self) -> f32 {
        Stage::ALL
            .iter()
            .take_while(|&&s| s != self)
            .map(|s| s.weight())
            .sum()
    }
}

/// A non-fatal problem, attached to the Job that hit it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Warning {
    pub stage: Stage,
    pub message: String,
}

impl Warning {
    /// Log and keep a warning.
    pub fn record(warnings: &mut Vec<Warning>, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        warn!(?stage, "{message}");
        warnings.push(Warning { stage, message });
    }
}

/// Cooperative cancellation shared between a running Job and its owner.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), ReconError> {
        if self.is_cancelled() {
            Err(ReconError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives the overall progress fraction in `[0, 1]`, never decreasing.
pub trait ProgressSink {
    fn report(&self, stage: Stage, fraction: f32);
}

impl<F: Fn(Stage, f32)> ProgressSink for F {
    fn report(&self, stage: Stage, fraction: f32) {
        self(stage, fraction)
    }
}

struct Progress<'a> {
    sink: &'a dyn ProgressSink,
    reported: f32,
}

impl Progress<'_> {
    /// `within` is the completed share of `stage`.
    fn update(&mut self, stage: Stage, within: f32) {
        let fraction = (stage.start() + stage.weight() * within.clamp(0.0, 1.0))
            .min(1.0)
            .max(self.reported);
        self.reported = fraction;
        self.sink.report(stage, fraction);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "stage")]
pub enum JobState {
    Created,
    Running(Stage),
    Succeeded,
    Failed,
}

/// The stage objects of one configuration. Immutable while Jobs run, so one
/// pipeline can serve any number of Jobs.
pub struct Pipeline {
    options: ReconOptions,
    classifier: StackClassifier,
    sequencer: SliceSequencer,
    standardizer: VolumeStandardizer,
    registrator: MultiPlaneRegistrator,
    segmenter: TissueSegmenter,
    extractor: SurfaceExtractor,
    finisher: MeshFinisher,
}

impl Pipeline {
    pub fn new(options: ReconOptions) -> Result<Self, ReconError> {
        options.validate()?;
        Ok(Self {
            classifier: StackClassifier::new(options.classifier.clone()),
            sequencer: SliceSequencer::new(options.sequencer.clone()),
            standardizer: VolumeStandardizer::new(options.standardizer.clone()),
            registrator: MultiPlaneRegistrator::new(options.registration.clone()),
            segmenter: TissueSegmenter::new(options.segmentation.clone()),
            extractor: SurfaceExtractor::new(options.surface.clone()),
            finisher: MeshFinisher::new(options.finishing.clone()),
            options,
        })
    }

    pub fn options(&self) -> &ReconOptions {
        &self.options
    }
}

/// Everything a successful Job delivers.
#[derive(Clone, Debug)]
pub struct JobOutput {
    pub asset: MeshAsset,
    pub stl: Vec<u8>,
    pub glb: Vec<u8>,
    pub report: ReconstructionReport,
}

#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(Box<JobOutput>),
    Failed {
        error: ReconError,
        warnings: Vec<Warning>,
    },
}

pub struct Job {
    id: String,
    slices: Vec<Slice>,
    state: JobState,
    warnings: Vec<Warning>,
    timings: Vec<StageTiming>,
}

impl Job {
    pub fn new(id: impl Into<String>, slices: Vec<Slice>) -> Self {
        Self {
            id: id.into(),
            slices,
            state: JobState::Created,
            warnings: Vec::new(),
            timings: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Run every stage in order. The input slices and all intermediate
    /// volumes and masks are released when this returns.
    ///
    /// A Job runs once: later calls fail with `AlreadyRun` and leave the
    /// state, warnings and timings of the first run untouched.
    pub fn run(
        &mut self,
        pipeline: &Pipeline,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        if self.state != JobState::Created {
            return JobOutcome::Failed {
                error: ReconError::AlreadyRun,
                warnings: self.warnings.clone(),
            };
        }
        let started = Instant::now();
        let mut progress = Progress {
            sink: progress,
            reported: 0.0,
        };
        match self.execute(pipeline, &mut progress, cancel) {
            Ok(output) => {
                self.state = JobState::Succeeded;
                info!(
                    job = %self.id,
                    seconds = started.elapsed().as_secs_f64(),
                    warnings = self.warnings.len(),
                    "Job succeeded"
                );
                JobOutcome::Succeeded(Box::new(output))
            }
            Err(error) => {
                self.state = JobState::Failed;
                warn!(job = %self.id, %error, "Job failed");
                JobOutcome::Failed {
                    error,
                    warnings: self.warnings.clone(),
                }
            }
        }
    }

    fn enter(
        &mut self,
        stage: Stage,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> Result<Instant, ReconError> {
        cancel.check()?;
        self.state = JobState::Running(stage);
        progress.update(stage, 0.0);
        Ok(Instant::now())
    }

    fn leave(&mut self, stage: Stage, started: Instant, progress: &mut Progress) {
        let seconds = started.elapsed().as_secs_f64();
        info!(job = %self.id, ?stage, seconds, "Stage finished");
        self.timings.push(StageTiming { stage, seconds });
        progress.update(stage, 1.0);
    }

    fn execute(
        &mut self,
        pipeline: &Pipeline,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, ReconError> {
        let options = &pipeline.options;
        let slices = std::mem::take(&mut self.slices);
        info!(job = %self.id, slices = slices.len(), "Job started");

        let started = self.enter(Stage::Classify, progress, cancel)?;
        let stacks = pipeline.classifier.classify(slices, &mut self.warnings)?;
        let stacks_detected = stacks.len();
        self.leave(Stage::Classify, started, progress);

        let started = self.enter(Stage::Sequence, progress, cancel)?;
        let mut sequences = Vec::with_capacity(stacks.len());
        for (i, stack) in stacks.into_iter().enumerate() {
            cancel.check()?;
            match pipeline.sequencer.sequence(stack, &mut self.warnings) {
                Ok(sequence) => sequences.push((i, sequence)),
                Err(e) if !e.is_job_fatal() => {
                    Warning::record(&mut self.warnings, Stage::Sequence, format!("Stack {i} skipped: {e}"))
                }
                Err(e) => return Err(e),
            }
            progress.update(Stage::Sequence, (i + 1) as f32 / stacks_detected as f32);
        }
        self.leave(Stage::Sequence, started, progress);

        let started = self.enter(Stage::Standardize, progress, cancel)?;
        let mut volumes = Vec::with_capacity(sequences.len());
        let total = sequences.len();
        for (done, (i, sequence)) in sequences.into_iter().enumerate() {
            cancel.check()?;
            match pipeline.standardizer.standardize(&sequence, &mut self.warnings) {
                Ok(volume) => volumes.push(volume),
                Err(e) if !e.is_job_fatal() => Warning::record(
                    &mut self.warnings,
                    Stage::Standardize,
                    format!("Stack {i} skipped: {e}"),
                ),
                Err(e) => return Err(e),
            }
            progress.update(Stage::Standardize, (done + 1) as f32 / total as f32);
        }
        if volumes.is_empty() {
            return Err(ReconError::NoUsableGeometry);
        }
        self.leave(Stage::Standardize, started, progress);

        let started = self.enter(Stage::Register, progress, cancel)?;
        let Fusion {
            volume,
            fused: volumes_fused,
        } = pipeline
            .registrator
            .register_and_fuse(volumes, &mut self.warnings, cancel)?;
        self.leave(Stage::Register, started, progress);

        let started = self.enter(Stage::Segment, progress, cancel)?;
        let masks = pipeline
            .segmenter
            .segment(&volume, &options.segmentation.tissues, &mut self.warnings)?;
        drop(volume);
        self.leave(Stage::Segment, started, progress);

        let started = self.enter(Stage::Extract, progress, cancel)?;
        let mut meshes = Vec::with_capacity(masks.len());
        let total = masks.len();
        for (done, mask) in masks.into_iter().enumerate() {
            cancel.check()?;
            match pipeline.extractor.extract(&mask) {
                Ok(mesh) => meshes.push((mask.tissue(), mesh)),
                Err(e) if !e.is_job_fatal() => {
                    Warning::record(&mut self.warnings, Stage::Extract, e.to_string())
                }
                Err(e) => return Err(e),
            }
            progress.update(Stage::Extract, (done + 1) as f32 / total as f32);
        }
        if meshes.is_empty() {
            return Err(ReconError::EmptySegmentation);
        }
        self.leave(Stage::Extract, started, progress);

        let started = self.enter(Stage::Finish, progress, cancel)?;
        let finished: Vec<_> = meshes
            .into_par_iter()
            .map(|(tissue, mesh)| (tissue, pipeline.finisher.finish(mesh)))
            .collect();
        let asset = MeshAsset::merge(finished);
        if asset.is_empty() {
            return Err(ReconError::EmptySegmentation);
        }
        self.leave(Stage::Finish, started, progress);

        let started = self.enter(Stage::Export, progress, cancel)?;
        let stl = encode_stl(&asset)?;
        let glb = encode_glb(&asset, options.export.quantize)?;
        self.leave(Stage::Export, started, progress);

        let report = ReconstructionReport::new(
            self.id.clone(),
            &asset,
            stacks_detected,
            volumes_fused,
            self.timings.clone(),
            self.warnings.clone(),
        );
        Ok(JobOutput {
            asset,
            stl,
            glb,
            report,
        })
    }
}
