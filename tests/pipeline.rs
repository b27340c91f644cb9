mod common;

use common::{axial_stack, axial_stack_of, body_only, sagittal_stack, test_options, without_position};
use dicom_mesh::{
    CancellationToken, Job, JobOutcome, JobOutput, JobState, Pipeline, ReconOptions, Stage,
    StackClassifier, Tissue,
};
use std::cell::RefCell;

fn run(job: &mut Job) -> Box<JobOutput> {
    run_with(job, test_options())
}

fn run_with(job: &mut Job, options: ReconOptions) -> Box<JobOutput> {
    let pipeline = Pipeline::new(options).unwrap();
    match job.run(&pipeline, &|_: Stage, _: f32| {}, &CancellationToken::new()) {
        JobOutcome::Succeeded(output) => output,
        JobOutcome::Failed { error, warnings } => {
            panic!("job failed: {error}; warnings: {warnings:?}")
        }
    }
}

fn largest_extent(output: &JobOutput) -> f64 {
    output.report.extent.iter().copied().fold(0.0, f64::max)
}

#[test]
fn single_axial_stack_yields_bone_mesh() {
    let mut job = Job::new("scenario-a", axial_stack(141));
    let output = run(&mut job);

    assert_eq!(job.state(), JobState::Succeeded);
    assert_eq!(output.report.stacks_detected, 1);
    assert_eq!(output.report.volumes_fused, 1);

    let mesh = output.asset.mesh();
    assert!(mesh.vertex_count() > 0 && mesh.face_count() > 0);
    assert!(mesh.is_valid());
    assert_eq!(output.asset.groups().len(), 1);
    assert_eq!(output.asset.groups()[0].tissue, Tissue::Bone);

    // the rod is 70 mm long; anything outside a few cm to half a metre is a
    // unit or spacing error
    let extent = largest_extent(&output);
    assert!((0.01..0.5).contains(&extent), "largest extent {extent} m");
    // long axis of the rod is LPS z, the render up axis
    assert!(output.report.extent[1] > output.report.extent[0]);

    assert!(output.stl.len() > 84);
    assert_eq!(&output.glb[0..4], b"glTF");
}

#[test]
fn two_plane_input_is_split_into_two_stacks() {
    let mut slices = axial_stack(141);
    slices.extend(sagittal_stack(15, 1.2));
    assert_eq!(slices.len(), 156);

    let stacks = StackClassifier::new(test_options().classifier)
        .classify(slices.clone(), &mut Vec::new())
        .unwrap();
    let mut sizes: Vec<usize> = stacks.iter().map(|s| s.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![15, 141]);

    let mut job = Job::new("scenario-b", slices);
    let output = run(&mut job);
    assert_eq!(output.report.stacks_detected, 2);
    assert!(output.report.volumes_fused >= 1);
    assert!(output.asset.mesh().face_count() > 0);
    let extent = largest_extent(&output);
    assert!((0.01..0.5).contains(&extent), "largest extent {extent} m");
}

#[test]
fn slice_without_position_falls_back_to_index_order() {
    let mut slices = without_position(axial_stack(141), 70);
    // shuffle so the fallback key decides where the slice lands
    slices.swap(70, 3);
    let mut job = Job::new("scenario-c", slices);
    let output = run(&mut job);

    assert_eq!(output.report.stacks_detected, 1);
    assert!(output.asset.mesh().face_count() > 0);
    assert!(
        !output
            .report
            .warnings
            .iter()
            .any(|w| w.message.contains("outlier")),
        "{:?}",
        output.report.warnings
    );
}

#[test]
fn stack_with_too_few_slices_is_skipped_with_a_warning() {
    let mut slices = axial_stack(141);
    slices.extend(sagittal_stack(2, 1.2));

    let mut job = Job::new("short-stack", slices);
    let output = run(&mut job);

    assert_eq!(job.state(), JobState::Succeeded);
    assert_eq!(output.report.stacks_detected, 2);
    assert_eq!(output.report.volumes_fused, 1);
    assert!(output.asset.mesh().face_count() > 0);
    assert!(
        output
            .report
            .warnings
            .iter()
            .any(|w| w.stage == Stage::Sequence && w.message.contains("Too few slices")),
        "{:?}",
        output.report.warnings
    );
}

#[test]
fn empty_tissue_is_dropped_with_a_warning() {
    let mut options = test_options();
    options.segmentation.tissues = vec![Tissue::Bone, Tissue::Muscle];
    // brightest cluster: the whole body interior
    options.segmentation.soft_tissue_rank = 2;
    options.standardizer.bias_correction = false;

    // no rod, so nothing has a hard boundary inside the body
    let mut job = Job::new("no-bone", axial_stack_of(body_only, 60));
    let output = run_with(&mut job, options);

    assert_eq!(job.state(), JobState::Succeeded);
    let groups = output.asset.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].tissue, Tissue::Muscle);
    assert!(
        output
            .report
            .warnings
            .iter()
            .any(|w| w.stage == Stage::Segment && w.message.contains("bone")),
        "{:?}",
        output.report.warnings
    );
}

#[test]
fn progress_is_monotonic_and_reaches_the_end() {
    let seen = RefCell::new(Vec::new());
    let progress = |stage: Stage, fraction: f32| seen.borrow_mut().push((stage, fraction));
    let pipeline = Pipeline::new(test_options()).unwrap();
    let mut job = Job::new("progress", axial_stack(60));
    let outcome = job.run(&pipeline, &progress, &CancellationToken::new());
    assert!(matches!(outcome, JobOutcome::Succeeded(_)));

    let seen = seen.into_inner();
    assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
    let (stage, last) = *seen.last().unwrap();
    assert_eq!(stage, Stage::Export);
    assert!((last - 1.0).abs() < 1e-6);
}

#[test]
fn reprocessing_is_deterministic() {
    let first = run(&mut Job::new("repeat", axial_stack(60)));
    let second = run(&mut Job::new("repeat", axial_stack(60)));
    assert_eq!(first.stl, second.stl);
    assert_eq!(first.glb, second.glb);
}
