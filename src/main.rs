use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dicom_mesh::{
    CancellationToken, Job, JobOutcome, Pipeline, ReconOptions, Stage, Tissue, VolumeLoader,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Reconstruct tissue surface meshes from a directory of DICOM slices.
#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// Directory containing the .dcm files of one study
    input_dir: PathBuf,

    /// Directory that receives mesh.stl, mesh.glb and report.json
    output_dir: PathBuf,

    /// TOML file overriding the default reconstruction options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tissue to reconstruct, repeatable (bone, muscle)
    #[arg(short, long)]
    tissue: Vec<Tissue>,

    /// Store glTF geometry with KHR_mesh_quantization
    #[arg(short, long)]
    quantize: bool,
}

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), BoxError> {
    let mut options = match &args.config {
        Some(path) => ReconOptions::load(path)?,
        None => ReconOptions::default(),
    };
    if !args.tissue.is_empty() {
        options.segmentation.tissues = args.tissue.clone();
    }
    options.export.quantize |= args.quantize;
    let pipeline = Pipeline::new(options)?;

    let input = args.input_dir.clone();
    let slices = tokio::task::spawn_blocking(move || VolumeLoader::load_slices_from_directory(input))
        .await?
        .map_err(|e| e.to_string())?;
    info!(slices = slices.len(), input = %args.input_dir.display(), "Loaded slices");

    let job_id = args
        .input_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "job".to_string());
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || {
        let mut job = Job::new(job_id, slices);
        let progress = |stage: Stage, fraction: f32| {
            debug!(?stage, percent = format_args!("{:.1}", fraction * 100.0), "Progress");
        };
        job.run(&pipeline, &progress, &worker_cancel)
    });

    let outcome = tokio::select! {
        outcome = &mut task => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling reconstruction");
            cancel.cancel();
            task.await?
        }
    };

    match outcome {
        JobOutcome::Succeeded(output) => {
            fs::create_dir_all(&args.output_dir)?;
            fs::write(args.output_dir.join("mesh.stl"), &output.stl)?;
            fs::write(args.output_dir.join("mesh.glb"), &output.glb)?;
            fs::write(args.output_dir.join("report.json"), output.report.to_json()?)?;
            info!(
                output = %args.output_dir.display(),
                vertices = output.asset.mesh().vertex_count(),
                faces = output.asset.mesh().face_count(),
                warnings = output.report.warnings.len(),
                "Meshes written"
            );
            Ok(())
        }
        JobOutcome::Failed { error, warnings } => {
            for warning in &warnings {
                warn!(stage = ?warning.stage, "{}", warning.message);
            }
            Err(error.into())
        }
    }
}
