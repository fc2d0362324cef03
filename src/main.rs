use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use gesture_forge::{
    capture::{self, CaptureSession},
    config::Settings,
    detector::HandposeDetector,
    model_download::{self, ModelKind},
    source::{FrameSource, ImageSequenceSource},
    store::SampleStore,
    train,
};

#[derive(Parser, Debug)]
#[command(name = "gesture-forge", version, about)]
struct Cli {
    /// JSON settings file; missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding one `<label>.npy` artifact per gesture.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Directory for trained models and the handpose ONNX file.
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record landmark samples for the configured labels.
    Collect {
        /// Read frames from a directory of images instead of a camera.
        #[arg(long)]
        images: Option<PathBuf>,
        #[arg(long)]
        camera: Option<u32>,
        /// Frames to record per label selection.
        #[arg(long)]
        quota: Option<usize>,
        #[arg(long)]
        max_hands: Option<usize>,
        /// Start already recording this label.
        #[arg(long)]
        arm: Option<String>,
        #[arg(long)]
        no_mirror: bool,
        /// Handpose ONNX model path.
        #[arg(long)]
        model: Option<PathBuf>,
        /// Palm detector ONNX model path.
        #[arg(long)]
        palm_model: Option<PathBuf>,
        /// Print the available cameras and exit.
        #[arg(long)]
        list_cameras: bool,
    },
    /// Fit k-NN, report hold-out accuracy and export JSON.
    TrainKnn {
        #[arg(long)]
        k: Option<usize>,
        #[arg(long)]
        max_per_label: Option<usize>,
        /// Keep every sample of every label.
        #[arg(long, conflicts_with = "max_per_label")]
        no_cap: bool,
        /// Skip landmark normalization.
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Train the dense network and export a model bundle.
    TrainMlp {
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List stored artifacts and their shapes.
    Inspect,
    /// Classify the rows of a raw sample file with an exported k-NN model.
    PredictKnn {
        samples: PathBuf,
        #[arg(long)]
        model: Option<PathBuf>,
        /// Rows are already normalized.
        #[arg(long)]
        raw: bool,
    },
}

fn open_source(images: Option<PathBuf>, camera_index: u32) -> Result<Box<dyn FrameSource>> {
    if let Some(dir) = images {
        return Ok(Box::new(ImageSequenceSource::open(&dir)?));
    }
    #[cfg(feature = "camera-nokhwa")]
    {
        Ok(Box::new(gesture_forge::source::CameraSource::open(
            camera_index,
        )?))
    }
    #[cfg(not(feature = "camera-nokhwa"))]
    {
        let _ = camera_index;
        anyhow::bail!("built without camera support; pass --images <dir>")
    }
}

#[allow(clippy::too_many_arguments)]
fn collect(
    mut settings: Settings,
    images: Option<PathBuf>,
    camera: Option<u32>,
    quota: Option<usize>,
    max_hands: Option<usize>,
    arm: Option<String>,
    no_mirror: bool,
    model: Option<PathBuf>,
    palm_model: Option<PathBuf>,
) -> Result<()> {
    if let Some(camera) = camera {
        settings.capture.camera_index = camera;
    }
    if let Some(quota) = quota {
        settings.capture.quota = quota;
    }
    if let Some(max_hands) = max_hands {
        settings.capture.max_hands = max_hands;
    }
    if no_mirror {
        settings.capture.mirror = false;
    }
    if let Some(model) = model {
        settings.detector.model_path = model;
    }
    if let Some(model) = palm_model {
        settings.detector.palm_model_path = model;
    }

    let mut source = open_source(images, settings.capture.camera_index)
        .context("failed to open frame source")?;

    let detector_settings = &settings.detector;
    model_download::ensure_model(
        ModelKind::HandposeEstimator,
        &detector_settings.model_path,
        &detector_settings.model_url,
        |_| {},
    )?;
    model_download::ensure_model(
        ModelKind::PalmDetector,
        &detector_settings.palm_model_path,
        &detector_settings.palm_model_url,
        |_| {},
    )?;
    let mut detector = HandposeDetector::new(
        &detector_settings.model_path,
        &detector_settings.palm_model_path,
        settings.detector_options(),
    )?;

    let mut session = CaptureSession::new(
        settings.labels.clone(),
        settings.capture.quota,
        settings.capture.max_hands,
    )?;
    if let Some(label) = arm {
        session.select_label(&label)?;
        log::info!("recording {label}");
    }

    let store = SampleStore::new(&settings.data_dir);
    let commands = capture::spawn_operator_input().context("failed to read operator input")?;
    println!("{}", session.menu());
    println!("type a label number and press enter to record");

    let summary =
        capture::run_capture(source.as_mut(), &mut detector, &mut session, &store, &commands)?;
    log::info!(
        "{} frames read, {} with hands, {} writes",
        summary.frames,
        summary.frames_with_hands,
        summary.saved.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        settings.data_dir = dir;
    }
    if let Some(dir) = cli.model_dir {
        settings.model_dir = dir;
    }

    match cli.command {
        Command::Collect {
            list_cameras: true, ..
        } => {
            #[cfg(feature = "camera-nokhwa")]
            for (index, name) in gesture_forge::source::list_cameras()? {
                println!("{index}: {name}");
            }
            #[cfg(not(feature = "camera-nokhwa"))]
            anyhow::bail!("built without camera support");
        }
        Command::Collect {
            images,
            camera,
            quota,
            max_hands,
            arm,
            no_mirror,
            model,
            palm_model,
            list_cameras: false,
        } => collect(
            settings, images, camera, quota, max_hands, arm, no_mirror, model, palm_model,
        )?,
        Command::TrainKnn {
            k,
            max_per_label,
            no_cap,
            raw,
            output,
        } => {
            if let Some(k) = k {
                settings.knn.k = k;
            }
            if max_per_label.is_some() {
                settings.knn.max_per_label = max_per_label;
            }
            if no_cap {
                settings.knn.max_per_label = None;
            }
            if raw {
                settings.knn.normalize = false;
            }
            let output = output.unwrap_or_else(|| settings.knn_output_path());
            let report = train::train_knn(&settings.data_dir, &settings.knn, &output)?;
            match report.test_accuracy {
                Some(acc) => println!(
                    "k-NN accuracy {:.2}% on {} held-out rows; model at {}",
                    acc * 100.0,
                    report.test_rows,
                    report.output.display()
                ),
                None => println!("k-NN model at {}", report.output.display()),
            }
        }
        Command::TrainMlp {
            epochs,
            batch_size,
            learning_rate,
            output,
        } => {
            if let Some(epochs) = epochs {
                settings.mlp.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                settings.mlp.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                settings.mlp.learning_rate = lr;
            }
            let output = output.unwrap_or_else(|| settings.mlp_export_dir());
            let report = train::train_mlp(&settings.data_dir, &settings.mlp, &output)?;
            match report.test_accuracy {
                Some(acc) => println!(
                    "test accuracy {:.2}% on {} rows; bundle at {}",
                    acc * 100.0,
                    report.test_rows,
                    report.export_dir.display()
                ),
                None => println!("bundle at {}", report.export_dir.display()),
            }
        }
        Command::Inspect => {
            for artifact in train::inspect(&settings.data_dir)? {
                println!(
                    "{:<16} {:?}  {}",
                    artifact.label,
                    artifact.shape,
                    artifact.path.display()
                );
            }
        }
        Command::PredictKnn {
            samples,
            model,
            raw,
        } => {
            let model = model.unwrap_or_else(|| settings.knn_output_path());
            for (row, label) in train::predict_knn(&model, &samples, !raw)?
                .into_iter()
                .enumerate()
            {
                println!("{row}: {label}");
            }
        }
    }

    Ok(())
}
