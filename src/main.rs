use faceunlock::camera::V4l2Camera;
use faceunlock::core::{EmbeddingMatcher, FaceDetector, UnlockController};
use faceunlock::storage::{FilesystemReferenceStore, ReferenceStore};
use faceunlock::Config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceunlock")]
#[command(about = "Presence-gated face unlock")]
struct Cli {
    /// Enable development mode (verbose logs, references under ./dev_data)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the system or local one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one unlock session for a user
    Unlock {
        #[arg(short, long)]
        username: String,
    },
    /// List capture devices and flag likely IR cameras
    ListCameras,
    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    match cli.command {
        Commands::Unlock { username } => {
            let config = load_config(cli.config.as_ref())?;
            let verified = unlock(&config, &username, cli.dev).await?;
            if !verified {
                std::process::exit(1);
            }
        }
        Commands::ListCameras => {
            let cameras = V4l2Camera::list_cameras()?;
            if cameras.is_empty() {
                println!("No cameras found. Check /dev/video* permissions.");
                return Ok(());
            }

            for camera in &cameras {
                let marker = if camera.likely_ir { " (likely IR)" } else { "" };
                println!("/dev/video{}: {}{}", camera.index, camera.name, marker);
                println!("   formats: {}", camera.formats.join(", "));
            }
            if let Some(ir) = cameras.iter().find(|c| c.likely_ir) {
                println!("\nAuto-detect (device_index = 999) would use /dev/video{}", ir.index);
            }
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            println!("Configuration OK");
            println!("   camera: index {} at {}x{}", config.camera.device_index, config.camera.width, config.camera.height);
            println!("   detector model: {}", config.models.detector_path.display());
            println!("   recognizer model: {}", config.models.recognizer_path.display());
            println!(
                "   unlock: presence >= {}, match >= {}, dwell {}, timeout {} ms",
                config.unlock.presence_threshold,
                config.unlock.match_threshold,
                config.unlock.dwell_count,
                config.unlock.session_timeout_ms
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

async fn unlock(config: &Config, username: &str, dev_mode: bool) -> Result<bool> {
    let store = FilesystemReferenceStore::from_config(&config.storage, dev_mode)?;
    let reference = store
        .fetch(username)
        .with_context(|| format!("No usable reference for {} in {}", username, store.data_dir().display()))?;

    // Model loading is slow; keep it off the runtime threads.
    let model_config = config.clone();
    let (detector, matcher) = tokio::task::spawn_blocking(move || -> faceunlock::Result<_> {
        let detector = Arc::new(FaceDetector::new(&model_config)?);
        let matcher = EmbeddingMatcher::new(&model_config, detector.clone())?;
        Ok((detector, matcher))
    })
    .await??;

    let controller = UnlockController::new(
        Arc::new(V4l2Camera::new(&config.camera)),
        detector,
        Arc::new(matcher),
    );

    let session = controller.start_unlock(config.unlock.clone(), reference)?;
    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    println!("Look at the camera...");
    let outcome = session.run().await;
    println!("{}", outcome);
    Ok(outcome.is_verified())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
