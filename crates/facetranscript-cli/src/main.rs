use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetranscript::{open_user_database, CaptureOutcome, Config, FaceDatabase, FaceTrainer};
use facetranscript_core::{FaceDetector, StillImage};
use facetranscript_hw::Camera;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "facetranscript",
    version,
    about = "Capture a face from the camera and store it per user"
)]
struct Cli {
    /// TOML config file (also FACETRANSCRIPT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Table holding the users
    #[arg(long, global = true)]
    table: Option<String>,
    /// Haar cascade XML file
    #[arg(long, global = true)]
    cascade: Option<PathBuf>,
    /// V4L2 camera device
    #[arg(long, global = true)]
    device: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a face and store it for a new user
    Capture {
        user: String,
        /// Read frames from an image file instead of the camera
        #[arg(long)]
        from_image: Option<PathBuf>,
        /// Also write the face to <image-location>/<user>.jpg
        #[arg(long)]
        save_image: bool,
        #[arg(long)]
        image_location: Option<PathBuf>,
    },
    /// Store an image file for a new user as-is
    Import { user: String, image: PathBuf },
    /// List stored users
    List,
    /// Show one user, or write their image to a file
    Show {
        user: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a user
    Delete { user: String },
    /// Drop the whole user table
    Drop,
    /// Load every stored face as an RGB array
    Train,
    /// Run face detection on an image file
    Detect { image: PathBuf },
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(table) = cli.table {
        config.table_name = table;
    }
    if let Some(cascade) = cli.cascade {
        config.cascade_path = cascade;
    }
    if let Some(device) = cli.device {
        config.camera_device = device;
    }

    match cli.command {
        Commands::Capture {
            user,
            from_image,
            save_image,
            image_location,
        } => {
            if save_image {
                config.save_image = true;
            }
            if let Some(location) = image_location {
                config.image_location = location;
            }
            capture(config, user, from_image).await?;
        }
        Commands::Import { user, image } => {
            let store = open_user_database(&config)?;
            store
                .insert_user_image_file(&user, &image)
                .with_context(|| format!("failed to import {}", image.display()))?;
            println!("Stored {} for user {user}", image.display());
            store.close()?;
        }
        Commands::List => {
            let store = open_user_database(&config)?;
            let users: Vec<_> = store.all_users()?.iter().map(|u| u.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        Commands::Show { user, output } => {
            let store = open_user_database(&config)?;
            let Some(record) = store.get_user(&user)? else {
                bail!("no such user: {user}");
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, &record.user_image)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Wrote {} bytes to {}", record.user_image.len(), path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&record.summary())?),
            }
        }
        Commands::Delete { user } => {
            let store = open_user_database(&config)?;
            if store.delete_user(&user)? {
                println!("Deleted user {user}");
            } else {
                println!("No such user: {user}");
            }
        }
        Commands::Drop => {
            let store = open_user_database(&config)?;
            store.drop_table()?;
            println!("Dropped table {}", store.table_name());
        }
        Commands::Train => {
            let store = open_user_database(&config)?;
            let mut trainer = FaceTrainer::new();
            trainer.transform_all_faces(&store)?;
            let faces: Vec<_> = trainer
                .known_faces()
                .map(|(name, array)| json!({ "user_name": name, "shape": array.shape() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Detect { image } => {
            let detector = FaceDetector::load(&config.cascade_path, config.detector_params())
                .with_context(|| format!("failed to load {}", config.cascade_path.display()))?;
            let gray = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?
                .into_luma8();
            let faces = detector.detect(&gray);
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}\t{}\t{}\t{}", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

/// Run one capture on a blocking task while Ctrl-C flips the cancel flag.
async fn capture(config: Config, user: String, from_image: Option<PathBuf>) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("interrupt received, cancelling capture; press Ctrl-C again to abort");
            cancel.store(true, Ordering::Relaxed);
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Aborted");
                std::process::exit(130);
            }
        })
    };

    let task_user = user.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<CaptureOutcome> {
        let db = FaceDatabase::new(config)?;
        let outcome = match from_image {
            Some(path) => {
                let mut still = StillImage::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                db.take_photo_from(&task_user, &mut still, &cancel)?
            }
            None => db.take_photo(&task_user, &cancel)?,
        };
        db.close()?;
        Ok(outcome)
    })
    .await
    .context("capture task failed")??;
    watcher.abort();

    match outcome {
        CaptureOutcome::Captured(face) => {
            let report = json!({
                "user_name": user,
                "region": face.region,
                "bytes": face.jpeg.len(),
                "attempts": face.attempts,
                "saved_to": face.saved_to,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        CaptureOutcome::NoFace { attempts } => {
            bail!("no face detected after {attempts} attempts");
        }
        CaptureOutcome::Cancelled { attempts } => {
            println!("Capture cancelled after {attempts} attempts");
        }
    }
    Ok(())
}
