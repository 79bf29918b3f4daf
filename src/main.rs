use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use miette::Result;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use perimeter_deterrent::classifier::ConfiguredClassifierLoader;
use perimeter_deterrent::config::Config;
use perimeter_deterrent::error::DeterrentError;
use perimeter_deterrent::messages::StopAck;
use perimeter_deterrent::services::{EmailService, SMTP_PRESETS};
use perimeter_deterrent::source::{check_device, FfmpegSourceProvider};
use perimeter_deterrent::store::SqliteStore;
use perimeter_deterrent::supervisor::{shutdown_runtime, DetectionSupervisor, StartRequest};

#[derive(Parser)]
#[command(
    version,
    about = "Farm perimeter animal detection and deterrent",
    long_about = None,
    name = "Perimeter Deterrent"
)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Model file, overrides [detection].model_path
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Camera index, overrides [detection].camera_index
    #[arg(short, long)]
    device: Option<u32>,

    /// Visible sender address for this run's emails
    #[arg(long)]
    sender: Option<String>,

    /// Recipient address for this run's emails
    #[arg(long)]
    recipient: Option<String>,

    /// Stop when `q` is entered on stdin
    #[arg(short, long)]
    interactive: bool,

    /// Check the [email] settings and send a test message, then exit
    #[arg(long, conflicts_with = "test_camera")]
    test_email: bool,

    /// Open and release the camera, then exit
    #[arg(long)]
    test_camera: bool,
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        warn!("{} not found, using default configuration", path.display());
        Ok(Config::default())
    }
}

/// Plain thread, since a pending tokio stdin read holds up runtime shutdown.
fn spawn_quit_listener() -> oneshot::Receiver<()> {
    let (quit_tx, quit_rx) = oneshot::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                    let _ = quit_tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    error!("Could not read stdin: {}", err);
                    return;
                }
            }
        }
    });
    quit_rx
}

fn test_camera(config: &Config, device_index: u32) -> Result<()> {
    println!("Testing camera {}...", device_index);
    let provider = FfmpegSourceProvider::new(config.camera.clone());
    match check_device(&provider, device_index) {
        Ok(()) => {
            println!("Camera is working!");
            Ok(())
        }
        Err(err) => {
            println!("Camera not accessible");
            Err(err.into())
        }
    }
}

async fn test_email(config: &Config, recipient: Option<String>) -> Result<()> {
    let service = EmailService::new(config.email.clone(), config.detection.location.clone())
        .with_recipient_override(recipient);

    println!("Email configuration test");
    println!("  smtp_server: {}:{}", config.email.smtp_server, config.email.smtp_port);
    println!("  sender_email: {}", config.email.sender_email);
    println!("  sender_password: {}", service.masked_password());
    println!("  recipient_email: {}", service.recipient());

    match service.send_test().await {
        Ok(()) => {
            println!("Test email sent. Check your inbox at {}", service.recipient());
            println!("(Check the spam folder if you don't see it)");
            Ok(())
        }
        Err(err) => {
            if matches!(err, DeterrentError::SmtpError(ref smtp) if smtp.is_permanent()) {
                println!("Authentication failed. Gmail and Yahoo need an App Password.");
            }
            println!("Common SMTP servers:");
            for (provider, server, port, note) in SMTP_PRESETS {
                println!("  {}: {}:{} ({})", provider, server, port, note);
            }
            Err(err.into())
        }
    }
}

async fn run(args: Args, config: Arc<Config>) -> Result<()> {
    let store = Arc::new(SqliteStore::open(&config.database.path)?);
    let supervisor = DetectionSupervisor::new(
        config.clone(),
        store,
        Arc::new(ConfiguredClassifierLoader::new(
            config.classifier.clone(),
            (config.detection.frame_width, config.detection.frame_height),
        )),
        Arc::new(FfmpegSourceProvider::new(config.camera.clone())),
    );

    let mut request = StartRequest::from_config(&config)
        .with_sender(args.sender)
        .with_recipient(args.recipient);
    if let Some(model) = args.model {
        request.model_path = model;
    }
    if let Some(device) = args.device {
        request.device_index = device;
    }

    let mut handle = supervisor.start(request).await?;

    let quit = if args.interactive {
        info!("Type q and press Enter to stop");
        Some(spawn_quit_listener())
    } else {
        info!("Press Ctrl+C to stop");
        None
    };
    let quit = async move {
        match quit {
            Some(quit) => {
                // stdin closed without a `q`: keep waiting for Ctrl+C
                if quit.await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!("Unable to listen for shutdown signal: {}", err);
            }
            info!("Received Ctrl+C, stopping detection");
        }
        _ = quit => info!("Quit requested, stopping detection"),
        state = handle.wait_terminal() => info!("Detection loop ended ({})", state),
    }

    match supervisor.stop(&handle).await {
        StopAck::Stopped(summary) => {
            println!("Detection stopped");
            println!("Total frames processed: {}", summary.frames_processed);
            println!("Total alerts sent: {}", summary.alerts_triggered);
        }
        StopAck::Abandoned => warn!("Detection loop did not stop in time"),
        StopAck::NotRunning => info!("Detection loop was not running"),
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perimeter_deterrent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(load_config(&args.config)?);

    if args.test_camera {
        let device_index = args.device.unwrap_or(config.detection.camera_index);
        return test_camera(&config, device_index);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(DeterrentError::from)?;

    let outcome = if args.test_email {
        runtime.block_on(test_email(&config, args.recipient))
    } else {
        runtime.block_on(run(args, config.clone()))
    };

    // An abandoned loop thread may still be blocked in a read; do not wait on it.
    shutdown_runtime(runtime, config.supervisor.dispatch_grace());
    info!("Application shutdown complete.");
    outcome
}
