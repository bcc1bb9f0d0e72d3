use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::Roster;
use rollcall_hw::{Camera, CaptureFormat};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall employee recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a recognition session
    Start {
        /// Return right after starting instead of following the session
        #[arg(long)]
        no_wait: bool,
    },
    /// Stop the running session
    Stop,
    /// Show daemon status
    Status,
    /// Print status changes until interrupted
    Watch,
    /// Show the employee roster
    Roster {
        /// Roster TOML (defaults to ROLLCALL_ROSTER, then the built-in roster)
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Base directory for relative image paths
        #[arg(long, env = "ROLLCALL_REFERENCE_DIR", default_value = "labeled_images")]
        reference_dir: PathBuf,
    },
    /// Run camera diagnostics
    Test {
        /// V4L2 device to open
        #[arg(short, long, env = "ROLLCALL_CAMERA_DEVICE", default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as a PNG
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn start_recognition(&self) -> zbus::Result<String>;
    async fn stop_recognition(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn roster(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { no_wait } => {
            let proxy = connect().await?;
            let started: Value = serde_json::from_str(&proxy.start_recognition().await?)?;
            let session = started["session"].as_u64();
            print_line(&started);
            if !no_wait {
                follow(&proxy, session).await?;
            }
        }
        Commands::Stop => {
            let proxy = connect().await?;
            if proxy.stop_recognition().await? {
                println!("Recognition stopped");
            } else {
                println!("No recognition running");
            }
        }
        Commands::Status => {
            let proxy = connect().await?;
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch => {
            let proxy = connect().await?;
            tokio::select! {
                res = watch(&proxy) => res?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Commands::Roster {
            file,
            reference_dir,
        } => {
            let file = file.or_else(|| std::env::var_os("ROLLCALL_ROSTER").map(PathBuf::from));
            let roster = Roster::resolve(file.as_deref(), &reference_dir)?;
            for entry in &roster.employees {
                let marker = if entry.image.exists() { "" } else { "  (missing)" };
                println!("{:<24} {}{marker}", entry.name, entry.image.display());
            }
            println!("{} employees, key {}", roster.len(), roster.content_key());

            // The daemon only knows descriptors after its first session.
            if let Ok(proxy) = connect().await {
                if let Ok(json) = proxy.roster().await {
                    println!("daemon label sets: {json}");
                }
            }
        }
        Commands::Test { device, save } => camera_test(&device, save)?,
    }

    Ok(())
}

async fn connect() -> Result<RollcallProxy<'static>> {
    let conn = match std::env::var("ROLLCALL_BUS").as_deref() {
        Ok("system") => zbus::Connection::system().await,
        _ => zbus::Connection::session().await,
    }
    .context("cannot connect to D-Bus")?;
    RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn print_line(status: &Value) {
    match status["status_line"].as_str() {
        Some("") | None => {}
        Some(line) => println!("{line}"),
    }
}

/// Poll until `session` ends, printing status-line changes.
/// Fails when the session timed out.
async fn follow(proxy: &RollcallProxy<'_>, session: Option<u64>) -> Result<()> {
    let mut last_line = String::new();
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let status: Value = serde_json::from_str(&proxy.status().await?)?;
        if status["session"].as_u64() != session {
            bail!("session was superseded");
        }

        let line = status["status_line"].as_str().unwrap_or_default();
        if line != last_line {
            print_line(&status);
            last_line = line.to_string();
        }

        if status["recognition_active"].as_bool() == Some(true) {
            continue;
        }
        return match status["phase"].as_str() {
            Some("timed_out") => {
                let alert = status["last_alert"].as_str().unwrap_or("recognition timed out");
                bail!("{alert}")
            }
            Some("stopped") => {
                println!("Recognition stopped");
                Ok(())
            }
            _ => Ok(()),
        };
    }
}

async fn watch(proxy: &RollcallProxy<'_>) -> Result<()> {
    let mut last: Option<(String, String)> = None;
    let mut alerts = 0;
    loop {
        let status: Value = serde_json::from_str(&proxy.status().await?)?;
        let phase = status["phase"].as_str().unwrap_or_default().to_string();
        let line = status["status_line"].as_str().unwrap_or_default().to_string();
        let current = Some((phase.clone(), line.clone()));
        if current != last {
            println!("[{phase}] {line}");
            last = current;
        }

        let count = status["alert_count"].as_u64().unwrap_or(0);
        if count > alerts {
            if let Some(alert) = status["last_alert"].as_str() {
                println!("ALERT: {alert}");
            }
            alerts = count;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn camera_test(device: &str, save: Option<PathBuf>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("{}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let camera = Camera::open(device, CaptureFormat::default())
        .with_context(|| format!("opening {device}"))?;
    println!(
        "Opened {} at {}x{} ({})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    let frame = camera.capture_frame()?;
    println!(
        "Frame {}: brightness {:.1}{}",
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark { " (dark)" } else { "" }
    );

    if let Some(path) = save {
        let img = frame.to_image().context("frame buffer has the wrong size")?;
        img.save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("saving {}", path.display()))?;
        println!("Saved preview to {}", path.display());
    }
    Ok(())
}
