use capillary_client::api::{ApiClient, AuthorizedApi, Credentials, ExaminationApi, Page, Session};
use capillary_client::camera::manager::CameraManager;
use capillary_client::camera::{CameraBackend, CameraHandle, DeviceMatcher};
use capillary_client::channel::{self, device_endpoint};
use capillary_client::config::{Settings, UserConfig};
use capillary_client::runner::{SessionCommand, spawn_session};
use capillary_client::session::{CaptureSession, NoticeLevel, SessionSnapshot};
use capillary_client::{OurError, OurResult};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "capillary-client")]
#[command(about = "Capillaroscopy capture workstation client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Args)]
struct Login {
    /// API username, defaults to the last one used
    #[arg(long)]
    username: Option<String>,
    /// API password
    #[arg(long)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover cameras and show which one would be used
    Cameras,
    /// Capture a single still to a JPEG file
    Capture {
        /// Output file
        #[arg(short, long, default_value = "capture.jpg")]
        output: PathBuf,
        /// Camera id, overrides auto-selection
        #[arg(long)]
        device: Option<String>,
    },
    /// Interactive capture session against the device endpoint
    Session {
        #[command(flatten)]
        login: Login,
        /// Examination photos are attached to by `analyze`
        #[arg(long)]
        examination: Option<String>,
    },
    /// List patients
    Patients {
        #[command(flatten)]
        login: Login,
        #[arg(long, default_value = "10")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },
    /// List examinations
    Examinations {
        #[command(flatten)]
        login: Login,
        /// Only examinations of this patient
        #[arg(long)]
        patient: Option<String>,
        #[arg(long, default_value = "10")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
    },
    /// Show the report of an examination
    Report {
        #[command(flatten)]
        login: Login,
        #[arg(long)]
        examination: String,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show configuration
    Show,
    /// Remember a camera to use when no microscope is recognised
    SetCamera {
        /// Camera id as listed by `cameras`
        device_id: String,
    },
    /// Reset the persisted user configuration
    Reset,
}

#[tokio::main]
async fn main() -> OurResult<()> {
    let cli = Cli::parse();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let debug = cli.debug || settings.debug;
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| OurError::App(format!("Failed to set tracing subscriber: {e}")))?;

    if debug {
        debug!("Debug mode enabled");
    }

    match cli.command {
        Commands::Cameras => handle_cameras(&settings).await,
        Commands::Capture { output, device } => handle_capture(&settings, output, device).await,
        Commands::Session { login, examination } => {
            run_session(&settings, login, examination).await
        }
        Commands::Patients {
            login,
            limit,
            offset,
        } => {
            let (client, session) = login_with(&settings, login).await?;
            let patients = client.list_patients(&session, Page { limit, offset }).await?;
            for patient in patients {
                let born = patient
                    .date_of_birth
                    .map(|date| date.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {} {}  {born}",
                    patient.id, patient.last_name, patient.first_name
                );
            }
            session.logout();
            Ok(())
        }
        Commands::Examinations {
            login,
            patient,
            limit,
            offset,
        } => {
            let (client, session) = login_with(&settings, login).await?;
            let examinations = match patient {
                Some(patient_id) => client.patient_examinations(&session, &patient_id).await?,
                None => {
                    client
                        .list_examinations(&session, Page { limit, offset })
                        .await?
                }
            };
            for examination in examinations {
                let photos = examination.images.as_ref().map_or(0, Vec::len);
                println!(
                    "{}  patient {}  {}  {photos} photo(s)  {}",
                    examination.id,
                    examination.patient_id,
                    examination.status,
                    examination.description
                );
            }
            session.logout();
            Ok(())
        }
        Commands::Report { login, examination } => {
            let (client, session) = login_with(&settings, login).await?;
            let report = client.examination_report(&session, &examination).await?;
            println!("{}", report.title);
            println!();
            println!("Summary: {}", report.summary);
            println!("Diagnosis: {}", report.diagnosis);
            println!("Recommendations: {}", report.recommendations);
            if !report.content.is_empty() {
                println!();
                println!("{}", report.content);
            }
            session.logout();
            Ok(())
        }
        Commands::Config { action } => handle_config_command(action, &settings),
    }
}

#[cfg(feature = "native-camera")]
fn camera_backend() -> OurResult<Box<dyn CameraBackend>> {
    Ok(Box::new(capillary_client::camera::native::NativeBackend::new()))
}

#[cfg(not(feature = "native-camera"))]
fn camera_backend() -> OurResult<Box<dyn CameraBackend>> {
    Err(OurError::Camera(
        "Built without the native-camera feature".to_string(),
    ))
}

fn spawn_camera(settings: &Settings) -> OurResult<CameraHandle> {
    CameraManager::spawn(
        camera_backend()?,
        DeviceMatcher::from_labels(settings.microscope_labels.as_slice()),
        settings.jpeg_quality,
    )
}

async fn handle_cameras(settings: &Settings) -> OurResult<()> {
    let camera = spawn_camera(settings)?;
    camera.request_permission().await?;
    let discovery = camera.enumerate().await?;

    if discovery.devices.is_empty() {
        println!("No cameras found");
        return Ok(());
    }

    for device in &discovery.devices {
        let marker = if discovery.selected.as_deref() == Some(device.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{marker} {}  {}", device.id, device.label);
    }
    if let Some(microscope) = discovery.microscope {
        println!("Microscope detected: {}", microscope.label);
    }
    Ok(())
}

async fn handle_capture(
    settings: &Settings,
    output: PathBuf,
    device: Option<String>,
) -> OurResult<()> {
    let camera = spawn_camera(settings)?;
    camera.request_permission().await?;
    let discovery = camera.enumerate().await?;

    let device = device.or_else(|| {
        if discovery.microscope.is_some() {
            return None;
        }
        Settings::load_user_config()
            .preferred_camera
            .filter(|id| discovery.devices.iter().any(|device| device.id == *id))
    });

    let device_id = camera.start(device).await?;
    let frame = camera.capture().await;
    if let Err(e) = camera.stop().await {
        warn!("Failed to release camera {device_id}: {e}");
    }
    let frame = frame?;

    tokio::fs::write(&output, &frame.jpeg).await?;
    println!(
        "Saved {}x{} still from camera {device_id} to {}",
        frame.width,
        frame.height,
        output.display()
    );
    Ok(())
}

/// Log in with the given or remembered username
async fn login_with(settings: &Settings, login: Login) -> OurResult<(ApiClient, Session)> {
    let mut user_config = Settings::load_user_config();
    let username = login
        .username
        .or_else(|| user_config.last_username.clone())
        .ok_or_else(|| OurError::App("--username is required".to_string()))?;
    let password = login
        .password
        .ok_or_else(|| OurError::App("--password is required".to_string()))?;

    let client = ApiClient::new(&settings.api_base_url, settings.request_timeout)?;
    let session = client
        .login(&Credentials {
            username: username.clone(),
            password,
        })
        .await?;

    if user_config.last_username.as_deref() != Some(username.as_str()) {
        user_config.last_username = Some(username);
        if let Err(e) = Settings::save_user_config(&user_config) {
            warn!("Failed to remember username: {e}");
        }
    }
    Ok((client, session))
}

const SESSION_HELP: &str = "\
Commands:
  status               show connection, camera and selection
  photos               list device photos
  log                  show recent events
  cameras              discover cameras again
  select <id>          use another camera
  start | stop         start or stop the local camera
  photo                capture a still and store it on the device
  refresh              reload the photo list
  stream-on | stream-off
                       start or stop the device stream
  delete <filename>    delete a photo on the device
  pick <filename>      toggle a photo in the selection
  analyze [exam id]    attach selected photos and start analysis
  quit";

async fn run_session(
    settings: &Settings,
    login: Login,
    examination: Option<String>,
) -> OurResult<()> {
    let wants_login = login.username.is_some() || login.password.is_some();
    let api: Option<Arc<dyn ExaminationApi>> = if wants_login {
        let (client, session) = login_with(settings, login).await?;
        info!("Logged in as {}", session.user().username);
        Some(Arc::new(AuthorizedApi { client, session }))
    } else {
        None
    };

    let endpoint = device_endpoint(&settings.device_base_url)?;
    let camera = spawn_camera(settings)?;
    let (channel, notifications) = channel::connect(endpoint, settings.reconnect);
    let session = CaptureSession::new(channel, camera, settings.log_capacity);
    let runtime = spawn_session(session, notifications, api);

    let mut notices = runtime.notices;
    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let level = match notice.level {
                NoticeLevel::Success => "ok",
                NoticeLevel::Info => "info",
                NoticeLevel::Warning => "warning",
                NoticeLevel::Error => "error",
            };
            println!("[{level}] {}", notice.message);
        }
    });

    let handle = runtime.handle;
    let mut user_config = Settings::load_user_config();
    handle
        .execute(SessionCommand::DiscoverCameras {
            preferred: user_config.preferred_camera.clone(),
        })
        .await?;
    println!("{SESSION_HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            continue;
        };
        let argument = words.next().map(str::to_string);

        let command = match (verb, argument) {
            ("quit" | "exit", _) => break,
            ("help", _) => {
                println!("{SESSION_HELP}");
                continue;
            }
            ("status", _) => {
                print_status(&handle.snapshot());
                continue;
            }
            ("photos", _) => {
                print_photos(&handle.snapshot());
                continue;
            }
            ("log", _) => {
                for entry in handle.snapshot().log {
                    println!("  {entry}");
                }
                continue;
            }
            ("cameras", _) => SessionCommand::DiscoverCameras {
                preferred: user_config.preferred_camera.clone(),
            },
            ("select", Some(device_id)) => {
                user_config.preferred_camera = Some(device_id.clone());
                if let Err(e) = Settings::save_user_config(&user_config) {
                    warn!("Failed to remember camera: {e}");
                }
                SessionCommand::SelectCamera(device_id)
            }
            ("start", _) => SessionCommand::StartCamera,
            ("stop", _) => SessionCommand::StopCamera,
            ("photo", _) => SessionCommand::TakePhoto,
            ("refresh", _) => SessionCommand::RefreshPhotos,
            ("stream-on", _) => SessionCommand::StartDeviceStream,
            ("stream-off", _) => SessionCommand::StopDeviceStream,
            ("delete", Some(filename)) => SessionCommand::DeletePhoto(filename),
            ("pick", Some(filename)) => SessionCommand::ToggleSelection(filename),
            ("analyze", argument) => match argument.or_else(|| examination.clone()) {
                Some(examination_id) => SessionCommand::AttachAndAnalyze { examination_id },
                None => {
                    println!("Which examination? Use `analyze <id>` or --examination");
                    continue;
                }
            },
            _ => {
                println!("Unknown command, type `help`");
                continue;
            }
        };

        if let Err(e) = handle.execute(command).await {
            warn!("{e}");
            break;
        }
    }

    handle.shutdown();
    if let Err(e) = runtime.task.await {
        warn!("Session task failed: {e}");
    }
    if let Err(e) = printer.await {
        debug!("Notice printer stopped: {e}");
    }
    Ok(())
}

fn print_status(snapshot: &SessionSnapshot) {
    println!("Device: {}", snapshot.channel);
    match &snapshot.selected_camera {
        Some(selected) => {
            let label = snapshot
                .cameras
                .iter()
                .find(|device| device.id == *selected)
                .map_or("unknown", |device| device.label.as_str());
            let state = if snapshot.streaming { "streaming" } else { "idle" };
            println!("Camera: {selected} {label} ({state})");
        }
        None => println!("Camera: none selected"),
    }
    println!(
        "Photos: {}, selected: {}",
        snapshot.photos.len(),
        snapshot.selection.join(", ")
    );
}

fn print_photos(snapshot: &SessionSnapshot) {
    if snapshot.photos.is_empty() {
        println!("No photos on the device");
    }
    for photo in &snapshot.photos {
        let marker = if snapshot.selection.contains(&photo.filename) {
            "*"
        } else {
            " "
        };
        let taken = photo
            .timestamp
            .map(|timestamp| timestamp.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("{marker} {}  {taken}", photo.filename);
    }
}

fn handle_config_command(action: ConfigAction, settings: &Settings) -> OurResult<()> {
    match action {
        ConfigAction::Show => {
            let user_config = Settings::load_user_config();
            println!("Configuration:");
            println!("  Device URL: {}", settings.device_base_url);
            println!("  API URL: {}", settings.api_base_url);
            println!("  JPEG quality: {}", settings.jpeg_quality);
            println!("  Request timeout: {:?}", settings.request_timeout);
            println!(
                "  Reconnect: {} attempts, {:?} to {:?}",
                settings.reconnect.max_attempts,
                settings.reconnect.initial_delay,
                settings.reconnect.max_delay
            );
            println!("  Microscope labels: {}", settings.microscope_labels.join(", "));
            println!("  Log capacity: {}", settings.log_capacity);
            println!("  Debug: {}", settings.debug);
            println!("User config ({}):", Settings::get_config_path().display());
            println!(
                "  Preferred camera: {}",
                user_config.preferred_camera.as_deref().unwrap_or("-")
            );
            println!(
                "  Last username: {}",
                user_config.last_username.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        ConfigAction::SetCamera { device_id } => {
            let mut user_config = Settings::load_user_config();
            user_config.preferred_camera = Some(device_id);
            Settings::save_user_config(&user_config)?;
            println!("Preferred camera saved");
            Ok(())
        }
        ConfigAction::Reset => {
            Settings::save_user_config(&UserConfig::default())?;
            println!("User configuration reset");
            Ok(())
        }
    }
}
