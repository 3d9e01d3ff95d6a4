//! railticket - download purchased MÁV rail tickets from the terminal.
//!
//! Logs in against the MÁV mobile service, keeps the session alive while
//! asked to, and fetches ticket lists and ticket images.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use railticket_core::auth::{
    AuthState, CredentialStore, PasswordVault, SessionEvent, SessionManager, SessionSnapshot,
    SessionStore,
};
use railticket_core::models::TicketRecord;
use railticket_core::{ApiClient, ApiError, Config, RateGovernor, Settings};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of ticket images fetched at once
const MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Password source for non-interactive use
const ENV_PASSWORD: &str = "RAILTICKET_PASSWORD";

#[derive(Parser)]
#[command(name = "railticket", version, about = "Download purchased MÁV rail tickets")]
struct Args {
    #[arg(long, global = true, value_name = "PATH", help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session
    Login {
        #[arg(short, long, help = "Account username (defaults to the last one used)")]
        username: Option<String>,

        #[arg(long, help = "Remember the password to renew the session silently")]
        remember: bool,
    },
    /// Forget the session and any remembered password
    Logout {
        #[arg(long, help = "Also delete the device secret from the keyring")]
        forget_device: bool,
    },
    /// Show the current session
    Status,
    /// List purchased tickets
    Tickets {
        #[arg(long, help = "Print JSON instead of a table")]
        json: bool,
    },
    /// Save one ticket image
    Image {
        document_id: String,

        #[arg(short, long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Save every ticket image
    Download {
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
    /// Keep the session alive until it ends or Ctrl-C
    Watch,
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let _guard = match init_tracing(args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

/// Print an error as `kind (status): message` when it came from the core.
fn report(error: &anyhow::Error) {
    match error.downcast_ref::<ApiError>() {
        Some(api) => {
            let kind = serde_json::to_value(api.kind())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            eprintln!("Error: {} ({}): {}", kind, api.status(), api);
        }
        None => eprintln!("Error: {:#}", error),
    }
}

// ============================================================================
// Wiring
// ============================================================================

async fn connect() -> Result<(SessionManager, mpsc::Receiver<SessionEvent>)> {
    let settings = Settings::from_env();
    debug!(
        max_requests = settings.governor.max_requests,
        window_secs = settings.governor.window.as_secs(),
        base_url = %settings.upstream.base_url,
        "Settings loaded"
    );

    let governor = Arc::new(RateGovernor::new(settings.governor));
    let client = ApiClient::new(settings.upstream.clone(), governor)?;
    let store = SessionStore::new(&Config::data_dir()?);
    let secret = CredentialStore::device_secret().with_context(|| {
        format!(
            "No usable keyring; set {} to a private value instead",
            railticket_core::auth::credentials::ENV_VAULT_KEY
        )
    })?;

    Ok(SessionManager::start(
        Arc::new(client),
        store,
        PasswordVault::new(secret),
        settings.session,
    )
    .await)
}

async fn run(command: Command) -> Result<()> {
    let (manager, events) = connect().await?;

    match command {
        Command::Login { username, remember } => login(&manager, username, remember).await,
        Command::Logout { forget_device } => logout(&manager, forget_device).await,
        Command::Status => {
            print_status(&manager.snapshot().await);
            Ok(())
        }
        Command::Tickets { json } => tickets(&manager, json).await,
        Command::Image { document_id, out } => {
            let path = save_image(&manager, &document_id, out.as_deref(), Path::new(".")).await?;
            println!("Saved {}", path.display());
            Ok(())
        }
        Command::Download { dir } => download(&manager, &dir).await,
        Command::Watch => watch(&manager, events).await,
    }
}

// ============================================================================
// Commands
// ============================================================================

fn prompt_username(default: Option<&str>) -> Result<String> {
    match default {
        Some(name) => print!("Username [{}]: ", name),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    let username = username.trim();
    Ok(match (username.is_empty(), default) {
        (true, Some(name)) => name.to_string(),
        _ => username.to_string(),
    })
}

fn prompt_password() -> Result<String> {
    if let Ok(password) = std::env::var(ENV_PASSWORD) {
        return Ok(password);
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

async fn login(manager: &SessionManager, username: Option<String>, remember: bool) -> Result<()> {
    let mut config = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });

    let username = match username {
        Some(name) => name,
        None => prompt_username(config.last_username.as_deref())?,
    };
    let password = prompt_password()?;
    let remember = remember || config.remember_by_default;

    let result = manager.login(&username, &password, remember).await?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Login successful!\n");
    print_status(&result.session);
    if remember && !result.session.remember_credential {
        println!("Note: the password could not be stored; the session will not renew itself.");
    }

    if !result.documents_to_accept.is_empty() {
        println!("\nDocuments awaiting acceptance:");
        for doc in &result.documents_to_accept {
            let version = doc.version.map(|v| format!(" v{}", v)).unwrap_or_default();
            let link = doc.html_url.as_deref().or(doc.pdf_url.as_deref()).unwrap_or("-");
            println!("  {}{}  {}", doc.code, version, link);
        }
    }
    Ok(())
}

async fn logout(manager: &SessionManager, forget_device: bool) -> Result<()> {
    manager.logout().await;
    println!("Logged out.");

    if forget_device {
        CredentialStore::delete_device_secret()?;
        println!("Device secret removed from the keyring.");
    }
    Ok(())
}

fn format_time(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_status(snapshot: &SessionSnapshot) {
    let state = match snapshot.state {
        AuthState::Unauthenticated => {
            println!("Not logged in.");
            return;
        }
        AuthState::Authenticated(freshness) => format!("{:?}", freshness).to_lowercase(),
    };

    println!("User:      {}", snapshot.username.as_deref().unwrap_or("-"));
    println!("Token:     {}", state);
    if let Some(expires_at) = snapshot.expires_at {
        println!("Expires:   {}", format_time(expires_at));
    }
    println!(
        "Renewal:   {}",
        if snapshot.remember_credential { "automatic" } else { "manual" }
    );
}

async fn tickets(manager: &SessionManager, json: bool) -> Result<()> {
    let tickets = manager.list_tickets().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tickets)?);
        return Ok(());
    }

    if tickets.is_empty() {
        println!("No tickets.");
        return Ok(());
    }

    for ticket in &tickets {
        print_ticket(ticket);
    }
    eprintln!("{} ticket(s)", tickets.len());
    Ok(())
}

fn print_ticket(ticket: &TicketRecord) {
    let valid = match (ticket.valid_from, ticket.valid_to) {
        (Some(from), Some(to)) => format!("{} - {}", format_time(from), format_time(to)),
        (Some(from), None) => format!("from {}", format_time(from)),
        _ => "-".to_string(),
    };
    println!(
        "{:<14} {:<30} {:<20} {}",
        ticket.document_id,
        ticket.ticket_name,
        ticket.passenger_name.as_deref().unwrap_or("-"),
        valid
    );
}

/// Fetch, decode and write one ticket image. Without `out` the file lands in
/// `dir` named after the document, with an extension matching its content.
async fn save_image(
    manager: &SessionManager,
    document_id: &str,
    out: Option<&Path>,
    dir: &Path,
) -> Result<PathBuf> {
    let image = manager.fetch_ticket_image(document_id).await?;
    let bytes = image.decode()?;

    let path = match out {
        Some(path) => path.to_path_buf(),
        None => {
            let ext = railticket_core::models::TicketImage::extension(&bytes);
            dir.join(format!("{}.{}", sanitize(&image.document_id), ext))
        }
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(document_id, path = %path.display(), bytes = bytes.len(), "Ticket image saved");
    Ok(path)
}

/// Keep document ids usable as file names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

async fn download(manager: &SessionManager, dir: &Path) -> Result<()> {
    let tickets = manager.list_tickets().await?;

    let mut document_ids: Vec<String> = Vec::new();
    for ticket in &tickets {
        if !document_ids.contains(&ticket.document_id) {
            document_ids.push(ticket.document_id.clone());
        }
    }

    if document_ids.is_empty() {
        println!("No tickets to download.");
        return Ok(());
    }

    info!(count = document_ids.len(), dir = %dir.display(), "Downloading ticket images");

    let results: Vec<(String, Result<PathBuf>)> = stream::iter(document_ids)
        .map(|id| async move {
            let result = save_image(manager, &id, None, dir).await;
            (id, result)
        })
        .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
        .collect()
        .await;

    let mut failed = 0;
    for (id, result) in &results {
        match result {
            Ok(path) => println!("Saved {}", path.display()),
            Err(e) => {
                failed += 1;
                eprintln!("Failed {}: {:#}", id, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} downloads failed", failed, results.len());
    }
    Ok(())
}

async fn watch(manager: &SessionManager, mut events: mpsc::Receiver<SessionEvent>) -> Result<()> {
    let snapshot = manager.snapshot().await;
    if !snapshot.is_authenticated {
        return Err(ApiError::Unauthorized.into());
    }
    print_status(&snapshot);
    if !snapshot.remember_credential {
        println!("The password is not remembered; the session ends when the token expires.");
    }
    println!("\nWatching session (Ctrl-C to stop)...");

    // The first check runs after one interval; catch an already stale token now
    manager.check_now().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Renewed { expires_at }) => {
                    println!("Session renewed, expires {}", format_time(expires_at));
                }
                Some(SessionEvent::LoginRequired { reason }) => {
                    anyhow::bail!("Login required: {}", reason);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }
    Ok(())
}
