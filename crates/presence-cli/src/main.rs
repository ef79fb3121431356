use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "presence", about = "Face-match attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or replace) a person's reference face
    Register {
        /// Person identifier
        #[arg(short, long)]
        user: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Reference image file
        image: PathBuf,
    },
    /// Remove a registered person and their attendance history
    Remove {
        /// Person identifier
        user: String,
    },
    /// List registered people
    List,
    /// Verify a claimed identity and mark attendance
    Verify {
        #[arg(short, long)]
        user: String,
        /// Captured image file
        image: PathBuf,
    },
    /// Identify a face against everyone registered and mark attendance
    Kiosk {
        /// Captured image file
        image: PathBuf,
    },
    /// Withdraw a person's attendance so they can be marked again
    Unmark {
        #[arg(short, long)]
        user: String,
        /// Day to withdraw (YYYY-MM-DD); today if omitted
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Change the status of a person's attendance record
    Correct {
        #[arg(short, long)]
        user: String,
        /// New status: present or late
        status: String,
        /// Day to correct (YYYY-MM-DD); today if omitted
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show today's attendance
    Today,
    /// Show a person's attendance history
    History {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value_t = 30)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.presence.Presence1",
    default_service = "org.presence.Presence1",
    default_path = "/org/presence/Presence1"
)]
trait Presence {
    async fn register(&self, user: &str, name: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn remove(&self, user: &str) -> zbus::Result<bool>;
    async fn list(&self) -> zbus::Result<String>;
    async fn verify_and_mark(&self, user: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn kiosk_mark(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn unmark(&self, user: &str, date: &str) -> zbus::Result<bool>;
    async fn correct(&self, user: &str, date: &str, status: &str) -> zbus::Result<String>;
    async fn today(&self) -> zbus::Result<String>;
    async fn history(&self, user: &str, limit: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply, falling back to the raw string.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{raw}"),
        },
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = PresenceProxy::new(&conn)
        .await
        .context("presenced is not reachable")?;

    match cli.command {
        Commands::Register { user, name, image } => {
            let bytes = read_image(&image)?;
            tracing::debug!(user, bytes = bytes.len(), "registering");
            print_json(&proxy.register(&user, &name, bytes).await?);
        }
        Commands::Remove { user } => {
            if proxy.remove(&user).await? {
                println!("Removed {user}");
            } else {
                println!("{user} is not registered");
            }
        }
        Commands::List => print_json(&proxy.list().await?),
        Commands::Verify { user, image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.verify_and_mark(&user, bytes).await?);
        }
        Commands::Kiosk { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.kiosk_mark(bytes).await?);
        }
        Commands::Unmark { user, date } => {
            let date = date.unwrap_or_default();
            if proxy.unmark(&user, &date).await? {
                println!("Withdrew attendance for {user}");
            } else {
                println!("{user} has no attendance to withdraw");
            }
        }
        Commands::Correct { user, status, date } => {
            let date = date.unwrap_or_default();
            let reply = proxy.correct(&user, &date, &status).await?;
            if reply == "null" {
                println!("{user} has no attendance to correct");
            } else {
                print_json(&reply);
            }
        }
        Commands::Today => print_json(&proxy.today().await?),
        Commands::History { user, limit } => {
            print_json(&proxy.history(&user, limit).await?);
        }
        Commands::Status => print_json(&proxy.status().await?),
    }

    Ok(())
}
