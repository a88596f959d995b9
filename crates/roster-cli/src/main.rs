use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod import;

// `#[zbus::proxy]` generates `RosterProxy` (async) and `RosterProxyBlocking`.
#[zbus::proxy(
    interface = "io.sovren.Roster1",
    default_service = "io.sovren.Roster1",
    default_path = "/io/sovren/Roster1"
)]
trait Roster {
    async fn enroll(
        &self,
        id: &str,
        name: &str,
        attributes: &HashMap<String, String>,
        image_path: &str,
    ) -> zbus::Result<String>;
    async fn enroll_embedding(
        &self,
        id: &str,
        name: &str,
        attributes: &HashMap<String, String>,
        embedding: &[f64],
    ) -> zbus::Result<String>;
    async fn recognize(&self, image_path: &str) -> zbus::Result<String>;
    async fn capture_attendance(&self, image_path: &str, action: &str) -> zbus::Result<String>;
    async fn log_attendance(&self, id: &str, action: &str) -> zbus::Result<String>;
    async fn attendance(&self, id: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "roster", about = "Roster face-recognition attendance CLI")]
struct Cli {
    /// Talk to rosterd on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    CheckIn,
    CheckOut,
}

impl ActionArg {
    fn wire_name(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from a face photo
    Enroll {
        /// Unique identity id (e.g., employee number)
        id: String,
        /// Photo containing exactly the person's face
        image: PathBuf,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Extra profile attribute, repeatable (e.g., -a age=31 -a department=ops)
        #[arg(short = 'a', long = "attr", value_parser = parse_key_val)]
        attributes: Vec<(String, String)>,
    },
    /// Identify the person in a photo
    Recognize { image: PathBuf },
    /// Identify the person in a photo and log their attendance
    Capture {
        image: PathBuf,
        #[arg(value_enum)]
        action: ActionArg,
    },
    /// Check an enrolled person in by id
    CheckIn { id: String },
    /// Check an enrolled person out by id
    CheckOut { id: String },
    /// Show attendance state and history for a person
    History { id: String },
    /// List enrolled people
    List,
    /// Show daemon status
    Status,
    /// Import a legacy FaceRecords/ directory (details.json + embedding.json per person)
    Import {
        dir: PathBuf,
        /// Only report what would be imported
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// The daemon resolves paths on its own filesystem view, so send absolute ones.
fn absolute(image: &Path) -> Result<String> {
    let path = std::fs::canonicalize(image)
        .with_context(|| format!("cannot read image {}", image.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Import can be previewed without a daemon.
    if let Commands::Import { dir, dry_run: true } = &cli.command {
        let scan = import::scan_face_records(dir)
            .with_context(|| format!("reading {}", dir.display()))?;
        for entry in &scan.entries {
            println!(
                "would import {} ({}, {}-dim)",
                entry.id,
                entry.profile.display_name,
                entry.embedding.dim()
            );
        }
        for (folder, reason) in &scan.skipped {
            println!("skip {}: {reason}", folder.display());
        }
        return Ok(());
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RosterProxy::new(&conn)
        .await
        .context("rosterd is not reachable")?;

    match cli.command {
        Commands::Enroll {
            id,
            image,
            name,
            attributes,
        } => {
            let attributes: HashMap<String, String> = attributes.into_iter().collect();
            let reply = proxy
                .enroll(&id, &name, &attributes, &absolute(&image)?)
                .await?;
            print_json(&reply);
        }
        Commands::Recognize { image } => {
            print_json(&proxy.recognize(&absolute(&image)?).await?);
        }
        Commands::Capture { image, action } => {
            let reply = proxy
                .capture_attendance(&absolute(&image)?, action.wire_name())
                .await?;
            print_json(&reply);
        }
        Commands::CheckIn { id } => {
            print_json(&proxy.log_attendance(&id, ActionArg::CheckIn.wire_name()).await?);
        }
        Commands::CheckOut { id } => {
            print_json(&proxy.log_attendance(&id, ActionArg::CheckOut.wire_name()).await?);
        }
        Commands::History { id } => {
            print_json(&proxy.attendance(&id).await?);
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?);
        }
        Commands::Status => {
            print_json(&proxy.status().await?);
        }
        Commands::Import { dir, .. } => {
            let scan = import::scan_face_records(&dir)
                .with_context(|| format!("reading {}", dir.display()))?;
            let mut imported = 0usize;
            let mut failed = scan.skipped.len();
            for entry in scan.entries {
                let attributes: HashMap<String, String> =
                    entry.profile.attributes.into_iter().collect();
                match proxy
                    .enroll_embedding(
                        &entry.id,
                        &entry.profile.display_name,
                        &attributes,
                        &entry.embedding.values,
                    )
                    .await
                {
                    Ok(_) => {
                        println!("imported {}", entry.id);
                        imported += 1;
                    }
                    Err(e) => {
                        // Keep going: a duplicate or bad vector should not abort the batch.
                        println!("failed {}: {e}", entry.id);
                        failed += 1;
                    }
                }
            }
            println!("{imported} imported, {failed} skipped or failed");
        }
    }

    Ok(())
}
