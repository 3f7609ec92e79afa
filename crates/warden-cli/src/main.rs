use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use warden_core::Embedding;

mod sync;

#[zbus::proxy(
    interface = "org.warden.Warden1",
    default_service = "org.warden.Warden1",
    default_path = "/org/warden/Warden1"
)]
trait Warden {
    fn enroll(&self, name: &str, embedding: &str) -> zbus::Result<String>;
    fn replace(&self, name: &str, embedding: &str) -> zbus::Result<String>;
    fn remove(&self, name: &str) -> zbus::Result<bool>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn list_unmatched(&self, order: &str) -> zbus::Result<String>;
    fn promote(&self, id: &str, name: &str) -> zbus::Result<String>;
    fn dismiss(&self, id: &str) -> zbus::Result<bool>;
    fn similar_unmatched(&self, id: &str, threshold: f64, limit: u32) -> zbus::Result<String>;
    fn rebuild_index(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "warden", about = "Warden face identity CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from a JSON embedding file
    Enroll {
        name: String,
        /// File holding a JSON array of numbers ("-" for stdin)
        embedding: PathBuf,
    },
    /// Remove an enrolled identity
    Remove { name: String },
    /// List enrolled identities
    List,
    /// Review faces that matched nobody
    Unmatched {
        #[command(subcommand)]
        action: UnmatchedAction,
    },
    /// Enroll every <Name>.json embedding file in a directory
    Sync {
        dir: PathBuf,
        /// Replace identities that are already enrolled
        #[arg(long)]
        force: bool,
    },
    /// Rebuild the candidate index
    Rebuild,
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum UnmatchedAction {
    /// List unmatched records
    List {
        /// occurrence_desc, last_seen_desc or first_seen_asc
        #[arg(long, default_value = "occurrence_desc")]
        order: String,
    },
    /// Enroll an unmatched record as a new identity
    Promote { id: String, name: String },
    /// Discard an unmatched record
    Dismiss { id: String },
    /// Find records that look like the given one
    Similar {
        id: String,
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = WardenProxy::new(&conn)
        .await
        .context("wardend is not reachable")?;

    match cli.command {
        Commands::Enroll { name, embedding } => {
            let values = read_embedding(&embedding)?;
            let reply = proxy.enroll(&name, &values).await?;
            print_json(&reply)?;
        }
        Commands::Remove { name } => {
            proxy.remove(&name).await?;
            println!("Removed {name}");
        }
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Unmatched { action } => match action {
            UnmatchedAction::List { order } => print_json(&proxy.list_unmatched(&order).await?)?,
            UnmatchedAction::Promote { id, name } => {
                print_json(&proxy.promote(&id, &name).await?)?;
            }
            UnmatchedAction::Dismiss { id } => {
                proxy.dismiss(&id).await?;
                println!("Dismissed {id}");
            }
            UnmatchedAction::Similar {
                id,
                threshold,
                limit,
            } => print_json(&proxy.similar_unmatched(&id, threshold, limit).await?)?,
        },
        Commands::Sync { dir, force } => run_sync(&proxy, &dir, force).await?,
        Commands::Rebuild => {
            let strategy: String = serde_json::from_str(&proxy.rebuild_index().await?)?;
            println!("Index rebuilt ({strategy})");
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

async fn run_sync(proxy: &WardenProxy<'_>, dir: &Path, force: bool) -> Result<()> {
    let enrolled: Vec<serde_json::Value> = serde_json::from_str(&proxy.list_identities().await?)?;
    let existing: HashSet<String> = enrolled
        .iter()
        .filter_map(|i| i["name"].as_str().map(str::to_string))
        .collect();

    let plan = sync::plan(dir, &existing, force)?;
    let mut summary = sync::Summary::default();
    for entry in plan {
        match entry {
            sync::Entry::Skip { name } => {
                println!("skip     {name} (already enrolled)");
                summary.skipped += 1;
            }
            sync::Entry::Invalid { path, reason } => {
                eprintln!("invalid  {}: {reason}", path.display());
                summary.failed += 1;
            }
            sync::Entry::Enroll {
                name,
                embedding,
                replace,
            } => {
                let embedding = embedding_json(&embedding)?;
                let reply = if replace {
                    proxy.replace(&name, &embedding).await
                } else {
                    proxy.enroll(&name, &embedding).await
                };
                match reply {
                    Ok(_) => {
                        println!("{} {name}", if replace { "replace " } else { "enroll  " });
                        summary.enrolled += 1;
                    }
                    Err(e) => {
                        eprintln!("failed   {name}: {e}");
                        summary.failed += 1;
                    }
                }
            }
        }
    }

    println!(
        "{} enrolled, {} skipped, {} failed",
        summary.enrolled, summary.skipped, summary.failed
    );
    if summary.failed > 0 {
        bail!("{} file(s) could not be synced", summary.failed);
    }
    Ok(())
}

fn read_embedding(path: &Path) -> Result<String> {
    let text = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    let values: Vec<f32> = serde_json::from_str(&text).context("embedding must be a JSON array")?;
    embedding_json(&Embedding::new(values)?)
}

fn embedding_json(embedding: &Embedding) -> Result<String> {
    Ok(serde_json::to_string(embedding)?)
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
