use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use siteflow::config::SiteflowConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "siteflow")]
#[command(version, about = "Construction-site coordination core")]
pub struct Cli {
    /// Path to the site store.
    #[arg(long, default_value = "siteflow.db", global = true)]
    pub db: PathBuf,

    /// Path to siteflow.toml. Defaults apply when absent.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or migrate the store and seed the phase catalog
    Init,
    /// Create a site
    SiteAdd {
        #[arg(long)]
        name: String,
        #[arg(long)]
        org: i64,
    },
    /// Create a lot within a site
    LotAdd {
        #[arg(long)]
        site: i64,
        #[arg(long)]
        number: String,
        /// Starting phase ordinal
        #[arg(long, default_value = "1")]
        phase: u32,
    },
    /// Post a message to a site's activity feed
    Post {
        #[arg(long)]
        site: i64,
        #[arg(long)]
        lot: Option<i64>,
        #[arg(long)]
        sender: i64,
        #[arg(long)]
        role: String,
        #[arg(long)]
        name: String,
        content: String,
    },
    /// Read back the most recent feed messages
    Messages {
        #[arg(long)]
        site: i64,
        #[arg(long)]
        lot: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run the mediation pipeline on a stored message
    Mediate {
        #[arg(long)]
        message: i64,
    },
    /// Attempt to advance a lot one phase
    Advance {
        #[arg(long)]
        lot: i64,
    },
    /// Show a lot's phase and gate status
    Status {
        #[arg(long)]
        lot: i64,
    },
    /// Open a blocking item on a lot phase
    Block {
        #[arg(long)]
        lot: i64,
        #[arg(long)]
        phase: u32,
        #[arg(long)]
        title: String,
    },
    /// Close a blocking item
    Resolve {
        #[arg(long)]
        item: i64,
    },
    /// Record a gate check result
    Gate {
        #[arg(long)]
        lot: i64,
        #[arg(long)]
        transition: String,
        #[arg(long)]
        status: String,
    },
    /// Material request lifecycle
    Material {
        #[command(subcommand)]
        command: MaterialCommands,
    },
    /// Register a push-capable device
    Device {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        app: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        disabled: bool,
    },
    /// Assign a user to a site (operator recipients)
    Assign {
        #[arg(long)]
        site: i64,
        #[arg(long)]
        user: i64,
        #[arg(long)]
        inactive: bool,
    },
    /// Record an organization membership (monitor/worker recipients)
    Member {
        #[arg(long)]
        org: i64,
        #[arg(long)]
        user: i64,
        #[arg(long)]
        role: String,
    },
    /// Offline queue operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
pub enum MaterialCommands {
    /// List a site's material requests
    List {
        #[arg(long)]
        site: i64,
    },
    /// Move a request through its lifecycle
    Set {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        status: String,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Capture a message post while offline
    Post {
        #[arg(long)]
        site: i64,
        #[arg(long)]
        lot: Option<i64>,
        #[arg(long)]
        sender: i64,
        #[arg(long)]
        role: String,
        #[arg(long)]
        name: String,
        content: String,
    },
    /// Capture a blocking-item close while offline
    CloseItem {
        #[arg(long)]
        item: i64,
    },
    /// Capture a material request while offline
    Material {
        #[arg(long)]
        site: i64,
        #[arg(long)]
        lot: Option<i64>,
        #[arg(long)]
        material: String,
        #[arg(long)]
        quantity: Option<f64>,
        #[arg(long)]
        unit: Option<String>,
        #[arg(long, default_value = "normal")]
        urgency: String,
    },
    /// Replay everything pending (one connectivity cycle)
    Flush,
    /// List pending items
    List,
    /// List items set aside after exhausting retries
    Quarantined,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "siteflow=debug" } else { "siteflow=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SiteflowConfig::load(cli.config.as_deref())?;

    if let Commands::Init = cli.command {
        return cmd::cmd_init(&cli.db);
    }

    let db = cmd::open_store(&cli.db)?;
    match cli.command {
        Commands::Init => unreachable!(),
        Commands::SiteAdd { name, org } => cmd::cmd_site_add(&db, name, org).await,
        Commands::LotAdd {
            site,
            number,
            phase,
        } => cmd::cmd_lot_add(&db, site, number, phase).await,
        Commands::Post {
            site,
            lot,
            sender,
            role,
            name,
            content,
        } => cmd::cmd_post(&db, &config, site, lot, sender, role, name, content).await,
        Commands::Messages { site, lot, limit } => {
            cmd::cmd_messages(&db, &config, site, lot, limit).await
        }
        Commands::Mediate { message } => cmd::cmd_mediate(&db, &config, message).await,
        Commands::Advance { lot } => cmd::cmd_advance(&db, lot).await,
        Commands::Status { lot } => cmd::cmd_status(&db, lot).await,
        Commands::Block { lot, phase, title } => cmd::cmd_block(&db, lot, phase, title).await,
        Commands::Resolve { item } => cmd::cmd_resolve(&db, item).await,
        Commands::Gate {
            lot,
            transition,
            status,
        } => cmd::cmd_gate(&db, lot, transition, status).await,
        Commands::Material { command } => match command {
            MaterialCommands::List { site } => cmd::cmd_material_list(&db, site).await,
            MaterialCommands::Set { id, status } => cmd::cmd_material_set(&db, id, status).await,
        },
        Commands::Device {
            user,
            app,
            token,
            disabled,
        } => cmd::cmd_device_register(&db, user, app, token, disabled).await,
        Commands::Assign {
            site,
            user,
            inactive,
        } => cmd::cmd_assign(&db, site, user, inactive).await,
        Commands::Member { org, user, role } => cmd::cmd_member(&db, org, user, role).await,
        Commands::Queue { command } => match command {
            QueueCommands::Post {
                site,
                lot,
                sender,
                role,
                name,
                content,
            } => cmd::cmd_queue_post(&db, &config, site, lot, sender, role, name, content).await,
            QueueCommands::CloseItem { item } => {
                cmd::cmd_queue_close_item(&db, &config, item).await
            }
            QueueCommands::Material {
                site,
                lot,
                material,
                quantity,
                unit,
                urgency,
            } => {
                cmd::cmd_queue_material(&db, &config, site, lot, material, quantity, unit, urgency)
                    .await
            }
            QueueCommands::Flush => cmd::cmd_queue_flush(&db, &config).await,
            QueueCommands::List => cmd::cmd_queue_list(&db, &config).await,
            QueueCommands::Quarantined => cmd::cmd_queue_quarantined(&db, &config).await,
        },
    }
}
