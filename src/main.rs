// Entrypoint for the CLI application.
// - Parses arguments, resolves settings and dispatches to a subcommand.
// - Returns `anyhow::Result` so any unhandled failure exits non-zero.

use anyhow::{bail, Context, Result};
use cabinet_loader::archive::{self, ArchiveClient};
use cabinet_loader::config::{ConnectionParams, Settings};
use cabinet_loader::display::{self, BarProgress};
use cabinet_loader::queue::QueueStore;
use cabinet_loader::remote::{RemoteShell, SshSession};
use cabinet_loader::transfer::{Orchestrator, TransferMode};
use cabinet_loader::ui::Shell;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Search archive.org and load arcade ROMs onto a Batocera cabinet.
#[derive(Parser)]
#[command(name = "cabinet-loader", version, about)]
struct Cli {
    #[command(flatten)]
    conn: ConnArgs,

    /// Cabinet directory holding one folder per system.
    #[arg(long, global = true)]
    roms_root: Option<String>,

    /// Queue file location.
    #[arg(long, global = true)]
    queue_file: Option<PathBuf>,

    /// Log progress details to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Connection overrides; unset flags fall back to the `BATOCERA_*`
/// environment variables, then the stock Batocera credentials.
#[derive(Args)]
struct ConnArgs {
    /// Cabinet IP address or hostname.
    #[arg(long, global = true)]
    host: Option<String>,

    /// SSH username [default: root].
    #[arg(long, global = true)]
    username: Option<String>,

    /// SSH password [default: linux].
    #[arg(long, global = true)]
    password: Option<String>,

    /// SSH port [default: 22].
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search archive.org for ROMs.
    Search {
        query: String,

        /// Search this collection instead of the arcade set.
        #[arg(long)]
        collection: Option<String>,

        #[arg(long, default_value_t = 20)]
        max_results: usize,
    },

    /// List the files of an archive.org item.
    Browse {
        identifier: String,

        /// Show every file, not just ROM-like ones.
        #[arg(long)]
        all: bool,
    },

    /// Download one file onto the cabinet.
    Download {
        #[command(flatten)]
        target: TargetArgs,

        /// Download here first, then upload over SCP.
        #[arg(long)]
        local: bool,
    },

    /// List the system folders on the cabinet.
    ListSystems,

    /// Manage the download queue.
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Menu-driven interactive mode.
    Interactive,
}

#[derive(Args)]
struct TargetArgs {
    /// Download URL.
    #[arg(long)]
    url: String,

    /// Target system, e.g. mame, fba, neogeo.
    #[arg(long)]
    system: String,

    /// Remote file name (defaults to the URL's last segment).
    #[arg(long)]
    filename: Option<String>,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Add a download to the queue.
    Add {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show the queue.
    List,
    /// Download every pending entry.
    Process {
        /// Download here first, then upload over SCP.
        #[arg(long)]
        local: bool,
    },
    /// Remove completed and failed entries.
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "cabinet_loader=info"
    } else {
        "cabinet_loader=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = resolve_settings(&cli);
    let Some(command) = cli.command else {
        return run_interactive(settings);
    };

    match command {
        Commands::Search {
            query,
            collection,
            max_results,
        } => search(&settings, &query, collection.as_deref(), max_results),
        Commands::Browse { identifier, all } => browse(&settings, &identifier, all),
        Commands::Download { target, local } => download(&settings, &target, mode(local)),
        Commands::ListSystems => list_systems(&settings),
        Commands::Queue(cmd) => queue(&settings, cmd),
        Commands::Interactive => run_interactive(settings),
    }
}

fn resolve_settings(cli: &Cli) -> Settings {
    let mut settings = Settings::from_env();
    if let Some(host) = &cli.conn.host {
        settings.host = Some(host.clone());
    }
    if let Some(username) = &cli.conn.username {
        settings.username = username.clone();
    }
    if let Some(password) = &cli.conn.password {
        settings.password = password.clone();
    }
    if let Some(port) = cli.conn.port {
        settings.port = port;
    }
    if let Some(root) = &cli.roms_root {
        settings.roms_root = root.clone();
    }
    if let Some(path) = &cli.queue_file {
        settings.queue_path = path.clone();
    }
    settings
}

fn mode(local: bool) -> TransferMode {
    if local {
        TransferMode::Local
    } else {
        TransferMode::Direct
    }
}

fn archive_client(settings: &Settings) -> Result<ArchiveClient> {
    ArchiveClient::new(&settings.archive_url).context("Failed to build archive client")
}

fn connection(settings: &Settings) -> Result<ConnectionParams> {
    match settings.connection() {
        Some(params) => Ok(params),
        None => bail!("--host is required for this command"),
    }
}

fn connect(settings: &Settings) -> Result<SshSession> {
    let params = connection(settings)?;
    let session = SshSession::connect(&params)
        .with_context(|| format!("Could not connect to cabinet at {}", params.address()))?;
    println!("✓ Connected to cabinet at {}", params.host);
    Ok(session)
}

fn search(settings: &Settings, query: &str, collection: Option<&str>, max: usize) -> Result<()> {
    println!("Searching archive.org for: {}", query);
    let hits = archive_client(settings)?
        .search(query, collection, max)
        .context("Search failed")?;
    if hits.is_empty() {
        println!("No results found");
    } else {
        display::print_search_results(&hits);
    }
    Ok(())
}

fn browse(settings: &Settings, identifier: &str, all: bool) -> Result<()> {
    println!("Browsing files for: {}", identifier);
    let client = archive_client(settings)?;
    let mut files = client.browse(identifier).context("Browse failed")?;
    if !all {
        files = archive::rom_files(&files);
    }
    if files.is_empty() {
        println!("No files found");
        return Ok(());
    }
    let urls: Vec<String> = files
        .iter()
        .map(|f| client.download_url(identifier, &f.filename))
        .collect();
    display::print_files(&files, &urls);
    Ok(())
}

fn download(settings: &Settings, target: &TargetArgs, mode: TransferMode) -> Result<()> {
    let client = archive_client(settings)?;
    let mut session = connect(settings)?;
    let progress = BarProgress::default();
    let orch = Orchestrator::new(&settings.roms_root, &client, &progress);
    let result = orch.download(
        &target.url,
        &target.system,
        target.filename.as_deref(),
        &mut session,
        mode,
    );
    session.close();
    let dest = result.context("Download failed")?;
    println!("✓ Downloaded to {}", dest);
    Ok(())
}

fn list_systems(settings: &Settings) -> Result<()> {
    let mut session = connect(settings)?;
    let systems = session.list_directory(&settings.roms_root);
    session.close();
    println!("\nAvailable systems on cabinet:");
    for system in systems.context("Could not list systems")? {
        println!("  - {}", system);
    }
    Ok(())
}

fn queue(settings: &Settings, cmd: QueueCommands) -> Result<()> {
    let mut store = QueueStore::load(&settings.queue_path).context("Could not load queue")?;
    match cmd {
        QueueCommands::Add { target } => {
            let entry = store
                .add(&target.url, &target.system, target.filename.as_deref())
                .context("Could not add to queue")?;
            println!("✓ Added to queue: {}", display::entry_name(entry));
        }
        QueueCommands::List => display::print_queue(store.list()),
        QueueCommands::Clear => {
            let removed = store.clear().context("Could not clear queue")?;
            println!("✓ Cleared {} finished entries", removed);
        }
        QueueCommands::Process { local } => {
            let pending = store.pending_indices().len();
            if pending == 0 {
                println!("No pending downloads in queue");
                return Ok(());
            }
            let client = archive_client(settings)?;
            let mut session = connect(settings)?;
            println!("\nProcessing {} downloads...", pending);
            let progress = BarProgress::default();
            let orch = Orchestrator::new(&settings.roms_root, &client, &progress);
            let result = orch.process(&mut store, &mut session, mode(local));
            session.close();
            let summary = result.context("Queue processing aborted")?;
            println!(
                "\n✓ Queue processing complete: {} completed, {} failed",
                summary.completed, summary.failed
            );
        }
    }
    Ok(())
}

fn run_interactive(settings: Settings) -> Result<()> {
    let client = archive_client(&settings)?;
    let store = QueueStore::load(&settings.queue_path).context("Could not load queue")?;
    Shell::new(settings, client, store).main_menu()
}
