// Interactive shell: a menu loop built on `dialoguer`. Each flow collects
// what it needs, calls into the archive client / orchestrator and reports
// failures on screen instead of leaving the loop.

use crate::archive::{self, ArchiveClient};
use crate::config::{ConnectionParams, Settings};
use crate::display::{self, BarProgress};
use crate::queue::QueueStore;
use crate::remote::{RemoteShell, SshSession};
use crate::transfer::{Orchestrator, TransferMode};
use anyhow::Result;
use crossterm::cursor::MoveTo;
use crossterm::terminal::{Clear, ClearType};
use dialoguer::{Confirm, Input, Password, Select};
use std::io::stdout;

/// Systems offered first when asking where a file should go.
const COMMON_SYSTEMS: &[&str] = &["mame", "fba", "neogeo"];

/// State carried between menu screens.
pub struct Shell {
    settings: Settings,
    archive: ArchiveClient,
    store: QueueStore,
    connection: Option<ConnectionParams>,
}

impl Shell {
    pub fn new(settings: Settings, archive: ArchiveClient, store: QueueStore) -> Self {
        let connection = settings.connection();
        Shell {
            settings,
            archive,
            store,
            connection,
        }
    }

    /// Main interactive menu. Runs until the user chooses "Exit".
    pub fn main_menu(&mut self) -> Result<()> {
        loop {
            print_header("Batocera Arcade Downloader");
            match &self.connection {
                Some(c) => println!("Cabinet: {}\n", c.address()),
                None => println!("No cabinet configured\n"),
            }
            let items = [
                "Setup cabinet connection",
                "Search for ROMs",
                "Manage download queue",
                "List cabinet systems",
                "Exit",
            ];
            let selection = Select::new().items(&items).default(0).interact()?;
            match selection {
                0 => self.setup_connection()?,
                1 => self.search_roms()?,
                2 => self.manage_queue()?,
                3 => self.list_systems()?,
                _ => break,
            }
        }
        println!("\nGoodbye!");
        Ok(())
    }

    fn setup_connection(&mut self) -> Result<()> {
        print_header("Cabinet Connection Setup");
        let current = self
            .connection
            .clone()
            .unwrap_or_else(|| ConnectionParams::new(""));
        let host: String = Input::new()
            .with_prompt("Cabinet IP address")
            .with_initial_text(current.host.clone())
            .interact_text()?;
        let username: String = Input::new()
            .with_prompt("Username")
            .default(current.username.clone())
            .interact_text()?;
        let password: String = Password::new()
            .with_prompt("Password (empty keeps current)")
            .allow_empty_password(true)
            .interact()?;
        let port: u16 = Input::new()
            .with_prompt("SSH port")
            .default(current.port)
            .interact_text()?;

        let params = ConnectionParams {
            host: host.trim().to_string(),
            username,
            password: if password.is_empty() {
                current.password
            } else {
                password
            },
            port,
        };

        println!("\nTesting connection...");
        match SshSession::connect(&params) {
            Ok(session) => {
                session.close();
                println!("✓ Connection successful!");
                self.connection = Some(params);
            }
            Err(e) => {
                println!("✗ {}", e);
                self.connection = None;
            }
        }
        pause()
    }

    fn search_roms(&mut self) -> Result<()> {
        print_header("Search archive.org for ROMs");
        let query: String = Input::new()
            .with_prompt("Search term")
            .allow_empty(true)
            .interact_text()?;
        if query.trim().is_empty() {
            return Ok(());
        }
        let max_results: usize = Input::new()
            .with_prompt("Max results")
            .default(20)
            .interact_text()?;

        println!("\nSearching for: {}...", query);
        let hits = match self.archive.search(&query, None, max_results) {
            Ok(hits) => hits,
            Err(e) => {
                println!("✗ {}", e);
                return pause();
            }
        };
        if hits.is_empty() {
            println!("No results found");
            return pause();
        }

        loop {
            print_header(&format!("Search Results: {}", query));
            let mut items: Vec<String> = hits
                .iter()
                .map(|h| {
                    format!(
                        "{} ({} downloads, {})",
                        h.title.as_deref().unwrap_or(&h.identifier),
                        h.downloads.unwrap_or(0),
                        h.item_size.map(display::format_size).unwrap_or_else(|| "?".into())
                    )
                })
                .collect();
            items.push("Back".into());
            let choice = Select::new()
                .with_prompt("Browse files in item")
                .items(&items)
                .default(0)
                .interact()?;
            if choice == hits.len() {
                break;
            }
            let identifier = hits[choice].identifier.clone();
            self.browse_item(&identifier)?;
        }
        Ok(())
    }

    fn browse_item(&mut self, identifier: &str) -> Result<()> {
        print_header(&format!("Browse: {}", identifier));
        println!("Loading files...");
        let files = match self.archive.browse(identifier) {
            Ok(files) => archive::rom_files(&files),
            Err(e) => {
                println!("✗ {}", e);
                return pause();
            }
        };
        if files.is_empty() {
            println!("No ROM files found");
            return pause();
        }

        loop {
            print_header(&format!("Files: {}", identifier));
            let mut items: Vec<String> = files
                .iter()
                .map(|f| {
                    format!(
                        "{} ({})",
                        f.filename,
                        f.size.map(display::format_size).unwrap_or_else(|| "?".into())
                    )
                })
                .collect();
            items.push("Back".into());
            let choice = Select::new()
                .with_prompt("Download or queue a file")
                .items(&items)
                .default(0)
                .interact()?;
            if choice == files.len() {
                break;
            }
            let file = &files[choice];
            let url = self.archive.download_url(identifier, &file.filename);
            let name = file.filename.rsplit('/').next().unwrap_or(&file.filename).to_string();
            self.download_menu(&url, &name)?;
        }
        Ok(())
    }

    fn download_menu(&mut self, url: &str, filename: &str) -> Result<()> {
        print_header(&format!("Download: {}", filename));
        println!("URL: {}\n", url);
        let items = ["Download now", "Add to queue", "Cancel"];
        match Select::new().items(&items).default(0).interact()? {
            0 => self.download_now(url, filename),
            1 => self.add_to_queue(url, Some(filename)),
            _ => Ok(()),
        }
    }

    fn download_now(&mut self, url: &str, filename: &str) -> Result<()> {
        let Some(params) = self.connection.clone() else {
            println!("\nPlease setup the cabinet connection first");
            return pause();
        };
        let system = ask_system()?;
        let local = Confirm::new()
            .with_prompt("Stage the file on this machine first?")
            .default(false)
            .interact()?;
        let mode = if local {
            TransferMode::Local
        } else {
            TransferMode::Direct
        };

        println!("\nConnecting to cabinet...");
        match SshSession::connect(&params) {
            Ok(mut session) => {
                let progress = BarProgress::default();
                let orch = Orchestrator::new(&self.settings.roms_root, &self.archive, &progress);
                match orch.download(url, &system, Some(filename), &mut session, mode) {
                    Ok(dest) => println!("✓ Downloaded to {}", dest),
                    Err(e) => println!("✗ Download failed: {}", e),
                }
                session.close();
            }
            Err(e) => println!("✗ {}", e),
        }
        pause()
    }

    fn add_to_queue(&mut self, url: &str, filename: Option<&str>) -> Result<()> {
        let system = ask_system()?;
        match self.store.add(url, &system, filename) {
            Ok(entry) => println!("✓ Added to queue: {}", display::entry_name(entry)),
            Err(e) => println!("✗ {}", e),
        }
        pause()
    }

    fn manage_queue(&mut self) -> Result<()> {
        loop {
            print_header("Download Queue");
            display::print_queue(self.store.list());
            let items = [
                "Add to queue manually",
                "Process queue",
                "Clear finished entries",
                "Back to main menu",
            ];
            match Select::new().items(&items).default(0).interact()? {
                0 => self.add_to_queue_manual()?,
                1 => self.process_queue()?,
                2 => {
                    match self.store.clear() {
                        Ok(n) => println!("✓ Cleared {} finished entries", n),
                        Err(e) => println!("✗ {}", e),
                    }
                    pause()?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn add_to_queue_manual(&mut self) -> Result<()> {
        print_header("Add to Queue");
        let url: String = Input::new()
            .with_prompt("Download URL")
            .allow_empty(true)
            .interact_text()?;
        if url.trim().is_empty() {
            return Ok(());
        }
        let filename: String = Input::new()
            .with_prompt("Filename (optional)")
            .allow_empty(true)
            .interact_text()?;
        let filename = Some(filename.trim()).filter(|f| !f.is_empty());
        self.add_to_queue(&url, filename)
    }

    fn process_queue(&mut self) -> Result<()> {
        let Some(params) = self.connection.clone() else {
            println!("\nPlease setup the cabinet connection first");
            return pause();
        };
        let pending = self.store.pending_indices().len();
        if pending == 0 {
            println!("\nNo pending downloads in queue");
            return pause();
        }
        println!("\nProcessing {} downloads...", pending);

        match SshSession::connect(&params) {
            Ok(mut session) => {
                let progress = BarProgress::default();
                let orch = Orchestrator::new(&self.settings.roms_root, &self.archive, &progress);
                match orch.process(&mut self.store, &mut session, TransferMode::Direct) {
                    Ok(summary) => println!(
                        "✓ Queue processed: {} completed, {} failed",
                        summary.completed, summary.failed
                    ),
                    Err(e) => println!("✗ {}", e),
                }
                session.close();
            }
            Err(e) => println!("✗ {}", e),
        }
        pause()
    }

    fn list_systems(&mut self) -> Result<()> {
        let Some(params) = self.connection.clone() else {
            println!("\nPlease setup the cabinet connection first");
            return pause();
        };
        print_header("Cabinet Systems");
        println!("Connecting to cabinet...");
        match SshSession::connect(&params) {
            Ok(mut session) => {
                match session.list_directory(&self.settings.roms_root) {
                    Ok(systems) => {
                        println!("\nAvailable systems:\n");
                        for system in systems {
                            println!("  - {}", system);
                        }
                    }
                    Err(e) => println!("✗ {}", e),
                }
                session.close();
            }
            Err(e) => println!("✗ {}", e),
        }
        pause()
    }
}

/// Pick a target system from the common ones or type another.
fn ask_system() -> Result<String> {
    let mut items: Vec<&str> = COMMON_SYSTEMS.to_vec();
    items.push("Other...");
    let choice = Select::new()
        .with_prompt("Target system")
        .items(&items)
        .default(0)
        .interact()?;
    if choice < COMMON_SYSTEMS.len() {
        return Ok(COMMON_SYSTEMS[choice].to_string());
    }
    let system: String = Input::new().with_prompt("System directory").interact_text()?;
    Ok(system.trim().to_string())
}

fn print_header(title: &str) {
    let _ = crossterm::execute!(stdout(), Clear(ClearType::All), MoveTo(0, 0));
    println!("{}", "=".repeat(60));
    println!("  {}", title);
    println!("{}", "=".repeat(60));
    println!();
}

fn pause() -> Result<()> {
    let _: String = Input::new()
        .with_prompt("Press Enter to continue")
        .allow_empty(true)
        .interact_text()?;
    Ok(())
}
