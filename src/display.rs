// Terminal output shared by the subcommands and the interactive menu:
// result listings, the queue table and indicatif progress bars.

use crate::archive::{ItemFile, SearchHit};
use crate::queue::{EntryStatus, QueueEntry};
use crate::transfer::TransferProgress;
use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};
use std::cell::RefCell;

/// Human readable byte count, e.g. `4.0 MB`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}

fn size_or_unknown(size: Option<u64>) -> String {
    size.map(format_size).unwrap_or_else(|| "?".into())
}

pub fn print_search_results(hits: &[SearchHit]) {
    println!("\nFound {} results:\n", hits.len());
    for (idx, hit) in hits.iter().enumerate() {
        println!("{}. {}", idx + 1, hit.title.clone().unwrap_or_else(|| "Unknown".into()).bold());
        println!("   ID: {}", hit.identifier);
        println!(
            "   Downloads: {} | Size: {}",
            hit.downloads.unwrap_or(0),
            size_or_unknown(hit.item_size)
        );
        println!("   URL: https://archive.org/details/{}\n", hit.identifier);
    }
}

/// `urls` pairs each file with its download URL.
pub fn print_files(files: &[ItemFile], urls: &[String]) {
    println!("\nFound {} files:\n", files.len());
    for (idx, (file, url)) in files.iter().zip(urls).enumerate() {
        println!("{}. {} ({})", idx + 1, file.filename, size_or_unknown(file.size));
        println!("   {}\n", url);
    }
}

fn status_icon(status: EntryStatus) -> String {
    match status {
        EntryStatus::Completed => "✓".green().to_string(),
        EntryStatus::Failed => "✗".red().to_string(),
        EntryStatus::Downloading => "↓".yellow().to_string(),
        EntryStatus::Pending => "⋯".to_string(),
    }
}

/// Display name of an entry: the override, else the URL's last segment.
pub fn entry_name(entry: &QueueEntry) -> String {
    entry
        .filename
        .clone()
        .or_else(|| crate::transfer::filename_from_url(&entry.url).ok())
        .unwrap_or_else(|| entry.url.clone())
}

pub fn print_queue(entries: &[QueueEntry]) {
    if entries.is_empty() {
        println!("Queue is empty");
        return;
    }
    println!("\nDownload Queue:");
    println!("{}", "-".repeat(80));
    for (idx, entry) in entries.iter().enumerate() {
        println!("{}. [{}] {}", idx + 1, status_icon(entry.status), entry_name(entry));
        println!(
            "   System: {} | Status: {} | Added: {}",
            entry.system,
            entry.status.as_str(),
            entry.added_at.format("%Y-%m-%d %H:%M")
        );
        println!("   URL: {}", entry.url);
        if let Some(err) = &entry.error {
            println!("   Error: {}", err.clone().red());
        }
    }
    println!("{}", "-".repeat(80));
}

/// indicatif bar per file: byte bar when the size is known, spinner otherwise.
#[derive(Default)]
pub struct BarProgress {
    bar: RefCell<Option<ProgressBar>>,
}

impl TransferProgress for BarProgress {
    fn begin(&self, label: &str, total: Option<u64>) {
        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::with_template(
                    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                ) {
                    bar.set_style(style.progress_chars("=> "));
                }
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {bytes}") {
                    bar.set_style(style);
                }
                bar.enable_steady_tick(std::time::Duration::from_millis(120));
                bar
            }
        };
        bar.set_message(label.to_string());
        *self.bar.borrow_mut() = Some(bar);
    }

    fn advance(&self, done: u64, total: Option<u64>) {
        if let Some(bar) = self.bar.borrow().as_ref() {
            if let Some(len) = total {
                if bar.length() != Some(len) {
                    bar.set_length(len);
                    if let Ok(style) = ProgressStyle::with_template(
                        "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                    ) {
                        bar.set_style(style.progress_chars("=> "));
                    }
                }
            }
            bar.set_position(done);
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.borrow_mut().take() {
            bar.finish_and_clear();
        }
    }
}
