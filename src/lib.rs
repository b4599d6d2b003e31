// Library root
// -----------
// This crate exposes the pieces the CLI (`main.rs`) is built from.
//
// Module responsibilities:
// - `archive`: archive.org search / item listing and plain HTTP fetches.
// - `remote`: SSH session to the Batocera cabinet (commands, SCP upload).
// - `queue`: the persisted download queue.
// - `transfer`: moves files onto the cabinet and updates queue entries.
// - `config`, `error`: settings and the shared error type.
// - `display`, `ui`: terminal output and the interactive menu.
pub mod archive;
pub mod config;
pub mod display;
pub mod error;
pub mod queue;
pub mod remote;
pub mod transfer;
pub mod ui;
