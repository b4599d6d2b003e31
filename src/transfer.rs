// Download orchestration: resolve where a file goes on the cabinet, move it
// there (cabinet-side wget or local fetch + SCP), and keep the queue entry's
// status in step.

use crate::error::{Error, Result};
use crate::queue::{check_path_component, EntryStatus, QueueEntry, QueueStore};
use crate::remote::RemoteShell;
use std::io::Write;

/// How bytes reach the cabinet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// The cabinet downloads the URL itself.
    Direct,
    /// Download here first, then upload over SCP.
    Local,
}

/// Plain HTTP download used by local mode.
pub trait Fetcher {
    /// Stream `url` into `out`, reporting `(bytes_so_far, total)`.
    fn fetch(
        &self,
        url: &str,
        out: &mut dyn Write,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64>;
}

/// Receives progress for each file moved.
pub trait TransferProgress {
    fn begin(&self, label: &str, total: Option<u64>);
    fn advance(&self, done: u64, total: Option<u64>);
    fn finish(&self);
}

/// Discards all progress.
pub struct NoProgress;

impl TransferProgress for NoProgress {
    fn begin(&self, _: &str, _: Option<u64>) {}
    fn advance(&self, _: u64, _: Option<u64>) {}
    fn finish(&self) {}
}

/// `<roms-root>/<system>` on the cabinet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub dir: String,
}

impl RemoteTarget {
    pub fn resolve(roms_root: &str, system: &str) -> Self {
        RemoteTarget {
            dir: format!("{}/{}", roms_root.trim_end_matches('/'), system),
        }
    }

    pub fn file(&self, filename: &str) -> String {
        format!("{}/{}", self.dir, filename)
    }
}

/// Final path segment of `url`, percent-decoded.
pub fn filename_from_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::InvalidEntry(format!("invalid url '{}': {}", url, e)))?;
    let segment = parsed
        .path_segments()
        .and_then(|mut segs| segs.next_back())
        .unwrap_or("");
    let name = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    check_path_component("filename", &name).map_err(|_| {
        Error::InvalidEntry(format!("cannot derive a file name from '{}'", url))
    })?;
    Ok(name)
}

/// Tally of one `process` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Moves files onto the cabinet.
pub struct Orchestrator<'a> {
    roms_root: String,
    fetcher: &'a dyn Fetcher,
    progress: &'a dyn TransferProgress,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        roms_root: &str,
        fetcher: &'a dyn Fetcher,
        progress: &'a dyn TransferProgress,
    ) -> Self {
        Orchestrator {
            roms_root: roms_root.to_string(),
            fetcher,
            progress,
        }
    }

    /// Put the file described by `entry` on the cabinet and record the
    /// outcome on the entry. Every failure is recorded; only a lost
    /// connection is also returned, since nothing after it can succeed.
    pub fn fulfil(
        &self,
        entry: &mut QueueEntry,
        session: &mut dyn RemoteShell,
        mode: TransferMode,
    ) -> Result<()> {
        match self.transfer(entry, session, mode) {
            Ok(dest) => {
                tracing::info!(url = %entry.url, %dest, "download completed");
                entry.mark_completed();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %entry.url, "download failed: {}", e);
                entry.mark_failed(e.reason());
                if e.is_connection() {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// One-off download that never touches the queue.
    pub fn download(
        &self,
        url: &str,
        system: &str,
        filename: Option<&str>,
        session: &mut dyn RemoteShell,
        mode: TransferMode,
    ) -> Result<String> {
        let entry = QueueEntry::new(url, system, filename)?;
        self.transfer(&entry, session, mode)
    }

    /// Work through every `pending` entry in order on one shared session,
    /// persisting after each status change. Queue-file errors and a lost
    /// connection abort the pass; entries not yet reached stay `pending`.
    pub fn process(
        &self,
        store: &mut QueueStore,
        session: &mut dyn RemoteShell,
        mode: TransferMode,
    ) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        for index in store.pending_indices() {
            let Some(mut entry) = store.get(index).cloned() else {
                continue;
            };
            if entry.status != EntryStatus::Pending {
                continue;
            }
            store.update(index, |e| e.mark_downloading())?;
            entry.mark_downloading();

            let outcome = self.fulfil(&mut entry, session, mode);
            match entry.status {
                EntryStatus::Completed => summary.completed += 1,
                _ => summary.failed += 1,
            }
            store.update(index, |e| *e = entry)?;
            outcome?;
        }
        Ok(summary)
    }

    /// Returns the remote path written.
    fn transfer(
        &self,
        entry: &QueueEntry,
        session: &mut dyn RemoteShell,
        mode: TransferMode,
    ) -> Result<String> {
        // Entries loaded from disk skipped `QueueEntry::new`, so check again.
        check_path_component("system", &entry.system)?;
        let target = RemoteTarget::resolve(&self.roms_root, &entry.system);
        session.ensure_directory(&target.dir)?;

        let filename = match &entry.filename {
            Some(name) => {
                check_path_component("filename", name)?;
                name.clone()
            }
            None => filename_from_url(&entry.url)?,
        };
        let dest = target.file(&filename);

        match mode {
            TransferMode::Direct => {
                self.progress.begin(&filename, None);
                let result = session.download_remote(&entry.url, &dest);
                self.progress.finish();
                result?;
            }
            TransferMode::Local => self.stage_and_upload(&entry.url, &filename, &dest, session)?,
        }
        Ok(dest)
    }

    // The temp file is removed when `staged` drops, on every path out.
    fn stage_and_upload(
        &self,
        url: &str,
        filename: &str,
        dest: &str,
        session: &mut dyn RemoteShell,
    ) -> Result<()> {
        let mut staged = tempfile::Builder::new()
            .prefix("cabinet-loader-")
            .tempfile()
            .map_err(|e| Error::Transfer(format!("cannot create temporary file: {}", e)))?;

        self.progress.begin(&format!("fetch {}", filename), None);
        let fetched = self.fetcher.fetch(url, staged.as_file_mut(), &mut |done, total| {
            self.progress.advance(done, total)
        });
        self.progress.finish();
        let bytes = fetched?;
        tracing::debug!(url, bytes, path = %staged.path().display(), "staged locally");

        self.progress.begin(&format!("upload {}", filename), Some(bytes));
        let uploaded = session.upload_file(staged.path(), dest, &mut |sent, total| {
            self.progress.advance(sent, Some(total))
        });
        self.progress.finish();
        uploaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandOutput;
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    /// Cabinet double: records commands, fails wget for URLs listed in
    /// `wget_failures`, optionally fails every upload.
    #[derive(Default)]
    struct FakeCabinet {
        commands: Vec<String>,
        wget_failures: Vec<(String, String)>,
        fail_uploads: bool,
        uploads: Vec<(PathBuf, String, Vec<u8>)>,
    }

    impl RemoteShell for FakeCabinet {
        fn run(&mut self, command: &str) -> Result<CommandOutput> {
            self.commands.push(command.to_string());
            if command.starts_with("wget") {
                for (url, message) in &self.wget_failures {
                    if command.contains(url.as_str()) {
                        return Ok(CommandOutput {
                            stdout: format!("{}\n", message),
                            stderr: String::new(),
                            exit_code: 1,
                        });
                    }
                }
            }
            Ok(CommandOutput::default())
        }

        fn upload_file(
            &mut self,
            local: &Path,
            dest: &str,
            progress: &mut dyn FnMut(u64, u64),
        ) -> Result<()> {
            let bytes = std::fs::read(local).unwrap();
            self.uploads.push((local.to_path_buf(), dest.to_string(), bytes.clone()));
            if self.fail_uploads {
                progress(1, bytes.len() as u64);
                return Err(Error::Transfer("connection reset".into()));
            }
            progress(bytes.len() as u64, bytes.len() as u64);
            Ok(())
        }
    }

    /// Serves fixed bytes, or fails when `fail` is set.
    struct FakeFetcher {
        body: Vec<u8>,
        fail: bool,
        calls: RefCell<Vec<String>>,
    }

    impl FakeFetcher {
        fn serving(body: &[u8]) -> Self {
            FakeFetcher {
                body: body.to_vec(),
                fail: false,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Fetcher for FakeFetcher {
        fn fetch(
            &self,
            url: &str,
            out: &mut dyn Write,
            progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> Result<u64> {
            self.calls.borrow_mut().push(url.to_string());
            if self.fail {
                return Err(Error::Network("connection refused".into()));
            }
            out.write_all(&self.body).unwrap();
            progress(self.body.len() as u64, Some(self.body.len() as u64));
            Ok(self.body.len() as u64)
        }
    }

    fn store_with(dir: &Path, urls: &[&str]) -> QueueStore {
        let mut store = QueueStore::load(dir.join("queue.json")).unwrap();
        for url in urls {
            store.add(url, "mame", None).unwrap();
        }
        store
    }

    #[test]
    fn direct_success_completes_entry() {
        let dir = tempdir().unwrap();
        let mut store = store_with(dir.path(), &["https://archive.org/x/a.zip"]);
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list()[0].status, EntryStatus::Pending);

        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let summary = orch.process(&mut store, &mut cabinet, TransferMode::Direct).unwrap();

        assert_eq!(summary, ProcessSummary { completed: 1, failed: 0 });
        let entry = &store.list()[0];
        assert_eq!(entry.status, EntryStatus::Completed);
        assert!(entry.completed_at.is_some());
        assert!(entry.error.is_none());
        assert_eq!(
            cabinet.commands,
            [
                "mkdir -p '/userdata/roms/mame'",
                "wget -O '/userdata/roms/mame/a.zip' 'https://archive.org/x/a.zip' 2>&1",
            ]
        );
        assert!(fetcher.calls.borrow().is_empty());
        // persisted
        let reloaded = QueueStore::load(dir.path().join("queue.json")).unwrap();
        assert_eq!(reloaded.list()[0].status, EntryStatus::Completed);
    }

    #[test]
    fn remote_failure_is_recorded_and_pass_continues() {
        let dir = tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            &[
                "https://archive.org/x/a.zip",
                "https://archive.org/x/b.zip",
                "https://archive.org/x/c.zip",
            ],
        );
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet {
            wget_failures: vec![("https://archive.org/x/a.zip".into(), "disk full".into())],
            ..FakeCabinet::default()
        };

        let summary = orch.process(&mut store, &mut cabinet, TransferMode::Direct).unwrap();

        assert_eq!(summary, ProcessSummary { completed: 2, failed: 1 });
        let first = &store.list()[0];
        assert_eq!(first.status, EntryStatus::Failed);
        assert_eq!(first.error.as_deref(), Some("disk full"));
        assert!(store.list()[1..].iter().all(|e| e.status == EntryStatus::Completed));
        let wgets = cabinet.commands.iter().filter(|c| c.starts_with("wget")).count();
        assert_eq!(wgets, 3);
    }

    #[test]
    fn process_only_touches_pending_entries() {
        let dir = tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            &[
                "https://archive.org/x/done.zip",
                "https://archive.org/x/broken.zip",
                "https://archive.org/x/busy.zip",
                "https://archive.org/x/new.zip",
            ],
        );
        store.update(0, |e| e.mark_completed()).unwrap();
        store.update(1, |e| e.mark_failed("earlier failure")).unwrap();
        store.update(2, |e| e.mark_downloading()).unwrap();
        let before = store.list()[..3].to_vec();

        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let summary = orch.process(&mut store, &mut cabinet, TransferMode::Direct).unwrap();

        assert_eq!(summary, ProcessSummary { completed: 1, failed: 0 });
        assert_eq!(&store.list()[..3], before.as_slice());
        assert_eq!(store.list()[3].status, EntryStatus::Completed);
        let wgets: Vec<_> = cabinet.commands.iter().filter(|c| c.starts_with("wget")).collect();
        assert_eq!(wgets.len(), 1);
        assert!(wgets[0].contains("new.zip"));

        // a second pass has nothing left to do
        let again = orch.process(&mut store, &mut cabinet, TransferMode::Direct).unwrap();
        assert_eq!(again, ProcessSummary::default());
    }

    #[test]
    fn local_mode_uploads_staged_file() {
        let fetcher = FakeFetcher::serving(b"ROMDATA");
        let orch = Orchestrator::new("/userdata/roms/", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let mut entry = QueueEntry::new("https://archive.org/x/mslug.zip", "neogeo", None).unwrap();

        orch.fulfil(&mut entry, &mut cabinet, TransferMode::Local).unwrap();

        assert_eq!(entry.status, EntryStatus::Completed);
        let (local, dest, bytes) = &cabinet.uploads[0];
        assert_eq!(dest, "/userdata/roms/neogeo/mslug.zip");
        assert_eq!(bytes, b"ROMDATA");
        assert!(!local.exists());
        assert_eq!(cabinet.commands, ["mkdir -p '/userdata/roms/neogeo'"]);
    }

    #[test]
    fn local_upload_failure_removes_temp_file_and_fails_entry() {
        let fetcher = FakeFetcher::serving(b"ROMDATA");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet {
            fail_uploads: true,
            ..FakeCabinet::default()
        };
        let mut entry = QueueEntry::new("https://archive.org/x/mslug.zip", "neogeo", None).unwrap();

        orch.fulfil(&mut entry, &mut cabinet, TransferMode::Local).unwrap();

        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("connection reset"));
        assert!(entry.completed_at.is_some());
        let (local, _, _) = &cabinet.uploads[0];
        assert!(!local.exists());
    }

    #[test]
    fn local_fetch_failure_skips_upload() {
        let fetcher = FakeFetcher {
            fail: true,
            ..FakeFetcher::serving(b"")
        };
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let mut entry = QueueEntry::new("https://archive.org/x/a.zip", "mame", None).unwrap();

        orch.fulfil(&mut entry, &mut cabinet, TransferMode::Local).unwrap();

        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("connection refused"));
        assert!(cabinet.uploads.is_empty());
    }

    #[test]
    fn filename_override_wins_over_url() {
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let dest = orch
            .download(
                "https://archive.org/download/set/a.zip",
                "fba",
                Some("renamed.zip"),
                &mut cabinet,
                TransferMode::Direct,
            )
            .unwrap();
        assert_eq!(dest, "/userdata/roms/fba/renamed.zip");
    }

    #[test]
    fn one_off_download_returns_error() {
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet {
            wget_failures: vec![("a.zip".into(), "404 Not Found".into())],
            ..FakeCabinet::default()
        };
        let err = orch
            .download("https://archive.org/x/a.zip", "mame", None, &mut cabinet, TransferMode::Direct)
            .unwrap_err();
        assert!(matches!(err, Error::RemoteCommand(m) if m == "404 Not Found"));
    }

    #[test]
    fn filename_is_decoded_last_segment() {
        assert_eq!(
            filename_from_url("https://archive.org/download/set/Metal%20Slug.zip").unwrap(),
            "Metal Slug.zip"
        );
        assert!(filename_from_url("https://archive.org/").is_err());
        assert!(filename_from_url("not a url").is_err());
    }

    /// Cabinet whose SSH channel is gone: every command fails to start.
    #[derive(Default)]
    struct UnreachableCabinet {
        runs: usize,
    }

    impl RemoteShell for UnreachableCabinet {
        fn run(&mut self, _: &str) -> Result<CommandOutput> {
            self.runs += 1;
            Err(Error::Connection("SSH channel to cabinet:22 failed: socket closed".into()))
        }

        fn upload_file(&mut self, _: &Path, _: &str, _: &mut dyn FnMut(u64, u64)) -> Result<()> {
            unreachable!()
        }
    }

    #[test]
    fn lost_connection_stops_the_pass() {
        let dir = tempdir().unwrap();
        let mut store = store_with(
            dir.path(),
            &[
                "https://archive.org/x/a.zip",
                "https://archive.org/x/b.zip",
                "https://archive.org/x/c.zip",
            ],
        );
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = UnreachableCabinet::default();

        let err = orch
            .process(&mut store, &mut cabinet, TransferMode::Direct)
            .unwrap_err();

        assert!(err.is_connection());
        assert_eq!(cabinet.runs, 1);
        let first = &store.list()[0];
        assert_eq!(first.status, EntryStatus::Failed);
        assert!(first.error.as_deref().unwrap().contains("socket closed"));
        assert!(store.list()[1..].iter().all(|e| e.status == EntryStatus::Pending));

        let reloaded = QueueStore::load(dir.path().join("queue.json")).unwrap();
        assert_eq!(reloaded.list(), store.list());
    }

    #[test]
    fn filename_override_cannot_leave_system_directory() {
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();

        let err = orch
            .download(
                "https://archive.org/x/a.zip",
                "mame",
                Some("../../system/a.zip"),
                &mut cabinet,
                TransferMode::Direct,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEntry(_)));

        let err = orch
            .download("https://archive.org/x/a.zip", "..", None, &mut cabinet, TransferMode::Direct)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEntry(_)));
        assert!(cabinet.commands.is_empty());
    }

    #[test]
    fn entry_edited_on_disk_is_checked_before_use() {
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let mut entry = QueueEntry::new("https://archive.org/x/a.zip", "mame", None).unwrap();
        entry.system = "../../etc".into();

        orch.fulfil(&mut entry, &mut cabinet, TransferMode::Direct).unwrap();

        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(cabinet.commands.is_empty());
    }

    #[test]
    fn directory_is_created_before_name_is_derived() {
        let fetcher = FakeFetcher::serving(b"");
        let orch = Orchestrator::new("/userdata/roms", &fetcher, &NoProgress);
        let mut cabinet = FakeCabinet::default();
        let mut entry = QueueEntry::new("https://archive.org/", "mame", None).unwrap();

        orch.fulfil(&mut entry, &mut cabinet, TransferMode::Direct).unwrap();

        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(cabinet.commands, ["mkdir -p '/userdata/roms/mame'"]);
    }

    #[test]
    fn target_joins_root_and_system() {
        let target = RemoteTarget::resolve("/userdata/roms/", "mame");
        assert_eq!(target.dir, "/userdata/roms/mame");
        assert_eq!(target.file("a.zip"), "/userdata/roms/mame/a.zip");
    }
}
