// Runtime settings. Values come from CLI flags first, then environment
// variables, then the defaults below.

use std::path::PathBuf;

pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_PASSWORD: &str = "linux";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_ROMS_ROOT: &str = "/userdata/roms";
pub const DEFAULT_ARCHIVE_URL: &str = "https://archive.org";

/// Everything needed to open an SSH session to the cabinet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub username: String,
    pub password: String,
    pub port: u16,
}

impl ConnectionParams {
    /// Parameters for `host` with the stock Batocera credentials.
    pub fn new(host: impl Into<String>) -> Self {
        ConnectionParams {
            host: host.into(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            port: DEFAULT_PORT,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Cabinet host; commands that talk to the cabinet refuse to run without it.
    pub host: Option<String>,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub roms_root: String,
    pub queue_path: PathBuf,
    pub archive_url: String,
}

impl Settings {
    /// Build settings from `BATOCERA_*` / `CABINET_QUEUE_FILE` /
    /// `ARCHIVE_BASE_URL` or fall back to the defaults.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Settings {
            host: var("BATOCERA_HOST"),
            username: var("BATOCERA_USER").unwrap_or_else(|| DEFAULT_USERNAME.into()),
            password: var("BATOCERA_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            port: var("BATOCERA_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            roms_root: DEFAULT_ROMS_ROOT.to_string(),
            queue_path: var("CABINET_QUEUE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(default_queue_path),
            archive_url: var("ARCHIVE_BASE_URL").unwrap_or_else(|| DEFAULT_ARCHIVE_URL.into()),
        }
    }

    /// Connection parameters, or `None` when no host has been configured.
    pub fn connection(&self) -> Option<ConnectionParams> {
        self.host.as_ref().map(|host| ConnectionParams {
            host: host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            port: self.port,
        })
    }
}

/// `<data dir>/cabinet-loader/queue.json`, or `./queue.json` when the
/// platform has no data directory.
pub fn default_queue_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("cabinet-loader"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("queue.json")
}
