// Cabinet access over SSH. The orchestrator only sees the `RemoteShell`
// trait; `SshSession` is the real implementation built on ssh2.

use crate::config::ConnectionParams;
use crate::error::{Error, Result};
use ssh2::Session;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

/// Output of one remote command. `SshSession` merges stderr into
/// `stdout`, leaving `stderr` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best single-line description of why the command failed.
    fn failure_reason(&self) -> String {
        let pick = |s: &str| s.lines().rev().find(|l| !l.trim().is_empty()).map(|l| l.trim().to_string());
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_else(|| format!("exit status {}", self.exit_code))
    }
}

/// The operations the download logic needs from the cabinet.
pub trait RemoteShell {
    fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Copy a local file to `dest`, reporting `(bytes_sent, total)`.
    fn upload_file(
        &mut self,
        local: &Path,
        dest: &str,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()>;

    /// `mkdir -p`.
    fn ensure_directory(&mut self, path: &str) -> Result<()> {
        let out = self.run(&format!("mkdir -p {}", shell_quote(path)))?;
        if !out.success() {
            return Err(Error::RemoteCommand(out.failure_reason()));
        }
        Ok(())
    }

    fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let out = self.run(&format!("ls -1 {}", shell_quote(path)))?;
        if !out.success() {
            return Err(Error::RemoteCommand(out.failure_reason()));
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Have the cabinet fetch `url` into `dest` itself.
    fn download_remote(&mut self, url: &str, dest: &str) -> Result<()> {
        let out = self.run(&format!(
            "wget -O {} {} 2>&1",
            shell_quote(dest),
            shell_quote(url)
        ))?;
        if !out.success() {
            return Err(Error::RemoteCommand(out.failure_reason()));
        }
        Ok(())
    }
}

/// Wrap `s` in single quotes for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A password-authenticated SSH session. Disconnects on drop if `close` was
/// not called.
pub struct SshSession {
    session: Session,
    address: String,
    open: bool,
}

impl SshSession {
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        let address = params.address();
        let tcp = TcpStream::connect(&address)
            .map_err(|e| Error::Connection(format!("TCP connection to {} failed: {}", address, e)))?;
        let mut session = Session::new()
            .map_err(|e| Error::Connection(format!("cannot create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::Connection(format!("SSH handshake with {} failed: {}", address, e)))?;
        session
            .userauth_password(&params.username, &params.password)
            .map_err(|e| {
                Error::Connection(format!(
                    "authentication as '{}' on {} failed: {}",
                    params.username, address, e
                ))
            })?;
        if !session.authenticated() {
            return Err(Error::Connection(format!(
                "authentication as '{}' on {} was rejected",
                params.username, address
            )));
        }
        tracing::info!(%address, user = %params.username, "connected to cabinet");
        Ok(SshSession {
            session,
            address,
            open: true,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn close(mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.session.disconnect(None, "bye", None) {
                tracing::debug!(address = %self.address, "disconnect: {}", e);
            } else {
                tracing::info!(address = %self.address, "disconnected from cabinet");
            }
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl RemoteShell for SshSession {
    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(address = %self.address, command, "remote exec");
        let lost = |e: ssh2::Error| {
            Error::Connection(format!("SSH channel to {} failed: {}", self.address, e))
        };
        let mut channel = self.session.channel_session().map_err(lost)?;
        // stderr is folded into stdout so a single read drains the channel;
        // reading the streams one after the other can stall on a full window.
        channel
            .handle_extended_data(ssh2::ExtendedData::Merge)
            .map_err(lost)?;
        channel.exec(command).map_err(lost)?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| Error::Connection(format!("reading command output failed: {}", e)))?;
        channel.wait_close().map_err(lost)?;
        let exit_code = channel.exit_status().map_err(lost)?;
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code,
        })
    }

    fn upload_file(
        &mut self,
        local: &Path,
        dest: &str,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        let interrupted = |what: &str, e: String| {
            Error::Transfer(format!("upload to {} {}: {}", dest, what, e))
        };
        let mut file = File::open(local).map_err(|e| interrupted("cannot open local file", e.to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| interrupted("cannot stat local file", e.to_string()))?
            .len();

        let mut channel = self
            .session
            .scp_send(Path::new(dest), 0o644, size, None)
            .map_err(|e| interrupted("could not start", e.to_string()))?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut sent = 0u64;
        progress(0, size);
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| interrupted("failed reading local file", e.to_string()))?;
            if n == 0 {
                break;
            }
            channel
                .write_all(&buf[..n])
                .map_err(|e| interrupted("was interrupted", e.to_string()))?;
            sent += n as u64;
            progress(sent, size);
        }
        channel.send_eof().map_err(|e| interrupted("did not finish", e.to_string()))?;
        channel.wait_eof().map_err(|e| interrupted("did not finish", e.to_string()))?;
        channel.close().map_err(|e| interrupted("did not finish", e.to_string()))?;
        channel.wait_close().map_err(|e| interrupted("did not finish", e.to_string()))?;
        tracing::info!(dest, bytes = sent, "upload finished");
        Ok(())
    }
}
