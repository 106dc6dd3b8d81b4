//! Remote file operations over the command channel.
//!
//! There is no SFTP subsystem in play: every operation is a shell command run
//! through [`RemoteSessions::execute`]. Binary content travels as base64 text
//! in both directions.
//!
//! Every path argument is POSIX-normalised, single-quoted and placed after
//! `--`, so names starting with `-` or containing shell metacharacters are
//! passed through literally.
//!
//! # Upload protocol
//!
//! 1. Truncate a fresh temporary file `/tmp/fleet-upload-<uuid>.b64`.
//! 2. Append the base64 text in chunks of [`UPLOAD_CHUNK_SIZE`] characters.
//! 3. Decode into `<dest>.partial`, then `mv` it over the destination.
//! 4. Remove the temporary and partial files whatever happened before.
//!
//! If the upload future is dropped halfway, a guard spawns step 4 on the
//! current runtime.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fleet::error::FleetError;
use crate::fleet::registry::RemoteSessions;
use crate::fleet::types::{CommandOutput, DirectoryListing, FileEntry, FileKind, Timestamp};

/// Base64 characters per appended chunk.
pub const UPLOAD_CHUNK_SIZE: usize = 50_000;

/// Maximum number of autocomplete suggestions.
pub const AUTOCOMPLETE_MAX_RESULTS: usize = 20;

/// File operations on connected hosts.
pub struct TransferGateway {
    registry: Arc<dyn RemoteSessions>,
    timeout: Duration,
}

impl TransferGateway {
    pub fn new(registry: Arc<dyn RemoteSessions>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    fn ensure_connected(&self, host_id: &str) -> Result<(), FleetError> {
        if self.registry.is_connected(host_id) {
            Ok(())
        } else {
            Err(FleetError::NotConnected(host_id.to_string()))
        }
    }

    /// Run a command and turn a non-zero exit into an error.
    async fn run_checked(
        &self,
        host_id: &str,
        command: &str,
        action: &str,
    ) -> Result<CommandOutput, FleetError> {
        let output = self.registry.execute(host_id, command, self.timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(failure(action, &output))
        }
    }

    /// List a directory, directories first then by name.
    pub async fn list(&self, host_id: &str, path: &str) -> Result<DirectoryListing, FleetError> {
        self.ensure_connected(host_id)?;
        let path = validate_path(path)?;

        let output = self
            .registry
            .execute(host_id, &ls_command("-la", &path), self.timeout)
            .await?;
        if !output.success() {
            return Err(if is_missing(&output) {
                FleetError::NotFound(format!("{} on host {}", path, host_id))
            } else {
                failure("Directory not accessible", &output)
            });
        }

        let now = Utc::now().naive_utc();
        let mut entries: Vec<FileEntry> = output
            .stdout
            .lines()
            .filter_map(|line| parse_entry(line, now))
            .filter(|(name, _)| name != "." && name != "..")
            .map(|(name, mut entry)| {
                entry.path = join(&path, &name);
                entry.name = name;
                entry
            })
            .collect();
        entries.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));

        Ok(DirectoryListing {
            parent_path: parent_path(&path),
            path,
            entries,
        })
    }

    /// Metadata of a single path, or `None` when it does not exist.
    pub async fn stat(&self, host_id: &str, path: &str) -> Result<Option<FileEntry>, FleetError> {
        self.ensure_connected(host_id)?;
        let path = validate_path(path)?;

        let output = self
            .registry
            .execute(host_id, &ls_command("-lad", &path), self.timeout)
            .await?;
        if !output.success() {
            return if is_missing(&output) {
                Ok(None)
            } else {
                Err(failure("Failed to stat", &output))
            };
        }

        let now = Utc::now().naive_utc();
        Ok(output
            .stdout
            .lines()
            .find_map(|line| parse_entry(line, now))
            .map(|(_, mut entry)| {
                entry.name = basename(&path);
                entry.path = path;
                entry
            }))
    }

    /// Create `name` under `parent` (with missing parents). Returns the new path.
    pub async fn create_directory(
        &self,
        host_id: &str,
        parent: &str,
        name: &str,
    ) -> Result<String, FleetError> {
        self.ensure_connected(host_id)?;
        validate_name(name)?;
        let path = join(&validate_path(parent)?, name);

        self.run_checked(
            host_id,
            &format!("mkdir -p -- {}", quote(&path)),
            "Failed to create directory",
        )
        .await?;
        info!("Created directory {} on host {}", path, host_id);
        Ok(path)
    }

    /// Recursively delete a path. The filesystem root is refused.
    pub async fn delete(&self, host_id: &str, path: &str) -> Result<(), FleetError> {
        self.ensure_connected(host_id)?;
        let path = validate_path(path)?;
        if path == "/" {
            return Err(FleetError::Validation("refusing to delete /".into()));
        }

        self.run_checked(
            host_id,
            &format!("rm -rf -- {}", quote(&path)),
            "Failed to delete",
        )
        .await?;
        info!("Deleted {} on host {}", path, host_id);
        Ok(())
    }

    pub async fn rename(&self, host_id: &str, from: &str, to: &str) -> Result<(), FleetError> {
        self.ensure_connected(host_id)?;
        let from = validate_path(from)?;
        let to = validate_path(to)?;

        self.run_checked(
            host_id,
            &format!("mv -- {} {}", quote(&from), quote(&to)),
            "Failed to rename",
        )
        .await?;
        info!("Renamed {} to {} on host {}", from, to, host_id);
        Ok(())
    }

    /// Read a file's bytes through a base64 dump.
    pub async fn read_content(&self, host_id: &str, path: &str) -> Result<Vec<u8>, FleetError> {
        self.ensure_connected(host_id)?;
        let path = validate_path(path)?;

        let output = self
            .registry
            .execute(host_id, &format!("base64 -- {}", quote(&path)), self.timeout)
            .await?;
        if !output.success() {
            return Err(if is_missing(&output) {
                FleetError::NotFound(format!("{} on host {}", path, host_id))
            } else {
                failure("Failed to read file", &output)
            });
        }

        let text: String = output
            .stdout
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(text)
            .map_err(|e| FleetError::Command(format!("Failed to decode {}: {}", path, e)))
    }

    /// Write `content` to `dir/name`. Returns the destination path.
    pub async fn upload(
        &self,
        host_id: &str,
        dir: &str,
        name: &str,
        content: &[u8],
    ) -> Result<String, FleetError> {
        self.ensure_connected(host_id)?;
        validate_name(name)?;
        let dest = join(&validate_path(dir)?, name);
        let temp = format!("/tmp/fleet-upload-{}.b64", Uuid::new_v4());
        let partial = format!("{}.partial", dest);
        let cleanup_command = format!("rm -f -- {} {}", quote(&temp), quote(&partial));

        let mut guard = CleanupGuard {
            registry: Arc::clone(&self.registry),
            host_id: host_id.to_string(),
            command: cleanup_command.clone(),
            timeout: self.timeout,
            armed: true,
        };

        let result = self
            .write_and_decode(host_id, &temp, &partial, &dest, content)
            .await;

        if let Err(e) = self
            .registry
            .execute(host_id, &cleanup_command, self.timeout)
            .await
        {
            warn!("Upload cleanup on host {} failed: {}", host_id, e);
        }
        // Stays armed until the cleanup above has finished
        guard.armed = false;

        result?;
        info!(
            "Uploaded {} bytes to {} on host {}",
            content.len(),
            dest,
            host_id
        );
        Ok(dest)
    }

    async fn write_and_decode(
        &self,
        host_id: &str,
        temp: &str,
        partial: &str,
        dest: &str,
        content: &[u8],
    ) -> Result<(), FleetError> {
        self.run_checked(host_id, &format!(": > {}", quote(temp)), "Failed to upload")
            .await?;

        let encoded = STANDARD.encode(content);
        for (index, chunk) in base64_chunks(&encoded).enumerate() {
            let command = format!("printf '%s' {} >> {}", quote(chunk), quote(temp));
            if let Err(e) = self.run_checked(host_id, &command, "Failed to upload").await {
                warn!(
                    "Upload chunk {} to {} on host {} failed: {}",
                    index, dest, host_id, e
                );
                return Err(e);
            }
        }

        self.run_checked(
            host_id,
            &format!(
                "base64 -d -- {} > {} && mv -f -- {} {}",
                quote(temp),
                quote(partial),
                quote(partial),
                quote(dest)
            ),
            "Failed to upload",
        )
        .await
        .map(|_| ())
    }

    /// Case-insensitive completions for a partial path. Never fails.
    pub async fn autocomplete(&self, host_id: &str, partial: &str) -> Vec<String> {
        if !self.registry.is_connected(host_id) {
            return Vec::new();
        }
        let (dir, prefix) = split_partial(partial);

        match self.list(host_id, &dir).await {
            Ok(listing) => listing
                .entries
                .into_iter()
                .filter(|entry| entry.name.to_lowercase().starts_with(&prefix))
                .take(AUTOCOMPLETE_MAX_RESULTS)
                .map(|entry| {
                    let mut path = join(&dir, &entry.name);
                    if entry.is_dir() {
                        path.push('/');
                    }
                    path
                })
                .collect(),
            Err(e) => {
                debug!("Autocomplete of {} on host {} failed: {}", dir, host_id, e);
                Vec::new()
            }
        }
    }
}

/// `ls` pinned to the C locale: month names and "No such file" diagnostics
/// are parsed from its output.
fn ls_command(flags: &str, path: &str) -> String {
    format!("LC_ALL=C ls {} -- {}", flags, quote(path))
}

/// Removes upload leftovers if the upload future is dropped before finishing.
struct CleanupGuard {
    registry: Arc<dyn RemoteSessions>,
    host_id: String,
    command: String,
    timeout: Duration,
    armed: bool,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Upload on host {} abandoned without cleanup", self.host_id);
            return;
        };
        let registry = Arc::clone(&self.registry);
        let host_id = std::mem::take(&mut self.host_id);
        let command = std::mem::take(&mut self.command);
        let timeout = self.timeout;
        runtime.spawn(async move {
            warn!("Upload on host {} cancelled, removing temporary files", host_id);
            if let Err(e) = registry.execute(&host_id, &command, timeout).await {
                warn!("Upload cleanup on host {} failed: {}", host_id, e);
            }
        });
    }
}

fn base64_chunks(encoded: &str) -> impl Iterator<Item = &str> {
    // base64 output is ASCII, so byte offsets are char boundaries
    (0..encoded.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(move |start| &encoded[start..(start + UPLOAD_CHUNK_SIZE).min(encoded.len())])
}

fn failure(action: &str, output: &CommandOutput) -> FleetError {
    let detail = output.stderr.trim();
    if detail.is_empty() {
        FleetError::Command(format!("{}: exit code {}", action, output.exit_code))
    } else {
        FleetError::Command(format!("{}: {}", action, detail))
    }
}

fn is_missing(output: &CommandOutput) -> bool {
    output.stderr.contains("No such file or directory")
}

/// Single-quote a shell argument.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// POSIX path normalisation: collapses `//`, `.` and `..` without touching the
/// filesystem. Relative paths stay relative; an empty relative path is `.`.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Parent of a normalised path; `None` at `/` and `.`.
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" || path == "." {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(index) => Some(path[..index].to_string()),
        None => Some(".".to_string()),
    }
}

fn join(dir: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", dir, name))
}

fn basename(path: &str) -> String {
    match path.rfind('/') {
        Some(index) if index + 1 < path.len() => path[index + 1..].to_string(),
        _ => path.to_string(),
    }
}

fn validate_path(path: &str) -> Result<String, FleetError> {
    if path.trim().is_empty() {
        return Err(FleetError::Validation("path must not be empty".into()));
    }
    if path.contains(['\0', '\n', '\r']) {
        return Err(FleetError::Validation(
            "path must not contain NUL or line breaks".into(),
        ));
    }
    Ok(normalize_path(path))
}

fn validate_name(name: &str) -> Result<(), FleetError> {
    if name.trim().is_empty() || name == "." || name == ".." {
        return Err(FleetError::Validation(format!("invalid name '{}'", name)));
    }
    if name.contains(['/', '\0', '\n', '\r']) {
        return Err(FleetError::Validation(format!(
            "name must be a single path component: '{}'",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Directory to list and lowercase prefix to match for an autocomplete request.
fn split_partial(partial: &str) -> (String, String) {
    let partial = if partial.is_empty() { "/" } else { partial };
    let normalized = normalize_path(partial);
    if partial.ends_with('/') {
        return (normalized, String::new());
    }
    match normalized.rfind('/') {
        Some(0) => ("/".to_string(), normalized[1..].to_lowercase()),
        Some(index) => (
            normalized[..index].to_string(),
            normalized[index + 1..].to_lowercase(),
        ),
        None => ("/".to_string(), normalized.to_lowercase()),
    }
}

/// Parse one `ls -l` line into (name, entry). `path` is left empty.
fn parse_entry(line: &str, now: NaiveDateTime) -> Option<(String, FileEntry)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    let permissions = parts[0];
    let kind = match permissions.chars().next()? {
        'd' => FileKind::Directory,
        '-' => FileKind::File,
        'l' => FileKind::Symlink,
        _ => FileKind::Other,
    };

    // Device nodes print "major, minor" where the size would be
    let shift = usize::from(parts[4].ends_with(',') && parts.len() >= 10);
    let size = if shift == 1 {
        0
    } else {
        parts[4].parse().unwrap_or(0)
    };
    let (month, day, time_or_year) = (parts[5 + shift], parts[6 + shift], parts[7 + shift]);

    let full_name = parts[8 + shift..].join(" ");
    let (name, link_target) = match (kind, full_name.split_once(" -> ")) {
        (FileKind::Symlink, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (full_name, None),
    };

    Some((
        name,
        FileEntry {
            name: String::new(),
            path: String::new(),
            kind,
            size,
            permissions: permissions.to_string(),
            owner: parts[2].to_string(),
            group: parts[3].to_string(),
            modified: format!("{} {} {}", month, day, time_or_year),
            modified_at: parse_modified(month, day, time_or_year, now),
            link_target,
        },
    ))
}

/// `ls` prints `Mon DD HH:MM` for recent files (current year implied) and
/// `Mon DD YYYY` otherwise.
fn parse_modified(month: &str, day: &str, time_or_year: &str, now: NaiveDateTime) -> Option<Timestamp> {
    let at = if time_or_year.contains(':') {
        let time = NaiveTime::parse_from_str(time_or_year, "%H:%M").ok()?;
        let this_year = NaiveDate::parse_from_str(
            &format!("{} {} {}", now.year(), month, day),
            "%Y %b %d",
        )
        .ok()?
        .and_time(time);
        if this_year > now + chrono::Duration::days(1) {
            NaiveDate::parse_from_str(&format!("{} {} {}", now.year() - 1, month, day), "%Y %b %d")
                .ok()?
                .and_time(time)
        } else {
            this_year
        }
    } else {
        NaiveDate::parse_from_str(&format!("{} {} {}", time_or_year, month, day), "%Y %b %d")
            .ok()?
            .and_time(NaiveTime::MIN)
    };
    Some(at.and_utc().timestamp_millis())
}
