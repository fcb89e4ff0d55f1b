use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::StorageResult;
use crate::portal::Diagnostics;

const BUNDLE_SUFFIXES: [&str; 3] = ["-screenshot.png", "-pagesource.html", "-console.log"];

/// Everything the monitor leaves on disk for a human to look at later:
/// per-party console and cookie snapshots, numbered screenshots and the
/// bundles attached to error mails. Only the newest `keep` screenshots and
/// error bundles survive.
#[derive(Debug)]
pub struct ArtifactStore {
    base_path: PathBuf,
    screenshots: AtomicUsize,
    keep: usize,
}

fn remove_if_present(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            screenshots: AtomicUsize::new(0),
            keep: 20,
        })
    }

    pub fn with_retention(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    /// Overwrites `console_{id}.json` and `cookies_{id}.json`.
    pub fn save_snapshot(&self, identifier: &str, diagnostics: &Diagnostics) -> StorageResult<()> {
        let console = self.base_path.join(format!("console_{identifier}.json"));
        fs::write(&console, serde_json::to_string_pretty(&diagnostics.console)?)?;

        let cookies = self.base_path.join(format!("cookies_{identifier}.json"));
        fs::write(&cookies, serde_json::to_string_pretty(&diagnostics.cookies)?)?;

        debug!("Saved console and cookies for {}", identifier);
        Ok(())
    }

    /// The snapshot files of `identifier` that currently exist.
    pub fn snapshot_paths(&self, identifier: &str) -> Vec<PathBuf> {
        [
            format!("console_{identifier}.json"),
            format!("cookies_{identifier}.json"),
        ]
        .into_iter()
        .map(|name| self.base_path.join(name))
        .filter(|path| path.exists())
        .collect()
    }

    /// Stores `screenshot_{n}.png` with a run-wide counter starting at 1 and
    /// drops the one that falls out of the retention window.
    pub fn save_screenshot(&self, png: &[u8]) -> StorageResult<PathBuf> {
        let n = self.screenshots.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.base_path.join(format!("screenshot_{n}.png"));
        fs::write(&path, png)?;

        if n > self.keep {
            let expired = self.base_path.join(format!("screenshot_{}.png", n - self.keep));
            remove_if_present(&expired)?;
        }
        Ok(path)
    }

    pub fn clear_screenshots(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let is_screenshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("screenshot_") && name.ends_with(".png"));
            if is_screenshot {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        self.screenshots.store(0, Ordering::SeqCst);
        Ok(removed)
    }

    /// Page as it looked when slots were found, for the party's mail.
    pub fn save_page_source(&self, identifier: &str, diagnostics: &Diagnostics) -> StorageResult<PathBuf> {
        let path = self.base_path.join(format!("page_{identifier}.html"));
        fs::write(&path, &diagnostics.page_source)?;
        Ok(path)
    }

    /// Writes `error-{ts}-{id}-screenshot.png` (when there is one),
    /// `error-{ts}-{id}-pagesource.html` and `error-{ts}-{id}-console.log`,
    /// then prunes bundles beyond the retention window.
    pub fn save_error_bundle(
        &self,
        identifier: &str,
        diagnostics: &Diagnostics,
        at: DateTime<Utc>,
    ) -> StorageResult<Vec<PathBuf>> {
        let prefix = format!("error-{}-{identifier}", at.format("%Y%m%d_%H%M%S%3f"));
        let mut paths = Vec::with_capacity(3);

        if let Some(png) = &diagnostics.screenshot {
            let path = self.base_path.join(format!("{prefix}-screenshot.png"));
            fs::write(&path, png)?;
            paths.push(path);
        }

        let page_source = self.base_path.join(format!("{prefix}-pagesource.html"));
        fs::write(&page_source, &diagnostics.page_source)?;
        paths.push(page_source);

        let console: String = diagnostics
            .console
            .iter()
            .map(|entry| {
                format!(
                    "{} {:?} {}\n",
                    entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    entry.level,
                    entry.message
                )
            })
            .collect();
        let console_log = self.base_path.join(format!("{prefix}-console.log"));
        fs::write(&console_log, console)?;
        paths.push(console_log);

        self.prune_error_bundles()?;
        Ok(paths)
    }

    /// Deletes the oldest error bundles until at most `keep` remain.
    pub fn prune_error_bundles(&self) -> StorageResult<usize> {
        let mut bundles: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("error-") {
                continue;
            }
            let key = BUNDLE_SUFFIXES
                .iter()
                .find_map(|suffix| name.strip_suffix(suffix))
                .map(str::to_string);
            if let Some(key) = key {
                bundles.entry(key).or_default().push(path);
            }
        }

        let expired = bundles.len().saturating_sub(self.keep);
        for (key, files) in bundles.into_iter().take(expired) {
            debug!("Removing error bundle {}", key);
            for file in files {
                remove_if_present(&file)?;
            }
        }
        Ok(expired)
    }
}
