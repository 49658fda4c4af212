//! Plugin provisioning: discovers analyzer plugins and makes the JS/TS bridge bundle available
//! as an extracted directory before the backend is launched.
//!
//! Layout of a plugins directory:
//!
//! ```text
//! plugins/
//!   sonar-java-plugin-8.1.jar
//!   sonar-javascript-plugin-10.5.jar     (may embed sonarjs-*.tgz)
//!   sonarjs-1.0.0.tgz                    (optional staged bundle)
//!   eslint-bridge/                       (extracted bundle + marker)
//!   eslint-bridge.lock
//! ```
//!
//! Extraction is idempotent: a completed extraction leaves a marker file and is never redone.
//! The running backend holds a shared lock on `eslint-bridge.lock`, so an extraction (which
//! needs the exclusive lock) fails fast instead of swapping files underneath it.

use flate2::read::GzDecoder;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const BRIDGE_DIR_NAME: &str = "eslint-bridge";
pub const BRIDGE_MARKER: &str = ".sonar-mcp-extracted";
pub const BRIDGE_LOCK_NAME: &str = "eslint-bridge.lock";

const PLUGIN_EXTENSION: &str = "jar";
const JS_PLUGIN_PREFIX: &str = "sonar-javascript-plugin-";
const BUNDLE_PREFIX: &str = "sonarjs-";
const BUNDLE_SUFFIX: &str = ".tgz";
/// Jar headers are untrusted; larger bundles still read, just without the up-front allocation.
const MAX_PREALLOCATED_BUNDLE: usize = 64 * 1024 * 1024;

/// Languages served by each known analyzer plugin key.
const PLUGIN_LANGUAGES: &[(&str, &[&str])] = &[
    ("javascript", &["js", "ts", "css"]),
    ("java", &["java"]),
    ("python", &["py", "ipynb"]),
    ("php", &["php"]),
    ("html", &["html"]),
    ("xml", &["xml"]),
    ("text", &["text", "secrets"]),
    ("kotlin", &["kotlin"]),
    ("go", &["go"]),
    ("ruby", &["ruby"]),
];

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("plugins directory {0} does not exist or is not a directory")]
    MissingPluginsDir(PathBuf),

    #[error("no analyzer plugins (*.jar) found in {0}")]
    NoPlugins(PathBuf),

    #[error(
        "JS/TS bridge bundle not found in {dir}: expected an extracted eslint-bridge/ directory, \
         a staged sonarjs-*.tgz, or a sonar-javascript-plugin-*.jar embedding one"
    )]
    BridgeBundleMissing { dir: PathBuf },

    #[error("JS/TS bridge bundle is ambiguous in {dir}: {}", .candidates.join(", "))]
    BridgeBundleAmbiguous {
        dir: PathBuf,
        candidates: Vec<String>,
    },

    #[error("JS/TS bridge directory {0} is in use by a running backend")]
    BridgeDirectoryBusy(PathBuf),

    #[error("failed to extract JS/TS bridge bundle from {archive}: {reason}")]
    Extraction { archive: PathBuf, reason: String },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> ProvisionError {
    let path = path.to_path_buf();
    move |source| ProvisionError::Io {
        action,
        path,
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginArtifact {
    pub key: String,
    pub path: PathBuf,
}

/// Resolved plugin inputs handed to the backend at launch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSet {
    pub plugins_dir: PathBuf,
    pub plugins: Vec<PluginArtifact>,
    pub bridge_dir: PathBuf,
    pub languages: Vec<String>,
}

impl PluginSet {
    pub fn plugin_paths(&self) -> Vec<PathBuf> {
        self.plugins.iter().map(|p| p.path.clone()).collect()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.plugins_dir.join(BRIDGE_LOCK_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BundleSource {
    Staged(PathBuf),
    Embedded { jar: PathBuf, entry: String },
}

impl BundleSource {
    fn describe(&self) -> String {
        match self {
            Self::Staged(path) => path.display().to_string(),
            Self::Embedded { jar, entry } => format!("{}!{entry}", jar.display()),
        }
    }

    fn archive_path(&self) -> &Path {
        match self {
            Self::Staged(path) => path,
            Self::Embedded { jar, .. } => jar,
        }
    }
}

pub async fn resolve_plugins_async(plugins_dir: PathBuf) -> Result<PluginSet> {
    let dir_for_error = plugins_dir.clone();
    tokio::task::spawn_blocking(move || resolve_plugins(&plugins_dir))
        .await
        .map_err(|err| ProvisionError::Io {
            action: "join provisioning task for",
            path: dir_for_error,
            source: std::io::Error::other(err.to_string()),
        })?
}

/// Discovers plugins in `plugins_dir` and ensures the bridge bundle is extracted.
pub fn resolve_plugins(plugins_dir: &Path) -> Result<PluginSet> {
    if !plugins_dir.is_dir() {
        return Err(ProvisionError::MissingPluginsDir(plugins_dir.to_path_buf()));
    }

    let mut names: Vec<String> = fs::read_dir(plugins_dir)
        .map_err(io_error("read plugins directory", plugins_dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(ToString::to_string))
        .collect();
    names.sort();

    let plugins: Vec<PluginArtifact> = names
        .iter()
        .filter(|name| {
            Path::new(name.as_str())
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(PLUGIN_EXTENSION))
        })
        .map(|name| PluginArtifact {
            key: plugin_key(name),
            path: plugins_dir.join(name),
        })
        .collect();
    if plugins.is_empty() {
        return Err(ProvisionError::NoPlugins(plugins_dir.to_path_buf()));
    }

    let bridge_dir = plugins_dir.join(BRIDGE_DIR_NAME);
    if !bridge_dir.join(BRIDGE_MARKER).is_file() {
        let source = locate_bundle(plugins_dir, &names)?;
        extract_bundle(plugins_dir, &bridge_dir, &source)?;
    } else {
        log::debug!("bridge bundle already extracted at {}", bridge_dir.display());
    }

    let mut languages: Vec<String> = plugins
        .iter()
        .flat_map(|p| languages_for_plugin(&p.key))
        .map(ToString::to_string)
        .collect();
    languages.sort();
    languages.dedup();

    Ok(PluginSet {
        plugins_dir: plugins_dir.to_path_buf(),
        plugins,
        bridge_dir,
        languages,
    })
}

/// `sonar-<key>-plugin-<version>.jar` → `<key>`; anything else falls back to the file stem.
fn plugin_key(file_name: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    stem.strip_prefix("sonar-")
        .and_then(|rest| rest.split_once("-plugin"))
        .map(|(key, _)| key.to_string())
        .unwrap_or_else(|| stem.to_string())
}

fn languages_for_plugin(key: &str) -> &'static [&'static str] {
    PLUGIN_LANGUAGES
        .iter()
        .find(|(plugin, _)| *plugin == key)
        .map(|(_, langs)| *langs)
        .unwrap_or(&[])
}

fn is_bundle_name(name: &str) -> bool {
    name.starts_with(BUNDLE_PREFIX) && name.ends_with(BUNDLE_SUFFIX)
}

fn locate_bundle(plugins_dir: &Path, names: &[String]) -> Result<BundleSource> {
    let ambiguous = |candidates: &[&String]| ProvisionError::BridgeBundleAmbiguous {
        dir: plugins_dir.to_path_buf(),
        candidates: candidates.iter().map(|n| n.to_string()).collect(),
    };

    // Two JS plugins are a broken install whether or not a bundle is staged next to them.
    let js_plugins: Vec<&String> = names
        .iter()
        .filter(|n| n.starts_with(JS_PLUGIN_PREFIX) && n.ends_with(".jar"))
        .collect();
    if js_plugins.len() > 1 {
        return Err(ambiguous(js_plugins.as_slice()));
    }

    let staged: Vec<&String> = names.iter().filter(|n| is_bundle_name(n)).collect();
    match staged.as_slice() {
        [one] => return Ok(BundleSource::Staged(plugins_dir.join(one.as_str()))),
        [] => {}
        many => return Err(ambiguous(many)),
    }

    let Some(jar) = js_plugins.first().map(|name| plugins_dir.join(name.as_str())) else {
        return Err(ProvisionError::BridgeBundleMissing {
            dir: plugins_dir.to_path_buf(),
        });
    };

    let entries = embedded_bundle_entries(&jar)?;
    match entries.len() {
        0 => Err(ProvisionError::BridgeBundleMissing {
            dir: plugins_dir.to_path_buf(),
        }),
        1 => Ok(BundleSource::Embedded {
            jar,
            entry: entries.into_iter().next().unwrap_or_default(),
        }),
        _ => Err(ProvisionError::BridgeBundleAmbiguous {
            dir: plugins_dir.to_path_buf(),
            candidates: entries,
        }),
    }
}

fn embedded_bundle_entries(jar: &Path) -> Result<Vec<String>> {
    let file = File::open(jar).map_err(io_error("open plugin", jar))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| ProvisionError::Extraction {
        archive: jar.to_path_buf(),
        reason: format!("not a readable jar: {err}"),
    })?;
    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let Ok(entry) = archive.by_index(index) else {
            continue;
        };
        let name = entry.name().to_string();
        let base = name.rsplit('/').next().unwrap_or(name.as_str());
        if entry.is_file() && is_bundle_name(base) {
            entries.push(name);
        }
    }
    entries.sort();
    Ok(entries)
}

/// Held for the lifetime of a running backend; blocks re-extraction of the bridge directory.
pub struct BridgeDirGuard {
    #[allow(dead_code)]
    file: File,
}

impl Drop for BridgeDirGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl BridgeDirGuard {
    pub fn acquire_shared(plugins: &PluginSet) -> Result<Self> {
        let path = plugins.lock_path();
        let file = open_lock_file(&path)?;
        FileExt::try_lock_shared(&file).map_err(|err| {
            if is_contended(&err) {
                ProvisionError::BridgeDirectoryBusy(plugins.bridge_dir.clone())
            } else {
                ProvisionError::Io {
                    action: "lock",
                    path: path.clone(),
                    source: err,
                }
            }
        })?;
        Ok(Self { file })
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(io_error("open bridge lock", path))
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn extract_bundle(plugins_dir: &Path, bridge_dir: &Path, source: &BundleSource) -> Result<()> {
    let lock_path = plugins_dir.join(BRIDGE_LOCK_NAME);
    let lock = open_lock_file(&lock_path)?;
    FileExt::try_lock_exclusive(&lock).map_err(|err| {
        if is_contended(&err) {
            ProvisionError::BridgeDirectoryBusy(bridge_dir.to_path_buf())
        } else {
            ProvisionError::Io {
                action: "lock",
                path: lock_path.clone(),
                source: err,
            }
        }
    })?;
    let result = extract_bundle_locked(plugins_dir, bridge_dir, source);
    let _ = FileExt::unlock(&lock);
    result
}

fn extract_bundle_locked(plugins_dir: &Path, bridge_dir: &Path, source: &BundleSource) -> Result<()> {
    // Another process may have finished while we waited for the lock.
    if bridge_dir.join(BRIDGE_MARKER).is_file() {
        return Ok(());
    }

    log::info!(
        "extracting JS/TS bridge bundle {} into {}",
        source.describe(),
        bridge_dir.display()
    );

    let staging = plugins_dir.join(format!(".{BRIDGE_DIR_NAME}.partial-{}", std::process::id()));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_error("remove stale staging dir", &staging))?;
    }
    fs::create_dir_all(&staging).map_err(io_error("create staging dir", &staging))?;

    if let Err(err) = unpack_into(source, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    if bridge_dir.exists() {
        // Leftover from an interrupted extraction (no marker).
        fs::remove_dir_all(bridge_dir).map_err(io_error("remove incomplete bridge dir", bridge_dir))?;
    }
    fs::rename(&staging, bridge_dir).map_err(io_error("move extracted bridge into", bridge_dir))?;

    let marker = serde_json::json!({
        "source": source.describe(),
        "extracted_at_ms": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    });
    let marker_path = bridge_dir.join(BRIDGE_MARKER);
    fs::write(&marker_path, marker.to_string()).map_err(io_error("write marker", &marker_path))?;
    Ok(())
}

/// The jar's declared entry size, capped.
fn preallocation(declared: u64) -> usize {
    usize::try_from(declared)
        .unwrap_or(usize::MAX)
        .min(MAX_PREALLOCATED_BUNDLE)
}

fn unpack_into(source: &BundleSource, target: &Path) -> Result<()> {
    let extraction_error = |reason: String| ProvisionError::Extraction {
        archive: source.archive_path().to_path_buf(),
        reason,
    };

    let bytes: Box<dyn Read> = match source {
        BundleSource::Staged(path) => {
            Box::new(File::open(path).map_err(io_error("open bundle", path))?)
        }
        BundleSource::Embedded { jar, entry } => {
            let file = File::open(jar).map_err(io_error("open plugin", jar))?;
            let mut archive =
                zip::ZipArchive::new(file).map_err(|err| extraction_error(err.to_string()))?;
            let mut inner = archive
                .by_name(entry)
                .map_err(|err| extraction_error(format!("entry {entry}: {err}")))?;
            let mut buf = Vec::with_capacity(preallocation(inner.size()));
            inner
                .read_to_end(&mut buf)
                .map_err(|err| extraction_error(format!("read entry {entry}: {err}")))?;
            Box::new(Cursor::new(buf))
        }
    };

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|err| extraction_error(err.to_string()))?;
    let mut unpacked = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|err| extraction_error(err.to_string()))?;
        let path = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let inside = entry
            .unpack_in(target)
            .map_err(|err| extraction_error(format!("{path}: {err}")))?;
        if !inside {
            return Err(extraction_error(format!(
                "entry {path} escapes the bridge directory"
            )));
        }
        unpacked += 1;
    }
    if unpacked == 0 {
        return Err(extraction_error("archive is empty".to_string()));
    }
    Ok(())
}
