//! Classification of files in an application directory

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use binlift_binary_parser::detect_format;
use binlift_core::{BinaryFormat, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

const BINARY_EXTENSIONS: &[&str] = &["exe", "dll", "so", "dylib", "sys", "ocx"];

const CONFIG_EXTENSIONS: &[&str] = &[
    "ini", "cfg", "config", "xml", "json", "yaml", "yml", "toml", "properties",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Image,
    Audio,
    Data,
}

impl ResourceType {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "ico" | "png" | "jpg" | "jpeg" | "bmp" | "gif" => Some(Self::Image),
            "wav" | "mp3" => Some(Self::Audio),
            "txt" | "dat" | "res" => Some(Self::Data),
            _ => None,
        }
    }
}

/// A non-code file recorded by location and size only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub path: PathBuf,
    pub size: u64,
    pub kind: ResourceType,
}

/// Files under a directory, grouped by role, each list in path order
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub binaries: Vec<PathBuf>,
    pub configs: Vec<PathBuf>,
    pub resources: Vec<ResourceInfo>,
}

impl DirectoryListing {
    /// Prefer an `.exe`, then an extension-less file with an executable
    /// header, then whatever binary sorts first
    pub fn main_executable(&self) -> Option<&PathBuf> {
        self.binaries
            .iter()
            .find(|p| extension(p).as_deref() == Some("exe"))
            .or_else(|| {
                self.binaries
                    .iter()
                    .find(|p| p.extension().is_none() && has_executable_header(p))
            })
            .or_else(|| self.binaries.first())
    }
}

/// Walk `dir` recursively and sort every regular file into its roles
pub fn scan_directory(dir: &Path) -> Result<DirectoryListing> {
    let mut listing = DirectoryListing::default();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            match e.into_io_error() {
                Some(source) => Error::io(path, source),
                None => Error::custom(format!("Filesystem loop under {}", path.display())),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let ext = extension(path);
        if is_binary_file(path) {
            listing.binaries.push(path.to_path_buf());
        }
        if ext.as_deref().map_or(false, |e| CONFIG_EXTENSIONS.contains(&e)) {
            listing.configs.push(path.to_path_buf());
        }
        if let Some(kind) = ext.as_deref().and_then(ResourceType::from_extension) {
            let size = entry
                .metadata()
                .map_err(|e| Error::custom(format!("{}: {}", path.display(), e)))?
                .len();
            listing.resources.push(ResourceInfo {
                path: path.to_path_buf(),
                size,
                kind,
            });
        }
    }

    debug!(
        "{}: {} binaries, {} config files, {} resources",
        dir.display(),
        listing.binaries.len(),
        listing.configs.len(),
        listing.resources.len()
    );
    Ok(listing)
}

/// Known binary extension, no extension at all, or an executable header
pub fn is_binary_file(path: &Path) -> bool {
    match extension(path) {
        Some(ext) => BINARY_EXTENSIONS.contains(&ext.as_str()) || has_executable_header(path),
        None => true,
    }
}

/// First bytes carry a PE, ELF or Mach-O magic
pub fn has_executable_header(path: &Path) -> bool {
    let mut header = [0u8; 4];
    let read = File::open(path).and_then(|mut file| file.read_exact(&mut header));
    if read.is_err() {
        return false;
    }
    matches!(
        detect_format(&header),
        BinaryFormat::PE | BinaryFormat::ELF | BinaryFormat::MachO
    )
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}
