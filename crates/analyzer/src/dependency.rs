//! Breadth-first walk over imported libraries
//!
//! Only PE import tables yield names today; ELF and Mach-O files report no
//! imports, so walks starting from them end immediately.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use binlift_binary_parser::{parse_structure, BinarySource};
use binlift_core::config::DependencyConfig;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Coarse role of a library, guessed from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    System,
    Runtime,
    Library,
    Graphics,
    Network,
}

/// One library reached from the main binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Location on disk, `None` when no search directory holds the file
    pub path: Option<PathBuf>,
    pub kind: DependencyKind,
    pub description: Option<String>,
}

impl Dependency {
    pub fn is_resolved(&self) -> bool {
        self.path.is_some()
    }
}

/// Resolves the transitive import closure of a binary
///
/// Import lists are cached per absolute path for the lifetime of the walker,
/// so one walker should be used per analysis run.
pub struct DependencyWalker {
    search_paths: Vec<PathBuf>,
    max_file_size: u64,
    cache: DashMap<PathBuf, Vec<String>>,
}

impl DependencyWalker {
    pub fn new(config: &DependencyConfig, max_file_size: u64) -> Self {
        Self {
            search_paths: config.system_search_paths.clone(),
            max_file_size,
            cache: DashMap::new(),
        }
    }

    /// Every library reachable from `main`, in discovery order
    ///
    /// Names are compared case-insensitively and keep the spelling they were
    /// first seen with. Libraries that cannot be located are listed without a path.
    pub fn walk(&self, main: &Path) -> Vec<Dependency> {
        let base_dir = main.parent().unwrap_or_else(|| Path::new("."));
        let mut found: IndexMap<String, Dependency> = IndexMap::new();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut queue = VecDeque::from([main.to_path_buf()]);

        while let Some(file) = queue.pop_front() {
            if !visited.insert(absolute(&file)) {
                continue;
            }

            for name in self.direct_dependencies(&file) {
                let key = name.to_ascii_lowercase();
                if found.contains_key(&key) {
                    continue;
                }

                let path = self.find_dependency_path(&name, base_dir);
                match &path {
                    Some(path) => queue.push_back(path.clone()),
                    None => debug!("Dependency {} not found on any search path", name),
                }
                found.insert(
                    key,
                    Dependency {
                        kind: Self::classify(&name),
                        description: Self::describe(&name),
                        name,
                        path,
                    },
                );
            }
        }

        debug!(
            "Walked {} files, {} dependencies from {}",
            visited.len(),
            found.len(),
            main.display()
        );
        found.into_values().collect()
    }

    /// Names only, in the order `walk` discovers them
    pub fn walk_dependencies(&self, main: &Path) -> Vec<String> {
        self.walk(main).into_iter().map(|d| d.name).collect()
    }

    /// Libraries a single file imports; unreadable files import nothing
    pub fn direct_dependencies(&self, path: &Path) -> Vec<String> {
        let key = absolute(path);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let imports = self.read_imports(path);
        self.cache.insert(key, imports.clone());
        imports
    }

    /// Seed the cache with an import list parsed elsewhere
    pub fn remember(&self, path: &Path, imports: Vec<String>) {
        self.cache.insert(absolute(path), imports);
    }

    fn read_imports(&self, path: &Path) -> Vec<String> {
        let source = match BinarySource::open(path, self.max_file_size) {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping dependency {}: {}", path.display(), e);
                return Vec::new();
            }
        };

        match parse_structure(&source) {
            Ok(structure) => structure.linked_libraries,
            Err(e) => {
                warn!("Could not read imports of {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Look for `name` next to the binary, in its `lib` and `bin` folders,
    /// then in the configured system directories
    pub fn find_dependency_path(&self, name: &str, base_dir: &Path) -> Option<PathBuf> {
        if !is_plain_file_name(name) {
            warn!("Ignoring import with a path component: {:?}", name);
            return None;
        }

        let local = [base_dir.to_path_buf(), base_dir.join("lib"), base_dir.join("bin")];
        local
            .iter()
            .chain(self.search_paths.iter())
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn classify(name: &str) -> DependencyKind {
        let name = name.to_lowercase();
        if name.contains("msvcr") || name.contains("ucrtbase") {
            DependencyKind::Runtime
        } else if name.contains("kernel32") || name.contains("ntdll") {
            DependencyKind::System
        } else if name.contains("opengl") || name.contains("d3d") {
            DependencyKind::Graphics
        } else if name.contains("ws2_32") || name.contains("wininet") {
            DependencyKind::Network
        } else {
            DependencyKind::Library
        }
    }

    fn describe(name: &str) -> Option<String> {
        let name = name.to_lowercase();
        let description = if name.contains("msvcr") {
            "Microsoft Visual C++ Runtime"
        } else if name.contains("kernel32") {
            "Windows Kernel API"
        } else if name.contains("user32") {
            "Windows User Interface API"
        } else {
            return None;
        };
        Some(description.to_string())
    }
}

/// Import names come from untrusted files and must not escape the search directories
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
