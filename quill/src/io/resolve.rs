//! Target path safety and fuzzy file resolution.

use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::core::operation::{OperationError, OperationKind};
use crate::io::config::ResolveConfig;

/// How an operation target was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The path as given (it exists, or will be created).
    Literal(PathBuf),
    /// A different existing file that matched the requested name.
    Fuzzy { path: PathBuf, tier: MatchTier },
}

impl Resolution {
    pub fn path(&self) -> &Path {
        match self {
            Resolution::Literal(path) | Resolution::Fuzzy { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// Same relative path, different case.
    PathCase,
    /// Same file name somewhere else, any case.
    FileName,
    /// File name containing (or contained in) the requested stem.
    Partial,
}

const MIN_PARTIAL_STEM: usize = 3;

/// Normalize a target into a workspace-relative path.
///
/// Rejects absolute paths, drive prefixes and any `..` component. Backslashes
/// are treated as separators.
pub fn safe_relative(raw: &str) -> Result<PathBuf, OperationError> {
    let normalized = raw.trim().replace('\\', "/");
    if normalized.is_empty() {
        return Err(OperationError::InvalidEntry("empty path".to_string()));
    }
    if normalized.starts_with('/') {
        return Err(OperationError::PathEscapesWorkspace(raw.to_string()));
    }
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OperationError::PathEscapesWorkspace(raw.to_string()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(OperationError::InvalidEntry(format!(
            "path '{raw}' names the working directory itself"
        )));
    }
    Ok(out)
}

/// Fail if the nearest existing ancestor of `root/relative` resolves outside `root`.
///
/// Catches symlinks inside the workspace that point elsewhere.
pub fn ensure_inside(root: &Path, relative: &Path) -> Result<(), OperationError> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| OperationError::Io(format!("canonicalize {}: {e}", root.display())))?;
    let mut probe = root.join(relative);
    loop {
        if probe.symlink_metadata().is_ok() {
            break;
        }
        if !probe.pop() {
            return Ok(());
        }
    }
    // A dangling symlink cannot be canonicalized; judge it by its parent.
    let resolved = match probe.canonicalize() {
        Ok(path) => path,
        Err(_) => match probe.parent().map(Path::canonicalize) {
            Some(Ok(parent)) => parent,
            _ => return Ok(()),
        },
    };
    if resolved.starts_with(&canonical_root) {
        Ok(())
    } else {
        Err(OperationError::PathEscapesWorkspace(relative.display().to_string()))
    }
}

/// Resolve the target of one operation against `root`.
pub fn resolve_target(
    root: &Path,
    raw: &str,
    kind: &OperationKind,
    config: &ResolveConfig,
) -> Result<Resolution, OperationError> {
    let relative = safe_relative(raw)?;
    ensure_inside(root, &relative)?;

    if root.join(&relative).exists() || !kind.resolves_fuzzily() {
        return Ok(Resolution::Literal(relative));
    }

    // Partial matches would silently redirect new files, so creating verbs stop at names.
    let max_tier = if kind.creates_target() {
        MatchTier::FileName
    } else {
        MatchTier::Partial
    };
    if let Some((path, tier)) = fuzzy_match(root, &relative, max_tier, config) {
        ensure_inside(root, &path)?;
        debug!(requested = %relative.display(), resolved = %path.display(), ?tier, "fuzzy-resolved target");
        return Ok(Resolution::Fuzzy { path, tier });
    }

    if kind.creates_target() {
        Ok(Resolution::Literal(relative))
    } else {
        Err(OperationError::NotFound(relative.display().to_string()))
    }
}

fn fuzzy_match(
    root: &Path,
    requested: &Path,
    max_tier: MatchTier,
    config: &ResolveConfig,
) -> Option<(PathBuf, MatchTier)> {
    let files = candidate_files(root, config);
    let target = Target {
        path: lower_path(requested),
        name: requested.file_name()?.to_string_lossy().to_lowercase(),
        stem: stem_lower(requested),
    };

    for tier in [MatchTier::PathCase, MatchTier::FileName, MatchTier::Partial] {
        let hits: Vec<&PathBuf> = files.iter().filter(|f| target.matches(tier, f)).collect();
        match hits.as_slice() {
            [] => {}
            [only] => return Some(((*only).clone(), tier)),
            _ => {
                debug!(requested = %requested.display(), candidates = hits.len(), ?tier, "ambiguous fuzzy match");
                return None;
            }
        }
        if tier == max_tier {
            break;
        }
    }
    None
}

/// The requested target, lowercased once.
struct Target {
    path: String,
    name: String,
    stem: String,
}

impl Target {
    fn matches(&self, tier: MatchTier, candidate: &Path) -> bool {
        match tier {
            MatchTier::PathCase => lower_path(candidate) == self.path,
            MatchTier::FileName => candidate
                .file_name()
                .is_some_and(|n| n.to_string_lossy().to_lowercase() == self.name),
            MatchTier::Partial => {
                let stem = stem_lower(candidate);
                stem.len() >= MIN_PARTIAL_STEM
                    && self.stem.len() >= MIN_PARTIAL_STEM
                    && (stem.contains(&self.stem) || self.stem.contains(&stem))
            }
        }
    }
}

/// Files under `root`, relative to it, bounded by depth and count.
fn candidate_files(root: &Path, config: &ResolveConfig) -> Vec<PathBuf> {
    WalkDir::new(root)
        .max_depth(config.max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !name.starts_with('.') && !config.skip_dirs.iter().any(|skip| *skip == name)
        })
        .filter_map(Result::ok)
        .take(config.max_entries)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}

fn lower_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

fn stem_lower(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
