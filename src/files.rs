//! Input file enumeration.
//!
//! Expands glob patterns the way a shell would (`**` spans directories,
//! `*` stays within one path component) by walking the literal directory
//! prefix of each pattern. Every call to [`FileScan::paths`] globs again,
//! so a scan can be restarted to pick up new files.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use globset::{GlobBuilder, GlobMatcher};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use walkdir::WalkDir;

struct Pattern {
    text: String,
    /// Literal directory the walk starts from; empty for the current directory.
    root: PathBuf,
    /// Matcher for the part of the pattern below `root`.
    matcher: Option<GlobMatcher>,
    max_depth: Option<usize>,
}

/// A restartable set of input files.
pub struct FileScan {
    patterns: Vec<Pattern>,
    min_modification_time: Option<SystemTime>,
}

impl FileScan {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| compile_pattern(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            min_modification_time: None,
        })
    }

    /// Skip files last modified before `min` (interpreted as UTC).
    pub fn with_min_modification_time(mut self, min: Option<NaiveDateTime>) -> Self {
        self.min_modification_time = min.map(|t| {
            let secs = t.and_utc().timestamp();
            if secs >= 0 {
                UNIX_EPOCH + Duration::from_secs(secs as u64)
            } else {
                UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
            }
        });
        self
    }

    /// Matching files, pattern by pattern, each pattern in file name order.
    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.patterns
            .iter()
            .flat_map(expand)
            .filter(move |path| self.is_recent_enough(path))
    }

    fn is_recent_enough(&self, path: &Path) -> bool {
        let Some(min) = self.min_modification_time else {
            return true;
        };
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(UNIX_EPOCH);
        if modified < min {
            info!(
                "Skipping file \"{}\": file modification time earlier than specified min",
                path.display()
            );
            false
        } else {
            true
        }
    }
}

fn has_magic(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}

fn compile_pattern(text: &str) -> Result<Pattern> {
    if !has_magic(text) {
        return Ok(Pattern {
            text: text.to_string(),
            root: PathBuf::from(text),
            matcher: None,
            max_depth: None,
        });
    }

    let mut root = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();
    for component in Path::new(text).components() {
        let part = component.as_os_str().to_string_lossy().to_string();
        if rest.is_empty() && !has_magic(&part) {
            root.push(component);
        } else if !matches!(component, Component::CurDir) {
            rest.push(part);
        }
    }

    let relative = rest.join("/");
    let glob = GlobBuilder::new(&relative)
        .literal_separator(true)
        .build()
        .with_context(|| format!("Invalid file pattern: {}", text))?;
    let max_depth = if rest.iter().any(|part| part.contains("**")) {
        None
    } else {
        Some(rest.len())
    };

    Ok(Pattern {
        text: text.to_string(),
        root,
        matcher: Some(glob.compile_matcher()),
        max_depth,
    })
}

fn expand(pattern: &Pattern) -> Vec<PathBuf> {
    let Some(matcher) = &pattern.matcher else {
        return if pattern.root.is_file() {
            vec![pattern.root.clone()]
        } else {
            debug!("No file matches {}", pattern.text);
            Vec::new()
        };
    };

    let walk_root = if pattern.root.as_os_str().is_empty() {
        Path::new(".")
    } else {
        pattern.root.as_path()
    };
    let mut walker = WalkDir::new(walk_root).sort_by_file_name();
    if let Some(depth) = pattern.max_depth {
        walker = walker.max_depth(depth);
    }

    let mut paths = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry while expanding {}: {}", pattern.text, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(walk_root).unwrap_or(entry.path());
        if !matcher.is_match(relative) {
            continue;
        }
        if pattern.root.as_os_str().is_empty() {
            paths.push(relative.to_path_buf());
        } else {
            paths.push(entry.path().to_path_buf());
        }
    }
    paths
}
