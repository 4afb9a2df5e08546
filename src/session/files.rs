//! File operations scoped to the session root.
//!
//! Paths are virtual: relative paths resolve against the root, absolute paths
//! must lie under it, and nothing may climb above it.

use futures::stream::{self, BoxStream, StreamExt};
use globset::{GlobBuilder, GlobMatcher};
use grep_matcher::Matcher;
use grep_regex::{RegexMatcher, RegexMatcherBuilder};
use grep_searcher::{BinaryDetection, SearcherBuilder, sinks::UTF8};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::SystemTime;

use super::{BusyGuard, FileError, Session, SessionError};
use crate::sandbox::{BackendError, EntryInfo};

/// Lines returned by `read_file` when no limit is given.
pub const DEFAULT_READ_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Every matching line.
    #[default]
    Content,
    /// One entry per file with at least one match.
    FilesWithMatches,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub case_insensitive: bool,
    /// Restricts which files are searched, e.g. `*.py`.
    pub glob: Option<String>,
    /// Lets patterns span lines and `.` match newlines.
    pub multiline: bool,
    /// Skip this many results before yielding.
    pub offset: usize,
    pub head_limit: Option<usize>,
}

/// One search hit. `line` is 0 in files-with-matches mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentMatch {
    pub path: String,
    pub line: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub path: String,
    pub replacements: usize,
    /// Unified diff of the change.
    pub diff: String,
}

/// Compiles a file pattern. A pattern without `/` matches at any depth;
/// one with `/` is anchored at the search directory.
fn compile_glob(pattern: &str) -> Result<GlobMatcher, FileError> {
    let trimmed = pattern.trim().trim_start_matches("./");
    let anchored = if trimmed.contains('/') {
        trimmed.to_string()
    } else {
        format!("**/{trimmed}")
    };
    GlobBuilder::new(&anchored)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| FileError::InvalidArgument {
            path: pattern.to_string(),
            reason: format!("invalid glob: {e}"),
        })
}

/// `path` relative to `dir`, both relative to the session root.
fn relative_to<'a>(dir: &str, path: &'a str) -> &'a str {
    if dir.is_empty() {
        return path;
    }
    match path.strip_prefix(dir) {
        Some("") => path.rsplit('/').next().unwrap_or(path),
        Some(rest) => rest.strip_prefix('/').unwrap_or(rest),
        None => path,
    }
}

fn build_matcher(pattern: &str, options: &SearchOptions) -> Result<RegexMatcher, FileError> {
    RegexMatcherBuilder::new()
        .case_insensitive(options.case_insensitive)
        .multi_line(options.multiline)
        .dot_matches_new_line(options.multiline)
        .build(pattern)
        .map_err(|e| FileError::InvalidArgument {
            path: pattern.to_string(),
            reason: format!("invalid regex: {e}"),
        })
}

/// Hits in one file. Binary files yield nothing.
fn search_bytes(
    matcher: &RegexMatcher,
    options: &SearchOptions,
    path: &str,
    bytes: &[u8],
) -> Vec<ContentMatch> {
    let mut searcher = SearcherBuilder::new()
        .line_number(true)
        .multi_line(options.multiline)
        .binary_detection(BinaryDetection::quit(b'\x00'))
        .build();
    let files_only = options.mode == SearchMode::FilesWithMatches;
    let mut hits = Vec::new();
    let result = searcher.search_slice(
        matcher,
        bytes,
        UTF8(|line, text| {
            if files_only {
                hits.push(ContentMatch {
                    path: path.to_string(),
                    line: 0,
                    text: String::new(),
                });
                return Ok(false);
            }
            hits.push(ContentMatch {
                path: path.to_string(),
                line,
                text: text.trim_end_matches(['\n', '\r']).to_string(),
            });
            Ok(true)
        }),
    );
    if let Err(e) = result {
        tracing::debug!(path = %path, "Skipping unsearchable file: {}", e);
    }
    hits
}

struct SearchState<'a> {
    session: &'a Session,
    _busy: BusyGuard<'a>,
    files: std::vec::IntoIter<String>,
    pending: VecDeque<ContentMatch>,
    matcher: RegexMatcher,
    options: SearchOptions,
}

impl Session {
    /// Normalizes a user path to one relative to the session root.
    /// The root itself is `""`.
    pub fn resolve_path(&self, path: &str) -> Result<String, FileError> {
        let trimmed = path.trim();
        let root = self.root().trim_end_matches('/');
        let relative = if trimmed == root {
            ""
        } else if let Some(rest) = trimmed.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
            rest
        } else if trimmed.starts_with('/') {
            return Err(FileError::Permission {
                path: path.to_string(),
                reason: "outside the session root".to_string(),
            });
        } else {
            trimmed
        };

        let mut parts: Vec<&str> = Vec::new();
        for part in relative.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(FileError::Permission {
                            path: path.to_string(),
                            reason: "escapes the session root".to_string(),
                        });
                    }
                }
                other => parts.push(other),
            }
        }
        Ok(parts.join("/"))
    }

    /// Files under `dir` (root if `""`), or `None` if it does not exist.
    async fn files_under(&self, dir: &str) -> Result<Option<Vec<EntryInfo>>, SessionError> {
        match self.backend.list_entries(&self.env, dir).await {
            Ok(entries) => Ok(Some(entries.into_iter().filter(|e| !e.is_dir).collect())),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(self.backend_failure(e, dir)),
        }
    }

    /// Files matching `pattern`, newest first. Paths are relative to the
    /// session root.
    pub async fn list_files(
        &self,
        pattern: &str,
        path: Option<&str>,
    ) -> Result<impl Iterator<Item = String> + Send + 'static, SessionError> {
        let glob = compile_glob(pattern)?;
        let dir = self.resolve_path(path.unwrap_or(""))?;
        let _busy = self.begin("list files").await?;

        let Some(entries) = self.files_under(&dir).await? else {
            return Err(FileError::NotFound { path: dir }.into());
        };
        let mut matched: Vec<(Option<SystemTime>, String)> = entries
            .into_iter()
            .filter(|e| glob.is_match(relative_to(&dir, &e.path)))
            .map(|e| (e.modified, e.path))
            .collect();
        matched.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(matched.into_iter().map(|(_, path)| path))
    }

    /// Regex search over files under `path`.
    ///
    /// Files are fetched one at a time as the stream is polled, so dropping
    /// the stream early skips the rest. The session stays busy until the
    /// stream is dropped.
    pub async fn search_content(
        &self,
        pattern: &str,
        path: Option<&str>,
        options: SearchOptions,
    ) -> Result<BoxStream<'_, Result<ContentMatch, SessionError>>, SessionError> {
        let matcher = build_matcher(pattern, &options)?;
        let filter = options.glob.as_deref().map(compile_glob).transpose()?;
        let dir = self.resolve_path(path.unwrap_or(""))?;
        let busy = self.begin("search files").await?;

        let Some(entries) = self.files_under(&dir).await? else {
            return Err(FileError::NotFound { path: dir }.into());
        };
        let mut files: Vec<String> = entries
            .into_iter()
            .map(|e| e.path)
            .filter(|p| {
                filter
                    .as_ref()
                    .is_none_or(|g| g.is_match(relative_to(&dir, p)))
            })
            .collect();
        files.sort();

        let offset = options.offset;
        let limit = options.head_limit.unwrap_or(usize::MAX);
        let state = SearchState {
            session: self,
            _busy: busy,
            files: files.into_iter(),
            pending: VecDeque::new(),
            matcher,
            options,
        };

        let hits = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(hit) = st.pending.pop_front() {
                    return Some((Ok(hit), st));
                }
                let path = st.files.next()?;
                match st.session.backend.download_file(&st.session.env, &path).await {
                    Ok(bytes) => {
                        let found = search_bytes(&st.matcher, &st.options, &path, &bytes);
                        st.pending.extend(found);
                    }
                    // Removed since listing.
                    Err(BackendError::NotFound(_)) => {}
                    Err(e) => {
                        let err = st.session.backend_failure(e, &path);
                        st.files = Vec::new().into_iter();
                        return Some((Err(err), st));
                    }
                }
            }
        });
        Ok(hits.skip(offset).take(limit).boxed())
    }

    /// Number of matches per file, for files with at least one.
    pub async fn count_matches(
        &self,
        pattern: &str,
        path: Option<&str>,
        options: SearchOptions,
    ) -> Result<Vec<(String, usize)>, SessionError> {
        let matcher = build_matcher(pattern, &options)?;
        let mut files = self
            .search_content(
                pattern,
                path,
                SearchOptions {
                    mode: SearchMode::FilesWithMatches,
                    offset: 0,
                    head_limit: None,
                    ..options
                },
            )
            .await?;

        let mut paths = Vec::new();
        while let Some(hit) = files.next().await {
            paths.push(hit?.path);
        }
        drop(files);

        let mut counts = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = self.read_bytes(&path).await?;
            let mut count = 0;
            // The matcher is infallible over byte slices.
            let _ = matcher.find_iter(&bytes, |_| {
                count += 1;
                true
            });
            counts.push((path, count));
        }
        Ok(counts)
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        let rel = self.resolve_path(path)?;
        let _busy = self.begin("read file").await?;
        self.backend
            .download_file(&self.env, &rel)
            .await
            .map_err(|e| self.backend_failure(e, &rel))
    }

    /// Reads a text file as numbered lines. `offset` is the 1-based first
    /// line; `limit` defaults to [`DEFAULT_READ_LIMIT`].
    pub async fn read_file(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, SessionError> {
        let bytes = self.read_bytes(path).await?;
        let text = String::from_utf8_lossy(&bytes);
        let start = offset.unwrap_or(1).max(1) - 1;
        let limit = limit.unwrap_or(DEFAULT_READ_LIMIT);
        let lines: Vec<String> = text
            .lines()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(i, line)| format!("{:>6}\u{2192}{line}", i + 1))
            .collect();
        Ok(lines.join("\n"))
    }

    fn check_file_size(&self, rel: &str, len: usize) -> Result<(), FileError> {
        let limit = self.settings.max_file_size;
        if limit > 0 && len > limit {
            return Err(FileError::Conflict {
                path: rel.to_string(),
                reason: format!("{len} bytes exceeds the {limit} byte file size limit"),
            });
        }
        Ok(())
    }

    /// Creates or overwrites a file, making parent directories as needed.
    /// Returns the number of bytes written.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<usize, SessionError> {
        let rel = self.resolve_path(path)?;
        if rel.is_empty() {
            return Err(FileError::Conflict {
                path: path.to_string(),
                reason: "is the session root".to_string(),
            }
            .into());
        }
        self.check_file_size(&rel, content.len())?;
        let _busy = self.begin("write file").await?;
        self.backend
            .upload_file(&self.env, &rel, content.as_bytes())
            .await
            .map_err(|e| self.backend_failure(e, &rel))?;
        tracing::debug!(session_id = %self.id, path = %rel, bytes = content.len(), "Wrote file");
        Ok(content.len())
    }

    /// Replaces the single occurrence of `old` with `new`.
    pub async fn edit_file(
        &self,
        path: &str,
        old: &str,
        new: &str,
    ) -> Result<EditOutcome, SessionError> {
        self.apply_edit(path, old, new, false).await
    }

    /// Replaces every occurrence of `old` with `new`.
    pub async fn replace_all(
        &self,
        path: &str,
        old: &str,
        new: &str,
    ) -> Result<EditOutcome, SessionError> {
        self.apply_edit(path, old, new, true).await
    }

    async fn apply_edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        all: bool,
    ) -> Result<EditOutcome, SessionError> {
        let rel = self.resolve_path(path)?;
        let invalid = |reason: &str| FileError::InvalidArgument {
            path: rel.clone(),
            reason: reason.to_string(),
        };
        if old.is_empty() {
            return Err(invalid("old_string cannot be empty").into());
        }
        if old == new {
            return Err(invalid("old_string and new_string must be different").into());
        }

        let _busy = self.begin("edit file").await?;
        let bytes = self
            .backend
            .download_file(&self.env, &rel)
            .await
            .map_err(|e| self.backend_failure(e, &rel))?;
        let content = String::from_utf8(bytes).map_err(|_| invalid("not a UTF-8 text file"))?;

        let count = content.matches(old).count();
        if count == 0 {
            return Err(FileError::NoMatch { path: rel }.into());
        }
        if count > 1 && !all {
            return Err(FileError::AmbiguousMatch { path: rel, count }.into());
        }

        let updated = if all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };
        self.check_file_size(&rel, updated.len())?;
        self.backend
            .upload_file(&self.env, &rel, updated.as_bytes())
            .await
            .map_err(|e| self.backend_failure(e, &rel))?;

        let diff = similar::TextDiff::from_lines(&content, &updated);
        let mut rendered = String::new();
        for hunk in diff.unified_diff().header(&rel, &rel).iter_hunks() {
            rendered.push_str(&hunk.to_string());
        }
        tracing::debug!(session_id = %self.id, path = %rel, replacements = count, "Edited file");
        Ok(EditOutcome {
            path: rel,
            replacements: count,
            diff: rendered,
        })
    }
}
