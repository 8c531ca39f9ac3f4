//! Remote document index: translate a [`SearchQuery`] into [`RemoteArtifact`]s.
//!
//! Walks every file under the configured slip and invoice roots, any nesting
//! depth, and filters by normalized document number, modification-date range,
//! and an extension allow-list. Each directory is listed through its own
//! [`RemoteSession::with_connection`] call, so a mid-listing disconnect is
//! recovered transparently and the traversal resumes at directory
//! granularity.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::Config;
use crate::models::{
    normalize_number, number_from_file_name, ArtifactKind, MatchMode, RemoteArtifact, SearchQuery,
};
use crate::session::{RemoteSession, SessionError};

/// Query-level failures. Session errors inside a root traversal are wrapped;
/// transient transport problems never reach here (the session retries them).
#[derive(Debug)]
pub enum SearchError {
    /// A configured root could not be listed at all.
    Root { root: String, source: SessionError },
    /// The session gave up mid-traversal.
    Session(SessionError),
    /// The query itself is unusable.
    InvalidQuery(String),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Root { root, source } => {
                write!(f, "cannot list root directory {}: {}", root, source)
            }
            SearchError::Session(e) => write!(f, "remote search failed: {}", e),
            SearchError::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
        }
    }
}

impl std::error::Error for SearchError {}

impl From<SessionError> for SearchError {
    fn from(e: SessionError) -> Self {
        SearchError::Session(e)
    }
}

/// Recursive search over the remote store's slip and invoice roots.
pub struct RemoteDocumentIndex {
    session: Arc<RemoteSession>,
    roots: Vec<(ArtifactKind, String)>,
    allow: GlobSet,
}

impl RemoteDocumentIndex {
    pub fn new(session: Arc<RemoteSession>, config: &Config) -> Result<Self> {
        let mut roots = vec![(ArtifactKind::Slip, config.remote.slip_root.clone())];
        if let Some(invoice_root) = &config.remote.invoice_root {
            roots.push((ArtifactKind::Invoice, invoice_root.clone()));
        }
        let allow = build_extension_set(&config.search.allowed_extensions)?;
        Ok(Self {
            session,
            roots,
            allow,
        })
    }

    /// Run one search. Results come in directory-traversal order; date-only
    /// searches are re-sorted newest first for display.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<RemoteArtifact>, SearchError> {
        let number = query.number.as_deref().map(normalize_number);
        if let Some(digits) = &number {
            if digits.is_empty() {
                return Err(SearchError::InvalidQuery(
                    "document number contains no digits".into(),
                ));
            }
        }
        let mut artifacts = Vec::new();
        for (kind, root) in &self.roots {
            self.scan_root(*kind, root, query, number.as_deref(), &mut artifacts)?;
        }

        if number.is_none() {
            artifacts.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        }

        Ok(artifacts)
    }

    fn scan_root(
        &self,
        kind: ArtifactKind,
        root: &str,
        query: &SearchQuery,
        number: Option<&str>,
        artifacts: &mut Vec<RemoteArtifact>,
    ) -> Result<(), SearchError> {
        let (since, until) = query.window();
        let mut pending = vec![root.to_string()];
        let mut is_root = true;

        while let Some(dir) = pending.pop() {
            let listed = self.session.with_connection(|t| t.list_dir(&dir));
            let entries = match listed {
                Ok(entries) => entries,
                Err(source) if is_root => {
                    return Err(SearchError::Root {
                        root: root.to_string(),
                        source,
                    })
                }
                Err(e @ SessionError::ConnectionLost { .. }) => return Err(e.into()),
                Err(e) => {
                    // No permission (or a vanished subdirectory): skip it,
                    // the rest of the tree is still worth listing.
                    tracing::warn!("skipping {}: {}", dir, e);
                    continue;
                }
            };
            is_root = false;

            for entry in entries {
                if entry.is_dir {
                    if query.recursive {
                        pending.push(entry.path);
                    }
                    continue;
                }
                if !self.allow.is_match(&entry.name) {
                    continue;
                }
                if let Some(digits) = number {
                    if !matches_number(&normalize_number(&entry.name), digits, query.mode) {
                        continue;
                    }
                }
                if let Some(start) = since {
                    if entry.modified_at < start {
                        continue;
                    }
                }
                if let Some(end) = until {
                    if entry.modified_at > end {
                        continue;
                    }
                }
                artifacts.push(RemoteArtifact {
                    number: number_from_file_name(&entry.name),
                    path: entry.path,
                    name: entry.name,
                    size: entry.size,
                    modified_at: entry.modified_at,
                    kind,
                });
            }
        }
        Ok(())
    }
}

/// Match a file's digits against the query digits.
///
/// Substring mode is plain containment on normalized text, so a number that is
/// a substring of another matches both. Literal mode expects the branch
/// layout (6 branch digits + 9 document digits) and compares the document
/// window against the query zero-padded to 9; names too short for the layout
/// fall back to containment.
fn matches_number(name_digits: &str, query_digits: &str, mode: MatchMode) -> bool {
    match mode {
        MatchMode::Substring => name_digits.contains(query_digits),
        MatchMode::Literal => {
            if name_digits.len() >= 15 {
                let padded = format!("{:0>9}", query_digits);
                name_digits[6..15] == padded
            } else {
                name_digits.contains(query_digits)
            }
        }
    }
}

fn build_extension_set(extensions: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for ext in extensions {
        let pattern = format!("*{}", ext);
        builder.add(
            GlobBuilder::new(&pattern)
                .case_insensitive(true)
                .build()?,
        );
    }
    Ok(builder.build()?)
}
