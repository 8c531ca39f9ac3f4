//! Search-and-reconcile orchestration.
//!
//! Coordinates the full flow: remote listing → grouping → chained authority
//! lookups → optional field extraction from the slips themselves. The remote
//! traversal runs on the blocking pool (the transport is synchronous);
//! lookups run as a bounded worker pool, one in-flight task per document
//! number, capped so the authority's API is not saturated.
//!
//! The matcher is owned by this task alone and folds completions in arrival
//! order (single-writer), so out-of-order completion is harmless. On
//! cancellation, spawned lookups are left to finish on their own; their
//! results are discarded rather than merged.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::authority::{LookupError, TaxAuthorityClient};
use crate::extract;
use crate::fields;
use crate::index::RemoteDocumentIndex;
use crate::matcher::DocumentMatcher;
use crate::models::{DocumentGroup, SearchQuery};
use crate::session::RemoteSession;

pub struct ReconcileOptions {
    /// Cap on concurrently in-flight authority lookups.
    pub lookup_workers: usize,
    /// Fetch each group's slip/invoice PDF and extract customer fields.
    pub extract_names: bool,
    /// Merge precedence for customer names (see [`DocumentMatcher::new`]).
    pub prefer_authority: bool,
}

pub struct ReconcileOutcome {
    /// Groups in first-seen order.
    pub groups: Vec<DocumentGroup>,
    /// How many remote files matched the query.
    pub artifacts_found: usize,
    /// Per-document lookup failures. The affected groups are still present,
    /// with their tax-record slots empty.
    pub lookup_failures: Vec<(String, LookupError)>,
    /// The caller abandoned the search before it finished.
    pub cancelled: bool,
}

pub async fn run_reconcile(
    session: Arc<RemoteSession>,
    index: Arc<RemoteDocumentIndex>,
    authority: Option<Arc<TaxAuthorityClient>>,
    query: SearchQuery,
    options: ReconcileOptions,
    cancel: CancellationToken,
) -> Result<ReconcileOutcome> {
    // Remote traversal: blocking I/O, one task. A mid-listing disconnect is
    // handled inside the session, not here.
    let artifacts = {
        let index = Arc::clone(&index);
        let query = query.clone();
        tokio::task::spawn_blocking(move || index.search(&query))
            .await
            .context("remote search task panicked")??
    };
    let artifacts_found = artifacts.len();

    let mut matcher = DocumentMatcher::new(options.prefer_authority);
    for artifact in artifacts {
        matcher.upsert_artifact(artifact);
    }

    let mut lookup_failures = Vec::new();
    let mut cancelled = cancel.is_cancelled();

    if let Some(client) = authority {
        if !cancelled {
            cancelled = run_lookups(
                &client,
                &mut matcher,
                &mut lookup_failures,
                options.lookup_workers,
                &cancel,
            )
            .await?;
        }
    }

    if options.extract_names && !cancelled {
        cancelled = extract_names(&session, &mut matcher, &cancel).await?;
    }

    Ok(ReconcileOutcome {
        groups: matcher.into_groups(),
        artifacts_found,
        lookup_failures,
        cancelled,
    })
}

/// Spawn one lookup task per document number, bounded by a semaphore, and
/// fold results as they land. Returns whether the batch was cancelled.
async fn run_lookups(
    client: &Arc<TaxAuthorityClient>,
    matcher: &mut DocumentMatcher,
    failures: &mut Vec<(String, LookupError)>,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<bool> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let handles: Vec<_> = matcher
        .numbers()
        .into_iter()
        .map(|number| {
            let client = Arc::clone(client);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            number,
                            Err(LookupError::Network("lookup pool closed".into())),
                        )
                    }
                };
                let result = client.lookup(&number).await;
                drop(permit);
                (number, result)
            })
        })
        .collect();

    for handle in handles {
        tokio::select! {
            _ = cancel.cancelled() => {
                // In-flight tasks keep running; their results are dropped.
                return Ok(true);
            }
            joined = handle => {
                let (number, result) = joined.context("lookup task panicked")?;
                match result {
                    Ok(Some(record)) => matcher.upsert_tax_record(record),
                    Ok(None) => {
                        // Valid empty result: no authority counterpart.
                    }
                    Err(e) => {
                        tracing::warn!("authority lookup for {} failed: {}", number, e);
                        failures.push((number, e));
                    }
                }
            }
        }
    }
    Ok(false)
}

/// Download each group's slip (invoice as fallback), extract its text, and
/// merge the customer fields. A failure on one document never aborts the
/// pass.
async fn extract_names(
    session: &Arc<RemoteSession>,
    matcher: &mut DocumentMatcher,
    cancel: &CancellationToken,
) -> Result<bool> {
    let targets: Vec<(String, String)> = matcher
        .groups()
        .filter_map(|group| {
            group
                .slip
                .as_ref()
                .or(group.invoice.as_ref())
                .map(|artifact| (group.number.clone(), artifact.path.clone()))
        })
        .collect();

    for (number, path) in targets {
        if cancel.is_cancelled() {
            return Ok(true);
        }
        let session = Arc::clone(session);
        let remote_path = path.clone();
        let fetched = tokio::task::spawn_blocking(move || {
            session.with_connection(|t| t.read_file(&remote_path))
        })
        .await
        .context("fetch task panicked")?;

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("fetch {} failed: {}", path, e);
                continue;
            }
        };
        match extract::pdf_text(&bytes) {
            Ok(text) => {
                let slip_fields = fields::extract_slip_fields(&text);
                let name = fields::customer_name(&text);
                matcher.apply_slip_fields(&number, name, &slip_fields);
            }
            Err(e) => {
                tracing::warn!("text extraction for {} failed: {}", number, e);
            }
        }
    }
    Ok(false)
}
