//! # busca-fiscal CLI (`bfis`)
//!
//! The `bfis` binary drives the search-and-reconcile pipeline from the
//! terminal. All commands accept a `--config` flag pointing to a TOML
//! configuration file with the remote store, authority endpoints, and
//! certificate settings.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bfis check` | Validate configuration, certificate, and (optionally) the remote connection |
//! | `bfis search` | Search the remote store and reconcile with the authority |
//! | `bfis lookup <number>` | Run one chained NFS-e lookup |
//! | `bfis fetch <remote-path>` | Download a single remote file |
//!
//! ## Examples
//!
//! ```bash
//! # Everything configured correctly?
//! bfis check --remote
//!
//! # Reconcile one document number
//! bfis search --number 5909
//!
//! # Everything modified in May, slips and invoices, no authority calls
//! bfis search --since 2024-05-01 --until 2024-05-31 --no-authority
//!
//! # Exact (branch-layout) matching, with customer names from the PDFs
//! bfis search --number 5909 --exact --names
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use busca_fiscal::authority::TaxAuthorityClient;
use busca_fiscal::config::{self, Config};
use busca_fiscal::index::RemoteDocumentIndex;
use busca_fiscal::models::{MatchMode, SearchQuery};
use busca_fiscal::progress::ReporterMode;
use busca_fiscal::reconcile::{run_reconcile, ReconcileOptions};
use busca_fiscal::session::{Credentials, ReconnectPolicy, RemoteSession};
use busca_fiscal::transport_sftp::SftpTransport;

/// busca-fiscal: remote payment-slip retrieval and NFS-e reconciliation.
#[derive(Parser)]
#[command(
    name = "bfis",
    about = "Search remote payment slips and reconcile them with NFS-e records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./bfis.toml")]
    config: PathBuf,

    /// Session status output: off, human, or json. Defaults to human when
    /// stderr is a terminal.
    #[arg(long, global = true)]
    status: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and certificate; probe the remote with --remote.
    Check {
        /// Also connect to the remote store.
        #[arg(long)]
        remote: bool,
    },

    /// Search the remote store and reconcile with the tax authority.
    ///
    /// Requires a document number, a date range, or both. Results are one
    /// row per document number, slips and invoices grouped together with
    /// their authority record.
    Search {
        /// Document number, exact or partial.
        #[arg(long)]
        number: Option<String>,

        /// Only files modified on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only files modified on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Branch-layout matching instead of substring containment.
        #[arg(long)]
        exact: bool,

        /// Do not descend into subdirectories.
        #[arg(long)]
        no_recursive: bool,

        /// Skip the authority lookups entirely.
        #[arg(long)]
        no_authority: bool,

        /// Fetch each group's PDF and extract customer name, due date, amount.
        #[arg(long)]
        names: bool,
    },

    /// Run one chained NFS-e lookup for a document number.
    Lookup {
        /// Document number.
        number: String,

        /// Write NFSe_<number>.xml (and .pdf when available) into the
        /// download directory.
        #[arg(long)]
        save: bool,
    },

    /// Download a single file from the remote store.
    Fetch {
        /// Full remote path.
        remote_path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let reporter_mode = match cli.status.as_deref() {
        None => ReporterMode::default_for_tty(),
        Some("off") => ReporterMode::Off,
        Some("human") => ReporterMode::Human,
        Some("json") => ReporterMode::Json,
        Some(other) => anyhow::bail!("Unknown status mode: '{}'. Must be off, human, or json.", other),
    };

    match cli.command {
        Commands::Check { remote } => run_check(&cfg, remote, reporter_mode),
        Commands::Search {
            number,
            since,
            until,
            exact,
            no_recursive,
            no_authority,
            names,
        } => {
            let query = SearchQuery {
                number,
                since: since.as_deref().map(parse_date).transpose()?,
                until: until.as_deref().map(parse_date).transpose()?,
                recursive: !no_recursive,
                mode: if exact {
                    MatchMode::Literal
                } else {
                    cfg.search.match_mode
                },
            };
            if query.number.is_none() && query.since.is_none() && query.until.is_none() {
                anyhow::bail!("search needs --number and/or a --since/--until date range");
            }
            run_search(&cfg, query, no_authority, names, reporter_mode).await
        }
        Commands::Lookup { number, save } => run_lookup(&cfg, &number, save).await,
        Commands::Fetch { remote_path } => run_fetch(&cfg, &remote_path, reporter_mode).await,
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

fn build_session(cfg: &Config, mode: ReporterMode) -> Arc<RemoteSession> {
    let timeout = Duration::from_secs(cfg.search.timeout_secs);
    let transport = SftpTransport::new(&cfg.remote, timeout);
    let credentials = Credentials {
        user: cfg.remote.user.clone(),
        password: cfg.remote.password.clone(),
        private_key: cfg.remote.private_key.clone(),
    };
    let policy = ReconnectPolicy {
        max_attempts: cfg.search.reconnect_attempts,
        delay: Duration::from_millis(cfg.search.reconnect_delay_ms),
    };
    Arc::new(
        RemoteSession::new(Box::new(transport), credentials, policy)
            .with_reporter(mode.reporter()),
    )
}

fn build_authority(cfg: &Config) -> Result<Option<Arc<TaxAuthorityClient>>> {
    let Some(authority) = &cfg.authority else {
        return Ok(None);
    };
    let client = TaxAuthorityClient::new(
        authority,
        cfg.certificate.as_ref(),
        Duration::from_secs(cfg.search.timeout_secs),
    )?;
    Ok(Some(Arc::new(client)))
}

fn run_check(cfg: &Config, probe_remote: bool, mode: ReporterMode) -> Result<()> {
    println!("{:<14} OK  ({} extension filters)", "CONFIG", cfg.search.allowed_extensions.len());

    match (&cfg.authority, &cfg.certificate) {
        (Some(authority), Some(_)) => match build_authority(cfg) {
            Ok(_) => println!("{:<14} OK  ({})", "CERTIFICATE", authority.dps_url),
            Err(e) => println!("{:<14} FAILED  {}", "CERTIFICATE", e),
        },
        (Some(_), None) => println!("{:<14} NOT CONFIGURED (lookups will be skipped)", "CERTIFICATE"),
        (None, _) => println!("{:<14} NOT CONFIGURED", "AUTHORITY"),
    }

    if probe_remote {
        let session = build_session(cfg, mode);
        match session.connect() {
            Ok(()) => {
                println!(
                    "{:<14} OK  connected to {}:{}",
                    "REMOTE", cfg.remote.host, cfg.remote.port
                );
                session.close();
            }
            Err(e) => {
                println!("{:<14} FAILED  {}", "REMOTE", e);
                anyhow::bail!("remote connection check failed");
            }
        }
    }

    Ok(())
}

async fn run_search(
    cfg: &Config,
    query: SearchQuery,
    no_authority: bool,
    names: bool,
    mode: ReporterMode,
) -> Result<()> {
    let session = build_session(cfg, mode);
    let index = Arc::new(RemoteDocumentIndex::new(Arc::clone(&session), cfg)?);

    let authority = if no_authority {
        None
    } else if cfg.authority.is_some() && cfg.certificate.is_none() {
        tracing::warn!("no certificate configured; skipping authority lookups");
        None
    } else {
        build_authority(cfg)?
    };

    let cancel = CancellationToken::new();
    let outcome = run_reconcile(
        Arc::clone(&session),
        index,
        authority,
        query,
        ReconcileOptions {
            lookup_workers: cfg.search.lookup_workers,
            extract_names: names,
            prefer_authority: cfg.matcher.prefer_authority,
        },
        cancel,
    )
    .await?;
    session.close();

    if outcome.groups.is_empty() {
        println!("No documents found.");
        return Ok(());
    }

    println!(
        "{:<12} {:<28} {:<28} {:<4} {:<4} {:<26} {:<11} {}",
        "NUMBER", "SLIP", "INVOICE", "XML", "PDF", "CUSTOMER", "DUE", "AMOUNT"
    );
    for group in &outcome.groups {
        println!(
            "{:<12} {:<28} {:<28} {:<4} {:<4} {:<26} {:<11} {}",
            group.number,
            artifact_cell(&group.slip),
            artifact_cell(&group.invoice),
            presence(group.tax_xml.is_some()),
            presence(group.tax_pdf.is_some()),
            group.customer_name.as_deref().unwrap_or("-"),
            group.due_date.as_deref().unwrap_or("-"),
            group.amount.as_deref().unwrap_or("-"),
        );
    }
    println!();
    println!("  files matched: {}", outcome.artifacts_found);
    println!("  document groups: {}", outcome.groups.len());
    if !outcome.lookup_failures.is_empty() {
        println!("  lookup failures: {}", outcome.lookup_failures.len());
        for (number, error) in &outcome.lookup_failures {
            println!("    {}: {}", number, error);
        }
    }
    println!("ok");
    Ok(())
}

fn artifact_cell(artifact: &Option<busca_fiscal::models::RemoteArtifact>) -> String {
    artifact
        .as_ref()
        .map(|a| a.name.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn presence(present: bool) -> &'static str {
    if present {
        "yes"
    } else {
        "-"
    }
}

async fn run_lookup(cfg: &Config, number: &str, save: bool) -> Result<()> {
    if cfg.certificate.is_none() {
        anyhow::bail!(
            "no [certificate] configured; the authority requires a PKCS#12 client certificate"
        );
    }
    let client = build_authority(cfg)?
        .context("no [authority] endpoints configured")?;

    let Some(record) = client.lookup(number).await? else {
        println!("No authority record for document {}.", number);
        return Ok(());
    };

    println!("document:   {}", record.number);
    println!("access key: {}", record.access_key);
    println!("customer:   {}", record.customer_name.as_deref().unwrap_or("-"));
    println!("issued:     {}", record.issue_date.as_deref().unwrap_or("-"));
    println!("xml bytes:  {}", record.xml.len());
    println!(
        "pdf bytes:  {}",
        record.pdf.as_ref().map(Vec::len).unwrap_or(0)
    );

    if save {
        std::fs::create_dir_all(&cfg.local.download_dir)?;
        let xml_path = cfg
            .local
            .download_dir
            .join(format!("NFSe_{}.xml", record.number));
        std::fs::write(&xml_path, &record.xml)?;
        println!("saved {}", xml_path.display());
        if let Some(pdf) = &record.pdf {
            let pdf_path = cfg
                .local
                .download_dir
                .join(format!("NFSe_{}.pdf", record.number));
            std::fs::write(&pdf_path, pdf)?;
            println!("saved {}", pdf_path.display());
        }
    }
    Ok(())
}

async fn run_fetch(cfg: &Config, remote_path: &str, mode: ReporterMode) -> Result<()> {
    let session = build_session(cfg, mode);
    let path = remote_path.to_string();
    let bytes = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || session.with_connection(|t| t.read_file(&path)))
            .await
            .context("fetch task panicked")??
    };
    session.close();

    let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
    std::fs::create_dir_all(&cfg.local.download_dir)?;
    let local = cfg.local.download_dir.join(name);
    std::fs::write(&local, &bytes)?;
    println!("fetched {} ({} bytes) -> {}", remote_path, bytes.len(), local.display());
    Ok(())
}
