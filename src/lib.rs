//! # busca-fiscal
//!
//! Remote payment-slip retrieval and NFS-e reconciliation for fiscal back
//! offices.
//!
//! busca-fiscal searches an SFTP file store for payment slips ("boletos")
//! and invoices, resolves each discovered document number against the tax
//! authority's NFS-e API (mutual TLS with a PKCS#12 certificate), and merges
//! both artifact streams into one grouped result set per document number.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐
//! │ RemoteSession │──▶│    Index      │──┐
//! │ SFTP + retry  │    │ walk + filter │  │   ┌─────────┐   ┌─────────┐
//! └──────────────┘     └──────────────┘  ├──▶│ Matcher  │──▶│   CLI    │
//! ┌──────────────┐     ┌──────────────┐  │   │ by number│   │  (bfis)  │
//! │  Authority    │──▶│   Fields      │──┘   └─────────┘   └─────────┘
//! │ DPS→NFSe→PDF  │    │ regex extract │
//! └──────────────┘     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bfis check                          # config + certificate + connection
//! bfis search --number 5909          # group slips, invoices, NFS-e records
//! bfis search --since 2024-05-01 --until 2024-05-31
//! bfis lookup 5909 --save            # one chained NFS-e lookup
//! bfis fetch /boletos/010001000005909.pdf
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and number normalization |
//! | [`session`] | Remote session state machine with transparent reconnect |
//! | [`transport_sftp`] | SFTP transport (libssh2) |
//! | [`index`] | Recursive remote search |
//! | [`authority`] | Chained NFS-e lookups over mutual TLS |
//! | [`fields`] | Regex field extraction |
//! | [`extract`] | PDF byte buffer → text |
//! | [`matcher`] | Grouping and metadata merge |
//! | [`reconcile`] | Orchestration and worker pool |
//! | [`progress`] | Connection-state reporting |

pub mod authority;
pub mod config;
pub mod extract;
pub mod fields;
pub mod index;
pub mod matcher;
pub mod models;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod transport_sftp;
