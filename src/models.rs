//! Core data models used throughout busca-fiscal.
//!
//! These types represent the remote artifacts, tax-authority records, and
//! reconciled document groups that flow through the search and merge pipeline.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;

/// Which slot of a document group a remote file belongs to, inferred from the
/// configured root directory it was listed under.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ArtifactKind {
    /// A payment slip ("boleto") PDF.
    Slip,
    /// An invoice ("nota fiscal") PDF.
    Invoice,
}

/// One file found on the remote store. Immutable once listed.
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    /// Full remote path, usable with the session's fetch primitive.
    pub path: String,
    /// Bare file name.
    pub name: String,
    /// Size in bytes as reported by the listing.
    pub size: u64,
    /// Modification time as reported by the listing.
    pub modified_at: DateTime<Utc>,
    /// Document number inferred from the file name (see [`number_from_file_name`]).
    pub number: String,
    pub kind: ArtifactKind,
}

/// Result of a chained authority lookup for one document number.
/// Absent entirely (not an error) when the document has no authority record.
#[derive(Debug, Clone)]
pub struct TaxRecord {
    /// Canonical document number (see [`canonical_number`]).
    pub number: String,
    /// Access key resolved from the derived DPS identifier.
    pub access_key: String,
    /// Decompressed XML payload.
    pub xml: String,
    /// Rendered PDF bytes; `None` when the PDF endpoint failed or had nothing.
    pub pdf: Option<Vec<u8>>,
    /// Customer name extracted from the XML (`<toma>/<xNome>`).
    pub customer_name: Option<String>,
    /// Issue date extracted from the XML (`<infDPS>/<dhEmi>`).
    pub issue_date: Option<String>,
}

/// Where a group's customer name came from; controls merge precedence.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NameSource {
    Pdf,
    Authority,
}

/// The unit presented to the caller: every artifact sharing one document
/// number, plus merged display metadata. Exists iff at least one constituent
/// slot is populated.
#[derive(Debug, Clone)]
pub struct DocumentGroup {
    /// Canonical document number, the sole grouping key.
    pub number: String,
    pub slip: Option<RemoteArtifact>,
    pub invoice: Option<RemoteArtifact>,
    pub tax_xml: Option<String>,
    pub tax_pdf: Option<Vec<u8>>,
    pub customer_name: Option<String>,
    pub due_date: Option<String>,
    pub amount: Option<String>,
    pub issue_date: Option<String>,
    /// Selection flag, mutable by the presentation layer only.
    pub selected: bool,
    pub(crate) name_source: Option<NameSource>,
}

impl DocumentGroup {
    pub fn new(number: String) -> Self {
        Self {
            number,
            slip: None,
            invoice: None,
            tax_xml: None,
            tax_pdf: None,
            customer_name: None,
            due_date: None,
            amount: None,
            issue_date: None,
            selected: false,
            name_source: None,
        }
    }
}

/// How a query number is matched against file-name digits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Normalized query contained anywhere in the normalized file name.
    /// A number that is a substring of another matches both, an accepted
    /// trade-off favoring recall.
    Substring,
    /// Branch-layout match: names carrying at least 15 digits match when
    /// digits 6..15 equal the query zero-padded to 9; shorter names fall
    /// back to substring.
    Literal,
}

/// One search invocation. Immutable.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Document number, exact or partial. `None` for date-only searches.
    pub number: Option<String>,
    /// Inclusive start of the modification-date range.
    pub since: Option<NaiveDate>,
    /// Inclusive end of the modification-date range.
    pub until: Option<NaiveDate>,
    /// Descend into branch subdirectories.
    pub recursive: bool,
    pub mode: MatchMode,
}

impl SearchQuery {
    /// The date range widened to full days: start at 00:00:00, end at 23:59:59.
    pub fn window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let since = self.since.map(|d| d.and_time(NaiveTime::MIN).and_utc());
        let until = self
            .until
            .map(|d| d.and_hms_opt(23, 59, 59).unwrap().and_utc());
        (since, until)
    }
}

/// Strip everything that is not an ASCII digit.
///
/// This is the one normalization applied to both query numbers and file
/// names; the two artifact sources must agree byte-for-byte or a document's
/// slip and its tax record end up in different groups.
pub fn normalize_number(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Canonical form of a document number: digits only, leading zeros stripped.
pub fn canonical_number(raw: &str) -> String {
    let digits = normalize_number(raw);
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        if digits.is_empty() {
            digits
        } else {
            "0".to_string()
        }
    } else {
        trimmed.to_string()
    }
}

/// Infer the document number carried in a file name.
///
/// File names follow the branch layout `BRANCH(6) + NUMBER(9)` when they
/// carry at least 15 digits; otherwise the last 9 digits (or all of them)
/// are taken. The result is canonicalized so it keys the same group as the
/// authority-side number.
pub fn number_from_file_name(name: &str) -> String {
    let digits = normalize_number(name);
    let window = if digits.len() >= 15 {
        &digits[6..15]
    } else if digits.len() >= 9 {
        &digits[digits.len() - 9..]
    } else {
        digits.as_str()
    };
    canonical_number(window)
}

/// Filter a result set down to the caller-selected groups. This is the whole
/// export-collaborator boundary: the packaging of selected artifacts happens
/// elsewhere.
pub fn selected_groups(groups: &[DocumentGroup]) -> Vec<&DocumentGroup> {
    groups.iter().filter(|g| g.selected).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_everything_but_digits() {
        assert_eq!(normalize_number("NF-é 00.29/a"), "0029");
        assert_eq!(normalize_number("abc"), "");
    }

    #[test]
    fn canonical_strips_leading_zeros() {
        assert_eq!(canonical_number("0029"), "29");
        assert_eq!(canonical_number("000000000"), "0");
        assert_eq!(canonical_number(""), "");
    }

    #[test]
    fn file_name_number_uses_branch_layout() {
        // branch 010001 + number 000005909
        assert_eq!(number_from_file_name("010001000005909.pdf"), "5909");
        // no branch prefix: last nine digits
        assert_eq!(number_from_file_name("fat_2024_000005909.pdf"), "5909");
        // short names keep whatever digits they have
        assert_eq!(number_from_file_name("slip_0029.pdf"), "29");
    }

    #[test]
    fn selected_groups_filters_on_flag() {
        let mut a = DocumentGroup::new("1".into());
        a.selected = true;
        let b = DocumentGroup::new("2".into());
        let groups = vec![a, b];
        let picked = selected_groups(&groups);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].number, "1");
    }
}
