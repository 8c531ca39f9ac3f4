//! Document grouping and metadata merge.
//!
//! Folds the artifact stream from the remote index and the record stream
//! from the authority client into one [`DocumentGroup`] per normalized
//! document number, insertion order preserved for display.
//!
//! The single correctness property that matters here: both streams key
//! their upserts with the same normalization ([`canonical_number`] /
//! [`crate::models::number_from_file_name`], which funnels through it).
//! Anything else and a document's slip and its tax record split into two
//! groups.
//!
//! The matcher itself is single-writer: the orchestrator owns it and folds
//! completions in arrival order, so upserts are safe against out-of-order
//! arrival of artifacts and records for different numbers.

use indexmap::IndexMap;

use crate::fields::SlipFields;
use crate::models::{
    canonical_number, ArtifactKind, DocumentGroup, NameSource, RemoteArtifact, TaxRecord,
};

pub struct DocumentMatcher {
    groups: IndexMap<String, DocumentGroup>,
    prefer_authority: bool,
}

impl DocumentMatcher {
    /// `prefer_authority` lets authority-sourced customer names overwrite
    /// PDF-extracted ones; by default the PDF value wins.
    pub fn new(prefer_authority: bool) -> Self {
        Self {
            groups: IndexMap::new(),
            prefer_authority,
        }
    }

    /// Attach a remote file to its group, creating the group on first sight.
    /// When several files of the same kind share a number, the most recently
    /// modified one occupies the slot.
    pub fn upsert_artifact(&mut self, artifact: RemoteArtifact) {
        let key = artifact.number.clone();
        let group = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| DocumentGroup::new(key));
        let slot = match artifact.kind {
            ArtifactKind::Slip => &mut group.slip,
            ArtifactKind::Invoice => &mut group.invoice,
        };
        match slot {
            Some(current) if current.modified_at >= artifact.modified_at => {}
            _ => *slot = Some(artifact),
        }
    }

    /// Attach a resolved tax record to its group. XML-derived fields fill
    /// holes but do not overwrite PDF-sourced values unless the matcher was
    /// built with authority preference.
    pub fn upsert_tax_record(&mut self, record: TaxRecord) {
        let key = canonical_number(&record.number);
        let group = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| DocumentGroup::new(key));

        group.tax_xml = Some(record.xml);
        if record.pdf.is_some() {
            group.tax_pdf = record.pdf;
        }
        if let Some(name) = record.customer_name {
            let overwrite = self.prefer_authority || group.customer_name.is_none();
            if overwrite {
                group.customer_name = Some(name);
                group.name_source = Some(NameSource::Authority);
            }
        }
        if record.issue_date.is_some() {
            group.issue_date = record.issue_date;
        }
    }

    /// Merge fields extracted from a group's slip (or invoice) PDF. The PDF
    /// customer name wins over an authority-sourced one unless authority
    /// preference is configured; order of arrival does not matter.
    pub fn apply_slip_fields(
        &mut self,
        number: &str,
        customer_name: Option<String>,
        fields: &SlipFields,
    ) {
        let key = canonical_number(number);
        let Some(group) = self.groups.get_mut(&key) else {
            return;
        };

        if let Some(name) = customer_name {
            let keep_authority =
                self.prefer_authority && group.name_source == Some(NameSource::Authority);
            if !keep_authority {
                group.customer_name = Some(name);
                group.name_source = Some(NameSource::Pdf);
            }
        }
        if group.due_date.is_none() {
            group.due_date = fields.due_date.clone();
        }
        if group.amount.is_none() {
            group.amount = fields.amount.clone();
        }
    }

    /// Document numbers in first-seen order.
    pub fn numbers(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn groups(&self) -> impl Iterator<Item = &DocumentGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Final output: the ordered sequence of groups.
    pub fn into_groups(self) -> Vec<DocumentGroup> {
        self.groups.into_values().collect()
    }
}
