use std::collections::HashMap;

use stalkr_core::{
    ContentId, DuplicateClassification, GraveyardBoundary, ProcessingStatus, Region,
    ResearchMatch, Snapshot,
};

/// Outcome of one classifier pass over a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSelection {
    /// Eligible snapshot indices, ascending.
    pub eligible: Vec<usize>,
    /// Owned research rows whose status is outside the vocabulary.
    pub unrecognized: Vec<(usize, String)>,
}

fn has_scheme(url: &str) -> bool {
    url.get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("http"))
}

/// Research-region rows owned by the operator whose status is blank or `TODO*`.
/// Rows with a blank or scheme-less URL are dropped without comment.
pub fn select_rows(
    snapshot: &Snapshot,
    boundary: &GraveyardBoundary,
    normalized_initials: &str,
) -> RowSelection {
    let mut selection = RowSelection::default();
    for row in snapshot.rows() {
        if boundary.region_of(row.index) != Region::Research || !row.is_owned_by(normalized_initials)
        {
            continue;
        }
        if !has_scheme(&row.url) {
            continue;
        }
        match &row.status {
            status if status.is_eligible() => selection.eligible.push(row.index),
            ProcessingStatus::Unrecognized(text) => {
                selection.unrecognized.push((row.index, text.clone()))
            }
            _ => {}
        }
    }
    selection
}

pub fn eligible_rows(
    snapshot: &Snapshot,
    boundary: &GraveyardBoundary,
    normalized_initials: &str,
) -> Vec<usize> {
    select_rows(snapshot, boundary, normalized_initials).eligible
}

/// Content identity -> snapshot indices across both regions, built once per pass.
#[derive(Debug, Clone, Default)]
pub struct DuplicateIndex {
    by_id: HashMap<ContentId, Vec<usize>>,
}

impl DuplicateIndex {
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut by_id: HashMap<ContentId, Vec<usize>> = HashMap::new();
        for row in snapshot.rows() {
            if let Some(id) = row.content_id() {
                by_id.entry(id).or_default().push(row.index);
            }
        }
        Self { by_id }
    }

    pub fn occurrences(&self, id: &ContentId) -> &[usize] {
        self.by_id.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Archive matches outrank research matches; research matches are listed in row order.
    pub fn resolve(
        &self,
        snapshot: &Snapshot,
        boundary: &GraveyardBoundary,
        index: usize,
    ) -> DuplicateClassification {
        let Some(id) = snapshot.row(index).and_then(|row| row.content_id()) else {
            return DuplicateClassification::None;
        };
        let others: Vec<usize> = self
            .occurrences(&id)
            .iter()
            .copied()
            .filter(|&other| other != index)
            .collect();

        if others
            .iter()
            .any(|&other| boundary.region_of(other) == Region::Archive)
        {
            return DuplicateClassification::ArchiveMatch;
        }

        let matches: Vec<ResearchMatch> = others
            .iter()
            .filter(|&&other| boundary.region_of(other) == Region::Research)
            .filter_map(|&other| snapshot.row(other))
            .map(|row| ResearchMatch {
                row_number: row.row_number(),
                researcher: row.researcher.clone(),
                status: row.status.cell_value(),
            })
            .collect();
        if matches.is_empty() {
            DuplicateClassification::None
        } else {
            DuplicateClassification::ResearchMatch(matches)
        }
    }
}
