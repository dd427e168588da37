//! Ordered tender matching: exact code, customer name, service text, code
//! substring. The first strategy with at least one hit decides.

use serde::Serialize;
use tender_core::Tender;
use uuid::Uuid;

use crate::normalize::{collapse_whitespace, NormalizedRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Opportunity id equals the tender's short description.
    ExactCode,
    /// Customer name equals the name of a linked organisation.
    OrganisationName,
    /// Requested service and tender title/notes contain one another.
    ServiceText,
    /// Opportunity id occurs inside the short description.
    CodeSubstring,
}

impl MatchStrategy {
    pub const ORDER: [MatchStrategy; 4] = [
        MatchStrategy::ExactCode,
        MatchStrategy::OrganisationName,
        MatchStrategy::ServiceText,
        MatchStrategy::CodeSubstring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::ExactCode => "exact_code",
            MatchStrategy::OrganisationName => "organisation_name",
            MatchStrategy::ServiceText => "service_text",
            MatchStrategy::CodeSubstring => "code_substring",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenderMatch {
    pub tender_id: Uuid,
    /// Position of the matched tender in the candidate slice.
    pub index: usize,
    pub strategy: MatchStrategy,
    /// Further tenders the same strategy hit, in candidate order.
    pub other_candidates: Vec<Uuid>,
}

impl TenderMatch {
    pub fn is_ambiguous(&self) -> bool {
        !self.other_candidates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(TenderMatch),
    Unmatched,
}

/// Comparison keys of one tender, normalized once per run.
#[derive(Debug, Clone)]
struct CandidateKeys {
    short_description: Option<String>,
    texts: Vec<String>,
    organisation_names: Vec<String>,
}

fn non_empty(text: &str) -> Option<String> {
    let collapsed = collapse_whitespace(text);
    (!collapsed.is_empty()).then_some(collapsed)
}

impl CandidateKeys {
    fn of(tender: &Tender) -> Self {
        Self {
            short_description: tender.short_description.as_deref().and_then(non_empty),
            texts: std::iter::once(tender.title.as_str())
                .chain(tender.notes.as_deref())
                .filter_map(non_empty)
                .collect(),
            organisation_names: tender
                .organisations
                .iter()
                .filter_map(|link| non_empty(&link.organisation_name))
                .collect(),
        }
    }

    fn hit(&self, strategy: MatchStrategy, row: &NormalizedRow) -> bool {
        match strategy {
            MatchStrategy::ExactCode => match (&row.opportunity_id, &self.short_description) {
                (Some(id), Some(code)) => id == code,
                _ => false,
            },
            MatchStrategy::OrganisationName => row
                .customer
                .as_ref()
                .is_some_and(|customer| self.organisation_names.iter().any(|name| name == customer)),
            MatchStrategy::ServiceText => row.requested_service.as_ref().is_some_and(|service| {
                self.texts
                    .iter()
                    .any(|text| text.contains(service.as_str()) || service.contains(text.as_str()))
            }),
            MatchStrategy::CodeSubstring => match (&row.opportunity_id, &self.short_description) {
                (Some(id), Some(code)) => code.contains(id.as_str()),
                _ => false,
            },
        }
    }
}

/// The tenders of one snapshot, prepared for repeated matching.
#[derive(Debug, Clone)]
pub struct CandidateSet<'a> {
    tenders: &'a [Tender],
    keys: Vec<CandidateKeys>,
}

impl<'a> CandidateSet<'a> {
    pub fn new(tenders: &'a [Tender]) -> Self {
        Self {
            tenders,
            keys: tenders.iter().map(CandidateKeys::of).collect(),
        }
    }

    pub fn tenders(&self) -> &'a [Tender] {
        self.tenders
    }

    pub fn get(&self, index: usize) -> Option<&'a Tender> {
        self.tenders.get(index)
    }

    pub fn match_row(&self, row: &NormalizedRow) -> MatchOutcome {
        for strategy in MatchStrategy::ORDER {
            let mut hits = self
                .keys
                .iter()
                .enumerate()
                .filter(|(_, keys)| keys.hit(strategy, row))
                .map(|(index, _)| index);
            if let Some(index) = hits.next() {
                return MatchOutcome::Matched(TenderMatch {
                    tender_id: self.tenders[index].id,
                    index,
                    strategy,
                    other_candidates: hits.map(|i| self.tenders[i].id).collect(),
                });
            }
        }
        MatchOutcome::Unmatched
    }
}

/// One-off match of a row against a candidate list.
pub fn match_row(row: &NormalizedRow, candidates: &[Tender]) -> MatchOutcome {
    CandidateSet::new(candidates).match_row(row)
}
