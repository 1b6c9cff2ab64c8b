use crate::config::{FUZZY_THRESHOLD, SUGGESTION_THRESHOLD};
use crate::index::{normalize, IndexedDocument, TitleIndex};
use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Raw title equals the label byte for byte
    Exact,
    /// Normalized title equals the normalized label
    #[default]
    CaseInsensitive,
    /// Best Jaro-Winkler similarity at or above the threshold
    Fuzzy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Exact => "exact",
            Strategy::CaseInsensitive => "case-insensitive",
            Strategy::Fuzzy => "fuzzy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Unmatched,
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchVerdict {
    pub status: MatchStatus,
    pub resolved_document_id: Option<String>,
    pub strategy_used: Strategy,
    /// Candidates that survived at the top rank
    pub candidate_count: usize,
    pub candidates: Vec<IndexedDocument>,
}

impl MatchVerdict {
    fn from_candidates(strategy: Strategy, mut candidates: Vec<IndexedDocument>) -> Self {
        candidates.sort_by(|a, b| {
            a.raw_title
                .cmp(&b.raw_title)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        let (status, resolved) = match candidates.as_slice() {
            [] => (MatchStatus::Unmatched, None),
            [only] => (MatchStatus::Matched, Some(only.document_id.clone())),
            _ => (MatchStatus::Ambiguous, None),
        };
        Self {
            status,
            resolved_document_id: resolved,
            strategy_used: strategy,
            candidate_count: candidates.len(),
            candidates,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub document_id: String,
    pub title: String,
    pub score: f64,
}

/// Scores are compared at this precision so that float noise cannot break a tie.
fn round_score(score: f64) -> f64 {
    (score * 1e9).round() / 1e9
}

/// Resolves labels against the shared title index with one strategy for the whole run.
#[derive(Clone)]
pub struct Matcher {
    index: Arc<TitleIndex>,
    strategy: Strategy,
}

impl Matcher {
    pub fn new(index: Arc<TitleIndex>, strategy: Strategy) -> Self {
        Self { index, strategy }
    }

    pub fn match_label(&self, label: &str) -> MatchVerdict {
        let normalized = normalize(label);
        if normalized.is_empty() {
            return MatchVerdict::from_candidates(self.strategy, Vec::new());
        }

        let candidates = match self.strategy {
            Strategy::Exact => self
                .index
                .candidates(&normalized)
                .iter()
                .filter(|d| d.raw_title == label)
                .cloned()
                .collect(),
            Strategy::CaseInsensitive => self.index.candidates(&normalized).to_vec(),
            Strategy::Fuzzy => self.fuzzy_candidates(&normalized),
        };

        MatchVerdict::from_candidates(self.strategy, candidates)
    }

    fn scored_titles(&self, normalized: &str, threshold: f64) -> Vec<(f64, &str, &[IndexedDocument])> {
        let titles: Vec<(&str, &[IndexedDocument])> = self.index.iter().collect();
        titles
            .par_iter()
            .filter_map(|&(title, docs)| {
                let score = round_score(jaro_winkler(normalized, title));
                (score >= threshold).then_some((score, title, docs))
            })
            .collect()
    }

    fn fuzzy_candidates(&self, normalized: &str) -> Vec<IndexedDocument> {
        let scored = self.scored_titles(normalized, FUZZY_THRESHOLD);
        let Some(best) = scored.iter().map(|(s, _, _)| *s).reduce(f64::max) else {
            return Vec::new();
        };
        scored
            .into_iter()
            .filter(|(s, _, _)| *s == best)
            .flat_map(|(_, _, docs)| docs.iter().cloned())
            .collect()
    }

    /// Closest title for a "did you mean" hint, regardless of the active strategy.
    pub fn suggest(&self, label: &str) -> Option<Suggestion> {
        let normalized = normalize(label);
        if normalized.is_empty() {
            return None;
        }
        let scored = self.scored_titles(&normalized, SUGGESTION_THRESHOLD);
        scored
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .and_then(|(score, _, docs)| {
                docs.first().map(|d| Suggestion {
                    document_id: d.document_id.clone(),
                    title: d.raw_title.clone(),
                    score,
                })
            })
    }
}
