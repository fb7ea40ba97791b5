use crate::index::{PostingLookup, SchemaIndex, TermPostings, NUM_WEIGHT_SCHEMES};
use crate::matching::{KeywordMatch, MatchFilter};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Term-frequency / inverse-attribute-frequency weighting schemes. The
/// discriminant is the slot in [`crate::AttributeStats::norm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightScheme {
    /// tf = f, iaf = ln(N/af)
    Raw = 0,
    /// tf = 1 + ln f, iaf = ln(N/af)
    #[default]
    LogTf = 1,
    /// tf = 0.5 + 0.5 f / max_f, iaf = ln(N/af)
    AugmentedTf = 2,
    /// tf = 1 + ln f, iaf = ln(1 + N/af)
    LogTfSmoothedIaf = 3,
}

impl WeightScheme {
    pub const ALL: [WeightScheme; NUM_WEIGHT_SCHEMES] = [
        WeightScheme::Raw,
        WeightScheme::LogTf,
        WeightScheme::AugmentedTf,
        WeightScheme::LogTfSmoothedIaf,
    ];

    pub fn index(self) -> usize { self as usize }

    pub fn tf(self, frequency: u32, max_frequency: u32) -> f64 {
        if frequency == 0 { return 0.0; }
        let f = frequency as f64;
        match self {
            WeightScheme::Raw => f,
            WeightScheme::LogTf | WeightScheme::LogTfSmoothedIaf => 1.0 + f.ln(),
            WeightScheme::AugmentedTf => 0.5 + 0.5 * f / (max_frequency.max(1) as f64),
        }
    }

    /// `base_iaf` is the stored `ln(N/af)`.
    pub fn iaf(self, base_iaf: f64) -> f64 {
        match self {
            WeightScheme::LogTfSmoothedIaf => (1.0 + base_iaf.exp()).ln(),
            _ => base_iaf,
        }
    }

    pub fn weight(self, frequency: u32, max_frequency: u32, base_iaf: f64) -> f64 {
        self.tf(frequency, max_frequency) * self.iaf(base_iaf)
    }
}

impl FromStr for WeightScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" | "raw" => Ok(WeightScheme::Raw),
            "1" | "log_tf" => Ok(WeightScheme::LogTf),
            "2" | "augmented_tf" => Ok(WeightScheme::AugmentedTf),
            "3" | "log_tf_smoothed_iaf" => Ok(WeightScheme::LogTfSmoothedIaf),
            other => Err(anyhow!("unknown weight scheme `{other}`")),
        }
    }
}

/// Base inverse attribute frequency of a term found in `attributes_with_term`
/// of `total_attributes` attributes.
pub fn base_iaf(total_attributes: usize, attributes_with_term: usize) -> f64 {
    if attributes_with_term == 0 { return 0.0; }
    let n = total_attributes.max(attributes_with_term) as f64;
    (n / attributes_with_term as f64).ln()
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedMatch {
    #[serde(flatten)]
    pub keyword_match: KeywordMatch,
    pub score: f64,
}

/// Scores keyword matches and sorts them best first.
///
/// A value match scores the sum, over its (attribute, sub-term) pairs, of the
/// term's tf-iaf weight on that attribute divided by the attribute norm.
/// Schema matches carry their similarity, which is 1.0 for every emitted match.
pub fn rank_matches<V: PostingLookup + ?Sized>(
    matches: Vec<KeywordMatch>,
    value_index: &V,
    schema_index: &SchemaIndex,
    scheme: WeightScheme,
) -> Result<Vec<RankedMatch>> {
    let mut cache: HashMap<String, Option<TermPostings>> = HashMap::new();
    let mut ranked = Vec::with_capacity(matches.len());
    for km in matches {
        let score = match &km.filter {
            MatchFilter::Schema(_) => 1.0,
            MatchFilter::Value(filter) => {
                let mut score = 0.0;
                for (attribute, keywords) in filter {
                    let Some(stats) = schema_index.get(&km.collection, attribute) else { continue };
                    let norm = stats.norm[scheme.index()];
                    if norm <= 0.0 { continue; }
                    for term in keywords.iter().flat_map(|k| k.terms()) {
                        if !cache.contains_key(term) {
                            cache.insert(term.to_string(), value_index.postings(term)?);
                        }
                        let Some(Some(postings)) = cache.get(term) else { continue };
                        let frequency = postings
                            .collections
                            .get(&km.collection)
                            .and_then(|attrs| attrs.get(attribute))
                            .map_or(0, |ids| ids.len() as u32);
                        score += scheme.weight(frequency, stats.max_frequency, postings.iaf) / norm;
                    }
                }
                score
            }
        };
        ranked.push(RankedMatch { keyword_match: km, score });
    }
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Keyword, MemoryValueIndex};

    #[test]
    fn tf_variants() {
        assert_eq!(WeightScheme::Raw.tf(4, 8), 4.0);
        assert!((WeightScheme::LogTf.tf(1, 8) - 1.0).abs() < 1e-12);
        assert!((WeightScheme::AugmentedTf.tf(4, 8) - 0.75).abs() < 1e-12);
        assert_eq!(WeightScheme::LogTf.tf(0, 8), 0.0);
    }

    #[test]
    fn smoothed_iaf_matches_definition() {
        let base = base_iaf(10, 2);
        assert!((base - 5f64.ln()).abs() < 1e-12);
        assert!((WeightScheme::LogTfSmoothedIaf.iaf(base) - 6f64.ln()).abs() < 1e-12);
        assert_eq!(base_iaf(10, 0), 0.0);
    }

    #[test]
    fn parses_scheme_names_and_indexes() {
        assert_eq!("2".parse::<WeightScheme>().unwrap(), WeightScheme::AugmentedTf);
        assert_eq!("log_tf".parse::<WeightScheme>().unwrap(), WeightScheme::LogTf);
        assert!("bm25".parse::<WeightScheme>().is_err());
        assert_eq!(WeightScheme::ALL[3].index(), 3);
    }

    #[test]
    fn frequent_term_ranks_first_under_raw_tf() {
        let mut vi = MemoryValueIndex::new();
        vi.insert("rare", "t", "x", [1]);
        vi.insert("common", "t", "x", [2, 3, 4]);
        for term in vi.terms.values_mut() {
            term.iaf = base_iaf(2, 1);
        }
        let mut schema = SchemaIndex::new();
        let stats = schema.entry("t", "x");
        stats.max_frequency = 3;
        stats.norm = [1.0; NUM_WEIGHT_SCHEMES];

        let matches = vec![
            KeywordMatch::value("t", "x", Keyword::simple("common"), [2, 3, 4]),
            KeywordMatch::value("t", "x", Keyword::simple("rare"), [1]),
        ];
        let ranked = rank_matches(matches, &vi, &schema, WeightScheme::Raw).unwrap();
        assert_eq!(ranked[0].keyword_match.keywords().into_iter().next(), Some(Keyword::simple("common")));

        let matches = vec![KeywordMatch::schema("t", "x", "x")];
        let ranked = rank_matches(matches, &vi, &schema, WeightScheme::Raw).unwrap();
        assert_eq!(ranked[0].score, 1.0);
    }
}
