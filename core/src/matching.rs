use crate::config::{Config, IgnoreList};
use crate::error::ConfigError;
use crate::index::{Keyword, PostingLookup, RecordId, SchemaIndex, COLLECTION_ATTRIBUTE};
use crate::tokenizer::{lemmatize, stem};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute -> keywords that must all occur in that attribute.
pub type ValueFilter = BTreeMap<String, BTreeSet<Keyword>>;
/// Attribute (or `*` for the collection itself) -> matching keyword.
pub type SchemaFilter = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchFilter {
    Value(ValueFilter),
    Schema(SchemaFilter),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub collection: String,
    pub filter: MatchFilter,
    /// Matching records; always empty for schema matches.
    pub tuples: BTreeSet<RecordId>,
}

impl KeywordMatch {
    pub fn value<I>(collection: &str, attribute: &str, keyword: Keyword, tuples: I) -> Self
    where
        I: IntoIterator<Item = RecordId>,
    {
        let mut filter = ValueFilter::new();
        filter.entry(attribute.to_string()).or_default().insert(keyword);
        Self {
            collection: collection.to_string(),
            filter: MatchFilter::Value(filter),
            tuples: tuples.into_iter().collect(),
        }
    }

    pub fn schema(collection: &str, attribute: &str, term: &str) -> Self {
        let mut filter = SchemaFilter::new();
        filter.insert(attribute.to_string(), term.to_string());
        Self {
            collection: collection.to_string(),
            filter: MatchFilter::Schema(filter),
            tuples: BTreeSet::new(),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self.filter, MatchFilter::Value(_))
    }

    pub fn value_filter(&self) -> Option<&ValueFilter> {
        match &self.filter {
            MatchFilter::Value(f) => Some(f),
            MatchFilter::Schema(_) => None,
        }
    }

    /// Every distinct keyword this match covers.
    pub fn keywords(&self) -> BTreeSet<Keyword> {
        match &self.filter {
            MatchFilter::Value(f) => f.values().flatten().cloned().collect(),
            MatchFilter::Schema(f) => f.values().map(|t| Keyword::Simple(t.clone())).collect(),
        }
    }
}

impl std::fmt::Display for KeywordMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (tag, parts) = match &self.filter {
            MatchFilter::Value(filter) => (
                "v",
                filter
                    .iter()
                    .map(|(attr, kws)| {
                        let kws: Vec<String> = kws.iter().map(ToString::to_string).collect();
                        format!("{attr}{{{}}}", kws.join(","))
                    })
                    .collect::<Vec<_>>(),
            ),
            MatchFilter::Schema(filter) => (
                "s",
                filter.iter().map(|(attr, t)| format!("{attr}{{{t}}}")).collect(),
            ),
        };
        write!(f, "{}.{}({})", self.collection, tag, parts.join(","))
    }
}

/// Query-time settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Schema similarity at or above this value yields a schema match.
    pub threshold: f64,
    pub ignore: IgnoreList,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: crate::config::DEFAULT_SCHEMA_MATCH_THRESHOLD,
            ignore: IgnoreList::default(),
        }
    }
}

impl MatchConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.check()?;
        Ok(Self {
            threshold: config.schema_match_threshold,
            ignore: config.ignore_list()?,
        })
    }
}

pub struct KeywordMatcher<'a, V: PostingLookup + ?Sized> {
    value_index: &'a V,
    schema_index: &'a SchemaIndex,
    config: &'a MatchConfig,
}

impl<'a, V: PostingLookup + ?Sized> KeywordMatcher<'a, V> {
    pub fn new(value_index: &'a V, schema_index: &'a SchemaIndex, config: &'a MatchConfig) -> Self {
        Self { value_index, schema_index, config }
    }

    /// Value matches (refined into disjoint tuple-sets) followed by schema matches.
    /// Keywords that match nothing are logged and skipped; only storage failures are errors.
    pub fn get_keyword_matches(&self, keywords: &[Keyword]) -> Result<Vec<KeywordMatch>> {
        let mut matches = self.value_keyword_match_generator(keywords)?;
        matches.extend(self.schema_keyword_match_generator(keywords));
        tracing::debug!(keywords = keywords.len(), matches = matches.len(), "generated keyword matches");
        Ok(matches)
    }

    pub fn value_keyword_match_generator(&self, keywords: &[Keyword]) -> Result<Vec<KeywordMatch>> {
        let mut candidates = Vec::new();
        let mut seen = BTreeSet::new();
        for keyword in keywords {
            if !seen.insert(keyword) { continue; }
            match keyword {
                Keyword::Simple(term) => self.simple_candidates(term, &mut candidates)?,
                Keyword::Compound(terms) => self.compound_candidates(keyword, terms, &mut candidates)?,
            }
        }
        Ok(disjoint_itemsets(candidates))
    }

    fn simple_candidates(&self, term: &str, out: &mut Vec<KeywordMatch>) -> Result<()> {
        let Some(postings) = self.value_index.postings(term)? else {
            tracing::warn!(term, "keyword not found in value index");
            return Ok(());
        };
        for (collection, attributes) in &postings.collections {
            for (attribute, records) in attributes {
                if records.is_empty() || self.config.ignore.is_ignored(collection, attribute) {
                    continue;
                }
                out.push(KeywordMatch::value(
                    collection,
                    attribute,
                    Keyword::Simple(term.to_string()),
                    records.iter().copied(),
                ));
            }
        }
        Ok(())
    }

    fn compound_candidates(&self, keyword: &Keyword, terms: &BTreeSet<String>, out: &mut Vec<KeywordMatch>) -> Result<()> {
        if terms.is_empty() {
            tracing::warn!("empty compound keyword");
            return Ok(());
        }
        let mut per_term = Vec::with_capacity(terms.len());
        for term in terms {
            match self.value_index.postings(term)? {
                Some(postings) => per_term.push(postings),
                None => {
                    tracing::warn!(term = term.as_str(), %keyword, "compound sub-term not found in value index, skipping keyword");
                    return Ok(());
                }
            }
        }

        // (collection, attribute) pairs holding postings for every sub-term
        let mut shared: Option<BTreeSet<(&str, &str)>> = None;
        for postings in &per_term {
            let attrs: BTreeSet<(&str, &str)> = postings
                .collections
                .iter()
                .flat_map(|(c, attrs)| {
                    attrs
                        .iter()
                        .filter(|(_, ids)| !ids.is_empty())
                        .map(move |(a, _)| (c.as_str(), a.as_str()))
                })
                .collect();
            shared = Some(match shared {
                None => attrs,
                Some(prev) => prev.intersection(&attrs).copied().collect(),
            });
        }

        let mut emitted = 0usize;
        for (collection, attribute) in shared.unwrap_or_default() {
            if self.config.ignore.is_ignored(collection, attribute) { continue; }
            let mut records: Option<BTreeSet<RecordId>> = None;
            for postings in &per_term {
                let ids = postings
                    .collections
                    .get(collection)
                    .and_then(|attrs| attrs.get(attribute));
                let Some(ids) = ids else {
                    records = Some(BTreeSet::new());
                    break;
                };
                records = Some(match records {
                    None => ids.clone(),
                    Some(prev) => prev.intersection(ids).copied().collect(),
                });
            }
            let records = records.unwrap_or_default();
            if records.is_empty() { continue; }
            out.push(KeywordMatch::value(collection, attribute, keyword.clone(), records));
            emitted += 1;
        }
        if emitted == 0 {
            tracing::warn!(%keyword, "no attribute value contains every sub-term of compound keyword");
        }
        Ok(())
    }

    pub fn schema_keyword_match_generator(&self, keywords: &[Keyword]) -> Vec<KeywordMatch> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        for keyword in keywords {
            let Keyword::Simple(term) = keyword else { continue };
            if !seen.insert(term.as_str()) { continue; }
            for (collection, attributes) in &self.schema_index.collections {
                if self.config.ignore.is_collection_ignored(collection) { continue; }
                let names = attributes
                    .keys()
                    .map(String::as_str)
                    .filter(|attr| !self.config.ignore.is_ignored(collection, attr))
                    .chain(std::iter::once(COLLECTION_ATTRIBUTE));
                for attribute in names {
                    let similarity = schema_similarity(term, collection, attribute);
                    if similarity >= self.config.threshold {
                        out.push(KeywordMatch::schema(collection, attribute, term));
                    }
                }
            }
        }
        out
    }
}

/// Convenience wrapper over [`KeywordMatcher::get_keyword_matches`].
pub fn get_keyword_matches<V: PostingLookup + ?Sized>(
    keywords: &[Keyword],
    value_index: &V,
    schema_index: &SchemaIndex,
    config: &MatchConfig,
) -> Result<Vec<KeywordMatch>> {
    KeywordMatcher::new(value_index, schema_index, config).get_keyword_matches(keywords)
}

/// Binary similarity between a query term and a schema element. Attributes
/// compare on the lemma of their leaf name (`address.city` -> `city`); the
/// synthetic `*` attribute compares the collection name by lemma or stem.
pub fn schema_similarity(term: &str, collection: &str, attribute: &str) -> f64 {
    let lemma = lemmatize(term);
    let hit = if attribute == COLLECTION_ATTRIBUTE {
        lemma == lemmatize(collection) || stem(term) == stem(collection)
    } else {
        let leaf = attribute.rsplit('.').next().unwrap_or(attribute);
        lemma == lemmatize(leaf)
    };
    if hit { 1.0 } else { 0.0 }
}

type Itemsets = BTreeMap<(String, ValueFilter), BTreeSet<RecordId>>;

/// Splits overlapping value matches into disjoint tuple-sets.
///
/// Each stage intersects every pair of same-collection matches. A non-empty
/// intersection moves to the next stage under the union of both filters and
/// is removed from both parents. A union always strictly contains at least one
/// parent, so the smallest filter grows every stage and the loop ends once no
/// pair overlaps. Matches left empty are dropped. Schema matches pass through.
pub fn disjoint_itemsets(candidates: Vec<KeywordMatch>) -> Vec<KeywordMatch> {
    let mut stage = Itemsets::new();
    let mut passthrough = Vec::new();
    for km in candidates {
        match km.filter {
            MatchFilter::Value(filter) => {
                stage.entry((km.collection, filter)).or_default().extend(km.tuples);
            }
            filter @ MatchFilter::Schema(_) => passthrough.push(KeywordMatch { filter, ..km }),
        }
    }

    let mut settled = Itemsets::new();
    let mut rounds = 0usize;
    while !stage.is_empty() {
        rounds += 1;
        let keys: Vec<(String, ValueFilter)> = stage.keys().cloned().collect();
        let mut next = Itemsets::new();
        let mut removals: BTreeMap<usize, BTreeSet<RecordId>> = BTreeMap::new();

        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                // keys are ordered by collection first
                if keys[i].0 != keys[j].0 { break; }
                let joint: BTreeSet<RecordId> = stage[&keys[i]].intersection(&stage[&keys[j]]).copied().collect();
                if joint.is_empty() { continue; }
                let merged = union_filters(&keys[i].1, &keys[j].1);
                next.entry((keys[i].0.clone(), merged)).or_default().extend(joint.iter().copied());
                removals.entry(i).or_default().extend(joint.iter().copied());
                removals.entry(j).or_default().extend(joint);
            }
        }

        for (idx, ids) in removals {
            if let Some(records) = stage.get_mut(&keys[idx]) {
                records.retain(|r| !ids.contains(r));
            }
        }
        for (key, records) in stage {
            if !records.is_empty() {
                settled.entry(key).or_default().extend(records);
            }
        }
        stage = next;
    }
    tracing::trace!(rounds, itemsets = settled.len(), "refined value matches");

    settled
        .into_iter()
        .map(|((collection, filter), tuples)| KeywordMatch {
            collection,
            filter: MatchFilter::Value(filter),
            tuples,
        })
        .chain(passthrough)
        .collect()
}

fn union_filters(a: &ValueFilter, b: &ValueFilter) -> ValueFilter {
    let mut out = a.clone();
    for (attribute, keywords) in b {
        out.entry(attribute.clone()).or_default().extend(keywords.iter().cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryValueIndex;

    fn fruits() -> MemoryValueIndex {
        let mut vi = MemoryValueIndex::new();
        vi.insert("apple", "fruits", "color", [1, 2, 3]);
        vi.insert("red", "fruits", "color", [2, 3, 4]);
        vi
    }

    fn schema_of(pairs: &[(&str, &str)]) -> SchemaIndex {
        let mut schema = SchemaIndex::new();
        for (c, a) in pairs {
            schema.entry(c, a);
        }
        schema
    }

    fn assert_disjoint(matches: &[KeywordMatch]) {
        let values: Vec<&KeywordMatch> = matches.iter().filter(|m| m.is_value()).collect();
        for (i, a) in values.iter().enumerate() {
            for b in &values[i + 1..] {
                if a.collection == b.collection {
                    assert!(a.tuples.is_disjoint(&b.tuples), "{a} overlaps {b}");
                }
            }
        }
    }

    #[test]
    fn overlapping_keywords_split_into_three_groups() {
        let vi = fruits();
        let schema = SchemaIndex::new();
        let config = MatchConfig::default();
        let kws = [Keyword::simple("apple"), Keyword::simple("red")];
        let matches = get_keyword_matches(&kws, &vi, &schema, &config).unwrap();

        let mut both = ValueFilter::new();
        both.insert("color".into(), [Keyword::simple("apple"), Keyword::simple("red")].into());
        let expected = vec![
            KeywordMatch::value("fruits", "color", Keyword::simple("apple"), [1]),
            KeywordMatch::value("fruits", "color", Keyword::simple("red"), [4]),
            KeywordMatch { collection: "fruits".into(), filter: MatchFilter::Value(both), tuples: [2, 3].into() },
        ];
        let mut got = matches.clone();
        got.sort();
        let mut expected_sorted = expected;
        expected_sorted.sort();
        assert_eq!(got, expected_sorted);
        assert_disjoint(&matches);
    }

    #[test]
    fn compound_keyword_intersects_sub_terms() {
        let mut vi = MemoryValueIndex::new();
        vi.insert("new", "cities", "name", [5, 6]);
        vi.insert("york", "cities", "name", [6, 7]);
        let schema = SchemaIndex::new();
        let config = MatchConfig::default();
        let ny = Keyword::compound(["new", "york"]);
        let matches = get_keyword_matches(&[ny.clone()], &vi, &schema, &config).unwrap();
        assert_eq!(matches, vec![KeywordMatch::value("cities", "name", ny, [6])]);
    }

    #[test]
    fn compound_requires_every_sub_term_in_the_same_attribute() {
        let mut vi = MemoryValueIndex::new();
        vi.insert("a", "t", "x", [1, 2]);
        vi.insert("b", "t", "x", [2, 3]);
        vi.insert("a", "t", "y", [9]);
        vi.insert("b", "t", "z", [9]);
        let schema = SchemaIndex::new();
        let config = MatchConfig::default();
        let kw = Keyword::compound(["a", "b"]);
        let matches = get_keyword_matches(&[kw.clone()], &vi, &schema, &config).unwrap();
        assert_eq!(matches, vec![KeywordMatch::value("t", "x", kw, [2])]);
    }

    #[test]
    fn missing_sub_term_skips_compound() {
        let mut vi = MemoryValueIndex::new();
        vi.insert("new", "cities", "name", [5, 6]);
        let matches = get_keyword_matches(
            &[Keyword::compound(["new", "jersey"])],
            &vi,
            &SchemaIndex::new(),
            &MatchConfig::default(),
        )
        .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn unknown_and_empty_queries_yield_nothing() {
        let vi = fruits();
        let schema = SchemaIndex::new();
        let config = MatchConfig::default();
        assert!(get_keyword_matches(&[], &vi, &schema, &config).unwrap().is_empty());
        let matches = get_keyword_matches(&[Keyword::simple("banana")], &vi, &schema, &config).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn ignored_attributes_are_skipped() {
        let mut vi = fruits();
        vi.insert("apple", "fruits", "name", [1]);
        let config = MatchConfig::from_config(&Config {
            ignored_attributes: vec!["fruits.color".into()],
            ..Default::default()
        })
        .unwrap();
        let matches = get_keyword_matches(&[Keyword::simple("apple")], &vi, &SchemaIndex::new(), &config).unwrap();
        assert_eq!(matches, vec![KeywordMatch::value("fruits", "name", Keyword::simple("apple"), [1])]);
    }

    #[test]
    fn three_way_overlap_is_labeled_with_every_keyword() {
        let mut vi = MemoryValueIndex::new();
        vi.insert("a", "t", "x", [1, 2]);
        vi.insert("b", "t", "x", [1, 3]);
        vi.insert("c", "t", "y", [1]);
        let kws = [Keyword::simple("a"), Keyword::simple("b"), Keyword::simple("c")];
        let matches = get_keyword_matches(&kws, &vi, &SchemaIndex::new(), &MatchConfig::default()).unwrap();
        assert_disjoint(&matches);
        assert_eq!(matches.len(), 3);
        let holder = matches.iter().find(|m| m.tuples.contains(&1)).unwrap();
        assert_eq!(holder.keywords().len(), 3);
        assert_eq!(holder.tuples, BTreeSet::from([1]));
        let all: BTreeSet<RecordId> = matches.iter().flat_map(|m| m.tuples.iter().copied()).collect();
        assert_eq!(all, BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn collections_are_refined_independently() {
        let mut vi = MemoryValueIndex::new();
        vi.insert("a", "t", "x", [1]);
        vi.insert("b", "u", "x", [1]);
        let kws = [Keyword::simple("a"), Keyword::simple("b")];
        let matches = get_keyword_matches(&kws, &vi, &SchemaIndex::new(), &MatchConfig::default()).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.keywords().len() == 1));
    }

    #[test]
    fn schema_matches_lemmas_and_collection_names() {
        let vi = MemoryValueIndex::new();
        let schema = schema_of(&[("movies", "title"), ("movies", "release.year"), ("person", "name")]);
        let config = MatchConfig::default();
        let kws = [Keyword::simple("titles"), Keyword::simple("movie"), Keyword::simple("years"), Keyword::simple("names")];
        let mut matches = get_keyword_matches(&kws, &vi, &schema, &config).unwrap();
        matches.sort();
        let mut expected = vec![
            KeywordMatch::schema("movies", "title", "titles"),
            KeywordMatch::schema("movies", COLLECTION_ATTRIBUTE, "movie"),
            KeywordMatch::schema("movies", "release.year", "years"),
            KeywordMatch::schema("person", "name", "names"),
        ];
        expected.sort();
        assert_eq!(matches, expected);
    }

    #[test]
    fn different_lemma_never_matches_schema() {
        assert_eq!(schema_similarity("director", "movie", "title"), 0.0);
        assert_eq!(schema_similarity("titles", "movie", "title"), 1.0);
        assert_eq!(schema_similarity("directing", "directed", COLLECTION_ATTRIBUTE), 1.0);
    }

    #[test]
    fn display_is_compact() {
        let km = KeywordMatch::value("cities", "name", Keyword::compound(["new", "york"]), [6]);
        assert_eq!(km.to_string(), "cities.v(name{\"new york\"})");
        assert_eq!(KeywordMatch::schema("movie", "*", "film").to_string(), "movie.s(*{film})");
    }
}
