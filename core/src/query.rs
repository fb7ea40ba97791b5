use crate::index::Keyword;
use crate::tokenizer::tokenize;

/// Parses a free-text query into keywords. Double-quoted phrases become
/// compound keywords; everything else is split into simple keywords. Words go
/// through the same normalization as indexed values. An unterminated quote
/// runs to the end of the query.
pub fn parse_query(query: &str) -> Vec<Keyword> {
    let mut keywords = Vec::new();
    for (i, segment) in query.split('"').enumerate() {
        let words: Vec<String> = tokenize(segment).into_iter().map(|(w, _)| w).collect();
        if words.is_empty() { continue; }
        // odd segments sit between quotes
        if i % 2 == 1 {
            keywords.push(Keyword::compound(words));
        } else {
            keywords.extend(words.into_iter().map(Keyword::Simple));
        }
    }
    keywords
}
