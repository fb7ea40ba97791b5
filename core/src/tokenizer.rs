use lazy_static::lazy_static;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::UnicodeNormalization;
use std::collections::{HashMap, HashSet};

lazy_static! {
    static ref RE: Regex = Regex::new(r"(?u)\p{L}[\p{L}\p{N}_']*|\p{N}+").expect("valid regex");
    static ref STEMMER: Stemmer = Stemmer::create(Algorithm::English);
    static ref STOPWORDS: HashSet<&'static str> = {
        let words: &[&str] = &[
            "a","about","above","after","again","against","all","am","an","and","any","are","aren't","as","at",
            "be","because","been","before","being","below","between","both","but","by",
            "can","can't","cannot","could","couldn't",
            "did","didn't","do","does","doesn't","doing","don't","down","during",
            "each","few","for","from","further",
            "had","hadn't","has","hasn't","have","haven't","having","he","he'd","he'll","he's","her","here","here's","hers","herself","him","himself","his","how","how's",
            "i","i'd","i'll","i'm","i've","if","in","into","is","isn't","it","it's","its","itself",
            "let's","me","more","most","mustn't","my","myself",
            "no","nor","not","of","off","on","once","only","or","other","ought","our","ours","ourselves","out","over","own",
            "same","she","she'd","she'll","she's","should","shouldn't","so","some","such",
            "than","that","that's","the","their","theirs","them","themselves","then","there","there's","these","they","they'd","they'll","they're","they've","this","those","through","to","too",
            "under","until","up","very",
            "was","wasn't","we","we'd","we'll","we're","we've","were","weren't","what","what's","when","when's","where","where's","which","while","who","who's","whom","why","why's","with","won't","would","wouldn't",
            "you","you'd","you'll","you're","you've","your","yours","yourself","yourselves"
        ];
        words.iter().copied().collect()
    };
    static ref IRREGULAR: HashMap<&'static str, &'static str> = {
        let pairs: &[(&str, &str)] = &[
            ("people", "person"), ("children", "child"), ("men", "man"), ("women", "woman"),
            ("mice", "mouse"), ("feet", "foot"), ("teeth", "tooth"), ("geese", "goose"),
            ("data", "datum"), ("criteria", "criterion"), ("indices", "index"), ("series", "series"),
            ("movies", "movie"), ("species", "species"), ("news", "news"),
        ];
        pairs.iter().copied().collect()
    };
}

fn is_stopword(token: &str) -> bool { STOPWORDS.contains(token) }

/// Tokenize an attribute value or query into (word, position) using NFKC normalization,
/// lowercase and stopword removal. Words are not stemmed: the value index stores surface forms.
pub fn tokenize(text: &str) -> Vec<(String, usize)> {
    let normalized = normalize(text);
    let mut tokens = Vec::new();
    for (pos, mat) in RE.find_iter(&normalized).enumerate() {
        let token = mat.as_str();
        if is_stopword(token) { continue; }
        tokens.push((token.to_string(), pos));
    }
    tokens
}

/// Distinct words of `text`, in first-seen order.
pub fn distinct_words(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter_map(|(w, _)| if seen.insert(w.clone()) { Some(w) } else { None })
        .collect()
}

pub fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

pub fn stem(word: &str) -> String {
    STEMMER.stem(&normalize(word)).to_string()
}

/// Dictionary-free English lemmatizer: maps plural nouns to their singular.
/// Schema names such as `movie_titles` are lemmatized on their last word.
pub fn lemmatize(word: &str) -> String {
    let w = normalize(word);
    if let Some((head, last)) = w.rsplit_once('_') {
        return format!("{head}_{}", lemmatize(last));
    }
    if let Some(lemma) = IRREGULAR.get(w.as_str()) {
        return lemma.to_string();
    }
    let n = w.chars().count();
    if n > 3 && w.ends_with("ies") {
        return format!("{}y", &w[..w.len() - 3]);
    }
    if n > 3 && (w.ends_with("sses") || w.ends_with("shes") || w.ends_with("ches") || w.ends_with("xes") || w.ends_with("zes")) {
        return w[..w.len() - 2].to_string();
    }
    if n > 3 && w.ends_with('s') && !w.ends_with("ss") && !w.ends_with("us") && !w.ends_with("is") {
        return w[..w.len() - 1].to_string();
    }
    w
}
