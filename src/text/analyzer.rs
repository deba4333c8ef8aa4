use crate::config::Language;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;
use std::sync::LazyLock;

static SPANISH_STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "el", "la", "de", "que", "y", "a", "en", "un", "es", "se", "no", "te", "lo", "le", "da",
        "su", "por", "son", "con", "para", "al", "del", "los", "las", "una", "como", "todo",
        "pero", "mas", "me", "ya", "muy", "fue", "este", "esta", "sus", "entre", "cuando",
        "sin", "sobre", "tambien", "hasta", "donde", "quien", "desde", "nos", "durante", "uno",
        "les", "ni", "contra", "otros", "ese", "eso", "ante", "ellos", "esto", "antes",
    ]
    .into_iter()
    .collect()
});

static ENGLISH_STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "had",
        "has", "have", "if", "in", "into", "is", "it", "no", "not", "of", "on", "or", "such",
        "that", "the", "their", "then", "there", "these", "they", "this", "to", "was", "were",
        "will", "with",
    ]
    .into_iter()
    .collect()
});

/// Text normalization pipeline shared by index build and query: lowercase,
/// diacritic folding for the configured language profile, tokenization on
/// non-alphanumerics, stopword removal and optional Snowball stemming.
/// Queries MUST run through the same analyzer instance settings as the
/// index they search.
pub struct Analyzer {
    language: Language,
    min_token_len: usize,
    stemmer: Option<Stemmer>,
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer")
            .field("language", &self.language)
            .field("min_token_len", &self.min_token_len)
            .field("stem", &self.stemmer.is_some())
            .finish()
    }
}

impl Analyzer {
    pub fn new(language: Language, stem: bool) -> Self {
        let stemmer = stem.then(|| {
            Stemmer::create(match language {
                Language::Spanish => Algorithm::Spanish,
                Language::English => Algorithm::English,
            })
        });
        Analyzer {
            language,
            // The spanish profile drops very short function words outright.
            min_token_len: match language {
                Language::Spanish => 3,
                Language::English => 2,
            },
            stemmer,
        }
    }

    fn stop_words(&self) -> &'static HashSet<&'static str> {
        match self.language {
            Language::Spanish => &SPANISH_STOP_WORDS,
            Language::English => &ENGLISH_STOP_WORDS,
        }
    }

    /// Fold a lowercase char to its unaccented form; ñ→n is part of the
    /// spanish profile but harmless for english input.
    fn fold(c: char) -> char {
        match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        }
    }

    /// Normalize free text into index terms.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let folded: String = text
            .to_lowercase()
            .chars()
            .map(Self::fold)
            .collect();
        let mut terms = Vec::new();
        for raw in folded.split(|c: char| !c.is_alphanumeric()) {
            if raw.len() < self.min_token_len || self.stop_words().contains(raw) {
                continue;
            }
            let term = match &self.stemmer {
                Some(stemmer) => stemmer.stem(raw).into_owned(),
                None => raw.to_string(),
            };
            terms.push(term);
        }
        terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_profile_drops_stopwords() {
        let analyzer = Analyzer::new(Language::English, false);
        assert_eq!(
            analyzer.tokenize("love and light"),
            vec!["love".to_string(), "light".to_string()]
        );
    }

    #[test]
    fn spanish_profile_folds_diacritics_and_enye() {
        let analyzer = Analyzer::new(Language::Spanish, false);
        assert_eq!(
            analyzer.tokenize("La canción del año"),
            vec!["cancion".to_string(), "ano".to_string()]
        );
    }

    #[test]
    fn spanish_profile_drops_short_tokens() {
        let analyzer = Analyzer::new(Language::Spanish, false);
        assert_eq!(analyzer.tokenize("yo vi el mar"), vec!["mar".to_string()]);
    }

    #[test]
    fn stemming_conflates_inflections() {
        let analyzer = Analyzer::new(Language::English, true);
        let running = analyzer.tokenize("running");
        let runs = analyzer.tokenize("runs");
        assert_eq!(running, runs);
    }

    #[test]
    fn tokenization_splits_on_punctuation_and_digits_survive() {
        let analyzer = Analyzer::new(Language::English, false);
        assert_eq!(
            analyzer.tokenize("track-42, (remix)"),
            vec!["track".to_string(), "42".to_string(), "remix".to_string()]
        );
    }
}
