use bitflags::bitflags;
use regex::{Regex, RegexBuilder};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::SearchOptions;
use crate::storage::NoteRecord;

bitflags! {
    /// How a substring needle is compared against titles and content.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MatchFlags: u8 {
        const CASE_INSENSITIVE = 0b0000_0001;
        const DIACRITIC_INSENSITIVE = 0b0000_0010;
    }
}

impl MatchFlags {
    pub fn from_options(options: &SearchOptions) -> Self {
        let mut flags = MatchFlags::CASE_INSENSITIVE;
        if options.fold_diacritics {
            flags |= MatchFlags::DIACRITIC_INSENSITIVE;
        }
        flags
    }

    /// Drops combining marks when diacritics are ignored; case is kept.
    pub fn strip_marks(self, text: &str) -> String {
        if self.contains(MatchFlags::DIACRITIC_INSENSITIVE) {
            text.nfd().filter(|ch| !is_combining_mark(*ch)).collect()
        } else {
            text.to_string()
        }
    }

    pub fn fold(self, text: &str) -> String {
        let stripped = self.strip_marks(text);
        if self.contains(MatchFlags::CASE_INSENSITIVE) {
            stripped.to_lowercase()
        } else {
            stripped
        }
    }
}

/// Active predicate over the record set. The same flags apply to title and
/// content; a match in either field is enough.
#[derive(Debug, Clone)]
pub enum SearchFilter {
    Contains {
        raw: String,
        needle: String,
        flags: MatchFlags,
    },
    /// Regex compiled from the diacritic-stripped pattern. Haystacks are
    /// stripped the same way before matching.
    Pattern {
        raw: String,
        regex: Regex,
        flags: MatchFlags,
    },
    /// A predicate that could not be built. Matches nothing.
    Invalid { raw: String, reason: String },
}

impl SearchFilter {
    /// Builds a filter from search-field text. Blank text means "no filter";
    /// anything else is used as typed, surrounding whitespace included.
    pub fn parse(text: &str, options: &SearchOptions) -> Option<Self> {
        if text.trim().is_empty() {
            return None;
        }
        let flags = MatchFlags::from_options(options);
        let prefix = options.pattern_prefix.trim();
        if !prefix.is_empty() {
            if let Some(pattern) = text.strip_prefix(prefix) {
                return Some(Self::pattern(text, pattern, flags));
            }
        }
        Some(SearchFilter::Contains {
            raw: text.to_string(),
            needle: flags.fold(text),
            flags,
        })
    }

    fn pattern(raw: &str, pattern: &str, flags: MatchFlags) -> Self {
        if pattern.is_empty() {
            return SearchFilter::Invalid {
                raw: raw.to_string(),
                reason: "empty pattern".to_string(),
            };
        }
        let built = RegexBuilder::new(&flags.strip_marks(pattern))
            .case_insensitive(flags.contains(MatchFlags::CASE_INSENSITIVE))
            .build();
        match built {
            Ok(regex) => SearchFilter::Pattern {
                raw: raw.to_string(),
                regex,
                flags,
            },
            Err(err) => {
                tracing::debug!(%pattern, ?err, "search pattern rejected");
                SearchFilter::Invalid {
                    raw: raw.to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            SearchFilter::Contains { raw, .. }
            | SearchFilter::Pattern { raw, .. }
            | SearchFilter::Invalid { raw, .. } => raw,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SearchFilter::Invalid { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn matches(&self, title: &str, content: &str) -> bool {
        match self {
            SearchFilter::Contains { needle, flags, .. } => {
                flags.fold(title).contains(needle.as_str())
                    || flags.fold(content).contains(needle.as_str())
            }
            SearchFilter::Pattern { regex, flags, .. } => {
                regex.is_match(&flags.strip_marks(title))
                    || regex.is_match(&flags.strip_marks(content))
            }
            SearchFilter::Invalid { .. } => false,
        }
    }

    pub fn matches_record(&self, record: &NoteRecord) -> bool {
        self.matches(&record.title, &record.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(text: &str) -> Option<SearchFilter> {
        SearchFilter::parse(text, &SearchOptions::default())
    }

    #[test]
    fn blank_text_clears_the_filter() {
        assert!(parse("").is_none());
        assert!(parse("   \t ").is_none());
    }

    #[test]
    fn title_match_ignores_case() {
        let filter = parse("foo").expect("filter");
        assert!(filter.matches("Foobar", "nothing"));
        assert!(!filter.matches("bar", "nothing"));
    }

    #[test]
    fn content_match_uses_the_same_policy_as_title() {
        let filter = parse("foo").expect("filter");
        assert!(filter.matches("bar", "FOO stuff"));

        let accented = parse("cafe").expect("filter");
        assert!(accented.matches("Café list", ""));
        assert!(accented.matches("", "Meet at the CAFÉ"));

        let needle_accented = parse("Café").expect("filter");
        assert!(needle_accented.matches("cafe", ""));
    }

    #[test]
    fn diacritic_folding_can_be_disabled() {
        let options = SearchOptions {
            fold_diacritics: false,
            ..SearchOptions::default()
        };
        let filter = SearchFilter::parse("cafe", &options).expect("filter");
        assert!(!filter.matches("Café", ""));
        assert!(filter.matches("CAFE", ""));
    }

    #[test]
    fn search_text_is_used_as_typed() {
        let filter = parse(" milk").expect("filter");
        assert_eq!(filter.raw(), " milk");
        assert!(filter.matches("Oat milk", ""));
        assert!(!filter.matches("Milk run", ""));

        let pattern = parse("re: x").expect("filter");
        assert!(pattern.matches("a x", ""));
        assert!(!pattern.matches("ax", ""));
        assert_matches!(parse("re:"), Some(SearchFilter::Invalid { .. }));
    }

    #[test]
    fn malformed_pattern_fails_closed() {
        let filter = parse("re:(unclosed").expect("filter");
        assert_matches!(filter, SearchFilter::Invalid { .. });
        assert!(filter.error().is_some());
        assert!(!filter.matches("(unclosed", "(unclosed"));
    }

    #[test]
    fn pattern_search_is_case_insensitive() {
        let filter = parse("re:ta(sk|g)s?").expect("filter");
        assert_matches!(filter, SearchFilter::Pattern { .. });
        assert!(filter.matches("TAGS", ""));
        assert!(filter.matches("", "one task"));
        assert!(!filter.matches("tab", ""));
    }

    #[test]
    fn pattern_search_ignores_diacritics_like_substring_search() {
        let filter = parse("re:^caf[eé]s?$").expect("filter");
        assert!(filter.matches("Café", ""));
        assert!(filter.matches("", "CAFES"));

        let accented = parse("re:résumé").expect("filter");
        assert!(accented.matches("my resume", ""));
        assert!(accented.matches("RÉSUMÉ draft", ""));

        let options = SearchOptions {
            fold_diacritics: false,
            ..SearchOptions::default()
        };
        let strict = SearchFilter::parse("re:résumé", &options).expect("filter");
        assert!(!strict.matches("resume", ""));
        assert!(strict.matches("Résumé", ""));
    }
}
