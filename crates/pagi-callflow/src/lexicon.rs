//! Text normalization and phrase matching over recognized utterances.
//!
//! Matching works on whole tokens, never raw substrings: "no" must not fire inside
//! "know" or "not", and multi-word phrases ("before that") must appear as a contiguous
//! token run.

/// Lowercase, strip punctuation (apostrophes inside words survive) and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        let keep = ch.is_alphanumeric() || ch == '\'';
        if keep {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    // Leading/trailing apostrophes are quoting, not contractions.
    out.split(' ')
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token run `[start, end)` where a phrase matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// `other` lies inside `self` and is strictly shorter.
    pub fn covers(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end && self.len() > other.len()
    }
}

/// Longest match wins between two competing marker sets: a span of one set that sits
/// inside a longer span of the other is dropped ("ok" inside "that's ok", "no" inside
/// "no problem"). Equal-length overlaps keep both.
pub fn resolve_overlaps(a: Vec<Span>, b: Vec<Span>) -> (Vec<Span>, Vec<Span>) {
    let kept_a = a
        .iter()
        .copied()
        .filter(|s| !b.iter().any(|o| o.covers(s)))
        .collect();
    let kept_b = b
        .iter()
        .copied()
        .filter(|s| !a.iter().any(|o| o.covers(s)))
        .collect();
    (kept_a, kept_b)
}

/// A set of phrases, each stored as its normalized token sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhraseSet {
    phrases: Vec<Vec<String>>,
}

impl PhraseSet {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| {
                normalize(p.as_ref())
                    .split(' ')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// All matches in `tokens`, ordered by start position.
    pub fn find_all(&self, tokens: &[&str]) -> Vec<Span> {
        let mut spans = Vec::new();
        for phrase in &self.phrases {
            if phrase.len() > tokens.len() {
                continue;
            }
            for start in 0..=tokens.len() - phrase.len() {
                let hit = phrase
                    .iter()
                    .zip(&tokens[start..])
                    .all(|(p, t)| p.as_str() == *t);
                if hit {
                    spans.push(Span {
                        start,
                        end: start + phrase.len(),
                    });
                }
            }
        }
        spans.sort_by_key(|s| (s.start, s.end));
        spans
    }

    pub fn matches(&self, tokens: &[&str]) -> bool {
        !self.find_all(tokens).is_empty()
    }

    /// Convenience for callers holding normalized text rather than tokens.
    pub fn matches_text(&self, normalized: &str) -> bool {
        self.matches(&tokenize(normalized))
    }
}

/// Split already-normalized text into tokens.
pub fn tokenize(normalized: &str) -> Vec<&str> {
    normalized.split(' ').filter(|t| !t.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("  Yes, BUT... what about pricing?! "), "yes but what about pricing");
        assert_eq!(normalize("I don't know."), "i don't know");
        assert_eq!(normalize("'quoted'"), "quoted");
        assert_eq!(normalize("..."), "");
    }

    #[test]
    fn test_phrase_matching_is_token_based() {
        let negatives = PhraseSet::new(["no", "not now"]);
        assert!(!negatives.matches_text("i know what you mean"));
        assert!(!negatives.matches_text("nothing"));
        assert!(negatives.matches_text("no thank you"));
        assert!(negatives.matches_text("maybe not now"));
        assert!(!negatives.matches_text("now not"));
    }

    #[test]
    fn test_find_all_reports_ordered_spans() {
        let set = PhraseSet::new(["before that", "but"]);
        let text = normalize("Sure, but before that: one thing");
        let spans = set.find_all(&tokenize(&text));
        assert_eq!(spans, vec![Span { start: 1, end: 2 }, Span { start: 2, end: 4 }]);
        assert!(spans[0].overlaps(&Span { start: 1, end: 3 }));
        assert!(!spans[0].overlaps(&spans[1]));
    }

    #[test]
    fn test_longer_opposing_phrase_wins() {
        let yes = PhraseSet::new(["ok", "yes"]);
        let no = PhraseSet::new(["no", "that's ok"]);
        let text = normalize("No, that's ok");
        let tokens = tokenize(&text);
        let (yes_spans, no_spans) = resolve_overlaps(yes.find_all(&tokens), no.find_all(&tokens));
        assert!(yes_spans.is_empty());
        assert_eq!(no_spans.len(), 2);

        // Same-length conflicts survive on both sides.
        let text = normalize("yes no");
        let tokens = tokenize(&text);
        let (yes_spans, no_spans) = resolve_overlaps(yes.find_all(&tokens), no.find_all(&tokens));
        assert_eq!((yes_spans.len(), no_spans.len()), (1, 1));
    }
}
