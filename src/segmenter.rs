//! Splits a narration script into ordered segments.
//!
//! Sentences are the primary unit. A sentence that would take longer to
//! speak than one segment's share of the duration cap is split at clause
//! punctuation, then by word count. Pieces below the word floor are merged
//! into their neighbours.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SegmenterConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub text: String,
}

impl Segment {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:https?://|www\.)\S+|\b[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}/\S*")
        .expect("URL pattern is valid")
});

pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Upper bound on words per segment for the given duration ceiling.
    pub fn max_words(&self, duration_cap: f64) -> usize {
        let share = self.config.max_segment_seconds.min(duration_cap);
        let words = (share * self.config.words_per_second).floor() as usize;
        words.max(self.config.min_words)
    }

    pub fn segment(&self, script: &str, duration_cap: f64) -> Result<Vec<Segment>> {
        let cleaned = if self.config.strip_urls {
            URL_PATTERN.replace_all(script, " ").into_owned()
        } else {
            script.to_string()
        };

        if cleaned.trim().is_empty() {
            return Err(PipelineError::Validation(
                "script is empty after stripping whitespace".to_string(),
            ));
        }

        let max_words = self.max_words(duration_cap);
        let pieces: Vec<Vec<&str>> = split_sentences(&cleaned)
            .into_iter()
            .flat_map(|sentence| split_long(sentence, max_words))
            .collect();

        let merged = merge_short(pieces, self.config.min_words, max_words);
        let segments: Vec<Segment> = merged
            .into_iter()
            .enumerate()
            .map(|(index, words)| Segment {
                index,
                text: words.join(" "),
            })
            .collect();

        debug!(count = segments.len(), max_words, "script split into segments");
        Ok(segments)
    }
}

fn is_sentence_end(word: &str) -> bool {
    let trimmed = word.trim_end_matches(['"', '\'', ')', ']', '\u{201d}', '\u{2019}']);
    trimmed.ends_with(['.', '!', '?', '\u{2026}'])
}

fn is_clause_end(word: &str) -> bool {
    word.ends_with([',', ';', ':', '\u{2014}'])
}

/// Sentences as word lists. Blank lines also end a sentence.
fn split_sentences(text: &str) -> Vec<Vec<&str>> {
    let mut sentences = Vec::new();
    for paragraph in text.split("\n\n") {
        let mut current = Vec::new();
        for word in paragraph.split_whitespace() {
            current.push(word);
            if is_sentence_end(word) {
                sentences.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            sentences.push(current);
        }
    }
    sentences
}

fn split_long(sentence: Vec<&str>, max_words: usize) -> Vec<Vec<&str>> {
    if sentence.len() <= max_words {
        return vec![sentence];
    }

    let mut clauses = Vec::new();
    let mut current = Vec::new();
    for word in sentence {
        current.push(word);
        if is_clause_end(word) {
            clauses.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        clauses.push(current);
    }

    // Re-pack clauses greedily, hard-splitting any clause that is still too long.
    let mut out: Vec<Vec<&str>> = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    for clause in clauses {
        if clause.len() > max_words {
            if !buffer.is_empty() {
                out.push(std::mem::take(&mut buffer));
            }
            out.extend(balanced_chunks(&clause, max_words));
            continue;
        }
        if buffer.len() + clause.len() > max_words {
            out.push(std::mem::take(&mut buffer));
        }
        buffer.extend(clause);
    }
    if !buffer.is_empty() {
        out.push(buffer);
    }
    out
}

/// Splits into the fewest chunks of at most `max_words`, sized as evenly as possible.
fn balanced_chunks<'a>(words: &[&'a str], max_words: usize) -> Vec<Vec<&'a str>> {
    let count = words.len().div_ceil(max_words);
    let size = words.len().div_ceil(count);
    words.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

fn merge_short<'a>(
    pieces: Vec<Vec<&'a str>>,
    min_words: usize,
    max_words: usize,
) -> Vec<Vec<&'a str>> {
    let mut out: Vec<Vec<&'a str>> = Vec::new();
    let mut buffer: Vec<&'a str> = Vec::new();

    for piece in pieces {
        if !buffer.is_empty() && buffer.len() + piece.len() > max_words {
            // `buffer` is below `min_words` here; it never stands alone.
            match out.last_mut() {
                Some(last) if last.len() + buffer.len() <= max_words => {
                    last.append(&mut buffer);
                }
                _ => {
                    let mut combined = std::mem::take(&mut buffer);
                    combined.extend(piece);
                    out.extend(balanced_chunks(&combined, max_words));
                    continue;
                }
            }
        }
        buffer.extend(piece);
        if buffer.len() >= min_words {
            out.push(std::mem::take(&mut buffer));
        }
    }

    if !buffer.is_empty() {
        match out.last_mut() {
            Some(last) if last.len() + buffer.len() <= max_words => last.extend(buffer),
            _ => out.push(buffer),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> Segmenter {
        Segmenter::new(SegmenterConfig::default())
    }

    fn normalized(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn preserves_reading_order_and_content() {
        let script = "My roommate keeps eating my food.  I labelled everything!\n\
            Then I found a note on the fridge, written in my own handwriting, \
            telling me to stop. Was I the problem? Turns out I sleepwalk.";
        let segments = segmenter().segment(script, 60.0).unwrap();

        assert!(!segments.is_empty());
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            assert!(!segment.text.is_empty());
        }
        let joined: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(joined.join(" "), normalized(script));
    }

    #[test]
    fn merges_trivially_short_sentences() {
        let segments = segmenter()
            .segment("Wow. Really. That is the whole story, believe it or not.", 60.0)
            .unwrap();
        assert!(segments.iter().all(|s| s.word_count() >= 4));
        assert_eq!(segments[0].text, "Wow. Really. That is the whole story, believe it or not.");
    }

    #[test]
    fn short_sentence_before_a_full_one_is_not_left_alone() {
        let full: Vec<String> = (0..20).map(|i| format!("w{i}")).collect();
        let script = format!("Wow. {}.", full.join(" "));
        let segments = segmenter().segment(&script, 60.0).unwrap();

        assert!(segments.iter().all(|s| s.word_count() >= 4), "{segments:?}");
        assert!(segments.iter().all(|s| s.word_count() <= 20));
        let counts: Vec<usize> = segments.iter().map(Segment::word_count).collect();
        assert_eq!(counts, vec![11, 10]);
        let joined: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(joined.join(" "), script);

        // With a segment before it, the short sentence joins that one instead.
        let script = format!("It started on a Tuesday. Wow. {}.", full.join(" "));
        let segments = segmenter().segment(&script, 60.0).unwrap();
        assert_eq!(segments[0].text, "It started on a Tuesday. Wow.");
        assert_eq!(segments[1].word_count(), 20);
    }

    #[test]
    fn splits_long_sentences_at_clauses() {
        let seg = segmenter();
        let max_words = seg.max_words(60.0);
        assert_eq!(max_words, 20);

        let script = "We drove north for hours, past the lakes and the old mill, \
            through a town whose name none of us could pronounce, until the road simply \
            ended at a gate with a sign that said nothing at all and a dog asleep beneath it";
        let segments = seg.segment(script, 60.0).unwrap();

        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.word_count() <= max_words));
        let joined: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(joined.join(" "), normalized(script));
    }

    #[test]
    fn hard_splits_unpunctuated_runs() {
        let words: Vec<String> = (0..50).map(|i| format!("word{i}")).collect();
        let script = words.join(" ");
        let segments = segmenter().segment(&script, 60.0).unwrap();
        assert_eq!(segments.len(), 3);
        let counts: Vec<usize> = segments.iter().map(Segment::word_count).collect();
        assert_eq!(counts, vec![17, 17, 16]);
    }

    #[test]
    fn tight_cap_shrinks_segment_length() {
        let seg = segmenter();
        assert_eq!(seg.max_words(2.0), 5);
        assert_eq!(seg.max_words(0.5), 4);
    }

    #[test]
    fn strips_links_before_splitting() {
        let segments = segmenter()
            .segment("Full story is at https://example.com/r/abc right here, go read it.", 60.0)
            .unwrap();
        assert!(segments.iter().all(|s| !s.text.contains("example.com")));
    }

    #[test]
    fn empty_script_is_rejected() {
        assert!(matches!(
            segmenter().segment("   \n\t ", 60.0),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            segmenter().segment("https://example.com/only-a-link", 60.0),
            Err(PipelineError::Validation(_))
        ));
    }
}
