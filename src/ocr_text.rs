use rayon::prelude::*;

use crate::workers::WorkerPool;

/// Punctuation kept in OCR output besides word characters and whitespace.
const KEPT_PUNCTUATION: &[char] = &['.', ',', '-', ':', ';', '!', '?'];

/// Minimum length, in characters, of usable OCR text.
const MIN_TEXT_CHARS: usize = 3;

/// Normalize raw OCR output and decide whether it is worth indexing.
///
/// Returns `None` for text that is empty after cleaning, has no alphabetic
/// character, is shorter than three characters, or has no word made purely
/// of letters.
pub fn clean_text(raw: &str) -> Option<String> {
    let words: Vec<String> = raw
        .split_whitespace()
        .map(|word| word.chars().filter(|c| is_kept(*c)).collect::<String>())
        .filter(|word| {
            let mut chars = word.chars();
            match (chars.next(), chars.next()) {
                (None, _) => false,
                (Some(c), None) => c.is_numeric(),
                _ => true,
            }
        })
        .collect();

    let text = words.join(" ");
    if text.chars().count() < MIN_TEXT_CHARS
        || !text.chars().any(char::is_alphabetic)
    {
        return None;
    }
    // Single letters are already gone, so this requires a real word.
    if !words.iter().any(|w| w.chars().all(char::is_alphabetic)) {
        return None;
    }
    Some(text)
}

/// Clean a batch of OCR results on the worker pool, preserving order.
pub fn clean_batch(
    pool: &WorkerPool,
    raw: Vec<Option<String>>,
) -> Vec<Option<String>> {
    pool.install(|| {
        raw.into_par_iter()
            .map(|text| text.as_deref().and_then(clean_text))
            .collect()
    })
}

fn is_kept(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || KEPT_PUNCTUATION.contains(&c)
}
