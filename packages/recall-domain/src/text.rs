use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// NFKC-normalizes and lowercases text for matching.
pub fn normalize(input: &str) -> String {
	input.nfkc().flat_map(char::to_lowercase).collect()
}

/// Splits text into normalized word tokens.
///
/// Single-character tokens are dropped unless they are digits.
pub fn tokenize(input: &str) -> Vec<String> {
	let normalized = normalize(input);

	normalized
		.unicode_words()
		.filter(|word| word.chars().count() > 1 || word.chars().all(|ch| ch.is_numeric()))
		.map(str::to_string)
		.collect()
}

/// Distinct query terms in first-seen order, capped at `max_terms`.
pub fn query_terms(query: &str, max_terms: usize) -> Vec<String> {
	let mut seen = HashSet::new();
	let mut out = Vec::new();

	for token in tokenize(query) {
		if out.len() >= max_terms {
			break;
		}
		if seen.insert(token.clone()) {
			out.push(token);
		}
	}

	out
}

pub fn content_hash(text: &str) -> blake3::Hash {
	blake3::hash(text.as_bytes())
}
