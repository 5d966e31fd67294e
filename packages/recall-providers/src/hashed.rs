//! Deterministic local embedder for development and offline use.
//!
//! Each normalized token is hashed into one signed bucket of the output vector, so texts that
//! share vocabulary end up with positive cosine similarity. No network access is involved.

use recall_domain::text;

pub fn embed_hashed(input: &str, dimensions: usize) -> Vec<f32> {
	let mut out = vec![0.0_f32; dimensions.max(1)];
	let tokens = text::tokenize(input);

	if tokens.is_empty() {
		let trimmed = input.trim();

		if !trimmed.is_empty() {
			add_feature(&mut out, trimmed, 1.0);
		}
	}

	for token in &tokens {
		add_feature(&mut out, token, 1.0);
	}

	let norm = out.iter().map(|value| value * value).sum::<f32>().sqrt();

	if norm > 0.0 {
		for value in &mut out {
			*value /= norm;
		}
	}

	out
}

fn add_feature(out: &mut [f32], feature: &str, weight: f32) {
	let hash = blake3::hash(feature.as_bytes());
	let bytes = hash.as_bytes();
	let mut bucket_bytes = [0_u8; 8];

	bucket_bytes.copy_from_slice(&bytes[..8]);

	let bucket = (u64::from_le_bytes(bucket_bytes) % out.len() as u64) as usize;
	let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };

	out[bucket] += sign * weight;
}
