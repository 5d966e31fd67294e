use crate::{Error, Result};

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
	a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Returns a unit-length copy of `vector`, so dot products become cosine similarities.
pub(crate) fn normalized(vector: &[f32]) -> Result<Vec<f32>> {
	if vector.iter().any(|value| !value.is_finite()) {
		return Err(Error::InvalidVector {
			message: "vector contains non-finite values".to_string(),
		});
	}

	let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();

	if norm <= f32::EPSILON {
		return Err(Error::InvalidVector { message: "vector has zero magnitude".to_string() });
	}

	Ok(vector.iter().map(|value| value / norm).collect())
}

pub(crate) fn normalize_in_place(vector: &mut [f32]) -> bool {
	let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();

	if norm <= f32::EPSILON {
		return false;
	}

	for value in vector.iter_mut() {
		*value /= norm;
	}

	true
}
