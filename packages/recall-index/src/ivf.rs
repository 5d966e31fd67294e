//! Inverted-file layout: vectors are partitioned into lists around spherical k-means centroids,
//! and a query scans only the lists whose centroids are closest to it.

use std::{cmp::Ordering, sync::Arc};

use ahash::{AHashMap, AHashSet};

use recall_domain::FieldKey;

use crate::math;

pub(crate) struct IvfLayout {
	centroids: Vec<Vec<f32>>,
	lists: Vec<AHashSet<FieldKey>>,
	assignment: AHashMap<FieldKey, usize>,
	built_from: usize,
}
impl IvfLayout {
	/// Trains centroids on `vectors` and assigns every vector to its nearest list.
	///
	/// `vectors` must be sorted by key; training is deterministic for a given input.
	pub(crate) fn train(
		vectors: &[(FieldKey, Arc<[f32]>)],
		lists: Option<u32>,
		iterations: u32,
		max_training_points: usize,
	) -> Option<Self> {
		if vectors.is_empty() {
			return None;
		}

		let n = vectors.len();
		let list_count = lists
			.map(|lists| lists as usize)
			.unwrap_or_else(|| (n as f64).sqrt().round() as usize)
			.clamp(1, n);
		let stride = n.div_ceil(max_training_points.max(1)).max(1);
		let sample: Vec<&[f32]> =
			vectors.iter().step_by(stride).map(|(_, vector)| vector.as_ref()).collect();
		let mut centroids: Vec<Vec<f32>> = (0..list_count)
			.map(|i| sample[i * sample.len() / list_count].to_vec())
			.collect();
		let mut assigned = vec![usize::MAX; sample.len()];

		for _ in 0..iterations {
			let mut changed = false;

			for (slot, vector) in sample.iter().enumerate() {
				let nearest = nearest_centroid(&centroids, vector);

				if assigned[slot] != nearest {
					assigned[slot] = nearest;
					changed = true;
				}
			}

			if !changed {
				break;
			}

			let dim = centroids[0].len();
			let mut sums = vec![vec![0.0_f32; dim]; list_count];

			for (slot, vector) in sample.iter().enumerate() {
				for (acc, value) in sums[assigned[slot]].iter_mut().zip(vector.iter()) {
					*acc += value;
				}
			}

			for (centroid, mut sum) in centroids.iter_mut().zip(sums) {
				// Empty lists keep their previous centroid.
				if math::normalize_in_place(&mut sum) {
					*centroid = sum;
				}
			}
		}

		let mut layout = Self {
			lists: vec![AHashSet::new(); centroids.len()],
			centroids,
			assignment: AHashMap::with_capacity(n),
			built_from: n,
		};

		for (key, vector) in vectors {
			layout.assign(key.clone(), vector);
		}

		Some(layout)
	}

	pub(crate) fn partitions(&self) -> usize {
		self.centroids.len()
	}

	pub(crate) fn built_from(&self) -> usize {
		self.built_from
	}

	pub(crate) fn assign(&mut self, key: FieldKey, vector: &[f32]) {
		let list = nearest_centroid(&self.centroids, vector);

		if let Some(previous) = self.assignment.insert(key.clone(), list) {
			if previous == list {
				return;
			}

			self.lists[previous].remove(&key);
		}

		self.lists[list].insert(key);
	}

	pub(crate) fn unassign(&mut self, key: &FieldKey) {
		if let Some(list) = self.assignment.remove(key) {
			self.lists[list].remove(key);
		}
	}

	/// List indices ordered from the closest centroid to the farthest.
	pub(crate) fn probe_order(&self, query: &[f32]) -> Vec<usize> {
		let mut scored: Vec<(usize, f32)> = self
			.centroids
			.iter()
			.enumerate()
			.map(|(idx, centroid)| (idx, math::dot(centroid, query)))
			.collect();

		scored.sort_by(|left, right| right.1.total_cmp(&left.1).then_with(|| left.0.cmp(&right.0)));

		scored.into_iter().map(|(idx, _)| idx).collect()
	}

	pub(crate) fn list(&self, idx: usize) -> &AHashSet<FieldKey> {
		&self.lists[idx]
	}
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
	let mut best = 0;
	let mut best_score = f32::NEG_INFINITY;

	for (idx, centroid) in centroids.iter().enumerate() {
		let score = math::dot(centroid, vector);

		if score.partial_cmp(&best_score) == Some(Ordering::Greater) {
			best = idx;
			best_score = score;
		}
	}

	best
}
