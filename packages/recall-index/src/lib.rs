//! In-memory vector index over per-field embeddings.
//!
//! Small corpora are answered by an exact scan. Once the entry count reaches
//! `exact_threshold`, an inverted-file layout is trained in the background and swapped in; it is
//! retrained whenever the corpus grows by `rebuild_growth_factor` since the last build. Readers
//! keep using the previous layout until the swap, and stored vectors are immutable, so a query
//! never observes a partially written vector.

mod error;
mod ivf;
mod math;

pub use error::{Error, Result};

use std::{
	cmp::Ordering as CmpOrdering,
	sync::{
		Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
		atomic::{AtomicBool, Ordering},
	},
	thread,
	time::Instant,
};

use ahash::{AHashMap, AHashSet};
use serde::Serialize;

use ivf::IvfLayout;
use recall_domain::{FieldKey, RecordId, RecordKind};

/// A fresh vector to store under `key`.
#[derive(Clone, Debug)]
pub struct IndexUpsert {
	pub key: FieldKey,
	pub kind: RecordKind,
	pub source_version: u64,
	pub vector: Vec<f32>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
	pub kind: Option<RecordKind>,
	/// Restricts hits to these field names when set.
	pub fields: Option<Vec<String>>,
}
impl QueryFilter {
	pub fn kind(kind: Option<RecordKind>) -> Self {
		Self { kind, fields: None }
	}

	fn matches(&self, key: &FieldKey, entry: &StoredEntry) -> bool {
		if let Some(kind) = self.kind
			&& entry.kind != kind
		{
			return false;
		}
		if let Some(fields) = self.fields.as_ref()
			&& !fields.iter().any(|field| field == &key.field)
		{
			return false;
		}

		true
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexHit {
	pub key: FieldKey,
	pub kind: RecordKind,
	pub source_version: u64,
	pub stale: bool,
	/// Cosine similarity in `[-1, 1]`.
	pub similarity: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum LayoutKind {
	Flat,
	Ivf { partitions: usize, built_from: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndexStats {
	pub entries: usize,
	pub dimensions: usize,
	pub layout: LayoutKind,
	pub rebuilding: bool,
}

#[derive(Clone)]
pub struct VectorIndex {
	shared: Arc<Shared>,
}

struct Shared {
	cfg: recall_config::Index,
	dimensions: usize,
	state: RwLock<State>,
	rebuilding: AtomicBool,
}

struct State {
	entries: AHashMap<FieldKey, StoredEntry>,
	ivf: Option<IvfLayout>,
	/// Keys written while a rebuild is in progress; `None` when no rebuild is running.
	dirty: Option<AHashSet<FieldKey>>,
}
impl State {
	fn touch(&mut self, key: &FieldKey) {
		if let Some(dirty) = self.dirty.as_mut() {
			dirty.insert(key.clone());
		}
	}
}

#[derive(Clone)]
struct StoredEntry {
	kind: RecordKind,
	source_version: u64,
	stale: bool,
	vector: Arc<[f32]>,
}

impl VectorIndex {
	pub fn new(cfg: recall_config::Index, dimensions: usize) -> Self {
		Self {
			shared: Arc::new(Shared {
				cfg,
				dimensions,
				state: RwLock::new(State { entries: AHashMap::new(), ivf: None, dirty: None }),
				rebuilding: AtomicBool::new(false),
			}),
		}
	}

	pub fn dimensions(&self) -> usize {
		self.shared.dimensions
	}

	pub fn len(&self) -> usize {
		self.read().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains(&self, key: &FieldKey) -> bool {
		self.read().entries.contains_key(key)
	}

	/// Inserts or replaces the vector for `upsert.key`, clearing any stale mark.
	pub fn upsert(&self, upsert: IndexUpsert) -> Result<()> {
		self.check_dimension(upsert.vector.len())?;

		let vector: Arc<[f32]> = math::normalized(&upsert.vector)?.into();
		let needs_rebuild = {
			let mut state = self.write();

			if let Some(ivf) = state.ivf.as_mut() {
				ivf.assign(upsert.key.clone(), &vector);
			}

			state.touch(&upsert.key);
			state.entries.insert(upsert.key, StoredEntry {
				kind: upsert.kind,
				source_version: upsert.source_version,
				stale: false,
				vector,
			});

			self.needs_rebuild(&state)
		};

		if needs_rebuild {
			self.spawn_rebuild();
		}

		Ok(())
	}

	/// Flags an entry as computed from outdated content. Returns whether the key was present.
	pub fn mark_stale(&self, key: &FieldKey) -> bool {
		let mut state = self.write();

		match state.entries.get_mut(key) {
			Some(entry) => {
				entry.stale = true;

				true
			},
			None => false,
		}
	}

	/// Re-stamps an entry whose text did not change with a newer source version.
	pub fn refresh_version(&self, key: &FieldKey, source_version: u64) -> bool {
		let mut state = self.write();

		match state.entries.get_mut(key) {
			Some(entry) => {
				entry.source_version = source_version;
				entry.stale = false;

				true
			},
			None => false,
		}
	}

	pub fn remove(&self, key: &FieldKey) -> bool {
		let mut state = self.write();

		if let Some(ivf) = state.ivf.as_mut() {
			ivf.unassign(key);
		}

		state.touch(key);

		state.entries.remove(key).is_some()
	}

	/// Removes every field of a record. Returns the number of entries removed.
	pub fn remove_record(&self, record_id: &RecordId) -> usize {
		let mut state = self.write();
		let keys: Vec<FieldKey> =
			state.entries.keys().filter(|key| &key.record_id == record_id).cloned().collect();

		for key in &keys {
			if let Some(ivf) = state.ivf.as_mut() {
				ivf.unassign(key);
			}

			state.touch(key);
			state.entries.remove(key);
		}

		keys.len()
	}

	/// Returns at most `k` entries ordered by descending cosine similarity to `vector`.
	///
	/// Ties are broken by key so that repeated queries against an unchanged index agree.
	pub fn query(&self, vector: &[f32], k: usize, filter: &QueryFilter) -> Result<Vec<IndexHit>> {
		self.check_dimension(vector.len())?;

		if k == 0 {
			return Ok(Vec::new());
		}

		let query = math::normalized(vector)?;
		let state = self.read();
		let mut hits = match state.ivf.as_ref() {
			Some(ivf) if state.entries.len() >= self.shared.cfg.exact_threshold =>
				self.probe(&state, ivf, &query, k, filter),
			_ => exact_scan(state.entries.iter(), &query, filter),
		};

		drop(state);

		select_top(&mut hits, k);

		Ok(hits)
	}

	/// Retrains the partition layout synchronously. Returns `false` if a rebuild was already
	/// running.
	pub fn rebuild(&self) -> bool {
		if self.shared.rebuilding.swap(true, Ordering::AcqRel) {
			return false;
		}

		let started = Instant::now();
		let mut snapshot: Vec<(FieldKey, Arc<[f32]>)> = {
			let mut state = self.write();

			state.dirty = Some(AHashSet::new());

			state.entries.iter().map(|(key, entry)| (key.clone(), entry.vector.clone())).collect()
		};

		snapshot.sort_by(|left, right| left.0.cmp(&right.0));

		let cfg = &self.shared.cfg;
		let trained = if snapshot.len() >= cfg.exact_threshold {
			IvfLayout::train(&snapshot, cfg.lists, cfg.kmeans_iterations, cfg.max_training_points)
		} else {
			None
		};

		{
			let mut state = self.write();
			let dirty = state.dirty.take().unwrap_or_default();

			match trained {
				Some(mut layout) => {
					for key in dirty {
						layout.unassign(&key);

						if let Some(entry) = state.entries.get(&key) {
							layout.assign(key, &entry.vector);
						}
					}

					tracing::info!(
						entries = state.entries.len(),
						partitions = layout.partitions(),
						elapsed_ms = started.elapsed().as_millis() as u64,
						"Vector index layout rebuilt."
					);

					state.ivf = Some(layout);
				},
				None => {
					state.ivf = None;
				},
			}
		}

		self.shared.rebuilding.store(false, Ordering::Release);

		true
	}

	pub fn stats(&self) -> IndexStats {
		let state = self.read();
		let layout = match state.ivf.as_ref() {
			Some(ivf) =>
				LayoutKind::Ivf { partitions: ivf.partitions(), built_from: ivf.built_from() },
			None => LayoutKind::Flat,
		};

		IndexStats {
			entries: state.entries.len(),
			dimensions: self.shared.dimensions,
			layout,
			rebuilding: self.shared.rebuilding.load(Ordering::Acquire),
		}
	}

	fn probe(
		&self,
		state: &State,
		ivf: &IvfLayout,
		query: &[f32],
		k: usize,
		filter: &QueryFilter,
	) -> Vec<IndexHit> {
		let probes = self.shared.cfg.probes.max(1) as usize;
		let mut hits = Vec::new();

		for (probed, list) in ivf.probe_order(query).into_iter().enumerate() {
			if probed >= probes && hits.len() >= k {
				break;
			}

			let entries = ivf
				.list(list)
				.iter()
				.filter_map(|key| state.entries.get_key_value(key));

			hits.extend(exact_scan(entries, query, filter));
		}

		hits
	}

	fn needs_rebuild(&self, state: &State) -> bool {
		if self.shared.rebuilding.load(Ordering::Acquire) {
			return false;
		}

		let count = state.entries.len();

		if count < self.shared.cfg.exact_threshold {
			return false;
		}

		match state.ivf.as_ref() {
			None => true,
			Some(ivf) => {
				let growth = f64::from(self.shared.cfg.rebuild_growth_factor);

				count as f64 >= ivf.built_from() as f64 * growth
			},
		}
	}

	/// Trains the new layout on a dedicated OS thread so the index needs no async runtime and
	/// CPU-bound k-means never stalls runtime workers. At most one rebuild runs at a time.
	fn spawn_rebuild(&self) {
		let index = self.clone();
		let spawned = thread::Builder::new()
			.name("recall-index-rebuild".to_string())
			.spawn(move || {
				index.rebuild();
			});

		if let Err(err) = spawned {
			tracing::error!(error = %err, "Failed to spawn vector index rebuild.");
		}
	}

	fn check_dimension(&self, actual: usize) -> Result<()> {
		if actual != self.shared.dimensions {
			return Err(Error::DimensionMismatch { expected: self.shared.dimensions, actual });
		}

		Ok(())
	}

	fn read(&self) -> RwLockReadGuard<'_, State> {
		self.shared.state.read().unwrap_or_else(|err| err.into_inner())
	}

	fn write(&self) -> RwLockWriteGuard<'_, State> {
		self.shared.state.write().unwrap_or_else(|err| err.into_inner())
	}
}

fn exact_scan<'a>(
	entries: impl Iterator<Item = (&'a FieldKey, &'a StoredEntry)>,
	query: &[f32],
	filter: &QueryFilter,
) -> Vec<IndexHit> {
	entries
		.filter(|(key, entry)| filter.matches(key, entry))
		.map(|(key, entry)| IndexHit {
			key: key.clone(),
			kind: entry.kind,
			source_version: entry.source_version,
			stale: entry.stale,
			similarity: math::dot(&entry.vector, query).clamp(-1.0, 1.0),
		})
		.collect()
}

fn cmp_hits(left: &IndexHit, right: &IndexHit) -> CmpOrdering {
	right.similarity.total_cmp(&left.similarity).then_with(|| left.key.cmp(&right.key))
}

fn select_top(hits: &mut Vec<IndexHit>, k: usize) {
	if hits.len() > k {
		hits.select_nth_unstable_by(k - 1, cmp_hits);
		hits.truncate(k);
	}

	hits.sort_by(cmp_hits);
}
