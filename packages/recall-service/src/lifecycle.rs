//! Embedding lifecycle: turns content changes into per-field embedding jobs and keeps the
//! authoritative embedding state and the vector index in step with record content.
//!
//! Jobs are keyed by `(record id, field)`. A key is either idle, queued, or running; enqueueing a
//! queued key is a no-op and enqueueing a running key only flags it for one more pass once the
//! current attempt finishes. Workers read the field text when an attempt starts and commit only
//! if the record is still at the version they read, so a slow job never overwrites newer content.

use std::{
	collections::{HashMap, HashSet, VecDeque},
	pin::pin,
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};

use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
	sync::{Notify, broadcast, watch},
	task::JoinHandle,
	time as tokio_time,
};

use crate::{
	Error, Providers, Result,
	store::{EmbeddingRecord, Store},
};
use recall_config::{Config, Lifecycle as LifecycleConfig};
use recall_domain::{EmbeddingStatus, FieldKey, Record, RecordId, RecordKind, text};
use recall_index::{IndexUpsert, VectorIndex};

const DEGRADATION_CHANNEL_CAPACITY: usize = 256;

/// Emitted when a field gives up on embedding and drops to keyword-only eligibility.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Degradation {
	pub record_id: RecordId,
	pub field: String,
	pub attempts: u32,
	pub reason: String,
}

/// What a content change did to the record's embeddings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
	/// Fields handed to the embedding queue.
	pub enqueued: usize,
	/// Fields whose text was unchanged and whose vector was re-stamped with the new version.
	pub refreshed: usize,
	/// Fields that no longer carry text and were dropped.
	pub removed: usize,
	/// Set when the change was older than what is already stored and was ignored.
	pub ignored: bool,
}

pub(crate) struct Lifecycle {
	shared: Arc<Shared>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}
impl Lifecycle {
	/// Spawns the worker pool on the current Tokio runtime.
	pub(crate) fn start(
		cfg: &Config,
		providers: Providers,
		store: Arc<Store>,
		index: VectorIndex,
	) -> Self {
		let (degradations, _) = broadcast::channel(DEGRADATION_CHANNEL_CAPACITY);
		let (shutdown, _) = watch::channel(false);
		let shared = Arc::new(Shared {
			cfg: cfg.lifecycle.clone(),
			embedding: cfg.providers.embedding.clone(),
			providers,
			store,
			index,
			queue: JobQueue::new(cfg.lifecycle.queue_capacity),
			degradations,
			shutdown,
		});
		let workers = (0..cfg.lifecycle.workers)
			.map(|worker| {
				let shared = shared.clone();

				tokio::spawn(async move { shared.run_worker(worker).await })
			})
			.collect();

		Self { shared, workers: Mutex::new(workers) }
	}

	/// Records a content change and schedules embedding work for every field whose text changed.
	///
	/// Never waits on a provider. Fails with [`Error::QueueSaturated`] when the change needs more
	/// new queue slots than are free; in that case nothing is modified.
	pub(crate) fn on_content_changed(&self, record: Record) -> Result<ChangeReport> {
		record.validate().map_err(|reason| Error::InvalidRequest {
			message: format!("Record {}: {reason}.", record.id),
		})?;

		let shared = &self.shared;
		let now = OffsetDateTime::now_utc();
		let mut store = shared.store.write();

		if let Some(existing) = store.records.get(&record.id)
			&& existing.content_version > record.content_version
		{
			tracing::debug!(
				record_id = %record.id,
				stored_version = existing.content_version,
				incoming_version = record.content_version,
				"Ignoring out-of-order content change."
			);

			return Ok(ChangeReport { ignored: true, ..Default::default() });
		}

		let inputs = record.embedding_inputs();
		let mut jobs = Vec::new();
		let mut refreshes = Vec::new();

		for (field, field_text) in &inputs {
			let key = FieldKey::new(record.id.clone(), field.as_str());
			let hash = text::content_hash(field_text);

			match store.embeddings.get(&key) {
				Some(existing) if existing.covers(&hash) => refreshes.push(key),
				_ => jobs.push(key),
			}
		}

		let removed: Vec<FieldKey> = store
			.field_keys_of(&record.id)
			.into_iter()
			.filter(|key| !inputs.iter().any(|(field, _)| field == &key.field))
			.collect();

		shared.queue.enqueue(&record.id, &jobs)?;

		for key in &refreshes {
			if let Some(embedding) = store.embeddings.get_mut(key) {
				embedding.status = EmbeddingStatus::Fresh;
				embedding.source_version = Some(record.content_version);
				embedding.updated_at = now;
			}

			shared.index.refresh_version(key, record.content_version);
		}
		for key in &jobs {
			let embedding = store
				.embeddings
				.entry(key.clone())
				.or_insert_with(|| EmbeddingRecord::pending(now));

			match embedding.status {
				EmbeddingStatus::Fresh => {
					embedding.status = EmbeddingStatus::Stale;
					embedding.updated_at = now;

					shared.index.mark_stale(key);
				},
				EmbeddingStatus::Failed { .. } => {
					embedding.status = EmbeddingStatus::Pending;
					embedding.updated_at = now;
				},
				EmbeddingStatus::Pending | EmbeddingStatus::Stale => {},
			}
		}
		for key in &removed {
			store.embeddings.remove(key);
			shared.index.remove(key);
		}

		tracing::debug!(
			record_id = %record.id,
			content_version = record.content_version,
			enqueued = jobs.len(),
			refreshed = refreshes.len(),
			removed = removed.len(),
			"Content change recorded."
		);

		let report = ChangeReport {
			enqueued: jobs.len(),
			refreshed: refreshes.len(),
			removed: removed.len(),
			ignored: false,
		};

		store.records.insert(record.id.clone(), record);

		Ok(report)
	}

	/// Drops a record with all its embeddings. Returns whether the record was known.
	///
	/// A job already running for one of its fields finds the record gone at commit time and
	/// writes nothing.
	pub(crate) fn on_record_deleted(&self, record_id: &RecordId) -> bool {
		let shared = &self.shared;
		let mut store = shared.store.write();
		let known = store.records.remove(record_id).is_some();

		for key in store.field_keys_of(record_id) {
			store.embeddings.remove(&key);
		}

		let removed = shared.index.remove_record(record_id);

		shared.queue.forget(record_id);

		tracing::debug!(record_id = %record_id, known, removed, "Record deleted.");

		known
	}

	pub(crate) fn subscribe(&self) -> broadcast::Receiver<Degradation> {
		self.shared.degradations.subscribe()
	}

	pub(crate) fn outstanding(&self) -> usize {
		*self.shared.queue.outstanding.borrow()
	}

	pub(crate) async fn wait_idle(&self) {
		let mut outstanding = self.shared.queue.outstanding.subscribe();

		// The sender lives as long as `self`, so this only returns once the count reaches zero.
		let _ = outstanding.wait_for(|count| *count == 0).await;
	}

	pub(crate) async fn shutdown(&self) {
		self.shared.close();

		let workers =
			std::mem::take(&mut *self.workers.lock().unwrap_or_else(|err| err.into_inner()));

		for worker in workers {
			if let Err(err) = worker.await {
				tracing::error!(error = %err, "Embedding worker terminated abnormally.");
			}
		}
	}
}
impl Drop for Lifecycle {
	fn drop(&mut self) {
		self.shared.close();
	}
}

struct Shared {
	cfg: LifecycleConfig,
	embedding: recall_config::EmbeddingProviderConfig,
	providers: Providers,
	store: Arc<Store>,
	index: VectorIndex,
	queue: JobQueue,
	degradations: broadcast::Sender<Degradation>,
	shutdown: watch::Sender<bool>,
}
impl Shared {
	fn close(&self) {
		self.queue.close();
		self.shutdown.send_replace(true);
	}

	async fn run_worker(&self, worker: usize) {
		tracing::debug!(worker, "Embedding worker started.");

		while let Some(key) = self.queue.pop().await {
			let rerun = self.process(&key).await;

			self.queue.finish(&key, rerun);
		}

		tracing::debug!(worker, "Embedding worker stopped.");
	}

	/// Runs one job to completion. Returns whether the key must be processed again.
	async fn process(&self, key: &FieldKey) -> bool {
		let max_attempts = self.cfg.max_attempts.max(1);
		let mut last_error = String::new();

		for attempt in 1..=max_attempts {
			let input = match self.job_input(key) {
				JobStep::Run(input) => input,
				JobStep::Done => return false,
			};

			match self.embed(&input.text).await {
				Ok(vector) => return self.finish_success(key, &input, vector, attempt),
				Err(err) => {
					tracing::warn!(
						error = %err,
						record_id = %key.record_id,
						field = %key.field,
						attempt,
						max_attempts,
						"Embedding attempt failed."
					);

					last_error = err.to_string();
				},
			}

			if attempt < max_attempts {
				let delay = backoff_delay(&self.cfg, attempt, rand::rng().random_range(-1.0..=1.0));

				if !self.sleep_unless_shutdown(delay).await {
					return false;
				}
			}
		}

		self.mark_failed(key, None, max_attempts, last_error);

		false
	}

	fn finish_success(
		&self,
		key: &FieldKey,
		input: &JobInput,
		vector: Vec<f32>,
		attempt: u32,
	) -> bool {
		match self.commit(key, input, vector) {
			Ok(()) => false,
			Err(Error::VersionRace { record_id, field, job_version, current_version }) => {
				tracing::debug!(
					record_id = %record_id,
					field = %field,
					job_version,
					current_version,
					"Discarded embedding computed from outdated content."
				);

				true
			},
			Err(err) => {
				tracing::error!(
					error = %err,
					record_id = %key.record_id,
					field = %key.field,
					"Embedding rejected by the index."
				);

				self.mark_failed(key, Some(input.version), attempt, err.to_string());

				false
			},
		}
	}

	async fn embed(&self, input: &str) -> Result<Vec<f32>> {
		let texts = [input.to_string()];
		let deadline = Duration::from_millis(self.embedding.timeout_ms);
		let vectors = tokio_time::timeout(
			deadline,
			self.providers.embedding.embed(&self.embedding, &texts),
		)
		.await
		.map_err(|_| Error::ProviderUnavailable {
			message: format!("Embedding request exceeded {} ms.", deadline.as_millis()),
		})??;

		vectors.into_iter().next().ok_or_else(|| Error::ProviderUnavailable {
			message: "Embedding provider returned no vector.".to_string(),
		})
	}

	fn job_input(&self, key: &FieldKey) -> JobStep {
		let store = self.store.read();
		let Some(record) = store.records.get(&key.record_id) else {
			return JobStep::Done;
		};
		let Some(embedding) = store.embeddings.get(key) else {
			return JobStep::Done;
		};

		if embedding.status == EmbeddingStatus::Fresh
			&& embedding.source_version == Some(record.content_version)
		{
			return JobStep::Done;
		}

		match record.field_text(&key.field) {
			Some(text) if !text.is_empty() => JobStep::Run(JobInput {
				version: record.content_version,
				kind: record.kind,
				text,
			}),
			_ => JobStep::Done,
		}
	}

	fn commit(&self, key: &FieldKey, input: &JobInput, vector: Vec<f32>) -> Result<()> {
		let expected = self.index.dimensions();

		if vector.len() != expected {
			return Err(Error::DimensionMismatch { expected, actual: vector.len() });
		}

		let mut store = self.store.write();
		let current_version = match store.records.get(&key.record_id) {
			Some(record) => record.content_version,
			None => return Ok(()),
		};

		if !store.embeddings.contains_key(key) {
			return Ok(());
		}
		if current_version != input.version {
			return Err(Error::VersionRace {
				record_id: key.record_id.clone(),
				field: key.field.clone(),
				job_version: input.version,
				current_version,
			});
		}

		let stored: Arc<[f32]> = vector.as_slice().into();

		self.index.upsert(IndexUpsert {
			key: key.clone(),
			kind: input.kind,
			source_version: input.version,
			vector,
		})?;

		if let Some(embedding) = store.embeddings.get_mut(key) {
			embedding.status = EmbeddingStatus::Fresh;
			embedding.source_version = Some(input.version);
			embedding.content_hash = Some(text::content_hash(&input.text));
			embedding.vector = Some(stored);
			embedding.updated_at = OffsetDateTime::now_utc();
		}

		Ok(())
	}

	/// Marks a field Failed and takes it out of the index.
	///
	/// With `version` set, nothing happens unless the record is still at that version.
	fn mark_failed(&self, key: &FieldKey, version: Option<u64>, attempts: u32, reason: String) {
		{
			let mut store = self.store.write();

			if let Some(version) = version
				&& store.records.get(&key.record_id).map(|record| record.content_version)
					!= Some(version)
			{
				return;
			}

			let Some(embedding) = store.embeddings.get_mut(key) else {
				return;
			};

			embedding.status = EmbeddingStatus::Failed { attempts };
			embedding.updated_at = OffsetDateTime::now_utc();

			self.index.remove(key);
		}

		tracing::warn!(
			record_id = %key.record_id,
			field = %key.field,
			attempts,
			reason = %reason,
			"Embedding failed. Field falls back to keyword-only ranking."
		);

		let _ = self.degradations.send(Degradation {
			record_id: key.record_id.clone(),
			field: key.field.clone(),
			attempts,
			reason,
		});
	}

	/// Returns `false` when shutdown was requested during the wait.
	async fn sleep_unless_shutdown(&self, delay: Duration) -> bool {
		let mut shutdown = self.shutdown.subscribe();

		if *shutdown.borrow_and_update() {
			return false;
		}

		tokio::select! {
			_ = tokio_time::sleep(delay) => true,
			_ = shutdown.changed() => false,
		}
	}
}

enum JobStep {
	Run(JobInput),
	Done,
}

struct JobInput {
	version: u64,
	kind: RecordKind,
	text: String,
}

/// Exponential backoff for the attempt that just failed, capped, with `jitter` in `[-1, 1]`
/// scaled by the configured ratio.
pub(crate) fn backoff_delay(cfg: &LifecycleConfig, attempt: u32, jitter: f64) -> Duration {
	let exp = attempt.saturating_sub(1).min(32);
	let base = cfg.base_backoff_ms.saturating_mul(1_u64 << exp).min(cfg.max_backoff_ms);
	let factor = 1.0 + jitter.clamp(-1.0, 1.0) * f64::from(cfg.jitter_ratio);

	Duration::from_millis((base as f64 * factor).round().max(0.0) as u64)
}

struct JobQueue {
	capacity: usize,
	state: Mutex<QueueState>,
	ready: Notify,
	outstanding: watch::Sender<usize>,
}
impl JobQueue {
	fn new(capacity: usize) -> Self {
		Self {
			capacity,
			state: Mutex::new(QueueState::default()),
			ready: Notify::new(),
			outstanding: watch::Sender::new(0),
		}
	}

	/// Enqueues every key not already queued or running, or none of them if that would exceed
	/// the capacity.
	fn enqueue(&self, record_id: &RecordId, keys: &[FieldKey]) -> Result<()> {
		let mut state = self.lock();

		if state.closed {
			return Err(Error::InvalidRequest {
				message: "The service is shutting down.".to_string(),
			});
		}

		let fresh = keys
			.iter()
			.filter(|key| !state.queued.contains(*key) && !state.running.contains_key(*key))
			.count();

		if fresh > 0 && state.queue.len() + fresh > self.capacity {
			tracing::warn!(
				record_id = %record_id,
				queued = state.queue.len(),
				requested = fresh,
				capacity = self.capacity,
				"Embedding queue saturated."
			);

			return Err(Error::QueueSaturated { record_id: record_id.clone() });
		}

		for key in keys {
			if let Some(rerun) = state.running.get_mut(key) {
				*rerun = true;

				continue;
			}
			if state.queued.contains(key) {
				tracing::debug!(
					record_id = %key.record_id,
					field = %key.field,
					"Coalesced embedding job."
				);

				continue;
			}

			state.queued.insert(key.clone());
			state.queue.push_back(key.clone());
			self.ready.notify_one();
		}

		self.publish(&state);

		Ok(())
	}

	async fn pop(&self) -> Option<FieldKey> {
		loop {
			let mut notified = pin!(self.ready.notified());

			notified.as_mut().enable();

			{
				let mut state = self.lock();

				if state.closed {
					return None;
				}
				if let Some(key) = state.queue.pop_front() {
					state.queued.remove(&key);
					state.running.insert(key.clone(), false);

					return Some(key);
				}
			}

			notified.await;
		}
	}

	/// Releases a running key, queueing it again if a change arrived while it ran.
	fn finish(&self, key: &FieldKey, rerun: bool) {
		let mut state = self.lock();
		let flagged = state.running.remove(key).unwrap_or(false);

		if (rerun || flagged) && !state.closed && !state.queued.contains(key) {
			state.queued.insert(key.clone());
			state.queue.push_back(key.clone());
			self.ready.notify_one();
		}

		self.publish(&state);
	}

	/// Drops queued jobs of a deleted record and cancels reruns of its running jobs.
	fn forget(&self, record_id: &RecordId) {
		let mut state = self.lock();

		state.queue.retain(|key| &key.record_id != record_id);
		state.queued.retain(|key| &key.record_id != record_id);

		for (key, rerun) in state.running.iter_mut() {
			if &key.record_id == record_id {
				*rerun = false;
			}
		}

		self.publish(&state);
	}

	fn close(&self) {
		let mut state = self.lock();

		state.closed = true;
		state.queue.clear();
		state.queued.clear();

		self.publish(&state);

		drop(state);

		self.ready.notify_waiters();
	}

	fn publish(&self, state: &QueueState) {
		self.outstanding.send_replace(state.queue.len() + state.running.len());
	}

	fn lock(&self) -> MutexGuard<'_, QueueState> {
		self.state.lock().unwrap_or_else(|err| err.into_inner())
	}
}

#[derive(Default)]
struct QueueState {
	queue: VecDeque<FieldKey>,
	queued: HashSet<FieldKey>,
	/// Running keys and whether a change arrived while they ran.
	running: HashMap<FieldKey, bool>,
	closed: bool,
}
