use std::{
	collections::BTreeMap,
	sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::Serialize;
use time::OffsetDateTime;

use recall_domain::{EmbeddingStatus, FieldKey, Record, RecordId, RecordKind};

/// Authoritative embedding state for one `(record, field)` pair.
#[derive(Clone, Debug)]
pub struct EmbeddingRecord {
	pub status: EmbeddingStatus,
	/// Content version the current vector was computed from, if any.
	pub source_version: Option<u64>,
	/// Hash of the text the current vector was computed from.
	pub content_hash: Option<blake3::Hash>,
	pub vector: Option<Arc<[f32]>>,
	pub updated_at: OffsetDateTime,
}
impl EmbeddingRecord {
	pub(crate) fn pending(now: OffsetDateTime) -> Self {
		Self {
			status: EmbeddingStatus::Pending,
			source_version: None,
			content_hash: None,
			vector: None,
			updated_at: now,
		}
	}

	/// Whether the stored vector already reflects text with this hash.
	pub(crate) fn covers(&self, hash: &blake3::Hash) -> bool {
		self.status.is_searchable()
			&& self.vector.is_some()
			&& self.content_hash.as_ref() == Some(hash)
	}
}

#[derive(Clone, Debug, Serialize)]
pub struct FieldStatus {
	pub field: String,
	#[serde(flatten)]
	pub status: EmbeddingStatus,
	pub source_version: Option<u64>,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
pub struct RecordStatus {
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub content_version: u64,
	pub fields: Vec<FieldStatus>,
}

#[derive(Default)]
pub(crate) struct Store {
	state: RwLock<StoreState>,
}
impl Store {
	pub(crate) fn read(&self) -> RwLockReadGuard<'_, StoreState> {
		self.state.read().unwrap_or_else(|err| err.into_inner())
	}

	pub(crate) fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
		self.state.write().unwrap_or_else(|err| err.into_inner())
	}

	pub(crate) fn status(&self, record_id: &RecordId) -> Option<RecordStatus> {
		let state = self.read();
		let record = state.records.get(record_id)?;
		let fields = state
			.fields_of(record_id)
			.map(|(key, embedding)| FieldStatus {
				field: key.field.clone(),
				status: embedding.status,
				source_version: embedding.source_version,
				updated_at: embedding.updated_at,
			})
			.collect();

		Some(RecordStatus {
			record_id: record.id.clone(),
			kind: record.kind,
			content_version: record.content_version,
			fields,
		})
	}
}

#[derive(Default)]
pub(crate) struct StoreState {
	pub(crate) records: BTreeMap<RecordId, Record>,
	pub(crate) embeddings: BTreeMap<FieldKey, EmbeddingRecord>,
}
impl StoreState {
	pub(crate) fn fields_of<'a>(
		&'a self,
		record_id: &'a RecordId,
	) -> impl Iterator<Item = (&'a FieldKey, &'a EmbeddingRecord)> + 'a {
		let start = FieldKey::new(record_id.clone(), String::new());

		self.embeddings.range(start..).take_while(move |(key, _)| &key.record_id == record_id)
	}

	pub(crate) fn field_keys_of(&self, record_id: &RecordId) -> Vec<FieldKey> {
		self.fields_of(record_id).map(|(key, _)| key.clone()).collect()
	}
}
