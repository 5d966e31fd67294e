use std::{
	cmp::Ordering,
	collections::{BTreeMap, HashSet},
	fmt,
	str::FromStr,
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time as tokio_time;

use crate::{Error, RecallService, Result, store::StoreState};
use recall_domain::{COMBINED_FIELD, RecordId, RecordKind, text};
use recall_index::{IndexHit, QueryFilter};

const DEFAULT_TOP_K: usize = 10;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SearchRequest {
	pub query: String,
	#[serde(default)]
	pub kind: Option<RecordKind>,
	#[serde(default = "default_top_k")]
	pub top_k: usize,
	/// Restricts matching to these field names. `combined` stands for every field.
	#[serde(default)]
	pub fields: Option<Vec<String>>,
	#[serde(default)]
	pub search_type: SearchType,
}
impl SearchRequest {
	pub fn new(query: impl Into<String>, top_k: usize) -> Self {
		Self {
			query: query.into(),
			kind: None,
			top_k,
			fields: None,
			search_type: SearchType::default(),
		}
	}

	pub fn with_kind(mut self, kind: Option<RecordKind>) -> Self {
		self.kind = kind;

		self
	}

	pub fn with_fields(mut self, fields: Vec<String>) -> Self {
		self.fields = Some(fields);

		self
	}

	pub fn with_search_type(mut self, search_type: SearchType) -> Self {
		self.search_type = search_type;

		self
	}

	fn allows_field(&self, name: &str) -> bool {
		match self.fields.as_ref() {
			Some(fields) => fields.iter().any(|field| field == name || field == COMBINED_FIELD),
			None => true,
		}
	}
}

/// Which signals a caller asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
	/// Lexical matching only. No query embedding is requested.
	Text,
	/// Vector similarity only.
	Semantic,
	#[default]
	Combined,
}
impl SearchType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Text => "text",
			Self::Semantic => "semantic",
			Self::Combined => "combined",
		}
	}

	fn wants_vector(self) -> bool {
		matches!(self, Self::Semantic | Self::Combined)
	}
}
impl fmt::Display for SearchType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for SearchType {
	type Err = String;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value.trim().to_ascii_lowercase().as_str() {
			"text" => Ok(Self::Text),
			"semantic" => Ok(Self::Semantic),
			"combined" => Ok(Self::Combined),
			other => Err(format!("Unknown search type: {other}.")),
		}
	}
}

/// Which signals actually contributed to a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
	Hybrid,
	/// Only lexical matching contributed, by request or because the query embedding was
	/// unavailable.
	KeywordOnly,
	SemanticOnly,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
	pub record_id: RecordId,
	pub kind: RecordKind,
	pub content_version: u64,
	/// Fused score.
	pub score: f32,
	/// Rescaled similarity in `[0, 1]`, after the stale penalty. Zero without a vector match.
	pub vector_score: f32,
	/// Lexical score in `[0, 1]`.
	pub keyword_score: f32,
	/// Field with the higher individual score.
	pub field: String,
	/// Whether the vector match came from an outdated embedding.
	pub stale: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
	pub mode: SearchMode,
	pub hits: Vec<SearchHit>,
}

#[derive(Default)]
struct Candidate {
	vector: Option<FieldScore>,
	keyword: Option<FieldScore>,
	stale: bool,
}

struct FieldScore {
	score: f32,
	field: String,
}

impl RecallService {
	/// Ranks records by fused keyword and vector relevance.
	///
	/// Provider trouble never fails a search: without a query embedding the ranking is
	/// keyword-only and the response says so.
	pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse> {
		let timeout = Duration::from_millis(self.cfg.search.query_timeout_ms);

		self.search_within(&req, timeout).await
	}

	pub(crate) async fn search_within(
		&self,
		req: &SearchRequest,
		embed_timeout: Duration,
	) -> Result<SearchResponse> {
		let query = req.query.trim();

		if query.is_empty() {
			return Err(Error::InvalidRequest { message: "Query must be non-empty.".to_string() });
		}
		if req.top_k == 0 {
			return Err(Error::InvalidRequest {
				message: "top_k must be greater than zero.".to_string(),
			});
		}

		let embedded = if req.search_type.wants_vector() {
			Some(self.embed_query(query, embed_timeout).await)
		} else {
			None
		};
		let vector_hits = match embedded {
			None => None,
			Some(Ok(vector)) => {
				let filter = QueryFilter { kind: req.kind, fields: req.fields.clone() };
				let multiplier = self.cfg.search.candidate_multiplier.max(1) as usize;
				let limit = req.top_k.saturating_mul(multiplier);

				match self.index.query(&vector, limit, &filter) {
					Ok(hits) => Some(hits),
					Err(err) => {
						tracing::warn!(
							error = %err,
							"Vector query failed. Falling back to keyword-only search."
						);

						None
					},
				}
			},
			Some(Err(err)) => {
				tracing::warn!(
					error = %err,
					"Query embedding failed. Falling back to keyword-only search."
				);

				None
			},
		};
		let mode = match (&vector_hits, req.search_type) {
			(None, _) => SearchMode::KeywordOnly,
			(Some(_), SearchType::Semantic) => SearchMode::SemanticOnly,
			(Some(_), _) => SearchMode::Hybrid,
		};
		let store = self.store.read();
		let mut candidates = BTreeMap::new();

		if let Some(hits) = vector_hits {
			self.collect_vector(&mut candidates, hits);
		}
		if mode != SearchMode::SemanticOnly {
			collect_keyword(&mut candidates, &store, req, self.cfg.search.max_query_terms);
		}

		let hits = self.fuse(&store, candidates, req.top_k);

		tracing::debug!(mode = ?mode, hits = hits.len(), "Search completed.");

		Ok(SearchResponse { mode, hits })
	}

	async fn embed_query(&self, query: &str, timeout: Duration) -> Result<Vec<f32>> {
		let cfg = &self.cfg.providers.embedding;
		let texts = [query.to_string()];
		let vectors = tokio_time::timeout(timeout, self.providers.embedding.embed(cfg, &texts))
			.await
			.map_err(|_| Error::ProviderUnavailable {
				message: format!("Query embedding exceeded {} ms.", timeout.as_millis()),
			})??;
		let vector = vectors.into_iter().next().ok_or_else(|| Error::ProviderUnavailable {
			message: "Embedding provider returned no vector.".to_string(),
		})?;
		let expected = self.index.dimensions();

		if vector.len() != expected {
			return Err(Error::DimensionMismatch { expected, actual: vector.len() });
		}

		Ok(vector)
	}

	fn collect_vector(&self, candidates: &mut BTreeMap<RecordId, Candidate>, hits: Vec<IndexHit>) {
		let cfg = &self.cfg.search;

		for hit in hits {
			if hit.similarity < cfg.min_similarity {
				continue;
			}

			let mut score = (hit.similarity + 1.0) / 2.0;

			if hit.stale {
				score *= cfg.stale_weight;
			}

			let candidate = candidates.entry(hit.key.record_id).or_default();

			if candidate.vector.as_ref().is_none_or(|best| score > best.score) {
				candidate.vector = Some(FieldScore { score, field: hit.key.field });
				candidate.stale = hit.stale;
			}
		}
	}

	fn fuse(
		&self,
		store: &StoreState,
		candidates: BTreeMap<RecordId, Candidate>,
		top_k: usize,
	) -> Vec<SearchHit> {
		let cfg = &self.cfg.search;
		let mut hits: Vec<SearchHit> = candidates
			.into_iter()
			.filter_map(|(record_id, candidate)| {
				// Vectors of records deleted since the index answered are dropped here.
				let record = store.records.get(&record_id)?;
				let vector_score = candidate.vector.as_ref().map_or(0.0, |best| best.score);
				let keyword_score = candidate.keyword.as_ref().map_or(0.0, |best| best.score);
				let field = match (candidate.vector, candidate.keyword) {
					(Some(vector), Some(keyword)) =>
						if keyword.score > vector.score { keyword.field } else { vector.field },
					(Some(vector), None) => vector.field,
					(None, Some(keyword)) => keyword.field,
					(None, None) => return None,
				};

				Some(SearchHit {
					record_id,
					kind: record.kind,
					content_version: record.content_version,
					score: cfg.vector_weight * vector_score + cfg.keyword_weight * keyword_score,
					vector_score,
					keyword_score,
					field,
					stale: candidate.stale,
				})
			})
			.collect();

		hits.sort_by(cmp_hits);
		hits.truncate(top_k);

		hits
	}
}

fn default_top_k() -> usize {
	DEFAULT_TOP_K
}

fn collect_keyword(
	candidates: &mut BTreeMap<RecordId, Candidate>,
	store: &StoreState,
	req: &SearchRequest,
	max_terms: usize,
) {
	let phrase = text::normalize(req.query.trim());
	let terms = text::query_terms(&req.query, max_terms);

	if terms.is_empty() {
		return;
	}

	for record in store.records.values() {
		if req.kind.is_some_and(|kind| kind != record.kind) {
			continue;
		}

		let mut best: Option<FieldScore> = None;

		for field in record.fields.iter().filter(|field| req.allows_field(&field.name)) {
			let score = keyword_score(&field.text, phrase.trim(), &terms);

			if score > 0.0 && best.as_ref().is_none_or(|best| score > best.score) {
				best = Some(FieldScore { score, field: field.name.clone() });
			}
		}

		if let Some(best) = best {
			candidates.entry(record.id.clone()).or_default().keyword = Some(best);
		}
	}
}

/// Scores one field against the query in `[0, 1]`.
///
/// A multi-term query found verbatim scores 1. Otherwise each term earns full credit as a whole
/// token and half credit as a substring, averaged over the terms.
pub(crate) fn keyword_score(field_text: &str, phrase: &str, terms: &[String]) -> f32 {
	if terms.is_empty() {
		return 0.0;
	}

	let normalized = text::normalize(field_text);

	if terms.len() > 1 && !phrase.is_empty() && normalized.contains(phrase) {
		return 1.0;
	}

	let tokens: HashSet<String> = text::tokenize(&normalized).into_iter().collect();
	let earned: f32 = terms
		.iter()
		.map(|term| {
			if tokens.contains(term) {
				1.0
			} else if normalized.contains(term.as_str()) {
				0.5
			} else {
				0.0
			}
		})
		.sum();

	earned / terms.len() as f32
}

/// Higher fused score first, then the more recent content version, then record id.
fn cmp_hits(left: &SearchHit, right: &SearchHit) -> Ordering {
	right
		.score
		.total_cmp(&left.score)
		.then_with(|| right.content_version.cmp(&left.content_version))
		.then_with(|| left.record_id.cmp(&right.record_id))
}
