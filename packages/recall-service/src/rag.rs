//! Retrieval-augmented answering.
//!
//! An ask moves through `Received → Retrieving → ContextBuilt → Generating → Answered`, or
//! ends in `Errored` when retrieval or generation cannot finish. Every outcome after retrieval
//! carries the cited records, so a failed generation still leaves the caller with grounded
//! search results. Retrieval and citations are deterministic for an unchanged corpus; the
//! generated prose is not.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time as tokio_time;
use uuid::Uuid;

use crate::{
	Error, RecallService, Result,
	search::{SearchHit, SearchMode, SearchRequest, SearchType},
};
use recall_domain::{Record, RecordId, RecordKind};

pub const DEFAULT_INSTRUCTION: &str = "You are a personal knowledge assistant. Answer the question \
using only the numbered notes and tasks below. If they do not contain the answer, say that you \
could not find it in the provided records. Cite the excerpts you rely on by their bracketed \
number, for example [1].";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AskState {
	Received,
	Retrieving,
	ContextBuilt,
	Generating,
	Answered,
	Errored,
}
impl AskState {
	pub fn can_advance_to(self, next: Self) -> bool {
		matches!(
			(self, next),
			(Self::Received, Self::Retrieving)
				| (Self::Retrieving, Self::ContextBuilt)
				| (Self::ContextBuilt, Self::Generating)
				| (Self::Generating, Self::Answered)
				| (Self::ContextBuilt, Self::Answered)
		) || (next == Self::Errored && !self.is_terminal())
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Answered | Self::Errored)
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Citation {
	/// 1-based position in the context, in ranking order.
	pub index: usize,
	pub record_id: RecordId,
	pub kind: RecordKind,
}

#[derive(Clone, Debug, Serialize)]
pub struct AskResponse {
	pub request_id: Uuid,
	pub state: AskState,
	/// `None` when nothing was retrieved or generation did not complete.
	pub answer: Option<String>,
	pub citations: Vec<Citation>,
	/// Records placed in the context, in citation order.
	pub used_records: Vec<SearchHit>,
	pub search_mode: Option<SearchMode>,
	/// Why the answer is missing, when it is missing because of a failure.
	pub error: Option<String>,
}

/// Context selected for one ask.
pub(crate) struct PackedContext {
	pub(crate) text: String,
	pub(crate) citations: Vec<Citation>,
	pub(crate) used: Vec<SearchHit>,
}

struct AskRun {
	request_id: Uuid,
	state: AskState,
}
impl AskRun {
	fn advance(&mut self, next: AskState) {
		if !self.state.can_advance_to(next) {
			tracing::error!(
				request_id = %self.request_id,
				from = ?self.state,
				to = ?next,
				"Rejected invalid ask state transition."
			);

			return;
		}

		tracing::debug!(
			request_id = %self.request_id,
			from = ?self.state,
			to = ?next,
			"Ask state changed."
		);

		self.state = next;
	}

	fn errored(
		mut self,
		err: Error,
		context: Option<PackedContext>,
		search_mode: Option<SearchMode>,
	) -> AskResponse {
		tracing::warn!(
			request_id = %self.request_id,
			error = %err,
			"Answer generation unavailable. Returning retrieved records only."
		);

		self.advance(AskState::Errored);

		let (citations, used_records) =
			context.map(|context| (context.citations, context.used)).unwrap_or_default();

		AskResponse {
			request_id: self.request_id,
			state: self.state,
			answer: None,
			citations,
			used_records,
			search_mode,
			error: Some(err.to_string()),
		}
	}
}

impl RecallService {
	/// Answers a question from the best matching records, retrieved with combined search.
	///
	/// Fails only for an invalid question. Provider failures and the overall deadline degrade the
	/// result to the retrieved records without an answer.
	pub async fn ask(&self, query: &str) -> Result<AskResponse> {
		self.ask_with(query, SearchType::Combined).await
	}

	/// Like [`RecallService::ask`], retrieving context with the given search type.
	pub async fn ask_with(&self, query: &str, search_type: SearchType) -> Result<AskResponse> {
		let query = query.trim();

		if query.is_empty() {
			return Err(Error::InvalidRequest {
				message: "Question must be non-empty.".to_string(),
			});
		}

		let rag = &self.cfg.rag;
		let started = Instant::now();
		let deadline = started + Duration::from_millis(rag.ask_deadline_ms);
		let mut run = AskRun { request_id: Uuid::new_v4(), state: AskState::Received };

		run.advance(AskState::Retrieving);

		let search_timeout =
			Duration::from_millis(self.cfg.search.query_timeout_ms).min(remaining(deadline));
		let req =
			SearchRequest::new(query, rag.candidate_k as usize).with_search_type(search_type);
		let found = match self.search_within(&req, search_timeout).await {
			Ok(found) => found,
			Err(err) => return Ok(run.errored(err, None, None)),
		};
		let context = {
			let store = self.store.read();

			pack_context(&found.hits, rag.context_budget_chars, |id| store.records.get(id).cloned())
		};

		run.advance(AskState::ContextBuilt);

		if context.used.is_empty() {
			run.advance(AskState::Answered);

			return Ok(AskResponse {
				request_id: run.request_id,
				state: run.state,
				answer: None,
				citations: Vec::new(),
				used_records: Vec::new(),
				search_mode: Some(found.mode),
				error: None,
			});
		}

		let generation_timeout =
			Duration::from_millis(rag.generation_timeout_ms).min(remaining(deadline));

		if generation_timeout.is_zero() {
			let err = Error::GenerationFailed {
				message: "The ask deadline elapsed before generation could start.".to_string(),
			};

			return Ok(run.errored(err, Some(context), Some(found.mode)));
		}

		let instruction = rag.instruction.as_deref().unwrap_or(DEFAULT_INSTRUCTION);
		let prompt = build_prompt(instruction, &context.text, query);

		run.advance(AskState::Generating);

		match self.generate(&prompt, generation_timeout).await {
			Ok(answer) => {
				run.advance(AskState::Answered);

				tracing::info!(
					request_id = %run.request_id,
					citations = context.citations.len(),
					elapsed_ms = started.elapsed().as_millis() as u64,
					"Ask answered."
				);

				Ok(AskResponse {
					request_id: run.request_id,
					state: run.state,
					answer: Some(answer),
					citations: context.citations,
					used_records: context.used,
					search_mode: Some(found.mode),
					error: None,
				})
			},
			Err(err) => Ok(run.errored(err, Some(context), Some(found.mode))),
		}
	}

	async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String> {
		let cfg = &self.cfg.providers.generation;
		let answer =
			tokio_time::timeout(timeout, self.providers.generation.complete(cfg, prompt, timeout))
				.await
				.map_err(|_| Error::GenerationFailed {
					message: format!("Generation exceeded {} ms.", timeout.as_millis()),
				})?
				.map_err(|err| Error::GenerationFailed { message: err.to_string() })?;
		let answer = answer.trim();

		if answer.is_empty() {
			return Err(Error::GenerationFailed {
				message: "Generation returned an empty answer.".to_string(),
			});
		}

		Ok(answer.to_string())
	}
}

/// Packs whole records into the context in ranking order.
///
/// A record that does not fit in the remaining budget is skipped and smaller records further
/// down the ranking may still be placed. Citation numbers follow placement order.
pub(crate) fn pack_context<F>(
	hits: &[SearchHit],
	budget_chars: usize,
	mut lookup: F,
) -> PackedContext
where
	F: FnMut(&RecordId) -> Option<Record>,
{
	let mut text = String::new();
	let mut used_chars = 0;
	let mut citations = Vec::new();
	let mut used = Vec::new();

	for hit in hits {
		let Some(record) = lookup(&hit.record_id) else {
			continue;
		};
		let index = citations.len() + 1;
		let excerpt = format_excerpt(index, &record);
		let separator = if text.is_empty() { 0 } else { 2 };
		let cost = excerpt.chars().count() + separator;

		if used_chars + cost > budget_chars {
			tracing::debug!(
				record_id = %hit.record_id,
				excerpt_chars = cost,
				remaining = budget_chars.saturating_sub(used_chars),
				"Record does not fit the context budget."
			);

			continue;
		}

		if separator > 0 {
			text.push_str("\n\n");
		}

		text.push_str(&excerpt);

		used_chars += cost;

		citations.push(Citation { index, record_id: record.id.clone(), kind: record.kind });
		used.push(hit.clone());
	}

	PackedContext { text, citations, used }
}

fn format_excerpt(index: usize, record: &Record) -> String {
	let mut out = format!("[{index}] {} {}", record.kind, record.id);

	for field in &record.fields {
		let text = field.text.trim();

		if text.is_empty() {
			continue;
		}

		out.push('\n');
		out.push_str(&field.name);
		out.push_str(": ");
		out.push_str(text);
	}

	out
}

fn build_prompt(instruction: &str, context: &str, question: &str) -> String {
	format!("{instruction}\n\nRecords:\n{context}\n\nQuestion: {question}\nAnswer:")
}

fn remaining(deadline: Instant) -> Duration {
	deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hit(id: &str, score: f32) -> SearchHit {
		SearchHit {
			record_id: RecordId::from(id),
			kind: RecordKind::Note,
			content_version: 1,
			score,
			vector_score: 0.0,
			keyword_score: score,
			field: "title".to_string(),
			stale: false,
		}
	}

	fn records() -> Vec<Record> {
		vec![
			Record::note("1", "Trip", "Flight to Rome", 1),
			Record::note("2", "Long", &"x".repeat(500), 1),
			Record::task("3", "Renew passport", 1),
		]
	}

	fn lookup(id: &RecordId) -> Option<Record> {
		records().into_iter().find(|record| &record.id == id)
	}

	#[test]
	fn excerpts_list_kind_id_and_fields() {
		let context = pack_context(&[hit("1", 0.9)], 1_000, lookup);

		assert_eq!(context.text, "[1] note 1\ntitle: Trip\nbody: Flight to Rome");
		assert_eq!(context.citations, vec![Citation {
			index: 1,
			record_id: RecordId::from("1"),
			kind: RecordKind::Note,
		}]);
	}

	#[test]
	fn oversized_records_are_skipped_whole() {
		let hits = [hit("1", 0.9), hit("2", 0.8), hit("3", 0.7)];
		let context = pack_context(&hits, 120, lookup);
		let ids: Vec<&str> =
			context.citations.iter().map(|citation| citation.record_id.as_str()).collect();

		assert_eq!(ids, vec!["1", "3"]);
		assert_eq!(context.citations[1].index, 2);
		assert!(context.text.contains("[2] task 3\ndescription: Renew passport"));
		assert!(!context.text.contains("xxx"));
		assert!(context.text.chars().count() <= 120);
	}

	#[test]
	fn missing_records_are_not_cited() {
		let context = pack_context(&[hit("gone", 1.0), hit("3", 0.5)], 1_000, lookup);

		assert_eq!(context.citations.len(), 1);
		assert_eq!(context.citations[0].index, 1);
		assert_eq!(context.used[0].record_id.as_str(), "3");
	}

	#[test]
	fn state_machine_only_moves_forward() {
		assert!(AskState::Received.can_advance_to(AskState::Retrieving));
		assert!(AskState::ContextBuilt.can_advance_to(AskState::Answered));
		assert!(AskState::Generating.can_advance_to(AskState::Errored));
		assert!(!AskState::Answered.can_advance_to(AskState::Errored));
		assert!(!AskState::Generating.can_advance_to(AskState::Retrieving));
		assert!(!AskState::Received.can_advance_to(AskState::Generating));
	}

	#[test]
	fn prompt_places_question_after_records() {
		let prompt = build_prompt("Be brief.", "[1] note 1\ntitle: Trip", "Where?");

		assert_eq!(
			prompt,
			"Be brief.\n\nRecords:\n[1] note 1\ntitle: Trip\n\nQuestion: Where?\nAnswer:"
		);
	}
}
