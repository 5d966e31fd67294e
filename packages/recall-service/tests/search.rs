use std::{sync::Arc, time::Duration};

use recall_domain::{EmbeddingStatus, Record, RecordId, RecordKind};
use recall_providers::hashed;
use recall_service::{Error, RecallService, SearchMode, SearchRequest, SearchType};
use recall_testkit::{StubEmbedder, StubGenerator};

const DIM: u32 = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

async fn seeded(embedder: StubEmbedder) -> RecallService {
	seeded_with(Arc::new(embedder)).await
}

async fn seeded_with(embedder: Arc<StubEmbedder>) -> RecallService {
	let service = RecallService::new(
		recall_testkit::test_config(DIM),
		recall_testkit::providers(embedder, Arc::new(StubGenerator::answering("unused"))),
	);

	for record in [
		Record::note("1", "Trip", "Flight to Rome", 1),
		Record::note("3", "Recipes", "Fresh pasta with tomato sauce", 2),
		Record::note("4", "Rome notes", "Colosseum tickets and a Rome walking tour", 1),
		Record::task("5", "Book hotel in Paris", 4),
		Record::task("6", "Pay electricity bill", 1),
	] {
		service.on_content_changed(record).expect("change rejected");
	}

	recall_testkit::wait_idle(&service, IDLE_TIMEOUT).await.expect("queue did not drain");

	service
}

fn ids(hits: &[recall_service::SearchHit]) -> Vec<&str> {
	hits.iter().map(|hit| hit.record_id.as_str()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keyword_and_vector_agree_on_the_best_record() {
	let service = RecallService::new(
		recall_testkit::test_config(DIM),
		recall_testkit::providers(
			Arc::new(StubEmbedder::hashed(DIM as usize)),
			Arc::new(StubGenerator::answering("unused")),
		),
	);

	service
		.on_content_changed(Record::note("1", "Trip", "Flight to Rome", 1))
		.expect("change rejected");
	service
		.on_content_changed(Record::note("3", "Recipes", "Fresh pasta with tomato sauce", 1))
		.expect("change rejected");
	recall_testkit::wait_idle(&service, IDLE_TIMEOUT).await.expect("queue did not drain");

	let found = service.search(SearchRequest::new("Rome", 5)).await.expect("search failed");
	let top = &found.hits[0];

	assert_eq!(found.mode, SearchMode::Hybrid);
	assert_eq!(top.record_id.as_str(), "1");
	assert_eq!(top.keyword_score, 1.0);
	assert!(top.vector_score > 0.5);
	assert!(!top.stale);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn each_record_appears_once() {
	let service = seeded(StubEmbedder::hashed(DIM as usize)).await;
	let found = service.search(SearchRequest::new("Rome", 10)).await.expect("search failed");
	let mut seen = ids(&found.hits);

	assert_eq!(seen.iter().filter(|id| **id == "4").count(), 1);

	seen.sort();
	seen.dedup();

	assert_eq!(seen.len(), found.hits.len());

	let rome_notes =
		found.hits.iter().find(|hit| hit.record_id.as_str() == "4").expect("record 4 missing");

	assert_eq!(rome_notes.keyword_score, 1.0);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_searches_return_the_same_order() {
	let service = seeded(StubEmbedder::hashed(DIM as usize)).await;
	let first = service.search(SearchRequest::new("rome trip", 5)).await.expect("search failed");
	let second = service.search(SearchRequest::new("rome trip", 5)).await.expect("search failed");

	assert_eq!(ids(&first.hits), ids(&second.hits));
	assert_eq!(first.hits, second.hits);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_embeddings_still_match_by_keyword() {
	let embedder = StubEmbedder::hashed(DIM as usize).failing_when_contains("review");
	let service = seeded(embedder).await;

	service
		.on_content_changed(Record::task("2", "quarterly budget review", 1))
		.expect("change rejected");
	recall_testkit::wait_idle(&service, IDLE_TIMEOUT).await.expect("queue did not drain");

	let status = service.embedding_status(&RecordId::from("2")).expect("record should be known");

	assert!(
		status
			.fields
			.iter()
			.all(|field| matches!(field.status, EmbeddingStatus::Failed { attempts: 5 }))
	);

	let found =
		service.search(SearchRequest::new("quarterly budget", 10)).await.expect("search failed");
	let hit =
		found.hits.iter().find(|hit| hit.record_id.as_str() == "2").expect("record 2 missing");

	assert_eq!(found.mode, SearchMode::Hybrid);
	assert_eq!(hit.vector_score, 0.0);
	assert_eq!(hit.keyword_score, 1.0);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_embedding_failure_falls_back_to_keywords() {
	let embedder = StubEmbedder::hashed(DIM as usize).failing_when_contains("zzfail");
	let service = seeded(embedder).await;
	let found = service.search(SearchRequest::new("rome zzfail", 5)).await.expect("search failed");

	assert_eq!(found.mode, SearchMode::KeywordOnly);
	assert!(found.hits.iter().all(|hit| hit.vector_score == 0.0));
	assert!(ids(&found.hits).contains(&"1"));
	assert!(ids(&found.hits).contains(&"4"));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_query_embedding_is_abandoned() {
	let mut cfg = recall_testkit::test_config(DIM);

	cfg.search.query_timeout_ms = 50;

	let embedder = StubEmbedder::hashed(DIM as usize).with_delay(Duration::from_millis(300));
	let service = RecallService::new(
		cfg,
		recall_testkit::providers(Arc::new(embedder), Arc::new(StubGenerator::answering("unused"))),
	);

	service
		.on_content_changed(Record::task("5", "Book hotel in Paris", 1))
		.expect("change rejected");

	let found = service.search(SearchRequest::new("paris hotel", 5)).await.expect("search failed");

	assert_eq!(found.mode, SearchMode::KeywordOnly);
	assert_eq!(ids(&found.hits), vec!["5"]);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filters_restrict_kind_and_fields() {
	let service = seeded(StubEmbedder::hashed(DIM as usize)).await;
	let tasks = service
		.search(SearchRequest::new("rome paris", 10).with_kind(Some(RecordKind::Task)))
		.await
		.expect("search failed");

	assert!(!tasks.hits.is_empty());
	assert!(tasks.hits.iter().all(|hit| hit.kind == RecordKind::Task));

	let titles = service
		.search(SearchRequest::new("colosseum", 10).with_fields(vec!["title".to_string()]))
		.await
		.expect("search failed");

	assert!(titles.hits.iter().all(|hit| hit.keyword_score == 0.0));
	assert!(titles.hits.iter().all(|hit| hit.field == "title"));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_records_disappear_from_results() {
	let service = seeded(StubEmbedder::hashed(DIM as usize)).await;

	assert!(service.on_record_deleted(&RecordId::from("1")));

	let found = service.search(SearchRequest::new("Rome", 10)).await.expect("search failed");

	assert!(!ids(&found.hits).contains(&"1"));
	assert!(ids(&found.hits).contains(&"4"));

	service.shutdown().await;
}

#[tokio::test]
async fn rejects_empty_queries_and_zero_top_k() {
	let service = seeded(StubEmbedder::hashed(DIM as usize)).await;

	assert!(matches!(
		service.search(SearchRequest::new("   ", 5)).await,
		Err(Error::InvalidRequest { .. })
	));
	assert!(matches!(
		service.search(SearchRequest::new("rome", 0)).await,
		Err(Error::InvalidRequest { .. })
	));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_search_skips_the_query_embedding() {
	let embedder = Arc::new(StubEmbedder::hashed(DIM as usize));
	let service = seeded_with(embedder.clone()).await;
	let before = embedder.calls();
	let found = service
		.search(SearchRequest::new("Rome", 10).with_search_type(SearchType::Text))
		.await
		.expect("search failed");

	assert_eq!(embedder.calls(), before);
	assert_eq!(found.mode, SearchMode::KeywordOnly);
	assert!(found.hits.iter().all(|hit| hit.vector_score == 0.0));
	assert_eq!(ids(&found.hits), vec!["1", "4"]);

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn semantic_search_ignores_keyword_matches() {
	let embedder = Arc::new(StubEmbedder::hashed(DIM as usize));
	let service = seeded_with(embedder.clone()).await;
	let before = embedder.calls();
	let found = service
		.search(SearchRequest::new("Rome", 10).with_search_type(SearchType::Semantic))
		.await
		.expect("search failed");

	assert_eq!(embedder.calls(), before + 1);
	assert_eq!(found.mode, SearchMode::SemanticOnly);
	assert!(!found.hits.is_empty());
	assert!(found.hits.iter().all(|hit| hit.keyword_score == 0.0 && hit.vector_score > 0.0));
	assert!(ids(&found.hits).contains(&"1"));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn semantic_search_falls_back_to_keywords_without_an_embedding() {
	let embedder = StubEmbedder::hashed(DIM as usize).failing_when_contains("zzfail");
	let service = seeded(embedder).await;
	let found = service
		.search(SearchRequest::new("rome zzfail", 5).with_search_type(SearchType::Semantic))
		.await
		.expect("search failed");

	assert_eq!(found.mode, SearchMode::KeywordOnly);
	assert!(ids(&found.hits).contains(&"1"));

	service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_vectors_rank_at_the_stale_weight() {
	let embedder = StubEmbedder::hashed(DIM as usize)
		.slow_when_contains("embassy", Duration::from_millis(800));
	let service = seeded(embedder).await;

	service.on_content_changed(Record::task("s", "Renew passport", 1)).expect("change rejected");
	recall_testkit::wait_idle(&service, IDLE_TIMEOUT).await.expect("queue did not drain");
	service
		.on_content_changed(Record::task("s", "Renew passport at the embassy", 2))
		.expect("change rejected");

	let status = service.embedding_status(&RecordId::from("s")).expect("record should be known");

	assert!(status.fields.iter().all(|field| field.status == EmbeddingStatus::Stale));

	let query = "passport renew";
	let found = service
		.search(SearchRequest::new(query, 10).with_search_type(SearchType::Semantic))
		.await
		.expect("search failed");
	let hit =
		found.hits.iter().find(|hit| hit.record_id.as_str() == "s").expect("record s missing");
	let cosine: f32 = hashed::embed_hashed(query, DIM as usize)
		.iter()
		.zip(hashed::embed_hashed("Renew passport", DIM as usize))
		.map(|(left, right)| left * right)
		.sum();
	let expected = (cosine + 1.0) / 2.0 * service.cfg.search.stale_weight;

	assert!(hit.stale);
	assert!(
		(hit.vector_score - expected).abs() < 1e-4,
		"vector score {} should be {expected}",
		hit.vector_score
	);

	service.shutdown().await;
}
