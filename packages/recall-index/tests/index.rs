use std::{
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	thread,
	time::{Duration, Instant},
};

use recall_domain::{FieldKey, RecordId, RecordKind};
use recall_index::{Error, IndexUpsert, LayoutKind, QueryFilter, VectorIndex};

const DIM: usize = 8;

fn index_cfg(exact_threshold: usize) -> recall_config::Index {
	recall_config::Index {
		exact_threshold,
		lists: None,
		probes: 4,
		rebuild_growth_factor: 4.0,
		kmeans_iterations: 6,
		max_training_points: 4_096,
	}
}

fn key(id: &str, field: &str) -> FieldKey {
	FieldKey::new(RecordId::from(id), field)
}

fn upsert(id: &str, field: &str, kind: RecordKind, vector: Vec<f32>) -> IndexUpsert {
	IndexUpsert { key: key(id, field), kind, source_version: 1, vector }
}

fn axis(idx: usize, scale: f32) -> Vec<f32> {
	let mut out = vec![0.0; DIM];

	out[idx % DIM] = scale;

	out
}

/// Deterministic pseudo-random vector; good enough to spread entries over partitions.
fn spread(seed: usize) -> Vec<f32> {
	let mut state = (seed as u64).wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);

	(0..DIM)
		.map(|_| {
			state = state
				.wrapping_mul(6_364_136_223_846_793_005)
				.wrapping_add(1_442_695_040_888_963_407);

			((state >> 33) as f32 / (1_u64 << 31) as f32) - 0.5
		})
		.collect()
}

#[test]
fn exact_query_orders_by_cosine_ignoring_magnitude() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);
	let mut near = axis(0, 10.0);

	near[1] = 1.0;

	index.upsert(upsert("far", "combined", RecordKind::Note, axis(1, 1.0))).expect("upsert failed");
	index.upsert(upsert("near", "combined", RecordKind::Note, near)).expect("upsert failed");
	index
		.upsert(upsert("exact", "combined", RecordKind::Note, axis(0, 0.1)))
		.expect("upsert failed");

	let hits = index.query(&axis(0, 3.0), 2, &QueryFilter::default()).expect("query failed");
	let ids: Vec<&str> = hits.iter().map(|hit| hit.key.record_id.as_str()).collect();

	assert_eq!(ids, vec!["exact", "near"]);
	assert!((hits[0].similarity - 1.0).abs() < 1e-5);
}

#[test]
fn dimension_mismatch_is_a_hard_error() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);
	let err = index
		.upsert(upsert("a", "title", RecordKind::Note, vec![1.0; DIM + 1]))
		.expect_err("Expected dimension mismatch.");

	assert!(matches!(err, Error::DimensionMismatch { expected: DIM, actual } if actual == DIM + 1));
	assert!(index.is_empty());
	assert!(index.query(&[1.0; 3], 5, &QueryFilter::default()).is_err());
}

#[test]
fn zero_vectors_are_rejected() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);

	assert!(matches!(
		index.upsert(upsert("a", "title", RecordKind::Note, vec![0.0; DIM])),
		Err(Error::InvalidVector { .. })
	));
}

#[test]
fn filter_restricts_kind_and_fields() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);

	index.upsert(upsert("n1", "title", RecordKind::Note, axis(0, 1.0))).expect("upsert failed");
	index.upsert(upsert("n1", "body", RecordKind::Note, axis(0, 1.0))).expect("upsert failed");
	index
		.upsert(upsert("t1", "description", RecordKind::Task, axis(0, 1.0)))
		.expect("upsert failed");

	let tasks = index
		.query(&axis(0, 1.0), 10, &QueryFilter::kind(Some(RecordKind::Task)))
		.expect("query failed");

	assert_eq!(tasks.len(), 1);
	assert_eq!(tasks[0].kind, RecordKind::Task);

	let bodies = index
		.query(&axis(0, 1.0), 10, &QueryFilter {
			kind: None,
			fields: Some(vec!["body".to_string()]),
		})
		.expect("query failed");

	assert_eq!(bodies.len(), 1);
	assert_eq!(bodies[0].key, key("n1", "body"));
}

#[test]
fn never_returns_more_than_k() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);

	for id in 0..50 {
		index
			.upsert(upsert(&id.to_string(), "combined", RecordKind::Note, spread(id)))
			.expect("upsert failed");
	}

	for k in [0, 1, 7, 50, 80] {
		let hits = index.query(&spread(999), k, &QueryFilter::default()).expect("query failed");

		assert_eq!(hits.len(), k.min(50));
	}
}

#[test]
fn stale_marks_and_removal_are_visible_to_queries() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);

	index.upsert(upsert("a", "title", RecordKind::Note, axis(0, 1.0))).expect("upsert failed");
	index.upsert(upsert("a", "body", RecordKind::Note, axis(1, 1.0))).expect("upsert failed");
	index.upsert(upsert("b", "title", RecordKind::Note, axis(0, 1.0))).expect("upsert failed");

	assert!(index.mark_stale(&key("a", "title")));

	let hits = index.query(&axis(0, 1.0), 1, &QueryFilter::default()).expect("query failed");

	assert!(hits[0].stale);

	assert!(index.refresh_version(&key("a", "title"), 2));
	assert_eq!(index.remove_record(&RecordId::from("a")), 2);
	assert!(!index.remove(&key("a", "title")));
	assert_eq!(index.len(), 1);
}

#[test]
fn identical_queries_return_identical_results() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);

	for id in 0..30 {
		// Every other record shares a vector to exercise tie-breaking.
		let vector = if id % 2 == 0 { axis(2, 1.0) } else { spread(id) };

		index
			.upsert(upsert(&format!("r{id:02}"), "combined", RecordKind::Note, vector))
			.expect("upsert failed");
	}

	let first = index.query(&axis(2, 1.0), 10, &QueryFilter::default()).expect("query failed");
	let second = index.query(&axis(2, 1.0), 10, &QueryFilter::default()).expect("query failed");

	assert_eq!(first, second);
	assert_eq!(first[0].key.record_id.as_str(), "r00");
}

#[test]
fn explicit_rebuild_builds_partitions_above_threshold() {
	let index = VectorIndex::new(index_cfg(64), DIM);

	for id in 0..63 {
		index
			.upsert(upsert(&id.to_string(), "combined", RecordKind::Note, spread(id)))
			.expect("upsert failed");
	}

	assert_eq!(index.stats().layout, LayoutKind::Flat);

	// Reaching the threshold schedules a background build; an explicit one either runs or
	// finds the background build already in progress.
	index
		.upsert(upsert("63", "combined", RecordKind::Note, spread(63)))
		.expect("upsert failed");
	index.rebuild();

	let layout = wait_for_ivf(&index, 64, Duration::from_secs(10));

	assert!(matches!(layout, LayoutKind::Ivf { partitions, .. } if partitions == 8));
}

#[test]
fn ivf_finds_exact_match_for_indexed_vector() {
	let mut cfg = index_cfg(100);

	cfg.lists = Some(10);
	cfg.probes = 2;

	let index = VectorIndex::new(cfg, DIM);

	for id in 0..400 {
		index
			.upsert(upsert(&id.to_string(), "combined", RecordKind::Note, spread(id)))
			.expect("upsert failed");
	}

	wait_for_ivf(&index, 400, Duration::from_secs(10));

	for probe in [3, 150, 399] {
		let hits = index.query(&spread(probe), 1, &QueryFilter::default()).expect("query failed");

		assert_eq!(hits[0].key.record_id.as_str(), probe.to_string());
	}
}

#[test]
fn growth_triggers_rebuild_while_queries_keep_working() {
	let index = VectorIndex::new(index_cfg(1_000), DIM);

	for id in 0..500 {
		index
			.upsert(upsert(&id.to_string(), "combined", RecordKind::Note, spread(id)))
			.expect("upsert failed");
	}

	assert_eq!(index.stats().layout, LayoutKind::Flat);

	let done = Arc::new(AtomicBool::new(false));
	let queries = Arc::new(AtomicUsize::new(0));
	let readers: Vec<_> = (0..4)
		.map(|reader| {
			let index = index.clone();
			let done = done.clone();
			let queries = queries.clone();

			thread::spawn(move || {
				while !done.load(Ordering::Acquire) {
					let hits = index
						.query(&spread(10_000 + reader), 10, &QueryFilter::default())
						.expect("query failed during rebuild");

					assert!(hits.len() <= 10);
					assert!(!hits.is_empty());
					assert!(hits.windows(2).all(|pair| pair[0].similarity >= pair[1].similarity));

					queries.fetch_add(1, Ordering::Relaxed);
				}
			})
		})
		.collect();

	for id in 500..5_000 {
		index
			.upsert(upsert(&id.to_string(), "combined", RecordKind::Note, spread(id)))
			.expect("upsert failed");
	}

	let layout = wait_for_ivf(&index, 4_000, Duration::from_secs(30));

	done.store(true, Ordering::Release);

	for reader in readers {
		reader.join().expect("Reader thread panicked.");
	}

	assert!(queries.load(Ordering::Relaxed) > 0);
	assert!(matches!(layout, LayoutKind::Ivf { .. }));
	assert_eq!(index.len(), 5_000);

	let hits = index.query(&spread(4_321), 1, &QueryFilter::default()).expect("query failed");

	assert_eq!(hits[0].key.record_id.as_str(), "4321");
}

fn wait_for_ivf(index: &VectorIndex, min_built_from: usize, timeout: Duration) -> LayoutKind {
	let deadline = Instant::now() + timeout;

	loop {
		let stats = index.stats();

		if let LayoutKind::Ivf { built_from, .. } = stats.layout
			&& built_from >= min_built_from
			&& !stats.rebuilding
		{
			return stats.layout;
		}

		assert!(Instant::now() < deadline, "Timed out waiting for index rebuild: {stats:?}.");

		thread::sleep(Duration::from_millis(20));
	}
}
