use std::io::Cursor;

use clap::Parser;

use recall::{Args, Command};
use recall_domain::{RecordId, RecordKind};
use recall_service::SearchType;

const RECORDS: &str = r#"{"id":1,"kind":"note","fields":[{"name":"title","text":"Trip"},{"name":"body","text":"Flight to Rome"}],"content_version":1}

{"id":"6","kind":"task","fields":[{"name":"description","text":"Pay electricity bill"}],"content_version":2}
{"id":"7","kind":"note","fields":[{"name":"title","text":"Recipes"},{"name":"body","text":"Fresh pasta"}],"content_version":1}
"#;

#[test]
fn reads_jsonl_and_skips_blank_lines() {
	let records = recall::read_records(Cursor::new(RECORDS)).expect("records should parse");

	assert_eq!(records.len(), 3);
	assert_eq!(records[0].id, RecordId::from("1"));
	assert_eq!(records[1].kind, RecordKind::Task);
	assert_eq!(records[1].content_version, 2);
}

#[test]
fn reports_the_offending_line() {
	let input = "{\"id\":\"1\",\"kind\":\"note\",\"fields\":[],\"content_version\":1}\nnot json\n";
	let err = recall::read_records(Cursor::new(input)).expect_err("Expected a parse error.");

	assert!(err.to_string().contains("line 2"));
}

#[test]
fn parses_search_arguments() {
	let args = Args::try_parse_from([
		"recall", "-c", "recall.toml", "-r", "records.jsonl", "search", "rome", "--kind", "task",
		"--top-k", "3", "--mode", "semantic", "--field", "title", "--field", "body",
	])
	.expect("arguments should parse");

	match args.command {
		Command::Search { query, kind, top_k, mode, fields } => {
			assert_eq!(query, "rome");
			assert_eq!(kind, Some(RecordKind::Task));
			assert_eq!(top_k, 3);
			assert_eq!(mode, SearchType::Semantic);
			assert_eq!(fields, vec!["title".to_string(), "body".to_string()]);
		},
		other => panic!("Unexpected command: {other:?}."),
	}
}

#[test]
fn search_and_ask_default_to_combined_retrieval() {
	let search =
		Args::try_parse_from(["recall", "-c", "a.toml", "-r", "b.jsonl", "search", "rome"])
			.expect("arguments should parse");
	let ask = Args::try_parse_from([
		"recall", "-c", "a.toml", "-r", "b.jsonl", "ask", "trips?", "--mode", "text",
	])
	.expect("arguments should parse");

	assert!(matches!(
		search.command,
		Command::Search { mode: SearchType::Combined, ref fields, .. } if fields.is_empty()
	));
	assert!(matches!(ask.command, Command::Ask { mode: SearchType::Text, .. }));
}

#[test]
fn rejects_unknown_kinds() {
	let parsed = Args::try_parse_from([
		"recall", "-c", "recall.toml", "-r", "records.jsonl", "search", "rome", "--kind", "event",
	]);

	assert!(parsed.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_runs_over_loaded_records() {
	let records = recall::read_records(Cursor::new(RECORDS)).expect("records should parse");
	let command = Command::Search {
		query: "Rome".to_string(),
		kind: None,
		top_k: 5,
		mode: SearchType::Combined,
		fields: Vec::new(),
	};
	let output = recall::execute(recall_testkit::test_config(64), records, &command)
		.await
		.expect("search failed");

	assert_eq!(output["mode"], "hybrid");
	assert_eq!(output["hits"][0]["record_id"], "1");
	assert_eq!(output["hits"][0]["keyword_score"], 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ask_without_a_reachable_generator_still_cites() {
	let records = recall::read_records(Cursor::new(RECORDS)).expect("records should parse");
	let command =
		Command::Ask { question: "electricity bill".to_string(), mode: SearchType::Combined };
	let output = recall::execute(recall_testkit::test_config(64), records, &command)
		.await
		.expect("ask failed");

	assert_eq!(output["state"], "errored");
	assert!(output["answer"].is_null());
	assert_eq!(output["citations"][0]["record_id"], "6");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn field_scoped_search_only_reports_requested_fields() {
	let records = recall::read_records(Cursor::new(RECORDS)).expect("records should parse");
	let command = Command::Search {
		query: "Rome".to_string(),
		kind: None,
		top_k: 5,
		mode: SearchType::Combined,
		fields: vec!["title".to_string()],
	};
	let output = recall::execute(recall_testkit::test_config(64), records, &command)
		.await
		.expect("search failed");
	let hits = output["hits"].as_array().expect("hits should be an array");

	assert!(hits.iter().all(|hit| hit["field"] == "title" && hit["keyword_score"] == 0.0));
}
