use std::{
	fs::File,
	io::{BufRead, BufReader},
	path::PathBuf,
};

use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;

use recall_config::Config;
use recall_domain::{Record, RecordKind};
use recall_service::{Providers, RecallService, SearchRequest, SearchType};

#[derive(Debug, Parser)]
#[command(
	version = recall_cli::VERSION,
	rename_all = "kebab",
	styles = recall_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// One JSON record per line.
	#[arg(long, short = 'r', value_name = "JSONL")]
	pub records: PathBuf,
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Ranks records against a query.
	Search {
		query: String,
		#[arg(long)]
		kind: Option<RecordKind>,
		#[arg(long, default_value_t = 10)]
		top_k: usize,
		/// text, semantic or combined.
		#[arg(long, default_value_t = SearchType::Combined)]
		mode: SearchType,
		/// Restricts matching to this field. Repeatable.
		#[arg(long = "field", value_name = "NAME")]
		fields: Vec<String>,
	},
	/// Answers a question from the records, with citations.
	Ask {
		question: String,
		/// How context records are retrieved: text, semantic or combined.
		#[arg(long, default_value_t = SearchType::Combined)]
		mode: SearchType,
	},
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let cfg = recall_config::load(&args.config)?;

	recall_cli::init_tracing(&cfg.service.log_level)?;

	let file = File::open(&args.records)
		.wrap_err_with(|| format!("Failed to open records at {}.", args.records.display()))?;
	let records = read_records(BufReader::new(file))?;
	let output = execute(cfg, records, &args.command).await?;

	println!("{}", serde_json::to_string_pretty(&output)?);

	Ok(())
}

/// Feeds `records` into a fresh service, waits for embeddings to settle and runs `command`.
pub async fn execute(
	cfg: Config,
	records: Vec<Record>,
	command: &Command,
) -> color_eyre::Result<serde_json::Value> {
	let service = RecallService::new(cfg, Providers::default());
	let output = feed_and_run(&service, records, command).await;

	service.shutdown().await;

	output
}

/// Parses JSONL records, skipping blank lines.
pub fn read_records(reader: impl BufRead) -> color_eyre::Result<Vec<Record>> {
	let mut records = Vec::new();

	for (index, line) in reader.lines().enumerate() {
		let line = line?;

		if line.trim().is_empty() {
			continue;
		}

		let record = serde_json::from_str::<Record>(&line)
			.wrap_err_with(|| format!("Invalid record on line {}.", index + 1))?;

		records.push(record);
	}

	Ok(records)
}

async fn feed_and_run(
	service: &RecallService,
	records: Vec<Record>,
	command: &Command,
) -> color_eyre::Result<serde_json::Value> {
	let total = records.len();

	for record in records {
		let record_id = record.id.clone();
		let report = match service.on_content_changed(record.clone()) {
			Ok(report) => report,
			Err(err) if err.is_retryable() => {
				service.wait_idle().await;
				service.on_content_changed(record)?
			},
			Err(err) => return Err(err.into()),
		};

		if report.ignored {
			tracing::warn!(%record_id, "Skipped a record older than one already loaded.");
		}
	}

	service.wait_idle().await;

	tracing::info!(records = total, "Records indexed.");

	match command {
		Command::Search { query, kind, top_k, mode, fields } => {
			let mut req =
				SearchRequest::new(query.as_str(), *top_k).with_kind(*kind).with_search_type(*mode);

			if !fields.is_empty() {
				req = req.with_fields(fields.clone());
			}

			Ok(serde_json::to_value(service.search(req).await?)?)
		},
		Command::Ask { question, mode } =>
			Ok(serde_json::to_value(service.ask_with(question, *mode).await?)?),
	}
}
