mod error;

pub use error::{Error, Result};

use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

use color_eyre::eyre;
use serde_json::Map;
use tokio::time;

use recall_config::{
	Config, EmbeddingProviderConfig, GenerationProviderConfig, Index, Lifecycle, PROVIDER_HASH,
	PROVIDER_OPENAI, Providers as ProviderSection, Rag, Search, Service,
};
use recall_providers::hashed;
use recall_service::{BoxFuture, EmbeddingProvider, GenerationProvider, Providers, RecallService};

/// Config with the hashed embedder, tiny backoffs and a small queue.
pub fn test_config(dimensions: u32) -> Config {
	Config {
		service: Service { log_level: "debug".to_string() },
		providers: ProviderSection {
			embedding: EmbeddingProviderConfig {
				provider_id: PROVIDER_HASH.to_string(),
				api_base: String::new(),
				api_key: String::new(),
				path: "/embeddings".to_string(),
				model: "hash".to_string(),
				dimensions,
				timeout_ms: 1_000,
				default_headers: Map::new(),
			},
			generation: GenerationProviderConfig {
				provider_id: PROVIDER_OPENAI.to_string(),
				api_base: "http://127.0.0.1:9".to_string(),
				api_key: "test-key".to_string(),
				path: "/chat/completions".to_string(),
				model: "test".to_string(),
				temperature: 0.0,
				max_tokens: 128,
				timeout_ms: 1_000,
				default_headers: Map::new(),
			},
		},
		lifecycle: Lifecycle {
			workers: 2,
			queue_capacity: 64,
			max_attempts: 5,
			base_backoff_ms: 2,
			max_backoff_ms: 10,
			jitter_ratio: 0.2,
		},
		index: Index::default(),
		search: Search { query_timeout_ms: 1_000, ..Search::default() },
		rag: Rag { generation_timeout_ms: 500, ask_deadline_ms: 2_000, ..Rag::default() },
	}
}

pub fn providers(embedding: Arc<StubEmbedder>, generation: Arc<StubGenerator>) -> Providers {
	Providers::new(embedding, generation)
}

/// Waits for the embedding queue to drain, failing after `timeout`.
pub async fn wait_idle(service: &RecallService, timeout: Duration) -> Result<()> {
	time::timeout(timeout, service.wait_idle()).await.map_err(|_| {
		Error::Message(format!(
			"Embedding queue did not drain within {} ms; {} jobs outstanding.",
			timeout.as_millis(),
			service.pending_jobs()
		))
	})
}

/// Hashed embedder with injectable failures and delays.
pub struct StubEmbedder {
	dimensions: usize,
	output_dimensions: usize,
	fail_containing: Vec<String>,
	fail_first: AtomicUsize,
	delay: Option<Duration>,
	slow_containing: Vec<(String, Duration)>,
	calls: AtomicUsize,
	failures: AtomicUsize,
}
impl StubEmbedder {
	pub fn hashed(dimensions: usize) -> Self {
		Self {
			dimensions,
			output_dimensions: dimensions,
			fail_containing: Vec::new(),
			fail_first: AtomicUsize::new(0),
			delay: None,
			slow_containing: Vec::new(),
			calls: AtomicUsize::new(0),
			failures: AtomicUsize::new(0),
		}
	}

	/// Every call whose input contains `needle` fails.
	pub fn failing_when_contains(mut self, needle: &str) -> Self {
		self.fail_containing.push(needle.to_string());

		self
	}

	/// The first `count` calls fail regardless of input.
	pub fn failing_first(self, count: usize) -> Self {
		self.fail_first.store(count, Ordering::SeqCst);

		self
	}

	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);

		self
	}

	/// Calls whose input contains `needle` take `delay` longer; others are unaffected.
	pub fn slow_when_contains(mut self, needle: &str, delay: Duration) -> Self {
		self.slow_containing.push((needle.to_string(), delay));

		self
	}

	/// Returns vectors of this length instead of the configured dimension.
	pub fn with_output_dimensions(mut self, dimensions: usize) -> Self {
		self.output_dimensions = dimensions;

		self
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn failures(&self) -> usize {
		self.failures.load(Ordering::SeqCst)
	}

	fn should_fail(&self, texts: &[String]) -> bool {
		let scheduled = self
			.fail_first
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();

		scheduled
			|| texts.iter().any(|text| {
				self.fail_containing.iter().any(|needle| text.contains(needle.as_str()))
			})
	}
}
impl EmbeddingProvider for StubEmbedder {
	fn embed<'a>(
		&'a self,
		_: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<Vec<f32>>>> {
		Box::pin(async move {
			self.calls.fetch_add(1, Ordering::SeqCst);

			if let Some(delay) = self.delay {
				time::sleep(delay).await;
			}
			for (needle, delay) in &self.slow_containing {
				if texts.iter().any(|text| text.contains(needle.as_str())) {
					time::sleep(*delay).await;
				}
			}
			if self.should_fail(texts) {
				self.failures.fetch_add(1, Ordering::SeqCst);

				return Err(eyre::eyre!("Stub embedding provider failure."));
			}

			Ok(texts
				.iter()
				.map(|text| {
					let mut vector = hashed::embed_hashed(text, self.dimensions);

					vector.resize(self.output_dimensions, 0.0);

					vector
				})
				.collect())
		})
	}
}

/// Generation stub that answers, fails, or stalls, and remembers the prompts it saw.
pub struct StubGenerator {
	behavior: GeneratorBehavior,
	prompts: Mutex<Vec<String>>,
}
impl StubGenerator {
	pub fn answering(answer: &str) -> Self {
		Self::with_behavior(GeneratorBehavior::Answer(answer.to_string()))
	}

	pub fn failing() -> Self {
		Self::with_behavior(GeneratorBehavior::Fail)
	}

	/// Sleeps for `delay` before answering, so callers with a shorter deadline time out.
	pub fn sleeping(delay: Duration) -> Self {
		Self::with_behavior(GeneratorBehavior::Sleep(delay))
	}

	pub fn prompts(&self) -> Vec<String> {
		self.prompts.lock().unwrap_or_else(|err| err.into_inner()).clone()
	}

	fn with_behavior(behavior: GeneratorBehavior) -> Self {
		Self { behavior, prompts: Mutex::new(Vec::new()) }
	}
}
impl GenerationProvider for StubGenerator {
	fn complete<'a>(
		&'a self,
		_: &'a GenerationProviderConfig,
		prompt: &'a str,
		_: Duration,
	) -> BoxFuture<'a, color_eyre::Result<String>> {
		Box::pin(async move {
			self.prompts.lock().unwrap_or_else(|err| err.into_inner()).push(prompt.to_string());

			match &self.behavior {
				GeneratorBehavior::Answer(answer) => Ok(answer.clone()),
				GeneratorBehavior::Fail => Err(eyre::eyre!("Stub generation provider failure.")),
				GeneratorBehavior::Sleep(delay) => {
					time::sleep(*delay).await;

					Ok("Too late.".to_string())
				},
			}
		})
	}
}

enum GeneratorBehavior {
	Answer(String),
	Fail,
	Sleep(Duration),
}
