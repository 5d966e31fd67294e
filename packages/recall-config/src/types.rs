use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub providers: Providers,
	#[serde(default)]
	pub lifecycle: Lifecycle,
	#[serde(default)]
	pub index: Index,
	#[serde(default)]
	pub search: Search,
	#[serde(default)]
	pub rag: Rag,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub generation: GenerationProviderConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	/// `openai` for an OpenAI-compatible endpoint, `hash` for the local hashed embedder.
	pub provider_id: String,
	#[serde(default)]
	pub api_base: String,
	#[serde(default)]
	pub api_key: String,
	#[serde(default = "default_embedding_path")]
	pub path: String,
	#[serde(default)]
	pub model: String,
	/// Vector dimension shared by every embedding in the system.
	pub dimensions: u32,
	#[serde(default = "default_provider_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GenerationProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	#[serde(default = "default_generation_path")]
	pub path: String,
	pub model: String,
	#[serde(default = "default_temperature")]
	pub temperature: f32,
	#[serde(default = "default_max_tokens")]
	pub max_tokens: u32,
	#[serde(default = "default_generation_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Lifecycle {
	pub workers: usize,
	pub queue_capacity: usize,
	pub max_attempts: u32,
	pub base_backoff_ms: u64,
	pub max_backoff_ms: u64,
	/// Fraction of each backoff delay that is randomized in both directions.
	pub jitter_ratio: f32,
}
impl Default for Lifecycle {
	fn default() -> Self {
		Self {
			workers: 4,
			queue_capacity: 1_024,
			max_attempts: 5,
			base_backoff_ms: 1_000,
			max_backoff_ms: 60_000,
			jitter_ratio: 0.2,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Index {
	/// Below this many entries every query is an exact scan.
	pub exact_threshold: usize,
	/// Fixed partition count. When unset the count follows the corpus size.
	pub lists: Option<u32>,
	pub probes: u32,
	pub rebuild_growth_factor: f32,
	pub kmeans_iterations: u32,
	pub max_training_points: usize,
}
impl Default for Index {
	fn default() -> Self {
		Self {
			exact_threshold: 1_000,
			lists: None,
			probes: 8,
			rebuild_growth_factor: 4.0,
			kmeans_iterations: 8,
			max_training_points: 16_384,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Search {
	pub vector_weight: f32,
	pub keyword_weight: f32,
	/// Vector candidates fetched per requested result.
	pub candidate_multiplier: u32,
	/// Multiplier applied to similarity scores that come from stale vectors.
	pub stale_weight: f32,
	/// Raw cosine similarity below which vector hits are dropped.
	pub min_similarity: f32,
	pub query_timeout_ms: u64,
	pub max_query_terms: usize,
}
impl Default for Search {
	fn default() -> Self {
		Self {
			vector_weight: 0.7,
			keyword_weight: 0.3,
			candidate_multiplier: 4,
			stale_weight: 0.8,
			min_similarity: 0.0,
			query_timeout_ms: 5_000,
			max_query_terms: 32,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Rag {
	pub candidate_k: u32,
	pub context_budget_chars: usize,
	pub generation_timeout_ms: u64,
	pub ask_deadline_ms: u64,
	pub instruction: Option<String>,
}
impl Default for Rag {
	fn default() -> Self {
		Self {
			candidate_k: 10,
			context_budget_chars: 4_000,
			generation_timeout_ms: 30_000,
			ask_deadline_ms: 45_000,
			instruction: None,
		}
	}
}

fn default_embedding_path() -> String {
	"/embeddings".to_string()
}

fn default_generation_path() -> String {
	"/chat/completions".to_string()
}

fn default_provider_timeout_ms() -> u64 {
	10_000
}

fn default_generation_timeout_ms() -> u64 {
	30_000
}

fn default_temperature() -> f32 {
	0.7
}

fn default_max_tokens() -> u32 {
	500
}
