pub mod lifecycle;
pub mod rag;
pub mod search;
pub mod store;

mod error;

pub use error::{Error, Result};
pub use lifecycle::{ChangeReport, Degradation};
pub use rag::{AskResponse, AskState, Citation, DEFAULT_INSTRUCTION};
pub use search::{SearchHit, SearchMode, SearchRequest, SearchResponse, SearchType};
pub use store::{FieldStatus, RecordStatus};

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::sync::broadcast;

use lifecycle::Lifecycle;
use recall_config::{
	Config, EmbeddingProviderConfig, GenerationProviderConfig, PROVIDER_HASH, PROVIDER_OPENAI,
};
use recall_domain::{Record, RecordId};
use recall_index::{IndexStats, VectorIndex};
use recall_providers::{embedding, generation, hashed};
use store::Store;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<Vec<f32>>>>;
}

pub trait GenerationProvider
where
	Self: Send + Sync,
{
	fn complete<'a>(
		&'a self,
		cfg: &'a GenerationProviderConfig,
		prompt: &'a str,
		deadline: Duration,
	) -> BoxFuture<'a, color_eyre::Result<String>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub generation: Arc<dyn GenerationProvider>,
}
impl Providers {
	pub fn new(
		embedding: Arc<dyn EmbeddingProvider>,
		generation: Arc<dyn GenerationProvider>,
	) -> Self {
		Self { embedding, generation }
	}
}
impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), generation: provider }
	}
}

/// Retrieval engine over the records fed to it through [`RecallService::on_content_changed`].
pub struct RecallService {
	pub cfg: Config,
	providers: Providers,
	store: Arc<Store>,
	index: VectorIndex,
	lifecycle: Lifecycle,
}
impl RecallService {
	/// Builds the service and starts its embedding workers.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new(cfg: Config, providers: Providers) -> Self {
		let store = Arc::new(Store::default());
		let index =
			VectorIndex::new(cfg.index.clone(), cfg.providers.embedding.dimensions as usize);
		let lifecycle = Lifecycle::start(&cfg, providers.clone(), store.clone(), index.clone());

		tracing::info!(
			dimensions = index.dimensions(),
			workers = cfg.lifecycle.workers,
			embedding_provider = %cfg.providers.embedding.provider_id,
			"Recall service started."
		);

		Self { cfg, providers, store, index, lifecycle }
	}

	pub fn on_content_changed(&self, record: Record) -> Result<ChangeReport> {
		self.lifecycle.on_content_changed(record)
	}

	pub fn on_record_deleted(&self, record_id: &RecordId) -> bool {
		self.lifecycle.on_record_deleted(record_id)
	}

	pub fn embedding_status(&self, record_id: &RecordId) -> Option<RecordStatus> {
		self.store.status(record_id)
	}

	pub fn index_stats(&self) -> IndexStats {
		self.index.stats()
	}

	/// Jobs queued or running.
	pub fn pending_jobs(&self) -> usize {
		self.lifecycle.outstanding()
	}

	pub fn subscribe_degradations(&self) -> broadcast::Receiver<Degradation> {
		self.lifecycle.subscribe()
	}

	/// Resolves once no embedding job is queued or running.
	pub async fn wait_idle(&self) {
		self.lifecycle.wait_idle().await;
	}

	/// Stops accepting changes, drops queued jobs and waits for the workers to exit.
	pub async fn shutdown(&self) {
		self.lifecycle.shutdown().await;

		tracing::info!("Recall service stopped.");
	}
}

struct DefaultProviders;

impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<Vec<f32>>>> {
		Box::pin(async move {
			match cfg.provider_id.as_str() {
				PROVIDER_HASH => Ok(texts
					.iter()
					.map(|text| hashed::embed_hashed(text, cfg.dimensions as usize))
					.collect()),
				PROVIDER_OPENAI => Ok(embedding::embed(cfg, texts).await?),
				other => Err(color_eyre::eyre::eyre!("Unsupported embedding provider: {other}.")),
			}
		})
	}
}

impl GenerationProvider for DefaultProviders {
	fn complete<'a>(
		&'a self,
		cfg: &'a GenerationProviderConfig,
		prompt: &'a str,
		deadline: Duration,
	) -> BoxFuture<'a, color_eyre::Result<String>> {
		Box::pin(async move { Ok(generation::complete(cfg, prompt, deadline).await?) })
	}
}
