mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Config, EmbeddingProviderConfig, GenerationProviderConfig, Index, Lifecycle, Providers, Rag,
	Search, Service,
};

pub const PROVIDER_OPENAI: &str = "openai";
pub const PROVIDER_HASH: &str = "hash";

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	validate_providers(cfg)?;
	validate_lifecycle(cfg)?;
	validate_index(cfg)?;
	validate_search(cfg)?;
	validate_rag(cfg)?;

	Ok(())
}

fn validate_providers(cfg: &Config) -> Result<()> {
	let embedding = &cfg.providers.embedding;

	if embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}

	match embedding.provider_id.as_str() {
		PROVIDER_OPENAI => {
			if embedding.api_base.trim().is_empty() {
				return Err(Error::Validation {
					message: "providers.embedding.api_base must be non-empty.".to_string(),
				});
			}
			if embedding.model.trim().is_empty() {
				return Err(Error::Validation {
					message: "providers.embedding.model must be non-empty.".to_string(),
				});
			}
		},
		PROVIDER_HASH => {},
		other => {
			return Err(Error::Validation {
				message: format!(
					"providers.embedding.provider_id must be one of openai or hash, got {other}."
				),
			});
		},
	}

	if cfg.providers.generation.provider_id != PROVIDER_OPENAI {
		return Err(Error::Validation {
			message: format!(
				"providers.generation.provider_id must be openai, got {}.",
				cfg.providers.generation.provider_id
			),
		});
	}

	for (label, key) in [
		("embedding", &cfg.providers.embedding.api_key),
		("generation", &cfg.providers.generation.api_key),
	] {
		let needs_key = label != "embedding" || embedding.provider_id == PROVIDER_OPENAI;

		if needs_key && key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	for (label, timeout_ms) in [
		("providers.embedding.timeout_ms", embedding.timeout_ms),
		("providers.generation.timeout_ms", cfg.providers.generation.timeout_ms),
	] {
		if timeout_ms == 0 {
			return Err(Error::Validation {
				message: format!("{label} must be greater than zero."),
			});
		}
	}

	Ok(())
}

fn validate_lifecycle(cfg: &Config) -> Result<()> {
	let lifecycle = &cfg.lifecycle;

	for (label, value) in [
		("lifecycle.workers", lifecycle.workers),
		("lifecycle.queue_capacity", lifecycle.queue_capacity),
		("lifecycle.max_attempts", lifecycle.max_attempts as usize),
	] {
		if value == 0 {
			return Err(Error::Validation {
				message: format!("{label} must be greater than zero."),
			});
		}
	}

	if lifecycle.max_backoff_ms < lifecycle.base_backoff_ms {
		return Err(Error::Validation {
			message: "lifecycle.max_backoff_ms must be at least lifecycle.base_backoff_ms."
				.to_string(),
		});
	}
	if !lifecycle.jitter_ratio.is_finite() || !(0.0..1.0).contains(&lifecycle.jitter_ratio) {
		return Err(Error::Validation {
			message: "lifecycle.jitter_ratio must be in the range 0.0-1.0 (exclusive).".to_string(),
		});
	}

	Ok(())
}

fn validate_index(cfg: &Config) -> Result<()> {
	let index = &cfg.index;

	if index.lists == Some(0) {
		return Err(Error::Validation {
			message: "index.lists must be greater than zero when set.".to_string(),
		});
	}
	if index.probes == 0 {
		return Err(Error::Validation {
			message: "index.probes must be greater than zero.".to_string(),
		});
	}
	if !index.rebuild_growth_factor.is_finite() || index.rebuild_growth_factor <= 1.0 {
		return Err(Error::Validation {
			message: "index.rebuild_growth_factor must be a finite number greater than 1.0."
				.to_string(),
		});
	}
	if index.kmeans_iterations == 0 {
		return Err(Error::Validation {
			message: "index.kmeans_iterations must be greater than zero.".to_string(),
		});
	}
	if index.max_training_points == 0 {
		return Err(Error::Validation {
			message: "index.max_training_points must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_search(cfg: &Config) -> Result<()> {
	let search = &cfg.search;

	for (label, weight) in [
		("search.vector_weight", search.vector_weight),
		("search.keyword_weight", search.keyword_weight),
	] {
		if !weight.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if weight < 0.0 {
			return Err(Error::Validation { message: format!("{label} must be zero or greater.") });
		}
	}

	if search.vector_weight + search.keyword_weight <= 0.0 {
		return Err(Error::Validation {
			message: "search.vector_weight and search.keyword_weight must not both be zero."
				.to_string(),
		});
	}
	if search.candidate_multiplier == 0 {
		return Err(Error::Validation {
			message: "search.candidate_multiplier must be greater than zero.".to_string(),
		});
	}
	if !search.stale_weight.is_finite() || !(0.0..=1.0).contains(&search.stale_weight) {
		return Err(Error::Validation {
			message: "search.stale_weight must be in the range 0.0-1.0.".to_string(),
		});
	}
	if !search.min_similarity.is_finite() || !(-1.0..=1.0).contains(&search.min_similarity) {
		return Err(Error::Validation {
			message: "search.min_similarity must be in the range -1.0-1.0.".to_string(),
		});
	}
	if search.query_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "search.query_timeout_ms must be greater than zero.".to_string(),
		});
	}
	if search.max_query_terms == 0 {
		return Err(Error::Validation {
			message: "search.max_query_terms must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_rag(cfg: &Config) -> Result<()> {
	let rag = &cfg.rag;

	if rag.candidate_k == 0 {
		return Err(Error::Validation {
			message: "rag.candidate_k must be greater than zero.".to_string(),
		});
	}
	if rag.context_budget_chars == 0 {
		return Err(Error::Validation {
			message: "rag.context_budget_chars must be greater than zero.".to_string(),
		});
	}
	if rag.generation_timeout_ms == 0 {
		return Err(Error::Validation {
			message: "rag.generation_timeout_ms must be greater than zero.".to_string(),
		});
	}
	if rag.ask_deadline_ms < rag.generation_timeout_ms {
		return Err(Error::Validation {
			message: "rag.ask_deadline_ms must be at least rag.generation_timeout_ms.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	cfg.providers.embedding.provider_id =
		cfg.providers.embedding.provider_id.trim().to_ascii_lowercase();
	cfg.providers.generation.provider_id =
		cfg.providers.generation.provider_id.trim().to_ascii_lowercase();

	if cfg.rag.instruction.as_deref().map(|text| text.trim().is_empty()).unwrap_or(false) {
		cfg.rag.instruction = None;
	}

	let api_base = cfg.providers.embedding.api_base.trim_end_matches('/').to_string();

	cfg.providers.embedding.api_base = api_base;

	let api_base = cfg.providers.generation.api_base.trim_end_matches('/').to_string();

	cfg.providers.generation.api_base = api_base;
}
