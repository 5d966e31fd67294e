use serde::Serialize;

/// Freshness of one field's embedding relative to its record's content version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EmbeddingStatus {
	Pending,
	Fresh,
	Stale,
	Failed { attempts: u32 },
}
impl EmbeddingStatus {
	/// Only fresh and stale vectors may take part in ranking.
	pub fn is_searchable(self) -> bool {
		matches!(self, Self::Fresh | Self::Stale)
	}

	pub fn label(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Fresh => "fresh",
			Self::Stale => "stale",
			Self::Failed { .. } => "failed",
		}
	}
}
