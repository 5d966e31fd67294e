use recall_domain::RecordId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Provider unavailable: {message}")]
	ProviderUnavailable { message: String },
	#[error("Vector dimension mismatch: expected {expected}, got {actual}.")]
	DimensionMismatch { expected: usize, actual: usize },
	#[error(
		"Embedding for {record_id}:{field} computed from version {job_version} but the record is at version {current_version}."
	)]
	VersionRace { record_id: RecordId, field: String, job_version: u64, current_version: u64 },
	#[error("Embedding queue is full; retry the change for record {record_id} later.")]
	QueueSaturated { record_id: RecordId },
	#[error("Generation failed: {message}")]
	GenerationFailed { message: String },
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error(transparent)]
	Index(recall_index::Error),
}
impl Error {
	/// Whether the caller may resubmit the same request later and expect it to succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::ProviderUnavailable { .. } | Self::QueueSaturated { .. })
	}
}
impl From<recall_index::Error> for Error {
	fn from(err: recall_index::Error) -> Self {
		match err {
			recall_index::Error::DimensionMismatch { expected, actual } =>
				Self::DimensionMismatch { expected, actual },
			other => Self::Index(other),
		}
	}
}
impl From<recall_providers::Error> for Error {
	fn from(err: recall_providers::Error) -> Self {
		Self::ProviderUnavailable { message: err.to_string() }
	}
}
impl From<color_eyre::Report> for Error {
	fn from(err: color_eyre::Report) -> Self {
		Self::ProviderUnavailable { message: err.to_string() }
	}
}
