pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Vector dimension {actual} does not match index dimension {expected}.")]
	DimensionMismatch { expected: usize, actual: usize },
	#[error("Invalid vector: {message}")]
	InvalidVector { message: String },
}
