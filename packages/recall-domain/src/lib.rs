pub mod record;
pub mod status;
pub mod text;

pub use record::{
	COMBINED_FIELD, FieldKey, Record, RecordField, RecordId, RecordKind, RecordRejectReason,
};
pub use status::EmbeddingStatus;
