use std::{collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

/// Name of the synthetic field that concatenates every textual field of a record.
pub const COMBINED_FIELD: &str = "combined";

/// Opaque record identifier owned by the record source.
///
/// Numeric identifiers from upstream payloads are accepted and kept in their decimal form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);
impl RecordId {
	pub fn new(raw: impl Into<String>) -> Self {
		Self(raw.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
impl From<&str> for RecordId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}
impl From<String> for RecordId {
	fn from(value: String) -> Self {
		Self(value)
	}
}
impl From<u64> for RecordId {
	fn from(value: u64) -> Self {
		Self(value.to_string())
	}
}
impl<'de> Deserialize<'de> for RecordId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Text(String),
			Number(u64),
		}

		Ok(match Raw::deserialize(deserializer)? {
			Raw::Text(text) => Self(text),
			Raw::Number(number) => Self(number.to_string()),
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
	Note,
	Task,
}
impl RecordKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Note => "note",
			Self::Task => "task",
		}
	}
}
impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for RecordKind {
	type Err = String;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value.trim().to_ascii_lowercase().as_str() {
			"note" => Ok(Self::Note),
			"task" => Ok(Self::Task),
			other => Err(format!("Unknown record kind: {other}.")),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordField {
	pub name: String,
	pub text: String,
}

/// A unit of retrievable content as emitted by the record source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
	pub id: RecordId,
	pub kind: RecordKind,
	pub fields: Vec<RecordField>,
	pub content_version: u64,
}
impl Record {
	pub fn new(id: impl Into<RecordId>, kind: RecordKind, content_version: u64) -> Self {
		Self { id: id.into(), kind, fields: Vec::new(), content_version }
	}

	pub fn note(id: impl Into<RecordId>, title: &str, body: &str, content_version: u64) -> Self {
		Self::new(id, RecordKind::Note, content_version)
			.with_field("title", title)
			.with_field("body", body)
	}

	pub fn task(id: impl Into<RecordId>, description: &str, content_version: u64) -> Self {
		Self::new(id, RecordKind::Task, content_version).with_field("description", description)
	}

	pub fn with_field(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
		self.fields.push(RecordField { name: name.into(), text: text.into() });

		self
	}

	pub fn validate(&self) -> Result<(), RecordRejectReason> {
		if self.id.as_str().trim().is_empty() {
			return Err(RecordRejectReason::EmptyId);
		}

		let mut seen = HashSet::new();

		for field in &self.fields {
			let name = field.name.as_str();

			if name.trim().is_empty() {
				return Err(RecordRejectReason::EmptyFieldName);
			}
			// Field names key embeddings, keyword matches and filters verbatim.
			if name.trim() != name {
				return Err(RecordRejectReason::PaddedFieldName { name: name.to_string() });
			}
			if name == COMBINED_FIELD {
				return Err(RecordRejectReason::ReservedFieldName);
			}
			if !seen.insert(name) {
				return Err(RecordRejectReason::DuplicateField { name: name.to_string() });
			}
		}

		Ok(())
	}

	/// Returns the text of a named field, including the synthetic combined field.
	pub fn field_text(&self, name: &str) -> Option<String> {
		if name == COMBINED_FIELD {
			let combined = self.combined_text();

			return (!combined.is_empty()).then_some(combined);
		}

		self.fields
			.iter()
			.find(|field| field.name == name)
			.map(|field| field.text.trim().to_string())
	}

	/// Joins the non-empty fields in order, separated by a blank line.
	pub fn combined_text(&self) -> String {
		self.fields
			.iter()
			.map(|field| field.text.trim())
			.filter(|text| !text.is_empty())
			.collect::<Vec<_>>()
			.join("\n\n")
	}

	/// Every `(field, text)` pair that should carry an embedding.
	///
	/// Empty fields are skipped. The combined field is present whenever any field has text.
	pub fn embedding_inputs(&self) -> Vec<(String, String)> {
		let mut out = Vec::with_capacity(self.fields.len() + 1);

		for field in &self.fields {
			let text = field.text.trim();

			if text.is_empty() {
				continue;
			}

			out.push((field.name.clone(), text.to_string()));
		}

		if !out.is_empty() {
			out.push((COMBINED_FIELD.to_string(), self.combined_text()));
		}

		out
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordRejectReason {
	EmptyId,
	EmptyFieldName,
	ReservedFieldName,
	PaddedFieldName { name: String },
	DuplicateField { name: String },
}
impl fmt::Display for RecordRejectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::EmptyId => f.write_str("record id must be non-empty"),
			Self::EmptyFieldName => f.write_str("field names must be non-empty"),
			Self::ReservedFieldName => write!(f, "field name {COMBINED_FIELD:?} is reserved"),
			Self::PaddedFieldName { name } =>
				write!(f, "field name {name:?} has leading or trailing whitespace"),
			Self::DuplicateField { name } => write!(f, "field {name:?} appears more than once"),
		}
	}
}

/// Identity of one embedding: a record and one of its field names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FieldKey {
	pub record_id: RecordId,
	pub field: String,
}
impl FieldKey {
	pub fn new(record_id: RecordId, field: impl Into<String>) -> Self {
		Self { record_id, field: field.into() }
	}
}
impl fmt::Display for FieldKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.record_id, self.field)
	}
}
