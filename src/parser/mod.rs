//! Best-effort decoding of model output that is supposed to hold one JSON
//! object.
//!
//! Tiers are tried in order and the first one that yields something wins:
//! strict decode of the first object in the text, strict decode after
//! [`repair`] passes, then [`lenient`] recovery of known string fields.
//! Callers can tell trusted output from partial output through
//! [`ParsedRecord::tier`] and [`ParsedRecord::incomplete`].

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub mod lenient;
pub mod repair;

/// Top-level string keys that lenient recovery looks for by default.
pub const DEFAULT_LENIENT_KEYS: &[&str] = &["answer", "explanation", "short_answer", "verdict", "notes", "question_type"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("no JSON object found in model output")]
  NoObject,

  #[error("unrecoverable model output: {reason}")]
  Unrecoverable { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
  Strict,
  Repaired,
  Lenient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
  pub fields: Map<String, Value>,
  pub tier: ParseTier,
  /// Keys whose values were cut off by the end of the input.
  pub incomplete: Vec<String>,
}

impl ParsedRecord {
  pub fn is_trusted(&self) -> bool {
    self.tier != ParseTier::Lenient && self.incomplete.is_empty()
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.fields.get(key).and_then(Value::as_str)
  }

  pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(self.fields))
  }
}

#[derive(Debug, Clone)]
pub struct ResilientParser {
  lenient_keys: Vec<String>,
}

impl Default for ResilientParser {
  fn default() -> Self {
    Self::with_keys(DEFAULT_LENIENT_KEYS.iter().copied())
  }
}

impl ResilientParser {
  pub fn with_keys<I, S>(keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      lenient_keys: keys.into_iter().map(Into::into).collect(),
    }
  }

  pub fn parse(&self, text: &str) -> Result<ParsedRecord, ParseError> {
    let start = text.find('{').ok_or(ParseError::NoObject)?;
    let candidate = &text[start..];

    let strict_err = match decode_first_object(candidate) {
      Ok(fields) => return Ok(record(fields, ParseTier::Strict)),
      Err(e) => e,
    };

    let literals = repair::repair_literals(candidate);
    let balanced = repair::balance_brackets(&literals);
    match decode_first_object(&balanced) {
      Ok(fields) => {
        debug!(error = %strict_err, "model output decoded after repair");
        return Ok(record(fields, ParseTier::Repaired));
      }
      Err(e) => debug!(error = %e, "repaired model output still invalid"),
    }

    let recovered = lenient::recover_fields(&literals, &self.lenient_keys);
    if recovered.fields.is_empty() {
      return Err(ParseError::Unrecoverable { reason: strict_err });
    }
    warn!(
      fields = recovered.fields.len(),
      incomplete = ?recovered.incomplete,
      "model output recovered leniently"
    );
    Ok(ParsedRecord {
      fields: recovered.fields,
      tier: ParseTier::Lenient,
      incomplete: recovered.incomplete,
    })
  }
}

/// Parses with the default key allow-list.
pub fn parse_structured(text: &str) -> Result<ParsedRecord, ParseError> {
  ResilientParser::default().parse(text)
}

fn record(fields: Map<String, Value>, tier: ParseTier) -> ParsedRecord {
  ParsedRecord {
    fields,
    tier,
    incomplete: Vec::new(),
  }
}

/// Decodes the object at the start of `text`, ignoring anything after it.
fn decode_first_object(text: &str) -> Result<Map<String, Value>, String> {
  let mut values = serde_json::Deserializer::from_str(text).into_iter::<Value>();
  match values.next() {
    Some(Ok(Value::Object(fields))) => Ok(fields),
    Some(Ok(other)) => Err(format!("expected an object, found {other}")),
    Some(Err(e)) => Err(e.to_string()),
    None => Err("empty input".into()),
  }
}
