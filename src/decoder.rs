//! Unwrapping of the redirect tokens embedded in content and session pages.
//!
//! Upstream hides the next hop of the redirect chain behind a token made of
//! layered base64 and rot13. Every knob of that scheme lives in
//! [`decode_chain`], so a change upstream is a one-function edit.

use base64::{
  alphabet,
  engine::{
    general_purpose::{GeneralPurpose, GeneralPurposeConfig},
    DecodePaddingMode,
  },
  Engine,
};
use serde::de::DeserializeOwned;

use crate::error::DecodeError;

// Browsers' `atob` accepts tokens with or without padding.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
  &alphabet::STANDARD,
  GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const ROTATION: u8 = 13;

/// Decodes a token into its structured payload.
pub fn decode<T: DeserializeOwned>(token: &str) -> Result<T, DecodeError> {
  let json = decode_chain(token)?;
  let value: serde_json::Value = serde_json::from_str(&json)
    .map_err(|_| DecodeError::CorruptToken("json"))?;

  serde_json::from_value(value)
    .map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}

/// base64 → base64 → rot13 → base64, yielding the payload's JSON text.
pub fn decode_chain(token: &str) -> Result<String, DecodeError> {
  let token = token.trim();
  if token.is_empty() {
    return Err(DecodeError::EmptyToken);
  }

  let text = base64_text(token, "first base64")?;
  let text = base64_text(&text, "second base64")?;
  let text = rotate(&text, ROTATION);
  base64_text(&text, "third base64")
}

/// One base64 pass whose output must be text.
pub fn base64_text(
  input: &str,
  stage: &'static str,
) -> Result<String, DecodeError> {
  let cleaned: String =
    input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
  let bytes = LENIENT
    .decode(cleaned)
    .map_err(|_| DecodeError::CorruptToken(stage))?;

  String::from_utf8(bytes).map_err(|_| DecodeError::CorruptToken(stage))
}

pub fn encode_base64(input: &str) -> String {
  LENIENT.encode(input)
}

// Case preserving rotation; anything but ASCII letters passes through.
fn rotate(input: &str, by: u8) -> String {
  input
    .chars()
    .map(|c| match c {
      'a'..='z' => (((c as u8 - b'a' + by) % 26) + b'a') as char,
      'A'..='Z' => (((c as u8 - b'A' + by) % 26) + b'A') as char,
      _ => c,
    })
    .collect()
}

#[cfg(test)]
pub fn encode_chain(json: &str) -> String {
  // rot13 is its own inverse
  let text = encode_base64(json);
  let text = rotate(&text, 26 - ROTATION);
  encode_base64(&encode_base64(&text))
}
