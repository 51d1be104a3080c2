//! Small utility helpers used across modules.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Pull the last complete JSON object out of a model reply.
/// Reasoning models tend to think out loud before emitting the object we asked for.
pub fn extract_json_object(text: &str) -> Option<Value> {
  let text = text.trim();
  if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
    return Some(v);
  }

  let mut last = None;
  let mut i = 0;
  while let Some(pos) = text[i..].find('{') {
    let start = i + pos;
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    match stream.next() {
      Some(Ok(v @ Value::Object(_))) => {
        last = Some(v);
        i = start + stream.byte_offset();
      }
      _ => i = start + 1,
    }
  }
  last
}

/// Hex SHA-256 of an answer key, used for quick answer comparisons downstream.
pub fn answer_hash(answer: &str) -> String {
  hex::encode(Sha256::digest(answer.as_bytes()))
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) { cut -= 1; }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}
