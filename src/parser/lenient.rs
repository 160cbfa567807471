use serde_json::{Map, Value};

/// A string literal read from the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
  pub value: String,
  /// Index just past the literal (past the closing quote when there is one).
  pub end: usize,
  /// False when the input ended before the closing quote.
  pub closed: bool,
}

fn hex4(chars: &[char], at: usize) -> Option<u32> {
  let digits: String = chars.get(at..at + 4)?.iter().collect();
  if digits.chars().all(|c| c.is_ascii_hexdigit()) {
    u32::from_str_radix(&digits, 16).ok()
  } else {
    None
  }
}

/// Reads the string literal whose opening quote is at `chars[start]`,
/// decoding escapes as it goes. Stops at the matching quote or at the end
/// of the input, whichever comes first.
pub fn scan_literal(chars: &[char], start: usize) -> Literal {
  let mut value = String::new();
  let mut i = start + 1;

  while i < chars.len() {
    match chars[i] {
      '"' => {
        return Literal { value, end: i + 1, closed: true };
      }
      '\\' => {
        let Some(&esc) = chars.get(i + 1) else {
          break;
        };
        i += 2;
        match esc {
          'n' => value.push('\n'),
          'r' => value.push('\r'),
          't' => value.push('\t'),
          'b' => value.push('\u{8}'),
          'f' => value.push('\u{c}'),
          'u' => match hex4(chars, i) {
            Some(high @ 0xD800..=0xDBFF) => {
              let low = (chars.get(i + 4) == Some(&'\\') && chars.get(i + 5) == Some(&'u'))
                .then(|| hex4(chars, i + 6))
                .flatten()
                .filter(|low| (0xDC00..=0xDFFF).contains(low));
              match low {
                Some(low) => {
                  let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                  value.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                  i += 10;
                }
                None => {
                  value.push(char::REPLACEMENT_CHARACTER);
                  i += 4;
                }
              }
            }
            Some(code) => {
              value.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
              i += 4;
            }
            None => value.push_str("\\u"),
          },
          other => value.push(other),
        }
      }
      ch => {
        value.push(ch);
        i += 1;
      }
    }
  }

  Literal { value, end: chars.len(), closed: false }
}

fn skip_whitespace(chars: &[char], mut at: usize) -> usize {
  while chars.get(at).is_some_and(|c| c.is_whitespace()) {
    at += 1;
  }
  at
}

/// String fields recovered from a document that would not decode.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recovered {
  pub fields: Map<String, Value>,
  pub incomplete: Vec<String>,
}

/// Scans the top level of the object starting at the first `{` for `"key":
/// "value"` pairs whose key is in `keys`. The first occurrence of a key wins.
pub fn recover_fields(text: &str, keys: &[String]) -> Recovered {
  let mut recovered = Recovered::default();
  let chars: Vec<char> = text.chars().collect();
  let Some(mut i) = chars.iter().position(|&c| c == '{') else {
    return recovered;
  };
  let mut depth = 0usize;

  while i < chars.len() {
    match chars[i] {
      '{' | '[' => {
        depth += 1;
        i += 1;
      }
      '}' | ']' => {
        depth = depth.saturating_sub(1);
        i += 1;
      }
      '"' => {
        let key = scan_literal(&chars, i);
        i = key.end;
        if depth != 1 || !key.closed {
          continue;
        }
        let colon = skip_whitespace(&chars, i);
        if chars.get(colon) != Some(&':') {
          continue;
        }
        let start = skip_whitespace(&chars, colon + 1);
        if chars.get(start) != Some(&'"') {
          i = start;
          continue;
        }
        let value = scan_literal(&chars, start);
        i = value.end;
        if keys.contains(&key.value) && !recovered.fields.contains_key(&key.value) {
          if !value.closed {
            recovered.incomplete.push(key.value.clone());
          }
          recovered.fields.insert(key.value, Value::String(value.value));
        }
      }
      _ => i += 1,
    }
  }
  recovered
}

#[cfg(test)]
mod tests {
  use super::*;

  fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  fn scan(text: &str) -> Literal {
    let chars: Vec<char> = text.chars().collect();
    scan_literal(&chars, 0)
  }

  #[test]
  fn literal_decodes_escapes() {
    let lit = scan(r#""a\"b\\c\né😀" tail"#);
    assert_eq!(lit.value, "a\"b\\c\né😀");
    assert!(lit.closed);
    assert_eq!(lit.end, 13);
  }

  #[test]
  fn literal_reports_truncation() {
    let lit = scan(r#""half a sent"#);
    assert_eq!(lit.value, "half a sent");
    assert!(!lit.closed);

    let lit = scan(r#""dangling \"#);
    assert_eq!(lit.value, "dangling ");
    assert!(!lit.closed);
  }

  #[test]
  fn only_top_level_allowed_keys_are_recovered() {
    let text = r#"{"meta":{"answer":"nested"},"answer":"42","other":"skip","notes":"trunc"#;
    let recovered = recover_fields(text, &keys(&["answer", "notes"]));
    assert_eq!(recovered.fields.get("answer"), Some(&Value::String("42".into())));
    assert_eq!(recovered.fields.get("notes"), Some(&Value::String("trunc".into())));
    assert!(!recovered.fields.contains_key("other"));
    assert_eq!(recovered.incomplete, vec!["notes".to_string()]);
  }

  #[test]
  fn non_string_values_are_skipped() {
    let text = r#"{"answer": [1, "x"], "verdict": "ok", "answer": "late""#;
    let recovered = recover_fields(text, &keys(&["answer", "verdict"]));
    assert_eq!(recovered.fields.get("verdict"), Some(&Value::String("ok".into())));
    assert_eq!(recovered.fields.get("answer"), Some(&Value::String("late".into())));
    assert!(recovered.incomplete.is_empty());
  }

  #[test]
  fn nothing_found_without_an_object() {
    assert_eq!(recover_fields("answer: 42", &keys(&["answer"])), Recovered::default());
  }
}
