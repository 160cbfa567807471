//! Text-level repairs for almost-JSON. Each pass is a small state machine
//! over the characters that tracks whether it is inside a string literal.

/// Literal-tracking state shared by the passes that only care about
/// structure outside strings.
#[derive(Debug, Default, Clone, Copy)]
struct StringState {
  in_string: bool,
  escaped: bool,
}

impl StringState {
  /// Feeds `ch` and reports whether it belongs to a string literal,
  /// quotes included.
  fn feed(&mut self, ch: char) -> bool {
    if self.in_string {
      if self.escaped {
        self.escaped = false;
      } else if ch == '\\' {
        self.escaped = true;
      } else if ch == '"' {
        self.in_string = false;
      }
      true
    } else if ch == '"' {
      self.in_string = true;
      true
    } else {
      false
    }
  }
}

fn is_json_whitespace(ch: char) -> bool {
  matches!(ch, ' ' | '\t' | '\n' | '\r')
}

/// LaTeX commands that start with `n`. `\n` followed by letters is usually a
/// real newline before a word, so only these are treated as markup.
const LATEX_N_COMMANDS: &[&str] = &[
  "nabla", "ne", "nearrow", "neg", "neq", "newline", "nexists", "ngeq", "ni", "nleq", "nmid", "not", "notin",
  "nparallel", "nsubseteq", "nu", "nwarrow",
];

fn word_at(chars: &[char], at: usize) -> String {
  chars[at..].iter().take_while(|c| c.is_ascii_alphabetic()).collect()
}

fn continues_identifier(chars: &[char], at: usize) -> bool {
  chars.get(at).is_some_and(|c| c.is_ascii_alphabetic())
}

/// Whether the backslash before `chars[at]` starts a genuine JSON escape.
fn is_valid_escape(chars: &[char], at: usize) -> bool {
  match chars[at] {
    '"' | '\\' | '/' => true,
    'u' => chars.len() >= at + 5 && chars[at + 1..at + 5].iter().all(|c| c.is_ascii_hexdigit()),
    'b' | 'f' | 'r' | 't' => !continues_identifier(chars, at + 1),
    'n' => !(continues_identifier(chars, at + 1) && LATEX_N_COMMANDS.contains(&word_at(chars, at).as_str())),
    _ => false,
  }
}

/// Doubles backslashes inside string literals that do not start a valid
/// escape, so markup such as `\frac` or `\(` survives as literal text.
pub fn escape_invalid_backslashes(src: &str) -> String {
  let chars: Vec<char> = src.chars().collect();
  let mut out = String::with_capacity(src.len() + 16);
  let mut in_string = false;
  let mut i = 0;

  while i < chars.len() {
    let ch = chars[i];
    if !in_string {
      in_string = ch == '"';
      out.push(ch);
      i += 1;
      continue;
    }
    match ch {
      '"' => {
        in_string = false;
        out.push(ch);
        i += 1;
      }
      '\\' if i + 1 < chars.len() && is_valid_escape(&chars, i + 1) => {
        out.push('\\');
        out.push(chars[i + 1]);
        i += 2;
      }
      '\\' => {
        out.push_str("\\\\");
        i += 1;
      }
      _ => {
        out.push(ch);
        i += 1;
      }
    }
  }
  out
}

/// Escapes raw control characters (newlines, tabs, ...) found inside strings.
pub fn escape_control_chars(src: &str) -> String {
  let mut out = String::with_capacity(src.len() + 16);
  let mut state = StringState::default();

  for ch in src.chars() {
    if state.in_string && (ch as u32) < 0x20 {
      state.escaped = false;
      match ch {
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        other => out.push_str(&format!("\\u{:04x}", other as u32)),
      }
      continue;
    }
    state.feed(ch);
    out.push(ch);
  }
  out
}

/// Outside strings: exotic whitespace (NBSP, BOM, ...) becomes a plain space
/// and other control characters are dropped.
pub fn normalize_whitespace(src: &str) -> String {
  let mut out = String::with_capacity(src.len());
  let mut state = StringState::default();

  for ch in src.chars() {
    if state.feed(ch) || is_json_whitespace(ch) {
      out.push(ch);
    } else if ch.is_whitespace() || ch == '\u{feff}' {
      out.push(' ');
    } else if !ch.is_control() {
      out.push(ch);
    }
  }
  out
}

/// Drops commas that directly precede a closing `}` or `]`.
pub fn remove_trailing_commas(src: &str) -> String {
  let chars: Vec<char> = src.chars().collect();
  let mut out = String::with_capacity(src.len());
  let mut state = StringState::default();

  for (i, &ch) in chars.iter().enumerate() {
    if !state.feed(ch) && ch == ',' {
      let next = chars[i + 1..].iter().find(|c| !is_json_whitespace(**c));
      if matches!(next, Some('}') | Some(']')) {
        continue;
      }
    }
    out.push(ch);
  }
  out
}

/// Appends the closers of every still-open `{` / `[`, innermost first.
/// Input that ends inside a string literal is returned unchanged; closing
/// it would hide the truncation from the caller.
pub fn balance_brackets(src: &str) -> String {
  let mut stack = Vec::new();
  let mut state = StringState::default();

  for ch in src.chars() {
    if state.feed(ch) {
      continue;
    }
    match ch {
      '{' => stack.push('}'),
      '[' => stack.push(']'),
      '}' | ']' if stack.last() == Some(&ch) => {
        stack.pop();
      }
      _ => {}
    }
  }

  if stack.is_empty() || state.in_string {
    return src.to_owned();
  }

  let mut out = src.trim_end().to_owned();
  if out.ends_with(',') {
    out.pop();
  }
  out.extend(stack.iter().rev());
  out
}

/// All passes, in order.
pub fn repair(src: &str) -> String {
  balance_brackets(&repair_literals(src))
}

/// Every pass except bracket balancing; lenient extraction works on this
/// so a truncated value is not polluted by appended closers.
pub fn repair_literals(src: &str) -> String {
  let text = escape_invalid_backslashes(src);
  let text = escape_control_chars(&text);
  let text = normalize_whitespace(&text);
  remove_trailing_commas(&text)
}
