//! Lenient JSON parsing for LLM-generated tool-call arguments.
//!
//! Models occasionally emit near-valid JSON: a trailing comma before a
//! closing brace, or a stray unescaped quote inside a string value. Rather
//! than letting a malformed argument blob abort the tool loop, we try a
//! forgiving repair pass first, fall back to strict parsing, and finally
//! give up with an empty object — the tool then reports its own missing-
//! argument error instead of the loop crashing.

use std::collections::HashMap;

use serde_json::Value;

/// Parse a tool call's raw argument string into a parameter map.
///
/// Order: repaired parse, then strict parse, then an empty map.
pub fn parse_tool_args(raw: &str) -> HashMap<String, Value> {
    if let Ok(v) = serde_json::from_str::<HashMap<String, Value>>(&repair(raw)) {
        return v;
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// Apply common LLM JSON mistakes fixes: trailing commas before `}`/`]`,
/// and unescaped double quotes inside an otherwise well-formed string value.
fn repair(raw: &str) -> String {
    strip_trailing_commas(&fix_unescaped_quotes(raw))
}

/// Remove commas that directly precede a closing brace/bracket (ignoring
/// whitespace), which `serde_json` otherwise rejects outright.
fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;
    let chars: Vec<char> = input.chars().collect();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == ',' {
            // Look ahead past whitespace for a closing brace/bracket.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Escape stray `"` characters that appear inside a string value without
/// being the value's closing quote — detected heuristically by checking
/// whether the next non-whitespace character after the quote is one that
/// would legally follow a string (`,`, `}`, `]`, `:`).
fn fix_unescaped_quotes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if !in_string {
            out.push(c);
            if c == '"' {
                in_string = true;
            }
            i += 1;
            continue;
        }

        if escape {
            out.push(c);
            escape = false;
            i += 1;
            continue;
        }

        if c == '\\' {
            out.push(c);
            escape = true;
            i += 1;
            continue;
        }

        if c == '"' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let closes = j >= chars.len() || matches!(chars[j], ',' | '}' | ']' | ':');
            if closes {
                out.push(c);
                in_string = false;
            } else {
                out.push('\\');
                out.push(c);
            }
            i += 1;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}
