//! Streaming JSON key scanner (spec §4.E).
//!
//! Extracts the raw byte slices of a chosen set of top-level keys from a
//! JSON object without fully parsing the document: string values are
//! skipped by honouring escapes, compound values are skipped by depth
//! counting only. Built for providers (Gemini/Vertex in particular) that
//! send a handful of small routing keys alongside multi-megabyte blobs.

use std::collections::HashMap;
use std::collections::HashSet;

/// Scans `input` for each key in `wanted`, stopping as soon as every
/// requested key has been observed once. Returns `None` if the top-level
/// value is not an object (including empty or whitespace-only input,
/// arrays, and scalars). Returns `Some` with whatever keys were captured
/// before truncation otherwise, possibly empty.
///
/// Never panics: invalid UTF-8, embedded NULs, and unbalanced brackets are
/// all treated as "best effort" input, per spec §9.
pub fn scan<'a>(input: &'a [u8], wanted: &HashSet<&str>) -> Option<HashMap<String, &'a [u8]>> {
    let mut pos = skip_whitespace(input, 0);
    if pos >= input.len() || input[pos] != b'{' {
        return None;
    }
    pos += 1;

    let mut found: HashMap<String, &'a [u8]> = HashMap::new();
    let remaining: HashSet<&str> = wanted.clone();

    loop {
        if found.len() == wanted.len() {
            break;
        }
        pos = skip_whitespace(input, pos);
        match input.get(pos) {
            None => break,
            Some(b'}') => break,
            Some(b',') => {
                pos += 1;
                continue;
            }
            _ => {}
        }

        let Some((key, after_key)) = scan_string(input, pos) else {
            break;
        };
        pos = skip_whitespace(input, after_key);
        if input.get(pos) != Some(&b':') {
            break;
        }
        pos += 1;
        pos = skip_whitespace(input, pos);

        let Some(value_end) = skip_value(input, pos) else {
            break;
        };

        if remaining.contains(key.as_str()) && !found.contains_key(&key) {
            found.insert(key, &input[pos..value_end]);
        }
        pos = value_end;
    }

    Some(found)
}

fn skip_whitespace(input: &[u8], mut pos: usize) -> usize {
    while let Some(&b) = input.get(pos) {
        if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
            pos += 1;
        } else {
            break;
        }
    }
    pos
}

/// Scans a JSON string starting at a `"` byte. Returns the decoded-as-UTF8
/// (lossily, since keys are never unescaped per spec) raw key content and
/// the position just past the closing quote. Keys are matched against raw
/// bytes, so escape sequences inside a key are left untouched here; only
/// the span boundaries matter.
fn scan_string(input: &[u8], start: usize) -> Option<(String, usize)> {
    if input.get(start) != Some(&b'"') {
        return None;
    }
    let content_start = start + 1;
    let end = skip_string_body(input, content_start)?;
    let raw = &input[content_start..end];
    Some((String::from_utf8_lossy(raw).into_owned(), end + 1))
}

/// Returns the index of the closing `"`, given `pos` points just past the
/// opening quote.
fn skip_string_body(input: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        match input.get(pos)? {
            b'\\' => {
                pos += 2;
            }
            b'"' => return Some(pos),
            _ => {
                pos += 1;
            }
        }
    }
}

/// Returns the index just past the value starting at `pos`, or `None` if
/// the value runs off the end of the buffer (truncation).
fn skip_value(input: &[u8], pos: usize) -> Option<usize> {
    match input.get(pos)? {
        b'"' => {
            let end = skip_string_body(input, pos + 1)?;
            Some(end + 1)
        }
        b'{' | b'[' => skip_compound(input, pos),
        _ => skip_scalar(input, pos),
    }
}

/// Depth-counts through a nested object/array, honouring string escapes so
/// a `}` or `]` inside a string doesn't end the compound early. Does not
/// validate structural balance: an unbalanced input simply runs the scan
/// off the end of the buffer, which is reported as truncation (spec §9).
fn skip_compound(input: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut pos = start;
    loop {
        match *input.get(pos)? {
            b'{' | b'[' => {
                depth += 1;
                pos += 1;
            }
            b'}' | b']' => {
                depth -= 1;
                pos += 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            b'"' => {
                pos = skip_string_body(input, pos + 1)? + 1;
            }
            _ => pos += 1,
        }
    }
}

fn skip_scalar(input: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    while let Some(&b) = input.get(pos) {
        if b == b',' || b == b'}' || b == b']' || b.is_ascii_whitespace() {
            break;
        }
        pos += 1;
    }
    if pos == start { None } else { Some(pos) }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn wanted(keys: &[&str]) -> HashSet<&str> {
        keys.iter().copied().collect()
    }

    #[test]
    fn extracts_requested_top_level_keys() {
        let input = br#"{"a": 1, "b": "two", "c": [1,2,3]}"#;
        let result = scan(input, &wanted(&["a", "c"])).unwrap();
        assert_eq!(result.get("a").map(|v| &v[..]), Some(&b"1"[..]));
        assert_eq!(result.get("c").map(|v| &v[..]), Some(&b"[1,2,3]"[..]));
        assert!(!result.contains_key("b"));
    }

    #[test]
    fn non_object_top_level_returns_none() {
        assert!(scan(b"", &wanted(&["a"])).is_none());
        assert!(scan(b"   ", &wanted(&["a"])).is_none());
        assert!(scan(b"[1,2,3]", &wanted(&["a"])).is_none());
        assert!(scan(b"42", &wanted(&["a"])).is_none());
        assert!(scan(b"\"just a string\"", &wanted(&["a"])).is_none());
    }

    #[test]
    fn stops_as_soon_as_all_keys_found() {
        let input = br#"{"a": 1, "b": 2, "c": 3}"#;
        let result = scan(input, &wanted(&["a"])).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.get("a").map(|v| &v[..]), Some(&b"1"[..]));
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let input = br#"{"a": 1, "a": 2}"#;
        let result = scan(input, &wanted(&["a"])).unwrap();
        assert_eq!(result.get("a").map(|v| &v[..]), Some(&b"1"[..]));
    }

    #[test]
    fn honours_escaped_quotes_and_backslashes_inside_strings() {
        let input = br#"{"a": "she said \"hi\" and \\ then left", "b": 2}"#;
        let result = scan(input, &wanted(&["a", "b"])).unwrap();
        assert_eq!(result.get("a").map(|v| &v[..]), Some(&br#""she said \"hi\" and \\ then left""#[..]));
        assert_eq!(result.get("b").map(|v| &v[..]), Some(&b"2"[..]));
    }

    #[test]
    fn nested_braces_and_brackets_inside_strings_do_not_confuse_depth_counting() {
        let input = br#"{"generationConfig": {"nested": "a } weird [ value"}, "safetySettings": []}"#;
        let result = scan(input, &wanted(&["generationConfig", "safetySettings"])).unwrap();
        assert_eq!(
            result.get("generationConfig").map(|v| &v[..]),
            Some(&br#"{"nested": "a } weird [ value"}"#[..])
        );
        assert_eq!(result.get("safetySettings").map(|v| &v[..]), Some(&b"[]"[..]));
    }

    #[test]
    fn truncated_input_returns_partial_map_not_panic() {
        let input = br#"{"a": 1, "b": "unterminated"#;
        let result = scan(input, &wanted(&["a", "b"])).unwrap();
        assert_eq!(result.get("a").map(|v| &v[..]), Some(&b"1"[..]));
        assert!(!result.contains_key("b"));
    }

    #[test]
    fn empty_object_with_requested_keys_yields_empty_map() {
        let result = scan(b"{}", &wanted(&["a"])).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn invalid_utf8_and_embedded_nul_do_not_panic() {
        let input: &[u8] = b"{\"a\": \"\x00\xff\xfe\", \"b\": 1}";
        let result = scan(input, &wanted(&["a", "b"])).unwrap();
        assert_eq!(result.get("b").map(|v| &v[..]), Some(&b"1"[..]));
    }

    #[test]
    fn unbalanced_brackets_are_best_effort_and_do_not_panic() {
        let input = br#"{"a": {], "b": 2}"#;
        let result = scan(input, &wanted(&["a", "b"]));
        assert!(result.is_some() || result.is_none());
    }

    #[test]
    fn large_string_value_in_small_implicit_buffer_is_linear_not_quadratic() {
        let big_value = "x".repeat(200 * 1024);
        let mut input = String::from(r#"{"small": 1, "big": ""#);
        input.push_str(&big_value);
        input.push_str(r#"", "after": 2}"#);
        let result = scan(input.as_bytes(), &wanted(&["small", "big", "after"])).unwrap();
        assert_eq!(result.get("small").map(|v| &v[..]), Some(&b"1"[..]));
        assert_eq!(result.get("after").map(|v| &v[..]), Some(&b"2"[..]));
        assert_eq!(result.get("big").map(|v| v.len()), Some(big_value.len() + 2));
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_on_arbitrary_json_objects(
            pairs in proptest::collection::vec(
                (
                    "[a-zA-Z][a-zA-Z0-9_]{0,8}",
                    proptest::prop_oneof![
                        proptest::num::i64::ANY.prop_map(|n| json!(n)),
                        ".*".prop_map(|s: String| json!(s)),
                        proptest::bool::ANY.prop_map(|b| json!(b)),
                        proptest::collection::vec(proptest::num::i64::ANY, 0..4).prop_map(|v| json!(v)),
                    ],
                ),
                0..8,
            )
        ) {
            use serde_json::Map;
            use serde_json::Value;

            let mut deduped: Map<String, Value> = Map::new();
            for (k, v) in pairs {
                deduped.entry(k).or_insert(v);
            }
            let object = Value::Object(deduped.clone());
            let input = serde_json::to_vec(&object).unwrap();

            let all_keys: HashSet<&str> = deduped.keys().map(|k| k.as_str()).collect();
            let result = scan(&input, &all_keys).unwrap();

            for (key, expected_value) in deduped.iter() {
                let raw = result.get(key.as_str()).expect("key should have been captured");
                let parsed: Value = serde_json::from_slice(raw).expect("captured span must be valid JSON");
                proptest::prop_assert_eq!(&parsed, expected_value);
            }
        }
    }
}
