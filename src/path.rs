//! RFC-6901-like path parsing and pointer read/write/delete against
//! [`serde_json::Value`].
//!
//! A concrete path is a sequence of [`Segment::Key`]/[`Segment::Index`]
//! segments; a *template* path may additionally contain [`Segment::Param`]
//! placeholders (`:name`), matched against a concrete path by [`crate::lens`].

use serde_json::Value;

use crate::error::PathError;

/// One component of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// Only valid in templates, never in a concrete path produced by `Diff`.
    Param(String),
}

/// A parsed path: an ordered list of segments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Path(pub Vec<Segment>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a concrete path: literal/index segments only, no `:param`
    /// placeholders. Numeric segments become [`Segment::Index`].
    pub fn parse(raw: &str) -> Result<Path, PathError> {
        let segments = parse_segments(raw)?;
        Ok(Path(segments))
    }

    /// Parses a template path: literal/index segments, plus `:name`
    /// placeholders recognized as [`Segment::Param`].
    pub fn parse_template(raw: &str) -> Result<Path, PathError> {
        Path::parse(raw)
    }

    pub fn join(&self, segment: Segment) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment);
        Path(segments)
    }

    pub fn to_string_repr(&self) -> String {
        let mut out = String::new();
        for seg in &self.0 {
            out.push('/');
            match seg {
                Segment::Key(s) => out.push_str(&escape(s)),
                Segment::Index(i) => out.push_str(&i.to_string()),
                Segment::Param(s) => {
                    out.push(':');
                    out.push_str(s);
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }
}

fn escape(raw: &str) -> String {
    raw.replace('~', "~0").replace('/', "~1")
}

fn unescape(raw: &str) -> String {
    raw.replace("~1", "/").replace("~0", "~")
}

fn parse_segments(raw: &str) -> Result<Vec<Segment>, PathError> {
    if raw.is_empty() || raw == "/" {
        return Ok(Vec::new());
    }
    if !raw.starts_with('/') {
        return Err(PathError::MissingLeadingSlash(raw.to_string()));
    }
    raw[1..]
        .split('/')
        .map(|token| {
            if let Some(name) = token.strip_prefix(':') {
                Ok(Segment::Param(name.to_string()))
            } else if let Ok(idx) = token.parse::<usize>() {
                if token == "0" || !token.starts_with('0') {
                    Ok(Segment::Index(idx))
                } else {
                    // leading-zero numeric strings (e.g. "01") are keys, not indices
                    Ok(Segment::Key(unescape(token)))
                }
            } else {
                Ok(Segment::Key(unescape(token)))
            }
        })
        .collect()
}

/// Read/write/delete operations against a concrete [`Path`].
pub struct Pointer;

impl Pointer {
    /// Returns the value at `path`, or `None` if any intermediate segment is
    /// absent on an object/array. Fails if a segment traverses through a
    /// scalar or an array with a non-index key.
    pub fn get<'a>(state: &'a Value, path: &Path) -> Result<Option<&'a Value>, PathError> {
        let mut cur = state;
        for seg in &path.0 {
            match (cur, seg) {
                (Value::Object(map), Segment::Key(k)) => match map.get(k) {
                    Some(v) => cur = v,
                    None => return Ok(None),
                },
                (Value::Array(arr), Segment::Index(i)) => match arr.get(*i) {
                    Some(v) => cur = v,
                    None => return Ok(None),
                },
                (Value::Object(_), Segment::Index(_)) => {
                    return Err(PathError::InvalidSegment(seg.raw_or_index()))
                }
                (Value::Array(_), Segment::Key(_)) => {
                    return Err(PathError::InvalidSegment(seg.raw_or_index()))
                }
                (Value::Null, _) => return Ok(None),
                (_, Segment::Param(_)) => {
                    return Err(PathError::InvalidSegment(
                        "cannot resolve a template placeholder against a value".into(),
                    ))
                }
                _ => return Err(PathError::InvalidSegment(seg.raw_or_index())),
            }
        }
        Ok(Some(cur))
    }

    /// Writes `value` at `path`, creating intermediate objects as needed.
    pub fn set(state: &mut Value, path: &Path, value: Value) -> Result<(), PathError> {
        if path.is_root() {
            *state = value;
            return Ok(());
        }
        let mut cur = state;
        let last = path.0.len() - 1;
        for seg in &path.0[..last] {
            cur = step_into_mut(cur, seg)?;
        }
        match (cur, &path.0[last]) {
            (Value::Object(map), Segment::Key(k)) => {
                map.insert(k.clone(), value);
            }
            (Value::Array(arr), Segment::Index(i)) => {
                if *i >= arr.len() {
                    arr.resize(*i + 1, Value::Null);
                }
                arr[*i] = value;
            }
            (slot @ Value::Null, Segment::Key(k)) => {
                let mut map = serde_json::Map::new();
                map.insert(k.clone(), value);
                *slot = Value::Object(map);
            }
            (slot @ Value::Null, Segment::Index(i)) => {
                let mut arr = vec![Value::Null; *i + 1];
                arr[*i] = value;
                *slot = Value::Array(arr);
            }
            (_, seg) => return Err(PathError::InvalidSegment(seg.raw_or_index())),
        }
        Ok(())
    }

    /// Removes the value at `path`, if present. No-op if absent.
    pub fn delete(state: &mut Value, path: &Path) -> Result<(), PathError> {
        if path.is_root() {
            *state = Value::Null;
            return Ok(());
        }
        let last = path.0.len() - 1;
        let mut cur = state;
        for seg in &path.0[..last] {
            match step_into_mut_opt(cur, seg)? {
                Some(next) => cur = next,
                None => return Ok(()),
            }
        }
        match (cur, &path.0[last]) {
            (Value::Object(map), Segment::Key(k)) => {
                map.remove(k);
            }
            (Value::Array(arr), Segment::Index(i)) => {
                if *i < arr.len() {
                    arr.remove(*i);
                }
            }
            (Value::Null, _) => {}
            (_, seg) => return Err(PathError::InvalidSegment(seg.raw_or_index())),
        }
        Ok(())
    }
}

impl Segment {
    fn raw_or_index(&self) -> String {
        match self {
            Segment::Key(s) => s.clone(),
            Segment::Param(s) => format!(":{s}"),
            Segment::Index(i) => i.to_string(),
        }
    }
}

fn step_into_mut<'a>(cur: &'a mut Value, seg: &Segment) -> Result<&'a mut Value, PathError> {
    match seg {
        Segment::Key(k) => {
            if cur.is_null() {
                *cur = Value::Object(serde_json::Map::new());
            }
            match cur {
                Value::Object(map) => Ok(map.entry(k.clone()).or_insert(Value::Null)),
                _ => Err(PathError::InvalidSegment(k.clone())),
            }
        }
        Segment::Index(i) => {
            if cur.is_null() {
                *cur = Value::Array(Vec::new());
            }
            match cur {
                Value::Array(arr) => {
                    if *i >= arr.len() {
                        arr.resize(*i + 1, Value::Null);
                    }
                    Ok(&mut arr[*i])
                }
                _ => Err(PathError::InvalidSegment(i.to_string())),
            }
        }
        Segment::Param(name) => Err(PathError::InvalidSegment(format!(":{name}"))),
    }
}

fn step_into_mut_opt<'a>(
    cur: &'a mut Value,
    seg: &Segment,
) -> Result<Option<&'a mut Value>, PathError> {
    match (cur, seg) {
        (Value::Object(map), Segment::Key(k)) => Ok(map.get_mut(k)),
        (Value::Array(arr), Segment::Index(i)) => Ok(arr.get_mut(*i)),
        (Value::Null, _) => Ok(None),
        (_, seg) => Err(PathError::InvalidSegment(seg.raw_or_index())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_root() {
        assert_eq!(Path::parse("/").unwrap(), Path::root());
        assert_eq!(Path::parse("").unwrap(), Path::root());
    }

    #[test]
    fn test_parse_literal_and_index() {
        let p = Path::parse("/counters/0/value").unwrap();
        assert_eq!(
            p.0,
            vec![
                Segment::Key("counters".into()),
                Segment::Index(0),
                Segment::Key("value".into()),
            ]
        );
    }

    #[test]
    fn test_parse_template_param() {
        let p = Path::parse_template("/counters/:name").unwrap();
        assert_eq!(
            p.0,
            vec![Segment::Key("counters".into()), Segment::Param("name".into())]
        );
    }

    #[test]
    fn test_missing_leading_slash() {
        assert!(matches!(
            Path::parse("counters/0"),
            Err(PathError::MissingLeadingSlash(_))
        ));
    }

    #[test]
    fn test_escape_roundtrip() {
        let p = Path::parse("/a~1b/c~0d").unwrap();
        assert_eq!(p.0, vec![Segment::Key("a/b".into()), Segment::Key("c~d".into())]);
        assert_eq!(p.to_string_repr(), "/a~1b/c~0d");
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut state = json!({"counters": {"a": 0}});
        let path = Path::parse("/counters/a").unwrap();
        Pointer::set(&mut state, &path, json!(5)).unwrap();
        assert_eq!(Pointer::get(&state, &path).unwrap(), Some(&json!(5)));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let state = json!({"counters": {}});
        let path = Path::parse("/counters/missing").unwrap();
        assert_eq!(Pointer::get(&state, &path).unwrap(), None);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut state = json!({});
        let path = Path::parse("/a/b/c").unwrap();
        Pointer::set(&mut state, &path, json!(1)).unwrap();
        assert_eq!(state, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_array_resizes() {
        let mut state = json!({"arr": []});
        let path = Path::parse("/arr/2").unwrap();
        Pointer::set(&mut state, &path, json!("x")).unwrap();
        assert_eq!(state, json!({"arr": [null, null, "x"]}));
    }

    #[test]
    fn test_delete_key() {
        let mut state = json!({"a": 1, "b": 2});
        Pointer::delete(&mut state, &Path::parse("/a").unwrap()).unwrap();
        assert_eq!(state, json!({"b": 2}));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let mut state = json!({"a": 1});
        Pointer::delete(&mut state, &Path::parse("/missing").unwrap()).unwrap();
        assert_eq!(state, json!({"a": 1}));
    }

    #[test]
    fn test_root_set_replaces_whole_state() {
        let mut state = json!({"a": 1});
        Pointer::set(&mut state, &Path::root(), json!(42)).unwrap();
        assert_eq!(state, json!(42));
    }

    #[test]
    fn test_invalid_segment_kind() {
        let state = json!({"a": [1, 2]});
        let path = Path::parse("/a/x").unwrap();
        assert!(Pointer::get(&state, &path).is_err());
    }

    #[test]
    fn test_leading_zero_numeric_key_is_literal() {
        let p = Path::parse("/01").unwrap();
        assert_eq!(p.0, vec![Segment::Key("01".into())]);
    }
}
