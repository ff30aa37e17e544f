// Dot-delimited key-path access into a JSON state tree.
//
// Rules:
// - Paths are `.`-separated object keys, e.g. `viewport.window_level.center`
// - Reads return `None` when any segment is missing or non-object
// - Writes create missing intermediate objects along an object chain
// - Writes through a non-object segment (number, string, array) are ignored
// - Empty paths and paths with empty segments are ignored

use serde_json::{Map, Value};

/// Outcome of a path write.
#[derive(Debug, Clone, PartialEq)]
pub enum PathWrite {
    /// The value was set; `previous` is the replaced value, if any.
    Applied { previous: Option<Value> },
    /// The path was empty or traversed a non-object; nothing changed.
    Ignored,
}

impl PathWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Read the value at `path`, if every segment resolves.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = split(path)?;
    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Deep-set `value` at `path`, creating intermediate objects as needed.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> PathWrite {
    let Some(segments) = split(path) else {
        return PathWrite::Ignored;
    };
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return PathWrite::Ignored,
    };

    let mut current = root;
    for segment in parents {
        let Some(map) = current.as_object_mut() else {
            return PathWrite::Ignored;
        };
        current = map.entry((*segment).to_string()).or_insert_with(|| Value::Object(Map::new()));
    }

    match current.as_object_mut() {
        Some(map) => PathWrite::Applied { previous: map.insert((*last).to_string(), value) },
        None => PathWrite::Ignored,
    }
}

fn split(path: &str) -> Option<Vec<&str>> {
    if path.is_empty() {
        return None;
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}
