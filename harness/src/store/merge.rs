//! Deep-merge and dotted-path mutation over JSON records.

use serde_json::Value;

use super::StoreError;

/// Recursively merge `updates` into `base`. Object fields merge key by key;
/// scalars and arrays from `updates` replace the existing value. An explicit
/// `null` overwrites; absent keys are left untouched.
pub fn deep_merge(base: &mut Value, updates: Value) {
    match (base, updates) {
        (Value::Object(base_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, updates) => *base = updates,
    }
}

/// One segment of a dotted update path.
enum Segment<'a> {
    Key(&'a str),
    Index(i64),
}

fn parse_segment(part: &str) -> Segment<'_> {
    let is_index = part
        .strip_prefix('-')
        .unwrap_or(part)
        .chars()
        .all(|c| c.is_ascii_digit())
        && !part.is_empty()
        && part != "-";
    if is_index {
        Segment::Index(part.parse().unwrap_or(0))
    } else {
        Segment::Key(part)
    }
}

fn resolve_index(len: usize, index: i64, path: &str) -> Result<usize, StoreError> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    if resolved < 0 || resolved as usize >= len {
        return Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason: format!("index {index} out of range for list of length {len}"),
        });
    }
    Ok(resolved as usize)
}

/// Set `value` at the dot-separated `path` inside `target`. Missing
/// intermediate containers are created as objects, or as lists when the next
/// segment is numeric or `-N`. Indexing a list element that does not exist is
/// an error; in particular `-1` on an empty list never appends.
pub fn set_nested(target: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = target;

    for (i, part) in parts[..parts.len() - 1].iter().enumerate() {
        match parse_segment(part) {
            Segment::Index(index) => {
                let list = current.as_array_mut().ok_or_else(|| StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("cannot index non-list with '{part}'"),
                })?;
                let pos = resolve_index(list.len(), index, path)?;
                current = &mut list[pos];
            }
            Segment::Key(key) => {
                let map = current.as_object_mut().ok_or_else(|| StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("cannot descend into non-object at '{part}'"),
                })?;
                let next_is_index = matches!(parse_segment(parts[i + 1]), Segment::Index(_));
                current = map.entry(key.to_string()).or_insert_with(|| {
                    if next_is_index {
                        Value::Array(Vec::new())
                    } else {
                        Value::Object(serde_json::Map::new())
                    }
                });
            }
        }
    }

    match parse_segment(parts[parts.len() - 1]) {
        Segment::Index(index) => {
            let list = current.as_array_mut().ok_or_else(|| StoreError::InvalidPath {
                path: path.to_string(),
                reason: format!("cannot index non-list with '{index}'"),
            })?;
            let pos = resolve_index(list.len(), index, path)?;
            list[pos] = value;
        }
        Segment::Key(key) => {
            let map = current.as_object_mut().ok_or_else(|| StoreError::InvalidPath {
                path: path.to_string(),
                reason: "cannot set key on non-object".to_string(),
            })?;
            map.insert(key.to_string(), value);
        }
    }

    Ok(())
}
