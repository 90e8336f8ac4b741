use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use crate::error::ApplyError;

/// One step of a path into a document tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    fn as_key(&self) -> String {
        match self {
            PathSegment::Index(index) => index.to_string(),
            PathSegment::Key(key) => key.clone(),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{}", index),
            PathSegment::Key(key) => f.write_str(key),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Ordered path into a document tree
pub type Path = Vec<PathSegment>;

/// Build a [`Path`] from anything convertible into segments.
///
/// ```
/// use otsync::protocol::operation::{path, PathSegment};
/// assert_eq!(path(["fields", "status"]), vec![PathSegment::from("fields"), PathSegment::from("status")]);
/// ```
pub fn path<I, S>(segments: I) -> Path
where
    I: IntoIterator<Item = S>,
    S: Into<PathSegment>,
{
    segments.into_iter().map(Into::into).collect()
}

/// Render a path as a dotted key, e.g. `fields.status`
pub fn dotted(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// True when `ancestor` is a strict prefix of `path`
pub fn is_ancestor(ancestor: &[PathSegment], path: &[PathSegment]) -> bool {
    path.len() > ancestor.len() && path.starts_with(ancestor)
}

/// True when either path is a prefix of the other (including equality)
pub fn overlaps(a: &[PathSegment], b: &[PathSegment]) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// A single mutation against a path in a document tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    /// Create a value at `path`; fails if the slot is occupied.
    Insert { path: Path, value: JsonValue },
    /// Remove the value at `path`. `old_value` feeds transforms and undo.
    Delete {
        path: Path,
        #[serde(default)]
        old_value: JsonValue,
    },
    /// Overwrite an existing value
    Replace {
        path: Path,
        value: JsonValue,
        #[serde(default)]
        old_value: JsonValue,
    },
    /// Relocate a subtree
    Move { from: Path, to: Path },
}

impl Operation {
    pub fn insert(path: Path, value: JsonValue) -> Self {
        Operation::Insert { path, value }
    }

    pub fn delete(path: Path, old_value: JsonValue) -> Self {
        Operation::Delete { path, old_value }
    }

    pub fn replace(path: Path, value: JsonValue, old_value: JsonValue) -> Self {
        Operation::Replace {
            path,
            value,
            old_value,
        }
    }

    pub fn move_to(from: Path, to: Path) -> Self {
        Operation::Move { from, to }
    }

    /// The path this operation writes to (`to` for moves)
    pub fn path(&self) -> &Path {
        match self {
            Operation::Insert { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Replace { path, .. } => path,
            Operation::Move { to, .. } => to,
        }
    }

    /// The operation that undoes this one
    pub fn inverse(&self) -> Operation {
        match self.clone() {
            Operation::Insert { path, value } => Operation::Delete {
                path,
                old_value: value,
            },
            Operation::Delete { path, old_value } => Operation::Insert {
                path,
                value: old_value,
            },
            Operation::Replace {
                path,
                value,
                old_value,
            } => Operation::Replace {
                path,
                value: old_value,
                old_value: value,
            },
            Operation::Move { from, to } => Operation::Move { from: to, to: from },
        }
    }

    /// Apply this operation to `doc` in place.
    ///
    /// Returns the flattened changes it produced as `(dotted path, new value)`
    /// pairs; removals report `null`. On error `doc` is left unchanged.
    pub fn apply_to(&self, doc: &mut JsonValue) -> Result<Vec<(String, JsonValue)>, ApplyError> {
        match self {
            Operation::Insert { path, value } => {
                check_insert(doc, path)?;
                insert_at(doc, path, value.clone())?;
                Ok(vec![(dotted(path), value.clone())])
            }
            Operation::Delete { path, .. } => {
                remove_at(doc, path)?;
                Ok(vec![(dotted(path), JsonValue::Null)])
            }
            Operation::Replace { path, value, .. } => {
                let slot = get_mut_at(doc, path).ok_or_else(|| ApplyError::NotFound {
                    path: dotted(path),
                })?;
                *slot = value.clone();
                Ok(vec![(dotted(path), value.clone())])
            }
            Operation::Move { from, to } => {
                if is_ancestor(from, to) {
                    return Err(ApplyError::InvalidTarget { path: dotted(to) });
                }
                // removing `from` can shift or drop the destination's parent
                let mut moved_doc = doc.clone();
                let moved = remove_at(&mut moved_doc, from)?;
                insert_at(&mut moved_doc, to, moved.clone())?;
                *doc = moved_doc;
                Ok(vec![(dotted(from), JsonValue::Null), (dotted(to), moved)])
            }
        }
    }
}

/// Read the value at `path`
pub fn get_at<'a>(doc: &'a JsonValue, path: &[PathSegment]) -> Option<&'a JsonValue> {
    let mut current = doc;
    for segment in path {
        current = match (current, segment) {
            (JsonValue::Object(map), segment) => map.get(&segment.as_key())?,
            (JsonValue::Array(items), PathSegment::Index(index)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

fn get_mut_at<'a>(doc: &'a mut JsonValue, path: &[PathSegment]) -> Option<&'a mut JsonValue> {
    let mut current = doc;
    for segment in path {
        current = match (current, segment) {
            (JsonValue::Object(map), segment) => map.get_mut(&segment.as_key())?,
            (JsonValue::Array(items), PathSegment::Index(index)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Walk to `path`, creating empty objects for missing object keys.
fn container_at<'a>(
    doc: &'a mut JsonValue,
    path: &[PathSegment],
    full_path: &[PathSegment],
) -> Result<&'a mut JsonValue, ApplyError> {
    let mut current = doc;
    for segment in path {
        if current.is_null() {
            *current = JsonValue::Object(Map::new());
        }
        current = match (current, segment) {
            (JsonValue::Object(map), segment) => map
                .entry(segment.as_key())
                .or_insert(JsonValue::Null),
            (JsonValue::Array(items), PathSegment::Index(index)) => {
                items.get_mut(*index).ok_or_else(|| ApplyError::NotFound {
                    path: dotted(full_path),
                })?
            }
            (JsonValue::Array(_), PathSegment::Key(_)) => {
                return Err(ApplyError::InvalidIndex {
                    path: dotted(full_path),
                })
            }
            _ => {
                return Err(ApplyError::InvalidTarget {
                    path: dotted(full_path),
                })
            }
        };
    }
    if current.is_null() {
        *current = JsonValue::Object(Map::new());
    }
    Ok(current)
}

/// Fail the way `insert_at` would, without creating anything
fn check_insert(doc: &JsonValue, path: &[PathSegment]) -> Result<(), ApplyError> {
    let mut current = doc;
    for (depth, segment) in path.iter().enumerate() {
        let last = depth + 1 == path.len();
        current = match (current, segment) {
            // missing parents are created as objects
            (JsonValue::Null, _) => return Ok(()),
            (JsonValue::Object(map), segment) => match map.get(&segment.as_key()) {
                Some(_) if last => return Err(ApplyError::Occupied { path: dotted(path) }),
                Some(child) => child,
                None => return Ok(()),
            },
            (JsonValue::Array(items), PathSegment::Index(index)) if last => {
                if *index <= items.len() {
                    return Ok(());
                }
                return Err(ApplyError::InvalidIndex { path: dotted(path) });
            }
            (JsonValue::Array(items), PathSegment::Index(index)) => {
                items.get(*index).ok_or_else(|| ApplyError::NotFound { path: dotted(path) })?
            }
            (JsonValue::Array(_), PathSegment::Key(_)) => {
                return Err(ApplyError::InvalidIndex { path: dotted(path) })
            }
            _ => return Err(ApplyError::InvalidTarget { path: dotted(path) }),
        };
    }

    if current.is_null() {
        Ok(())
    } else {
        Err(ApplyError::Occupied {
            path: String::new(),
        })
    }
}

fn insert_at(doc: &mut JsonValue, path: &[PathSegment], value: JsonValue) -> Result<(), ApplyError> {
    let Some((last, parent_path)) = path.split_last() else {
        if !doc.is_null() {
            return Err(ApplyError::Occupied {
                path: String::new(),
            });
        }
        *doc = value;
        return Ok(());
    };

    match container_at(doc, parent_path, path)? {
        JsonValue::Object(map) => {
            let key = last.as_key();
            if map.contains_key(&key) {
                return Err(ApplyError::Occupied { path: dotted(path) });
            }
            map.insert(key, value);
            Ok(())
        }
        JsonValue::Array(items) => match last {
            PathSegment::Index(index) if *index <= items.len() => {
                items.insert(*index, value);
                Ok(())
            }
            _ => Err(ApplyError::InvalidIndex { path: dotted(path) }),
        },
        _ => Err(ApplyError::InvalidTarget { path: dotted(path) }),
    }
}

fn remove_at(doc: &mut JsonValue, path: &[PathSegment]) -> Result<JsonValue, ApplyError> {
    let Some((last, parent_path)) = path.split_last() else {
        return Ok(std::mem::take(doc));
    };

    let not_found = || ApplyError::NotFound { path: dotted(path) };
    match get_mut_at(doc, parent_path).ok_or_else(not_found)? {
        JsonValue::Object(map) => map.remove(&last.as_key()).ok_or_else(not_found),
        JsonValue::Array(items) => match last {
            PathSegment::Index(index) if *index < items.len() => Ok(items.remove(*index)),
            PathSegment::Index(_) => Err(not_found()),
            PathSegment::Key(_) => Err(ApplyError::InvalidIndex { path: dotted(path) }),
        },
        _ => Err(ApplyError::InvalidTarget { path: dotted(path) }),
    }
}
