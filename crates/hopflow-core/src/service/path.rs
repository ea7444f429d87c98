//! Dotted/bracketed field paths over JSON payloads.
//!
//! Supported forms: `name`, `address.city`, `items[0]`, `items[0].name`,
//! `order.items[0].variants[1].sku`, `matrix[1][2]`.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("field path is empty")]
    Empty,
    #[error("malformed field path '{0}'")]
    Malformed(String),
    #[error("'{0}' is not an object or array")]
    NotAContainer(String),
    #[error("index {index} out of bounds for '{segment}' (len {len})")]
    IndexOutOfBounds {
        segment: String,
        index: usize,
        len: usize,
    },
}

/// Read and mutate values inside a payload by field path.
pub trait PathResolver: Send + Sync {
    /// Value at `path`, or `None` when any segment is missing.
    fn get(&self, root: &Value, path: &str) -> Result<Option<Value>, PathError>;

    /// Write `value` at `path`, returning the value it replaced. Missing
    /// intermediate keys become empty objects. Array indices must exist.
    fn set(&self, root: &mut Value, path: &str, value: Value) -> Result<Option<Value>, PathError>;

    /// Remove the value at `path`, returning it.
    fn remove(&self, root: &mut Value, path: &str) -> Result<Option<Value>, PathError>;
}

/// Proper prefixes of `path` that name a container, shallowest first:
/// `a.b[0].c` yields `a`, `a.b`, `a.b[0]`.
pub fn ancestor_paths(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|&(i, c)| i > 0 && matches!(c, '.' | '['))
        .map(move |(i, _)| &path[..i])
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) => f.write_str(k),
            Segment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let malformed = || PathError::Malformed(path.to_string());

    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(i) => part.split_at(i),
            None => (part, ""),
        };
        if name.is_empty() {
            return Err(malformed());
        }
        segments.push(Segment::Key(name.to_string()));

        while !rest.is_empty() {
            let (index, tail) = rest
                .strip_prefix('[')
                .and_then(|r| r.split_once(']'))
                .ok_or_else(malformed)?;
            segments.push(Segment::Index(index.parse().map_err(|_| malformed())?));
            rest = tail;
        }
    }
    Ok(segments)
}

fn object_mut<'a>(value: &'a mut Value, segment: &Segment) -> Result<&'a mut Map<String, Value>, PathError> {
    value
        .as_object_mut()
        .ok_or_else(|| PathError::NotAContainer(segment.to_string()))
}

fn array_slot<'a>(value: &'a mut Value, index: usize, segment: &Segment) -> Result<&'a mut Value, PathError> {
    let items = value
        .as_array_mut()
        .ok_or_else(|| PathError::NotAContainer(segment.to_string()))?;
    let len = items.len();
    items.get_mut(index).ok_or(PathError::IndexOutOfBounds {
        segment: segment.to_string(),
        index,
        len,
    })
}

/// Default resolver. Key order of edited objects is preserved.
#[derive(Debug, Default, Clone, Copy)]
pub struct NestedPathResolver;

impl PathResolver for NestedPathResolver {
    fn get(&self, root: &Value, path: &str) -> Result<Option<Value>, PathError> {
        let mut current = root;
        for segment in parse(path)? {
            let next = match &segment {
                Segment::Key(k) => current.as_object().and_then(|m| m.get(k)),
                Segment::Index(i) => current.as_array().and_then(|a| a.get(*i)),
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }

    fn set(&self, root: &mut Value, path: &str, value: Value) -> Result<Option<Value>, PathError> {
        let segments = parse(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(PathError::Empty);
        };

        let mut current = root;
        for segment in parents {
            current = match segment {
                Segment::Key(k) => {
                    let slot = object_mut(current, segment)?
                        .entry(k.clone())
                        .or_insert(Value::Null);
                    if slot.is_null() {
                        *slot = Value::Object(Map::new());
                    }
                    slot
                }
                Segment::Index(i) => array_slot(current, *i, segment)?,
            };
        }

        match last {
            Segment::Key(k) => Ok(object_mut(current, last)?.insert(k.clone(), value)),
            Segment::Index(i) => {
                let slot = array_slot(current, *i, last)?;
                Ok(Some(std::mem::replace(slot, value)))
            }
        }
    }

    fn remove(&self, root: &mut Value, path: &str) -> Result<Option<Value>, PathError> {
        let segments = parse(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(PathError::Empty);
        };

        let mut current = root;
        for segment in parents {
            let next = match segment {
                Segment::Key(k) => current.as_object_mut().and_then(|m| m.get_mut(k)),
                Segment::Index(i) => current.as_array_mut().and_then(|a| a.get_mut(*i)),
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }

        Ok(match last {
            Segment::Key(k) => current.as_object_mut().and_then(|m| m.shift_remove(k)),
            Segment::Index(i) => current
                .as_array_mut()
                .filter(|a| *i < a.len())
                .map(|a| a.remove(*i)),
        })
    }
}
