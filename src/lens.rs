//! Lens/Context: binds a path template to a concrete path, yielding a
//! parameter bag plus lens-law-respecting get/set/delete closures.
//!
//! A [`Context`] is produced by [`Lens::context`] and is the value passed to
//! task `condition`/`effect`/`action`/`method` callbacks.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::LensError;
use crate::path::{Path, Pointer, Segment};

/// Parameter values bound from `:name` template segments, coerced to an
/// index when the concrete segment was numeric.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Key(String),
    Index(usize),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Key(s) => Some(s),
            ParamValue::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            ParamValue::Index(i) => Some(*i),
            ParamValue::Key(_) => None,
        }
    }
}

/// An immutable binding of a concrete path and target value, produced by
/// matching a template against it.
#[derive(Debug, Clone)]
pub struct Context {
    pub path: Path,
    pub target: Value,
    pub params: HashMap<String, ParamValue>,
}

impl Context {
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Lens `get`: read the current value at this context's path.
    pub fn get<'a>(&self, state: &'a Value) -> Result<Option<&'a Value>, LensError> {
        Ok(Pointer::get(state, &self.path)?)
    }

    /// Lens `set`: write `value` at this context's path.
    pub fn set(&self, state: &mut Value, value: Value) -> Result<(), LensError> {
        Pointer::set(state, &self.path, value)?;
        Ok(())
    }

    /// Lens `delete`: remove the value at this context's path.
    pub fn delete(&self, state: &mut Value) -> Result<(), LensError> {
        Pointer::delete(state, &self.path)?;
        Ok(())
    }
}

/// Matches a path template against a concrete path.
pub struct Lens;

impl Lens {
    pub fn context(template: &Path, concrete: &Path, target: Value) -> Result<Context, LensError> {
        if template.len() != concrete.len() {
            return Err(LensError::SegmentCountMismatch {
                template: template.len(),
                actual: concrete.len(),
            });
        }
        let mut params = HashMap::new();
        for (t, c) in template.0.iter().zip(concrete.0.iter()) {
            match (t, c) {
                (Segment::Param(name), Segment::Key(k)) => {
                    params.insert(name.clone(), ParamValue::Key(k.clone()));
                }
                (Segment::Param(name), Segment::Index(i)) => {
                    params.insert(name.clone(), ParamValue::Index(*i));
                }
                (Segment::Key(expected), Segment::Key(actual)) if expected == actual => {}
                (Segment::Index(expected), Segment::Index(actual)) if expected == actual => {}
                (expected, actual) => {
                    return Err(LensError::LiteralMismatch {
                        expected: segment_repr(expected),
                        actual: segment_repr(actual),
                    })
                }
            }
        }
        Ok(Context {
            path: concrete.clone(),
            target,
            params,
        })
    }
}

fn segment_repr(seg: &Segment) -> String {
    match seg {
        Segment::Key(s) => s.clone(),
        Segment::Index(i) => i.to_string(),
        Segment::Param(s) => format!(":{s}"),
    }
}
