//! Core types shared across the binding layer.

use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier the native service tags its listener callbacks with.
///
/// Assigned by the callback registry; never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub u64);

impl fmt::Debug for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackId({})", self.0)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a database instance within its registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

/// Characters the database does not allow inside a key.
const INVALID_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']'];

/// A normalized location in the database tree.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DatabasePath {
    segments: Vec<String>,
}

impl DatabasePath {
    /// The root location.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a slash separated path. Empty segments are ignored.
    pub fn parse(path: &str) -> Result<Self> {
        Self::root().child(path)
    }

    /// Location of `path` relative to this one.
    pub fn child(&self, path: &str) -> Result<Self> {
        let mut segments = self.segments.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            validate_key(segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Last segment, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if `other` is this location or lies below it.
    pub fn contains(&self, other: &DatabasePath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Segments of `self` below `ancestor`, if `ancestor` contains it.
    pub fn relative_to(&self, ancestor: &DatabasePath) -> Option<&[String]> {
        if ancestor.contains(self) {
            Some(&self.segments[ancestor.segments.len()..])
        } else {
            None
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.chars().any(|c| INVALID_KEY_CHARS.contains(&c) || c.is_ascii_control()) {
        return Err(BridgeError::InvalidPath(format!(
            "key {:?} contains one of '.', '#', '$', '[', ']' or a control character",
            key
        )));
    }
    Ok(())
}

impl fmt::Debug for DatabasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabasePath({})", self)
    }
}

impl fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

/// Error codes reported by the native service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    OperationFailed,
    PermissionDenied,
    Disconnected,
    ExpiredToken,
    InvalidToken,
    MaxRetries,
    OverriddenBySet,
    Unavailable,
    UserCodeException,
    NetworkError,
    WriteCanceled,
    Unknown,
}

impl ErrorCode {
    /// Numeric code used on the native side.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::OperationFailed => -2,
            ErrorCode::PermissionDenied => -3,
            ErrorCode::Disconnected => -4,
            ErrorCode::ExpiredToken => -6,
            ErrorCode::InvalidToken => -7,
            ErrorCode::MaxRetries => -8,
            ErrorCode::OverriddenBySet => -9,
            ErrorCode::Unavailable => -10,
            ErrorCode::UserCodeException => -11,
            ErrorCode::NetworkError => -24,
            ErrorCode::WriteCanceled => -25,
            ErrorCode::Unknown => -999,
        }
    }

    /// Translate a native code. Unrecognized codes map to `Unknown`.
    pub fn from_native(code: i32) -> Self {
        match code {
            -2 => ErrorCode::OperationFailed,
            -3 => ErrorCode::PermissionDenied,
            -4 => ErrorCode::Disconnected,
            -6 => ErrorCode::ExpiredToken,
            -7 => ErrorCode::InvalidToken,
            -8 => ErrorCode::MaxRetries,
            -9 => ErrorCode::OverriddenBySet,
            -10 => ErrorCode::Unavailable,
            -11 => ErrorCode::UserCodeException,
            -24 => ErrorCode::NetworkError,
            -25 => ErrorCode::WriteCanceled,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Uniform representation of an error raised below the binding boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code:?})")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build from the raw code and message passed across the boundary.
    pub fn from_native(code: i32, message: &str) -> Self {
        Self::new(ErrorCode::from_native(code), message)
    }
}

/// Kind of change reported for a child of a listened location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildChangeKind {
    Added,
    Changed,
    Moved,
    Removed,
}

/// Immutable view of the data at a location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    path: DatabasePath,
    value: Value,
    priority: Option<Value>,
}

impl DataSnapshot {
    pub fn new(path: DatabasePath, value: Value) -> Self {
        Self {
            path,
            value,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Option<Value>) -> Self {
        self.priority = priority;
        self
    }

    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn priority(&self) -> Option<&Value> {
        self.priority.as_ref()
    }

    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }

    /// Deserialize the value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    /// Snapshot of a descendant location. Missing data yields a null value.
    pub fn child(&self, path: &str) -> Result<DataSnapshot> {
        let child_path = self.path.child(path)?;
        let mut value = &self.value;
        for segment in &child_path.segments()[self.path.segments().len()..] {
            value = match value.get(segment.as_str()) {
                Some(v) => v,
                None => return Ok(DataSnapshot::new(child_path, Value::Null)),
            };
        }
        Ok(DataSnapshot::new(child_path, value.clone()))
    }

    pub fn has_child(&self, path: &str) -> bool {
        self.child(path).map(|c| c.exists()).unwrap_or(false)
    }

    /// Snapshots of the direct children, in key order.
    pub fn children(&self) -> Vec<DataSnapshot> {
        match &self.value {
            Value::Object(map) => map
                .iter()
                .filter_map(|(k, v)| {
                    let path = self.path.child(k).ok()?;
                    Some(DataSnapshot::new(path, v.clone()))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn children_count(&self) -> usize {
        match &self.value {
            Value::Object(map) => map.len(),
            _ => 0,
        }
    }
}

/// Data handed to a transaction handler for modification.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableData {
    path: DatabasePath,
    value: Value,
    priority: Option<Value>,
}

impl MutableData {
    pub fn new(path: DatabasePath, value: Value, priority: Option<Value>) -> Self {
        Self {
            path,
            value,
            priority,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn priority(&self) -> Option<&Value> {
        self.priority.as_ref()
    }

    pub fn set_priority(&mut self, priority: Option<Value>) {
        self.priority = priority;
    }

    pub fn into_parts(self) -> (Value, Option<Value>) {
        (self.value, self.priority)
    }
}

/// Outcome a transaction handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionResult {
    /// Commit the modified data.
    Success,
    /// Leave the location untouched.
    Abort,
}
