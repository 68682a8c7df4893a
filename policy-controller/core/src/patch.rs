use serde::Serialize;
use serde_json::Value;

/// A JSON Patch (RFC 6902) operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
}

impl PatchOperation {
    pub fn add(segments: &[&str], value: impl Into<Value>) -> Self {
        Self::Add {
            path: pointer(segments),
            value: value.into(),
        }
    }

    pub fn replace(segments: &[&str], value: impl Into<Value>) -> Self {
        Self::Replace {
            path: pointer(segments),
            value: value.into(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } => path,
        }
    }
}

/// Escapes a single JSON Pointer reference token (RFC 6901).
pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Builds a JSON Pointer from unescaped segments.
pub fn pointer(segments: &[&str]) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(&escape(segment));
    }
    path
}
