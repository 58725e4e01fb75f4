//! Response bodies as the engine sees them: JSON when the server says so, text otherwise.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde_json::Value;
use std::fmt;

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    /// Decode `body` as JSON when `Content-Type` is `application/json`, else as UTF-8 text.
    ///
    /// A JSON content type with an unparsable payload falls back to text; an empty body under
    /// a JSON content type decodes to `Value::Null`.
    pub fn json_or_text(headers: &HeaderMap, body: &Bytes) -> Self {
        let is_json = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().eq_ignore_ascii_case("application/json"))
            .unwrap_or(false);

        if is_json {
            if body.is_empty() {
                return ResponseBody::Json(Value::Null);
            }
            if let Ok(value) = serde_json::from_slice(body) {
                return ResponseBody::Json(value);
            }
        }
        ResponseBody::Text(String::from_utf8_lossy(body).into_owned())
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(t) => Some(t),
            ResponseBody::Json(_) => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ResponseBody::Json(_))
    }

    /// Look up a top-level field of a JSON object body.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_json().and_then(|v| v.get(name))
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Text(_) => None,
        }
    }
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Json(v) => write!(f, "{}", v),
            ResponseBody::Text(t) => f.write_str(t),
        }
    }
}
