//! Route descriptors: which endpoint a call targets and which rate-limit partition it lands in.
//!
//! A [`Route`] is built from a verb, a path template such as `/channels/{channel_id}/messages`
//! and parameter values. It yields:
//! - the **route key** (`"{METHOD} {template}"`, plus `":{metadata}"` when set), stable across
//!   parameter values;
//! - the resolved, percent-encoded path;
//! - the **major parameters**, the `+`-joined values that split one template into independently
//!   limited resources.
//!
//! ```rust
//! use sluice::{Method, Route};
//!
//! let route = Route::builder(Method::POST, "/channels/{channel_id}/messages")
//!     .param("channel_id", 42)
//!     .build()
//!     .unwrap();
//! assert_eq!(route.key(), "POST /channels/{channel_id}/messages");
//! assert_eq!(route.path(), "/channels/42/messages");
//! assert_eq!(route.major_parameters(), "42");
//! assert_eq!(route.bucket_key(Some("abcd")), "abcd:42");
//! ```

use http::Method;
use std::fmt;

use crate::error::RouteError;

/// Parameter names that always partition a template, in the order they are joined.
pub const MAJOR_PARAMETERS: [&str; 4] = ["channel_id", "guild_id", "webhook_id", "webhook_token"];

/// Templates under this prefix are scoped to the caller and carry no major parameters.
const SELF_SCOPED_PREFIX: &str = "/users/@me";

/// A single resolved endpoint call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: String,
    path: String,
    major: String,
    metadata: Option<String>,
}

impl Route {
    pub fn builder(method: Method, template: impl Into<String>) -> RouteBuilder {
        RouteBuilder { method, template: template.into(), params: Vec::new(), metadata: None }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Path with every placeholder substituted and percent-encoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// Identity of the endpoint, independent of parameter values.
    pub fn key(&self) -> String {
        match &self.metadata {
            Some(meta) => format!("{} {}:{}", self.method, self.template, meta),
            None => format!("{} {}", self.method, self.template),
        }
    }

    pub fn major_parameters(&self) -> &str {
        &self.major
    }

    /// Key of the bucket this call consumes from: the discovered hash when known, else the
    /// route key, joined with the major parameters.
    pub fn bucket_key(&self, hash: Option<&str>) -> String {
        match hash {
            Some(hash) => format!("{}:{}", hash, self.major),
            None => format!("{}:{}", self.key(), self.major),
        }
    }

    /// Absolute URL under `base`.
    pub fn url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.path)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone)]
struct Param {
    name: String,
    value: String,
    major: bool,
}

/// Builder for [`Route`]; template problems surface from [`RouteBuilder::build`].
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    method: Method,
    template: String,
    params: Vec<Param>,
    metadata: Option<String>,
}

impl RouteBuilder {
    /// Supply a placeholder value. Names in [`MAJOR_PARAMETERS`] also partition the bucket.
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        let name = name.into();
        let major = MAJOR_PARAMETERS.contains(&name.as_str());
        self.params.push(Param { name, value: value.to_string(), major });
        self
    }

    /// Supply a value that partitions the bucket. It may also fill a placeholder, but need not.
    pub fn major(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.push(Param { name: name.into(), value: value.to_string(), major: true });
        self
    }

    /// Disambiguate a known sub-limit sharing this template.
    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn build(self) -> Result<Route, RouteError> {
        if !self.template.starts_with('/') {
            return Err(RouteError::RelativePath(self.template));
        }

        let mut path = String::with_capacity(self.template.len());
        let mut used = Vec::new();
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find(['{', '}']) {
            if rest.as_bytes()[open] == b'}' {
                return Err(RouteError::UnbalancedBraces(self.template.clone()));
            }
            path.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| RouteError::UnbalancedBraces(self.template.clone()))?;
            let name = &after[..close];
            if name.contains('{') {
                return Err(RouteError::UnbalancedBraces(self.template.clone()));
            }
            let param = self.params.iter().rev().find(|p| p.name == name).ok_or_else(|| {
                RouteError::MissingParameter {
                    template: self.template.clone(),
                    name: name.to_string(),
                }
            })?;
            path.push_str(&urlencoding::encode(&param.value));
            used.push(name.to_string());
            rest = &after[close + 1..];
        }
        path.push_str(rest);

        if let Some(stray) = self.params.iter().find(|p| !p.major && !used.contains(&p.name)) {
            return Err(RouteError::UnknownParameter {
                template: self.template.clone(),
                name: stray.name.clone(),
            });
        }

        let major = if self.template.starts_with(SELF_SCOPED_PREFIX) {
            String::new()
        } else {
            major_string(&self.params)
        };

        Ok(Route {
            method: self.method,
            template: self.template,
            path,
            major,
            metadata: self.metadata,
        })
    }
}

/// Well-known names first in their fixed order, then caller-marked ones as supplied.
fn major_string(params: &[Param]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for known in MAJOR_PARAMETERS {
        if let Some(p) = params.iter().rev().find(|p| p.major && p.name == known) {
            parts.push(&p.value);
        }
    }
    let mut seen: Vec<&str> = Vec::new();
    for p in params.iter().filter(|p| p.major && !MAJOR_PARAMETERS.contains(&p.name.as_str())) {
        if !seen.contains(&p.name.as_str()) {
            seen.push(&p.name);
            let latest = params.iter().rev().find(|q| q.name == p.name).map(|q| q.value.as_str());
            parts.extend(latest);
        }
    }
    parts.join("+")
}
