//! Challenge (captcha) responses and the pluggable solver that answers them.

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::BoxError;
use crate::response::ResponseBody;

/// Challenge payload returned by the API when a request needs human verification.
///
/// Fields are read leniently: scalars are stringified and anything else is dropped, so an
/// oddly shaped field never hides the challenge itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Challenge {
    /// Error keys describing why the challenge was issued.
    #[serde(default, deserialize_with = "lenient_keys")]
    pub captcha_key: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub captcha_sitekey: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub captcha_service: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub captcha_rqdata: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub captcha_rqtoken: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub captcha_session_id: Option<String>,
}

impl Challenge {
    /// Extract a challenge from a response body. Any JSON body with a `captcha_key` is one.
    pub fn from_body(body: &ResponseBody) -> Option<Self> {
        let value = body.as_json()?;
        value.get("captcha_key")?;
        Some(serde_json::from_value(value.clone()).unwrap_or_default())
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_keys<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Array(items) => items.iter().filter_map(scalar).collect(),
        other => scalar(&other).into_iter().collect(),
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(scalar(&Value::deserialize(de)?))
}

/// Answer produced by a [`ChallengeSolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSolution {
    pub key: String,
}

pub(crate) const CAPTCHA_KEY: HeaderName = HeaderName::from_static("x-captcha-key");
pub(crate) const CAPTCHA_SESSION_ID: HeaderName = HeaderName::from_static("x-captcha-session-id");
pub(crate) const CAPTCHA_RQTOKEN: HeaderName = HeaderName::from_static("x-captcha-rqtoken");

impl ChallengeSolution {
    /// Attach the solution (and the challenge's session identifiers) to the retry's headers.
    pub(crate) fn apply(&self, challenge: &Challenge, headers: &mut HeaderMap) {
        if let Ok(v) = HeaderValue::from_str(&self.key) {
            headers.insert(CAPTCHA_KEY, v);
        }
        if let Some(v) =
            challenge.captcha_session_id.as_deref().and_then(|s| HeaderValue::from_str(s).ok())
        {
            headers.insert(CAPTCHA_SESSION_ID, v);
        }
        if let Some(v) =
            challenge.captcha_rqtoken.as_deref().and_then(|s| HeaderValue::from_str(s).ok())
        {
            headers.insert(CAPTCHA_RQTOKEN, v);
        }
    }
}

/// External collaborator that turns a challenge into a solution token.
#[async_trait]
pub trait ChallengeSolver: Send + Sync + std::fmt::Debug {
    async fn solve(&self, challenge: &Challenge) -> Result<ChallengeSolution, BoxError>;
}
