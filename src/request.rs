//! Render requests built from caller JSON
//!
//! A [`RenderRequest`] is constructed once from the request body. The
//! pass-through rules for page query parameters and the cache fingerprint are
//! applied here, at construction, so the rest of the engine only sees typed
//! fields and already-serialized parameters.

use crate::markdown::render_card_markdown;
use crate::{Config, RenderError};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use url::Url;

/// Fields injected into the DOM instead of being forwarded as parameters.
pub const RESERVED_FIELDS: [&str; 3] = ["icon", "translate", "content"];

/// Fields always forwarded as JSON text.
pub const JSON_FIELDS: [&str; 3] = ["switchConfig", "fonts", "style"];

pub const DEFAULT_TEMPLATE: &str = "tempA";

const FORM_FIELD: &str = "form";

#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Short id for log correlation
    pub id: String,
    /// Class name of the card element (`temp`)
    pub template: String,
    pub language: Option<String>,
    pub content: Option<String>,
    /// Content is HTML already; otherwise it is markdown source
    pub content_is_html: bool,
    pub translation: Option<String>,
    pub icon_url: Option<String>,
    pub image_scale: Option<f64>,
    /// Forwarded query parameters, values already serialized
    pub extra_fields: BTreeMap<String, String>,
    /// Canonical serialization of the whole body; the cache key
    pub fingerprint: String,
}

impl RenderRequest {
    pub fn from_value(body: Value) -> Result<Self, RenderError> {
        match body {
            Value::Object(map) => Self::from_body(map),
            other => Err(RenderError::InvalidRequest(format!(
                "body must be a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    pub fn from_body(body: Map<String, Value>) -> Result<Self, RenderError> {
        let fingerprint = fingerprint(&Value::Object(body.clone()));

        let template = match body.get("temp") {
            None | Some(Value::Null) => DEFAULT_TEMPLATE.to_string(),
            Some(Value::String(name)) if name.is_empty() => DEFAULT_TEMPLATE.to_string(),
            Some(Value::String(name)) => {
                if !is_identifier(name) {
                    return Err(RenderError::InvalidRequest(format!(
                        "temp must be a CSS class name, got {name:?}"
                    )));
                }
                name.clone()
            }
            Some(other) => {
                return Err(RenderError::InvalidRequest(format!(
                    "temp must be a string, got {}",
                    json_type(other)
                )))
            }
        };

        let language = match non_empty_str(body.get("language")) {
            Some(lang) if !is_identifier(lang) => {
                return Err(RenderError::InvalidRequest(format!(
                    "language must be a path segment, got {lang:?}"
                )))
            }
            other => other.map(str::to_string),
        };

        let form = body.get(FORM_FIELD).and_then(Value::as_object);
        let from_body_or_form = |key: &str| {
            non_empty_str(body.get(key))
                .or_else(|| form.and_then(|f| non_empty_str(f.get(key))))
                .map(str::to_string)
        };
        let content = from_body_or_form("content");
        let translation = from_body_or_form("translate");
        let icon_url = from_body_or_form("icon");

        let content_is_html = match body.get("isContentHtml") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag == "true",
            _ => false,
        };

        let image_scale = match body.get("imgScale") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.trim().parse::<f64>().map_err(|_| {
                RenderError::InvalidRequest(format!("imgScale must be a number, got {s:?}"))
            })?),
            Some(other) => {
                return Err(RenderError::InvalidRequest(format!(
                    "imgScale must be a number, got {}",
                    json_type(other)
                )))
            }
        }
        .filter(|scale| *scale > 0.0 && scale.is_finite());

        let extra_fields = body
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), query_value(key, value)))
            .collect();

        Ok(Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            template,
            language,
            content,
            content_is_html,
            translation,
            icon_url,
            image_scale,
            extra_fields,
            fingerprint,
        })
    }

    /// CSS selector of the capture target.
    pub fn selector(&self) -> String {
        format!(".{}", self.template)
    }

    /// HTML to inject into the content region, converting markdown source.
    pub fn content_markup(&self) -> Option<Cow<'_, str>> {
        self.content.as_deref().map(|content| {
            if self.content_is_html {
                Cow::Borrowed(content)
            } else {
                Cow::Owned(render_card_markdown(content))
            }
        })
    }

    pub fn scale(&self, default: f64) -> f64 {
        self.image_scale.unwrap_or(default)
    }

    /// Page URL for this request.
    ///
    /// Derived from the configured target on every call; the language only
    /// replaces the default-language path segment of this request's copy.
    pub fn target_url(&self, config: &Config) -> Result<Url, RenderError> {
        let mut url = Url::parse(&config.target_url).map_err(|e| {
            RenderError::Configuration(format!("Invalid target url {}: {e}", config.target_url))
        })?;

        if let Some(language) = &self.language {
            let mut replaced = false;
            let mut segments = Vec::new();
            for segment in url.path_segments().into_iter().flatten() {
                if !replaced && segment == config.default_language {
                    replaced = true;
                    segments.push(language.clone());
                } else {
                    segments.push(segment.to_string());
                }
            }
            url.path_segments_mut()
                .map_err(|_| {
                    RenderError::Configuration(format!(
                        "Target url {} cannot carry a language",
                        config.target_url
                    ))
                })?
                .clear()
                .extend(segments.iter());
        }

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("isApi", "true");
            for (key, value) in &self.extra_fields {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

/// Canonical, key-order independent serialization of a request body.
pub fn fingerprint(body: &Value) -> String {
    canonicalize(body).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (key, value) in sorted {
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn query_value(key: &str, value: &Value) -> String {
    if JSON_FIELDS.contains(&key) {
        return value.to_string();
    }
    if key == FORM_FIELD {
        if let Value::Object(form) = value {
            let mut form = form.clone();
            for reserved in RESERVED_FIELDS {
                form.remove(reserved);
            }
            return Value::Object(form).to_string();
        }
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
