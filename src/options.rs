//! Capture request options: validation and normalization
//!
//! Raw requests arrive as a loose field map (query string or JSON body) and
//! are turned into an immutable [`CaptureOptions`] record before anything
//! else looks at them. Compact string encodings (`k=v;k=v` headers,
//! `top,left,width,height` clip rectangles) are parsed here; absent fields
//! stay absent instead of becoming nulls.

use crate::config::{EngineKind, OutputFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

static CLIP_RECT_RE: OnceLock<Regex> = OnceLock::new();

fn clip_rect_re() -> &'static Regex {
    CLIP_RECT_RE.get_or_init(|| Regex::new(r"^(\d*),(\d*),([1-9]\d*),([1-9]\d*)$").unwrap())
}

/// Inbound request fields, exactly as the caller sent them.
///
/// Everything is optional at this layer; requiredness and range checks live
/// in [`RawCaptureRequest::validate`] so that every failure surfaces in the
/// same JSON error shape. Keys outside this set are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCaptureRequest {
    pub force: Option<bool>,
    pub url: Option<String>,
    pub agent: Option<String>,
    pub headers: Option<String>,
    pub delay: Option<u64>,
    pub format: Option<OutputFormat>,
    pub engine: Option<EngineKind>,
    pub quality: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub clip_rect: Option<String>,
    pub zoom: Option<f64>,
    pub js: Option<bool>,
    pub images: Option<bool>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub callback: Option<String>,
    pub cookies: Option<Vec<CookieSpec>>,
}

impl RawCaptureRequest {
    /// Check field values, collecting every problem instead of stopping at
    /// the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match &self.url {
            Some(url) if !url.trim().is_empty() => {}
            _ => errors.push("\"url\" is required".to_string()),
        }

        if let Some(width) = self.width {
            if width < 1 {
                errors.push("\"width\" must be at least 1".to_string());
            }
        }

        if let Some(height) = self.height {
            if height < 1 {
                errors.push("\"height\" must be at least 1".to_string());
            }
        }

        if let Some(quality) = self.quality {
            if !(0.0..=1.0).contains(&quality) {
                errors.push("\"quality\" must be between 0 and 1".to_string());
            }
        }

        if let Some(zoom) = self.zoom {
            if !zoom.is_finite() || zoom < 0.0 {
                errors.push("\"zoom\" must be at least 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Canonical capture options, built once per request and never mutated.
///
/// Serialization elides absent fields entirely, so the engine and the
/// artifact fingerprint only ever see options the caller actually set.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureOptions {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_rect: Option<ClipRect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub js: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<CookieSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

impl CaptureOptions {
    /// Normalize a validated raw request into canonical options.
    ///
    /// This never fails: malformed compact encodings degrade to absent
    /// fields, and a URL that cannot be percent-decoded is kept as sent.
    pub fn from_raw(raw: RawCaptureRequest) -> Self {
        Self {
            url: normalize_url(raw.url.unwrap_or_default().trim()),
            engine: raw.engine,
            format: raw.format,
            width: raw.width,
            height: raw.height,
            clip_rect: raw.clip_rect.as_deref().and_then(parse_clip_rect),
            zoom: raw.zoom,
            quality: raw.quality,
            delay: raw.delay,
            js: raw.js,
            images: raw.images,
            agent: nonempty(raw.agent),
            user: nonempty(raw.user),
            password: nonempty(raw.password),
            headers: raw.headers.as_deref().and_then(parse_headers),
            cookies: raw.cookies,
            callback: nonempty(raw.callback),
            force: raw.force,
        }
    }

    /// Deterministic identity of a capture: the dispatched target plus every
    /// option that affects rendering. Delivery-side fields (`callback`,
    /// `force`) are excluded so they never split the artifact cache.
    pub fn fingerprint(&self, target: &str) -> Result<String, serde_json::Error> {
        let mut rendering = self.clone();
        rendering.callback = None;
        rendering.force = None;
        let serialized = serde_json::to_string(&rendering)?;
        Ok(format!("{target}|{serialized}"))
    }
}

/// Clip rectangle in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClipRect {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

/// Cookie attached to the page before navigation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httponly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
}

fn nonempty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_url(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Parse a `top,left,width,height` clip rectangle.
///
/// Top and left may be empty (read as 0), width and height must be positive.
/// Anything that does not match yields `None` rather than an error: a
/// malformed clip rectangle simply means no clipping.
pub fn parse_clip_rect(raw: &str) -> Option<ClipRect> {
    let caps = clip_rect_re().captures(raw.trim())?;

    let component = |idx: usize| -> Option<u32> {
        let text = caps.get(idx).map(|m| m.as_str()).unwrap_or("");
        if text.is_empty() {
            Some(0)
        } else {
            text.parse().ok()
        }
    };

    Some(ClipRect {
        top: component(1)?,
        left: component(2)?,
        width: component(3)?,
        height: component(4)?,
    })
}

/// Parse a compact `k=v;k=v` header string into a map.
///
/// Pairs without `=` become empty-valued headers, later duplicates win, and
/// an empty result is reported as absent rather than as an empty map.
pub fn parse_headers(raw: &str) -> Option<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();

    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if !key.is_empty() {
                    headers.insert(key.to_string(), value.trim().to_string());
                }
            }
            None => {
                headers.insert(pair.to_string(), String::new());
            }
        }
    }

    if headers.is_empty() {
        None
    } else {
        Some(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_url(url: &str) -> RawCaptureRequest {
        RawCaptureRequest {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_requires_url() {
        let raw = RawCaptureRequest::default();
        let errors = raw.validate().unwrap_err();
        assert_eq!(errors, vec!["\"url\" is required".to_string()]);

        let raw = raw_with_url("   ");
        assert!(raw.validate().is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let raw = RawCaptureRequest {
            width: Some(0),
            height: Some(0),
            quality: Some(1.5),
            zoom: Some(-1.0),
            ..Default::default()
        };
        let errors = raw.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_validate_accepts_boundary_values() {
        let raw = RawCaptureRequest {
            url: Some("http://example.com".to_string()),
            width: Some(1),
            height: Some(1),
            quality: Some(0.0),
            zoom: Some(0.0),
            ..Default::default()
        };
        assert!(raw.validate().is_ok());

        let raw = RawCaptureRequest {
            quality: Some(1.0),
            ..raw_with_url("http://example.com")
        };
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn test_clip_rect_full() {
        assert_eq!(
            parse_clip_rect("10,20,300,400"),
            Some(ClipRect {
                top: 10,
                left: 20,
                width: 300,
                height: 400
            })
        );
    }

    #[test]
    fn test_clip_rect_empty_top_left() {
        assert_eq!(
            parse_clip_rect(",,300,400"),
            Some(ClipRect {
                top: 0,
                left: 0,
                width: 300,
                height: 400
            })
        );
    }

    #[test]
    fn test_clip_rect_rejects_zero_dimensions() {
        assert_eq!(parse_clip_rect("0,0,0,5"), None);
        assert_eq!(parse_clip_rect("0,0,5,0"), None);
    }

    #[test]
    fn test_clip_rect_rejects_garbage() {
        assert_eq!(parse_clip_rect(""), None);
        assert_eq!(parse_clip_rect("10,20,300"), None);
        assert_eq!(parse_clip_rect("a,b,c,d"), None);
        assert_eq!(parse_clip_rect("10,20,300,400,500"), None);
        // Larger than u32 falls back to no clipping.
        assert_eq!(parse_clip_rect("0,0,99999999999999999999,5"), None);
    }

    #[test]
    fn test_parse_headers_pairs() {
        let headers = parse_headers("a=1;b=2").unwrap();
        assert_eq!(headers.get("a"), Some(&"1".to_string()));
        assert_eq!(headers.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn test_parse_headers_empty_is_absent() {
        assert_eq!(parse_headers(""), None);
        assert_eq!(parse_headers(";;;"), None);
    }

    #[test]
    fn test_parse_headers_valueless_and_duplicates() {
        let headers = parse_headers("X-Flag;a=1;a=2").unwrap();
        assert_eq!(headers.get("X-Flag"), Some(&String::new()));
        assert_eq!(headers.get("a"), Some(&"2".to_string()));
    }

    #[test]
    fn test_from_raw_decodes_url() {
        let options = CaptureOptions::from_raw(raw_with_url("http%3A%2F%2Fexample.com%2Fpage"));
        assert_eq!(options.url, "http://example.com/page");
    }

    #[test]
    fn test_from_raw_keeps_undecodable_url() {
        // A lone "%" is not a valid escape; the URL is kept as sent.
        let options = CaptureOptions::from_raw(raw_with_url("http://example.com/100%"));
        assert_eq!(options.url, "http://example.com/100%");
    }

    #[test]
    fn test_from_raw_blank_callback_is_absent() {
        let raw = RawCaptureRequest {
            callback: Some("   ".to_string()),
            ..raw_with_url("http://example.com")
        };
        let options = CaptureOptions::from_raw(raw);
        assert!(options.callback.is_none());
    }

    #[test]
    fn test_serialization_elides_absent_fields() {
        let options = CaptureOptions::from_raw(raw_with_url("http://example.com"));
        let json = serde_json::to_value(&options).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object.contains_key("url"));
        assert!(!json.to_string().contains("null"));
    }

    #[test]
    fn test_fingerprint_ignores_delivery_fields() {
        let base = CaptureOptions::from_raw(raw_with_url("http://example.com"));
        let mut with_callback = base.clone();
        with_callback.callback = Some("http://callback.example.com".to_string());
        with_callback.force = Some(true);

        let target = "http://example.com";
        assert_eq!(
            base.fingerprint(target).unwrap(),
            with_callback.fingerprint(target).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_varies_with_rendering_options() {
        let base = CaptureOptions::from_raw(raw_with_url("http://example.com"));
        let mut wider = base.clone();
        wider.width = Some(1920);

        let target = "http://example.com";
        assert_ne!(
            base.fingerprint(target).unwrap(),
            wider.fingerprint(target).unwrap()
        );
        assert_ne!(
            base.fingerprint(target).unwrap(),
            base.fingerprint("http://example.com/other").unwrap()
        );
    }
}
