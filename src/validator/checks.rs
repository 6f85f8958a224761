use std::fmt;

use miette::NamedSource;
use miette::SourceSpan;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use toml::Value;

use crate::parser::FieldCheckDef;
use crate::validator::Check;
use crate::validator::ConfigError;

/// A dotted path into a JSON body, e.g. `cart.cart_items[0].price`.
/// `[*]` addresses every element of an array.
#[derive(Debug, Clone)]
pub struct FieldPath {
    raw: String,
    pub segments: Vec<PathSeg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
    Every,
}

#[derive(Debug, Clone)]
pub struct FieldCheck {
    pub path: FieldPath,
    pub expect: FieldExpect,
}

#[derive(Debug, Clone)]
pub enum FieldExpect {
    Present,
    Equals(serde_json::Value),
    TypeOf(JsonType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();

        for part in raw.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };

            if key.is_empty() {
                return Err(format!("empty key in field path `{raw}`"));
            }
            segments.push(PathSeg::Key(key.to_string()));

            while let Some(bracketed) = rest.strip_prefix('[') {
                let Some(end) = bracketed.find(']') else {
                    return Err(format!("unclosed `[` in field path `{raw}`"));
                };

                let index = &bracketed[..end];
                if index == "*" {
                    segments.push(PathSeg::Every);
                } else {
                    let index = index
                        .parse::<usize>()
                        .map_err(|_| format!("bad array index `{index}` in field path `{raw}`"))?;
                    segments.push(PathSeg::Index(index));
                }

                rest = &bracketed[end + 1..];
            }

            if !rest.is_empty() {
                return Err(format!("unexpected `{rest}` in field path `{raw}`"));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl JsonType {
    fn parse(name: &str) -> Result<Self, String> {
        match name {
            "null" => Ok(JsonType::Null),
            "bool" | "boolean" => Ok(JsonType::Bool),
            "number" => Ok(JsonType::Number),
            "string" => Ok(JsonType::String),
            "array" => Ok(JsonType::Array),
            "object" => Ok(JsonType::Object),
            other => Err(format!(
                "unknown type `{other}`; expected null, bool, number, string, array or object"
            )),
        }
    }

    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => JsonType::Null,
            serde_json::Value::Bool(_) => JsonType::Bool,
            serde_json::Value::Number(_) => JsonType::Number,
            serde_json::Value::String(_) => JsonType::String,
            serde_json::Value::Array(_) => JsonType::Array,
            serde_json::Value::Object(_) => JsonType::Object,
        }
    }

    pub fn matches(&self, value: &serde_json::Value) -> bool {
        Self::of(value) == *self
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonType::Null => "null",
            JsonType::Bool => "bool",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        };
        write!(f, "{name}")
    }
}

/// Helper function to find the span of a key in the source contents.
fn find_key_span(src: Option<&(String, String)>, key: &str) -> Option<SourceSpan> {
    let (_, content) = src?;
    // This simple find assumes the key is unique and finds its first occurrence.
    let start = content.find(key)?;
    Some(SourceSpan::new(start.into(), key.len()))
}

/// Helper function to find the span of a value in the source contents.
fn find_value_span(src: Option<&(String, String)>, value: &str) -> Option<SourceSpan> {
    let (_, content) = src?;
    let start = content.find(value)?;
    Some(SourceSpan::new(start.into(), value.len()))
}

/// Macro to simplify the creation of a ConfigError with source context.
macro_rules! check_err {
    ($src:expr, $field:expr, $message:expr, $span_fn:expr) => {
        ConfigError {
            field: $field.to_string(),
            message: $message,
            src: $src
                .as_ref()
                .map(|(name, content)| NamedSource::new(name.clone(), content.clone())),
            span: $span_fn,
        }
    };
}

/// Parses a single header key-value pair and adds it to the HeaderMap.
fn parse_single_header(
    header_map: &mut HeaderMap,
    key: &str,
    value: &Value,
    src: Option<&(String, String)>,
) -> Result<(), ConfigError> {
    let v_str = value.as_str().ok_or_else(|| {
        check_err!(
            src,
            key,
            format!("Header value must be a string, got {value:?}"),
            find_key_span(src, key)
        )
    })?;

    let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
        check_err!(
            src,
            key,
            format!("Invalid header name `{key}`: {e}"),
            find_key_span(src, key)
        )
    })?;

    let h_value = HeaderValue::from_str(v_str).map_err(|e| {
        check_err!(
            src,
            key,
            format!("Invalid header value for `{key}`: {e}"),
            find_value_span(src, v_str)
        )
    })?;

    header_map.insert(name, h_value);
    Ok(())
}

/// Parses a headers table from a TOML Value into a HeaderMap.
pub fn parse_header_map(
    value: &Value,
    src: Option<&(String, String)>,
) -> Result<HeaderMap, ConfigError> {
    let map = value.as_table().ok_or_else(|| {
        check_err!(
            src,
            "headers",
            format!("Expected a table for headers, got {value:?}"),
            None
        )
    })?;

    let mut header_map = HeaderMap::new();

    for (k, v) in map {
        parse_single_header(&mut header_map, k, v, src)?;
    }

    Ok(header_map)
}

/// Parses the `expect_body` entries of a scenario into field checks.
/// An entry with neither `equals` nor `type` asserts presence only.
pub fn parse_field_checks(
    defs: &[FieldCheckDef],
    src: Option<(&str, &str)>,
) -> Result<Vec<Check>, ConfigError> {
    let src_ref = src.map(|(n, c)| (n.to_string(), c.to_string()));
    let mut parsed = Vec::with_capacity(defs.len());

    for def in defs {
        let path = FieldPath::parse(&def.path).map_err(|e| {
            check_err!(
                src_ref,
                "expect_body.path",
                e,
                find_value_span(src_ref.as_ref(), &def.path)
            )
        })?;

        let expect = match (&def.equals, &def.type_name) {
            (Some(_), Some(_)) => {
                return Err(check_err!(
                    src_ref,
                    "expect_body",
                    format!("check for `{}` may set `equals` or `type`, not both", def.path),
                    find_value_span(src_ref.as_ref(), &def.path)
                ));
            }
            (Some(value), None) => FieldExpect::Equals(value.clone()),
            (None, Some(name)) => {
                let json_type = JsonType::parse(name).map_err(|e| {
                    check_err!(
                        src_ref,
                        "expect_body.type",
                        e,
                        find_value_span(src_ref.as_ref(), name)
                    )
                })?;
                FieldExpect::TypeOf(json_type)
            }
            (None, None) => FieldExpect::Present,
        };

        parsed.push(Check::Field(FieldCheck { path, expect }));
    }

    Ok(parsed)
}
