use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use miette::Diagnostic;
use miette::NamedSource;
use miette::SourceSpan;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::header::AUTHORIZATION;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use thiserror::Error;

mod checks;

pub use checks::FieldCheck;
pub use checks::FieldExpect;
pub use checks::FieldPath;
pub use checks::JsonType;
pub use checks::PathSeg;

use crate::parser;
use crate::parser::Kontrakt;

// Error messages for the structural suite rules
const BASE_URL_MISSING: &str =
    "setup.base_url is required; set it in the suite file or with KONTRAKT_BASE_URL";
const BASE_URL_ENDS_WITH: &str =
    "The base URL from setup cannot end with a /, and each path in a scenario must start with one";
const PATH_MISSING_SLASH: &str =
    "The path field in a scenario is required to begin with a leading /.";
const QUERY_MISSING_MARK: &str =
    "The query field in a scenario is required to begin with a leading ?.";
const NO_TOKENS: &str =
    "at least one token is required; add a [tokens] entry or set KONTRAKT_TOKEN_<ROLE>";
const FIXTURE_AND_BODY: &str =
    "a scenario may reference a fixture or carry an inline body, not both";
const AUTH_AND_HEADER: &str =
    "a scenario may not set an Authorization header and an auth role at the same time";

pub struct Validator {
    kontrakt: Kontrakt,
    toml_src: String,
    file_name: String,
}

/// One expectation attached to a scenario. The validator always emits the
/// status check first, so every scenario carries at least one check.
#[derive(Debug, Clone)]
pub enum Check {
    Status(StatusCode),
    Field(FieldCheck),
}

/// The validated, immutable run plan the runner consumes.
#[derive(Debug)]
pub struct IR {
    pub base_url: String,
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub params: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub checks: Vec<Check>,
}

#[derive(Debug, Error, Diagnostic)]
#[error("Invalid field `{field}`: {message}")]
pub struct ConfigError {
    field: String,
    message: String,
    #[source_code]
    src: Option<NamedSource<String>>,
    #[label("invalid value here")]
    span: Option<SourceSpan>,
}

macro_rules! config_err {
    ($field:expr, $msg:expr, $self:expr, $snippet:expr) => {
        ConfigError {
            field: $field.to_string(),
            message: $msg.to_string(),
            src: Some(NamedSource::new(
                $self.file_name.clone(),
                $self.toml_src.clone(),
            )),
            span: find_span($snippet, &$self.toml_src),
        }
    };
}

impl Validator {
    pub fn new(kontrakt: &Kontrakt, toml_src: &str, file_name: &str) -> Self {
        Self {
            kontrakt: kontrakt.clone(),
            toml_src: toml_src.into(),
            file_name: file_name.into(),
        }
    }

    pub fn validate(&mut self) -> miette::Result<IR, ConfigError> {
        if self.kontrakt.tokens.is_empty() {
            return Err(config_err!("tokens", NO_TOKENS, self, "tokens"));
        }

        let base_url = self.validate_setup()?;

        let global_headers = if let Some(value) = &self.kontrakt.setup.headers {
            checks::parse_header_map(
                value,
                Some(&(self.file_name.clone(), self.toml_src.clone())),
            )?
        } else {
            HeaderMap::new()
        };

        let scenarios = self
            .kontrakt
            .scenarios
            .iter()
            .map(|def| self.create_scenario(def, &global_headers))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(IR {
            base_url,
            scenarios,
        })
    }

    fn validate_setup(&self) -> Result<String, ConfigError> {
        let Some(base_url) = self.kontrakt.setup.base_url.clone() else {
            return Err(config_err!("setup.base_url", BASE_URL_MISSING, self, "base_url"));
        };

        if base_url.ends_with('/') {
            return Err(config_err!("setup.base_url", BASE_URL_ENDS_WITH, self, &base_url));
        }

        Url::parse(&base_url)
            .map_err(|e| config_err!("setup.base_url", e.to_string(), self, &base_url))?;

        Ok(base_url)
    }

    fn create_scenario(
        &self,
        def: &parser::ScenarioDef,
        global_headers: &HeaderMap,
    ) -> Result<Scenario, ConfigError> {
        let method = parse_method(&def.method.to_uppercase()).map_err(|e| {
            config_err!(format!("{} - method", def.name), e, self, &def.method)
        })?;

        if !def.path.starts_with('/') {
            return Err(config_err!(
                format!("{}/path", def.name),
                PATH_MISSING_SLASH,
                self,
                &def.path
            ));
        }

        if let Some(query) = &def.query
            && !query.starts_with('?')
        {
            return Err(config_err!(
                format!("{}/query", def.name),
                QUERY_MISSING_MARK,
                self,
                query
            ));
        }

        let params = self.validate_params(def)?;

        // Start with the global headers from setup, then merge the headers
        // from the individual scenario. If a header exists in both, the
        // scenario header takes precedence.
        let mut headers = global_headers.clone();
        if let Some(value) = &def.headers {
            let scenario_headers = checks::parse_header_map(
                value,
                Some(&(self.file_name.clone(), self.toml_src.clone())),
            )?;

            for (key, value) in scenario_headers {
                if let Some(key) = key {
                    headers.insert(key, value);
                }
            }
        }

        // The Authorization header exists on a request only when the
        // scenario names a token role. A missing `auth` means the request
        // goes out with no Authorization header at all.
        if let Some(role) = &def.auth {
            if headers.contains_key(AUTHORIZATION) {
                return Err(config_err!(
                    format!("{}/auth", def.name),
                    AUTH_AND_HEADER,
                    self,
                    role
                ));
            }

            let Some(token) = self.kontrakt.tokens.get(role) else {
                return Err(config_err!(
                    format!("{}/auth", def.name),
                    format!("unknown token role `{role}`"),
                    self,
                    role
                ));
            };

            let value = HeaderValue::from_str(token).map_err(|e| {
                config_err!(
                    format!("{}/auth", def.name),
                    format!("token for role `{role}` is not a valid header value: {e}"),
                    self,
                    role
                )
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let body = match (&def.fixture, &def.body) {
            (Some(fixture), Some(_)) => {
                return Err(config_err!(
                    format!("{}/fixture", def.name),
                    FIXTURE_AND_BODY,
                    self,
                    fixture
                ));
            }
            (Some(fixture), None) => {
                let Some(payload) = self.kontrakt.fixtures.get(fixture) else {
                    return Err(config_err!(
                        format!("{}/fixture", def.name),
                        format!("unknown fixture `{fixture}`"),
                        self,
                        fixture
                    ));
                };
                Some(payload.clone())
            }
            (None, inline) => inline.clone(),
        };

        let status = StatusCode::from_u16(def.expect_status).map_err(|_| {
            config_err!(
                format!("{}/expect_status", def.name),
                format!("invalid HTTP status code `{}`", def.expect_status),
                self,
                "expect_status"
            )
        })?;

        let mut scenario_checks = vec![Check::Status(status)];
        scenario_checks.extend(checks::parse_field_checks(
            &def.expect_body,
            Some((self.file_name.as_str(), self.toml_src.as_str())),
        )?);

        let timeout = def
            .timeout_ms
            .or(self.kontrakt.setup.timeout_ms)
            .map(Duration::from_millis);

        Ok(Scenario {
            name: def.name.clone(),
            method,
            path: def.path.clone(),
            query: def.query.clone(),
            params,
            headers,
            body,
            timeout,
            checks: scenario_checks,
        })
    }

    /// Every `{placeholder}` in the path and query must have a value in
    /// `params`, and every param must be used by some placeholder.
    fn validate_params(
        &self,
        def: &parser::ScenarioDef,
    ) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut placeholders = extract_placeholders(&def.path)
            .map_err(|e| config_err!(format!("{}/path", def.name), e, self, &def.path))?;

        if let Some(query) = &def.query {
            let more = extract_placeholders(query)
                .map_err(|e| config_err!(format!("{}/query", def.name), e, self, query))?;
            placeholders.extend(more);
        }

        for placeholder in &placeholders {
            if !def.params.contains_key(placeholder) {
                return Err(config_err!(
                    format!("{}/params", def.name),
                    format!("no value for placeholder `{{{placeholder}}}`"),
                    self,
                    &def.path
                ));
            }
        }

        for param in def.params.keys() {
            if !placeholders.contains(param) {
                return Err(config_err!(
                    format!("{}/params", def.name),
                    format!("param `{param}` does not appear in the path or query"),
                    self,
                    param
                ));
            }
        }

        Ok(def
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn extract_placeholders(template: &str) -> Result<BTreeSet<String>, String> {
    let mut names = BTreeSet::new();
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(format!("unclosed `{{` in `{template}`"));
        };

        let name = &after[..end];
        if name.is_empty() {
            return Err(format!("empty placeholder in `{template}`"));
        }

        names.insert(name.to_string());
        rest = &after[end + 1..];
    }

    Ok(names)
}

fn parse_method(method: &str) -> Result<Method, String> {
    let method = Method::from_str(method).map_err(|e| e.to_string())?;

    if !matches!(
        method,
        Method::GET
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::PATCH
            | Method::HEAD
            | Method::OPTIONS
    ) {
        return Err(format!("Invalid HTTP method: {}", method));
    }

    Ok(method)
}

fn find_span(needle: &str, toml_src: &str) -> Option<SourceSpan> {
    let pattern = format!("\"{}\"", needle);
    toml_src
        .find(&pattern)
        .map(|start| SourceSpan::new(start.into(), needle.len()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use reqwest::Method;
    use reqwest::StatusCode;
    use reqwest::header::AUTHORIZATION;

    use super::Check;
    use super::ConfigError;
    use super::IR;
    use super::Validator;
    use super::extract_placeholders;
    use crate::parser::Kontrakt;

    fn validate(suite: &str) -> Result<IR, ConfigError> {
        let kontrakt: Kontrakt = toml::from_str(suite).unwrap();
        Validator::new(&kontrakt, suite, "suite.toml").validate()
    }

    #[test]
    fn valid_suite_produces_a_plan() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"
            timeout_ms = 5000

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "get"
            path = "/books"
            query = "?query=Book 1"
            auth = "valid"
            expect_status = 200
            expect_body = [{ path = "pageSize" }]
        "#;

        let ir = validate(suite).unwrap();

        assert_eq!(ir.base_url, "http://localhost:3000");
        assert_eq!(ir.scenarios.len(), 1);

        let scenario = &ir.scenarios[0];
        assert_eq!(scenario.method, Method::GET);
        assert_eq!(scenario.timeout, Some(Duration::from_millis(5000)));
        assert_eq!(scenario.headers.get(AUTHORIZATION).unwrap(), "valid_token");
        assert!(matches!(scenario.checks[0], Check::Status(StatusCode::OK)));
        assert_eq!(scenario.checks.len(), 2);
    }

    #[test]
    fn no_auth_means_no_authorization_header() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "anonymous checkout"
            method = "POST"
            path = "/users/{userId}/checkout"
            params = { userId = "123" }
            body = { cart_items = [] }
            expect_status = 400
        "#;

        let ir = validate(suite).unwrap();
        assert!(ir.scenarios[0].headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn scenario_headers_override_global_headers() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"
            headers = { accept = "application/json", x-suite = "global" }

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "override"
            method = "GET"
            path = "/books"
            headers = { x-suite = "scenario" }
            expect_status = 200
        "#;

        let ir = validate(suite).unwrap();
        let headers = &ir.scenarios[0].headers;
        assert_eq!(headers.get("accept").unwrap(), "application/json");
        assert_eq!(headers.get("x-suite").unwrap(), "scenario");
    }

    #[test]
    fn base_url_must_not_end_with_a_slash() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000/"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.to_string().contains("setup.base_url"));
    }

    #[test]
    fn missing_base_url_names_the_env_var() {
        let suite = r#"
            [setup]
            timeout_ms = 1000

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("KONTRAKT_BASE_URL"));
    }

    #[test]
    fn at_least_one_token_is_required() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("at least one token"));
    }

    #[test]
    fn unknown_token_role_is_rejected() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            auth = "expired"
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("unknown token role `expired`"));
    }

    #[test]
    fn auth_role_and_authorization_header_conflict() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            auth = "valid"
            headers = { authorization = "raw_token" }
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("not set an Authorization header"));
    }

    #[test]
    fn unknown_fixture_is_rejected() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "checkout"
            method = "POST"
            path = "/checkout"
            fixture = "nope"
            expect_status = 201
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("unknown fixture `nope`"));
    }

    #[test]
    fn fixture_and_inline_body_conflict() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [fixtures.payload]
            cart_items = []

            [[scenarios]]
            name = "checkout"
            method = "POST"
            path = "/checkout"
            fixture = "payload"
            body = { cart_items = [] }
            expect_status = 201
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("not both"));
    }

    #[test]
    fn placeholder_without_a_param_is_rejected() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "checkout"
            method = "POST"
            path = "/users/{userId}/checkout"
            expect_status = 201
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("placeholder `{userId}`"));
    }

    #[test]
    fn unused_param_is_rejected() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "checkout"
            method = "POST"
            path = "/checkout"
            params = { userId = "123" }
            expect_status = 201
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("param `userId`"));
    }

    #[test]
    fn bad_method_is_rejected_with_a_span() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "FETCH"
            path = "/books"
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.span.is_some());
    }

    #[test]
    fn invalid_status_code_is_rejected() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            expect_status = 1000
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("invalid HTTP status code `1000`"));
    }

    #[test]
    fn query_requires_a_leading_question_mark() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [[scenarios]]
            name = "search"
            method = "GET"
            path = "/books"
            query = "query=Book 1"
            expect_status = 200
        "#;

        let err = validate(suite).unwrap_err();
        assert!(err.message.contains("leading ?"));
    }

    #[test]
    fn placeholder_extraction() {
        let names = extract_placeholders("/users/{userId}/orders/{orderId}").unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("userId"));
        assert!(names.contains("orderId"));

        assert!(extract_placeholders("/users/{userId").is_err());
        assert!(extract_placeholders("/users/{}").is_err());
        assert!(extract_placeholders("/plain").unwrap().is_empty());
    }
}
