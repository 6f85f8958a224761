use std::collections::HashMap;

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Kontrakt {
    pub setup: Setup,
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    #[serde(default)]
    pub fixtures: HashMap<String, serde_json::Value>,
    pub scenarios: Vec<ScenarioDef>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Setup {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub headers: Option<toml::Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ScenarioDef {
    pub name: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    pub auth: Option<String>,
    pub headers: Option<toml::Value>,
    pub fixture: Option<String>,
    pub body: Option<serde_json::Value>,
    pub timeout_ms: Option<u64>,
    pub expect_status: u16,
    #[serde(default)]
    pub expect_body: Vec<FieldCheckDef>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FieldCheckDef {
    pub path: String,
    pub equals: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
}

/// Merges environment variables into a parsed suite file.
///
/// `KONTRAKT_BASE_URL` replaces `setup.base_url`. `KONTRAKT_TOKEN_<ROLE>`
/// replaces or adds the token for `<role>`, with the suffix lowercased to
/// form the role name. The file and the environment together form the one
/// immutable configuration the run uses.
pub fn apply_env_overrides<I>(kontrakt: &mut Kontrakt, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        if key == "KONTRAKT_BASE_URL" {
            kontrakt.setup.base_url = Some(value);
        } else if let Some(role) = key.strip_prefix("KONTRAKT_TOKEN_") {
            if role.is_empty() {
                continue;
            }
            kontrakt.tokens.insert(role.to_lowercase(), value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::Kontrakt;
    use super::apply_env_overrides;

    const MINIMAL: &str = r#"
        [setup]
        base_url = "http://localhost:3000"

        [tokens]
        valid = "from_file"

        [[scenarios]]
        name = "ping"
        method = "GET"
        path = "/health"
        expect_status = 200
    "#;

    #[test]
    fn env_overrides_base_url_and_tokens() {
        let mut kontrakt: Kontrakt = toml::from_str(MINIMAL).unwrap();

        apply_env_overrides(
            &mut kontrakt,
            vec![
                ("KONTRAKT_BASE_URL".to_string(), "http://10.0.0.7:8080".to_string()),
                ("KONTRAKT_TOKEN_VALID".to_string(), "from_env".to_string()),
                ("KONTRAKT_TOKEN_ADMIN".to_string(), "admin_token".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ],
        );

        assert_eq!(kontrakt.setup.base_url.as_deref(), Some("http://10.0.0.7:8080"));
        assert_eq!(kontrakt.tokens.get("valid").map(String::as_str), Some("from_env"));
        assert_eq!(kontrakt.tokens.get("admin").map(String::as_str), Some("admin_token"));
    }

    #[test]
    fn unrelated_vars_leave_the_suite_alone() {
        let mut kontrakt: Kontrakt = toml::from_str(MINIMAL).unwrap();

        apply_env_overrides(
            &mut kontrakt,
            vec![("KONTRAKT_TOKEN_".to_string(), "dangling".to_string())],
        );

        assert_eq!(kontrakt.setup.base_url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(kontrakt.tokens.len(), 1);
    }

    #[test]
    fn bodies_and_fixtures_deserialize_as_json_values() {
        let suite = r#"
            [setup]
            base_url = "http://localhost:3000"

            [tokens]
            valid = "valid_token"

            [fixtures.valid_checkout]
            cart_items = [{ book_id = "bk-101", qty = 2, price = "19.50" }]

            [[scenarios]]
            name = "checkout"
            method = "POST"
            path = "/users/{userId}/checkout"
            params = { userId = "123" }
            fixture = "valid_checkout"
            expect_status = 201
            expect_body = [{ path = "status", equals = "pending" }]
        "#;

        let kontrakt: Kontrakt = toml::from_str(suite).unwrap();

        let fixture = kontrakt.fixtures.get("valid_checkout").unwrap();
        assert_eq!(fixture["cart_items"][0]["qty"], serde_json::json!(2));
        assert_eq!(fixture["cart_items"][0]["price"], serde_json::json!("19.50"));

        let check = &kontrakt.scenarios[0].expect_body[0];
        assert_eq!(check.path, "status");
        assert_eq!(check.equals, Some(serde_json::json!("pending")));
        assert!(check.type_name.is_none());
    }
}
