//! Routing rule data model and URL decomposition

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{OrgId, PoolId};

/// Which part of the page URL a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Domain,
    Path,
    QueryParam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    IsExactly,
    Contains,
    DoesNotContain,
    StartsWith,
    EndsWith,
}

impl MatchType {
    /// Case-sensitive comparison of `actual` against `expected`
    pub fn compare(&self, actual: &str, expected: &str) -> bool {
        match self {
            MatchType::IsExactly => actual == expected,
            MatchType::Contains => actual.contains(expected),
            MatchType::DoesNotContain => !actual.contains(expected),
            MatchType::StartsWith => actual.starts_with(expected),
            MatchType::EndsWith => actual.ends_with(expected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub match_type: MatchType,
    pub value: String,
    /// Query parameter name; only meaningful for `query_param`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name: Option<String>,
}

impl RuleCondition {
    pub fn domain(match_type: MatchType, value: impl Into<String>) -> Self {
        Self {
            condition_type: ConditionType::Domain,
            match_type,
            value: value.into(),
            param_name: None,
        }
    }

    pub fn path(match_type: MatchType, value: impl Into<String>) -> Self {
        Self {
            condition_type: ConditionType::Path,
            match_type,
            value: value.into(),
            param_name: None,
        }
    }

    pub fn query_param(param_name: impl Into<String>, match_type: MatchType, value: impl Into<String>) -> Self {
        Self {
            condition_type: ConditionType::QueryParam,
            match_type,
            value: value.into(),
            param_name: Some(param_name.into()),
        }
    }

    pub fn holds(&self, url: &PageUrl) -> bool {
        match self.condition_type {
            ConditionType::Domain => self.match_type.compare(&url.host, &self.value),
            ConditionType::Path => self.match_type.compare(&url.path, &self.value),
            ConditionType::QueryParam => {
                let value = self.param_name.as_deref().and_then(|name| url.query_param(name));
                match value {
                    Some(value) => self.match_type.compare(value, &self.value),
                    // An absent parameter cannot contain anything
                    None => self.match_type == MatchType::DoesNotContain,
                }
            }
        }
    }
}

/// One routing rule of an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<OrgId>,
    pub pool_id: PoolId,
    /// Legacy glob, used only when `conditions` is empty
    #[serde(default)]
    pub domain_pattern: String,
    /// Legacy glob, used only when `conditions` is empty
    #[serde(default)]
    pub path_pattern: String,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Lower value wins
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl PathRule {
    pub fn new(id: impl Into<String>, pool_id: impl Into<PoolId>, priority: i32) -> Self {
        Self {
            id: id.into(),
            org_id: None,
            pool_id: pool_id.into(),
            domain_pattern: String::new(),
            path_pattern: String::new(),
            conditions: Vec::new(),
            priority,
            is_active: true,
        }
    }

    pub fn with_condition(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_patterns(mut self, domain_pattern: impl Into<String>, path_pattern: impl Into<String>) -> Self {
        self.domain_pattern = domain_pattern.into();
        self.path_pattern = path_pattern.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn matches(&self, url: &PageUrl) -> bool {
        if !self.conditions.is_empty() {
            return self.conditions.iter().all(|c| c.holds(url));
        }
        domain_pattern_matches(&url.host, &self.domain_pattern) && path_pattern_matches(&url.path, &self.path_pattern)
    }
}

/// Routing configuration of one organization. Replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgConfig {
    pub org_id: OrgId,
    #[serde(default)]
    pub default_pool_id: Option<PoolId>,
    #[serde(default)]
    pub path_rules: Vec<PathRule>,
}

impl OrgConfig {
    pub fn new(org_id: impl Into<OrgId>, default_pool_id: Option<PoolId>) -> Self {
        Self {
            org_id: org_id.into(),
            default_pool_id,
            path_rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: PathRule) -> Self {
        self.path_rules.push(rule);
        self
    }
}

/// The parts of a page URL that rules look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUrl {
    pub host: String,
    pub path: String,
    query: Vec<(String, String)>,
}

impl PageUrl {
    /// Decompose `raw`. Strings that are not absolute URLs are treated as a
    /// path with an optional query string and an empty host.
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) => Self {
                host: url.host_str().unwrap_or_default().to_string(),
                path: url.path().to_string(),
                query: url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect(),
            },
            Err(_) => {
                let without_fragment = raw.split('#').next().unwrap_or_default();
                let (path, query) = match without_fragment.split_once('?') {
                    Some((path, query)) => (path, query),
                    None => (without_fragment, ""),
                };
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{}", path)
                };
                Self {
                    host: String::new(),
                    path,
                    query: url::form_urlencoded::parse(query.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect(),
                }
            }
        }
    }

    /// First value of a query parameter (names are case-sensitive)
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// `*` / empty match anything, `*.example.com` matches the apex and any
/// subdomain, anything else must equal the host.
fn domain_pattern_matches(host: &str, pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    if let Some(apex) = pattern.strip_prefix("*.") {
        return host == apex || host.ends_with(&format!(".{}", apex));
    }
    host == pattern
}

/// Supports `/path`, `/path*`, `/path/*` (direct children) and `/path/**`
/// (subtree). Trailing slashes are ignored; empty matches anything.
fn path_pattern_matches(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "*" || pattern == "/**" {
        return true;
    }
    let path = normalize_path(path);
    let pattern = normalize_path(pattern);

    if pattern == path {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path == prefix || path.starts_with(&format!("{}/", prefix));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return match path.strip_prefix(&format!("{}/", prefix)) {
            Some(rest) => !rest.contains('/'),
            None => false,
        };
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    false
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_urls_are_decomposed() {
        let url = PageUrl::parse("https://acme.com/pricing/enterprise?utm_source=ads&plan=pro%20plus");
        assert_eq!(url.host, "acme.com");
        assert_eq!(url.path, "/pricing/enterprise");
        assert_eq!(url.query_param("utm_source"), Some("ads"));
        assert_eq!(url.query_param("plan"), Some("pro plus"));
        assert_eq!(url.query_param("missing"), None);
    }

    #[test]
    fn relative_strings_are_treated_as_paths() {
        let url = PageUrl::parse("pricing?ref=nav#top");
        assert_eq!(url.host, "");
        assert_eq!(url.path, "/pricing");
        assert_eq!(url.query_param("ref"), Some("nav"));
    }

    #[test]
    fn query_param_names_are_case_sensitive() {
        let url = PageUrl::parse("https://acme.com/?Ref=nav");
        assert_eq!(url.query_param("ref"), None);
        assert_eq!(url.query_param("Ref"), Some("nav"));
    }

    #[test]
    fn missing_query_param_only_satisfies_does_not_contain() {
        let url = PageUrl::parse("https://acme.com/");
        assert!(RuleCondition::query_param("utm", MatchType::DoesNotContain, "ads").holds(&url));
        assert!(!RuleCondition::query_param("utm", MatchType::Contains, "").holds(&url));
        assert!(!RuleCondition::query_param("utm", MatchType::IsExactly, "").holds(&url));
    }

    #[test]
    fn match_types_compare_case_sensitively() {
        assert!(MatchType::IsExactly.compare("acme.com", "acme.com"));
        assert!(!MatchType::IsExactly.compare("Acme.com", "acme.com"));
        assert!(MatchType::Contains.compare("/pricing/team", "pricing"));
        assert!(MatchType::DoesNotContain.compare("/blog", "pricing"));
        assert!(MatchType::StartsWith.compare("/pricing/team", "/pricing"));
        assert!(!MatchType::StartsWith.compare("/Pricing/team", "/pricing"));
        assert!(MatchType::EndsWith.compare("/docs/faq", "/faq"));
    }

    #[test]
    fn legacy_domain_patterns() {
        assert!(domain_pattern_matches("anything.io", "*"));
        assert!(domain_pattern_matches("anything.io", ""));
        assert!(domain_pattern_matches("shop.acme.com", "*.acme.com"));
        assert!(domain_pattern_matches("acme.com", "*.acme.com"));
        assert!(!domain_pattern_matches("notacme.com", "*.acme.com"));
        assert!(domain_pattern_matches("acme.com", "acme.com"));
        assert!(!domain_pattern_matches("www.acme.com", "acme.com"));
    }

    #[test]
    fn legacy_path_patterns() {
        assert!(path_pattern_matches("/pricing/", "/pricing"));
        assert!(path_pattern_matches("/pricing", "/pricing/**"));
        assert!(path_pattern_matches("/pricing/a/b", "/pricing/**"));
        assert!(path_pattern_matches("/pricing/a", "/pricing/*"));
        assert!(!path_pattern_matches("/pricing/a/b", "/pricing/*"));
        assert!(!path_pattern_matches("/pricing", "/pricing/*"));
        assert!(path_pattern_matches("/pricing-team", "/pricing*"));
        assert!(!path_pattern_matches("/blog", "/pricing*"));
        assert!(path_pattern_matches("/anything", ""));
    }

    #[test]
    fn rule_without_conditions_uses_legacy_patterns() {
        let rule = PathRule::new("r1", "sales", 1).with_patterns("*.acme.com", "/pricing/**");
        assert!(rule.matches(&PageUrl::parse("https://www.acme.com/pricing/team")));
        assert!(!rule.matches(&PageUrl::parse("https://www.acme.com/blog")));
    }

    #[test]
    fn conditions_override_legacy_patterns() {
        let rule = PathRule::new("r1", "sales", 1)
            .with_patterns("other.com", "/nowhere")
            .with_condition(RuleCondition::path(MatchType::StartsWith, "/pricing"));
        assert!(rule.matches(&PageUrl::parse("https://acme.com/pricing")));
    }

    #[test]
    fn org_config_deserializes_dashboard_payload() {
        let json = r#"{
            "orgId": "org-1",
            "defaultPoolId": "general",
            "pathRules": [{
                "id": "r1",
                "poolId": "sales",
                "domainPattern": "*",
                "pathPattern": "/pricing/**",
                "conditions": [
                    {"type": "query_param", "matchType": "is_exactly", "value": "ads", "paramName": "utm_source"}
                ],
                "priority": 2,
                "isActive": true
            }]
        }"#;
        let config: OrgConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.default_pool_id, Some(PoolId::from("general")));
        assert_eq!(config.path_rules[0].conditions[0].condition_type, ConditionType::QueryParam);
        assert_eq!(config.path_rules[0].conditions[0].param_name.as_deref(), Some("utm_source"));
    }
}
