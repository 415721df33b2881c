use serde::Serialize;

use super::rules::{OrgConfig, PageUrl, PathRule};
use crate::types::PoolId;

/// Outcome of matching a URL, with the rule that decided it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMatch {
    pub pool_id: Option<PoolId>,
    pub rule_id: Option<String>,
    pub used_default: bool,
}

/// Resolves a page URL to a pool
///
/// Stateless: the organization's [`OrgConfig`] is passed in on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMatcher;

impl RuleMatcher {
    /// Pool for `url`, or the org default, or `None` when the visitor is
    /// unrouted.
    pub fn match_pool(config: &OrgConfig, url: &str) -> Option<PoolId> {
        Self::explain(config, url).pool_id
    }

    pub fn explain(config: &OrgConfig, url: &str) -> PoolMatch {
        let page = PageUrl::parse(url);
        match Self::first_matching_rule(config, &page) {
            Some(rule) => PoolMatch {
                pool_id: Some(rule.pool_id.clone()),
                rule_id: Some(rule.id.clone()),
                used_default: false,
            },
            None => PoolMatch {
                pool_id: config.default_pool_id.clone(),
                rule_id: None,
                used_default: true,
            },
        }
    }

    /// Active rules in ascending priority; the sort is stable so equal
    /// priorities keep their configured order.
    fn first_matching_rule<'a>(config: &'a OrgConfig, page: &PageUrl) -> Option<&'a PathRule> {
        let mut rules: Vec<&PathRule> = config.path_rules.iter().filter(|r| r.is_active).collect();
        rules.sort_by_key(|r| r.priority);
        rules.into_iter().find(|rule| rule.matches(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::rules::{MatchType, RuleCondition};
    use pretty_assertions::assert_eq;

    fn acme_config() -> OrgConfig {
        OrgConfig::new("acme", Some(PoolId::from("general"))).with_rule(
            PathRule::new("pricing", "sales", 1)
                .with_condition(RuleCondition::domain(MatchType::IsExactly, "acme.com"))
                .with_condition(RuleCondition::path(MatchType::StartsWith, "/pricing")),
        )
    }

    #[test]
    fn pricing_pages_route_to_sales() {
        let config = acme_config();
        assert_eq!(
            RuleMatcher::match_pool(&config, "https://acme.com/pricing/enterprise"),
            Some(PoolId::from("sales"))
        );
    }

    #[test]
    fn other_pages_fall_back_to_default() {
        let config = acme_config();
        assert_eq!(
            RuleMatcher::match_pool(&config, "https://acme.com/blog"),
            Some(PoolId::from("general"))
        );
        let explained = RuleMatcher::explain(&config, "https://acme.com/blog");
        assert!(explained.used_default);
        assert_eq!(explained.rule_id, None);
    }

    #[test]
    fn no_default_means_unrouted() {
        let config = OrgConfig::new("acme", None);
        assert_eq!(RuleMatcher::match_pool(&config, "https://acme.com/"), None);
    }

    #[test]
    fn lowest_priority_value_wins() {
        let config = OrgConfig::new("acme", None)
            .with_rule(PathRule::new("broad", "general", 10).with_condition(RuleCondition::path(
                MatchType::StartsWith,
                "/",
            )))
            .with_rule(PathRule::new("narrow", "sales", 1).with_condition(RuleCondition::path(
                MatchType::StartsWith,
                "/pricing",
            )));
        let explained = RuleMatcher::explain(&config, "https://acme.com/pricing");
        assert_eq!(explained.rule_id.as_deref(), Some("narrow"));
    }

    #[test]
    fn equal_priorities_keep_configured_order() {
        let config = OrgConfig::new("acme", None)
            .with_rule(PathRule::new("first", "a", 5).with_condition(RuleCondition::path(MatchType::Contains, "p")))
            .with_rule(PathRule::new("second", "b", 5).with_condition(RuleCondition::path(MatchType::Contains, "p")));
        assert_eq!(RuleMatcher::match_pool(&config, "/pricing"), Some(PoolId::from("a")));
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let config = OrgConfig::new("acme", Some(PoolId::from("general"))).with_rule(
            PathRule::new("off", "sales", 1)
                .with_condition(RuleCondition::path(MatchType::StartsWith, "/pricing"))
                .inactive(),
        );
        assert_eq!(RuleMatcher::match_pool(&config, "/pricing"), Some(PoolId::from("general")));
    }

    #[test]
    fn every_condition_must_hold() {
        let config = OrgConfig::new("acme", None).with_rule(
            PathRule::new("ads", "paid", 1)
                .with_condition(RuleCondition::path(MatchType::StartsWith, "/landing"))
                .with_condition(RuleCondition::query_param("utm_source", MatchType::IsExactly, "ads")),
        );
        assert_eq!(
            RuleMatcher::match_pool(&config, "https://acme.com/landing?utm_source=ads"),
            Some(PoolId::from("paid"))
        );
        assert_eq!(RuleMatcher::match_pool(&config, "https://acme.com/landing?utm_source=mail"), None);
        assert_eq!(RuleMatcher::match_pool(&config, "https://acme.com/landing"), None);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let config = acme_config();
        assert_eq!(
            RuleMatcher::match_pool(&config, "https://acme.com/Pricing"),
            Some(PoolId::from("general"))
        );
    }
}
