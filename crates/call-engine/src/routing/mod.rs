//! # Pool Routing Module
//!
//! Decides which agent pool a visitor belongs to, based on the page they are
//! looking at. Every organization publishes an [`OrgConfig`]: an ordered list
//! of [`PathRule`]s plus an optional catch-all pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Visitor page URL                          │
//! │  https://acme.com/pricing/enterprise?utm_source=ads          │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │  PageUrl::parse
//! ┌─────────────────────────▼───────────────────────────────────┐
//! │                     RuleMatcher                              │
//! │  - active rules only                                         │
//! │  - ascending priority (stable)                               │
//! │  - all conditions must hold                                  │
//! └─────────────────────────┬───────────────────────────────────┘
//!                           │
//!           ┌───────────────┴───────────────┐
//!           │                               │
//! ┌─────────▼─────────┐           ┌─────────▼─────────┐
//! │  Rule's pool      │           │  Default pool     │
//! │  (first match)    │           │  (may be none)    │
//! └───────────────────┘           └───────────────────┘
//! ```
//!
//! ## Conditions
//!
//! | Type | Inspects | Notes |
//! |------|----------|-------|
//! | `domain` | URL host | |
//! | `path` | URL path | |
//! | `query_param` | decoded value of `paramName` | absent params only satisfy `does_not_contain` |
//!
//! Match types are `is_exactly`, `contains`, `does_not_contain`,
//! `starts_with` and `ends_with`. Comparisons are case-sensitive.
//!
//! Rules without conditions fall back to their `domainPattern` /
//! `pathPattern` globs (`*`, `*.acme.com`, `/docs/**`, `/docs/*`, `/docs*`).
//!
//! ## Example
//!
//! ```rust
//! use greetnow_call_engine::routing::{MatchType, OrgConfig, PathRule, RuleCondition, RuleMatcher};
//! use greetnow_call_engine::types::PoolId;
//!
//! let config = OrgConfig::new("acme", Some(PoolId::from("general"))).with_rule(
//!     PathRule::new("pricing", "sales", 1)
//!         .with_condition(RuleCondition::domain(MatchType::IsExactly, "acme.com"))
//!         .with_condition(RuleCondition::path(MatchType::StartsWith, "/pricing")),
//! );
//!
//! assert_eq!(
//!     RuleMatcher::match_pool(&config, "https://acme.com/pricing/enterprise"),
//!     Some(PoolId::from("sales"))
//! );
//! assert_eq!(
//!     RuleMatcher::match_pool(&config, "https://acme.com/blog"),
//!     Some(PoolId::from("general"))
//! );
//! ```

pub mod matcher;
pub mod registry;
pub mod rules;

pub use matcher::{PoolMatch, RuleMatcher};
pub use registry::OrgConfigRegistry;
pub use rules::{ConditionType, MatchType, OrgConfig, PageUrl, PathRule, RuleCondition};
