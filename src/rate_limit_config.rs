use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TarotError;

/// A request rate expressed per second, parsed from `"<count>-<unit>"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub per_second: f64,
}

/// Time unit of a limit spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl LimitUnit {
    pub fn seconds(&self) -> f64 {
        match self {
            LimitUnit::Second => 1.0,
            LimitUnit::Minute => 60.0,
            LimitUnit::Hour => 3600.0,
            LimitUnit::Day => 86400.0,
        }
    }
}

impl FromStr for LimitUnit {
    type Err = TarotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "S" => Ok(LimitUnit::Second),
            "M" => Ok(LimitUnit::Minute),
            "H" => Ok(LimitUnit::Hour),
            "D" => Ok(LimitUnit::Day),
            other => Err(TarotError::InvalidFormat(format!(
                "invalid time unit '{}', expected one of S, M, H, D",
                other
            ))),
        }
    }
}

/// Parse a limit such as `"5-S"`, `"10-m"`, `"1000-H"` or `"2000-D"`.
pub fn parse_limit(spec: &str) -> Result<RateLimit, TarotError> {
    let parts: Vec<&str> = spec.trim().split('-').collect();
    if parts.len() != 2 {
        return Err(TarotError::InvalidFormat(format!(
            "'{}' is not of the form <count>-<unit>",
            spec
        )));
    }

    let count: f64 = parts[0]
        .trim()
        .parse()
        .map_err(|_| TarotError::InvalidFormat(format!("invalid rate value '{}'", parts[0])))?;
    if !count.is_finite() || count < 0.0 {
        return Err(TarotError::InvalidFormat(format!(
            "rate value must be a non-negative number, got '{}'",
            parts[0]
        )));
    }

    let unit: LimitUnit = parts[1].trim().parse()?;

    Ok(RateLimit {
        per_second: count / unit.seconds(),
    })
}

impl FromStr for RateLimit {
    type Err = TarotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_limit(s)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s", self.per_second)
    }
}

/// How requests are grouped into limiter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyScope {
    /// One bucket per client IP.
    Ip,
    /// One bucket per client IP and matched route.
    RouteWithIp,
}

/// One route-level limit as configured, before it is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimitRule {
    pub name: String,
    pub limit: String,
    pub burst: u32,
    pub scope: KeyScope,
}

impl RouteLimitRule {
    pub fn new(name: &str, limit: &str, burst: u32, scope: KeyScope) -> Self {
        Self {
            name: name.to_string(),
            limit: limit.to_string(),
            burst,
            scope,
        }
    }

    /// An empty limit string disables the rule.
    pub fn is_enabled(&self) -> bool {
        !self.limit.trim().is_empty()
    }
}

/// The inbound limits applied by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimits {
    pub global: RouteLimitRule,
    pub create_reading: RouteLimitRule,
    pub query_reading: RouteLimitRule,
}

impl RouteLimits {
    pub fn rules(&self) -> [&RouteLimitRule; 3] {
        [&self.global, &self.create_reading, &self.query_reading]
    }
}

impl Default for RouteLimits {
    fn default() -> Self {
        Self {
            global: RouteLimitRule::new("global", "30000-H", 100, KeyScope::Ip),
            create_reading: RouteLimitRule::new("create_reading", "100-H", 100, KeyScope::RouteWithIp),
            query_reading: RouteLimitRule::new("query_reading", "300-M", 100, KeyScope::RouteWithIp),
        }
    }
}
