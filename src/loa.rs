//! Levels of assurance.
//!
//! Notified levels are the three eIDAS levels with a numeric ordering.
//! Anything else is a non-notified level, an opaque URI that has to be
//! published by the receiving node.

use std::{fmt, str::FromStr};

use tracing::debug;

use crate::error::{EngineError, EngineResult, ErrorKey};

pub const LOA_PREFIX: &str = "http://eidas.europa.eu/LoA/";

/// Notified levels require exactly this many values when mixed with
/// non-notified ones.
const MAX_NOTIFIED_IN_MIXED_REQUEST: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotifiedLevelOfAssurance {
    Low,
    Substantial,
    High,
}

impl NotifiedLevelOfAssurance {
    pub const ALL: [NotifiedLevelOfAssurance; 3] = [Self::Low, Self::Substantial, Self::High];

    #[must_use]
    pub const fn value(&self) -> &'static str {
        match self {
            Self::Low => "http://eidas.europa.eu/LoA/low",
            Self::Substantial => "http://eidas.europa.eu/LoA/substantial",
            Self::High => "http://eidas.europa.eu/LoA/high",
        }
    }

    #[must_use]
    pub const fn numeric_value(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Substantial => 2,
            Self::High => 3,
        }
    }

    /// `None` for anything that is not one of the three notified URIs.
    #[must_use]
    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.value() == uri.trim())
    }

    /// This level and every level above it, lowest first.
    #[must_use]
    pub fn this_and_higher(&self) -> Vec<Self> {
        Self::ALL.into_iter().filter(|level| level >= self).collect()
    }
}

impl fmt::Display for NotifiedLevelOfAssurance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LevelOfAssurance {
    Notified(NotifiedLevelOfAssurance),
    NonNotified(String),
}

impl LevelOfAssurance {
    #[must_use]
    pub fn parse(uri: &str) -> Self {
        match NotifiedLevelOfAssurance::from_uri(uri) {
            Some(level) => Self::Notified(level),
            None => Self::NonNotified(uri.trim().to_string()),
        }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Notified(level) => level.value(),
            Self::NonNotified(uri) => uri,
        }
    }

    #[must_use]
    pub fn notified(&self) -> Option<NotifiedLevelOfAssurance> {
        match self {
            Self::Notified(level) => Some(*level),
            Self::NonNotified(_) => None,
        }
    }
}

impl From<NotifiedLevelOfAssurance> for LevelOfAssurance {
    fn from(level: NotifiedLevelOfAssurance) -> Self {
        Self::Notified(level)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelOfAssuranceComparison {
    #[default]
    Minimum,
    Exact,
}

impl LevelOfAssuranceComparison {
    #[must_use]
    pub const fn value(&self) -> &'static str {
        match self {
            Self::Minimum => "minimum",
            Self::Exact => "exact",
        }
    }
}

impl FromStr for LevelOfAssuranceComparison {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "minimum" => Ok(Self::Minimum),
            "exact" => Ok(Self::Exact),
            other => Err(invalid_loa(format!("unknown comparison {other:?}"))),
        }
    }
}

fn invalid_loa(detail: impl Into<String>) -> EngineError {
    EngineError::validation(ErrorKey::ColleagueRequestInvalidLoa, detail)
}

/// Checks the levels of an authentication request against the eIDAS rules.
///
/// * a request with notified levels only carries exactly one level and uses
///   `minimum`;
/// * a request with non-notified levels only uses `exact`;
/// * a mixed request uses `exact` and lists its notified levels from the top:
///   high, then substantial, then low.
///
/// Every non-notified level must appear in `accepted_non_notified`, so an
/// empty list refuses them all.
pub fn validate_requested_levels(
    levels: &[LevelOfAssurance],
    comparison: LevelOfAssuranceComparison,
    accepted_non_notified: &[String],
) -> EngineResult<()> {
    if levels.is_empty() {
        return Err(invalid_loa("no level of assurance requested"));
    }

    let mut notified = Vec::new();
    let mut non_notified = Vec::new();
    for level in levels {
        match level {
            LevelOfAssurance::Notified(n) => notified.push(*n),
            LevelOfAssurance::NonNotified(uri) if uri.starts_with(LOA_PREFIX) => {
                return Err(invalid_loa(format!("unknown notified level {uri}")));
            }
            LevelOfAssurance::NonNotified(uri) => {
                if !accepted_non_notified.iter().any(|accepted| accepted == uri) {
                    return Err(invalid_loa(format!("non-notified level {uri} is not published")));
                }
                non_notified.push(uri.as_str());
            }
        }
    }

    match (notified.is_empty(), non_notified.is_empty()) {
        (false, true) => {
            if notified.len() != 1 {
                return Err(invalid_loa("only one notified level may be requested"));
            }
            if comparison != LevelOfAssuranceComparison::Minimum {
                return Err(invalid_loa("notified levels are compared with minimum"));
            }
        }
        (true, false) => {
            if comparison != LevelOfAssuranceComparison::Exact {
                return Err(invalid_loa("non-notified levels are compared with exact"));
            }
        }
        _ => {
            if comparison != LevelOfAssuranceComparison::Exact {
                return Err(invalid_loa("mixed levels are compared with exact"));
            }
            if notified.len() > MAX_NOTIFIED_IN_MIXED_REQUEST {
                return Err(invalid_loa("too many notified levels"));
            }
            let expected: Vec<NotifiedLevelOfAssurance> = NotifiedLevelOfAssurance::ALL
                .into_iter()
                .rev()
                .take(notified.len())
                .collect();
            if expected.iter().any(|level| !notified.contains(level)) {
                return Err(invalid_loa(
                    "mixed requests list notified levels from high downwards",
                ));
            }
        }
    }
    debug!(levels = levels.len(), comparison = comparison.value(), "levels of assurance accepted");
    Ok(())
}

/// The AuthnContextClassRef values sent for a request.
///
/// With `exact` every notified level above a requested one is added as
/// well, since a higher notified level satisfies a lower one.
#[must_use]
pub fn expand_requested_levels(
    levels: &[LevelOfAssurance],
    comparison: LevelOfAssuranceComparison,
) -> Vec<LevelOfAssurance> {
    let mut expanded: Vec<LevelOfAssurance> = Vec::new();
    for level in levels {
        let candidates = match (comparison, level) {
            (LevelOfAssuranceComparison::Exact, LevelOfAssurance::Notified(n)) => n
                .this_and_higher()
                .into_iter()
                .map(LevelOfAssurance::Notified)
                .collect(),
            _ => vec![level.clone()],
        };
        for candidate in candidates {
            if !expanded.contains(&candidate) {
                expanded.push(candidate);
            }
        }
    }
    expanded
}

/// Whether the level a proxy-service achieved satisfies the request.
#[must_use]
pub fn is_achieved_level_acceptable(
    requested: &[LevelOfAssurance],
    comparison: LevelOfAssuranceComparison,
    achieved: &str,
) -> bool {
    let achieved = LevelOfAssurance::parse(achieved);
    match comparison {
        LevelOfAssuranceComparison::Minimum => {
            let Some(achieved) = achieved.notified() else {
                return false;
            };
            requested
                .iter()
                .filter_map(LevelOfAssurance::notified)
                .min()
                .is_some_and(|minimum| achieved.numeric_value() >= minimum.numeric_value())
        }
        LevelOfAssuranceComparison::Exact => {
            expand_requested_levels(requested, comparison).contains(&achieved)
        }
    }
}
