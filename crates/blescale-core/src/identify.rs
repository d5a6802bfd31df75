//! Attribute a weight to a configured household member.
//!
//! [`match_user`] decides who stepped on the scale; [`detect_drift`] warns
//! when a measurement creeps toward the edge of that person's range.

use std::fmt;

use blescale_types::UserProfile;
use serde::{Deserialize, Serialize};

/// What to do when no user's range contains the weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownUserStrategy {
    /// Pick the user whose range midpoint is closest.
    #[default]
    Nearest,
    /// Match nobody, with a warning.
    Log,
    /// Match nobody, silently.
    Ignore,
}

impl fmt::Display for UnknownUserStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnknownUserStrategy::Nearest => write!(f, "nearest"),
            UnknownUserStrategy::Log => write!(f, "log"),
            UnknownUserStrategy::Ignore => write!(f, "ignore"),
        }
    }
}

/// Which rule produced a [`MatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchTier {
    /// Exactly one range contained the weight.
    Exact,
    /// Several ranges contained it; last-known weight decided.
    Tiebreak,
    /// No range contained it; the unknown-user strategy decided.
    Strategy,
    /// Only one user is configured.
    SingleUser,
}

/// Outcome of [`match_user`].
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub user: Option<UserProfile>,
    pub tier: MatchTier,
    pub warning: Option<String>,
}

impl MatchResult {
    fn matched(user: &UserProfile, tier: MatchTier) -> Self {
        Self {
            user: Some(user.clone()),
            tier,
            warning: None,
        }
    }
}

/// Match `weight` (kg) against `users`.
///
/// An empty roster is a caller error; the function still returns, with no
/// user, tier [`MatchTier::Strategy`] and a warning.
pub fn match_user(
    users: &[UserProfile],
    weight: f64,
    strategy: UnknownUserStrategy,
) -> MatchResult {
    match users {
        [] => MatchResult {
            user: None,
            tier: MatchTier::Strategy,
            warning: Some("No users configured".to_string()),
        },
        [only] => {
            let mut result = MatchResult::matched(only, MatchTier::SingleUser);
            if !only.in_range(weight) {
                result.warning = Some(format!(
                    "{weight:.2} kg is outside {}'s range ({:.1}-{:.1} kg)",
                    only.name, only.min_weight, only.max_weight
                ));
            }
            result
        }
        _ => {
            let candidates: Vec<&UserProfile> =
                users.iter().filter(|u| u.in_range(weight)).collect();
            match candidates.as_slice() {
                [] => apply_strategy(users, weight, strategy),
                [one] => MatchResult::matched(one, MatchTier::Exact),
                many => MatchResult::matched(tiebreak(many, weight), MatchTier::Tiebreak),
            }
        }
    }
}

/// Closest last-known weight wins; users without one lose; config order
/// breaks remaining ties.
fn tiebreak<'a>(candidates: &[&'a UserProfile], weight: f64) -> &'a UserProfile {
    let mut best = candidates[0];
    let mut best_distance = best.last_known_weight.map(|w| (w - weight).abs());
    for &candidate in &candidates[1..] {
        let Some(distance) = candidate.last_known_weight.map(|w| (w - weight).abs()) else {
            continue;
        };
        if best_distance.is_none_or(|d| distance < d) {
            best = candidate;
            best_distance = Some(distance);
        }
    }
    best
}

fn apply_strategy(
    users: &[UserProfile],
    weight: f64,
    strategy: UnknownUserStrategy,
) -> MatchResult {
    match strategy {
        UnknownUserStrategy::Nearest => {
            let mut nearest = &users[0];
            for user in &users[1..] {
                if (user.range_midpoint() - weight).abs()
                    < (nearest.range_midpoint() - weight).abs()
                {
                    nearest = user;
                }
            }
            MatchResult {
                user: Some(nearest.clone()),
                tier: MatchTier::Strategy,
                warning: Some(format!(
                    "{weight:.2} kg matches no user's range; assigned to nearest user {}",
                    nearest.name
                )),
            }
        }
        UnknownUserStrategy::Log => MatchResult {
            user: None,
            tier: MatchTier::Strategy,
            warning: Some(format!("{weight:.2} kg matches no user's range")),
        },
        UnknownUserStrategy::Ignore => MatchResult {
            user: None,
            tier: MatchTier::Strategy,
            warning: None,
        },
    }
}

/// Warn when `weight` sits in the outer 10% of `user`'s range.
pub fn detect_drift(user: &UserProfile, weight: f64) -> Option<String> {
    if !user.in_range(weight) {
        return None;
    }
    let margin = (user.max_weight - user.min_weight) * 0.1;
    if weight < user.min_weight + margin {
        Some(format!(
            "{weight:.2} kg is near the lower boundary of {}'s range ({:.1} kg); consider widening it",
            user.name, user.min_weight
        ))
    } else if weight > user.max_weight - margin {
        Some(format!(
            "{weight:.2} kg is near the upper boundary of {}'s range ({:.1} kg); consider widening it",
            user.name, user.max_weight
        ))
    } else {
        None
    }
}
