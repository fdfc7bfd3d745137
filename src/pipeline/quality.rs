//! Heuristic quality score used to gate frontier expansion.
//!
//! Accounts below the follower/follows minimums or outside the
//! followers:follows ratio bounds score zero. Everything else starts at 0.5
//! and earns up to 0.3 for profile completeness and up to 0.2 for posting
//! activity, so scores fall in `[0.5, 1.0]`.

use crate::models::{ActorProfile, QualityConfig};

/// Why an account scored zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disqualified {
    FewFollowers,
    FewFollows,
    RatioOutOfBounds,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub score: f64,
    pub disqualified: Option<Disqualified>,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    config: QualityConfig,
}

impl QualityScorer {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    pub fn score(&self, profile: &ActorProfile) -> f64 {
        self.assess(profile).score
    }

    pub fn assess(&self, profile: &ActorProfile) -> Assessment {
        let followers = profile.followers_count.unwrap_or(0);
        let follows = profile.follows_count.unwrap_or(0);

        let disqualified = if followers < self.config.min_followers {
            Some(Disqualified::FewFollowers)
        } else if follows < self.config.min_following {
            Some(Disqualified::FewFollows)
        } else {
            let ratio = followers as f64 / follows.max(1) as f64;
            (ratio < self.config.min_ratio || ratio > self.config.max_ratio)
                .then_some(Disqualified::RatioOutOfBounds)
        };
        if disqualified.is_some() {
            return Assessment {
                score: 0.0,
                disqualified,
            };
        }

        let filled = [&profile.display_name, &profile.description, &profile.avatar]
            .into_iter()
            .filter(|field| field.as_deref().is_some_and(|s| !s.trim().is_empty()))
            .count();
        let completeness = filled as f64 / 3.0;

        let posts = profile.posts_count.unwrap_or(0).max(0) as f64;
        let activity = if self.config.posts_saturation <= 0 {
            1.0
        } else {
            ((1.0 + posts).ln() / (1.0 + self.config.posts_saturation as f64).ln()).min(1.0)
        };

        Assessment {
            score: 0.5 + 0.3 * completeness + 0.2 * activity,
            disqualified: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(followers: i64, follows: i64) -> ActorProfile {
        ActorProfile {
            did: "did:plc:x".into(),
            handle: Some("x.example".into()),
            display_name: None,
            description: None,
            avatar: None,
            followers_count: Some(followers),
            follows_count: Some(follows),
            posts_count: None,
        }
    }

    fn scorer() -> QualityScorer {
        QualityScorer::new(QualityConfig::default())
    }

    #[test]
    fn test_minimums_and_ratio_bounds() {
        let s = scorer();
        assert_eq!(
            s.assess(&profile(3, 50)).disqualified,
            Some(Disqualified::FewFollowers)
        );
        assert_eq!(
            s.assess(&profile(50, 1)).disqualified,
            Some(Disqualified::FewFollows)
        );
        assert_eq!(
            s.assess(&profile(10_000, 10)).disqualified,
            Some(Disqualified::RatioOutOfBounds)
        );
        assert_eq!(s.score(&profile(10_000, 10)), 0.0);
    }

    #[test]
    fn test_bare_account_scores_base() {
        let assessment = scorer().assess(&profile(100, 100));
        assert_eq!(assessment.disqualified, None);
        assert!((assessment.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_complete_active_profile_scores_one() {
        let mut p = profile(100, 100);
        p.display_name = Some("X".into());
        p.description = Some("posting about rust".into());
        p.avatar = Some("https://cdn.example/x.jpg".into());
        p.posts_count = Some(5_000);
        assert!((scorer().score(&p) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_blank_fields_do_not_count() {
        let mut p = profile(100, 100);
        p.display_name = Some("   ".into());
        assert!((scorer().score(&p) - 0.5).abs() < 1e-9);
    }
}
