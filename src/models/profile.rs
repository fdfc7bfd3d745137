// src/models/profile.rs

//! Graph API payloads.

use serde::{Deserialize, Serialize};

use super::entity::{Edge, User};

/// An actor profile as returned by the graph API.
///
/// List endpoints return the basic view (no counts); the profile endpoint
/// fills in the counts used for quality scoring.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfile {
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub follows_count: Option<i64>,
    #[serde(default)]
    pub posts_count: Option<i64>,
}

impl ActorProfile {
    pub fn to_user(&self, indexed_at: i64) -> User {
        User {
            did: self.did.clone(),
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            avatar: self.avatar.clone(),
            followers_count: self.followers_count,
            follows_count: self.follows_count,
            posts_count: self.posts_count,
            indexed_at,
        }
    }
}

/// Which side of an actor's follow graph to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Followers,
    Follows,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Followers => "followers",
            Direction::Follows => "follows",
        }
    }

    /// Edge between `actor` and a listed `neighbor`.
    pub fn edge(&self, actor: &str, neighbor: &str, indexed_at: i64) -> Edge {
        let (source, target) = match self {
            Direction::Followers => (neighbor, actor),
            Direction::Follows => (actor, neighbor),
        };
        Edge {
            source: source.to_string(),
            target: target.to_string(),
            uri: None,
            created_at: None,
            indexed_at,
        }
    }
}

/// One page of a paginated neighbor listing.
#[derive(Debug, Clone, Default)]
pub struct NeighborPage {
    pub items: Vec<ActorProfile>,
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_edges() {
        let e = Direction::Followers.edge("did:plc:a", "did:plc:b", 0);
        assert_eq!((e.source.as_str(), e.target.as_str()), ("did:plc:b", "did:plc:a"));

        let e = Direction::Follows.edge("did:plc:a", "did:plc:b", 0);
        assert_eq!((e.source.as_str(), e.target.as_str()), ("did:plc:a", "did:plc:b"));
    }

    #[test]
    fn test_profile_deserializes_camel_case() {
        let json = r#"{"did":"did:plc:a","handle":"a.test","followersCount":12,"followsCount":3}"#;
        let profile: ActorProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.followers_count, Some(12));
        assert_eq!(profile.posts_count, None);
    }
}
