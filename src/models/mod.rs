use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier for a two-party conversation.
///
/// Derived from the unordered pair of participant ids; the same pair always
/// produces the same key regardless of argument order. Never stored as a
/// standalone entity - it is only ever a lookup/storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(pub String);

impl ThreadKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Thread is a one-to-one conversation between exactly two users.
/// Created on first contact; never deleted; participants fixed at creation.
/// The message list itself is owned by the messaging pipeline, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub key: ThreadKey,
    pub participants: [String; 2],
    pub created_at: DateTime<Utc>,
}

/// Result of a get-or-create lookup. `created` is true only for the single
/// call that actually won the conditional write.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadHandle {
    pub thread: Thread,
    pub created: bool,
}

/// The two binary relationships a user can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// actor likes a post
    Like,
    /// actor follows another user
    Follow,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Like => "like",
            RelationshipKind::Follow => "follow",
        }
    }

    /// Path of the single edge record for `(actor, target, kind)`.
    /// Existence of the record is the sole source of truth for the
    /// relationship; write-if-absent keeps it a set, not a list.
    pub fn edge_path(&self, target: &str, actor: &str) -> String {
        format!("edges/{}/{}/{}", self.as_str(), target, actor)
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The denormalized counters kept alongside the edge sets.
///
/// Each counter summarizes exactly one membership set and is repaired from
/// it on reconciliation; the set is authoritative, the counter is cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// how many users like a post
    Likes,
    /// how many users follow a user
    Followers,
    /// how many users a user follows
    Following,
}

impl CounterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Likes => "likes",
            CounterKind::Followers => "followers",
            CounterKind::Following => "following",
        }
    }

    pub fn counter_path(&self, owner: &str) -> String {
        format!("counters/{}/{}", self.as_str(), owner)
    }

    /// Prefix of the membership set this counter summarizes.
    pub fn edge_prefix(&self, owner: &str) -> String {
        match self {
            CounterKind::Likes => format!("edges/like/{}", owner),
            CounterKind::Followers => format!("edges/follow/{}", owner),
            CounterKind::Following => format!("edges/following/{}", owner),
        }
    }
}

/// Path of the mirror entry a follow writes under the actor's own set,
/// backing the actor's following count.
pub fn following_mirror_path(actor: &str, target: &str) -> String {
    format!("edges/following/{}/{}", actor, target)
}

/// A single membership entry in an edge set. `user` is the id on the far
/// end of the entry: the liker/follower in a target's set, the followee in
/// an actor's following set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub user: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a relationship as one client sees it: whether the edge
/// exists and the counter value that goes with it. Sent by the caller as
/// the observed pre-toggle state, returned confirmed after the toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipState {
    pub active: bool,
    pub counter: i64,
}

// Request/Response types for API

#[derive(Debug, Deserialize)]
pub struct ThreadKeyQuery {
    pub user_a: String,
    pub user_b: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenThreadRequest {
    pub other_user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub target_id: String,
    pub kind: CounterKind,
}

#[derive(Debug, Serialize)]
pub struct CorrectedCount {
    pub count: i64,
}

/// Follow state of a profile as the caller sees it: the profile's two
/// counters plus whether the caller follows them.
#[derive(Debug, Serialize)]
pub struct FollowOverview {
    pub followers: i64,
    pub following: i64,
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
