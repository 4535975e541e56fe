//! Core domain model for SMOF: canonical listings, market references,
//! duplicate clusters, and the ranked report handed to renderers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smof-core";

/// Closed set of recognized authentication services. Anything a source
/// reports that is not in this set maps to `Unknown`, never to a trusted
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuthService {
    #[serde(rename = "PSA")]
    Psa,
    #[serde(rename = "JSA")]
    Jsa,
    #[serde(rename = "Beckett")]
    Beckett,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "unknown")]
    Unknown,
}

impl AuthService {
    pub const ALL: [AuthService; 5] = [
        AuthService::Psa,
        AuthService::Jsa,
        AuthService::Beckett,
        AuthService::None,
        AuthService::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthService::Psa => "PSA",
            AuthService::Jsa => "JSA",
            AuthService::Beckett => "Beckett",
            AuthService::None => "none",
            AuthService::Unknown => "unknown",
        }
    }
}

/// Market tier for a player: investment-grade items get a higher baseline
/// attention signal than general collection pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Investment,
    Collection,
}

/// Output partition. Membership is a pure function of the player, never of
/// the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityBucket {
    Priority,
    Collection,
}

/// One normalized marketplace offer. Built once by the normalizer and
/// immutable afterwards; scoring wraps it in a [`ScoredListing`] instead of
/// mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source_id: String,
    pub external_id: String,
    /// Canonical player key, `"unknown"` when no configured alias matched.
    pub player: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub auth_service: AuthService,
    pub auth_cert: Option<String>,
    /// Recognized inscription keywords, in configured priority order.
    pub inscription_tags: Vec<String>,
    pub listing_url: Option<String>,
    pub image_url: Option<String>,
    pub seen_at: DateTime<Utc>,
}

impl Listing {
    /// Stable identity of this listing within and across runs.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source_id, self.external_id)
    }
}

/// Reference price point for a player. Read-only for the lifetime of a run;
/// maintained outside the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketReference {
    pub player: String,
    pub baseline_price: f64,
    pub tier: Tier,
}

/// In-memory view over the configured market references, keyed by player.
#[derive(Debug, Clone, Default)]
pub struct MarketReferenceStore {
    by_player: BTreeMap<String, MarketReference>,
}

impl MarketReferenceStore {
    pub fn new(references: impl IntoIterator<Item = MarketReference>) -> Self {
        let by_player = references
            .into_iter()
            .map(|r| (r.player.clone(), r))
            .collect();
        Self { by_player }
    }

    /// A missing reference is a defined zero-signal case, not an error.
    pub fn lookup(&self, player: &str) -> Option<&MarketReference> {
        self.by_player.get(player)
    }

    pub fn len(&self) -> usize {
        self.by_player.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_player.is_empty()
    }
}

/// Weak grouping of listings believed to represent the same physical item.
/// Owns no listings; members are referenced by listing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub cluster_id: Uuid,
    /// Sorted listing keys, including any prior-run members.
    pub members: Vec<String>,
    /// Key of the lowest-priced current-run member; what gets scored and
    /// displayed downstream.
    pub representative: String,
    pub seen_in_prior_run: bool,
}

impl DuplicateCluster {
    /// Deterministic cluster id: UUIDv5 over the sorted member keys, so the
    /// same grouping always gets the same id.
    pub fn id_for_members(members: &[String]) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, members.join("\n").as_bytes())
    }
}

/// A listing plus its deterministic opportunity score and the per-criterion
/// weighted contributions that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredListing {
    pub listing: Listing,
    pub cluster_id: Uuid,
    pub score: f64,
    pub score_breakdown: BTreeMap<String, f64>,
    pub priority_bucket: PriorityBucket,
}

/// One recovered per-record failure, surfaced alongside the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub source_id: String,
    pub detail: String,
}

/// Read-only snapshot handed to renderers: both buckets sorted and capped,
/// plus the clusters and the recovered record errors for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub priority: Vec<ScoredListing>,
    pub collection: Vec<ScoredListing>,
    pub clusters: Vec<DuplicateCluster>,
    pub malformed_records: usize,
    pub record_errors: Vec<RecordError>,
}
