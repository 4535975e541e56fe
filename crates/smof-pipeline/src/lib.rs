//! The SMOF scan pipeline: normalize raw marketplace records into canonical
//! listings, cluster duplicate postings of the same physical item, score each
//! representative as a buying opportunity, and rank the results into the
//! report handed to renderers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use smof_adapters::{adapter_for_source, RawBatch, RawRecord};
use smof_core::{
    AuthService, DuplicateCluster, Listing, MarketReference, MarketReferenceStore, PriorityBucket,
    RankedReport, RecordError, ScoredListing, Tier,
};
use smof_storage::{FetcherConfig, MarketplaceFetcher, RawPayloadArchive, RunSnapshot, RunStore};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "smof-pipeline";

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Relative weights of the four scoring criteria. Must sum to exactly 1.0;
/// the pipeline refuses to renormalize on the caller's behalf.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScoreWeights {
    pub price: f64,
    pub authentication: f64,
    pub inscription: f64,
    pub tier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InscriptionKeyword {
    pub keyword: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DedupeTuning {
    /// Two certless listings only merge when their prices differ by at most
    /// this percentage of the higher price.
    pub price_band_pct: f64,
    /// Minimum Jaccard overlap of title tokens for a certless merge.
    pub title_overlap_threshold: f64,
}

/// Caps are parsed signed so a negative value is rejected by us with a real
/// message instead of a serde integer-range error.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BucketCaps {
    pub priority: i64,
    pub collection: i64,
}

impl BucketCaps {
    pub fn priority_cap(&self) -> usize {
        self.priority.max(0) as usize
    }

    pub fn collection_cap(&self) -> usize {
        self.collection.max(0) as usize
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub score_weights: ScoreWeights,
    pub auth_trust: BTreeMap<AuthService, f64>,
    /// Ordered: the first matching player wins during resolution.
    pub players: Vec<PlayerConfig>,
    #[serde(default)]
    pub priority_players: BTreeSet<String>,
    /// Ordered: tags are recorded in this priority order.
    pub inscription_priority: Vec<InscriptionKeyword>,
    pub dedupe: DedupeTuning,
    pub bucket_caps: BucketCaps,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl PipelineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast, before any scraping or scoring work begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.score_weights;
        for (name, value) in [
            ("price", w.price),
            ("authentication", w.authentication),
            ("inscription", w.inscription),
            ("tier", w.tier),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "score_weights.{name} must be a non-negative finite number, got {value}"
                )));
            }
        }
        let sum = w.price + w.authentication + w.inscription + w.tier;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::Invalid(format!(
                "score_weights must sum to 1.0, got {sum}"
            )));
        }

        for service in AuthService::ALL {
            match self.auth_trust.get(&service) {
                Some(trust) if (0.0..=1.0).contains(trust) => {}
                Some(trust) => {
                    return Err(ConfigError::Invalid(format!(
                        "auth_trust.{} must be within [0, 1], got {trust}",
                        service.as_str()
                    )))
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "auth_trust is missing an entry for `{}`",
                        service.as_str()
                    )))
                }
            }
        }

        for player in &self.players {
            if player.name.trim().is_empty() {
                return Err(ConfigError::Invalid("players entries need a name".into()));
            }
        }

        for entry in &self.inscription_priority {
            if entry.keyword.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "inscription_priority entries need a keyword".into(),
                ));
            }
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "inscription weight for `{}` must be non-negative, got {}",
                    entry.keyword, entry.weight
                )));
            }
        }

        if !self.dedupe.price_band_pct.is_finite() || self.dedupe.price_band_pct < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "dedupe.price_band_pct must be non-negative, got {}",
                self.dedupe.price_band_pct
            )));
        }
        if !(0.0..=1.0).contains(&self.dedupe.title_overlap_threshold) {
            return Err(ConfigError::Invalid(format!(
                "dedupe.title_overlap_threshold must be within [0, 1], got {}",
                self.dedupe.title_overlap_threshold
            )));
        }

        if self.bucket_caps.priority < 0 || self.bucket_caps.collection < 0 {
            return Err(ConfigError::Invalid(format!(
                "bucket_caps must be non-negative, got priority={} collection={}",
                self.bucket_caps.priority, self.bucket_caps.collection
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MarketFile {
    references: Vec<MarketReference>,
}

/// Load the read-only market reference store. Maintained outside the
/// pipeline; a run never writes it back.
pub fn load_market_references(path: impl AsRef<Path>) -> Result<MarketReferenceStore, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: MarketFile = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for reference in &file.references {
        if !reference.baseline_price.is_finite() || reference.baseline_price < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "baseline_price for `{}` must be non-negative, got {}",
                reference.player, reference.baseline_price
            )));
        }
    }
    Ok(MarketReferenceStore::new(file.references))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Fixture,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub fixture_path: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Normalizer

/// One bad input record. Recovered locally: the record is skipped and the
/// failure is collected into the run's error list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedListing {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable price `{0}`")]
    UnparseablePrice(String),
    #[error("duplicate external_id `{0}` within batch")]
    DuplicateInBatch(String),
}

fn raw_str(record: &RawRecord, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Strip currency symbols, commas and whitespace; ranges like "450 to 500"
/// collapse to their low end.
fn parse_price_text(text: &str) -> Option<f64> {
    let low_end = text.split(" to ").next().unwrap_or(text);
    let cleaned: String = low_end
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0)
}

fn parse_price(record: &RawRecord) -> Result<f64, MalformedListing> {
    match record.get("price") {
        None => Err(MalformedListing::MissingField("price")),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .filter(|p| p.is_finite() && *p >= 0.0)
            .ok_or_else(|| MalformedListing::UnparseablePrice(n.to_string())),
        Some(JsonValue::String(s)) => {
            if s.trim().is_empty() {
                return Err(MalformedListing::MissingField("price"));
            }
            parse_price_text(s).ok_or_else(|| MalformedListing::UnparseablePrice(s.clone()))
        }
        Some(other) => Err(MalformedListing::UnparseablePrice(other.to_string())),
    }
}

/// First configured player whose name or alias appears in the haystack wins.
/// Deterministic by construction: configuration order, not match quality.
fn resolve_player(config: &PipelineConfig, haystack: &str) -> String {
    let haystack = haystack.to_lowercase();
    for player in &config.players {
        let mut needles = std::iter::once(player.name.as_str()).chain(player.aliases.iter().map(String::as_str));
        if needles.any(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase())) {
            return player.name.clone();
        }
    }
    "unknown".to_string()
}

fn parse_auth_service(value: &str) -> AuthService {
    let value = value.trim();
    if value.eq_ignore_ascii_case("psa") {
        AuthService::Psa
    } else if value.eq_ignore_ascii_case("jsa") {
        AuthService::Jsa
    } else if value.eq_ignore_ascii_case("beckett") || value.eq_ignore_ascii_case("bas") {
        AuthService::Beckett
    } else if value.is_empty() {
        AuthService::None
    } else {
        // An unrecognized service is suspicious, not absent.
        AuthService::Unknown
    }
}

fn detect_auth_service(text: &str) -> AuthService {
    let text = text.to_lowercase();
    if text.contains("psa") {
        AuthService::Psa
    } else if text.contains("jsa") || text.contains("james spence") {
        AuthService::Jsa
    } else if text.contains("beckett") || text.contains("bas ") {
        AuthService::Beckett
    } else {
        AuthService::None
    }
}

/// Map one raw scraped record into the canonical listing shape. Pure: no
/// network, no storage, no clock besides the provided `seen_at`.
pub fn normalize(
    record: &RawRecord,
    source_id: &str,
    seen_at: DateTime<Utc>,
    config: &PipelineConfig,
) -> Result<Listing, MalformedListing> {
    let external_id = raw_str(record, "external_id")
        .ok_or(MalformedListing::MissingField("external_id"))?;
    let title = raw_str(record, "title").ok_or(MalformedListing::MissingField("title"))?;
    let price = parse_price(record)?;

    let description = raw_str(record, "description").unwrap_or_default();
    let text = format!("{title} {description}");

    let player = match raw_str(record, "player") {
        Some(hint) => resolve_player(config, &hint),
        None => resolve_player(config, &text),
    };

    let auth_service = match raw_str(record, "auth_service") {
        Some(service) => parse_auth_service(&service),
        None => detect_auth_service(&text),
    };
    let auth_cert = raw_str(record, "auth_cert").or_else(|| raw_str(record, "cert_number"));

    let lowered = text.to_lowercase();
    let mut inscription_tags = Vec::new();
    for entry in &config.inscription_priority {
        if lowered.contains(&entry.keyword.to_lowercase())
            && !inscription_tags.contains(&entry.keyword)
        {
            inscription_tags.push(entry.keyword.clone());
        }
    }

    Ok(Listing {
        source_id: source_id.to_string(),
        external_id,
        player,
        title,
        description,
        price,
        currency: config.currency.clone(),
        auth_service,
        auth_cert,
        inscription_tags,
        listing_url: raw_str(record, "listing_url"),
        image_url: raw_str(record, "image_url"),
        seen_at,
    })
}

/// Normalize every batch, enforcing `(source_id, external_id)` uniqueness
/// across the whole run input. Bad records never abort the run; they are
/// logged, skipped, and surfaced in the returned error list.
pub fn normalize_batches(
    batches: &[RawBatch],
    config: &PipelineConfig,
) -> (Vec<Listing>, Vec<RecordError>) {
    let mut listings = Vec::new();
    let mut errors = Vec::new();
    let mut seen_keys = BTreeSet::new();

    for batch in batches {
        for record in &batch.records {
            match normalize(record, &batch.source_id, batch.fetched_at, config) {
                Ok(listing) => {
                    if seen_keys.insert(listing.key()) {
                        listings.push(listing);
                    } else {
                        let err = MalformedListing::DuplicateInBatch(listing.external_id.clone());
                        warn!(source_id = %batch.source_id, %err, "skipping duplicate record");
                        errors.push(RecordError {
                            source_id: batch.source_id.clone(),
                            detail: err.to_string(),
                        });
                    }
                }
                Err(err) => {
                    warn!(source_id = %batch.source_id, %err, "skipping malformed record");
                    errors.push(RecordError {
                        source_id: batch.source_id.clone(),
                        detail: err.to_string(),
                    });
                }
            }
        }
    }

    (listings, errors)
}

// ---------------------------------------------------------------------------
// Deduplicator

fn title_tokens(title: &str) -> BTreeSet<String> {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

fn title_jaccard(a: &str, b: &str) -> f64 {
    let ta = title_tokens(a);
    let tb = title_tokens(b);
    let union = ta.union(&tb).count();
    if union == 0 {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    intersection as f64 / union as f64
}

fn within_price_band(a: f64, b: f64, band_pct: f64) -> bool {
    let high = a.max(b);
    if high <= 0.0 {
        return true;
    }
    (a - b).abs() <= high * band_pct / 100.0
}

fn certless_similar(a: &Listing, b: &Listing, tuning: &DedupeTuning) -> bool {
    a.player == b.player
        && within_price_band(a.price, b.price, tuning.price_band_pct)
        && title_jaccard(&a.title, &b.title) >= tuning.title_overlap_threshold
}

struct Member<'a> {
    listing: &'a Listing,
    is_current: bool,
}

/// Cluster current-run listings against each other and against the prior
/// run's listings.
///
/// Policy: a shared non-empty `auth_cert` (per player) is authoritative
/// identity and always merges, price differences included. Cert-bearing
/// listings never merge via the similarity fallback. Certless listings merge
/// single-link when player, price band, and title token overlap all agree;
/// when several clusters qualify, one spanning another source is preferred.
/// Same-source merges use the identical policy. Unmatched listings become
/// singleton clusters.
pub fn dedupe(
    current: &[Listing],
    prior: &[Listing],
    tuning: &DedupeTuning,
) -> Vec<DuplicateCluster> {
    let mut members: Vec<Member<'_>> = current
        .iter()
        .map(|listing| Member {
            listing,
            is_current: true,
        })
        .collect();
    members.extend(prior.iter().map(|listing| Member {
        listing,
        is_current: false,
    }));

    // Deterministic iteration order for the greedy similarity pass.
    let mut order: Vec<usize> = (0..members.len()).collect();
    order.sort_by(|&a, &b| {
        let (la, lb) = (members[a].listing, members[b].listing);
        la.seen_at
            .cmp(&lb.seen_at)
            .then_with(|| la.key().cmp(&lb.key()))
    });

    let mut groups: Vec<Vec<usize>> = Vec::new();

    // Pass 1: certificate identity.
    let mut cert_groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for &idx in &order {
        let listing = members[idx].listing;
        if let Some(cert) = listing.auth_cert.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            cert_groups
                .entry((listing.player.clone(), cert.to_string()))
                .or_default()
                .push(idx);
        }
    }
    groups.extend(cert_groups.into_values());

    // Pass 2: similarity fallback for certless listings only.
    let mut certless_groups: Vec<Vec<usize>> = Vec::new();
    for &idx in &order {
        let listing = members[idx].listing;
        if listing
            .auth_cert
            .as_deref()
            .map(str::trim)
            .is_some_and(|c| !c.is_empty())
        {
            continue;
        }

        let candidates: Vec<usize> = certless_groups
            .iter()
            .enumerate()
            .filter(|(_, group)| {
                group
                    .iter()
                    .any(|&m| certless_similar(listing, members[m].listing, tuning))
            })
            .map(|(pos, _)| pos)
            .collect();

        // Cross-source candidates win ties over same-source ones.
        let chosen = candidates
            .iter()
            .copied()
            .find(|&pos| {
                certless_groups[pos]
                    .iter()
                    .any(|&m| members[m].listing.source_id != listing.source_id)
            })
            .or_else(|| candidates.first().copied());

        match chosen {
            Some(pos) => certless_groups[pos].push(idx),
            None => certless_groups.push(vec![idx]),
        }
    }
    groups.extend(certless_groups);

    let mut clusters = Vec::new();
    for group in groups {
        let current_members: Vec<&Listing> = group
            .iter()
            .filter(|&&idx| members[idx].is_current)
            .map(|&idx| members[idx].listing)
            .collect();
        // Clusters made only of prior-run listings carry nothing to score.
        if current_members.is_empty() {
            continue;
        }

        let mut keys: Vec<String> = group.iter().map(|&idx| members[idx].listing.key()).collect();
        keys.sort();
        keys.dedup();

        let Some(representative) = current_members
            .iter()
            .min_by(|a, b| {
                a.price
                    .total_cmp(&b.price)
                    .then_with(|| a.seen_at.cmp(&b.seen_at))
                    .then_with(|| a.key().cmp(&b.key()))
            })
            .map(|l| l.key())
        else {
            continue;
        };

        let seen_in_prior_run = group.iter().any(|&idx| !members[idx].is_current);

        clusters.push(DuplicateCluster {
            cluster_id: DuplicateCluster::id_for_members(&keys),
            members: keys,
            representative,
            seen_in_prior_run,
        });
    }

    clusters.sort_by(|a, b| a.representative.cmp(&b.representative));
    clusters
}

// ---------------------------------------------------------------------------
// Opportunity scorer

/// A plausible certificate number: 6 to 12 alphanumeric characters with at
/// least one digit. Anything else present on a listing is demoted to
/// `unknown` trust, never to `none`.
fn cert_format_is_valid(cert: &str) -> bool {
    let len = cert.chars().count();
    (6..=12).contains(&len)
        && cert.chars().all(|c| c.is_ascii_alphanumeric())
        && cert.chars().any(|c| c.is_ascii_digit())
}

fn price_signal(listing: &Listing, market: &MarketReferenceStore) -> f64 {
    // No baseline never fabricates a discount.
    let Some(reference) = market.lookup(&listing.player) else {
        return 0.0;
    };
    if reference.baseline_price <= 0.0 {
        return 0.0;
    }
    ((reference.baseline_price - listing.price) / reference.baseline_price).clamp(0.0, 1.0)
}

fn authentication_signal(listing: &Listing, config: &PipelineConfig) -> f64 {
    let effective = match listing.auth_cert.as_deref() {
        Some(cert) if !cert_format_is_valid(cert) => AuthService::Unknown,
        _ => listing.auth_service,
    };
    config.auth_trust.get(&effective).copied().unwrap_or(0.0)
}

fn inscription_signal(listing: &Listing, config: &PipelineConfig) -> f64 {
    let total: f64 = config
        .inscription_priority
        .iter()
        .filter(|entry| listing.inscription_tags.contains(&entry.keyword))
        .map(|entry| entry.weight)
        .sum();
    // One marquee inscription is allowed to saturate the signal.
    total.clamp(0.0, 1.0)
}

fn tier_signal(listing: &Listing, market: &MarketReferenceStore) -> f64 {
    match market.lookup(&listing.player).map(|r| r.tier) {
        Some(Tier::Investment) => 1.0,
        Some(Tier::Collection) => 0.5,
        None => 0.0,
    }
}

/// Score one listing. Every sub-signal is normalized to [0, 1] before
/// weighting so the breakdown stays interpretable, and the result is
/// bit-for-bit reproducible for identical inputs and configuration.
pub fn score_listing(
    listing: &Listing,
    cluster: &DuplicateCluster,
    market: &MarketReferenceStore,
    config: &PipelineConfig,
) -> ScoredListing {
    let weights = &config.score_weights;
    let mut score_breakdown = BTreeMap::new();
    score_breakdown.insert("price".to_string(), weights.price * price_signal(listing, market));
    score_breakdown.insert(
        "authentication".to_string(),
        weights.authentication * authentication_signal(listing, config),
    );
    score_breakdown.insert(
        "inscription".to_string(),
        weights.inscription * inscription_signal(listing, config),
    );
    score_breakdown.insert("tier".to_string(), weights.tier * tier_signal(listing, market));

    let score = score_breakdown.values().sum();
    let priority_bucket = if config.priority_players.contains(&listing.player) {
        PriorityBucket::Priority
    } else {
        PriorityBucket::Collection
    };

    ScoredListing {
        listing: listing.clone(),
        cluster_id: cluster.cluster_id,
        score,
        score_breakdown,
        priority_bucket,
    }
}

// ---------------------------------------------------------------------------
// Ranker / aggregator

/// Sort, bucket, and cap the scored listings into the final report.
/// Ordering: score descending, then lower price, then earlier `seen_at`,
/// then listing key -- a total order, so ranking is reproducible. Caps are
/// applied after sorting so truncation always keeps the highest-scored items.
pub fn rank(
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    mut scored: Vec<ScoredListing>,
    clusters: Vec<DuplicateCluster>,
    record_errors: Vec<RecordError>,
    config: &PipelineConfig,
) -> RankedReport {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.listing.price.total_cmp(&b.listing.price))
            .then_with(|| a.listing.seen_at.cmp(&b.listing.seen_at))
            .then_with(|| a.listing.key().cmp(&b.listing.key()))
    });

    let mut priority = Vec::new();
    let mut collection = Vec::new();
    for item in scored {
        match item.priority_bucket {
            PriorityBucket::Priority => priority.push(item),
            PriorityBucket::Collection => collection.push(item),
        }
    }
    priority.truncate(config.bucket_caps.priority_cap());
    collection.truncate(config.bucket_caps.collection_cap());

    RankedReport {
        run_id,
        generated_at,
        priority,
        collection,
        clusters,
        malformed_records: record_errors.len(),
        record_errors,
    }
}

// ---------------------------------------------------------------------------
// Run orchestration

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub scan_cron_1: String,
    pub scan_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl RunSettings {
    pub fn from_env() -> Self {
        let workspace_root = PathBuf::from(".");
        Self {
            data_dir: std::env::var("SMOF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data")),
            scheduler_enabled: std::env::var("SMOF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scan_cron_1: std::env::var("SCAN_CRON_1").unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            scan_cron_2: std::env::var("SCAN_CRON_2").unwrap_or_else(|_| "0 0 19 * * *".to_string()),
            user_agent: std::env::var("SMOF_USER_AGENT")
                .unwrap_or_else(|_| "smof-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("SMOF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            workspace_root,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned_sources: usize,
    pub raw_records: usize,
    pub listings: usize,
    pub clusters: usize,
    pub duplicates_suppressed: usize,
    pub malformed_records: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
struct ParquetManifest {
    schema_version: u32,
    files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
struct ParquetManifestFile {
    name: String,
    path: String,
    sha256: String,
    bytes: u64,
}

pub struct ScanPipeline {
    settings: RunSettings,
    config: PipelineConfig,
    market: MarketReferenceStore,
    registry: SourceRegistry,
    archive: RawPayloadArchive,
    run_store: RunStore,
    http: MarketplaceFetcher,
}

impl ScanPipeline {
    /// Load and validate everything up front; configuration problems abort
    /// here, before any data is touched.
    pub fn from_workspace(settings: RunSettings) -> Result<Self> {
        let config = PipelineConfig::from_path(settings.workspace_root.join("config.yaml"))?;
        let market = load_market_references(settings.workspace_root.join("market.yaml"))?;
        let registry = SourceRegistry::from_path(settings.workspace_root.join("sources.yaml"))?;

        let archive = RawPayloadArchive::new(settings.data_dir.join("artifacts"));
        let run_store = RunStore::new(settings.data_dir.join("runs"));
        let http = MarketplaceFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(settings.http_timeout_secs),
            user_agent: Some(settings.user_agent.clone()),
            ..Default::default()
        })?;

        Ok(Self {
            settings,
            config,
            market,
            registry,
            archive,
            run_store,
            http,
        })
    }

    pub async fn run_once(&self) -> Result<ScanRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let enabled_sources: Vec<&SourceConfig> =
            self.registry.sources.iter().filter(|s| s.enabled).collect();

        let mut batches = Vec::new();
        let mut source_errors = Vec::new();
        let mut raw_records = 0usize;
        for source in &enabled_sources {
            match self.collect_source(run_id, started_at, source).await {
                Ok(batch) => {
                    raw_records += batch.records.len();
                    batches.push(batch);
                }
                // A failed source never fails the run; it is reported
                // alongside the results from the sources that worked.
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %format!("{err:#}"), "source scan failed");
                    source_errors.push(RecordError {
                        source_id: source.source_id.clone(),
                        detail: format!("source scan failed: {err:#}"),
                    });
                }
            }
        }

        let (listings, mut record_errors) = normalize_batches(&batches, &self.config);
        let mut all_errors = source_errors;
        all_errors.append(&mut record_errors);

        let prior_listings = self
            .run_store
            .load_prior_run()
            .await?
            .map(|prior| prior.snapshot.listings)
            .unwrap_or_default();

        let clusters = dedupe(&listings, &prior_listings, &self.config.dedupe);

        let by_key: BTreeMap<String, &Listing> =
            listings.iter().map(|l| (l.key(), l)).collect();
        let scored: Vec<ScoredListing> = clusters
            .iter()
            .filter_map(|cluster| {
                by_key
                    .get(&cluster.representative)
                    .map(|listing| score_listing(listing, cluster, &self.market, &self.config))
            })
            .collect();
        let duplicates_suppressed = listings.len().saturating_sub(scored.len());

        let finished_at = Utc::now();
        let report = rank(
            run_id,
            finished_at,
            scored,
            clusters,
            all_errors,
            &self.config,
        );

        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, &report)
            .await?;
        let manifest_path = self
            .export_parquet_snapshots(&reports_dir, &enabled_sources, &report)
            .await?;

        self.run_store
            .persist_run(&RunSnapshot {
                run_id,
                started_at,
                listings: listings.clone(),
            })
            .await?;

        Ok(ScanRunSummary {
            run_id,
            started_at,
            finished_at,
            scanned_sources: enabled_sources.len(),
            raw_records,
            listings: listings.len(),
            clusters: report.clusters.len(),
            duplicates_suppressed,
            malformed_records: report.malformed_records,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn collect_source(
        &self,
        run_id: Uuid,
        fetched_at: DateTime<Utc>,
        source: &SourceConfig,
    ) -> Result<RawBatch> {
        let adapter = adapter_for_source(&source.source_id)
            .with_context(|| format!("no adapter registered for {}", source.source_id))?;

        let payloads: Vec<Vec<u8>> = match source.mode {
            SourceMode::Fixture => {
                let relative = source.fixture_path.as_deref().with_context(|| {
                    format!("source {} is in fixture mode but has no fixture_path", source.source_id)
                })?;
                let path = self.settings.workspace_root.join(relative);
                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("reading fixture {}", path.display()))?;
                vec![bytes]
            }
            SourceMode::Live => {
                let players: Vec<String> =
                    self.config.players.iter().map(|p| p.name.clone()).collect();
                let urls = adapter.search_urls(&players);
                adapter
                    .fetch(&self.http, run_id, &urls)
                    .await
                    .map_err(anyhow::Error::from)
                    .with_context(|| format!("fetching {}", source.source_id))?
                    .into_iter()
                    .map(|page| page.body)
                    .collect()
            }
        };

        let mut records = Vec::new();
        for payload in &payloads {
            self.archive
                .store(&source.source_id, fetched_at, adapter.payload_extension(), payload)
                .await?;
            records.extend(
                adapter
                    .parse(payload)
                    .map_err(anyhow::Error::from)
                    .with_context(|| format!("parsing {} payload", source.source_id))?,
            );
        }

        Ok(RawBatch {
            source_id: source.source_id.clone(),
            fetched_at,
            records,
        })
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        report: &RankedReport,
    ) -> Result<PathBuf> {
        let reports_dir = self
            .settings
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let brief = daily_brief_markdown(started_at, finished_at, report);
        fs::write(reports_dir.join("daily_brief.md"), brief)
            .await
            .context("writing daily_brief.md")?;

        let report_json = serde_json::to_vec_pretty(report).context("serializing ranked report")?;
        fs::write(reports_dir.join("ranked_report.json"), report_json)
            .await
            .context("writing ranked_report.json")?;

        Ok(reports_dir)
    }

    async fn export_parquet_snapshots(
        &self,
        reports_dir: &Path,
        enabled_sources: &[&SourceConfig],
        report: &RankedReport,
    ) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let listings_path = snapshot_dir.join("listings.parquet");
        let clusters_path = snapshot_dir.join("clusters.parquet");
        let sources_path = snapshot_dir.join("sources.parquet");

        write_listings_parquet(&listings_path, report)?;
        write_clusters_parquet(&clusters_path, &report.clusters)?;
        write_sources_parquet(&sources_path, enabled_sources)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("listings", reports_dir, &listings_path)?,
                manifest_entry("clusters", reports_dir, &clusters_path)?,
                manifest_entry("sources", reports_dir, &sources_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        Ok(manifest_path)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.settings.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.settings.scan_cron_1, &self.settings.scan_cron_2] {
            let job = Job::new_async(cron.as_str(), |_uuid, _l| {
                Box::pin(async move {
                    match run_scan_once_from_env().await {
                        Ok(summary) => {
                            tracing::info!(run_id = %summary.run_id, "scheduled scan complete")
                        }
                        Err(err) => {
                            warn!(error = %format!("{err:#}"), "scheduled scan failed")
                        }
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_scan_once_from_env() -> Result<ScanRunSummary> {
    let settings = RunSettings::from_env();
    let pipeline = ScanPipeline::from_workspace(settings)?;
    pipeline.run_once().await
}

fn daily_brief_markdown(
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    report: &RankedReport,
) -> String {
    let mut lines = vec![
        "# SMOF Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {started_at}"),
        format!("- Finished: {finished_at}"),
        format!("- Priority finds: {}", report.priority.len()),
        format!("- Collection finds: {}", report.collection.len()),
        format!("- Clusters: {}", report.clusters.len()),
        format!("- Skipped/malformed records: {}", report.malformed_records),
        String::new(),
    ];

    for (heading, items) in [
        ("## Priority Targets", &report.priority),
        ("## Collection Watch", &report.collection),
    ] {
        lines.push(heading.to_string());
        if items.is_empty() {
            lines.push("- none".to_string());
        }
        for item in items {
            lines.push(format!(
                "- [{:.2}] {} - {} (${:.2}, {})",
                item.score,
                item.listing.player,
                item.listing.title,
                item.listing.price,
                item.listing.source_id,
            ));
        }
        lines.push(String::new());
    }

    if !report.record_errors.is_empty() {
        lines.push("## Skipped Records".to_string());
        for err in &report.record_errors {
            lines.push(format!("- {}: {}", err.source_id, err.detail));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Markdown digest over the most recent run reports, for `smof-cli report`.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# SMOF Recent Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("ranked_report.json");
        let report: RankedReport = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- priority finds: {}", report.priority.len()));
        lines.push(format!("- collection finds: {}", report.collection.len()));
        lines.push(format!("- skipped records: {}", report.malformed_records));
        if let Some(top) = report.priority.first() {
            lines.push(format!(
                "- top find: [{:.2}] {} (${:.2})",
                top.score, top.listing.title, top.listing.price
            ));
        }
        if dir.path().join("snapshots/manifest.json").exists() {
            lines.push(format!(
                "- parquet manifest: `{}`",
                dir.path().join("snapshots/manifest.json").display()
            ));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Parquet export

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, report: &RankedReport) -> Result<()> {
    let items: Vec<&ScoredListing> = report
        .priority
        .iter()
        .chain(report.collection.iter())
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("player", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("auth_service", DataType::Utf8, false),
        ArrowField::new("cluster_id", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("bucket", DataType::Utf8, false),
    ]));

    let source_ids = StringArray::from(
        items.iter().map(|s| Some(s.listing.source_id.as_str())).collect::<Vec<_>>(),
    );
    let external_ids = StringArray::from(
        items.iter().map(|s| Some(s.listing.external_id.as_str())).collect::<Vec<_>>(),
    );
    let players = StringArray::from(
        items.iter().map(|s| Some(s.listing.player.as_str())).collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        items.iter().map(|s| Some(s.listing.title.as_str())).collect::<Vec<_>>(),
    );
    let prices = Float64Array::from(items.iter().map(|s| s.listing.price).collect::<Vec<_>>());
    let auth_services = StringArray::from(
        items.iter().map(|s| Some(s.listing.auth_service.as_str())).collect::<Vec<_>>(),
    );
    let cluster_ids = StringArray::from(
        items.iter().map(|s| Some(s.cluster_id.to_string())).collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(items.iter().map(|s| s.score).collect::<Vec<_>>());
    let buckets = StringArray::from(
        items
            .iter()
            .map(|s| {
                Some(match s.priority_bucket {
                    PriorityBucket::Priority => "priority",
                    PriorityBucket::Collection => "collection",
                })
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(external_ids),
            Arc::new(players),
            Arc::new(titles),
            Arc::new(prices),
            Arc::new(auth_services),
            Arc::new(cluster_ids),
            Arc::new(scores),
            Arc::new(buckets),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_clusters_parquet(path: &Path, clusters: &[DuplicateCluster]) -> Result<()> {
    let rows: Vec<(String, String, bool, bool)> = clusters
        .iter()
        .flat_map(|cluster| {
            cluster.members.iter().map(|member| {
                (
                    cluster.cluster_id.to_string(),
                    member.clone(),
                    *member == cluster.representative,
                    cluster.seen_in_prior_run,
                )
            })
        })
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("cluster_id", DataType::Utf8, false),
        ArrowField::new("member_key", DataType::Utf8, false),
        ArrowField::new("is_representative", DataType::Boolean, false),
        ArrowField::new("seen_in_prior_run", DataType::Boolean, false),
    ]));

    let cluster_ids =
        StringArray::from(rows.iter().map(|(id, _, _, _)| Some(id.as_str())).collect::<Vec<_>>());
    let member_keys =
        StringArray::from(rows.iter().map(|(_, key, _, _)| Some(key.as_str())).collect::<Vec<_>>());
    let representatives =
        BooleanArray::from(rows.iter().map(|(_, _, rep, _)| *rep).collect::<Vec<_>>());
    let prior = BooleanArray::from(rows.iter().map(|(_, _, _, p)| *p).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(cluster_ids),
            Arc::new(member_keys),
            Arc::new(representatives),
            Arc::new(prior),
        ],
    )
    .context("building clusters record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, sources: &[&SourceConfig]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("enabled", DataType::Boolean, false),
        ArrowField::new("mode", DataType::Utf8, false),
    ]));

    let source_ids =
        StringArray::from(sources.iter().map(|s| Some(s.source_id.as_str())).collect::<Vec<_>>());
    let display_names = StringArray::from(
        sources.iter().map(|s| Some(s.display_name.as_str())).collect::<Vec<_>>(),
    );
    let enabled = BooleanArray::from(sources.iter().map(|s| s.enabled).collect::<Vec<_>>());
    let modes = StringArray::from(
        sources
            .iter()
            .map(|s| {
                Some(match s.mode {
                    SourceMode::Fixture => "fixture",
                    SourceMode::Live => "live",
                })
            })
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(display_names),
            Arc::new(enabled),
            Arc::new(modes),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_config() -> PipelineConfig {
        serde_yaml::from_str(
            r#"
            score_weights: { price: 0.5, authentication: 0.3, inscription: 0.1, tier: 0.1 }
            auth_trust: { PSA: 1.0, JSA: 0.9, Beckett: 0.9, none: 0.2, unknown: 0.35 }
            players:
              - name: Stephen Curry
                aliases: ["steph curry"]
              - name: Klay Thompson
              - name: Jerry Rice
              - name: Tiger Woods
            priority_players: ["Stephen Curry", "Jerry Rice"]
            inscription_priority:
              - { keyword: "finals mvp", weight: 1.0 }
              - { keyword: "night night", weight: 0.8 }
              - { keyword: "champ", weight: 0.4 }
            dedupe: { price_band_pct: 25.0, title_overlap_threshold: 0.5 }
            bucket_caps: { priority: 10, collection: 25 }
            "#,
        )
        .expect("test config parses")
    }

    fn seen(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 20, 9, minute, 0).single().unwrap()
    }

    fn record(fields: &[(&str, JsonValue)]) -> RawRecord {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn listing(source: &str, id: &str, player: &str, title: &str, price: f64) -> Listing {
        Listing {
            source_id: source.into(),
            external_id: id.into(),
            player: player.into(),
            title: title.into(),
            description: String::new(),
            price,
            currency: "USD".into(),
            auth_service: AuthService::None,
            auth_cert: None,
            inscription_tags: vec![],
            listing_url: None,
            image_url: None,
            seen_at: seen(0),
        }
    }

    fn with_cert(mut listing: Listing, service: AuthService, cert: &str) -> Listing {
        listing.auth_service = service;
        listing.auth_cert = Some(cert.into());
        listing
    }

    fn market_with(player: &str, baseline: f64, tier: Tier) -> MarketReferenceStore {
        MarketReferenceStore::new([MarketReference {
            player: player.into(),
            baseline_price: baseline,
            tier,
        }])
    }

    fn singleton_cluster(listing: &Listing) -> DuplicateCluster {
        let members = vec![listing.key()];
        DuplicateCluster {
            cluster_id: DuplicateCluster::id_for_members(&members),
            representative: listing.key(),
            members,
            seen_in_prior_run: false,
        }
    }

    // -- configuration ------------------------------------------------------

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = base_config();
        config.score_weights.price = 0.6;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn auth_trust_must_cover_every_service() {
        let mut config = base_config();
        config.auth_trust.remove(&AuthService::Unknown);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn negative_bucket_cap_is_rejected() {
        let mut config = base_config();
        config.bucket_caps.collection = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unrecognized_auth_service_key_fails_parsing() {
        let result: Result<PipelineConfig, _> = serde_yaml::from_str(
            r#"
            score_weights: { price: 0.5, authentication: 0.3, inscription: 0.1, tier: 0.1 }
            auth_trust: { PSA: 1.0, FANATICS: 0.8, JSA: 0.9, Beckett: 0.9, none: 0.2, unknown: 0.3 }
            players: []
            inscription_priority: []
            dedupe: { price_band_pct: 25.0, title_overlap_threshold: 0.5 }
            bucket_caps: { priority: 5, collection: 5 }
            "#,
        );
        assert!(result.is_err());
    }

    // -- normalizer ---------------------------------------------------------

    #[test]
    fn missing_price_is_malformed_and_nothing_else() {
        let config = base_config();
        let raw = record(&[
            ("external_id", JsonValue::String("1".into())),
            ("title", JsonValue::String("Stephen Curry signed photo".into())),
        ]);
        let err = normalize(&raw, "ebay", seen(0), &config).unwrap_err();
        assert_eq!(err, MalformedListing::MissingField("price"));
    }

    #[test]
    fn non_numeric_price_is_malformed() {
        let config = base_config();
        let raw = record(&[
            ("external_id", JsonValue::String("1".into())),
            ("title", JsonValue::String("anything".into())),
            ("price", JsonValue::String("Contact seller".into())),
        ]);
        let err = normalize(&raw, "ebay", seen(0), &config).unwrap_err();
        assert!(matches!(err, MalformedListing::UnparseablePrice(_)));
    }

    #[test]
    fn price_parsing_strips_symbols_and_takes_range_low_end() {
        let config = base_config();
        let raw = record(&[
            ("external_id", JsonValue::String("1".into())),
            ("title", JsonValue::String("Klay Thompson jersey".into())),
            ("price", JsonValue::String("$1,299.50 to $1,400.00".into())),
        ]);
        let listing = normalize(&raw, "ebay", seen(0), &config).unwrap();
        assert_eq!(listing.price, 1299.50);
    }

    #[test]
    fn player_resolution_first_configured_match_wins() {
        let config = base_config();
        // Both Curry and Thompson appear; Curry is configured first.
        let raw = record(&[
            ("external_id", JsonValue::String("1".into())),
            (
                "title",
                JsonValue::String("Steph Curry & Klay Thompson dual signed photo".into()),
            ),
            ("price", JsonValue::String("$300".into())),
        ]);
        let listing = normalize(&raw, "ebay", seen(0), &config).unwrap();
        assert_eq!(listing.player, "Stephen Curry");
    }

    #[test]
    fn unresolved_player_is_unknown() {
        let config = base_config();
        let raw = record(&[
            ("external_id", JsonValue::String("1".into())),
            ("title", JsonValue::String("Draymond Green signed ball".into())),
            ("price", JsonValue::String("$100".into())),
        ]);
        let listing = normalize(&raw, "ebay", seen(0), &config).unwrap();
        assert_eq!(listing.player, "unknown");
    }

    #[test]
    fn auth_service_detected_from_title_and_unrecognized_field_is_unknown() {
        let config = base_config();
        let from_title = record(&[
            ("external_id", JsonValue::String("1".into())),
            ("title", JsonValue::String("Jerry Rice signed ball PSA/DNA".into())),
            ("price", JsonValue::String("$100".into())),
        ]);
        assert_eq!(
            normalize(&from_title, "ebay", seen(0), &config).unwrap().auth_service,
            AuthService::Psa
        );

        let unrecognized = record(&[
            ("external_id", JsonValue::String("2".into())),
            ("title", JsonValue::String("Jerry Rice signed ball".into())),
            ("price", JsonValue::String("$100".into())),
            ("auth_service", JsonValue::String("Fanatics".into())),
        ]);
        assert_eq!(
            normalize(&unrecognized, "ebay", seen(0), &config).unwrap().auth_service,
            AuthService::Unknown
        );
    }

    #[test]
    fn inscription_tags_recorded_in_config_order() {
        let config = base_config();
        let raw = record(&[
            ("external_id", JsonValue::String("1".into())),
            (
                "title",
                JsonValue::String("Curry photo inscribed NBA Champ".into()),
            ),
            (
                "description",
                JsonValue::String("Also inscribed 2022 Finals MVP".into()),
            ),
            ("price", JsonValue::String("$100".into())),
        ]);
        let listing = normalize(&raw, "ebay", seen(0), &config).unwrap();
        assert_eq!(listing.inscription_tags, vec!["finals mvp", "champ"]);
    }

    #[test]
    fn duplicate_external_id_within_batch_is_an_error_not_an_overwrite() {
        let config = base_config();
        let make = |price: &str| {
            record(&[
                ("external_id", JsonValue::String("777".into())),
                ("title", JsonValue::String("Stephen Curry signed photo".into())),
                ("price", JsonValue::String(price.into())),
            ])
        };
        let batch = RawBatch {
            source_id: "ebay".into(),
            fetched_at: seen(0),
            records: vec![make("$100"), make("$250")],
        };
        let (listings, errors) = normalize_batches(&[batch], &config);
        assert_eq!(listings.len(), 1);
        // First record wins; the second is reported, not silently merged.
        assert_eq!(listings[0].price, 100.0);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].detail.contains("duplicate external_id"));
    }

    #[test]
    fn one_bad_record_never_poisons_the_batch() {
        let config = base_config();
        let batch = RawBatch {
            source_id: "ebay".into(),
            fetched_at: seen(0),
            records: vec![
                record(&[("title", JsonValue::String("no id, no price".into()))]),
                record(&[
                    ("external_id", JsonValue::String("1".into())),
                    ("title", JsonValue::String("Jerry Rice signed ball".into())),
                    ("price", JsonValue::String("$75".into())),
                ]),
            ],
        };
        let (listings, errors) = normalize_batches(&[batch], &config);
        assert_eq!(listings.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    // -- deduplicator -------------------------------------------------------

    #[test]
    fn matching_certs_merge_regardless_of_price() {
        let tuning = base_config().dedupe;
        let a = with_cert(
            listing("ebay", "1", "Stephen Curry", "Curry signed photo", 100.0),
            AuthService::Psa,
            "45120988",
        );
        let b = with_cert(
            listing("goldin", "2", "Stephen Curry", "completely different wording", 5000.0),
            AuthService::Psa,
            "45120988",
        );
        let clusters = dedupe(&[a, b], &[], &tuning);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members.len(), 2);
        // Cert equality wins over price noise; cheapest member represents.
        assert_eq!(clusters[0].representative, "ebay:1");
    }

    #[test]
    fn cert_bearing_listings_never_merge_by_similarity() {
        let tuning = base_config().dedupe;
        let a = with_cert(
            listing("ebay", "1", "Stephen Curry", "Curry signed 8x10 photo", 100.0),
            AuthService::Psa,
            "45120988",
        );
        let b = listing("goldin", "2", "Stephen Curry", "Curry signed 8x10 photo", 100.0);
        let clusters = dedupe(&[a, b], &[], &tuning);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn certless_listings_merge_on_player_price_and_title_overlap() {
        let tuning = base_config().dedupe;
        let a = listing("ebay", "1", "Jerry Rice", "Jerry Rice signed football 49ers", 200.0);
        let b = listing("goldin", "2", "Jerry Rice", "Jerry Rice 49ers signed football", 220.0);
        let clusters = dedupe(&[a, b], &[], &tuning);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec!["ebay:1", "goldin:2"]);
    }

    #[test]
    fn price_outside_band_prevents_certless_merge() {
        let tuning = base_config().dedupe;
        let a = listing("ebay", "1", "Jerry Rice", "Jerry Rice signed football", 200.0);
        let b = listing("goldin", "2", "Jerry Rice", "Jerry Rice signed football", 900.0);
        let clusters = dedupe(&[a, b], &[], &tuning);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn unmatched_listings_form_singletons_and_nothing_is_dropped() {
        let tuning = base_config().dedupe;
        let a = listing("ebay", "1", "Jerry Rice", "Jerry Rice signed football", 200.0);
        let b = listing("ebay", "2", "Tiger Woods", "Tiger Woods signed flag", 900.0);
        let clusters = dedupe(&[a, b], &[], &tuning);
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.members.len() == 1));
    }

    #[test]
    fn prior_run_members_flag_the_cluster_but_never_represent() {
        let tuning = base_config().dedupe;
        let current = listing("ebay", "9", "Jerry Rice", "Jerry Rice signed football", 250.0);
        // Cheaper copy from last run must not become the representative.
        let prior = listing("goldin", "8", "Jerry Rice", "Jerry Rice football signed", 210.0);
        let clusters = dedupe(&[current], &[prior], &tuning);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].seen_in_prior_run);
        assert_eq!(clusters[0].representative, "ebay:9");
        assert_eq!(clusters[0].members.len(), 2);
    }

    #[test]
    fn prior_only_groups_produce_no_cluster() {
        let tuning = base_config().dedupe;
        let prior = listing("ebay", "1", "Jerry Rice", "Jerry Rice signed football", 250.0);
        assert!(dedupe(&[], &[prior], &tuning).is_empty());
    }

    #[test]
    fn dedupe_is_deterministic_under_input_order() {
        let tuning = base_config().dedupe;
        let a = listing("ebay", "1", "Jerry Rice", "Jerry Rice signed football 49ers", 200.0);
        let b = listing("goldin", "2", "Jerry Rice", "Jerry Rice 49ers signed football", 210.0);
        let c = listing("ebay", "3", "Tiger Woods", "Tiger Woods signed flag", 900.0);
        let forward = dedupe(&[a.clone(), b.clone(), c.clone()], &[], &tuning);
        let backward = dedupe(&[c, b, a], &[], &tuning);
        assert_eq!(forward, backward);
    }

    // -- scorer -------------------------------------------------------------

    #[test]
    fn price_signal_is_zero_at_baseline() {
        let config = base_config();
        let market = market_with("Stephen Curry", 1000.0, Tier::Investment);
        let l = listing("ebay", "1", "Stephen Curry", "Curry photo", 1000.0);
        let cluster = singleton_cluster(&l);
        let scored = score_listing(&l, &cluster, &market, &config);
        assert_eq!(scored.score_breakdown["price"], 0.0);
    }

    #[test]
    fn price_signal_is_zero_without_market_reference() {
        let config = base_config();
        let market = MarketReferenceStore::default();
        let l = listing("ebay", "1", "Stephen Curry", "Curry photo", 5.0);
        let cluster = singleton_cluster(&l);
        let scored = score_listing(&l, &cluster, &market, &config);
        assert_eq!(scored.score_breakdown["price"], 0.0);
        assert!(scored.score >= 0.0);
    }

    #[test]
    fn overpriced_listing_never_scores_negative_price_signal() {
        let config = base_config();
        let market = market_with("Stephen Curry", 1000.0, Tier::Investment);
        let l = listing("ebay", "1", "Stephen Curry", "Curry photo", 2500.0);
        let cluster = singleton_cluster(&l);
        let scored = score_listing(&l, &cluster, &market, &config);
        assert_eq!(scored.score_breakdown["price"], 0.0);
    }

    #[test]
    fn malformed_cert_is_scored_as_unknown_not_none() {
        let config = base_config();
        let market = MarketReferenceStore::default();
        let l = with_cert(
            listing("ebay", "1", "Stephen Curry", "Curry photo", 100.0),
            AuthService::Psa,
            "##bad##",
        );
        let cluster = singleton_cluster(&l);
        let scored = score_listing(&l, &cluster, &market, &config);
        let expected = config.score_weights.authentication * config.auth_trust[&AuthService::Unknown];
        assert_eq!(scored.score_breakdown["authentication"], expected);
    }

    #[test]
    fn scoring_is_deterministic() {
        let config = base_config();
        let market = market_with("Stephen Curry", 1000.0, Tier::Investment);
        let mut l = listing("ebay", "1", "Stephen Curry", "Curry Finals MVP photo", 480.0);
        l.inscription_tags = vec!["finals mvp".to_string()];
        let cluster = singleton_cluster(&l);
        let first = score_listing(&l, &cluster, &market, &config);
        let second = score_listing(&l, &cluster, &market, &config);
        assert_eq!(first.score.to_bits(), second.score.to_bits());
        assert_eq!(first.score_breakdown, second.score_breakdown);
    }

    #[test]
    fn weighted_total_matches_hand_computed_scenario() {
        // price 500 vs baseline 1000 under weight 0.5 -> 0.25; PSA trust 1.0
        // under weight 0.3 -> 0.3; investment tier under weight 0.1 -> 0.1;
        // no inscriptions -> 0. Total 0.65.
        let config = base_config();
        let market = market_with("Stephen Curry", 1000.0, Tier::Investment);
        let l = with_cert(
            listing("ebay", "1", "Stephen Curry", "Curry signed photo", 500.0),
            AuthService::Psa,
            "12345678",
        );
        let cluster = singleton_cluster(&l);
        let scored = score_listing(&l, &cluster, &market, &config);
        assert!((scored.score - 0.65).abs() < 1e-12);
        assert!((scored.score_breakdown["price"] - 0.25).abs() < 1e-12);
        assert!((scored.score_breakdown["authentication"] - 0.3).abs() < 1e-12);
        assert!((scored.score_breakdown["tier"] - 0.1).abs() < 1e-12);
        assert_eq!(scored.score_breakdown["inscription"], 0.0);
    }

    #[test]
    fn single_marquee_inscription_saturates_the_signal() {
        let mut config = base_config();
        config.inscription_priority.push(InscriptionKeyword {
            keyword: "goat".into(),
            weight: 1.5,
        });
        let market = MarketReferenceStore::default();
        let mut l = listing("ebay", "1", "Stephen Curry", "Curry GOAT photo", 100.0);
        l.inscription_tags = vec!["goat".to_string()];
        let cluster = singleton_cluster(&l);
        let scored = score_listing(&l, &cluster, &market, &config);
        assert_eq!(
            scored.score_breakdown["inscription"],
            config.score_weights.inscription * 1.0
        );
    }

    // -- ranker -------------------------------------------------------------

    fn scored_for_rank(
        id: &str,
        player: &str,
        price: f64,
        minute: u32,
        score: f64,
        config: &PipelineConfig,
    ) -> ScoredListing {
        let mut l = listing("ebay", id, player, "t", price);
        l.seen_at = seen(minute);
        let cluster = singleton_cluster(&l);
        let mut s = score_listing(&l, &cluster, &MarketReferenceStore::default(), config);
        s.score = score;
        s
    }

    #[test]
    fn ties_break_by_lower_price_then_earlier_seen_at() {
        let config = base_config();
        let a = scored_for_rank("a", "unknown", 100.0, 5, 0.8, &config);
        let b = scored_for_rank("b", "unknown", 90.0, 9, 0.8, &config);
        let c = scored_for_rank("c", "unknown", 90.0, 1, 0.8, &config);
        let report = rank(
            Uuid::nil(),
            seen(30),
            vec![a, b, c],
            vec![],
            vec![],
            &config,
        );
        let ids: Vec<&str> = report
            .collection
            .iter()
            .map(|s| s.listing.external_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn bucket_cap_keeps_the_highest_scored_items() {
        let mut config = base_config();
        config.bucket_caps.priority = 5;
        let scored: Vec<ScoredListing> = (0..8)
            .map(|i| {
                scored_for_rank(
                    &format!("p{i}"),
                    "Stephen Curry",
                    100.0,
                    i as u32,
                    0.1 * (i as f64 + 1.0),
                    &config,
                )
            })
            .collect();
        let report = rank(Uuid::nil(), seen(30), scored, vec![], vec![], &config);
        assert_eq!(report.priority.len(), 5);
        let scores: Vec<f64> = report.priority.iter().map(|s| s.score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        // The cap keeps the five highest, dropping 0.1..0.3.
        assert!((scores[4] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn bucket_membership_is_a_function_of_player_not_score() {
        let config = base_config();
        let high_collection = scored_for_rank("x", "Klay Thompson", 50.0, 1, 0.99, &config);
        let low_priority = scored_for_rank("y", "Stephen Curry", 50.0, 1, 0.01, &config);
        let report = rank(
            Uuid::nil(),
            seen(30),
            vec![high_collection, low_priority],
            vec![],
            vec![],
            &config,
        );
        assert_eq!(report.priority.len(), 1);
        assert_eq!(report.priority[0].listing.player, "Stephen Curry");
        assert_eq!(report.collection.len(), 1);
    }

    #[test]
    fn report_carries_malformed_count_and_errors() {
        let config = base_config();
        let errors = vec![RecordError {
            source_id: "ebay".into(),
            detail: "missing required field `price`".into(),
        }];
        let report = rank(Uuid::nil(), seen(30), vec![], vec![], errors, &config);
        assert_eq!(report.malformed_records, 1);
        assert_eq!(report.record_errors.len(), 1);
    }
}
