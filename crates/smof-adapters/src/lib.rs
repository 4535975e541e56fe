//! Marketplace adapter contracts + the fixture-first eBay and Goldin adapters.
//!
//! Adapters turn one raw marketplace payload (HTML search results or a JSON
//! lot feed) into loose [`RawRecord`] maps. Everything stricter than that --
//! required fields, price parsing, player resolution -- happens in the
//! pipeline's normalizer, so a malformed record here is data, not an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use smof_storage::{FetchedPayload, MarketplaceFetcher};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "smof-adapters";

/// One raw scraped listing: free-form string keys to JSON scalars.
pub type RawRecord = BTreeMap<String, JsonValue>;

/// All records parsed from one source in one run, tagged with provenance.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// File extension used when archiving this adapter's raw payloads.
    fn payload_extension(&self) -> &'static str;

    /// Search URLs to crawl in live mode, one or more per tracked player.
    fn search_urls(&self, players: &[String]) -> Vec<String>;

    async fn fetch(
        &self,
        http: &MarketplaceFetcher,
        run_id: Uuid,
        urls: &[String],
    ) -> Result<Vec<FetchedPayload>, AdapterError>;

    fn parse(&self, payload: &[u8]) -> Result<Vec<RawRecord>, AdapterError>;
}

fn record_insert_str(record: &mut RawRecord, key: &str, value: Option<String>) {
    if let Some(value) = value {
        if !value.trim().is_empty() {
            record.insert(key.to_string(), JsonValue::String(value.trim().to_string()));
        }
    }
}

fn query_encode(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("+")
}

async fn fetch_all(
    adapter_source: &str,
    http: &MarketplaceFetcher,
    run_id: Uuid,
    urls: &[String],
) -> Result<Vec<FetchedPayload>, AdapterError> {
    let mut pages = Vec::with_capacity(urls.len());
    for url in urls {
        let page = http
            .fetch(run_id, adapter_source, url)
            .await
            .map_err(|e| AdapterError::Message(format!("fetching {url}: {e}")))?;
        pages.push(page);
    }
    Ok(pages)
}

/// eBay search-results scraper. Selector set follows the `s-item` card
/// markup of the public search page; placeholder cards titled "Shop on eBay"
/// carry no listing and are skipped.
#[derive(Debug, Clone, Copy)]
pub struct EbayAdapter;

impl EbayAdapter {
    fn selector(css: &str) -> Result<Selector, AdapterError> {
        Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
    }

    fn card_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
        card.select(selector)
            .next()
            .map(|n| n.text().collect::<String>())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn card_attr(card: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
        card.select(selector)
            .next()
            .and_then(|n| n.value().attr(attr))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Item id is the digit run following `/itm/` in the listing URL.
    fn item_id_from_url(url: &str) -> Option<String> {
        let (_, rest) = url.split_once("/itm/")?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            None
        } else {
            Some(digits)
        }
    }
}

#[async_trait]
impl MarketplaceAdapter for EbayAdapter {
    fn source_id(&self) -> &'static str {
        "ebay"
    }

    fn payload_extension(&self) -> &'static str {
        "html"
    }

    fn search_urls(&self, players: &[String]) -> Vec<String> {
        let mut urls = Vec::new();
        for player in players {
            let q = query_encode(player);
            for term in ["signed", "autographed"] {
                urls.push(format!(
                    "https://www.ebay.com/sch/i.html?_nkw={q}+{term}&_sop=12&LH_ItemCondition=3000&rt=nc"
                ));
            }
        }
        urls
    }

    async fn fetch(
        &self,
        http: &MarketplaceFetcher,
        run_id: Uuid,
        urls: &[String],
    ) -> Result<Vec<FetchedPayload>, AdapterError> {
        fetch_all(self.source_id(), http, run_id, urls).await
    }

    fn parse(&self, payload: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
        let html = std::str::from_utf8(payload)
            .map_err(|e| AdapterError::Message(format!("non-utf8 ebay payload: {e}")))?;
        let document = Html::parse_document(html);

        let card_sel = Self::selector("div.s-item__wrapper, li.s-item")?;
        let title_sel = Self::selector(".s-item__title")?;
        let price_sel = Self::selector(".s-item__price")?;
        let link_sel = Self::selector("a.s-item__link")?;
        let image_sel = Self::selector("img")?;

        let mut records = Vec::new();
        for card in document.select(&card_sel) {
            let Some(title) = Self::card_text(card, &title_sel) else {
                continue;
            };
            if title == "Shop on eBay" {
                continue;
            }

            let url = Self::card_attr(card, &link_sel, "href");
            let mut record = RawRecord::new();
            record_insert_str(&mut record, "title", Some(title));
            record_insert_str(&mut record, "price", Self::card_text(card, &price_sel));
            record_insert_str(
                &mut record,
                "external_id",
                url.as_deref().and_then(Self::item_id_from_url),
            );
            record_insert_str(&mut record, "listing_url", url);
            record_insert_str(&mut record, "image_url", Self::card_attr(card, &image_sel, "src"));
            records.push(record);
        }
        Ok(records)
    }
}

/// Goldin auction lot feed. The API returns a `lots` array of structured
/// objects, so most canonical fields map straight through.
#[derive(Debug, Clone, Copy)]
pub struct GoldinAdapter;

impl GoldinAdapter {
    fn lot_to_record(lot: &JsonValue) -> RawRecord {
        let mut record = RawRecord::new();

        let str_of = |path: &[&str]| -> Option<String> {
            let mut cur = lot;
            for segment in path {
                cur = cur.get(*segment)?;
            }
            cur.as_str().map(ToString::to_string)
        };

        record_insert_str(
            &mut record,
            "external_id",
            str_of(&["lot_id"]).or_else(|| lot.get("lot_id").map(|v| v.to_string())),
        );
        record_insert_str(&mut record, "title", str_of(&["headline"]));
        record_insert_str(&mut record, "description", str_of(&["details"]));
        record_insert_str(&mut record, "player", str_of(&["player"]));
        record_insert_str(&mut record, "auth_service", str_of(&["authentication", "service"]));
        record_insert_str(
            &mut record,
            "auth_cert",
            str_of(&["authentication", "cert_number"]),
        );
        record_insert_str(&mut record, "listing_url", str_of(&["url"]));
        record_insert_str(&mut record, "image_url", str_of(&["photo"]));

        if let Some(price) = lot.get("current_price") {
            match price {
                JsonValue::Number(_) => {
                    record.insert("price".to_string(), price.clone());
                }
                JsonValue::String(s) => record_insert_str(&mut record, "price", Some(s.clone())),
                _ => {}
            }
        }
        record
    }
}

#[async_trait]
impl MarketplaceAdapter for GoldinAdapter {
    fn source_id(&self) -> &'static str {
        "goldin"
    }

    fn payload_extension(&self) -> &'static str {
        "json"
    }

    fn search_urls(&self, players: &[String]) -> Vec<String> {
        players
            .iter()
            .map(|player| {
                format!(
                    "https://api.goldin.example/v1/lots?query={}&status=open",
                    query_encode(player)
                )
            })
            .collect()
    }

    async fn fetch(
        &self,
        http: &MarketplaceFetcher,
        run_id: Uuid,
        urls: &[String],
    ) -> Result<Vec<FetchedPayload>, AdapterError> {
        fetch_all(self.source_id(), http, run_id, urls).await
    }

    fn parse(&self, payload: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::Message(format!("invalid goldin payload: {e}")))?;
        let lots = value
            .get("lots")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::Message("goldin payload missing `lots` array".into()))?;
        Ok(lots.iter().map(Self::lot_to_record).collect())
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn MarketplaceAdapter>> {
    match source_id {
        "ebay" => Some(Box::new(EbayAdapter)),
        "goldin" => Some(Box::new(GoldinAdapter)),
        _ => None,
    }
}
