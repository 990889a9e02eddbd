//! Core domain model, identity normalization and price-history ledger for listwatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "listwatch-core";

/// A loosely typed scalar as it arrives from upstream: either a JSON number or a string.
///
/// Equality is structural, so `Number(100)` and `Text("100")` are different values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn int(value: i64) -> Self {
        Self::Number(value.into())
    }

    /// Digits-only numeric key, used for ordering output and nothing else.
    pub fn sort_key(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
            Self::Text(s) => {
                let digits = s.chars().filter(char::is_ascii_digit).collect::<String>();
                digits.parse().ok()
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Listing record exactly as the fetch layer produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawListing {
    #[serde(default)]
    pub id: Option<Scalar>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<Scalar>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "squareMeters")]
    pub square_meters: Option<Scalar>,
    #[serde(default, alias = "publishDate")]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub advertiser: Option<String>,
}

/// Canonical form of a listing's natural key: the stringified, trimmed id.
///
/// Returns `None` when nothing usable is left after trimming.
pub fn normalize_id(raw: &Scalar) -> Option<String> {
    let canonical = match raw {
        Scalar::Number(n) => n.to_string(),
        Scalar::Text(s) => s.trim().to_string(),
    };
    if canonical.is_empty() {
        None
    } else {
        Some(canonical)
    }
}

/// Listing keyed by its canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub price: Option<Scalar>,
    pub location: Option<String>,
    pub square_meters: Option<Scalar>,
    pub publish_date: Option<String>,
    pub advertiser: Option<String>,
}

impl Listing {
    pub fn from_raw(raw: &RawListing) -> Option<Self> {
        let id = raw.id.as_ref().and_then(normalize_id)?;
        Some(Self {
            id,
            url: raw.url.clone(),
            title: raw.title.clone(),
            price: raw.price.clone(),
            location: raw.location.clone(),
            square_meters: raw.square_meters.clone(),
            publish_date: raw.publish_date.clone(),
            advertiser: raw.advertiser.clone(),
        })
    }
}

/// Result of collapsing one batch down to unique canonical ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deduplicated {
    pub listings: Vec<Listing>,
    /// Ids that occurred more than once, each reported once in first-repeat order.
    pub duplicate_ids: Vec<String>,
    /// Records dropped because they carried no usable id.
    pub malformed: usize,
}

/// Keep the first record per canonical id and preserve input order.
pub fn deduplicate(records: &[RawListing]) -> Deduplicated {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut out = Deduplicated::default();

    for raw in records {
        let Some(listing) = Listing::from_raw(raw) else {
            out.malformed += 1;
            continue;
        };
        if seen.insert(listing.id.clone()) {
            out.listings.push(listing);
        } else if reported.insert(listing.id.clone()) {
            out.duplicate_ids.push(listing.id);
        }
    }

    out
}

/// A deduplicated batch captured at one point in time, addressable by canonical id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    listings: Vec<Listing>,
    index: HashMap<String, usize>,
    duplicate_ids: Vec<String>,
    malformed: usize,
    raw_count: usize,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_raw(records: &[RawListing]) -> Self {
        let deduped = deduplicate(records);
        let index = deduped
            .listings
            .iter()
            .enumerate()
            .map(|(pos, listing)| (listing.id.clone(), pos))
            .collect();
        Self {
            listings: deduped.listings,
            index,
            duplicate_ids: deduped.duplicate_ids,
            malformed: deduped.malformed,
            raw_count: records.len(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Listing> {
        self.index.get(id).map(|pos| &self.listings[*pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Listing> {
        self.listings.iter()
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn duplicate_ids(&self) -> &[String] {
        &self.duplicate_ids
    }

    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    /// Number of records handed in, before dedup and malformed filtering.
    pub fn raw_count(&self) -> usize {
        self.raw_count
    }
}

/// One point in a listing's price history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub date: NaiveDate,
    #[serde(default)]
    pub price: Option<Scalar>,
}

/// Append-only price series per canonical id.
///
/// Consecutive observations for the same id never carry the same price, so
/// each series reads as a list of price changes rather than one entry per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceHistory {
    series: BTreeMap<String, Vec<PriceObservation>>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.series.get(id).is_some_and(|entries| !entries.is_empty())
    }

    /// Append `price` for `id` unless it equals the latest recorded price.
    ///
    /// Returns whether an observation was appended.
    pub fn record(&mut self, id: &str, price: Option<&Scalar>, date: NaiveDate) -> bool {
        let entries = self.series.entry(id.to_string()).or_default();
        if let Some(last) = entries.last() {
            if last.price.as_ref() == price {
                return false;
            }
        }
        entries.push(PriceObservation {
            date,
            price: price.cloned(),
        });
        true
    }

    pub fn last_observation(&self, id: &str) -> Option<&PriceObservation> {
        self.series.get(id).and_then(|entries| entries.last())
    }

    pub fn last_price(&self, id: &str) -> Option<&Scalar> {
        self.last_observation(id).and_then(|obs| obs.price.as_ref())
    }

    pub fn history(&self, id: &str) -> &[PriceObservation] {
        self.series.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl FromIterator<(String, Vec<PriceObservation>)> for PriceHistory {
    fn from_iter<I: IntoIterator<Item = (String, Vec<PriceObservation>)>>(iter: I) -> Self {
        Self {
            series: iter.into_iter().collect(),
        }
    }
}

/// Price movement for a listing present in both of the compared snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub square_meters: Option<Scalar>,
    pub new_price: Option<Scalar>,
    pub old_price: Option<Scalar>,
}

/// Outcome of one run, persisted as `reports/<run_date>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub run_date: NaiveDate,
    pub total_ads: usize,
    pub unique_ads: usize,
    pub malformed_records: usize,
    pub duplicate_ids: Vec<String>,
    pub added: Vec<Listing>,
    pub removed: Vec<Listing>,
    pub price_changed: Vec<Change>,
}

impl Report {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.price_changed.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).expect("date")
    }

    fn raw(id: Scalar, title: &str, price: &str) -> RawListing {
        RawListing {
            id: Some(id),
            title: Some(title.to_string()),
            price: Some(Scalar::text(price)),
            ..Default::default()
        }
    }

    #[test]
    fn numeric_and_padded_string_ids_share_a_canonical_form() {
        assert_eq!(normalize_id(&Scalar::int(123)).as_deref(), Some("123"));
        assert_eq!(normalize_id(&Scalar::text("  123 ")).as_deref(), Some("123"));
        assert_eq!(normalize_id(&Scalar::text("   ")), None);
    }

    #[test]
    fn dedup_keeps_first_seen_fields() {
        let records = vec![
            raw(Scalar::text("123"), "first", "100"),
            raw(Scalar::int(123), "second", "200"),
            raw(Scalar::int(7), "other", "50"),
        ];
        let deduped = deduplicate(&records);
        assert_eq!(deduped.listings.len(), 2);
        assert_eq!(deduped.listings[0].title.as_deref(), Some("first"));
        assert_eq!(deduped.listings[0].price, Some(Scalar::text("100")));
        assert_eq!(deduped.listings[1].id, "7");
        assert_eq!(deduped.duplicate_ids, vec!["123".to_string()]);
    }

    #[test]
    fn records_without_id_are_counted_not_kept() {
        let records = vec![
            RawListing {
                title: Some("no id".into()),
                ..Default::default()
            },
            raw(Scalar::text(" "), "blank", "1"),
            raw(Scalar::int(1), "ok", "1"),
        ];
        let snapshot = Snapshot::from_raw(&records);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.malformed_count(), 2);
        assert_eq!(snapshot.raw_count(), 3);
        assert!(snapshot.contains("1"));
    }

    #[test]
    fn raw_listing_accepts_heterogeneous_json() {
        let json = r#"[
            {"id": 5425645730094, "price": "95.000 €", "squareMeters": 120},
            {"id": " 42 ", "price": null, "title": "Kuća"}
        ]"#;
        let records: Vec<RawListing> = serde_json::from_str(json).expect("parse");
        let snapshot = Snapshot::from_raw(&records);
        let first = snapshot.get("5425645730094").expect("numeric id");
        assert_eq!(first.square_meters, Some(Scalar::int(120)));
        let second = snapshot.get("42").expect("string id");
        assert_eq!(second.price, None);
    }

    #[test]
    fn ledger_only_appends_on_price_change() {
        let mut ledger = PriceHistory::new();
        let a = Scalar::text("100k");
        let b = Scalar::text("90k");

        assert!(!ledger.has_seen("1"));
        assert!(ledger.record("1", Some(&a), day(1)));
        assert!(!ledger.record("1", Some(&a), day(2)));
        assert!(ledger.record("1", Some(&b), day(3)));
        assert!(ledger.record("1", Some(&a), day(4)));

        let prices = ledger
            .history("1")
            .iter()
            .map(|o| o.price.clone())
            .collect::<Vec<_>>();
        assert_eq!(prices, vec![Some(a.clone()), Some(b), Some(a.clone())]);
        assert!(ledger
            .history("1")
            .windows(2)
            .all(|pair| pair[0].price != pair[1].price));
        assert_eq!(ledger.last_price("1"), Some(&a));
        assert_eq!(ledger.last_observation("1").map(|o| o.date), Some(day(4)));
    }

    #[test]
    fn missing_price_is_its_own_value() {
        let mut ledger = PriceHistory::new();
        assert!(ledger.record("9", None, day(1)));
        assert!(ledger.has_seen("9"));
        assert_eq!(ledger.last_price("9"), None);
        assert!(!ledger.record("9", None, day(2)));
        assert!(ledger.record("9", Some(&Scalar::text("1")), day(3)));
    }

    #[test]
    fn ledger_round_trips_persisted_schema() {
        let json = r#"{"1": [{"date": "2025-07-29", "price": "100k"}], "2": []}"#;
        let ledger: PriceHistory = serde_json::from_str(json).expect("parse ledger");
        assert!(ledger.has_seen("1"));
        assert!(!ledger.has_seen("2"));
        let back = serde_json::to_value(&ledger).expect("serialize");
        assert_eq!(back["1"][0]["date"], "2025-07-29");
        assert_eq!(back["1"][0]["price"], "100k");
    }

    #[test]
    fn sort_key_reads_digits_only() {
        assert_eq!(Scalar::text("95.000 €").sort_key(), Some(95_000));
        assert_eq!(Scalar::int(120).sort_key(), Some(120));
        assert_eq!(Scalar::text("Dogovor").sort_key(), None);
    }
}
