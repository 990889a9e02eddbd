//! Source adapter contracts + the classifieds listing page parser.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use listwatch_core::{normalize_id, RawListing, Scalar};
use listwatch_storage::{FetchError, FetchedResponse, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "listwatch-adapters";

pub const HALOOGLASI_SOURCE_ID: &str = "halooglasi";
const HALOOGLASI_ORIGIN: &str = "https://www.halooglasi.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub page_no: usize,
    pub body: Vec<u8>,
    pub fetched_on: NaiveDate,
}

impl FetchedPage {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub page: FetchedPage,
    pub records: Vec<RawListing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
    pub max_pages: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Fetches one result page. The HTTP client is the production implementation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(run_id, source_id, url).await
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn parse_listing(&self, html: &str) -> Result<Vec<RawListing>, AdapterError>;

    /// URL of the `page_no`-th result page (1-based) for a listing filter URL.
    fn page_url(&self, listing_url: &str, page_no: usize) -> String {
        if page_no <= 1 {
            listing_url.to_string()
        } else if listing_url.contains('?') {
            format!("{listing_url}&page={page_no}")
        } else {
            format!("{listing_url}?page={page_no}")
        }
    }

    /// Walk result pages for every target. Paging stops after `max_pages`, at
    /// an empty page, or at a page whose identified listings all appeared on
    /// earlier pages of the same target. Pages holding only id-less records
    /// are kept so those records are counted as malformed.
    async fn fetch_listing(
        &self,
        fetcher: &dyn PageFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<ListingPage>, AdapterError> {
        let mut pages = Vec::new();
        for target in targets {
            let mut seen = HashSet::new();
            for page_no in 1..=target.max_pages.max(1) {
                let url = self.page_url(&target.url, page_no);
                let response = fetcher.fetch_page(ctx.run_id, self.source_id(), &url).await?;
                let page = FetchedPage {
                    url: response.final_url,
                    page_no,
                    body: response.body,
                    fetched_on: ctx.fetched_on,
                };
                let records = self.parse_listing(&page.body_text())?;
                if records.is_empty() {
                    debug!(source_id = self.source_id(), page_no, "empty page; stop paging");
                    break;
                }

                let mut identified = 0usize;
                let mut fresh = 0usize;
                for id in records.iter().filter_map(|r| r.id.as_ref().and_then(normalize_id)) {
                    identified += 1;
                    if seen.insert(id) {
                        fresh += 1;
                    }
                }
                if identified > 0 && fresh == 0 {
                    debug!(source_id = self.source_id(), page_no, "no new listings; stop paging");
                    break;
                }

                info!(
                    source_id = self.source_id(),
                    page_no,
                    records = records.len(),
                    fresh,
                    "parsed listing page"
                );
                pages.push(ListingPage { page, records });
            }
        }
        Ok(pages)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn joined_fragments(element: ElementRef<'_>, separator: &str) -> Option<String> {
    let joined = element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(separator);
    text_or_none(joined)
}

fn absolutize(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{HALOOGLASI_ORIGIN}{href}")
    } else {
        format!("{HALOOGLASI_ORIGIN}/{href}")
    }
}

/// Trailing all-digit path segment of a listing URL.
pub fn id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
        Some(last.to_string())
    } else {
        None
    }
}

struct ListingSelectors {
    item: Selector,
    title_link: Selector,
    price: Selector,
    places: Selector,
    feature: Selector,
    legend: Selector,
    publish_date: Selector,
    advertiser: Selector,
}

impl ListingSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            item: selector("div.product-item")?,
            title_link: selector("h3.product-title a")?,
            price: selector(".central-feature i")?,
            places: selector("ul.subtitle-places")?,
            feature: selector("ul.product-features li .value-wrapper")?,
            legend: selector(".legend")?,
            publish_date: selector(".publish-date")?,
            advertiser: selector(r#"[data-field-name="oglasivac_nekretnine_s"]"#)?,
        })
    }

    fn feature_value(&self, item: ElementRef<'_>, legend: &str) -> Option<String> {
        item.select(&self.feature).find_map(|wrapper| {
            let label = select_first_text(wrapper, &self.legend)?;
            if label != legend {
                return None;
            }
            let full = wrapper.text().collect::<String>().replace(&label, "");
            text_or_none(full.split_whitespace().collect::<Vec<_>>().join(" "))
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HaloOglasiAdapter;

#[async_trait]
impl SourceAdapter for HaloOglasiAdapter {
    fn source_id(&self) -> &'static str {
        HALOOGLASI_SOURCE_ID
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let sel = ListingSelectors::new()?;
        let document = Html::parse_document(html);
        let mut records = Vec::new();

        for item in document.select(&sel.item) {
            let Some(link) = item.select(&sel.title_link).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href").and_then(|h| text_or_none(h.to_string()))
            else {
                continue;
            };
            let url = absolutize(&href);
            let id = item
                .value()
                .attr("data-id")
                .and_then(|v| text_or_none(v.to_string()))
                .or_else(|| id_from_url(&url));

            records.push(RawListing {
                id: id.map(Scalar::Text),
                title: text_or_none(link.text().collect::<String>()),
                price: select_first_text(item, &sel.price).map(Scalar::Text),
                location: item
                    .select(&sel.places)
                    .next()
                    .and_then(|places| joined_fragments(places, " | ")),
                square_meters: sel.feature_value(item, "Kvadratura").map(Scalar::Text),
                publish_date: select_first_text(item, &sel.publish_date),
                advertiser: select_first_text(item, &sel.advertiser),
                url: Some(url),
            });
        }

        Ok(records)
    }
}

pub fn halooglasi_adapter() -> impl SourceAdapter {
    HaloOglasiAdapter
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        HALOOGLASI_SOURCE_ID => Some(Box::new(HaloOglasiAdapter)),
        _ => None,
    }
}

/// Parse a previously captured listing page from disk.
pub fn parse_listing_file(
    adapter: &dyn SourceAdapter,
    path: impl AsRef<Path>,
) -> Result<Vec<RawListing>> {
    let path = path.as_ref();
    let html = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    adapter
        .parse_listing(&html)
        .with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use listwatch_storage::StatusCode;

    /// Serves canned HTML by URL and records what was requested.
    #[derive(Default)]
    struct CannedPages {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl CannedPages {
        fn with(mut self, url: &str, html: String) -> Self {
            self.pages.insert(url.to_string(), html);
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl PageFetcher for CannedPages {
        async fn fetch_page(
            &self,
            _run_id: Uuid,
            _source_id: &str,
            url: &str,
        ) -> Result<FetchedResponse, FetchError> {
            self.requested.lock().expect("lock").push(url.to_string());
            match self.pages.get(url) {
                Some(html) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body: html.as_bytes().to_vec(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn item(id: Option<&str>, href: &str) -> String {
        let data_id = id.map(|id| format!(r#" data-id="{id}""#)).unwrap_or_default();
        format!(
            r#"<div class="product-item"{data_id}><h3 class="product-title"><a href="{href}">t</a></h3></div>"#
        )
    }

    fn listing_html(ids: &[&str]) -> String {
        ids.iter()
            .map(|id| item(Some(id), &format!("/oglas/{id}")))
            .collect()
    }

    const BASE: &str = "https://example.test/list";

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_on: NaiveDate::from_ymd_opt(2025, 7, 30).expect("date"),
        }
    }

    fn target(max_pages: usize) -> Vec<ListingTarget> {
        vec![ListingTarget {
            url: BASE.to_string(),
            max_pages,
        }]
    }

    fn page_ids(pages: &[ListingPage]) -> Vec<Vec<String>> {
        pages
            .iter()
            .map(|p| {
                p.records
                    .iter()
                    .map(|r| r.id.as_ref().map(ToString::to_string).unwrap_or_default())
                    .collect()
            })
            .collect()
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_path(source_id: &str, name: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(source_id)
            .join("sample")
            .join(name)
    }

    #[test]
    fn golden_json_snapshot_test_halooglasi() {
        let adapter = halooglasi_adapter();
        let actual =
            parse_listing_file(&adapter, fixture_path(HALOOGLASI_SOURCE_ID, "listing.html"))
                .unwrap();
        let expected: Vec<RawListing> = serde_json::from_str(
            &fs::read_to_string(fixture_path(HALOOGLASI_SOURCE_ID, "snapshot.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn items_without_link_are_skipped() {
        let html = r#"<div class="product-item" data-id="1"><p>ad</p></div>
            <div class="product-item"><h3 class="product-title"><a href="/x/77">t</a></h3></div>"#;
        let records = HaloOglasiAdapter.parse_listing(html).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, Some(Scalar::text("77")));
        assert_eq!(
            records[0].url.as_deref(),
            Some("https://www.halooglasi.com/x/77")
        );
        assert_eq!(records[0].price, None);
    }

    #[test]
    fn id_is_taken_from_trailing_numeric_segment() {
        assert_eq!(
            id_from_url("https://www.halooglasi.com/a/b/5425643509702?kid=4").as_deref(),
            Some("5425643509702")
        );
        assert_eq!(id_from_url("https://www.halooglasi.com/a/b/123/").as_deref(), Some("123"));
        assert_eq!(id_from_url("https://www.halooglasi.com/a/slug"), None);
    }

    #[test]
    fn page_urls_extend_existing_query() {
        let adapter = halooglasi_adapter();
        let base = "https://www.halooglasi.com/nekretnine/prodaja-kuca?cena_d_to=140000";
        assert_eq!(adapter.page_url(base, 1), base);
        assert_eq!(adapter.page_url(base, 3), format!("{base}&page=3"));
        assert_eq!(
            adapter.page_url("https://example.test/list", 2),
            "https://example.test/list?page=2"
        );
    }

    #[test]
    fn registry_knows_halooglasi_only() {
        assert!(adapter_for_source(HALOOGLASI_SOURCE_ID).is_some());
        assert!(adapter_for_source("unknown").is_none());
    }

    #[tokio::test]
    async fn paging_stops_at_max_pages() {
        let fetcher = CannedPages::default()
            .with(BASE, listing_html(&["1", "2"]))
            .with(&format!("{BASE}?page=2"), listing_html(&["3"]))
            .with(&format!("{BASE}?page=3"), listing_html(&["4"]));

        let pages = HaloOglasiAdapter
            .fetch_listing(&fetcher, &ctx(), &target(2))
            .await
            .expect("fetch");

        assert_eq!(page_ids(&pages), vec![vec!["1", "2"], vec!["3"]]);
        assert_eq!(
            fetcher.requested(),
            vec![BASE.to_string(), format!("{BASE}?page=2")]
        );
        assert_eq!(pages[1].page.page_no, 2);
    }

    #[tokio::test]
    async fn paging_stops_when_a_page_repeats_known_listings() {
        let fetcher = CannedPages::default()
            .with(BASE, listing_html(&["1", "2"]))
            .with(&format!("{BASE}?page=2"), listing_html(&["2", "1"]))
            .with(&format!("{BASE}?page=3"), listing_html(&["9"]));

        let pages = HaloOglasiAdapter
            .fetch_listing(&fetcher, &ctx(), &target(5))
            .await
            .expect("fetch");

        assert_eq!(page_ids(&pages), vec![vec!["1", "2"]]);
        assert_eq!(fetcher.requested().len(), 2);
    }

    #[tokio::test]
    async fn empty_first_page_yields_nothing() {
        let fetcher = CannedPages::default()
            .with(BASE, "<html><body>Nema oglasa</body></html>".to_string());

        let pages = HaloOglasiAdapter
            .fetch_listing(&fetcher, &ctx(), &target(3))
            .await
            .expect("fetch");

        assert!(pages.is_empty());
        assert_eq!(fetcher.requested(), vec![BASE.to_string()]);
    }

    #[tokio::test]
    async fn page_of_id_less_records_is_kept() {
        let fetcher = CannedPages::default()
            .with(BASE, item(None, "/oglas/bez-broja"))
            .with(&format!("{BASE}?page=2"), listing_html(&["5"]));
        let pages = HaloOglasiAdapter
            .fetch_listing(&fetcher, &ctx(), &target(2))
            .await
            .expect("fetch");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].records.len(), 1);
        assert_eq!(pages[0].records[0].id, None);
        assert_eq!(page_ids(&pages)[1], vec!["5"]);
    }
}
