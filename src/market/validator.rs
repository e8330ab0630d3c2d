use crate::http::build_probe_client;
use crate::models::{ListingSourceType, MarketListing};
use chrono::{Datelike, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

const MIN_PRICE: f64 = 1_000.0;
const MAX_PRICE: f64 = 500_000.0;
const MAX_MILEAGE: u32 = 500_000;
const MIN_YEAR: i32 = 1990;

/// Marketplace hosts whose listing URLs we are willing to trust.
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "autotrader.com",
    "cars.com",
    "cargurus.com",
    "carmax.com",
    "carvana.com",
    "truecar.com",
    "edmunds.com",
    "vroom.com",
    "ebay.com",
    "craigslist.org",
    "sandbox.marketcheck.com",
];

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// When false the liveness probe is skipped (offline/test runs). The
    /// quality filter and domain allow-list still apply.
    pub verify_urls: bool,
    pub probe_timeout: Duration,
    pub probe_retries: u32,
    pub concurrency: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            verify_urls: false,
            probe_timeout: Duration::from_secs(10),
            probe_retries: 2,
            concurrency: 5,
            allowed_domains: DEFAULT_ALLOWED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl ValidatorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.verify_urls = matches!(
            std::env::var("LISTING_VERIFY_URLS")
                .unwrap_or_default()
                .trim()
                .to_lowercase()
                .as_str(),
            "1" | "true" | "yes" | "on"
        );
        if let Some(extra) = std::env::var("LISTING_DOMAIN_ALLOWLIST").ok().filter(|v| {
            !v.trim().is_empty()
        }) {
            config.allowed_domains.extend(
                extra
                    .split([',', ' '])
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty()),
            );
        }
        config
    }
}

/// Drops listings that fail either the quality filter or the liveness filter.
/// Dropping is silent: logged, never surfaced as an error. Zero survivors is
/// a valid outcome meaning "no real data".
pub struct ListingValidator {
    config: ValidatorConfig,
    probe: Client,
}

impl ListingValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        let probe = build_probe_client(config.probe_timeout);
        Self { config, probe }
    }

    pub async fn validate(&self, listings: Vec<MarketListing>) -> Vec<MarketListing> {
        let current_year = Utc::now().year();
        let mut quality: Vec<MarketListing> = Vec::new();
        for listing in listings {
            match quality_check(&listing, current_year) {
                Ok(()) => quality.push(listing),
                Err(reason) => {
                    debug!(
                        target = "vantage.market",
                        source = %listing.source,
                        price = listing.price,
                        reason = reason,
                        "listing_dropped_quality"
                    );
                }
            }
        }

        let mut survivors: Vec<Option<MarketListing>> = Vec::with_capacity(quality.len());
        let mut checks: JoinSet<(usize, bool)> = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        for (idx, listing) in quality.iter().enumerate() {
            // Estimated listings are display-only; they skip the liveness
            // filter entirely.
            if listing.source_type == ListingSourceType::Estimated {
                survivors.push(Some(listing.clone()));
                continue;
            }
            if !host_allowed(&listing.url, &self.config.allowed_domains) {
                debug!(
                    target = "vantage.market",
                    url = %listing.url,
                    "listing_dropped_domain"
                );
                survivors.push(None);
                continue;
            }
            if !self.config.verify_urls {
                survivors.push(Some(listing.clone()));
                continue;
            }

            survivors.push(None);
            let url = listing.url.clone();
            let probe = self.probe.clone();
            let retries = self.config.probe_retries;
            let permit_pool = semaphore.clone();
            checks.spawn(async move {
                let _permit = permit_pool.acquire_owned().await;
                (idx, probe_url(&probe, &url, retries).await)
            });
        }

        let checked = quality;
        while let Some(joined) = checks.join_next().await {
            if let Ok((idx, live)) = joined {
                if live {
                    survivors[idx] = Some(checked[idx].clone());
                } else {
                    warn!(
                        target = "vantage.market",
                        url = %checked[idx].url,
                        "listing_dropped_unreachable"
                    );
                }
            }
        }

        survivors.into_iter().flatten().collect()
    }
}

fn quality_check(listing: &MarketListing, current_year: i32) -> Result<(), &'static str> {
    if !listing.price.is_finite() || listing.price < MIN_PRICE || listing.price > MAX_PRICE {
        return Err("price out of range");
    }
    if let Some(mileage) = listing.mileage
        && mileage > MAX_MILEAGE
    {
        return Err("mileage out of range");
    }
    if listing.year < MIN_YEAR || listing.year > current_year + 1 {
        return Err("year out of range");
    }
    if listing.url.trim().is_empty() {
        return Err("missing url");
    }
    Ok(())
}

fn host_allowed(url: &str, allowed: &[String]) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    allowed
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

/// HEAD probe with linear backoff. A refused HEAD (403) still counts as live
/// because several marketplaces reject bot HEAD requests outright.
async fn probe_url(client: &Client, url: &str, retries: u32) -> bool {
    let mut attempt = 0;
    loop {
        match client.head(url).send().await {
            Ok(response)
                if response.status().is_success()
                    || response.status() == reqwest::StatusCode::FORBIDDEN =>
            {
                return true;
            }
            Ok(response) => {
                debug!(
                    target = "vantage.market",
                    url = url,
                    status = %response.status(),
                    "listing_probe_rejected"
                );
            }
            Err(err) => {
                debug!(
                    target = "vantage.market",
                    url = url,
                    error = %err,
                    "listing_probe_failed"
                );
            }
        }
        attempt += 1;
        if attempt > retries {
            return false;
        }
        sleep(Duration::from_millis(500 * attempt as u64)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::listing;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn validator() -> ListingValidator {
        ListingValidator::new(ValidatorConfig::default())
    }

    fn probing_validator(retries: u32) -> ListingValidator {
        let mut config = ValidatorConfig::default();
        config.verify_urls = true;
        config.probe_timeout = Duration::from_secs(2);
        config.probe_retries = retries;
        config.allowed_domains.push("127.0.0.1".into());
        ListingValidator::new(config)
    }

    /// Minimal HEAD responder. Answers the nth connection with the nth status
    /// in `statuses`, repeating the last one afterwards.
    async fn spawn_head_server(statuses: &'static [u16]) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let idx = seen.fetch_add(1, Ordering::SeqCst);
                let status = statuses
                    .get(idx)
                    .copied()
                    .unwrap_or(statuses[statuses.len() - 1]);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} probe\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        (format!("http://{addr}/listing/1"), hits)
    }

    #[tokio::test]
    async fn price_bounds_are_enforced() {
        let cheap = {
            let mut l = listing(300.0, 0);
            l.mileage = Some(1);
            l
        };
        let rich = {
            let mut l = listing(600_000.0, 0);
            l.mileage = Some(2);
            l
        };
        let fine = listing(25_000.0, 0);
        let kept = validator().validate(vec![cheap, rich, fine]).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].price, 25_000.0);
    }

    #[tokio::test]
    async fn mileage_year_and_url_are_checked() {
        let mut high_miles = listing(20_000.0, 0);
        high_miles.mileage = Some(600_000);
        let mut ancient = listing(21_000.0, 0);
        ancient.year = 1984;
        let mut missing_url = listing(22_000.0, 0);
        missing_url.url = String::new();
        let mut unknown_mileage = listing(23_000.0, 0);
        unknown_mileage.mileage = None;
        let kept = validator()
            .validate(vec![high_miles, ancient, missing_url, unknown_mileage])
            .await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].price, 23_000.0);
    }

    #[tokio::test]
    async fn unlisted_domains_are_dropped() {
        let mut shady = listing(25_000.0, 0);
        shady.url = "https://totally-real-cars.example/listing/1".into();
        shady.mileage = Some(3);
        let fine = listing(25_000.0, 0);
        let kept = validator().validate(vec![shady, fine]).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url, "https://www.autotrader.com/listing/x");
    }

    #[tokio::test]
    async fn estimated_listings_skip_the_liveness_filter() {
        let mut stub = listing(24_000.0, 0);
        stub.source_type = ListingSourceType::Estimated;
        stub.url = "https://sandbox.internal/listing/1".into();
        let kept = validator().validate(vec![stub]).await;
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn liveness_probe_keeps_reachable_listings_and_drops_unreachable_ones() {
        let (live_url, _) = spawn_head_server(&[200]).await;
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let dead_url = format!("http://{}/listing/2", closed.local_addr().expect("addr"));
        drop(closed);

        let mut reachable = listing(25_000.0, 0);
        reachable.url = live_url;
        let mut unreachable = listing(26_000.0, 0);
        unreachable.url = dead_url;

        let kept = probing_validator(0)
            .validate(vec![reachable, unreachable])
            .await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].price, 25_000.0);
    }

    #[tokio::test]
    async fn probe_retries_until_the_listing_answers() {
        let (url, hits) = spawn_head_server(&[500, 200]).await;
        let mut entry = listing(25_000.0, 0);
        entry.url = url;

        let kept = probing_validator(2).validate(vec![entry]).await;
        assert_eq!(kept.len(), 1);
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn forbidden_head_responses_still_count_as_live() {
        let (url, _) = spawn_head_server(&[403]).await;
        let mut entry = listing(25_000.0, 0);
        entry.url = url;

        let kept = probing_validator(0).validate(vec![entry]).await;
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn host_matching_accepts_subdomains_only() {
        let allowed = vec!["cars.com".to_string()];
        assert!(host_allowed("https://www.cars.com/x", &allowed));
        assert!(host_allowed("https://cars.com/x", &allowed));
        assert!(!host_allowed("https://notcars.com/x", &allowed));
        assert!(!host_allowed("https://cars.com.evil.example/x", &allowed));
        assert!(!host_allowed("not a url", &allowed));
    }
}
