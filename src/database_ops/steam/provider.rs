//! Clients for the two upstream services: the SteamSpy popularity API and
//! the official Steam store/stats endpoints.
//!
//! Every call is best-effort with bounded retry; a single appid failing is a
//! warning, never a stage abort. Payloads are decoded loosely — SteamSpy in
//! particular flips fields between numbers and strings — and all coercion is
//! deferred to the normalizer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::database_ops::db::{CatalogEntry, PlayerCountEntry, PopularityEntry, TrendingEntry};
use crate::util::env::env_parse;

/// Upstream endpoint configuration. Explicit rather than process-wide so
/// tests and alternate deployments can point the client elsewhere.
#[derive(Debug, Clone)]
pub struct SteamEndpoints {
    pub steamspy_base: String,
    pub store_appdetails_base: String,
    pub player_count_base: String,
}

impl Default for SteamEndpoints {
    fn default() -> Self {
        Self {
            steamspy_base: "https://steamspy.com/api.php".to_string(),
            store_appdetails_base: "https://store.steampowered.com/api/appdetails".to_string(),
            player_count_base:
                "https://api.steampowered.com/ISteamUserStats/GetNumberOfCurrentPlayers/v1/"
                    .to_string(),
        }
    }
}

impl SteamEndpoints {
    fn top100_url(&self) -> String {
        format!("{}?request=top100in2weeks", self.steamspy_base)
    }

    fn popularity_url(&self, appid: i64) -> String {
        format!("{}?request=appdetails&appid={appid}", self.steamspy_base)
    }

    fn store_url(&self, appid: i64) -> String {
        format!("{}?appids={appid}", self.store_appdetails_base)
    }

    fn player_count_url(&self, appid: i64) -> String {
        format!("{}?appid={appid}", self.player_count_base)
    }
}

/// HTTP statuses worth retrying: rate limiting and transient server errors.
const RETRYABLE: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

pub struct SteamClient {
    client: Client,
    endpoints: SteamEndpoints,
    max_retries: u32,
    backoff_ms: u64,
}

impl SteamClient {
    /// Env: STEAM_HTTP_TIMEOUT_SECS (default 10), STEAM_MAX_RETRIES (3),
    /// STEAM_BACKOFF_MS (500).
    pub fn new(endpoints: SteamEndpoints) -> Self {
        let timeout_secs: u64 = env_parse("STEAM_HTTP_TIMEOUT_SECS", 10u64);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoints,
            max_retries: env_parse("STEAM_MAX_RETRIES", 3u32),
            backoff_ms: env_parse("STEAM_BACKOFF_MS", 500u64),
        }
    }

    pub fn from_env() -> Self {
        Self::new(SteamEndpoints::default())
    }

    /// GET a JSON body with exponential backoff + jitter on retryable
    /// statuses and transport errors.
    async fn get_json(&self, url: &str) -> Result<Value> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = self.client.get(url).send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Value>().await.context("decoding JSON body");
                    }
                    if !RETRYABLE.contains(&status) || attempt > self.max_retries {
                        anyhow::bail!("GET {url} returned {status}");
                    }
                    debug!(%url, %status, attempt, "retryable status");
                }
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(err).context(format!("GET {url}"));
                    }
                    debug!(%url, error = %err, attempt, "transport error, retrying");
                }
            }
            let backoff = self.backoff_ms * 2u64.saturating_pow(attempt - 1);
            let jitter = rand::thread_rng().gen_range(0..=self.backoff_ms / 2);
            tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
        }
    }

    /// The SteamSpy top-100-in-two-weeks feed: the run's seed list.
    pub async fn top100_trending(&self) -> Result<Vec<TrendingEntry>> {
        let body = self.get_json(&self.endpoints.top100_url()).await?;
        let entries = trending_from_payload(&body);
        info!(count = entries.len(), "fetched trending top 100");
        Ok(entries)
    }

    /// Store appdetails for one appid. `None` when the store has no entry,
    /// reports success=false, or the request ultimately fails.
    pub async fn game_details(&self, appid: i64) -> Option<CatalogEntry> {
        match self.get_json(&self.endpoints.store_url(appid)).await {
            Ok(body) => {
                let detail = catalog_from_payload(appid, &body);
                if detail.is_none() {
                    warn!(appid, "store appdetails returned no usable data");
                }
                detail
            }
            Err(err) => {
                warn!(appid, error = %err, "failed to fetch store appdetails");
                None
            }
        }
    }

    /// Current player count for one appid; `None` unless the stats API
    /// reports result=1.
    pub async fn player_count(&self, appid: i64) -> Option<PlayerCountEntry> {
        match self.get_json(&self.endpoints.player_count_url(appid)).await {
            Ok(body) => match player_count_from_payload(&body) {
                Some(count) => Some(PlayerCountEntry {
                    appid,
                    current_players: count,
                }),
                None => {
                    warn!(appid, "player count response had no usable result");
                    None
                }
            },
            Err(err) => {
                warn!(appid, error = %err, "failed to fetch player count");
                None
            }
        }
    }

    /// SteamSpy popularity stats for one appid.
    pub async fn popularity_stats(&self, appid: i64) -> Option<PopularityEntry> {
        match self.get_json(&self.endpoints.popularity_url(appid)).await {
            Ok(body) => Some(popularity_from_payload(appid, &body)),
            Err(err) => {
                warn!(appid, error = %err, "failed to fetch popularity stats");
                None
            }
        }
    }
}

/// The top-100 response is an object keyed by appid *string*. Non-numeric
/// keys (SteamSpy occasionally slips metadata entries in) are skipped.
fn trending_from_payload(body: &Value) -> Vec<TrendingEntry> {
    let Some(map) = body.as_object() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(map.len());
    for (key, info) in map {
        let Ok(appid) = key.parse::<i64>() else {
            debug!(%key, "skipping non-numeric appid key in trending feed");
            continue;
        };
        out.push(TrendingEntry {
            appid: Value::from(appid),
            name: info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            median_2weeks: info.get("median_2weeks").cloned().unwrap_or(json!(0)),
        });
    }
    out
}

#[derive(Debug, Deserialize)]
struct AppDetailsWrapper {
    success: bool,
    data: Option<AppData>,
}

#[derive(Debug, Deserialize)]
struct AppData {
    name: Option<String>,
    #[serde(default)]
    developers: Option<Vec<String>>,
    #[serde(default)]
    release_date: Option<ReleaseDate>,
    #[serde(default)]
    genres: Option<Vec<GenreEntry>>,
    #[serde(default)]
    price_overview: Option<PriceOverview>,
    #[serde(default)]
    short_description: Option<String>,
    // BTreeMap keeps the comma-joined platform list deterministic.
    #[serde(default)]
    platforms: Option<BTreeMap<String, bool>>,
}

#[derive(Debug, Deserialize)]
struct ReleaseDate {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenreEntry {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceOverview {
    #[serde(rename = "final", default)]
    final_price: Value,
}

/// Store appdetails wraps the payload in `{"<appid>": {"success": ..,
/// "data": ..}}`; honor the success flag before trusting anything inside.
fn catalog_from_payload(appid: i64, body: &Value) -> Option<CatalogEntry> {
    let wrappers: HashMap<String, AppDetailsWrapper> =
        serde_json::from_value(body.clone()).ok()?;
    let wrapper = wrappers.get(&appid.to_string())?;
    if !wrapper.success {
        return None;
    }
    let data = wrapper.data.as_ref()?;

    let genres = data
        .genres
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|g| g.description.as_deref())
        .collect::<Vec<_>>()
        .join(",");
    let platforms = data
        .platforms
        .as_ref()
        .map(|p| {
            p.iter()
                .filter(|(_, enabled)| **enabled)
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();

    Some(CatalogEntry {
        appid,
        name: data.name.clone().unwrap_or_default(),
        developer: data
            .developers
            .as_deref()
            .and_then(|d| d.first())
            .cloned()
            .unwrap_or_default(),
        release_date: data
            .release_date
            .as_ref()
            .and_then(|r| r.date.clone())
            .unwrap_or_default(),
        genres,
        price: data
            .price_overview
            .as_ref()
            .map(|p| p.final_price.clone())
            .unwrap_or(Value::Null),
        description: data.short_description.clone().unwrap_or_default(),
        platforms,
    })
}

/// `{"response": {"player_count": N, "result": 1}}`; anything but result=1
/// means the count is not trustworthy.
fn player_count_from_payload(body: &Value) -> Option<Value> {
    let response = body.get("response")?;
    if response.get("result").and_then(Value::as_i64) != Some(1) {
        return None;
    }
    Some(response.get("player_count").cloned().unwrap_or(json!(0)))
}

/// SteamSpy appdetails is a flat object. Tags arrive as a votes map, an
/// array of strings, or junk; everything else passes through loosely with
/// the same zero/empty defaults the raw table has always stored.
fn popularity_from_payload(appid: i64, body: &Value) -> PopularityEntry {
    let tags = match body.get("tags") {
        Some(Value::Object(map)) => map.keys().cloned().collect::<Vec<_>>().join(","),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map
                    .get("tag")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    };

    let field = |key: &str| body.get(key).cloned().unwrap_or(json!(0));

    PopularityEntry {
        appid,
        owners: Some(
            body.get("owners")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        ccu: field("ccu"),
        positive: field("positive"),
        negative: field("negative"),
        average_forever: field("average_forever"),
        average_2weeks: field("average_2weeks"),
        median_forever: field("median_forever"),
        median_2weeks: field("median_2weeks"),
        price: field("price"),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::value::coerce_int;

    #[test]
    fn trending_payload_skips_non_numeric_keys() {
        let body = json!({
            "730": {"name": "Counter-Strike 2", "median_2weeks": 120},
            "570": {"name": "Dota 2", "median_2weeks": "95"},
            "metadata": {"generated": "2025-06-01"}
        });
        let entries = trending_from_payload(&body);
        assert_eq!(entries.len(), 2);
        let cs = entries
            .iter()
            .find(|e| coerce_int(&e.appid, None) == Some(730))
            .unwrap();
        assert_eq!(cs.name, "Counter-Strike 2");
        assert_eq!(coerce_int(&cs.median_2weeks, None), Some(120));
        // numeric-as-string survives decode untouched
        let dota = entries
            .iter()
            .find(|e| coerce_int(&e.appid, None) == Some(570))
            .unwrap();
        assert_eq!(dota.median_2weeks, json!("95"));
    }

    #[test]
    fn trending_payload_tolerates_missing_fields() {
        let body = json!({"10": {}});
        let entries = trending_from_payload(&body);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "");
        assert_eq!(entries[0].median_2weeks, json!(0));
    }

    #[test]
    fn catalog_payload_honors_success_flag() {
        let body = json!({"10": {"success": false}});
        assert!(catalog_from_payload(10, &body).is_none());

        let body = json!({"10": {"success": true}});
        assert!(catalog_from_payload(10, &body).is_none());
    }

    #[test]
    fn catalog_payload_extracts_fields() {
        let body = json!({
            "10": {
                "success": true,
                "data": {
                    "name": "Half-Life",
                    "developers": ["Valve", "Gearbox"],
                    "release_date": {"coming_soon": false, "date": "Nov 8, 1998"},
                    "genres": [{"id": "1", "description": "Action"}, {"id": "25", "description": "Adventure"}],
                    "price_overview": {"currency": "USD", "initial": 999, "final": 999},
                    "short_description": "A classic.",
                    "platforms": {"windows": true, "mac": true, "linux": false}
                }
            }
        });
        let entry = catalog_from_payload(10, &body).unwrap();
        assert_eq!(entry.name, "Half-Life");
        assert_eq!(entry.developer, "Valve");
        assert_eq!(entry.release_date, "Nov 8, 1998");
        assert_eq!(entry.genres, "Action,Adventure");
        assert_eq!(entry.price, json!(999));
        assert_eq!(entry.platforms, "mac,windows");
    }

    #[test]
    fn catalog_payload_requires_matching_appid_key() {
        let body = json!({"20": {"success": true, "data": {"name": "Other"}}});
        assert!(catalog_from_payload(10, &body).is_none());
    }

    #[test]
    fn player_count_requires_result_one() {
        let ok = json!({"response": {"player_count": 805055, "result": 1}});
        assert_eq!(player_count_from_payload(&ok), Some(json!(805055)));

        let err = json!({"response": {"result": 42}});
        assert_eq!(player_count_from_payload(&err), None);

        let empty = json!({});
        assert_eq!(player_count_from_payload(&empty), None);
    }

    #[test]
    fn popularity_payload_normalizes_tag_shapes() {
        let with_votes = json!({"owners": "1,000 .. 2,000", "tags": {"FPS": 91172, "Shooter": 65634}});
        let entry = popularity_from_payload(10, &with_votes);
        assert_eq!(entry.tags, "FPS,Shooter");

        let as_list = json!({"tags": ["FPS", {"tag": "Shooter"}, 7]});
        let entry = popularity_from_payload(10, &as_list);
        assert_eq!(entry.tags, "FPS,Shooter");

        let junk = json!({"tags": ""});
        let entry = popularity_from_payload(10, &junk);
        assert_eq!(entry.tags, "");
    }

    #[test]
    fn popularity_payload_keeps_loose_values_and_defaults() {
        let body = json!({
            "owners": "10,000,000 .. 20,000,000",
            "ccu": 310000,
            "positive": "50000",
            "price": "1999"
        });
        let entry = popularity_from_payload(730, &body);
        assert_eq!(entry.appid, 730);
        assert_eq!(entry.owners.as_deref(), Some("10,000,000 .. 20,000,000"));
        assert_eq!(entry.ccu, json!(310000));
        assert_eq!(entry.positive, json!("50000"));
        assert_eq!(entry.price, json!("1999"));
        // absent counters default to zero like the raw table always has
        assert_eq!(entry.negative, json!(0));
        assert_eq!(entry.median_2weeks, json!(0));
    }
}
