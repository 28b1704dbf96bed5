//! Upstream catalog API contract, SteamSpy adapter, and payload → record transform.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use gcat_core::{CatalogAttributes, CatalogId, CleanedRecord, RawRecord, UNKNOWN_COMPANY, UNRANKED};
use gcat_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gcat-adapters";

/// `appid` the detail API answers with for ids it does not know.
pub const UNKNOWN_APP_SENTINEL: i64 = 999_999;

/// Literal price value upstream uses for free titles.
pub const FREE_PRICE_SENTINEL: &str = "Free to Play";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("catalog listing unavailable: {0}")]
    Listing(#[source] FetchError),
    #[error("detail fetch for app {id} failed: {source}")]
    Detail {
        id: CatalogId,
        #[source]
        source: FetchError,
    },
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn list_ids(&self) -> Result<Vec<CatalogId>, AdapterError>;

    /// `Ok(None)` when upstream answered without a usable record.
    async fn fetch_detail(&self, id: CatalogId) -> Result<Option<JsonValue>, AdapterError>;
}

/// Full catalog listing, deduplicated with first-seen order kept.
pub async fn list_all_ids(api: &dyn CatalogApi) -> Result<Vec<CatalogId>, AdapterError> {
    let listed = api.list_ids().await?;
    let total = listed.len();
    let mut seen = HashSet::with_capacity(total);
    let ids: Vec<CatalogId> = listed.into_iter().filter(|id| seen.insert(*id)).collect();
    info!(total, unique = ids.len(), "catalog listing fetched");
    Ok(ids)
}

/// Non-empty object whose `appid` is not the unknown-app sentinel.
pub fn is_usable_payload(payload: &JsonValue) -> bool {
    let Some(object) = payload.as_object() else {
        return false;
    };
    if object.is_empty() {
        return false;
    }
    !matches!(int(object.get("appid")), Decoded::Present(UNKNOWN_APP_SENTINEL))
}

#[derive(Debug, Deserialize)]
struct AppListResponse {
    applist: AppList,
}

#[derive(Debug, Deserialize)]
struct AppList {
    #[serde(default)]
    apps: Vec<AppEntry>,
}

#[derive(Debug, Deserialize)]
struct AppEntry {
    appid: Option<i64>,
}

/// Positive ids of the listing; entries without an id are dropped.
fn app_ids(response: AppListResponse) -> Vec<CatalogId> {
    response
        .applist
        .apps
        .into_iter()
        .filter_map(|app| app.appid.and_then(|raw| CatalogId::try_from(raw).ok()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SteamSpyEndpoints {
    pub listing_url: String,
    pub detail_url: String,
    pub listing_timeout: Duration,
    pub detail_timeout: Duration,
}

impl Default for SteamSpyEndpoints {
    fn default() -> Self {
        Self {
            listing_url: "https://api.steampowered.com/ISteamApps/GetAppList/v2/".to_string(),
            detail_url: "https://steamspy.com/api.php".to_string(),
            listing_timeout: Duration::from_secs(20),
            detail_timeout: Duration::from_secs(10),
        }
    }
}

/// Steam app listing + SteamSpy `appdetails` over HTTP.
pub struct SteamSpyApi {
    http: HttpFetcher,
    endpoints: SteamSpyEndpoints,
}

impl SteamSpyApi {
    pub fn new(http: HttpFetcher, endpoints: SteamSpyEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn detail_url_for(&self, id: CatalogId) -> String {
        format!("{}?request=appdetails&appid={id}", self.endpoints.detail_url)
    }
}

#[async_trait]
impl CatalogApi for SteamSpyApi {
    async fn list_ids(&self) -> Result<Vec<CatalogId>, AdapterError> {
        let response: AppListResponse = self
            .http
            .fetch_json(&self.endpoints.listing_url, Some(self.endpoints.listing_timeout))
            .await
            .map_err(AdapterError::Listing)?;
        Ok(app_ids(response))
    }

    async fn fetch_detail(&self, id: CatalogId) -> Result<Option<JsonValue>, AdapterError> {
        let payload: JsonValue = self
            .http
            .fetch_json(&self.detail_url_for(id), Some(self.endpoints.detail_timeout))
            .await
            .map_err(|source| AdapterError::Detail { id, source })?;
        Ok(is_usable_payload(&payload).then_some(payload))
    }
}

/// Result of decoding one upstream field.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Missing,
    Present(T),
    Malformed(String),
}

// Hand-written so `Decoded<T>` is `Default` without requiring `T: Default`.
impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Decoded::Missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Price {
    Free,
    MinorUnits(f64),
}

/// Typed view of a detail payload. Nothing is defaulted here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetailPayload {
    pub appid: Decoded<i64>,
    pub name: Decoded<String>,
    pub developer: Decoded<String>,
    pub publisher: Decoded<String>,
    pub score_rank: Decoded<String>,
    pub positive: Decoded<u64>,
    pub negative: Decoded<u64>,
    pub owners: Decoded<String>,
    pub average_forever: Decoded<u64>,
    pub average_2weeks: Decoded<u64>,
    pub median_forever: Decoded<u64>,
    pub median_2weeks: Decoded<u64>,
    pub ccu: Decoded<u64>,
    pub price: Decoded<Price>,
    pub initial_price: Decoded<Price>,
    pub discount: Decoded<f64>,
    pub languages: Decoded<String>,
    pub genre: Decoded<String>,
    pub tags: Decoded<BTreeSet<String>>,
}

impl DetailPayload {
    /// `None` when the payload is not a JSON object.
    pub fn decode(payload: &JsonValue) -> Option<Self> {
        let object = payload.as_object()?;
        let get = |key: &str| object.get(key);
        Some(Self {
            appid: int(get("appid")),
            name: text(get("name")),
            developer: text(get("developer")),
            publisher: text(get("publisher")),
            score_rank: text(get("score_rank")),
            positive: count(get("positive")),
            negative: count(get("negative")),
            owners: text(get("owners")),
            average_forever: count(get("average_forever")),
            average_2weeks: count(get("average_2weeks")),
            median_forever: count(get("median_forever")),
            median_2weeks: count(get("median_2weeks")),
            ccu: count(get("ccu")),
            price: price(get("price")),
            initial_price: price(get("initialprice")),
            discount: float(get("discount")),
            languages: text(get("languages")),
            genre: text(get("genre")),
            tags: tags(get("tags")),
        })
    }
}

fn text(value: Option<&JsonValue>) -> Decoded<String> {
    match value {
        None | Some(JsonValue::Null) => Decoded::Missing,
        Some(JsonValue::String(s)) => Decoded::Present(s.clone()),
        Some(JsonValue::Number(n)) => Decoded::Present(n.to_string()),
        Some(other) => Decoded::Malformed(format!("expected text, got {other}")),
    }
}

fn int(value: Option<&JsonValue>) -> Decoded<i64> {
    match value {
        None | Some(JsonValue::Null) => Decoded::Missing,
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .map(Decoded::Present)
            .unwrap_or_else(|| Decoded::Malformed(format!("not an integer: {n}"))),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Decoded::Missing,
        Some(JsonValue::String(s)) => s
            .trim()
            .parse()
            .map(Decoded::Present)
            .unwrap_or_else(|_| Decoded::Malformed(format!("not an integer: {s:?}"))),
        Some(other) => Decoded::Malformed(format!("expected integer, got {other}")),
    }
}

fn count(value: Option<&JsonValue>) -> Decoded<u64> {
    match int(value) {
        Decoded::Present(n) => u64::try_from(n)
            .map(Decoded::Present)
            .unwrap_or_else(|_| Decoded::Malformed(format!("negative count {n}"))),
        Decoded::Missing => Decoded::Missing,
        Decoded::Malformed(reason) => Decoded::Malformed(reason),
    }
}

fn float(value: Option<&JsonValue>) -> Decoded<f64> {
    let parsed = match value {
        None | Some(JsonValue::Null) => return Decoded::Missing,
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) if s.trim().is_empty() => return Decoded::Missing,
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        Some(other) => return Decoded::Malformed(format!("expected number, got {other}")),
    };
    match parsed {
        Some(v) if v.is_finite() => Decoded::Present(v),
        _ => Decoded::Malformed(format!("not a finite number: {value:?}")),
    }
}

fn price(value: Option<&JsonValue>) -> Decoded<Price> {
    if let Some(JsonValue::String(s)) = value {
        if s.trim() == FREE_PRICE_SENTINEL {
            return Decoded::Present(Price::Free);
        }
    }
    match float(value) {
        Decoded::Present(v) => Decoded::Present(Price::MinorUnits(v)),
        Decoded::Missing => Decoded::Missing,
        Decoded::Malformed(reason) => Decoded::Malformed(reason),
    }
}

fn tags(value: Option<&JsonValue>) -> Decoded<BTreeSet<String>> {
    match value {
        None | Some(JsonValue::Null) => Decoded::Missing,
        Some(JsonValue::Object(map)) => {
            Decoded::Present(map.keys().map(|k| k.trim().to_lowercase()).collect())
        }
        // upstream sends `[]` when an app has no tags
        Some(JsonValue::Array(items)) => Decoded::Present(
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(|k| k.trim().to_lowercase())
                .collect(),
        ),
        Some(other) => Decoded::Malformed(format!("expected tag map, got {other}")),
    }
}

/// A field that could not be decoded; the record keeps the documented default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct TransformError {
    pub field: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub raw: RawRecord,
    pub cleaned: CleanedRecord,
    pub warnings: Vec<TransformError>,
}

/// Parse `"min .. max"` (thousands separators allowed). One bound fills both.
pub fn parse_owner_range(text: &str) -> Result<(u64, u64), TransformError> {
    let malformed = || TransformError {
        field: "owners",
        reason: format!("unparsable owner range {text:?}"),
    };
    let cleaned = text.replace(',', "");
    let bounds: Vec<&str> = cleaned.split("..").map(str::trim).collect();
    let parse = |s: &str| s.parse::<u64>().map_err(|_| malformed());
    match bounds.as_slice() {
        [single] => {
            let v = parse(single)?;
            Ok((v, v))
        }
        [min, max] => Ok((parse(min)?, parse(max)?)),
        _ => Err(malformed()),
    }
}

/// Split a comma-joined list, trimming and dropping empty pieces.
pub fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

struct Defaulter {
    warnings: Vec<TransformError>,
}

impl Defaulter {
    fn take<T>(&mut self, field: &'static str, decoded: Decoded<T>) -> Option<T> {
        match decoded {
            Decoded::Present(v) => Some(v),
            Decoded::Missing => None,
            Decoded::Malformed(reason) => {
                self.warnings.push(TransformError { field, reason });
                None
            }
        }
    }

    fn company(&mut self, field: &'static str, decoded: Decoded<String>) -> String {
        self.take(field, decoded)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_COMPANY.to_string())
    }

    fn price(&mut self, field: &'static str, decoded: Decoded<Price>) -> f64 {
        match self.take(field, decoded) {
            Some(Price::MinorUnits(minor)) => minor / 100.0,
            Some(Price::Free) | None => 0.0,
        }
    }
}

/// Project a detail payload into raw + cleaned records. Never fails; fields that
/// cannot be decoded fall back to defaults and are reported in `warnings`.
pub fn transform(id: CatalogId, payload: &JsonValue, load_date: NaiveDate) -> Transformed {
    let mut d = Defaulter {
        warnings: Vec::new(),
    };
    let decoded = DetailPayload::decode(payload).unwrap_or_else(|| {
        d.warnings.push(TransformError {
            field: "payload",
            reason: "payload is not a JSON object".to_string(),
        });
        DetailPayload::default()
    });

    let name = d.take("name", decoded.name);
    let owners = d.take("owners", decoded.owners);
    let (min_owners, max_owners) = match owners.as_deref().map(str::trim) {
        None | Some("") => (0, 0),
        Some(text) => parse_owner_range(text).unwrap_or_else(|err| {
            d.warnings.push(err);
            (0, 0)
        }),
    };

    let attributes = CatalogAttributes {
        name: name.clone(),
        genre: d
            .take("genre", decoded.genre)
            .map(|g| split_list(&g).into_iter().collect())
            .unwrap_or_default(),
        tags: d
            .take("tags", decoded.tags)
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect(),
        positive: d.take("positive", decoded.positive).unwrap_or(0),
        negative: d.take("negative", decoded.negative).unwrap_or(0),
        developer: d.company("developer", decoded.developer),
        publisher: d.company("publisher", decoded.publisher),
        score_rank: d
            .take("score_rank", decoded.score_rank)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| UNRANKED.to_string()),
        owners,
        min_owners,
        max_owners,
        average_forever: d.take("average_forever", decoded.average_forever).unwrap_or(0),
        average_2weeks: d.take("average_2weeks", decoded.average_2weeks).unwrap_or(0),
        median_forever: d.take("median_forever", decoded.median_forever).unwrap_or(0),
        median_2weeks: d.take("median_2weeks", decoded.median_2weeks).unwrap_or(0),
        ccu: d.take("ccu", decoded.ccu).unwrap_or(0),
        price: d.price("price", decoded.price),
        initial_price: d.price("initialprice", decoded.initial_price),
        discount: d.take("discount", decoded.discount).unwrap_or(0.0),
        languages: d
            .take("languages", decoded.languages)
            .map(|l| split_list(&l))
            .unwrap_or_default(),
    };

    for warning in &d.warnings {
        warn!(app_id = %id, field = warning.field, reason = %warning.reason, "field defaulted");
    }

    Transformed {
        raw: RawRecord {
            id,
            name,
            data: payload.clone(),
            load_date,
        },
        cleaned: CleanedRecord {
            id,
            attributes,
            load_date,
        },
        warnings: d.warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> CatalogId {
        CatalogId::new(raw).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()
    }

    #[test]
    fn owner_ranges_parse_with_separators_and_single_bounds() {
        assert_eq!(parse_owner_range("0 .. 20,000").unwrap(), (0, 20_000));
        assert_eq!(parse_owner_range("0").unwrap(), (0, 0));
        assert_eq!(
            parse_owner_range("1,000,000 .. 2,000,000").unwrap(),
            (1_000_000, 2_000_000)
        );
        assert_eq!(parse_owner_range("lots").unwrap_err().field, "owners");
        assert!(parse_owner_range("1 .. 2 .. 3").is_err());
    }

    #[test]
    fn sentinel_and_empty_payloads_are_not_usable() {
        assert!(!is_usable_payload(&json!({})));
        assert!(!is_usable_payload(&json!([])));
        assert!(!is_usable_payload(&json!({"appid": 999999, "name": null})));
        assert!(!is_usable_payload(&json!({"appid": "999999"})));
        assert!(is_usable_payload(&json!({"appid": 10, "name": "Counter-Strike"})));
    }

    #[test]
    fn missing_fields_take_documented_defaults() {
        let out = transform(id(42), &json!({"appid": 42}), day());
        let attrs = &out.cleaned.attributes;
        assert_eq!(attrs.developer, "Unknown");
        assert_eq!(attrs.publisher, "Unknown");
        assert_eq!(attrs.score_rank, "N/A");
        assert_eq!(attrs.positive, 0);
        assert_eq!(attrs.ccu, 0);
        assert_eq!((attrs.min_owners, attrs.max_owners), (0, 0));
        assert!(attrs.genre.is_empty());
        assert!(attrs.languages.is_empty());
        assert_eq!(attrs.price, 0.0);
        assert!(out.warnings.is_empty());
        assert_eq!(out.cleaned.load_date, day());
    }

    #[test]
    fn empty_strings_are_defaulted_like_missing_values() {
        let payload = json!({
            "developer": "", "publisher": "  ", "score_rank": "", "genre": "", "owners": ""
        });
        let attrs = transform(id(1), &payload, day()).cleaned.attributes;
        assert_eq!(attrs.developer, "Unknown");
        assert_eq!(attrs.publisher, "Unknown");
        assert_eq!(attrs.score_rank, "N/A");
        assert!(attrs.genre.is_empty());
    }

    #[test]
    fn prices_are_converted_from_minor_units_and_free_sentinel_is_zero() {
        let paid = transform(
            id(1),
            &json!({"price": "999", "initialprice": 1999, "discount": "50"}),
            day(),
        );
        assert_eq!(paid.cleaned.attributes.price, 9.99);
        assert_eq!(paid.cleaned.attributes.initial_price, 19.99);
        assert_eq!(paid.cleaned.attributes.discount, 50.0);

        let free = transform(
            id(2),
            &json!({"price": "Free to Play", "initialprice": null}),
            day(),
        );
        assert_eq!(free.cleaned.attributes.price, 0.0);
        assert_eq!(free.cleaned.attributes.initial_price, 0.0);
        assert!(free.warnings.is_empty());
    }

    #[test]
    fn tags_are_lowercased_and_deduplicated() {
        let payload = json!({"tags": {"FPS": 10, "fps": 3, "Action": 1}});
        let attrs = transform(id(1), &payload, day()).cleaned.attributes;
        assert_eq!(
            attrs.tags.into_iter().collect::<Vec<_>>(),
            vec!["action".to_string(), "fps".to_string()]
        );
        let untagged = transform(id(1), &json!({"tags": []}), day());
        assert!(untagged.cleaned.attributes.tags.is_empty());
    }

    #[test]
    fn genre_and_languages_are_split_and_trimmed() {
        let payload = json!({"genre": "Action, Indie ,", "languages": "English, French"});
        let attrs = transform(id(1), &payload, day()).cleaned.attributes;
        assert_eq!(
            attrs.genre.into_iter().collect::<Vec<_>>(),
            vec!["Action".to_string(), "Indie".to_string()]
        );
        assert_eq!(attrs.languages, vec!["English", "French"]);
    }

    #[test]
    fn malformed_fields_are_defaulted_and_reported_without_dropping_the_record() {
        let payload = json!({
            "name": "Broken",
            "owners": "many .. more",
            "price": "ten dollars",
            "positive": -3,
            "tags": "oops"
        });
        let out = transform(id(7), &payload, day());
        let attrs = &out.cleaned.attributes;
        assert_eq!(attrs.name.as_deref(), Some("Broken"));
        assert_eq!((attrs.min_owners, attrs.max_owners), (0, 0));
        assert_eq!(attrs.owners.as_deref(), Some("many .. more"));
        assert_eq!(attrs.price, 0.0);
        assert_eq!(attrs.positive, 0);
        assert!(attrs.tags.is_empty());
        let fields: Vec<_> = out.warnings.iter().map(|w| w.field).collect();
        assert!(fields.contains(&"owners"));
        assert!(fields.contains(&"price"));
        assert!(fields.contains(&"positive"));
        assert!(fields.contains(&"tags"));
    }

    #[test]
    fn non_object_payload_produces_a_default_record() {
        let out = transform(id(9), &json!("nope"), day());
        assert_eq!(out.cleaned.id, id(9));
        assert_eq!(out.cleaned.attributes, CatalogAttributes::default());
        assert_eq!(out.warnings[0].field, "payload");
        assert_eq!(out.raw.data, json!("nope"));
    }

    #[test]
    fn numeric_score_rank_is_stringified() {
        let attrs = transform(id(1), &json!({"score_rank": 97}), day()).cleaned.attributes;
        assert_eq!(attrs.score_rank, "97");
    }

    struct ListingOnly(Vec<CatalogId>);

    #[async_trait]
    impl CatalogApi for ListingOnly {
        async fn list_ids(&self) -> Result<Vec<CatalogId>, AdapterError> {
            Ok(self.0.clone())
        }

        async fn fetch_detail(&self, _id: CatalogId) -> Result<Option<JsonValue>, AdapterError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn listing_is_deduplicated_in_first_seen_order() {
        let api = ListingOnly(vec![id(5), id(3), id(5), id(1), id(3)]);
        let ids = list_all_ids(&api).await.unwrap();
        assert_eq!(ids, vec![id(5), id(3), id(1)]);
    }

    #[test]
    fn listing_payload_drops_missing_and_non_positive_ids() {
        let parsed: AppListResponse = serde_json::from_value(json!({
            "applist": {"apps": [
                {"appid": 10, "name": "Counter-Strike"},
                {"appid": 0, "name": ""},
                {"name": "no id"},
                {"appid": 20, "name": "Team Fortress Classic"}
            ]}
        }))
        .unwrap();
        assert_eq!(app_ids(parsed), vec![id(10), id(20)]);
    }
}
