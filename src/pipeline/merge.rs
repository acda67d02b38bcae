//! Joins one trending entry with its optional companion rows into a single
//! canonical record.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use crate::database_ops::db::{
    CatalogEntry, CleanedRecord, PlayerCountEntry, PopularityEntry, TrendingEntry, NAME_MAX_CHARS,
};
use crate::normalization::owners::parse_owners_lower_bound;
use crate::normalization::price::normalize_price_to_major_units;
use crate::normalization::value::coerce_int;
use crate::pipeline::RunIdentity;

/// Merge the four sources for one game into a canonical record.
///
/// Absent companions are the common case, not an error: a game can trend
/// before SteamSpy has stats for it or before the store lists it. Returns
/// `None` when the entry fails the required-field guard (appid coercible and
/// positive, name non-empty after catalog fallback) — a data-quality drop,
/// logged and skipped, never fatal to the batch.
pub fn merge_game_record(
    trending: &TrendingEntry,
    catalog: Option<&CatalogEntry>,
    player_count: Option<&PlayerCountEntry>,
    popularity: Option<&PopularityEntry>,
    run: &RunIdentity,
) -> Option<CleanedRecord> {
    let merged = catch_unwind(AssertUnwindSafe(|| {
        merge_inner(trending, catalog, player_count, popularity, run)
    }));
    match merged {
        Ok(record) => record,
        Err(cause) => {
            // A single bad record must not take the batch down with it.
            let cause = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(appid = %trending.appid, %cause, "unexpected merge failure; record dropped");
            None
        }
    }
}

fn merge_inner(
    trending: &TrendingEntry,
    catalog: Option<&CatalogEntry>,
    player_count: Option<&PlayerCountEntry>,
    popularity: Option<&PopularityEntry>,
    run: &RunIdentity,
) -> Option<CleanedRecord> {
    let appid = coerce_int(&trending.appid, None);
    let name = catalog
        .map(|c| c.name.as_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(trending.name.as_str());

    let appid = match appid {
        Some(id) if id > 0 => id,
        _ => {
            warn!(appid = %trending.appid, name, "record skipped: missing or invalid appid");
            return None;
        }
    };
    if name.is_empty() {
        warn!(appid, "record skipped: no name in catalog or trending entry");
        return None;
    }

    let current_players =
        player_count.and_then(|p| coerce_int(&p.current_players, None));

    let mut ccu = None;
    let mut positive_reviews = None;
    let mut negative_reviews = None;
    let mut average_playtime_forever = None;
    let mut median_playtime_forever = None;
    let mut average_playtime_2weeks = None;
    let mut median_playtime_2weeks = None;
    let mut price_usd = None;
    if let Some(stats) = popularity {
        ccu = coerce_int(&stats.ccu, None);
        positive_reviews = coerce_int(&stats.positive, None);
        negative_reviews = coerce_int(&stats.negative, None);
        average_playtime_forever = coerce_int(&stats.average_forever, None);
        median_playtime_forever = coerce_int(&stats.median_forever, None);
        average_playtime_2weeks = coerce_int(&stats.average_2weeks, None);
        median_playtime_2weeks = coerce_int(&stats.median_2weeks, None);
        price_usd = normalize_price_to_major_units(&stats.price);
    }

    let estimated_owners = popularity
        .and_then(|stats| stats.owners.as_deref())
        .filter(|owners| !owners.is_empty())
        .and_then(|owners| parse_owners_lower_bound(Some(owners)));

    // A zero popularity price means "free or unknown" upstream; the catalog
    // price is the better source when it has a real one.
    if price_usd.map_or(true, |p| p == 0.0) {
        if let Some(c) = catalog {
            if let Some(fallback) =
                normalize_price_to_major_units(&c.price).filter(|p| *p != 0.0)
            {
                price_usd = Some(fallback);
            }
        }
    }

    Some(CleanedRecord {
        run_date: run.run_date,
        run_hour: run.run_hour,
        appid,
        name: truncate_chars(name, NAME_MAX_CHARS),
        current_players,
        ccu,
        average_playtime_2weeks,
        median_playtime_2weeks,
        estimated_owners,
        positive_reviews,
        negative_reviews,
        average_playtime_forever,
        median_playtime_forever,
        price_usd,
        // No upstream source supplies these yet; the columns stay so the
        // analytics schema does not shift when one appears.
        score_rank: 0,
        discount_percent: 0,
    })
}

/// Truncate to the storage width without splitting a code point.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::{json, Value};

    fn run() -> RunIdentity {
        RunIdentity::new(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(), 13).unwrap()
    }

    fn trending(appid: Value, name: &str) -> TrendingEntry {
        TrendingEntry {
            appid,
            name: name.to_string(),
            median_2weeks: json!(5),
        }
    }

    fn popularity(appid: i64) -> PopularityEntry {
        PopularityEntry {
            appid,
            owners: Some("1,000 .. 2,000".to_string()),
            ccu: json!(10),
            positive: json!(5),
            negative: json!(1),
            average_forever: json!(300),
            average_2weeks: json!(120),
            median_forever: json!(250),
            median_2weeks: json!(100),
            price: json!(500),
            tags: "Action".to_string(),
        }
    }

    #[test]
    fn merges_all_sources_into_one_record() {
        let t = trending(json!(10), "A");
        let players = PlayerCountEntry {
            appid: 10,
            current_players: json!(42),
        };
        let stats = popularity(10);

        let record = merge_game_record(&t, None, Some(&players), Some(&stats), &run()).unwrap();
        assert_eq!(record.appid, 10);
        assert_eq!(record.name, "A");
        assert_eq!(record.current_players, Some(42));
        assert_eq!(record.ccu, Some(10));
        assert_eq!(record.positive_reviews, Some(5));
        assert_eq!(record.negative_reviews, Some(1));
        assert_eq!(record.estimated_owners, Some(1_000));
        assert_eq!(record.price_usd, Some(5.0));
        assert_eq!(record.score_rank, 0);
        assert_eq!(record.discount_percent, 0);
        assert_eq!(record.run_date, run().run_date);
        assert_eq!(record.run_hour, 13);
    }

    #[test]
    fn catalog_name_wins_over_trending_name() {
        let t = trending(json!(10), "Game X");
        let catalog = CatalogEntry {
            appid: 10,
            name: "Game Y".to_string(),
            ..Default::default()
        };
        let record = merge_game_record(&t, Some(&catalog), None, None, &run()).unwrap();
        assert_eq!(record.name, "Game Y");
    }

    #[test]
    fn trending_name_used_when_catalog_absent_or_empty() {
        let t = trending(json!(10), "Game X");
        let record = merge_game_record(&t, None, None, None, &run()).unwrap();
        assert_eq!(record.name, "Game X");

        let empty_name = CatalogEntry {
            appid: 10,
            ..Default::default()
        };
        let record = merge_game_record(&t, Some(&empty_name), None, None, &run()).unwrap();
        assert_eq!(record.name, "Game X");
    }

    #[test]
    fn drops_records_without_required_fields() {
        // no name anywhere
        assert!(merge_game_record(&trending(json!(10), ""), None, None, None, &run()).is_none());
        // appid not coercible
        assert!(merge_game_record(&trending(Value::Null, "A"), None, None, None, &run()).is_none());
        assert!(merge_game_record(&trending(json!(""), "A"), None, None, None, &run()).is_none());
        // non-positive appid
        assert!(merge_game_record(&trending(json!(0), "A"), None, None, None, &run()).is_none());
        assert!(merge_game_record(&trending(json!(-3), "A"), None, None, None, &run()).is_none());
    }

    #[test]
    fn absent_companions_leave_fields_empty() {
        let record =
            merge_game_record(&trending(json!(10), "A"), None, None, None, &run()).unwrap();
        assert_eq!(record.current_players, None);
        assert_eq!(record.ccu, None);
        assert_eq!(record.estimated_owners, None);
        assert_eq!(record.price_usd, None);
    }

    #[test]
    fn catalog_price_fills_in_when_popularity_price_missing_or_zero() {
        let catalog = CatalogEntry {
            appid: 10,
            name: "A".to_string(),
            price: json!(1999),
            ..Default::default()
        };

        // popularity absent entirely
        let record =
            merge_game_record(&trending(json!(10), "A"), Some(&catalog), None, None, &run())
                .unwrap();
        assert_eq!(record.price_usd, Some(19.99));

        // popularity present but free
        let mut stats = popularity(10);
        stats.price = json!(0);
        let record = merge_game_record(
            &trending(json!(10), "A"),
            Some(&catalog),
            None,
            Some(&stats),
            &run(),
        )
        .unwrap();
        assert_eq!(record.price_usd, Some(19.99));
    }

    #[test]
    fn popularity_price_wins_when_present() {
        let catalog = CatalogEntry {
            appid: 10,
            name: "A".to_string(),
            price: json!(1999),
            ..Default::default()
        };
        let stats = popularity(10);
        let record = merge_game_record(
            &trending(json!(10), "A"),
            Some(&catalog),
            None,
            Some(&stats),
            &run(),
        )
        .unwrap();
        assert_eq!(record.price_usd, Some(5.0));
    }

    #[test]
    fn empty_owners_string_yields_no_estimate() {
        let mut stats = popularity(10);
        stats.owners = Some(String::new());
        let record =
            merge_game_record(&trending(json!(10), "A"), None, None, Some(&stats), &run())
                .unwrap();
        assert_eq!(record.estimated_owners, None);

        stats.owners = None;
        let record =
            merge_game_record(&trending(json!(10), "A"), None, None, Some(&stats), &run())
                .unwrap();
        assert_eq!(record.estimated_owners, None);
    }

    #[test]
    fn name_is_truncated_to_column_width() {
        let long = "й".repeat(700);
        let record = merge_game_record(&trending(json!(10), &long), None, None, None, &run())
            .unwrap();
        assert_eq!(record.name.chars().count(), 500);
    }

    #[test]
    fn appid_as_numeric_string_is_accepted() {
        let record =
            merge_game_record(&trending(json!("730"), "CS"), None, None, None, &run()).unwrap();
        assert_eq!(record.appid, 730);
    }
}
