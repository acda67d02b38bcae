//! Fans the merge across one run's trending batch.

use std::collections::HashMap;

use tracing::info;

use crate::database_ops::db::{
    CatalogEntry, CleanedRecord, PlayerCountEntry, PopularityEntry, TrendingEntry,
};
use crate::normalization::value::coerce_int;
use crate::pipeline::merge::merge_game_record;
use crate::pipeline::RunIdentity;

/// Merge every trending entry with its companions, preserving trending
/// order. Entries that fail the merge guard are dropped (counted, logged);
/// the returned batch is the run's complete upsert payload.
///
/// Deterministic: identical inputs produce an identical sequence, which is
/// what makes re-running a completed hour converge instead of diverging.
pub fn aggregate_run(
    trending: &[TrendingEntry],
    catalog_by_appid: &HashMap<i64, CatalogEntry>,
    players_by_appid: &HashMap<i64, PlayerCountEntry>,
    popularity_by_appid: &HashMap<i64, PopularityEntry>,
    run: &RunIdentity,
) -> Vec<CleanedRecord> {
    let mut records = Vec::with_capacity(trending.len());

    for entry in trending {
        let appid = coerce_int(&entry.appid, None);
        let catalog = appid.and_then(|id| catalog_by_appid.get(&id));
        let players = appid.and_then(|id| players_by_appid.get(&id));
        let popularity = appid.and_then(|id| popularity_by_appid.get(&id));

        if let Some(record) = merge_game_record(entry, catalog, players, popularity, run) {
            records.push(record);
        }
    }

    info!(
        cleaned = records.len(),
        trending = trending.len(),
        dropped = trending.len() - records.len(),
        %run,
        "aggregated run batch"
    );
    records
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
            median_2weeks: Value::Null,
        }
    }

    #[test]
    fn preserves_trending_order_minus_drops() {
        let batch = vec![
            trending(json!(30), "C"),
            trending(json!(10), "A"),
            trending(json!(0), "invalid"),
            trending(json!(20), "B"),
        ];
        let records = aggregate_run(
            &batch,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &run(),
        );
        let appids: Vec<i64> = records.iter().map(|r| r.appid).collect();
        assert_eq!(appids, vec![30, 10, 20]);
    }

    #[test]
    fn identical_inputs_yield_identical_batches() {
        let batch = vec![trending(json!(10), "A"), trending(json!(20), "B")];
        let mut players = HashMap::new();
        players.insert(
            10,
            PlayerCountEntry {
                appid: 10,
                current_players: json!(42),
            },
        );
        let first = aggregate_run(&batch, &HashMap::new(), &players, &HashMap::new(), &run());
        let second = aggregate_run(&batch, &HashMap::new(), &players, &HashMap::new(), &run());
        assert_eq!(first, second);
    }

    #[test]
    fn empty_trending_is_a_no_op() {
        let records = aggregate_run(
            &[],
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &run(),
        );
        assert!(records.is_empty());
    }

    #[test]
    fn companions_join_by_appid() {
        let batch = vec![trending(json!(10), "A"), trending(json!(20), "B")];
        let mut popularity = HashMap::new();
        popularity.insert(
            20,
            PopularityEntry {
                appid: 20,
                owners: Some("1,000 .. 2,000".to_string()),
                ccu: json!(77),
                ..Default::default()
            },
        );
        let records = aggregate_run(&batch, &HashMap::new(), &HashMap::new(), &popularity, &run());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ccu, None);
        assert_eq!(records[1].ccu, Some(77));
        assert_eq!(records[1].estimated_owners, Some(1_000));
    }

    #[test]
    fn end_to_end_scenario() {
        let batch = vec![TrendingEntry {
            appid: json!(10),
            name: "A".to_string(),
            median_2weeks: json!(5),
        }];
        let mut players = HashMap::new();
        players.insert(
            10,
            PlayerCountEntry {
                appid: 10,
                current_players: json!(42),
            },
        );
        let mut popularity = HashMap::new();
        popularity.insert(
            10,
            PopularityEntry {
                appid: 10,
                owners: Some("1,000 .. 2,000".to_string()),
                ccu: json!(10),
                positive: json!(5),
                negative: json!(1),
                price: json!(500),
                ..Default::default()
            },
        );

        let records = aggregate_run(&batch, &HashMap::new(), &players, &popularity, &run());
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.appid, 10);
        assert_eq!(r.name, "A");
        assert_eq!(r.current_players, Some(42));
        assert_eq!(r.ccu, Some(10));
        assert_eq!(r.positive_reviews, Some(5));
        assert_eq!(r.negative_reviews, Some(1));
        assert_eq!(r.estimated_owners, Some(1_000));
        assert_eq!(r.price_usd, Some(5.0));
        assert_eq!(r.score_rank, 0);
        assert_eq!(r.discount_percent, 0);
    }
}
