//! Rolling-window bar cache
//!
//! Bars are keyed by `(contract, bar_size, ts)` and idempotent on
//! re-fetch. Coverage intervals track which sub-ranges are already local
//! so each read only fetches the minimal uncached gaps, in page-sized
//! slices. Partial (still-forming) buckets are stored but never marked
//! covered, so they refresh on the next read.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::gateway::GatewayClient;
use crate::marketdata::{Bar, BarRequest, BarSize};
use crate::models::PriceBasis;

const DEFAULT_PAGE_SIZE: usize = 500;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS bars (
    contract TEXT NOT NULL,
    bar_size TEXT NOT NULL,
    ts INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    wap REAL,
    PRIMARY KEY (contract, bar_size, ts)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS bar_coverage (
    contract TEXT NOT NULL,
    bar_size TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bar_coverage_lookup
    ON bar_coverage(contract, bar_size, start_ts);
"#;

/// What a read cost: hit ratio over the requested span, the gap segments
/// actually fetched, and whether `max_bars` truncated the result.
#[derive(Debug, Clone, Serialize)]
pub struct FetchMeta {
    pub cache_hit_ratio: f64,
    pub fetch_segments: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    pub bars_returned: usize,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct BarWindowCache {
    conn: Arc<Mutex<Connection>>,
}

impl BarWindowCache {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Serve a rolling-window read: fetch the minimal uncached sub-ranges
    /// from the gateway, persist them, and return the merged series plus
    /// meta. Rejects `end <= start`. When `max_bars` bites, the newest
    /// `max_bars` are returned and the meta says so.
    pub async fn get_historical_bars(
        &self,
        gateway: &dyn GatewayClient,
        req: &BarRequest,
        max_bars: Option<usize>,
        page_size: Option<usize>,
    ) -> EngineResult<(Vec<Bar>, FetchMeta)> {
        if req.end <= req.start {
            return Err(EngineError::Validation(format!(
                "bar request end {} must be after start {}",
                req.end, req.start
            )));
        }

        let size = req.bar_size;
        let start_ts = size.floor(req.start).timestamp();
        let end_ts = req.end.timestamp();
        // A bucket still forming at `end` can change; never mark it covered.
        let complete_end_ts = size.floor(req.end).timestamp();

        let gaps = {
            let conn = self.conn.lock();
            uncovered_ranges(&conn, &req.contract, size, start_ts, end_ts)?
        };

        let page = page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let page_span = (page as i64) * size.seconds();
        let mut fetch_segments = Vec::new();

        for (gap_start, gap_end) in &gaps {
            let mut cursor = *gap_start;
            while cursor < *gap_end {
                let slice_end = (cursor + page_span).min(*gap_end);
                let slice = BarRequest {
                    contract: req.contract.clone(),
                    bar_size: size,
                    start: DateTime::from_timestamp(cursor, 0).unwrap_or(req.start),
                    end: DateTime::from_timestamp(slice_end, 0).unwrap_or(req.end),
                    what_to_show: req.what_to_show,
                    use_rth: req.use_rth,
                    include_partial_bar: true,
                };
                let bars = gateway.fetch_bars(&slice).await?;
                debug!(
                    contract = %req.contract,
                    bar_size = size.as_str(),
                    from = cursor,
                    to = slice_end,
                    count = bars.len(),
                    "fetched bar slice"
                );
                {
                    let mut conn = self.conn.lock();
                    upsert_bars(&mut conn, &req.contract, size, &bars)?;
                    let covered_to = slice_end.min(complete_end_ts);
                    if covered_to > cursor {
                        record_coverage(&mut conn, &req.contract, size, cursor, covered_to)?;
                    }
                }
                fetch_segments.push((slice.start, slice.end));
                cursor = slice_end;
            }
        }

        let mut bars = {
            let conn = self.conn.lock();
            read_bars(&conn, &req.contract, size, start_ts, end_ts)?
        };
        if !req.include_partial_bar {
            let size_secs = size.seconds();
            bars.retain(|b| b.ts.timestamp() + size_secs <= end_ts);
        }

        let requested_span = (end_ts - start_ts) as f64;
        let fetched_span: f64 = gaps.iter().map(|(s, e)| (e - s) as f64).sum();
        let hit_ratio = if requested_span > 0.0 {
            (1.0 - fetched_span / requested_span).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let mut truncated = false;
        if let Some(cap) = max_bars {
            if bars.len() > cap {
                // Keep the newest `cap` bars; the meta makes the cut visible.
                bars.drain(..bars.len() - cap);
                truncated = true;
            }
        }

        let meta = FetchMeta {
            cache_hit_ratio: hit_ratio,
            fetch_segments,
            bars_returned: bars.len(),
            truncated,
        };
        Ok((bars, meta))
    }

    /// Latest observable basis for a contract at `now`: the freshest
    /// minute bar, partial included. Used for anchors and mid snapshots.
    pub async fn latest_bar(
        &self,
        gateway: &dyn GatewayClient,
        contract: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Bar>> {
        let req = BarRequest {
            contract: contract.to_string(),
            bar_size: BarSize::Min1,
            start: now - chrono::Duration::minutes(10),
            end: now,
            what_to_show: Default::default(),
            use_rth: false,
            include_partial_bar: true,
        };
        let (bars, _) = self.get_historical_bars(gateway, &req, None, None).await?;
        Ok(bars.into_iter().last())
    }

    pub async fn latest_basis(
        &self,
        gateway: &dyn GatewayClient,
        contract: &str,
        basis: PriceBasis,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<f64>> {
        Ok(self
            .latest_bar(gateway, contract, now)
            .await?
            .map(|b| b.basis(basis)))
    }

    /// Test/seeding hook: insert bars and mark their span covered.
    pub fn seed_bars(&self, contract: &str, size: BarSize, bars: &[Bar]) -> EngineResult<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        upsert_bars(&mut conn, contract, size, bars)?;
        let start = bars.iter().map(|b| b.ts.timestamp()).min().unwrap();
        let end = bars.iter().map(|b| b.ts.timestamp()).max().unwrap() + size.seconds();
        record_coverage(&mut conn, contract, size, start, end)?;
        Ok(())
    }

    #[cfg(test)]
    fn coverage(&self, contract: &str, size: BarSize) -> Vec<(i64, i64)> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT start_ts, end_ts FROM bar_coverage
                 WHERE contract = ?1 AND bar_size = ?2 ORDER BY start_ts",
            )
            .unwrap();
        stmt.query_map(params![contract, size.as_str()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
    }

    #[cfg(test)]
    fn gaps(&self, contract: &str, size: BarSize, start: i64, end: i64) -> Vec<(i64, i64)> {
        let conn = self.conn.lock();
        uncovered_ranges(&conn, contract, size, start, end).unwrap()
    }
}

fn uncovered_ranges(
    conn: &Connection,
    contract: &str,
    size: BarSize,
    start_ts: i64,
    end_ts: i64,
) -> EngineResult<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT start_ts, end_ts FROM bar_coverage
         WHERE contract = ?1 AND bar_size = ?2 AND end_ts > ?3 AND start_ts < ?4
         ORDER BY start_ts",
    )?;
    let covered: Vec<(i64, i64)> = stmt
        .query_map(params![contract, size.as_str(), start_ts, end_ts], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut gaps = Vec::new();
    let mut cursor = start_ts;
    for (s, e) in covered {
        if s > cursor {
            gaps.push((cursor, s.min(end_ts)));
        }
        cursor = cursor.max(e);
        if cursor >= end_ts {
            break;
        }
    }
    if cursor < end_ts {
        gaps.push((cursor, end_ts));
    }
    Ok(gaps)
}

fn record_coverage(
    conn: &mut Connection,
    contract: &str,
    size: BarSize,
    start_ts: i64,
    end_ts: i64,
) -> EngineResult<()> {
    let tx = conn.transaction()?;
    let mut merged_start = start_ts;
    let mut merged_end = end_ts;
    {
        // Absorb every overlapping-or-touching interval into one row.
        let mut stmt = tx.prepare_cached(
            "SELECT start_ts, end_ts FROM bar_coverage
             WHERE contract = ?1 AND bar_size = ?2 AND end_ts >= ?3 AND start_ts <= ?4",
        )?;
        let rows: Vec<(i64, i64)> = stmt
            .query_map(params![contract, size.as_str(), start_ts, end_ts], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<_, _>>()?;
        for (s, e) in rows {
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(e);
        }
    }
    tx.execute(
        "DELETE FROM bar_coverage
         WHERE contract = ?1 AND bar_size = ?2 AND end_ts >= ?3 AND start_ts <= ?4",
        params![contract, size.as_str(), start_ts, end_ts],
    )?;
    tx.execute(
        "INSERT INTO bar_coverage (contract, bar_size, start_ts, end_ts) VALUES (?1, ?2, ?3, ?4)",
        params![contract, size.as_str(), merged_start, merged_end],
    )?;
    tx.commit()?;
    Ok(())
}

fn upsert_bars(
    conn: &mut Connection,
    contract: &str,
    size: BarSize,
    bars: &[Bar],
) -> EngineResult<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO bars
             (contract, bar_size, ts, open, high, low, close, volume, wap)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for b in bars {
            stmt.execute(params![
                contract,
                size.as_str(),
                b.ts.timestamp(),
                b.open,
                b.high,
                b.low,
                b.close,
                b.volume,
                b.wap,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn read_bars(
    conn: &Connection,
    contract: &str,
    size: BarSize,
    start_ts: i64,
    end_ts: i64,
) -> EngineResult<Vec<Bar>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, open, high, low, close, volume, wap FROM bars
         WHERE contract = ?1 AND bar_size = ?2 AND ts >= ?3 AND ts < ?4
         ORDER BY ts",
    )?;
    let bars = stmt
        .query_map(params![contract, size.as_str(), start_ts, end_ts], |row| {
            Ok(Bar {
                ts: DateTime::from_timestamp(row.get::<_, i64>(0)?, 0).unwrap_or_default(),
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
                wap: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_bars(start: i64, step: i64, closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                ts: DateTime::from_timestamp(start + step * i as i64, 0).unwrap(),
                open: *c,
                high: *c + 0.5,
                low: *c - 0.5,
                close: *c,
                volume: 100.0,
                wap: None,
            })
            .collect()
    }

    #[test]
    fn gap_math_finds_uncovered_subranges() {
        let cache = BarWindowCache::open_in_memory().unwrap();
        // Seed coverage [600, 1140): nine 1m bars starting at 600.
        cache
            .seed_bars("SLV", BarSize::Min1, &mk_bars(600, 60, &[1.0; 9]))
            .unwrap();
        let gaps = cache.gaps("SLV", BarSize::Min1, 0, 1800);
        assert_eq!(gaps, vec![(0, 600), (1140, 1800)]);

        // Fully covered span has no gaps.
        assert!(cache.gaps("SLV", BarSize::Min1, 600, 1140).is_empty());
    }

    #[test]
    fn coverage_intervals_merge() {
        let cache = BarWindowCache::open_in_memory().unwrap();
        cache
            .seed_bars("SLV", BarSize::Min1, &mk_bars(0, 60, &[1.0; 5]))
            .unwrap();
        cache
            .seed_bars("SLV", BarSize::Min1, &mk_bars(300, 60, &[1.0; 5]))
            .unwrap();
        assert_eq!(cache.coverage("SLV", BarSize::Min1), vec![(0, 600)]);
    }

    #[tokio::test]
    async fn rejects_inverted_range() {
        let cache = BarWindowCache::open_in_memory().unwrap();
        let gateway = crate::gateway::SimGateway::new();
        let end = DateTime::from_timestamp(600, 0).unwrap();
        let req = BarRequest {
            contract: "SLV".to_string(),
            bar_size: BarSize::Min1,
            start: end,
            end,
            what_to_show: Default::default(),
            use_rth: false,
            include_partial_bar: true,
        };
        let err = cache
            .get_historical_bars(&gateway, &req, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn max_bars_keeps_newest_and_flags_truncation() {
        let cache = BarWindowCache::open_in_memory().unwrap();
        let gateway = crate::gateway::SimGateway::new();
        let closes: Vec<f64> = (0..10).map(|i| 50.0 + i as f64).collect();
        gateway.push_bars("SLV", BarSize::Min1, mk_bars(0, 60, &closes));

        let req = BarRequest {
            contract: "SLV".to_string(),
            bar_size: BarSize::Min1,
            start: DateTime::from_timestamp(0, 0).unwrap(),
            end: DateTime::from_timestamp(600, 0).unwrap(),
            what_to_show: Default::default(),
            use_rth: false,
            include_partial_bar: true,
        };
        let (bars, meta) = cache
            .get_historical_bars(&gateway, &req, Some(4), None)
            .await
            .unwrap();
        assert_eq!(bars.len(), 4);
        assert!(meta.truncated);
        // Newest four survive the cap.
        assert_eq!(bars[0].close, 56.0);
        assert_eq!(bars[3].close, 59.0);

        // Second read is fully served from cache.
        let (_, meta) = cache
            .get_historical_bars(&gateway, &req, None, None)
            .await
            .unwrap();
        assert_eq!(meta.cache_hit_ratio, 1.0);
        assert!(meta.fetch_segments.is_empty());
    }

    #[test]
    fn reread_is_idempotent() {
        let cache = BarWindowCache::open_in_memory().unwrap();
        let bars = mk_bars(0, 60, &[1.0, 2.0, 3.0]);
        cache.seed_bars("SLV", BarSize::Min1, &bars).unwrap();
        cache.seed_bars("SLV", BarSize::Min1, &bars).unwrap();
        let conn = cache.conn.lock();
        let out = read_bars(&conn, "SLV", BarSize::Min1, 0, 180).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].close, 3.0);
    }
}
