use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, Table, TableDefinition, TableError};
use thiserror::Error;

use crate::sample::{CodecError, Measurement, Resolution};

/// Live ring capacity used when the configured size is not positive.
const DEFAULT_LIVE_SIZE: usize = 60;

type BucketDef = TableDefinition<'static, &'static str, &'static [u8]>;
type Bucket<'txn> = Table<'txn, &'static str, &'static [u8]>;

const MIN_BUCKET: BucketDef = TableDefinition::new("min");
const HOUR_BUCKET: BucketDef = TableDefinition::new("hour");
const DAY_BUCKET: BucketDef = TableDefinition::new("day");
const MON_BUCKET: BucketDef = TableDefinition::new("mon");

const fn bucket_def(res: Resolution) -> BucketDef {
    match res {
        Resolution::Minute => MIN_BUCKET,
        Resolution::Hour => HOUR_BUCKET,
        Resolution::Day => DAY_BUCKET,
        Resolution::Month => MON_BUCKET,
    }
}

/// Errors from the bucket store and aggregation engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// Operation on a closed engine. Close is terminal.
    #[error("database is not open")]
    NotOpen,
    /// Query against a bucket that was never created.
    #[error("bucket does not exist")]
    NoBucket,
    /// A stored value failed to decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("opening database: {0}")]
    Open(#[from] redb::DatabaseError),
    #[error("starting batch: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("opening bucket: {0}")]
    Bucket(#[from] redb::TableError),
    #[error("bucket storage: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("committing batch: {0}")]
    Commit(#[from] redb::CommitError),
}

struct DbState<S> {
    db: Option<Database>,
    live: VecDeque<S>,
    live_size: usize,
    last: Option<DateTime<Utc>>,
}

/// Time-hierarchy aggregation engine over a single-file store.
///
/// Samples land in four buckets keyed by UTC labels (minute, hour, day,
/// month). When an in-order insert crosses a period boundary the completed
/// period's finer entries are summed and shifted into the next-coarser
/// bucket. A short live window of the most recent in-order samples is kept
/// in memory. All persistent mutations of one public call happen in a
/// single atomic write transaction.
pub struct BwDb<S: Measurement> {
    inner: Mutex<DbState<S>>,
}

impl<S: Measurement> BwDb<S> {
    /// Open (creating if absent) the store at `path`.
    ///
    /// `live_size` bounds the in-memory live window; non-positive values
    /// fall back to the default of 60.
    pub fn open(path: impl AsRef<Path>, live_size: i64) -> Result<Self, DbError> {
        let db = Database::create(path)?;
        let live_size = if live_size <= 0 {
            DEFAULT_LIVE_SIZE
        } else {
            live_size as usize
        };

        Ok(Self {
            inner: Mutex::new(DbState {
                db: Some(db),
                live: VecDeque::with_capacity(live_size),
                live_size,
                last: None,
            }),
        })
    }

    /// Insert a sample.
    ///
    /// In-order samples (timestamp not before the engine's high-water mark)
    /// enter the live window, trigger any due rollups, and are folded into
    /// all four buckets; the high-water mark advances once the batch
    /// commits. Samples behind the high-water mark take the out-of-order
    /// path instead.
    pub fn add(&self, s: S) -> Result<(), DbError> {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        let db = st.db.as_ref().ok_or(DbError::NotOpen)?;

        if let Some(last) = st.last {
            if !s.at_or_after(last) {
                return insert_out_of_order(db, last, &s);
            }
        }

        st.live.push_front(s.clone());
        while st.live.len() > st.live_size {
            st.live.pop_back();
        }

        let last = match st.last {
            Some(t) => t,
            None => {
                st.last = Some(s.ts());
                s.ts()
            }
        };

        let txn = db.begin_write()?;
        {
            let mut minutes = txn.open_table(MIN_BUCKET)?;
            let mut hours = txn.open_table(HOUR_BUCKET)?;
            let mut days = txn.open_table(DAY_BUCKET)?;
            let mut months = txn.open_table(MON_BUCKET)?;

            let min_label = s.time_label(Resolution::Minute);
            let hour_label = s.time_label(Resolution::Hour);
            let day_label = s.time_label(Resolution::Day);
            let mon_label = s.time_label(Resolution::Month);

            // A changed coarser label means the previous period completed:
            // collapse its finer entries before the new sample lands.
            if hour_label != Resolution::Hour.label(last) {
                sum_and_shift::<S>(&mut minutes, &mut hours, &Resolution::Hour.label(last))?;
            }
            if day_label != Resolution::Day.label(last) {
                sum_and_shift::<S>(&mut hours, &mut days, &Resolution::Day.label(last))?;
            }
            if mon_label != Resolution::Month.label(last) {
                sum_and_shift::<S>(&mut days, &mut months, &Resolution::Month.label(last))?;
            }

            insert_or_sum(&mut minutes, &min_label, &s)?;
            insert_or_sum(&mut hours, &hour_label, &s)?;
            insert_or_sum(&mut days, &day_label, &s)?;
            insert_or_sum(&mut months, &mon_label, &s)?;
        }
        txn.commit()?;

        st.last = Some(s.ts());
        Ok(())
    }

    /// Insert a sample that arrived behind the high-water mark.
    ///
    /// The sample is folded into exactly one bucket, chosen by comparing
    /// clock components against the high-water mark; the live window and
    /// the mark itself are untouched.
    pub fn add_out_of_order(&self, s: &S) -> Result<(), DbError> {
        let st = self.inner.lock();
        let db = st.db.as_ref().ok_or(DbError::NotOpen)?;
        insert_out_of_order(db, st.last.unwrap_or(DateTime::UNIX_EPOCH), s)
    }

    /// Restore bucket residency after an arbitrary off-time.
    ///
    /// Entries strictly before the end of the current hour/day/month move
    /// into the next-coarser bucket under their own coarser label, cascading
    /// minute through month in one write transaction. Must run before the
    /// producer starts feeding samples.
    pub fn rebase(&self, now: DateTime<Utc>) -> Result<(), DbError> {
        let st = self.inner.lock();
        let db = st.db.as_ref().ok_or(DbError::NotOpen)?;

        let txn = db.begin_write()?;
        {
            let mut minutes = txn.open_table(MIN_BUCKET)?;
            let mut hours = txn.open_table(HOUR_BUCKET)?;
            let mut days = txn.open_table(DAY_BUCKET)?;
            let mut months = txn.open_table(MON_BUCKET)?;

            shift_older::<S>(
                &mut minutes,
                &mut hours,
                end_of_current_hour(now),
                Resolution::Hour,
            )?;
            shift_older::<S>(
                &mut hours,
                &mut days,
                end_of_current_day(now),
                Resolution::Day,
            )?;
            shift_older::<S>(
                &mut days,
                &mut months,
                end_of_current_month(now),
                Resolution::Month,
            )?;
        }
        txn.commit()?;

        Ok(())
    }

    /// Snapshot of the live window, newest first.
    pub fn live_set(&self) -> Result<Vec<S>, DbError> {
        let st = self.inner.lock();
        if st.db.is_none() {
            return Err(DbError::NotOpen);
        }
        Ok(st.live.iter().cloned().collect())
    }

    /// All entries of one bucket, in no guaranteed order.
    pub fn samples(&self, res: Resolution) -> Result<Vec<S>, DbError> {
        let st = self.inner.lock();
        let db = st.db.as_ref().ok_or(DbError::NotOpen)?;

        let txn = db.begin_read()?;
        let table = match txn.open_table(bucket_def(res)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Err(DbError::NoBucket),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            out.push(S::decode(v.value())?);
        }
        Ok(out)
    }

    /// Minute bucket contents.
    pub fn minutes(&self) -> Result<Vec<S>, DbError> {
        self.samples(Resolution::Minute)
    }

    /// Hour bucket contents.
    pub fn hours(&self) -> Result<Vec<S>, DbError> {
        self.samples(Resolution::Hour)
    }

    /// Day bucket contents.
    pub fn days(&self) -> Result<Vec<S>, DbError> {
        self.samples(Resolution::Day)
    }

    /// Month bucket contents.
    pub fn months(&self) -> Result<Vec<S>, DbError> {
        self.samples(Resolution::Month)
    }

    /// Drop every stored entry and reset the live window and high-water
    /// mark. The engine stays open and usable.
    pub fn purge(&self) -> Result<(), DbError> {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        let db = st.db.as_ref().ok_or(DbError::NotOpen)?;

        st.last = None;
        st.live.clear();

        let txn = db.begin_write()?;
        for def in [MIN_BUCKET, HOUR_BUCKET, DAY_BUCKET, MON_BUCKET] {
            let mut table = txn.open_table(def)?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.iter()? {
                    let (k, _) = entry?;
                    keys.push(k.value().to_string());
                }
                keys
            };
            for key in &keys {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;

        Ok(())
    }

    /// Close the store, flushing outstanding writes and emptying the live
    /// window. Every later call fails with [`DbError::NotOpen`].
    pub fn close(&self) -> Result<(), DbError> {
        let mut st = self.inner.lock();
        if st.db.take().is_none() {
            return Err(DbError::NotOpen);
        }
        st.live.clear();
        Ok(())
    }
}

/// Fold a sample into whichever single bucket still holds values that could
/// subsume it, judged by clock components against the high-water mark.
fn insert_out_of_order<S: Measurement>(
    db: &Database,
    last: DateTime<Utc>,
    s: &S,
) -> Result<(), DbError> {
    let ts = s.ts();
    let res = if ts.minute() == last.minute() {
        Resolution::Minute
    } else if ts.hour() == last.hour() {
        Resolution::Hour
    } else if ts.day() == last.day() {
        Resolution::Day
    } else {
        Resolution::Month
    };

    let txn = db.begin_write()?;
    {
        let mut bucket = txn.open_table(bucket_def(res))?;
        insert_or_sum(&mut bucket, &s.time_label(res), s)?;
    }
    txn.commit()?;

    Ok(())
}

/// Fold `s` into `bucket[key]`: decode the existing value into a fresh
/// accumulator and store the merged result, or store `s` when the key is
/// absent. The accumulator is mutated, never `s` itself.
fn insert_or_sum<S: Measurement>(
    bucket: &mut Bucket<'_>,
    key: &str,
    s: &S,
) -> Result<(), DbError> {
    let merged = match bucket.get(key)? {
        Some(existing) => {
            let mut acc = S::decode(existing.value())?;
            acc.merge(s);
            Some(acc)
        }
        None => None,
    };

    match merged {
        Some(acc) => bucket.insert(key, acc.encode().as_slice())?,
        None => bucket.insert(key, s.encode().as_slice())?,
    };

    Ok(())
}

/// Drain every entry of `src` into one accumulator and store it at
/// `dst[dst_key]`, replacing any prior value there. The replaced value is
/// the destination's running total for the same period, which the drained
/// sum supersedes exactly, so completed periods are never double-counted.
/// An empty source writes nothing.
fn sum_and_shift<S: Measurement>(
    src: &mut Bucket<'_>,
    dst: &mut Bucket<'_>,
    dst_key: &str,
) -> Result<(), DbError> {
    let mut acc = S::default();
    let mut keys = Vec::new();

    for entry in src.iter()? {
        let (k, v) = entry?;
        acc.merge(&S::decode(v.value())?);
        keys.push(k.value().to_string());
    }

    if keys.is_empty() {
        return Ok(());
    }

    for key in &keys {
        src.remove(key.as_str())?;
    }
    dst.insert(dst_key, acc.encode().as_slice())?;

    Ok(())
}

/// Move every `src` entry with a timestamp strictly before `cutoff` into
/// `dst`, grouped and summed under each entry's own coarser label. As in
/// [`sum_and_shift`], each group replaces the destination's running total
/// for that period.
fn shift_older<S: Measurement>(
    src: &mut Bucket<'_>,
    dst: &mut Bucket<'_>,
    cutoff: DateTime<Utc>,
    dst_res: Resolution,
) -> Result<(), DbError> {
    let mut expired: Vec<(String, S)> = Vec::new();
    for entry in src.iter()? {
        let (k, v) = entry?;
        let s = S::decode(v.value())?;
        if s.ts() < cutoff {
            expired.push((k.value().to_string(), s));
        }
    }

    let mut groups: BTreeMap<String, S> = BTreeMap::new();
    for (key, s) in expired {
        src.remove(key.as_str())?;
        groups.entry(s.time_label(dst_res)).or_default().merge(&s);
    }

    for (label, acc) in &groups {
        dst.insert(label.as_str(), acc.encode().as_slice())?;
    }

    Ok(())
}

/// Truncate to the current hour and add one hour: the boundary below which
/// minute entries have expired.
fn end_of_current_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let into_hour = i64::from(ts.minute()) * 60 + i64::from(ts.second());
    ts - Duration::seconds(into_hour) - Duration::nanoseconds(i64::from(ts.nanosecond()))
        + Duration::hours(1)
}

/// Truncate to the current day and add one day.
fn end_of_current_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    let into_day =
        i64::from(ts.hour()) * 3600 + i64::from(ts.minute()) * 60 + i64::from(ts.second());
    ts - Duration::seconds(into_day) - Duration::nanoseconds(i64::from(ts.nanosecond()))
        + Duration::days(1)
}

/// Truncate to the current month and add one month.
fn end_of_current_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    let start_of_day = end_of_current_day(ts) - Duration::days(1);
    let first_of_month = start_of_day - Duration::days(i64::from(ts.day()) - 1);
    first_of_month + Months::new(1)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::sample::Sample;

    fn open_db(dir: &TempDir, live_size: i64) -> BwDb<Sample> {
        BwDb::open(dir.path().join("test.db"), live_size).expect("open db")
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    #[test]
    fn test_operations_fail_after_close() {
        let dir = TempDir::new().expect("tempdir");
        let db = open_db(&dir, 10);
        db.add(Sample::new(ts(100), 1, 1)).expect("add");
        db.close().expect("close");

        assert!(matches!(
            db.add(Sample::new(ts(200), 1, 1)),
            Err(DbError::NotOpen)
        ));
        assert!(matches!(
            db.add_out_of_order(&Sample::new(ts(50), 1, 1)),
            Err(DbError::NotOpen)
        ));
        assert!(matches!(db.rebase(ts(300)), Err(DbError::NotOpen)));
        assert!(matches!(db.live_set(), Err(DbError::NotOpen)));
        assert!(matches!(db.minutes(), Err(DbError::NotOpen)));
        assert!(matches!(db.purge(), Err(DbError::NotOpen)));
        assert!(matches!(db.close(), Err(DbError::NotOpen)));
    }

    #[test]
    fn test_fresh_store_has_no_buckets() {
        let dir = TempDir::new().expect("tempdir");
        let db = open_db(&dir, 10);
        assert!(matches!(db.minutes(), Err(DbError::NoBucket)));
        assert!(matches!(db.months(), Err(DbError::NoBucket)));
    }

    #[test]
    fn test_live_size_coercion() {
        let dir = TempDir::new().expect("tempdir");
        let db: BwDb<Sample> =
            BwDb::open(dir.path().join("coerce.db"), 0).expect("open db");
        for i in 1..=100 {
            db.add(Sample::new(ts(i), 1, 1)).expect("add");
        }
        assert_eq!(db.live_set().expect("live").len(), 60);
    }

    #[test]
    fn test_live_ring_is_newest_first() {
        let dir = TempDir::new().expect("tempdir");
        let db = open_db(&dir, 3);
        for i in 1..=5 {
            db.add(Sample::new(ts(i), i as u64, 0)).expect("add");
        }
        let live = db.live_set().expect("live");
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].ts, ts(5));
        assert_eq!(live[1].ts, ts(4));
        assert_eq!(live[2].ts, ts(3));
    }

    #[test]
    fn test_same_minute_samples_sum() {
        let dir = TempDir::new().expect("tempdir");
        let db = open_db(&dir, 10);
        db.add(Sample::new(ts(10), 5, 7)).expect("add");
        db.add(Sample::new(ts(20), 3, 2)).expect("add");

        let minutes = db.minutes().expect("minutes");
        assert_eq!(minutes.len(), 1);
        assert_eq!(minutes[0].bytes_up, 8);
        assert_eq!(minutes[0].bytes_down, 9);
        // The stored timestamp is the latest contributing one.
        assert_eq!(minutes[0].ts, ts(20));
    }

    #[test]
    fn test_equal_timestamp_is_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let db = open_db(&dir, 10);
        db.add(Sample::new(ts(10), 1, 1)).expect("add");
        db.add(Sample::new(ts(10), 1, 1)).expect("add");
        // Both went through the in-order path and into the live window.
        assert_eq!(db.live_set().expect("live").len(), 2);
    }

    #[test]
    fn test_boundary_helpers() {
        // 2016-03-15 14:30:45 UTC.
        let t = Utc
            .with_ymd_and_hms(2016, 3, 15, 14, 30, 45)
            .single()
            .expect("valid ts");
        assert_eq!(
            end_of_current_hour(t),
            Utc.with_ymd_and_hms(2016, 3, 15, 15, 0, 0).single().expect("ts")
        );
        assert_eq!(
            end_of_current_day(t),
            Utc.with_ymd_and_hms(2016, 3, 16, 0, 0, 0).single().expect("ts")
        );
        assert_eq!(
            end_of_current_month(t),
            Utc.with_ymd_and_hms(2016, 4, 1, 0, 0, 0).single().expect("ts")
        );

        // December rolls into the next year.
        let december = Utc
            .with_ymd_and_hms(2016, 12, 31, 23, 59, 59)
            .single()
            .expect("valid ts");
        assert_eq!(
            end_of_current_month(december),
            Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).single().expect("ts")
        );
    }

    #[test]
    fn test_purge_keeps_engine_usable() {
        let dir = TempDir::new().expect("tempdir");
        let db = open_db(&dir, 10);
        db.add(Sample::new(ts(100), 1, 1)).expect("add");
        db.purge().expect("purge");

        // A sample older than the pre-purge high-water mark is in-order
        // again because purge zeroed the mark.
        db.add(Sample::new(ts(50), 2, 2)).expect("add after purge");
        assert_eq!(db.live_set().expect("live").len(), 1);
        assert_eq!(db.minutes().expect("minutes").len(), 1);
    }
}
