// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Foreign table refresh entry points and scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::error;

use crate::catalog::{
    parse_start_date_time, table_key_of, CatalogRef, DatabaseId, ForeignTable, OptionsMap,
    NULL_REFRESH_TIME,
};
use crate::error::StorageResult;
use crate::manager::{BufferMgr, CachingForeignStorageMgr};

/// Refreshes one foreign table through the given storage manager and
/// advances the table's refresh timestamps. A post-eviction refresh failure
/// still advances the timestamps, then surfaces the underlying error.
pub fn refresh_foreign_table(
    catalog: &CatalogRef,
    mgr: &dyn BufferMgr,
    db_id: DatabaseId,
    table_name: &str,
    evict_cached_entries: bool,
) -> StorageResult<()> {
    let table = catalog.get_foreign_table_by_name(db_id, table_name)?;
    let table_key = table_key_of(table.db_id, table.table_id);

    match mgr.refresh_table(&table_key, evict_cached_entries) {
        Ok(()) => {
            update_foreign_table_refresh_times(&table);
            Ok(())
        }
        Err(error) if error.is_post_eviction_refresh() => {
            update_foreign_table_refresh_times(&table);
            Err(error.into_original())
        }
        Err(error) => Err(error),
    }
}

/// Stamps the table's last refresh time and derives the next one from its
/// schedule.
pub fn update_foreign_table_refresh_times(table: &ForeignTable) {
    let now = chrono::Utc::now().timestamp();
    let next = if table
        .options
        .get(ForeignTable::REFRESH_TIMING_TYPE_KEY)
        .map(|value| value.as_str())
        == Some(ForeignTable::SCHEDULE_REFRESH_TIMING_TYPE)
    {
        get_next_refresh_time(&table.options, now)
    } else {
        NULL_REFRESH_TIME
    };
    table.set_refresh_times(now, next);
}

/// The interval duration in seconds of an `N[SHD]` interval string. The
/// string must have passed option validation.
pub fn get_interval_duration(interval: &str) -> i64 {
    let (count, unit) = interval.split_at(interval.len() - 1);
    let count: i64 = count.parse().expect("validated interval count");
    match unit.to_ascii_lowercase().as_str() {
        "s" => count,
        "h" => count * 60 * 60,
        "d" => count * 60 * 60 * 24,
        _ => unreachable!("validated interval type"),
    }
}

/// The next refresh time at or after `current_time`: the start date time if
/// it has not arrived yet, otherwise the next interval boundary. A one-time
/// refresh whose start time has passed has no next refresh.
pub fn get_next_refresh_time(options: &OptionsMap, current_time: i64) -> i64 {
    let Some(start_date_time) = options
        .get(ForeignTable::REFRESH_START_DATE_TIME_KEY)
        .and_then(|value| parse_start_date_time(value))
    else {
        return NULL_REFRESH_TIME;
    };
    if start_date_time >= current_time {
        return start_date_time;
    }
    if let Some(interval) = options.get(ForeignTable::REFRESH_INTERVAL_KEY) {
        let interval_duration = get_interval_duration(interval);
        let num_intervals =
            (current_time - start_date_time + interval_duration - 1) / interval_duration;
        start_date_time + num_intervals * interval_duration
    } else {
        NULL_REFRESH_TIME
    }
}

/// Background thread that refreshes every table whose scheduled refresh time
/// has arrived. Per-table refresh failures are logged, not propagated.
pub struct ForeignTableRefreshScheduler {
    thread: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
    has_refreshed_table: Arc<AtomicBool>,
}

impl ForeignTableRefreshScheduler {
    pub fn start(
        catalog: CatalogRef,
        mgr: Arc<CachingForeignStorageMgr>,
        wait_duration: Duration,
    ) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));
        let has_refreshed_table = Arc::new(AtomicBool::new(false));
        let running = is_running.clone();
        let refreshed = has_refreshed_table.clone();

        let thread = std::thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                let now = chrono::Utc::now().timestamp();
                for table in catalog.get_all_foreign_tables_for_refresh(now) {
                    if let Err(e) =
                        refresh_foreign_table(&catalog, &*mgr, table.db_id, &table.name, false)
                    {
                        error!(
                            "scheduled refresh for table \"{}\" resulted in an error: {}",
                            table.name, e
                        );
                    }
                    refreshed.store(true, Ordering::Release);
                }
                std::thread::sleep(wait_duration);
            }
        });

        Self {
            thread: Some(thread),
            is_running,
            has_refreshed_table,
        }
    }

    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn has_refreshed_table(&self) -> bool {
        self.has_refreshed_table.load(Ordering::Acquire)
    }

    pub fn reset_has_refreshed_table(&self) {
        self.has_refreshed_table.store(false, Ordering::Release);
    }
}

impl Drop for ForeignTableRefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
