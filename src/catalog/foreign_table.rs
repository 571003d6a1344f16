// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

use super::{ColumnDesc, ColumnId, DatabaseId, ForeignServer, TableId};
use crate::error::{StorageResult, TracedStorageError};

/// Case-normalized option mapping: keys are upper-cased, values are
/// upper-cased for the enumerated subset.
pub type OptionsMap = BTreeMap<String, String>;

/// Refresh time sentinel for "never".
pub const NULL_REFRESH_TIME: i64 = -1;

/// Timestamp formats accepted for `REFRESH_START_DATE_TIME`, seconds
/// precision.
const START_DATE_TIME_FORMATS: [&str; 2] = [
    "%Y-%m-%dT%H:%M:%S", // 2021-01-08T04:05:06
    "%Y-%m-%d %H:%M:%S", // 2021-01-08 04:05:06
];

fn interval_regex() -> &'static Regex {
    static INTERVAL_REGEX: OnceLock<Regex> = OnceLock::new();
    INTERVAL_REGEX.get_or_init(|| Regex::new(r"(?i)^[0-9]+[SHD]$").expect("interval regex"))
}

fn separator_runs_regex() -> &'static Regex {
    static SEPARATOR_RUNS: OnceLock<Regex> = OnceLock::new();
    SEPARATOR_RUNS.get_or_init(|| {
        let separator = regex::escape(&std::path::MAIN_SEPARATOR.to_string());
        Regex::new(&format!("{separator}{{2,}}")).expect("separator regex")
    })
}

/// Parses a refresh timestamp into seconds since the epoch.
pub fn parse_start_date_time(value: &str) -> Option<i64> {
    START_DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|datetime| datetime.and_utc().timestamp())
}

/// A foreign table: schema, server reference, declarative options, and the
/// refresh bookkeeping the scheduler reads.
pub struct ForeignTable {
    pub db_id: DatabaseId,
    pub table_id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDesc>,
    pub foreign_server: Arc<ForeignServer>,
    pub options: OptionsMap,
    last_refresh_time: AtomicI64,
    next_refresh_time: AtomicI64,
}

impl ForeignTable {
    // Option keys
    pub const FILE_PATH_KEY: &'static str = "FILE_PATH";
    pub const FRAGMENT_SIZE_KEY: &'static str = "FRAGMENT_SIZE";
    pub const REFRESH_TIMING_TYPE_KEY: &'static str = "REFRESH_TIMING_TYPE";
    pub const REFRESH_START_DATE_TIME_KEY: &'static str = "REFRESH_START_DATE_TIME";
    pub const REFRESH_INTERVAL_KEY: &'static str = "REFRESH_INTERVAL";
    pub const REFRESH_UPDATE_TYPE_KEY: &'static str = "REFRESH_UPDATE_TYPE";
    // Option values
    pub const ALL_REFRESH_UPDATE_TYPE: &'static str = "ALL";
    pub const APPEND_REFRESH_UPDATE_TYPE: &'static str = "APPEND";
    pub const SCHEDULE_REFRESH_TIMING_TYPE: &'static str = "SCHEDULED";
    pub const MANUAL_REFRESH_TIMING_TYPE: &'static str = "MANUAL";

    const SUPPORTED_OPTIONS: [&'static str; 6] = [
        Self::FILE_PATH_KEY,
        Self::FRAGMENT_SIZE_KEY,
        Self::REFRESH_TIMING_TYPE_KEY,
        Self::REFRESH_START_DATE_TIME_KEY,
        Self::REFRESH_INTERVAL_KEY,
        Self::REFRESH_UPDATE_TYPE_KEY,
    ];

    const UPPER_CASE_OPTIONS: [&'static str; 4] = [
        Self::REFRESH_TIMING_TYPE_KEY,
        Self::REFRESH_START_DATE_TIME_KEY,
        Self::REFRESH_INTERVAL_KEY,
        Self::REFRESH_UPDATE_TYPE_KEY,
    ];

    // Not all options are alterable, so this holds a subset.
    const ALTERABLE_OPTIONS: [&'static str; 4] = [
        Self::REFRESH_TIMING_TYPE_KEY,
        Self::REFRESH_START_DATE_TIME_KEY,
        Self::REFRESH_INTERVAL_KEY,
        Self::REFRESH_UPDATE_TYPE_KEY,
    ];

    /// Builds a table from raw JSON options. Keys are upper-cased, values of
    /// enumerated options are upper-cased, and any key outside the static
    /// allowed set for the server's wrapper variant is rejected. Semantic
    /// validation happens when the table is added to the catalog.
    pub fn new(
        db_id: DatabaseId,
        table_id: TableId,
        name: impl Into<String>,
        columns: Vec<ColumnDesc>,
        foreign_server: Arc<ForeignServer>,
        json_options: &serde_json::Value,
    ) -> StorageResult<Self> {
        let mut options = Self::create_options_map(json_options)?;
        options
            .entry(Self::REFRESH_TIMING_TYPE_KEY.to_string())
            .or_insert_with(|| Self::MANUAL_REFRESH_TIMING_TYPE.to_string());
        options
            .entry(Self::REFRESH_UPDATE_TYPE_KEY.to_string())
            .or_insert_with(|| Self::ALL_REFRESH_UPDATE_TYPE.to_string());

        let table = Self {
            db_id,
            table_id,
            name: name.into(),
            columns,
            foreign_server,
            options,
            last_refresh_time: AtomicI64::new(NULL_REFRESH_TIME),
            next_refresh_time: AtomicI64::new(NULL_REFRESH_TIME),
        };
        table.validate_supported_options()?;
        Ok(table)
    }

    /// Upper-cases keys first so the allowed sets compare reliably.
    pub fn create_options_map(json_options: &serde_json::Value) -> StorageResult<OptionsMap> {
        let object = json_options
            .as_object()
            .ok_or_else(|| TracedStorageError::invalid_option("options must be a JSON object"))?;
        let mut options_map = OptionsMap::new();
        for (name, value) in object {
            let value = value.as_str().ok_or_else(|| {
                TracedStorageError::invalid_option(format!("option \"{name}\" must be a string"))
            })?;
            let key = name.to_uppercase();
            if Self::UPPER_CASE_OPTIONS.contains(&key.as_str()) {
                options_map.insert(key, value.to_uppercase());
            } else {
                options_map.insert(key, value.to_string());
            }
        }
        Ok(options_map)
    }

    pub fn validate_options(&self) -> StorageResult<()> {
        self.validate_data_wrapper_options()?;
        self.validate_refresh_options()
    }

    /// Rejects any option outside the alterable subset.
    pub fn validate_alter_options(options_map: &OptionsMap) -> StorageResult<()> {
        for key in options_map.keys() {
            if !Self::ALTERABLE_OPTIONS.contains(&key.as_str()) {
                return Err(TracedStorageError::invalid_option(format!(
                    "altering foreign table option \"{key}\" is not currently supported"
                )));
            }
        }
        Ok(())
    }

    pub fn is_append_mode(&self) -> bool {
        self.options.get(Self::REFRESH_UPDATE_TYPE_KEY).map(|s| s.as_str())
            == Some(Self::APPEND_REFRESH_UPDATE_TYPE)
    }

    /// Resolves the table's file path. Local-file servers join the base path
    /// and the file path and collapse runs of separators; anything else
    /// returns the file path verbatim as a prefix.
    pub fn file_path(&self) -> StorageResult<String> {
        let file_path = self
            .options
            .get(Self::FILE_PATH_KEY)
            .cloned()
            .unwrap_or_default();
        if self.foreign_server.is_local_storage() {
            let base_path = self.foreign_server.base_path().ok_or_else(|| {
                TracedStorageError::invalid_option("no base path found in foreign server options")
            })?;
            let separator = std::path::MAIN_SEPARATOR;
            let joined = format!("{base_path}{separator}{file_path}");
            Ok(separator_runs_regex()
                .replace_all(&joined, separator.to_string().as_str())
                .into_owned())
        } else {
            Ok(file_path)
        }
    }

    pub fn fragment_size(&self) -> Option<u64> {
        self.options
            .get(Self::FRAGMENT_SIZE_KEY)
            .and_then(|value| value.parse().ok())
    }

    pub fn get_logical_column(&self, column_id: ColumnId) -> StorageResult<&ColumnDesc> {
        self.columns
            .iter()
            .find(|column| column.column_id == column_id)
            .ok_or_else(|| TracedStorageError::not_found("column", column_id))
    }

    pub fn last_refresh_time(&self) -> i64 {
        self.last_refresh_time.load(Ordering::Acquire)
    }

    pub fn next_refresh_time(&self) -> i64 {
        self.next_refresh_time.load(Ordering::Acquire)
    }

    pub fn set_refresh_times(&self, last: i64, next: i64) {
        self.last_refresh_time.store(last, Ordering::Release);
        self.next_refresh_time.store(next, Ordering::Release);
    }

    fn supported_data_wrapper_options(&self) -> &'static [&'static str] {
        match self.foreign_server.data_wrapper_type.as_str() {
            crate::wrapper::DataWrapperType::CSV => {
                crate::wrapper::CsvDataWrapper::supported_options()
            }
            _ => &[],
        }
    }

    fn validate_supported_options(&self) -> StorageResult<()> {
        let data_wrapper_options = self.supported_data_wrapper_options();
        for key in self.options.keys() {
            if !Self::SUPPORTED_OPTIONS.contains(&key.as_str())
                && !data_wrapper_options.contains(&key.as_str())
            {
                return Err(TracedStorageError::invalid_option(format!(
                    "invalid foreign table option \"{key}\""
                )));
            }
        }
        Ok(())
    }

    fn validate_refresh_options(&self) -> StorageResult<()> {
        let update_type = self
            .options
            .get(Self::REFRESH_UPDATE_TYPE_KEY)
            .expect("update type option is seeded at construction");
        if update_type != Self::ALL_REFRESH_UPDATE_TYPE
            && update_type != Self::APPEND_REFRESH_UPDATE_TYPE
        {
            return Err(TracedStorageError::invalid_option(format!(
                "invalid value \"{update_type}\" for {} option, value must be \"{}\" or \"{}\"",
                Self::REFRESH_UPDATE_TYPE_KEY,
                Self::APPEND_REFRESH_UPDATE_TYPE,
                Self::ALL_REFRESH_UPDATE_TYPE,
            )));
        }

        let timing_type = self
            .options
            .get(Self::REFRESH_TIMING_TYPE_KEY)
            .expect("timing type option is seeded at construction");
        if timing_type == Self::SCHEDULE_REFRESH_TIMING_TYPE {
            let start_date_time = self
                .options
                .get(Self::REFRESH_START_DATE_TIME_KEY)
                .ok_or_else(|| {
                    TracedStorageError::invalid_option(format!(
                        "{} option must be provided for scheduled refreshes",
                        Self::REFRESH_START_DATE_TIME_KEY
                    ))
                })?;
            let start_date_time = parse_start_date_time(start_date_time).ok_or_else(|| {
                TracedStorageError::invalid_option(format!(
                    "invalid timestamp \"{start_date_time}\" for {} option",
                    Self::REFRESH_START_DATE_TIME_KEY
                ))
            })?;
            if start_date_time < chrono::Utc::now().timestamp() {
                return Err(TracedStorageError::invalid_option(format!(
                    "{} cannot be a past date time",
                    Self::REFRESH_START_DATE_TIME_KEY
                )));
            }

            if let Some(interval) = self.options.get(Self::REFRESH_INTERVAL_KEY) {
                if !interval_regex().is_match(interval) {
                    return Err(TracedStorageError::invalid_option(format!(
                        "invalid value provided for the {} option",
                        Self::REFRESH_INTERVAL_KEY
                    )));
                }
            }
        } else if timing_type != Self::MANUAL_REFRESH_TIMING_TYPE {
            return Err(TracedStorageError::invalid_option(format!(
                "invalid value provided for the {} option, value must be \"{}\" or \"{}\"",
                Self::REFRESH_TIMING_TYPE_KEY,
                Self::MANUAL_REFRESH_TIMING_TYPE,
                Self::SCHEDULE_REFRESH_TIMING_TYPE,
            )));
        }
        Ok(())
    }

    fn validate_data_wrapper_options(&self) -> StorageResult<()> {
        match self.foreign_server.data_wrapper_type.as_str() {
            crate::wrapper::DataWrapperType::CSV => {
                crate::wrapper::CsvDataWrapper::validate_options(self)
            }
            other => unreachable!("unknown data wrapper type {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::LogicalType;

    fn test_server() -> Arc<ForeignServer> {
        let mut options = OptionsMap::new();
        options.insert(
            ForeignServer::STORAGE_TYPE_KEY.into(),
            ForeignServer::LOCAL_FILE_STORAGE_TYPE.into(),
        );
        options.insert(ForeignServer::BASE_PATH_KEY.into(), "/data/".into());
        Arc::new(ForeignServer::new("server", "CSV", options))
    }

    fn test_table(json_options: serde_json::Value) -> StorageResult<ForeignTable> {
        ForeignTable::new(
            1,
            1,
            "t",
            vec![ColumnDesc::new(1, "c", LogicalType::Int32)],
            test_server(),
            &json_options,
        )
    }

    #[test]
    fn keys_and_enumerated_values_are_upper_cased() {
        let table = test_table(json!({
            "file_path": "data.csv",
            "refresh_update_type": "append",
        }))
        .unwrap();
        assert_eq!(table.options.get("FILE_PATH").unwrap(), "data.csv");
        assert_eq!(table.options.get("REFRESH_UPDATE_TYPE").unwrap(), "APPEND");
        assert!(table.is_append_mode());
    }

    #[test]
    fn unknown_option_rejected() {
        assert!(test_table(json!({ "nonsense": "1" })).is_err());
    }

    #[test]
    fn update_type_must_be_enumerated() {
        let table = test_table(json!({ "refresh_update_type": "sometimes" })).unwrap();
        assert!(table.validate_options().is_err());
    }

    #[test]
    fn scheduled_requires_future_start_date() {
        let table = test_table(json!({ "refresh_timing_type": "scheduled" })).unwrap();
        assert!(table.validate_options().is_err());

        let table = test_table(json!({
            "refresh_timing_type": "scheduled",
            "refresh_start_date_time": "2000-01-01T00:00:00",
        }))
        .unwrap();
        assert!(table.validate_options().is_err());

        let table = test_table(json!({
            "refresh_timing_type": "scheduled",
            "refresh_start_date_time": "2999-01-01T00:00:00",
        }))
        .unwrap();
        table.validate_options().unwrap();
    }

    #[test]
    fn interval_pattern() {
        for interval in ["5S", "1h", "30D", "10s"] {
            let table = test_table(json!({
                "refresh_timing_type": "scheduled",
                "refresh_start_date_time": "2999-01-01T00:00:00",
                "refresh_interval": interval,
            }))
            .unwrap();
            table.validate_options().unwrap();
        }
        for interval in ["S5", "5", "H", "5W", ""] {
            let table = test_table(json!({
                "refresh_timing_type": "scheduled",
                "refresh_start_date_time": "2999-01-01T00:00:00",
                "refresh_interval": interval,
            }))
            .unwrap();
            assert!(table.validate_options().is_err(), "interval {interval:?}");
        }
    }

    #[test]
    fn alterable_subset() {
        let mut options = OptionsMap::new();
        options.insert("REFRESH_INTERVAL".into(), "5S".into());
        ForeignTable::validate_alter_options(&options).unwrap();

        options.insert("FILE_PATH".into(), "other.csv".into());
        assert!(ForeignTable::validate_alter_options(&options).is_err());
    }

    #[test]
    fn file_path_collapses_separators() {
        let table = test_table(json!({ "file_path": "dir//data.csv" })).unwrap();
        assert_eq!(table.file_path().unwrap(), "/data/dir/data.csv");
    }
}
