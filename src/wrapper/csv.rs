// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::buffer::ChunkBufferMap;
use crate::catalog::{ColumnId, DatabaseId, ForeignTable};
use crate::chunk::{
    ChunkKey, ChunkMetadata, ChunkMetadataVector, ChunkStats, CHUNK_KEY_COLUMN_IDX,
    CHUNK_KEY_FRAGMENT_IDX, CHUNK_KEY_VARLEN_IDX, VARLEN_DATA_PART, VARLEN_OFFSETS_PART,
};
use crate::error::{StorageResult, TracedStorageError};
use crate::types::{DataValue, LogicalType};

/// Rows per fragment when the table does not override `FRAGMENT_SIZE`.
const DEFAULT_FRAGMENT_SIZE: u64 = 2_000_000;

/// A subset of rows within the CSV file: one fragment's worth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRegion {
    /// Byte offset of the first record of the region.
    pub first_row_file_offset: u64,
    /// Index of the first row relative to the first non-header line.
    pub first_row_index: u64,
    pub row_count: u64,
    pub region_size: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct CsvWrapperState {
    fragments: Vec<FileRegion>,
    num_rows: u64,
    #[serde(skip)]
    is_restored: bool,
}

/// Reader over one delimited-text file.
pub struct CsvDataWrapper {
    db_id: DatabaseId,
    foreign_table: Arc<ForeignTable>,
    state: RwLock<CsvWrapperState>,
}

impl CsvDataWrapper {
    pub const DELIMITER_KEY: &'static str = "DELIMITER";
    pub const HEADER_KEY: &'static str = "HEADER";
    pub const QUOTE_KEY: &'static str = "QUOTE";

    pub fn new(db_id: DatabaseId, foreign_table: Arc<ForeignTable>) -> Self {
        Self {
            db_id,
            foreign_table,
            state: RwLock::new(CsvWrapperState::default()),
        }
    }

    pub fn supported_options() -> &'static [&'static str] {
        &[Self::DELIMITER_KEY, Self::HEADER_KEY, Self::QUOTE_KEY]
    }

    pub fn validate_options(foreign_table: &ForeignTable) -> StorageResult<()> {
        for option in [Self::DELIMITER_KEY, Self::QUOTE_KEY] {
            if let Some(value) = foreign_table.options.get(option) {
                if value.chars().count() != 1 {
                    return Err(TracedStorageError::invalid_option(format!(
                        "value of option \"{option}\" must be a single character"
                    )));
                }
            }
        }
        if let Some(value) = foreign_table.options.get(Self::HEADER_KEY) {
            let normalized = value.to_uppercase();
            if normalized != "TRUE" && normalized != "FALSE" {
                return Err(TracedStorageError::invalid_option(format!(
                    "value of option \"{}\" must be TRUE or FALSE",
                    Self::HEADER_KEY
                )));
            }
        }
        Ok(())
    }

    pub fn populate_chunk_metadata(&self) -> StorageResult<ChunkMetadataVector> {
        let path = self.foreign_table.file_path()?;
        let fragment_size = self
            .foreign_table
            .fragment_size()
            .unwrap_or(DEFAULT_FRAGMENT_SIZE)
            .max(1);
        let file_size = fs::metadata(&path)?.len();

        let mut reader = self.reader_builder().from_reader(File::open(&path)?);
        let column_count = self.foreign_table.columns.len();

        let mut fragments: Vec<FileRegion> = vec![];
        let mut fragment_values: Vec<Vec<DataValue>> = vec![vec![]; column_count];
        let mut metadata_vec = ChunkMetadataVector::new();
        let mut row_index = 0u64;

        for record in reader.records() {
            let record = record?;
            if record.len() != column_count {
                return Err(TracedStorageError::data_wrapper(format!(
                    "row {row_index} has {} fields, expected {column_count}",
                    record.len()
                )));
            }
            if row_index % fragment_size == 0 {
                if let Some(region) = fragments.last_mut() {
                    let offset = record_offset(&record);
                    region.region_size = offset - region.first_row_file_offset;
                    self.flush_fragment_metadata(
                        fragments.len() as i32 - 1,
                        &mut fragment_values,
                        &mut metadata_vec,
                    )?;
                }
                fragments.push(FileRegion {
                    first_row_file_offset: record_offset(&record),
                    first_row_index: row_index,
                    row_count: 0,
                    region_size: 0,
                });
            }
            let region = fragments.last_mut().expect("region pushed above");
            region.row_count += 1;
            for (field, values) in record.iter().zip(fragment_values.iter_mut()) {
                values.push(DataValue::String(field.to_string()));
            }
            row_index += 1;
        }
        if let Some(region) = fragments.last_mut() {
            region.region_size = file_size - region.first_row_file_offset;
            self.flush_fragment_metadata(
                fragments.len() as i32 - 1,
                &mut fragment_values,
                &mut metadata_vec,
            )?;
        }

        let mut state = self.state.write();
        state.fragments = fragments;
        state.num_rows = row_index;
        metadata_vec.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(metadata_vec)
    }

    pub fn populate_chunk_buffers(
        &self,
        required_buffers: &ChunkBufferMap,
        _optional_buffers: &ChunkBufferMap,
    ) -> StorageResult<()> {
        let Some(first_key) = required_buffers.keys().next() else {
            return Ok(());
        };
        let fragment_id = first_key[CHUNK_KEY_FRAGMENT_IDX];
        assert!(
            required_buffers
                .keys()
                .all(|key| key[CHUNK_KEY_FRAGMENT_IDX] == fragment_id),
            "all buffers must belong to one fragment"
        );

        let region = {
            let state = self.state.read();
            state
                .fragments
                .get(fragment_id as usize)
                .cloned()
                .ok_or_else(|| {
                    TracedStorageError::data_wrapper(format!("unknown fragment {fragment_id}"))
                })?
        };
        let columns = self.parse_region(&region)?;

        for (key, buffer) in required_buffers {
            let column_id = key[CHUNK_KEY_COLUMN_IDX];
            let column = self.foreign_table.get_logical_column(column_id)?;
            let column_index = self
                .foreign_table
                .columns
                .iter()
                .position(|c| c.column_id == column_id)
                .expect("column resolved above");
            let values = &columns[column_index];
            let encoded = encode_column(values, column.logical_type);

            if crate::chunk::is_varlen_key(key) && key[CHUNK_KEY_VARLEN_IDX] == VARLEN_OFFSETS_PART {
                buffer.write(encoded.offsets.clone().expect("varlen column has offsets"));
            } else {
                buffer.write(encoded.data.clone());
                buffer.set_metadata(ChunkMetadata::new(
                    column.logical_type,
                    encoded.data.len() as u64,
                    values.len() as u64,
                    encoded.stats.clone(),
                ));
            }
        }
        Ok(())
    }

    pub fn serialize_internals(&self, path: &Path) -> StorageResult<()> {
        let state = self.state.read();
        let file = File::create(path)?;
        serde_json::to_writer(file, &*state)?;
        Ok(())
    }

    pub fn restore_internals(
        &self,
        path: &Path,
        _chunk_metadata: &ChunkMetadataVector,
    ) -> StorageResult<()> {
        let contents = fs::read_to_string(path)?;
        let mut restored: CsvWrapperState = serde_json::from_str(&contents)?;
        restored.is_restored = true;
        *self.state.write() = restored;
        Ok(())
    }

    pub fn is_restored(&self) -> bool {
        self.state.read().is_restored
    }

    fn reader_builder(&self) -> csv::ReaderBuilder {
        let options = &self.foreign_table.options;
        let delimiter = options
            .get(Self::DELIMITER_KEY)
            .and_then(|value| value.bytes().next())
            .unwrap_or(b',');
        let quote = options
            .get(Self::QUOTE_KEY)
            .and_then(|value| value.bytes().next())
            .unwrap_or(b'"');
        let header = options
            .get(Self::HEADER_KEY)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(delimiter)
            .quote(quote)
            .has_headers(header);
        builder
    }

    /// Re-parses one fragment's file region into per-column values.
    fn parse_region(&self, region: &FileRegion) -> StorageResult<Vec<Vec<DataValue>>> {
        let path = self.foreign_table.file_path()?;
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(region.first_row_file_offset))?;

        // The region starts at a record boundary, so the header option must
        // not swallow its first row.
        let mut builder = self.reader_builder();
        builder.has_headers(false);
        let mut reader = builder.from_reader(file);

        let column_count = self.foreign_table.columns.len();
        let mut columns: Vec<Vec<DataValue>> = vec![vec![]; column_count];
        for (index, record) in reader.records().take(region.row_count as usize).enumerate() {
            let record = record?;
            if record.len() != column_count {
                return Err(TracedStorageError::data_wrapper(format!(
                    "row {} has {} fields, expected {column_count}",
                    region.first_row_index + index as u64,
                    record.len()
                )));
            }
            for (field, values) in record.iter().zip(columns.iter_mut()) {
                values.push(DataValue::String(field.to_string()));
            }
        }
        // Typed parse of each field against its column.
        for (values, column) in columns.iter_mut().zip(&self.foreign_table.columns) {
            for value in values.iter_mut() {
                if let DataValue::String(field) = value {
                    *value = DataValue::from_field(column.logical_type, field).ok_or_else(|| {
                        TracedStorageError::data_wrapper(format!(
                            "could not parse {:?} as {:?}",
                            field, column.logical_type
                        ))
                    })?;
                }
            }
        }
        Ok(columns)
    }

    fn flush_fragment_metadata(
        &self,
        fragment_id: i32,
        fragment_values: &mut [Vec<DataValue>],
        metadata_vec: &mut ChunkMetadataVector,
    ) -> StorageResult<()> {
        for (values, column) in fragment_values.iter_mut().zip(&self.foreign_table.columns) {
            for value in values.iter_mut() {
                if let DataValue::String(field) = value {
                    *value = DataValue::from_field(column.logical_type, field).ok_or_else(|| {
                        TracedStorageError::data_wrapper(format!(
                            "could not parse {:?} as {:?}",
                            field, column.logical_type
                        ))
                    })?;
                }
            }
            let encoded = encode_column(values, column.logical_type);
            let key = self.chunk_key(column.column_id, fragment_id, column.is_varlen());
            metadata_vec.push((
                key,
                ChunkMetadata::new(
                    column.logical_type,
                    encoded.data.len() as u64,
                    values.len() as u64,
                    encoded.stats,
                ),
            ));
            values.clear();
        }
        Ok(())
    }

    fn chunk_key(&self, column_id: ColumnId, fragment_id: i32, varlen: bool) -> ChunkKey {
        let mut key = ChunkKey::from_slice(&[
            self.db_id,
            self.foreign_table.table_id,
            column_id,
            fragment_id,
        ]);
        if varlen {
            key.push(VARLEN_DATA_PART);
        }
        key
    }
}

fn record_offset(record: &csv::StringRecord) -> u64 {
    record
        .position()
        .map(|position| position.byte())
        .unwrap_or(0)
}

struct EncodedColumn {
    data: Bytes,
    offsets: Option<Bytes>,
    stats: ChunkStats,
}

/// Encodes a column's values: fixed-width little-endian with inline null
/// sentinels, or concatenated bytes plus an `i32` offsets buffer for varlen
/// columns.
fn encode_column(values: &[DataValue], logical_type: LogicalType) -> EncodedColumn {
    let mut stats = ChunkStats::empty();
    for value in values {
        if value.is_null() {
            stats.has_nulls = true;
            continue;
        }
        if stats.min.is_null() || matches!(value.partial_cmp(&stats.min), Some(std::cmp::Ordering::Less)) {
            stats.min = value.clone();
        }
        if stats.max.is_null() || matches!(value.partial_cmp(&stats.max), Some(std::cmp::Ordering::Greater)) {
            stats.max = value.clone();
        }
    }

    match logical_type {
        LogicalType::String => {
            let mut data = BytesMut::new();
            let mut offsets = BytesMut::with_capacity((values.len() + 1) * 4);
            offsets.put_i32_le(0);
            for value in values {
                if let DataValue::String(s) = value {
                    data.put_slice(s.as_bytes());
                }
                offsets.put_i32_le(data.len() as i32);
            }
            EncodedColumn {
                data: data.freeze(),
                offsets: Some(offsets.freeze()),
                stats,
            }
        }
        _ => {
            let width = logical_type.fixed_width().expect("fixed-width type");
            let mut data = BytesMut::with_capacity(values.len() * width);
            for value in values {
                match (logical_type, value) {
                    (LogicalType::Bool, DataValue::Bool(v)) => data.put_u8(*v as u8),
                    (LogicalType::Bool, DataValue::Null) => data.put_u8(u8::MAX),
                    (LogicalType::Int32, DataValue::Int32(v)) => data.put_i32_le(*v),
                    (LogicalType::Int32, DataValue::Null) => data.put_i32_le(i32::MIN),
                    (LogicalType::Int64, DataValue::Int64(v)) => data.put_i64_le(*v),
                    (LogicalType::Int64, DataValue::Null) => data.put_i64_le(i64::MIN),
                    (LogicalType::Float64, DataValue::Float64(v)) => data.put_f64_le(*v),
                    (LogicalType::Float64, DataValue::Null) => data.put_f64_le(f64::MIN),
                    (ty, value) => unreachable!("value {value:?} does not match type {ty:?}"),
                }
            }
            EncodedColumn {
                data: data.freeze(),
                offsets: None,
                stats,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;
    use smallvec::smallvec;

    use super::*;
    use crate::buffer::ForeignStorageBuffer;
    use crate::catalog::{ColumnDesc, ForeignServer, OptionsMap};

    fn wrapper_for(csv: &str, fragment_size: u64) -> (CsvDataWrapper, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        write!(file, "{csv}").expect("failed to write file");

        let mut server_options = OptionsMap::new();
        server_options.insert(
            ForeignServer::STORAGE_TYPE_KEY.into(),
            ForeignServer::LOCAL_FILE_STORAGE_TYPE.into(),
        );
        server_options.insert(ForeignServer::BASE_PATH_KEY.into(), "/".into());
        let server = Arc::new(ForeignServer::new("s", "CSV", server_options));

        let table = ForeignTable::new(
            1,
            2,
            "t",
            vec![
                ColumnDesc::new(1, "id", LogicalType::Int32),
                ColumnDesc::new(2, "name", LogicalType::String),
            ],
            server,
            &json!({
                "file_path": file.path().to_str().unwrap(),
                "header": "false",
                "fragment_size": fragment_size.to_string(),
            }),
        )
        .unwrap();
        (CsvDataWrapper::new(1, Arc::new(table)), file)
    }

    #[test]
    fn metadata_covers_all_fragments() {
        let (wrapper, _file) = wrapper_for("1,one\n2,two\n3,three\n", 2);
        let metadata = wrapper.populate_chunk_metadata().unwrap();

        // two fragments, two columns each
        assert_eq!(metadata.len(), 4);
        let keys: Vec<ChunkKey> = metadata.iter().map(|(key, _)| key.clone()).collect();
        assert!(keys.contains(&smallvec![1, 2, 1, 0]));
        assert!(keys.contains(&smallvec![1, 2, 1, 1]));
        assert!(keys.contains(&smallvec![1, 2, 2, 0, VARLEN_DATA_PART]));
        assert!(keys.contains(&smallvec![1, 2, 2, 1, VARLEN_DATA_PART]));

        let (_, int_meta) = metadata
            .iter()
            .find(|(key, _)| key[..] == [1, 2, 1, 0])
            .unwrap();
        assert_eq!(int_meta.num_elements, 2);
        assert_eq!(int_meta.num_bytes, 8);
        assert_eq!(int_meta.stats.min, DataValue::Int32(1));
        assert_eq!(int_meta.stats.max, DataValue::Int32(2));
    }

    #[test]
    fn buffers_roundtrip() {
        let (wrapper, _file) = wrapper_for("1,one\n2,two\n3,three\n", 2);
        wrapper.populate_chunk_metadata().unwrap();

        let mut required = ChunkBufferMap::new();
        let int_key: ChunkKey = smallvec![1, 2, 1, 1];
        let data_key: ChunkKey = smallvec![1, 2, 2, 1, VARLEN_DATA_PART];
        let offsets_key: ChunkKey = smallvec![1, 2, 2, 1, VARLEN_OFFSETS_PART];
        for key in [&int_key, &data_key, &offsets_key] {
            required.insert(key.clone(), Arc::new(ForeignStorageBuffer::new()) as _);
        }
        wrapper
            .populate_chunk_buffers(&required, &ChunkBufferMap::new())
            .unwrap();

        assert_eq!(
            required[&int_key].data().unwrap().as_ref(),
            3i32.to_le_bytes()
        );
        assert_eq!(required[&data_key].data().unwrap().as_ref(), b"three");
        let offsets = required[&offsets_key].data().unwrap();
        assert_eq!(offsets.as_ref(), [0i32.to_le_bytes(), 5i32.to_le_bytes()].concat());
    }

    #[test]
    fn internals_roundtrip() {
        let (wrapper, _file) = wrapper_for("1,one\n2,two\n3,three\n", 2);
        wrapper.populate_chunk_metadata().unwrap();
        assert!(!wrapper.is_restored());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapper_metadata.json");
        wrapper.serialize_internals(&path).unwrap();

        let (restored, _file2) = wrapper_for("", 2);
        restored.restore_internals(&path, &vec![]).unwrap();
        assert!(restored.is_restored());
        assert_eq!(restored.state.read().num_rows, 3);
        assert_eq!(restored.state.read().fragments.len(), 2);
    }

    #[test]
    fn single_char_options_validated() {
        let (wrapper, _file) = wrapper_for("1,one\n", 10);
        CsvDataWrapper::validate_options(&wrapper.foreign_table).unwrap();
    }
}
