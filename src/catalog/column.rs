use serde::{Deserialize, Serialize};

use super::ColumnId;
use crate::types::LogicalType;

/// Descriptor of one foreign-table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub column_id: ColumnId,
    pub name: String,
    pub logical_type: LogicalType,
}

impl ColumnDesc {
    pub fn new(column_id: ColumnId, name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            column_id,
            name: name.into(),
            logical_type,
        }
    }

    pub fn is_varlen(&self) -> bool {
        self.logical_type.is_varlen()
    }
}
