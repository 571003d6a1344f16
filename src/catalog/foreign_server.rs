// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use super::OptionsMap;
use crate::error::{StorageResult, TracedStorageError};

/// A foreign server: where a set of foreign tables reads its files from and
/// which data wrapper understands them.
#[derive(Debug, Clone)]
pub struct ForeignServer {
    pub name: String,
    pub data_wrapper_type: String,
    pub options: OptionsMap,
}

impl ForeignServer {
    // Option keys
    pub const STORAGE_TYPE_KEY: &'static str = "STORAGE_TYPE";
    pub const BASE_PATH_KEY: &'static str = "BASE_PATH";
    // Option values
    pub const LOCAL_FILE_STORAGE_TYPE: &'static str = "LOCAL_FILE";

    pub fn new(
        name: impl Into<String>,
        data_wrapper_type: impl Into<String>,
        options: OptionsMap,
    ) -> Self {
        Self {
            name: name.into(),
            data_wrapper_type: data_wrapper_type.into(),
            options,
        }
    }

    pub fn storage_type(&self) -> Option<&str> {
        self.options.get(Self::STORAGE_TYPE_KEY).map(|s| s.as_str())
    }

    pub fn base_path(&self) -> Option<&str> {
        self.options.get(Self::BASE_PATH_KEY).map(|s| s.as_str())
    }

    pub fn is_local_storage(&self) -> bool {
        self.storage_type() == Some(Self::LOCAL_FILE_STORAGE_TYPE)
    }

    pub fn validate_options(&self) -> StorageResult<()> {
        match self.storage_type() {
            Some(Self::LOCAL_FILE_STORAGE_TYPE) => {
                if self.base_path().is_none() {
                    return Err(TracedStorageError::invalid_option(
                        "no base path found in foreign server options",
                    ));
                }
            }
            Some(other) => {
                return Err(TracedStorageError::invalid_option(format!(
                    "invalid value \"{other}\" for {} option",
                    Self::STORAGE_TYPE_KEY
                )));
            }
            None => {
                return Err(TracedStorageError::invalid_option(format!(
                    "{} option is required",
                    Self::STORAGE_TYPE_KEY
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_server(options: OptionsMap) -> ForeignServer {
        ForeignServer::new("s", "CSV", options)
    }

    #[test]
    fn local_storage_requires_base_path() {
        let mut options = OptionsMap::new();
        options.insert(
            ForeignServer::STORAGE_TYPE_KEY.into(),
            ForeignServer::LOCAL_FILE_STORAGE_TYPE.into(),
        );
        assert!(local_server(options.clone()).validate_options().is_err());

        options.insert(ForeignServer::BASE_PATH_KEY.into(), "/data".into());
        assert!(local_server(options).validate_options().is_ok());
    }

    #[test]
    fn unknown_storage_type_rejected() {
        let mut options = OptionsMap::new();
        options.insert(ForeignServer::STORAGE_TYPE_KEY.into(), "S3".into());
        assert!(local_server(options).validate_options().is_err());
    }
}
