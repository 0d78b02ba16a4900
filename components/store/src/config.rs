// Copyright 2024 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::{Display, Formatter},
    fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};
use tsumiki_common::{
    DEFAULT_BACKUP_DIR, DEFAULT_BLOCK_SIZE_SHIFT, DEFAULT_DATA_DIR, DEFAULT_IO_DEPTH,
    DEFAULT_JOURNAL_DIR, DEFAULT_META_DIR,
};
use tsumiki_types::IoMode;
use tsumiki_utils::readable_size::{SizeUnit, UnitSize};

use crate::{
    err::{
        ConfigIoSnafu, ConfigPathMismatchSnafu, InsufficientSpaceSnafu, InvalidConfigValueSnafu,
        InvalidSubPathSnafu, IoSnafu, MissingConfigValueSnafu, NoBasePathSnafu, Result, StoreOp,
    },
    layout::StoreLayout,
};

const MIN_BLOCK_SIZE_SHIFT: u8 = 12;
const MAX_BLOCK_SIZE_SHIFT: u8 = 30;

/// [FileStoreConfig] is the content of a file store's config file: one
/// `key value` pair per line, `#` starting a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStoreConfig {
    /// [config_path] is where this config lives. A `config_path` key inside
    /// the file must name the same file.
    pub config_path:      PathBuf,
    /// [base_path] is the directory holding every other store directory.
    pub base_path:        PathBuf,
    pub data_path:        String,
    pub meta_path:        String,
    pub journal_path:     String,
    pub backup_path:      String,
    /// [store_size] is the capacity the store advertises.
    pub store_size:       UnitSize,
    pub io_mode:          IoMode,
    /// [io_depth] caps the in-flight sub requests of one chunk in async mode.
    pub io_depth:         usize,
    /// [direct_io] opens objects with `O_DIRECT` in async mode.
    pub direct_io:        bool,
    /// [block_size_shift] sets the object size of chunks created from now on.
    pub block_size_shift: u8,
}

impl FileStoreConfig {
    pub fn new(config_path: impl Into<PathBuf>, base_path: impl Into<PathBuf>) -> Self {
        FileStoreConfig {
            config_path:      config_path.into(),
            base_path:        base_path.into(),
            data_path:        DEFAULT_DATA_DIR.to_string(),
            meta_path:        DEFAULT_META_DIR.to_string(),
            journal_path:     DEFAULT_JOURNAL_DIR.to_string(),
            backup_path:      DEFAULT_BACKUP_DIR.to_string(),
            store_size:       UnitSize::new(1, SizeUnit::Giga),
            io_mode:          IoMode::Sync,
            io_depth:         DEFAULT_IO_DEPTH,
            direct_io:        false,
            block_size_shift: DEFAULT_BLOCK_SIZE_SHIFT,
        }
    }

    pub fn with_size(mut self, size: UnitSize) -> Self {
        self.store_size = size;
        self
    }

    pub fn with_io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    pub fn with_block_size_shift(mut self, shift: u8) -> Self {
        self.block_size_shift = shift;
        self
    }

    /// Read and parse the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context(ConfigIoSnafu { path })?;
        Self::parse(path, &content)
    }

    pub fn parse(config_path: impl Into<PathBuf>, content: &str) -> Result<Self> {
        let mut cfg = FileStoreConfig::new(config_path, PathBuf::new());
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else {
                continue;
            };
            let value = parts.next().context(MissingConfigValueSnafu { key })?;
            cfg.apply(key, value)?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "config_path" => {
                ensure!(
                    Path::new(value) == self.config_path,
                    ConfigPathMismatchSnafu {
                        expected: self.config_path.clone(),
                        found:    value,
                    }
                );
            }
            "base_path" => self.base_path = PathBuf::from(value),
            "data_path" => self.data_path = value.to_string(),
            "meta_path" => self.meta_path = value.to_string(),
            "journal_path" => self.journal_path = value.to_string(),
            "backup_path" => self.backup_path = value.to_string(),
            "store_size" | "size" => {
                self.store_size = UnitSize::from_str(value).map_err(|reason| {
                    InvalidConfigValueSnafu { key, value, reason }.build()
                })?;
            }
            "io_mode" => {
                self.io_mode = IoMode::from_str(value).map_err(|e| {
                    InvalidConfigValueSnafu {
                        key,
                        value,
                        reason: e.to_string(),
                    }
                    .build()
                })?;
            }
            "io_depth" => {
                self.io_depth = value
                    .parse::<usize>()
                    .ok()
                    .filter(|d| *d > 0)
                    .context(InvalidConfigValueSnafu {
                        key,
                        value,
                        reason: "expect a positive integer",
                    })?;
            }
            "direct_io" => {
                self.direct_io = match value {
                    "on" | "true" | "yes" => true,
                    "off" | "false" | "no" => false,
                    _ => {
                        return InvalidConfigValueSnafu {
                            key,
                            value,
                            reason: "expect on or off",
                        }
                        .fail();
                    }
                };
            }
            "block_size_shift" => {
                self.block_size_shift = value
                    .parse::<u8>()
                    .ok()
                    .filter(|s| (MIN_BLOCK_SIZE_SHIFT..=MAX_BLOCK_SIZE_SHIFT).contains(s))
                    .context(InvalidConfigValueSnafu {
                        key,
                        value,
                        reason: format!(
                            "expect a shift in {}..={}",
                            MIN_BLOCK_SIZE_SHIFT, MAX_BLOCK_SIZE_SHIFT
                        ),
                    })?;
            }
            _ => debug!(key, value, "skip unknown config key"),
        }
        Ok(())
    }

    /// Write the config back to [Self::config_path].
    pub fn store(&self) -> Result<()> {
        let mut content = String::new();
        content.push_str(&format!("config_path {}\n", self.config_path.display()));
        content.push_str(&format!("base_path {}\n", self.base_path.display()));
        content.push_str(&format!("data_path {}\n", self.data_path));
        content.push_str(&format!("meta_path {}\n", self.meta_path));
        content.push_str(&format!("journal_path {}\n", self.journal_path));
        content.push_str(&format!("backup_path {}\n", self.backup_path));
        content.push_str(&format!("store_size {}\n", self.store_size));
        content.push_str(&format!("io_mode {}\n", self.io_mode));
        content.push_str(&format!("io_depth {}\n", self.io_depth));
        content.push_str(&format!(
            "direct_io {}\n",
            if self.direct_io { "on" } else { "off" }
        ));
        content.push_str(&format!("block_size_shift {}\n", self.block_size_shift));

        let path = &self.config_path;
        let mut file = fs::File::create(path).context(ConfigIoSnafu { path })?;
        file.write_all(content.as_bytes())
            .context(ConfigIoSnafu { path })?;
        file.sync_all().context(ConfigIoSnafu { path })
    }

    /// Check the paths, the sub directory names and the free space of the
    /// device. Nothing on disk is modified.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.base_path.as_os_str().is_empty() && self.base_path.exists(),
            NoBasePathSnafu {
                path: self.base_path.clone(),
            }
        );
        for (key, value) in [
            ("data_path", &self.data_path),
            ("meta_path", &self.meta_path),
            ("journal_path", &self.journal_path),
            ("backup_path", &self.backup_path),
        ] {
            ensure!(is_valid_sub_path(value), InvalidSubPathSnafu { key, value });
        }

        let required = self.size_in_bytes();
        let available = available_space(&self.base_path)?;
        if available < required {
            warn!(
                base_path = ?self.base_path,
                required,
                available,
                "device is smaller than the configured store size"
            );
        }
        ensure!(
            available >= required,
            InsufficientSpaceSnafu {
                path: self.base_path.clone(),
                required,
                available,
            }
        );
        Ok(())
    }

    pub fn size_in_bytes(&self) -> u64 { self.store_size.as_bytes() }

    pub fn layout(&self) -> StoreLayout {
        StoreLayout::new(
            &self.base_path,
            &self.data_path,
            &self.meta_path,
            &self.journal_path,
            &self.backup_path,
        )
    }
}

impl Display for FileStoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "filestore://{}:{}:{}:{}:{}:{}:{}",
            self.base_path.display(),
            self.data_path,
            self.meta_path,
            self.journal_path,
            self.backup_path,
            self.store_size,
            self.io_mode
        )
    }
}

fn is_valid_sub_path(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn available_space(path: &Path) -> Result<u64> {
    let stat = rustix::fs::statvfs(path)
        .map_err(std::io::Error::from)
        .context(IoSnafu {
            op: StoreOp::Check,
            path,
        })?;
    Ok(stat.f_bsize.saturating_mul(stat.f_bavail))
}
