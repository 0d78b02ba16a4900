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

use std::path::{Path, PathBuf};

use tsumiki_common::{
    chunk_file_name, object_file_name, ChunkId, ObjectIndex, SUPERBLOCK_FILE, TEMP_SUFFIX,
};

/// Where everything of a file store lives on disk:
///
/// ```text
/// <base>/<meta>/superblock
/// <base>/<meta>/<chunk id in hex>            chunk descriptor
/// <base>/<data>/<chunk id in hex>/<index>    one file per object
/// <base>/<journal>, <base>/<backup>          reserved
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    base:    PathBuf,
    data:    PathBuf,
    meta:    PathBuf,
    journal: PathBuf,
    backup:  PathBuf,
}

impl StoreLayout {
    pub fn new(base: &Path, data: &str, meta: &str, journal: &str, backup: &str) -> Self {
        StoreLayout {
            base:    base.to_path_buf(),
            data:    base.join(data),
            meta:    base.join(meta),
            journal: base.join(journal),
            backup:  base.join(backup),
        }
    }

    pub fn base_dir(&self) -> &Path { &self.base }

    pub fn data_dir(&self) -> &Path { &self.data }

    pub fn meta_dir(&self) -> &Path { &self.meta }

    pub fn journal_dir(&self) -> &Path { &self.journal }

    pub fn backup_dir(&self) -> &Path { &self.backup }

    /// The four store directories in the order format recreates them.
    pub fn sub_dirs(&self) -> [&Path; 4] { [&self.backup, &self.journal, &self.meta, &self.data] }

    pub fn superblock_path(&self) -> PathBuf { self.meta.join(SUPERBLOCK_FILE) }

    pub fn chunk_meta_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.meta.join(chunk_file_name(chunk_id))
    }

    pub fn chunk_data_dir(&self, chunk_id: ChunkId) -> PathBuf {
        self.data.join(chunk_file_name(chunk_id))
    }

    /// Where a data directory is moved before it is deleted.
    pub fn chunk_trash_dir(&self, chunk_id: ChunkId) -> PathBuf {
        self.data.join(format!(".{}", chunk_file_name(chunk_id)))
    }

    pub fn object_path(&self, chunk_id: ChunkId, index: ObjectIndex) -> PathBuf {
        self.chunk_data_dir(chunk_id).join(object_file_name(index))
    }
}

/// `path` with the temp suffix appended.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(TEMP_SUFFIX);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths() {
        let l = StoreLayout::new(Path::new("/s"), "store", "meta", "journal", "backup");
        assert_eq!(l.superblock_path(), Path::new("/s/meta/superblock"));
        assert_eq!(l.chunk_meta_path(0xab), Path::new("/s/meta/ab"));
        assert_eq!(l.chunk_data_dir(0xab), Path::new("/s/store/ab"));
        assert_eq!(l.chunk_trash_dir(0xab), Path::new("/s/store/.ab"));
        assert_eq!(l.object_path(0xab, 10), Path::new("/s/store/ab/a"));
        assert_eq!(temp_path(Path::new("/s/meta/ab")), Path::new("/s/meta/ab.temp"));
    }
}
