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

use std::path::PathBuf;

use snafu::{Location, Snafu};
use strum_macros::Display;
use tsumiki_common::{ChunkId, ObjectIndex};
use tsumiki_types::{IoMode, ToCode};

pub type Result<T> = std::result::Result<T, Error>;

/// The store operation that was running when a syscall failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StoreOp {
    Check,
    Format,
    Mount,
    Unmount,
    PersistSuper,
    LoadSuper,
    RemoveAll,
    ChunkCreate,
    ChunkRemove,
    ChunkOpen,
    ChunkClose,
    ChunkRead,
    ChunkWrite,
    ChunkPersist,
    ChunkLoad,
    ChunkSize,
    Backup,
}

impl StoreOp {
    fn code(&self) -> u8 {
        match self {
            StoreOp::Check => codes::INIT_ERR,
            StoreOp::Format => codes::FORMAT_ERR,
            StoreOp::Mount => codes::MOUNT_ERR,
            StoreOp::Unmount => codes::UNMOUNT_ERR,
            StoreOp::PersistSuper | StoreOp::ChunkPersist | StoreOp::Backup => codes::PERSIST_ERR,
            StoreOp::LoadSuper | StoreOp::ChunkLoad => codes::LOAD_ERR,
            StoreOp::RemoveAll => codes::CHUNK_REMOVE_ALL_ERR,
            StoreOp::ChunkCreate => codes::CHUNK_CREATE_ERR,
            StoreOp::ChunkRemove | StoreOp::ChunkSize => codes::CHUNK_REMOVE_ERR,
            StoreOp::ChunkOpen => codes::CHUNK_OPEN_ERR,
            StoreOp::ChunkClose => codes::CHUNK_CLOSE_ERR,
            StoreOp::ChunkRead => codes::CHUNK_READ_ERR,
            StoreOp::ChunkWrite => codes::CHUNK_WRITE_ERR,
        }
    }
}

/// Result codes of the file backed store. Zero always means success.
pub mod codes {
    pub const SUCCESS: u8 = 0x00;
    pub const INIT_ERR: u8 = 0x01;
    pub const CREATE_ERR: u8 = 0x02;
    pub const REMOVE_ERR: u8 = 0x03;
    pub const LOAD_ERR: u8 = 0x04;
    pub const PERSIST_ERR: u8 = 0x05;
    pub const NO_SUPER: u8 = 0x06;
    pub const MKFS_ERR: u8 = 0x07;
    pub const STOP_FAILED: u8 = 0x08;
    pub const MOUNT_ERR: u8 = 0x09;
    pub const FORMAT_ERR: u8 = 0x0a;
    pub const UNMOUNT_ERR: u8 = 0x0b;

    pub const CHUNK_OPEN_ERR: u8 = 0x80;
    pub const CHUNK_CLOSE_ERR: u8 = 0x82;
    pub const CHUNK_CREATE_ERR: u8 = 0x83;
    pub const CHUNK_REMOVE_ERR: u8 = 0x84;
    pub const CHUNK_USING: u8 = 0x85;
    pub const CHUNK_NO_EXIST: u8 = 0x86;
    pub const CHUNK_EXIST: u8 = 0x88;
    pub const CHUNK_READ_ERR: u8 = 0x89;
    pub const CHUNK_WRITE_ERR: u8 = 0x89;
    pub const CHUNK_SET_XATTR_ERR: u8 = 0x8a;
    pub const CHUNK_GET_XATTR_ERR: u8 = 0x8b;
    pub const CHUNK_XATTR_NO_NAME: u8 = 0x8c;
    pub const CHUNK_REMOVE_ALL_ERR: u8 = 0x8d;
}

/// Coarse classification of an [Error].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad path, size or mode token, or not enough free space. Nothing was
    /// mutated.
    Config,
    /// Create on an existing id, or open/remove of a missing one.
    Existence,
    /// The chunk or store is still in use.
    Busy,
    /// A syscall failed or transferred less than requested.
    Io,
    /// The asynchronous I/O machinery could not be set up.
    Setup,
    /// The operation is not valid in the current store or chunk state.
    State,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    // Configuration
    #[snafu(display("cannot read config {:?}: {}", path, source))]
    ConfigIo {
        #[snafu(implicit)]
        location: Location,
        path:     PathBuf,
        source:   std::io::Error,
    },

    #[snafu(display("config_path {:?} does not match the loaded file {:?}", found, expected))]
    ConfigPathMismatch {
        #[snafu(implicit)]
        location: Location,
        expected: PathBuf,
        found:    String,
    },

    #[snafu(display("invalid value {:?} for config key {:?}: {}", value, key, reason))]
    InvalidConfigValue {
        #[snafu(implicit)]
        location: Location,
        key:      String,
        value:    String,
        reason:   String,
    },

    #[snafu(display("config key {:?} has no value", key))]
    MissingConfigValue {
        #[snafu(implicit)]
        location: Location,
        key:      String,
    },

    #[snafu(display("base path {:?} does not exist", path))]
    NoBasePath {
        #[snafu(implicit)]
        location: Location,
        path:     PathBuf,
    },

    #[snafu(display("{} {:?} must be one path component of [A-Za-z0-9_]", key, value))]
    InvalidSubPath {
        #[snafu(implicit)]
        location: Location,
        key:      &'static str,
        value:    String,
    },

    #[snafu(display("{:?} has {} bytes free, the store needs {}", path, available, required))]
    InsufficientSpace {
        #[snafu(implicit)]
        location:  Location,
        path:      PathBuf,
        required:  u64,
        available: u64,
    },

    #[snafu(display("invalid store url {:?}", url))]
    InvalidUrl {
        #[snafu(implicit)]
        location: Location,
        url:      String,
    },

    #[snafu(display("unknown store driver {:?}", driver))]
    UnknownDriver {
        #[snafu(implicit)]
        location: Location,
        driver:   String,
    },

    // Existence
    #[snafu(display("chunk {:x} already exists", chunk_id))]
    ChunkExists {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
    },

    #[snafu(display("chunk {:x} does not exist", chunk_id))]
    ChunkNotFound {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
    },

    #[snafu(display("chunk {:x} has no xattr {:?}", chunk_id, name))]
    XattrNotFound {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
        name:     String,
    },

    #[snafu(display("no superblock at {:?}", path))]
    NoSuperblock {
        #[snafu(implicit)]
        location: Location,
        path:     PathBuf,
    },

    // Busy
    #[snafu(display("chunk {:x} is open", chunk_id))]
    ChunkBusy {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
    },

    #[snafu(display("store still has {} open chunks", open_chunks))]
    StoreBusy {
        #[snafu(implicit)]
        location:    Location,
        open_chunks: usize,
    },

    // State
    #[snafu(display("store is not mounted"))]
    NotMounted {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("store is already mounted"))]
    AlreadyMounted {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("chunk {:x} is already closed", chunk_id))]
    AlreadyClosed {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
    },

    #[snafu(display("chunk {:x} was opened by a {} store, not a {} one", chunk_id, owner, driver))]
    ForeignHandle {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
        owner:    &'static str,
        driver:   &'static str,
    },

    #[snafu(display("chunk {:x} cannot do this in {} mode", chunk_id, mode))]
    WrongIoMode {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
        mode:     IoMode,
    },

    // I/O
    #[snafu(display("{} failed on {:?}: {}", op, path, source))]
    Io {
        #[snafu(implicit)]
        location: Location,
        op:       StoreOp,
        path:     PathBuf,
        source:   std::io::Error,
    },

    #[snafu(display(
        "short {} on chunk {:x}: request {} (object {:x}) moved {} of {} bytes",
        op, chunk_id, request, object, actual, expected
    ))]
    ShortTransfer {
        #[snafu(implicit)]
        location: Location,
        op:       StoreOp,
        chunk_id: ChunkId,
        request:  usize,
        object:   ObjectIndex,
        expected: u64,
        actual:   u64,
    },

    #[snafu(display(
        "range {}+{} is outside chunk {:x} of {} bytes",
        offset, length, chunk_id, size
    ))]
    OutOfRange {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
        offset:   u64,
        length:   u64,
        size:     u64,
    },

    #[snafu(display(
        "direct I/O on chunk {:x} needs {} byte alignment, got {}+{}",
        chunk_id, align, offset, length
    ))]
    Unaligned {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
        offset:   u64,
        length:   u64,
        align:    usize,
    },

    #[snafu(display(
        "chunk {:x} submitted {} of {} asynchronous requests",
        chunk_id, submitted, expected
    ))]
    AsyncSubmit {
        #[snafu(implicit)]
        location:  Location,
        chunk_id:  ChunkId,
        submitted: usize,
        expected:  usize,
    },

    #[snafu(display("asynchronous {} on chunk {:x} did not complete", op, chunk_id))]
    AsyncAborted {
        #[snafu(implicit)]
        location: Location,
        op:       StoreOp,
        chunk_id: ChunkId,
    },

    #[snafu(display("corrupt descriptor {:?}: {}", path, reason))]
    CorruptDescriptor {
        #[snafu(implicit)]
        location: Location,
        path:     PathBuf,
        reason:   String,
    },

    #[snafu(display("corrupt backup {:?} at line {}: {}", path, line, reason))]
    CorruptBackup {
        #[snafu(implicit)]
        location: Location,
        path:     PathBuf,
        line:     usize,
        reason:   String,
    },

    #[snafu(display(
        "xattr on chunk {:x} too long: name {} bytes, value {} bytes",
        chunk_id, name_len, value_len
    ))]
    XattrTooLong {
        #[snafu(implicit)]
        location:  Location,
        chunk_id:  ChunkId,
        name_len:  usize,
        value_len: usize,
    },

    #[snafu(display("xattr {:?} on chunk {:x} cannot be stored: {}", name, chunk_id, reason))]
    InvalidXattr {
        #[snafu(implicit)]
        location: Location,
        chunk_id: ChunkId,
        name:     String,
        reason:   &'static str,
    },

    // Setup
    #[snafu(display("cannot start the io runtime: {}", source))]
    IoRuntime {
        #[snafu(implicit)]
        location: Location,
        source:   std::io::Error,
    },

    #[snafu(display("cannot spawn the completion reactor: {}", source))]
    ReactorSpawn {
        #[snafu(implicit)]
        location: Location,
        source:   std::io::Error,
    },

    #[snafu(display("completion reactor panicked"))]
    ReactorPanicked {
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigIo { .. }
            | Error::ConfigPathMismatch { .. }
            | Error::InvalidConfigValue { .. }
            | Error::MissingConfigValue { .. }
            | Error::NoBasePath { .. }
            | Error::InvalidSubPath { .. }
            | Error::InsufficientSpace { .. }
            | Error::InvalidUrl { .. }
            | Error::UnknownDriver { .. } => ErrorKind::Config,

            Error::ChunkExists { .. }
            | Error::ChunkNotFound { .. }
            | Error::XattrNotFound { .. }
            | Error::NoSuperblock { .. } => ErrorKind::Existence,

            Error::ChunkBusy { .. } | Error::StoreBusy { .. } => ErrorKind::Busy,

            Error::NotMounted { .. }
            | Error::AlreadyMounted { .. }
            | Error::AlreadyClosed { .. }
            | Error::ForeignHandle { .. }
            | Error::WrongIoMode { .. }
            | Error::OutOfRange { .. }
            | Error::Unaligned { .. }
            | Error::XattrTooLong { .. }
            | Error::InvalidXattr { .. } => ErrorKind::State,

            Error::Io { .. }
            | Error::ShortTransfer { .. }
            | Error::AsyncSubmit { .. }
            | Error::AsyncAborted { .. }
            | Error::CorruptDescriptor { .. }
            | Error::CorruptBackup { .. } => ErrorKind::Io,

            Error::IoRuntime { .. } | Error::ReactorSpawn { .. } | Error::ReactorPanicked { .. } => {
                ErrorKind::Setup
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ChunkNotFound { .. } | Error::XattrNotFound { .. } | Error::NoSuperblock { .. }
        )
    }

    pub fn is_busy(&self) -> bool { self.kind() == ErrorKind::Busy }

    /// The errno of the failed syscall, if one is attached.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } | Error::ConfigIo { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl ToCode for Error {
    fn to_code(&self) -> u8 {
        match self {
            Error::ConfigIo { .. }
            | Error::ConfigPathMismatch { .. }
            | Error::InvalidConfigValue { .. }
            | Error::MissingConfigValue { .. }
            | Error::NoBasePath { .. }
            | Error::InvalidSubPath { .. }
            | Error::InsufficientSpace { .. } => codes::INIT_ERR,
            Error::InvalidUrl { .. } | Error::UnknownDriver { .. } => codes::CREATE_ERR,

            Error::ChunkExists { .. } => codes::CHUNK_EXIST,
            Error::ChunkNotFound { .. } => codes::CHUNK_NO_EXIST,
            Error::XattrNotFound { .. } => codes::CHUNK_XATTR_NO_NAME,
            Error::NoSuperblock { .. } => codes::NO_SUPER,

            Error::ChunkBusy { .. } => codes::CHUNK_USING,
            Error::StoreBusy { .. } => codes::UNMOUNT_ERR,

            Error::NotMounted { .. } | Error::AlreadyMounted { .. } => codes::MOUNT_ERR,
            Error::AlreadyClosed { .. } | Error::ForeignHandle { .. } => codes::CHUNK_CLOSE_ERR,
            Error::WrongIoMode { .. } => codes::CHUNK_OPEN_ERR,
            Error::XattrTooLong { .. } | Error::InvalidXattr { .. } => codes::CHUNK_SET_XATTR_ERR,

            Error::Io { op, .. } => op.code(),
            Error::ShortTransfer { op, .. } | Error::AsyncAborted { op, .. } => op.code(),
            Error::OutOfRange { .. } | Error::Unaligned { .. } | Error::AsyncSubmit { .. } => {
                codes::CHUNK_READ_ERR
            }
            Error::CorruptDescriptor { .. } | Error::CorruptBackup { .. } => codes::LOAD_ERR,

            Error::IoRuntime { .. } | Error::ReactorSpawn { .. } => codes::MOUNT_ERR,
            Error::ReactorPanicked { .. } => codes::STOP_FAILED,
        }
    }
}
