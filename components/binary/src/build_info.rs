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

mod built {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const AUTHOR: &str = built::PKG_AUTHORS;

const COMMIT: &str = match built::GIT_COMMIT_HASH_SHORT {
    Some(hash) => hash,
    None => "",
};

/// The package version, tagged with the commit unless this is a release
/// build (`TSUMIKI_RELEASE` set at compile time).
pub const FULL_VERSION: &str = {
    const DIRTY: &str = match built::GIT_DIRTY {
        Some(true) => "-dirty",
        _ => "",
    };
    if option_env!("TSUMIKI_RELEASE").is_some() {
        built::PKG_VERSION
    } else if COMMIT.is_empty() {
        const_format::concatcp!(built::PKG_VERSION, "-dev")
    } else {
        const_format::concatcp!(built::PKG_VERSION, "-dev+", COMMIT, DIRTY)
    }
};

/// One line describing the binary, printed by `tsumiki info`.
pub const BUILD: &str = const_format::concatcp!(
    built::PKG_NAME,
    " ",
    FULL_VERSION,
    " (",
    built::TARGET,
    ", ",
    built::PROFILE,
    ")"
);
