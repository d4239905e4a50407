// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{LockError, Result};
use crate::types::LockType;

/// A request path broken into its lockable prefixes.
///
/// `/a/b/c` yields the levels `a`, `a/b`, `a/b/c`, root first. Empty segments
/// (leading, trailing or doubled separators) are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPath {
    path: String,
    levels: Vec<String>,
}

impl LockPath {
    pub fn parse(path: &str, separator: &str) -> Result<Self> {
        if separator.is_empty() {
            return Err(LockError::invalid_path(path, "empty path separator"));
        }
        let segments: Vec<&str> = path.split(separator).filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(LockError::invalid_path(path, "path has no segments"));
        }

        let levels = (1..=segments.len()).map(|depth| segments[..depth].join(separator)).collect();
        Ok(Self {
            path: path.to_string(),
            levels,
        })
    }

    /// The path as requested
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Lock keys, root first
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn leaf(&self) -> &str {
        // parse guarantees at least one level
        self.levels.last().map(String::as_str).unwrap_or_default()
    }

    /// Mode for the level at `depth`: ancestors are always shared, the leaf takes `mode`
    pub fn mode_at(&self, depth: usize, mode: LockType) -> LockType {
        if depth + 1 == self.levels.len() { mode } else { LockType::Shared }
    }
}
