// Copyright 2024 The Kubetail Authors
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

//! Decodes `<pod>_<namespace>_<container>-<id>.log` into a [`LogFileSpec`].
//!
//! Applied to a base name only, never a full path, so callers can resolve
//! symlinks to backing files living anywhere on disk without confusing the
//! grammar.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Container name may itself contain hyphens, so the last hyphen before
/// `.log` is the one that delimits the container id.
pub static LOG_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<pod_name>[^_]+)_(?P<namespace>[^_]+)_(?P<container_name>.+)-(?P<container_id>[^-]+)\.log$",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileSpec {
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
    pub container_id: String,
}

/// Parses the base name of `path`. Returns `None` for names that don't match
/// the grammar; this is never an error at the point of parsing, only
/// (optionally) at the point a caller explicitly requested that name.
pub fn parse(path: &Path) -> Option<LogFileSpec> {
    let filename = path.file_name()?.to_string_lossy();
    parse_str(filename.as_ref())
}

pub fn parse_str(filename: &str) -> Option<LogFileSpec> {
    let captures: Captures = LOG_FILE_REGEX.captures(filename)?;
    Some(LogFileSpec {
        pod_name: captures["pod_name"].to_owned(),
        namespace: captures["namespace"].to_owned(),
        container_name: captures["container_name"].to_owned(),
        container_id: captures["container_id"].to_owned(),
    })
}

/// Inverse of [`parse`] — reconstructs the file name for a spec. Used by the
/// watcher to translate a symlink target event back into a directory entry
/// name, and by tests to exercise the round-trip law.
pub fn format(spec: &LogFileSpec) -> String {
    format!(
        "{}_{}_{}-{}.log",
        spec.pod_name, spec.namespace, spec.container_name, spec.container_id
    )
}

/// True if `namespaces` is empty (the "all namespaces" sentinel) or contains
/// `namespace`.
pub fn namespace_matches(namespaces: &[String], namespace: &str) -> bool {
    namespaces.is_empty() || namespaces.iter().any(|ns| ns == namespace)
}
