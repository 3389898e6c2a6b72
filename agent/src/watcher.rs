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

//! Wraps the kernel filesystem-event facility (via `notify`) to turn raw
//! events on the container-log directory and its symlink targets into a
//! single in-order channel of `(link_path, op)` events, filtered to the
//! requested namespaces.
//!
//! Kubernetes publishes container logs as stable symlinks in a known
//! directory while the actual file rotates underneath. Watching only the
//! link yields no write events; watching only the target loses stable
//! identity after rotation. The symlink cache (`target -> link_path`)
//! bridges both views: every watched target's events are translated back to
//! the stable link path before being re-emitted.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use thiserror::Error;
use tokio::fs::read_dir;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::{wrappers::ReadDirStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;

use crate::parser::{namespace_matches, parse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub link_path: PathBuf,
    pub op: FsOp,
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("error while accessing file: {0}")]
    Io(#[from] io::Error),
    #[error("error while trying to watch: {0}")]
    Watch(#[from] notify::Error),
    #[error("log directory not found: {0}")]
    DirNotFound(String),
}

impl From<WatcherError> for Status {
    fn from(error: WatcherError) -> Self {
        match error {
            WatcherError::Io(io_error) => io_error.into(),
            WatcherError::Watch(notify_error) => Self::from_error(Box::new(notify_error)),
            WatcherError::DirNotFound(_) => Self::new(tonic::Code::NotFound, error.to_string()),
        }
    }
}

/// `target path -> stable link path`, plus the reverse index. Populated only
/// during the initial walk and on directory-level CREATE events; cleared
/// only when either side is observed removed. Never holds back-pointers
/// beyond this one reverse index, so it can't cycle.
///
/// Both directions are needed because a removal can be observed from either
/// side: the kernel reports a directory-level REMOVE with the *link* path
/// when Kubernetes unlinks a container's stable symlink (the common case,
/// backing file untouched), but reports a REMOVE with the *target* path when
/// the backing file itself disappears while the link remains.
#[derive(Default)]
struct SymlinkCache {
    targets_by_path: HashMap<PathBuf, PathBuf>,
    links_by_path: HashMap<PathBuf, PathBuf>,
}

impl SymlinkCache {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, target: PathBuf, link_path: PathBuf) {
        self.links_by_path.insert(link_path.clone(), target.clone());
        self.targets_by_path.insert(target, link_path);
    }

    fn link_path_for_target(&self, target: &Path) -> Option<PathBuf> {
        self.targets_by_path.get(target).cloned()
    }

    fn target_for_link(&self, link_path: &Path) -> Option<PathBuf> {
        self.links_by_path.get(link_path).cloned()
    }

    /// Removes the entry identified by its target path, returning the
    /// target so the caller can unwatch it.
    fn remove_by_target(&mut self, target: &Path) {
        if let Some(link_path) = self.targets_by_path.remove(target) {
            self.links_by_path.remove(&link_path);
        }
    }

    /// Removes the entry identified by its link path, returning the target
    /// so the caller can unwatch it.
    fn remove_by_link(&mut self, link_path: &Path) -> Option<PathBuf> {
        let target = self.links_by_path.remove(link_path)?;
        self.targets_by_path.remove(&target);
        Some(target)
    }
}

/// Resolves the physical file a directory entry's events should be tracked
/// under: the symlink target if `path` is a symlink, or `path` itself
/// otherwise (letting tests exercise the watcher with plain files).
fn resolve_target(path: &Path) -> io::Result<PathBuf> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = fs::read_link(path)?;
            if target.is_absolute() {
                Ok(target)
            } else {
                Ok(path
                    .parent()
                    .map(|parent| parent.join(&target))
                    .unwrap_or(target))
            }
        }
        _ => Ok(path.to_path_buf()),
    }
}

pub struct DirectoryWatcher {
    ctx: CancellationToken,
    directory: PathBuf,
    namespaces: Vec<String>,
    event_tx: Sender<Result<RawEvent, WatcherError>>,
}

impl DirectoryWatcher {
    /// Returns a new watcher and the receiver end of its event channel.
    /// Closing the watcher closes this channel; callers observe that as
    /// stream termination.
    pub fn new(
        ctx: CancellationToken,
        directory: PathBuf,
        namespaces: Vec<String>,
    ) -> (Self, Receiver<Result<RawEvent, WatcherError>>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        (
            Self {
                ctx,
                directory,
                namespaces,
                event_tx,
            },
            event_rx,
        )
    }

    /// Walks the directory, wires up the kernel watcher, and pumps events
    /// until cancelled or the kernel layer errors. Never panics on
    /// transient readlink/stat errors — such events are dropped.
    pub async fn watch(self) {
        let mut cache = SymlinkCache::new();

        let mut watcher = match self.build_watcher().await {
            Ok((watcher, seed_cache)) => {
                cache = seed_cache;
                watcher
            }
            Err(error) => {
                let _ = self.event_tx.send(Err(error)).await;
                return;
            }
        };

        self.pump(&mut watcher, &mut cache).await;
    }

    async fn build_watcher(
        &self,
    ) -> Result<(WatcherHandle, SymlinkCache), WatcherError> {
        if !self.directory.is_dir() {
            return Err(WatcherError::DirNotFound(
                self.directory.to_string_lossy().to_string(),
            ));
        }

        let (raw_tx, raw_rx) = mpsc::channel(256);
        let mut inner: RecommendedWatcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    let _ = raw_tx.blocking_send(event);
                }
            })?;

        inner.watch(&self.directory, RecursiveMode::NonRecursive)?;

        let mut cache = SymlinkCache::new();
        let mut entries = ReadDirStream::new(read_dir(&self.directory).await?);
        while let Some(entry) = entries.next().await {
            let Ok(entry) = entry else { continue };
            self.try_register(&entry.path(), &mut inner, &mut cache);
        }

        Ok((WatcherHandle { inner, raw_rx }, cache))
    }

    /// Registers a directory entry with the kernel watcher if its name
    /// matches the container-log grammar and its namespace is requested.
    /// Returns true if the entry was registered.
    fn try_register(
        &self,
        path: &Path,
        watcher: &mut RecommendedWatcher,
        cache: &mut SymlinkCache,
    ) -> bool {
        let Some(spec) = parse(path) else {
            return false;
        };
        if !namespace_matches(&self.namespaces, &spec.namespace) {
            return false;
        }

        let target = match resolve_target(path) {
            Ok(target) => target,
            Err(error) => {
                debug!("Could not resolve watch target for {:?}: {}", path, error);
                return false;
            }
        };

        cache.insert(target.clone(), path.to_path_buf());

        // Re-watching an already-watched path, or watching a path that
        // disappeared between readdir and here, are both harmless no-ops.
        if let Err(error) = watcher.watch(&target, RecursiveMode::NonRecursive) {
            debug!("Failed to watch {:?}: {}", target, error);
        }

        true
    }

    async fn pump(&self, handle: &mut WatcherHandle, cache: &mut SymlinkCache) {
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => {
                    debug!("Directory watcher for {:?} cancelled", self.directory);
                    break;
                }
                event = handle.raw_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    for raw_event in self.translate(event, &mut handle.inner, cache) {
                        if self.event_tx.send(Ok(raw_event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn translate(
        &self,
        event: Event,
        watcher: &mut RecommendedWatcher,
        cache: &mut SymlinkCache,
    ) -> Vec<RawEvent> {
        let op = match event.kind {
            EventKind::Create(_) => FsOp::Created,
            EventKind::Modify(_) => FsOp::Modified,
            EventKind::Remove(_) => FsOp::Removed,
            // Access/Other/Any: not a write/create/remove signal we track.
            _ => return Vec::new(),
        };

        let mut out = Vec::new();
        for path in &event.paths {
            if op == FsOp::Created && path.parent() == Some(self.directory.as_path()) {
                if self.try_register(path, watcher, cache) {
                    out.push(RawEvent {
                        link_path: path.clone(),
                        op: FsOp::Created,
                    });
                }
                continue;
            }

            // A directory-level REMOVE on the link path itself — the usual
            // case when Kubernetes unlinks a container's stable symlink
            // while its backing file is left untouched. Checked first since
            // `path` here is a link path, not a target.
            if op == FsOp::Removed {
                if let Some(target) = cache.remove_by_link(path) {
                    let _ = watcher.unwatch(&target);
                    out.push(RawEvent {
                        link_path: path.clone(),
                        op: FsOp::Removed,
                    });
                    continue;
                }
            }

            if let Some(link_path) = cache.link_path_for_target(path) {
                if op == FsOp::Removed {
                    cache.remove_by_target(path);
                    let _ = watcher.unwatch(path);
                }
                out.push(RawEvent { link_path, op });
            }
        }
        out
    }
}

struct WatcherHandle {
    inner: RecommendedWatcher,
    raw_rx: Receiver<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::symlink;
    use tempfile::{tempdir, Builder};
    use tokio::time::{timeout, Duration};

    fn create_file(dir: &Path, name: &str, num_bytes: usize) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; num_bytes]).unwrap();
        path
    }

    #[tokio::test]
    async fn emits_created_for_matching_namespace() {
        let dir = tempdir().unwrap();
        let _existing = Builder::new()
            .prefix("pod_ns1_c-existing")
            .suffix(".log")
            .tempfile_in(dir.path())
            .unwrap();

        let ctx = CancellationToken::new();
        let (watcher, mut rx) =
            DirectoryWatcher::new(ctx.clone(), dir.path().to_path_buf(), vec!["ns1".into()]);

        let handle = tokio::spawn(watcher.watch());

        create_file(dir.path(), "pod_ns1_c-new.log", 4);

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
            .expect("watcher error");

        assert_eq!(event.op, FsOp::Created);
        assert_eq!(event.link_path.file_name().unwrap(), "pod_ns1_c-new.log");

        ctx.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn ignores_files_outside_requested_namespace() {
        let dir = tempdir().unwrap();
        let ctx = CancellationToken::new();
        let (watcher, mut rx) =
            DirectoryWatcher::new(ctx.clone(), dir.path().to_path_buf(), vec!["ns1".into()]);

        let handle = tokio::spawn(watcher.watch());

        create_file(dir.path(), "pod_ns2_c-other.log", 4);

        let result = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "no event should be emitted for ns2");

        ctx.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn errors_on_missing_directory() {
        let ctx = CancellationToken::new();
        let (watcher, mut rx) = DirectoryWatcher::new(
            ctx,
            PathBuf::from("/a/dir/that/does/not/exist"),
            vec!["ns1".into()],
        );

        tokio::spawn(watcher.watch());

        let result = rx.recv().await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_closes_the_channel() {
        let dir = tempdir().unwrap();
        let ctx = CancellationToken::new();
        let (watcher, mut rx) =
            DirectoryWatcher::new(ctx.clone(), dir.path().to_path_buf(), vec!["ns1".into()]);

        let handle = tokio::spawn(watcher.watch());
        ctx.cancel();
        let _ = timeout(Duration::from_secs(2), handle)
            .await
            .expect("watch task should exit promptly");

        assert!(rx.recv().await.is_none());
    }

    /// Exercises the symlink-indirection path the watcher exists for: a
    /// link in the watched directory pointing at a backing file in an
    /// unrelated directory, as Kubernetes actually lays out container logs.
    #[tokio::test]
    async fn emits_created_for_a_real_symlink_to_another_directory() {
        let watched_dir = tempdir().unwrap();
        let backing_dir = tempdir().unwrap();

        let ctx = CancellationToken::new();
        let (watcher, mut rx) = DirectoryWatcher::new(
            ctx.clone(),
            watched_dir.path().to_path_buf(),
            vec!["ns1".into()],
        );
        let handle = tokio::spawn(watcher.watch());

        let target = create_file(backing_dir.path(), "real-backing-file", 4);
        let link_path = watched_dir.path().join("pod_ns1_c-sym.log");
        symlink(&target, &link_path).unwrap();

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
            .expect("watcher error");

        assert_eq!(event.op, FsOp::Created);
        assert_eq!(event.link_path, link_path);

        ctx.cancel();
        let _ = handle.await;
    }

    /// Regression test: removing the *link* itself (the backing file left
    /// untouched) must surface exactly one DELETED for the link path, per
    /// spec's "no silent drops" invariant. The symlink cache is keyed only
    /// by target, so a bare unlink of the stable symlink used to produce no
    /// event at all.
    #[tokio::test]
    async fn deleting_a_real_symlink_emits_deleted_for_the_link_path() {
        let watched_dir = tempdir().unwrap();
        let backing_dir = tempdir().unwrap();

        let target = create_file(backing_dir.path(), "real-backing-file", 4);
        let link_path = watched_dir.path().join("pod_ns1_c-sym.log");
        symlink(&target, &link_path).unwrap();

        let ctx = CancellationToken::new();
        let (watcher, mut rx) = DirectoryWatcher::new(
            ctx.clone(),
            watched_dir.path().to_path_buf(),
            vec!["ns1".into()],
        );
        let handle = tokio::spawn(watcher.watch());

        fs::remove_file(&link_path).unwrap();

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
            .expect("watcher error");

        assert_eq!(event.op, FsOp::Removed);
        assert_eq!(event.link_path, link_path);

        ctx.cancel();
        let _ = handle.await;
    }

    /// A write to the backing target file must be reported under the stable
    /// link path, not the target path — the other half of the symlink
    /// bridge.
    #[tokio::test]
    async fn modifying_the_backing_target_emits_event_for_the_link_path() {
        let watched_dir = tempdir().unwrap();
        let backing_dir = tempdir().unwrap();

        let target = create_file(backing_dir.path(), "real-backing-file", 4);
        let link_path = watched_dir.path().join("pod_ns1_c-sym.log");
        symlink(&target, &link_path).unwrap();

        let ctx = CancellationToken::new();
        let (watcher, mut rx) = DirectoryWatcher::new(
            ctx.clone(),
            watched_dir.path().to_path_buf(),
            vec!["ns1".into()],
        );
        let handle = tokio::spawn(watcher.watch());

        let mut file = std::fs::OpenOptions::new().append(true).open(&target).unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();
        drop(file);

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
            .expect("watcher error");

        assert_eq!(event.op, FsOp::Modified);
        assert_eq!(event.link_path, link_path);

        ctx.cancel();
        let _ = handle.await;
    }
}
