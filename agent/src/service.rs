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

//! Bridges the directory watcher (§4.B), the per-key debouncer (§4.C) and
//! the permission checker (§4.D) to the wire: `LogMetadataImpl` is the
//! per-node implementation of `LogMetadataService`.
//!
//! Stream lifecycle: `INIT -> AUTHORIZED -> RUNNING -> (CLIENT_GONE |
//! SERVER_SHUTDOWN | WATCHER_ERROR | SEND_ERROR)`. Only `RUNNING` produces
//! events; every terminal state closes the watcher and returns promptly.

use std::env;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use prost_types::Timestamp;
use tokio::fs::read_dir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReadDirStream, ReceiverStream};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::{Request, Response, Status};
use tracing::debug;
use types::log_metadata::log_metadata_service_server::LogMetadataService;
use types::log_metadata::{
    LogMetadata, LogMetadataFileInfo, LogMetadataList, LogMetadataListRequest, LogMetadataSpec,
    LogMetadataWatchEvent, LogMetadataWatchRequest,
};

use crate::authorizer::{Authorizer, CacheKey};
use crate::debounce::Debouncer;
use crate::interceptors::BearerToken;
use crate::parser::{self, namespace_matches};
use crate::watcher::{DirectoryWatcher, FsOp, RawEvent};

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct LogMetadataImpl {
    logs_dir: PathBuf,
    node_name: String,
    shutdown_ctx: CancellationToken,
    task_tracker: TaskTracker,
    /// Fires once the directory watcher is wired up and the RUNNING loop is
    /// about to start. Replaces a global test event bus with an injected
    /// callback, so tests can synchronize without touching module state.
    on_watch_started: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Shared across every `list`/`watch` call so a cached authorization
    /// decision actually outlives the single RPC that produced it.
    auth_cache: Arc<moka::future::Cache<CacheKey, bool>>,
}

impl LogMetadataImpl {
    pub fn new(shutdown_ctx: CancellationToken, task_tracker: TaskTracker, logs_dir: PathBuf) -> Self {
        Self {
            logs_dir,
            node_name: env::var("NODE_NAME").unwrap_or_else(|_| "unknown-node".to_owned()),
            shutdown_ctx,
            task_tracker,
            on_watch_started: None,
            auth_cache: Authorizer::new_cache(),
        }
    }

    #[cfg(test)]
    fn with_watch_started_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_watch_started = Some(Arc::new(hook));
        self
    }

    fn bearer_token(request: &Request<LogMetadataListRequest>) -> Option<String> {
        request
            .extensions()
            .get::<BearerToken>()
            .map(|token| token.0.clone())
    }

    fn bearer_token_watch(request: &Request<LogMetadataWatchRequest>) -> Option<String> {
        request
            .extensions()
            .get::<BearerToken>()
            .map(|token| token.0.clone())
    }

    async fn authorizer_for(&self, token: Option<String>) -> Result<Authorizer, Status> {
        let token = token.unwrap_or_default();
        Authorizer::from_token(&token, self.auth_cache.clone()).await
    }

    fn stat(path: &Path) -> std::io::Result<LogMetadataFileInfo> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        Ok(LogMetadataFileInfo {
            size: metadata.size().try_into().unwrap_or(i64::MAX),
            last_modified_at: metadata.modified().ok().map(Timestamp::from),
        })
    }

    fn build_spec(link_path: &Path, node_name: &str) -> Option<LogMetadataSpec> {
        let spec = parser::parse(link_path)?;
        Some(LogMetadataSpec {
            node_name: node_name.to_owned(),
            namespace: spec.namespace,
            pod_name: spec.pod_name,
            container_name: spec.container_name,
            container_id: spec.container_id,
        })
    }

    /// Translates a raw watcher event into a `LogMetadataWatchEvent`. A file
    /// that vanished between the kernel event and the stat call is treated
    /// as a deletion rather than an error.
    fn build_watch_event(raw: &RawEvent, node_name: &str) -> Option<LogMetadataWatchEvent> {
        let spec = Self::build_spec(&raw.link_path, node_name)?;

        let (event_type, file_info) = match raw.op {
            FsOp::Created | FsOp::Modified => match Self::stat(&raw.link_path) {
                Ok(info) => {
                    let event_type = if raw.op == FsOp::Created {
                        "ADDED"
                    } else {
                        "MODIFIED"
                    };
                    (event_type, info)
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => (
                    "DELETED",
                    LogMetadataFileInfo {
                        size: 0,
                        last_modified_at: None,
                    },
                ),
                Err(error) => {
                    debug!("Could not stat {:?}: {}", raw.link_path, error);
                    return None;
                }
            },
            FsOp::Removed => (
                "DELETED",
                LogMetadataFileInfo {
                    size: 0,
                    last_modified_at: None,
                },
            ),
        };

        Some(LogMetadataWatchEvent {
            r#type: event_type.to_owned(),
            object: Some(LogMetadata {
                id: spec.container_id.clone(),
                spec: Some(spec),
                file_info: Some(file_info),
            }),
        })
    }
}

#[tonic::async_trait]
impl LogMetadataService for LogMetadataImpl {
    type WatchStream = ReceiverStream<Result<LogMetadataWatchEvent, Status>>;

    #[tracing::instrument(skip(self, request))]
    async fn list(
        &self,
        request: Request<LogMetadataListRequest>,
    ) -> Result<Response<LogMetadataList>, Status> {
        let token = Self::bearer_token(&request);
        let request = request.into_inner();

        if request.namespaces.is_empty() {
            return Err(Status::invalid_argument("namespaces must not be empty"));
        }

        let namespaces: Vec<String> = request
            .namespaces
            .into_iter()
            .filter(|namespace| !namespace.is_empty())
            .collect();

        let authorizer = self.authorizer_for(token).await?;
        authorizer.is_authorized(&namespaces, "list").await?;

        if !self.logs_dir.is_dir() {
            return Err(Status::new(
                tonic::Code::NotFound,
                format!("log directory not found: {}", self.logs_dir.to_string_lossy()),
            ));
        }

        let mut entries = ReadDirStream::new(read_dir(&self.logs_dir).await?);
        let mut items = Vec::new();

        while let Some(entry) = entries.next().await {
            let entry = match entry {
                Ok(entry) => entry,
                Err(io_error) if io_error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(io_error) => return Err(io_error.into()),
            };

            let Some(spec) = parser::parse(&entry.path()) else {
                // Unparseable names are skipped silently; they are never an
                // error to the client even under an explicit namespace set.
                continue;
            };

            if !namespace_matches(&namespaces, &spec.namespace) {
                continue;
            }

            let file_info = match Self::stat(&entry.path()) {
                Ok(info) => info,
                Err(io_error) if io_error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(io_error) => return Err(io_error.into()),
            };

            items.push(LogMetadata {
                id: spec.container_id.clone(),
                spec: Some(LogMetadataSpec {
                    node_name: self.node_name.clone(),
                    namespace: spec.namespace,
                    pod_name: spec.pod_name,
                    container_name: spec.container_name,
                    container_id: spec.container_id,
                }),
                file_info: Some(file_info),
            });
        }

        Ok(Response::new(LogMetadataList { items }))
    }

    #[tracing::instrument(skip(self, request))]
    async fn watch(
        &self,
        request: Request<LogMetadataWatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let token = Self::bearer_token_watch(&request);
        let request = request.into_inner();

        if request.namespaces.is_empty() {
            return Err(Status::invalid_argument("namespaces must not be empty"));
        }

        let namespaces: Vec<String> = request
            .namespaces
            .into_iter()
            .filter(|namespace| !namespace.is_empty())
            .collect();

        let authorizer = self.authorizer_for(token).await?;
        authorizer.is_authorized(&namespaces, "watch").await?;

        let (out_tx, out_rx) = mpsc::channel(100);
        let watch_ctx = self.shutdown_ctx.child_token();

        let (dir_watcher, mut raw_rx) =
            DirectoryWatcher::new(watch_ctx.clone(), self.logs_dir.clone(), namespaces);
        self.task_tracker.spawn(dir_watcher.watch());

        if let Some(hook) = &self.on_watch_started {
            hook();
        }

        let debounce_ctx = watch_ctx.clone();
        let cancel_on_closed = watch_ctx.clone();
        let tx_for_action = out_tx.clone();
        let debouncer = Debouncer::new(debounce_ctx, DEBOUNCE_WINDOW, move |event| {
            match tx_for_action.try_send(Ok(event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => cancel_on_closed.cancel(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("dropping watch event: receiver is not keeping up");
                }
            }
        });

        let node_name = self.node_name.clone();
        let shutdown_ctx = self.shutdown_ctx.clone();
        let pump_ctx = watch_ctx.clone();
        let out_tx_for_pump = out_tx;

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_ctx.cancelled() => {
                        let _ = out_tx_for_pump
                            .send(Err(Status::new(tonic::Code::Unavailable, "server shutting down")))
                            .await;
                        pump_ctx.cancel();
                        break;
                    }
                    raw = raw_rx.recv() => {
                        match raw {
                            Some(Ok(raw_event)) => {
                                if let Some(event) = LogMetadataImpl::build_watch_event(&raw_event, &node_name) {
                                    debouncer.submit(raw_event.link_path.clone(), event);
                                }
                            }
                            Some(Err(watcher_error)) => {
                                let _ = out_tx_for_pump.send(Err(watcher_error.into())).await;
                                pump_ctx.cancel();
                                break;
                            }
                            None => {
                                pump_ctx.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::Builder;
    use tokio::sync::oneshot;
    use tokio_stream::StreamExt as _;

    fn create_test_file(dir: &Path, name: &str, num_bytes: usize) -> PathBuf {
        let mut file = Builder::new()
            .prefix(name)
            .suffix(".log")
            .tempfile_in(dir)
            .expect("failed to create file");
        file.write_all(&vec![0u8; num_bytes]).unwrap();
        let (_, path) = file.keep().unwrap();
        path
    }

    fn service(logs_dir: PathBuf) -> LogMetadataImpl {
        LogMetadataImpl::new(CancellationToken::new(), TaskTracker::new(), logs_dir)
    }

    #[tokio::test]
    async fn rejects_empty_namespace_list() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path().to_path_buf());

        let result = svc
            .list(Request::new(LogMetadataListRequest { namespaces: vec![] }))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_stats_size() {
        let dir = tempfile::tempdir().unwrap();
        create_test_file(dir.path(), "pod-name_ns1_container-name-containerid", 5);
        create_test_file(dir.path(), "pod-name_ns2_container-name-otherid", 8);

        let svc = service(dir.path().to_path_buf());
        let mut result = svc
            .list(Request::new(LogMetadataListRequest {
                namespaces: vec!["ns1".into()],
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(result.items.len(), 1);
        let item = result.items.pop().unwrap();
        assert_eq!(item.spec.unwrap().namespace, "ns1");
        assert_eq!(item.file_info.unwrap().size, 5);
    }

    #[tokio::test]
    async fn list_sentinel_returns_every_namespace() {
        let dir = tempfile::tempdir().unwrap();
        create_test_file(dir.path(), "pod_all-ns1_c-1", 1);
        create_test_file(dir.path(), "pod_all-ns2_c-2", 1);

        let svc = service(dir.path().to_path_buf());
        let result = svc
            .list(Request::new(LogMetadataListRequest {
                namespaces: vec![String::new()],
            }))
            .await
            .unwrap()
            .into_inner();

        let namespaces: Vec<_> = result
            .items
            .iter()
            .map(|item| item.spec.as_ref().unwrap().namespace.clone())
            .collect();
        assert!(namespaces.contains(&"all-ns1".to_owned()));
        assert!(namespaces.contains(&"all-ns2".to_owned()));
    }

    #[tokio::test]
    async fn watch_emits_added_then_modified_for_a_burst_of_writes() {
        let dir = tempfile::tempdir().unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = oneshot::channel();
        let started_tx = std::sync::Mutex::new(Some(started_tx));

        let svc = service(dir.path().to_path_buf()).with_watch_started_hook(move || {
            started.store(true, Ordering::SeqCst);
            if let Some(tx) = started_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });

        let mut stream = svc
            .watch(Request::new(LogMetadataWatchRequest {
                namespaces: vec!["ns1".into()],
            }))
            .await
            .unwrap()
            .into_inner();

        started_rx.await.unwrap();

        let path = dir.path().join("pod_ns1_container-burstid.log");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&[0; 2]).unwrap();
        file.write_all(&[1; 2]).unwrap();
        drop(file);

        let added = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for ADDED")
            .unwrap()
            .unwrap();
        assert_eq!(added.r#type, "ADDED");
    }
}
