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

//! Implements the same `List`/`Watch` contract the Agent does, but by
//! fanning each call out across every live Agent peer (§4.H) and merging
//! their results, rather than reading a local directory.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::warn;
use types::log_metadata::log_metadata_service_client::LogMetadataServiceClient;
use types::log_metadata::log_metadata_service_server::LogMetadataService;
use types::log_metadata::{
    LogMetadataList, LogMetadataListRequest, LogMetadataWatchEvent, LogMetadataWatchRequest,
};

use crate::config::NamespaceConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::interceptors::BearerToken;

pub struct AggregatorImpl {
    dispatcher: Arc<Dispatcher>,
    namespaces: Arc<NamespaceConfig>,
    shutdown_ctx: CancellationToken,
}

impl AggregatorImpl {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        namespaces: Arc<NamespaceConfig>,
        shutdown_ctx: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            namespaces,
            shutdown_ctx,
        }
    }

    fn bearer_token<T>(request: &Request<T>) -> String {
        request
            .extensions()
            .get::<BearerToken>()
            .map(|token| token.0.clone())
            .unwrap_or_default()
    }

    /// Applies the configured namespace allow list. An explicit, non-"all"
    /// request for a namespace outside the allow list is rejected; an
    /// unset/"all" request resolves to the allow list itself (or the
    /// configured default, if the allow list is empty).
    fn resolve_namespaces(&self, requested: Vec<String>) -> Result<Vec<String>, Status> {
        let explicit: Vec<String> = requested.into_iter().filter(|ns| !ns.is_empty()).collect();

        if self.namespaces.allow_list.is_empty() {
            if explicit.is_empty() {
                return Ok(self
                    .namespaces
                    .default
                    .clone()
                    .map(|ns| vec![ns])
                    .unwrap_or_else(|| vec![String::new()]));
            }
            return Ok(explicit);
        }

        if explicit.is_empty() {
            return Ok(self.namespaces.allow_list.clone());
        }

        for namespace in &explicit {
            if !self.namespaces.allow_list.contains(namespace) {
                return Err(Status::permission_denied(format!(
                    "namespace `{namespace}` is outside the configured allow list"
                )));
            }
        }

        Ok(explicit)
    }
}

#[tonic::async_trait]
impl LogMetadataService for AggregatorImpl {
    type WatchStream = ReceiverStream<Result<LogMetadataWatchEvent, Status>>;

    #[tracing::instrument(skip(self, request))]
    async fn list(
        &self,
        request: Request<LogMetadataListRequest>,
    ) -> Result<Response<LogMetadataList>, Status> {
        let token = Self::bearer_token(&request);
        let namespaces = self.resolve_namespaces(request.into_inner().namespaces)?;

        let results = self
            .dispatcher
            .fanout(move |addr, channel| {
                let namespaces = namespaces.clone();
                let token = token.clone();
                async move {
                    let mut client = LogMetadataServiceClient::with_interceptor(
                        channel,
                        crate::interceptors::BearerInterceptor::new(token),
                    );
                    client
                        .list(LogMetadataListRequest { namespaces })
                        .await
                        .map(|response| response.into_inner())
                        .map_err(|status| {
                            warn!("list failed against peer {addr}: {status}");
                            DispatchError::Call(status)
                        })
                }
            })
            .await;

        let mut items = Vec::new();
        for result in results {
            // A permission error from any single peer is propagated to the
            // caller verbatim rather than silently dropped from the merge.
            items.extend(result?.items);
        }

        Ok(Response::new(LogMetadataList { items }))
    }

    #[tracing::instrument(skip(self, request))]
    async fn watch(
        &self,
        request: Request<LogMetadataWatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let token = Self::bearer_token(&request);
        let namespaces = self.resolve_namespaces(request.into_inner().namespaces)?;

        let (out_tx, out_rx) = mpsc::channel(100);
        let watch_ctx = self.shutdown_ctx.child_token();
        let watchdog_tx = out_tx.clone();

        let subscription = self
            .dispatcher
            .fanout_subscribe(watch_ctx, move |peer_ctx, addr, channel| {
                let namespaces = namespaces.clone();
                let token = token.clone();
                let out_tx = out_tx.clone();
                async move {
                    let mut client = LogMetadataServiceClient::with_interceptor(
                        channel,
                        crate::interceptors::BearerInterceptor::new(token),
                    );

                    let mut stream = match client
                        .watch(LogMetadataWatchRequest { namespaces })
                        .await
                    {
                        Ok(response) => response.into_inner(),
                        Err(status) => {
                            warn!("watch failed to start against peer {addr}: {status}");
                            let _ = out_tx.send(Err(status)).await;
                            return;
                        }
                    };

                    loop {
                        tokio::select! {
                            _ = peer_ctx.cancelled() => return,
                            event = stream.message() => {
                                match event {
                                    Ok(Some(event)) => {
                                        if out_tx.send(Ok(event)).await.is_err() {
                                            return;
                                        }
                                    }
                                    Ok(None) => return,
                                    Err(status) => {
                                        warn!("watch stream from peer {addr} errored: {status}");
                                        let _ = out_tx.send(Err(status)).await;
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            })
            .await;

        // Tear the subscription down once the caller drops the stream
        // (detected via the output channel closing) or the server starts
        // shutting down, whichever happens first.
        tokio::spawn(async move {
            watchdog_tx.closed().await;
            subscription.cancel().await;
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}
