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

//! Issues self-subject-access-reviews against the cluster API for
//! `pods/log` verbs, using the *caller's* bearer token rather than the
//! Agent's own service-account identity, so access decisions respect the
//! caller that the Aggregator (or any other client) is acting on behalf of.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::{api::PostParams, config::AuthInfo, Api, Client, Config};
use moka::future::Cache;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tonic::Status;

/// Cache key: `(token_hash, namespace, verb)`.
pub type CacheKey = (String, String, String);

pub struct Authorizer {
    k8s_config: Config,
    auth_cache: Arc<Cache<CacheKey, bool>>,
}

impl Authorizer {
    const DEFAULT_CACHE_TTL_SECS: u64 = 300;
    const DEFAULT_CACHE_MAX_CAPACITY: u64 = 10_000;

    /// Builds the process-wide cache backing every [`Authorizer`] instance.
    /// Held once by the service (not rebuilt per RPC), so a TTL entry
    /// actually survives across calls instead of dying with the `Authorizer`
    /// that wrote it.
    pub fn new_cache() -> Arc<Cache<CacheKey, bool>> {
        Arc::new(
            Cache::builder()
                .max_capacity(Self::DEFAULT_CACHE_MAX_CAPACITY)
                .time_to_live(Duration::from_secs(Self::DEFAULT_CACHE_TTL_SECS))
                .build(),
        )
    }

    /// Builds an authorizer scoped to the given bearer token (extracted by
    /// [`crate::interceptors::extract_bearer`] from the incoming call's
    /// `authorization` metadata) and backed by `cache`, shared across every
    /// call the service handles so the TTL is meaningful across requests.
    /// Empty/missing tokens are accepted by the transport per §6, but every
    /// permission check against one fails.
    pub async fn from_token(token: &str, cache: Arc<Cache<CacheKey, bool>>) -> Result<Self, Status> {
        let mut k8s_config = Config::infer().await.map_err(|error| {
            Status::new(
                tonic::Code::Unknown,
                format!("unable to infer k8s config: {error}"),
            )
        })?;

        k8s_config.auth_info = AuthInfo {
            token: Some(token.to_owned().into()),
            ..Default::default()
        };

        Ok(Self {
            k8s_config,
            auth_cache: cache,
        })
    }

    fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Checks that the caller may `verb` `pods/log` in every namespace of
    /// `namespaces`. An empty slice means "all namespaces" and is checked as
    /// a single cluster-wide review against the `""` namespace. Any denial
    /// short-circuits with an `Unauthenticated`-kind status naming the
    /// namespace and verb; any transport error from the cluster API is
    /// surfaced unchanged.
    pub async fn is_authorized(&self, namespaces: &[String], verb: &str) -> Result<(), Status> {
        let client = Client::try_from(self.k8s_config.clone())
            .map_err(|error| Status::new(tonic::Code::Unauthenticated, error.to_string()))?;

        let token_hash = self
            .k8s_config
            .auth_info
            .token
            .as_ref()
            .map(|token| Self::hash_token(token.expose_secret()))
            .unwrap_or_default();

        let empty_namespace = [String::new()];
        let namespaces = if namespaces.is_empty() {
            &empty_namespace[..]
        } else {
            namespaces
        };

        let access_reviews: Api<SelfSubjectAccessReview> = Api::all(client);

        for namespace in namespaces {
            let cache_key = (token_hash.clone(), namespace.clone(), verb.to_owned());

            if let Some(allowed) = self.auth_cache.get(&cache_key).await {
                if !allowed {
                    return Err(Self::denied(namespace, verb));
                }
                continue;
            }

            let review = SelfSubjectAccessReview {
                spec: SelfSubjectAccessReviewSpec {
                    resource_attributes: Some(ResourceAttributes {
                        namespace: Some(namespace.clone()),
                        verb: Some(verb.to_owned()),
                        resource: Some("pods/log".to_owned()),
                        ..ResourceAttributes::default()
                    }),
                    non_resource_attributes: None,
                },
                ..SelfSubjectAccessReview::default()
            };

            let response = access_reviews
                .create(&PostParams::default(), &review)
                .await
                .map_err(|error| {
                    Status::new(tonic::Code::Unknown, format!("failed to authorize: {error}"))
                })?;

            let allowed = response.status.is_some_and(|status| status.allowed);
            self.auth_cache.insert(cache_key, allowed).await;

            if !allowed {
                return Err(Self::denied(namespace, verb));
            }
        }

        Ok(())
    }

    fn denied(namespace: &str, verb: &str) -> Status {
        Status::new(
            tonic::Code::Unauthenticated,
            format!("permission denied: `{verb} pods/log` in namespace `{namespace}`"),
        )
    }
}
