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

//! Maintains the live set of Agent peer addresses by watching the
//! `EndpointSlice` resources of the Agent's headless service. Each add,
//! update, or delete of a slice is translated into individual
//! [`MembershipEvent::Added`]/[`MembershipEvent::Removed`] notifications for
//! the dispatcher (§4.H) — callers never see raw `EndpointSlice` objects.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounds staleness from a missed or dropped watch event; kube's `watcher`
/// already relists on error, this forces a fresh list on a timer regardless.
const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipEvent {
    Added(SocketAddr),
    Removed(SocketAddr),
}

pub struct Membership {
    ctx: CancellationToken,
    client: Client,
    namespace: String,
    service_name: String,
    tx: Sender<MembershipEvent>,
}

impl Membership {
    pub fn new(
        ctx: CancellationToken,
        client: Client,
        namespace: String,
        service_name: String,
    ) -> (Self, Receiver<MembershipEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                ctx,
                client,
                namespace,
                service_name,
                tx,
            },
            rx,
        )
    }

    /// Runs until cancelled. Restarts the underlying `EndpointSlice` watch
    /// every [`RESYNC_INTERVAL`] to bound the staleness of a missed event,
    /// on top of kube's own relist-on-error behaviour.
    pub async fn run(self) {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default()
            .labels(&format!("kubernetes.io/service-name={}", self.service_name));

        let mut tracker = SliceTracker::default();

        loop {
            let stream = watcher::watcher(api.clone(), config.clone());
            tokio::pin!(stream);

            let resync = tokio::time::sleep(RESYNC_INTERVAL);
            tokio::pin!(resync);

            loop {
                tokio::select! {
                    _ = self.ctx.cancelled() => return,
                    _ = &mut resync => {
                        debug!("endpoint slice watcher resyncing");
                        break;
                    }
                    event = stream.next() => {
                        match event {
                            Some(Ok(event)) => self.apply(event, &mut tracker).await,
                            Some(Err(error)) => warn!("endpoint slice watch error: {error}"),
                            None => break,
                        }
                    }
                }
            }
        }
    }

    async fn apply(&self, event: Event<EndpointSlice>, tracker: &mut SliceTracker) {
        match event {
            Event::Apply(slice) | Event::InitApply(slice) => {
                for change in tracker.apply_slice(&slice) {
                    let _ = self.tx.send(change).await;
                }
            }
            Event::Delete(slice) => {
                for change in tracker.remove_slice(&slice) {
                    let _ = self.tx.send(change).await;
                }
            }
            Event::Init | Event::InitDone => {}
        }
    }
}

/// Diffs successive `EndpointSlice` snapshots into incremental
/// add/remove events, keyed by slice UID so an update never loses track of
/// addresses introduced by a previous version of the same slice.
#[derive(Default)]
struct SliceTracker {
    addresses_by_slice: HashMap<String, HashSet<SocketAddr>>,
}

impl SliceTracker {
    fn apply_slice(&mut self, slice: &EndpointSlice) -> Vec<MembershipEvent> {
        let Some(slice_uid) = slice.metadata.uid.clone() else {
            return Vec::new();
        };

        let fresh = Self::ready_addresses(slice);
        let previous = self.addresses_by_slice.remove(&slice_uid).unwrap_or_default();

        let mut events = Vec::new();
        for addr in fresh.difference(&previous) {
            events.push(MembershipEvent::Added(*addr));
        }
        for addr in previous.difference(&fresh) {
            events.push(MembershipEvent::Removed(*addr));
        }

        self.addresses_by_slice.insert(slice_uid, fresh);
        events
    }

    fn remove_slice(&mut self, slice: &EndpointSlice) -> Vec<MembershipEvent> {
        let Some(slice_uid) = slice.metadata.uid.clone() else {
            return Vec::new();
        };

        self.addresses_by_slice
            .remove(&slice_uid)
            .unwrap_or_default()
            .into_iter()
            .map(MembershipEvent::Removed)
            .collect()
    }

    fn ready_addresses(slice: &EndpointSlice) -> HashSet<SocketAddr> {
        let port = slice
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .and_then(|port| port.port)
            .unwrap_or(50051);

        slice
            .endpoints
            .iter()
            .filter(|endpoint| {
                endpoint
                    .conditions
                    .as_ref()
                    .and_then(|conditions| conditions.ready)
                    .unwrap_or(true)
            })
            .flat_map(|endpoint| endpoint.addresses.iter())
            .filter_map(|address| address.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort};
    use kube::core::ObjectMeta;

    fn slice(uid: &str, addrs: &[&str], ready: bool) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                uid: Some(uid.to_owned()),
                ..Default::default()
            },
            endpoints: addrs
                .iter()
                .map(|addr| Endpoint {
                    addresses: vec![(*addr).to_owned()],
                    conditions: Some(EndpointConditions {
                        ready: Some(ready),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ports: Some(vec![EndpointPort {
                port: Some(50051),
                ..Default::default()
            }]),
            address_type: "IPv4".to_owned(),
        }
    }

    #[test]
    fn first_apply_adds_every_ready_address() {
        let mut tracker = SliceTracker::default();
        let events = tracker.apply_slice(&slice("uid-1", &["10.0.0.1", "10.0.0.2"], true));
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, MembershipEvent::Added(_))));
    }

    #[test]
    fn second_apply_diffs_against_the_first() {
        let mut tracker = SliceTracker::default();
        tracker.apply_slice(&slice("uid-1", &["10.0.0.1", "10.0.0.2"], true));

        let events = tracker.apply_slice(&slice("uid-1", &["10.0.0.2", "10.0.0.3"], true));
        assert_eq!(events.len(), 2);
        assert!(events.contains(&MembershipEvent::Added("10.0.0.3:50051".parse().unwrap())));
        assert!(events.contains(&MembershipEvent::Removed("10.0.0.1:50051".parse().unwrap())));
    }

    #[test]
    fn not_ready_endpoints_are_excluded() {
        let mut tracker = SliceTracker::default();
        let events = tracker.apply_slice(&slice("uid-1", &["10.0.0.1"], false));
        assert!(events.is_empty());
    }

    #[test]
    fn delete_removes_every_tracked_address() {
        let mut tracker = SliceTracker::default();
        tracker.apply_slice(&slice("uid-1", &["10.0.0.1"], true));

        let events = tracker.remove_slice(&slice("uid-1", &[], true));
        assert_eq!(events, vec![MembershipEvent::Removed("10.0.0.1:50051".parse().unwrap())]);
    }

    #[test]
    fn unbracketed_ipv6_endpoint_addresses_are_still_resolved() {
        let mut tracker = SliceTracker::default();
        let events = tracker.apply_slice(&slice("uid-1", &["2001:db8::1"], true));
        assert_eq!(
            events,
            vec![MembershipEvent::Added("[2001:db8::1]:50051".parse().unwrap())]
        );
    }
}
