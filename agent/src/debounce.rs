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

//! Per-key debouncer: collapses a burst of events for the same key into at
//! most two deliveries per quiescent interval — a LEADING delivery fired on
//! the first event, and a TRAILING delivery fired `window` after the last
//! event. Independent keys never block each other.
//!
//! Memory for an inactive key is reclaimed when its trailing timer fires;
//! nothing is retained once a key goes quiet.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

struct KeyState<V> {
    latest: V,
    generation: u64,
}

pub struct Debouncer<K, V, F> {
    ctx: CancellationToken,
    window: Duration,
    action: Arc<F>,
    state: Arc<Mutex<HashMap<K, KeyState<V>>>>,
}

impl<K, V, F> Debouncer<K, V, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(V) + Send + Sync + 'static,
{
    pub fn new(ctx: CancellationToken, window: Duration, action: F) -> Self {
        Self {
            ctx,
            window,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers the most recent event for `key`. On the first submission
    /// for a quiescent key the action runs immediately (LEADING); every
    /// submission (re)schedules a trailing timer that fires the action again
    /// `window` after the last submission (TRAILING), using whatever value
    /// was most recently submitted for the key at that point.
    pub fn submit(&self, key: K, value: V) {
        if self.ctx.is_cancelled() {
            return;
        }

        let is_leading = {
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&key) {
                Some(entry) => {
                    entry.latest = value.clone();
                    entry.generation += 1;
                    false
                }
                None => {
                    state.insert(
                        key.clone(),
                        KeyState {
                            latest: value.clone(),
                            generation: 0,
                        },
                    );
                    true
                }
            }
        };

        if is_leading {
            (self.action)(value);
        }

        self.schedule_trailing(key);
    }

    fn schedule_trailing(&self, key: K) {
        let generation = {
            let state = self.state.lock().unwrap();
            match state.get(&key) {
                Some(entry) => entry.generation,
                None => return,
            }
        };

        let ctx = self.ctx.clone();
        let window = self.window;
        let action = self.action.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = ctx.cancelled() => return,
            }

            // Only the timer for the most recent submission fires the
            // trailing delivery and reclaims the entry; earlier timers for
            // the same key observe a stale generation and no-op.
            let fired = {
                let mut state = state.lock().unwrap();
                match state.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        let value = entry.latest.clone();
                        state.remove(&key);
                        Some(value)
                    }
                    _ => None,
                }
            };

            if let Some(value) = fired {
                action(value);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn leading_and_trailing_delivery_collapse_a_burst() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let debouncer = Debouncer::new(ctx, StdDuration::from_millis(50), move |v: i32| {
            let _ = tx.send(v);
        });

        debouncer.submit("k".to_owned(), 1);
        debouncer.submit("k".to_owned(), 2);
        debouncer.submit("k".to_owned(), 3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, 1, "leading delivery uses the first value");

        let second = tokio::time::timeout(StdDuration::from_millis(500), rx.recv())
            .await
            .expect("trailing delivery should fire")
            .unwrap();
        assert_eq!(second, 3, "trailing delivery uses the most recent value");

        assert!(
            tokio::time::timeout(StdDuration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "no further deliveries for a quiet key"
        );
    }

    #[tokio::test]
    async fn independent_keys_each_get_their_own_leading_delivery() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let ctx = CancellationToken::new();
        let debouncer = Debouncer::new(ctx, StdDuration::from_millis(50), move |_: i32| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.submit("a".to_owned(), 1);
        debouncer.submit("b".to_owned(), 1);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_future_deliveries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let debouncer = Debouncer::new(ctx.clone(), StdDuration::from_millis(50), move |v: i32| {
            let _ = tx.send(v);
        });

        debouncer.submit("k".to_owned(), 1);
        rx.recv().await.unwrap();

        ctx.cancel();
        debouncer.submit("k".to_owned(), 2);

        assert!(
            tokio::time::timeout(StdDuration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }
}
