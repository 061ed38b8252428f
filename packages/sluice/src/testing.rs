//! Testing utilities for stores and query apis.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! sluice = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Scripted transport
//!
//! ```ignore
//! use sluice::testing::MockTransport;
//!
//! let transport = Arc::new(MockTransport::new());
//! transport.push(Response::json_body(200, &json!({ "id": 1 })));
//!
//! let api = QueryApi::builder("users")
//!     .base_query(BaseQuery::with_transport("https://api.test", transport.clone()))
//!     .endpoint("getUser", Endpoint::query(|id| QueryRequest::get(format!("/users/{}", id))))
//!     .register(&store)
//!     .await?;
//!
//! api.call("getUser", json!(1)).await?;
//! store.settle().await;
//! assert_eq!(transport.call_count(), 1);
//! ```
//!
//! ## Controlling cache time
//!
//! ```ignore
//! let clock = ManualClock::new(Utc::now());
//! let cache = Arc::new(CacheEngine::new(Arc::new(MemoryCache::new()), Arc::new(clock.clone())));
//! clock.advance(Duration::from_secs(6));
//! ```
//!
//! ## Waiting for listeners
//!
//! ```ignore
//! let latch = Latch::new(2);
//! handle.add_listener("saved", { let latch = latch.clone(); move |_| { latch.dec(); Ok(()) } })?;
//! latch.await_zero().await;
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use crate::cache::Clock;
use crate::dispatch::lock;
use crate::error::{Result, SluiceError};
use crate::query::transport::{Method, Response, Transport};

// =============================================================================
// MockTransport
// =============================================================================

/// One request seen by a [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug)]
enum Scripted {
    Respond(Response),
    Fail(String),
}

/// A [`Transport`] that answers from a script and records every request.
///
/// Scripted answers are consumed in order. Once the script is empty the
/// fallback response is used; without one the request fails.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Option<Response>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn push(&self, response: Response) {
        lock(&self.script).push_back(Scripted::Respond(response));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: impl Into<String>) {
        lock(&self.script).push_back(Scripted::Fail(message.into()));
    }

    /// Answer with `response` whenever the script is empty.
    pub fn set_fallback(&self, response: Response) {
        *lock(&self.fallback) = Some(response);
    }

    /// Sleep this long before answering each request.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Response> {
        lock(&self.calls).push(RecordedCall {
            method,
            url: url.to_string(),
            body,
            headers: headers.clone(),
        });

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = lock(&self.script).pop_front();
        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(SluiceError::Transport { message }),
            None => lock(&self.fallback).clone().ok_or_else(|| SluiceError::Transport {
                message: format!("no scripted response for {} {}", method, url),
            }),
        }
    }
}

// =============================================================================
// ManualClock
// =============================================================================

/// A [`Clock`] that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = lock(&self.now);
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// =============================================================================
// Latch
// =============================================================================

/// A count-down latch for waiting on an exact number of callbacks.
///
/// Tests should wait for meaning, not time. Clones share the same count.
///
/// ```ignore
/// use std::time::Duration;
/// use tokio::time::timeout;
///
/// timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug, Clone)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

#[derive(Debug)]
struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl Latch {
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Count one occurrence.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("Latch decremented below zero - more calls than expected");
        }
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero. Returns immediately if it already has.
    pub async fn await_zero(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}
