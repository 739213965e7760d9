//! Subscription Manager.
//!
//! One registry of active GENA subscriptions, guarded by a single
//! mutex, with a background scheduler task parked on a
//! `tokio::sync::Notify` plus a computed sleep deadline, the same
//! single-background-task-woken-on-state-change shape used for the
//! SSDP broadcast/shutdown pairing elsewhere in this crate. The
//! scheduler itself is built around a `BinaryHeap` keyed by
//! next-expiry, with lazy deletion for entries that were renewed or
//! removed after being queued.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, trace, warn};
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::http_client::{HttpClient, HttpRequest};

/// Default subscription lease: 300s / 300,000ms.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Minimum renewal margin.
const MIN_RENEWAL_MARGIN: Duration = Duration::from_secs(10);

/// Collaborator: a subscribable UPnP service. `sid` storage is owned by
/// the implementor.
pub trait Service: Send + Sync + 'static {
    fn device_udn(&self) -> String;
    fn service_id(&self) -> String;
    fn event_sub_url(&self) -> String;
    fn interface_address(&self) -> IpAddr;
    fn sid(&self) -> Option<String>;
    fn set_sid(&self, sid: Option<String>);
}

/// Collaborator: the control point's event-callback listening port.
pub trait EventEndpoint: Send + Sync + 'static {
    fn event_port(&self) -> u16;
}

/// A lease-expiry notification, delivered through the callback pool.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Expired {
        device_udn: String,
        service_id: String,
        sid: String,
    },
}

pub trait SubscriptionEventSink: Send + Sync + 'static {
    fn on_event(&self, event: SubscriptionEvent);
}

/// One subscribed Service's lease state.
#[derive(Debug, Clone)]
struct Subscription {
    sid: String,
    start: SystemTime,
    timeout: Duration,
    expiry: SystemTime,
    keep_renew: bool,
}

impl Subscription {
    fn renewal_margin(&self) -> Duration {
        let ten_percent = self.timeout / 10;
        MIN_RENEWAL_MARGIN.max(ten_percent)
    }
}

type Key = (String, String);

struct Entry {
    service: Arc<dyn Service>,
    subscription: Subscription,
}

/// Min-heap item ordered by wake-at time (expiry minus renewal margin).
struct HeapItem {
    wake_at: SystemTime,
    expiry_marker: SystemTime,
    key: Key,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest wake-at first.
        other.wake_at.cmp(&self.wake_at)
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Key, Entry>,
    heap: BinaryHeap<HeapItem>,
}

fn key_for(service: &dyn Service) -> Key {
    (service.device_udn(), service.service_id())
}

/// The Subscription Manager: maintains the registry,
/// renews leases before expiry, evicts expired ones.
pub struct SubscriptionManager<C: EventEndpoint> {
    http: Arc<dyn HttpClient>,
    control_point: Arc<C>,
    executors: Arc<Executors>,
    registry: Arc<Mutex<Registry>>,
    wake: Arc<Notify>,
    event_sink: Arc<dyn SubscriptionEventSink>,
}

impl<C: EventEndpoint> SubscriptionManager<C> {
    pub fn new(
        http: Arc<dyn HttpClient>,
        control_point: Arc<C>,
        executors: Arc<Executors>,
        event_sink: Arc<dyn SubscriptionEventSink>,
    ) -> Arc<Self> {
        let manager = Arc::new(SubscriptionManager {
            http,
            control_point,
            executors,
            registry: Arc::new(Mutex::new(Registry::default())),
            wake: Arc::new(Notify::new()),
            event_sink,
        });

        let scheduler_manager = manager.clone();
        manager.executors.submit_server(async move {
            scheduler_manager.run_scheduler().await;
        });

        manager
    }

    /// If `service` already holds a `SID`, RENEW; else SUBSCRIBE. On
    /// success, registers with the scheduler iff `keep_renew`.
    pub async fn subscribe(&self, service: Arc<dyn Service>, keep_renew: bool) -> bool {
        if service.sid().is_some() {
            return self.renew_subscribe(service).await;
        }

        let callback = self.callback_header(service.interface_address());
        let request = HttpRequest::new("SUBSCRIBE", service.event_sub_url())
            .header("NT", "upnp:event")
            .header("CALLBACK", callback)
            .header("TIMEOUT", "Second-300")
            .header("CONTENT-LENGTH", "0");

        match self.send_and_parse(request).await {
            Ok((sid, timeout)) => {
                service.set_sid(Some(sid.clone()));
                let now = SystemTime::now();
                let subscription = Subscription {
                    sid,
                    start: now,
                    timeout,
                    expiry: now + timeout,
                    keep_renew,
                };
                if keep_renew {
                    self.register(service, subscription).await;
                }
                true
            }
            Err(e) => {
                debug!(target: "upnp", "SUBSCRIBE failed for {}: {}", service.event_sub_url(), e);
                service.set_sid(None);
                false
            }
        }
    }

    /// RENEW if `SID` present, else SUBSCRIBE without keep-renew.
    pub async fn renew_subscribe(&self, service: Arc<dyn Service>) -> bool {
        let Some(sid) = service.sid() else {
            return self.subscribe(service, false).await;
        };

        let request = HttpRequest::new("SUBSCRIBE", service.event_sub_url())
            .header("SID", sid.clone())
            .header("TIMEOUT", "Second-300")
            .header("CONTENT-LENGTH", "0");

        match self.send_and_parse(request).await {
            Ok((new_sid, timeout)) if new_sid == sid => {
                let now = SystemTime::now();
                let mut registry = self.registry.lock().await;
                let key = key_for(service.as_ref());
                let keep_renew = registry
                    .entries
                    .get(&key)
                    .map(|e| e.subscription.keep_renew)
                    .unwrap_or(false);

                // Tie-break: if the entry was removed concurrently
                // (unsubscribe won the race), don't resurrect it.
                if let Some(entry) = registry.entries.get_mut(&key) {
                    if entry.subscription.sid != sid {
                        // A concurrent unsubscribe/resubscribe already
                        // moved the SID out from under this renew.
                        return true;
                    }
                    entry.subscription.start = now;
                    entry.subscription.timeout = timeout;
                    entry.subscription.expiry = now + timeout;
                    let margin = entry.subscription.renewal_margin();
                    registry.heap.push(HeapItem {
                        wake_at: (now + timeout) - margin,
                        expiry_marker: now + timeout,
                        key: key.clone(),
                    });
                } else if keep_renew {
                    // Not registered (e.g. first renewal path) but caller
                    // wants tracking: nothing to do, caller re-subscribes
                    // with keep_renew via `subscribe`.
                }
                drop(registry);
                self.wake.notify_waiters();
                true
            }
            Ok((new_sid, _)) => {
                // Server rotated the SID: treated as failure, caller must
                // full-subscribe again.
                debug!(target: "upnp", "RENEW returned a different SID ({new_sid} != {sid}); treating as failure.");
                service.set_sid(None);
                self.deregister(service.as_ref()).await;
                false
            }
            Err(e) => {
                debug!(target: "upnp", "RENEW failed for {}: {}", service.event_sub_url(), e);
                false
            }
        }
    }

    /// UNSUBSCRIBE; clears subscription fields; deregisters from the
    /// scheduler. Unsubscribe always wins a race with an in-flight renew:
    /// the registry entry is removed before the wire call returns, so a
    /// same-SID renew response arriving after will find no entry to
    /// update.
    pub async fn unsubscribe(&self, service: Arc<dyn Service>) -> bool {
        let Some(sid) = service.sid() else {
            return true;
        };

        self.deregister(service.as_ref()).await;
        service.set_sid(None);

        let request = HttpRequest::new("UNSUBSCRIBE", service.event_sub_url())
            .header("SID", sid)
            .header("CONTENT-LENGTH", "0");

        match self.http.send(request).await {
            Ok(response) if response.is_ok() => true,
            Ok(response) => {
                debug!(target: "upnp", "UNSUBSCRIBE got non-200 status {}", response.status);
                false
            }
            Err(e) => {
                debug!(target: "upnp", "UNSUBSCRIBE transport error: {e}");
                false
            }
        }
    }

    async fn register(&self, service: Arc<dyn Service>, subscription: Subscription) {
        let key = key_for(service.as_ref());
        let margin = subscription.renewal_margin();
        let wake_at = subscription.expiry - margin;
        let expiry_marker = subscription.expiry;

        let mut registry = self.registry.lock().await;
        registry.entries.insert(
            key.clone(),
            Entry {
                service,
                subscription,
            },
        );
        registry.heap.push(HeapItem {
            wake_at,
            expiry_marker,
            key,
        });
        drop(registry);
        self.wake.notify_waiters();
    }

    async fn deregister(&self, service: &dyn Service) {
        let key = key_for(service);
        let mut registry = self.registry.lock().await;
        registry.entries.remove(&key);
        drop(registry);
        self.wake.notify_waiters();
    }

    /// Builds the literal-angle-bracket `CALLBACK` header value
    /// (`<http://<host>[:<port>]/>`) from the subscribing service's own
    /// receiving interface address, so a multi-homed control point
    /// advertises the address the device can actually reach it on.
    fn callback_header(&self, local_addr: IpAddr) -> String {
        let host = match local_addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let port = self.control_point.event_port();
        if port == 0 {
            format!("<http://{host}/>")
        } else {
            format!("<http://{host}:{port}/>")
        }
    }

    async fn send_and_parse(&self, request: HttpRequest) -> Result<(String, Duration)> {
        let response = self.http.send(request).await?;
        if !response.is_ok() {
            return Err(Error::SubscribeFailed(format!(
                "non-200 response: {}",
                response.status
            )));
        }

        let sid = response
            .header("SID")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::SubscribeFailed("missing or empty SID".into()))?
            .to_string();

        let timeout = response
            .header("TIMEOUT")
            .ok_or_else(|| Error::SubscribeFailed("missing TIMEOUT".into()))
            .and_then(parse_timeout)?;

        Ok((sid, timeout))
    }

    /// Sleeps until the earliest registered expiry minus its margin,
    /// then renews everything due; re-reads the earliest expiry after
    /// any registry change.
    async fn run_scheduler(self: Arc<Self>) {
        loop {
            // Registered before the registry is locked and inspected, so
            // a `register`/`deregister`/`renew_subscribe` that calls
            // `notify_waiters()` in the window between this point and the
            // `.await` below is still observed — `Notify` captures the
            // current notification generation at creation, not at first
            // poll. Creating it any later (e.g. inline in the `select!`
            // below) reopens the lost-wakeup window.
            let notified = self.wake.notified();

            let next_wake = {
                let mut registry = self.registry.lock().await;
                loop {
                    match registry.heap.peek() {
                        None => break None,
                        Some(item) => {
                            let still_current = registry
                                .entries
                                .get(&item.key)
                                .map(|e| e.subscription.expiry == item.expiry_marker)
                                .unwrap_or(false);
                            if still_current {
                                break Some(item.wake_at);
                            }
                            registry.heap.pop();
                        }
                    }
                }
            };

            match next_wake {
                None => notified.await,
                Some(wake_at) => {
                    let sleep_for = wake_at
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {
                            self.run_due_renewals().await;
                        }
                        _ = notified => {}
                    }
                }
            }
        }
    }

    async fn run_due_renewals(self: &Arc<Self>) {
        let now = SystemTime::now();
        let due: Vec<(Key, Arc<dyn Service>)> = {
            let mut registry = self.registry.lock().await;
            let mut due = Vec::new();
            while let Some(item) = registry.heap.peek() {
                if item.wake_at > now {
                    break;
                }
                let item = registry.heap.pop().unwrap();
                if let Some(entry) = registry.entries.get(&item.key) {
                    if entry.subscription.expiry == item.expiry_marker && entry.subscription.keep_renew {
                        due.push((item.key.clone(), entry.service.clone()));
                    }
                }
            }
            due
        };

        for (key, service) in due {
            if !self.renew_subscribe(service.clone()).await {
                self.deregister(service.as_ref()).await;
                let event = SubscriptionEvent::Expired {
                    device_udn: key.0,
                    service_id: key.1,
                    sid: service.sid().unwrap_or_default(),
                };
                let event_sink = self.event_sink.clone();
                if !self.executors.submit_callback(async move {
                    event_sink.on_event(event);
                }) {
                    trace!(target: "upnp", "Callback pool unavailable, dropping Expired event.");
                }
                warn!(target: "upnp", "Subscription expired (renew failed), evicted from registry.");
            }
        }
    }
}

/// Parses `Second-<N>`; the deprecated literal `infinite` maps to the
/// default 300s lease.
fn parse_timeout(value: &str) -> Result<Duration> {
    if value.eq_ignore_ascii_case("infinite") {
        return Ok(DEFAULT_TIMEOUT);
    }
    value
        .strip_prefix("Second-")
        .and_then(|n| n.parse::<u64>().ok())
        .map(Duration::from_secs)
        .ok_or_else(|| Error::SubscribeFailed(format!("unparsable TIMEOUT: {value}")))
}
