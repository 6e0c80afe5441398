//! Channel Bus: decoded change-notification fan-out.
//!
//! Single point of truth for "is there a live connection, and who wants to
//! hear about channel X". The bus itself knows nothing about payload shapes:
//! every registration supplies its own decode function, and the bus invokes
//! live handlers for a channel in registration order, synchronously with
//! respect to each batch.
//!
//! Failure isolation:
//! - A decode failure drops the malformed batch for that registration only
//!   and is logged; other registrations and channels continue.
//! - A panicking handler is caught and logged; it stays registered and does
//!   not stop delivery to the remaining handlers.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use log::{debug, error, info, warn};

use crate::core::disposer::Disposer;
use crate::error::SyncError;
use crate::transport::Transport;

/// Type-erased per-channel callback: receives the channel name and the raw
/// batch payload, performs decode + dispatch internally.
type Callback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Registration {
    id: u64,
    callback: Callback,
}

type SubscriberMap = Arc<RwLock<HashMap<String, Vec<Registration>>>>;
type OpenListenerVec = Arc<RwLock<Vec<(u64, Arc<dyn Fn(bool) + Send + Sync>)>>>;

/// Process-wide registry turning raw stream batches into typed change
/// notifications. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ChannelBus {
    subscribers: SubscriberMap,
    open_listeners: OpenListenerVec,
    open: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            open_listeners: Arc::new(RwLock::new(Vec::new())),
            open: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a handler for one or more channels.
    ///
    /// `decode` turns a raw batch into typed values; `handler` receives the
    /// channel name and the decoded values. Registration succeeds whether or
    /// not a connection exists yet; the handler simply receives nothing until
    /// connectivity is established.
    ///
    /// Handlers must return quickly: delivery is synchronous with respect to
    /// the batch, and a slow handler stalls every channel behind it.
    pub fn add_listener<T, D, H>(&self, channels: &[&str], decode: D, handler: H) -> Disposer
    where
        T: 'static,
        D: Fn(&[u8]) -> Result<Vec<T>, SyncError> + Send + Sync + 'static,
        H: Fn(&str, Vec<T>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(move |channel: &str, payload: &[u8]| {
            let values = match decode(payload) {
                Ok(values) => values,
                Err(e) => {
                    warn!("decode failed on channel '{}': {}", channel, e);
                    return;
                }
            };
            if values.is_empty() {
                return;
            }
            // A panicking handler must not take down shared infrastructure
            if catch_unwind(AssertUnwindSafe(|| handler(channel, values))).is_err() {
                error!("handler panicked on channel '{}'", channel);
            }
        });

        let names: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        {
            let mut subs = self.subscribers.write().expect("lock");
            for name in &names {
                subs.entry(name.clone())
                    .or_default()
                    .push(Registration { id, callback: Arc::clone(&callback) });
            }
        }

        let subscribers = Arc::clone(&self.subscribers);
        Disposer::new(move || {
            let mut subs = subscribers.write().expect("lock");
            for name in &names {
                if let Some(regs) = subs.get_mut(name) {
                    regs.retain(|r| r.id != id);
                    if regs.is_empty() {
                        subs.remove(name);
                    }
                }
            }
        })
    }

    /// Deliver one raw batch to every live handler registered for `channel`,
    /// in registration order.
    pub fn deliver(&self, channel: &str, payload: &[u8]) {
        // Snapshot under the read lock, invoke outside it: handlers may
        // register or dispose listeners themselves.
        let callbacks: Vec<Callback> = {
            let subs = self.subscribers.read().expect("lock");
            match subs.get(channel) {
                Some(regs) => regs.iter().map(|r| Arc::clone(&r.callback)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(channel, payload);
        }
    }

    /// Current stream-open state. Consumers use this to decide whether to
    /// trust cache-only answers or force a network retrieval.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Flip the open state, notifying open-state listeners on transitions.
    pub fn set_open(&self, open: bool) {
        let prev = self.open.swap(open, Ordering::SeqCst);
        if prev == open {
            return;
        }
        debug!("stream open state: {} -> {}", prev, open);
        let listeners: Vec<_> = self
            .open_listeners
            .read()
            .expect("lock")
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in listeners {
            cb(open);
        }
    }

    /// Watch open-state transitions. The listener fires on every change with
    /// the new state; reconnect-refresh logic keys off the `false -> true`
    /// edge.
    pub fn on_open<F: Fn(bool) + Send + Sync + 'static>(&self, listener: F) -> Disposer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open_listeners.write().expect("lock").push((id, Arc::new(listener)));
        let open_listeners = Arc::clone(&self.open_listeners);
        Disposer::new(move || {
            open_listeners.write().expect("lock").retain(|(lid, _)| *lid != id);
        })
    }

    /// Number of live registrations for a channel (diagnostics).
    pub fn listener_count(&self, channel: &str) -> usize {
        self.subscribers
            .read()
            .expect("lock")
            .get(channel)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Spawn a background thread draining the transport's change stream into
    /// `deliver`, flipping the open state on stream start and end. Refuses
    /// to start against a transport that reports no live connection.
    ///
    /// Reconnect/backoff of the stream itself is the transport's concern;
    /// when the stream ends the pump marks the bus closed and exits. Dropping
    /// the returned disposer stops the pump at the next batch boundary.
    pub fn run_feed(
        &self,
        transport: Arc<dyn Transport>,
        channels: &[String],
    ) -> Result<Disposer, SyncError> {
        if !transport.is_connected() {
            return Err(SyncError::Disconnected);
        }
        let mut stream = transport.open_stream(channels)?;
        let bus = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        thread::Builder::new()
            .name("telesync-feed".to_string())
            .spawn(move || {
                bus.set_open(true);
                loop {
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    match stream.next_batch() {
                        Ok(Some(batch)) => bus.deliver(&batch.channel, &batch.payload),
                        Ok(None) => {
                            info!("change stream ended");
                            break;
                        }
                        Err(e) => {
                            warn!("change stream error: {}", e);
                            break;
                        }
                    }
                }
                bus.set_open(false);
            })
            .map_err(|e| SyncError::Transport(format!("failed to spawn feed thread: {e}")))?;

        // The pump blocks in next_batch(); the flag takes effect at the next
        // batch. The thread is detached on dispose rather than joined so a
        // quiet stream cannot stall teardown.
        Ok(Disposer::new(move || {
            stop.store(true, Ordering::Relaxed);
        }))
    }
}

impl std::fmt::Debug for ChannelBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBus")
            .field("channels", &self.subscribers.read().expect("lock").len())
            .field("open", &self.is_open())
            .finish()
    }
}
