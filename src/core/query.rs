//! Reactive Query Façade: "params in, data out, stay fresh".
//!
//! A `Retrieve` turns a network call plus optional channel listeners into a
//! declarative unit. Each `QueryObserver` is one consumer's live binding to
//! it, with the state machine `Idle -> Fetching -> { Ready, Errored }`;
//! `Ready`/`Errored` re-enter `Fetching` on a params change, an explicit
//! refetch, or (for queries that don't trust stale cache) the bus
//! reconnecting.
//!
//! Request discipline:
//! - Single-flight: one network call per distinct param set at a time, shared
//!   across observers; identical concurrent calls attach to the pending one.
//! - Stale discard: each observer carries a generation counter; a result
//!   resolving after the observer moved to newer params is dropped silently.
//!   No forced cancellation: the transport never needs to support it.
//!
//! An `Update` wraps a mutation and writes the authoritative result into the
//! relevant store(s) itself on success; local optimism must be immediate
//! rather than waiting for the bus echo.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::core::bus::ChannelBus;
use crate::core::disposer::Disposer;
use crate::core::workers::Workers;
use crate::error::SyncError;

/// Observer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// No retrieval issued yet.
    Idle,
    /// A retrieval is in flight.
    Fetching,
    /// Last retrieval (or stream change) landed successfully.
    Ready,
    /// Last retrieval failed; the observer stays subscribed so reconnection
    /// recovers naturally.
    Errored,
}

/// Snapshot of an observer's current result.
#[derive(Debug, Clone)]
pub struct QueryResult<D> {
    pub state: QueryState,
    /// Last good data; kept through `Fetching` so consumers can render stale
    /// data while refreshing.
    pub data: Option<D>,
    pub error: Option<SyncError>,
}

impl<D> QueryResult<D> {
    fn idle() -> Self {
        Self { state: QueryState::Idle, data: None, error: None }
    }
}

/// Pushes server-stream changes into an observer: `Some` updates the data,
/// `None` signals the entity was deleted.
pub type ChangeSink<D> = Arc<dyn Fn(Option<D>) + Send + Sync>;

/// Wires bus subscriptions scoped to one query's params. Returned disposers
/// are released on unmount or params change.
pub type MountListeners<Q, D> =
    Arc<dyn Fn(&ChannelBus, &Q, ChangeSink<D>) -> Vec<Disposer> + Send + Sync>;

/// Configuration for a retrieve query.
pub struct RetrieveConfig<Q, D> {
    /// Human-readable resource name, used in log lines.
    pub name: String,
    /// The network call.
    pub retrieve: Arc<dyn Fn(&Q) -> Result<D, SyncError> + Send + Sync>,
    /// Optional params-scoped channel listeners (e.g. "listen for changes to
    /// exactly this key").
    pub mount_listeners: Option<MountListeners<Q, D>>,
    /// When false, a bus closed->open transition triggers a refresh to close
    /// any gap in missed events.
    pub allow_disconnected: bool,
}

type Waiter<D> = Box<dyn FnOnce(Result<D, SyncError>) + Send>;

struct RetrieveInner<Q, D> {
    config: RetrieveConfig<Q, D>,
    bus: ChannelBus,
    workers: Arc<Workers>,
    /// Single-flight table: params currently on the wire -> attached waiters.
    inflight: Mutex<HashMap<Q, Vec<Waiter<D>>>>,
}

impl<Q, D> RetrieveInner<Q, D>
where
    Q: Clone + Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Issue a retrieval for `params`, or attach to the one already in
    /// flight for the same params.
    fn issue(self: &Arc<Self>, params: Q, waiter: Waiter<D>) {
        {
            let mut inflight = self.inflight.lock().expect("lock");
            if let Some(waiters) = inflight.get_mut(&params) {
                debug!("{}: attaching to in-flight retrieval", self.config.name);
                waiters.push(waiter);
                return;
            }
            inflight.insert(params.clone(), vec![waiter]);
        }

        let inner = Arc::clone(self);
        self.workers.execute(move || {
            let result = (inner.config.retrieve)(&params);
            let waiters = inner
                .inflight
                .lock()
                .expect("lock")
                .remove(&params)
                .unwrap_or_default();
            for waiter in waiters {
                waiter(result.clone());
            }
        });
    }
}

/// A declarative retrieve query. Create observers from it; observers sharing
/// identical params share network calls.
pub struct Retrieve<Q, D> {
    inner: Arc<RetrieveInner<Q, D>>,
}

impl<Q, D> Clone for Retrieve<Q, D> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<Q, D> Retrieve<Q, D>
where
    Q: Clone + Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(config: RetrieveConfig<Q, D>, bus: ChannelBus, workers: Arc<Workers>) -> Self {
        Self { inner: Arc::new(RetrieveInner { config, bus, workers, inflight: Mutex::new(HashMap::new()) }) }
    }

    /// Create one consumer's live binding to this query.
    pub fn observer(&self) -> QueryObserver<Q, D> {
        let inner = Arc::new(ObserverInner {
            state: Mutex::new(ObserverState {
                params: None,
                result: QueryResult::idle(),
                listeners: Vec::new(),
                generation: 0,
            }),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });

        // Reconnect-refresh: when the stream comes back, re-issue the current
        // params to close the gap of missed events.
        let reconnect = if self.inner.config.allow_disconnected {
            Disposer::noop()
        } else {
            let weak = Arc::downgrade(&inner);
            let retrieve = Arc::clone(&self.inner);
            self.inner.bus.on_open(move |open| {
                if !open {
                    return;
                }
                let Some(observer) = weak.upgrade() else { return };
                let params = observer.state.lock().expect("lock").params.clone();
                if let Some(params) = params {
                    debug!("{}: reconnected, refreshing", retrieve.config.name);
                    start_retrieve(&observer, &retrieve, params);
                }
            })
        };

        QueryObserver { inner, retrieve: Arc::clone(&self.inner), _reconnect: reconnect }
    }
}

struct ObserverState<Q, D> {
    params: Option<Q>,
    result: QueryResult<D>,
    /// Live params-scoped listeners; replaced wholesale on re-arm.
    listeners: Vec<Disposer>,
    /// Monotonically increasing request generation; results and stream
    /// changes carrying an older generation are discarded. Guarded by the
    /// same lock as the result it protects, so "still current" and "write"
    /// are one atomic step.
    generation: u64,
}

struct ObserverInner<Q, D> {
    state: Mutex<ObserverState<Q, D>>,
    subscribers: RwLock<Vec<(u64, Arc<dyn Fn(&QueryResult<D>) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<Q, D: Clone> ObserverInner<Q, D> {
    fn notify(&self, snapshot: &QueryResult<D>) {
        let subs: Vec<_> = self
            .subscribers
            .read()
            .expect("lock")
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in subs {
            cb(snapshot);
        }
    }
}

/// Issue (or attach to) a retrieval for `params` on behalf of `observer`.
fn start_retrieve<Q, D>(
    observer: &Arc<ObserverInner<Q, D>>,
    retrieve: &Arc<RetrieveInner<Q, D>>,
    params: Q,
) where
    Q: Clone + Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    let (generation, snapshot) = {
        let mut state = observer.state.lock().expect("lock");
        state.generation += 1;
        state.params = Some(params.clone());
        state.result.state = QueryState::Fetching;
        state.result.error = None;
        (state.generation, state.result.clone())
    };
    observer.notify(&snapshot);

    let weak = Arc::downgrade(observer);
    let retrieve_for_waiter = Arc::clone(retrieve);
    let waiter_params = params.clone();
    let waiter: Waiter<D> = Box::new(move |result| {
        // Observer unmounted: listeners are already detached, discard.
        let Some(observer) = weak.upgrade() else { return };
        // Superseded by newer params: discard silently, not an error. This
        // early check only avoids mounting listeners for a doomed result;
        // the authoritative check is the one under the state lock below.
        if observer.state.lock().expect("lock").generation != generation {
            debug!("{}: discarding stale retrieval result", retrieve_for_waiter.config.name);
            return;
        }

        let listeners = match &retrieve_for_waiter.config.mount_listeners {
            Some(mount) => {
                let sink = change_sink(&observer, generation);
                mount(&retrieve_for_waiter.bus, &waiter_params, sink)
            }
            None => Vec::new(),
        };

        let snapshot = {
            let mut state = observer.state.lock().expect("lock");
            // A superseding retrieval may have bumped the generation and
            // written its result since the check above; verifying under the
            // write lock means a stale result can never land last
            if state.generation != generation {
                debug!(
                    "{}: discarding stale retrieval result",
                    retrieve_for_waiter.config.name
                );
                return;
            }
            // Old params-scoped listeners detach here
            state.listeners = listeners;
            match result {
                Ok(data) => {
                    state.result.data = Some(data);
                    state.result.state = QueryState::Ready;
                    state.result.error = None;
                }
                Err(e) => {
                    state.result.state = QueryState::Errored;
                    state.result.error = Some(e);
                }
            }
            state.result.clone()
        };
        observer.notify(&snapshot);
    });

    retrieve.issue(params, waiter);
}

/// Sink pushing bus-delivered changes into the observer, guarded by the
/// generation active when its listeners were mounted.
fn change_sink<Q, D>(observer: &Arc<ObserverInner<Q, D>>, generation: u64) -> ChangeSink<D>
where
    Q: Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    let weak = Arc::downgrade(observer);
    Arc::new(move |value: Option<D>| {
        let Some(observer) = weak.upgrade() else { return };
        let snapshot = {
            let mut state = observer.state.lock().expect("lock");
            if state.generation != generation {
                return;
            }
            state.result.data = value;
            state.result.state = QueryState::Ready;
            state.result.error = None;
            state.result.clone()
        };
        observer.notify(&snapshot);
    })
}

/// One active consumer's subscription to a retrieve query.
///
/// Dropping the observer releases its listeners; an in-flight retrieval is
/// not cancelled, but its eventual result finds nobody home and is
/// discarded.
pub struct QueryObserver<Q, D> {
    inner: Arc<ObserverInner<Q, D>>,
    retrieve: Arc<RetrieveInner<Q, D>>,
    _reconnect: Disposer,
}

impl<Q, D> QueryObserver<Q, D>
where
    Q: Clone + Eq + Hash + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Issue a retrieval for new params. A concurrent identical retrieval is
    /// joined rather than duplicated; an older in-flight retrieval keeps
    /// running but its result will be discarded.
    pub fn retrieve(&self, params: Q) {
        start_retrieve(&self.inner, &self.retrieve, params);
    }

    /// Re-issue the current params, if any.
    pub fn refetch(&self) {
        let params = self.inner.state.lock().expect("lock").params.clone();
        if let Some(params) = params {
            start_retrieve(&self.inner, &self.retrieve, params);
        }
    }

    /// Snapshot of the current result.
    pub fn result(&self) -> QueryResult<D> {
        self.inner.state.lock().expect("lock").result.clone()
    }

    /// Current params, if a retrieval has been issued.
    pub fn params(&self) -> Option<Q> {
        self.inner.state.lock().expect("lock").params.clone()
    }

    /// Subscribe to result changes.
    pub fn subscribe<F>(&self, listener: F) -> Disposer
    where
        F: Fn(&QueryResult<D>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .expect("lock")
            .push((id, Arc::new(listener)));
        let inner = Arc::clone(&self.inner);
        Disposer::new(move || {
            inner.subscribers.write().expect("lock").retain(|(sid, _)| *sid != id);
        })
    }
}

/// Configuration for a mutation.
pub struct UpdateConfig<P, D> {
    /// Human-readable resource name, used in log lines.
    pub name: String,
    /// The network mutation.
    pub update: Arc<dyn Fn(&P) -> Result<D, SyncError> + Send + Sync>,
    /// Writes the authoritative result into the relevant store(s). Runs
    /// before the caller's result callback so local reads observe the
    /// mutation immediately.
    pub apply: Arc<dyn Fn(&D) + Send + Sync>,
}

/// A declarative mutation. The mutation is the source of truth for its own
/// effect: it writes stores itself instead of waiting for the bus echo.
/// Ordering with inbound bus events for the same key is last-write-wins.
pub struct Update<P, D> {
    config: Arc<UpdateConfig<P, D>>,
    workers: Arc<Workers>,
}

impl<P, D> Clone for Update<P, D> {
    fn clone(&self) -> Self {
        Self { config: Arc::clone(&self.config), workers: Arc::clone(&self.workers) }
    }
}

impl<P, D> Update<P, D>
where
    P: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(config: UpdateConfig<P, D>, workers: Arc<Workers>) -> Self {
        Self { config: Arc::new(config), workers }
    }

    /// Run the mutation on a worker. On success the store write happens
    /// before `on_result` fires.
    pub fn run<F>(&self, params: P, on_result: F)
    where
        F: FnOnce(Result<D, SyncError>) + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        self.workers.execute(move || {
            let result = (config.update)(&params);
            match &result {
                Ok(data) => (config.apply)(data),
                Err(e) => debug!("{}: update failed: {}", config.name, e),
            }
            on_result(result);
        });
    }

    /// Run the mutation and block for the result. Convenience for callers
    /// already off the hot path.
    pub fn run_blocking(&self, params: P) -> Result<D, SyncError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.run(params, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().expect("update worker dropped result")
    }
}
