//! List Store: ordered, paged views over a unary store.
//!
//! A list query owns ordering and pagination; item *data* stays in the shared
//! `UnaryStore`, so a rename arriving on the bus updates every list showing
//! that item without any list-level bookkeeping.
//!
//! Two retrieval modes:
//! - `retrieve(params)` replaces the key order wholesale (new search/filter).
//! - `fetch_more()` appends the next page. Calls arriving while a page is
//!   already in flight coalesce into it; no duplicate request is issued.
//!
//! An empty page latches `has_more` to false until the next `retrieve`.
//! Stale pages are discarded by generation: the counter is bumped and
//! re-checked under the one lock guarding the ordered window, so a
//! superseded page can never land last.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexSet;
use log::debug;

use crate::core::disposer::Disposer;
use crate::core::query::QueryState;
use crate::core::unary::UnaryStore;
use crate::core::workers::Workers;
use crate::entities::change::{EntityKey, Keyed};
use crate::error::SyncError;

/// One page request: the caller's params plus the window to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    pub offset: usize,
    pub limit: usize,
}

/// Configuration for a paged list query.
pub struct ListConfig<Q, K, V> {
    /// Human-readable resource name, used in log lines.
    pub name: String,
    /// Fetch one page of items in server order.
    pub retrieve: Arc<dyn Fn(&Q, PageParams) -> Result<Vec<V>, SyncError> + Send + Sync>,
    /// Fetch a single item by key, for lazy loading of keys referenced
    /// before their page arrives. `Ok(None)` means the key does not exist.
    pub retrieve_by_key: Option<Arc<dyn Fn(&K) -> Result<Option<V>, SyncError> + Send + Sync>>,
    pub page_size: usize,
}

/// Everything a page result writes, behind one lock: checking "still
/// current" and applying the write are a single critical section.
struct ListState<Q, K> {
    /// Insertion-ordered key set: the list's order is the server's order.
    keys: IndexSet<K>,
    params: Option<Q>,
    phase: QueryState,
    error: Option<SyncError>,
    /// Bumped on every `retrieve`; page results carrying an older
    /// generation are discarded.
    generation: u64,
    has_more: bool,
}

struct ListInner<Q, K, V> {
    config: ListConfig<Q, K, V>,
    store: UnaryStore<K, V>,
    state: Mutex<ListState<Q, K>>,
    /// True while a fetch-more page is on the wire; further `fetch_more`
    /// calls coalesce into it.
    page_pending: AtomicBool,
    subscribers: RwLock<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<Q, K, V> ListInner<Q, K, V> {
    fn notify(&self) {
        let subs: Vec<_> = self
            .subscribers
            .read()
            .expect("lock")
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in subs {
            cb();
        }
    }
}

/// An ordered, paged view over entities held in a shared `UnaryStore`.
///
/// Dropping the list detaches its store subscription; in-flight pages
/// resolve into nothing.
pub struct ListQuery<Q, K, V> {
    inner: Arc<ListInner<Q, K, V>>,
    workers: Arc<Workers>,
    _store_sub: Disposer,
}

impl<Q, K, V> ListQuery<Q, K, V>
where
    Q: Clone + Send + Sync + 'static,
    K: EntityKey,
    V: Keyed<Key = K> + Clone + Send + Sync + 'static,
{
    pub fn new(config: ListConfig<Q, K, V>, store: UnaryStore<K, V>, workers: Arc<Workers>) -> Self {
        let inner = Arc::new(ListInner {
            config,
            store: store.clone(),
            state: Mutex::new(ListState {
                keys: IndexSet::new(),
                params: None,
                phase: QueryState::Idle,
                error: None,
                generation: 0,
                has_more: true,
            }),
            page_pending: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });

        // Structural sync: a delete landing in the store (bus event or local
        // mutation) removes the key from this list's order as well. Sets for
        // unknown keys are left alone; whether they belong in the list is
        // the server's call on the next page.
        let weak = Arc::downgrade(&inner);
        let store_sub = store.subscribe(None, move |key, value| {
            let Some(inner) = weak.upgrade() else { return };
            if value.is_none() {
                let removed = inner.state.lock().expect("lock").keys.shift_remove(key);
                if removed {
                    inner.notify();
                }
            } else if inner.state.lock().expect("lock").keys.contains(key) {
                // Data change for a listed item; order untouched
                inner.notify();
            }
        });

        Self { inner, workers, _store_sub: store_sub }
    }

    /// Fetch the first page for new params, replacing the current order.
    /// Supersedes any in-flight page.
    pub fn retrieve(&self, params: Q) {
        let inner = Arc::clone(&self.inner);
        let generation = {
            let mut state = inner.state.lock().expect("lock");
            state.generation += 1;
            state.params = Some(params.clone());
            state.phase = QueryState::Fetching;
            state.has_more = true;
            state.generation
        };
        inner.notify();

        self.workers.execute(move || {
            let page = PageParams { offset: 0, limit: inner.config.page_size };
            let result = (inner.config.retrieve)(&params, page);
            match result {
                Ok(items) => {
                    // Early discard keeps a superseded page's item data out
                    // of the shared store
                    if inner.state.lock().expect("lock").generation != generation {
                        debug!("{}: discarding stale page", inner.config.name);
                        return;
                    }
                    inner.store.set_many(items.iter().map(|i| (i.key(), i.clone())));
                    let mut state = inner.state.lock().expect("lock");
                    // A superseding retrieve may have completed since the
                    // check above; re-verify under the lock that guards the
                    // write so a stale page can never land last
                    if state.generation != generation {
                        debug!("{}: discarding stale page", inner.config.name);
                        return;
                    }
                    state.has_more = items.len() >= inner.config.page_size && !items.is_empty();
                    state.keys.clear();
                    for item in &items {
                        state.keys.insert(item.key());
                    }
                    state.phase = QueryState::Ready;
                    state.error = None;
                }
                Err(e) => {
                    let mut state = inner.state.lock().expect("lock");
                    if state.generation != generation {
                        return;
                    }
                    state.phase = QueryState::Errored;
                    state.error = Some(e);
                }
            }
            inner.notify();
        });
    }

    /// Fetch the next page and append it. A call while a page is already in
    /// flight coalesces into the pending one; a call once the server has
    /// reported the end of the list is a no-op.
    pub fn fetch_more(&self) {
        // Claim the pending slot; losing the race means a page is on the
        // wire already and this call rides along with it
        if self.inner.page_pending.swap(true, Ordering::SeqCst) {
            debug!("{}: fetch_more coalesced into pending page", self.inner.config.name);
            return;
        }
        let (params, generation, offset) = {
            let state = self.inner.state.lock().expect("lock");
            match &state.params {
                Some(p) if state.has_more => (p.clone(), state.generation, state.keys.len()),
                _ => {
                    drop(state);
                    self.inner.page_pending.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };

        let inner = Arc::clone(&self.inner);
        self.workers.execute(move || {
            let page = PageParams { offset, limit: inner.config.page_size };
            let result = (inner.config.retrieve)(&params, page);

            // Release the slot before the staleness checks so a superseding
            // retrieve never leaves fetch_more wedged
            inner.page_pending.store(false, Ordering::SeqCst);
            match result {
                Ok(items) => {
                    if inner.state.lock().expect("lock").generation != generation {
                        debug!("{}: discarding stale page", inner.config.name);
                        return;
                    }
                    if !items.is_empty() {
                        inner.store.set_many(items.iter().map(|i| (i.key(), i.clone())));
                    }
                    let mut state = inner.state.lock().expect("lock");
                    if state.generation != generation {
                        debug!("{}: discarding stale page", inner.config.name);
                        return;
                    }
                    if items.len() < inner.config.page_size {
                        state.has_more = false;
                    }
                    for item in &items {
                        state.keys.insert(item.key());
                    }
                    state.phase = QueryState::Ready;
                }
                Err(e) => {
                    let mut state = inner.state.lock().expect("lock");
                    if state.generation != generation {
                        return;
                    }
                    state.phase = QueryState::Errored;
                    state.error = Some(e);
                }
            }
            inner.notify();
        });
    }

    /// Item data for a key. A miss with a `retrieve_by_key` configured
    /// triggers a background fetch; the item lands in the store and
    /// subscribers hear about it when it does.
    pub fn get_item(&self, key: &K) -> Option<V> {
        if let Some(value) = self.inner.store.get(key) {
            return Some(value);
        }
        if let Some(fetch) = &self.inner.config.retrieve_by_key {
            let fetch = Arc::clone(fetch);
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            self.workers.execute(move || match fetch(&key) {
                Ok(Some(value)) => inner.store.set(key, value),
                Ok(None) => {}
                Err(e) => debug!("{}: lazy fetch failed: {}", inner.config.name, e),
            });
        }
        None
    }

    /// Current key order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().expect("lock").keys.iter().cloned().collect()
    }

    /// Items in list order, skipping keys whose data hasn't landed yet.
    pub fn items(&self) -> Vec<V> {
        self.inner.store.get_many(&self.keys())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("lock").keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().expect("lock").keys.is_empty()
    }

    pub fn state(&self) -> QueryState {
        self.inner.state.lock().expect("lock").phase
    }

    pub fn error(&self) -> Option<SyncError> {
        self.inner.state.lock().expect("lock").error.clone()
    }

    /// Whether the server may have further pages.
    pub fn has_more(&self) -> bool {
        self.inner.state.lock().expect("lock").has_more
    }

    /// Subscribe to structural or data changes; consumers re-read
    /// `keys()`/`items()` on wake.
    pub fn on_change<F>(&self, listener: F) -> Disposer
    where
        F: Fn() + Send + Sync + 'static,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq)]
    struct Task {
        key: u32,
        name: String,
    }

    impl Keyed for Task {
        type Key = u32;

        fn key(&self) -> u32 {
            self.key
        }
    }

    fn task(key: u32) -> Task {
        Task { key, name: format!("task-{key}") }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Server with 5 tasks, paged 2 at a time, counting calls.
    fn paged_config(calls: Arc<AtomicUsize>) -> ListConfig<String, u32, Task> {
        ListConfig {
            name: "tasks".into(),
            retrieve: Arc::new(move |_params, page: PageParams| {
                calls.fetch_add(1, Ordering::SeqCst);
                let all: Vec<u32> = (1..=5).collect();
                Ok(all
                    .into_iter()
                    .skip(page.offset)
                    .take(page.limit)
                    .map(task)
                    .collect())
            }),
            retrieve_by_key: None,
            page_size: 2,
        }
    }

    #[test]
    fn test_retrieve_replaces_order() {
        let workers = Arc::new(Workers::new(2));
        let store = UnaryStore::new();
        let list = ListQuery::new(paged_config(Arc::new(AtomicUsize::new(0))), store, workers);

        list.retrieve("all".into());
        wait_for(|| list.state() == QueryState::Ready);
        assert_eq!(list.keys(), vec![1, 2]);
        assert_eq!(list.items()[0].name, "task-1");
        assert!(list.has_more());

        // New params replace, not append
        list.retrieve("all again".into());
        wait_for(|| list.state() == QueryState::Ready);
        assert_eq!(list.keys(), vec![1, 2]);
    }

    #[test]
    fn test_fetch_more_appends_and_exhausts() {
        let workers = Arc::new(Workers::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let list = ListQuery::new(paged_config(Arc::clone(&calls)), UnaryStore::new(), workers);

        list.retrieve("all".into());
        wait_for(|| list.state() == QueryState::Ready);

        list.fetch_more();
        wait_for(|| list.len() == 4);
        assert_eq!(list.keys(), vec![1, 2, 3, 4]);
        assert!(list.has_more());

        // Short page: 5 of 5, no more afterwards
        list.fetch_more();
        wait_for(|| list.len() == 5);
        assert!(!list.has_more());

        // Exhausted list: no-op, no network call
        let before = calls.load(Ordering::SeqCst);
        list.fetch_more();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert_eq!(list.keys(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fetch_more_coalesces_while_pending() {
        let workers = Arc::new(Workers::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = bounded::<()>(1);

        let c = Arc::clone(&calls);
        let config = ListConfig {
            name: "tasks".into(),
            retrieve: Arc::new(move |_params: &String, page: PageParams| {
                c.fetch_add(1, Ordering::SeqCst);
                if page.offset > 0 {
                    gate_rx.recv().expect("gate");
                }
                Ok((1..=5)
                    .skip(page.offset)
                    .take(page.limit)
                    .map(task)
                    .collect())
            }),
            retrieve_by_key: None,
            page_size: 2,
        };
        let list = ListQuery::new(config, UnaryStore::new(), workers);

        list.retrieve("all".into());
        wait_for(|| list.state() == QueryState::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // First fetch_more blocks on the gate; the second must ride along
        list.fetch_more();
        wait_for(|| calls.load(Ordering::SeqCst) == 2);
        list.fetch_more();
        list.fetch_more();

        gate_tx.send(()).expect("release");
        wait_for(|| list.len() == 4);
        // Exactly one page request for the three calls
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_page_latches_has_more_false() {
        let workers = Arc::new(Workers::new(2));
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let config = ListConfig {
            name: "tasks".into(),
            retrieve: Arc::new(move |_params: &String, page: PageParams| {
                c.fetch_add(1, Ordering::SeqCst);
                // Exactly one full page of data exists
                Ok((1..=2).skip(page.offset).take(page.limit).map(task).collect())
            }),
            retrieve_by_key: None,
            page_size: 2,
        };
        let list = ListQuery::new(config, UnaryStore::new(), workers);

        list.retrieve("all".into());
        wait_for(|| list.state() == QueryState::Ready);
        assert!(list.has_more()); // full first page, can't know yet

        list.fetch_more();
        wait_for(|| !list.has_more());
        assert_eq!(list.keys(), vec![1, 2]);

        let before = calls.load(Ordering::SeqCst);
        list.fetch_more();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_stale_page_discarded_on_new_retrieve() {
        let workers = Arc::new(Workers::new(2));
        let (gate_tx, gate_rx) = bounded::<()>(1);

        let config = ListConfig {
            name: "tasks".into(),
            retrieve: Arc::new(move |params: &String, _page: PageParams| {
                if params == "slow" {
                    gate_rx.recv().expect("gate");
                    Ok(vec![task(99)])
                } else {
                    Ok(vec![task(1), task(2)])
                }
            }),
            retrieve_by_key: None,
            page_size: 2,
        };
        let list = ListQuery::new(config, UnaryStore::new(), workers);

        list.retrieve("slow".into());
        list.retrieve("fast".into());
        wait_for(|| list.keys() == vec![1, 2]);

        // Let the superseded page resolve; the order must not change
        gate_tx.send(()).expect("release");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(list.keys(), vec![1, 2]);
    }

    #[test]
    fn test_stale_fetch_more_discarded_after_new_retrieve() {
        let workers = Arc::new(Workers::new(2));
        let (gate_tx, gate_rx) = bounded::<()>(1);

        let config = ListConfig {
            name: "tasks".into(),
            retrieve: Arc::new(move |params: &String, page: PageParams| {
                if params == "first" {
                    if page.offset > 0 {
                        gate_rx.recv().expect("gate");
                    }
                    Ok((1..=5).skip(page.offset).take(page.limit).map(task).collect())
                } else {
                    Ok(vec![task(9)])
                }
            }),
            retrieve_by_key: None,
            page_size: 2,
        };
        let store: UnaryStore<u32, Task> = UnaryStore::new();
        let list = ListQuery::new(config, store.clone(), workers);

        list.retrieve("first".into());
        wait_for(|| list.keys() == vec![1, 2]);

        // Page 2 blocks on the gate; a new retrieve supersedes it and
        // completes fully before the page resolves
        list.fetch_more();
        list.retrieve("second".into());
        wait_for(|| list.keys() == vec![9]);

        // The superseded page must not append to the new order, nor leak
        // its items into the shared store
        gate_tx.send(()).expect("release");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(list.keys(), vec![9]);
        assert_eq!(list.state(), QueryState::Ready);
        assert!(!store.contains(&3));
        assert!(!store.contains(&4));
    }

    #[test]
    fn test_store_delete_removes_structurally() {
        let workers = Arc::new(Workers::new(2));
        let store: UnaryStore<u32, Task> = UnaryStore::new();
        let list = ListQuery::new(
            paged_config(Arc::new(AtomicUsize::new(0))),
            store.clone(),
            workers,
        );

        list.retrieve("all".into());
        wait_for(|| list.state() == QueryState::Ready);
        assert_eq!(list.keys(), vec![1, 2]);

        let woken = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&woken);
        let _sub = list.on_change(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });

        // A delete (e.g. from a bus event) drops the key from the order
        store.delete(&1);
        assert_eq!(list.keys(), vec![2]);
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        // Deleting something not in the list is structurally silent
        store.delete(&42);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_data_change_wakes_subscribers() {
        let workers = Arc::new(Workers::new(2));
        let store: UnaryStore<u32, Task> = UnaryStore::new();
        let list = ListQuery::new(
            paged_config(Arc::new(AtomicUsize::new(0))),
            store.clone(),
            workers,
        );

        list.retrieve("all".into());
        wait_for(|| list.state() == QueryState::Ready);

        let woken = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&woken);
        let _sub = list.on_change(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });

        store.set(2, Task { key: 2, name: "renamed".into() });
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        assert_eq!(list.items()[1].name, "renamed");
    }

    #[test]
    fn test_lazy_get_item_by_key() {
        let workers = Arc::new(Workers::new(2));
        let store: UnaryStore<u32, Task> = UnaryStore::new();

        let config = ListConfig {
            name: "tasks".into(),
            retrieve: Arc::new(|_params: &String, _page| Ok(Vec::new())),
            retrieve_by_key: Some(Arc::new(|key: &u32| {
                if *key == 7 { Ok(Some(task(7))) } else { Ok(None) }
            })),
            page_size: 2,
        };
        let list = ListQuery::new(config, store.clone(), workers);

        // Miss triggers a background fetch that lands in the store
        assert_eq!(list.get_item(&7), None);
        wait_for(|| store.contains(&7));
        assert_eq!(list.get_item(&7).unwrap().name, "task-7");

        // Nonexistent keys stay absent
        assert_eq!(list.get_item(&8), None);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(list.get_item(&8), None);
    }
}
