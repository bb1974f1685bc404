//! Single-flight, reactively invalidated asynchronous loader.
//!
//! An [`AsyncLoader`] owns one derived value produced by an async function.
//! The function body runs synchronously up to the point where it returns its
//! future; every reactive cell read during that synchronous part becomes an
//! input of the loader. When an input changes, the next access starts a new
//! load. While a load is in flight every caller shares its promise.
//!
//! Each load is stamped with a sequence number. A load that settles after a
//! newer one has started is discarded.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{CatalogError, CatalogResult};
use crate::reactive::{Cell, Reactive};

/// Future returned by a load function.
pub type LoadFuture<T> = BoxFuture<'static, CatalogResult<T>>;

/// A load function. Runs synchronously (tracked) and returns the future that
/// performs the I/O (untracked).
pub type LoadFn<T> = Arc<dyn Fn() -> CatalogResult<LoadFuture<T>> + Send + Sync>;

/// Shared handle to one load. Resolves once the load has settled and its
/// result has been applied (or discarded as stale).
pub type LoadPromise = Shared<BoxFuture<'static, CatalogResult<()>>>;

struct InFlight {
    seq: u64,
    inputs: Vec<(Cell, u64)>,
    promise: LoadPromise,
}

struct LoaderState<T> {
    value: Option<T>,
    error: Option<CatalogError>,
    /// Input versions observed by the last load that settled.
    settled_inputs: Option<Vec<(Cell, u64)>>,
    in_flight: Option<InFlight>,
    /// Set while the load function's synchronous part is running.
    starting: bool,
    sequence: u64,
    load_count: u64,
    loaded_at: Option<DateTime<Utc>>,
}

impl<T> Default for LoaderState<T> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            settled_inputs: None,
            in_flight: None,
            starting: false,
            sequence: 0,
            load_count: 0,
            loaded_at: None,
        }
    }
}

impl<T> LoaderState<T> {
    fn outcome(&self) -> CatalogResult<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Memoized async value with single-flight loading.
pub struct AsyncLoader<T> {
    cell: Cell,
    runtime: Reactive,
    load_fn: LoadFn<T>,
    state: Arc<Mutex<LoaderState<T>>>,
}

impl<T> Clone for AsyncLoader<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            runtime: self.runtime.clone(),
            load_fn: self.load_fn.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for AsyncLoader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncLoader")
            .field("cell", &self.cell)
            .field("loading", &state.in_flight.is_some())
            .field("loaded", &state.loaded_at.is_some())
            .field("error", &state.error)
            .field("load_count", &state.load_count)
            .finish()
    }
}

impl<T> AsyncLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a loader whose status is published on `cell`.
    pub fn new(runtime: Reactive, cell: Cell, load_fn: LoadFn<T>) -> Self {
        Self {
            cell,
            runtime,
            load_fn,
            state: Arc::new(Mutex::new(LoaderState::default())),
        }
    }

    /// Cell that changes whenever the loader starts, settles or is invalidated.
    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    /// Runtime this loader reports to.
    pub fn runtime(&self) -> &Reactive {
        &self.runtime
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    /// Start a load unless one is in flight or the cached result is fresh.
    ///
    /// Registers the enclosing computation as a dependent. Fails with
    /// [`CatalogError::ReactiveContextRequired`] outside a reactive context on
    /// a strict runtime.
    pub fn load_if_needed(&self) -> CatalogResult<LoadPromise> {
        self.runtime.require_context("load_if_needed")?;
        self.runtime.report_observed(&self.cell);
        Ok(self.ensure_started())
    }

    /// Start a load if needed without any context check.
    pub(crate) fn ensure_started(&self) -> LoadPromise {
        let (in_flight, settled) = {
            let state = self.state.lock();
            if state.starting {
                return ready(state.outcome());
            }
            (
                state
                    .in_flight
                    .as_ref()
                    .map(|f| (f.inputs.clone(), f.promise.clone())),
                state.settled_inputs.clone(),
            )
        };

        if let Some((inputs, promise)) = in_flight {
            if self.runtime.is_fresh(&inputs) {
                return promise;
            }
        } else if let Some(inputs) = settled {
            if self.runtime.is_fresh(&inputs) {
                return ready(self.state.lock().outcome());
            }
        }

        self.start()
    }

    fn start(&self) -> LoadPromise {
        let seq = {
            let mut state = self.state.lock();
            state.starting = true;
            state.sequence += 1;
            state.load_count += 1;
            state.sequence
        };
        log::debug!("Starting load of {} (#{})", self.cell, seq);

        let (started, mut reads) = {
            let _starting = StartingGuard { state: &self.state };
            self.runtime.capture(|| (self.load_fn)())
        };
        reads.remove(&self.cell);
        let inputs = self.runtime.versions(reads.iter());
        self.runtime.set_derived_inputs(&self.cell, reads);

        let future = match started {
            Ok(future) => future,
            Err(e) => futures::future::ready(Err(e)).boxed(),
        };
        let state = self.state.clone();
        let runtime = self.runtime.clone();
        let cell = self.cell.clone();
        let settled_inputs = inputs.clone();
        let promise = async move {
            let outcome = future.await;
            settle(&state, &runtime, &cell, seq, settled_inputs, outcome)
        }
        .boxed()
        .shared();

        self.state.lock().in_flight = Some(InFlight {
            seq,
            inputs,
            promise: promise.clone(),
        });
        self.runtime.report_changed(&self.cell);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(promise.clone());
        }
        promise
    }

    /// Forget the cached result so the next access loads again.
    pub fn invalidate(&self) {
        {
            let mut state = self.state.lock();
            state.settled_inputs = None;
            state.error = None;
        }
        self.runtime.report_changed(&self.cell);
    }

    // -----------------------------------------------------------------------
    // Non-triggering inspection
    // -----------------------------------------------------------------------

    /// Whether a load is in flight. Observed, never starts a load.
    pub fn is_loading(&self) -> bool {
        self.runtime.report_observed(&self.cell);
        self.state.lock().in_flight.is_some()
    }

    /// The in-flight load, if any. Observed, never starts a load.
    pub fn load_promise(&self) -> Option<LoadPromise> {
        self.runtime.report_observed(&self.cell);
        self.state.lock().in_flight.as_ref().map(|f| f.promise.clone())
    }

    /// Last successfully loaded value.
    pub fn value(&self) -> Option<T> {
        self.runtime.report_observed(&self.cell);
        self.state.lock().value.clone()
    }

    /// Error of the last settled load, if it failed.
    pub fn error(&self) -> Option<CatalogError> {
        self.runtime.report_observed(&self.cell);
        self.state.lock().error.clone()
    }

    /// When the last successful load settled.
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.runtime.report_observed(&self.cell);
        self.state.lock().loaded_at
    }

    /// How many loads have been started.
    pub fn load_count(&self) -> u64 {
        self.state.lock().load_count
    }

    /// Whether the load function is currently running its synchronous part.
    pub fn is_starting(&self) -> bool {
        self.state.lock().starting
    }

    /// Last value without recording a read.
    pub fn peek(&self) -> Option<T> {
        self.state.lock().value.clone()
    }
}

struct StartingGuard<'a, T> {
    state: &'a Mutex<LoaderState<T>>,
}

impl<T> Drop for StartingGuard<'_, T> {
    fn drop(&mut self) {
        self.state.lock().starting = false;
    }
}

fn ready(outcome: CatalogResult<()>) -> LoadPromise {
    futures::future::ready(outcome).boxed().shared()
}

fn settle<T>(
    state: &Mutex<LoaderState<T>>,
    runtime: &Reactive,
    cell: &Cell,
    seq: u64,
    inputs: Vec<(Cell, u64)>,
    outcome: CatalogResult<T>,
) -> CatalogResult<()> {
    let result = {
        let mut state = state.lock();
        if state.sequence != seq {
            log::debug!(
                "Discarding stale result of {} (#{}, latest #{})",
                cell,
                seq,
                state.sequence
            );
            return Ok(());
        }
        if state.in_flight.as_ref().map_or(false, |f| f.seq == seq) {
            state.in_flight = None;
        }
        state.settled_inputs = Some(inputs);
        match outcome {
            Ok(value) => {
                state.value = Some(value);
                state.error = None;
                state.loaded_at = Some(Utc::now());
                Ok(())
            }
            Err(e) => {
                state.error = Some(e.clone());
                Err(e)
            }
        }
    };
    runtime.report_changed(cell);
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        runtime: Reactive,
        input: Cell,
        url: Arc<Mutex<String>>,
        calls: Arc<AtomicUsize>,
        loader: AsyncLoader<String>,
    }

    /// Loader that echoes the current `url` input after an optional delay.
    fn fixture(strict: bool, delay_for: fn(&str) -> u64) -> Fixture {
        let runtime = Reactive::new(strict);
        let input = Cell::trait_cell("item", &crate::strata::StratumId::Definition, "url");
        let url = Arc::new(Mutex::new("a".to_string()));
        let calls = Arc::new(AtomicUsize::new(0));

        let (rt, cell, url_ref, counter) = (runtime.clone(), input.clone(), url.clone(), calls.clone());
        let load_fn: LoadFn<String> = Arc::new(move || -> CatalogResult<LoadFuture<String>> {
            rt.report_observed(&cell);
            let current = url_ref.lock().clone();
            counter.fetch_add(1, Ordering::SeqCst);
            let delay = delay_for(&current);
            Ok(async move {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if current == "bad" {
                    return Err(CatalogError::Fetch {
                        url: current,
                        message: "404".into(),
                    });
                }
                Ok(format!("loaded:{}", current))
            }
            .boxed())
        });
        let loader = AsyncLoader::new(runtime.clone(), Cell::loader("item", "metadata"), load_fn);
        Fixture {
            runtime,
            input,
            url,
            calls,
            loader,
        }
    }

    fn no_delay(_: &str) -> u64 {
        0
    }

    #[tokio::test]
    async fn test_load_if_needed_twice_loads_once() {
        let fx = fixture(true, no_delay);
        let (first, second) = fx
            .runtime
            .observe(|| (fx.loader.load_if_needed(), fx.loader.load_if_needed()));
        first.unwrap().await.unwrap();
        second.unwrap().await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.loader.peek().as_deref(), Some("loaded:a"));

        fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap().await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inspection_never_triggers() {
        let fx = fixture(true, no_delay);
        assert!(!fx.loader.is_loading());
        assert!(fx.loader.load_promise().is_none());
        assert!(fx.loader.value().is_none());
        assert!(fx.loader.error().is_none());
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_is_loading_while_in_flight() {
        let fx = fixture(true, |_| 20);
        let mut promise = tokio_test::task::spawn(fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap());
        tokio_test::assert_pending!(promise.poll());
        assert!(fx.loader.is_loading());
        assert!(fx.loader.load_promise().is_some());
        promise.await.unwrap();
        assert!(!fx.loader.is_loading());
        assert!(fx.loader.loaded_at().is_some());
    }

    #[tokio::test]
    async fn test_input_change_causes_one_reload() {
        let fx = fixture(true, no_delay);
        fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap().await.unwrap();

        *fx.url.lock() = "b".to_string();
        fx.runtime.report_changed(&fx.input);

        let (p1, p2) = fx
            .runtime
            .observe(|| (fx.loader.load_if_needed(), fx.loader.load_if_needed()));
        p1.unwrap().await.unwrap();
        p2.unwrap().await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.loader.peek().as_deref(), Some("loaded:b"));
    }

    #[tokio::test]
    async fn test_stale_result_is_discarded() {
        let fx = fixture(true, |url| if url == "slow" { 60 } else { 1 });
        *fx.url.lock() = "slow".to_string();
        let slow = fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap();

        *fx.url.lock() = "fast".to_string();
        fx.runtime.report_changed(&fx.input);
        let fast = fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap();

        fast.await.unwrap();
        slow.await.unwrap();
        assert_eq!(fx.loader.peek().as_deref(), Some("loaded:fast"));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_memoized_until_invalidated() {
        let fx = fixture(true, no_delay);
        *fx.url.lock() = "bad".to_string();
        let err = fx
            .runtime
            .observe(|| fx.loader.load_if_needed())
            .unwrap()
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Fetch { .. }));
        assert!(fx.loader.error().is_some());

        let again = fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap().await;
        assert!(again.is_err());
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);

        *fx.url.lock() = "good".to_string();
        fx.loader.invalidate();
        fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap().await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert!(fx.loader.error().is_none());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_last_value() {
        let fx = fixture(true, no_delay);
        fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap().await.unwrap();
        *fx.url.lock() = "bad".to_string();
        fx.runtime.report_changed(&fx.input);
        let result = fx.runtime.observe(|| fx.loader.load_if_needed()).unwrap().await;
        assert!(result.is_err());
        assert_eq!(fx.loader.peek().as_deref(), Some("loaded:a"));
    }

    #[test]
    fn test_strict_context_required() {
        let fx = fixture(true, no_delay);
        let err = fx.loader.load_if_needed().unwrap_err();
        assert!(matches!(err, CatalogError::ReactiveContextRequired { .. }));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lenient_runtime_loads_outside_context() {
        let fx = fixture(false, no_delay);
        fx.loader.load_if_needed().unwrap().await.unwrap();
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reaction_reloads_when_input_changes() {
        let fx = fixture(true, no_delay);
        let loader = fx.loader.clone();
        let _handle = fx.runtime.autorun("show-metadata", move || {
            let _ = loader.load_if_needed();
        });
        // Let the spawned load settle.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);

        *fx.url.lock() = "c".to_string();
        fx.runtime.report_changed(&fx.input);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.loader.peek().as_deref(), Some("loaded:c"));
    }
}
