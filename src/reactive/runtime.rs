//! The reactive runtime: an explicit dependency graph between cells and the
//! computations that read them.
//!
//! Reads are recorded into the innermost tracking frame of the current thread.
//! Writes bump the cell's version and schedule every reaction that read it.
//! Scheduled reactions run once per outermost transaction, so no dependent
//! ever observes a half-written batch.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::cell::Cell;
use crate::error::{CatalogError, CatalogResult};

/// Upper bound on reaction runs in one flush before it is treated as a loop.
const MAX_REACTION_RUNS_PER_FLUSH: usize = 10_000;

static RUNTIME_IDS: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Thread-local tracking frames
// ---------------------------------------------------------------------------

struct Frame {
    runtime: u64,
    recording: bool,
    reads: HashSet<Cell>,
}

thread_local! {
    /// Stack of active tracking frames, innermost last.
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops the frame it pushed, even if the tracked closure panics.
struct FrameGuard {
    popped: bool,
}

impl FrameGuard {
    fn push(runtime: u64, recording: bool) -> Self {
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                runtime,
                recording,
                reads: HashSet::new(),
            })
        });
        FrameGuard { popped: false }
    }

    fn finish(mut self) -> HashSet<Cell> {
        self.popped = true;
        FRAMES.with(|frames| frames.borrow_mut().pop().map(|f| f.reads).unwrap_or_default())
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.popped {
            FRAMES.with(|frames| {
                frames.borrow_mut().pop();
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Identifier of a registered reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactionId(u64);

/// A side-effecting computation re-run when anything it read changes.
pub type ReactionFn = Arc<dyn Fn() + Send + Sync>;

struct Reaction {
    name: String,
    run: ReactionFn,
    deps: HashSet<Cell>,
    runs: u64,
}

#[derive(Default)]
struct Graph {
    versions: HashMap<Cell, u64>,
    readers: HashMap<Cell, HashSet<ReactionId>>,
    /// input -> cells derived from it
    derived: HashMap<Cell, HashSet<Cell>>,
    /// derived cell -> its current inputs
    derived_inputs: HashMap<Cell, HashSet<Cell>>,
    reactions: HashMap<ReactionId, Reaction>,
    pending: BTreeSet<ReactionId>,
    batch_depth: usize,
    flushing: bool,
    next_reaction: u64,
    /// Last version handed out. Versions never repeat, even for forgotten cells.
    clock: u64,
}

impl Graph {
    /// Bump `cell` and everything derived from it, scheduling their readers.
    fn bump(&mut self, cell: &Cell) {
        let mut work = vec![cell.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = work.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            self.clock += 1;
            self.versions.insert(current.clone(), self.clock);
            if let Some(readers) = self.readers.get(&current) {
                self.pending.extend(readers.iter().copied());
            }
            if let Some(targets) = self.derived.get(&current) {
                work.extend(targets.iter().cloned());
            }
        }
    }

    fn should_flush(&self) -> bool {
        self.batch_depth == 0 && !self.flushing && !self.pending.is_empty()
    }

    fn set_deps(&mut self, id: ReactionId, reads: HashSet<Cell>) {
        let Some(reaction) = self.reactions.get_mut(&id) else {
            return;
        };
        let old = std::mem::replace(&mut reaction.deps, reads.clone());
        for cell in old.difference(&reads) {
            if let Some(readers) = self.readers.get_mut(cell) {
                readers.remove(&id);
                if readers.is_empty() {
                    self.readers.remove(cell);
                }
            }
        }
        for cell in reads {
            self.readers.entry(cell).or_default().insert(id);
        }
    }

    fn remove_reaction(&mut self, id: ReactionId) {
        if let Some(reaction) = self.reactions.remove(&id) {
            for cell in reaction.deps {
                if let Some(readers) = self.readers.get_mut(&cell) {
                    readers.remove(&id);
                    if readers.is_empty() {
                        self.readers.remove(&cell);
                    }
                }
            }
        }
        self.pending.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Reactive
// ---------------------------------------------------------------------------

struct Inner {
    id: u64,
    strict: bool,
    graph: Mutex<Graph>,
}

/// Handle to one reactive runtime. Cheap to clone; clones share state.
///
/// Each [`Catalog`](crate::catalog::Catalog) owns its own runtime, so
/// independent catalogs (e.g. in tests) never see each other's changes.
#[derive(Clone)]
pub struct Reactive {
    inner: Arc<Inner>,
}

impl fmt::Debug for Reactive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.inner.graph.lock();
        f.debug_struct("Reactive")
            .field("id", &self.inner.id)
            .field("strict", &self.inner.strict)
            .field("reactions", &graph.reactions.len())
            .field("cells", &graph.versions.len())
            .finish()
    }
}

impl Reactive {
    /// Create a runtime. In strict mode triggering accessors fail fast outside
    /// a reactive context.
    pub fn new(strict: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: RUNTIME_IDS.fetch_add(1, Ordering::Relaxed),
                strict,
                graph: Mutex::new(Graph::default()),
            }),
        }
    }

    /// Whether context violations are reported as errors.
    pub fn is_strict(&self) -> bool {
        self.inner.strict
    }

    /// Whether the current thread is inside a tracking frame of this runtime.
    pub fn in_context(&self) -> bool {
        FRAMES.with(|frames| {
            frames
                .borrow()
                .last()
                .map_or(false, |frame| frame.runtime == self.inner.id)
        })
    }

    /// Check that a triggering accessor runs inside a reactive context.
    ///
    /// Returns `Ok(true)` inside a context. Outside one, strict runtimes return
    /// [`CatalogError::ReactiveContextRequired`] and lenient runtimes return
    /// `Ok(false)` so the caller can skip dependency registration.
    pub fn require_context(&self, operation: &str) -> CatalogResult<bool> {
        if self.in_context() {
            return Ok(true);
        }
        if self.inner.strict {
            return Err(CatalogError::ReactiveContextRequired {
                operation: operation.to_string(),
            });
        }
        log::debug!("`{}` called outside a reactive context", operation);
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Reads and writes
    // -----------------------------------------------------------------------

    /// Record that the current computation read `cell`.
    pub fn report_observed(&self, cell: &Cell) {
        FRAMES.with(|frames| {
            if let Some(top) = frames.borrow_mut().last_mut() {
                if top.runtime == self.inner.id && top.recording {
                    top.reads.insert(cell.clone());
                }
            }
        });
    }

    /// Record that `cell` changed, scheduling every computation that read it.
    pub fn report_changed(&self, cell: &Cell) {
        let flush = {
            let mut graph = self.inner.graph.lock();
            graph.bump(cell);
            graph.should_flush()
        };
        if flush {
            self.flush();
        }
    }

    /// Current version of `cell` (0 if never written).
    pub fn version(&self, cell: &Cell) -> u64 {
        self.inner.graph.lock().versions.get(cell).copied().unwrap_or(0)
    }

    /// Snapshot the versions of a set of cells.
    pub fn versions<'a>(&self, cells: impl IntoIterator<Item = &'a Cell>) -> Vec<(Cell, u64)> {
        let graph = self.inner.graph.lock();
        cells
            .into_iter()
            .map(|cell| (cell.clone(), graph.versions.get(cell).copied().unwrap_or(0)))
            .collect()
    }

    /// Whether none of the snapshotted cells changed since the snapshot.
    pub fn is_fresh(&self, snapshot: &[(Cell, u64)]) -> bool {
        let graph = self.inner.graph.lock();
        snapshot
            .iter()
            .all(|(cell, version)| graph.versions.get(cell).copied().unwrap_or(0) == *version)
    }

    /// Declare that `target` is derived from `inputs`: a change to any input is
    /// also a change to `target`. Replaces the previous input set.
    pub fn set_derived_inputs(&self, target: &Cell, inputs: HashSet<Cell>) {
        let mut graph = self.inner.graph.lock();
        if let Some(old) = graph.derived_inputs.remove(target) {
            for input in old {
                if let Some(targets) = graph.derived.get_mut(&input) {
                    targets.remove(target);
                    if targets.is_empty() {
                        graph.derived.remove(&input);
                    }
                }
            }
        }
        for input in &inputs {
            if input != target {
                graph.derived.entry(input.clone()).or_default().insert(target.clone());
            }
        }
        graph.derived_inputs.insert(target.clone(), inputs);
    }

    // -----------------------------------------------------------------------
    // Frames and transactions
    // -----------------------------------------------------------------------

    /// Run `f` as one batch: reactions scheduled by its writes run once, after
    /// the outermost transaction ends.
    pub fn transaction<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.graph.lock().batch_depth += 1;
        let _batch = BatchGuard { runtime: self };
        f()
    }

    /// Run `f` in a tracking frame and return the cells it read.
    pub fn capture<R>(&self, f: impl FnOnce() -> R) -> (R, HashSet<Cell>) {
        self.transaction(|| self.capture_raw(f))
    }

    /// Run `f` inside a one-shot reactive context, discarding its reads.
    pub fn observe<R>(&self, f: impl FnOnce() -> R) -> R {
        self.capture(f).0
    }

    /// Run `f` without recording reads into the enclosing computation.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = FrameGuard::push(self.inner.id, false);
        let result = f();
        guard.finish();
        result
    }

    fn capture_raw<R>(&self, f: impl FnOnce() -> R) -> (R, HashSet<Cell>) {
        let guard = FrameGuard::push(self.inner.id, true);
        let result = f();
        let reads = guard.finish();
        (result, reads)
    }

    // -----------------------------------------------------------------------
    // Reactions
    // -----------------------------------------------------------------------

    /// Register a reaction, run it once, and re-run it whenever a cell it read
    /// during its last run changes.
    pub fn autorun(&self, name: impl Into<String>, f: impl Fn() + Send + Sync + 'static) -> ReactionHandle {
        let id = {
            let mut graph = self.inner.graph.lock();
            graph.next_reaction += 1;
            let id = ReactionId(graph.next_reaction);
            graph.reactions.insert(
                id,
                Reaction {
                    name: name.into(),
                    run: Arc::new(f),
                    deps: HashSet::new(),
                    runs: 0,
                },
            );
            id
        };
        self.transaction(|| self.run_reaction(id));
        ReactionHandle {
            runtime: self.clone(),
            id,
        }
    }

    fn run_reaction(&self, id: ReactionId) {
        let run = {
            let mut graph = self.inner.graph.lock();
            match graph.reactions.get_mut(&id) {
                Some(reaction) => {
                    reaction.runs += 1;
                    reaction.run.clone()
                }
                None => return,
            }
        };
        let ((), reads) = self.capture_raw(|| run());
        self.inner.graph.lock().set_deps(id, reads);
    }

    fn flush(&self) {
        {
            let mut graph = self.inner.graph.lock();
            if graph.flushing {
                return;
            }
            graph.flushing = true;
        }
        let _flushing = FlushGuard { runtime: self };

        let mut runs = 0usize;
        loop {
            let next = self.inner.graph.lock().pending.pop_first();
            let Some(id) = next else {
                break;
            };
            runs += 1;
            if runs > MAX_REACTION_RUNS_PER_FLUSH {
                let mut graph = self.inner.graph.lock();
                let name = graph
                    .reactions
                    .get(&id)
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                log::error!("Reaction `{}` keeps re-triggering itself; dropping pending reactions", name);
                graph.pending.clear();
                break;
            }
            self.transaction(|| self.run_reaction(id));
        }
    }

    /// Number of times a reaction has run.
    pub fn reaction_runs(&self, id: ReactionId) -> u64 {
        self.inner
            .graph
            .lock()
            .reactions
            .get(&id)
            .map_or(0, |r| r.runs)
    }

    /// Unregister a reaction.
    pub fn dispose(&self, id: ReactionId) {
        self.inner.graph.lock().remove_reaction(id);
    }

    /// Drop every cell owned by model `owner`: versions, derivation edges and
    /// reaction dependencies. Cells derived from them are bumped and reactions
    /// that read them are re-run.
    pub fn forget_owner(&self, owner: &str) {
        let owned = |cell: &Cell| cell.owner() == Some(owner);
        let flush = {
            let mut graph = self.inner.graph.lock();
            let dependents: Vec<Cell> = graph
                .derived
                .iter()
                .filter(|(input, _)| owned(*input))
                .flat_map(|(_, targets)| targets.iter().filter(|t| !owned(*t)).cloned())
                .collect();
            for cell in &dependents {
                graph.bump(cell);
            }
            let readers: Vec<ReactionId> = graph
                .readers
                .iter()
                .filter(|(cell, _)| owned(*cell))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect();
            graph.pending.extend(readers);

            graph.versions.retain(|cell, _| !owned(cell));
            graph.readers.retain(|cell, _| !owned(cell));
            graph.derived.retain(|cell, _| !owned(cell));
            for targets in graph.derived.values_mut() {
                targets.retain(|t| !owned(t));
            }
            graph.derived.retain(|_, targets| !targets.is_empty());
            graph.derived_inputs.retain(|cell, _| !owned(cell));
            for inputs in graph.derived_inputs.values_mut() {
                inputs.retain(|i| !owned(i));
            }
            for reaction in graph.reactions.values_mut() {
                reaction.deps.retain(|c| !owned(c));
            }
            graph.should_flush()
        };
        if flush {
            self.flush();
        }
    }

    /// Drop every reaction and dependency edge. Cell versions are kept so
    /// snapshots taken before teardown read as stale afterwards.
    pub fn teardown(&self) {
        let mut graph = self.inner.graph.lock();
        graph.reactions.clear();
        graph.readers.clear();
        graph.derived.clear();
        graph.derived_inputs.clear();
        graph.pending.clear();
    }
}

struct BatchGuard<'a> {
    runtime: &'a Reactive,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let flush = {
            let mut graph = self.runtime.inner.graph.lock();
            graph.batch_depth -= 1;
            graph.should_flush() && !std::thread::panicking()
        };
        if flush {
            self.runtime.flush();
        }
    }
}

struct FlushGuard<'a> {
    runtime: &'a Reactive,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.runtime.inner.graph.lock().flushing = false;
    }
}

/// Handle returned by [`Reactive::autorun`].
///
/// Dropping the handle keeps the reaction alive; call [`dispose`](Self::dispose)
/// to stop it.
#[derive(Debug, Clone)]
pub struct ReactionHandle {
    runtime: Reactive,
    id: ReactionId,
}

impl ReactionHandle {
    /// The reaction's id.
    pub fn id(&self) -> ReactionId {
        self.id
    }

    /// How many times the reaction has run so far.
    pub fn runs(&self) -> u64 {
        self.runtime.reaction_runs(self.id)
    }

    /// Stop re-running the reaction.
    pub fn dispose(self) {
        self.runtime.dispose(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::StratumId;
    use std::sync::atomic::AtomicUsize;

    fn cell(name: &str) -> Cell {
        Cell::loader("test", name)
    }

    #[test]
    fn test_capture_records_reads() {
        let rt = Reactive::new(true);
        let ((), reads) = rt.capture(|| {
            rt.report_observed(&cell("a"));
            rt.report_observed(&cell("b"));
        });
        assert_eq!(reads.len(), 2);
        assert!(reads.contains(&cell("a")));
    }

    #[test]
    fn test_untracked_reads_are_not_recorded() {
        let rt = Reactive::new(true);
        let ((), reads) = rt.capture(|| {
            rt.untracked(|| rt.report_observed(&cell("hidden")));
            rt.report_observed(&cell("seen"));
        });
        assert_eq!(reads, HashSet::from([cell("seen")]));
    }

    #[test]
    fn test_reads_outside_context_are_ignored() {
        let rt = Reactive::new(true);
        rt.report_observed(&cell("a"));
        assert!(!rt.in_context());
    }

    #[test]
    fn test_frames_are_per_runtime() {
        let a = Reactive::new(true);
        let b = Reactive::new(true);
        a.observe(|| {
            assert!(a.in_context());
            assert!(!b.in_context());
        });
    }

    #[test]
    fn test_require_context_strict_and_lenient() {
        let strict = Reactive::new(true);
        let err = strict.require_context("load_if_needed").unwrap_err();
        assert!(matches!(err, CatalogError::ReactiveContextRequired { .. }));
        assert!(strict.observe(|| strict.require_context("load_if_needed")).unwrap());

        let lenient = Reactive::new(false);
        assert!(!lenient.require_context("load_if_needed").unwrap());
    }

    #[test]
    fn test_autorun_reruns_on_change() {
        let rt = Reactive::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        let inner_rt = rt.clone();
        let counter = count.clone();
        let handle = rt.autorun("watch-a", move || {
            inner_rt.report_observed(&cell("a"));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);

        rt.report_changed(&cell("a"));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        rt.report_changed(&cell("unrelated"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(handle.runs(), 2);
    }

    #[test]
    fn test_transaction_batches_reruns() {
        let rt = Reactive::new(true);
        let inner_rt = rt.clone();
        let handle = rt.autorun("watch-both", move || {
            inner_rt.report_observed(&cell("a"));
            inner_rt.report_observed(&cell("b"));
        });
        rt.transaction(|| {
            rt.report_changed(&cell("a"));
            rt.report_changed(&cell("b"));
            rt.report_changed(&cell("a"));
            assert_eq!(handle.runs(), 1);
        });
        assert_eq!(handle.runs(), 2);
    }

    #[test]
    fn test_nested_transactions_flush_once() {
        let rt = Reactive::new(true);
        let inner_rt = rt.clone();
        let handle = rt.autorun("watch-a", move || inner_rt.report_observed(&cell("a")));
        rt.transaction(|| {
            rt.transaction(|| rt.report_changed(&cell("a")));
            assert_eq!(handle.runs(), 1);
            rt.report_changed(&cell("a"));
        });
        assert_eq!(handle.runs(), 2);
    }

    #[test]
    fn test_derived_cells_propagate_changes() {
        let rt = Reactive::new(true);
        rt.set_derived_inputs(&cell("loader"), HashSet::from([cell("url")]));
        let inner_rt = rt.clone();
        let handle = rt.autorun("watch-loader", move || inner_rt.report_observed(&cell("loader")));

        let before = rt.version(&cell("loader"));
        rt.report_changed(&cell("url"));
        assert!(rt.version(&cell("loader")) > before);
        assert_eq!(handle.runs(), 2);

        rt.set_derived_inputs(&cell("loader"), HashSet::new());
        rt.report_changed(&cell("url"));
        assert_eq!(handle.runs(), 2);
    }

    #[test]
    fn test_version_snapshots() {
        let rt = Reactive::new(true);
        let snapshot = rt.versions([&cell("a"), &cell("b")]);
        assert!(rt.is_fresh(&snapshot));
        rt.report_changed(&cell("b"));
        assert!(!rt.is_fresh(&snapshot));
    }

    #[test]
    fn test_forget_owner_prunes_cells() {
        let rt = Reactive::new(true);
        let owned = Cell::trait_cell("gone", &StratumId::Definition, "url");
        let kept = Cell::loader("kept", "metadata");
        rt.set_derived_inputs(&kept, HashSet::from([owned.clone(), cell("other")]));
        rt.report_changed(&owned);
        let snapshot = rt.versions([&owned]);
        let kept_before = rt.version(&kept);

        let inner_rt = rt.clone();
        let watched = owned.clone();
        let handle = rt.autorun("watch-gone", move || inner_rt.report_observed(&watched));

        rt.forget_owner("gone");
        assert_eq!(rt.version(&owned), 0);
        assert!(!rt.is_fresh(&snapshot));
        assert!(rt.version(&kept) > kept_before);
        assert_eq!(handle.runs(), 2);

        {
            let graph = rt.inner.graph.lock();
            assert!(graph.versions.keys().all(|c| c.owner() != Some("gone")));
            assert!(!graph.derived.contains_key(&owned));
            assert_eq!(graph.derived_inputs.get(&kept), Some(&HashSet::from([cell("other")])));
        }

        rt.report_changed(&owned);
        assert!(rt.is_fresh(&rt.versions([&owned])));
        assert!(!rt.is_fresh(&snapshot));
    }

    #[test]
    fn test_dispose_stops_reaction() {
        let rt = Reactive::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        let inner_rt = rt.clone();
        let counter = count.clone();
        let handle = rt.autorun("watch-a", move || {
            inner_rt.report_observed(&cell("a"));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.dispose();
        rt.report_changed(&cell("a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_triggering_reaction_is_cut_off() {
        let rt = Reactive::new(true);
        let inner_rt = rt.clone();
        let handle = rt.autorun("feedback", move || {
            inner_rt.report_observed(&cell("loop"));
            inner_rt.report_changed(&cell("loop"));
        });
        assert!(handle.runs() as usize <= MAX_REACTION_RUNS_PER_FLUSH + 1);
    }
}
