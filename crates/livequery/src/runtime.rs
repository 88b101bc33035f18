//! The live query runtime.
//!
//! One runtime owns one compiled graph and the collection holding its
//! results. Source subscriptions buffer deltas per alias; the
//! transaction-scoped scheduler coalesces those into at most one graph run
//! per logical transaction, in dependency order when queries read from each
//! other. Each run flushes the output delta as a single synced transaction
//! into the result collection and drives the include, windowing and lazy
//! loading machinery.

use crate::compiler::{compile, CompiledQuery, ENV_INDEX, ENV_KEY, ENV_ROW};
use crate::error::LiveQueryError;
use crate::include::IncludeState;
use mirrordb_core::scheduler::{self, JobId};
use mirrordb_core::{
    ChangeMessage, Collection, CollectionOptions, CollectionStatus, EventHandle,
    LoadSubsetOutcome, SessionAdapter, SubscribeOptions, SubscriptionHandle, SubsetRequest,
    SyncMode, SyncSession, WriteMessage,
};
use mirrordb_dataflow::{Delta, FractionalOrder, Window};
use mirrordb_expr::plan::plan;
use mirrordb_expr::Query;
use mirrordb_value::{canonical_string, Key, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub type GetKeyFn = Arc<dyn Fn(&Value) -> Key + Send + Sync>;

#[derive(Clone, Default)]
pub struct LiveQueryOptions {
    pub name: Option<String>,
    /// Collapse internal output keys into user-visible keys; a retract and
    /// insert meeting under one key merge into an update.
    pub get_key: Option<GetKeyFn>,
    pub gc_time: Option<Duration>,
}

/// Per-target output bookkeeping: which keys are present (so inserts on an
/// existing key become updates) and each key's fractional order index.
pub(crate) struct OutputState {
    get_key: Option<GetKeyFn>,
    ordered: bool,
    present: HashMap<Key, Value>,
    order_index: HashMap<Key, String>,
}

impl OutputState {
    pub fn new(get_key: Option<GetKeyFn>, ordered: bool) -> Self {
        OutputState {
            get_key,
            ordered,
            present: HashMap::new(),
            order_index: HashMap::new(),
        }
    }

    fn user_key(&self, env: &Value) -> Key {
        let row = env.get(ENV_ROW).unwrap_or(&Value::Null);
        if let Some(get_key) = &self.get_key {
            return get_key(row);
        }
        let key_value = env.get(ENV_KEY).unwrap_or(&Value::Null);
        Key::from_value(key_value).unwrap_or_else(|| Key::Str(canonical_string(key_value)))
    }

    pub fn order_of(&self, key: &Key) -> Option<&String> {
        self.order_index.get(key)
    }
}

/// Collapse one output delta into keyed write messages, merging each key's
/// retractions and insertions into a single effective change.
pub(crate) fn convert_envelopes(out: &mut OutputState, delta: Delta) -> Vec<WriteMessage> {
    struct KeyedChange {
        retracted: Option<Value>,
        inserted: Option<Value>,
        index: Option<String>,
    }
    let mut order: Vec<Key> = Vec::new();
    let mut changes: HashMap<Key, KeyedChange> = HashMap::new();
    for (env, diff) in delta {
        let key = out.user_key(&env);
        let row = env.get(ENV_ROW).cloned().unwrap_or(Value::Null);
        let entry = changes.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            KeyedChange {
                retracted: None,
                inserted: None,
                index: None,
            }
        });
        if diff > 0 {
            entry.inserted = Some(row);
            entry.index = env.get(ENV_INDEX).and_then(Value::as_str).map(str::to_owned);
        } else {
            entry.retracted = Some(row);
        }
    }

    let mut ops = Vec::new();
    for key in order {
        let change = changes.remove(&key).expect("keyed change recorded");
        let was_present = out.present.contains_key(&key);
        match (change.retracted, change.inserted) {
            (_, Some(row)) => {
                if was_present && out.present.get(&key) == Some(&row) {
                    // Same row re-emitted (e.g. a pure reorder); refresh the
                    // index without an event.
                    if let Some(index) = change.index {
                        out.order_index.insert(key.clone(), index);
                    }
                    continue;
                }
                let message = if was_present {
                    WriteMessage::update(row.clone()).with_key(key.clone())
                } else {
                    WriteMessage::insert(row.clone()).with_key(key.clone())
                };
                out.present.insert(key.clone(), row);
                if out.ordered {
                    if let Some(index) = change.index {
                        out.order_index.insert(key.clone(), index);
                    }
                }
                ops.push(message);
            }
            (Some(row), None) => {
                if !was_present {
                    log::warn!("retraction for key `{key}` which was never emitted");
                    continue;
                }
                out.present.remove(&key);
                out.order_index.remove(&key);
                ops.push(WriteMessage::delete(row).with_key(key));
            }
            (None, None) => {}
        }
    }
    ops
}

/// Side effects computed under the runtime lock, executed after release.
#[derive(Default)]
pub(crate) struct Execution {
    pub batches: Vec<(SyncSession, Vec<WriteMessage>)>,
    pub disposals: Vec<Collection>,
    pub loads: Vec<(Collection, SubsetRequest)>,
    pub mark_ready: Option<SyncSession>,
}

impl Execution {
    fn run(self, state: &Arc<Mutex<RuntimeState>>) {
        for (session, ops) in self.batches {
            session.begin();
            let mut failed = false;
            for op in ops {
                if let Err(e) = session.write(op) {
                    session.error(format!("live query flush failed: {e}"));
                    failed = true;
                    break;
                }
            }
            if !failed {
                if let Err(e) = session.commit() {
                    session.error(format!("live query flush failed: {e}"));
                }
            }
        }
        for collection in self.disposals {
            if let Err(e) = collection.cleanup() {
                log::error!("failed to dispose child collection: {e}");
            }
        }
        for (source, request) in self.loads {
            let state = state.clone();
            let outcome = source.request_load_subset(
                request,
                Box::new(move || schedule_run(&state)),
            );
            if outcome == LoadSubsetOutcome::Unsupported {
                log::debug!("source `{}` does not support load_subset", source.name());
            }
        }
        if let Some(session) = self.mark_ready {
            session.mark_ready();
        }
    }
}

pub(crate) struct RuntimeState {
    compiled: CompiledQuery,
    job: JobId,
    deps: Vec<JobId>,
    session: Option<SyncSession>,
    output: OutputState,
    pending: Vec<(String, Delta)>,
    includes: Vec<IncludeState>,
    subscriptions: Vec<SubscriptionHandle>,
    event_handles: Vec<EventHandle>,
    sources: Vec<Collection>,
    issued_loads: HashSet<String>,
    name: String,
    errored: bool,
    started: bool,
}

/// A live query: a compiled dataflow maintaining a result [`Collection`].
///
/// Keep the handle alive for as long as the results should stay fresh;
/// dropping it tears down the source subscriptions.
pub struct LiveQuery {
    collection: Collection,
    state: Arc<Mutex<RuntimeState>>,
}

impl LiveQuery {
    pub fn new(query: Query<Collection>, options: LiveQueryOptions) -> Result<LiveQuery, LiveQueryError> {
        let planned = plan(&query).map_err(crate::error::CompileError::Plan)?;
        let mut compiled = compile(&planned)?;
        let name = options
            .name
            .unwrap_or_else(|| format!("live({})", planned.query.from.alias()));

        let includes: Vec<IncludeState> = std::mem::take(&mut compiled.includes)
            .into_iter()
            .map(IncludeState::build)
            .collect();

        let mut sources: Vec<Collection> = compiled.aliases.iter().map(|a| a.collection.clone()).collect();
        for include in &includes {
            sources.extend(include.sources());
        }
        let deps: Vec<JobId> = sources
            .iter()
            .filter_map(|c| c.options().scheduler_job)
            .collect();

        let job = JobId::allocate();
        let ordered = compiled.ordered;
        let state = Arc::new(Mutex::new(RuntimeState {
            compiled,
            job,
            deps,
            session: None,
            output: OutputState::new(options.get_key.clone(), ordered),
            pending: Vec::new(),
            includes,
            subscriptions: Vec::new(),
            event_handles: Vec::new(),
            sources,
            issued_loads: HashSet::new(),
            name: name.clone(),
            errored: false,
            started: false,
        }));

        let adapter = SessionAdapter::new(false);
        let collection = Collection::new(
            CollectionOptions::with_key_fn(name, Arc::new(|_| None))
                .sync(adapter.clone())
                .start_sync(true)
                .gc_time(options.gc_time.unwrap_or(Duration::from_secs(300)))
                .scheduler_job(job),
        );
        state.lock().session = adapter.session();

        let live = LiveQuery { collection, state };
        live.start();
        Ok(live)
    }

    /// The collection holding this query's results.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn status(&self) -> CollectionStatus {
        self.collection.status()
    }

    pub async fn preload(&self) -> Result<(), mirrordb_core::Error> {
        self.collection.preload().await
    }

    /// Result rows; ordered queries come back in `order_by` order.
    pub fn results(&self) -> Vec<Value> {
        let entries = self.collection.entries();
        let state = self.state.lock();
        if !state.compiled.ordered {
            return entries.into_iter().map(|(_, v)| v).collect();
        }
        let mut keyed: Vec<(Option<String>, Value)> = entries
            .into_iter()
            .map(|(k, v)| (state.output.order_of(&k).cloned(), v))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        keyed.into_iter().map(|(_, v)| v).collect()
    }

    /// The single row of a `single_result` query.
    pub fn result(&self) -> Option<Value> {
        self.results().into_iter().next()
    }

    /// The child collection attached to a parent row's include field.
    pub fn child_collection(&self, parent_key: &Key, field: &str) -> Option<Collection> {
        let state = self.state.lock();
        let parent_row = self.collection.get(parent_key)?;
        let include = state
            .includes
            .iter()
            .find(|i| i.compiled.field_name == field)?;
        let corr = parent_row.path(&include.compiled.correlation_field)?;
        include.child_for(corr)
    }

    /// Move the query window. Triggers a replay from cached operator state
    /// and, if the window cannot be filled locally, upstream `load_subset`
    /// requests.
    pub fn set_window(&self, offset: usize, limit: Option<usize>) -> Result<(), LiveQueryError> {
        let exec = {
            let mut state = self.state.lock();
            if !state.compiled.ordered {
                return Err(LiveQueryError::SetWindowOnUnordered);
            }
            let Some(window) = state.compiled.window_node else {
                return Err(LiveQueryError::SetWindowOnUnordered);
            };
            state
                .compiled
                .graph
                .with_operator::<Window, _>(window, |w| w.set_window(offset, limit));
            let delta = state.compiled.graph.replay_from(window);
            let mut exec = Execution::default();
            let ops = convert_envelopes(&mut state.output, delta);
            if !ops.is_empty() {
                if let Some(session) = &state.session {
                    exec.batches.push((session.clone(), ops));
                }
            }
            stage_loads(&mut state, &mut exec);
            exec
        };
        exec.run(&self.state);
        Ok(())
    }

    fn start(&self) {
        // Collect the subscription plan under the lock, subscribe outside
        // it: initial-state delivery re-enters the runtime.
        let (plans, source_list) = {
            let mut state = self.state.lock();
            if state.started {
                return;
            }
            state.started = true;
            let mut plans = Vec::new();
            collect_subscription_plans(&state.compiled, &state.includes, Vec::new(), &mut plans);
            (plans, state.sources.clone())
        };

        for (input, collection, pushdown, path) in plans {
            let callback = {
                let state = self.state.clone();
                let input = input.clone();
                let path = path.clone();
                Arc::new(move |changes: &[ChangeMessage]| {
                    on_source_changes(&state, &input, &path, changes);
                }) as mirrordb_core::ChangeCallback
            };
            let sub = collection.subscribe_changes(
                callback,
                SubscribeOptions {
                    where_expression: pushdown,
                    include_initial_state: true,
                    ..Default::default()
                },
            );
            let mut state = self.state.lock();
            match include_at(&mut state.includes, &path) {
                Some(include) => include.subscriptions.push(sub),
                None => state.subscriptions.push(sub),
            }
        }

        // Watch source lifecycles: errors and manual cleanup poison the
        // query, readiness re-evaluates the ready rule.
        let mut handles = Vec::new();
        for source in source_list {
            let state = self.state.clone();
            let source_name = source.name().to_owned();
            let handle = source.on_status_change(Arc::new(move |status: &CollectionStatus| {
                match status {
                    CollectionStatus::Error | CollectionStatus::CleanedUp => {
                        fail(&state, &source_name, status);
                    }
                    CollectionStatus::Ready => schedule_run(&state),
                    _ => {}
                }
            }));
            handles.push(handle);
        }
        self.state.lock().event_handles.extend(handles);

        // First run computes initial window demand and the ready state.
        schedule_run(&self.state);
    }
}

fn fail(state: &Arc<Mutex<RuntimeState>>, source_name: &str, status: &CollectionStatus) {
    let (session, exec) = {
        let mut st = state.lock();
        if st.errored {
            return;
        }
        st.errored = true;
        st.pending.clear();
        // Stop listening and drop the child collections: the query is dead.
        st.subscriptions.clear();
        st.event_handles.clear();
        let mut exec = Execution::default();
        for include in &mut st.includes {
            include.dispose_all(&mut exec);
        }
        (st.session.clone(), exec)
    };
    exec.run(state);
    if let Some(session) = session {
        session.error(format!("source collection `{source_name}` became {status:?}"));
    }
}

fn include_at<'a>(includes: &'a mut [IncludeState], path: &[usize]) -> Option<&'a mut IncludeState> {
    let (&first, rest) = path.split_first()?;
    let state = includes.get_mut(first)?;
    if rest.is_empty() {
        Some(state)
    } else {
        include_at(&mut state.nested, rest)
    }
}

fn collect_subscription_plans(
    compiled: &CompiledQuery,
    includes: &[IncludeState],
    path: Vec<usize>,
    out: &mut Vec<(String, Collection, Option<mirrordb_expr::Expr>, Vec<usize>)>,
) {
    for alias in &compiled.aliases {
        out.push((
            alias.input.clone(),
            alias.collection.clone(),
            alias.pushdown.clone(),
            path.clone(),
        ));
    }
    for (i, include) in includes.iter().enumerate() {
        let mut child_path = path.clone();
        child_path.push(i);
        collect_subscription_plans(&include.compiled.child, &include.nested, child_path, out);
    }
}

fn on_source_changes(
    state: &Arc<Mutex<RuntimeState>>,
    input: &str,
    path: &[usize],
    changes: &[ChangeMessage],
) {
    let delta = crate::compiler::changes_to_delta(changes);
    if delta.is_empty() {
        return;
    }
    {
        let mut st = state.lock();
        if st.errored {
            return;
        }
        match include_at(&mut st.includes, path) {
            Some(include) => include.pending.push((input.to_owned(), delta)),
            None => st.pending.push((input.to_owned(), delta)),
        }
    }
    schedule_run(state);
}

fn schedule_run(state: &Arc<Mutex<RuntimeState>>) {
    let (job, deps) = {
        let st = state.lock();
        if st.errored {
            return;
        }
        (st.job, st.deps.clone())
    };
    let run_state = state.clone();
    let drop_state = state.clone();
    scheduler::schedule(
        job,
        deps,
        move || run_job(&run_state),
        move || {
            // Context cleared: discard buffered work and load callbacks.
            let mut st = drop_state.lock();
            st.pending.clear();
            for include in &mut st.includes {
                include.pending.clear();
            }
        },
    );
}

fn run_job(state: &Arc<Mutex<RuntimeState>>) {
    let exec = {
        let mut st = state.lock();
        if st.errored || st.session.is_none() {
            return;
        }
        let mut exec = Execution::default();

        // One graph step per logical transaction, fed by everything the
        // alias subscriptions buffered.
        for (input, delta) in std::mem::take(&mut st.pending) {
            st.compiled.graph.push_input(&input, delta);
        }
        let delta = st.compiled.graph.step();
        let ops = convert_envelopes(&mut st.output, delta);
        if !ops.is_empty() {
            let session = st.session.clone().expect("checked above");
            exec.batches.push((session, ops.clone()));
        }

        // Include phases run against this flush's parent batch.
        let name = st.name.clone();
        let RuntimeState { includes, .. } = &mut *st;
        for include in includes.iter_mut() {
            include.process(&ops, &name, &mut exec);
        }

        stage_loads(&mut st, &mut exec);

        if ready_rule(&st) {
            exec.mark_ready = st.session.clone();
        }
        exec
    };
    exec.run(state);
}

/// Issue `load_subset` upstream when the window cannot be filled from what
/// the ordered operator has seen. Requests are deduplicated by canonical
/// serialization for the runtime's lifetime: an identical cursor implies no
/// progress was made, so reissuing it cannot help.
fn stage_loads(st: &mut RuntimeState, exec: &mut Execution) {
    let Some(window_node) = st.compiled.window_node else {
        return;
    };
    let Some(ordered_alias) = st.compiled.ordered_alias.clone() else {
        return;
    };
    let demand = st
        .compiled
        .graph
        .with_operator::<Window, _>(window_node, |w| w.demand())
        .flatten();
    let Some(demand) = demand else {
        return;
    };
    let min_values = st.compiled.order_node.and_then(|node| {
        st.compiled
            .graph
            .with_operator::<FractionalOrder, _>(node, |o| o.greatest_sort_values())
            .flatten()
    });
    let Some(alias) = st.compiled.aliases.iter().find(|a| a.alias == ordered_alias) else {
        return;
    };
    if alias.collection.sync_metadata().sync_mode == SyncMode::Eager {
        return;
    }
    let request = SubsetRequest {
        order_by: alias.order_hint.clone(),
        limit: Some(demand),
        offset: None,
        min_values,
        where_expr: alias.pushdown.clone(),
    };
    let canonical = request.canonical_key();
    if st.issued_loads.insert(canonical) {
        exec.loads.push((alias.collection.clone(), request));
    }
}

/// Ready iff every source is ready, all subscriptions are up, and no subset
/// load is in flight.
fn ready_rule(st: &RuntimeState) -> bool {
    st.started
        && !st.errored
        && st.sources.iter().all(|s| s.is_ready())
        && !st.sources.iter().any(|s| s.is_loading_subset())
}
