//! Transaction-scoped job scheduling.
//!
//! The engine is single-threaded cooperative: every change batch is emitted
//! inside a logical transaction context on the current thread. Jobs (live
//! query graph runs) scheduled during emission are deduplicated per context
//! and executed when the outermost context unwinds, in dependency order, so
//! a batch that feeds a query through two aliases still produces exactly one
//! graph run.
//!
//! Outside any context, scheduled jobs run immediately.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Allocate a process-unique job id (one per live query runtime).
    pub fn allocate() -> JobId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        JobId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct PendingJob {
    id: JobId,
    deps: Vec<JobId>,
    run: Box<dyn FnOnce()>,
    /// Invoked instead of `run` when the context is cleared, so the job
    /// owner can discard buffered work.
    on_drop: Option<Box<dyn FnOnce()>>,
}

#[derive(Default)]
struct Context {
    pending: Vec<PendingJob>,
    ran: HashSet<JobId>,
}

thread_local! {
    static ACTIVE: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Run `f` inside a transaction context. Nested calls join the enclosing
/// context; the outermost call flushes scheduled jobs on exit.
pub fn with_transaction<R>(f: impl FnOnce() -> R) -> R {
    let is_outermost = ACTIVE.with(|cell| {
        let mut active = cell.borrow_mut();
        if active.is_none() {
            *active = Some(Context::default());
            true
        } else {
            false
        }
    });
    let result = f();
    if is_outermost {
        flush_context();
    }
    result
}

/// Schedule `run` under `id`. Within a context the job runs once at context
/// exit (after all of `deps` that are also scheduled); outside a context it
/// runs now.
pub fn schedule(id: JobId, deps: Vec<JobId>, run: impl FnOnce() + 'static, on_drop: impl FnOnce() + 'static) {
    let mut run = Some(run);
    let deferred = ACTIVE.with(|cell| {
        let mut active = cell.borrow_mut();
        match active.as_mut() {
            Some(ctx) => {
                if ctx.ran.contains(&id) || ctx.pending.iter().any(|j| j.id == id) {
                    return true; // deduplicated
                }
                ctx.pending.push(PendingJob {
                    id,
                    deps,
                    run: Box::new(run.take().unwrap()),
                    on_drop: Some(Box::new(on_drop)),
                });
                true
            }
            None => false,
        }
    });
    if !deferred {
        (run.take().unwrap())();
    }
}

/// Drop every job pending in the current context (rollback/abort path).
/// Each dropped job's `on_drop` hook fires so owners can discard
/// accumulated load callbacks.
pub fn clear_context() {
    let dropped = ACTIVE.with(|cell| {
        let mut active = cell.borrow_mut();
        match active.as_mut() {
            Some(ctx) => std::mem::take(&mut ctx.pending),
            None => Vec::new(),
        }
    });
    for job in dropped {
        if let Some(on_drop) = job.on_drop {
            on_drop();
        }
    }
}

fn flush_context() {
    loop {
        let next = ACTIVE.with(|cell| {
            let mut active = cell.borrow_mut();
            let ctx = active.as_mut().expect("flush without context");
            if ctx.pending.is_empty() {
                *active = None;
                return None;
            }
            // Pick the first job whose scheduled dependencies have all run.
            let pos = ctx
                .pending
                .iter()
                .position(|job| {
                    job.deps
                        .iter()
                        .all(|dep| !ctx.pending.iter().any(|other| other.id == *dep))
                })
                .unwrap_or_else(|| {
                    log::warn!("dependency cycle among scheduled jobs; running in schedule order");
                    0
                });
            let job = ctx.pending.remove(pos);
            ctx.ran.insert(job.id);
            Some(job)
        });
        match next {
            // Jobs run outside the borrow: they may schedule more work,
            // which joins this same context.
            Some(job) => (job.run)(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn immediate_outside_context() {
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        schedule(JobId::allocate(), vec![], move || *h.borrow_mut() += 1, || {});
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn deduplicates_within_context() {
        let hits = Rc::new(RefCell::new(0));
        let id = JobId::allocate();
        with_transaction(|| {
            for _ in 0..3 {
                let h = hits.clone();
                schedule(id, vec![], move || *h.borrow_mut() += 1, || {});
            }
        });
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn dependencies_order_execution() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let a = JobId::allocate();
        let b = JobId::allocate();
        with_transaction(|| {
            let o = order.clone();
            // A depends on B but is scheduled first.
            schedule(a, vec![b], move || o.borrow_mut().push("a"), || {});
            let o = order.clone();
            schedule(b, vec![], move || o.borrow_mut().push("b"), || {});
        });
        assert_eq!(*order.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn jobs_scheduled_by_jobs_join_the_context_once() {
        let hits = Rc::new(RefCell::new(0));
        let chained = JobId::allocate();
        let first = JobId::allocate();
        with_transaction(|| {
            let h = hits.clone();
            schedule(
                first,
                vec![],
                move || {
                    let h2 = h.clone();
                    schedule(chained, vec![], move || *h2.borrow_mut() += 1, || {});
                    // A second schedule of the same job is dropped.
                    let h3 = h.clone();
                    schedule(chained, vec![], move || *h3.borrow_mut() += 1, || {});
                },
                || {},
            );
        });
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn clear_drops_pending_jobs_and_fires_hooks() {
        let ran = Rc::new(RefCell::new(false));
        let dropped = Rc::new(RefCell::new(false));
        with_transaction(|| {
            let r = ran.clone();
            let d = dropped.clone();
            schedule(JobId::allocate(), vec![], move || *r.borrow_mut() = true, move || {
                *d.borrow_mut() = true
            });
            clear_context();
        });
        assert!(!*ran.borrow());
        assert!(*dropped.borrow());
    }
}
