//! The loop every thread working on a build runs, background jobs and callers
//! joining from `get_dependency_graph` alike.
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{Span, debug, info, trace};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::builder::BuilderState;
use crate::builder::cleanup::CacheStats;
use crate::engine::{GraphBuildingContext, Runnable, abort_loops};
use crate::error::BuildError;

/// Steps between two updates of the progress bar.
const PROGRESS_EVERY: u64 = 64;

/// Puts work on the run queue. A job is only started when the queue already
/// had work, otherwise the thread that submitted is about to take it itself.
pub(crate) fn submit(state: &Arc<BuilderState>, runnable: Runnable) {
    let was_empty = state.run_queue.is_empty();
    state.scheduled_steps.fetch_add(1, Ordering::Relaxed);
    state.run_queue.add(runnable);
    if !was_empty {
        start_job(state);
    }
}

/// Starts one background job unless the limit is reached.
pub(crate) fn start_job(state: &Arc<BuilderState>) -> bool {
    let mut jobs = state.jobs.load(Ordering::Acquire);
    while jobs < state.max_jobs.load(Ordering::Acquire) {
        match state
            .jobs
            .compare_exchange(jobs, jobs + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                state.running.fetch_add(1, Ordering::AcqRel);
                let job_state = state.clone();
                state.pool.spawn(move || run_background(&job_state));
                return true;
            }
            Err(actual) => jobs = actual,
        }
    }
    false
}

/// Starts as many jobs as there is queued work, up to the limit.
pub(crate) fn start_background_build(state: &Arc<BuilderState>) {
    let queued = state.run_queue.len();
    if queued == 0 {
        debug!("no pending work for background building");
        return;
    }
    for _ in 0..queued {
        if !start_job(state) {
            break;
        }
    }
}

fn run_background(state: &Arc<BuilderState>) {
    let mut completed = 0;
    loop {
        let mut ctx = GraphBuildingContext::new(state.clone());
        completed += run_steps(&mut ctx, None);

        // Work submitted while this job was winding down may have seen the
        // old job count and started nothing.
        let mut jobs = state.jobs.fetch_sub(1, Ordering::AcqRel) - 1;
        let mut resumed = false;
        while !state.run_queue.is_empty()
            && jobs < state.max_jobs.load(Ordering::Acquire)
            && !state.is_cancelled()
        {
            match state
                .jobs
                .compare_exchange(jobs, jobs + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug!("building job resuming");
                    resumed = true;
                    break;
                }
                Err(actual) => jobs = actual,
            }
        }
        if !resumed {
            break;
        }
    }
    debug!(completed, "building job stopped");
    job_stopped(state);
}

/// Runs a job on the calling thread until no work is left for it.
pub(crate) fn run_inline(state: &Arc<BuilderState>, progress: &Span) -> Result<u64, BuildError> {
    {
        let _guard = state.build_lock.lock().unwrap();
        if state.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        state.running.fetch_add(1, Ordering::AcqRel);
    }
    let mut ctx = GraphBuildingContext::new(state.clone());
    let completed = run_steps(&mut ctx, Some(progress));
    job_stopped(state);
    Ok(completed)
}

fn run_steps(ctx: &mut GraphBuildingContext, progress: Option<&Span>) -> u64 {
    let state = ctx.state().clone();
    let mut completed = 0;
    while !state.is_cancelled() && step(ctx) {
        completed += 1;
        if let Some(span) = progress
            && completed % PROGRESS_EVERY == 0
        {
            report_progress(&state, span);
        }
        maybe_cleanup(ctx);
    }
    if let Some(span) = progress {
        report_progress(&state, span);
    }
    completed
}

/// Puts previously scheduled work back on the run queue without counting it
/// as new work.
fn requeue(state: &Arc<BuilderState>, runnable: Runnable) {
    let was_empty = state.run_queue.is_empty();
    state.run_queue.add(runnable);
    if !was_empty {
        start_job(state);
    }
}

/// Moves every deferred unit back to the run queue. Only called once a
/// caller has waited with nothing else to run.
pub(crate) fn retry_deferred(state: &Arc<BuilderState>) -> usize {
    let deferred: Vec<Runnable> = state.deferred.lock().unwrap().drain(..).collect();
    let count = deferred.len();
    if count > 0 {
        debug!(count, "retrying deferred work");
    }
    for runnable in deferred {
        requeue(state, runnable);
    }
    count
}

/// Runs one unit of work. `false` when the run queue had nothing that could
/// run. Deferred units are only looked at again after a unit succeeds.
fn step(ctx: &mut GraphBuildingContext) -> bool {
    let state = ctx.state().clone();
    let Some(mut runnable) = state.run_queue.take() else {
        return false;
    };

    while !runnable.try_run(ctx) {
        trace!(unit = runnable.label(), "could not run, deferring");
        state.deferred.lock().unwrap().push_back(runnable);
        match state.run_queue.take() {
            Some(next) => runnable = next,
            None => return false,
        }
    }

    // One success may have cleared the contention, release one deferred unit.
    let released = state.deferred.lock().unwrap().pop_front();
    if let Some(released) = released {
        requeue(&state, released);
    }
    state.completed_steps.fetch_add(1, Ordering::Relaxed);
    true
}

fn maybe_cleanup(ctx: &mut GraphBuildingContext) {
    let state = ctx.state().clone();
    if state.config.disable_cache_cleanup {
        return;
    }
    let completed = state.completed_steps.load(Ordering::Relaxed);
    let last = state.last_cleanup.load(Ordering::Relaxed);
    if completed < last + state.config.cleanup_interval {
        return;
    }
    if state
        .last_cleanup
        .compare_exchange(last, completed, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    let stats = CacheStats {
        requirements: state.requirements.len(),
        specifications: state.specifications.len(),
        completed_steps: completed,
    };
    if state.cleanup.should_flush(&stats) {
        let evicted = state.flush_caches(ctx);
        info!(evicted, ?stats, "flushed resolution caches");
    }
}

/// The last job out with nothing queued breaks any loop of producers still
/// waiting on each other. With no loop left the build is idle and values
/// that can no longer be placed are dropped.
fn job_stopped(state: &Arc<BuilderState>) {
    let _guard = state.build_lock.lock().unwrap();
    let remaining = state.running.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0
        && !state.is_cancelled()
        && state.run_queue.is_empty()
        && !state.has_deferred()
    {
        let mut ctx = GraphBuildingContext::new(state.clone());
        if abort_loops(&mut ctx) > 0 {
            start_background_build(state);
        } else if !state.config.disable_cache_cleanup {
            state.evict_unplaced_productions();
        }
    }
    state.build_signal.notify_all();
}

fn report_progress(state: &BuilderState, span: &Span) {
    span.pb_set_length(state.scheduled_steps.load(Ordering::Relaxed));
    span.pb_set_position(state.completed_steps.load(Ordering::Relaxed));
}
