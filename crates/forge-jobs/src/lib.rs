//! Fixed-size work-stealing job scheduler.
//!
//! A pool of OS threads (capped at [`MAX_THREAD_COUNT`]) each own a
//! [`forge_deque::Deque`] of job-cache indices. Jobs may declare a parent;
//! a parent's `run_count` is incremented per child and decremented on every
//! completion (its own and each child's), so waiting on a parent transitively
//! waits on the whole subtree. External threads may join the pool via
//! [`JobQueue::adopt_thread`] to push and wait on jobs using the same
//! protocol as pool workers.

mod error;
mod rng;

pub use error::{JobQueueError, Result};

use forge_deque::Deque;
use rng::XoroRand;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

pub const MAX_JOB_COUNT: usize = 1024;
pub const MAX_THREAD_COUNT: usize = 32;
const NO_PARENT: u32 = u32::MAX;
const DEFAULT_DEQUE_CAPACITY: usize = 1024;
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(u32);

/// Tuning knobs for [`JobQueue::new`] and [`parallel_for`](JobQueue::parallel_for).
#[derive(Debug, Clone, Copy)]
pub struct JobQueueConfig {
    pub num_threads: usize,
    pub deque_capacity: usize,
}

impl Default for JobQueueConfig {
    fn default() -> JobQueueConfig {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        JobQueueConfig {
            num_threads: available.min(MAX_THREAD_COUNT),
            deque_capacity: DEFAULT_DEQUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitConfig {
    pub max_split: u32,
    pub min_count: u32,
}

impl Default for SplitConfig {
    fn default() -> SplitConfig {
        SplitConfig { max_split: 12, min_count: 64 }
    }
}

fn should_split(splits: u32, count: u32, cfg: SplitConfig) -> bool {
    splits < cfg.max_split && count >= cfg.min_count * 2
}

#[repr(align(64))]
struct JobMeta {
    ref_count: AtomicU32,
    run_count: AtomicI32,
    parent: AtomicU32,
    panicked: AtomicBool,
}

impl JobMeta {
    fn new() -> JobMeta {
        JobMeta {
            ref_count: AtomicU32::new(0),
            run_count: AtomicI32::new(0),
            parent: AtomicU32::new(NO_PARENT),
            panicked: AtomicBool::new(false),
        }
    }
}

/// Extracts a human-readable message from a `catch_unwind` payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[repr(align(64))]
struct ThreadInfo {
    deque: Deque,
    rng: XoroRand,
    active: AtomicBool,
}

impl ThreadInfo {
    fn new(seed: usize, deque_capacity: usize) -> ThreadInfo {
        ThreadInfo {
            deque: Deque::new(deque_capacity),
            rng: XoroRand::new(0x9E3779B97F4A7C15 ^ (seed as u64), 0xBF58476D1CE4E5B9),
            active: AtomicBool::new(false),
        }
    }
}

type JobFn = Box<dyn FnOnce() + Send>;

type JobPanic = Box<dyn std::any::Any + Send + 'static>;

pub struct JobQueue {
    job_meta: Vec<JobMeta>,
    job_funcs: Vec<Mutex<Option<JobFn>>>,
    job_panic: Vec<Mutex<Option<JobPanic>>>,
    free_list: Mutex<Vec<u32>>,
    next_fresh: AtomicU32,
    threads: Vec<ThreadInfo>,
    thread_count: AtomicUsize,
    thread_ids: Mutex<HashMap<ThreadId, usize>>,
    exit_flag: AtomicBool,
    wait_mutex: Mutex<()>,
    wait_cond: Condvar,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig) -> Result<Arc<JobQueue>> {
        let num_threads = config.num_threads.min(MAX_THREAD_COUNT).max(1);
        let job_meta = (0..MAX_JOB_COUNT).map(|_| JobMeta::new()).collect();
        let job_funcs = (0..MAX_JOB_COUNT).map(|_| Mutex::new(None)).collect();
        let job_panic = (0..MAX_JOB_COUNT).map(|_| Mutex::new(None)).collect();
        let threads = (0..MAX_THREAD_COUNT)
            .map(|i| ThreadInfo::new(i, config.deque_capacity))
            .collect();

        let queue = Arc::new(JobQueue {
            job_meta,
            job_funcs,
            job_panic,
            free_list: Mutex::new(Vec::new()),
            next_fresh: AtomicU32::new(0),
            threads,
            thread_count: AtomicUsize::new(0),
            thread_ids: Mutex::new(HashMap::new()),
            exit_flag: AtomicBool::new(false),
            wait_mutex: Mutex::new(()),
            wait_cond: Condvar::new(),
            join_handles: Mutex::new(Vec::new()),
        });

        // Mark worker slots active before any worker thread runs, so a
        // concurrent `adopt_thread` can never claim a slot that belongs to
        // a not-yet-started worker.
        for slot in 0..num_threads {
            queue.threads[slot].active.store(true, Ordering::Release);
        }

        for slot in 0..num_threads {
            let jq = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("forge-job-worker-{slot}"))
                .spawn(move || worker_loop(jq, slot))
                .map_err(JobQueueError::ThreadStartFailed)?;
            queue.join_handles.lock().unwrap().push(handle);
        }
        queue.thread_count.store(num_threads, Ordering::Release);

        Ok(queue)
    }

    /// Registers an external OS thread as a pool participant, claiming a
    /// free [`ThreadInfo`] slot for it. The returned guard's `Drop`
    /// releases the slot.
    pub fn adopt_thread(self: &Arc<Self>) -> Result<AdoptedThread> {
        let count = self.thread_count.load(Ordering::Acquire);
        if count >= MAX_THREAD_COUNT {
            return Err(JobQueueError::NoFreeThreadSlot { capacity: MAX_THREAD_COUNT });
        }
        let slot = (0..MAX_THREAD_COUNT)
            .find(|&i| {
                self.threads[i]
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .ok_or(JobQueueError::NoFreeThreadSlot { capacity: MAX_THREAD_COUNT })?;
        self.register_current_thread(slot);
        self.thread_count.fetch_max(slot + 1, Ordering::AcqRel);
        Ok(AdoptedThread { queue: Arc::clone(self), slot })
    }

    fn register_current_thread(&self, slot: usize) {
        self.threads[slot].active.store(true, Ordering::Release);
        self.thread_ids
            .lock()
            .unwrap()
            .insert(std::thread::current().id(), slot);
    }

    fn current_slot(&self) -> usize {
        *self
            .thread_ids
            .lock()
            .unwrap()
            .get(&std::thread::current().id())
            .expect("current thread is not a job queue worker or adopted thread")
    }

    fn alloc_slot(&self) -> Result<u32> {
        if let Some(idx) = self.free_list.lock().unwrap().pop() {
            return Ok(idx);
        }
        let idx = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        if idx as usize >= MAX_JOB_COUNT {
            self.next_fresh.fetch_sub(1, Ordering::Relaxed);
            return Err(JobQueueError::JobCacheExhausted { capacity: MAX_JOB_COUNT });
        }
        Ok(idx)
    }

    fn free_slot(&self, idx: u32) {
        self.free_list.lock().unwrap().push(idx);
    }

    /// Creates a job bound to `f`, parented to `parent` if given. The job
    /// is not runnable until passed to [`run_job`](JobQueue::run_job). The
    /// caller owns one reference on the returned handle and must drop it
    /// with exactly one of [`release`](JobQueue::release) or
    /// [`wait_and_release`](JobQueue::wait_and_release).
    pub fn spawn<F>(&self, parent: Option<JobHandle>, f: F) -> Result<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self.alloc_slot()?;
        let meta = &self.job_meta[idx as usize];
        // One reference for the runtime (released when run_count hits zero),
        // one for the creator (released via `release` or `wait_and_release`).
        meta.ref_count.store(2, Ordering::Release);
        meta.run_count.store(1, Ordering::Release);
        meta.panicked.store(false, Ordering::Release);
        *self.job_panic[idx as usize].lock().unwrap() = None;
        let parent_idx = parent.map(|p| p.0).unwrap_or(NO_PARENT);
        meta.parent.store(parent_idx, Ordering::Release);
        if parent_idx != NO_PARENT {
            self.job_meta[parent_idx as usize]
                .run_count
                .fetch_add(1, Ordering::AcqRel);
        }
        *self.job_funcs[idx as usize].lock().unwrap() = Some(Box::new(f));
        Ok(JobHandle(idx))
    }

    /// A pure synchronization point: a job with no work of its own, usable
    /// as the shared parent of a batch of children.
    pub fn create_parent_job(&self) -> Result<JobHandle> {
        self.spawn(None, || {})
    }

    /// Pushes `job` onto the calling thread's own deque. The caller must be
    /// a pool worker or have called [`adopt_thread`](JobQueue::adopt_thread).
    pub fn run_job(&self, job: JobHandle) {
        let slot = self.current_slot();
        let pushed = self.threads[slot].deque.push(job.0 as usize);
        debug_assert!(pushed, "job deque capacity exceeded");
        self.wake_one();
    }

    /// Convenience for `spawn` followed immediately by `run_job`.
    pub fn run<F>(&self, parent: Option<JobHandle>, f: F) -> Result<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.spawn(parent, f)?;
        self.run_job(handle);
        Ok(handle)
    }

    fn run_count(&self, job: JobHandle) -> i32 {
        self.job_meta[job.0 as usize].run_count.load(Ordering::Acquire)
    }

    /// Pushes `job` and blocks the calling thread (helping execute other
    /// jobs) until it and its whole subtree complete. Equivalent to
    /// `run_job` followed by `wait_and_release`.
    pub fn run_and_wait(&self, job: JobHandle) {
        self.run_job(job);
        self.wait_and_release(job);
    }

    /// Blocks the calling thread until `job`'s subtree completes, helping
    /// execute other queued jobs meanwhile, then releases the caller's
    /// reference on the slot.
    pub fn wait_and_release(&self, job: JobHandle) {
        let slot = self.current_slot();
        while self.run_count(job) != 0 {
            if self.thread_execute(slot) {
                continue;
            }
            self.park_briefly();
        }
        let panicked = self.job_meta[job.0 as usize].panicked.load(Ordering::Acquire);
        let payload = self.job_panic[job.0 as usize].lock().unwrap().take();
        self.release(job);
        if panicked {
            match payload {
                Some(payload) => std::panic::resume_unwind(payload),
                None => panic!("job {} subtree panicked; see log for the originating job", job.0),
            }
        }
    }

    /// Drops the creator's reference on `job` without waiting for it,
    /// for jobs whose completion is observed only through a parent.
    /// Must be called at most once per `spawn`/`run`.
    pub fn release(&self, job: JobHandle) {
        self.release_ref(job.0);
    }

    fn release_ref(&self, idx: u32) {
        let prev = self.job_meta[idx as usize].ref_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.free_slot(idx);
        }
    }

    /// Runs one job from the calling slot's own deque, else steals one.
    /// Returns whether any work was performed.
    fn thread_execute(&self, slot: usize) -> bool {
        let idx = match self.threads[slot].deque.pop() {
            Some(idx) => idx as u32,
            None => match self.try_steal(slot) {
                Some(idx) => idx,
                None => return false,
            },
        };
        let func = self.job_funcs[idx as usize].lock().unwrap().take();
        if let Some(f) = func {
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                log::error!("job {idx} panicked: {}", panic_message(&*payload));
                self.job_meta[idx as usize].panicked.store(true, Ordering::Release);
                *self.job_panic[idx as usize].lock().unwrap() = Some(payload);
            }
        }
        self.complete_job(idx);
        true
    }

    fn try_steal(&self, own_slot: usize) -> Option<u32> {
        let n = self.thread_count.load(Ordering::Acquire);
        if n <= 1 {
            return None;
        }
        let start = self.threads[own_slot].rng.next_below(n as u32) as usize;
        for i in 0..n {
            let victim = (start + i) % n;
            if victim == own_slot || !self.threads[victim].active.load(Ordering::Acquire) {
                continue;
            }
            if let Some(idx) = self.threads[victim].deque.steal() {
                return Some(idx as u32);
            }
        }
        None
    }

    fn complete_job(&self, idx: u32) {
        let prev = self.job_meta[idx as usize].run_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.wake_all();
            let parent = self.job_meta[idx as usize].parent.load(Ordering::Acquire);
            let panicked = self.job_meta[idx as usize].panicked.load(Ordering::Acquire);
            self.release_ref(idx);
            if parent != NO_PARENT {
                if panicked {
                    self.job_meta[parent as usize].panicked.store(true, Ordering::Release);
                }
                self.complete_job(parent);
            }
        }
    }

    fn wake_one(&self) {
        let _guard = self.wait_mutex.lock().unwrap();
        self.wait_cond.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.wait_mutex.lock().unwrap();
        self.wait_cond.notify_all();
    }

    fn park_briefly(&self) {
        let guard = self.wait_mutex.lock().unwrap();
        if self.exit_flag.load(Ordering::Acquire) {
            return;
        }
        let _ = self.wait_cond.wait_timeout(guard, PARK_TIMEOUT);
    }

    /// Splits `[start, start+count)` into child jobs of `parent` until the
    /// split budget in `cfg` is exhausted, running `func(chunk_start,
    /// chunk_count)` on each leaf. Returns the first child job created;
    /// callers wait on `parent`, not on the returned handle.
    pub fn parallel_for<F>(
        self: &Arc<Self>,
        parent: JobHandle,
        start: u32,
        count: u32,
        cfg: SplitConfig,
        func: F,
    ) -> Result<JobHandle>
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        let func: Arc<dyn Fn(u32, u32) + Send + Sync> = Arc::new(func);
        let handle = self.parallel_for_split(parent, start, count, 0, cfg, func)?;
        self.run_job(handle);
        self.release(handle);
        Ok(handle)
    }

    fn parallel_for_split(
        self: &Arc<Self>,
        parent: JobHandle,
        start: u32,
        count: u32,
        splits: u32,
        cfg: SplitConfig,
        func: Arc<dyn Fn(u32, u32) + Send + Sync>,
    ) -> Result<JobHandle> {
        let jq = Arc::clone(self);
        self.spawn(Some(parent), move || {
            if should_split(splits, count, cfg) {
                let left_count = count / 2;
                let right_count = count - left_count;
                let left = jq
                    .parallel_for_split(parent, start, left_count, splits + 1, cfg, Arc::clone(&func))
                    .expect("job cache exhausted while splitting parallel_for");
                jq.run_job(left);
                jq.release(left);
                let right = jq
                    .parallel_for_split(parent, start + left_count, right_count, splits + 1, cfg, func)
                    .expect("job cache exhausted while splitting parallel_for");
                jq.run_job(right);
                jq.release(right);
            } else {
                func(start, count);
            }
        })
    }

    /// Stops all pool worker threads and joins them. Jobs still queued are
    /// abandoned. Must be called explicitly; dropping a `JobQueue` without
    /// calling `shutdown` first leaves its worker threads parked.
    pub fn shutdown(&self) {
        self.exit_flag.store(true, Ordering::Release);
        self.wake_all();
        let mut handles = self.join_handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// A guard representing an external thread's membership in the pool.
/// Releases its `ThreadInfo` slot on drop.
pub struct AdoptedThread {
    queue: Arc<JobQueue>,
    slot: usize,
}

impl Drop for AdoptedThread {
    fn drop(&mut self) {
        self.queue.threads[self.slot].active.store(false, Ordering::Release);
        self.queue
            .thread_ids
            .lock()
            .unwrap()
            .remove(&std::thread::current().id());
    }
}

fn worker_loop(jq: Arc<JobQueue>, slot: usize) {
    jq.register_current_thread(slot);
    loop {
        if jq.thread_execute(slot) {
            continue;
        }
        if jq.exit_flag.load(Ordering::Acquire) {
            break;
        }
        jq.park_briefly();
        if jq.exit_flag.load(Ordering::Acquire) && !jq.thread_execute(slot) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    #[test]
    fn parallel_for_covers_every_index() {
        let jq = JobQueue::new(JobQueueConfig { num_threads: 4, deque_capacity: 1024 }).unwrap();
        let _adopted = jq.adopt_thread().unwrap();
        let n = 10_000usize;
        let hits: Arc<Vec<Counter>> = Arc::new((0..n).map(|_| Counter::new(0)).collect());

        let parent = jq.create_parent_job().unwrap();
        let hits2 = Arc::clone(&hits);
        jq.parallel_for(
            parent,
            0,
            n as u32,
            SplitConfig { max_split: 12, min_count: 64 },
            move |start, count| {
                for i in start..start + count {
                    hits2[i as usize].fetch_add(1, Ordering::Relaxed);
                }
            },
        )
        .unwrap();
        jq.run_and_wait(parent);

        for h in hits.iter() {
            assert_eq!(h.load(Ordering::Relaxed), 1);
        }
        jq.shutdown();
    }

    #[test]
    fn parent_waits_for_all_children() {
        let jq = JobQueue::new(JobQueueConfig { num_threads: 4, deque_capacity: 1024 }).unwrap();
        let _adopted = jq.adopt_thread().unwrap();
        let done = Arc::new(Counter::new(0));
        let parent = jq.create_parent_job().unwrap();
        for _ in 0..20 {
            let done2 = Arc::clone(&done);
            let child = jq
                .spawn(Some(parent), move || {
                    std::thread::sleep(Duration::from_millis(1));
                    done2.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            jq.run_job(child);
            jq.release(child);
        }
        jq.run_and_wait(parent);
        assert_eq!(done.load(Ordering::Relaxed), 20);
        jq.shutdown();
    }

    #[test]
    fn single_job_runs_and_completes() {
        let jq = JobQueue::new(JobQueueConfig { num_threads: 2, deque_capacity: 64 }).unwrap();
        let _adopted = jq.adopt_thread().unwrap();
        let ran = Arc::new(Counter::new(0));
        let ran2 = Arc::clone(&ran);
        let job = jq.run(None, move || { ran2.fetch_add(1, Ordering::Relaxed); }).unwrap();
        jq.wait_and_release(job);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        jq.shutdown();
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panicking_job_propagates_to_waiter() {
        let jq = JobQueue::new(JobQueueConfig { num_threads: 2, deque_capacity: 64 }).unwrap();
        let _adopted = jq.adopt_thread().unwrap();
        let job = jq.run(None, || panic!("boom")).unwrap();
        jq.wait_and_release(job);
        jq.shutdown();
    }

    #[test]
    fn child_panic_propagates_through_parent_wait() {
        let jq = JobQueue::new(JobQueueConfig { num_threads: 4, deque_capacity: 64 }).unwrap();
        let _adopted = jq.adopt_thread().unwrap();
        let parent = jq.create_parent_job().unwrap();
        for i in 0..8 {
            let child = jq
                .spawn(Some(parent), move || {
                    if i == 4 {
                        panic!("child boom");
                    }
                })
                .unwrap();
            jq.run_job(child);
            jq.release(child);
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| jq.run_and_wait(parent)));
        assert!(result.is_err());
        jq.shutdown();
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]
        #[test]
        fn parallel_for_hits_every_index_for_any_range(n in 1u32..2000, min_count in 1u32..128, max_split in 0u32..16) {
            let jq = JobQueue::new(JobQueueConfig { num_threads: 3, deque_capacity: 1024 }).unwrap();
            let _adopted = jq.adopt_thread().unwrap();
            let hits: Arc<Vec<Counter>> = Arc::new((0..n as usize).map(|_| Counter::new(0)).collect());

            let parent = jq.create_parent_job().unwrap();
            let hits2 = Arc::clone(&hits);
            jq.parallel_for(parent, 0, n, SplitConfig { max_split, min_count }, move |start, count| {
                for i in start..start + count {
                    hits2[i as usize].fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
            jq.run_and_wait(parent);

            for h in hits.iter() {
                proptest::prop_assert_eq!(h.load(Ordering::Relaxed), 1);
            }
            jq.shutdown();
        }
    }
}
