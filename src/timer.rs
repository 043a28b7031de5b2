use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub type TimerCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("interval must be greater than zero")]
    ZeroInterval,
    #[error("delay of {0}ms overflows the scheduler clock")]
    DelayOverflow(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Scheduling seam shared by every time-driven component. Production code
/// runs on [`SystemScheduler`]; tests drive [`VirtualScheduler`] so no test
/// ever sleeps to observe timer behavior.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, callback: TimerCallback, delay_ms: u64) -> Result<TimerHandle, TimerError>;
    fn schedule_interval(
        &self,
        callback: TimerCallback,
        interval_ms: u64,
    ) -> Result<TimerHandle, TimerError>;
    fn cancel(&self, handle: TimerHandle);
    fn now_ms(&self) -> u64;
}

struct TimerEntry {
    handle: u64,
    due_ms: u64,
    seq: u64,
    interval_ms: Option<u64>,
    callback: TimerCallback,
}

fn run_callback(callback: &mut TimerCallback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        tracing::warn!(
            "scheduled callback panicked: {}",
            panic_detail(payload.as_ref())
        );
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Default)]
struct VirtualState {
    now_ms: u64,
    next_handle: u64,
    next_seq: u64,
    queue: Vec<TimerEntry>,
    cancelled_inflight: HashSet<u64>,
}

impl VirtualState {
    fn alloc(&mut self) -> (u64, u64) {
        let handle = self.next_handle;
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        (handle, seq)
    }
}

/// Virtual clock: time only moves on explicit `advance_time` /
/// `advance_to_next_timer` calls. Due callbacks execute synchronously in
/// (due time, registration order); interval timers re-arm after each fire.
#[derive(Default)]
pub struct VirtualScheduler {
    state: Mutex<VirtualState>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `ms`, firing every callback that becomes due.
    /// Callbacks may schedule or cancel timers reentrantly; timers scheduled
    /// by a callback still fire within the same advance when they fall due
    /// before the target time.
    pub fn advance_time(&self, ms: u64) {
        let target = {
            let state = self.state.lock().expect("virtual scheduler poisoned");
            state.now_ms.saturating_add(ms)
        };
        loop {
            let due_entry = {
                let mut state = self.state.lock().expect("virtual scheduler poisoned");
                let next = state
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.due_ms <= target)
                    .min_by_key(|(_, entry)| (entry.due_ms, entry.seq))
                    .map(|(idx, _)| idx);
                match next {
                    Some(idx) => {
                        let entry = state.queue.remove(idx);
                        state.now_ms = state.now_ms.max(entry.due_ms);
                        Some(entry)
                    }
                    None => {
                        state.now_ms = target;
                        None
                    }
                }
            };
            let Some(mut entry) = due_entry else {
                break;
            };
            run_callback(&mut entry.callback);
            let mut state = self.state.lock().expect("virtual scheduler poisoned");
            if state.cancelled_inflight.remove(&entry.handle) {
                continue;
            }
            if let Some(interval) = entry.interval_ms {
                entry.seq = state.next_seq;
                state.next_seq += 1;
                entry.due_ms = entry.due_ms.saturating_add(interval);
                state.queue.push(entry);
            }
        }
    }

    /// Jump straight to the earliest pending timer. Returns the number of
    /// milliseconds advanced, or `None` when nothing is scheduled.
    pub fn advance_to_next_timer(&self) -> Option<u64> {
        let delta = {
            let state = self.state.lock().expect("virtual scheduler poisoned");
            let earliest = state.queue.iter().map(|entry| entry.due_ms).min()?;
            earliest.saturating_sub(state.now_ms)
        };
        self.advance_time(delta);
        Some(delta)
    }

    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .expect("virtual scheduler poisoned")
            .queue
            .len()
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule(&self, callback: TimerCallback, delay_ms: u64) -> Result<TimerHandle, TimerError> {
        let mut state = self.state.lock().expect("virtual scheduler poisoned");
        let due_ms = state
            .now_ms
            .checked_add(delay_ms)
            .ok_or(TimerError::DelayOverflow(delay_ms))?;
        let (handle, seq) = state.alloc();
        state.queue.push(TimerEntry {
            handle,
            due_ms,
            seq,
            interval_ms: None,
            callback,
        });
        Ok(TimerHandle(handle))
    }

    fn schedule_interval(
        &self,
        callback: TimerCallback,
        interval_ms: u64,
    ) -> Result<TimerHandle, TimerError> {
        if interval_ms == 0 {
            return Err(TimerError::ZeroInterval);
        }
        let mut state = self.state.lock().expect("virtual scheduler poisoned");
        let due_ms = state
            .now_ms
            .checked_add(interval_ms)
            .ok_or(TimerError::DelayOverflow(interval_ms))?;
        let (handle, seq) = state.alloc();
        state.queue.push(TimerEntry {
            handle,
            due_ms,
            seq,
            interval_ms: Some(interval_ms),
            callback,
        });
        Ok(TimerHandle(handle))
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock().expect("virtual scheduler poisoned");
        if let Some(idx) = state.queue.iter().position(|entry| entry.handle == handle.0) {
            state.queue.remove(idx);
        } else {
            // The timer may be mid-callback; make sure an interval does not
            // re-arm once its callback returns.
            state.cancelled_inflight.insert(handle.0);
        }
    }

    fn now_ms(&self) -> u64 {
        self.state
            .lock()
            .expect("virtual scheduler poisoned")
            .now_ms
    }
}

struct SystemState {
    queue: Vec<TimerEntry>,
    cancelled_inflight: HashSet<u64>,
    next_handle: u64,
    next_seq: u64,
    shutdown: bool,
}

struct SystemInner {
    start: Instant,
    state: Mutex<SystemState>,
    wakeup: Condvar,
}

impl SystemInner {
    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Real-clock scheduler backed by a single dispatch thread. Callbacks run
/// sequentially on that thread, matching the cooperative semantics of the
/// virtual scheduler.
pub struct SystemScheduler {
    inner: Arc<SystemInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SystemScheduler {
    pub fn new() -> Self {
        let inner = Arc::new(SystemInner {
            start: Instant::now(),
            state: Mutex::new(SystemState {
                queue: Vec::new(),
                cancelled_inflight: HashSet::new(),
                next_handle: 0,
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let dispatch_inner = inner.clone();
        let worker = thread::spawn(move || dispatch_loop(&dispatch_inner));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn push_entry(
        &self,
        callback: TimerCallback,
        delay_ms: u64,
        interval_ms: Option<u64>,
    ) -> Result<TimerHandle, TimerError> {
        let now = self.inner.elapsed_ms();
        let due_ms = now
            .checked_add(delay_ms)
            .ok_or(TimerError::DelayOverflow(delay_ms))?;
        let mut state = self.inner.state.lock().expect("system scheduler poisoned");
        let handle = state.next_handle;
        state.next_handle += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(TimerEntry {
            handle,
            due_ms,
            seq,
            interval_ms,
            callback,
        });
        drop(state);
        self.inner.wakeup.notify_one();
        Ok(TimerHandle(handle))
    }
}

impl Default for SystemScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SystemScheduler {
    fn schedule(&self, callback: TimerCallback, delay_ms: u64) -> Result<TimerHandle, TimerError> {
        self.push_entry(callback, delay_ms, None)
    }

    fn schedule_interval(
        &self,
        callback: TimerCallback,
        interval_ms: u64,
    ) -> Result<TimerHandle, TimerError> {
        if interval_ms == 0 {
            return Err(TimerError::ZeroInterval);
        }
        self.push_entry(callback, interval_ms, Some(interval_ms))
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.inner.state.lock().expect("system scheduler poisoned");
        if let Some(idx) = state.queue.iter().position(|entry| entry.handle == handle.0) {
            state.queue.remove(idx);
        } else {
            state.cancelled_inflight.insert(handle.0);
        }
        drop(state);
        self.inner.wakeup.notify_one();
    }

    fn now_ms(&self) -> u64 {
        self.inner.elapsed_ms()
    }
}

impl Drop for SystemScheduler {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.shutdown = true;
        }
        self.inner.wakeup.notify_all();
        if let Ok(mut worker) = self.worker.lock()
            && let Some(handle) = worker.take()
        {
            let _ = handle.join();
        }
    }
}

fn dispatch_loop(inner: &Arc<SystemInner>) {
    loop {
        let state = inner.state.lock().expect("system scheduler poisoned");
        if state.shutdown {
            break;
        }
        let now = inner.elapsed_ms();
        let next = state
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| (entry.due_ms, entry.seq))
            .map(|(idx, entry)| (idx, entry.due_ms));
        match next {
            None => {
                let guard = inner
                    .wakeup
                    .wait(state)
                    .expect("system scheduler poisoned");
                drop(guard);
            }
            Some((idx, due_ms)) if due_ms <= now => {
                let mut state = state;
                let mut entry = state.queue.remove(idx);
                drop(state);
                run_callback(&mut entry.callback);
                let mut state = inner.state.lock().expect("system scheduler poisoned");
                if state.cancelled_inflight.remove(&entry.handle) {
                    continue;
                }
                if let Some(interval) = entry.interval_ms {
                    entry.seq = state.next_seq;
                    state.next_seq += 1;
                    // Re-arm relative to now so a slow callback cannot make
                    // an interval fire in a burst to catch up.
                    entry.due_ms = now.max(entry.due_ms).saturating_add(interval);
                    state.queue.push(entry);
                }
            }
            Some((_, due_ms)) => {
                let wait = Duration::from_millis(due_ms.saturating_sub(now));
                let (guard, _) = inner
                    .wakeup
                    .wait_timeout(state, wait)
                    .expect("system scheduler poisoned");
                drop(guard);
            }
        }
    }
}

#[cfg(test)]
#[path = "../tests/unit/timer_tests.rs"]
mod tests;
