//! The scheduler.
//!
//! Single CPU, cooperative and preemptive. All scheduling state -- the
//! thread registry, the ready queue, the sleep queue, the running thread --
//! lives behind one IRQ-safe lock; the timer tick and every wake path take
//! that lock, make their decision, and leave the actual stack switch to
//! [`reschedule`], which runs with interrupts disabled and calls into the
//! architecture switch primitive.
//!
//! The bootstrap thread (the one the loader started) registers itself as the
//! idle thread: it is never enqueued, gets picked only when nothing else is
//! ready, and spends its life in `hlt`.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};

use crate::{
    arch,
    error::{KernelError, KernelResult},
    sync::{IrqSpinLock, Semaphore},
    timer,
};

use super::{
    queue::{ReadyQueue, SleepQueue},
    task::{alloc_tid, KernelStack, Priority, Thread, ThreadId, ThreadState},
};

/// Ticks a thread may run before an equal-priority thread preempts it.
const SLICE_TICKS: u32 = 1;

/// Entry signature for kernel threads.
pub type ThreadEntry = fn(usize);

/// Everything the scheduler mutates, under one lock.
pub(crate) struct SchedCore {
    /// The handle table: owns every live thread record.
    threads: BTreeMap<ThreadId, Arc<Thread>>,
    ready: ReadyQueue,
    sleeping: SleepQueue,
    /// Running thread; 0 until the scheduler starts.
    current: ThreadId,
    /// The bootstrap/idle thread. Never enqueued on the ready queue.
    idle: ThreadId,
    /// Ticks consumed by `current` since it was dispatched.
    slice_ticks: u32,
    /// Threads that exited and await the reaper.
    reap_list: Vec<ThreadId>,
    /// Scratch buffer reused by the tick path to avoid allocation in IRQ
    /// context once it has grown.
    wake_scratch: Vec<ThreadId>,
}

impl SchedCore {
    const fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            ready: ReadyQueue::new(),
            sleeping: SleepQueue::new(),
            current: 0,
            idle: 0,
            slice_ticks: 0,
            reap_list: Vec::new(),
            wake_scratch: Vec::new(),
        }
    }

    fn thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.threads.get(&tid).cloned()
    }

    /// Move a woken or new thread onto the ready queue.
    fn enqueue_ready(&mut self, thread: &Arc<Thread>) {
        thread.set_state(ThreadState::Ready);
        thread.set_wake_tick(0);
        let band = thread.effective_priority().band();
        if !self.ready.enqueue(thread.tid, band) {
            // A full band FIFO means more runnable threads than the queue
            // was sized for; losing one would wedge it forever.
            panic!("ready queue band {} overflow", band);
        }
    }

    /// Wake every sleeper due at `now`. Returns how many became ready.
    fn wake_due(&mut self, now: u64) -> usize {
        let mut due = core::mem::take(&mut self.wake_scratch);
        due.clear();
        self.sleeping.pop_due(now, &mut due);

        let mut woken = 0;
        for tid in due.iter().copied() {
            if let Some(thread) = self.thread(tid) {
                match thread.state() {
                    // Plain sleep expired.
                    ThreadState::Sleeping => {
                        self.enqueue_ready(&thread);
                        woken += 1;
                    }
                    // Timed wait expired: make it runnable but leave it on
                    // its wait queue -- the waiter itself removes its entry
                    // and learns whether it was signaled or timed out.
                    ThreadState::Blocked => {
                        self.enqueue_ready(&thread);
                        woken += 1;
                    }
                    // Signaled before the timeout fired; stale entry.
                    _ => {}
                }
            }
        }

        due.clear();
        self.wake_scratch = due;
        woken
    }

    /// One timer tick: wake due sleepers, account the slice, and decide
    /// whether the running thread must be preempted.
    fn tick(&mut self, now: u64) -> bool {
        self.wake_due(now);

        if self.current == 0 {
            return false;
        }
        self.slice_ticks += 1;

        if self.current == self.idle {
            return self.ready.has_ready();
        }

        if self.slice_ticks < SLICE_TICKS {
            return false;
        }
        match (
            self.ready.highest_ready_band(),
            self.thread(self.current),
        ) {
            (Some(band), Some(current)) => band <= current.effective_priority().band(),
            _ => false,
        }
    }

    /// Pick the next thread to run; the idle thread when nothing is ready.
    fn pick_next(&mut self) -> ThreadId {
        self.ready.dequeue().unwrap_or(self.idle)
    }
}

static SCHED: IrqSpinLock<SchedCore> = IrqSpinLock::new(SchedCore::new());

/// Mirror of `SchedCore::current` for lock-free reads.
static CURRENT_TID: AtomicU64 = AtomicU64::new(0);

/// Set once `init` has run; gates every blocking path.
static STARTED: AtomicBool = AtomicBool::new(false);

/// The timer tick may trigger preemption only while this is set.
static SCHEDULING_ENABLED: AtomicBool = AtomicBool::new(false);

/// A wake or tick decided the running thread should yield the CPU.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Wakes the reaper when `reap_list` is non-empty.
static REAPER_SEM: Semaphore = Semaphore::new(0, 0);

/// Start the scheduler: the calling context becomes the idle thread, and the
/// reaper is spawned. Preemption stays off until [`enable_preemption`].
pub fn init() -> KernelResult<()> {
    let tid = alloc_tid();
    let bootstrap = Arc::new(Thread::bootstrap(tid, String::from("idle")));

    {
        let mut core = SCHED.lock();
        if core.current != 0 {
            return Err(KernelError::AlreadyExists {
                resource: "scheduler",
                id: core.current,
            });
        }
        core.threads.insert(tid, bootstrap);
        core.current = tid;
        core.idle = tid;
    }
    CURRENT_TID.store(tid, Ordering::Release);
    STARTED.store(true, Ordering::Release);

    spawn(
        "reaper",
        reaper_main,
        0,
        super::task::DEFAULT_STACK_SIZE,
        Priority::High,
    )?;

    log::info!(target: "sched", "scheduler started, idle tid {}", tid);
    Ok(())
}

/// Allow the timer tick to preempt. Flipped once boot is far enough along
/// that every early critical section is behind us.
pub fn enable_preemption() {
    SCHEDULING_ENABLED.store(true, Ordering::Release);
    log::info!(target: "sched", "preemption enabled");
}

/// Is preemption currently enabled?
pub fn preemption_enabled() -> bool {
    SCHEDULING_ENABLED.load(Ordering::Acquire)
}

/// The running thread's ID, or `None` before the scheduler starts.
pub fn current_tid() -> Option<ThreadId> {
    if !STARTED.load(Ordering::Acquire) {
        return None;
    }
    match CURRENT_TID.load(Ordering::Acquire) {
        0 => None,
        tid => Some(tid),
    }
}

/// Look up a live thread record.
pub(crate) fn lookup(tid: ThreadId) -> Option<Arc<Thread>> {
    SCHED.lock().thread(tid)
}

/// Create a kernel thread and make it runnable.
pub fn spawn(
    name: &str,
    entry: ThreadEntry,
    arg: usize,
    stack_size: usize,
    priority: Priority,
) -> KernelResult<ThreadId> {
    let tid = alloc_tid();
    let stack = KernelStack::new(stack_size);

    // SAFETY: `stack` was just allocated, is exclusively ours, and its top
    // is 16-byte aligned; seed_stack writes one SwitchFrame below the top.
    let rsp = unsafe {
        crate::arch::x86_64::context::seed_stack(stack.top(), entry as usize, arg)
    };

    let thread = Arc::new(Thread::new(tid, String::from(name), priority, stack));
    // SAFETY: no other reference to this brand-new record exists yet.
    unsafe {
        (*thread.context.get()).rsp = rsp;
    }

    let mut core = SCHED.lock();
    core.threads.insert(tid, thread.clone());
    core.enqueue_ready(&thread);
    drop(core);

    log::debug!(target: "sched", "spawned '{}' tid {} prio {:?}", name, tid, priority);
    Ok(tid)
}

/// Voluntarily give up the CPU; the caller goes to the tail of its band.
pub fn yield_now() {
    if current_tid().is_some() {
        reschedule();
    }
}

/// Sleep until the monotonic tick counter reaches `wake_tick`.
pub fn sleep_until_tick(wake_tick: u64) {
    let Some(tid) = current_tid() else {
        // No scheduler (early boot): nothing to suspend.
        return;
    };

    {
        let mut core = SCHED.lock();
        if wake_tick <= timer::ticks() {
            return;
        }
        let Some(thread) = core.thread(tid) else {
            return;
        };
        thread.set_state(ThreadState::Sleeping);
        thread.set_wake_tick(wake_tick);
        core.sleeping.insert(wake_tick, tid);
    }
    reschedule();
}

/// Sleep for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_until_tick(timer::ticks() + timer::ms_to_ticks(ms));
}

/// Terminate the calling thread. Joiners observe `code`; the reaper frees
/// the stack and record.
pub fn exit(code: i32) -> ! {
    let tid = current_tid().unwrap_or(0);

    if let Some(thread) = lookup(tid) {
        thread.mark_exited(code);
        // Wake joiners before going unrunnable; they re-check has_exited.
        thread.join_waiters.wake_all();

        let mut core = SCHED.lock();
        thread.set_state(ThreadState::Exiting);
        core.reap_list.push(tid);
        drop(core);

        REAPER_SEM.post().ok();
    }

    loop {
        reschedule();
        // Unreachable once the switch happens; the loop satisfies the type
        // and guards against a spurious wake of an exiting thread.
        core::hint::spin_loop();
    }
}

/// Wait for a thread to exit and collect its code.
pub fn join(tid: ThreadId) -> KernelResult<i32> {
    let target = lookup(tid).ok_or(KernelError::ThreadNotFound { tid })?;

    loop {
        if target.has_exited() {
            return Ok(target.exit_code());
        }
        if current_tid().is_none() {
            // Nothing can run the target before the scheduler starts, so
            // waiting here would never end.
            return Err(KernelError::NotInitialized {
                subsystem: "scheduler",
            });
        }
        target.join_waiters.block_current();
    }
}

/// Like [`join`], but gives up after `ms` milliseconds with
/// `KernelError::Timeout`. The target keeps running.
pub fn join_timeout(tid: ThreadId, ms: u64) -> KernelResult<i32> {
    let target = lookup(tid).ok_or(KernelError::ThreadNotFound { tid })?;
    let deadline = timer::ticks() + timer::ms_to_ticks(ms);

    loop {
        if target.has_exited() {
            return Ok(target.exit_code());
        }
        if timer::ticks() >= deadline || current_tid().is_none() {
            return Err(KernelError::Timeout { operation: "join" });
        }
        let _ = target.join_waiters.block_current_timed(deadline);
    }
}

/// Change a thread's base priority; requeues it if it is ready.
pub fn set_priority(tid: ThreadId, priority: Priority) -> KernelResult<()> {
    let mut core = SCHED.lock();
    let thread = core.thread(tid).ok_or(KernelError::ThreadNotFound { tid })?;
    thread.set_base_priority(priority);

    if thread.state() == ThreadState::Ready && core.ready.remove(tid) {
        let band = thread.effective_priority().band();
        if !core.ready.enqueue(tid, band) {
            panic!("ready queue band {} overflow", band);
        }
    }
    Ok(())
}

/// Adjust a thread's base priority by a nice delta (positive = lower).
pub fn set_nice(tid: ThreadId, delta: i32) -> KernelResult<()> {
    let base = lookup(tid)
        .ok_or(KernelError::ThreadNotFound { tid })?
        .base_priority();
    set_priority(tid, base.with_nice(delta))
}

/// Make a blocked, sleeping, or new thread runnable.
///
/// Callers must not hold the scheduler lock. Waking never hands the CPU
/// over directly -- the woken thread competes at the next scheduling point.
pub(crate) fn make_ready(tid: ThreadId) {
    let mut core = SCHED.lock();
    let Some(thread) = core.thread(tid) else {
        return;
    };
    match thread.state() {
        ThreadState::Blocked | ThreadState::Sleeping | ThreadState::New => {
            // A timed waiter may still sit on the sleep queue; drop the entry.
            let armed = thread.wake_tick();
            if armed != 0 {
                core.sleeping.remove(armed, tid);
            }
            core.enqueue_ready(&thread);
            if core.current == core.idle {
                NEED_RESCHED.store(true, Ordering::Release);
            }
        }
        _ => {}
    }
}

/// Raise a thread's effective priority (priority inheritance) and requeue
/// it if it is sitting on the ready queue at the old band.
pub(crate) fn boost_thread_priority(tid: ThreadId, priority: Priority) {
    let mut core = SCHED.lock();
    let Some(thread) = core.thread(tid) else {
        return;
    };
    thread.boost_priority(priority);
    if thread.state() == ThreadState::Ready && core.ready.remove(tid) {
        let band = thread.effective_priority().band();
        if !core.ready.enqueue(tid, band) {
            panic!("ready queue band {} overflow", band);
        }
    }
}

/// Undo a priority-inheritance boost, dropping back to the base priority.
pub(crate) fn restore_thread_priority(tid: ThreadId) {
    let mut core = SCHED.lock();
    let Some(thread) = core.thread(tid) else {
        return;
    };
    thread.restore_priority();
    if thread.state() == ThreadState::Ready && core.ready.remove(tid) {
        let band = thread.effective_priority().band();
        if !core.ready.enqueue(tid, band) {
            panic!("ready queue band {} overflow", band);
        }
    }
}

/// Arm a timed wait: the calling thread (already marked blocked by its wait
/// queue) will be made runnable at `wake_tick` if nothing wakes it first.
pub(crate) fn arm_timed_wake(tid: ThreadId, wake_tick: u64) {
    let mut core = SCHED.lock();
    if let Some(thread) = core.thread(tid) {
        thread.set_wake_tick(wake_tick);
        core.sleeping.insert(wake_tick, tid);
    }
}

/// Cancel a timed wait armed with [`arm_timed_wake`]. Harmless if the tick
/// already fired.
pub(crate) fn cancel_timed_wake(tid: ThreadId, wake_tick: u64) {
    let mut core = SCHED.lock();
    core.sleeping.remove(wake_tick, tid);
    if let Some(thread) = core.thread(tid) {
        thread.set_wake_tick(0);
    }
}

/// Timer-tick hook, called from the timer IRQ with interrupts disabled.
pub fn timer_tick(now: u64) {
    if !SCHEDULING_ENABLED.load(Ordering::Acquire) {
        return;
    }
    let mut core = SCHED.lock();
    if core.tick(now) {
        NEED_RESCHED.store(true, Ordering::Release);
    }
}

/// Perform a pending preemption. Called by the timer IRQ handler after EOI,
/// and safe to call from thread context as well.
pub fn preempt_point() {
    if STARTED.load(Ordering::Acquire) && NEED_RESCHED.swap(false, Ordering::AcqRel) {
        reschedule();
    }
}

/// Core scheduling decision plus context switch.
///
/// The running thread is re-enqueued (yield), or left wherever its state
/// says it belongs (blocked, sleeping, exiting); the highest-priority ready
/// thread -- or the idle thread -- takes over.
pub fn reschedule() {
    let was_enabled = arch::irq_save();

    let mut switch_args: Option<(*mut u64, u64)> = None;
    {
        let mut core = SCHED.lock();
        if core.current == 0 {
            drop(core);
            arch::irq_restore(was_enabled);
            return;
        }

        let cur_tid = core.current;
        let current = core.thread(cur_tid);

        if let Some(current) = &current {
            if current.state() == ThreadState::Running {
                if cur_tid == core.idle {
                    // The idle thread parks outside the ready queue.
                    current.set_state(ThreadState::Ready);
                } else {
                    core.enqueue_ready(current);
                }
            }
        }

        let next_tid = core.pick_next();
        if next_tid == cur_tid {
            if let Some(current) = &current {
                current.set_state(ThreadState::Running);
            }
            core.slice_ticks = 0;
        } else {
            let next = match core.thread(next_tid) {
                Some(next) => next,
                // A vanished ready thread is a scheduler bug, not a
                // recoverable condition.
                None => panic!("ready queue held dead tid {}", next_tid),
            };
            next.set_state(ThreadState::Running);
            core.current = next_tid;
            core.slice_ticks = 0;
            CURRENT_TID.store(next_tid, Ordering::Release);

            #[cfg(target_os = "none")]
            if next.stack_top() != 0 {
                crate::arch::x86_64::gdt::set_kernel_stack(next.stack_top());
            }

            if let Some(current) = &current {
                // SAFETY: Both context cells belong to registry-owned
                // records; the outgoing thread is about to stop running and
                // the incoming one is off-CPU, so the scheduler (interrupts
                // disabled, lock held for the decision) is the only accessor.
                unsafe {
                    let old_slot = &mut (*current.context.get()).rsp as *mut u64;
                    let new_rsp = (*next.context.get()).rsp;
                    switch_args = Some((old_slot, new_rsp));
                }
            }
        }
    }

    if let Some((old_slot, new_rsp)) = switch_args {
        // SAFETY: Interrupts are disabled; old_slot and new_rsp were derived
        // from live thread records under the scheduler lock, and new_rsp
        // points at a SwitchFrame built by seed_stack or a previous switch.
        unsafe {
            crate::arch::x86_64::context::context_switch(old_slot, new_rsp);
        }
    }

    arch::irq_restore(was_enabled);
}

/// The reaper: frees stacks and records of exited threads.
///
/// Runs at high priority so dead stacks are not kept around longer than a
/// wake-up latency.
fn reaper_main(_arg: usize) {
    loop {
        REAPER_SEM.wait();

        loop {
            let victim = {
                let mut core = SCHED.lock();
                match core.reap_list.pop() {
                    Some(tid) => {
                        let record = core.threads.remove(&tid);
                        if let Some(record) = &record {
                            record.set_state(ThreadState::Dead);
                        }
                        record
                    }
                    None => None,
                }
            };
            match victim {
                // Dropped here, outside the lock: the stack and record go
                // with the last Arc (joiners may briefly hold clones).
                Some(record) => {
                    log::debug!(target: "sched", "reaped '{}' tid {}", record.name, record.tid);
                }
                None => break,
            }
        }
    }
}

/// Number of live thread records (diagnostics).
pub fn thread_count() -> usize {
    SCHED.lock().threads.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn test_thread(core: &mut SchedCore, tid: ThreadId, priority: Priority) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(
            tid,
            tid.to_string(),
            priority,
            KernelStack::new(4096),
        ));
        core.threads.insert(tid, thread.clone());
        thread
    }

    #[test]
    fn higher_band_scheduled_first() {
        let mut core = SchedCore::new();
        let a = test_thread(&mut core, 1, Priority::Normal);
        let b = test_thread(&mut core, 2, Priority::High);
        core.enqueue_ready(&a);
        core.enqueue_ready(&b);

        // First pick is B despite A being enqueued first.
        assert_eq!(core.pick_next(), 2);
        assert_eq!(core.pick_next(), 1);
    }

    #[test]
    fn idle_picked_when_nothing_ready() {
        let mut core = SchedCore::new();
        core.idle = 99;
        assert_eq!(core.pick_next(), 99);
    }

    #[test]
    fn tick_wakes_due_sleepers() {
        let mut core = SchedCore::new();
        let t = test_thread(&mut core, 5, Priority::Normal);
        t.set_state(ThreadState::Sleeping);
        t.set_wake_tick(100);
        core.sleeping.insert(100, 5);

        assert_eq!(core.wake_due(99), 0);
        assert_eq!(t.state(), ThreadState::Sleeping);

        assert_eq!(core.wake_due(100), 1);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(core.ready.dequeue(), Some(5));
    }

    #[test]
    fn tick_preempts_for_equal_priority() {
        let mut core = SchedCore::new();
        core.idle = 1;
        test_thread(&mut core, 1, Priority::Background);
        let running = test_thread(&mut core, 2, Priority::Normal);
        let contender = test_thread(&mut core, 3, Priority::Normal);

        running.set_state(ThreadState::Running);
        core.current = 2;
        core.enqueue_ready(&contender);

        // Slice of one tick: the very next tick demands a switch.
        assert!(core.tick(1));
    }

    #[test]
    fn tick_does_not_preempt_for_lower_priority() {
        let mut core = SchedCore::new();
        core.idle = 1;
        test_thread(&mut core, 1, Priority::Background);
        let running = test_thread(&mut core, 2, Priority::High);
        let lower = test_thread(&mut core, 3, Priority::Normal);

        running.set_state(ThreadState::Running);
        core.current = 2;
        core.enqueue_ready(&lower);

        assert!(!core.tick(1));
        assert!(!core.tick(2));
    }

    #[test]
    fn idle_preempted_as_soon_as_work_exists() {
        let mut core = SchedCore::new();
        core.idle = 1;
        let idle = test_thread(&mut core, 1, Priority::Background);
        idle.set_state(ThreadState::Running);
        core.current = 1;

        assert!(!core.tick(1));

        let worker = test_thread(&mut core, 2, Priority::Low);
        core.enqueue_ready(&worker);
        assert!(core.tick(2));
    }

    #[test]
    fn stale_sleep_entry_for_woken_thread_is_ignored() {
        let mut core = SchedCore::new();
        let t = test_thread(&mut core, 4, Priority::Normal);
        // Thread was signaled before the timeout: it is already running.
        t.set_state(ThreadState::Running);
        core.sleeping.insert(50, 4);

        assert_eq!(core.wake_due(60), 0);
        assert!(core.ready.is_empty());
    }

    #[test]
    fn blocked_timed_waiter_woken_by_tick() {
        let mut core = SchedCore::new();
        let t = test_thread(&mut core, 6, Priority::Normal);
        t.set_state(ThreadState::Blocked);
        t.set_wake_tick(10);
        core.sleeping.insert(10, 6);

        assert_eq!(core.wake_due(10), 1);
        assert_eq!(t.state(), ThreadState::Ready);
    }
}
