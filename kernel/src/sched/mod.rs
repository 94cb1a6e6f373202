//! Preemptive thread scheduler.
//!
//! Five priority bands with round-robin inside each, a tick-driven
//! preemption hook, a sleep queue, and join/exit lifecycle with a reaper
//! thread. See [`scheduler`] for the core loop.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use scheduler::{
    current_tid, enable_preemption, exit, init, join, join_timeout, preempt_point,
    preemption_enabled, reschedule, set_nice, set_priority, sleep_ms, sleep_until_tick, spawn,
    thread_count, timer_tick, yield_now, ThreadEntry,
};
pub use task::{Priority, Thread, ThreadId, ThreadState, DEFAULT_STACK_SIZE};
