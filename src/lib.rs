//! comux is a single-threaded stackful coroutine runtime. Each coroutine
//! owns its own call stack and suspends by swapping machine contexts; the
//! scheduler multiplexes file descriptor readiness, timers and
//! inter-coroutine wakeups over one `poll(2)` call per tick.
//!
//! ```no_run
//! use comux::{Coroutine, CoroutineScheduler};
//!
//! let sched = CoroutineScheduler::new().unwrap();
//! let _co = Coroutine::new(&sched, |c| {
//!     for _ in 0..3 {
//!         c.yield_now();
//!     }
//! })
//! .unwrap();
//! sched.run().unwrap();
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("comux needs eventfd/timerfd and only supports Linux");

mod bitset;
mod context;
mod coro;
mod error;
mod event;
mod sched;
mod stack;

pub use coro::{Coroutine, CoroutineOpts, Generator, State, DEFAULT_STACK_SIZE};
pub use error::Error;
pub use sched::{CoroutineScheduler, PollState, StopHandle};
