//! Coroutines and generators. A coroutine owns a guarded stack and two
//! machine contexts: `resume_ctx` re-enters the body at its last suspension
//! point, `exit_ctx` takes the final switch back to the scheduler when the
//! body completes. Peers wake a coroutine by signalling its eventfd; the
//! scheduler notices the readable descriptor on the next tick.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::ptr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::warn;

use crate::context::{self, Context};
use crate::error::Error;
use crate::event::{EventFd, TimerFd};
use crate::sched::{CoroutineScheduler, SchedCore};
use crate::stack::Stack;

pub const DEFAULT_STACK_SIZE: usize = 32 * 1024;

/// Lifecycle of a coroutine. Exactly one coroutine is Running at any time;
/// Dead is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Ready,
    Running,
    Yielded,
    Waiting,
    Dead,
}

/// Construction options. `user_data` is an opaque pointer the runtime never
/// dereferences.
#[derive(Debug)]
pub struct CoroutineOpts {
    pub name: Option<String>,
    pub autostart: bool,
    pub stack_size: usize,
    pub user_data: *mut c_void,
}

impl Default for CoroutineOpts {
    fn default() -> Self {
        Self {
            name: None,
            autostart: true,
            stack_size: DEFAULT_STACK_SIZE,
            user_data: ptr::null_mut(),
        }
    }
}

/// A stackful unit of cooperative execution. Constructed against a
/// scheduler, which owns it (as `Rc`) until it dies or is removed.
pub struct Coroutine {
    sched: Weak<SchedCore>,
    self_weak: Weak<Coroutine>,
    id: u32,
    name: RefCell<String>,
    user_data: Cell<*mut c_void>,
    body: RefCell<Option<Box<dyn FnOnce(&Coroutine)>>>,
    pub(crate) state: Cell<State>,
    pub(crate) stack: Stack,
    pub(crate) resume_ctx: UnsafeCell<Context>,
    exit_ctx: UnsafeCell<Context>,
    pub(crate) first_resume: Cell<bool>,
    pub(crate) event: EventFd,
    pub(crate) wait_fds: RefCell<Vec<libc::pollfd>>,
    timer: RefCell<Option<TimerFd>>,
    caller: RefCell<Option<Weak<Coroutine>>>,
    result_cell: Cell<*mut c_void>,
    pub(crate) last_tick: Cell<u64>,
    to_string_cb: RefCell<Option<Box<dyn Fn() -> String>>>,
}

impl Coroutine {
    /// Creates a coroutine with default options (autostarted, 32 KiB
    /// stack, name `co-<id>`).
    pub fn new<F>(sched: &CoroutineScheduler, body: F) -> Result<Rc<Coroutine>, Error>
    where
        F: FnOnce(&Coroutine) + 'static,
    {
        Self::with_opts(sched, body, CoroutineOpts::default())
    }

    pub fn with_opts<F>(
        sched: &CoroutineScheduler,
        body: F,
        opts: CoroutineOpts,
    ) -> Result<Rc<Coroutine>, Error>
    where
        F: FnOnce(&Coroutine) + 'static,
    {
        Self::build(sched.core(), Box::new(body), opts)
    }

    pub(crate) fn build(
        core: &Rc<SchedCore>,
        body: Box<dyn FnOnce(&Coroutine)>,
        opts: CoroutineOpts,
    ) -> Result<Rc<Coroutine>, Error> {
        let stack = Stack::new(opts.stack_size)?;
        let event = EventFd::new().map_err(Error::EventFd)?;
        let id = core.allocate_id();
        let name = opts.name.unwrap_or_else(|| format!("co-{id}"));
        let co = Rc::new_cyclic(|weak| Coroutine {
            sched: Rc::downgrade(core),
            self_weak: weak.clone(),
            id,
            name: RefCell::new(name),
            user_data: Cell::new(opts.user_data),
            body: RefCell::new(Some(body)),
            state: Cell::new(State::New),
            stack,
            resume_ctx: UnsafeCell::new(Context::new()),
            exit_ctx: UnsafeCell::new(Context::new()),
            first_resume: Cell::new(true),
            event,
            wait_fds: RefCell::new(Vec::new()),
            timer: RefCell::new(None),
            caller: RefCell::new(None),
            result_cell: Cell::new(ptr::null_mut()),
            last_tick: Cell::new(0),
            to_string_cb: RefCell::new(None),
        });
        core.register(&co);
        if opts.autostart {
            co.start();
        }
        Ok(co)
    }

    /// Makes a New coroutine runnable. Idempotent; a no-op in any other
    /// state.
    pub fn start(&self) {
        if self.state.get() == State::New {
            self.state.set(State::Ready);
            self.event.signal();
        }
    }

    /// Hands control back to the scheduler, leaving this coroutine
    /// runnable again on a later tick. Only the running coroutine may call
    /// this.
    pub fn yield_now(&self) {
        self.assert_running("yield_now");
        self.state.set(State::Yielded);
        self.event.signal();
        self.suspend();
    }

    /// Waits for `fd` to become ready for `events`. Returns the descriptor
    /// that ended the wait, or `None` if the timeout elapsed first.
    pub fn wait(
        &self,
        fd: RawFd,
        events: libc::c_short,
        timeout: Option<Duration>,
    ) -> Option<RawFd> {
        self.wait_many(
            &[libc::pollfd {
                fd,
                events,
                revents: 0,
            }],
            timeout,
        )
    }

    /// `wait` for an already-filled pollfd entry.
    pub fn wait_pollfd(&self, fd: libc::pollfd, timeout: Option<Duration>) -> Option<RawFd> {
        self.wait_many(&[fd], timeout)
    }

    /// Waits for any entry of a pollfd set; returns the descriptor that
    /// became ready, or `None` on timeout. The enrolled descriptors must
    /// not be mutated while suspended.
    pub fn wait_many(&self, fds: &[libc::pollfd], timeout: Option<Duration>) -> Option<RawFd> {
        self.assert_running("wait");
        let timer_fd = {
            let mut wait = self.wait_fds.borrow_mut();
            wait.clear();
            wait.extend_from_slice(fds);
            match timeout {
                Some(d) => {
                    // mid-wait descriptor exhaustion has no Result channel
                    // to a caller; treat it like any other misuse and abort
                    let timer = TimerFd::new(d).expect("timer descriptor creation failed");
                    let raw = timer.raw_fd();
                    wait.push(timer.pollfd());
                    *self.timer.borrow_mut() = Some(timer);
                    Some(raw)
                }
                None => {
                    assert!(!fds.is_empty(), "wait with no descriptors and no timeout");
                    None
                }
            }
        };
        self.state.set(State::Waiting);
        let woke = self.suspend() as RawFd;
        // the timer is released whichever way the wait ended
        self.wait_fds.borrow_mut().clear();
        self.timer.borrow_mut().take();
        match timer_fd {
            Some(t) if woke == t => None,
            _ => Some(woke),
        }
    }

    /// Suspends for at least `timeout`.
    pub fn sleep(&self, timeout: Duration) {
        let woke = self.wait_many(&[], Some(timeout));
        debug_assert!(woke.is_none());
    }

    /// Runs `gen` until it yields a value or dies. A dead generator is not
    /// resumed; the call returns `T::default()` immediately.
    pub fn call<T: Default>(&self, gen: &Generator<T>) -> T {
        self.assert_running("call");
        if !gen.co.is_alive() {
            return T::default();
        }
        assert!(
            gen.co.caller.borrow().is_none(),
            "generator {} is already being called",
            gen.co.id
        );
        // a Waiting callee has real descriptors enrolled in the poll set;
        // signalling its eventfd now would end that wait with a descriptor
        // its body never asked for
        assert!(
            gen.co.state.get() != State::Waiting,
            "generator {} is waiting on descriptors and cannot be called",
            gen.co.id
        );
        let mut slot = T::default();
        gen.co.result_cell.set(&mut slot as *mut T as *mut c_void);
        *gen.co.caller.borrow_mut() = Some(self.self_weak.clone());
        if gen.co.state.get() == State::New {
            gen.co.start();
        } else {
            gen.co.wake();
        }
        // awaiting this callee specifically: suspend without a self-signal,
        // its yield_value (or death) wakes us
        self.state.set(State::Yielded);
        self.suspend();
        gen.co.result_cell.set(ptr::null_mut());
        *gen.co.caller.borrow_mut() = None;
        slot
    }

    /// Ends this coroutine. Equivalent to returning from the body.
    pub fn exit(&self) -> ! {
        self.assert_running("exit");
        self.finish()
    }

    pub fn is_alive(&self) -> bool {
        self.state.get() != State::Dead
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Scheduler tick at which this coroutine last ran.
    pub fn last_tick(&self) -> u64 {
        self.last_tick.get()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.borrow_mut() = name.into();
    }

    pub fn user_data(&self) -> *mut c_void {
        self.user_data.get()
    }

    pub fn set_user_data(&self, user_data: *mut c_void) {
        self.user_data.set(user_data);
    }

    /// Replaces the default `Display` line with the callback's output.
    pub fn set_to_string_callback(&self, cb: impl Fn() -> String + 'static) {
        *self.to_string_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn show(&self) {
        eprintln!("{self}");
    }

    fn assert_running(&self, what: &str) {
        assert!(
            self.state.get() == State::Running,
            "{what} called outside the running coroutine ({} is {:?})",
            self.name.borrow(),
            self.state.get()
        );
    }

    /// Wakes a suspended peer: Yielded becomes Ready, and the eventfd makes
    /// it runnable on the next tick.
    pub(crate) fn wake(&self) {
        if self.state.get() == State::Yielded {
            self.state.set(State::Ready);
        }
        self.event.signal();
    }

    pub(crate) fn core(&self) -> Rc<SchedCore> {
        self.sched
            .upgrade()
            .expect("scheduler dropped while coroutine still scheduled")
    }

    fn self_rc(&self) -> Rc<Coroutine> {
        self.self_weak
            .upgrade()
            .expect("coroutine self reference gone")
    }

    /// Switches to the scheduler; returns the value the scheduler passes
    /// when it next resumes us (for waits, the descriptor that woke us).
    pub(crate) fn suspend(&self) -> i64 {
        let core = self.core();
        unsafe { context::switch(self.resume_ctx.get(), core.yield_ctx.get(), 1) }
    }

    fn finish(&self) -> ! {
        self.state.set(State::Dead);
        let caller = self.caller.borrow_mut().take().and_then(|w| w.upgrade());
        if let Some(caller) = caller {
            // a caller blocked in call() must not outlive our death
            caller.wake();
        }
        let core = self.core();
        unsafe { context::switch(self.exit_ctx.get(), core.yield_ctx.get(), 1) };
        unreachable!("dead coroutine resumed")
    }
}

impl fmt::Display for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cb) = &*self.to_string_cb.borrow() {
            return f.write_str(&cb());
        }
        write!(
            f,
            "co {} [{}]: {:?}, last tick {}, waiting on {} fds",
            self.id,
            self.name.borrow(),
            self.state.get(),
            self.last_tick.get(),
            self.wait_fds.borrow().len(),
        )?;
        let suspended = matches!(self.state.get(), State::Yielded | State::Waiting);
        if suspended && !self.first_resume.get() {
            if let Some(sp) = context::stack_pointer(unsafe { &*self.resume_ctx.get() }) {
                write!(f, ", sp {sp:#x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name.borrow())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let state = self.state.get();
        if state != State::Dead && state != State::New {
            // the suspended stack is unmapped without unwinding; anything
            // the body still holds leaks
            warn!("{} dropped while {:?}", self.name.borrow(), state);
        }
    }
}

thread_local! {
    // bootstrap slot for first entry: a stack switch clobbers argument
    // registers, so the trampoline takes its coroutine from here
    static BOOTSTRAP: Cell<*const Coroutine> = const { Cell::new(ptr::null()) };
}

pub(crate) fn set_bootstrap(co: *const Coroutine) {
    BOOTSTRAP.with(|slot| slot.set(co));
}

/// First entry of every coroutine: runs the body on the coroutine's own
/// stack, then takes the exit switch. Never returns.
pub(crate) extern "C" fn trampoline() {
    let co = BOOTSTRAP.with(|slot| slot.replace(ptr::null()));
    assert!(!co.is_null(), "trampoline entered without a pending coroutine");
    // the scheduler's live list keeps the coroutine alive while it runs
    let co = unsafe { &*co };
    let body = co
        .body
        .borrow_mut()
        .take()
        .expect("coroutine body already consumed");
    body(co);
    co.finish()
}

/// A coroutine whose body delivers typed values to a calling coroutine.
/// Never autostarted; driven by `Coroutine::call`.
pub struct Generator<T> {
    pub(crate) co: Rc<Coroutine>,
    _result: PhantomData<fn(T)>,
}

impl<T: Default + 'static> Generator<T> {
    pub fn new<F>(sched: &CoroutineScheduler, body: F) -> Result<Self, Error>
    where
        F: FnOnce(&Generator<T>) + 'static,
    {
        Self::with_opts(sched, body, CoroutineOpts::default())
    }

    pub fn with_opts<F>(
        sched: &CoroutineScheduler,
        body: F,
        mut opts: CoroutineOpts,
    ) -> Result<Self, Error>
    where
        F: FnOnce(&Generator<T>) + 'static,
    {
        opts.autostart = false;
        // the scheduler sees a uniform coroutine body; the adapter rebuilds
        // the typed view from the coroutine's self reference
        let adapter = move |c: &Coroutine| {
            let view = Generator {
                co: c.self_rc(),
                _result: PhantomData,
            };
            body(&view);
        };
        let co = Coroutine::build(sched.core(), Box::new(adapter), opts)?;
        Ok(Self {
            co,
            _result: PhantomData,
        })
    }

    /// Delivers `value` to the coroutine blocked in `call`, then suspends
    /// until the next call. With no call in progress the value is
    /// discarded.
    pub fn yield_value(&self, value: T) {
        self.co.assert_running("yield_value");
        let slot = self.co.result_cell.get() as *mut T;
        if !slot.is_null() {
            unsafe { *slot = value };
        }
        let caller = self.co.caller.borrow().as_ref().and_then(|w| w.upgrade());
        if let Some(caller) = caller {
            caller.wake();
        }
        self.co.state.set(State::Yielded);
        self.co.suspend();
    }
}

impl<T> Clone for Generator<T> {
    fn clone(&self) -> Self {
        Self {
            co: self.co.clone(),
            _result: PhantomData,
        }
    }
}

impl<T> Deref for Generator<T> {
    type Target = Coroutine;

    fn deref(&self) -> &Coroutine {
        &self.co
    }
}
