//! The tick loop. One tick = build the poll set, block in poll(2), resume
//! exactly one runnable coroutine. Entry 0 of every poll set is the
//! scheduler's own interrupt eventfd; stop requests and out-of-frame
//! coroutine additions signal it so a blocked poll returns promptly.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::bitset::BitSet;
use crate::context::{self, Context};
use crate::coro::{self, Coroutine, State};
use crate::error::Error;
use crate::event::{self, EventFd};

/// The poll set for one tick: `pollfds` is handed to poll(2), `owners`
/// maps each entry back to the coroutine that enrolled it. Index 0 is the
/// scheduler interrupt and owns no coroutine.
#[derive(Default)]
pub struct PollState {
    pub pollfds: Vec<libc::pollfd>,
    owners: Vec<Option<Rc<Coroutine>>>,
}

impl PollState {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self) {
        self.pollfds.clear();
        self.owners.clear();
    }

    fn push(&mut self, mut pfd: libc::pollfd, owner: Option<Rc<Coroutine>>) {
        pfd.revents = 0;
        self.pollfds.push(pfd);
        self.owners.push(owner);
    }
}

/// Stops a scheduler from outside its thread: flips the shared running
/// flag and signals a dup of the interrupt descriptor.
#[derive(Debug)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    interrupt: OwnedFd,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        event::signal_raw(self.interrupt.as_raw_fd());
    }
}

pub(crate) struct SchedCore {
    coros: RefCell<Vec<Rc<Coroutine>>>,
    ids: RefCell<BitSet>,
    last_freed: Cell<Option<u32>>,
    pub(crate) yield_ctx: UnsafeCell<Context>,
    running: Arc<AtomicBool>,
    poll_state: RefCell<PollState>,
    interrupt: EventFd,
    tick: Cell<u64>,
    completion: RefCell<Option<Box<dyn Fn(&Rc<Coroutine>)>>>,
}

/// Owner of the live coroutines and the tick loop. A cheap `Clone` handle
/// over a shared core, so bodies can capture it to stop the scheduler or
/// spawn peers.
#[derive(Clone)]
pub struct CoroutineScheduler {
    core: Rc<SchedCore>,
}

impl CoroutineScheduler {
    pub fn new() -> Result<Self, Error> {
        let interrupt = EventFd::new().map_err(Error::EventFd)?;
        Ok(Self {
            core: Rc::new(SchedCore {
                coros: RefCell::new(Vec::new()),
                ids: RefCell::new(BitSet::new()),
                last_freed: Cell::new(None),
                yield_ctx: UnsafeCell::new(Context::new()),
                running: Arc::new(AtomicBool::new(false)),
                poll_state: RefCell::new(PollState::new()),
                interrupt,
                tick: Cell::new(0),
                completion: RefCell::new(None),
            }),
        })
    }

    /// Runs ticks until no coroutines remain or `stop` is called. The only
    /// error out of the loop is a non-EINTR poll failure.
    pub fn run(&self) -> Result<(), Error> {
        let core = &self.core;
        core.running.store(true, Ordering::SeqCst);
        debug!("scheduler running");
        loop {
            if !core.running.load(Ordering::SeqCst) || core.coros.borrow().is_empty() {
                break;
            }
            let mut state = core.poll_state.borrow_mut();
            core.build_poll_state(&mut state);
            let num_ready = event::poll(&mut state.pollfds, -1).map_err(Error::Poll)?;
            core.process_poll(&mut state, num_ready);
        }
        core.running.store(false, Ordering::SeqCst);
        debug!("scheduler finished at tick {}", core.tick.get());
        Ok(())
    }

    /// Ends the tick loop without unwinding coroutines; they keep whatever
    /// state they had. Callable from inside a body or from the embedder.
    pub fn stop(&self) {
        debug!("scheduler stop requested");
        self.core.running.store(false, Ordering::SeqCst);
        self.core.interrupt.signal();
    }

    /// A `Send` handle for stopping the scheduler from another thread.
    pub fn stop_handle(&self) -> Result<StopHandle, Error> {
        Ok(StopHandle {
            running: self.core.running.clone(),
            interrupt: self.core.interrupt.try_clone().map_err(Error::EventFd)?,
        })
    }

    pub fn start_coroutine(&self, co: &Rc<Coroutine>) {
        co.start();
    }

    /// Drops the scheduler's reference and releases the id. Reaped
    /// coroutines go through this automatically; call it yourself for
    /// coroutines that will never run again.
    pub fn remove_coroutine(&self, co: &Coroutine) {
        self.core.remove(co);
    }

    /// Fills `state` with this tick's poll set, for embedders running
    /// their own poll loop.
    pub fn get_poll_state(&self, state: &mut PollState) {
        self.core.build_poll_state(state);
    }

    /// Runs one selection + resume over a polled set. `num_ready` is the
    /// poll(2) return value.
    pub fn process_poll(&self, state: &mut PollState, num_ready: usize) {
        self.core.process_poll(state, num_ready);
    }

    /// The callback sees each Dead coroutine after it leaves the live set
    /// and before the scheduler's reference is gone, so it can keep or
    /// reclaim it.
    pub fn set_completion_callback(&self, cb: impl Fn(&Rc<Coroutine>) + 'static) {
        *self.core.completion.borrow_mut() = Some(Box::new(cb));
    }

    /// One line per live coroutine, on stderr.
    pub fn show(&self) {
        for line in self.coroutine_strings() {
            eprintln!("{line}");
        }
    }

    pub fn coroutine_strings(&self) -> Vec<String> {
        self.core.coros.borrow().iter().map(|c| c.to_string()).collect()
    }

    pub fn tick_count(&self) -> u64 {
        self.core.tick.get()
    }

    pub(crate) fn core(&self) -> &Rc<SchedCore> {
        &self.core
    }
}

impl SchedCore {
    /// Fresh ids prefer the slot just above the most recently freed one,
    /// falling back to the lowest absent id when that would grow the set.
    pub(crate) fn allocate_id(&self) -> u32 {
        let mut ids = self.ids.borrow_mut();
        let id = match self.last_freed.get() {
            Some(hint) => {
                let above = ids.lowest_absent_above(hint);
                match ids.max_present() {
                    Some(max) if above <= max => above,
                    _ => ids.lowest_absent(),
                }
            }
            None => ids.lowest_absent(),
        };
        ids.insert(id);
        id
    }

    pub(crate) fn register(&self, co: &Rc<Coroutine>) {
        debug!("registered {} (id {})", co.name(), co.id());
        self.coros.borrow_mut().push(co.clone());
        if self.running.load(Ordering::SeqCst) {
            // an add from outside the tick loop's frame must cut the
            // current poll short so the newcomer's descriptors join the set
            self.interrupt.signal();
        }
    }

    pub(crate) fn remove(&self, co: &Coroutine) {
        let mut coros = self.coros.borrow_mut();
        let before = coros.len();
        coros.retain(|c| c.id() != co.id());
        if coros.len() != before {
            self.ids.borrow_mut().remove(co.id());
            self.last_freed.set(Some(co.id()));
        }
    }

    fn build_poll_state(&self, state: &mut PollState) {
        state.clear();
        state.push(self.interrupt.pollfd(), None);
        for co in self.coros.borrow().iter() {
            if co.state() == State::Dead {
                continue;
            }
            state.push(co.event.pollfd(), Some(co.clone()));
            if co.state() == State::Waiting {
                for pfd in co.wait_fds.borrow().iter() {
                    state.push(*pfd, Some(co.clone()));
                }
            }
        }
    }

    fn process_poll(&self, state: &mut PollState, num_ready: usize) {
        if num_ready == 0 {
            return;
        }
        if state.pollfds.first().map_or(false, |p| p.revents != 0) {
            // stop or out-of-frame add: drain and rebuild, resume nobody
            trace!("interrupt signalled");
            self.interrupt.drain();
            return;
        }
        if let Some((co, fd)) = Self::choose_runnable(state, num_ready) {
            self.resume(&co, fd as i64);
        }
    }

    /// Among ready entries, the owner with the smallest last-tick wins;
    /// ties go to insertion order. The scan stops once poll's ready count
    /// is accounted for.
    fn choose_runnable(state: &PollState, num_ready: usize) -> Option<(Rc<Coroutine>, RawFd)> {
        let mut best: Option<(Rc<Coroutine>, RawFd)> = None;
        let mut seen = 0usize;
        for (i, pfd) in state.pollfds.iter().enumerate() {
            if seen >= num_ready {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            seen += 1;
            let Some(co) = &state.owners[i] else { continue };
            let better = match &best {
                None => true,
                Some((b, _)) => co.last_tick() < b.last_tick(),
            };
            if better {
                best = Some((co.clone(), pfd.fd));
            }
        }
        best
    }

    fn resume(&self, co: &Rc<Coroutine>, value: i64) {
        self.tick.set(self.tick.get() + 1);
        co.last_tick.set(self.tick.get());
        trace!("tick {}: resuming {}", self.tick.get(), co.name());
        // the wakeup is consumed by this resume
        co.event.drain();
        co.state.set(State::Running);
        unsafe {
            if co.first_resume.replace(false) {
                context::prepare(co.resume_ctx.get(), &co.stack, coro::trampoline);
                coro::set_bootstrap(Rc::as_ptr(co));
            }
            context::switch(self.yield_ctx.get(), co.resume_ctx.get(), value);
        }
        if co.state.get() == State::Dead {
            debug!("{} finished", co.name());
            self.remove(co);
            if let Some(cb) = &*self.completion.borrow() {
                cb(co);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::CoroutineOpts;

    fn manual(sched: &CoroutineScheduler) -> Rc<Coroutine> {
        Coroutine::with_opts(
            sched,
            |_| {},
            CoroutineOpts {
                autostart: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn id_reuse_prefers_slot_above_last_freed() {
        let sched = CoroutineScheduler::new().unwrap();
        let c0 = manual(&sched);
        let c1 = manual(&sched);
        let c2 = manual(&sched);
        assert_eq!((c0.id(), c1.id(), c2.id()), (0, 1, 2));

        // freeing the middle id: nothing absent above it within the set,
        // so the freed slot itself comes back
        sched.remove_coroutine(&c1);
        drop(c1);
        let c3 = manual(&sched);
        assert_eq!(c3.id(), 1);

        // freeing the top id must not grow the set
        sched.remove_coroutine(&c2);
        drop(c2);
        let c4 = manual(&sched);
        assert_eq!(c4.id(), 2);
    }

    #[test]
    fn run_with_no_coroutines_returns() {
        let sched = CoroutineScheduler::new().unwrap();
        sched.run().unwrap();
        assert_eq!(sched.tick_count(), 0);
    }

    #[test]
    fn coroutine_strings_cover_live_set() {
        let sched = CoroutineScheduler::new().unwrap();
        let co = manual(&sched);
        co.set_name("lister");
        let other = manual(&sched);
        other.set_to_string_callback(|| "custom line".to_string());

        let lines = sched.coroutine_strings();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("lister"));
        assert!(lines[0].contains("New"));
        assert_eq!(lines[1], "custom line");
    }
}
