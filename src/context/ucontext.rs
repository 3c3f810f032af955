// System V user-context backend. swapcontext carries no value, so the value
// rides in a thread-local written immediately before each switch; single
// threaded scheduling makes that race-free. glibc's ucontext_t points into
// itself after getcontext, so the struct lives in a Box and never moves.

use std::cell::Cell;
use std::ptr;

use crate::stack::Stack;

pub struct Context(Box<libc::ucontext_t>);

impl Context {
    pub fn new() -> Self {
        Self(Box::new(unsafe { std::mem::zeroed() }))
    }
}

thread_local! {
    static SWAP_VALUE: Cell<i64> = const { Cell::new(0) };
}

/// # Safety
/// `save` must point to writable context storage and `resume` to a context
/// produced by `prepare` or by an earlier `switch`.
pub unsafe fn switch(save: *mut Context, resume: *const Context, value: i64) -> i64 {
    SWAP_VALUE.with(|v| v.set(value));
    let save = (*save).0.as_mut() as *mut libc::ucontext_t;
    let resume = (*resume).0.as_ref() as *const libc::ucontext_t;
    if libc::swapcontext(save, resume) != 0 {
        panic!("swapcontext failed");
    }
    SWAP_VALUE.with(|v| v.get())
}

/// # Safety
/// `ctx` must point to writable context storage; `stack` must outlive every
/// switch into `ctx`.
pub unsafe fn prepare(ctx: *mut Context, stack: &Stack, entry: extern "C" fn()) {
    let uc = (*ctx).0.as_mut() as *mut libc::ucontext_t;
    if libc::getcontext(uc) != 0 {
        panic!("getcontext failed");
    }
    (*uc).uc_stack.ss_sp = stack.usable_base().cast();
    (*uc).uc_stack.ss_size = stack.usable_len();
    (*uc).uc_stack.ss_flags = 0;
    // transitions are explicit switches, entry never returns
    (*uc).uc_link = ptr::null_mut();
    libc::makecontext(uc, entry, 0);
}

pub fn stack_pointer(_ctx: &Context) -> Option<usize> {
    None
}
