//! Machine context save/restore, the primitive every suspension point is
//! built on.
//!
//! Two backends share one contract:
//!
//! - `switch(save, resume, value)` captures the calling context into `save`
//!   and restores `resume`; the `switch` that suspended `resume` returns
//!   `value`. The call returns whenever a later `switch` resumes `save`,
//!   yielding the value that switch passed.
//! - `prepare(ctx, stack, entry)` arms a context so the first switch into
//!   it enters `entry` at the top of `stack`. `entry` takes no arguments;
//!   whatever it needs must sit in a thread-local slot written before the
//!   switch, because a stack switch does not preserve argument registers.
//!
//! The default backend saves the callee-saved register set with a naked
//! function (x86_64 and aarch64). The `ucontext` feature swaps in System V
//! user contexts instead; sanitizers cannot follow a hand-rolled stack
//! switch, so instrumented builds should enable it. Other architectures
//! fall back to user contexts unconditionally.

#[cfg_attr(
    all(target_arch = "x86_64", not(feature = "ucontext")),
    path = "context/x86_64.rs"
)]
#[cfg_attr(
    all(target_arch = "aarch64", not(feature = "ucontext")),
    path = "context/aarch64.rs"
)]
#[cfg_attr(
    any(
        feature = "ucontext",
        not(any(target_arch = "x86_64", target_arch = "aarch64"))
    ),
    path = "context/ucontext.rs"
)]
mod imp;

pub(crate) use imp::{prepare, stack_pointer, switch, Context};

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::ptr;

    use super::{prepare, switch, Context};
    use crate::stack::Stack;

    thread_local! {
        static SLOTS: Cell<(*mut Context, *mut Context)> =
            const { Cell::new((ptr::null_mut(), ptr::null_mut())) };
    }

    extern "C" fn bouncer() {
        let (main_ctx, co_ctx) = SLOTS.with(|s| s.get());
        let got = unsafe { switch(co_ctx, main_ctx, 10) };
        unsafe { switch(co_ctx, main_ctx, got + 5) };
        unreachable!();
    }

    #[test]
    fn swap_passes_values_both_ways() {
        let stack = Stack::new(64 * 1024).unwrap();
        let mut main_ctx = Context::new();
        let mut co_ctx = Context::new();
        unsafe { prepare(&mut co_ctx, &stack, bouncer) };
        SLOTS.with(|s| {
            s.set((
                &mut main_ctx as *mut Context,
                &mut co_ctx as *mut Context,
            ))
        });

        let v1 = unsafe { switch(&mut main_ctx, &co_ctx, 0) };
        assert_eq!(v1, 10);
        // resume at the suspension point inside bouncer, not at entry
        let v2 = unsafe { switch(&mut main_ctx, &co_ctx, 3) };
        assert_eq!(v2, 8);
    }
}
