// x86_64 System V backend. Only the callee-saved registers and the stack
// pointer survive a switch; everything else is dead across the call per the
// C ABI, which is what makes a plain `ret` into the restored stack valid.

use std::arch::naked_asm;

use crate::stack::Stack;

#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }
}

/// # Safety
/// `save` must point to writable context storage and `resume` to a context
/// produced by `prepare` or by an earlier `switch`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(
    _save: *mut Context,
    _resume: *const Context,
    _value: i64,
) -> i64 {
    naked_asm!(
        // save into rdi
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // restore from rsi
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // the passed value becomes the resumed switch's return value
        "mov rax, rdx",
        // fresh context: jumps to the entry slot prepare() stored.
        // suspended context: returns into its switch call.
        "ret",
    )
}

/// # Safety
/// `ctx` must point to writable context storage; `stack` must outlive every
/// switch into `ctx`.
pub unsafe fn prepare(ctx: *mut Context, stack: &Stack, entry: extern "C" fn()) {
    // ret pops the entry address, leaving rsp ≡ 8 (mod 16) as at any
    // function entry. rbp stays zero so backtraces terminate here.
    let sp = stack.top().sub(16) as *mut u64;
    sp.write(entry as usize as u64);
    ctx.write(Context {
        rsp: sp as u64,
        ..Context::default()
    });
}

pub fn stack_pointer(ctx: &Context) -> Option<usize> {
    match ctx.rsp {
        0 => None,
        sp => Some(sp as usize),
    }
}
