//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register frame per the System V AMD64 ABI.
///
/// Offsets are load-bearing: the assembly below addresses fields by
/// constant displacement.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prime a fresh fiber frame.
///
/// The first switch into `ctx` jumps to the trampoline with `entry_fn` in
/// r12 and `entry_arg` in r13.
///
/// # Safety
///
/// `ctx` must point to writable `Context` memory and `stack_top` must be
/// the top of a live stack mapping.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned at the trampoline's `call`, so the entry function
    // observes the alignment an ordinary call would give it.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame of every fiber: invoke the entry function, then fall into
/// the termination routine. Control never returns here.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finished}",
        "ud2",
        finished = sym crate::fiber::fiber_finished,
    );
}

/// Save the current callee-saved registers into `save` and restore `load`.
///
/// Returns (to the caller of `context_switch`) only when some later switch
/// restores `save`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` frames; `load` must have
/// been primed by `init_context` or filled by a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save into save (rdi). rsp still includes our return address;
        // the resume point below just rets through it.
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Restore from load (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved side
        "2:",
        "ret",
    );
}
