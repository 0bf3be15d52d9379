//! VM-entry/exit trampolines and the vCPU run loop.
//!
//! `asm_vmentry`/`asm_vmexit` are a matched pair: entry pushes callee-saved registers and a
//! pointer to `GuestRegisters` that exit consumes to find its way back to the same stack frame.
//! The field order in `GuestRegisters` and the push/pop order in the trampoline must agree
//! exactly — a mismatch here silently corrupts guest state instead of failing loudly.

use core::arch::global_asm;
use core::mem::offset_of;
use core::sync::atomic::{AtomicBool, Ordering};

use super::fields as f;
use super::vmcs::{vmread, vmwrite, VmcsRegion, VmxError};

pub const HOST_STACK_SIZE: usize = 0x1000;

/// Guest general-purpose and XMM register save area. `rax` is first since the trampoline loads
/// it last on entry and saves it first on exit.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub xmm: [u128; 8],
}

/// Whether a VMLAUNCH has already succeeded on the current VMCS. Intel requires VMRESUME, not
/// another VMLAUNCH, on every subsequent entry to the same VMCS.
static LAUNCH_DONE: AtomicBool = AtomicBool::new(false);

global_asm! {
    r#"
    .section .text

    .global asm_vmentry
    asm_vmentry:
        push rbp
        push r15
        push r14
        push r13
        push r12
        push rbx

        push rdi

        mov rdi, rsp
        call vmentry_set_host_rsp

        mov rax, [rsp]
        mov rbx, [rax + {off_rbx}]
        mov rcx, [rax + {off_rcx}]
        mov rdx, [rax + {off_rdx}]
        mov rsi, [rax + {off_rsi}]
        mov rdi, [rax + {off_rdi}]
        mov rbp, [rax + {off_rbp}]
        mov r8,  [rax + {off_r8}]
        mov r9,  [rax + {off_r9}]
        mov r10, [rax + {off_r10}]
        mov r11, [rax + {off_r11}]
        mov r12, [rax + {off_r12}]
        mov r13, [rax + {off_r13}]
        mov r14, [rax + {off_r14}]
        mov r15, [rax + {off_r15}]

        movdqu xmm0, [rax + {off_xmm} + 0*16]
        movdqu xmm1, [rax + {off_xmm} + 1*16]
        movdqu xmm2, [rax + {off_xmm} + 2*16]
        movdqu xmm3, [rax + {off_xmm} + 3*16]
        movdqu xmm4, [rax + {off_xmm} + 4*16]
        movdqu xmm5, [rax + {off_xmm} + 5*16]
        movdqu xmm6, [rax + {off_xmm} + 6*16]
        movdqu xmm7, [rax + {off_xmm} + 7*16]

        mov rax, [rax + {off_rax}]

        cmp byte ptr [rip + LAUNCH_DONE], 0
        je 2f
        vmresume
        jmp 3f
    2:
        vmlaunch
    3:
        pop rdi
        pop rbx
        pop r12
        pop r13
        pop r14
        pop r15
        pop rbp
        mov rax, 1
        ret

    .global asm_vmexit
    asm_vmexit:
        cli

        push rax
        mov rax, [rsp + 8]
        mov [rax + {off_rbx}], rbx
        mov rbx, [rsp + 8]
        pop qword ptr [rbx + {off_rax}]

        mov [rbx + {off_rcx}], rcx
        mov [rbx + {off_rdx}], rdx
        mov [rbx + {off_rsi}], rsi
        mov [rbx + {off_rdi}], rdi
        mov [rbx + {off_rbp}], rbp
        mov [rbx + {off_r8}],  r8
        mov [rbx + {off_r9}],  r9
        mov [rbx + {off_r10}], r10
        mov [rbx + {off_r11}], r11
        mov [rbx + {off_r12}], r12
        mov [rbx + {off_r13}], r13
        mov [rbx + {off_r14}], r14
        mov [rbx + {off_r15}], r15

        movdqu [rbx + {off_xmm} + 0*16], xmm0
        movdqu [rbx + {off_xmm} + 1*16], xmm1
        movdqu [rbx + {off_xmm} + 2*16], xmm2
        movdqu [rbx + {off_xmm} + 3*16], xmm3
        movdqu [rbx + {off_xmm} + 4*16], xmm4
        movdqu [rbx + {off_xmm} + 5*16], xmm5
        movdqu [rbx + {off_xmm} + 6*16], xmm6
        movdqu [rbx + {off_xmm} + 7*16], xmm7

        add rsp, 8

        pop rbx
        pop r12
        pop r13
        pop r14
        pop r15
        pop rbp
        xor rax, rax
        ret
    "#,
    off_rax = const offset_of!(GuestRegisters, rax),
    off_rbx = const offset_of!(GuestRegisters, rbx),
    off_rcx = const offset_of!(GuestRegisters, rcx),
    off_rdx = const offset_of!(GuestRegisters, rdx),
    off_rsi = const offset_of!(GuestRegisters, rsi),
    off_rdi = const offset_of!(GuestRegisters, rdi),
    off_rbp = const offset_of!(GuestRegisters, rbp),
    off_r8 = const offset_of!(GuestRegisters, r8),
    off_r9 = const offset_of!(GuestRegisters, r9),
    off_r10 = const offset_of!(GuestRegisters, r10),
    off_r11 = const offset_of!(GuestRegisters, r11),
    off_r12 = const offset_of!(GuestRegisters, r12),
    off_r13 = const offset_of!(GuestRegisters, r13),
    off_r14 = const offset_of!(GuestRegisters, r14),
    off_r15 = const offset_of!(GuestRegisters, r15),
    off_xmm = const offset_of!(GuestRegisters, xmm),
}

unsafe extern "C" {
    /// Enters the guest. Returns 1 if VMLAUNCH/VMRESUME itself failed (CF or ZF set, VM entry
    /// never happened); does not return at all on success — control resumes at `asm_vmexit`
    /// after the next VM-exit, which falls through to the same return address with RAX=0.
    pub fn asm_vmentry(guest_regs: *mut GuestRegisters) -> u64;
    /// The VM-exit landing pad, installed as HOST_RIP. Never called directly from Rust.
    pub(crate) fn asm_vmexit();
}

/// Writes the current RSP into `HOST_RSP`, since it varies per `asm_vmentry` call site (the
/// trampoline is re-entered from a fresh stack frame on every call).
#[unsafe(no_mangle)]
extern "C" fn vmentry_set_host_rsp(rsp: u64) {
    unsafe {
        let _ = vmwrite(f::HOST_RSP, rsp);
    }
}

/// A decoded VM-exit: the basic exit reason and, for instructions with a defined length, how far
/// to advance `GUEST_RIP` to skip past it.
#[derive(Debug, Clone, Copy)]
pub struct VmExit {
    pub basic_reason: u16,
    pub instruction_len: u32,
}

const EXIT_REASON_HLT: u16 = 12;

/// Reads `VM_EXIT_REASON`/`VM_EXIT_INSTRUCTION_LEN` and dispatches on the basic reason. HLT
/// advances past the instruction; anything else is unimplemented and the caller halts.
///
/// # Safety
/// A VMCS must be current, and a VM-exit must have just occurred.
pub unsafe fn vmexit_dispatch(exit: VmExit) -> Result<(), VmxError> {
    if exit.basic_reason == EXIT_REASON_HLT {
        let rip = unsafe { vmread(f::GUEST_RIP)? };
        unsafe {
            vmwrite(f::GUEST_RIP, rip + u64::from(exit.instruction_len))?;
        }
        return Ok(());
    }

    logger::log_err!("unhandled VM-exit reason {}", exit.basic_reason);
    Err(VmxError::Unknown(u64::from(exit.basic_reason)))
}

/// Runs a vCPU: repeatedly enters the guest and handles each VM-exit until one is unimplemented
/// or VM entry itself fails.
///
/// # Safety
/// `vmcs` must already be built (see `builder::build`) and current.
pub unsafe fn run(_vmcs: &VmcsRegion, guest_regs: &mut GuestRegisters) -> VmxError {
    unsafe {
        loop {
            let entry_failed = asm_vmentry(guest_regs) != 0;
            if entry_failed {
                let code = vmread(f::VM_INSTRUCTION_ERROR).unwrap_or(0);
                logger::log_err!("VM entry failed, instruction error {}", code);
                return VmxError::from_code(code);
            }

            LAUNCH_DONE.store(true, Ordering::Relaxed);

            let reason = match vmread(f::VM_EXIT_REASON) {
                Ok(v) => v,
                Err(e) => return e,
            };
            let len = match vmread(f::VM_EXIT_INSTRUCTION_LEN) {
                Ok(v) => v,
                Err(e) => return e,
            };

            let exit = VmExit {
                basic_reason: (reason & 0xFFFF) as u16,
                instruction_len: len as u32,
            };

            if let Err(e) = vmexit_dispatch(exit) {
                return e;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[macros::test_fn]
    fn test_guest_registers_rax_is_first_field() {
        assert_eq!(offset_of!(GuestRegisters, rax), 0);
    }

    #[macros::test_fn]
    fn test_guest_registers_size_matches_16_gprs_plus_xmm() {
        // 15 u64 GPRs + 8 u128 XMM registers.
        assert_eq!(core::mem::size_of::<GuestRegisters>(), 15 * 8 + 8 * 16);
    }
}
