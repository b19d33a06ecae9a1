// Context switch between kernel threads.
//
//   swtch(old, new);
//
// Saves the current registers on the stack, creating a Context, and
// stores its address in *old; then switches to new's stack and pops
// the registers saved there. The eip is not saved explicitly: it sits
// on the stack from the call instruction (or is planted there by
// alloc_proc for a newborn process).

use crate::proc::Context;
use core::arch::global_asm;

global_asm!(
    r#"
.section .text
.globl swtch
swtch:
        mov eax, [esp + 4]
        mov edx, [esp + 8]

        # Save old callee-saved registers
        push ebp
        push ebx
        push esi
        push edi

        # Switch stacks
        mov [eax], esp
        mov esp, edx

        # Load new callee-saved registers
        pop edi
        pop esi
        pop ebx
        pop ebp
        ret
"#
);

extern "C" {
    pub fn swtch(old: *mut *mut Context, new: *mut Context);
}
