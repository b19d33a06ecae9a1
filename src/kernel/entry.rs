// The boot processor starts here: the multiboot loader drops us into
// 32-bit protected mode with paging off. Turn on a provisional page
// table (entrypgdir, in main.rs) that maps the first 4MB both at
// virtual 0 and at KERNBASE, switch to a real stack, and jump up to
// main() at high addresses.

use core::arch::global_asm;

global_asm!(
    r#"
# Multiboot header. Data to direct multiboot loader.
.p2align 2
.section .multiboot
.globl multiboot_header
multiboot_header:
        .long 0x1BADB002                # magic
        .long 0                         # flags
        .long (-0x1BADB002)             # checksum

.section .text

# By convention, the _start symbol specifies the ELF entry point.
# Since we haven't set up virtual memory yet, our entry point is
# the physical address of entry.
.globl _start
.set _start, entry - 0x80000000

# Entering boot processor, with paging off.
.globl entry
entry:
        # Turn on page size extension for 4Mbyte pages
        movl    %cr4, %eax
        orl     $0x10, %eax             # CR4_PSE
        movl    %eax, %cr4
        # Set page directory
        movl    $(entrypgdir - 0x80000000), %eax
        movl    %eax, %cr3
        # Turn on paging.
        movl    %cr0, %eax
        orl     $0x80010000, %eax       # CR0_PG | CR0_WP
        movl    %eax, %cr0

        # Set up the stack pointer.
        movl    $(stack + 4096), %esp

        # Jump to main(), and switch to executing at
        # high addresses. The indirect call is needed because
        # the assembler produces a PC-relative instruction
        # for a direct jump.
        mov     $main, %eax
        jmp     *%eax

.comm stack, 4096
"#,
    options(att_syntax)
);
