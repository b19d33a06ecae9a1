// Bootstrap code for the application processors.
//
// Each non-boot CPU ("AP") is started up in response to a STARTUP IPI
// from the boot CPU. Section B.4.2 of the Multi-Processor
// Specification says that the AP will start in real mode with CS:IP
// set to XY00:0000, where XY is an 8-bit value sent with the STARTUP.
// start_others() in main.rs copies these bytes to 0x7000, so every
// absolute reference below is spelled 0x7000 + (label - entryother_start).
//
// start_others() also plants three words just below 0x7000:
//   0x7000 - 4:  the top of this AP's kernel stack
//   0x7000 - 8:  the address of mpenter, jumped to once in 32-bit mode
//   0x7000 - 12: the physical address of entrypgdir
//
// This code combines elements of the boot loader and the BSP entry:
// it switches to protected mode, turns on paging with the boot page
// directory, and calls mpenter on the provided stack.

use core::arch::global_asm;

global_asm!(
    r#"
.section .rodata
.p2align 4
.code16
.globl entryother_start
entryother_start:
        cli

        xorw    %ax, %ax
        movw    %ax, %ds
        movw    %ax, %es
        movw    %ax, %ss

        lgdt    (0x7000 + gdtdesc - entryother_start)
        movl    %cr0, %eax
        orl     $0x1, %eax              # CR0_PE
        movl    %eax, %cr0

        ljmpl   $(1 << 3), $(0x7000 + start32 - entryother_start)

.code32
start32:
        movw    $(2 << 3), %ax          # data segment selector
        movw    %ax, %ds
        movw    %ax, %es
        movw    %ax, %ss
        movw    $0, %ax                 # zero segments not ready for use
        movw    %ax, %fs
        movw    %ax, %gs

        # Turn on page size extension for 4Mbyte pages
        movl    %cr4, %eax
        orl     $0x10, %eax             # CR4_PSE
        movl    %eax, %cr4
        # Use entrypgdir as our initial page table
        movl    (0x7000 - 12), %eax
        movl    %eax, %cr3
        # Turn on paging.
        movl    %cr0, %eax
        orl     $0x80010000, %eax       # CR0_PG | CR0_WP
        movl    %eax, %cr0

        # Switch to the stack allocated by start_others()
        movl    (0x7000 - 4), %esp
        # Call mpenter()
        call    *(0x7000 - 8)

        # mpenter never returns; if it somehow does, reboot.
        movw    $0x8a00, %ax
        movw    %ax, %dx
        outw    %ax, %dx
        movw    $0x8ae0, %ax
        outw    %ax, %dx
1:
        jmp     1b

.p2align 2
gdt:
        # null descriptor
        .word   0, 0
        .byte   0, 0, 0, 0
        # 4GB flat code segment
        .word   0xffff, 0x0000
        .byte   0x00, 0x9a, 0xcf, 0x00
        # 4GB flat data segment
        .word   0xffff, 0x0000
        .byte   0x00, 0x92, 0xcf, 0x00

gdtdesc:
        .word   (gdtdesc - gdt - 1)
        .long   (0x7000 + gdt - entryother_start)

.globl entryother_end
entryother_end:
.text
"#,
    options(att_syntax)
);

extern "C" {
    pub fn entryother_start();
    pub fn entryother_end();
}
