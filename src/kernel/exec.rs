use crate::defs::as_bytes;
use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::Path;
use crate::log::LOG;
use crate::mmu::{pg_round_up, PGSIZE};
use crate::param::MAXARG;
use crate::println;
use crate::proc::Cpus;
use crate::vm::{self, PgDir, VirtAddr};
use core::mem::size_of;
use core::ptr::NonNull;

// Replace the calling process's user image with the program at path,
// leaving its pid, parent, open files and cwd intact. Nothing of the
// old image is touched until the new one is fully built, so a failure
// at any point leaves the caller exactly as it was.
pub fn exec(path: &Path, argv: &[Option<&str>; MAXARG]) -> Result<usize, ()> {
    let p = Cpus::my_proc().ok_or(())?;
    let data = unsafe { &mut *p.data.get() };

    LOG.begin_op();

    let ip = match path.namei() {
        Some(ip) => ip,
        None => {
            LOG.end_op();
            println!("exec: fail");
            return Err(());
        }
    };

    // Build the new address space from the image, with the inode
    // locked and the FS transaction open.
    let mut pgdir: Option<NonNull<PgDir>> = None;
    let loaded: Result<(ElfHdr, usize), ()> = (|| {
        let mut ip_guard = ip.lock();

        // Check ELF header
        let mut elf = ElfHdr::default();
        if ip_guard.read(
            VirtAddr::Kernel(&mut elf as *mut ElfHdr as usize),
            0,
            size_of::<ElfHdr>(),
        ) != Ok(size_of::<ElfHdr>())
        {
            return Err(());
        }
        if elf.magic != ELF_MAGIC {
            return Err(());
        }

        let pgd = unsafe { pgdir.insert(vm::setupkvm().ok_or(())?).as_mut() };

        // Load program into memory.
        let mut sz = 0;
        let mut off = elf.phoff;
        for _ in 0..elf.phnum {
            let mut ph = ProgHdr::default();
            if ip_guard.read(
                VirtAddr::Kernel(&mut ph as *mut ProgHdr as usize),
                off,
                size_of::<ProgHdr>(),
            ) != Ok(size_of::<ProgHdr>())
            {
                return Err(());
            }
            off += size_of::<ProgHdr>() as u32;
            if ph.ptype != ELF_PROG_LOAD {
                continue;
            }
            if ph.memsz < ph.filesz {
                return Err(());
            }
            if ph.vaddr.checked_add(ph.memsz).is_none() {
                return Err(());
            }
            sz = vm::allocuvm(pgd, sz, (ph.vaddr + ph.memsz) as usize).ok_or(())?;
            if ph.vaddr as usize % PGSIZE != 0 {
                return Err(());
            }
            vm::loaduvm(pgd, ph.vaddr as usize, &mut ip_guard, ph.off, ph.filesz as usize)?;
        }
        Ok((elf, sz))
    })();

    let (elf, mut sz) = match loaded {
        Ok(v) => v,
        Err(()) => {
            if let Some(pgd) = pgdir {
                vm::freevm(pgd);
            }
            drop(ip);
            LOG.end_op();
            return Err(());
        }
    };
    drop(ip);
    LOG.end_op();

    // The inode is released; from here on, failure only has the
    // half-built page directory to undo.
    let new_pgdir = pgdir.unwrap();
    match setup_stack(new_pgdir, &mut sz, argv) {
        Ok(sp) => {
            // Save program name for debugging.
            data.name.clear();
            data.name.push_str(path.file_name());

            // Commit to the user image.
            let oldpgdir = data.pgdir.replace(new_pgdir);
            data.sz = sz;
            let tf = unsafe { data.tf.unwrap().as_mut() };
            tf.eip = elf.entry; // main
            tf.esp = sp as u32;
            vm::switchuvm(p);
            if let Some(old) = oldpgdir {
                vm::freevm(old);
            }
            Ok(0)
        }
        Err(()) => {
            vm::freevm(new_pgdir);
            Err(())
        }
    }
}

// Build the user stack in the new image: a guard page, the stack
// page, the argument strings, and the argv array with the argc /
// argv / fake-return-PC words main expects.
fn setup_stack(
    mut pgdir: NonNull<PgDir>,
    sz: &mut usize,
    argv: &[Option<&str>; MAXARG],
) -> Result<usize, ()> {
    let pgd = unsafe { pgdir.as_mut() };

    // Allocate two pages at the next page boundary.
    // Make the first inaccessible. Use the second as the user stack.
    *sz = pg_round_up(*sz);
    *sz = vm::allocuvm(pgd, *sz, *sz + 2 * PGSIZE).ok_or(())?;
    vm::clearpteu(pgd, *sz - 2 * PGSIZE);
    let mut sp = *sz;

    // Push argument strings, prepare rest of stack in ustack.
    let mut ustack = [0u32; 3 + MAXARG + 1];
    let mut argc = 0;
    loop {
        if argc >= MAXARG {
            return Err(());
        }
        let arg = match argv[argc] {
            None => break,
            Some(arg) => arg,
        };
        sp = (sp - (arg.len() + 1)) & !3; // nul-terminated, word-aligned
        vm::copyout(pgd, sp, arg.as_bytes())?;
        vm::copyout(pgd, sp + arg.len(), &[0u8])?;
        ustack[3 + argc] = sp as u32;
        argc += 1;
    }
    ustack[3 + argc] = 0;

    ustack[0] = 0xffffffff; // fake return PC, so a returning main faults
    ustack[1] = argc as u32;
    ustack[2] = (sp - (argc + 1) * 4) as u32; // argv pointer

    sp -= (3 + argc + 1) * 4;
    vm::copyout(pgd, sp, unsafe { as_bytes(&ustack[..3 + argc + 1]) })?;

    Ok(sp)
}
