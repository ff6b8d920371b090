use crate::context::{ContextSwitch, ForkOutcome, UserEntry};
use crate::elf::{ElfError, Ph32, elf32_view};
use crate::process::Pid;
use crate::scheduler::Scheduler;
use crate::user_memory::UserMemory;
use crate::ProcError;
use kernel_info::memory::{HEAP_START, PAGE_SIZE, USER_IMAGE_BASE, USER_STACK_END, USER_STACK_START};
use kernel_memory_addresses::{VirtualAddress, align_up};
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper};
use log::{info, warn};
use packer_abi::reader::Filesystem;

/// What [`Scheduler::system`] returns on each side of its fork.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SystemOutcome {
    /// The parent, after the child had its turn.
    Parent(Pid),
    /// The child, ready to drop into the new image.
    Child(UserEntry),
}

impl<M: PhysMapper> Scheduler<'_, M> {
    /// Replace the current process's user image with the executable at
    /// `path` and enter it.
    ///
    /// The new image gets every `PT_LOAD` segment mapped as user memory, the
    /// user stack at `USER_STACK_START..USER_STACK_END` and, at the first page
    /// boundary after the image, the argument block:
    ///
    /// ```text
    ///  heap ─► argv[0] = path, argv[1..], NULL
    ///          envp: NULL
    ///          auxv: 0, 0
    ///          strings, NUL terminated
    /// ```
    ///
    /// `argc` (counting `path`) and `argv` are pushed on the user stack.
    /// On hardware [`ContextSwitch::enter_userspace`] does not return; the
    /// entry is returned for the benefit of host callers.
    ///
    /// Segments must lie in `USER_IMAGE_BASE..HEAP_START`; anything else would
    /// land in the identity map or in the heap tables every directory shares.
    ///
    /// # Errors
    /// The file is missing, is not an i386 executable, places a segment
    /// outside the user image area, or memory for the image ran out. Pages
    /// mapped before the failure stay mapped.
    pub fn exec<C: ContextSwitch, A: FrameAlloc>(
        &mut self,
        cpu: &mut C,
        alloc: &mut A,
        fs: &Filesystem<'_>,
        path: &str,
        argv: &[&str],
    ) -> Result<UserEntry, ProcError> {
        let pid = self.current.ok_or(ProcError::NoCurrentProcess)?;
        let process = self.tree.get(pid).ok_or(ProcError::NoSuchProcess(pid))?;
        let cwd = if process.cwd_entry == 0 {
            fs.root()?
        } else {
            fs.entry_at(process.cwd_entry)?
        };
        let file = fs
            .open(path.as_bytes(), cwd)
            .ok_or(ProcError::NotFound)?;
        let data = fs.file_content(file, true).ok_or(ProcError::NotFound)?;
        let dir = process.thread.directory;

        if let Some(p) = self.tree.get_mut(pid) {
            p.name = path.into();
        }

        let elf = elf32_view(data).inspect_err(|_| {
            warn!("exec: '{path}' is not a valid executable file.");
        })?;

        for ph in elf.iter_pt_load() {
            user_segment_range(&ph).inspect_err(|e| warn!("exec: '{path}': {e}"))?;
        }

        let mem = UserMemory::new(AddressSpace::from_root(self.mapper, dir));
        let mut low = u32::MAX;
        let mut high = 0u32;
        for ph in elf.iter_pt_load() {
            let bytes = elf.segment_bytes(&ph)?;
            let (start, end) = user_segment_range(&ph)?;
            mem.ensure_range(alloc, start, end)?;
            mem.write(start, bytes)?;
            mem.fill(start + ph.p_filesz, 0, (ph.p_memsz - ph.p_filesz) as usize)?;
            low = low.min(start);
            high = high.max(end);
        }
        if low > high {
            return Err(ElfError::NoLoadSegments.into());
        }

        mem.ensure_range(alloc, USER_STACK_START, USER_STACK_END)?;

        let heap = align_up(high, PAGE_SIZE);
        let (argv_ptr, heap_end) = write_arguments(&mem, alloc, heap, path, argv)?;

        let argc = u32::try_from(argv.len() + 1).unwrap_or(u32::MAX);
        let sp = USER_STACK_END - 8;
        mem.write_u32(sp + 4, argv_ptr)?;
        mem.write_u32(sp, argc)?;

        let entry = UserEntry {
            entry: elf.entry().as_u32(),
            stack: sp,
            argc,
            argv: argv_ptr,
        };

        let Some(p) = self.tree.get_mut(pid) else {
            return Err(ProcError::NoSuchProcess(pid));
        };
        p.image.entry = low;
        p.image.size = high - low;
        p.image.heap = heap_end;
        p.image.heap_aligned = align_up(heap_end, PAGE_SIZE);
        p.image.user_stack = USER_STACK_END;
        let kernel_stack = p.image.stack;
        info!("exec {path} in {pid}: entry {:#010x}", entry.entry);

        cpu.set_kernel_stack(kernel_stack);
        cpu.enter_userspace(&entry);
        Ok(entry)
    }

    /// Fork; the child execs `path`, the parent yields until the child has
    /// had the CPU.
    ///
    /// A child whose `exec` fails terminates with status `-1`.
    ///
    /// # Errors
    /// The fork itself failed.
    pub fn system<C: ContextSwitch, A: FrameAlloc>(
        &mut self,
        cpu: &mut C,
        alloc: &mut A,
        fs: &Filesystem<'_>,
        path: &str,
        argv: &[&str],
    ) -> Result<SystemOutcome, ProcError> {
        match self.fork(cpu, alloc)? {
            ForkOutcome::Child => match self.exec(cpu, alloc, fs, path, argv) {
                Ok(entry) => Ok(SystemOutcome::Child(entry)),
                Err(e) => {
                    warn!("system: cannot run {path}: {e}");
                    self.task_exit(cpu, -1);
                    Err(e)
                }
            },
            ForkOutcome::Parent(child) => {
                self.switch_task(cpu, alloc, true);
                Ok(SystemOutcome::Parent(child))
            }
        }
    }
}

/// The `[start, end)` a loadable segment occupies, if that is inside the
/// user image area.
fn user_segment_range(ph: &Ph32) -> Result<(u32, u32), ElfError> {
    let start = ph.p_vaddr.as_u32();
    let end = start
        .checked_add(ph.p_memsz)
        .ok_or(ElfError::OutOfBounds)?;
    if start < USER_IMAGE_BASE || end > HEAP_START {
        return Err(ElfError::SegmentOutsideUserArea(start));
    }
    Ok((start, end))
}

/// Lay out `argv`, `envp` and `auxv` at `heap`, mapping pages as needed.
/// Returns the address of `argv` and the first free byte after the strings.
#[allow(clippy::cast_possible_truncation)]
fn write_arguments<M: PhysMapper, A: FrameAlloc>(
    mem: &UserMemory<'_, M>,
    alloc: &mut A,
    heap: u32,
    path: &str,
    argv: &[&str],
) -> Result<(u32, u32), ProcError> {
    let args = || core::iter::once(path).chain(argv.iter().copied());
    let count = u32::try_from(argv.len() + 1).map_err(|_| ElfError::OutOfBounds)?;
    let pointers = (count + 1) * 4;
    let envp = 4;
    let auxv = 8;
    let strings: usize = args().map(|a| a.len() + 1).sum();
    let strings = u32::try_from(strings).map_err(|_| ElfError::OutOfBounds)?;

    let argv_ptr = heap;
    let mut text = heap + pointers + envp + auxv;
    let end = text
        .checked_add(strings)
        .ok_or(ElfError::OutOfBounds)?;
    if end > HEAP_START {
        return Err(ElfError::SegmentOutsideUserArea(heap).into());
    }
    mem.ensure_range(alloc, heap, end)?;

    for (i, arg) in (0u32..).zip(args()) {
        mem.write_u32(argv_ptr + i * 4, text)?;
        mem.write(text, arg.as_bytes())?;
        mem.write(text + arg.len() as u32, &[0])?;
        text += arg.len() as u32 + 1;
    }
    mem.write_u32(argv_ptr + count * 4, 0)?;
    mem.write_u32(argv_ptr + pointers, 0)?;
    mem.fill(argv_ptr + pointers + envp, 0, auxv as usize)?;
    debug_assert_eq!(text, end);
    Ok((argv_ptr, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::mock::MockCpu;
    use crate::elf::build_test_image;
    use crate::scheduler::tests::boot;
    use kernel_vmem::sim::{SimFrames, SimPhys};
    use packer_abi::builder::{Node, build_image};

    fn image(init: Vec<u8>) -> Vec<u8> {
        build_image(
            "test",
            &[Node::Dir {
                name: "bin".into(),
                children: vec![
                    Node::File {
                        name: "init".into(),
                        data: init,
                    },
                    Node::File {
                        name: "readme".into(),
                        data: b"plain text, long enough to get past the header length check".to_vec(),
                    },
                ],
            }],
        )
    }

    fn program() -> Vec<u8> {
        build_test_image(
            0x4000_0010,
            &[
                (0x4000_0000, 0x1800, &b"\x90\x90\xEB\xFE"[..]),
                (0x4000_2000, 0x10, &b"data"[..]),
            ],
        )
    }

    #[test]
    fn exec_loads_image_and_arguments() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let img = image(program());
        let fs = Filesystem::parse(&img).unwrap();
        let mut cpu = MockCpu::default();

        let entry = s
            .exec(&mut cpu, &mut frames, &fs, "/bin/init", &["-v"])
            .unwrap();
        assert_eq!(cpu.entered, vec![entry]);
        assert_eq!(entry.entry, 0x4000_0010);
        assert_eq!(entry.argc, 2);
        assert_eq!(entry.stack, USER_STACK_END - 8);

        let p = s.current().unwrap();
        assert_eq!(p.name, "/bin/init");
        assert_eq!(p.image.entry, 0x4000_0000);
        assert_eq!(p.image.size, 0x2010);
        assert_eq!(p.image.user_stack, USER_STACK_END);
        assert_eq!(entry.argv, 0x4000_3000);
        assert_eq!(p.image.heap_aligned % PAGE_SIZE, 0);
        assert!(p.image.heap_aligned >= p.image.heap);

        let mem = UserMemory::new(AddressSpace::from_root(&phys, p.thread.directory));
        let mut code = [0; 4];
        mem.read(0x4000_0000, &mut code).unwrap();
        assert_eq!(code, [0x90, 0x90, 0xEB, 0xFE]);
        let mut bss = [0xAA; 12];
        mem.read(0x4000_2004, &mut bss).unwrap();
        assert_eq!(bss, [0; 12]);

        assert_eq!(mem.read_u32(entry.stack).unwrap(), 2);
        assert_eq!(mem.read_u32(entry.stack + 4).unwrap(), entry.argv);

        let arg0 = mem.read_u32(entry.argv).unwrap();
        let arg1 = mem.read_u32(entry.argv + 4).unwrap();
        assert_eq!(mem.read_u32(entry.argv + 8).unwrap(), 0);
        assert_eq!(mem.read_u32(entry.argv + 12).unwrap(), 0, "envp");
        let mut s0 = [0; 10];
        mem.read(arg0, &mut s0).unwrap();
        assert_eq!(&s0, b"/bin/init\0");
        let mut s1 = [0; 3];
        mem.read(arg1, &mut s1).unwrap();
        assert_eq!(&s1, b"-v\0");

        let space = mem.space();
        assert!(space.get_phys_addr(VirtualAddress::new(USER_STACK_START)).is_some());
        assert!(
            space
                .entry(VirtualAddress::new(USER_STACK_END - 4))
                .is_some_and(|e| e.user())
        );
    }

    #[test]
    fn exec_relative_to_working_directory() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let img = image(program());
        let fs = Filesystem::parse(&img).unwrap();
        let bin = fs.find_entry(b"bin").unwrap();
        s.current_mut().unwrap().cwd_entry = bin.offset;

        let mut cpu = MockCpu::default();
        assert!(s.exec(&mut cpu, &mut frames, &fs, "init", &[]).is_ok());
    }

    #[test]
    fn exec_rejects_missing_and_invalid_files() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let img = image(program());
        let fs = Filesystem::parse(&img).unwrap();
        let mut cpu = MockCpu::default();

        assert_eq!(
            s.exec(&mut cpu, &mut frames, &fs, "/bin/nope", &[]),
            Err(ProcError::NotFound)
        );
        assert_eq!(
            s.exec(&mut cpu, &mut frames, &fs, "/bin/readme", &[]),
            Err(ProcError::Elf(ElfError::BadMagic))
        );
        assert!(cpu.entered.is_empty());
    }

    #[test]
    fn exec_refuses_segments_in_the_shared_heap() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let img = image(build_test_image(
            0x4000_0010,
            &[
                (0x4000_0000, 0x10, &b"\x90"[..]),
                (HEAP_START, 0x10, &b"leak"[..]),
            ],
        ));
        let fs = Filesystem::parse(&img).unwrap();
        let mut cpu = MockCpu::default();
        let dir = s.current().unwrap().thread.directory;
        let space = AddressSpace::from_root(&phys, dir);
        let before = space.get_phys_addr(VirtualAddress::new(HEAP_START));
        let allocated = frames.allocated();

        assert_eq!(
            s.exec(&mut cpu, &mut frames, &fs, "/bin/init", &[]),
            Err(ProcError::Elf(ElfError::SegmentOutsideUserArea(HEAP_START)))
        );
        assert!(cpu.entered.is_empty());
        // Nothing was mapped, not even the valid segment.
        assert_eq!(space.get_phys_addr(VirtualAddress::new(HEAP_START)), before);
        assert_eq!(space.get_phys_addr(VirtualAddress::new(0x4000_0000)), None);
        assert_eq!(frames.allocated(), allocated);
    }

    #[test]
    fn exec_refuses_segments_outside_the_image_area() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let mut cpu = MockCpu::default();

        // Identity-mapped low memory, straddling the image base, and running
        // from the image area into the heap.
        for (vaddr, memsz, at) in [
            (0x2000, 0x10, 0x2000),
            (USER_IMAGE_BASE - 0x10, 0x20, USER_IMAGE_BASE - 0x10),
            (HEAP_START - 0x1000, 0x2000, HEAP_START - 0x1000),
        ] {
            let img = image(build_test_image(vaddr, &[(vaddr, memsz, &b"\xEB\xFE"[..])]));
            let fs = Filesystem::parse(&img).unwrap();
            assert_eq!(
                s.exec(&mut cpu, &mut frames, &fs, "/bin/init", &[]),
                Err(ProcError::Elf(ElfError::SegmentOutsideUserArea(at)))
            );
        }
        assert!(cpu.entered.is_empty());

        // An image filling the area up to the heap leaves no room for the
        // argument block; one page less does.
        let img = image(build_test_image(
            HEAP_START - 0x1000,
            &[(HEAP_START - 0x1000, 0x1000, &b"\xEB\xFE"[..])],
        ));
        let fs = Filesystem::parse(&img).unwrap();
        assert_eq!(
            s.exec(&mut cpu, &mut frames, &fs, "/bin/init", &[]),
            Err(ProcError::Elf(ElfError::SegmentOutsideUserArea(HEAP_START)))
        );
        let img = image(build_test_image(
            HEAP_START - 0x2000,
            &[(HEAP_START - 0x2000, 0x1000, &b"\xEB\xFE"[..])],
        ));
        let fs = Filesystem::parse(&img).unwrap();
        let entry = s.exec(&mut cpu, &mut frames, &fs, "/bin/init", &[]).unwrap();
        assert_eq!(entry.argv, HEAP_START - 0x1000);
    }

    #[test]
    fn system_runs_child_after_parent_yields() {
        let phys = SimPhys::with_frames(1024);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        let img = image(program());
        let fs = Filesystem::parse(&img).unwrap();

        let mut cpu = MockCpu::taken_at(top - 64, top - 32);
        let out = s
            .system(&mut cpu, &mut frames, &fs, "/bin/init", &[])
            .unwrap();
        assert_eq!(out, SystemOutcome::Parent(Pid(1)));
        // The parent switched to the child.
        assert_eq!(s.getpid(), Some(Pid(1)));

        // What the child runs once its fork returns `Child`.
        let entry = s
            .exec(&mut cpu, &mut frames, &fs, "/bin/init", &[])
            .unwrap();
        assert_eq!(entry.entry, 0x4000_0010);
        // Parent and child no longer share user memory.
        let child_dir = s.get_process(Pid(1)).unwrap().thread.directory;
        assert_ne!(child_dir, s.kernel_directory());
    }
}
