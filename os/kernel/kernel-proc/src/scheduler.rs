use crate::context::{Context, ContextSwitch, FORK_MAGIC, ForkOutcome, Snapshot};
use crate::process::{Image, Pid, Process};
use crate::tree::ProcessTree;
use crate::user_memory::UserMemory;
use crate::ProcError;
use alloc::collections::VecDeque;
use kernel_info::memory::{KERNEL_STACK_PAGES, KERNEL_STACK_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_syscall::SyscallFrame;
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, VmemError};
use log::{debug, error, info, warn};

/// Fake return address below a cloned thread's argument. Returning from the
/// thread function faults on it.
pub const THREAD_RETURN: u32 = 0xFFFF_B00F;

/// Where a cloned thread starts in ring 3.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct ThreadStart {
    stack: u32,
    func: u32,
    arg: u32,
}

/// A child created by [`Scheduler::prepare_fork`] or
/// [`Scheduler::prepare_clone`] whose context is not staged yet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ForkPlan {
    parent: Pid,
    child: Pid,
    thread: Option<ThreadStart>,
}

impl ForkPlan {
    #[must_use]
    pub const fn child(&self) -> Pid {
        self.child
    }
}

/// Process table, ready queue and reap queue.
///
/// Callers keep interrupts disabled around every method; the scheduler
/// itself does no locking.
pub struct Scheduler<'m, M: PhysMapper> {
    pub(crate) mapper: &'m M,
    pub(crate) tree: ProcessTree,
    ready: VecDeque<Pid>,
    reap: VecDeque<Pid>,
    pub(crate) current: Option<Pid>,
    next_pid: u32,
    kernel_directory: PhysicalAddress,
}

impl<'m, M: PhysMapper> Scheduler<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M) -> Self {
        Self {
            mapper,
            tree: ProcessTree::new(),
            ready: VecDeque::new(),
            reap: VecDeque::new(),
            current: None,
            next_pid: 0,
            kernel_directory: PhysicalAddress::zero(),
        }
    }

    /// Adopt the running kernel thread as `init` (PID 0).
    ///
    /// `stack_top`/`stack_size` describe the stack it runs on, `directory`
    /// the kernel page directory and `cwd_entry` the filesystem root.
    pub fn spawn_init(
        &mut self,
        stack_top: u32,
        stack_size: u32,
        directory: PhysicalAddress,
        cwd_entry: u32,
    ) -> Pid {
        let mut init = Process::new(Pid::INIT, "init");
        init.thread.directory = directory;
        init.image.stack = stack_top;
        init.image.stack_size = stack_size;
        init.cwd_entry = cwd_entry;
        init.started = true;

        self.tree.set_root(init);
        self.ready.clear();
        self.reap.clear();
        self.current = Some(Pid::INIT);
        self.next_pid = 0;
        self.kernel_directory = directory;
        info!("init running, kernel stack top {stack_top:#010x}");
        Pid::INIT
    }

    #[must_use]
    pub const fn kernel_directory(&self) -> PhysicalAddress {
        self.kernel_directory
    }

    #[must_use]
    pub const fn getpid(&self) -> Option<Pid> {
        self.current
    }

    #[must_use]
    pub fn current(&self) -> Option<&Process> {
        self.tree.get(self.current?)
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.tree.get_mut(self.current?)
    }

    #[must_use]
    pub fn get_process(&self, pid: Pid) -> Option<&Process> {
        self.tree.get(pid)
    }

    pub fn get_process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.tree.get_mut(pid)
    }

    #[must_use]
    pub const fn tree(&self) -> &ProcessTree {
        &self.tree
    }

    /// Create a child of `parent` with a fresh kernel stack. It inherits the
    /// image layout, page directory, file descriptors and working directory,
    /// and is not queued.
    ///
    /// # Errors
    /// [`ProcError::NoSuchProcess`] for an unknown parent,
    /// [`ProcError::OutOfStacks`] if no contiguous stack is available.
    pub fn spawn_process<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        parent: Pid,
    ) -> Result<Pid, ProcError> {
        let from = self.tree.get(parent).ok_or(ProcError::NoSuchProcess(parent))?;
        let Some(base) = alloc.alloc_contiguous(KERNEL_STACK_PAGES) else {
            warn!("no room for a {KERNEL_STACK_PAGES}-page kernel stack");
            return Err(ProcError::OutOfStacks);
        };

        self.next_pid += 1;
        let pid = Pid(self.next_pid);
        let mut process = Process::new(pid, "unnamed process");
        process.image = from.image;
        process.image.stack = base.as_u32() + KERNEL_STACK_SIZE;
        process.image.stack_size = KERNEL_STACK_SIZE;
        process.thread.directory = from.thread.directory;
        process.fds = from.fds.clone();
        process.cwd.clone_from(&from.cwd);
        process.cwd_entry = from.cwd_entry;
        process.owns_stack = true;

        if let Err(process) = self.tree.insert(parent, process) {
            Self::free_stack(alloc, &process);
            return Err(ProcError::NoSuchProcess(parent));
        }
        debug!("spawned {pid} under {parent}");
        Ok(pid)
    }

    /// Append `pid` to the ready queue unless it is queued or finished.
    pub fn make_ready(&mut self, pid: Pid) {
        if let Some(p) = self.tree.get_mut(pid)
            && !p.queued
            && !p.finished
        {
            p.queued = true;
            self.ready.push_back(pid);
        }
    }

    /// Append `pid` to the reap queue.
    pub fn make_reapable(&mut self, pid: Pid) {
        if !self.reap.contains(&pid) {
            self.reap.push_back(pid);
        }
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    fn has_runnable(&self) -> bool {
        self.ready
            .iter()
            .any(|pid| self.tree.get(*pid).is_some_and(|p| !p.finished))
    }

    /// Save the current process and run the next ready one.
    ///
    /// With `reschedule` the current process goes to the back of the ready
    /// queue. When the saved context is resumed later, pending reaps are
    /// processed before returning to the caller.
    pub fn switch_task<C: ContextSwitch, A: FrameAlloc>(
        &mut self,
        cpu: &mut C,
        alloc: &mut A,
        reschedule: bool,
    ) {
        let Some(cur) = self.current else {
            return;
        };
        if !self.tree.get(cur).is_some_and(|p| p.started) {
            self.switch_next(cpu);
            return;
        }
        if !self.has_runnable() {
            return;
        }

        let switched = cpu.checkpoint(|cpu, ctx| {
            if let Some(p) = self.tree.get_mut(cur) {
                p.thread.context = ctx;
                p.started = false;
            }
            if reschedule {
                self.make_ready(cur);
            }
            self.switch_next(cpu);
        });
        if switched == Snapshot::Resumed {
            self.reap_queued(alloc);
        }
    }

    /// Resume the next ready process, skipping finished ones. Returns only
    /// if nothing is runnable (or on a host mock).
    pub fn switch_next<C: ContextSwitch>(&mut self, cpu: &mut C) {
        let next = loop {
            let Some(pid) = self.ready.pop_front() else {
                debug!("nothing ready to run");
                return;
            };
            let Some(p) = self.tree.get_mut(pid) else {
                continue;
            };
            p.queued = false;
            if !p.finished {
                break pid;
            }
        };

        self.current = Some(next);
        let Some(p) = self.tree.get_mut(next) else {
            return;
        };
        p.started = true;
        let thread = p.thread;
        let top = p.image.stack;
        cpu.set_kernel_stack(top);
        cpu.resume(&thread);
    }

    /// Terminate the current process with `code` and switch away.
    ///
    /// `init` never terminates; for it this just reschedules.
    pub fn task_exit<C: ContextSwitch>(&mut self, cpu: &mut C, code: i32) {
        let Some(cur) = self.current else {
            return;
        };
        if !cur.is_init()
            && let Some(p) = self.tree.get_mut(cur)
        {
            info!("Process [{}] {} terminated with code {code}.", p.pid, p.name);
            p.status = code;
            p.finished = true;
            self.make_reapable(cur);
        }
        self.switch_next(cpu);
    }

    /// Unlink `pid` from the tree, handing its children to its parent.
    ///
    /// # Errors
    /// [`ProcError::KillInit`] for PID 0, [`ProcError::NoSuchProcess`]
    /// otherwise if the PID is unknown.
    pub fn delete_process(&mut self, pid: Pid) -> Result<Process, ProcError> {
        if pid.is_init() {
            error!("Attempt to kill init.");
            return Err(ProcError::KillInit);
        }
        self.ready.retain(|p| *p != pid);
        self.reap.retain(|p| *p != pid);
        self.tree
            .remove_and_merge(pid)
            .ok_or(ProcError::NoSuchProcess(pid))
    }

    /// Release everything `pid` owns: descriptors, kernel stack and, unless
    /// another process still uses it, its page directory.
    ///
    /// # Errors
    /// As for [`delete_process`](Self::delete_process).
    pub fn reap_process<A: FrameAlloc>(&mut self, alloc: &mut A, pid: Pid) -> Result<(), ProcError> {
        let mut process = self.delete_process(pid)?;
        process.fds.close_all();
        Self::free_stack(alloc, &process);

        let dir = process.thread.directory;
        let shared = dir.is_null()
            || dir == self.kernel_directory
            || self.tree.iter().any(|p| p.thread.directory == dir);
        if !shared {
            AddressSpace::from_root(self.mapper, dir).free(alloc);
        }
        debug!("reaped {pid} ({})", process.name);
        Ok(())
    }

    /// Reap every queued process except the one running.
    pub fn reap_queued<A: FrameAlloc>(&mut self, alloc: &mut A) {
        let pending = core::mem::take(&mut self.reap);
        for pid in pending {
            if Some(pid) == self.current {
                self.reap.push_back(pid);
            } else if let Err(e) = self.reap_process(alloc, pid) {
                warn!("cannot reap {pid}: {e}");
            }
        }
    }

    fn free_stack<A: FrameAlloc>(alloc: &mut A, process: &Process) {
        if !process.owns_stack {
            return;
        }
        let base = process.image.stack_base();
        for page in 0..process.image.stack_size / PAGE_SIZE {
            alloc.free_4k(PhysicalAddress::new(base + page * PAGE_SIZE));
        }
    }

    /// Duplicate the current process. Returns the child's PID in the parent
    /// and [`ForkOutcome::Child`] when the child first runs.
    ///
    /// # Errors
    /// Out of frames for the directory copy or the kernel stack.
    ///
    /// # Panics
    /// If the saved context fails the consistency checks in
    /// [`resolve_fork`](Self::resolve_fork).
    pub fn fork<C: ContextSwitch, A: FrameAlloc>(
        &mut self,
        cpu: &mut C,
        alloc: &mut A,
    ) -> Result<ForkOutcome, ProcError> {
        let plan = self.prepare_fork(alloc)?;
        self.fork_at_checkpoint(cpu, &plan)
    }

    /// Start a thread of the current process at `func(arg)` on the user
    /// stack ending at `stack`. The thread shares the page directory and
    /// file descriptors and returns to ring 3 through the system call in
    /// progress.
    ///
    /// # Errors
    /// [`ProcError::NotInSyscall`] outside a system call, or an unmapped
    /// user stack.
    ///
    /// # Panics
    /// As for [`fork`](Self::fork).
    pub fn clone<C: ContextSwitch, A: FrameAlloc>(
        &mut self,
        cpu: &mut C,
        alloc: &mut A,
        stack: u32,
        func: u32,
        arg: u32,
    ) -> Result<ForkOutcome, ProcError> {
        let plan = self.prepare_clone(alloc, stack, func, arg)?;
        self.fork_at_checkpoint(cpu, &plan)
    }

    /// The parent stages the child while the checkpoint's frame is still on
    /// the stack it copies.
    fn fork_at_checkpoint<C: ContextSwitch>(
        &mut self,
        cpu: &mut C,
        plan: &ForkPlan,
    ) -> Result<ForkOutcome, ProcError> {
        match cpu.checkpoint(|_, ctx| self.resolve_fork(plan, Snapshot::Taken(ctx))) {
            Snapshot::Taken(parent_side) => parent_side,
            Snapshot::Resumed => self.resolve_fork(plan, Snapshot::Resumed),
        }
    }

    /// First half of [`fork`](Self::fork): copy the directory and spawn the
    /// child.
    ///
    /// # Errors
    /// See [`fork`](Self::fork).
    pub fn prepare_fork<A: FrameAlloc>(&mut self, alloc: &mut A) -> Result<ForkPlan, ProcError> {
        let parent = self.current.ok_or(ProcError::NoCurrentProcess)?;
        let dir = self
            .tree
            .get(parent)
            .ok_or(ProcError::NoSuchProcess(parent))?
            .thread
            .directory;
        let space = AddressSpace::from_root(self.mapper, dir).clone_directory(alloc)?;
        let child = match self.spawn_process(alloc, parent) {
            Ok(child) => child,
            Err(e) => {
                space.free(alloc);
                return Err(e);
            }
        };
        if let Some(p) = self.tree.get_mut(child) {
            p.thread.directory = space.root();
        }
        Ok(ForkPlan {
            parent,
            child,
            thread: None,
        })
    }

    /// First half of [`clone`](Self::clone).
    ///
    /// # Errors
    /// See [`clone`](Self::clone).
    pub fn prepare_clone<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        stack: u32,
        func: u32,
        arg: u32,
    ) -> Result<ForkPlan, ProcError> {
        let parent = self.current.ok_or(ProcError::NoCurrentProcess)?;
        let p = self.tree.get(parent).ok_or(ProcError::NoSuchProcess(parent))?;
        if p.syscall_frame == 0 {
            return Err(ProcError::NotInSyscall);
        }
        let space = AddressSpace::from_root(self.mapper, p.thread.directory);
        for at in [stack.wrapping_sub(8), stack.wrapping_sub(1)] {
            let va = VirtualAddress::new(at);
            if space.get_phys_addr(va).is_none() {
                return Err(VmemError::NotMapped(va).into());
            }
        }
        let child = self.spawn_process(alloc, parent)?;
        Ok(ForkPlan {
            parent,
            child,
            thread: Some(ThreadStart { stack, func, arg }),
        })
    }

    /// Second half of [`fork`](Self::fork) and [`clone`](Self::clone), run
    /// once by each continuation.
    ///
    /// On [`Snapshot::Taken`] the parent copies its live kernel stack into
    /// the child's, stores the rebased context and queues the child. On
    /// [`Snapshot::Resumed`] the child checks that it was staged by this plan.
    ///
    /// # Errors
    /// Staging a thread's user stack failed.
    ///
    /// # Panics
    /// `Bad fork() magic` if the running process is not the one the plan
    /// expects on that side, or the saved stack pointer lies outside the
    /// parent's kernel stack.
    pub fn resolve_fork(
        &mut self,
        plan: &ForkPlan,
        snapshot: Snapshot,
    ) -> Result<ForkOutcome, ProcError> {
        match snapshot {
            Snapshot::Taken(ctx) => {
                if self.current != Some(plan.parent) {
                    panic!("Bad fork() magic (parent).");
                }
                self.stage_child(plan, ctx)?;
                self.make_ready(plan.child);
                Ok(ForkOutcome::Parent(plan.child))
            }
            Snapshot::Resumed => {
                let staged = self.current == Some(plan.child)
                    && self
                        .tree
                        .get(plan.child)
                        .is_some_and(|p| p.thread.magic == FORK_MAGIC);
                if !staged {
                    panic!("Bad fork() magic (child).");
                }
                if let Some(p) = self.tree.get_mut(plan.child) {
                    p.thread.magic = 0;
                }
                Ok(ForkOutcome::Child)
            }
        }
    }

    fn stage_child(&mut self, plan: &ForkPlan, ctx: Context) -> Result<(), ProcError> {
        let parent = self
            .tree
            .get(plan.parent)
            .ok_or(ProcError::NoSuchProcess(plan.parent))?;
        let (from, frame) = (parent.image, parent.syscall_frame);
        let child = self
            .tree
            .get(plan.child)
            .ok_or(ProcError::NoSuchProcess(plan.child))?;
        let to = child.image;

        assert!(
            ctx.esp >= from.stack_base() && ctx.esp <= from.stack,
            "Bad fork() magic (parent): esp {:#x} outside kernel stack",
            ctx.esp
        );
        let delta = to.stack.wrapping_sub(from.stack);
        self.copy_kernel_stack(ctx.esp, ctx.esp.wrapping_add(delta), from.stack - ctx.esp);
        self.rebase_frame_chain(ctx.ebp, &from, delta);

        let child_frame = if frame == 0 { 0 } else { frame.wrapping_add(delta) };
        if let Some(c) = self.tree.get_mut(plan.child) {
            c.thread.context = ctx.rebased(delta);
            c.thread.magic = FORK_MAGIC;
            c.syscall_frame = child_frame;
        }

        if let Some(start) = plan.thread {
            self.stage_thread(plan.child, child_frame, start)?;
        }
        Ok(())
    }

    /// Point the child's saved system call frame at `start.func` with the
    /// argument and [`THREAD_RETURN`] pushed on its user stack.
    fn stage_thread(&mut self, child: Pid, frame: u32, start: ThreadStart) -> Result<(), ProcError> {
        let dir = self
            .tree
            .get(child)
            .ok_or(ProcError::NoSuchProcess(child))?
            .thread
            .directory;
        let mem = UserMemory::new(AddressSpace::from_root(self.mapper, dir));
        let sp = start.stack.wrapping_sub(8);
        mem.write_u32(sp + 4, start.arg)?;
        mem.write_u32(sp, THREAD_RETURN)?;

        let regs = unsafe {
            self.mapper
                .phys_to_mut::<SyscallFrame>(PhysicalAddress::new(frame))
        };
        regs.ebp = start.stack;
        regs.eip = start.func;
        regs.esp = sp;
        regs.useresp = sp;
        regs.eax = 0;
        Ok(())
    }

    /// Shift every saved frame pointer in the copied stack that points into
    /// the parent's stack, so the child unwinds through its own frames.
    ///
    /// `ebp` is the parent's frame pointer at the checkpoint. The
    /// walk stops at the first link leaving the parent's stack or not
    /// moving towards its top.
    fn rebase_frame_chain(&self, ebp: u32, from: &Image, delta: u32) {
        let inside = |at: u32| at >= from.stack_base() && at <= from.stack - 4;
        let mut at = ebp;
        while inside(at) {
            let link = unsafe {
                self.mapper
                    .phys_to_mut::<u32>(PhysicalAddress::new(at.wrapping_add(delta)))
            };
            let saved = *link;
            if !inside(saved) || saved <= at {
                break;
            }
            *link = saved.wrapping_add(delta);
            at = saved;
        }
    }

    /// Copy `len` bytes between kernel stacks (identity mapped).
    fn copy_kernel_stack(&self, src: u32, dst: u32, len: u32) {
        let mut done = 0;
        while done < len {
            let (s, d) = (src + done, dst + done);
            let (so, dof) = ((s % PAGE_SIZE) as usize, (d % PAGE_SIZE) as usize);
            let n = (PAGE_SIZE - s % PAGE_SIZE)
                .min(PAGE_SIZE - d % PAGE_SIZE)
                .min(len - done);
            let from = unsafe { self.frame(s - s % PAGE_SIZE) };
            let to = unsafe { self.frame(d - d % PAGE_SIZE) };
            to[dof..dof + n as usize].copy_from_slice(&from[so..so + n as usize]);
            done += n;
        }
    }

    unsafe fn frame<'a>(&self, pa: u32) -> &'a mut [u8; 4096] {
        unsafe {
            self.mapper
                .phys_to_mut::<[u8; 4096]>(PhysicalAddress::new(pa))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::mock::MockCpu;
    use kernel_vmem::sim::{SimFrames, SimPhys};

    /// Kernel directory with heap tables and an 8-page init stack inside
    /// simulated memory.
    pub(crate) fn boot<'m>(
        phys: &'m SimPhys,
        frames: &mut SimFrames,
    ) -> (Scheduler<'m, SimPhys>, u32) {
        let kernel = AddressSpace::alloc(phys, frames).unwrap();
        kernel.init(frames).unwrap();
        let stack = frames.alloc_contiguous(KERNEL_STACK_PAGES).unwrap();
        let top = stack.as_u32() + KERNEL_STACK_SIZE;
        let mut s = Scheduler::new(phys);
        s.spawn_init(top, KERNEL_STACK_SIZE, kernel.root(), 0);
        (s, top)
    }

    #[test]
    fn init_is_current_and_root() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (s, top) = boot(&phys, &mut frames);
        assert_eq!(s.getpid(), Some(Pid::INIT));
        let init = s.current().unwrap();
        assert_eq!(init.name, "init");
        assert_eq!(init.cwd, "/");
        assert_eq!(init.image.stack, top);
        assert!(init.started);
        assert_eq!(s.tree().root(), Some(Pid::INIT));
    }

    #[test]
    fn spawn_inherits_and_links() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        s.current_mut().unwrap().cwd = "/bin".into();
        s.current_mut().unwrap().image.heap = 0x4000_5000;

        let pid = s.spawn_process(&mut frames, Pid::INIT).unwrap();
        assert_eq!(pid, Pid(1));
        let child = s.get_process(pid).unwrap();
        assert_eq!(child.name, "unnamed process");
        assert_eq!(child.cwd, "/bin");
        assert_eq!(child.image.heap, 0x4000_5000);
        assert_eq!(child.image.stack_size, KERNEL_STACK_SIZE);
        assert!(frames.is_allocated(PhysicalAddress::new(child.image.stack_base())));
        assert_eq!(s.tree().children(Pid::INIT), &[pid]);
        assert_eq!(
            s.spawn_process(&mut frames, Pid(77)),
            Err(ProcError::NoSuchProcess(Pid(77)))
        );
    }

    #[test]
    fn spawn_without_stack_memory_fails() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        frames.set_limit(frames.allocated() + 3);
        assert_eq!(
            s.spawn_process(&mut frames, Pid::INIT),
            Err(ProcError::OutOfStacks)
        );
    }

    #[test]
    fn fork_returns_once_on_each_side() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        phys.write(PhysicalAddress::new(top - 16), &[1, 2, 3, 4]);

        let mut cpu = MockCpu::taken_at(top - 64, top - 32);
        let plan = s.prepare_fork(&mut frames).unwrap();
        let parent_side = s.resolve_fork(&plan, cpu.snapshot()).unwrap();
        assert_eq!(parent_side, ForkOutcome::Parent(Pid(1)));

        let child = s.get_process(Pid(1)).unwrap();
        let delta = child.image.stack.wrapping_sub(top);
        assert_eq!(
            child.thread.context,
            Context {
                esp: (top - 64).wrapping_add(delta),
                ebp: (top - 32).wrapping_add(delta),
                eip: 0xC0DE,
                ..Context::default()
            }
        );
        assert_eq!(child.thread.magic, FORK_MAGIC);
        assert_ne!(child.thread.directory, s.kernel_directory());
        assert_eq!(
            phys.read(PhysicalAddress::new(child.image.stack - 16))[..4],
            [1, 2, 3, 4]
        );
        let (child_ctx, child_top) = (child.thread.context, child.image.stack);

        // Preempt init; the child is next.
        s.switch_task(&mut cpu, &mut frames, true);
        assert_eq!(s.getpid(), Some(Pid(1)));
        assert_eq!(cpu.resumed.last().map(|t| t.context), Some(child_ctx));
        assert_eq!(cpu.kernel_stacks.last(), Some(&child_top));

        // The child wakes up inside the same fork.
        assert_eq!(
            s.resolve_fork(&plan, Snapshot::Resumed).unwrap(),
            ForkOutcome::Child
        );
    }

    #[test]
    #[should_panic(expected = "Bad fork() magic (child)")]
    fn child_side_requires_staged_context() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let plan = s.prepare_fork(&mut frames).unwrap();
        let _ = s.resolve_fork(&plan, Snapshot::Resumed);
    }

    /// Reuses the checkpoint's stack area as soon as `checkpoint` returns,
    /// like the next call on real hardware would.
    struct FrameReusingCpu<'a> {
        cpu: MockCpu,
        phys: &'a SimPhys,
        at: Context,
    }

    impl ContextSwitch for FrameReusingCpu<'_> {
        fn checkpoint<R>(&mut self, taken: impl FnOnce(&mut Self, Context) -> R) -> Snapshot<R> {
            let ctx = self.at;
            let out = taken(self, ctx);
            self.phys.write(PhysicalAddress::new(ctx.esp), &[0xEE; 8]);
            Snapshot::Taken(out)
        }

        fn resume(&mut self, thread: &crate::process::Thread) {
            self.cpu.resume(thread);
        }

        fn set_kernel_stack(&mut self, top: u32) {
            self.cpu.set_kernel_stack(top);
        }

        fn enter_userspace(&mut self, entry: &crate::context::UserEntry) {
            self.cpu.enter_userspace(entry);
        }
    }

    #[test]
    fn fork_copies_the_stack_before_the_checkpoint_returns() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        let resume_frame = top - 64;
        phys.write(PhysicalAddress::new(resume_frame), b"ret+regs");

        let mut cpu = FrameReusingCpu {
            cpu: MockCpu::default(),
            phys: &phys,
            at: Context {
                esp: resume_frame,
                ebp: top - 32,
                eip: 0xC0DE,
                ..Context::default()
            },
        };
        assert_eq!(s.fork(&mut cpu, &mut frames), Ok(ForkOutcome::Parent(Pid(1))));

        // The parent's copy of the area is gone; the child's is intact.
        assert_eq!(phys.read(PhysicalAddress::new(resume_frame))[..8], [0xEE; 8]);
        let child = s.get_process(Pid(1)).unwrap();
        let at = child.thread.context.esp;
        assert_eq!(at, resume_frame.wrapping_add(child.image.stack.wrapping_sub(top)));
        assert_eq!(&phys.read(PhysicalAddress::new(at))[..8], b"ret+regs");
    }

    #[test]
    fn fork_rebases_saved_frame_pointers() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        // Two frames on the parent stack, then the outermost link leaves it.
        let (inner, outer) = (top - 32, top - 16);
        phys.write(PhysicalAddress::new(inner), &outer.to_le_bytes());
        phys.write(PhysicalAddress::new(outer), &0u32.to_le_bytes());

        let mut cpu = MockCpu::taken_at(top - 48, inner);
        let ForkOutcome::Parent(child) = s.fork(&mut cpu, &mut frames).unwrap() else {
            panic!("expected the parent side");
        };
        let child_top = s.get_process(child).unwrap().image.stack;
        let delta = child_top.wrapping_sub(top);

        let link = phys.read(PhysicalAddress::new(inner.wrapping_add(delta)));
        assert_eq!(link[..4], outer.wrapping_add(delta).to_le_bytes());
        let last = phys.read(PhysicalAddress::new(outer.wrapping_add(delta)));
        assert_eq!(last[..4], [0, 0, 0, 0]);
        // The parent's own chain is untouched.
        assert_eq!(phys.read(PhysicalAddress::new(inner))[..4], outer.to_le_bytes());
    }

    #[test]
    fn fork_copies_private_memory() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        let kernel = UserMemory::new(AddressSpace::from_root(&phys, s.kernel_directory()));
        kernel
            .ensure_page(&mut frames, VirtualAddress::new(0x4000_0000))
            .unwrap();
        kernel.write(0x4000_0000, b"parent").unwrap();

        let mut cpu = MockCpu::taken_at(top - 32, top - 16);
        let ForkOutcome::Parent(child) = s.fork(&mut cpu, &mut frames).unwrap() else {
            panic!("expected the parent side");
        };
        let dir = s.get_process(child).unwrap().thread.directory;
        let copy = UserMemory::new(AddressSpace::from_root(&phys, dir));
        copy.write(0x4000_0000, b"child!").unwrap();

        let mut buf = [0; 6];
        kernel.read(0x4000_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn exit_then_reap_releases_everything() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        let mut cpu = MockCpu::taken_at(top - 64, top - 32);
        let ForkOutcome::Parent(child) = s.fork(&mut cpu, &mut frames).unwrap() else {
            panic!("expected the parent side");
        };
        let (dir, stack_base) = {
            let p = s.get_process(child).unwrap();
            (p.thread.directory, p.image.stack_base())
        };

        s.switch_task(&mut cpu, &mut frames, true);
        assert_eq!(s.getpid(), Some(child));
        s.task_exit(&mut cpu, 3);
        assert_eq!(s.getpid(), Some(Pid::INIT));
        let gone = s.get_process(child).unwrap();
        assert!(gone.finished);
        assert_eq!(gone.status, 3);

        // A finished process is never scheduled again.
        s.make_ready(child);
        assert_eq!(s.ready_len(), 0);

        // Init resumes inside its earlier switch and reaps.
        s.reap_queued(&mut frames);
        assert!(s.get_process(child).is_none());
        assert!(!frames.is_allocated(PhysicalAddress::new(stack_base)));
        assert!(!frames.is_allocated(dir));
    }

    #[test]
    fn resumed_switch_reaps() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        let first = s.spawn_process(&mut frames, Pid::INIT).unwrap();
        s.get_process_mut(first).unwrap().finished = true;
        s.make_reapable(first);

        let mut cpu = MockCpu::taken_at(top - 64, top - 32);
        s.fork(&mut cpu, &mut frames).unwrap();
        cpu.snapshots.push_back(Snapshot::Resumed);
        s.switch_task(&mut cpu, &mut frames, true);
        assert!(s.get_process(first).is_none());
        assert_eq!(s.getpid(), Some(Pid::INIT));
    }

    #[test]
    fn switch_without_ready_work_keeps_running() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let mut cpu = MockCpu::default();
        s.switch_task(&mut cpu, &mut frames, true);
        assert!(cpu.resumed.is_empty());
        assert!(s.current().unwrap().started);
    }

    #[test]
    fn ready_queue_is_fifo() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let a = s.spawn_process(&mut frames, Pid::INIT).unwrap();
        let b = s.spawn_process(&mut frames, Pid::INIT).unwrap();
        s.make_ready(a);
        s.make_ready(b);
        s.make_ready(a);
        assert_eq!(s.ready_len(), 2);

        let mut cpu = MockCpu::default();
        s.switch_next(&mut cpu);
        assert_eq!(s.getpid(), Some(a));
        s.switch_next(&mut cpu);
        assert_eq!(s.getpid(), Some(b));
    }

    #[test]
    fn init_cannot_be_deleted() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        assert_eq!(s.delete_process(Pid::INIT).err(), Some(ProcError::KillInit));
        let mut cpu = MockCpu::default();
        s.task_exit(&mut cpu, 1);
        assert!(!s.current().unwrap().finished);
    }

    #[test]
    fn reaping_reparents_grandchildren() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let a = s.spawn_process(&mut frames, Pid::INIT).unwrap();
        let b = s.spawn_process(&mut frames, a).unwrap();
        s.reap_process(&mut frames, a).unwrap();
        assert_eq!(s.tree().parent(b), Some(Pid::INIT));
        // Shares the kernel directory, which must survive.
        assert!(frames.is_allocated(s.kernel_directory()));
    }

    #[test]
    fn clone_stages_thread_entry() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, top) = boot(&phys, &mut frames);
        let mem = UserMemory::new(AddressSpace::from_root(&phys, s.kernel_directory()));
        mem.ensure_page(&mut frames, VirtualAddress::new(0x1000_0000))
            .unwrap();
        let frame_at = top - size_of::<SyscallFrame>() as u32;
        s.current_mut().unwrap().syscall_frame = frame_at;

        let mut cpu = MockCpu::taken_at(top - 128, top - 96);
        let out = s
            .clone(&mut cpu, &mut frames, 0x1000_1000, 0x4000_0100, 77)
            .unwrap();
        let ForkOutcome::Parent(child) = out else {
            panic!("expected the parent side");
        };
        let p = s.get_process(child).unwrap();
        assert_eq!(p.thread.directory, s.kernel_directory());
        assert_eq!(p.syscall_frame, frame_at.wrapping_add(p.image.stack.wrapping_sub(top)));

        let regs = unsafe { phys.phys_to_mut::<SyscallFrame>(PhysicalAddress::new(p.syscall_frame)) };
        assert_eq!(regs.eip, 0x4000_0100);
        assert_eq!(regs.ebp, 0x1000_1000);
        assert_eq!(regs.useresp, 0x1000_0FF8);
        assert_eq!(regs.esp, 0x1000_0FF8);
        assert_eq!(mem.read_u32(0x1000_0FFC).unwrap(), 77);
        assert_eq!(mem.read_u32(0x1000_0FF8).unwrap(), THREAD_RETURN);
    }

    #[test]
    fn clone_outside_syscall_is_refused() {
        let phys = SimPhys::with_frames(512);
        let mut frames = SimFrames::new(&phys);
        let (mut s, _) = boot(&phys, &mut frames);
        let mut cpu = MockCpu::default();
        assert_eq!(
            s.clone(&mut cpu, &mut frames, 0x1000_1000, 0, 0),
            Err(ProcError::NotInSyscall)
        );
    }
}
