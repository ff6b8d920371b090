use crate::process::{Pid, Thread};

/// Written into [`Thread::magic`] when a forked context is staged; the child
/// checks for it when it first wakes up.
pub const FORK_MAGIC: u32 = 0xF3F5;

/// A resume point inside a kernel stack.
///
/// Besides the stack and frame pointers and the resume address this holds
/// the callee-saved registers, which the compiler expects intact when the
/// checkpoint returns a second time. Only `esp` and `ebp` are rebased when a
/// stack is copied; a callee-saved register that points into the old stack
/// keeps pointing there.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Context {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
}

impl Context {
    /// Shift the stack and frame pointers by `delta` bytes (two's complement).
    #[must_use]
    pub const fn rebased(self, delta: u32) -> Self {
        Self {
            esp: self.esp.wrapping_add(delta),
            ebp: self.ebp.wrapping_add(delta),
            ..self
        }
    }
}

/// Result of [`ContextSwitch::checkpoint`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Snapshot<T = Context> {
    /// First return, carrying what the `taken` continuation produced.
    Taken(T),
    /// Second return, after some context jumped back to the saved point.
    Resumed,
}

/// Which side of a `fork` the caller is on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ForkOutcome {
    Parent(Pid),
    Child,
}

/// The first ring-3 entry into an `exec`'d image.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct UserEntry {
    pub entry: u32,
    /// User stack pointer; `argc` and `argv` are already pushed.
    pub stack: u32,
    pub argc: u32,
    pub argv: u32,
}

/// The CPU side of context switching.
///
/// On hardware [`resume`](Self::resume) and
/// [`enter_userspace`](Self::enter_userspace) never return and
/// [`checkpoint`](Self::checkpoint) returns twice; host mocks return
/// normally and the scheduler copes with both.
pub trait ContextSwitch {
    /// Record a resume point and run `taken` with it, still inside the
    /// frame the point belongs to. Returns [`Snapshot::Taken`] with its
    /// result, and [`Snapshot::Resumed`] when a [`resume`](Self::resume)
    /// of that context comes back here.
    ///
    /// Everything that copies the stack or leaves the current thread must
    /// happen in `taken`: once `checkpoint` returns, the frame the resume
    /// point refers to is gone. `taken` must not own anything with drop
    /// glue.
    fn checkpoint<R>(&mut self, taken: impl FnOnce(&mut Self, Context) -> R) -> Snapshot<R>;

    /// Load `thread`'s page directory and jump into its saved context,
    /// making its `checkpoint` return [`Snapshot::Resumed`].
    fn resume(&mut self, thread: &Thread);

    /// Kernel stack the CPU switches to on a ring 3 → ring 0 transition.
    fn set_kernel_stack(&mut self, top: u32);

    /// Drop to ring 3 at `entry.entry` with `entry.stack`.
    fn enter_userspace(&mut self, entry: &UserEntry);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;
    use kernel_memory_addresses::PhysicalAddress;

    /// Replays queued snapshots (defaulting to a fixed `Taken`) and records
    /// every jump.
    #[derive(Default)]
    pub(crate) struct MockCpu {
        pub snapshots: VecDeque<Snapshot>,
        pub resumed: Vec<Thread>,
        pub kernel_stacks: Vec<u32>,
        pub entered: Vec<UserEntry>,
        pub directory: PhysicalAddress,
    }

    impl MockCpu {
        pub fn taken_at(esp: u32, ebp: u32) -> Self {
            let mut cpu = Self::default();
            cpu.snapshots.push_back(Snapshot::Taken(Context {
                esp,
                ebp,
                eip: 0xC0DE,
                ..Context::default()
            }));
            cpu
        }

        /// The next queued outcome, or a fixed `Taken`.
        pub fn snapshot(&mut self) -> Snapshot {
            self.snapshots.pop_front().unwrap_or(Snapshot::Taken(Context {
                eip: 0xC0DE,
                ..Context::default()
            }))
        }
    }

    impl ContextSwitch for MockCpu {
        fn checkpoint<R>(&mut self, taken: impl FnOnce(&mut Self, Context) -> R) -> Snapshot<R> {
            match self.snapshot() {
                Snapshot::Taken(ctx) => Snapshot::Taken(taken(self, ctx)),
                Snapshot::Resumed => Snapshot::Resumed,
            }
        }

        fn resume(&mut self, thread: &Thread) {
            self.directory = thread.directory;
            self.resumed.push(*thread);
        }

        fn set_kernel_stack(&mut self, top: u32) {
            self.kernel_stacks.push(top);
        }

        fn enter_userspace(&mut self, entry: &UserEntry) {
            self.entered.push(*entry);
        }
    }
}
