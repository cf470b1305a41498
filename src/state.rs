use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use crate::{
    arch::Register,
    channel::{BreakReason, BreakpointKind, Channel, HwBreakpointId, VcpuId},
    memory::Memory,
    os::{OsPlugin, Process},
    Dtb, Error, Va,
};

/// The virtual CPU all control operations are issued on.
pub(crate) const CONTROL_VCPU: VcpuId = VcpuId(0);

/// Upper bound on resume/wait round trips while returning to the saved
/// instruction pointer. A nested fault that never comes back surfaces as an
/// error instead of hanging the caller.
const RUN_TO_CURRENT_LIMIT: usize = 4096;

/// Restricts when a breakpoint fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointFilter {
    /// Fires regardless of context.
    Any,

    /// Fires only when the current translation root belongs to the process.
    ByProcess(Process),

    /// Fires only when the current `CR3` equals the given root.
    ByDtb(Dtb),
}

impl BreakpointFilter {
    fn passes(&self, cr3: Dtb) -> bool {
        match self {
            Self::Any => true,
            Self::ByProcess(proc) => cr3 == proc.kdtb || cr3 == proc.udtb,
            Self::ByDtb(dtb) => cr3 == *dtb,
        }
    }
}

/// A callback invoked synchronously when its breakpoint is hit.
pub type Task = Box<dyn FnMut(&BreakState)>;

/// Snapshot of the guest context delivered on each pause.
#[derive(Debug, Clone, Copy)]
pub struct BreakState {
    /// The virtual CPU the guest stopped on.
    pub vcpu: VcpuId,

    /// The instruction pointer at the stop.
    pub rip: Va,

    /// The active translation root at the stop.
    pub cr3: Dtb,

    /// The code-segment selector at the stop.
    pub cs: u64,

    /// The process scheduled at the stop, if the OS plugin resolved one.
    pub proc: Option<Process>,

    /// Why the guest stopped.
    pub reason: BreakReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Paused,
    Running,
    Disposed,
}

struct Entry {
    id: u64,
    va: Va,
    hw_id: HwBreakpointId,
    filter: BreakpointFilter,
    task: Rc<RefCell<Task>>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("va", &self.va)
            .field("hw_id", &self.hw_id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Debug)]
struct Store {
    entries: Vec<Entry>,
    next_id: u64,
    pending_removals: Vec<HwBreakpointId>,
}

impl Store {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    fn remove(&mut self, id: u64) {
        if let Some(index) = self.entries.iter().position(|entry| entry.id == id) {
            let entry = self.entries.remove(index);
            self.pending_removals.push(entry.hw_id);
        }
    }
}

/// A registered breakpoint.
///
/// Dropping the handle removes the registration: the breakpoint stops
/// matching immediately, and the channel-level removal is queued until the
/// next moment a channel operation is legal (the next resume).
#[derive(Debug)]
pub struct Breakpoint {
    store: Rc<RefCell<Store>>,
    id: u64,
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        self.store.borrow_mut().remove(self.id);
    }
}

/// The execution controller: pause/resume/wait state machine plus the
/// breakpoint registry and dispatch.
#[derive(Debug)]
pub(crate) struct Controller {
    status: Cell<Status>,
    store: Rc<RefCell<Store>>,
}

impl Controller {
    pub(crate) fn new() -> Self {
        Self {
            status: Cell::new(Status::Paused),
            store: Rc::new(RefCell::new(Store::default())),
        }
    }

    pub(crate) fn ensure_paused(&self) -> Result<(), Error> {
        match self.status.get() {
            Status::Paused => Ok(()),
            Status::Running => Err(Error::IllegalState("guest is running")),
            Status::Disposed => Err(Error::IllegalState("core is disposed")),
        }
    }

    pub(crate) fn pause<C>(&self, channel: &C) -> Result<(), Error>
    where
        C: Channel,
    {
        match self.status.get() {
            Status::Paused => Ok(()),
            Status::Disposed => Err(Error::IllegalState("core is disposed")),
            Status::Running => {
                channel.pause()?;
                self.status.set(Status::Paused);
                Ok(())
            }
        }
    }

    pub(crate) fn resume<C>(&self, channel: &C) -> Result<(), Error>
    where
        C: Channel,
    {
        match self.status.get() {
            Status::Running => Ok(()),
            Status::Disposed => Err(Error::IllegalState("core is disposed")),
            Status::Paused => {
                self.flush_removals(channel);
                channel.resume()?;
                self.status.set(Status::Running);
                Ok(())
            }
        }
    }

    fn flush_removals<C>(&self, channel: &C)
    where
        C: Channel,
    {
        let pending: Vec<_> = self.store.borrow_mut().pending_removals.drain(..).collect();
        for id in pending {
            if let Err(err) = channel.remove_breakpoint(id) {
                tracing::error!(?err, ?id, "failed to remove breakpoint");
            }
        }
    }

    pub(crate) fn set_breakpoint<C>(
        &self,
        channel: &C,
        va: Va,
        filter: BreakpointFilter,
        task: Task,
    ) -> Result<Breakpoint, Error>
    where
        C: Channel,
    {
        self.ensure_paused()?;

        let dtb = match &filter {
            BreakpointFilter::ByDtb(dtb) => Some(*dtb),
            // A process owns two roots, so the match is done at dispatch.
            BreakpointFilter::ByProcess(_) | BreakpointFilter::Any => None,
        };
        let hw_id = channel.add_breakpoint(BreakpointKind::Software, va, dtb)?;

        let mut store = self.store.borrow_mut();
        let id = store.next_id;
        store.next_id += 1;
        store.entries.push(Entry {
            id,
            va,
            hw_id,
            filter,
            task: Rc::new(RefCell::new(task)),
        });

        Ok(Breakpoint {
            store: Rc::clone(&self.store),
            id,
        })
    }

    pub(crate) fn wait<C>(
        &self,
        channel: &C,
        memory: &Memory,
        os: &dyn OsPlugin<C>,
        timeout: Option<Duration>,
    ) -> Result<BreakState, Error>
    where
        C: Channel,
    {
        if self.status.get() == Status::Disposed {
            return Err(Error::IllegalState("core is disposed"));
        }

        self.resume(channel)?;
        let reason = channel.wait(timeout)?;

        if let BreakReason::Timeout = reason {
            // The guest keeps running; there is no context to snapshot and
            // nothing to dispatch.
            return Ok(BreakState {
                vcpu: CONTROL_VCPU,
                rip: Va(0),
                cr3: Dtb(0),
                cs: 0,
                proc: None,
                reason,
            });
        }

        self.status.set(Status::Paused);
        let state = self.snapshot(channel, os, reason)?;
        memory.update(&state);
        self.dispatch(&state);
        Ok(state)
    }

    pub(crate) fn single_step<C>(
        &self,
        channel: &C,
        memory: &Memory,
        os: &dyn OsPlugin<C>,
        vcpu: VcpuId,
    ) -> Result<BreakState, Error>
    where
        C: Channel,
    {
        self.ensure_paused()?;

        channel.single_step(vcpu)?;
        let state = self.snapshot(channel, os, BreakReason::SingleStep { vcpu })?;
        memory.update(&state);
        Ok(state)
    }

    fn snapshot<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        reason: BreakReason,
    ) -> Result<BreakState, Error>
    where
        C: Channel,
    {
        let vcpu = match reason {
            BreakReason::Breakpoint { vcpu, .. } | BreakReason::SingleStep { vcpu } => vcpu,
            _ => CONTROL_VCPU,
        };

        Ok(BreakState {
            vcpu,
            rip: Va(channel.read_register(vcpu, Register::Rip)?),
            cr3: Dtb(channel.read_register(vcpu, Register::Cr3)?),
            cs: channel.read_register(vcpu, Register::Cs)?,
            proc: os.get_current_proc(channel)?,
            reason,
        })
    }

    fn dispatch(&self, state: &BreakState) {
        let BreakReason::Breakpoint { id: hw_id, .. } = state.reason else {
            return;
        };

        // Snapshot the match set before invoking anything: registrations
        // share an address, and a task may add or remove breakpoints
        // mid-dispatch.
        let matches: Vec<(u64, Rc<RefCell<Task>>)> = {
            let store = self.store.borrow();
            let Some(va) = store
                .entries
                .iter()
                .find(|entry| entry.hw_id == hw_id)
                .map(|entry| entry.va)
            else {
                // Spurious or transient hit; return to the caller.
                return;
            };

            store
                .entries
                .iter()
                .filter(|entry| entry.va == va && entry.filter.passes(state.cr3))
                .map(|entry| (entry.id, Rc::clone(&entry.task)))
                .collect()
        };

        for (id, task) in matches {
            if !self.store.borrow().contains(id) {
                continue;
            }
            (task.borrow_mut())(state);
        }
    }

    /// Resumes the guest until the instruction pointer returns to its
    /// current position.
    ///
    /// Used after injecting a page fault: the guest services the fault and
    /// comes back to the faulting instruction. A transient channel-level
    /// breakpoint marks the spot; user tasks are not dispatched while
    /// pumping.
    pub(crate) fn run_to_current<C>(&self, channel: &C, memory: &Memory) -> Result<(), Error>
    where
        C: Channel,
    {
        let rip = Va(channel.read_register(CONTROL_VCPU, Register::Rip)?);
        let cr3 = Dtb(channel.read_register(CONTROL_VCPU, Register::Cr3)?);
        let hw_id = channel.add_breakpoint(BreakpointKind::Software, rip, Some(cr3))?;

        let result = self.pump_until(channel, rip);

        if let Err(err) = channel.remove_breakpoint(hw_id) {
            tracing::error!(?err, "failed to remove transient breakpoint");
        }
        memory.invalidate();
        result
    }

    fn pump_until<C>(&self, channel: &C, rip: Va) -> Result<(), Error>
    where
        C: Channel,
    {
        for _ in 0..RUN_TO_CURRENT_LIMIT {
            channel.resume()?;
            self.status.set(Status::Running);
            channel.wait(None)?;
            self.status.set(Status::Paused);

            let current = Va(channel.read_register(CONTROL_VCPU, Register::Rip)?);
            if current == rip {
                return Ok(());
            }
        }

        tracing::error!(%rip, "guest did not return to the faulting instruction");
        Err(Error::IllegalState("run_to_current iteration cap exceeded"))
    }

    /// Removes every remaining registration and marks the controller
    /// disposed. Called once during teardown, with the guest stopped.
    pub(crate) fn dispose<C>(&self, channel: &C)
    where
        C: Channel,
    {
        if self.status.get() == Status::Disposed {
            return;
        }

        {
            let mut store = self.store.borrow_mut();
            let remaining: Vec<_> = store.entries.iter().map(|entry| entry.hw_id).collect();
            store.pending_removals.extend(remaining);
            store.entries.clear();
        }
        self.flush_removals(channel);
        self.status.set(Status::Disposed);
    }
}
