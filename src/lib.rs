//! Virtual-machine introspection over a hypervisor debug channel.
//!
//! The [`Core`] handler composes a [`Channel`] (the hypervisor transport),
//! a guest-memory facade with transparent page-fault injection, an
//! execution controller with filtered breakpoints, and a bound
//! operating-system plugin. All calls on a core are serialized by the
//! caller; [`Core::wait`] is the only blocking operation.

pub mod arch;

mod addr;
mod channel;
mod error;
mod inject;
mod macros;
mod memory;
mod os;
mod state;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use zerocopy::{FromBytes, Immutable, IntoBytes};

pub use self::{
    addr::{Dtb, Gfn, Pa, Va},
    arch::Register,
    channel::{BreakReason, BreakpointKind, Channel, HwBreakpointId, VcpuId},
    error::Error,
    memory::ProcessContext,
    os::{Module, OsPlugin, OsPluginProbe, OsPluginRegistry, Process, Span, VmArea},
    state::{BreakState, Breakpoint, BreakpointFilter, Task},
};
use self::{memory::Memory, state::Controller};

/// The composed introspection handler.
///
/// Owns the channel exclusively; teardown removes any remaining breakpoints
/// and releases the channel, reversing construction order.
pub struct Core<C>
where
    C: Channel,
{
    channel: C,
    memory: Memory,
    state: Controller,
    os: Box<dyn OsPlugin<C>>,
}

impl<C> std::fmt::Debug for Core<C>
where
    C: Channel + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("channel", &self.channel)
            .field("memory", &self.memory)
            .field("state", &self.state)
            .field("os", &self.os.name())
            .finish()
    }
}

impl<C> Core<C>
where
    C: Channel,
{
    /// Opens the channel `name` and composes a core over it, binding the
    /// first plugin of `registry` that recognizes the running guest.
    ///
    /// The guest is paused once setup succeeds.
    pub fn open_with(name: &str, registry: OsPluginRegistry<C>) -> Result<Self, Error> {
        let channel = C::open(name)?;
        channel.pause()?;

        let memory = Memory::new();
        let state = Controller::new();
        let os = registry.probe(&channel)?;

        tracing::debug!(name, plugin = os.name(), "core ready");

        Ok(Self {
            channel,
            memory,
            state,
            os,
        })
    }

    /// Opens the channel `name` with the default (empty) plugin registry.
    ///
    /// OS plugins live outside this crate; without a registry carrying at
    /// least one probe, setup fails with [`Error::OsPluginUnavailable`].
    pub fn open(name: &str) -> Result<Self, Error> {
        Self::open_with(name, OsPluginRegistry::default())
    }

    /// Returns the underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Returns the number of page faults injected so far.
    pub fn page_fault_count(&self) -> u64 {
        self.memory.page_fault_count()
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Reads guest virtual memory in the effective process context.
    pub fn read(&self, src: Va, buffer: &mut [u8]) -> Result<(), Error> {
        self.state.ensure_paused()?;
        self.memory
            .read(&self.channel, self.os.as_ref(), &self.state, buffer, src)
    }

    /// Writes guest virtual memory in the effective process context.
    pub fn write(&self, dst: Va, buffer: &[u8]) -> Result<(), Error> {
        self.state.ensure_paused()?;
        self.memory
            .write(&self.channel, self.os.as_ref(), &self.state, dst, buffer)
    }

    /// Reads a single byte of guest memory.
    pub fn read_u8(&self, src: Va) -> Result<u8, Error> {
        let mut buffer = [0u8; 1];
        self.read(src, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer of guest memory.
    pub fn read_u16(&self, src: Va) -> Result<u16, Error> {
        let mut buffer = [0u8; 2];
        self.read(src, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer of guest memory.
    pub fn read_u32(&self, src: Va) -> Result<u32, Error> {
        let mut buffer = [0u8; 4];
        self.read(src, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer of guest memory.
    pub fn read_u64(&self, src: Va) -> Result<u64, Error> {
        let mut buffer = [0u8; 8];
        self.read(src, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a structure from guest memory.
    pub fn read_struct<T>(&self, src: Va) -> Result<T, Error>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(src, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a structure to guest memory.
    pub fn write_struct<T>(&self, dst: Va, value: T) -> Result<(), Error>
    where
        T: IntoBytes + Immutable,
    {
        self.write(dst, value.as_bytes())
    }

    /// Translates a guest virtual address to a physical address,
    /// materializing the page once if it is not present.
    ///
    /// Without an explicit `dtb` the effective process context is used.
    pub fn virtual_to_physical(&self, va: Va, dtb: Option<Dtb>) -> Result<Pa, Error> {
        self.state.ensure_paused()?;
        self.memory
            .virtual_to_physical(&self.channel, self.os.as_ref(), &self.state, va, dtb)
    }

    /// Establishes `proc` as the context for subsequent accesses until the
    /// returned guard is released. Nested switches form a stack.
    pub fn switch_process(&self, proc: Process) -> ProcessContext<'_> {
        self.memory.switch_process(proc)
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    /// Pauses the guest. Pausing a paused guest is a no-op.
    pub fn pause(&self) -> Result<(), Error> {
        self.state.pause(&self.channel)
    }

    /// Resumes the guest. Resuming a running guest is a no-op.
    pub fn resume(&self) -> Result<(), Error> {
        self.state.resume(&self.channel)
    }

    /// Blocks until the guest stops or `timeout` expires, dispatching
    /// matching breakpoint tasks before returning.
    ///
    /// A paused guest is resumed first. On timeout the guest keeps running
    /// and no task is dispatched.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<BreakState, Error> {
        self.state
            .wait(&self.channel, &self.memory, self.os.as_ref(), timeout)
    }

    /// Executes a single instruction on `vcpu` and returns the new guest
    /// context. No task is dispatched.
    pub fn single_step(&self, vcpu: VcpuId) -> Result<BreakState, Error> {
        self.state
            .single_step(&self.channel, &self.memory, self.os.as_ref(), vcpu)
    }

    /// Registers a breakpoint at `va`. The task runs synchronously inside
    /// [`wait`] whenever the breakpoint is hit and its filter passes.
    ///
    /// Several breakpoints may share an address; their tasks fire in
    /// registration order. Dropping the returned handle removes the
    /// registration.
    ///
    /// [`wait`]: Core::wait
    pub fn set_breakpoint(
        &self,
        va: Va,
        filter: BreakpointFilter,
        task: Task,
    ) -> Result<Breakpoint, Error> {
        self.state.set_breakpoint(&self.channel, va, filter, task)
    }

    // ------------------------------------------------------------------
    // Operating system
    // ------------------------------------------------------------------

    /// Enumerates the guest processes.
    pub fn list_procs(&self, on_proc: &mut dyn FnMut(Process) -> bool) -> Result<(), Error> {
        self.state.ensure_paused()?;
        self.os.list_procs(&self.channel, on_proc)
    }

    /// Returns the process currently scheduled on the break CPU.
    pub fn get_current_proc(&self) -> Result<Option<Process>, Error> {
        self.state.ensure_paused()?;
        self.os.get_current_proc(&self.channel)
    }

    /// Finds a process by name.
    pub fn get_proc(&self, name: &str) -> Result<Option<Process>, Error> {
        self.state.ensure_paused()?;
        self.os.get_proc(&self.channel, name)
    }

    /// Returns the name of a process.
    pub fn get_proc_name(&self, proc: Process) -> Result<Option<String>, Error> {
        self.state.ensure_paused()?;
        self.os.get_proc_name(&self.channel, proc)
    }

    /// Enumerates the modules of a process.
    pub fn list_mods(
        &self,
        proc: Process,
        on_mod: &mut dyn FnMut(Module) -> bool,
    ) -> Result<(), Error> {
        self.state.ensure_paused()?;
        self.os.list_mods(&self.channel, proc, on_mod)
    }

    /// Returns the name of a module.
    pub fn get_mod_name(&self, proc: Process, module: Module) -> Result<Option<String>, Error> {
        self.state.ensure_paused()?;
        self.os.get_mod_name(&self.channel, proc, module)
    }

    /// Returns the address range occupied by a module.
    pub fn get_mod_span(&self, proc: Process, module: Module) -> Result<Option<Span>, Error> {
        self.state.ensure_paused()?;
        self.os.get_mod_span(&self.channel, proc, module)
    }

    /// Checks whether the process owns a user address space.
    pub fn has_virtual(&self, proc: Process) -> Result<bool, Error> {
        self.state.ensure_paused()?;
        self.os.has_virtual(&self.channel, proc)
    }

    /// Finds the virtual memory area of a process containing `addr`.
    pub fn vm_area_find(&self, proc: Process, addr: Va) -> Result<Option<VmArea>, Error> {
        self.state.ensure_paused()?;
        self.os.vm_area_find(&self.channel, proc, addr)
    }

    /// Returns the address range covered by a virtual memory area.
    pub fn vm_area_span(&self, proc: Process, area: VmArea) -> Result<Option<Span>, Error> {
        self.state.ensure_paused()?;
        self.os.vm_area_span(&self.channel, proc, area)
    }

    /// Checks whether `addr` belongs to the kernel half of the address
    /// space.
    pub fn is_kernel_address(&self, addr: Va) -> bool {
        self.os.is_kernel_address(addr)
    }
}

impl<C> Drop for Core<C>
where
    C: Channel,
{
    fn drop(&mut self) {
        self.state.dispose(&self.channel);
    }
}
