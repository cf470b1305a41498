use std::time::Duration;

use crate::{
    arch::{Interrupt, Register},
    Dtb, Error, Pa, Va,
};

/// A virtual CPU identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u16);

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A channel-level breakpoint identifier.
///
/// Identifiers are stable for the lifetime of the registration; removing a
/// breakpoint releases its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwBreakpointId(pub u32);

/// The kind of channel-level breakpoint to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Software breakpoint (`INT3` substitution).
    Software,

    /// Hardware breakpoint (debug register).
    Hardware,
}

/// The cause reported by the channel when the guest stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// A breakpoint was hit.
    Breakpoint {
        /// The virtual CPU that hit the breakpoint.
        vcpu: VcpuId,

        /// The channel-level identifier of the breakpoint.
        id: HwBreakpointId,
    },

    /// A single step completed.
    SingleStep {
        /// The virtual CPU that stepped.
        vcpu: VcpuId,
    },

    /// The guest was paused explicitly.
    Pause,

    /// The wait timed out; the guest keeps running.
    Timeout,
}

/// The hypervisor debug transport.
///
/// The transport itself (a shared-memory region on the reference hypervisor)
/// is consumed opaquely; this trait captures the operations the core needs.
/// Implementations are not required to be thread-safe: the execution
/// controller serializes every call, and no operation other than
/// [`inject_interrupt`], [`resume`] and [`wait`] is issued while the guest
/// is running.
///
/// [`inject_interrupt`]: Channel::inject_interrupt
/// [`resume`]: Channel::resume
/// [`wait`]: Channel::wait
pub trait Channel {
    /// Opens the channel by its symbolic name.
    fn open(name: &str) -> Result<Self, Error>
    where
        Self: Sized;

    /// Reads guest physical memory into `buffer`.
    fn read_physical(&self, buffer: &mut [u8], pa: Pa) -> Result<(), Error>;

    /// Writes `buffer` into guest physical memory.
    fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), Error>;

    /// Reads guest virtual memory using the channel's own page-table walk
    /// over the hierarchy rooted at `dtb`.
    fn read_virtual(&self, buffer: &mut [u8], va: Va, dtb: Dtb) -> Result<(), Error>;

    /// Writes guest virtual memory using the channel's own page-table walk
    /// over the hierarchy rooted at `dtb`.
    fn write_virtual(&self, va: Va, dtb: Dtb, buffer: &[u8]) -> Result<(), Error>;

    /// Reads a register of a virtual CPU.
    fn read_register(&self, vcpu: VcpuId, register: Register) -> Result<u64, Error>;

    /// Writes a register of a virtual CPU.
    fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> Result<(), Error>;

    /// Pauses the guest.
    fn pause(&self) -> Result<(), Error>;

    /// Resumes the guest.
    fn resume(&self) -> Result<(), Error>;

    /// Executes a single instruction on the given virtual CPU.
    fn single_step(&self, vcpu: VcpuId) -> Result<(), Error>;

    /// Blocks until the guest stops or the timeout expires.
    fn wait(&self, timeout: Option<Duration>) -> Result<BreakReason, Error>;

    /// Installs a channel-level breakpoint at `va`, optionally restricted to
    /// the address space rooted at `dtb`.
    fn add_breakpoint(
        &self,
        kind: BreakpointKind,
        va: Va,
        dtb: Option<Dtb>,
    ) -> Result<HwBreakpointId, Error>;

    /// Removes a channel-level breakpoint.
    fn remove_breakpoint(&self, id: HwBreakpointId) -> Result<(), Error>;

    /// Injects an interrupt into the given virtual CPU.
    fn inject_interrupt(&self, vcpu: VcpuId, interrupt: Interrupt) -> Result<(), Error>;
}
