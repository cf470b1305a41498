use serde::{Deserialize, Serialize};

use crate::{Channel, Dtb, Error, Va};

/// A guest process.
///
/// Carries both translation roots of the process: the kernel directory table
/// base and the user one. Produced only by the bound OS plugin and immutable
/// afterwards.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Process {
    /// The OS-level process object (e.g. an `EPROCESS` address).
    pub object: Va,

    /// The kernel directory table base.
    pub kdtb: Dtb,

    /// The user directory table base.
    pub udtb: Dtb,
}

/// An OS-level module handle, opaque to the core.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Module(pub Va);

/// An OS-level virtual memory area handle, opaque to the core.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VmArea(pub Va);

/// A contiguous range of guest virtual addresses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// The start address of the range.
    pub addr: Va,

    /// The size of the range in bytes.
    pub size: u64,
}

impl Span {
    /// The exclusive end address of the range.
    pub fn end(&self) -> Va {
        self.addr + self.size
    }

    /// Checks whether `[addr, addr + len)` lies entirely inside the range.
    pub fn contains(&self, addr: Va, len: u64) -> bool {
        addr >= self.addr && addr.0 + len <= self.addr.0 + self.size
    }
}

/// The operating-system abstraction consumed by the core.
///
/// A plugin parses guest kernel structures through the channel; the core
/// never interprets them itself. List operations deliver items through a
/// callback which returns `false` to stop the enumeration.
pub trait OsPlugin<C>
where
    C: Channel,
{
    /// The name of the plugin, for diagnostics.
    fn name(&self) -> &'static str;

    /// Enumerates the guest processes.
    fn list_procs(
        &self,
        channel: &C,
        on_proc: &mut dyn FnMut(Process) -> bool,
    ) -> Result<(), Error>;

    /// Returns the process currently scheduled on the break CPU.
    fn get_current_proc(&self, channel: &C) -> Result<Option<Process>, Error>;

    /// Finds a process by name.
    fn get_proc(&self, channel: &C, name: &str) -> Result<Option<Process>, Error>;

    /// Returns the name of a process.
    fn get_proc_name(&self, channel: &C, proc: Process) -> Result<Option<String>, Error>;

    /// Enumerates the modules of a process.
    fn list_mods(
        &self,
        channel: &C,
        proc: Process,
        on_mod: &mut dyn FnMut(Module) -> bool,
    ) -> Result<(), Error>;

    /// Returns the name of a module.
    fn get_mod_name(
        &self,
        channel: &C,
        proc: Process,
        module: Module,
    ) -> Result<Option<String>, Error>;

    /// Returns the address range occupied by a module.
    fn get_mod_span(&self, channel: &C, proc: Process, module: Module)
        -> Result<Option<Span>, Error>;

    /// Checks whether the process owns a user address space.
    fn has_virtual(&self, channel: &C, proc: Process) -> Result<bool, Error>;

    /// Finds the virtual memory area of a process containing `addr`.
    fn vm_area_find(&self, channel: &C, proc: Process, addr: Va)
        -> Result<Option<VmArea>, Error>;

    /// Returns the address range covered by a virtual memory area.
    fn vm_area_span(&self, channel: &C, proc: Process, area: VmArea)
        -> Result<Option<Span>, Error>;

    /// Checks whether `addr` belongs to the kernel half of the address space.
    fn is_kernel_address(&self, addr: Va) -> bool;
}

/// A probe constructing a plugin when it recognizes the running guest.
pub type OsPluginProbe<C> =
    Box<dyn Fn(&C) -> Result<Option<Box<dyn OsPlugin<C>>>, Error>>;

/// An ordered registry of OS-plugin probes.
///
/// Probes are consulted in registration order at setup; the first probe that
/// recognizes the guest binds its plugin. A probe may read guest physical
/// memory through the channel.
pub struct OsPluginRegistry<C>
where
    C: Channel,
{
    probes: Vec<(&'static str, OsPluginProbe<C>)>,
}

impl<C> Default for OsPluginRegistry<C>
where
    C: Channel,
{
    fn default() -> Self {
        Self { probes: Vec::new() }
    }
}

impl<C> OsPluginRegistry<C>
where
    C: Channel,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a probe with the given name.
    pub fn register(
        &mut self,
        name: &'static str,
        probe: impl Fn(&C) -> Result<Option<Box<dyn OsPlugin<C>>>, Error> + 'static,
    ) {
        self.probes.push((name, Box::new(probe)));
    }

    /// Probes the registry against the live guest and binds the first match.
    pub fn probe(&self, channel: &C) -> Result<Box<dyn OsPlugin<C>>, Error> {
        for (name, probe) in &self.probes {
            match probe(channel) {
                Ok(Some(plugin)) => {
                    tracing::debug!(plugin = name, "bound os plugin");
                    return Ok(plugin);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(plugin = name, ?err, "os plugin probe failed");
                }
            }
        }

        Err(Error::OsPluginUnavailable)
    }
}
