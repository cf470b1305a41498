use crate::{
    arch::{is_user_mode, Amd64, Interrupt, PfError, Register},
    channel::Channel,
    memory::Memory,
    os::{OsPlugin, Process},
    state::{Controller, CONTROL_VCPU},
    Dtb, Error, Va,
};

/// Interrupt request level of a Windows guest, read from `CR8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Irql {
    Passive,
    Apc,
    Dispatch,
}

impl Irql {
    pub(crate) fn from_cr8(value: u64) -> Self {
        match value {
            0 => Self::Passive,
            1 => Self::Apc,
            _ => Self::Dispatch,
        }
    }
}

/// Attempts to materialize the page containing `src` by injecting a page
/// fault into the guest and resuming it until the faulting instruction is
/// reached again.
///
/// Refusals are expected and cheap; the gate refuses unless the address is
/// user-space, a process context is supplied, the guest runs below dispatch
/// level, the current `CR3` belongs to the process, and the full 4KB target
/// lies inside one of the process's virtual memory areas.
pub(crate) fn try_inject_page_fault<C>(
    channel: &C,
    os: &dyn OsPlugin<C>,
    controller: &Controller,
    memory: &Memory,
    proc: Option<&Process>,
    src: Va,
) -> Result<(), Error>
where
    C: Channel,
{
    // Never fault on kernel addresses.
    if os.is_kernel_address(src) {
        return Err(Error::InjectionRefused);
    }

    // Never fault without a process context.
    let Some(proc) = proc else {
        return Err(Error::InjectionRefused);
    };

    // Never fault at or above dispatch level.
    let irql = Irql::from_cr8(channel.read_register(CONTROL_VCPU, Register::Cr8)?);
    if irql >= Irql::Dispatch {
        return Err(Error::InjectionRefused);
    }

    // Never fault for a process that is not the current one.
    let cr3 = Dtb(channel.read_register(CONTROL_VCPU, Register::Cr3)?);
    if cr3 != proc.kdtb && cr3 != proc.udtb {
        return Err(Error::InjectionRefused);
    }

    // The target page must lie entirely inside a known area of the process.
    let Some(area) = os.vm_area_find(channel, *proc, src)? else {
        return Err(Error::InjectionRefused);
    };
    let Some(span) = os.vm_area_span(channel, *proc, area)? else {
        return Err(Error::InjectionRefused);
    };
    if !span.contains(src, Amd64::PAGE_SIZE) {
        return Err(Error::InjectionRefused);
    }

    // TODO check the area access rights once the plugins expose them

    memory.count_page_fault();

    let cs = channel.read_register(CONTROL_VCPU, Register::Cs)?;
    let error_code = if is_user_mode(cs) {
        PfError::USER
    } else {
        PfError::empty()
    };

    channel
        .inject_interrupt(CONTROL_VCPU, Interrupt::page_fault(src, error_code))
        .map_err(|err| {
            tracing::error!(?err, %src, "unable to inject page fault");
            Error::InjectionFailed
        })?;

    controller.run_to_current(channel, memory)
}
