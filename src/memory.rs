use std::{
    cell::{Cell, RefCell},
    num::NonZeroUsize,
};

use lru::LruCache;

use crate::{
    arch::{translate, Amd64, Translation},
    channel::Channel,
    inject,
    os::{OsPlugin, Process},
    state::{BreakState, Controller, CONTROL_VCPU},
    Dtb, Error, Pa, Register, Va,
};

const PAGE_SIZE: usize = Amd64::PAGE_SIZE as usize;

/// The guest-memory facade: per-process context switching, paged reads and
/// writes, and virtual-to-physical exposure.
///
/// Translations are cached between two pauses; [`update`] flushes the cache
/// on every break so no translation outlives the pause it was made in.
///
/// [`update`]: Memory::update
#[derive(Debug)]
pub(crate) struct Memory {
    contexts: RefCell<Vec<Process>>,
    v2p: RefCell<LruCache<(Va, Dtb), Pa>>,
    num_page_faults: Cell<u64>,
}

impl Memory {
    const V2P_CACHE_SIZE: usize = 8192;

    pub(crate) fn new() -> Self {
        Self {
            contexts: RefCell::new(Vec::new()),
            v2p: RefCell::new(LruCache::new(
                NonZeroUsize::new(Self::V2P_CACHE_SIZE).unwrap(),
            )),
            num_page_faults: Cell::new(0),
        }
    }

    /// Called by the execution controller on every pause.
    pub(crate) fn update(&self, _state: &BreakState) {
        self.invalidate();
    }

    /// Drops every cached translation.
    pub(crate) fn invalidate(&self) {
        self.v2p.borrow_mut().clear();
    }

    pub(crate) fn count_page_fault(&self) {
        self.num_page_faults.set(self.num_page_faults.get() + 1);
    }

    pub(crate) fn page_fault_count(&self) -> u64 {
        self.num_page_faults.get()
    }

    /// Establishes `proc` as the context for subsequent accesses until the
    /// returned guard is released. Nested switches form a stack.
    pub(crate) fn switch_process(&self, proc: Process) -> ProcessContext<'_> {
        self.contexts.borrow_mut().push(proc);
        ProcessContext { memory: self }
    }

    /// Resolves the context an access to `va` should use: the top of the
    /// context stack (kernel root for kernel addresses, user root
    /// otherwise), or the current `CR3` when no context is established.
    fn effective_context<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        va: Va,
    ) -> Result<(Option<Process>, Dtb), Error>
    where
        C: Channel,
    {
        if let Some(proc) = self.contexts.borrow().last().copied() {
            let dtb = if os.is_kernel_address(va) {
                proc.kdtb
            } else {
                proc.udtb
            };
            return Ok((Some(proc), dtb));
        }

        let cr3 = channel.read_register(CONTROL_VCPU, Register::Cr3)?;
        Ok((None, Dtb(cr3)))
    }

    pub(crate) fn read<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        controller: &Controller,
        buffer: &mut [u8],
        src: Va,
    ) -> Result<(), Error>
    where
        C: Channel,
    {
        let (proc, dtb) = self.effective_context(channel, os, src)?;

        let mut page = [0u8; PAGE_SIZE];
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let addr = src + position as u64;
            let base = Amd64::va_align_down(addr);
            let offset = Amd64::va_offset(addr) as usize;

            self.read_page(channel, os, controller, &mut page, base, proc.as_ref(), dtb)?;

            let size = std::cmp::min(remaining, PAGE_SIZE - offset);
            buffer[position..position + size].copy_from_slice(&page[offset..offset + size]);

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn read_page<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        controller: &Controller,
        page: &mut [u8; PAGE_SIZE],
        base: Va,
        proc: Option<&Process>,
        dtb: Dtb,
    ) -> Result<(), Error>
    where
        C: Channel,
    {
        match translate(channel, base, dtb)? {
            Translation::Mapped(pa) => channel.read_physical(page, pa),
            Translation::ZeroPage => {
                page.fill(0);
                Ok(())
            }
            Translation::Fault => {
                inject::try_inject_page_fault(channel, os, controller, self, proc, base)
                    .map_err(|err| match err {
                        Error::InjectionRefused => Error::not_mapped(base, dtb),
                        err => err,
                    })?;

                // The page is materialized now; let the channel walk it.
                channel.read_virtual(page, base, dtb)
            }
        }
    }

    pub(crate) fn write<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        controller: &Controller,
        dst: Va,
        buffer: &[u8],
    ) -> Result<(), Error>
    where
        C: Channel,
    {
        let (proc, dtb) = self.effective_context(channel, os, dst)?;

        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let addr = dst + position as u64;
            let offset = Amd64::va_offset(addr) as usize;

            let size = std::cmp::min(remaining, PAGE_SIZE - offset);
            let chunk = &buffer[position..position + size];

            self.write_page(channel, os, controller, addr, proc.as_ref(), dtb, chunk)?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_page<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        controller: &Controller,
        addr: Va,
        proc: Option<&Process>,
        dtb: Dtb,
        chunk: &[u8],
    ) -> Result<(), Error>
    where
        C: Channel,
    {
        match translate(channel, Amd64::va_align_down(addr), dtb)? {
            Translation::Mapped(pa) => {
                channel.write_physical(pa + Amd64::va_offset(addr), chunk)
            }
            // No zero-page shortcut on writes.
            Translation::ZeroPage | Translation::Fault => {
                inject::try_inject_page_fault(channel, os, controller, self, proc, addr)
                    .map_err(|err| match err {
                        Error::InjectionRefused => Error::not_mapped(addr, dtb),
                        err => err,
                    })?;

                channel.write_virtual(addr, dtb, chunk)
            }
        }
    }

    /// Translates `va` over `dtb` (or the effective context), materializing
    /// the page once if it is not present.
    pub(crate) fn virtual_to_physical<C>(
        &self,
        channel: &C,
        os: &dyn OsPlugin<C>,
        controller: &Controller,
        va: Va,
        dtb: Option<Dtb>,
    ) -> Result<Pa, Error>
    where
        C: Channel,
    {
        let (proc, dtb) = match dtb {
            Some(dtb) => (self.contexts.borrow().last().copied(), dtb),
            None => self.effective_context(channel, os, va)?,
        };

        if let Some(pa) = self.v2p.borrow_mut().get(&(va, dtb)) {
            return Ok(*pa);
        }

        let pa = match translate(channel, va, dtb)? {
            Translation::Mapped(pa) => pa,
            _ => {
                inject::try_inject_page_fault(channel, os, controller, self, proc.as_ref(), va)
                    .map_err(|err| match err {
                        Error::InjectionRefused => Error::not_mapped(va, dtb),
                        err => err,
                    })?;

                match translate(channel, va, dtb)? {
                    Translation::Mapped(pa) => pa,
                    _ => return Err(Error::not_mapped(va, dtb)),
                }
            }
        };

        self.v2p.borrow_mut().put((va, dtb), pa);
        Ok(pa)
    }
}

/// A scoped process context.
///
/// Releasing the guard restores the previous context on every exit path,
/// including unwinding.
pub struct ProcessContext<'a> {
    memory: &'a Memory,
}

impl Drop for ProcessContext<'_> {
    fn drop(&mut self) {
        if self.memory.contexts.borrow_mut().pop().is_none() {
            tracing::error!("process context stack underflow");
        }
    }
}
