//! Shared mock fixtures for unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use crate::{
    arch::{self, Amd64, Interrupt, PageTableEntry, PageTableLevel, Register, Translation},
    BreakReason, BreakpointKind, Channel, Core, Dtb, Error, Gfn, HwBreakpointId, Module, OsPlugin,
    OsPluginRegistry, Pa, Process, Span, Va, VcpuId, VmArea,
};

/// Page-table GFNs used by the hierarchy builders.
pub(crate) const PML4_GFN: Gfn = Gfn(1);
pub(crate) const PDPT_GFN: Gfn = Gfn(2);
pub(crate) const PD_GFN: Gfn = Gfn(3);
pub(crate) const PT_GFN: Gfn = Gfn(4);
pub(crate) const DATA_GFN: Gfn = Gfn(5);

pub(crate) fn make_pte(gfn: Gfn) -> PageTableEntry {
    PageTableEntry((gfn.0 << 12) | 1)
}

pub(crate) fn make_large_pte(base: Pa) -> PageTableEntry {
    PageTableEntry(base.0 | (1 << 7) | 1)
}

/// A scriptable in-memory hypervisor channel.
#[derive(Debug)]
pub(crate) struct MockChannel {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    regs: RefCell<HashMap<(VcpuId, Register), u64>>,
    injected: RefCell<Vec<Interrupt>>,
    script: RefCell<VecDeque<BreakReason>>,
    breakpoints: RefCell<Vec<(HwBreakpointId, Va, Option<Dtb>)>>,
    removed: RefCell<Vec<HwBreakpointId>>,
    next_bp: Cell<u32>,
    pauses: Cell<u32>,
    resumes: Cell<u32>,
    steps: Cell<u32>,
    materialize_on_inject: RefCell<Option<(Pa, PageTableEntry)>>,
    fail_inject: Cell<bool>,
}

impl MockChannel {
    pub(crate) fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
            regs: RefCell::new(HashMap::new()),
            injected: RefCell::new(Vec::new()),
            script: RefCell::new(VecDeque::new()),
            breakpoints: RefCell::new(Vec::new()),
            removed: RefCell::new(Vec::new()),
            next_bp: Cell::new(1),
            pauses: Cell::new(0),
            resumes: Cell::new(0),
            steps: Cell::new(0),
            materialize_on_inject: RefCell::new(None),
            fail_inject: Cell::new(false),
        }
    }

    /// Inserts a blank 4KB page at the given GFN.
    pub(crate) fn insert_page(&self, gfn: Gfn) {
        self.pages
            .borrow_mut()
            .entry(gfn)
            .or_insert_with(|| vec![0u8; 4096]);
    }

    /// Writes raw bytes at the given physical address.
    pub(crate) fn write_bytes(&self, pa: Pa, bytes: &[u8]) {
        let gfn = Amd64::gfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa) as usize;
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .unwrap_or_else(|| panic!("no page at {:?}", gfn));
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Writes a page-table entry at the given physical address.
    pub(crate) fn write_pte(&self, pa: Pa, pte: PageTableEntry) {
        self.write_bytes(pa, &pte.0.to_le_bytes());
    }

    pub(crate) fn set_reg(&self, vcpu: VcpuId, register: Register, value: u64) {
        self.regs.borrow_mut().insert((vcpu, register), value);
    }

    pub(crate) fn push_break(&self, reason: BreakReason) {
        self.script.borrow_mut().push_back(reason);
    }

    pub(crate) fn last_breakpoint_id(&self) -> HwBreakpointId {
        self.breakpoints.borrow().last().expect("no breakpoints").0
    }

    pub(crate) fn active_breakpoints(&self) -> Vec<(HwBreakpointId, Va, Option<Dtb>)> {
        self.breakpoints.borrow().clone()
    }

    pub(crate) fn removed_breakpoints(&self) -> Vec<HwBreakpointId> {
        self.removed.borrow().clone()
    }

    pub(crate) fn injected(&self) -> Vec<Interrupt> {
        self.injected.borrow().clone()
    }

    pub(crate) fn pause_count(&self) -> u32 {
        self.pauses.get()
    }

    pub(crate) fn resume_count(&self) -> u32 {
        self.resumes.get()
    }

    /// Arranges for the next injected interrupt to "materialize" a page by
    /// writing the given page-table entry.
    pub(crate) fn materialize_on_inject(&self, pa: Pa, pte: PageTableEntry) {
        *self.materialize_on_inject.borrow_mut() = Some((pa, pte));
    }

    pub(crate) fn fail_injections(&self) {
        self.fail_inject.set(true);
    }

    fn entry_address(table: Gfn, va: Va, level: PageTableLevel) -> Pa {
        Amd64::pa_from_gfn(table) + Amd64::va_index_for(va, level) * 8
    }

    /// Builds a PML4 -> PDPT -> PD -> PT chain mapping `va` to `data_gfn`.
    pub(crate) fn build_full_hierarchy(&self, va: Va, data_gfn: Gfn) -> Dtb {
        self.insert_page(PML4_GFN);
        self.insert_page(PDPT_GFN);
        self.insert_page(PD_GFN);
        self.insert_page(PT_GFN);
        self.insert_page(data_gfn);

        self.write_pte(
            Self::entry_address(PML4_GFN, va, PageTableLevel::Pml4),
            make_pte(PDPT_GFN),
        );
        self.write_pte(
            Self::entry_address(PDPT_GFN, va, PageTableLevel::Pdpt),
            make_pte(PD_GFN),
        );
        self.write_pte(
            Self::entry_address(PD_GFN, va, PageTableLevel::Pd),
            make_pte(PT_GFN),
        );
        self.write_pte(
            Self::entry_address(PT_GFN, va, PageTableLevel::Pt),
            make_pte(data_gfn),
        );

        Dtb(Amd64::pa_from_gfn(PML4_GFN).0)
    }

    /// Builds a PML4 -> PDPT -> PD chain mapping `va` through a 2MB large
    /// page at `base`.
    pub(crate) fn build_2mb_hierarchy(&self, va: Va, base: Pa) -> Dtb {
        self.insert_page(PML4_GFN);
        self.insert_page(PDPT_GFN);
        self.insert_page(PD_GFN);

        self.write_pte(
            Self::entry_address(PML4_GFN, va, PageTableLevel::Pml4),
            make_pte(PDPT_GFN),
        );
        self.write_pte(
            Self::entry_address(PDPT_GFN, va, PageTableLevel::Pdpt),
            make_pte(PD_GFN),
        );
        self.write_pte(
            Self::entry_address(PD_GFN, va, PageTableLevel::Pd),
            make_large_pte(base),
        );

        Dtb(Amd64::pa_from_gfn(PML4_GFN).0)
    }

    /// Builds a PML4 -> PDPT chain mapping `va` through a 1GB large page at
    /// `base`.
    pub(crate) fn build_1gb_hierarchy(&self, va: Va, base: Pa) -> Dtb {
        self.insert_page(PML4_GFN);
        self.insert_page(PDPT_GFN);

        self.write_pte(
            Self::entry_address(PML4_GFN, va, PageTableLevel::Pml4),
            make_pte(PDPT_GFN),
        );
        self.write_pte(
            Self::entry_address(PDPT_GFN, va, PageTableLevel::Pdpt),
            make_large_pte(base),
        );

        Dtb(Amd64::pa_from_gfn(PML4_GFN).0)
    }

    fn read_u64_at(&self, pa: Pa) -> u64 {
        let gfn = Amd64::gfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa) as usize;
        let pages = self.pages.borrow();
        let page = pages
            .get(&gfn)
            .unwrap_or_else(|| panic!("no page at {:?}", gfn));
        u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
    }

    /// Returns the physical address of the PT-level entry for `va`.
    pub(crate) fn pte_address(&self, va: Va, dtb: Dtb) -> Pa {
        let pml4e = PageTableEntry(self.read_u64_at(Self::entry_address(
            Amd64::gfn_from_pa(Pa(dtb.0)),
            va,
            PageTableLevel::Pml4,
        )));
        let pdpe = PageTableEntry(self.read_u64_at(Self::entry_address(
            pml4e.pfn(),
            va,
            PageTableLevel::Pdpt,
        )));
        let pde = PageTableEntry(self.read_u64_at(Self::entry_address(
            pdpe.pfn(),
            va,
            PageTableLevel::Pd,
        )));
        Self::entry_address(pde.pfn(), va, PageTableLevel::Pt)
    }

    /// Marks the PT-level entry for `va` not-present.
    pub(crate) fn clear_pte(&self, va: Va, dtb: Dtb) {
        self.write_pte(self.pte_address(va, dtb), PageTableEntry(0));
    }
}

impl Channel for MockChannel {
    fn open(_name: &str) -> Result<Self, Error> {
        Ok(Self::new())
    }

    fn read_physical(&self, buffer: &mut [u8], pa: Pa) -> Result<(), Error> {
        let gfn = Amd64::gfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa) as usize;
        let pages = self.pages.borrow();
        let page = pages
            .get(&gfn)
            .ok_or_else(|| Error::Channel(format!("no page at {:?}", gfn).into()))?;
        if offset + buffer.len() > page.len() {
            return Err(Error::Channel("read crosses page boundary".into()));
        }
        buffer.copy_from_slice(&page[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write_physical(&self, pa: Pa, buffer: &[u8]) -> Result<(), Error> {
        let gfn = Amd64::gfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa) as usize;
        let mut pages = self.pages.borrow_mut();
        let page = pages
            .get_mut(&gfn)
            .ok_or_else(|| Error::Channel(format!("no page at {:?}", gfn).into()))?;
        if offset + buffer.len() > page.len() {
            return Err(Error::Channel("write crosses page boundary".into()));
        }
        page[offset..offset + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn read_virtual(&self, buffer: &mut [u8], va: Va, dtb: Dtb) -> Result<(), Error> {
        match arch::translate(self, va, dtb)? {
            Translation::Mapped(pa) => self.read_physical(buffer, pa),
            Translation::ZeroPage => {
                buffer.fill(0);
                Ok(())
            }
            Translation::Fault => Err(Error::Channel("virtual read of unmapped page".into())),
        }
    }

    fn write_virtual(&self, va: Va, dtb: Dtb, buffer: &[u8]) -> Result<(), Error> {
        match arch::translate(self, va, dtb)? {
            Translation::Mapped(pa) => self.write_physical(pa, buffer),
            _ => Err(Error::Channel("virtual write of unmapped page".into())),
        }
    }

    fn read_register(&self, vcpu: VcpuId, register: Register) -> Result<u64, Error> {
        Ok(self
            .regs
            .borrow()
            .get(&(vcpu, register))
            .copied()
            .unwrap_or(0))
    }

    fn write_register(&self, vcpu: VcpuId, register: Register, value: u64) -> Result<(), Error> {
        self.regs.borrow_mut().insert((vcpu, register), value);
        Ok(())
    }

    fn pause(&self) -> Result<(), Error> {
        self.pauses.set(self.pauses.get() + 1);
        Ok(())
    }

    fn resume(&self) -> Result<(), Error> {
        self.resumes.set(self.resumes.get() + 1);
        Ok(())
    }

    fn single_step(&self, _vcpu: VcpuId) -> Result<(), Error> {
        self.steps.set(self.steps.get() + 1);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<BreakReason, Error> {
        if let Some(reason) = self.script.borrow_mut().pop_front() {
            return Ok(reason);
        }

        // No scripted stop: report the most recent breakpoint if any, so
        // transient run-to-current breakpoints trip immediately.
        if let Some((id, _, _)) = self.breakpoints.borrow().last() {
            return Ok(BreakReason::Breakpoint {
                vcpu: VcpuId(0),
                id: *id,
            });
        }

        if timeout.is_some() {
            Ok(BreakReason::Timeout)
        } else {
            Ok(BreakReason::Pause)
        }
    }

    fn add_breakpoint(
        &self,
        _kind: BreakpointKind,
        va: Va,
        dtb: Option<Dtb>,
    ) -> Result<HwBreakpointId, Error> {
        let id = HwBreakpointId(self.next_bp.get());
        self.next_bp.set(self.next_bp.get() + 1);
        self.breakpoints.borrow_mut().push((id, va, dtb));
        Ok(id)
    }

    fn remove_breakpoint(&self, id: HwBreakpointId) -> Result<(), Error> {
        self.breakpoints.borrow_mut().retain(|(bp, _, _)| *bp != id);
        self.removed.borrow_mut().push(id);
        Ok(())
    }

    fn inject_interrupt(&self, _vcpu: VcpuId, interrupt: Interrupt) -> Result<(), Error> {
        if self.fail_inject.get() {
            return Err(Error::Channel("injection rejected".into()));
        }
        self.injected.borrow_mut().push(interrupt);
        if let Some((pa, pte)) = self.materialize_on_inject.borrow_mut().take() {
            self.write_pte(pa, pte);
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockOsInner {
    procs: RefCell<Vec<(Process, String)>>,
    vmas: RefCell<Vec<(Process, Span)>>,
    mods: RefCell<Vec<(Process, Module, String, Span)>>,
}

/// A configurable OS plugin with NT-style address-space semantics.
///
/// Clones share their configuration, so a test can keep a handle to the
/// plugin bound inside a [`Core`].
#[derive(Default, Clone)]
pub(crate) struct MockOs {
    inner: Rc<MockOsInner>,
}

impl MockOs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_proc(&self, proc: Process, name: &str) {
        self.inner.procs.borrow_mut().push((proc, name.to_string()));
    }

    pub(crate) fn add_vma(&self, proc: Process, span: Span) {
        self.inner.vmas.borrow_mut().push((proc, span));
    }

    pub(crate) fn add_mod(&self, proc: Process, module: Module, name: &str, span: Span) {
        self.inner
            .mods
            .borrow_mut()
            .push((proc, module, name.to_string(), span));
    }
}

impl OsPlugin<MockChannel> for MockOs {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_procs(
        &self,
        _channel: &MockChannel,
        on_proc: &mut dyn FnMut(Process) -> bool,
    ) -> Result<(), Error> {
        for (proc, _) in self.inner.procs.borrow().iter() {
            if !on_proc(*proc) {
                break;
            }
        }
        Ok(())
    }

    fn get_current_proc(&self, channel: &MockChannel) -> Result<Option<Process>, Error> {
        let cr3 = Dtb(channel.read_register(VcpuId(0), Register::Cr3)?);
        Ok(self
            .inner
            .procs
            .borrow()
            .iter()
            .map(|(proc, _)| *proc)
            .find(|proc| proc.kdtb == cr3 || proc.udtb == cr3))
    }

    fn get_proc(&self, _channel: &MockChannel, name: &str) -> Result<Option<Process>, Error> {
        Ok(self
            .inner
            .procs
            .borrow()
            .iter()
            .find(|(_, n)| n == name)
            .map(|(proc, _)| *proc))
    }

    fn get_proc_name(
        &self,
        _channel: &MockChannel,
        proc: Process,
    ) -> Result<Option<String>, Error> {
        Ok(self
            .inner
            .procs
            .borrow()
            .iter()
            .find(|(p, _)| *p == proc)
            .map(|(_, name)| name.clone()))
    }

    fn list_mods(
        &self,
        _channel: &MockChannel,
        proc: Process,
        on_mod: &mut dyn FnMut(Module) -> bool,
    ) -> Result<(), Error> {
        for (p, module, _, _) in self.inner.mods.borrow().iter() {
            if *p == proc && !on_mod(*module) {
                break;
            }
        }
        Ok(())
    }

    fn get_mod_name(
        &self,
        _channel: &MockChannel,
        proc: Process,
        module: Module,
    ) -> Result<Option<String>, Error> {
        Ok(self
            .inner
            .mods
            .borrow()
            .iter()
            .find(|(p, m, _, _)| *p == proc && *m == module)
            .map(|(_, _, name, _)| name.clone()))
    }

    fn get_mod_span(
        &self,
        _channel: &MockChannel,
        proc: Process,
        module: Module,
    ) -> Result<Option<Span>, Error> {
        Ok(self
            .inner
            .mods
            .borrow()
            .iter()
            .find(|(p, m, _, _)| *p == proc && *m == module)
            .map(|(_, _, _, span)| *span))
    }

    fn has_virtual(&self, _channel: &MockChannel, proc: Process) -> Result<bool, Error> {
        Ok(proc.udtb.0 != 0)
    }

    fn vm_area_find(
        &self,
        _channel: &MockChannel,
        proc: Process,
        addr: Va,
    ) -> Result<Option<VmArea>, Error> {
        Ok(self
            .inner
            .vmas
            .borrow()
            .iter()
            .find(|(p, span)| *p == proc && addr >= span.addr && addr < span.end())
            .map(|(_, span)| VmArea(span.addr)))
    }

    fn vm_area_span(
        &self,
        _channel: &MockChannel,
        proc: Process,
        area: VmArea,
    ) -> Result<Option<Span>, Error> {
        Ok(self
            .inner
            .vmas
            .borrow()
            .iter()
            .find(|(p, span)| *p == proc && span.addr == area.0)
            .map(|(_, span)| *span))
    }

    fn is_kernel_address(&self, addr: Va) -> bool {
        addr.0 & 0xFFF0_0000_0000_0000 != 0
    }
}

/// Builds a core over a fresh mock channel with `os` bound as the plugin.
pub(crate) fn core_with(os: &MockOs) -> Core<MockChannel> {
    let mut registry = OsPluginRegistry::new();
    let os = os.clone();
    registry.register("mock", move |_| {
        Ok(Some(Box::new(os.clone()) as Box<dyn OsPlugin<MockChannel>>))
    });
    Core::open_with("test", registry).expect("core setup")
}
