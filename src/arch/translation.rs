use smallvec::SmallVec;

use super::{mask, Amd64, PageTableEntry, PageTableLevel};
use crate::{Channel, Dtb, Error, Pa, Va};

/// The result of a page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// The address is backed by a physical page.
    Mapped(Pa),

    /// The address resolves to the shared all-zero page.
    ///
    /// The walker does not currently produce this variant; it is part of the
    /// contract so that readers zero-fill instead of faulting when an OS
    /// plugin resolves an address to a demand-zero mapping.
    ZeroPage,

    /// A non-present entry was encountered; the page must be materialized
    /// before it can be accessed.
    Fault,
}

impl Translation {
    /// Returns the physical address if the translation is mapped.
    pub fn pa(self) -> Option<Pa> {
        match self {
            Self::Mapped(pa) => Some(pa),
            _ => None,
        }
    }

    /// Checks whether the translation is backed by a physical page.
    pub fn is_mapped(self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

/// A single entry visited during a page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkEntry {
    /// The level of the page-table hierarchy this entry belongs to.
    pub level: PageTableLevel,

    /// The entry itself.
    pub entry: PageTableEntry,

    /// The physical address the entry was read from.
    pub entry_address: Pa,
}

/// Collection of entries visited during a page-table walk.
pub type WalkEntries = SmallVec<[WalkEntry; 4]>;

/// A page-table walk together with the entries it traversed.
#[derive(Debug)]
pub struct PageWalk {
    /// The entries visited, highest level first.
    pub entries: WalkEntries,

    /// The outcome of the walk.
    pub translation: Translation,
}

fn read_entry<C>(channel: &C, entry_address: Pa) -> Result<PageTableEntry, Error>
where
    C: Channel,
{
    let mut buffer = [0u8; 8];
    channel.read_physical(&mut buffer, entry_address)?;
    Ok(PageTableEntry(u64::from_le_bytes(buffer)))
}

/// Walks the four-level paging hierarchy rooted at `dtb` for `va`.
///
/// The walk is pure over the channel's physical-read primitive: no caching,
/// no side effects on the guest. It terminates at the first level whose
/// entry maps a large page, or at the PT level; a non-present entry at any
/// level yields [`Translation::Fault`] without probing further. Channel
/// read failures propagate as errors.
pub fn walk<C>(channel: &C, va: Va, dtb: Dtb) -> Result<PageWalk, Error>
where
    C: Channel,
{
    let mut entries = WalkEntries::new();

    let pml4e_base = dtb.0 & (mask(40) << 12);
    let pml4e_ptr = Pa(pml4e_base) + Amd64::va_index_for(va, PageTableLevel::Pml4) * 8;
    let pml4e = read_entry(channel, pml4e_ptr)?;
    entries.push(WalkEntry {
        level: PageTableLevel::Pml4,
        entry: pml4e,
        entry_address: pml4e_ptr,
    });

    if !pml4e.present() {
        return Ok(PageWalk {
            entries,
            translation: Translation::Fault,
        });
    }

    let pdpe_ptr =
        Amd64::pa_from_gfn(pml4e.pfn()) + Amd64::va_index_for(va, PageTableLevel::Pdpt) * 8;
    let pdpe = read_entry(channel, pdpe_ptr)?;
    entries.push(WalkEntry {
        level: PageTableLevel::Pdpt,
        entry: pdpe,
        entry_address: pdpe_ptr,
    });

    if !pdpe.present() {
        return Ok(PageWalk {
            entries,
            translation: Translation::Fault,
        });
    }

    // 1GB page.
    if pdpe.large() {
        let base = pdpe.0 & (mask(22) << 30);
        let offset = va.0 & mask(30);
        return Ok(PageWalk {
            entries,
            translation: Translation::Mapped(Pa(base + offset)),
        });
    }

    let pde_ptr = Amd64::pa_from_gfn(pdpe.pfn()) + Amd64::va_index_for(va, PageTableLevel::Pd) * 8;
    let pde = read_entry(channel, pde_ptr)?;
    entries.push(WalkEntry {
        level: PageTableLevel::Pd,
        entry: pde,
        entry_address: pde_ptr,
    });

    if !pde.present() {
        return Ok(PageWalk {
            entries,
            translation: Translation::Fault,
        });
    }

    // 2MB page.
    if pde.large() {
        let base = pde.0 & (mask(31) << 21);
        let offset = va.0 & mask(21);
        return Ok(PageWalk {
            entries,
            translation: Translation::Mapped(Pa(base + offset)),
        });
    }

    let pte_ptr = Amd64::pa_from_gfn(pde.pfn()) + Amd64::va_index_for(va, PageTableLevel::Pt) * 8;
    let pte = read_entry(channel, pte_ptr)?;
    entries.push(WalkEntry {
        level: PageTableLevel::Pt,
        entry: pte,
        entry_address: pte_ptr,
    });

    if !pte.present() {
        return Ok(PageWalk {
            entries,
            translation: Translation::Fault,
        });
    }

    let pa = Amd64::pa_from_gfn(pte.pfn()) + Amd64::va_offset(va);
    Ok(PageWalk {
        entries,
        translation: Translation::Mapped(pa),
    })
}

/// Translates a virtual address to a physical address over the paging
/// hierarchy rooted at `dtb`.
pub fn translate<C>(channel: &C, va: Va, dtb: Dtb) -> Result<Translation, Error>
where
    C: Channel,
{
    Ok(walk(channel, va, dtb)?.translation)
}
