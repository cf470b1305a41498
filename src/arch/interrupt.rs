use crate::Va;

/// Exception vectors of the AMD64 architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionVector {
    /// #DE - Divide error.
    DivideError = 0,

    /// #DB - Debug exception.
    DebugException = 1,

    /// #BP - Breakpoint (`INT3`).
    Breakpoint = 3,

    /// #UD - Invalid opcode.
    InvalidOpcode = 6,

    /// #GP - General protection fault.
    GeneralProtection = 13,

    /// #PF - Page fault.
    PageFault = 14,
}

bitflags::bitflags! {
    /// Error code pushed by a page-fault exception.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PfError: u32 {
        /// The fault was caused by a protection violation (0 = not-present).
        const PRESENT = 1 << 0;

        /// The access causing the fault was a write.
        const WRITE = 1 << 1;

        /// The access originated in user mode.
        const USER = 1 << 2;
    }
}

/// An interrupt or exception to be injected into a virtual CPU.
#[derive(Debug, Clone, Copy)]
pub struct Interrupt {
    /// Vector number of the interrupt.
    pub vector: ExceptionVector,

    /// Error code associated with the interrupt.
    pub error_code: u32,

    /// For page faults, the faulting linear address (i.e. `CR2`).
    pub cr2: Va,
}

impl Interrupt {
    /// Creates a new page-fault exception.
    pub fn page_fault(va: Va, error_code: PfError) -> Self {
        Self {
            vector: ExceptionVector::PageFault,
            error_code: error_code.bits(),
            cr2: va,
        }
    }
}
