use crate::{Dtb, Va};

/// An error that can occur when working with the introspection core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred in the hypervisor channel.
    #[error(transparent)]
    Channel(Box<dyn std::error::Error + Send + Sync>),

    /// A page is not present and could not be materialized.
    #[error("page not mapped ({va}, root: {dtb})")]
    NotMapped {
        /// The virtual address of the missing page.
        va: Va,

        /// The root of the page-table hierarchy used for the walk.
        dtb: Dtb,
    },

    /// The preconditions for page-fault injection did not hold.
    #[error("page fault injection refused")]
    InjectionRefused,

    /// The channel rejected the injected interrupt.
    #[error("page fault injection failed")]
    InjectionFailed,

    /// No operating-system plugin matched the running guest.
    #[error("no operating system plugin matched the guest")]
    OsPluginUnavailable,

    /// An operation was invoked in a state it cannot be served in.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl Error {
    /// Creates a new not-mapped error for the given address and root.
    pub fn not_mapped(va: Va, dtb: Dtb) -> Self {
        Self::NotMapped { va, dtb }
    }
}
