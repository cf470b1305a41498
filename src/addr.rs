use crate::macros::impl_addr;

impl_addr!(Gfn, "guest frame number");
impl_addr!(Pa, "guest physical address");
impl_addr!(Va, "guest virtual address");
impl_addr!(Dtb, "directory table base (root of a page-table hierarchy)");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}
