bitflags::bitflags! {
    /// Permissions and caching attributes of a leaf mapping.
    ///
    /// `PRESENT` is implied by every mapping call and therefore not a flag.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct MappingFlags: u64 {
        /// Writes allowed; read-only otherwise.
        const WRITABLE      = 1 << 1;
        /// Accessible from CPL 3.
        const USER          = 1 << 2;
        /// Write-through caching, typically for MMIO.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const NO_CACHE      = 1 << 4;
        /// Not flushed by CR3 reloads. Only for kernel mappings.
        const GLOBAL        = 1 << 8;
        /// Instruction fetches fault.
        const NO_EXECUTE    = 1 << 63;
    }
}

impl MappingFlags {
    /// Kernel read/write data.
    pub const KERNEL_DATA: Self = Self::WRITABLE.union(Self::NO_EXECUTE);

    /// User read/write data.
    pub const USER_DATA: Self = Self::WRITABLE
        .union(Self::USER)
        .union(Self::NO_EXECUTE);
}
