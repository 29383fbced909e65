use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the three x86-64 translation granules.
///
/// Implemented only by [`Size4K`], [`Size2M`] and [`Size1G`].
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`, the number of offset bits inside one page.
    const SHIFT: u32;
    /// Short human-readable name.
    const NAME: &'static str;

    /// Number of 4 KiB frames covered by one page of this size.
    #[inline]
    #[must_use]
    fn frames() -> u64 {
        Self::SIZE >> Size4K::SHIFT
    }
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, the base translation granule.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page, a page-directory leaf.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page, a PDPT leaf.
    Size1G, 30, "1G"
);

const _: () = assert!(Size4K::SIZE == 4096);
const _: () = assert!(Size2M::SIZE == 512 * Size4K::SIZE);
const _: () = assert!(Size1G::SIZE == 512 * Size2M::SIZE);
