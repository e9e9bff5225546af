//! Physical memory attributes.
//!
//! The physical address space is partitioned into regions, and regions into
//! pages. Every page carries a small attribute record ([`Pma`]) that gates
//! loads, stores and instruction fetches. Attributes are configured once,
//! before any hart starts executing, and sealed with
//! [`PmaManager::finish_config`].

use bitvec::vec::BitVec;
use log::debug;
use rangemap::RangeInclusiveMap;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Physical memory attributes of a single page.
///
/// A page is *mapped* iff any of `{read, write, exec}` is set. Memory-mapped
/// register pages are never also ICCM or DCCM. A page is *external to the
/// core* iff neither `dccm` nor `mmr` is set.
///
/// Only the six attribute bits exist, so comparing two `Pma` values for
/// equality compares exactly the access attributes. The straddle check on
/// misaligned accesses relies on this.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Pma(u8);

impl Pma {
    /// Page is readable by load instructions.
    pub const READ: Self = Self(1 << 0);
    /// Page is writable by store instructions.
    pub const WRITE: Self = Self(1 << 1);
    /// Page can be used for instruction fetch.
    pub const EXEC: Self = Self(1 << 2);
    /// Page holds memory-mapped registers (word-only, masked stores).
    pub const MMR: Self = Self(1 << 3);
    /// Page belongs to an instruction closely-coupled memory.
    pub const ICCM: Self = Self(1 << 4);
    /// Page belongs to a data closely-coupled memory.
    pub const DCCM: Self = Self(1 << 5);

    pub fn is_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_exec(self) -> bool {
        self.0 & Self::EXEC.0 != 0
    }

    /// True if the page holds memory-mapped registers.
    pub fn is_mmr(self) -> bool {
        self.0 & Self::MMR.0 != 0
    }

    pub fn is_iccm(self) -> bool {
        self.0 & Self::ICCM.0 != 0
    }

    pub fn is_dccm(self) -> bool {
        self.0 & Self::DCCM.0 != 0
    }

    /// True if the page is usable at all.
    pub fn is_mapped(self) -> bool {
        self.0 & (Self::READ.0 | Self::WRITE.0 | Self::EXEC.0) != 0
    }

    /// True if the page is external to the core (neither DCCM nor MMR).
    pub fn is_external(self) -> bool {
        !self.is_dccm() && !self.is_mmr()
    }

    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub(crate) fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Display for Pma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (attr, c) in [
            (Self::READ, 'r'),
            (Self::WRITE, 'w'),
            (Self::EXEC, 'x'),
            (Self::MMR, 'm'),
            (Self::ICCM, 'i'),
            (Self::DCCM, 'd'),
        ] {
            f.write_fmt(format_args!(
                "{}",
                if self.0 & attr.0 != 0 { c } else { '-' }
            ))?;
        }
        Ok(())
    }
}

/// Kind of a specially-attributed area, in definition terms.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum AreaKind {
    Iccm,
    Dccm,
    Mmr,
}

impl AreaKind {
    /// Tag used in configuration error messages. The MMR tag is `pic`: on
    /// the modeled platform the register window belongs to the programmable
    /// interrupt controller.
    fn tag(self) -> &'static str {
        match self {
            AreaKind::Iccm => "iccm",
            AreaKind::Dccm => "dccm",
            AreaKind::Mmr => "pic",
        }
    }

    fn attribs(self) -> Pma {
        match self {
            AreaKind::Iccm => Pma::EXEC.union(Pma::ICCM),
            AreaKind::Dccm => Pma::READ.union(Pma::WRITE).union(Pma::DCCM),
            AreaKind::Mmr => Pma::READ.union(Pma::WRITE).union(Pma::MMR),
        }
    }
}

/// Per-page attribute map for a memory of a fixed size.
///
/// Freshly constructed, every full page of the memory is `{read, write,
/// exec}`: the whole memory is ordinary main memory. Defining ICCM/DCCM/MMR
/// areas and calling [`finish_config`](Self::finish_config) refines this.
#[derive(Debug)]
pub struct PmaManager {
    /// One attribute record per page. Addresses past the last full page are
    /// treated as unmapped.
    page_attribs: Vec<Pma>,

    page_size: u64,
    page_shift: u32,
    region_size: u64,
    region_shift: u32,
    region_mask: u64,

    /// Regions that contain at least one CCM or MMR area. Pages of such a
    /// region that are not themselves CCM/MMR become unmapped when the
    /// configuration is sealed.
    region_configured: BitVec,

    /// All defined CCM/MMR areas, for overlap rejection.
    areas: RangeInclusiveMap<u64, AreaKind>,

    /// Write masks of memory-mapped registers, keyed by word-aligned
    /// address. Missing entries mean "all bits writable".
    masks: HashMap<u64, u32>,

    sealed: bool,
}

impl PmaManager {
    /// Layout parameters are validated by [`crate::MemoryConfig`]; `page_size`
    /// and `region_size` must be powers of two here.
    pub(crate) fn new(size: u64, page_size: u64, region_size: u64) -> Self {
        let page_count = size / page_size;
        let region_count = size.div_ceil(region_size).next_power_of_two().max(1);

        const_assert!(usize::BITS >= 32);
        let mut region_configured = BitVec::new();
        region_configured.resize(region_count as usize, false);

        Self {
            page_attribs: vec![
                Pma::READ.union(Pma::WRITE).union(Pma::EXEC);
                page_count as usize
            ],
            page_size,
            page_shift: page_size.trailing_zeros(),
            region_size,
            region_shift: region_size.trailing_zeros(),
            region_mask: region_count - 1,
            region_configured,
            areas: RangeInclusiveMap::new(),
            masks: HashMap::new(),
            sealed: false,
        }
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.page_size
    }

    pub(crate) fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Returns the number of the page containing `address`.
    pub(crate) fn page_index(&self, address: u64) -> u64 {
        address >> self.page_shift
    }

    /// Returns the start address of the page containing `address`.
    pub(crate) fn page_start_addr(&self, address: u64) -> u64 {
        (address >> self.page_shift) << self.page_shift
    }

    /// Returns the number of the region containing `address`.
    pub(crate) fn region_index(&self, address: u64) -> u64 {
        (address >> self.region_shift) & self.region_mask
    }

    /// Returns the attributes of the page containing `address`.
    ///
    /// This is total: addresses past the last full page of the memory return
    /// an unmapped [`Pma`].
    pub fn get_pma(&self, address: u64) -> Pma {
        self.page_attribs
            .get(self.page_index(address) as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Define an instruction closely-coupled memory. Its pages become
    /// `{exec, iccm}`; read/write access is decided at
    /// [`finish_config`](Self::finish_config) time.
    pub fn define_iccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.define_area(AreaKind::Iccm, address, size)
    }

    /// Define a data closely-coupled memory. Its pages become
    /// `{read, write, dccm}`.
    pub fn define_dccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.define_area(AreaKind::Dccm, address, size)
    }

    /// Define a memory-mapped register area. Its pages become
    /// `{read, write, mmr}`; stores are word-only and masked per word.
    pub fn define_mmr_area(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.define_area(AreaKind::Mmr, address, size)
    }

    fn define_area(&mut self, kind: AreaKind, address: u64, size: u64) -> Result<(), ConfigError> {
        let tag = kind.tag();
        if self.sealed {
            return Err(ConfigError::Sealed { tag });
        }
        // CCMs are carved out of the page table and must cover whole pages.
        // A register window may be smaller: it must only be word-aligned,
        // and the pages it touches become MMR pages.
        let alignment = match kind {
            AreaKind::Iccm | AreaKind::Dccm => self.page_size,
            AreaKind::Mmr => 4,
        };
        if address % alignment != 0 {
            return Err(ConfigError::UnalignedArea { tag, address });
        }
        if size == 0 || size % alignment != 0 {
            return Err(ConfigError::BadAreaSize { tag, size });
        }
        let memory_size = self.page_attribs.len() as u64 * self.page_size;
        if address
            .checked_add(size)
            .map(|end| end > memory_size)
            .unwrap_or(true)
        {
            return Err(ConfigError::AreaOutOfBounds { tag, address, size });
        }

        let range = address..=address + size - 1;
        if self.areas.overlaps(&range) {
            return Err(ConfigError::OverlappingArea { tag, address, size });
        }
        self.areas.insert(range, kind);

        let first_page = self.page_index(address) as usize;
        let last_page = self.page_index(address + size - 1) as usize;
        for attribs in &mut self.page_attribs[first_page..=last_page] {
            *attribs = kind.attribs();
        }

        let first_region = self.region_index(address) as usize;
        let last_region = self.region_index(address + size - 1) as usize;
        for region in first_region..=last_region {
            self.region_configured.set(region, true);
        }

        debug!("defined {tag} area [{address:#x}, {:#x})", address + size);
        Ok(())
    }

    /// Define the write mask of the memory-mapped register in the word
    /// containing `address`. Fails if `address` is not within a previously
    /// defined memory-mapped register area.
    pub fn define_mmr_mask(&mut self, address: u64, mask: u32) -> Result<(), ConfigError> {
        if self.sealed {
            return Err(ConfigError::Sealed { tag: "pic" });
        }
        if !self.get_pma(address).is_mmr() {
            return Err(ConfigError::MaskOutsideMmr { address });
        }
        self.masks.insert(address & !3, mask);
        Ok(())
    }

    /// Returns the write mask of the word containing `address`. All-ones for
    /// words without an explicit mask and for non-MMR addresses; callers must
    /// gate on [`Pma::is_mmr`] first.
    pub fn mmr_mask(&self, address: u64) -> u32 {
        self.masks.get(&(address & !3)).copied().unwrap_or(u32::MAX)
    }

    /// The defined memory-mapped register areas as `(start, end)` byte
    /// ranges, end exclusive.
    pub(crate) fn mmr_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.areas
            .iter()
            .filter(|(_, kind)| **kind == AreaKind::Mmr)
            .map(|(range, _)| (*range.start(), *range.end() + 1))
    }

    /// Seal the attribute map.
    ///
    /// Every region containing a CCM or MMR area is refined: its pages that
    /// carry none of `{iccm, dccm, mmr}` become unmapped, making the closely
    /// coupled areas the only accessible parts of their region. If
    /// `iccm_readwrite` is set, ICCM pages additionally become readable and
    /// writable.
    pub fn finish_config(&mut self, iccm_readwrite: bool) {
        let pages_per_region = (self.region_size / self.page_size) as usize;
        for region in self.region_configured.iter_ones() {
            let first_page = region * pages_per_region;
            let last_page = (first_page + pages_per_region).min(self.page_attribs.len());
            let mut unmapped = 0usize;
            for attribs in &mut self.page_attribs[first_page..last_page] {
                if !attribs.is_iccm() && !attribs.is_dccm() && !attribs.is_mmr() {
                    *attribs = Pma::default();
                    unmapped += 1;
                } else if attribs.is_iccm() && iccm_readwrite {
                    attribs.insert(Pma::READ.union(Pma::WRITE));
                }
            }
            debug!("region {region}: sealed with {unmapped} pages unmapped");
        }
        self.sealed = true;
    }
}

/// Error in the memory attribute configuration.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("{tag}: area address {address:#x} is not aligned")]
    UnalignedArea { tag: &'static str, address: u64 },
    #[error("{tag}: area size {size:#x} is not a non-zero multiple of the required alignment")]
    BadAreaSize { tag: &'static str, size: u64 },
    #[error("{tag}: area [{address:#x}, {address:#x} + {size:#x}) extends beyond the memory")]
    AreaOutOfBounds {
        tag: &'static str,
        address: u64,
        size: u64,
    },
    #[error("{tag}: area [{address:#x}, {address:#x} + {size:#x}) overlaps a previously defined area")]
    OverlappingArea {
        tag: &'static str,
        address: u64,
        size: u64,
    },
    #[error("pic: address {address:#x} is outside any memory-mapped register area")]
    MaskOutsideMmr { address: u64 },
    #[error("{tag}: memory configuration is already sealed")]
    Sealed { tag: &'static str },
    #[error("{what} ({value:#x}) must be a power of two")]
    NotPowerOfTwo { what: &'static str, value: u64 },
    #[error("memory size {0:#x} exceeds the host address space")]
    SizeExceedsHost(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_1mib() -> PmaManager {
        PmaManager::new(1 << 20, 4096, 256 * 1024 * 1024)
    }

    #[test]
    fn fresh_memory_is_main_memory() {
        let mgr = manager_1mib();
        let pma = mgr.get_pma(0);
        assert!(pma.is_read() && pma.is_write() && pma.is_exec());
        assert!(pma.is_mapped() && pma.is_external());
        assert!(!pma.is_mmr() && !pma.is_iccm() && !pma.is_dccm());
    }

    #[test]
    fn out_of_range_is_unmapped() {
        let mgr = manager_1mib();
        assert!(!mgr.get_pma(1 << 20).is_mapped());
        assert!(!mgr.get_pma(u64::MAX).is_mapped());
    }

    #[test]
    fn page_and_region_indices() {
        let mgr = manager_1mib();
        assert_eq!(mgr.page_index(0x1FFF), 1);
        assert_eq!(mgr.page_start_addr(0x1FFF), 0x1000);
        assert_eq!(mgr.region_index(0x1FFF), 0);
    }

    #[test]
    fn unaligned_area_names_tag() {
        let mut mgr = manager_1mib();
        assert_eq!(
            mgr.define_iccm(0x100, 0x1000),
            Err(ConfigError::UnalignedArea {
                tag: "iccm",
                address: 0x100
            })
        );
        assert_eq!(
            mgr.define_dccm(0x1000, 0x10),
            Err(ConfigError::BadAreaSize {
                tag: "dccm",
                size: 0x10
            })
        );
        assert!(matches!(
            mgr.define_mmr_area(0x2000, 0),
            Err(ConfigError::BadAreaSize { tag: "pic", .. })
        ));
        assert!(matches!(
            mgr.define_mmr_area(0x2002, 0x100),
            Err(ConfigError::UnalignedArea { tag: "pic", .. })
        ));
    }

    #[test]
    fn mmr_area_may_cover_part_of_a_page() {
        let mut mgr = manager_1mib();
        // A register window needs only word granularity; the page it lives
        // on becomes an MMR page.
        mgr.define_mmr_area(0x30000, 0x100).unwrap();
        assert!(mgr.get_pma(0x30000).is_mmr());
        assert!(mgr.get_pma(0x30FFC).is_mmr());
        assert!(!mgr.get_pma(0x31000).is_mmr());
    }

    #[test]
    fn overlapping_areas_are_rejected() {
        let mut mgr = manager_1mib();
        mgr.define_iccm(0x10000, 0x2000).unwrap();
        assert!(matches!(
            mgr.define_dccm(0x11000, 0x1000),
            Err(ConfigError::OverlappingArea { tag: "dccm", .. })
        ));
        // Adjacent is fine.
        mgr.define_dccm(0x12000, 0x1000).unwrap();
    }

    #[test]
    fn area_past_end_of_memory_is_rejected() {
        let mut mgr = manager_1mib();
        assert!(matches!(
            mgr.define_iccm(0xFF000, 0x2000),
            Err(ConfigError::AreaOutOfBounds { tag: "iccm", .. })
        ));
    }

    #[test]
    fn defined_areas_carry_their_attributes() {
        let mut mgr = manager_1mib();
        mgr.define_iccm(0x10000, 0x1000).unwrap();
        mgr.define_dccm(0x20000, 0x1000).unwrap();
        mgr.define_mmr_area(0x30000, 0x1000).unwrap();

        let iccm = mgr.get_pma(0x10000);
        assert!(iccm.is_exec() && iccm.is_iccm() && !iccm.is_read());
        let dccm = mgr.get_pma(0x20000);
        assert!(dccm.is_read() && dccm.is_write() && dccm.is_dccm() && !dccm.is_exec());
        let mmr = mgr.get_pma(0x30000);
        assert!(mmr.is_read() && mmr.is_write() && mmr.is_mmr() && !mmr.is_external());
    }

    #[test]
    fn finish_config_unmaps_rest_of_configured_region() {
        let mut mgr = manager_1mib();
        mgr.define_iccm(0x10000, 0x1000).unwrap();
        assert!(mgr.get_pma(0x0).is_mapped());
        mgr.finish_config(false);
        // The ICCM's region loses its plain pages; the ICCM itself stays.
        assert!(!mgr.get_pma(0x0).is_mapped());
        assert!(mgr.get_pma(0x10000).is_exec());
        // Without iccm_readwrite the ICCM stays fetch-only.
        assert!(!mgr.get_pma(0x10000).is_read());
    }

    #[test]
    fn finish_config_iccm_readwrite() {
        let mut mgr = manager_1mib();
        mgr.define_iccm(0x10000, 0x1000).unwrap();
        mgr.finish_config(true);
        let pma = mgr.get_pma(0x10000);
        assert!(pma.is_exec() && pma.is_read() && pma.is_write());
    }

    #[test]
    fn define_after_seal_fails() {
        let mut mgr = manager_1mib();
        mgr.finish_config(false);
        assert_eq!(
            mgr.define_iccm(0x10000, 0x1000),
            Err(ConfigError::Sealed { tag: "iccm" })
        );
    }

    #[test]
    fn mmr_masks_default_to_all_ones() {
        let mut mgr = manager_1mib();
        mgr.define_mmr_area(0x30000, 0x1000).unwrap();
        assert_eq!(mgr.mmr_mask(0x30000), u32::MAX);
        mgr.define_mmr_mask(0x30000, 0x0000_FFFF).unwrap();
        assert_eq!(mgr.mmr_mask(0x30000), 0x0000_FFFF);
        // The mask belongs to the whole word.
        assert_eq!(mgr.mmr_mask(0x30003), 0x0000_FFFF);
        assert_eq!(mgr.mmr_mask(0x30004), u32::MAX);
        // Non-MMR addresses also read all-ones.
        assert_eq!(mgr.mmr_mask(0x0), u32::MAX);
    }

    #[test]
    fn mmr_mask_outside_area_fails() {
        let mut mgr = manager_1mib();
        mgr.define_mmr_area(0x30000, 0x1000).unwrap();
        assert_eq!(
            mgr.define_mmr_mask(0x4000, 0xFF),
            Err(ConfigError::MaskOutsideMmr { address: 0x4000 })
        );
    }

    #[test]
    fn pma_display() {
        assert_eq!(
            Pma::READ.union(Pma::WRITE).union(Pma::EXEC).to_string(),
            "rwx---"
        );
        assert_eq!(Pma::default().to_string(), "------");
    }
}
