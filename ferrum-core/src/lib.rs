//! Memory subsystem of an instruction-accurate RISC-V reference model.
//!
//! This crate models the flat physical memory shared by all harts of a
//! simulated system: per-page physical memory attributes (PMA), tightly
//! coupled memories (ICCM/DCCM), masked memory-mapped register windows,
//! typed load/store access, LR/SC reservation tracking, per-hart last-write
//! capture for trace generation, and image/snapshot loading. It also carries
//! the closed catalogue of instruction identities ([`instruction::InstId`])
//! consumed by the decoder and the trace emitter.
//!
//! The decoder, executor, CSR file and front-end are external collaborators;
//! they drive this crate through [`Memory`] and the privileged
//! [`memory::CorePort`] handed to each hart's executor.

#[macro_use]
extern crate static_assertions;

pub mod instruction;
pub mod loader;
pub mod memory;
pub mod pma;
pub mod reservation;
pub mod snapshot;

pub use instruction::InstId;
pub use loader::{ElfLoadInfo, ElfSymbol, LoadError};
pub use memory::{CorePort, Memory, MemoryConfig, MemoryError, WriteRecord};
pub use pma::{ConfigError, Pma};
pub use snapshot::SnapshotError;

pub mod unit {
    //! Collection of the units in which memory can be addressed (in bytes).

    /// A _byte_ is 8 bits.
    pub const BYTE: u64 = 1;

    /// A _halfword_ is 16 bits (2 bytes).
    pub const HALFWORD: u64 = 2;

    /// A _word_ is 32 bits (4 bytes).
    pub const WORD: u64 = 4;

    /// A _doubleword_ is 64 bits (8 bytes).
    pub const DOUBLEWORD: u64 = 8;
}

/// Address alignment ranging from no alignment (`1`) up to arbitrary
/// power-of-two alignment in a 64-bit address space.
// Maintains the invariant that self.0 is a power of two.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(u64);

impl Alignment {
    /// Byte alignment is equivalent to no alignment.
    pub const BYTE: Self = Self(1);

    /// Halfword alignment means the address is a multiple of 2 (`address & 0b1 == 0`).
    pub const HALFWORD: Self = Self(2);

    /// Word alignment means the address is a multiple of 4 (`address & 0b11 == 0`).
    pub const WORD: Self = Self(4);

    /// Doubleword alignment means the address is a multiple of 8 (`address & 0b111 == 0`).
    pub const DOUBLEWORD: Self = Self(8);

    /// Creates the natural alignment for a unit of size `size`, which for the
    /// power-of-two access sizes equals the size itself. Returns `None` if
    /// `size` is not a power of two.
    pub fn natural_for_size(size: u64) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size))
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: u64) -> bool {
        address & (self.0 - 1) == 0
    }
}
