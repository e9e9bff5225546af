//! Physical memory shared by all harts.
//!
//! [`Memory`] owns the backing store, the per-page attribute map, the MMR
//! write masks, the ELF symbol table, and the per-hart last-write and
//! reservation slots. It is configured from a control thread (`&mut self`
//! methods), then shared read-only-by-type with every hart thread; all
//! run-time mutation goes through `&self` methods.
//!
//! The backing store is a vector of atomic bytes. Plain loads and stores are
//! per-byte relaxed atomic accesses: concurrent harts never tear below byte
//! granularity, and no ordering is guaranteed beyond what the host provides.
//! The model does not simulate a weak memory architecture. Atomicity for AMO
//! and LR/SC comes from two dedicated mutexes: the AMO mutex (exposed to the
//! executor through [`CorePort::amo_lock`]) serializes entire
//! load-modify-store sequences, and the LR mutex guards the reservation
//! table. The AMO mutex may be held while the LR mutex is taken, never the
//! reverse.

use crate::loader::ElfSymbol;
use crate::pma::{ConfigError, Pma, PmaManager};
use crate::reservation::ReservationTable;
use crate::Alignment;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Construction parameters for a [`Memory`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Memory size in bytes; rounded down to a multiple of 4.
    pub size_bytes: u64,
    /// Page size in bytes; must be a power of two.
    pub page_size: u64,
    /// Region size in bytes; must be a power of two.
    pub region_size: u64,
}

impl MemoryConfig {
    /// Configuration with the default 4 KiB pages and 256 MiB regions.
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            page_size: 4 * 1024,
            region_size: 256 * 1024 * 1024,
        }
    }
}

/// Address, size and value of a recorded store.
///
/// `size` is the store width in bytes; values of narrower stores occupy the
/// low bytes of `value`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteRecord {
    pub size: u32,
    pub address: u64,
    pub value: u64,
}

/// Per-hart capture of the most recent committed store. `size == 0` means
/// the slot is empty. A single slot, not a queue: the executor drains it
/// after each retired instruction.
#[derive(Debug, Default)]
struct LastWrite {
    size: u32,
    address: u64,
    value: u64,
    prev_value: u64,
}

/// Model of the physical memory of the simulated system.
///
/// All addresses are physical; translation happens upstream. Values are
/// stored little-endian regardless of host endianness.
#[derive(Debug)]
pub struct Memory {
    data: Vec<AtomicU8>,
    size: u64,

    pma: PmaManager,

    pub(crate) check_unmapped_elf: bool,
    pub(crate) symbols: HashMap<String, ElfSymbol>,

    /// The LR mutex; all reservation-table access goes through it.
    reservations: Mutex<ReservationTable>,
    last_writes: Vec<Mutex<LastWrite>>,
    /// Serializes AMO load-modify-store sequences across harts.
    amo_mutex: Mutex<()>,
}

assert_impl_all!(Memory: Send, Sync);

macro_rules! access_fns {
    ( $( $read_fn:ident, $write_fn:ident => $u:ident, $n:literal ),* $(,)? ) => {
        $(
            /// Invoke a data read of this width for the specified address.
            ///
            /// Fails if any requested byte is out of bounds, if the page is
            /// not readable, if a misaligned access straddles pages with
            /// different attributes, or if the page holds memory-mapped
            /// registers and the access is not an aligned word.
            pub fn $read_fn(&self, address: u64) -> Result<$u, MemoryError> {
                self.read_impl::<$n>(address).map($u::from_le_bytes)
            }

            /// Invoke a data write of this width for the specified address
            /// on behalf of hart `hart`.
            ///
            /// Gating mirrors the read path with `write` in place of `read`.
            /// Stores to memory-mapped registers are masked per word. On
            /// success the store is captured in the hart's last-write slot
            /// and overlapping reservations of *other* harts are
            /// invalidated; the writing hart's own reservation survives its
            /// own stores.
            pub fn $write_fn(
                &self,
                hart: usize,
                address: u64,
                value: $u,
            ) -> Result<(), MemoryError> {
                self.write_impl::<$n>(hart, address, value.to_le_bytes())
            }
        )*
    };
}

macro_rules! privileged_access_fns {
    ( $( $poke_fn:ident, $check_fn:ident => $u:ident, $n:literal ),* $(,)? ) => {
        $(
            pub(crate) fn $poke_fn(&self, address: u64, value: $u) -> Result<(), MemoryError> {
                self.poke_impl::<$n>(address, value.to_le_bytes())
            }

            pub(crate) fn $check_fn(
                &self,
                address: u64,
                value: &mut $u,
            ) -> Result<(), MemoryError> {
                let pma = self.write_gate::<$n>(address)?;
                if pma.is_mmr() {
                    if $n != 4 || !Alignment::WORD.is_aligned(address) {
                        return Err(MemoryError::BadMmrAccess);
                    }
                    *value &= self.pma.mmr_mask(address) as $u;
                }
                Ok(())
            }
        )*
    };
}

impl Memory {
    /// Create a zero-initialized memory. The configured size is rounded
    /// down to a multiple of 4. The hart count defaults to 1; see
    /// [`set_hart_count`](Self::set_hart_count).
    pub fn new(config: MemoryConfig) -> Result<Self, ConfigError> {
        if !config.page_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "page_size",
                value: config.page_size,
            });
        }
        if !config.region_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "region_size",
                value: config.region_size,
            });
        }
        let size = config.size_bytes & !3;
        let byte_count =
            usize::try_from(size).map_err(|_| ConfigError::SizeExceedsHost(size))?;

        let mut reservations = ReservationTable::default();
        reservations.set_hart_count(1);

        Ok(Self {
            data: std::iter::repeat_with(|| AtomicU8::new(0))
                .take(byte_count)
                .collect(),
            size,
            pma: PmaManager::new(size, config.page_size, config.region_size),
            check_unmapped_elf: false,
            symbols: HashMap::new(),
            reservations: Mutex::new(reservations),
            last_writes: vec![Mutex::default()],
            amo_mutex: Mutex::new(()),
        })
    }

    /// Define the number of harts sharing this memory. Resizes the
    /// last-write and reservation slots; must be called before harts start
    /// executing.
    pub fn set_hart_count(&mut self, count: usize) {
        self.last_writes.resize_with(count, Mutex::default);
        self.reservations
            .get_mut()
            .expect("lr mutex poisoned")
            .set_hart_count(count);
    }

    /// Returns the memory size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.pma.page_size()
    }

    pub fn region_size(&self) -> u64 {
        self.pma.region_size()
    }

    /// Returns the number of the page containing `address`.
    pub fn page_index(&self, address: u64) -> u64 {
        self.pma.page_index(address)
    }

    /// Returns the start address of the page containing `address`.
    pub fn page_start_addr(&self, address: u64) -> u64 {
        self.pma.page_start_addr(address)
    }

    /// Returns the number of the region containing `address`.
    pub fn region_index(&self, address: u64) -> u64 {
        self.pma.region_index(address)
    }

    /// Returns the attributes of the page containing `address` (unmapped
    /// for addresses outside the memory).
    pub fn get_pma(&self, address: u64) -> Pma {
        self.pma.get_pma(address)
    }

    pub fn is_addr_readable(&self, address: u64) -> bool {
        self.pma.get_pma(address).is_read()
    }

    pub fn is_addr_in_iccm(&self, address: u64) -> bool {
        self.pma.get_pma(address).is_iccm()
    }

    pub fn is_addr_in_dccm(&self, address: u64) -> bool {
        self.pma.get_pma(address).is_dccm()
    }

    pub fn is_addr_in_mapped_regs(&self, address: u64) -> bool {
        self.pma.get_pma(address).is_mmr()
    }

    /// True if a data access to `address` goes outside the core (neither
    /// DCCM nor memory-mapped registers).
    pub fn is_data_addr_external(&self, address: u64) -> bool {
        let pma = self.pma.get_pma(address);
        !(pma.is_dccm() || pma.is_mmr())
    }

    /// See [`PmaManager::define_iccm`].
    pub fn define_iccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.pma.define_iccm(address, size)
    }

    /// See [`PmaManager::define_dccm`].
    pub fn define_dccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.pma.define_dccm(address, size)
    }

    /// See [`PmaManager::define_mmr_area`].
    pub fn define_mmr_area(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.pma.define_mmr_area(address, size)
    }

    /// See [`PmaManager::define_mmr_mask`].
    pub fn define_mmr_mask(&mut self, address: u64, mask: u32) -> Result<(), ConfigError> {
        self.pma.define_mmr_mask(address, mask)
    }

    /// Enable/disable failing ELF loads that target unmapped memory.
    pub fn check_unmapped_elf(&mut self, flag: bool) {
        self.check_unmapped_elf = flag;
    }

    /// Seal the attribute configuration. See [`PmaManager::finish_config`].
    pub fn finish_config(&mut self, iccm_readwrite: bool) {
        self.pma.finish_config(iccm_readwrite);
    }

    /// Reset (zero) all words of the defined memory-mapped register areas.
    pub fn reset_memory_mapped_registers(&mut self) {
        for (lo, hi) in self.pma.mmr_ranges() {
            for address in lo..hi {
                self.data[address as usize].store(0, Ordering::Relaxed);
            }
        }
    }

    access_fns! {
        read_byte, write_byte => u8, 1,
        read_halfword, write_halfword => u16, 2,
        read_word, write_word => u32, 4,
        read_doubleword, write_doubleword => u64, 8,
    }

    privileged_access_fns! {
        poke_byte, check_write_byte => u8, 1,
        poke_halfword, check_write_halfword => u16, 2,
        poke_word, check_write_word => u32, 4,
        poke_doubleword, check_write_doubleword => u64, 8,
    }

    /// Fetch a 16-bit instruction parcel.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit
    /// > little-endian parcels, regardless of memory system endianness.
    ///
    /// The gating attribute is `exec` rather than `read`; a parcel whose
    /// two bytes lie on pages with different attributes is rejected.
    pub fn read_inst_halfword(&self, address: u64) -> Result<u16, MemoryError> {
        self.fetch_impl::<2>(address).map(u16::from_le_bytes)
    }

    /// Fetch a 32-bit instruction word. Same gating as
    /// [`read_inst_halfword`](Self::read_inst_halfword) with the straddle
    /// check at `address + 3`.
    pub fn read_inst_word(&self, address: u64) -> Result<u32, MemoryError> {
        self.fetch_impl::<4>(address).map(u32::from_le_bytes)
    }

    /// Copy data from `other` into this memory, from location zero up to
    /// the smaller of the two sizes.
    pub fn copy_from(&mut self, other: &Memory) {
        let n = self.size.min(other.size) as usize;
        for (dst, src) in self.data[..n].iter_mut().zip(&other.data[..n]) {
            *dst.get_mut() = src.load(Ordering::Relaxed);
        }
    }

    /// Hand out the privileged interface used by the hart executor and the
    /// interactive debugger.
    pub fn core_port(&self) -> CorePort<'_> {
        CorePort { mem: self }
    }

    fn read_impl<const N: usize>(&self, address: u64) -> Result<[u8; N], MemoryError> {
        self.bounds_check(address, N as u64)?;

        let pma1 = self.pma.get_pma(address);
        if !pma1.is_read() {
            return Err(Self::denied(pma1));
        }
        self.straddle_check(address, N as u64, pma1)?;

        if pma1.is_mmr() {
            // Memory-mapped registers respond to aligned word loads only.
            if N != 4 || !Alignment::WORD.is_aligned(address) {
                return Err(MemoryError::BadMmrAccess);
            }
        }

        let mut buf = [0u8; N];
        self.load_bytes(address, &mut buf);
        Ok(buf)
    }

    fn fetch_impl<const N: usize>(&self, address: u64) -> Result<[u8; N], MemoryError> {
        self.bounds_check(address, N as u64)?;

        let pma1 = self.pma.get_pma(address);
        if !pma1.is_exec() {
            return Err(Self::denied(pma1));
        }
        self.straddle_check(address, N as u64, pma1)?;

        let mut buf = [0u8; N];
        self.load_bytes(address, &mut buf);
        Ok(buf)
    }

    fn write_impl<const N: usize>(
        &self,
        hart: usize,
        address: u64,
        bytes: [u8; N],
    ) -> Result<(), MemoryError> {
        let pma1 = self.write_gate::<N>(address)?;

        if pma1.is_mmr() {
            if N != 4 || !Alignment::WORD.is_aligned(address) {
                return Err(MemoryError::BadMmrAccess);
            }
            let masked = (u64_from_le(&bytes) as u32) & self.pma.mmr_mask(address);
            let mut prev = [0u8; 4];
            self.load_bytes(address, &mut prev);
            self.record_last_write(hart, 4, address, masked as u64, u64_from_le(&prev));
            self.store_bytes(address, &masked.to_le_bytes());
        } else {
            let mut prev = [0u8; N];
            self.load_bytes(address, &mut prev);
            self.record_last_write(
                hart,
                N as u32,
                address,
                u64_from_le(&bytes),
                u64_from_le(&prev),
            );
            self.store_bytes(address, &bytes);
        }

        self.lr_lock()
            .invalidate_other_harts(hart, address, N as u64);
        Ok(())
    }

    /// Out-of-band store: bypasses the `write` attribute (the page need
    /// only be mapped), skips last-write capture, and invalidates
    /// overlapping reservations of every hart including the poker's.
    fn poke_impl<const N: usize>(&self, address: u64, bytes: [u8; N]) -> Result<(), MemoryError> {
        self.bounds_check(address, N as u64)?;

        let pma1 = self.pma.get_pma(address);
        if !pma1.is_mapped() {
            return Err(MemoryError::Unmapped);
        }
        if !Alignment::natural_for_size(N as u64)
            .map(|a| a.is_aligned(address))
            .unwrap_or(false)
        {
            // A misaligned poke may span two pages; the second must also be
            // mapped (attribute equality is not required out-of-band).
            if !self.pma.get_pma(address + N as u64 - 1).is_mapped() {
                return Err(MemoryError::Unmapped);
            }
        }

        if pma1.is_mmr() {
            if N != 4 || !Alignment::WORD.is_aligned(address) {
                return Err(MemoryError::BadMmrAccess);
            }
            let masked = (u64_from_le(&bytes) as u32) & self.pma.mmr_mask(address);
            self.store_bytes(address, &masked.to_le_bytes());
        } else {
            self.store_bytes(address, &bytes);
        }

        self.lr_lock().invalidate_all(address, N as u64);
        Ok(())
    }

    /// Loader substrate: store a byte anywhere in bounds, ignoring page
    /// attributes entirely.
    pub(crate) fn poke_byte_no_access_check(
        &self,
        address: u64,
        value: u8,
    ) -> Result<(), MemoryError> {
        self.bounds_check(address, 1)?;
        self.data[address as usize].store(value, Ordering::Relaxed);
        Ok(())
    }

    fn write_gate<const N: usize>(&self, address: u64) -> Result<Pma, MemoryError> {
        self.bounds_check(address, N as u64)?;
        let pma1 = self.pma.get_pma(address);
        if !pma1.is_write() {
            return Err(Self::denied(pma1));
        }
        self.straddle_check(address, N as u64, pma1)?;
        Ok(pma1)
    }

    fn bounds_check(&self, address: u64, size: u64) -> Result<(), MemoryError> {
        match address.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds),
        }
    }

    /// A misaligned access may span two pages; both must then carry exactly
    /// the same attributes. `Pma` holds only the six attribute bits, so
    /// plain equality is the attribute comparison.
    fn straddle_check(&self, address: u64, size: u64, pma1: Pma) -> Result<(), MemoryError> {
        let aligned = Alignment::natural_for_size(size)
            .map(|a| a.is_aligned(address))
            .unwrap_or(false);
        if !aligned && pma1 != self.pma.get_pma(address + size - 1) {
            return Err(MemoryError::Straddle);
        }
        Ok(())
    }

    fn denied(pma: Pma) -> MemoryError {
        if pma.is_mapped() {
            MemoryError::AccessFault
        } else {
            MemoryError::Unmapped
        }
    }

    fn record_last_write(&self, hart: usize, size: u32, address: u64, value: u64, prev: u64) {
        let mut slot = self.last_writes[hart].lock().expect("last-write poisoned");
        *slot = LastWrite {
            size,
            address,
            value,
            prev_value: prev,
        };
    }

    fn lr_lock(&self) -> MutexGuard<'_, ReservationTable> {
        self.reservations.lock().expect("lr mutex poisoned")
    }

    /// Caller guarantees the range is in bounds.
    pub(crate) fn load_bytes(&self, address: u64, buf: &mut [u8]) {
        let base = address as usize;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.data[base + i].load(Ordering::Relaxed);
        }
    }

    /// Caller guarantees the range is in bounds.
    pub(crate) fn store_bytes(&self, address: u64, buf: &[u8]) {
        let base = address as usize;
        for (i, byte) in buf.iter().enumerate() {
            self.data[base + i].store(*byte, Ordering::Relaxed);
        }
    }
}

macro_rules! port_access_fns {
    ( $( $poke_fn:ident, $check_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Out-of-band store of this width. Bypasses the `write`
            /// attribute, honours MMR word alignment and masking, skips the
            /// last-write slot, and invalidates overlapping reservations on
            /// every hart.
            pub fn $poke_fn(&self, address: u64, value: $u) -> Result<(), MemoryError> {
                self.mem.$poke_fn(address, value)
            }

            /// Dry-run of the corresponding write: same gating, no store,
            /// no last-write capture, no reservation invalidation. The MMR
            /// write mask is applied to `value` so the caller sees what a
            /// real store would commit.
            pub fn $check_fn(&self, address: u64, value: &mut $u) -> Result<(), MemoryError> {
                self.mem.$check_fn(address, value)
            }
        )*
    };
}

/// Privileged interface to a [`Memory`].
///
/// The executor and the debugger need raw access to pokes, the last-write
/// slots and the reservation table; none of that belongs on the public
/// surface that ordinary consumers (trace writers, front-ends) see. This
/// capability object is handed to the executor at construction and carries
/// exactly those operations.
#[derive(Debug, Copy, Clone)]
pub struct CorePort<'m> {
    mem: &'m Memory,
}

impl<'m> CorePort<'m> {
    /// The underlying memory, for the unprivileged operations.
    pub fn memory(&self) -> &'m Memory {
        self.mem
    }

    port_access_fns! {
        poke_byte, check_write_byte => u8,
        poke_halfword, check_write_halfword => u16,
        poke_word, check_write_word => u32,
        poke_doubleword, check_write_doubleword => u64,
    }

    /// Store a byte anywhere in bounds, ignoring page attributes. Loader
    /// and debugger substrate.
    pub fn poke_byte_no_access_check(&self, address: u64, value: u8) -> Result<(), MemoryError> {
        self.mem.poke_byte_no_access_check(address, value)
    }

    /// The hart's most recent committed store, or `None` if the slot was
    /// drained. `value` is the stored (post-mask) value.
    pub fn last_write_new(&self, hart: usize) -> Option<WriteRecord> {
        let slot = self.mem.last_writes[hart]
            .lock()
            .expect("last-write poisoned");
        (slot.size != 0).then(|| WriteRecord {
            size: slot.size,
            address: slot.address,
            value: slot.value,
        })
    }

    /// Like [`last_write_new`](Self::last_write_new) but `value` is the
    /// memory content the store replaced.
    pub fn last_write_old(&self, hart: usize) -> Option<WriteRecord> {
        let slot = self.mem.last_writes[hart]
            .lock()
            .expect("last-write poisoned");
        (slot.size != 0).then(|| WriteRecord {
            size: slot.size,
            address: slot.address,
            value: slot.prev_value,
        })
    }

    /// Drain the hart's last-write slot.
    pub fn clear_last_write(&self, hart: usize) {
        self.mem.last_writes[hart]
            .lock()
            .expect("last-write poisoned")
            .size = 0;
    }

    /// Set the hart's LR reservation, replacing any prior one.
    pub fn make_lr(&self, hart: usize, address: u64, size: u64) {
        self.mem.lr_lock().make(hart, address, size);
    }

    /// True iff the hart holds a valid reservation made for exactly
    /// `address`.
    pub fn has_lr(&self, hart: usize, address: u64) -> bool {
        self.mem.lr_lock().has(hart, address)
    }

    /// Drop the hart's reservation.
    pub fn invalidate_lr(&self, hart: usize) {
        self.mem.lr_lock().invalidate(hart);
    }

    /// Clear every other hart's reservation intersecting the store
    /// `[address, address + store_size)`.
    pub fn invalidate_other_hart_lr(&self, hart: usize, address: u64, store_size: u64) {
        self.mem
            .lr_lock()
            .invalidate_other_harts(hart, address, store_size);
    }

    /// Clear every hart's reservation intersecting the store
    /// `[address, address + store_size)`.
    pub fn invalidate_lrs(&self, address: u64, store_size: u64) {
        self.mem.lr_lock().invalidate_all(address, store_size);
    }

    /// Take the AMO mutex for the duration of an atomic load-modify-store.
    /// May be held while reservation primitives are called; the reverse
    /// order is forbidden.
    pub fn amo_lock(&self) -> MutexGuard<'m, ()> {
        self.mem.amo_mutex.lock().expect("amo mutex poisoned")
    }
}

fn u64_from_le(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as u64) << (8 * i);
    }
    value
}

/// Reason a memory access was refused. The executor maps these onto the
/// architectural load/store/instruction access faults; the memory itself
/// raises no exceptions.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("access extends beyond the end of memory")]
    OutOfBounds,
    #[error("access to unmapped memory")]
    Unmapped,
    #[error("page attributes deny this access")]
    AccessFault,
    #[error("misaligned access straddles pages with different attributes")]
    Straddle,
    #[error("memory-mapped register access must be a naturally aligned word")]
    BadMmrAccess,
}
