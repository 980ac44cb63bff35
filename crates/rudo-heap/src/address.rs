//! Colored pointer encoding and heap base placement.
//!
//! A colored pointer stores the object address shifted left by
//! [`POINTER_ADDRESS_SHIFT`] with sixteen low bits of GC metadata:
//!
//! ```text
//!  bit  15..12  11..10  9..8   7..6  5..4   3..0
//!       RRRR    MM      mm     FF    rr     0000
//!       |       |       |      |     |
//!       |       |       |      |     remembered (young/old pairs)
//!       |       |       |      finalizable
//!       |       |       marked young
//!       |       marked old
//!       remapped (one-hot: 00, 01, 10, 11)
//! ```
//!
//! Exactly one remapped bit is "good" at any time. It is the intersection of
//! the young and the old generation's remapped sets, so flipping either
//! generation's relocation phase moves the good bit.
//!
//! [`PointerColors`] holds the current good and bad masks. Flips only happen
//! at GC phase transitions, which are synchronized externally; the atomics
//! merely make concurrent reads well defined.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// ============================================================================
// Color bits
// ============================================================================

/// Number of metadata bits below the address.
pub const POINTER_ADDRESS_SHIFT: u32 = 16;

/// Remembered set bit, phase 0.
pub const REMEMBERED0: u64 = 1 << 4;
/// Remembered set bit, phase 1.
pub const REMEMBERED1: u64 = 1 << 5;
/// Finalizable mark bit, phase 0.
pub const FINALIZABLE0: u64 = 1 << 6;
/// Finalizable mark bit, phase 1.
pub const FINALIZABLE1: u64 = 1 << 7;
/// Young mark bit, phase 0.
pub const MARKED_YOUNG0: u64 = 1 << 8;
/// Young mark bit, phase 1.
pub const MARKED_YOUNG1: u64 = 1 << 9;
/// Old mark bit, phase 0.
pub const MARKED_OLD0: u64 = 1 << 10;
/// Old mark bit, phase 1.
pub const MARKED_OLD1: u64 = 1 << 11;
/// Remapped bit 00.
pub const REMAPPED00: u64 = 1 << 12;
/// Remapped bit 01.
pub const REMAPPED01: u64 = 1 << 13;
/// Remapped bit 10.
pub const REMAPPED10: u64 = 1 << 14;
/// Remapped bit 11.
pub const REMAPPED11: u64 = 1 << 15;

const REMEMBERED_MASK: u64 = REMEMBERED0 | REMEMBERED1;
const FINALIZABLE_MASK: u64 = FINALIZABLE0 | FINALIZABLE1;
const MARKED_YOUNG_MASK: u64 = MARKED_YOUNG0 | MARKED_YOUNG1;
const MARKED_OLD_MASK: u64 = MARKED_OLD0 | MARKED_OLD1;

/// All remapped bits.
pub const REMAPPED_MASK: u64 = REMAPPED00 | REMAPPED01 | REMAPPED10 | REMAPPED11;

/// Metadata consulted by the load barrier.
pub const LOAD_METADATA_MASK: u64 = REMAPPED_MASK;
/// Metadata consulted by the mark barrier.
pub const MARK_METADATA_MASK: u64 =
    LOAD_METADATA_MASK | MARKED_OLD_MASK | MARKED_YOUNG_MASK | FINALIZABLE_MASK;
/// Metadata consulted by the store barrier.
pub const STORE_METADATA_MASK: u64 = MARK_METADATA_MASK | REMEMBERED_MASK;
/// Every metadata bit.
pub const ALL_METADATA_MASK: u64 = (1 << POINTER_ADDRESS_SHIFT) - 1;

// ============================================================================
// Heap base
// ============================================================================

/// Largest heap base shift considered by the probe.
pub const MAX_HEAP_BASE_SHIFT: u32 = 44;
/// Smallest heap base shift the heap can be lowered to.
pub const MIN_HEAP_BASE_SHIFT: u32 = 32;
/// Shift used when no probe is available.
pub const DEFAULT_HEAP_BASE_SHIFT: u32 = 42;

/// Finds the largest heap base shift whose whole heap window is addressable.
///
/// The heap occupies `[1 << shift, 2 << shift)`, so the last page of that
/// window is probed for each candidate, from [`MAX_HEAP_BASE_SHIFT`] down to
/// [`MIN_HEAP_BASE_SHIFT`]. Falls back to [`DEFAULT_HEAP_BASE_SHIFT`] if no
/// candidate is accepted.
pub fn probe_max_heap_base_shift(page_size: usize, probe: impl Fn(usize) -> bool) -> u32 {
    (MIN_HEAP_BASE_SHIFT..=MAX_HEAP_BASE_SHIFT)
        .rev()
        .find(|&shift| probe((2usize << shift) - page_size))
        .unwrap_or(DEFAULT_HEAP_BASE_SHIFT)
}

// ============================================================================
// PointerColors
// ============================================================================

/// Process-wide pointer color state.
///
/// Created once at startup and shared by reference with everything that
/// needs the masks or the heap base.
#[derive(Debug)]
pub struct PointerColors {
    heap_base_shift: AtomicU32,
    max_heap_base_shift: u32,

    remapped_young: AtomicU64,
    remapped_old: AtomicU64,
    marked_young: AtomicU64,
    marked_old: AtomicU64,
    finalizable: AtomicU64,
    remembered: AtomicU64,

    load_good: AtomicU64,
    load_bad: AtomicU64,
    mark_good: AtomicU64,
    mark_bad: AtomicU64,
    store_good: AtomicU64,
    store_bad: AtomicU64,
}

impl PointerColors {
    /// Creates the color state with the heap placed at `1 << heap_base_shift`.
    ///
    /// `heap_base_shift` is also the ceiling [`reset_heap_base`] returns to.
    ///
    /// [`reset_heap_base`]: PointerColors::reset_heap_base
    #[must_use]
    pub fn new(heap_base_shift: u32) -> Self {
        let colors = Self {
            heap_base_shift: AtomicU32::new(heap_base_shift),
            max_heap_base_shift: heap_base_shift,
            remapped_young: AtomicU64::new(0),
            remapped_old: AtomicU64::new(0),
            marked_young: AtomicU64::new(0),
            marked_old: AtomicU64::new(0),
            finalizable: AtomicU64::new(0),
            remembered: AtomicU64::new(0),
            load_good: AtomicU64::new(0),
            load_bad: AtomicU64::new(0),
            mark_good: AtomicU64::new(0),
            mark_bad: AtomicU64::new(0),
            store_good: AtomicU64::new(0),
            store_bad: AtomicU64::new(0),
        };
        colors.initialize();
        colors
    }

    /// Resets all phase bits to their startup values and recomputes masks.
    pub fn initialize(&self) {
        self.remapped_young
            .store(REMAPPED10 | REMAPPED00, Ordering::Relaxed);
        self.remapped_old
            .store(REMAPPED01 | REMAPPED00, Ordering::Relaxed);
        self.marked_young.store(MARKED_YOUNG0, Ordering::Relaxed);
        self.marked_old.store(MARKED_OLD0, Ordering::Relaxed);
        self.finalizable.store(FINALIZABLE0, Ordering::Relaxed);
        self.remembered.store(REMEMBERED0, Ordering::Relaxed);
        self.set_good_masks();
    }

    // ---- heap base -------------------------------------------------------

    /// Moves the heap base to `1 << shift`.
    pub fn set_heap_base(&self, shift: u32) {
        debug_assert!(shift >= MIN_HEAP_BASE_SHIFT);
        self.heap_base_shift.store(shift, Ordering::Relaxed);
    }

    /// Current heap base shift.
    #[must_use]
    pub fn heap_base_shift(&self) -> u32 {
        self.heap_base_shift.load(Ordering::Relaxed)
    }

    /// Address of heap offset zero.
    #[must_use]
    pub fn heap_base(&self) -> usize {
        1 << self.heap_base_shift()
    }

    /// Exclusive upper bound of heap offsets.
    #[must_use]
    pub fn address_offset_max(&self) -> usize {
        self.heap_base()
    }

    /// Halves the heap base if `min_size` still fits below the new base.
    ///
    /// Returns `false`, leaving the base untouched, if `min_size` exceeds half
    /// the current base or the lowered shift would drop below
    /// [`MIN_HEAP_BASE_SHIFT`].
    pub fn try_lowering_heap_base(&self, min_size: usize) -> bool {
        let shift = self.heap_base_shift();
        if shift <= MIN_HEAP_BASE_SHIFT {
            return false;
        }
        if min_size > self.heap_base() / 2 {
            return false;
        }

        self.set_heap_base(shift - 1);
        true
    }

    /// Restores the heap base chosen at construction.
    pub fn reset_heap_base(&self) {
        self.set_heap_base(self.max_heap_base_shift);
    }

    /// Converts a heap offset into an address.
    #[must_use]
    pub fn offset_to_address(&self, offset: usize) -> usize {
        debug_assert!(offset < self.address_offset_max());
        self.heap_base() | offset
    }

    /// Converts an address inside the heap into its offset.
    #[must_use]
    pub fn address_to_offset(&self, address: usize) -> usize {
        debug_assert!(address >= self.heap_base());
        address & (self.heap_base() - 1)
    }

    // ---- masks -----------------------------------------------------------

    /// Recomputes the derived good and bad masks from the phase bits.
    pub fn set_good_masks(&self) {
        let remapped = self.remapped_young.load(Ordering::Relaxed)
            & self.remapped_old.load(Ordering::Relaxed);
        debug_assert_eq!(remapped.count_ones(), 1, "Exactly one good remapped bit");

        let load_good = remapped;
        let mark_good = load_good
            | self.marked_young.load(Ordering::Relaxed)
            | self.marked_old.load(Ordering::Relaxed);
        let store_good = mark_good | self.remembered.load(Ordering::Relaxed);

        self.load_good.store(load_good, Ordering::Relaxed);
        self.load_bad
            .store(load_good ^ LOAD_METADATA_MASK, Ordering::Relaxed);
        self.mark_good.store(mark_good, Ordering::Relaxed);
        self.mark_bad
            .store(mark_good ^ MARK_METADATA_MASK, Ordering::Relaxed);
        self.store_good.store(store_good, Ordering::Relaxed);
        self.store_bad
            .store(store_good ^ STORE_METADATA_MASK, Ordering::Relaxed);
    }

    /// Young mark start: toggle the young mark and remembered phases.
    pub fn flip_young_mark_start(&self) {
        self.marked_young
            .fetch_xor(MARKED_YOUNG_MASK, Ordering::Relaxed);
        self.remembered.fetch_xor(REMEMBERED_MASK, Ordering::Relaxed);
        self.set_good_masks();
    }

    /// Young relocate start: move the young remapped set.
    pub fn flip_young_relocate_start(&self) {
        self.remapped_young
            .fetch_xor(REMAPPED_MASK, Ordering::Relaxed);
        self.set_good_masks();
    }

    /// Old mark start: toggle the old mark and finalizable phases.
    pub fn flip_old_mark_start(&self) {
        self.marked_old.fetch_xor(MARKED_OLD_MASK, Ordering::Relaxed);
        self.finalizable
            .fetch_xor(FINALIZABLE_MASK, Ordering::Relaxed);
        self.set_good_masks();
    }

    /// Old relocate start: move the old remapped set.
    pub fn flip_old_relocate_start(&self) {
        self.remapped_old.fetch_xor(REMAPPED_MASK, Ordering::Relaxed);
        self.set_good_masks();
    }

    /// The finalizable bit of the current old mark phase. Finalizable marks
    /// are never mark-good.
    #[must_use]
    pub fn finalizable_mask(&self) -> u64 {
        self.finalizable.load(Ordering::Relaxed)
    }

    /// Bits of a load-good pointer.
    #[must_use]
    pub fn load_good_mask(&self) -> u64 {
        self.load_good.load(Ordering::Relaxed)
    }

    /// Bits that make a pointer load-bad.
    #[must_use]
    pub fn load_bad_mask(&self) -> u64 {
        self.load_bad.load(Ordering::Relaxed)
    }

    /// Bits of a mark-good pointer.
    #[must_use]
    pub fn mark_good_mask(&self) -> u64 {
        self.mark_good.load(Ordering::Relaxed)
    }

    /// Bits that make a pointer mark-bad.
    #[must_use]
    pub fn mark_bad_mask(&self) -> u64 {
        self.mark_bad.load(Ordering::Relaxed)
    }

    /// Bits of a store-good pointer.
    #[must_use]
    pub fn store_good_mask(&self) -> u64 {
        self.store_good.load(Ordering::Relaxed)
    }

    /// Bits that make a pointer store-bad.
    #[must_use]
    pub fn store_bad_mask(&self) -> u64 {
        self.store_bad.load(Ordering::Relaxed)
    }
}

// ============================================================================
// ColoredPointer
// ============================================================================

/// A heap address with its metadata color.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColoredPointer(u64);

impl ColoredPointer {
    /// The null pointer. It carries no color and is good in every phase.
    pub const NULL: Self = Self(0);

    /// Packs `address` and `color` into a colored pointer.
    #[must_use]
    pub const fn encode(address: usize, color: u64) -> Self {
        debug_assert!(color & !ALL_METADATA_MASK == 0);
        Self(((address as u64) << POINTER_ADDRESS_SHIFT) | color)
    }

    /// Splits the pointer into address and color.
    #[must_use]
    pub const fn decode(self) -> (usize, u64) {
        (self.address(), self.color())
    }

    /// Wraps a raw colored value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw colored value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The uncolored address.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn address(self) -> usize {
        (self.0 >> POINTER_ADDRESS_SHIFT) as usize
    }

    /// The metadata bits.
    #[must_use]
    pub const fn color(self) -> u64 {
        self.0 & ALL_METADATA_MASK
    }

    /// Returns `true` if the pointer has no address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.address() == 0
    }

    /// Returns `true` if the pointer can be loaded without remapping.
    #[must_use]
    pub fn is_load_good(self, colors: &PointerColors) -> bool {
        self.is_null() || self.0 & colors.load_bad_mask() == 0
    }

    /// Returns `true` if the pointer is marked in the current phases.
    #[must_use]
    pub fn is_mark_good(self, colors: &PointerColors) -> bool {
        self.is_null() || self.0 & colors.mark_bad_mask() == 0
    }

    /// Returns `true` if storing the pointer needs no barrier work.
    #[must_use]
    pub fn is_store_good(self, colors: &PointerColors) -> bool {
        self.is_null() || self.0 & colors.store_bad_mask() == 0
    }

    /// Colors `address` load-good.
    #[must_use]
    pub fn color_load_good(address: usize, colors: &PointerColors) -> Self {
        Self::encode(address, colors.load_good_mask())
    }

    /// Colors `address` mark-good.
    #[must_use]
    pub fn color_mark_good(address: usize, colors: &PointerColors) -> Self {
        Self::encode(address, colors.mark_good_mask())
    }

    /// Colors `address` store-good.
    #[must_use]
    pub fn color_store_good(address: usize, colors: &PointerColors) -> Self {
        Self::encode(address, colors.store_good_mask())
    }
}

impl fmt::Debug for ColoredPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColoredPointer({:#x}, color={:#06x})", self.address(), self.color())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_masks() {
        let colors = PointerColors::new(DEFAULT_HEAP_BASE_SHIFT);
        assert_eq!(colors.load_good_mask(), REMAPPED00);
        assert_eq!(
            colors.mark_good_mask(),
            REMAPPED00 | MARKED_YOUNG0 | MARKED_OLD0
        );
        assert_eq!(colors.finalizable_mask(), FINALIZABLE0);
        assert_eq!(
            colors.store_good_mask(),
            colors.mark_good_mask() | REMEMBERED0
        );
        assert_eq!(
            colors.load_bad_mask(),
            REMAPPED01 | REMAPPED10 | REMAPPED11
        );
        assert_ne!(
            colors.mark_bad_mask() & FINALIZABLE0,
            0,
            "finalizable marks need strong re-marking"
        );
    }

    #[test]
    fn test_good_and_bad_partition_metadata() {
        let colors = PointerColors::new(DEFAULT_HEAP_BASE_SHIFT);
        colors.flip_young_mark_start();
        colors.flip_old_relocate_start();

        assert_eq!(
            colors.mark_good_mask() | colors.mark_bad_mask(),
            MARK_METADATA_MASK
        );
        assert_eq!(colors.mark_good_mask() & colors.mark_bad_mask(), 0);
        assert_eq!(
            colors.store_good_mask() | colors.store_bad_mask(),
            STORE_METADATA_MASK
        );
    }

    #[test]
    fn test_relocate_flips_move_remapped_bit() {
        let colors = PointerColors::new(DEFAULT_HEAP_BASE_SHIFT);

        colors.flip_young_relocate_start();
        assert_eq!(colors.load_good_mask(), REMAPPED01);

        colors.flip_old_relocate_start();
        assert_eq!(colors.load_good_mask(), REMAPPED11);

        colors.flip_young_relocate_start();
        assert_eq!(colors.load_good_mask(), REMAPPED10);

        colors.flip_old_relocate_start();
        assert_eq!(colors.load_good_mask(), REMAPPED00);
    }

    #[test]
    fn test_mark_flips_toggle_phase_bits() {
        let colors = PointerColors::new(DEFAULT_HEAP_BASE_SHIFT);

        colors.flip_young_mark_start();
        let good = colors.store_good_mask();
        assert_ne!(good & MARKED_YOUNG1, 0);
        assert_ne!(good & REMEMBERED1, 0);
        assert_eq!(good & MARKED_YOUNG0, 0);

        colors.flip_old_mark_start();
        let good = colors.mark_good_mask();
        assert_ne!(good & MARKED_OLD1, 0);
        assert_eq!(colors.finalizable_mask(), FINALIZABLE1);

        colors.initialize();
        assert_eq!(colors.load_good_mask(), REMAPPED00);
    }

    #[test]
    fn test_pointer_goodness_follows_flips() {
        let colors = PointerColors::new(DEFAULT_HEAP_BASE_SHIFT);
        let address = colors.offset_to_address(0x2000);

        let ptr = ColoredPointer::color_store_good(address, &colors);
        assert!(ptr.is_load_good(&colors));
        assert!(ptr.is_mark_good(&colors));
        assert!(ptr.is_store_good(&colors));
        assert_eq!(ptr.decode(), (address, colors.store_good_mask()));

        colors.flip_young_mark_start();
        assert!(ptr.is_load_good(&colors));
        assert!(!ptr.is_mark_good(&colors));

        colors.flip_young_relocate_start();
        assert!(!ptr.is_load_good(&colors));
        assert!(ColoredPointer::NULL.is_load_good(&colors));
    }

    #[test]
    fn test_heap_base_lowering() {
        let colors = PointerColors::new(MIN_HEAP_BASE_SHIFT + 2);
        let base = colors.heap_base();

        assert!(!colors.try_lowering_heap_base(base / 2 + 1));
        assert!(colors.try_lowering_heap_base(base / 2));
        assert_eq!(colors.heap_base(), base / 2);
        assert!(colors.try_lowering_heap_base(0));
        assert!(!colors.try_lowering_heap_base(0));
        assert_eq!(colors.heap_base_shift(), MIN_HEAP_BASE_SHIFT);

        colors.reset_heap_base();
        assert_eq!(colors.heap_base(), base);
    }

    #[test]
    fn test_offset_address_round_trip() {
        let colors = PointerColors::new(DEFAULT_HEAP_BASE_SHIFT);
        let address = colors.offset_to_address(0x1234_0000);
        assert_eq!(address, (1 << DEFAULT_HEAP_BASE_SHIFT) | 0x1234_0000);
        assert_eq!(colors.address_to_offset(address), 0x1234_0000);
    }

    #[test]
    fn test_probe_picks_highest_accepted_shift() {
        let page = 4096;
        let shift = probe_max_heap_base_shift(page, |addr| addr < (1 << 40));
        assert_eq!(shift, 39);

        let shift = probe_max_heap_base_shift(page, |_| false);
        assert_eq!(shift, DEFAULT_HEAP_BASE_SHIFT);
    }
}
