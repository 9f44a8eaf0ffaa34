//! Fixed-size bitset with one bit per sphere slot.
//!
//! Used for the enabled-sphere flags. The bitmap lives in the device
//! parameter block, so it can be serialized on its own.

use log::warn;
use serde::{Serialize, Deserialize};

const WORD_BITS: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBitmap {
    num_slots: usize,
    words: Vec<u32>,
}

impl SlotBitmap {
    /// Create a bitmap for the given number of slots, all bits cleared.
    ///
    /// ```
    /// use wavesphere::SlotBitmap;
    ///
    /// let bitmap = SlotBitmap::new(40);
    /// assert!(!bitmap.get(39));
    /// ```
    pub fn new(num_slots: usize) -> SlotBitmap {
        let num_words = (num_slots + WORD_BITS - 1) / WORD_BITS;
        SlotBitmap{num_slots, words: vec![0; num_words]}
    }

    /// Create a bitmap with all bits set.
    pub fn all_set(num_slots: usize) -> SlotBitmap {
        let mut bitmap = SlotBitmap::new(num_slots);
        for slot in 0..num_slots {
            bitmap.set(slot, true);
        }
        bitmap
    }

    pub fn len(&self) -> usize {
        self.num_slots
    }

    pub fn is_empty(&self) -> bool {
        self.num_slots == 0
    }

    /// Bits outside the bitmap read as cleared.
    pub fn get(&self, slot: usize) -> bool {
        if slot >= self.num_slots {
            return false;
        }
        self.words[slot / WORD_BITS] & (1 << (slot % WORD_BITS)) != 0
    }

    /// Setting a bit outside the bitmap is ignored.
    pub fn set(&mut self, slot: usize, value: bool) {
        if slot >= self.num_slots {
            warn!("Ignoring bit {} outside of bitmap with {} slots", slot, self.num_slots);
            return;
        }
        let mask = 1 << (slot % WORD_BITS);
        if value {
            self.words[slot / WORD_BITS] |= mask;
        } else {
            self.words[slot / WORD_BITS] &= !mask;
        }
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the indices of all set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_slots).filter(move |slot| self.get(*slot))
    }
}

// ----------------------------------------------
//                  Unit tests
// ----------------------------------------------

#[test]
fn bits_can_be_set_and_cleared() {
    let mut bitmap = SlotBitmap::new(40);
    bitmap.set(0, true);
    bitmap.set(33, true);
    assert!(bitmap.get(0));
    assert!(bitmap.get(33));
    assert!(!bitmap.get(32));
    assert_eq!(bitmap.count_set(), 2);
    bitmap.set(0, false);
    assert!(!bitmap.get(0));
    assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), vec![33]);
}

#[test]
fn out_of_range_bits_are_ignored() {
    let mut bitmap = SlotBitmap::new(3);
    bitmap.set(3, true);
    assert!(!bitmap.get(3));
    assert_eq!(bitmap.count_set(), 0);
}

#[test]
fn bitmap_survives_json() {
    let mut bitmap = SlotBitmap::all_set(36);
    bitmap.set(5, false);
    let json = serde_json::to_string(&bitmap).unwrap();
    let restored: SlotBitmap = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, bitmap);
    assert_eq!(restored.count_set(), 35);
}
