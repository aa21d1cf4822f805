//! Bitmap data structure helper.

use std::fmt;

use crate::utils::RssError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for usize index -> bool mapping. Used to mark which server
/// connections a record targets and which queues have failed.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: usize, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size);

        if ones {
            bitset.set_range(.., true);
        }

        Bitmap(bitset)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: usize, flag: bool) -> Result<(), RssError> {
        if idx >= self.0.len() {
            return Err(RssError::msg(format!("index {} out of bound", idx)));
        }
        self.0.set(idx, flag);
        Ok(())
    }

    /// Gets the bit flag at index. Out-of-bound indices read as false.
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        idx < self.0.len() && self.0[idx]
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Iterates over indices of set bits in increasing order.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.ones()
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self.ones() {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}
