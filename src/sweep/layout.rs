//! Where the translation-cache index bits of a virtual address are assumed to sit.
//!
//! The bit positions are measured guesses for one adapter family and have not been confirmed
//! against hardware documentation; they are kept as data so they can be changed per device.
use crate::connection::Address;
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Base address the layout is applied on top of; far above where the heap and shared
/// libraries are usually mapped.
pub const DEFAULT_BASE: Address = 1 << 40;

/// Two inclusive bit-fields `[first, last]` of the virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketLayout {
    pub lower_first: u32,
    pub lower_last: u32,
    pub upper_first: u32,
    pub upper_last: u32,
    pub base: Address,
}

impl Default for BucketLayout {
    fn default() -> Self {
        BucketLayout {
            lower_first: 15,
            lower_last: 24,
            upper_first: 24,
            upper_last: 33,
            base: DEFAULT_BASE,
        }
    }
}

impl BucketLayout {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            (self.lower_first, self.lower_last),
            (self.upper_first, self.upper_last),
        ];
        for &(first, last) in fields.iter() {
            if first > last || last >= 48 {
                return Err(Error::Config(format!("bad bucket bit-field [{}, {}]", first, last)));
            }
        }
        if self.base & ((1 << (self.upper_last + 1)) - 1) != 0 {
            return Err(Error::Config(format!(
                "layout base {:#x} overlaps the bucket bits",
                self.base
            )));
        }
        Ok(())
    }

    fn width(first: u32, last: u32) -> u32 {
        last + 1 - first
    }

    /// Every value of the lower field plus every nonzero value of the upper field.
    pub fn region_count(&self) -> usize {
        (1usize << Self::width(self.lower_first, self.lower_last))
            + (1usize << Self::width(self.upper_first, self.upper_last))
            - 1
    }

    /// One base address per bucket, ascending. Where the two fields share bits the same
    /// address is produced only once, so the result can be shorter than `region_count`.
    pub fn addresses(&self) -> Result<Vec<Address>> {
        self.validate()?;

        let lower_values = 1u64 << Self::width(self.lower_first, self.lower_last);
        let upper_values = 1u64 << Self::width(self.upper_first, self.upper_last);
        let lower = (0..lower_values).map(|v| v << self.lower_first);
        let upper = (1..upper_values).map(|v| v << self.upper_first);
        let set: BTreeSet<Address> = lower.chain(upper).map(|off| self.base | off).collect();

        Ok(set.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_count() {
        let l = BucketLayout::default();
        assert_eq!(l.region_count(), 2047);

        let addrs = l.addresses().unwrap();
        // bit 24 belongs to both fields
        assert_eq!(addrs.len(), 2046);
        assert_eq!(addrs[0], DEFAULT_BASE);
        assert_eq!(addrs[1], DEFAULT_BASE | 1 << 15);
        assert_eq!(*addrs.last().unwrap(), DEFAULT_BASE | 0x3ff << 24);
    }

    #[test]
    fn disjoint_fields_give_exactly_region_count() {
        let l = BucketLayout {
            lower_first: 12,
            lower_last: 13,
            upper_first: 20,
            upper_last: 21,
            base: 1 << 30,
        };
        let addrs = l.addresses().unwrap();

        assert_eq!(l.region_count(), 7);
        assert_eq!(
            addrs,
            vec![
                1 << 30,
                1 << 30 | 1 << 12,
                1 << 30 | 2 << 12,
                1 << 30 | 3 << 12,
                1 << 30 | 1 << 20,
                1 << 30 | 2 << 20,
                1 << 30 | 3 << 20,
            ]
        );
    }

    #[test]
    fn base_inside_the_fields_is_rejected() {
        let l = BucketLayout {
            base: 1 << 20,
            ..Default::default()
        };
        assert!(matches!(l.addresses(), Err(Error::Config(_))));
    }
}
