use std::ops::Range;

use strato_interrupts::MemoryMap;

/// Coarse physical memory map built from the machine's registered regions.
/// Used to sanity-check guest-programmed addresses (e.g. the vector table
/// base) before they are accepted.
#[derive(Debug, Clone, Default)]
pub struct AddressRanges {
    ranges: Vec<Range<u64>>,
}

impl AddressRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, range: Range<u64>) {
        self.ranges.push(range);
    }
}

impl MemoryMap for AddressRanges {
    fn is_mapped(&self, addr: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(&addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_follows_registered_ranges() {
        let mut map = AddressRanges::new();
        map.add(0x0800_0000..0x0810_0000);
        map.add(0x2000_0000..0x2002_0000);

        assert!(map.is_mapped(0x0800_0000));
        assert!(map.is_mapped(0x2001_FFFF));
        assert!(!map.is_mapped(0x2002_0000));
        assert!(!map.is_mapped(0x6000_0000));
    }

    #[test]
    fn empty_map_rejects_everything() {
        assert!(!AddressRanges::new().is_mapped(0));
    }
}
