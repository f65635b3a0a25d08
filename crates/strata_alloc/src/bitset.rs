//! Word-backed bitset over borrowed storage.

pub(crate) struct BitSet<'a> {
    words: &'a mut [u64],
}

impl<'a> BitSet<'a> {
    /// Words needed to hold `bits` bits.
    #[inline]
    pub(crate) const fn words_for(bits: usize) -> usize {
        bits.div_ceil(64)
    }

    pub(crate) fn new(words: &'a mut [u64]) -> Self {
        words.fill(0);
        Self { words }
    }

    #[inline]
    pub(crate) fn get(&self, n: usize) -> bool {
        (self.words[n / 64] >> (n % 64)) & 1 == 1
    }

    #[inline]
    pub(crate) fn set(&mut self, n: usize) {
        self.words[n / 64] |= 1 << (n % 64);
    }

    #[inline]
    pub(crate) fn clear(&mut self, n: usize) {
        self.words[n / 64] &= !(1 << (n % 64));
    }

    /// Mask of the bits of word `word` that fall inside `start..end`.
    #[inline]
    fn range_mask(word: usize, start: usize, end: usize) -> u64 {
        let lo = (word * 64).max(start) - word * 64;
        let hi = ((word + 1) * 64).min(end) - word * 64;
        let upper = if hi == 64 { u64::MAX } else { (1u64 << hi) - 1 };
        upper & !((1u64 << lo) - 1)
    }

    /// First set bit in `start..end`.
    pub(crate) fn find_first(&self, start: usize, end: usize) -> Option<usize> {
        if start >= end {
            return None;
        }
        for word in start / 64..=(end - 1) / 64 {
            let bits = self.words[word] & Self::range_mask(word, start, end);
            if bits != 0 {
                return Some(word * 64 + bits.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Number of set bits in `start..end`.
    pub(crate) fn count(&self, start: usize, end: usize) -> usize {
        if start >= end {
            return 0;
        }
        (start / 64..=(end - 1) / 64)
            .map(|word| (self.words[word] & Self::range_mask(word, start, end)).count_ones() as usize)
            .sum()
    }
}
