//! Content defined chunking.
//!
//! The rolling variant hashes a 64 byte sliding window by cyclic polynomial
//! (Buzhash), cutting whenever the hash falls into the break band. Barrel
//! shifts instead of multiplications keep the inner loop cheap. Identical
//! input produces identical cut points no matter how the bytes are fed in;
//! the scan interface makes that easy to test.

use packvault_api_types::SplitterKind;

const CHUNKER_WINDOW_SIZE: usize = 64;

/// The per-byte hash table is generated from a fixed xorshift64 seed, so the
/// cut points are stable across builds and machines.
const BUZHASH_SEED: u64 = 0x9ae1_6a3b_2f90_404f;

const fn xorshift64(mut state: u64) -> u64 {
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state
}

const fn build_buzhash_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut state = BUZHASH_SEED;
    let mut i = 0;
    while i < 256 {
        state = xorshift64(state);
        table[i] = (state >> 32) as u32;
        i += 1;
    }
    table
}

static BUZHASH_TABLE: [u32; 256] = build_buzhash_table();

/// Sliding window chunker.
///
/// Produces an average chunk size of `chunk_size_avg` (a power of two), with
/// sizes ranging from `avg/4` to `avg*4`. Note the break test never fires on
/// hash value ranges near zero, so constant streams (0,0,0,...) still cut at
/// the maximum size instead of degenerating.
pub struct Chunker {
    h: u32,
    window_size: usize,
    chunk_size: usize,

    chunk_size_min: usize,
    chunk_size_max: usize,

    break_test_mask: u32,
    break_test_minimum: u32,

    window: [u8; CHUNKER_WINDOW_SIZE],
}

impl Chunker {
    pub fn new(chunk_size_avg: usize) -> Self {
        if chunk_size_avg.count_ones() != 1 {
            panic!("got unexpected chunk size - not a power of two.");
        }

        let break_test_mask = (chunk_size_avg * 2 - 1) as u32;
        let break_test_minimum = break_test_mask - 2;

        Self {
            h: 0,
            window_size: 0,
            chunk_size: 0,
            chunk_size_min: chunk_size_avg >> 2,
            chunk_size_max: chunk_size_avg << 2,
            break_test_mask,
            break_test_minimum,
            window: [0u8; CHUNKER_WINDOW_SIZE],
        }
    }

    /// Scans the specified data for a chunk border. Returns 0 if none was
    /// found (and the function should be called with more data later on), or
    /// the position of the border.
    pub fn scan(&mut self, data: &[u8]) -> usize {
        let window_len = self.window.len();
        let data_len = data.len();

        let mut pos = 0;

        if self.window_size < window_len {
            let need = window_len - self.window_size;
            let copy_len = if need < data_len { need } else { data_len };

            for _ in 0..copy_len {
                let byte = data[pos];
                self.window[self.window_size] = byte;
                self.h = self.h.rotate_left(1) ^ BUZHASH_TABLE[byte as usize];
                pos += 1;
                self.window_size += 1;
            }

            self.chunk_size += copy_len;

            if self.window_size < window_len {
                return 0;
            }
        }

        let mut idx = self.chunk_size & (CHUNKER_WINDOW_SIZE - 1);

        while pos < data_len {
            // roll window
            let enter = data[pos];
            let leave = self.window[idx];
            self.h = self.h.rotate_left(1) ^ BUZHASH_TABLE[leave as usize] ^ BUZHASH_TABLE[enter as usize];

            self.chunk_size += 1;
            pos += 1;

            self.window[idx] = enter;

            if self.shall_break() {
                self.h = 0;
                self.chunk_size = 0;
                self.window_size = 0;
                return pos;
            }

            idx = self.chunk_size & (CHUNKER_WINDOW_SIZE - 1);
        }

        0
    }

    fn shall_break(&self) -> bool {
        if self.chunk_size >= self.chunk_size_max {
            return true;
        }

        if self.chunk_size < self.chunk_size_min {
            return false;
        }

        (self.h & self.break_test_mask) >= self.break_test_minimum
    }
}

/// Trivial splitter cutting at a constant size.
pub struct FixedChunker {
    chunk_size: usize,
    filled: usize,
}

impl FixedChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            filled: 0,
        }
    }

    pub fn scan(&mut self, data: &[u8]) -> usize {
        let need = self.chunk_size - self.filled;
        if data.len() >= need {
            self.filled = 0;
            need
        } else {
            self.filled += data.len();
            0
        }
    }
}

/// A configured splitter instance. Stateful and single threaded; the
/// pipeline allocates one per concurrent file.
pub enum Splitter {
    Fixed(FixedChunker),
    Rolling(Chunker),
}

impl Splitter {
    pub fn new(kind: SplitterKind) -> Self {
        if kind.is_fixed() {
            Splitter::Fixed(FixedChunker::new(kind.avg_size()))
        } else {
            Splitter::Rolling(Chunker::new(kind.avg_size()))
        }
    }

    /// See [Chunker::scan].
    pub fn scan(&mut self, data: &[u8]) -> usize {
        match self {
            Splitter::Fixed(fixed) => fixed.scan(data),
            Splitter::Rolling(rolling) => rolling.scan(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_data() -> Vec<u8> {
        // pseudo random but deterministic
        let mut buffer = Vec::with_capacity(1024 * 1024);
        let mut state = 0x1234_5678_9abc_def0u64;
        while buffer.len() < 1024 * 1024 {
            state = xorshift64(state);
            buffer.extend_from_slice(&state.to_le_bytes());
        }
        buffer
    }

    fn split_all(chunker: &mut Chunker, buffer: &[u8], step: usize) -> Vec<(usize, usize)> {
        let mut chunks = Vec::new();
        let mut last = 0;
        let mut pos = 0;
        while pos < buffer.len() {
            let end = (pos + step).min(buffer.len());
            let mut window = &buffer[pos..end];
            let mut consumed = pos;
            loop {
                let boundary = chunker.scan(window);
                if boundary == 0 {
                    break;
                }
                consumed += boundary;
                chunks.push((last, consumed - last));
                last = consumed;
                window = &buffer[consumed..end];
            }
            pos = end;
        }
        if last < buffer.len() {
            chunks.push((last, buffer.len() - last));
        }
        chunks
    }

    #[test]
    fn feed_granularity_does_not_change_boundaries() {
        let buffer = test_data();

        let chunks_bytewise = split_all(&mut Chunker::new(64 * 1024), &buffer, 1);
        let chunks_whole = split_all(&mut Chunker::new(64 * 1024), &buffer, buffer.len());
        let chunks_odd = split_all(&mut Chunker::new(64 * 1024), &buffer, 4099);

        assert_eq!(chunks_bytewise, chunks_whole);
        assert_eq!(chunks_bytewise, chunks_odd);

        let total: usize = chunks_whole.iter().map(|(_, len)| len).sum();
        assert_eq!(total, buffer.len());
        assert!(chunks_whole.len() > 4);
    }

    #[test]
    fn chunk_sizes_stay_in_envelope() {
        let buffer = test_data();
        let avg = 64 * 1024;
        let chunks = split_all(&mut Chunker::new(avg), &buffer, buffer.len());

        // all but the trailing chunk obey min/max
        for (_, len) in &chunks[..chunks.len() - 1] {
            assert!(*len >= avg / 4, "chunk below minimum: {}", len);
            assert!(*len <= avg * 4, "chunk above maximum: {}", len);
        }

        // the mean should be in the right ballpark for random data
        let mean: usize = buffer.len() / chunks.len();
        assert!(mean > avg / 4 && mean < avg * 4, "implausible mean {}", mean);
    }

    #[test]
    fn constant_stream_cuts_at_max() {
        let buffer = vec![0u8; 1024 * 1024];
        let avg = 64 * 1024;
        let chunks = split_all(&mut Chunker::new(avg), &buffer, buffer.len());
        for (_, len) in &chunks[..chunks.len() - 1] {
            assert_eq!(*len, avg * 4);
        }
    }

    #[test]
    fn fixed_chunker_cuts_exactly() {
        let buffer = vec![1u8; 10 * 1024];
        let mut chunker = FixedChunker::new(4096);
        let mut pos = 0;
        let mut sizes = Vec::new();
        loop {
            let boundary = chunker.scan(&buffer[pos..]);
            if boundary == 0 {
                break;
            }
            sizes.push(boundary);
            pos += boundary;
        }
        sizes.push(buffer.len() - pos);
        assert_eq!(sizes, vec![4096, 4096, 2048]);
    }

    #[test]
    fn fixed_chunker_handles_bytewise_feed() {
        let mut chunker = FixedChunker::new(8);
        let mut cuts = 0;
        for i in 0..32 {
            let boundary = chunker.scan(&[i as u8]);
            if boundary != 0 {
                assert_eq!(boundary, 1);
                cuts += 1;
            }
        }
        assert_eq!(cuts, 4);
    }
}
