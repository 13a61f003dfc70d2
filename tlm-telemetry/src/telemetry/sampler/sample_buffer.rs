//! Flat storage for raw stack captures.
//!
//! Each capture is laid out as `[len, time, addr0 .. addr{len-1}]` in one
//! `Vec<u64>`, so appending never allocates once the buffer has reached its
//! capacity and swapping two buffers is a pointer swap.

/// One capture read back from a [`SampleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample<'a> {
    /// Clock ticks at capture.
    pub time: u64,
    /// Leaf first.
    pub frames: &'a [u64],
}

pub struct SampleBuffer {
    words: Vec<u64>,
    capacity: usize,
    samples: usize,
}

impl SampleBuffer {
    /// `capacity` is in 8-byte words, headers included.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
            capacity,
            samples: 0,
        }
    }

    /// Append a capture. Returns false, leaving the buffer untouched, when it
    /// does not fit.
    pub fn push(&mut self, time: u64, frames: &[u64]) -> bool {
        if self.words.len() + 2 + frames.len() > self.capacity {
            return false;
        }
        self.words.push(frames.len() as u64);
        self.words.push(time);
        self.words.extend_from_slice(frames);
        self.samples += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.samples = 0;
    }

    pub fn iter(&self) -> SampleIter<'_> {
        SampleIter {
            words: &self.words,
        }
    }
}

pub struct SampleIter<'a> {
    words: &'a [u64],
}

impl<'a> Iterator for SampleIter<'a> {
    type Item = RawSample<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.words.split_first()?;
        let (&time, rest) = rest.split_first()?;
        let len = (len as usize).min(rest.len());
        let (frames, rest) = rest.split_at(len);
        self.words = rest;
        Some(RawSample { time, frames })
    }
}
