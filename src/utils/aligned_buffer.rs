/// Alignment used for buffers handed to devices opened with O_DIRECT.
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Zero-initialized byte buffer whose first byte sits on an alignment
/// boundary.
#[derive(Debug)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
    alignment: usize,
}

impl AlignedBuf {
    pub fn new(len: usize) -> Self {
        Self::new_with_alignment(len, BUFFER_ALIGNMENT)
    }

    pub fn new_with_alignment(len: usize, alignment: usize) -> Self {
        assert!(
            alignment != 0 && alignment.is_power_of_two(),
            "Alignment must be non-zero and a power of two, got: {alignment}"
        );
        let storage = vec![0u8; len + alignment];
        let misalignment = storage.as_ptr() as usize % alignment;
        let offset = (alignment - misalignment) % alignment;
        AlignedBuf {
            storage,
            offset,
            len,
            alignment,
        }
    }

    /// Copies `data` into a freshly allocated aligned buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Clone for AlignedBuf {
    fn clone(&self) -> Self {
        let mut copy = AlignedBuf::new_with_alignment(self.len, self.alignment);
        copy.as_mut_slice().copy_from_slice(self.as_slice());
        copy
    }
}
