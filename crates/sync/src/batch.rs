/// One contiguous, index-ordered group of raw blocks moving through the
/// pipeline. Batches parse in any order but merge strictly by index.
#[derive(Clone, Debug)]
pub struct Batch {
    pub index: u32,
    pub buffer: Vec<u8>,
    /// Replayed from the local block archive (already durable) rather than
    /// downloaded; replayed batches are not re-archived after merge.
    pub from_archive: bool,
}

impl Batch {
    pub fn from_archive(index: u32, buffer: Vec<u8>) -> Self {
        Self {
            index,
            buffer,
            from_archive: true,
        }
    }

    pub fn from_network(index: u32, buffer: Vec<u8>) -> Self {
        Self {
            index,
            buffer,
            from_archive: false,
        }
    }
}
