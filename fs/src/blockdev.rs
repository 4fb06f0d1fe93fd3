//! Block device interface consumed by the buffer cache.

use hartos_lib::SpinMutex;

/// Size in bytes of one disk block, and therefore of one cache buffer.
pub const BSIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceError {
    /// The device has no block with the requested number.
    OutOfRange,
    /// The transfer failed at the device level.
    Io,
}

/// A synchronous block device.
///
/// `dev` distinguishes minor devices behind one driver; implementations
/// serving a single device may ignore it. Calls return only once the
/// transfer is complete.
pub trait BlockDevice: Sync {
    fn read_block(
        &self,
        dev: u32,
        blockno: u32,
        buf: &mut [u8; BSIZE],
    ) -> Result<(), BlockDeviceError>;

    fn write_block(
        &self,
        dev: u32,
        blockno: u32,
        buf: &[u8; BSIZE],
    ) -> Result<(), BlockDeviceError>;
}

/// RAM-backed block device holding `BLOCKS` blocks.
///
/// Stands in for real storage during bring-up (initrd-style images) and in
/// tests.
pub struct MemoryBlockDevice<const BLOCKS: usize> {
    blocks: SpinMutex<[[u8; BSIZE]; BLOCKS]>,
}

impl<const BLOCKS: usize> MemoryBlockDevice<BLOCKS> {
    pub const fn new() -> Self {
        Self {
            blocks: SpinMutex::new([[0; BSIZE]; BLOCKS]),
        }
    }

    /// Fill one block, e.g. while assembling an image. `contents` beyond
    /// [`BSIZE`] bytes is truncated.
    pub fn load_block(&self, blockno: u32, contents: &[u8]) -> Result<(), BlockDeviceError> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(blockno as usize)
            .ok_or(BlockDeviceError::OutOfRange)?;
        let len = contents.len().min(BSIZE);
        block[..len].copy_from_slice(&contents[..len]);
        Ok(())
    }
}

impl<const BLOCKS: usize> Default for MemoryBlockDevice<BLOCKS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BLOCKS: usize> BlockDevice for MemoryBlockDevice<BLOCKS> {
    fn read_block(
        &self,
        _dev: u32,
        blockno: u32,
        buf: &mut [u8; BSIZE],
    ) -> Result<(), BlockDeviceError> {
        let blocks = self.blocks.lock();
        let block = blocks
            .get(blockno as usize)
            .ok_or(BlockDeviceError::OutOfRange)?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(
        &self,
        _dev: u32,
        blockno: u32,
        buf: &[u8; BSIZE],
    ) -> Result<(), BlockDeviceError> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(blockno as usize)
            .ok_or(BlockDeviceError::OutOfRange)?;
        block.copy_from_slice(buf);
        Ok(())
    }
}
