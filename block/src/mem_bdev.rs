// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex as SpinLock;
use uuid::Uuid;

use crate::{
    bio::{BioEnqueueError, BioStatus, BioType, SubmittedBio},
    BlockDevice, BlockDeviceMeta, DeviceCaps, MetadataFormat,
};

/// A memory-backed block device.
///
/// Requests complete inline, from the submitter's thread. Intended for tests
/// of block-layer consumers; fault injection knobs let a test exercise the
/// transient-exhaustion and I/O-error paths.
pub struct MemBdev {
    data: SpinLock<Vec<u8>>,
    block_size: u32,
    uuid: Uuid,
    caps: DeviceCaps,
    optimal_io_boundary: u64,
    metadata_format: MetadataFormat,
    enqueue_full: AtomicBool,
    fail_io: AtomicBool,
}

impl core::fmt::Debug for MemBdev {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("MemBdev")
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks())
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

impl MemBdev {
    /// Creates a device of `num_blocks` blocks supporting every I/O type.
    pub fn create(num_blocks: u64, block_size: u32) -> Arc<Self> {
        Self::create_with_caps(num_blocks, block_size, DeviceCaps::all())
    }

    /// Creates a device with the given capability set.
    pub fn create_with_caps(num_blocks: u64, block_size: u32, caps: DeviceCaps) -> Arc<Self> {
        assert!(block_size.is_power_of_two());
        Arc::new(Self {
            data: SpinLock::new(vec![0u8; (num_blocks * block_size as u64) as usize]),
            block_size,
            uuid: Uuid::new_v4(),
            caps,
            optimal_io_boundary: 0,
            metadata_format: MetadataFormat::default(),
            enqueue_full: AtomicBool::new(false),
            fail_io: AtomicBool::new(false),
        })
    }

    /// Creates a device advertising end-to-end data protection.
    pub fn create_with_dif(num_blocks: u64, block_size: u32) -> Arc<Self> {
        let mut device = Self::create(num_blocks, block_size);
        Arc::get_mut(&mut device)
            .expect("freshly created device is uniquely owned")
            .metadata_format = MetadataFormat {
            md_len: 8,
            interleaved: true,
            dif_enabled: true,
        };
        device
    }

    /// Returns the current capacity in blocks.
    pub fn num_blocks(&self) -> u64 {
        (self.data.lock().len() / self.block_size as usize) as u64
    }

    /// Makes `enqueue` report transient exhaustion (`IsFull`) while set.
    pub fn set_enqueue_full(&self, full: bool) {
        self.enqueue_full.store(full, Ordering::Relaxed);
    }

    /// Makes data-path requests complete with `IoError` while set.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::Relaxed);
    }

    /// Grows the device to `new_num_blocks` blocks.
    ///
    /// The caller is responsible for raising a `Resize` event on the
    /// registered `Bdev` afterwards.
    ///
    /// # Panics
    ///
    /// If `new_num_blocks` is smaller than the current capacity, this method
    /// will panic.
    pub fn grow(&self, new_num_blocks: u64) {
        let mut data = self.data.lock();
        let new_len = (new_num_blocks * self.block_size as u64) as usize;
        assert!(new_len >= data.len());
        data.resize(new_len, 0);
    }

    /// Reads raw bytes starting at block `offset_blocks`, bypassing the bio
    /// path.
    pub fn read_raw(&self, offset_blocks: u64, buf: &mut [u8]) {
        let data = self.data.lock();
        let start = (offset_blocks * self.block_size as u64) as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
    }

    /// Writes raw bytes starting at block `offset_blocks`, bypassing the bio
    /// path.
    pub fn write_raw(&self, offset_blocks: u64, buf: &[u8]) {
        let mut data = self.data.lock();
        let start = (offset_blocks * self.block_size as u64) as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
    }

    fn do_rw(&self, bio: &SubmittedBio) -> BioStatus {
        if self.fail_io.load(Ordering::Relaxed) {
            return BioStatus::IoError;
        }

        let range = bio.range().clone();
        let block_size = self.block_size as u64;
        let mut data = self.data.lock();
        if range.end * block_size > data.len() as u64 {
            return BioStatus::IoError;
        }

        let mut pos = (range.start * block_size) as usize;
        for segment in bio.segments() {
            let nbytes = segment.nbytes();
            match bio.type_() {
                BioType::Read => segment.write_bytes(0, &data[pos..pos + nbytes]),
                BioType::Write => {
                    let mut staged = vec![0u8; nbytes];
                    segment.read_bytes(0, &mut staged);
                    data[pos..pos + nbytes].copy_from_slice(&staged);
                }
                _ => unreachable!(),
            }
            pos += nbytes;
        }
        BioStatus::Complete
    }

    fn do_unmap(&self, bio: &SubmittedBio) -> BioStatus {
        if self.fail_io.load(Ordering::Relaxed) {
            return BioStatus::IoError;
        }

        let range = bio.range().clone();
        let block_size = self.block_size as u64;
        let mut data = self.data.lock();
        if range.end * block_size > data.len() as u64 {
            return BioStatus::IoError;
        }

        let start = (range.start * block_size) as usize;
        let end = (range.end * block_size) as usize;
        data[start..end].fill(0);
        BioStatus::Complete
    }
}

impl BlockDevice for MemBdev {
    fn enqueue(&self, bio: SubmittedBio) -> Result<(), BioEnqueueError> {
        if self.enqueue_full.load(Ordering::Relaxed) {
            return Err(BioEnqueueError::IsFull);
        }

        if !self.caps.supports(bio.type_()) {
            bio.complete(BioStatus::NotSupported);
            return Ok(());
        }

        let status = match bio.type_() {
            BioType::Read | BioType::Write => self.do_rw(&bio),
            BioType::Unmap => self.do_unmap(&bio),
            BioType::Flush | BioType::Reset => BioStatus::Complete,
        };
        bio.complete(status);
        Ok(())
    }

    fn metadata(&self) -> BlockDeviceMeta {
        BlockDeviceMeta {
            block_size: self.block_size,
            num_blocks: self.num_blocks(),
            uuid: self.uuid,
            optimal_io_boundary: self.optimal_io_boundary,
            caps: self.caps,
            metadata_format: self.metadata_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bio::Bio, bio::BioSegment, register_device};

    #[test]
    fn rw_round_trip() {
        let mem = MemBdev::create(64, 512);
        let bdev = register_device("mem_rw", mem).unwrap();

        let segment = BioSegment::from_slice(&[0xabu8; 1024]);
        let bio = Bio::new(BioType::Write, 4..6, vec![segment], None);
        assert_eq!(bio.submit_and_wait(&bdev).unwrap(), BioStatus::Complete);

        let readback = BioSegment::alloc(1024);
        let bio = Bio::new(BioType::Read, 4..6, vec![readback.clone()], None);
        assert_eq!(bio.submit_and_wait(&bdev).unwrap(), BioStatus::Complete);
        assert_eq!(readback.to_vec(), vec![0xabu8; 1024]);
    }

    #[test]
    fn full_device_reports_transient_exhaustion() {
        let mem = MemBdev::create(64, 512);
        let bdev = register_device("mem_full", mem.clone()).unwrap();

        mem.set_enqueue_full(true);
        let bio = Bio::new(BioType::Reset, 0..0, vec![], None);
        assert_eq!(bio.submit(&bdev).unwrap_err(), BioEnqueueError::IsFull);

        // The submit failure reverted the bio; it can be submitted again.
        mem.set_enqueue_full(false);
        assert_eq!(bio.submit_and_wait(&bdev).unwrap(), BioStatus::Complete);
    }

    #[test]
    fn out_of_range_io_fails() {
        let mem = MemBdev::create(8, 512);
        let bdev = register_device("mem_oob", mem).unwrap();

        let segment = BioSegment::alloc(1024);
        let bio = Bio::new(BioType::Read, 7..9, vec![segment], None);
        assert_eq!(bio.submit_and_wait(&bdev).unwrap(), BioStatus::IoError);
    }

    #[test]
    fn unsupported_type_completes_not_supported() {
        let mem = MemBdev::create_with_caps(8, 512, DeviceCaps::READ | DeviceCaps::WRITE);
        let bdev = register_device("mem_caps", mem).unwrap();

        let bio = Bio::new(BioType::Unmap, 0..4, vec![], None);
        assert_eq!(bio.submit_and_wait(&bdev).unwrap(), BioStatus::NotSupported);
    }
}
