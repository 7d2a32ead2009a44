// SPDX-License-Identifier: MPL-2.0

//! The on-disk superblock and its codec.
//!
//! The superblock is a fixed-layout little-endian record at block 0 of every
//! member device. Field widths and positions are stable across versions; new
//! fields may only be appended within the bounded record length. The CRC is
//! computed over the whole record with the CRC field zeroed.

use spin::Mutex as SpinLock;
use static_assertions::const_assert;
use uuid::Uuid;
use vraid_block::{
    bio::{Bio, BioSegment, BioStatus, BioType},
    BdevDesc,
};

use crate::{personality::RaidLevel, prelude::*};

/// Magic bytes at offset 0.
pub const SB_MAGIC: [u8; 8] = *b"VRAIDSB\0";
/// The superblock format version written by this implementation.
pub const SB_VERSION_MAJOR: u32 = 1;
pub const SB_VERSION_MINOR: u32 = 0;
/// The maximum record length in bytes.
pub const SB_MAX_LENGTH: usize = 4096;
/// The size of the on-disk name field, including the trailing NUL.
pub const SB_NAME_SIZE: usize = 64;
/// The longest accepted array name.
pub const MAX_NAME_LEN: usize = SB_NAME_SIZE - 1;
/// Fixed header length; slot entries follow.
pub const SB_HEADER_SIZE: usize = 144;
/// Length of one serialized slot entry.
pub const SB_ENTRY_SIZE: usize = 40;
/// The largest slot count a superblock can describe.
pub const MAX_BASE_BDEVS: usize = (SB_MAX_LENGTH - SB_HEADER_SIZE) / SB_ENTRY_SIZE;
/// The smallest byte offset of member data on a superblock-bearing device.
pub const MIN_DATA_OFFSET_BYTES: u64 = 1024 * 1024;

const_assert!(SB_HEADER_SIZE % 8 == 0);
const_assert!(SB_HEADER_SIZE + MAX_BASE_BDEVS * SB_ENTRY_SIZE <= SB_MAX_LENGTH);

const CRC_OFFSET: usize = 20;

/// The state of one slot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SbEntryState {
    /// The member is part of the array.
    Configured = 0,
    /// The member has been removed or failed.
    Failed = 1,
}

/// One per-slot entry of the superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbEntry {
    /// The UUID of the member device.
    pub uuid: Uuid,
    /// The slot position the member occupies.
    pub slot: u32,
    /// The state of the member.
    pub state: SbEntryState,
    /// First data block on the member device.
    pub data_offset: u64,
    /// Number of data blocks on the member device.
    pub data_size: u64,
}

/// The in-memory representation of the on-disk superblock.
#[derive(Debug, Clone)]
pub struct Superblock {
    /// Monotonically increasing write sequence number.
    pub seq_number: u64,
    /// The array UUID.
    pub uuid: Uuid,
    /// The array name.
    pub name: String,
    /// The RAID level.
    pub level: RaidLevel,
    /// Strip size in blocks; zero for mirroring.
    pub strip_size: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Total array capacity in blocks.
    pub num_blocks: u64,
    /// Number of slots in the array.
    pub num_base_bdevs: u32,
    /// Per-slot entries.
    pub entries: Vec<SbEntry>,
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("fixed width"))
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("fixed width"))
}

impl Superblock {
    /// Returns the serialized record length in bytes.
    pub fn length(&self) -> usize {
        SB_HEADER_SIZE + self.entries.len() * SB_ENTRY_SIZE
    }

    /// Returns the entry describing the member with the given device UUID.
    pub fn entry_for(&self, uuid: &Uuid) -> Option<&SbEntry> {
        self.entries.iter().find(|entry| entry.uuid == *uuid)
    }

    /// Serializes the record, recomputing the CRC.
    ///
    /// # Panics
    ///
    /// If the record exceeds [`SB_MAX_LENGTH`] or the name exceeds
    /// [`MAX_NAME_LEN`], this method will panic; both are validated when the
    /// array is created.
    pub fn serialize(&self) -> Vec<u8> {
        let length = self.length();
        assert!(length <= SB_MAX_LENGTH);
        assert!(self.name.len() <= MAX_NAME_LEN);

        let mut buf = vec![0u8; length];
        buf[0..8].copy_from_slice(&SB_MAGIC);
        put_u32(&mut buf, 8, SB_VERSION_MAJOR);
        put_u32(&mut buf, 12, SB_VERSION_MINOR);
        put_u32(&mut buf, 16, length as u32);
        // CRC at offset 20 is computed last, over the zeroed field.
        put_u64(&mut buf, 24, self.seq_number);
        buf[32..48].copy_from_slice(self.uuid.as_bytes());
        buf[48..48 + self.name.len()].copy_from_slice(self.name.as_bytes());
        put_u32(&mut buf, 112, self.level.to_raw());
        put_u32(&mut buf, 116, self.strip_size);
        put_u32(&mut buf, 120, self.block_size);
        put_u64(&mut buf, 128, self.num_blocks);
        put_u32(&mut buf, 136, self.num_base_bdevs);
        put_u32(&mut buf, 140, self.entries.len() as u32);

        for (index, entry) in self.entries.iter().enumerate() {
            let base = SB_HEADER_SIZE + index * SB_ENTRY_SIZE;
            buf[base..base + 16].copy_from_slice(entry.uuid.as_bytes());
            put_u32(&mut buf, base + 16, entry.slot);
            put_u32(&mut buf, base + 20, entry.state as u32);
            put_u64(&mut buf, base + 24, entry.data_offset);
            put_u64(&mut buf, base + 32, entry.data_size);
        }

        let crc = crc32c::crc32c(&buf);
        put_u32(&mut buf, CRC_OFFSET, crc);
        buf
    }

    /// Parses and validates a record read from a device.
    ///
    /// Any malformation (magic, length, CRC, version, level) yields
    /// `NotSuperblock`, the "absent or invalid" outcome of the read protocol.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SB_HEADER_SIZE || bytes[0..8] != SB_MAGIC {
            return_errno_with_msg!(NotSuperblock, "superblock magic not found");
        }

        let length = get_u32(bytes, 16) as usize;
        if length < SB_HEADER_SIZE || length > SB_MAX_LENGTH || length > bytes.len() {
            return_errno_with_msg!(NotSuperblock, "superblock length out of bounds");
        }
        if (length - SB_HEADER_SIZE) % SB_ENTRY_SIZE != 0 {
            return_errno_with_msg!(NotSuperblock, "superblock length misaligned");
        }

        let stored_crc = get_u32(bytes, CRC_OFFSET);
        let mut record = bytes[..length].to_vec();
        put_u32(&mut record, CRC_OFFSET, 0);
        if crc32c::crc32c(&record) != stored_crc {
            return_errno_with_msg!(NotSuperblock, "superblock crc mismatch");
        }

        if get_u32(&record, 8) != SB_VERSION_MAJOR {
            return_errno_with_msg!(NotSuperblock, "unsupported superblock version");
        }

        let Some(level) = RaidLevel::from_raw(get_u32(&record, 112)) else {
            return_errno_with_msg!(NotSuperblock, "unknown raid level in superblock");
        };

        let name_field = &record[48..48 + SB_NAME_SIZE];
        let name_len = name_field
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(SB_NAME_SIZE);
        if name_len > MAX_NAME_LEN {
            return_errno_with_msg!(NotSuperblock, "unterminated name in superblock");
        }
        let Ok(name) = core::str::from_utf8(&name_field[..name_len]) else {
            return_errno_with_msg!(NotSuperblock, "non-utf8 name in superblock");
        };

        let num_base_bdevs = get_u32(&record, 136);
        let num_entries = get_u32(&record, 140) as usize;
        if num_entries != (length - SB_HEADER_SIZE) / SB_ENTRY_SIZE {
            return_errno_with_msg!(NotSuperblock, "superblock entry count mismatch");
        }

        let mut entries = Vec::with_capacity(num_entries);
        for index in 0..num_entries {
            let base = SB_HEADER_SIZE + index * SB_ENTRY_SIZE;
            let uuid = Uuid::from_slice(&record[base..base + 16]).expect("fixed width");
            let slot = get_u32(&record, base + 16);
            let state = match get_u32(&record, base + 20) {
                0 => SbEntryState::Configured,
                1 => SbEntryState::Failed,
                _ => return_errno_with_msg!(NotSuperblock, "unknown member state in superblock"),
            };
            if slot >= num_base_bdevs {
                return_errno_with_msg!(NotSuperblock, "member slot out of range in superblock");
            }
            entries.push(SbEntry {
                uuid,
                slot,
                state,
                data_offset: get_u64(&record, base + 24),
                data_size: get_u64(&record, base + 32),
            });
        }

        Ok(Superblock {
            seq_number: get_u64(&record, 24),
            uuid: Uuid::from_slice(&record[32..48]).expect("fixed width"),
            name: name.to_string(),
            level,
            strip_size: get_u32(&record, 116),
            block_size: get_u32(&record, 120),
            num_blocks: get_u64(&record, 128),
            num_base_bdevs,
            entries,
        })
    }

    /// Bumps the sequence number and writes the record to every descriptor in
    /// `targets`.
    ///
    /// The write is declared successful only if every target's write
    /// succeeded. The sequence bump is kept on partial failure, so the
    /// higher-sequence copies win at the next assembly.
    pub(crate) fn save(&mut self, targets: &[Arc<BdevDesc>]) -> Result<()> {
        self.seq_number += 1;
        let bytes = self.serialize();

        let mut failed = false;
        for desc in targets {
            let block_size = desc.bdev().metadata().block_size as u64;
            let padded = align_up(bytes.len() as u64, block_size) as usize;
            let segment = BioSegment::alloc(padded);
            segment.write_bytes(0, &bytes);

            let nblocks = padded as u64 / block_size;
            let bio = Bio::new(BioType::Write, 0..nblocks, vec![segment], None);
            match bio.submit_and_wait(desc.bdev()) {
                Ok(BioStatus::Complete) => {}
                _ => {
                    warn!(
                        "superblock write to {} failed (seq {})",
                        desc.bdev().name(),
                        self.seq_number
                    );
                    failed = true;
                }
            }
        }

        if failed {
            return_errno_with_msg!(IoFailed, "superblock write failed");
        }
        trace!("superblock seq {} written to {} devices", self.seq_number, targets.len());
        Ok(())
    }
}

fn record_area(desc: &Arc<BdevDesc>) -> Result<(core::ops::Range<u64>, BioSegment)> {
    let meta = desc.bdev().metadata();
    let block_size = meta.block_size as u64;
    let nblocks = (SB_MAX_LENGTH as u64)
        .div_ceil(block_size)
        .min(meta.num_blocks);
    if nblocks == 0 {
        return_errno_with_msg!(NotSuperblock, "device too small for a superblock");
    }

    let segment = BioSegment::alloc((nblocks * block_size) as usize);
    Ok((0..nblocks, segment))
}

/// Reads the superblock area of `desc`'s device asynchronously.
///
/// `cb` receives exactly one of three outcomes: a parsed superblock, an error
/// with errno `NotSuperblock` (absent or invalid record), or an I/O error.
pub fn load(desc: &Arc<BdevDesc>, cb: impl FnOnce(Result<Superblock>) + Send + 'static) {
    type LoadCb = Box<dyn FnOnce(Result<Superblock>) + Send>;

    let (range, segment) = match record_area(desc) {
        Ok(area) => area,
        Err(e) => {
            cb(Err(e));
            return;
        }
    };

    // The callback is shared between the completion path and the
    // submission-failure path; whichever runs takes it.
    let cb_cell: Arc<SpinLock<Option<LoadCb>>> = Arc::new(SpinLock::new(Some(Box::new(cb))));
    let cb_inner = cb_cell.clone();

    let record = segment.clone();
    let read = Bio::new(
        BioType::Read,
        range,
        vec![segment],
        Some(Box::new(move |_child, status| {
            let Some(cb) = cb_inner.lock().take() else {
                return;
            };
            match status {
                BioStatus::Complete => cb(Superblock::parse(&record.to_vec())),
                _ => cb(Err(Error::with_msg(IoFailed, "superblock read failed"))),
            }
        })),
    );

    if read.submit(desc.bdev()).is_err() {
        if let Some(cb) = cb_cell.lock().take() {
            cb(Err(Error::with_msg(IoFailed, "superblock read submission failed")));
        }
    }
}

/// Reads the superblock area of `desc`'s device synchronously.
///
/// Used by control-plane flows that already run on the application thread.
pub(crate) fn load_sync(desc: &Arc<BdevDesc>) -> Result<Superblock> {
    let (range, segment) = record_area(desc)?;
    let bio = Bio::new(BioType::Read, range, vec![segment.clone()], None);
    match bio.submit_and_wait(desc.bdev()) {
        Ok(BioStatus::Complete) => Superblock::parse(&segment.to_vec()),
        _ => Err(Error::with_msg(IoFailed, "superblock read failed")),
    }
}
