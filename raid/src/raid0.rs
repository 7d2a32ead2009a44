// SPDX-License-Identifier: MPL-2.0

//! The striping personality.
//!
//! Logical block `b` lands on slot `(b / strip) % n` at device block
//! `data_offset + (b / (strip * n)) * strip + b % strip`. Requests are split
//! at strip boundaries; every slot must stay operational.

use vraid_block::bio::{slice_segments, BioSegment, BioStatus, BioType};

use crate::{
    array::RaidBdev,
    io::{ChildSubmit, RaidIo},
    personality::{Personality, RaidLevel},
    prelude::*,
    util::align_down,
};

#[derive(Debug, Default)]
pub(crate) struct Raid0;

/// Splits the request's block range at strip boundaries.
fn stripe_chunks(io: &RaidIo) -> Vec<(u64, u64)> {
    let strip = io.array().strip_size() as u64;
    let end = io.offset_blocks() + io.num_blocks();

    let mut chunks = Vec::new();
    let mut offset = io.offset_blocks();
    while offset < end {
        let strip_end = (offset / strip + 1) * strip;
        let chunk_len = strip_end.min(end) - offset;
        chunks.push((offset, chunk_len));
        offset += chunk_len;
    }
    chunks
}

fn submit_chunks(io: &Arc<RaidIo>, with_payload: bool, retry: fn(&Arc<RaidIo>)) {
    let array = io.array().clone();
    let strip = array.strip_size() as u64;
    let num_slots = array.num_base_bdevs() as u64;
    let shift = array.blocklen_shift();

    let chunks = stripe_chunks(io);
    if io.submitted() == 0 {
        io.set_remaining(chunks.len() as u64);
    }

    for (index, (chunk_start, chunk_len)) in chunks
        .iter()
        .copied()
        .enumerate()
        .skip(io.submitted() as usize)
    {
        let strip_index = chunk_start / strip;
        let slot = (strip_index % num_slots) as usize;
        let stripe = strip_index / num_slots;

        let Some(geometry) = array.slot_geometry(slot) else {
            io.complete_part(chunks.len() as u64 - index as u64, BioStatus::IoError);
            return;
        };
        let device_start = geometry.data_offset + stripe * strip + chunk_start % strip;

        let segments: Vec<BioSegment> = if with_payload {
            slice_segments(
                io.segments(),
                ((chunk_start - io.offset_blocks()) << shift) as usize,
                (chunk_len << shift) as usize,
            )
        } else {
            Vec::new()
        };

        match io.submit_child(
            slot,
            io.type_(),
            device_start..device_start + chunk_len,
            segments,
            retry,
        ) {
            ChildSubmit::Submitted => io.inc_submitted(),
            ChildSubmit::Parked => return,
            ChildSubmit::Failed => {
                io.complete_part(chunks.len() as u64 - index as u64, BioStatus::IoError);
                return;
            }
        }
    }
}

fn submit_rw_request(io: &Arc<RaidIo>) {
    submit_chunks(io, true, submit_rw_request);
}

fn submit_unmap_request(io: &Arc<RaidIo>) {
    submit_chunks(io, false, submit_unmap_request);
}

fn submit_flush_request(io: &Arc<RaidIo>) {
    let num_slots = io.array().num_base_bdevs() as u64;
    if io.submitted() == 0 {
        io.set_remaining(num_slots);
    }
    while io.submitted() < num_slots {
        let slot = io.submitted() as usize;
        match io.submit_child(slot, BioType::Flush, 0..0, Vec::new(), submit_flush_request) {
            ChildSubmit::Submitted => io.inc_submitted(),
            ChildSubmit::Parked => return,
            ChildSubmit::Failed => {
                io.complete_part(num_slots - io.submitted(), BioStatus::IoError);
                return;
            }
        }
    }
}

fn stripe_capacity(array: &Arc<RaidBdev>) -> Result<u64> {
    let strip = array.strip_size() as u64;
    let num_slots = array.num_base_bdevs();

    let mut min_data_size = u64::MAX;
    for slot in 0..num_slots as usize {
        let Some(geometry) = array.slot_geometry(slot) else {
            return_errno_with_msg!(InvalidArgs, "striping requires every slot operational");
        };
        min_data_size = min_data_size.min(geometry.data_size);
    }

    let per_slot = align_down(min_data_size, strip);
    if per_slot == 0 {
        return_errno_with_msg!(InvalidArgs, "base bdev smaller than one strip");
    }
    Ok(per_slot * num_slots as u64)
}

impl Personality for Raid0 {
    fn level(&self) -> RaidLevel {
        RaidLevel::Raid0
    }

    fn base_bdevs_min(&self) -> u32 {
        1
    }

    fn start(&self, array: &Arc<RaidBdev>) -> Result<()> {
        array.set_num_blocks(stripe_capacity(array)?);
        Ok(())
    }

    fn submit_rw(&self, io: &Arc<RaidIo>) {
        submit_rw_request(io);
    }

    fn supports_null_payload(&self) -> bool {
        true
    }

    fn submit_null_payload(&self, io: &Arc<RaidIo>) {
        match io.type_() {
            BioType::Flush => submit_flush_request(io),
            BioType::Unmap => submit_unmap_request(io),
            _ => io.complete(BioStatus::NotSupported),
        }
    }

    fn supports_resize(&self) -> bool {
        true
    }

    fn resize(&self, array: &Arc<RaidBdev>) -> Result<bool> {
        let capacity = stripe_capacity(array)?;
        if capacity == array.num_blocks() {
            return Ok(false);
        }
        info!(
            "raid bdev {} resized from {} to {} blocks",
            array.name(),
            array.num_blocks(),
            capacity
        );
        array.set_num_blocks(capacity);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::*;
    use vraid_block::bio::BioStatus;

    #[test]
    fn address_mapping_follows_the_stripe_law() {
        let mems = mem_devices("r0map", 2, 2048, 4096);
        let array = build_array("r0map_arr", "raid0", 64, &names("r0map", 2), false).unwrap();
        let frontend = vraid_block::get_device("r0map_arr").unwrap();

        // strip = 64 KiB / 4 KiB = 16 blocks. Logical block 17 lands on
        // slot (17 / 16) % 2 = 1, device block (17 / 32) * 16 + 17 % 16 = 1.
        let payload = pattern(4096, 0x5a);
        assert_eq!(bdev_write(&frontend, 17, &payload), BioStatus::Complete);
        assert_eq!(array.strip_size(), 16);

        let mut raw = vec![0u8; 4096];
        mems[1].read_raw(1, &mut raw);
        assert_eq!(raw, payload);
    }

    #[test]
    fn requests_split_at_strip_boundaries() {
        let mems = mem_devices("r0split", 2, 2048, 4096);
        let array = build_array("r0split_arr", "raid0", 64, &names("r0split", 2), false).unwrap();
        let frontend = vraid_block::get_device("r0split_arr").unwrap();
        assert_eq!(array.num_blocks(), 4096);

        // 32 blocks starting at block 8 cover strips 0, 1 and 2: slots
        // 0, 1, 0 in stripes 0, 0, 1.
        let payload = pattern(32 * 4096, 0xc3);
        assert_eq!(bdev_write(&frontend, 8, &payload), BioStatus::Complete);

        let (status, readback) = bdev_read(&frontend, 8, 32 * 4096);
        assert_eq!(status, BioStatus::Complete);
        assert_eq!(readback, payload);

        // First chunk: logical 8..16 → slot 0, device 8..16.
        let mut raw = vec![0u8; 8 * 4096];
        mems[0].read_raw(8, &mut raw);
        assert_eq!(raw, payload[..8 * 4096]);
        // Second chunk: logical 16..32 → slot 1, device 0..16.
        let mut raw = vec![0u8; 16 * 4096];
        mems[1].read_raw(0, &mut raw);
        assert_eq!(raw, payload[8 * 4096..24 * 4096]);
        // Third chunk: logical 32..40 → slot 0, stripe 1, device 16..24.
        let mut raw = vec![0u8; 8 * 4096];
        mems[0].read_raw(16, &mut raw);
        assert_eq!(raw, payload[24 * 4096..]);
    }

    #[test]
    fn unmap_zeroes_the_mapped_strips() {
        let mems = mem_devices("r0unmap", 2, 2048, 4096);
        let _array = build_array("r0unmap_arr", "raid0", 64, &names("r0unmap", 2), false).unwrap();
        let frontend = vraid_block::get_device("r0unmap_arr").unwrap();

        let payload = pattern(16 * 4096, 0xee);
        assert_eq!(bdev_write(&frontend, 16, &payload), BioStatus::Complete);
        assert_eq!(bdev_unmap(&frontend, 16, 16), BioStatus::Complete);

        let mut raw = vec![0u8; 16 * 4096];
        mems[1].read_raw(0, &mut raw);
        assert_eq!(raw, vec![0u8; 16 * 4096]);
    }
}
