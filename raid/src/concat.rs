// SPDX-License-Identifier: MPL-2.0

//! The concatenation personality.
//!
//! Slots are appended back to back: the logical address space is the
//! cumulative sum of the slots' data regions, and requests are split at slot
//! boundaries. Growing by one slot simply extends the address space.

use vraid_block::bio::{slice_segments, BioSegment, BioStatus, BioType};

use crate::{
    array::RaidBdev,
    io::{ChildSubmit, RaidIo},
    personality::{Personality, RaidLevel},
    prelude::*,
};

#[derive(Debug, Default)]
pub(crate) struct Concat;

/// One slot's share of the logical address space.
#[derive(Debug, Clone, Copy)]
struct BlockRange {
    slot: usize,
    start: u64,
    len: u64,
    data_offset: u64,
}

fn block_ranges(array: &Arc<RaidBdev>) -> Result<Vec<BlockRange>> {
    let num_slots = array.num_base_bdevs() as usize;
    let mut ranges = Vec::with_capacity(num_slots);
    let mut start = 0;
    for slot in 0..num_slots {
        let Some(geometry) = array.slot_geometry(slot) else {
            return_errno_with_msg!(InvalidArgs, "concatenation requires every slot operational");
        };
        ranges.push(BlockRange {
            slot,
            start,
            len: geometry.data_size,
            data_offset: geometry.data_offset,
        });
        start += geometry.data_size;
    }
    Ok(ranges)
}

/// Splits the request's block range at slot boundaries.
fn concat_chunks(io: &Arc<RaidIo>) -> Result<Vec<(BlockRange, u64, u64)>> {
    let ranges = block_ranges(io.array())?;
    let end = io.offset_blocks() + io.num_blocks();

    let mut chunks = Vec::new();
    let mut offset = io.offset_blocks();
    for range in ranges {
        if offset >= end {
            break;
        }
        let range_end = range.start + range.len;
        if offset >= range_end {
            continue;
        }
        let chunk_len = range_end.min(end) - offset;
        chunks.push((range, offset, chunk_len));
        offset += chunk_len;
    }
    if offset < end {
        return_errno_with_msg!(InvalidArgs, "request beyond array capacity");
    }
    Ok(chunks)
}

fn submit_chunks(io: &Arc<RaidIo>, with_payload: bool, retry: fn(&Arc<RaidIo>)) {
    let shift = io.array().blocklen_shift();
    let chunks = match concat_chunks(io) {
        Ok(chunks) => chunks,
        Err(_) => {
            io.set_remaining(1);
            io.complete_part(1, BioStatus::IoError);
            return;
        }
    };
    if io.submitted() == 0 {
        io.set_remaining(chunks.len() as u64);
    }

    for (index, (range, chunk_start, chunk_len)) in chunks
        .iter()
        .copied()
        .enumerate()
        .skip(io.submitted() as usize)
    {
        let device_start = range.data_offset + (chunk_start - range.start);
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
            range.slot,
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

fn concat_capacity(array: &Arc<RaidBdev>) -> Result<u64> {
    Ok(block_ranges(array)?
        .iter()
        .map(|range| range.len)
        .sum())
}

impl Personality for Concat {
    fn level(&self) -> RaidLevel {
        RaidLevel::Concat
    }

    fn base_bdevs_min(&self) -> u32 {
        1
    }

    fn start(&self, array: &Arc<RaidBdev>) -> Result<()> {
        array.set_num_blocks(concat_capacity(array)?);
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
        let capacity = concat_capacity(array)?;
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
    fn capacity_is_the_sum_of_members() {
        let _mems = mem_devices("cc_cap", 3, 512, 512);
        let array = build_array("cc_cap_arr", "concat", 4, &names("cc_cap", 3), false).unwrap();
        assert_eq!(array.num_blocks(), 3 * 512);
    }

    #[test]
    fn requests_split_at_slot_boundaries() {
        let mems = mem_devices("cc_split", 2, 512, 512);
        let _array = build_array("cc_split_arr", "concat", 4, &names("cc_split", 2), false).unwrap();
        let frontend = vraid_block::get_device("cc_split_arr").unwrap();

        // 8 blocks straddling the boundary between slot 0 and slot 1.
        let payload = pattern(8 * 512, 0x42);
        assert_eq!(bdev_write(&frontend, 508, &payload), BioStatus::Complete);

        let mut raw = vec![0u8; 4 * 512];
        mems[0].read_raw(508, &mut raw);
        assert_eq!(raw, payload[..4 * 512]);
        let mut raw = vec![0u8; 4 * 512];
        mems[1].read_raw(0, &mut raw);
        assert_eq!(raw, payload[4 * 512..]);

        let (status, readback) = bdev_read(&frontend, 508, 8 * 512);
        assert_eq!(status, BioStatus::Complete);
        assert_eq!(readback, payload);
    }
}
