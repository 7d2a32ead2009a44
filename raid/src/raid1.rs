// SPDX-License-Identifier: MPL-2.0

//! The mirroring personality.
//!
//! Writes fan out to every operational slot; reads pick one operational slot
//! round-robin, with the balance counter living in the per-thread personality
//! channel. Strip size is zero and the array tolerates running down to a
//! single operational member.

use core::any::Any;

use vraid_block::bio::{BioStatus, BioType};

use crate::{
    array::RaidBdev,
    io::{ChildSubmit, RaidIo},
    personality::{Constraint, Personality, RaidLevel},
    prelude::*,
};

#[derive(Debug, Default)]
pub(crate) struct Raid1;

/// Per-thread channel state: the read-balance cursor.
struct Raid1Channel {
    next_read: usize,
}

/// Slots that currently have a live channel entry.
fn operational_slots(io: &RaidIo) -> Vec<usize> {
    let num_slots = io.array().num_base_bdevs() as usize;
    (0..num_slots)
        .filter(|slot| io.base_channel(*slot).is_some())
        .collect()
}

fn pick_read_slot(io: &Arc<RaidIo>) -> Option<usize> {
    let candidates = operational_slots(io);
    if candidates.is_empty() {
        return None;
    }
    let cursor = io.with_module_channel(|channel| {
        let state = channel.and_then(|any| any.downcast_mut::<Raid1Channel>());
        match state {
            Some(state) => {
                let cursor = state.next_read;
                state.next_read = state.next_read.wrapping_add(1);
                cursor
            }
            None => 0,
        }
    });
    Some(candidates[cursor % candidates.len()])
}

fn mirror_range(array: &Arc<RaidBdev>, slot: usize, io: &RaidIo) -> Option<core::ops::Range<u64>> {
    let geometry = array.slot_geometry(slot)?;
    let start = geometry.data_offset + io.offset_blocks();
    Some(start..start + io.num_blocks())
}

fn submit_write_request(io: &Arc<RaidIo>) {
    let array = io.array().clone();
    let targets = operational_slots(io);
    if targets.is_empty() {
        io.set_remaining(1);
        io.complete_part(1, BioStatus::IoError);
        return;
    }
    if io.submitted() == 0 {
        io.set_remaining(targets.len() as u64);
    }

    for (index, slot) in targets.iter().copied().enumerate().skip(io.submitted() as usize) {
        let Some(range) = mirror_range(&array, slot, io) else {
            io.complete_part(targets.len() as u64 - index as u64, BioStatus::IoError);
            return;
        };
        match io.submit_child(slot, io.type_(), range, io.segments().to_vec(), submit_write_request)
        {
            ChildSubmit::Submitted => io.inc_submitted(),
            ChildSubmit::Parked => return,
            ChildSubmit::Failed => {
                io.complete_part(targets.len() as u64 - index as u64, BioStatus::IoError);
                return;
            }
        }
    }
}

fn submit_read_request(io: &Arc<RaidIo>) {
    if io.submitted() == 0 {
        io.set_remaining(1);
    }
    let array = io.array().clone();
    let Some(slot) = pick_read_slot(io) else {
        io.complete_part(1, BioStatus::IoError);
        return;
    };
    let Some(range) = mirror_range(&array, slot, io) else {
        io.complete_part(1, BioStatus::IoError);
        return;
    };
    match io.submit_child(slot, BioType::Read, range, io.segments().to_vec(), submit_read_request) {
        ChildSubmit::Submitted => io.inc_submitted(),
        ChildSubmit::Parked => {}
        ChildSubmit::Failed => {
            io.complete_part(1, BioStatus::IoError);
        }
    }
}

fn submit_null_payload_request(io: &Arc<RaidIo>) {
    let array = io.array().clone();
    let targets = operational_slots(io);
    if targets.is_empty() {
        io.set_remaining(1);
        io.complete_part(1, BioStatus::IoError);
        return;
    }
    if io.submitted() == 0 {
        io.set_remaining(targets.len() as u64);
    }

    for (index, slot) in targets.iter().copied().enumerate().skip(io.submitted() as usize) {
        let range = match io.type_() {
            BioType::Flush => 0..0,
            _ => match mirror_range(&array, slot, io) {
                Some(range) => range,
                None => {
                    io.complete_part(targets.len() as u64 - index as u64, BioStatus::IoError);
                    return;
                }
            },
        };
        match io.submit_child(slot, io.type_(), range, Vec::new(), submit_null_payload_request) {
            ChildSubmit::Submitted => io.inc_submitted(),
            ChildSubmit::Parked => return,
            ChildSubmit::Failed => {
                io.complete_part(targets.len() as u64 - index as u64, BioStatus::IoError);
                return;
            }
        }
    }
}

fn mirror_capacity(array: &Arc<RaidBdev>) -> Result<u64> {
    let num_slots = array.num_base_bdevs() as usize;
    let min_data_size = (0..num_slots)
        .filter_map(|slot| array.slot_geometry(slot))
        .map(|geometry| geometry.data_size)
        .min();
    match min_data_size {
        Some(capacity) if capacity > 0 => Ok(capacity),
        _ => Err(Error::with_msg(InvalidArgs, "mirror has no usable member")),
    }
}

impl Personality for Raid1 {
    fn level(&self) -> RaidLevel {
        RaidLevel::Raid1
    }

    fn base_bdevs_min(&self) -> u32 {
        2
    }

    fn constraint(&self) -> Constraint {
        Constraint::MinBaseBdevsOperational(1)
    }

    fn start(&self, array: &Arc<RaidBdev>) -> Result<()> {
        array.set_num_blocks(mirror_capacity(array)?);
        Ok(())
    }

    fn submit_rw(&self, io: &Arc<RaidIo>) {
        match io.type_() {
            BioType::Read => submit_read_request(io),
            _ => submit_write_request(io),
        }
    }

    fn supports_null_payload(&self) -> bool {
        true
    }

    fn submit_null_payload(&self, io: &Arc<RaidIo>) {
        match io.type_() {
            BioType::Flush | BioType::Unmap => submit_null_payload_request(io),
            _ => io.complete(BioStatus::NotSupported),
        }
    }

    fn supports_resize(&self) -> bool {
        true
    }

    fn resize(&self, array: &Arc<RaidBdev>) -> Result<bool> {
        let capacity = mirror_capacity(array)?;
        if capacity == array.num_blocks() {
            return Ok(false);
        }
        array.set_num_blocks(capacity);
        Ok(true)
    }

    fn create_channel(&self, _array: &Arc<RaidBdev>) -> Option<Box<dyn Any + Send>> {
        Some(Box::new(Raid1Channel { next_read: 0 }))
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::*;
    use vraid_block::bio::BioStatus;

    #[test]
    fn writes_land_on_every_mirror() {
        let mems = mem_devices("r1wr", 2, 1024, 512);
        let _array = build_array("r1wr_arr", "raid1", 0, &names("r1wr", 2), false).unwrap();
        let frontend = vraid_block::get_device("r1wr_arr").unwrap();

        let payload = pattern(4 * 512, 0x11);
        assert_eq!(bdev_write(&frontend, 10, &payload), BioStatus::Complete);

        for mem in &mems {
            let mut raw = vec![0u8; 4 * 512];
            mem.read_raw(10, &mut raw);
            assert_eq!(raw, payload);
        }
    }

    #[test]
    fn reads_balance_across_mirrors_and_survive_divergence() {
        let mems = mem_devices("r1rd", 2, 1024, 512);
        let _array = build_array("r1rd_arr", "raid1", 0, &names("r1rd", 2), false).unwrap();
        let frontend = vraid_block::get_device("r1rd_arr").unwrap();

        // Make the two members deliberately different under the raid, so the
        // read-balance cursor is observable.
        mems[0].write_raw(5, &pattern(512, 0xaa));
        mems[1].write_raw(5, &pattern(512, 0xbb));

        let (status, first) = bdev_read(&frontend, 5, 512);
        assert_eq!(status, BioStatus::Complete);
        let (status, second) = bdev_read(&frontend, 5, 512);
        assert_eq!(status, BioStatus::Complete);
        assert_ne!(first, second);
    }

    #[test]
    fn mirror_capacity_is_the_smallest_member() {
        let _mems = (0..2)
            .map(|index| {
                let blocks = if index == 0 { 1024 } else { 768 };
                let mem = vraid_block::MemBdev::create(blocks, 512);
                vraid_block::register_device(&format!("r1cap_{index}"), mem.clone()).unwrap();
                mem
            })
            .collect::<Vec<_>>();
        let array = build_array("r1cap_arr", "raid1", 0, &names("r1cap", 2), false).unwrap();
        assert_eq!(array.num_blocks(), 768);
    }
}
