// SPDX-License-Identifier: MPL-2.0

//! The examine engine: matching newly visible base devices to arrays (by
//! name when no superblock is present, by UUID when one is) and the bind
//! flow that attaches a device to its slot.

use uuid::Uuid;
use vraid_block::{self as block, Bdev, BdevDesc, DeviceEvent};

use crate::{
    array::{self, RaidBdev, RaidState},
    member,
    prelude::*,
    superblock::{self, SbEntryState, Superblock, MIN_DATA_OFFSET_BYTES},
};

/// Inspects a newly registered block device and decides whether it joins an
/// existing array, creates a new one, or is ignored.
///
/// Runs on the application thread, from the block layer's examine hook.
pub(crate) fn examine(bdev: &Arc<Bdev>) {
    // An array front end is itself a registered block device; nothing to do.
    if bdev.device().downcast_ref::<RaidBdev>().is_some() {
        return;
    }
    if bdev.is_claimed() {
        return;
    }

    let name = bdev.name().to_string();
    let device_uuid = bdev.metadata().uuid;
    let block_size = bdev.metadata().block_size;

    // Read-only probe; bind opens its own descriptor later.
    let Some(desc) = BdevDesc::open(&name, |_| {}) else {
        return;
    };
    let probe = desc.clone();
    superblock::load(&probe, move |result| {
        desc.close();
        match result {
            Ok(sb) => examine_sb(&name, device_uuid, block_size, sb),
            Err(e) if e.errno() == NotSuperblock => {
                trace!("no superblock on {}: {}", name, e);
                examine_no_sb(&name);
            }
            Err(e) => warn!("failed to examine {}: {}", name, e),
        }
    });
}

/// A device without a superblock joins an array whose slot carries its name.
/// This covers pre-configured arrays without on-disk metadata.
fn examine_no_sb(name: &str) {
    for array in array::all_arrays() {
        let slot = {
            let slots = array.slots();
            slots.iter().position(|slot| {
                slot.desc.is_none()
                    && !slot.remove_scheduled
                    && slot.name.as_deref() == Some(name)
            })
        };
        let Some(slot) = slot else {
            continue;
        };
        match bind(&array, slot, false) {
            Ok(()) => return,
            Err(e) => {
                warn!("binding {} to {} failed: {}", name, array.name(), e);
                return;
            }
        }
    }
}

/// A device carrying a valid superblock is matched by UUID.
fn examine_sb(name: &str, device_uuid: Uuid, block_size: u32, mut sb: Superblock) {
    if sb.block_size != block_size {
        warn!(
            "{}: superblock block size {} does not match device block size {}",
            name, sb.block_size, block_size
        );
        return;
    }
    if sb.uuid.is_nil() {
        warn!("{}: superblock carries a nil array uuid", name);
        return;
    }

    let array = if let Some(existing) = array::find_array_by_uuid(&sb.uuid) {
        let existing_seq = existing.superblock_seq().unwrap_or(0);
        if sb.seq_number > existing_seq {
            if existing.state() != RaidState::Configuring {
                warn!(
                    "{}: ignoring superblock seq {} newer than running array {} (seq {})",
                    name,
                    sb.seq_number,
                    existing.name(),
                    existing_seq
                );
                return;
            }
            info!(
                "{}: superblock seq {} supersedes array {} (seq {}); reassembling",
                name,
                sb.seq_number,
                existing.name(),
                existing_seq
            );
            if let Err(e) = existing.delete(None) {
                warn!("failed to delete stale array {}: {}", existing.name(), e);
                return;
            }
            match array::create_from_superblock(sb.clone()) {
                Ok(array) => array,
                Err(e) => {
                    warn!("failed to reassemble array from {}: {}", name, e);
                    return;
                }
            }
        } else {
            if sb.seq_number < existing_seq {
                // The in-memory copy is newer; judge this member against it.
                let Some(current) = existing.superblock_clone() else {
                    return;
                };
                sb = current;
            }
            existing
        }
    } else {
        match array::create_from_superblock(sb.clone()) {
            Ok(array) => array,
            Err(e) => {
                warn!("failed to assemble array from {}: {}", name, e);
                return;
            }
        }
    };

    let Some(entry) = sb.entry_for(&device_uuid) else {
        debug!("{}: not a member of array {}", name, array.name());
        return;
    };
    if entry.state != SbEntryState::Configured {
        info!("{}: member marked failed; ignoring", name);
        return;
    }

    let slot = entry.slot as usize;
    {
        let mut slots = array.slots();
        let Some(info) = slots.get_mut(slot) else {
            return;
        };
        if info.desc.is_some() {
            debug!("slot {} of {} already bound", slot, array.name());
            return;
        }
        info.name = Some(name.to_string());
    }
    if let Err(e) = bind(&array, slot, true) {
        warn!("binding {} to {} failed: {}", name, array.name(), e);
    }
}

/// Attaches the named device to `slot` of `array`: open, claim, compute and
/// validate the data region, mark the slot configured, and trigger the
/// CONFIGURING → ONLINE transition once the array is fully discovered.
///
/// `from_sb` distinguishes slots preassigned from a superblock from freshly
/// added ones; the latter are scanned for a foreign superblock first so an
/// in-use device is not accidentally absorbed.
pub(crate) fn bind(array: &Arc<RaidBdev>, slot: usize, from_sb: bool) -> Result<()> {
    let (name, expected_uuid, stored_offset, stored_size) = {
        let slots = array.slots();
        let Some(info) = slots.get(slot) else {
            return_errno_with_msg!(InvalidArgs, "slot index out of range");
        };
        if info.desc.is_some() {
            return_errno_with_msg!(Busy, "slot already bound");
        }
        let Some(name) = info.name.clone() else {
            return_errno_with_msg!(InvalidArgs, "slot has no assigned name");
        };
        (name, info.uuid, info.data_offset, info.data_size)
    };

    let Some(bdev) = block::get_device(&name) else {
        return_errno_with_msg!(NotFound, "base bdev not present");
    };
    let meta = bdev.metadata();

    if !expected_uuid.is_nil() && expected_uuid != meta.uuid {
        return_errno_with_msg!(InvalidArgs, "base bdev uuid does not match slot");
    }

    if !bdev.claim() {
        return_errno_with_msg!(Busy, "base bdev already claimed");
    }

    let array_weak = std::sync::Arc::downgrade(array);
    let event_name = name.clone();
    let Some(desc) = BdevDesc::open(&name, move |event: DeviceEvent| {
        member::base_bdev_event(&array_weak, &event_name, event);
    }) else {
        bdev.release_claim();
        return_errno_with_msg!(NotFound, "base bdev disappeared while binding");
    };

    let result = bind_prepared(array, slot, from_sb, &desc, meta, stored_offset, stored_size);
    if result.is_err() && !array.slots()[slot].is_configured {
        // The slot never committed; a failure after commit (a failed
        // configuration pass) leaves the member attached.
        desc.close();
        bdev.release_claim();
    }
    result
}

fn bind_prepared(
    array: &Arc<RaidBdev>,
    slot: usize,
    from_sb: bool,
    desc: &Arc<BdevDesc>,
    meta: block::BlockDeviceMeta,
    stored_offset: u64,
    stored_size: u64,
) -> Result<()> {
    // A freshly added device must not already belong to someone else. For an
    // array that keeps no superblock of its own, any record found on the
    // device is someone else's.
    if !from_sb {
        match superblock::load_sync(desc) {
            Ok(found) if found.uuid != array.uuid() || !array.sb_enabled() => {
                return_errno_with_msg!(AlreadyExists, "device carries a foreign superblock");
            }
            Ok(_) => {}
            Err(e) if e.errno() == NotSuperblock => {}
            Err(e) => return Err(e),
        }
    }

    let block_size = meta.block_size as u64;
    let data_offset = if array.sb_enabled() {
        let optimal = round_up_pow2(
            MIN_DATA_OFFSET_BYTES.div_ceil(block_size),
            meta.optimal_io_boundary,
        );
        if stored_offset != 0 && stored_offset != optimal {
            warn!(
                "slot {} of {} keeps stored data offset {} (optimal {})",
                slot,
                array.name(),
                stored_offset,
                optimal
            );
            stored_offset
        } else {
            optimal
        }
    } else {
        stored_offset
    };

    if data_offset >= meta.num_blocks {
        return_errno_with_msg!(InvalidArgs, "data offset beyond device capacity");
    }
    let mut data_size = stored_size;
    if data_size == 0 {
        data_size = meta.num_blocks - data_offset;
    }
    if data_offset + data_size > meta.num_blocks {
        return_errno_with_msg!(InvalidArgs, "data region beyond device capacity");
    }

    {
        let mut slots = array.slots();
        let info = &mut slots[slot];
        info.uuid = meta.uuid;
        info.desc = Some(desc.clone());
        info.blockcnt = meta.num_blocks;
        info.data_offset = data_offset;
        info.data_size = data_size;
        info.is_configured = true;
    }
    array.channels_set_slot(slot, Some(desc.clone()));
    array
        .num_base_bdevs_discovered
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    debug!(
        "bound {} into slot {} of {} (offset {}, size {})",
        desc.bdev().name(),
        slot,
        array.name(),
        data_offset,
        data_size
    );

    if array.state() == RaidState::Configuring
        && array.num_base_bdevs_discovered() == array.num_base_bdevs_operational()
    {
        array.configure()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use vraid_block::{BlockDevice, MemBdev};

    use super::*;
    use crate::{
        personality::RaidLevel,
        superblock::SbEntry,
        test_util::*,
    };

    fn test_sb(name: &str, uuid: Uuid, seq: u64, member_uuids: &[(Uuid, SbEntryState)]) -> Superblock {
        Superblock {
            seq_number: seq,
            uuid,
            name: name.to_string(),
            level: RaidLevel::Raid0,
            strip_size: 16,
            block_size: 512,
            num_blocks: 6144 * member_uuids.len() as u64,
            num_base_bdevs: member_uuids.len() as u32,
            entries: member_uuids
                .iter()
                .enumerate()
                .map(|(slot, (member, state))| SbEntry {
                    uuid: *member,
                    slot: slot as u32,
                    state: *state,
                    data_offset: 2048,
                    data_size: 6144,
                })
                .collect(),
        }
    }

    fn stamped_devices(count: usize, sb: impl Fn(&[Uuid]) -> Superblock) -> Vec<Arc<MemBdev>> {
        let mems: Vec<_> = (0..count).map(|_| MemBdev::create(8192, 512)).collect();
        let uuids: Vec<_> = mems.iter().map(|mem| mem.metadata().uuid).collect();
        let record = sb(&uuids).serialize();
        for mem in &mems {
            mem.write_raw(0, &record);
        }
        mems
    }

    #[test]
    fn assemble_after_restart_in_arbitrary_order() {
        crate::init();
        let array_uuid = Uuid::new_v4();
        let mems = stamped_devices(3, |uuids| {
            let members: Vec<_> = uuids
                .iter()
                .map(|uuid| (*uuid, SbEntryState::Configured))
                .collect();
            test_sb("s2_arr", array_uuid, 7, &members)
        });

        // Examine in the order {d2, d0, d1}.
        vraid_block::register_device("s2_d2", mems[2].clone()).unwrap();
        let array = array::find_array_by_uuid(&array_uuid).unwrap();
        assert_eq!(array.state(), RaidState::Configuring);
        assert_eq!(array.num_base_bdevs_operational(), 3);
        assert_eq!(array.num_base_bdevs_discovered(), 1);

        vraid_block::register_device("s2_d0", mems[0].clone()).unwrap();
        assert_eq!(array.num_base_bdevs_discovered(), 2);

        vraid_block::register_device("s2_d1", mems[1].clone()).unwrap();
        assert_eq!(array.state(), RaidState::Online);
        assert_eq!(array.uuid(), array_uuid);
        assert_eq!(array.level(), RaidLevel::Raid0);
        assert_eq!(array.strip_size(), 16);
        assert_eq!(array.block_size(), 512);
        assert_eq!(array.num_blocks(), 3 * 6144);

        // Every slot took its preassigned geometry from the superblock.
        for slot in 0..3 {
            let geometry = array.slot_geometry(slot).unwrap();
            assert_eq!(geometry.data_offset, 2048);
            assert_eq!(geometry.data_size, 6144);
        }
        // The configuration pass rewrote the superblock with a higher
        // sequence number.
        assert_eq!(array.superblock_seq(), Some(8));
    }

    #[test]
    fn assembly_is_permutation_insensitive() {
        crate::init();
        let array_uuid = Uuid::new_v4();
        let mems = stamped_devices(3, |uuids| {
            let members: Vec<_> = uuids
                .iter()
                .map(|uuid| (*uuid, SbEntryState::Configured))
                .collect();
            test_sb("perm_arr", array_uuid, 3, &members)
        });

        for index in [1usize, 2, 0] {
            vraid_block::register_device(&format!("perm_d{index}"), mems[index].clone()).unwrap();
        }
        let array = array::find_array_by_uuid(&array_uuid).unwrap();
        assert_eq!(array.state(), RaidState::Online);
        assert_eq!(array.num_base_bdevs_discovered(), 3);
    }

    #[test]
    fn higher_sequence_replaces_a_configuring_array() {
        crate::init();
        let array_uuid = Uuid::new_v4();

        // One member of a 3-slot array with sequence 2 appears first.
        let old_mems = stamped_devices(3, |uuids| {
            let members: Vec<_> = uuids
                .iter()
                .map(|uuid| (*uuid, SbEntryState::Configured))
                .collect();
            test_sb("hs_arr", array_uuid, 2, &members)
        });
        vraid_block::register_device("hs_old0", old_mems[0].clone()).unwrap();

        let stale = array::find_array_by_uuid(&array_uuid).unwrap();
        assert_eq!(stale.state(), RaidState::Configuring);
        assert_eq!(stale.superblock_seq(), Some(2));
        assert_eq!(stale.num_base_bdevs_discovered(), 1);

        // A member carrying sequence 5 for the same array supersedes it.
        let new_mem = MemBdev::create(8192, 512);
        let new_uuid = new_mem.metadata().uuid;
        let record = test_sb(
            "hs_arr",
            array_uuid,
            5,
            &[
                (new_uuid, SbEntryState::Configured),
                (Uuid::new_v4(), SbEntryState::Configured),
                (Uuid::new_v4(), SbEntryState::Configured),
            ],
        )
        .serialize();
        new_mem.write_raw(0, &record);
        vraid_block::register_device("hs_new0", new_mem).unwrap();

        let rebuilt = array::find_array_by_uuid(&array_uuid).unwrap();
        assert!(!Arc::ptr_eq(&rebuilt, &stale));
        assert_eq!(rebuilt.superblock_seq(), Some(5));
        assert_eq!(rebuilt.state(), RaidState::Configuring);
        assert_eq!(rebuilt.num_base_bdevs_discovered(), 1);
        assert!(array::find_array_by_name("hs_arr").is_some());

        // The old member was released and can be claimed again.
        let old_bdev = vraid_block::get_device("hs_old0").unwrap();
        assert!(old_bdev.claim());
        old_bdev.release_claim();
    }

    #[test]
    fn higher_sequence_is_ignored_on_an_online_array() {
        let _mems = mem_devices("hso", 2, 8192, 512);
        let array = build_array("hso_arr", "raid1", 0, &names("hso", 2), true).unwrap();
        assert_eq!(array.state(), RaidState::Online);
        let seq = array.superblock_seq().unwrap();

        let intruder = MemBdev::create(8192, 512);
        let record = test_sb(
            "hso_arr",
            array.uuid(),
            seq + 40,
            &[(intruder.metadata().uuid, SbEntryState::Configured)],
        )
        .serialize();
        intruder.write_raw(0, &record);
        vraid_block::register_device("hso_intruder", intruder).unwrap();

        let same = array::find_array_by_uuid(&array.uuid()).unwrap();
        assert!(Arc::ptr_eq(&same, &array));
        assert_eq!(same.state(), RaidState::Online);
        assert_eq!(same.superblock_seq(), Some(seq));
        assert!(!vraid_block::get_device("hso_intruder").unwrap().is_claimed());
    }

    #[test]
    fn nil_array_uuid_is_ignored() {
        crate::init();
        let mems = stamped_devices(1, |uuids| {
            test_sb(
                "nil_arr",
                Uuid::nil(),
                1,
                &[(uuids[0], SbEntryState::Configured)],
            )
        });
        vraid_block::register_device("nil_d0", mems[0].clone()).unwrap();
        assert!(array::find_array_by_name("nil_arr").is_none());
        assert!(!vraid_block::get_device("nil_d0").unwrap().is_claimed());
    }

    #[test]
    fn block_size_mismatch_is_ignored() {
        crate::init();
        let mem = MemBdev::create(8192, 4096);
        let mut sb = test_sb(
            "bsm_arr",
            Uuid::new_v4(),
            1,
            &[(mem.metadata().uuid, SbEntryState::Configured)],
        );
        sb.block_size = 512; // disagrees with the 4 KiB device
        mem.write_raw(0, &sb.serialize());
        vraid_block::register_device("bsm_d0", mem).unwrap();
        assert!(array::find_array_by_name("bsm_arr").is_none());
    }

    #[test]
    fn failed_members_are_not_rebound() {
        crate::init();
        let array_uuid = Uuid::new_v4();
        let mem = MemBdev::create(8192, 512);
        // A mirror that lost this member: two entries stay CONFIGURED, the
        // presented device is recorded FAILED.
        let mut sb = test_sb(
            "fm_arr",
            array_uuid,
            4,
            &[
                (Uuid::new_v4(), SbEntryState::Configured),
                (Uuid::new_v4(), SbEntryState::Configured),
                (mem.metadata().uuid, SbEntryState::Failed),
            ],
        );
        sb.level = RaidLevel::Raid1;
        sb.strip_size = 0;
        sb.num_blocks = 6144;
        mem.write_raw(0, &sb.serialize());
        vraid_block::register_device("fm_d0", mem).unwrap();

        // The array record is assembled, but the failed member stays out.
        let array = array::find_array_by_uuid(&array_uuid).unwrap();
        assert_eq!(array.num_base_bdevs_operational(), 2);
        assert_eq!(array.num_base_bdevs_discovered(), 0);
        assert!(!vraid_block::get_device("fm_d0").unwrap().is_claimed());
    }

    #[test]
    fn named_slots_bind_without_a_superblock() {
        // Pre-configured array without on-disk metadata: slots are matched by
        // name as the devices appear.
        crate::init();
        let array = array::create(array::CreateOpts {
            name: "nsb_arr".to_string(),
            level: RaidLevel::Raid1,
            strip_size_kb: 0,
            num_base_bdevs: 2,
            superblock_enabled: false,
            uuid: None,
        })
        .unwrap();
        crate::member::add_base_bdev(&array, "nsb_d0", 0).unwrap();
        crate::member::add_base_bdev(&array, "nsb_d1", 1).unwrap();
        assert_eq!(array.num_base_bdevs_discovered(), 0);

        vraid_block::register_device("nsb_d0", MemBdev::create(2048, 512)).unwrap();
        assert_eq!(array.num_base_bdevs_discovered(), 1);
        vraid_block::register_device("nsb_d1", MemBdev::create(2048, 512)).unwrap();
        assert_eq!(array.num_base_bdevs_discovered(), 2);
        assert_eq!(array.state(), RaidState::Online);
    }

    #[test]
    fn foreign_superblock_declines_a_fresh_add() {
        crate::init();
        // A device already stamped by some other array.
        let foreign = stamped_devices(1, |uuids| {
            test_sb(
                "foreign_owner",
                Uuid::new_v4(),
                9,
                &[(uuids[0], SbEntryState::Failed)],
            )
        });
        // A failed-member record is not rebound on examine, so the device is
        // left unclaimed but still carries the foreign superblock.
        vraid_block::register_device("fsb_used", foreign[0].clone()).unwrap();
        assert!(!vraid_block::get_device("fsb_used").unwrap().is_claimed());

        let _fresh = mem_devices("fsb", 1, 8192, 512);
        let array = build_array(
            "fsb_arr",
            "raid1",
            0,
            &["fsb_0".to_string(), "fsb_used".to_string()],
            true,
        );
        assert_eq!(array.unwrap_err().errno(), AlreadyExists);
    }

    #[test]
    fn tiny_devices_are_ignored() {
        // A device smaller than the superblock area is simply "not a member".
        crate::init();
        let tiny = MemBdev::create(4, 512);
        vraid_block::register_device("tiny_d0", tiny).unwrap();
        assert!(!vraid_block::get_device("tiny_d0").unwrap().is_claimed());
    }
}
