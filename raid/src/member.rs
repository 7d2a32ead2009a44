// SPDX-License-Identifier: MPL-2.0

//! Member management: slot preassignment, removal behind the
//! quiesce/unquiesce fence, growing by one slot, base-device resize, and
//! device event dispatch.
//!
//! Removal follows the three-step ownership protocol around quiesce: null the
//! per-thread channel entries, then null the descriptor under the slot
//! spinlock, then release it.

use core::sync::atomic::Ordering;
use std::sync::Weak;

use vraid_block::{self as block, DeviceEvent};

use crate::{
    array::{self, BaseInfo, RaidBdev, RaidState, RemoveDoneFn},
    examine,
    prelude::*,
    superblock::{SbEntryState, MAX_BASE_BDEVS},
};

/// Preassigns `base_name` to `slot` of `array` and binds it if the device is
/// already present.
///
/// Rejects an out-of-range index and a slot that already carries a name or a
/// UUID. A device that is not present yet is left for the examine path.
pub fn add_base_bdev(array: &Arc<RaidBdev>, base_name: &str, slot: u32) -> Result<()> {
    {
        let mut slots = array.slots();
        let Some(info) = slots.get_mut(slot as usize) else {
            return_errno_with_msg!(InvalidArgs, "slot index out of range");
        };
        if info.name.is_some() {
            return_errno_with_msg!(Busy, "slot already has an assigned name");
        }
        if !info.uuid.is_nil() {
            return_errno_with_msg!(Busy, "slot already has an assigned uuid");
        }
        info.name = Some(base_name.to_string());
    }

    match examine::bind(array, slot as usize, false) {
        Ok(()) => Ok(()),
        // Not present yet; examine binds it when it appears.
        Err(e) if e.errno() == NotFound => Ok(()),
        Err(e) => {
            // Roll the preassignment back unless the device did bind and the
            // failure came from the configuration step that followed.
            let mut slots = array.slots();
            if !slots[slot as usize].is_configured {
                slots[slot as usize].name = None;
            }
            Err(e)
        }
    }
}

/// Returns the first slot with no name, no UUID and no descriptor.
pub fn find_first_empty_slot(array: &Arc<RaidBdev>) -> Result<u32> {
    let slots = array.slots();
    slots
        .iter()
        .position(|info| info.name.is_none() && info.uuid.is_nil() && info.desc.is_none())
        .map(|index| index as u32)
        .ok_or(Error::with_msg(InvalidArgs, "no free slot in array"))
}

/// Reverse lookup from a bound base device to its array and slot.
pub(crate) fn find_slot_by_base_name(name: &str) -> Option<(Arc<RaidBdev>, usize)> {
    for array in array::all_arrays() {
        let position = array
            .slots()
            .iter()
            .position(|info| info.name.as_deref() == Some(name) && info.desc.is_some());
        if let Some(position) = position {
            return Some((array, position));
        }
    }
    None
}

/// Removes the member backing the device named `base_name`.
///
/// `done` fires with the final status once the member is torn down.
pub fn remove_base_bdev(base_name: &str, done: Option<RemoveDoneFn>) -> Result<()> {
    let Some((array, slot)) = find_slot_by_base_name(base_name) else {
        return_errno_with_msg!(NotFound, "no raid member backed by this device");
    };
    remove_slot(&array, slot, done)
}

/// Removes `slot` from `array`.
///
/// Idempotent: a second call for an already-scheduled slot succeeds
/// immediately. A removal that would drop the operational count below the
/// personality's minimum deconfigures the array instead.
pub(crate) fn remove_slot(
    array: &Arc<RaidBdev>,
    slot: usize,
    done: Option<RemoveDoneFn>,
) -> Result<()> {
    {
        let mut slots = array.slots();
        let Some(info) = slots.get_mut(slot) else {
            return_errno_with_msg!(InvalidArgs, "slot index out of range");
        };
        if info.remove_scheduled {
            drop(slots);
            if let Some(done) = done {
                done(Ok(()));
            }
            return Ok(());
        }
        info.remove_scheduled = true;
        info.remove_done = done;
    }

    if array.state() != RaidState::Online {
        let completion = {
            let mut slots = array.slots();
            let info = &mut slots[slot];
            let was_configured = info.is_configured;
            let completion = info.release();
            if was_configured {
                array
                    .num_base_bdevs_discovered
                    .fetch_sub(1, Ordering::Relaxed);
            }
            completion
        };
        if let Some(completion) = completion {
            completion(Ok(()));
        }

        let gone = array
            .slots()
            .iter()
            .all(|info| info.desc.is_none() && info.name.is_none());
        if gone {
            array::remove_array(array.name());
        }
        return Ok(());
    }

    if array.num_base_bdevs_operational() - 1 < array.min_operational() {
        // Losing this member makes the array unstartable; tear the whole
        // array down. The destruct path releases the scheduled slot and
        // fires its completion.
        array
            .num_base_bdevs_operational
            .fetch_sub(1, Ordering::Relaxed);
        array.deconfigure(None);
        return Ok(());
    }

    let quiesced = array.clone();
    if let Err(e) = array.quiesce(Box::new(move || remove_quiesced(quiesced, slot))) {
        // Retryable: leave the slot exactly as before the attempt.
        let mut slots = array.slots();
        let info = &mut slots[slot];
        info.remove_scheduled = false;
        info.remove_done = None;
        return Err(e);
    }
    Ok(())
}

/// Continues a degraded-tolerant removal once the array's I/O has drained.
fn remove_quiesced(array: Arc<RaidBdev>, slot: usize) {
    // Step 1: in-flight and new I/Os stop seeing the slot.
    array.channels_set_slot(slot, None);
    array.unquiesce();

    // Step 2: null and release the descriptor under the slot spinlock.
    let (member_uuid, completion, was_configured) = {
        let mut slots = array.slots();
        let info = &mut slots[slot];
        let member_uuid = info.uuid;
        let was_configured = info.is_configured;
        let completion = info.release();
        (member_uuid, completion, was_configured)
    };
    if was_configured {
        array
            .num_base_bdevs_discovered
            .fetch_sub(1, Ordering::Relaxed);
        array
            .num_base_bdevs_operational
            .fetch_sub(1, Ordering::Relaxed);
    }

    // Step 3: persist the FAILED transition.
    let mut status = Ok(());
    if array.sb_enabled() {
        {
            let mut sb_guard = array.sb.lock();
            if let Some(sb) = sb_guard.as_mut() {
                if let Some(entry) = sb
                    .entries
                    .iter_mut()
                    .find(|entry| entry.uuid == member_uuid)
                {
                    entry.state = SbEntryState::Failed;
                }
            }
        }
        status = array.write_sb();
    }

    info!(
        "removed slot {} from {} ({} members operational)",
        slot,
        array.name(),
        array.num_base_bdevs_operational()
    );
    if let Some(completion) = completion {
        completion(status);
    }
}

/// Grows an ONLINE array by one slot and binds `base_name` into it.
///
/// The new slot is bound first, the personality resize hook runs second, and
/// the superblock (with the larger slot count) is written last, so a resize
/// failure leaves the on-disk metadata at the previous slot count.
pub fn grow_base_bdev(array: &Arc<RaidBdev>, base_name: &str) -> Result<()> {
    if !array.personality().supports_resize() {
        return_errno_with_msg!(Unsupported, "personality cannot resize");
    }
    if array.state() != RaidState::Online {
        return_errno_with_msg!(InvalidArgs, "array must be online to grow");
    }
    if block::get_device(base_name).is_none() {
        return_errno_with_msg!(NotFound, "base bdev not present");
    }

    let old_num = array.num_base_bdevs();
    let old_min = array.min_operational();
    let new_num = old_num + 1;
    if new_num as usize > MAX_BASE_BDEVS {
        return_errno_with_msg!(InvalidArgs, "too many base bdevs");
    }
    let new_min = array.personality().constraint().min_operational(new_num)?;

    let slot = {
        let mut slots = array.slots();
        let mut info = BaseInfo::empty();
        info.name = Some(base_name.to_string());
        slots.push(info);
        slots.len() - 1
    };
    array.num_base_bdevs.store(new_num, Ordering::Relaxed);
    array.min_operational.store(new_min, Ordering::Relaxed);
    array
        .num_base_bdevs_operational
        .fetch_add(1, Ordering::Relaxed);

    let rollback = |bound: bool| {
        if bound {
            let mut slots = array.slots();
            if slots[slot].is_configured {
                array
                    .num_base_bdevs_discovered
                    .fetch_sub(1, Ordering::Relaxed);
            }
            slots[slot].release();
        }
        array.channels_set_slot(slot, None);
        array.slots().pop();
        array.num_base_bdevs.store(old_num, Ordering::Relaxed);
        array.min_operational.store(old_min, Ordering::Relaxed);
        array
            .num_base_bdevs_operational
            .fetch_sub(1, Ordering::Relaxed);
    };

    if let Err(e) = examine::bind(array, slot, false) {
        rollback(false);
        return Err(e);
    }
    if let Err(e) = array.personality().resize(array) {
        rollback(true);
        return Err(e);
    }

    if array.sb_enabled() {
        array.sync_sb_from_slots();
        if let Err(e) = array.write_sb() {
            // The on-disk record still describes the old slot count; put the
            // in-memory state back to match it.
            rollback(true);
            if let Err(resize_err) = array.personality().resize(array) {
                warn!("geometry restore after failed grow: {}", resize_err);
            }
            array.sync_sb_from_slots();
            // Copies of the failed write may have landed on some members;
            // stamp the restored record with a newer sequence so they lose at
            // the next assembly.
            if let Err(restore_err) = array.write_sb() {
                warn!("superblock restore after failed grow: {}", restore_err);
            }
            return Err(e);
        }
    }
    info!("grew {} to {} slots", array.name(), new_num);
    Ok(())
}

/// Reacts to a capacity change of a slot's backing device.
pub(crate) fn base_bdev_resize(array: &Arc<RaidBdev>, slot: usize) {
    let desc = {
        let slots = array.slots();
        let Some(info) = slots.get(slot) else {
            return;
        };
        let Some(desc) = info.desc.clone() else {
            return;
        };
        desc
    };
    let meta = desc.bdev().metadata();

    {
        let mut slots = array.slots();
        let info = &mut slots[slot];
        if meta.num_blocks == info.blockcnt {
            return;
        }
        info!(
            "base bdev {} grew from {} to {} blocks",
            desc.bdev().name(),
            info.blockcnt,
            meta.num_blocks
        );
        // A data region that spanned to the end of the device follows the
        // new capacity.
        if info.data_size == info.blockcnt - info.data_offset {
            info.data_size = meta.num_blocks - info.data_offset;
        }
        info.blockcnt = meta.num_blocks;
    }

    if !array.personality().supports_resize() {
        return;
    }
    match array.personality().resize(array) {
        Ok(true) if array.sb_enabled() => {
            array.sync_sb_from_slots();
            if let Err(e) = array.write_sb() {
                warn!("superblock update after resize failed: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("resize of {} failed: {}", array.name(), e),
    }
}

/// Dispatches a host-level device event on a bound base device.
pub(crate) fn base_bdev_event(array: &Weak<RaidBdev>, base_name: &str, event: DeviceEvent) {
    let Some(array) = array.upgrade() else {
        return;
    };
    let slot = array
        .slots()
        .iter()
        .position(|info| info.name.as_deref() == Some(base_name));
    let Some(slot) = slot else {
        return;
    };

    match event {
        DeviceEvent::Remove => {
            info!("base bdev {} removed from under {}", base_name, array.name());
            if let Err(e) = remove_slot(&array, slot, None) {
                warn!("removal of {} failed: {}", base_name, e);
            }
        }
        DeviceEvent::Resize => {
            debug!("base bdev {} resize event", base_name);
            base_bdev_resize(&array, slot);
        }
    }
}
