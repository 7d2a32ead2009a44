// SPDX-License-Identifier: MPL-2.0

//! Array and slot records, the global array registry, and the lifecycle
//! engine: create, assemble from a superblock, configure, deconfigure,
//! destruct, delete.
//!
//! Control-plane entry points in this module must run on the designated
//! application thread; only the data path touches arrays from other threads,
//! through the spinlock-protected structures below.

use core::{
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::{
    sync::Weak,
    thread::ThreadId,
};

use hashbrown::HashMap;
use spin::{Mutex as SpinLock, MutexGuard as SpinLockGuard, Once};
use uuid::Uuid;
use vraid_block::{
    self as block,
    bio::{BioStatus, SubmittedBio},
    BdevDesc,
};

use crate::{
    io::RaidIoChannel,
    personality::{self, Personality, RaidLevel},
    prelude::*,
    superblock::{SbEntry, SbEntryState, Superblock, MAX_BASE_BDEVS, MAX_NAME_LEN},
};

/// Lifecycle states of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidState {
    /// Slots are still being discovered; no logical I/O is accepted.
    Configuring,
    /// Fully discovered and registered with the block layer.
    Online,
    /// Deconfigured; terminal for this array instance.
    Offline,
}

impl fmt::Display for RaidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaidState::Configuring => "configuring",
            RaidState::Online => "online",
            RaidState::Offline => "offline",
        };
        f.write_str(name)
    }
}

impl FromStr for RaidState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "configuring" => Ok(RaidState::Configuring),
            "online" => Ok(RaidState::Online),
            "offline" => Ok(RaidState::Offline),
            _ => Err(Error::with_msg(InvalidArgs, "unknown raid state")),
        }
    }
}

/// The completion callback of a member removal.
pub type RemoveDoneFn = Box<dyn FnOnce(Result<()>) + Send>;

/// Per-slot state of one base device position.
pub struct BaseInfo {
    /// The assigned device name; absent until the slot is named.
    pub(crate) name: Option<String>,
    /// The expected device UUID; nil until bound.
    pub(crate) uuid: Uuid,
    /// The open descriptor; present iff the slot is configured.
    pub(crate) desc: Option<Arc<BdevDesc>>,
    /// Capacity of the backing device in blocks.
    pub(crate) blockcnt: u64,
    /// First data block on the backing device.
    pub(crate) data_offset: u64,
    /// Number of data blocks on the backing device.
    pub(crate) data_size: u64,
    /// Whether the slot is bound and counted as discovered.
    pub(crate) is_configured: bool,
    /// Whether a removal has been scheduled for the slot.
    pub(crate) remove_scheduled: bool,
    /// Pending removal completion, fired when the slot is torn down.
    pub(crate) remove_done: Option<RemoveDoneFn>,
}

impl BaseInfo {
    pub(crate) fn empty() -> Self {
        Self {
            name: None,
            uuid: Uuid::nil(),
            desc: None,
            blockcnt: 0,
            data_offset: 0,
            data_size: 0,
            is_configured: false,
            remove_scheduled: false,
            remove_done: None,
        }
    }

    /// Releases the backing descriptor and resets the slot to empty.
    ///
    /// Returns the pending removal completion, if one was stashed.
    pub(crate) fn release(&mut self) -> Option<RemoveDoneFn> {
        if let Some(desc) = self.desc.take() {
            desc.bdev().release_claim();
            desc.close();
        }
        self.name = None;
        self.uuid = Uuid::nil();
        self.blockcnt = 0;
        self.data_offset = 0;
        self.data_size = 0;
        self.is_configured = false;
        self.remove_scheduled = false;
        self.remove_done.take()
    }
}

impl Debug for BaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BaseInfo")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("is_configured", &self.is_configured)
            .field("remove_scheduled", &self.remove_scheduled)
            .field("data_offset", &self.data_offset)
            .field("data_size", &self.data_size)
            .finish_non_exhaustive()
    }
}

/// The geometry of one configured slot, as seen by personalities.
#[derive(Debug, Clone, Copy)]
pub struct SlotGeometry {
    pub data_offset: u64,
    pub data_size: u64,
    pub blockcnt: u64,
}

/// One RAID array.
pub struct RaidBdev {
    pub(crate) self_weak: Weak<RaidBdev>,
    pub(crate) name: String,
    pub(crate) uuid: Uuid,
    pub(crate) level: RaidLevel,
    pub(crate) personality: Arc<dyn Personality>,
    pub(crate) strip_size_kb: u32,
    pub(crate) sb_enabled: bool,

    pub(crate) state: SpinLock<RaidState>,
    pub(crate) num_base_bdevs: AtomicU32,
    pub(crate) min_operational: AtomicU32,
    pub(crate) num_base_bdevs_discovered: AtomicU32,
    pub(crate) num_base_bdevs_operational: AtomicU32,
    pub(crate) destroy_started: AtomicBool,

    // Geometry, fixed during configuration.
    pub(crate) block_size: AtomicU32,
    pub(crate) blocklen_shift: AtomicU32,
    pub(crate) strip_size: AtomicU32,
    pub(crate) num_blocks: AtomicU64,

    /// Slot array; the spinlock covers slot scans by data-path threads and
    /// single-slot mutations by the application thread.
    pub(crate) base_info: SpinLock<Vec<BaseInfo>>,
    pub(crate) sb: SpinLock<Option<Superblock>>,

    // Data path.
    pub(crate) channels: SpinLock<HashMap<ThreadId, Arc<SpinLock<RaidIoChannel>>>>,
    pub(crate) quiesced: AtomicBool,
    pub(crate) io_inflight: AtomicU64,
    pub(crate) quiesce_waiters: SpinLock<Vec<Box<dyn FnOnce() + Send>>>,
    pub(crate) frozen_ios: SpinLock<Vec<SubmittedBio>>,
    pub(crate) stop_done: SpinLock<Option<Box<dyn FnOnce() + Send>>>,
}

impl Debug for RaidBdev {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RaidBdev")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("level", &self.level)
            .field("state", &self.state())
            .field("num_base_bdevs", &self.num_base_bdevs())
            .finish_non_exhaustive()
    }
}

/// Creation parameters of a fresh array.
#[derive(Debug, Clone)]
pub struct CreateOpts {
    pub name: String,
    pub level: RaidLevel,
    /// Strip size in kibibytes; must be zero for mirroring and a nonzero
    /// power of two otherwise.
    pub strip_size_kb: u32,
    pub num_base_bdevs: u32,
    pub superblock_enabled: bool,
    /// `None` (or the nil UUID) generates a fresh UUID when the superblock is
    /// enabled; otherwise the value is stored as-is.
    pub uuid: Option<Uuid>,
}

impl RaidBdev {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn level(&self) -> RaidLevel {
        self.level
    }

    pub fn personality(&self) -> &Arc<dyn Personality> {
        &self.personality
    }

    pub fn state(&self) -> RaidState {
        *self.state.lock()
    }

    pub fn sb_enabled(&self) -> bool {
        self.sb_enabled
    }

    pub fn strip_size_kb(&self) -> u32 {
        self.strip_size_kb
    }

    /// Strip size in blocks; zero for mirroring, valid once configured.
    pub fn strip_size(&self) -> u32 {
        self.strip_size.load(Ordering::Relaxed)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn blocklen_shift(&self) -> u32 {
        self.blocklen_shift.load(Ordering::Relaxed)
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Relaxed)
    }

    /// Sets the array capacity; called by the personality from its `start`
    /// and `resize` hooks.
    pub fn set_num_blocks(&self, num_blocks: u64) {
        self.num_blocks.store(num_blocks, Ordering::Relaxed);
    }

    pub fn num_base_bdevs(&self) -> u32 {
        self.num_base_bdevs.load(Ordering::Relaxed)
    }

    pub fn min_operational(&self) -> u32 {
        self.min_operational.load(Ordering::Relaxed)
    }

    pub fn num_base_bdevs_discovered(&self) -> u32 {
        self.num_base_bdevs_discovered.load(Ordering::Relaxed)
    }

    pub fn num_base_bdevs_operational(&self) -> u32 {
        self.num_base_bdevs_operational.load(Ordering::Relaxed)
    }

    /// Returns the geometry of `slot` if it is configured.
    pub fn slot_geometry(&self, slot: usize) -> Option<SlotGeometry> {
        let slots = self.base_info.lock();
        let info = slots.get(slot)?;
        if !info.is_configured {
            return None;
        }
        Some(SlotGeometry {
            data_offset: info.data_offset,
            data_size: info.data_size,
            blockcnt: info.blockcnt,
        })
    }

    /// Returns the current sequence number of the in-memory superblock.
    pub fn superblock_seq(&self) -> Option<u64> {
        self.sb.lock().as_ref().map(|sb| sb.seq_number)
    }

    pub(crate) fn superblock_clone(&self) -> Option<Superblock> {
        self.sb.lock().clone()
    }

    pub(crate) fn slots(&self) -> SpinLockGuard<'_, Vec<BaseInfo>> {
        self.base_info.lock()
    }

    pub(crate) fn set_state(&self, state: RaidState) {
        *self.state.lock() = state;
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<RaidBdev>> {
        self.self_weak.upgrade()
    }

    /// Resumes a personality `stop` that reported "not done".
    pub fn stop_done(&self) {
        if let Some(done) = self.stop_done.lock().take() {
            done();
        }
    }

    fn new(
        opts: CreateOpts,
        personality: Arc<dyn Personality>,
        min_operational: u32,
        operational: u32,
    ) -> Arc<Self> {
        let num_base_bdevs = opts.num_base_bdevs;
        Arc::new_cyclic(|weak| RaidBdev {
            self_weak: weak.clone(),
            name: opts.name,
            uuid: opts.uuid.unwrap_or_else(Uuid::nil),
            level: opts.level,
            personality,
            strip_size_kb: opts.strip_size_kb,
            sb_enabled: opts.superblock_enabled,
            state: SpinLock::new(RaidState::Configuring),
            num_base_bdevs: AtomicU32::new(num_base_bdevs),
            min_operational: AtomicU32::new(min_operational),
            num_base_bdevs_discovered: AtomicU32::new(0),
            num_base_bdevs_operational: AtomicU32::new(operational),
            destroy_started: AtomicBool::new(false),
            block_size: AtomicU32::new(0),
            blocklen_shift: AtomicU32::new(0),
            strip_size: AtomicU32::new(0),
            num_blocks: AtomicU64::new(0),
            base_info: SpinLock::new((0..num_base_bdevs).map(|_| BaseInfo::empty()).collect()),
            sb: SpinLock::new(None),
            channels: SpinLock::new(HashMap::new()),
            quiesced: AtomicBool::new(false),
            io_inflight: AtomicU64::new(0),
            quiesce_waiters: SpinLock::new(Vec::new()),
            frozen_ios: SpinLock::new(Vec::new()),
            stop_done: SpinLock::new(None),
        })
    }
}

fn validate_strip_size(level: RaidLevel, strip_size_kb: u32) -> Result<()> {
    if level == RaidLevel::Raid1 {
        if strip_size_kb != 0 {
            return_errno_with_msg!(InvalidArgs, "mirroring requires strip size zero");
        }
        return Ok(());
    }
    if strip_size_kb == 0 || !strip_size_kb.is_power_of_two() {
        return_errno_with_msg!(InvalidArgs, "strip size must be a power of two");
    }
    Ok(())
}

/// Creates a fresh array in the CONFIGURING state.
pub fn create(opts: CreateOpts) -> Result<Arc<RaidBdev>> {
    if opts.name.is_empty() || opts.name.len() > MAX_NAME_LEN {
        return_errno_with_msg!(InvalidArgs, "invalid array name length");
    }
    validate_strip_size(opts.level, opts.strip_size_kb)?;

    let Some(personality) = personality::find(opts.level) else {
        return_errno_with_msg!(InvalidArgs, "no personality for raid level");
    };
    if opts.num_base_bdevs < personality.base_bdevs_min() {
        return_errno_with_msg!(InvalidArgs, "not enough base bdevs for raid level");
    }
    if opts.num_base_bdevs as usize > MAX_BASE_BDEVS {
        return_errno_with_msg!(InvalidArgs, "too many base bdevs");
    }
    let min_operational = personality.constraint().min_operational(opts.num_base_bdevs)?;

    let uuid = match opts.uuid {
        Some(uuid) if !uuid.is_nil() => uuid,
        _ if opts.superblock_enabled => Uuid::new_v4(),
        Some(uuid) => uuid,
        None => Uuid::nil(),
    };

    let num_base_bdevs = opts.num_base_bdevs;
    let array = RaidBdev::new(
        CreateOpts {
            uuid: Some(uuid),
            ..opts
        },
        personality,
        min_operational,
        num_base_bdevs,
    );
    insert_array(array.clone())?;
    info!(
        "created raid bdev {} (level {}, {} slots)",
        array.name(),
        array.level(),
        array.num_base_bdevs()
    );
    Ok(array)
}

/// Assembles an array record from a superblock found on a member device.
///
/// The operational count equals the number of CONFIGURED slot entries; each
/// CONFIGURED entry preassigns its slot's UUID, data offset and data size.
pub(crate) fn create_from_superblock(sb: Superblock) -> Result<Arc<RaidBdev>> {
    let Some(personality) = personality::find(sb.level) else {
        return_errno_with_msg!(InvalidArgs, "no personality for raid level");
    };
    if sb.num_base_bdevs as usize > MAX_BASE_BDEVS {
        return_errno_with_msg!(InvalidArgs, "too many base bdevs in superblock");
    }
    let min_operational = personality.constraint().min_operational(sb.num_base_bdevs)?;

    let operational = sb
        .entries
        .iter()
        .filter(|entry| entry.state == SbEntryState::Configured)
        .count() as u32;
    if operational < min_operational {
        return_errno_with_msg!(InvalidArgs, "superblock describes an unstartable array");
    }

    let strip_size_kb = (sb.strip_size as u64 * sb.block_size as u64 / 1024) as u32;
    let array = RaidBdev::new(
        CreateOpts {
            name: sb.name.clone(),
            level: sb.level,
            strip_size_kb,
            num_base_bdevs: sb.num_base_bdevs,
            superblock_enabled: true,
            uuid: Some(sb.uuid),
        },
        personality,
        min_operational,
        operational,
    );

    {
        let mut slots = array.base_info.lock();
        for entry in sb.entries.iter() {
            if entry.state != SbEntryState::Configured {
                continue;
            }
            let slot = &mut slots[entry.slot as usize];
            slot.uuid = entry.uuid;
            slot.data_offset = entry.data_offset;
            slot.data_size = entry.data_size;
        }
    }
    *array.sb.lock() = Some(sb);

    insert_array(array.clone())?;
    info!(
        "assembling raid bdev {} from superblock ({} of {} members operational)",
        array.name(),
        operational,
        array.num_base_bdevs()
    );
    Ok(array)
}

impl RaidBdev {
    /// Rebuilds the superblock's slot entries from the current slot array,
    /// keeping entries already marked FAILED.
    pub(crate) fn sync_sb_from_slots(&self) {
        // Snapshot the slot array first; the slot lock is never held together
        // with the superblock lock.
        let configured: Vec<SbEntry> = self
            .base_info
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_configured)
            .map(|(index, slot)| SbEntry {
                uuid: slot.uuid,
                slot: index as u32,
                state: SbEntryState::Configured,
                data_offset: slot.data_offset,
                data_size: slot.data_size,
            })
            .collect();

        let mut sb_guard = self.sb.lock();
        let Some(sb) = sb_guard.as_mut() else {
            return;
        };

        let mut entries: Vec<SbEntry> = sb
            .entries
            .iter()
            .filter(|entry| entry.state == SbEntryState::Failed)
            .cloned()
            .collect();
        entries.extend(configured);
        entries.sort_by_key(|entry| entry.slot);

        sb.num_base_bdevs = self.num_base_bdevs();
        sb.num_blocks = self.num_blocks();
        sb.strip_size = self.strip_size();
        sb.block_size = self.block_size();
        sb.entries = entries;
    }

    /// Collects the descriptors of every configured slot.
    pub(crate) fn configured_descs(&self) -> Vec<Arc<BdevDesc>> {
        self.base_info
            .lock()
            .iter()
            .filter_map(|slot| slot.desc.clone())
            .collect()
    }

    /// Writes the superblock to every configured slot.
    pub(crate) fn write_sb(&self) -> Result<()> {
        let descs = self.configured_descs();
        let mut sb_guard = self.sb.lock();
        let Some(sb) = sb_guard.as_mut() else {
            return Ok(());
        };
        sb.save(&descs)
    }

    fn stop_personality(&self, done: Box<dyn FnOnce() + Send>) {
        let stopped = match self.self_arc() {
            Some(this) => self.personality.stop(&this),
            None => true,
        };
        if stopped {
            done();
        } else {
            *self.stop_done.lock() = Some(done);
        }
    }

    /// Transitions the array from CONFIGURING to ONLINE.
    ///
    /// Runs once `discovered == operational`: agrees on the block size,
    /// derives the strip size in blocks, checks metadata-format uniformity,
    /// starts the personality, initialises or validates the superblock,
    /// persists it and registers the block-device front end. Any failure
    /// leaves the array in CONFIGURING with the personality stopped.
    pub(crate) fn configure(&self) -> Result<()> {
        debug_assert_eq!(self.state(), RaidState::Configuring);
        debug_assert_eq!(
            self.num_base_bdevs_discovered(),
            self.num_base_bdevs_operational()
        );

        // Step 1: all configured slots must agree on the block size.
        let metas: Vec<_> = self
            .configured_descs()
            .iter()
            .map(|desc| desc.bdev().metadata())
            .collect();
        let Some(first) = metas.first() else {
            return_errno_with_msg!(InvalidArgs, "no configured base bdevs");
        };
        let block_size = first.block_size;
        if metas.iter().any(|meta| meta.block_size != block_size) {
            return_errno_with_msg!(InvalidArgs, "base bdevs disagree on block size");
        }
        self.block_size.store(block_size, Ordering::Relaxed);
        self.blocklen_shift
            .store(block_size.trailing_zeros(), Ordering::Relaxed);

        // Step 2: strip size in blocks; nonzero for every level but mirroring.
        let strip_size = if self.level == RaidLevel::Raid1 {
            0
        } else {
            let strip = self.strip_size_kb as u64 * 1024 / block_size as u64;
            if strip == 0 {
                return_errno_with_msg!(InvalidArgs, "strip size smaller than block size");
            }
            strip as u32
        };
        self.strip_size.store(strip_size, Ordering::Relaxed);

        // Step 3: metadata-format uniformity.
        for meta in metas.iter() {
            if meta.metadata_format.dif_enabled {
                return_errno_with_msg!(PermissionDenied, "DIF/DIX base bdevs are not supported");
            }
            if meta.metadata_format != first.metadata_format {
                return_errno_with_msg!(PermissionDenied, "base bdevs disagree on metadata format");
            }
        }

        // Step 4: personality start.
        let this = self.self_arc().ok_or(Error::new(InvalidArgs))?;
        self.personality.start(&this)?;

        // Step 5: superblock initialisation or validation.
        if self.sb_enabled {
            let fresh = self.sb.lock().is_none();
            if fresh {
                *self.sb.lock() = Some(Superblock {
                    seq_number: 0,
                    uuid: self.uuid,
                    name: self.name.clone(),
                    level: self.level,
                    strip_size,
                    block_size,
                    num_blocks: self.num_blocks(),
                    num_base_bdevs: self.num_base_bdevs(),
                    entries: Vec::new(),
                });
                self.sync_sb_from_slots();
            } else {
                let sb_guard = self.sb.lock();
                let sb = sb_guard.as_ref().expect("superblock present");
                debug_assert_eq!(sb.uuid, self.uuid);
                if sb.block_size != block_size {
                    drop(sb_guard);
                    self.stop_personality(Box::new(|| {}));
                    return_errno_with_msg!(
                        PermissionDenied,
                        "superblock block size does not match base bdevs"
                    );
                }
                if sb.num_blocks != self.num_blocks() {
                    drop(sb_guard);
                    self.stop_personality(Box::new(|| {}));
                    return_errno_with_msg!(
                        InvalidArgs,
                        "superblock capacity does not match array geometry"
                    );
                }
            }

            // Step 6a: persist.
            if let Err(e) = self.write_sb() {
                self.stop_personality(Box::new(|| {}));
                return Err(e);
            }
        }

        // Step 6b: register the block-device front end.
        let device: Arc<dyn block::BlockDevice> = this;
        if block::register_device(&self.name, device).is_none() {
            self.stop_personality(Box::new(|| {}));
            return_errno_with_msg!(AlreadyExists, "bdev name already in use");
        }

        self.set_state(RaidState::Online);
        info!(
            "raid bdev {} is online ({} blocks of {} bytes)",
            self.name,
            self.num_blocks(),
            self.block_size()
        );
        Ok(())
    }

    /// Takes the array OFFLINE and unregisters the front end.
    ///
    /// `done` fires when the unregister pipeline (including [`Self::destruct`])
    /// has finished.
    pub(crate) fn deconfigure(&self, done: Option<Box<dyn FnOnce() + Send>>) {
        if self.state() != RaidState::Online {
            if let Some(done) = done {
                done();
            }
            return;
        }
        debug_assert!(self.num_base_bdevs_discovered() > 0);

        self.set_state(RaidState::Offline);
        info!("raid bdev {} goes offline", self.name);
        block::unregister_device(&self.name, done);
    }

    /// The host unregister pipeline: releases slots that are leaving, stops
    /// the personality and frees the array record once nothing is discovered.
    pub(crate) fn destruct(&self, done: Box<dyn FnOnce() + Send>) {
        let shutdown = self.destroy_started.load(Ordering::Acquire);
        let mut completions: Vec<RemoveDoneFn> = Vec::new();
        {
            let mut slots = self.base_info.lock();
            for slot in slots.iter_mut() {
                if !(shutdown || slot.remove_scheduled) {
                    // Leave the descriptor for the examine path to reattach
                    // later.
                    continue;
                }
                let was_configured = slot.is_configured;
                if let Some(remove_done) = slot.release() {
                    completions.push(remove_done);
                }
                if was_configured {
                    self.num_base_bdevs_discovered.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        self.channels.lock().clear();
        let parked: Vec<SubmittedBio> = self.frozen_ios.lock().drain(..).collect();
        for bio in parked {
            bio.complete(BioStatus::IoError);
        }
        for completion in completions {
            completion(Ok(()));
        }

        let Some(this) = self.self_arc() else {
            done();
            return;
        };
        self.stop_personality(Box::new(move || {
            if this.num_base_bdevs_discovered() == 0 {
                remove_array(&this.name);
            }
            done();
        }));
    }

    /// Deletes the array.
    ///
    /// Idempotent: a second call fails with `InProgress`. Slots not bound to
    /// an ONLINE array are released synchronously and the record is freed
    /// once no slot remains; an ONLINE array routes through deconfigure.
    pub fn delete(&self, done: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        if self.destroy_started.swap(true, Ordering::AcqRel) {
            return_errno_with_msg!(InProgress, "delete already in progress");
        }

        let online = self.state() == RaidState::Online;
        let mut completions: Vec<RemoveDoneFn> = Vec::new();
        {
            let mut slots = self.base_info.lock();
            for slot in slots.iter_mut() {
                slot.remove_scheduled = true;
                if !online {
                    let was_configured = slot.is_configured;
                    if let Some(remove_done) = slot.release() {
                        completions.push(remove_done);
                    }
                    if was_configured {
                        self.num_base_bdevs_discovered.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            }
        }
        for completion in completions {
            completion(Ok(()));
        }

        if online {
            self.deconfigure(done);
        } else {
            debug_assert_eq!(self.num_base_bdevs_discovered(), 0);
            remove_array(&self.name);
            if let Some(done) = done {
                done();
            }
        }
        Ok(())
    }
}

static ARRAYS: Once<SpinLock<Vec<Arc<RaidBdev>>>> = Once::new();

fn arrays() -> &'static SpinLock<Vec<Arc<RaidBdev>>> {
    ARRAYS.call_once(|| SpinLock::new(Vec::new()))
}

fn insert_array(array: Arc<RaidBdev>) -> Result<()> {
    let mut list = arrays().lock();
    if list.iter().any(|existing| existing.name() == array.name()) {
        return_errno_with_msg!(AlreadyExists, "raid bdev name already exists");
    }
    list.push(array);
    Ok(())
}

pub(crate) fn remove_array(name: &str) {
    arrays().lock().retain(|array| array.name() != name);
}

/// Looks up an array by name.
pub fn find_array_by_name(name: &str) -> Option<Arc<RaidBdev>> {
    arrays()
        .lock()
        .iter()
        .find(|array| array.name() == name)
        .cloned()
}

/// Looks up an array by UUID.
pub fn find_array_by_uuid(uuid: &Uuid) -> Option<Arc<RaidBdev>> {
    arrays()
        .lock()
        .iter()
        .find(|array| array.uuid() == *uuid)
        .cloned()
}

/// Returns every known array.
pub fn all_arrays() -> Vec<Arc<RaidBdev>> {
    arrays().lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        superblock::{Superblock, SB_MAX_LENGTH},
        test_util::*,
    };

    #[test]
    fn create_and_online() {
        // 4 KiB blocks, 64 KiB strip, 4 slots.
        let mems = mem_devices("s1", 4, 768, 4096);
        let array = build_array("s1_r0", "raid0", 64, &names("s1", 4), true).unwrap();

        assert_eq!(array.state(), RaidState::Online);
        assert_eq!(array.strip_size(), 16);
        assert_eq!(array.blocklen_shift(), 12);
        assert_eq!(array.num_base_bdevs_discovered(), 4);
        assert_eq!(array.num_base_bdevs_operational(), 4);

        // The data region starts 1 MiB in; the rest stripes evenly.
        let per_slot = 768 - 256;
        assert_eq!(array.num_blocks(), 4 * per_slot);

        // A valid superblock landed on all 4 devices.
        for mem in &mems {
            let mut raw = vec![0u8; SB_MAX_LENGTH];
            mem.read_raw(0, &mut raw);
            let sb = Superblock::parse(&raw).unwrap();
            assert_eq!(sb.uuid, array.uuid());
            assert_eq!(sb.name, "s1_r0");
            assert_eq!(sb.strip_size, 16);
            assert_eq!(sb.block_size, 4096);
            assert_eq!(sb.num_base_bdevs, 4);
            assert_eq!(sb.entries.len(), 4);
        }
    }

    #[test]
    fn strip_size_zero_only_for_mirroring() {
        crate::init();
        let make = |name: &str, level: RaidLevel, strip: u32, slots: u32| {
            create(CreateOpts {
                name: name.to_string(),
                level,
                strip_size_kb: strip,
                num_base_bdevs: slots,
                superblock_enabled: false,
                uuid: None,
            })
        };

        assert_eq!(
            make("ss_a", RaidLevel::Raid0, 0, 2).unwrap_err().errno(),
            InvalidArgs
        );
        assert_eq!(
            make("ss_b", RaidLevel::Raid0, 48, 2).unwrap_err().errno(),
            InvalidArgs
        );
        assert_eq!(
            make("ss_c", RaidLevel::Raid1, 64, 2).unwrap_err().errno(),
            InvalidArgs
        );
        assert!(make("ss_d", RaidLevel::Raid1, 0, 2).is_ok());
        assert!(make("ss_e", RaidLevel::Raid0, 64, 2).is_ok());
    }

    #[test]
    fn slot_count_below_personality_minimum_rejected() {
        crate::init();
        let err = create(CreateOpts {
            name: "min_slots".to_string(),
            level: RaidLevel::Raid1,
            strip_size_kb: 0,
            num_base_bdevs: 1,
            superblock_enabled: false,
            uuid: None,
        })
        .unwrap_err();
        assert_eq!(err.errno(), InvalidArgs);
    }

    #[test]
    fn duplicate_array_name_rejected() {
        crate::init();
        let opts = CreateOpts {
            name: "dup_arr".to_string(),
            level: RaidLevel::Raid0,
            strip_size_kb: 64,
            num_base_bdevs: 2,
            superblock_enabled: false,
            uuid: None,
        };
        create(opts.clone()).unwrap();
        assert_eq!(create(opts).unwrap_err().errno(), AlreadyExists);
    }

    #[test]
    fn superblock_enabled_creation_generates_a_uuid() {
        crate::init();
        let array = create(CreateOpts {
            name: "uuid_gen".to_string(),
            level: RaidLevel::Raid0,
            strip_size_kb: 64,
            num_base_bdevs: 2,
            superblock_enabled: true,
            uuid: None,
        })
        .unwrap();
        assert!(!array.uuid().is_nil());

        let fixed = Uuid::new_v4();
        let array = create(CreateOpts {
            name: "uuid_fixed".to_string(),
            level: RaidLevel::Raid0,
            strip_size_kb: 64,
            num_base_bdevs: 2,
            superblock_enabled: true,
            uuid: Some(fixed),
        })
        .unwrap();
        assert_eq!(array.uuid(), fixed);
    }

    #[test]
    fn delete_without_slots_frees_synchronously() {
        crate::init();
        let array = create(CreateOpts {
            name: "del_sync".to_string(),
            level: RaidLevel::Raid0,
            strip_size_kb: 64,
            num_base_bdevs: 2,
            superblock_enabled: false,
            uuid: None,
        })
        .unwrap();

        array.delete(None).unwrap();
        assert!(find_array_by_name("del_sync").is_none());

        // Idempotent: the second call reports the delete in progress.
        assert_eq!(array.delete(None).unwrap_err().errno(), InProgress);
    }

    #[test]
    fn delete_online_unregisters_and_releases_members() {
        let _mems = mem_devices("del_on", 2, 2048, 512);
        let array = build_array("del_on_arr", "raid1", 0, &names("del_on", 2), false).unwrap();
        assert_eq!(array.state(), RaidState::Online);

        array.delete(None).unwrap();
        assert_eq!(array.state(), RaidState::Offline);
        assert!(vraid_block::get_device("del_on_arr").is_none());
        assert!(find_array_by_name("del_on_arr").is_none());

        // The members are released and can be claimed again.
        for name in names("del_on", 2) {
            let bdev = vraid_block::get_device(&name).unwrap();
            assert!(bdev.claim());
            bdev.release_claim();
        }
    }

    #[test]
    fn dif_members_are_rejected() {
        crate::init();
        let mem = vraid_block::MemBdev::create_with_dif(768, 4096);
        vraid_block::register_device("dif_0", mem).unwrap();
        let plain = vraid_block::MemBdev::create(768, 4096);
        vraid_block::register_device("dif_1", plain).unwrap();

        let err = build_array(
            "dif_arr",
            "raid0",
            64,
            &["dif_0".to_string(), "dif_1".to_string()],
            false,
        )
        .unwrap_err();
        assert_eq!(err.errno(), PermissionDenied);
    }

    #[test]
    fn mixed_block_sizes_are_rejected() {
        crate::init();
        let a = vraid_block::MemBdev::create(768, 4096);
        vraid_block::register_device("mixbs_0", a).unwrap();
        let b = vraid_block::MemBdev::create(6144, 512);
        vraid_block::register_device("mixbs_1", b).unwrap();

        let err = build_array(
            "mixbs_arr",
            "raid0",
            64,
            &["mixbs_0".to_string(), "mixbs_1".to_string()],
            false,
        )
        .unwrap_err();
        assert_eq!(err.errno(), InvalidArgs);
    }
}
