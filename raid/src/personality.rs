// SPDX-License-Identifier: MPL-2.0

//! The RAID personality interface and the process-wide personality registry.
//!
//! A personality maps one logical I/O onto base-device I/Os for one RAID
//! level. The core consumes personalities exclusively through the
//! [`Personality`] trait; it never names a concrete level implementation.

use core::{any::Any, str::FromStr};
use std::collections::BTreeMap;

use spin::{Mutex as SpinLock, Once};

use crate::{array::RaidBdev, io::RaidIo, prelude::*};

/// A RAID level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RaidLevel {
    /// Striping.
    Raid0,
    /// Mirroring.
    Raid1,
    /// Concatenation.
    Concat,
}

impl RaidLevel {
    /// Returns the on-disk encoding of the level.
    pub fn to_raw(self) -> u32 {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 => 1,
            RaidLevel::Concat => 256,
        }
    }

    /// Decodes an on-disk level value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(RaidLevel::Raid0),
            1 => Some(RaidLevel::Raid1),
            256 => Some(RaidLevel::Concat),
            _ => None,
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaidLevel::Raid0 => "raid0",
            RaidLevel::Raid1 => "raid1",
            RaidLevel::Concat => "concat",
        };
        f.write_str(name)
    }
}

impl FromStr for RaidLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raid0" | "0" => Ok(RaidLevel::Raid0),
            "raid1" | "1" => Ok(RaidLevel::Raid1),
            "concat" => Ok(RaidLevel::Concat),
            _ => Err(Error::with_msg(InvalidArgs, "unknown raid level")),
        }
    }
}

/// How many base devices a personality can lose before the array must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Every slot must stay operational.
    Unset,
    /// At most this many slots may be removed.
    MaxBaseBdevsRemoved(u32),
    /// At least this many slots must stay operational.
    MinBaseBdevsOperational(u32),
}

impl Constraint {
    /// Computes the minimum operational slot count for an array of
    /// `num_base_bdevs` slots.
    pub fn min_operational(&self, num_base_bdevs: u32) -> Result<u32> {
        let min = match self {
            Constraint::Unset => num_base_bdevs,
            Constraint::MaxBaseBdevsRemoved(removed) => {
                num_base_bdevs.checked_sub(*removed).unwrap_or(0)
            }
            Constraint::MinBaseBdevsOperational(operational) => *operational,
        };
        if min == 0 || min > num_base_bdevs {
            return_errno_with_msg!(InvalidArgs, "unsatisfiable base bdev constraint");
        }
        Ok(min)
    }
}

/// A RAID level implementation.
///
/// `start`/`stop` bracket the array's ONLINE lifetime; `submit_rw` (and, when
/// advertised, `submit_null_payload`) carry the data path. All the remaining
/// capabilities are optional.
pub trait Personality: Send + Sync + Debug {
    /// The level this personality implements.
    fn level(&self) -> RaidLevel;

    /// The minimum number of slots an array of this level needs.
    fn base_bdevs_min(&self) -> u32;

    /// The degradation tolerance of this level.
    fn constraint(&self) -> Constraint {
        Constraint::Unset
    }

    /// Whether the personality can pass memory domains through to base
    /// devices.
    fn memory_domains_supported(&self) -> bool {
        false
    }

    /// Computes the array geometry and validates the slot set; called on the
    /// CONFIGURING → ONLINE transition. Must set the array block count via
    /// [`RaidBdev::set_num_blocks`] on success.
    fn start(&self, array: &Arc<RaidBdev>) -> Result<()>;

    /// Tears the personality down.
    ///
    /// Returning `false` means the stop suspends; the personality resumes the
    /// teardown later by calling [`RaidBdev::stop_done`].
    fn stop(&self, _array: &Arc<RaidBdev>) -> bool {
        true
    }

    /// Submits a READ or WRITE request to the base devices.
    fn submit_rw(&self, io: &Arc<RaidIo>);

    /// Whether [`Personality::submit_null_payload`] is provided. Without it,
    /// FLUSH and UNMAP are unsupported on arrays of this level.
    fn supports_null_payload(&self) -> bool {
        false
    }

    /// Submits a FLUSH or UNMAP request to the base devices.
    fn submit_null_payload(&self, io: &Arc<RaidIo>) {
        io.complete(vraid_block::bio::BioStatus::NotSupported);
    }

    /// Whether [`Personality::resize`] is provided. Without it, growing the
    /// array or reacting to a base device resize is rejected.
    fn supports_resize(&self) -> bool {
        false
    }

    /// Recomputes the array geometry after a slot's capacity or the slot
    /// count changed. Returns whether the array block count changed.
    fn resize(&self, _array: &Arc<RaidBdev>) -> Result<bool> {
        return_errno_with_msg!(Unsupported, "personality cannot resize");
    }

    /// Creates the personality-private part of a per-thread I/O channel.
    fn create_channel(&self, _array: &Arc<RaidBdev>) -> Option<Box<dyn Any + Send>> {
        None
    }
}

static REGISTRY: Once<SpinLock<BTreeMap<RaidLevel, Arc<dyn Personality>>>> = Once::new();

fn registry() -> &'static SpinLock<BTreeMap<RaidLevel, Arc<dyn Personality>>> {
    REGISTRY.call_once(|| SpinLock::new(BTreeMap::new()))
}

/// Registers a personality for its level.
///
/// Fails if a personality for the level is already installed.
pub fn register(personality: Arc<dyn Personality>) -> Result<()> {
    let mut table = registry().lock();
    let level = personality.level();
    if table.contains_key(&level) {
        return_errno_with_msg!(AlreadyExists, "personality already registered for level");
    }
    table.insert(level, personality);
    Ok(())
}

/// Looks up the personality installed for `level`.
pub fn find(level: RaidLevel) -> Option<Arc<dyn Personality>> {
    registry().lock().get(&level).cloned()
}
