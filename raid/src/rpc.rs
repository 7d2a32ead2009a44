// SPDX-License-Identifier: MPL-2.0

//! The control contract: JSON-decoded requests against the array registry.
//!
//! A request carries a method name and a JSON parameter object; the success
//! path returns `true` or a result object, the error path a negative errno
//! code and a message.

use serde::Deserialize;
use serde_json::{json, Value};
use spin::{Mutex as SpinLock, Once};
use uuid::Uuid;

use crate::{
    array::{self, CreateOpts, RaidState},
    member,
    personality::RaidLevel,
    prelude::*,
};

/// The error shape of the control contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// Negative POSIX errno.
    pub code: i32,
    pub message: String,
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        RpcError {
            code: e.errno().to_neg_errno(),
            message: e.to_string(),
        }
    }
}

fn invalid(message: impl Into<String>) -> RpcError {
    RpcError {
        code: InvalidArgs.to_neg_errno(),
        message: message.into(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateParams {
    name: String,
    strip_size_kb: u32,
    raid_level: String,
    base_bdevs: Vec<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    superblock: bool,
    #[serde(default)]
    delta_bitmap: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NameParams {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ListParams {
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddSlotParams {
    raid_bdev: String,
    base_bdev: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrowParams {
    raid_name: String,
    base_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetOptionsParams {
    #[serde(default)]
    process_window_size_kb: Option<u32>,
    #[serde(default)]
    process_max_bandwidth_mb_sec: Option<u32>,
}

/// Tunables of the background process (rebuild window and bandwidth cap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    pub window_size_kb: u32,
    pub max_bandwidth_mb_sec: Option<u32>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            window_size_kb: 1024,
            max_bandwidth_mb_sec: None,
        }
    }
}

static OPTIONS: Once<SpinLock<ProcessOptions>> = Once::new();

fn options() -> &'static SpinLock<ProcessOptions> {
    OPTIONS.call_once(|| SpinLock::new(ProcessOptions::default()))
}

/// Returns the current background-process options.
pub fn process_options() -> ProcessOptions {
    *options().lock()
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: &Value,
) -> core::result::Result<T, RpcError> {
    serde_json::from_value::<T>(params.clone())
        .map_err(|e| invalid(format!("malformed parameters: {e}")))
}

/// Dispatches one control request.
pub fn dispatch(method: &str, params: Value) -> core::result::Result<Value, RpcError> {
    crate::init();
    match method {
        "array.list" => list(&params),
        "array.create" => create(&params),
        "array.delete" => delete(&params),
        "array.add_slot" => add_slot(&params),
        "array.remove_slot" => remove_slot(&params),
        "array.grow" => grow(&params),
        "array.set_options" => set_options(&params),
        _ => Err(invalid(format!("unknown method {method}"))),
    }
}

fn list(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: ListParams = if params.is_null() {
        ListParams::default()
    } else {
        parse_params(params)?
    };
    let filter = match params.category.as_deref() {
        None | Some("all") => None,
        Some(category) => Some(
            category
                .parse::<RaidState>()
                .map_err(|_| invalid("unknown category"))?,
        ),
    };

    let arrays: Vec<Value> = array::all_arrays()
        .into_iter()
        .filter(|array| filter.map_or(true, |state| array.state() == state))
        .map(|array| {
            let base_bdevs: Vec<Value> = array
                .slots()
                .iter()
                .map(|slot| {
                    json!({
                        "name": slot.name,
                        "uuid": slot.uuid.to_string(),
                        "is_configured": slot.is_configured,
                        "data_offset": slot.data_offset,
                        "data_size": slot.data_size,
                    })
                })
                .collect();
            json!({
                "name": array.name(),
                "uuid": array.uuid().to_string(),
                "state": array.state().to_string(),
                "raid_level": array.level().to_string(),
                "strip_size_kb": array.strip_size_kb(),
                "num_base_bdevs": array.num_base_bdevs(),
                "num_base_bdevs_discovered": array.num_base_bdevs_discovered(),
                "num_base_bdevs_operational": array.num_base_bdevs_operational(),
                "superblock": array.sb_enabled(),
                "base_bdevs": base_bdevs,
            })
        })
        .collect();
    Ok(Value::Array(arrays))
}

fn create(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: CreateParams = parse_params(params)?;

    if params.delta_bitmap {
        // The delta bitmap mechanism is a collaborator contract not part of
        // this module.
        return Err(invalid("delta_bitmap is not supported"));
    }
    let level: RaidLevel = params
        .raid_level
        .parse()
        .map_err(|e: Error| RpcError::from(e))?;
    let uuid = match params.uuid.as_deref() {
        None => None,
        Some(text) => Some(
            text.parse::<Uuid>()
                .map_err(|_| invalid("malformed uuid"))?,
        ),
    };
    if params.base_bdevs.is_empty() {
        return Err(invalid("base_bdevs must not be empty"));
    }

    let arr = array::create(CreateOpts {
        name: params.name,
        level,
        strip_size_kb: params.strip_size_kb,
        num_base_bdevs: params.base_bdevs.len() as u32,
        superblock_enabled: params.superblock,
        uuid,
    })?;

    for (slot, base_name) in params.base_bdevs.iter().enumerate() {
        if let Err(e) = member::add_base_bdev(&arr, base_name, slot as u32) {
            let _ = arr.delete(None);
            return Err(e.into());
        }
    }
    Ok(json!(true))
}

fn delete(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: NameParams = parse_params(params)?;
    let array = array::find_array_by_name(&params.name)
        .ok_or_else(|| RpcError::from(Error::with_msg(NotFound, "raid bdev not found")))?;
    array.delete(None)?;
    Ok(json!(true))
}

fn add_slot(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: AddSlotParams = parse_params(params)?;
    let array = array::find_array_by_name(&params.raid_bdev)
        .ok_or_else(|| RpcError::from(Error::with_msg(NotFound, "raid bdev not found")))?;
    let slot = member::find_first_empty_slot(&array)?;
    member::add_base_bdev(&array, &params.base_bdev, slot)?;
    Ok(json!(true))
}

fn remove_slot(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: NameParams = parse_params(params)?;
    member::remove_base_bdev(&params.name, None)?;
    Ok(json!(true))
}

fn grow(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: GrowParams = parse_params(params)?;
    let array = array::find_array_by_name(&params.raid_name)
        .ok_or_else(|| RpcError::from(Error::with_msg(NotFound, "raid bdev not found")))?;
    member::grow_base_bdev(&array, &params.base_name)?;
    Ok(json!(true))
}

fn set_options(params: &Value) -> core::result::Result<Value, RpcError> {
    let params: SetOptionsParams = parse_params(params)?;

    if let Some(window) = params.process_window_size_kb {
        if window == 0 || !window.is_power_of_two() {
            return Err(invalid("process window size must be a nonzero power of two"));
        }
    }
    if let Some(bandwidth) = params.process_max_bandwidth_mb_sec {
        if bandwidth == 0 {
            return Err(invalid("process bandwidth must be nonzero"));
        }
    }

    let mut current = options().lock();
    if let Some(window) = params.process_window_size_kb {
        current.window_size_kb = window;
    }
    if let Some(bandwidth) = params.process_max_bandwidth_mb_sec {
        current.max_bandwidth_mb_sec = Some(bandwidth);
    }
    Ok(json!(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn create_list_delete_round_trip() {
        let _mems = mem_devices("rpc1", 2, 8192, 512);
        dispatch(
            "array.create",
            json!({
                "name": "rpc1_arr",
                "strip_size_kb": 8,
                "raid_level": "raid0",
                "base_bdevs": ["rpc1_0", "rpc1_1"],
                "superblock": true,
            }),
        )
        .unwrap();

        let listed = dispatch("array.list", json!({"category": "online"})).unwrap();
        let entry = listed
            .as_array()
            .unwrap()
            .iter()
            .find(|entry| entry["name"] == "rpc1_arr")
            .unwrap();
        assert_eq!(entry["state"], "online");
        assert_eq!(entry["raid_level"], "raid0");
        assert_eq!(entry["strip_size_kb"], 8);
        assert_eq!(entry["num_base_bdevs"], 2);
        assert_eq!(entry["base_bdevs"].as_array().unwrap().len(), 2);

        let offline = dispatch("array.list", json!({"category": "offline"})).unwrap();
        assert!(!offline
            .as_array()
            .unwrap()
            .iter()
            .any(|entry| entry["name"] == "rpc1_arr"));

        dispatch("array.delete", json!({"name": "rpc1_arr"})).unwrap();
        let err = dispatch("array.delete", json!({"name": "rpc1_arr"})).unwrap_err();
        assert_eq!(err.code, -19); // ENODEV once the record is gone
    }

    #[test]
    fn malformed_requests_are_rejected_with_einval() {
        crate::init();
        let cases = [
            ("array.create", json!({"name": "x"})),
            (
                "array.create",
                json!({
                    "name": "rpcbad_arr",
                    "strip_size_kb": 8,
                    "raid_level": "raid9",
                    "base_bdevs": ["a", "b"],
                }),
            ),
            (
                "array.create",
                json!({
                    "name": "rpcbad_arr",
                    "strip_size_kb": 8,
                    "raid_level": "raid0",
                    "base_bdevs": ["a", "b"],
                    "uuid": "not-a-uuid",
                }),
            ),
            (
                "array.create",
                json!({
                    "name": "rpcbad_arr",
                    "strip_size_kb": 8,
                    "raid_level": "raid0",
                    "base_bdevs": ["a", "b"],
                    "delta_bitmap": true,
                }),
            ),
            (
                "array.create",
                json!({
                    "name": "rpcbad_arr",
                    "strip_size_kb": 8,
                    "raid_level": "raid0",
                    "base_bdevs": ["a", "b"],
                    "bogus_field": 1,
                }),
            ),
            ("array.list", json!({"category": "sideways"})),
            ("array.bogus", json!({})),
        ];
        for (method, params) in cases {
            let err = dispatch(method, params).unwrap_err();
            assert_eq!(err.code, -22, "{method} should fail with EINVAL");
        }
    }

    #[test]
    fn missing_arrays_report_enodev() {
        crate::init();
        for (method, params) in [
            ("array.delete", json!({"name": "rpc_missing"})),
            (
                "array.add_slot",
                json!({"raid_bdev": "rpc_missing", "base_bdev": "x"}),
            ),
            (
                "array.grow",
                json!({"raid_name": "rpc_missing", "base_name": "x"}),
            ),
            ("array.remove_slot", json!({"name": "rpc_missing"})),
        ] {
            let err = dispatch(method, params).unwrap_err();
            assert_eq!(err.code, -19, "{method} should fail with ENODEV");
        }
    }

    #[test]
    fn grow_and_remove_via_the_contract() {
        let _mems = mem_devices("rpc2", 3, 8192, 512);
        dispatch(
            "array.create",
            json!({
                "name": "rpc2_arr",
                "strip_size_kb": 0,
                "raid_level": "raid1",
                "base_bdevs": ["rpc2_0", "rpc2_1"],
                "superblock": true,
            }),
        )
        .unwrap();

        dispatch(
            "array.grow",
            json!({"raid_name": "rpc2_arr", "base_name": "rpc2_2"}),
        )
        .unwrap();
        let array = array::find_array_by_name("rpc2_arr").unwrap();
        assert_eq!(array.num_base_bdevs(), 3);

        dispatch("array.remove_slot", json!({"name": "rpc2_0"})).unwrap();
        assert_eq!(array.num_base_bdevs_operational(), 2);
        assert_eq!(array.state(), RaidState::Online);
    }

    #[test]
    fn set_options_validates_and_applies() {
        crate::init();
        let err = dispatch(
            "array.set_options",
            json!({"process_window_size_kb": 3}),
        )
        .unwrap_err();
        assert_eq!(err.code, -22);
        let err = dispatch(
            "array.set_options",
            json!({"process_max_bandwidth_mb_sec": 0}),
        )
        .unwrap_err();
        assert_eq!(err.code, -22);

        dispatch(
            "array.set_options",
            json!({"process_window_size_kb": 2048, "process_max_bandwidth_mb_sec": 125}),
        )
        .unwrap();
        let current = process_options();
        assert_eq!(current.window_size_kb, 2048);
        assert_eq!(current.max_bandwidth_mb_sec, Some(125));
    }
}
