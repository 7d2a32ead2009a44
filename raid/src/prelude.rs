// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno::*, Error},
    return_errno, return_errno_with_msg,
    util::{align_up, round_up_pow2},
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use core::fmt::{self, Debug};
pub(crate) use std::sync::Arc;

pub(crate) use log::{debug, error, info, trace, warn};
