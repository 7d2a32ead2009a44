// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;
use std::sync::Arc;

use spin::Mutex as SpinLock;

use crate::{wait::WaitQueue, Bdev};

/// The index of a block on a device.
///
/// Unlike a byte offset, a `Bid` is always expressed in units of the owning
/// device's block size, which is only known at runtime.
pub type Bid = u64;

/// The completion callback of a `Bio`.
///
/// Invoked exactly once, with the status the device completed the request
/// with. The callback rides inside the request's lifecycle state, so a bio
/// that is never accepted by a device simply drops it.
pub type BioCompleteFn = Box<dyn FnOnce(&SubmittedBio, BioStatus) + Send>;

/// The unit for block I/O: an operation, the target block range, the memory
/// segments carrying the payload, and an optional completion callback.
///
/// Submitters run on a cooperative, run-to-completion model: a bio is built,
/// handed to one device, and either accepted (the device completes it later,
/// possibly inline) or refused (the bio stays submittable, which is how the
/// transient-exhaustion retry resubmits it).
#[derive(Debug)]
pub struct Bio(Arc<BioInner>);

impl Bio {
    /// Constructs a new `Bio`.
    ///
    /// `range` is the target block range on the device. `Flush` and `Reset`
    /// bios carry no segments and may use an empty range.
    pub fn new(
        type_: BioType,
        range: Range<Bid>,
        segments: Vec<BioSegment>,
        complete_fn: Option<BioCompleteFn>,
    ) -> Self {
        Self(Arc::new(BioInner {
            type_,
            range,
            segments,
            lifecycle: SpinLock::new(BioLifecycle {
                phase: BioPhase::Prepared,
                complete_fn,
            }),
            wait_queue: WaitQueue::new(),
        }))
    }

    /// Returns the type.
    pub fn type_(&self) -> BioType {
        self.0.type_
    }

    /// Returns the range of target blocks on the device.
    pub fn range(&self) -> &Range<Bid> {
        &self.0.range
    }

    /// Returns the slice to the memory segments.
    pub fn segments(&self) -> &[BioSegment] {
        &self.0.segments
    }

    /// Returns the completion status, or `None` while the request has not
    /// finished.
    pub fn status(&self) -> Option<BioStatus> {
        self.0.status()
    }

    /// Submits self to the `bdev` asynchronously.
    ///
    /// Returns a `BioWaiter` to the caller to wait for its completion. A
    /// refused submission hands the bio back intact, so the submitter may
    /// park and try again.
    ///
    /// # Panics
    ///
    /// If the bio was already accepted by a device, this method will panic.
    pub fn submit(&self, bdev: &Bdev) -> Result<BioWaiter, BioEnqueueError> {
        self.0.enter_flight();
        if let Err(e) = bdev.enqueue(SubmittedBio(self.0.clone())) {
            self.0.leave_flight();
            return Err(e);
        }

        Ok(BioWaiter {
            bios: vec![self.0.clone()],
        })
    }

    /// Submits self to the `bdev` and waits for the result synchronously.
    ///
    /// # Panics
    ///
    /// If the bio was already accepted by a device, this method will panic.
    pub fn submit_and_wait(&self, bdev: &Bdev) -> Result<BioStatus, BioEnqueueError> {
        let _waiter = self.submit(bdev)?;
        Ok(self.0.wait_done())
    }
}

/// The error type returned when enqueueing the `Bio`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BioEnqueueError {
    /// The request queue is full
    IsFull,
    /// Refuse to enqueue the bio
    Refused,
    /// Too big bio
    TooBig,
}

/// A waiter for `Bio` submissions.
///
/// Holds a list of accepted requests and waits for all of them, reporting
/// whether every one completed successfully.
#[must_use]
#[derive(Debug)]
pub struct BioWaiter {
    bios: Vec<Arc<BioInner>>,
}

impl BioWaiter {
    /// Constructs a new `BioWaiter` instance with no `Bio` requests.
    pub fn new() -> Self {
        Self { bios: Vec::new() }
    }

    /// Returns the number of `Bio` requests associated with `self`.
    pub fn nreqs(&self) -> usize {
        self.bios.len()
    }

    /// Returns the completion status of the `index`-th request, or `None`
    /// while it is still in flight.
    ///
    /// # Panics
    ///
    /// If the `index` is out of bounds, this method will panic.
    pub fn status(&self, index: usize) -> Option<BioStatus> {
        self.bios[index].status()
    }

    /// Merges the `Bio` requests from another `BioWaiter` into this one.
    pub fn concat(&mut self, mut other: Self) {
        self.bios.append(&mut other.bios);
    }

    /// Waits for every request to finish.
    ///
    /// Returns `Some(BioStatus::Complete)` iff all of them completed
    /// successfully, `None` otherwise.
    pub fn wait(&self) -> Option<BioStatus> {
        let mut all_complete = true;
        for bio in self.bios.iter() {
            all_complete &= bio.wait_done() == BioStatus::Complete;
        }
        all_complete.then_some(BioStatus::Complete)
    }
}

impl Default for BioWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// A submitted `Bio` object, as seen by the device that accepted it.
///
/// The device finishes the request by calling [`SubmittedBio::complete`]
/// exactly once.
#[derive(Debug)]
pub struct SubmittedBio(Arc<BioInner>);

impl SubmittedBio {
    /// Returns the type.
    pub fn type_(&self) -> BioType {
        self.0.type_
    }

    /// Returns the range of target blocks on the device.
    pub fn range(&self) -> &Range<Bid> {
        &self.0.range
    }

    /// Returns the slice to the memory segments.
    pub fn segments(&self) -> &[BioSegment] {
        &self.0.segments
    }

    /// Returns the completion status, or `None` while the request has not
    /// finished.
    pub fn status(&self) -> Option<BioStatus> {
        self.0.status()
    }

    /// Completes the request with `status`, waking waiters and invoking the
    /// completion callback.
    ///
    /// # Panics
    ///
    /// If the request already finished, this method will panic.
    pub fn complete(&self, status: BioStatus) {
        let complete_fn = self.0.finish(status);
        self.0.wait_queue.wake_all();
        if let Some(complete_fn) = complete_fn {
            complete_fn(self, status);
        }
    }
}

/// The common inner part of `Bio`.
struct BioInner {
    type_: BioType,
    range: Range<Bid>,
    segments: Vec<BioSegment>,
    /// Where the request is in its life, plus the callback it still owes.
    lifecycle: SpinLock<BioLifecycle>,
    /// Waiters blocked until the request reaches `Done`.
    wait_queue: WaitQueue,
}

struct BioLifecycle {
    phase: BioPhase,
    complete_fn: Option<BioCompleteFn>,
}

/// The life of a request: built, handed to a device, finished.
///
/// A refused submission moves back from `InFlight` to `Prepared`; only a
/// device completion reaches `Done`, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BioPhase {
    Prepared,
    InFlight,
    Done(BioStatus),
}

impl BioInner {
    fn status(&self) -> Option<BioStatus> {
        match self.lifecycle.lock().phase {
            BioPhase::Done(status) => Some(status),
            _ => None,
        }
    }

    fn wait_done(&self) -> BioStatus {
        self.wait_queue.wait_until(|| self.status())
    }

    fn enter_flight(&self) {
        let mut lifecycle = self.lifecycle.lock();
        assert_eq!(
            lifecycle.phase,
            BioPhase::Prepared,
            "a bio must not be submitted more than once"
        );
        lifecycle.phase = BioPhase::InFlight;
    }

    fn leave_flight(&self) {
        let mut lifecycle = self.lifecycle.lock();
        debug_assert_eq!(lifecycle.phase, BioPhase::InFlight);
        lifecycle.phase = BioPhase::Prepared;
    }

    fn finish(&self, status: BioStatus) -> Option<BioCompleteFn> {
        let mut lifecycle = self.lifecycle.lock();
        assert_eq!(
            lifecycle.phase,
            BioPhase::InFlight,
            "a bio must be completed exactly once"
        );
        lifecycle.phase = BioPhase::Done(status);
        lifecycle.complete_fn.take()
    }
}

impl core::fmt::Debug for BioInner {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Bio")
            .field("type", &self.type_)
            .field("range", &self.range)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// The type of `Bio`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioType {
    /// Read blocks from the device.
    Read,
    /// Write blocks into the device.
    Write,
    /// Flush the volatile write cache.
    Flush,
    /// Unmap blocks.
    Unmap,
    /// Reset the device.
    Reset,
}

/// The completion status of a `Bio`.
///
/// A request that has not finished has no status; being in flight is a
/// lifecycle phase, not a status value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BioStatus {
    /// The I/O operation has been successfully completed.
    Complete,
    /// The I/O operation is not supported.
    NotSupported,
    /// Insufficient resources are available to perform the I/O operation.
    NoSpace,
    /// An error occurred while doing I/O.
    IoError,
}

/// `BioSegment` is the basic memory unit of a block I/O request.
///
/// Cloning a segment is cheap; clones share the backing buffer. A segment may
/// view a sub-range of the buffer, so one logical request's payload can be
/// carved into per-device child payloads without copying.
#[derive(Debug, Clone)]
pub struct BioSegment {
    buf: Arc<SpinLock<Box<[u8]>>>,
    offset: usize,
    len: usize,
}

impl BioSegment {
    /// Allocates a new zero-filled `BioSegment` of `nbytes` bytes.
    pub fn alloc(nbytes: usize) -> Self {
        Self {
            buf: Arc::new(SpinLock::new(vec![0u8; nbytes].into_boxed_slice())),
            offset: 0,
            len: nbytes,
        }
    }

    /// Constructs a new `BioSegment` with a copy of the given bytes.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            buf: Arc::new(SpinLock::new(bytes.to_vec().into_boxed_slice())),
            offset: 0,
            len: bytes.len(),
        }
    }

    /// Returns the number of bytes.
    pub fn nbytes(&self) -> usize {
        self.len
    }

    /// Returns a segment viewing the `range` (in bytes) of this segment.
    ///
    /// The backing buffer is shared with `self`.
    ///
    /// # Panics
    ///
    /// If the `range` is out of bounds, this method will panic.
    pub fn slice(&self, range: Range<usize>) -> Self {
        assert!(range.end <= self.len && range.start <= range.end);
        Self {
            buf: self.buf.clone(),
            offset: self.offset + range.start,
            len: range.end - range.start,
        }
    }

    /// Reads bytes at `offset` within this segment into `buf`.
    ///
    /// # Panics
    ///
    /// If `offset + buf.len()` exceeds the segment length, this method will
    /// panic.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len);
        let inner = self.buf.lock();
        let start = self.offset + offset;
        buf.copy_from_slice(&inner[start..start + buf.len()]);
    }

    /// Writes `buf` at `offset` within this segment.
    ///
    /// # Panics
    ///
    /// If `offset + buf.len()` exceeds the segment length, this method will
    /// panic.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= self.len);
        let mut inner = self.buf.lock();
        let start = self.offset + offset;
        inner[start..start + buf.len()].copy_from_slice(buf);
    }

    /// Copies the whole segment into a new `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_bytes(0, &mut out);
        out
    }
}

/// Carves the byte range `offset..offset + len` out of a segment list.
///
/// The returned segments share their backing buffers with the input ones.
///
/// # Panics
///
/// If the range exceeds the total length of `segments`, this function will
/// panic.
pub fn slice_segments(segments: &[BioSegment], offset: usize, len: usize) -> Vec<BioSegment> {
    let mut out = Vec::new();
    let mut skip = offset;
    let mut remain = len;

    for seg in segments {
        if remain == 0 {
            break;
        }
        if skip >= seg.nbytes() {
            skip -= seg.nbytes();
            continue;
        }
        let take = remain.min(seg.nbytes() - skip);
        out.push(seg.slice(skip..skip + take));
        skip = 0;
        remain -= take;
    }

    assert!(remain == 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_slicing_shares_backing_buffer() {
        let seg = BioSegment::alloc(4096);
        let sub = seg.slice(1024..2048);
        sub.write_bytes(0, &[7u8; 16]);

        let mut probe = [0u8; 16];
        seg.read_bytes(1024, &mut probe);
        assert_eq!(probe, [7u8; 16]);
    }

    #[test]
    fn slice_segments_spans_boundaries() {
        let a = BioSegment::alloc(1000);
        let b = BioSegment::alloc(1000);
        let parts = slice_segments(&[a.clone(), b.clone()], 900, 200);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].nbytes(), 100);
        assert_eq!(parts[1].nbytes(), 100);

        parts[1].write_bytes(0, &[3u8; 100]);
        let mut probe = [0u8; 100];
        b.read_bytes(0, &mut probe);
        assert_eq!(probe, [3u8; 100]);
    }

    #[test]
    fn a_fresh_bio_has_no_status() {
        let bio = Bio::new(BioType::Flush, 0..0, Vec::new(), None);
        assert_eq!(bio.status(), None);
    }
}
