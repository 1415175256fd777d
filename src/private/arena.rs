// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License (see Cargo.toml).

//! The arena owns a message's segments and hands out bounds-checked access
//! to them. A [ReaderArena] borrows immutable segments (from a
//! [crate::message::ReaderSegments] implementor); a [BuilderArena] owns
//! growable segments obtained from a [crate::message::Allocator] and tracks
//! a per-segment bump-allocation cursor.

use alloc::vec::Vec;
use core::cell::Cell;

use crate::message::{Allocator, ReaderOptions, ReaderSegments};
use crate::private::units::BYTES_PER_WORD;
use crate::{Error, OutputSegments, Result};

/// Tracks how many words remain before a reader's traversal budget
/// (`ReaderOptions::traversal_limit_in_words`) is exhausted. See the
/// documentation on `ReaderOptions` for the rationale: without this, a
/// message with overlapping pointers could force a victim to do
/// arbitrarily more work than the wire size of the message would suggest.
pub struct ReadLimiter {
    #[cfg(feature = "sync_reader")]
    limit: core::sync::atomic::AtomicU64,
    #[cfg(not(feature = "sync_reader"))]
    limit: Cell<u64>,
}

impl ReadLimiter {
    pub fn new(limit_words: u64) -> Self {
        Self {
            #[cfg(feature = "sync_reader")]
            limit: core::sync::atomic::AtomicU64::new(limit_words),
            #[cfg(not(feature = "sync_reader"))]
            limit: Cell::new(limit_words),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// Attempts to charge `amount` words against the budget. Fails if doing
    /// so would exceed the original limit.
    pub fn can_read(&self, amount: u64) -> Result<()> {
        #[cfg(feature = "sync_reader")]
        {
            use core::sync::atomic::Ordering;
            let mut current = self.limit.load(Ordering::Relaxed);
            loop {
                if amount > current {
                    return Err(Error::failed(
                        "read limit exceeded while traversing message -- did you mean to \
                         increase ReaderOptions::traversal_limit_in_words?",
                    ));
                }
                match self.limit.compare_exchange_weak(
                    current,
                    current - amount,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Ok(()),
                    Err(actual) => current = actual,
                }
            }
        }
        #[cfg(not(feature = "sync_reader"))]
        {
            let current = self.limit.get();
            if amount > current {
                return Err(Error::failed(
                    "read limit exceeded while traversing message -- did you mean to \
                     increase ReaderOptions::traversal_limit_in_words?",
                ));
            }
            self.limit.set(current - amount);
            Ok(())
        }
    }
}

/// Read-only access to a message's segments, with bounds checking and
/// traversal-limit accounting.
pub trait ReaderArena {
    /// Returns the start pointer and word length of segment `id`.
    fn get_segment(&self, id: u32) -> Result<(*const u8, u32)>;

    /// Computes `start + offset_in_words` words, checking that the result
    /// still lies within segment `segment_id`. Does not charge the read
    /// limiter (use [ReaderArena::contains_interval] for that).
    fn check_offset(&self, segment_id: u32, start: *const u8, offset_in_words: i32)
    -> Result<*const u8>;

    /// Checks that `[start, end)` lies entirely within segment `segment_id`,
    /// and charges the traversal budget for the bytes in that interval.
    fn contains_interval(&self, segment_id: u32, start: *const u8, end: *const u8) -> Result<()>;

    fn nesting_limit(&self) -> i32;
}

/// Mutable access to a message's segments, built on top of [ReaderArena] so
/// that a builder can always be viewed as a reader mid-construction (e.g.
/// `message::Builder::get_root_as_reader`).
pub trait BuilderArena: ReaderArena {
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<()>;

    /// Attempts to bump-allocate `amount` words within `segment_id` only,
    /// without falling back to any other segment.
    fn allocate(&mut self, segment_id: u32, amount: u32) -> Option<(u32, *mut u8)>;

    /// Bump-allocates `amount` words, appending a fresh segment if needed.
    fn allocate_anywhere(&mut self, amount: u32) -> (u32, *mut u8);

    fn get_segment_mut(&mut self, id: u32) -> (*mut u8, u32);

    fn get_segments_for_output(&self) -> OutputSegments<'_>;

    fn is_empty(&self) -> bool;

    fn as_reader(&self) -> &dyn ReaderArena;
}

impl<A> BuilderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn allocate_segment(&mut self, minimum_size: u32) -> Result<()> {
        BuilderArenaImpl::allocate_segment(self, minimum_size)
    }

    fn allocate(&mut self, segment_id: u32, amount: u32) -> Option<(u32, *mut u8)> {
        BuilderArenaImpl::allocate(self, segment_id, amount)
    }

    fn allocate_anywhere(&mut self, amount: u32) -> (u32, *mut u8) {
        BuilderArenaImpl::allocate_anywhere(self, amount)
    }

    fn get_segment_mut(&mut self, id: u32) -> (*mut u8, u32) {
        BuilderArenaImpl::get_segment_mut(self, id)
    }

    fn get_segments_for_output(&self) -> OutputSegments<'_> {
        BuilderArenaImpl::get_segments_for_output(self)
    }

    fn is_empty(&self) -> bool {
        BuilderArenaImpl::is_empty(self)
    }

    fn as_reader(&self) -> &dyn ReaderArena {
        self
    }
}

pub(crate) fn check_offset_raw(
    segment_start: *const u8,
    segment_len_words: u32,
    start: *const u8,
    offset_in_words: i32,
) -> Result<*const u8> {
    let start_offset_bytes = start as isize - segment_start as isize;
    if start_offset_bytes < 0 {
        return Err(Error::failed("bad pointer: before start of segment".into()));
    }
    let new_offset_bytes =
        start_offset_bytes as i64 + i64::from(offset_in_words) * BYTES_PER_WORD as i64;
    if new_offset_bytes < 0 || new_offset_bytes as u64 > u64::from(segment_len_words) * BYTES_PER_WORD as u64
    {
        return Err(Error::failed("message contained out-of-bounds pointer".into()));
    }
    Ok(unsafe { segment_start.offset(new_offset_bytes as isize) })
}

pub(crate) fn contains_interval_raw(
    segment_start: *const u8,
    segment_len_words: u32,
    start: *const u8,
    end: *const u8,
    read_limiter: &ReadLimiter,
) -> Result<()> {
    let segment_end = unsafe { segment_start.add(segment_len_words as usize * BYTES_PER_WORD) };
    if start < segment_start || start > end || end > segment_end {
        return Err(Error::failed("message contained out-of-bounds pointer".into()));
    }
    let words = (end as usize - start as usize) / BYTES_PER_WORD;
    read_limiter.can_read(words as u64)
}

/// [ReaderArena] over a user-supplied [ReaderSegments].
pub struct ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    segments: S,
    read_limiter: ReadLimiter,
    nesting_limit: i32,
}

impl<S> ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    pub fn new(segments: S, options: ReaderOptions) -> Self {
        let limit_words = options
            .traversal_limit_in_words
            .map(|w| w as u64)
            .unwrap_or(u64::MAX);
        Self {
            segments,
            read_limiter: ReadLimiter::new(limit_words),
            nesting_limit: options.nesting_limit,
        }
    }

    pub fn into_segments(self) -> S {
        self.segments
    }
}

impl<S> ReaderArena for ReaderArenaImpl<S>
where
    S: ReaderSegments,
{
    fn get_segment(&self, id: u32) -> Result<(*const u8, u32)> {
        match self.segments.get_segment(id) {
            Some(s) => {
                #[cfg(not(feature = "unaligned"))]
                if s.as_ptr() as usize % BYTES_PER_WORD != 0 {
                    return Err(Error::failed(
                        "segment is not 8-byte aligned -- enable the \"unaligned\" feature \
                         if this is expected"
                            .into(),
                    ));
                }
                Ok((s.as_ptr(), (s.len() / BYTES_PER_WORD) as u32))
            }
            None => Err(Error::failed(alloc::format!("invalid segment id {id}"))),
        }
    }

    fn check_offset(
        &self,
        segment_id: u32,
        start: *const u8,
        offset_in_words: i32,
    ) -> Result<*const u8> {
        let (segment_start, segment_len) = self.get_segment(segment_id)?;
        check_offset_raw(segment_start, segment_len, start, offset_in_words)
    }

    fn contains_interval(&self, segment_id: u32, start: *const u8, end: *const u8) -> Result<()> {
        let (segment_start, segment_len) = self.get_segment(segment_id)?;
        contains_interval_raw(segment_start, segment_len, start, end, &self.read_limiter)
    }

    fn nesting_limit(&self) -> i32 {
        self.nesting_limit
    }
}

/// A single growable segment owned by a [BuilderArenaImpl]. Backed by raw
/// memory obtained from an [Allocator]; freed via
/// `Allocator::deallocate_segment` when the owning arena is dropped.
struct SegmentBuilder {
    ptr: *mut u8,
    cap_words: u32,
    pos_words: u32,
}

/// [ReaderArena] + allocation over segments owned by an [Allocator].
pub struct BuilderArenaImpl<A>
where
    A: Allocator,
{
    allocator: A,
    segments: Vec<SegmentBuilder>,
}

impl<A> BuilderArenaImpl<A>
where
    A: Allocator,
{
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            segments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn allocate_segment(&mut self, minimum_size: u32) -> Result<()> {
        let (ptr, cap_words) = self.allocator.allocate_segment(minimum_size);
        self.segments.push(SegmentBuilder {
            ptr,
            cap_words,
            pos_words: 0,
        });
        Ok(())
    }

    /// Attempts to bump-allocate `amount` words within `segment_id` only.
    /// Returns `None` if there isn't room, without touching any other
    /// segment -- this is how callers decide between a normal pointer and
    /// a far pointer.
    pub fn allocate(&mut self, segment_id: u32, amount: u32) -> Option<(u32, *mut u8)> {
        let seg = self.segments.get_mut(segment_id as usize)?;
        if seg.cap_words.checked_sub(seg.pos_words)? < amount {
            return None;
        }
        let ptr = unsafe { seg.ptr.add(seg.pos_words as usize * BYTES_PER_WORD) };
        seg.pos_words += amount;
        Some((segment_id, ptr))
    }

    /// Bump-allocates `amount` words, appending a fresh segment if the most
    /// recently allocated one has no room.
    pub fn allocate_anywhere(&mut self, amount: u32) -> (u32, *mut u8) {
        if !self.segments.is_empty() {
            let last = (self.segments.len() - 1) as u32;
            if let Some(result) = self.allocate(last, amount) {
                return result;
            }
        }
        let minimum = core::cmp::max(amount, crate::message::SUGGESTED_FIRST_SEGMENT_WORDS);
        self.allocate_segment(minimum).expect("allocate segment");
        let new_id = (self.segments.len() - 1) as u32;
        self.allocate(new_id, amount)
            .expect("freshly allocated segment has room")
    }

    pub fn get_segment_mut(&mut self, id: u32) -> (*mut u8, u32) {
        let seg = &mut self.segments[id as usize];
        (seg.ptr, seg.cap_words)
    }

    pub fn get_segments_for_output(&self) -> OutputSegments<'_> {
        self.segments
            .iter()
            .map(|s| unsafe {
                core::slice::from_raw_parts(s.ptr as *const u8, s.pos_words as usize * BYTES_PER_WORD)
            })
            .collect()
    }

    pub fn as_reader(&self) -> &dyn ReaderArena {
        self
    }

    /// Returns the allocator, after deallocating all segments currently
    /// owned by this arena.
    pub fn into_allocator(mut self) -> A {
        for seg in self.segments.drain(..) {
            self.allocator
                .deallocate_segment(seg.ptr, seg.cap_words, seg.pos_words);
        }
        // SAFETY: `self.segments` is empty (drained above), so the Drop
        // impl below has nothing left to free; `self` is never used again.
        let allocator = unsafe { core::ptr::read(&self.allocator) };
        core::mem::forget(self);
        allocator
    }
}

impl<A> Drop for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        for seg in &self.segments {
            self.allocator
                .deallocate_segment(seg.ptr, seg.cap_words, seg.pos_words);
        }
    }
}

impl<A> ReaderArena for BuilderArenaImpl<A>
where
    A: Allocator,
{
    fn get_segment(&self, id: u32) -> Result<(*const u8, u32)> {
        match self.segments.get(id as usize) {
            Some(s) => Ok((s.ptr as *const u8, s.cap_words)),
            None => Err(Error::failed(alloc::format!("invalid segment id {id}"))),
        }
    }

    fn check_offset(
        &self,
        segment_id: u32,
        start: *const u8,
        offset_in_words: i32,
    ) -> Result<*const u8> {
        let (segment_start, segment_len) = self.get_segment(segment_id)?;
        check_offset_raw(segment_start, segment_len, start, offset_in_words)
    }

    fn contains_interval(&self, segment_id: u32, start: *const u8, end: *const u8) -> Result<()> {
        let (segment_start, segment_len) = self.get_segment(segment_id)?;
        // Builders never retain a reader across a traversal budget; a
        // freshly-built message is trusted local data, not a wire message
        // from an untrusted peer.
        contains_interval_raw(segment_start, segment_len, start, end, &ReadLimiter::unlimited())
    }

    fn nesting_limit(&self) -> i32 {
        i32::MAX
    }
}
