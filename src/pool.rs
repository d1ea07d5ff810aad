//! Decoder cursor pooling for random access to forward-only archives.
//!
//! Getting to entry N of a tarball (or anything else read front to back)
//! means reading past entries 0 through N-1. Rather than start over for every
//! request, we keep up to `capacity` cursors around, each parked wherever its
//! last request left it.
//!
//! # How It Works
//!
//! When a caller asks for entry N:
//! 1. Take the idle cursor furthest along that hasn't passed N yet.
//! 2. If there isn't one, open a new cursor at the start of the archive.
//!    It goes in an empty slot, or replaces the idle cursor furthest along,
//!    which is the one least likely to be useful again.
//! 3. Skip forward to N outside the pool lock, so different entries
//!    decode in parallel.
//!
//! Cursors never rewind. Every cursor only ever moves forward, which bounds
//! the total re-reading to `capacity` passes over the archive.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::*;

use crate::decoder::{open_decoder, DataBlock, DecoderOptions, EntryHeader, SequentialDecoder};
use crate::index::EntryFilter;
use crate::mapping::Mapping;
use crate::result::*;

/// What to do when every slot holds a checked-out cursor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Hand out a cursor that isn't pooled, and drop it on release.
    #[default]
    Overflow,
    /// Fail with [`ArchiveError::PoolExhausted`].
    Fail,
}

/// One forward-only cursor and where it is in the archive.
pub struct DecoderContext {
    decoder: Box<dyn SequentialDecoder>,
    /// The stream index this cursor reads next.
    /// Stream indices `[0, next_index)` are behind it.
    next_index: usize,
    /// The header of the entry the cursor is positioned on
    current: Option<EntryHeader>,
}

impl DecoderContext {
    fn new(decoder: Box<dyn SequentialDecoder>) -> Self {
        Self {
            decoder,
            next_index: 0,
            current: None,
        }
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// The header of the entry the cursor is positioned on
    pub fn current(&self) -> Option<&EntryHeader> {
        self.current.as_ref()
    }

    /// Advances to the playable entry with the given stream index,
    /// returning the number of headers read along the way.
    fn skip_to(&mut self, target: usize, filter: &EntryFilter) -> ArchiveResult<usize> {
        debug_assert!(self.next_index <= target);
        self.current = None;
        let mut headers = 0;
        loop {
            let header = self
                .decoder
                .next_header()?
                .ok_or(ArchiveError::InvalidArchive(
                    "Archive ended before the requested entry",
                ))?;
            headers += 1;
            if !filter.is_playable(header) {
                continue;
            }
            let index = self.next_index;
            self.next_index += 1;
            if index == target {
                self.current = Some(header.clone());
                return Ok(headers);
            }
        }
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> ArchiveResult<usize> {
        self.decoder.read_data(buf)
    }

    pub fn read_data_block(&mut self) -> ArchiveResult<Option<DataBlock<'_>>> {
        self.decoder.read_data_block()
    }

    /// Reads the current entry until `buf` is full or the entry ends,
    /// returning the number of bytes read.
    pub fn read_fill(&mut self, buf: &mut [u8]) -> ArchiveResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.decoder.read_data(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }
}

enum Slot {
    Empty,
    Idle(DecoderContext),
    /// Checked out
    Busy,
}

impl Slot {
    fn idle_position(&self) -> Option<usize> {
        match self {
            Slot::Idle(context) => Some(context.next_index),
            Slot::Empty | Slot::Busy => None,
        }
    }

    /// Checks out the context in this slot, if it's idle.
    fn take_idle(&mut self) -> Option<DecoderContext> {
        match std::mem::replace(self, Slot::Busy) {
            Slot::Idle(context) => Some(context),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Statistics for pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of requests served by an idle cursor
    pub hits: u64,
    /// Number of requests that opened a new cursor
    pub misses: u64,
    /// Number of idle cursors dropped to make room
    pub evictions: u64,
    /// Number of cursors handed out with no slot to return to
    pub overflows: u64,
    /// Total headers read while skipping to requested entries
    pub headers_skipped: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    overflows: AtomicU64,
    headers_skipped: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Where a request's cursor comes from
enum Claim {
    Reuse {
        slot: usize,
        context: DecoderContext,
    },
    Fresh {
        /// None if the cursor won't be pooled
        slot: Option<usize>,
        evicted: Option<DecoderContext>,
    },
}

/// A fixed-capacity pool of cursors into one archive.
pub struct DecoderPool {
    source: Arc<Mapping>,
    options: DecoderOptions,
    filter: EntryFilter,
    policy: ExhaustionPolicy,
    slots: Mutex<Vec<Slot>>,
    counters: Counters,
}

impl DecoderPool {
    pub fn new(
        source: Arc<Mapping>,
        options: DecoderOptions,
        filter: EntryFilter,
        capacity: usize,
        policy: ExhaustionPolicy,
    ) -> Self {
        Self {
            source,
            options,
            filter,
            policy,
            slots: Mutex::new((0..capacity).map(|_| Slot::Empty).collect()),
            counters: Counters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// The options new cursors are opened with
    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    /// Which entries cursors count as playable
    pub fn filter(&self) -> &EntryFilter {
        &self.filter
    }

    /// Sets the passphrase new cursors are opened with.
    ///
    /// Idle cursors opened with the old one are dropped.
    pub fn set_passphrase(&mut self, passphrase: Option<String>) {
        self.options.passphrase = passphrase;
        let slots = self.slots.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.iter_mut() {
            if let Slot::Idle(_) = slot {
                *slot = Slot::Empty;
            }
        }
    }

    /// Where each idle cursor is, in ascending order
    pub fn idle_positions(&self) -> Vec<usize> {
        let mut positions: Vec<_> = self.lock().iter().filter_map(Slot::idle_position).collect();
        positions.sort_unstable();
        positions
    }

    pub fn stats(&self) -> PoolStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PoolStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            evictions: load(&self.counters.evictions),
            overflows: load(&self.counters.overflows),
            headers_skipped: load(&self.counters.headers_skipped),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a cursor positioned on the playable entry
    /// with stream index `target`.
    ///
    /// If the cursor can't get there, it's dropped and
    /// [`ArchiveError::SkipFailed`] is returned.
    pub fn acquire_for(&self, target: usize) -> ArchiveResult<CheckedOutContext<'_>> {
        let (slot, context) = match self.claim(target)? {
            Claim::Reuse { slot, context } => {
                trace!(
                    "Reusing cursor at {} for stream index {target}",
                    context.next_index
                );
                (Some(slot), context)
            }
            Claim::Fresh { slot, evicted } => {
                if let Some(evicted) = evicted {
                    debug!("Evicted cursor at {}", evicted.next_index);
                }
                match open_decoder(self.source.clone(), &self.options) {
                    Ok(decoder) => (slot, DecoderContext::new(decoder)),
                    Err(e) => {
                        error!("Couldn't open a decoder: {e}");
                        if let Some(slot) = slot {
                            self.check_in(slot, None);
                        }
                        return Err(e);
                    }
                }
            }
        };

        let mut checked_out = CheckedOutContext {
            pool: self,
            slot,
            context: Some(context),
        };
        match checked_out.skip_to(target, &self.filter) {
            Ok(headers) => {
                bump(&self.counters.headers_skipped, headers as u64);
                Ok(checked_out)
            }
            Err(e) => {
                warn!("Couldn't skip to stream index {target}: {e}");
                checked_out.discard();
                Err(ArchiveError::SkipFailed {
                    index: target,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Under the lock, picks an idle cursor or a slot for a new one.
    fn claim(&self, target: usize) -> ArchiveResult<Claim> {
        let mut slots = self.lock();

        // Closest from behind
        let behind = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.idle_position().map(|n| (i, n)))
            .filter(|&(_, n)| n <= target)
            .max_by_key(|&(_, n)| n)
            .map(|(i, _)| i);
        if let Some(slot) = behind {
            if let Some(context) = slots[slot].take_idle() {
                bump(&self.counters.hits, 1);
                return Ok(Claim::Reuse { slot, context });
            }
        }
        bump(&self.counters.misses, 1);

        if let Some(slot) = slots.iter().position(|s| matches!(s, Slot::Empty)) {
            slots[slot] = Slot::Busy;
            return Ok(Claim::Fresh {
                slot: Some(slot),
                evicted: None,
            });
        }

        // Furthest along
        let victim = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.idle_position().map(|n| (i, n)))
            .max_by_key(|&(_, n)| n)
            .map(|(i, _)| i);
        if let Some(slot) = victim {
            bump(&self.counters.evictions, 1);
            return Ok(Claim::Fresh {
                slot: Some(slot),
                evicted: slots[slot].take_idle(),
            });
        }

        match self.policy {
            ExhaustionPolicy::Overflow => {
                debug!("All {} cursors are busy; opening an unpooled one", slots.len());
                bump(&self.counters.overflows, 1);
                Ok(Claim::Fresh {
                    slot: None,
                    evicted: None,
                })
            }
            ExhaustionPolicy::Fail => Err(ArchiveError::PoolExhausted),
        }
    }

    /// Returns a checked-out slot to the pool, empty if `context` is None.
    fn check_in(&self, slot: usize, context: Option<DecoderContext>) {
        let mut slots = self.lock();
        slots[slot] = match context {
            Some(context) => Slot::Idle(context),
            None => Slot::Empty,
        };
    }
}

/// Exclusive access to a pooled [`DecoderContext`].
///
/// Dropping it puts the context back in the pool.
pub struct CheckedOutContext<'p> {
    pool: &'p DecoderPool,
    slot: Option<usize>,
    context: Option<DecoderContext>,
}

impl CheckedOutContext<'_> {
    /// False for overflow cursors, which are dropped on release.
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    /// Drops the context instead of returning it to the pool,
    /// for cursors left in an unknown state by an error.
    pub fn discard(mut self) {
        self.context = None;
    }
}

impl Deref for CheckedOutContext<'_> {
    type Target = DecoderContext;

    fn deref(&self) -> &DecoderContext {
        self.context.as_ref().expect("context is only taken on drop")
    }
}

impl DerefMut for CheckedOutContext<'_> {
    fn deref_mut(&mut self) -> &mut DecoderContext {
        self.context.as_mut().expect("context is only taken on drop")
    }
}

impl Drop for CheckedOutContext<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            self.pool.check_in(slot, self.context.take());
        }
    }
}
