//! Strided bulk transfers between main memory and the scratchpad.
//!
//! Issuing a transfer only enqueues it and returns a [`TransferId`]. Buffer
//! contents change when the issuing core waits: a barrier reached before
//! `wait_all()` returns observes stale data, which is why every kernel pairs
//! each batch of transfers with a `wait_all()` before its next checkpoint.

use std::collections::VecDeque;
use std::fmt;

use crate::error::TileError;
use crate::precision::Element;
use crate::scratchpad::{BufferId, Scratchpad};
use crate::tensor::DramTensor;
use crate::tiling::TileDesc;
use crate::Result;

/// Handle of an issued transfer. Ids increase monotonically per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(pub u32);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txid {}", self.0)
    }
}

/// Counters of issued transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub transfers: u64,
    /// Bytes moved from main memory into the scratchpad.
    pub bytes_in: u64,
    /// Bytes moved from the scratchpad out to main memory.
    pub bytes_out: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: &TransferStats) {
        self.transfers += other.transfers;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }
}

/// Shape of a 2D strided copy, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strided2d {
    /// Contiguous run length.
    pub width: usize,
    pub dst_stride: usize,
    pub src_stride: usize,
    pub repetitions: usize,
}

impl Strided2d {
    /// Elements spanned on a side with the given stride.
    fn span(&self, stride: usize) -> usize {
        if self.repetitions == 0 {
            0
        } else {
            (self.repetitions - 1) * stride + self.width
        }
    }
}

struct Pending<'a> {
    id: TransferId,
    run: Box<dyn FnOnce() + 'a>,
}

/// Per-core transfer queue. Only the mover owns one.
pub struct TransferEngine<'a> {
    scratchpad: &'a Scratchpad,
    pending: VecDeque<Pending<'a>>,
    next_id: u32,
    stats: TransferStats,
}

impl<'a> TransferEngine<'a> {
    pub fn new(scratchpad: &'a Scratchpad) -> Self {
        Self {
            scratchpad,
            pending: VecDeque::new(),
            next_id: 0,
            stats: TransferStats::default(),
        }
    }

    /// Enqueue a load of `tile` from `src` into the buffer `dst`.
    ///
    /// The tile lands densely packed: run `i` starts at `i * tile.width`.
    pub fn load<T: Element>(
        &mut self,
        dst: BufferId<T>,
        src: &'a DramTensor<T>,
        tile: &TileDesc,
    ) -> Result<TransferId> {
        let shape = Strided2d {
            width: tile.width,
            dst_stride: tile.width,
            src_stride: tile.pitch,
            repetitions: tile.repetitions,
        };
        self.issue_load(dst, 0, src, tile.offset, shape)
    }

    /// Enqueue a store of the densely packed buffer `src` into `tile` of `dst`.
    pub fn store<T: Element>(
        &mut self,
        dst: &'a DramTensor<T>,
        src: BufferId<T>,
        tile: &TileDesc,
    ) -> Result<TransferId> {
        let shape = Strided2d {
            width: tile.width,
            dst_stride: tile.pitch,
            src_stride: tile.width,
            repetitions: tile.repetitions,
        };
        self.issue_store(dst, tile.offset, src, 0, shape)
    }

    /// Enqueue a main-memory to scratchpad copy with explicit strides.
    pub fn issue_load<T: Element>(
        &mut self,
        dst: BufferId<T>,
        dst_offset: usize,
        src: &'a DramTensor<T>,
        src_offset: usize,
        shape: Strided2d,
    ) -> Result<TransferId> {
        check_span("load destination", dst_offset, shape.span(shape.dst_stride), dst.len())?;
        check_span("load source", src_offset, shape.span(shape.src_stride), src.numel())?;

        let scratchpad = self.scratchpad;
        let bytes = (shape.width * shape.repetitions * T::PRECISION.size_bytes()) as u64;
        self.stats.bytes_in += bytes;
        Ok(self.enqueue(Box::new(move || {
            let src = src.read();
            let mut dst = scratchpad.write(dst);
            copy_2d(&mut dst, dst_offset, &src, src_offset, shape);
        })))
    }

    /// Enqueue a scratchpad to main-memory copy with explicit strides.
    pub fn issue_store<T: Element>(
        &mut self,
        dst: &'a DramTensor<T>,
        dst_offset: usize,
        src: BufferId<T>,
        src_offset: usize,
        shape: Strided2d,
    ) -> Result<TransferId> {
        check_span("store destination", dst_offset, shape.span(shape.dst_stride), dst.numel())?;
        check_span("store source", src_offset, shape.span(shape.src_stride), src.len())?;

        let scratchpad = self.scratchpad;
        let bytes = (shape.width * shape.repetitions * T::PRECISION.size_bytes()) as u64;
        self.stats.bytes_out += bytes;
        Ok(self.enqueue(Box::new(move || {
            let src = scratchpad.read(src);
            let mut dst = dst.write();
            copy_2d(&mut dst, dst_offset, &src, src_offset, shape);
        })))
    }

    /// Block until transfer `id` and everything issued before it completed.
    pub fn wait(&mut self, id: TransferId) {
        while self.pending.front().is_some_and(|p| p.id <= id) {
            self.complete_next();
        }
    }

    /// Block until every outstanding transfer completed.
    pub fn wait_all(&mut self) {
        while !self.pending.is_empty() {
            self.complete_next();
        }
    }

    /// Number of issued but not yet completed transfers.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    fn enqueue(&mut self, run: Box<dyn FnOnce() + 'a>) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.stats.transfers += 1;
        self.pending.push_back(Pending { id, run });
        id
    }

    fn complete_next(&mut self) {
        if let Some(p) = self.pending.pop_front() {
            (p.run)();
            tracing::trace!("{} complete", p.id);
        }
    }
}

impl Drop for TransferEngine<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                "{} transfers were issued but never waited on; their data never arrived",
                self.pending.len()
            );
        }
    }
}

fn check_span(what: &str, offset: usize, span: usize, len: usize) -> Result<()> {
    match offset.checked_add(span) {
        Some(end) if end <= len => Ok(()),
        _ => Err(TileError::OutOfBounds(format!(
            "{what}: elements {offset}..{} exceed length {len}",
            offset.saturating_add(span)
        ))),
    }
}

/// Copy `shape.repetitions` runs of `shape.width` elements.
pub fn copy_2d<T: Copy>(dst: &mut [T], dst_offset: usize, src: &[T], src_offset: usize, shape: Strided2d) {
    for rep in 0..shape.repetitions {
        let d = dst_offset + rep * shape.dst_stride;
        let s = src_offset + rep * shape.src_stride;
        dst[d..d + shape.width].copy_from_slice(&src[s..s + shape.width]);
    }
}
