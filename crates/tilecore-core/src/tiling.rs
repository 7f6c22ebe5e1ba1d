//! Tile planning.
//!
//! Derives tile counts, per-tile transfer shapes and per-buffer sizes from
//! problem dimensions. Every divisibility assumption the kernels rely on is
//! checked here, before any core starts.

use std::ops::Range;

use crate::error::{checked_product, ensure_multiple, ensure_nonzero};
use crate::precision::Precision;
use crate::Result;

/// One tile of a main-memory tensor, described as a 2D strided region.
///
/// The region is `repetitions` runs of `width` contiguous elements, the
/// first starting at `offset` and each following one `pitch` elements later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDesc {
    pub offset: usize,
    pub width: usize,
    pub repetitions: usize,
    pub pitch: usize,
    pub elem_bytes: usize,
}

impl TileDesc {
    /// Number of elements in the tile.
    pub fn numel(&self) -> usize {
        self.width * self.repetitions
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.elem_bytes
    }

    /// One past the last main-memory element touched.
    pub fn end(&self) -> usize {
        if self.repetitions == 0 {
            return self.offset;
        }
        self.offset + (self.repetitions - 1) * self.pitch + self.width
    }
}

/// Tiling of an `N x d` attention problem into `B_r x d` query tiles and
/// `B_c x d` key/value tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionTiling {
    pub n: usize,
    pub d: usize,
    pub b_r: usize,
    pub b_c: usize,
    /// Number of row (query) tiles.
    pub t_r: usize,
    /// Number of column (key/value) tiles.
    pub t_c: usize,
    pub row_tiles_per_cluster: usize,
    pub precision: Precision,
}

impl AttentionTiling {
    pub fn plan(
        n: usize,
        d: usize,
        b_r: usize,
        b_c: usize,
        n_clusters: usize,
        precision: Precision,
    ) -> Result<Self> {
        ensure_nonzero("sequence length N", n)?;
        ensure_nonzero("head dimension d", d)?;
        ensure_nonzero("row block B_r", b_r)?;
        ensure_nonzero("column block B_c", b_c)?;
        ensure_nonzero("cluster count", n_clusters)?;
        ensure_multiple("sequence length N", n, b_r)?;
        ensure_multiple("sequence length N", n, b_c)?;
        let t_r = n / b_r;
        let t_c = n / b_c;
        ensure_multiple("row tile count T_r", t_r, n_clusters)?;
        // Bounds every tile offset and buffer size derived below
        let elem_bytes = precision.size_bytes();
        checked_product("attention tensor bytes N x d", &[n, d, elem_bytes])?;
        checked_product("score tile bytes B_r x B_c", &[b_r, b_c, elem_bytes])?;
        Ok(Self {
            n,
            d,
            b_r,
            b_c,
            t_r,
            t_c,
            row_tiles_per_cluster: t_r / n_clusters,
            precision,
        })
    }

    /// Row tiles owned by `cluster`, as a contiguous range.
    pub fn row_tiles_for(&self, cluster: usize) -> Range<usize> {
        let start = cluster * self.row_tiles_per_cluster;
        start..start + self.row_tiles_per_cluster
    }

    /// Query (and output) tile `t_r`.
    pub fn row_tile(&self, t_r: usize) -> TileDesc {
        TileDesc {
            offset: t_r * self.b_r * self.d,
            width: self.d,
            repetitions: self.b_r,
            pitch: self.d,
            elem_bytes: self.precision.size_bytes(),
        }
    }

    /// Key/value tile `t_c`.
    pub fn column_tile(&self, t_c: usize) -> TileDesc {
        TileDesc {
            offset: t_c * self.b_c * self.d,
            width: self.d,
            repetitions: self.b_c,
            pitch: self.d,
            elem_bytes: self.precision.size_bytes(),
        }
    }

    /// Elements in a query or output tile.
    pub fn row_tile_len(&self) -> usize {
        self.b_r * self.d
    }

    /// Elements in a key or value tile.
    pub fn column_tile_len(&self) -> usize {
        self.b_c * self.d
    }

    /// Elements in a score or probability tile.
    pub fn score_tile_len(&self) -> usize {
        self.b_r * self.b_c
    }
}

/// Tiling of a `batch x seq_len x embeddings` feature map along the sequence
/// axis, with tiles distributed over clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerNormTiling {
    pub batch_size: usize,
    pub seq_len: usize,
    pub embeddings: usize,
    pub n_tiles: usize,
    pub n_tiles_per_cluster: usize,
    /// Sequence rows per tile (per batch).
    pub tile_seq_len: usize,
    pub precision: Precision,
}

impl LayerNormTiling {
    pub fn plan(
        batch_size: usize,
        seq_len: usize,
        embeddings: usize,
        n_tiles: usize,
        n_clusters: usize,
        precision: Precision,
    ) -> Result<Self> {
        ensure_nonzero("batch size", batch_size)?;
        ensure_nonzero("sequence length", seq_len)?;
        ensure_nonzero("embedding width", embeddings)?;
        ensure_nonzero("tile count", n_tiles)?;
        ensure_nonzero("cluster count", n_clusters)?;
        ensure_multiple("sequence length", seq_len, n_tiles)?;
        ensure_multiple("tile count", n_tiles, n_clusters)?;
        // Bounds every tile offset, pitch and buffer size derived below
        checked_product(
            "feature map bytes",
            &[batch_size, seq_len, embeddings, precision.size_bytes()],
        )?;
        Ok(Self {
            batch_size,
            seq_len,
            embeddings,
            n_tiles,
            n_tiles_per_cluster: n_tiles / n_clusters,
            tile_seq_len: seq_len / n_tiles,
            precision,
        })
    }

    /// Tiles owned by `cluster`, as a contiguous range.
    pub fn tiles_for(&self, cluster: usize) -> Range<usize> {
        let start = cluster * self.n_tiles_per_cluster;
        start..start + self.n_tiles_per_cluster
    }

    /// Tile `tile_idx` of the feature map: one run per batch entry.
    pub fn tile(&self, tile_idx: usize) -> TileDesc {
        TileDesc {
            offset: tile_idx * self.tile_seq_len * self.embeddings,
            width: self.tile_seq_len * self.embeddings,
            repetitions: self.batch_size,
            pitch: self.seq_len * self.embeddings,
            elem_bytes: self.precision.size_bytes(),
        }
    }

    /// Elements in one on-chip tile (all batch entries).
    pub fn tile_len(&self) -> usize {
        self.batch_size * self.tile_seq_len * self.embeddings
    }
}
