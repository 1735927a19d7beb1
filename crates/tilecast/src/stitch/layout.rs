use std::collections::BTreeMap;

use crate::{
    adaptation::{Srd, TrackId, TrackSet},
    packet::PackedRegion,
};

/// Largest tile grid side of one quality rank in a merged picture.
pub const MAX_GRID_SIDE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileArrangement {
    pub rows: u32,
    pub cols: u32,
    /// Slots filled by repeating a tile
    pub repeated: u32,
}

/// Arrange `count` tiles in the most square `rows x cols` grid with `rows <= cols`.
///
/// When no grid inside `max_rows x max_cols` holds exactly `count` tiles, the count grows and the
/// extra slots repeat tiles.
pub fn arrange(count: u32, max_rows: u32, max_cols: u32) -> Option<TileArrangement> {
    if count == 0 {
        return None;
    }

    for total in count..=max_rows.saturating_mul(max_cols) {
        let mut rows = (total as f64).sqrt() as u32;
        while rows > 0 {
            if total % rows == 0 {
                let cols = total / rows;
                if rows <= max_rows && cols <= max_cols {
                    return Some(TileArrangement {
                        rows,
                        cols,
                        repeated: total - count,
                    });
                }
            }
            rows -= 1;
        }
    }
    None
}

/// Placement of every tile of a selection in the merged picture.
///
/// Quality ranks are stacked top to bottom, best rank first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLayout {
    pub width: u32,
    pub height: u32,
    pub quality_rank_count: usize,
    pub regions: Vec<PackedRegion>,
    pub repeated: u32,
}

impl MergeLayout {
    pub fn new(tracks: &TrackSet) -> Option<Self> {
        let mut ranks: BTreeMap<u32, Vec<(TrackId, Srd)>> = BTreeMap::new();
        for set in tracks.iter() {
            ranks
                .entry(set.quality_ranking)
                .or_default()
                .push((set.id, set.srd));
        }

        let mut layout = MergeLayout {
            width: 0,
            height: 0,
            quality_rank_count: ranks.len(),
            regions: Vec::new(),
            repeated: 0,
        };
        for (quality_ranking, mut tiles) in ranks {
            // keep the projected order so neighbours stay neighbours
            tiles.sort_by_key(|(_, srd)| (srd.y, srd.x));
            let arrangement = arrange(tiles.len() as u32, MAX_GRID_SIDE, MAX_GRID_SIDE)?;
            let tile_width = tiles.iter().map(|(_, s)| s.width).max().unwrap_or(0);
            let tile_height = tiles.iter().map(|(_, s)| s.height).max().unwrap_or(0);

            let slots = (arrangement.rows * arrangement.cols) as usize;
            for slot in 0..slots {
                let (track_id, source) = tiles[slot.min(tiles.len() - 1)];
                let row = slot as u32 / arrangement.cols;
                let col = slot as u32 % arrangement.cols;
                layout.regions.push(PackedRegion {
                    track_id,
                    quality_ranking,
                    source,
                    destination: Srd::new(
                        col * tile_width,
                        layout.height + row * tile_height,
                        source.width,
                        source.height,
                    ),
                });
            }

            layout.width = layout.width.max(arrangement.cols * tile_width);
            layout.height += arrangement.rows * tile_height;
            layout.repeated += arrangement.repeated;
        }

        if layout.regions.is_empty() {
            None
        } else {
            Some(layout)
        }
    }
}
