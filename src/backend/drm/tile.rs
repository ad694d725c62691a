//! Tiled displays: monitors driven through several connectors, one per tile.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{bail, ensure, Context};

/// Contents of a connector's `TILE` blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    pub group_id: u32,
    /// The tiles form a single monitor.
    pub single_monitor: bool,
    pub num_h: u32,
    pub num_v: u32,
    pub loc_h: u32,
    pub loc_v: u32,
    /// Size of this tile in pixels.
    pub width: u32,
    pub height: u32,
}

impl FromStr for TileInfo {
    type Err = anyhow::Error;

    /// Parses `group:single:num_h:num_v:loc_h:loc_v:w:h`, as the kernel formats it.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim_end_matches('\0');
        let fields = s
            .split(':')
            .map(|field| field.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid TILE value {s:?}"))?;
        let &[group_id, single, num_h, num_v, loc_h, loc_v, width, height] = &fields[..] else {
            bail!("TILE value {s:?} has {} fields instead of 8", fields.len());
        };

        ensure!(num_h > 0 && num_v > 0, "empty tile grid in {s:?}");
        ensure!(
            loc_h < num_h && loc_v < num_v,
            "tile location is outside of the grid in {s:?}"
        );

        Ok(Self {
            group_id,
            single_monitor: single != 0,
            num_h,
            num_v,
            loc_h,
            loc_v,
            width,
            height,
        })
    }
}

impl TileInfo {
    pub fn parse_blob(data: &[u8]) -> anyhow::Result<Self> {
        let s = std::str::from_utf8(data).context("TILE blob is not UTF-8")?;
        s.parse()
    }
}

/// Tile groups of the connectors of one device.
#[derive(Debug, Default)]
pub struct TileRegistry {
    groups: BTreeMap<u32, Vec<(u32, TileInfo)>>,
}

impl TileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, connector: u32, info: TileInfo) {
        self.remove(connector);
        let tiles = self.groups.entry(info.group_id).or_default();
        tiles.push((connector, info));
        tiles.sort_by_key(|(_, t)| (t.loc_v, t.loc_h));
    }

    pub fn remove(&mut self, connector: u32) {
        self.groups.retain(|_, tiles| {
            tiles.retain(|(c, _)| *c != connector);
            !tiles.is_empty()
        });
    }

    /// Tiles of the group `connector` belongs to, in row-major order.
    pub fn group_of(&self, connector: u32) -> Option<&[(u32, TileInfo)]> {
        self.groups
            .values()
            .find(|tiles| tiles.iter().any(|(c, _)| *c == connector))
            .map(|tiles| &tiles[..])
    }

    /// Whether every tile of the group is present.
    pub fn is_complete(&self, group_id: u32) -> bool {
        let Some(tiles) = self.groups.get(&group_id) else {
            return false;
        };
        let Some((_, first)) = tiles.first() else {
            return false;
        };
        tiles.len() as u64 == u64::from(first.num_h) * u64::from(first.num_v)
    }

    /// Size of the whole monitor formed by a group.
    pub fn total_size(&self, group_id: u32) -> Option<(u32, u32)> {
        let tiles = self.groups.get(&group_id)?;
        let width = tiles
            .iter()
            .filter(|(_, t)| t.loc_v == 0)
            .map(|(_, t)| t.width)
            .sum();
        let height = tiles
            .iter()
            .filter(|(_, t)| t.loc_h == 0)
            .map(|(_, t)| t.height)
            .sum();
        Some((width, height))
    }
}
