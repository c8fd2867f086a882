//! Channel reordering between a requested logical layout and the device's
//! physical layout.

use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Physical speaker position of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    RearLeft,
    RearRight,
    SideLeft,
    SideRight,
}

impl ChannelPosition {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelPosition::Mono => "MONO",
            ChannelPosition::FrontLeft => "FL",
            ChannelPosition::FrontRight => "FR",
            ChannelPosition::FrontCenter => "FC",
            ChannelPosition::Lfe => "LFE",
            ChannelPosition::RearLeft => "RL",
            ChannelPosition::RearRight => "RR",
            ChannelPosition::SideLeft => "SL",
            ChannelPosition::SideRight => "SR",
        }
    }

    /// Conventional layout for a channel count, used when the device cannot
    /// report one.
    pub fn default_layout(channels: usize) -> Option<Vec<ChannelPosition>> {
        use ChannelPosition::*;
        let layout = match channels {
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            4 => vec![FrontLeft, FrontRight, RearLeft, RearRight],
            6 => vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, Lfe],
            8 => vec![
                FrontLeft,
                FrontRight,
                RearLeft,
                RearRight,
                FrontCenter,
                Lfe,
                SideLeft,
                SideRight,
            ],
            _ => return None,
        };
        Some(layout)
    }
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChannelPosition {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let pos = match s.to_ascii_uppercase().as_str() {
            "MONO" => ChannelPosition::Mono,
            "FL" => ChannelPosition::FrontLeft,
            "FR" => ChannelPosition::FrontRight,
            "FC" => ChannelPosition::FrontCenter,
            "LFE" => ChannelPosition::Lfe,
            "RL" => ChannelPosition::RearLeft,
            "RR" => ChannelPosition::RearRight,
            "SL" => ChannelPosition::SideLeft,
            "SR" => ChannelPosition::SideRight,
            _ => {
                return Err(EngineError::Config(format!(
                    "unable to parse channel position '{s}'"
                )));
            }
        };
        Ok(pos)
    }
}

/// Parse a comma-separated channel order, e.g. `FR,FL`.
pub fn parse_channel_order(s: &str) -> Result<Vec<ChannelPosition>> {
    s.split(',').map(|part| part.trim().parse()).collect()
}

/// Permutation from logical channel index to physical device channel index.
///
/// Bijective over `[0, channels)` by construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMap {
    map: Vec<usize>,
}

impl ChannelMap {
    /// Match every requested position to an unclaimed device channel with the
    /// identical position.
    ///
    /// Returns `Ok(None)` when the orders already agree (identity needs no
    /// remapping work per chunk).
    pub fn build(
        requested: &[ChannelPosition],
        device: &[ChannelPosition],
    ) -> Result<Option<ChannelMap>> {
        if requested.len() != device.len() {
            return Err(EngineError::Config(
                "channel numbers don't match between stream and channel map".into(),
            ));
        }

        let channels = requested.len();
        let mut claimed = vec![false; channels];
        let mut map = vec![0usize; channels];
        for ch in 0..channels {
            if requested[ch] == device[ch] && !claimed[ch] {
                claimed[ch] = true;
                map[ch] = ch;
                continue;
            }
            let found = (0..channels).find(|&i| !claimed[i] && device[i] == requested[ch]);
            match found {
                Some(i) => {
                    claimed[i] = true;
                    map[ch] = i;
                }
                None => {
                    return Err(EngineError::Config(format!(
                        "channel {ch} ({}) doesn't match the device layout",
                        requested[ch]
                    )));
                }
            }
        }

        if map.iter().enumerate().all(|(ch, &i)| ch == i) {
            return Ok(None);
        }
        Ok(Some(ChannelMap { map }))
    }

    pub fn channels(&self) -> usize {
        self.map.len()
    }

    /// Relocate per-frame sample ranges into `dst` following the map.
    ///
    /// Logical output channel `ch` takes the sample of physical channel
    /// `map[ch]` within each frame. Both buffers must hold whole frames of
    /// identical length.
    pub fn apply_interleaved(&self, src: &[u8], dst: &mut [u8], sample_bytes: usize) {
        let channels = self.map.len();
        let frame_bytes = channels * sample_bytes;
        debug_assert_eq!(src.len(), dst.len());
        debug_assert_eq!(src.len() % frame_bytes, 0);

        for (src_frame, dst_frame) in src
            .chunks_exact(frame_bytes)
            .zip(dst.chunks_exact_mut(frame_bytes))
        {
            for (ch, &phys) in self.map.iter().enumerate() {
                let from = phys * sample_bytes;
                let to = ch * sample_bytes;
                dst_frame[to..to + sample_bytes].copy_from_slice(&src_frame[from..from + sample_bytes]);
            }
        }
    }

    /// Reorder per-channel buffer references following the map (zero-copy).
    pub fn apply_channel_order<'b>(&self, bufs: &[&'b [u8]]) -> Vec<&'b [u8]> {
        debug_assert_eq!(bufs.len(), self.map.len());
        self.map.iter().map(|&phys| bufs[phys]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelPosition::*;

    #[test]
    fn identical_orders_need_no_map() {
        let order = [FrontLeft, FrontRight];
        assert_eq!(ChannelMap::build(&order, &order).unwrap(), None);
    }

    #[test]
    fn swapped_stereo_builds_a_swap() {
        let map = ChannelMap::build(&[FrontRight, FrontLeft], &[FrontLeft, FrontRight])
            .unwrap()
            .unwrap();
        assert_eq!(map.map, vec![1, 0]);
    }

    #[test]
    fn rejects_mismatched_channel_counts() {
        let err = ChannelMap::build(&[FrontLeft], &[FrontLeft, FrontRight]).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn rejects_positions_absent_from_the_device() {
        let err =
            ChannelMap::build(&[FrontLeft, FrontCenter], &[FrontLeft, FrontRight]).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn duplicate_requests_cannot_reuse_a_claimed_channel() {
        let err =
            ChannelMap::build(&[FrontLeft, FrontLeft], &[FrontLeft, FrontRight]).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn apply_interleaved_relocates_frames() {
        let map = ChannelMap::build(&[FrontRight, FrontLeft], &[FrontLeft, FrontRight])
            .unwrap()
            .unwrap();
        // Two frames of 16-bit stereo: L=0x0101, R=0x0202 per frame.
        let src = [0x01, 0x01, 0x02, 0x02, 0x03, 0x03, 0x04, 0x04];
        let mut dst = [0u8; 8];
        map.apply_interleaved(&src, &mut dst, 2);
        assert_eq!(dst, [0x02, 0x02, 0x01, 0x01, 0x04, 0x04, 0x03, 0x03]);
    }

    #[test]
    fn apply_channel_order_permutes_references() {
        let map = ChannelMap::build(&[FrontRight, FrontLeft], &[FrontLeft, FrontRight])
            .unwrap()
            .unwrap();
        let left = [1u8, 1];
        let right = [2u8, 2];
        let ordered = map.apply_channel_order(&[&left, &right]);
        assert_eq!(ordered[0], &right);
        assert_eq!(ordered[1], &left);
    }

    #[test]
    fn parse_channel_order_accepts_lowercase() {
        let order = parse_channel_order("fl, fr").unwrap();
        assert_eq!(order, vec![FrontLeft, FrontRight]);
        assert!(parse_channel_order("fl,xx").is_err());
    }

    #[test]
    fn default_layouts_cover_common_counts() {
        assert_eq!(ChannelPosition::default_layout(1).unwrap(), vec![Mono]);
        assert_eq!(
            ChannelPosition::default_layout(2).unwrap(),
            vec![FrontLeft, FrontRight]
        );
        assert!(ChannelPosition::default_layout(3).is_none());
    }
}
