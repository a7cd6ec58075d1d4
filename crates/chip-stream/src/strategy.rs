//! Per-session buffering plan.
//!
//! A pure function of `(capacity_frames, block_frames, StrategyConfig)`, computed once
//! when a track is loaded.

use crate::config::StrategyConfig;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferingStrategy {
    pub capacity_frames: usize,
    pub block_frames: usize,
    /// Occupancy to reach before signalling ready, and the streaming fill target.
    pub pre_roll_frames: usize,
    /// Largest single render request.
    pub render_chunk_frames: usize,
    /// Cycle budget handed to the engine for a full chunk.
    pub render_cycles_per_chunk: u64,
    /// A full ring at or above this occupancy is a top-up pause, not a stall.
    pub high_watermark_frames: usize,
    cycles_per_frame: f64,
}

impl BufferingStrategy {
    pub fn derive(capacity_frames: usize, block_frames: usize, cfg: &StrategyConfig) -> Self {
        let block = block_frames.max(1);
        let max_pre_roll = align_down(capacity_frames.saturating_sub(block), block);

        let ratio_frames = (capacity_frames as f64 * cfg.pre_roll_ratio as f64).round() as usize;
        let pre_roll_frames = align_up(ratio_frames.max(cfg.min_pre_roll_frames), block)
            .min(max_pre_roll);

        let chunk_bound = align_down(
            (capacity_frames as f64 * cfg.max_chunk_ratio as f64) as usize,
            block,
        )
        .max(block);
        let render_chunk_frames = align_down(cfg.render_chunk_frames, block).clamp(block, chunk_bound);

        let high_watermark_frames =
            (pre_roll_frames as f64 * cfg.high_watermark_ratio as f64).ceil() as usize;

        Self {
            capacity_frames,
            block_frames: block,
            pre_roll_frames,
            render_chunk_frames,
            render_cycles_per_chunk: cycles(render_chunk_frames, cfg.cycles_per_frame),
            high_watermark_frames,
            cycles_per_frame: cfg.cycles_per_frame,
        }
    }

    /// Cycle budget for a render of `frames` frames.
    pub fn cycles_for(&self, frames: usize) -> u64 {
        cycles(frames, self.cycles_per_frame)
    }

    /// Frames to request next: closes `deficit` (rounded up to whole blocks) but
    /// never exceeds one chunk or the writable space (rounded down to whole blocks).
    pub fn next_request(&self, deficit: usize, writable: usize) -> usize {
        let want = align_up(deficit, self.block_frames);
        let room = align_down(writable, self.block_frames);
        want.min(self.render_chunk_frames).min(room)
    }
}

fn cycles(frames: usize, cycles_per_frame: f64) -> u64 {
    (frames as f64 * cycles_per_frame).ceil() as u64
}

pub(crate) fn align_down(frames: usize, block: usize) -> usize {
    frames / block * block
}

pub(crate) fn align_up(frames: usize, block: usize) -> usize {
    frames.div_ceil(block) * block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_capacity_16k_block_128() {
        let s = BufferingStrategy::derive(16_384, 128, &StrategyConfig::default());
        // 30% of 16384 is 4915.2, rounded up to whole blocks.
        assert_eq!(s.pre_roll_frames, 4_992);
        assert!(s.pre_roll_frames >= 4_915);
        assert_eq!(s.render_chunk_frames, 2_048);
        assert_eq!(s.render_cycles_per_chunk, 2_048 * 81);
        assert_eq!(s.high_watermark_frames, 4_493);
    }

    #[test]
    fn invariants_hold_across_shapes() {
        let cfg = StrategyConfig::default();
        for capacity in [128usize, 256, 1000, 4096, 15_488, 16_384, 65_536] {
            for block in [32usize, 64, 128, 256, 441] {
                if capacity < block {
                    continue;
                }
                let s = BufferingStrategy::derive(capacity, block, &cfg);
                assert!(s.pre_roll_frames <= capacity - block, "{capacity}/{block}");
                assert_eq!(s.pre_roll_frames % block, 0);
                assert_eq!(s.render_chunk_frames % block, 0);
                assert!(s.render_chunk_frames >= block);
                assert!(s.render_chunk_frames <= (capacity / 4).max(block));
            }
        }
    }

    #[test]
    fn small_rings_respect_minimum_and_capacity() {
        let cfg = StrategyConfig::default();
        let s = BufferingStrategy::derive(2_048, 128, &cfg);
        // The floor (1024) beats 30% (614), and still fits under capacity - block.
        assert_eq!(s.pre_roll_frames, 1_024);
        let tiny = BufferingStrategy::derive(512, 128, &cfg);
        assert_eq!(tiny.pre_roll_frames, 384);
        assert_eq!(tiny.render_chunk_frames, 128);
    }

    #[test]
    fn chunk_is_bounded_by_quarter_capacity() {
        let cfg = StrategyConfig {
            render_chunk_frames: 100_000,
            ..StrategyConfig::default()
        };
        let s = BufferingStrategy::derive(8_192, 128, &cfg);
        assert_eq!(s.render_chunk_frames, 2_048);
    }

    #[test]
    fn next_request_aligns_and_bounds() {
        let s = BufferingStrategy::derive(16_384, 128, &StrategyConfig::default());
        assert_eq!(s.next_request(1, 10_000), 128);
        assert_eq!(s.next_request(300, 10_000), 384);
        assert_eq!(s.next_request(9_000, 10_000), 2_048);
        assert_eq!(s.next_request(9_000, 200), 128);
        assert_eq!(s.next_request(9_000, 100), 0);
        assert_eq!(s.next_request(0, 10_000), 0);
    }

    #[test]
    fn cycle_budget_scales_with_frames() {
        let cfg = StrategyConfig {
            cycles_per_frame: 2.5,
            ..StrategyConfig::default()
        };
        let s = BufferingStrategy::derive(4_096, 64, &cfg);
        assert_eq!(s.cycles_for(3), 8);
        assert_eq!(s.cycles_for(0), 0);
    }

    #[test]
    fn fractional_cycle_rates_compare_by_value() {
        let cfg = StrategyConfig {
            cycles_per_frame: 40.5,
            ..StrategyConfig::default()
        };
        let a = BufferingStrategy::derive(8_192, 128, &cfg);
        assert_eq!(a, BufferingStrategy::derive(8_192, 128, &cfg));
        let faster = StrategyConfig {
            cycles_per_frame: 40.75,
            ..cfg
        };
        assert_ne!(a, BufferingStrategy::derive(8_192, 128, &faster));
    }
}
