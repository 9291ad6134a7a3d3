//! Thread-group partitioning for 2D compute dispatches.
//!
//! A dispatch covers the output with a grid of identically shaped thread
//! groups. [`plan`] enumerates every group shape that fits inside one thread
//! group, sizes the grid by ceiling division so the output is always covered,
//! and keeps the candidate with the smallest estimated waste:
//!
//! - the L-shaped overrun of the grid past the right and bottom output edges;
//! - the idle lanes in every group whose thread count is not a multiple of
//!   the execution width.
//!
//! Enumeration runs group width outer, group height inner, both ascending,
//! and the first minimum wins. Changing that order changes which of several
//! equally cheap plans is chosen, so it is pinned by tests.

use serde::Serialize;

/// Output size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `true` when there is nothing to draw.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl From<(u32, u32)> for Extent {
    fn from((width, height): (u32, u32)) -> Self {
        Self::new(width, height)
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Three-axis count, used both for threads per group and groups per grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct GroupShape {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupShape {
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn volume(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    pub fn has_zero_dimension(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

/// Group shape plus grid shape for one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadGroupPlan {
    /// Threads per group along each axis.
    pub group: GroupShape,
    /// Groups per grid along each axis.
    pub grid: GroupShape,
}

impl ThreadGroupPlan {
    /// The "nothing to draw" plan. Never dispatched.
    pub const DEGENERATE: Self = Self {
        group: GroupShape::ZERO,
        grid: GroupShape::ZERO,
    };

    pub fn is_degenerate(&self) -> bool {
        self.group.has_zero_dimension() || self.grid.has_zero_dimension()
    }

    pub fn threads_per_group(&self) -> u64 {
        self.group.volume()
    }

    pub fn total_groups(&self) -> u64 {
        self.grid.volume()
    }

    /// Threads launched by the whole dispatch, overrun included.
    pub fn total_threads(&self) -> u64 {
        self.threads_per_group() * self.total_groups()
    }

    /// Whether the dispatched threads reach every pixel of `extent`.
    pub fn covers(&self, extent: Extent) -> bool {
        u64::from(self.group.x) * u64::from(self.grid.x) >= u64::from(extent.width)
            && u64::from(self.group.y) * u64::from(self.grid.y) >= u64::from(extent.height)
    }
}

/// Compute capabilities the partitioner has to respect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceLimits {
    /// Upper bound on `group.x * group.y * group.z`.
    pub max_threads_per_group: u32,
    /// Lanes executing in lockstep (warp / wavefront / SIMD width).
    pub execution_width: u32,
    pub max_group_width: u32,
    pub max_group_height: u32,
    pub max_groups_per_dimension: u32,
}

impl DeviceLimits {
    /// Limits described only by the thread budget and execution width.
    pub const fn new(max_threads_per_group: u32, execution_width: u32) -> Self {
        Self {
            max_threads_per_group,
            execution_width,
            max_group_width: max_threads_per_group,
            max_group_height: max_threads_per_group,
            max_groups_per_dimension: u32::MAX,
        }
    }
}

/// Picks the group and grid shape covering `output` with the least waste.
///
/// Returns [`ThreadGroupPlan::DEGENERATE`] when either output dimension is
/// zero; callers treat that as "skip this dispatch".
pub fn plan(output: Extent, max_threads_per_group: u32, execution_width: u32) -> ThreadGroupPlan {
    plan_within(
        output,
        &DeviceLimits::new(max_threads_per_group, execution_width),
    )
}

/// [`plan`] with per-axis group limits and a grid-size ceiling.
pub fn plan_within(output: Extent, limits: &DeviceLimits) -> ThreadGroupPlan {
    if output.is_empty() {
        tracing::debug!(%output, "output size is empty; nothing to dispatch");
        return ThreadGroupPlan::DEGENERATE;
    }
    if limits.max_threads_per_group == 0 || limits.execution_width == 0 {
        debug_assert!(false, "device limits must be non-zero: {limits:?}");
        return ThreadGroupPlan::DEGENERATE;
    }

    let max_width = limits.max_threads_per_group.min(limits.max_group_width);
    let mut best: Option<(u64, ThreadGroupPlan)> = None;

    for group_width in 1..=max_width {
        let max_height = (limits.max_threads_per_group / group_width).min(limits.max_group_height);
        for group_height in 1..=max_height {
            let grid_width = output.width.div_ceil(group_width);
            let grid_height = output.height.div_ceil(group_height);
            if grid_width > limits.max_groups_per_dimension
                || grid_height > limits.max_groups_per_dimension
            {
                continue;
            }

            let candidate = ThreadGroupPlan {
                group: GroupShape::new(group_width, group_height, 1),
                grid: GroupShape::new(grid_width, grid_height, 1),
            };
            let cost = estimated_underutilization(&candidate, output, limits.execution_width);
            if best.map_or(true, |(best_cost, _)| cost < best_cost) {
                best = Some((cost, candidate));
            }
        }
    }

    match best {
        Some((cost, selected)) => {
            tracing::debug!(
                %output,
                group = ?selected.group,
                grid = ?selected.grid,
                cost,
                "selected thread-group plan"
            );
            selected
        }
        None => {
            tracing::warn!(%output, ?limits, "no thread-group shape fits the device limits");
            ThreadGroupPlan::DEGENERATE
        }
    }
}

/// Rough count of lane-cycles a candidate wastes. Smaller is better.
pub fn estimated_underutilization(
    candidate: &ThreadGroupPlan,
    output: Extent,
    execution_width: u32,
) -> u64 {
    let width = u64::from(output.width);
    let height = u64::from(output.height);
    let wave = u64::from(execution_width.max(1));

    let excess_width = u64::from(candidate.group.x) * u64::from(candidate.grid.x) - width;
    let excess_height = u64::from(candidate.group.y) * u64::from(candidate.grid.y) - height;
    let excess_area = excess_width * height + excess_height * width + excess_width * excess_height;

    let threads_per_group = u64::from(candidate.group.x) * u64::from(candidate.group.y);
    let total_groups = u64::from(candidate.grid.x) * u64::from(candidate.grid.y);
    let excess_lanes_per_group = (wave - threads_per_group % wave) % wave;

    excess_area + excess_lanes_per_group * total_groups
}

/// Last plan computed, keyed by the output size it was computed for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlanCache {
    entry: Option<(Extent, ThreadGroupPlan)>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the cached plan when `extent` differs from its key.
    ///
    /// Returns `true` if an entry was discarded.
    pub fn invalidate_if_size_changed(&mut self, extent: Extent) -> bool {
        match self.entry {
            Some((key, _)) if key != extent => {
                self.entry = None;
                true
            }
            _ => false,
        }
    }

    pub fn cached(&self) -> Option<(Extent, ThreadGroupPlan)> {
        self.entry
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    /// Returns the plan for `extent`, computing it only on a cache miss.
    pub fn plan_for(&mut self, extent: Extent, limits: &DeviceLimits) -> ThreadGroupPlan {
        self.invalidate_if_size_changed(extent);
        if let Some((_, cached)) = self.entry {
            return cached;
        }
        let computed = plan_within(extent, limits);
        self.entry = Some((extent, computed));
        computed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [(u32, u32); 9] = [
        (1, 1),
        (7, 3),
        (33, 65),
        (640, 480),
        (1023, 767),
        (1024, 768),
        (1920, 1080),
        (511, 1),
        (1, 997),
    ];
    const LIMITS: [(u32, u32); 5] = [(1024, 32), (256, 32), (512, 64), (64, 16), (100, 7)];

    #[test]
    fn plans_cover_output_and_respect_thread_budget() {
        for &(width, height) in &SIZES {
            for &(max_threads, wave) in &LIMITS {
                let extent = Extent::new(width, height);
                let selected = plan(extent, max_threads, wave);
                assert!(!selected.is_degenerate(), "{extent} {max_threads}/{wave}");
                assert!(selected.covers(extent), "{extent} {selected:?}");
                assert!(selected.threads_per_group() <= u64::from(max_threads));
                assert_eq!(selected.group.z, 1);
                assert_eq!(selected.grid.z, 1);
            }
        }
    }

    #[test]
    fn zero_sized_outputs_yield_degenerate_plan() {
        assert_eq!(plan(Extent::new(0, 600), 1024, 32), ThreadGroupPlan::DEGENERATE);
        assert_eq!(plan(Extent::new(800, 0), 1024, 32), ThreadGroupPlan::DEGENERATE);
        assert!(plan(Extent::new(0, 0), 1024, 32).is_degenerate());
    }

    #[test]
    fn identical_inputs_yield_identical_plans() {
        let extent = Extent::new(1366, 911);
        let first = plan(extent, 1024, 32);
        let second = plan(extent, 1024, 32);
        assert_eq!(first, second);
    }

    #[test]
    fn prefers_lane_aligned_exact_cover() {
        let extent = Extent::new(1024, 768);
        let selected = plan(extent, 1024, 32);
        assert_eq!(selected.threads_per_group() % 32, 0);
        assert_eq!(estimated_underutilization(&selected, extent, 32), 0);
    }

    #[test]
    fn ties_resolve_to_first_candidate_in_enumeration_order() {
        // Width 1 is enumerated first and 1x32 is the first zero-cost shape.
        let selected = plan(Extent::new(1024, 768), 1024, 32);
        assert_eq!(selected.group, GroupShape::new(1, 32, 1));
        assert_eq!(selected.grid, GroupShape::new(1024, 24, 1));
    }

    #[test]
    fn cost_counts_overrun_and_idle_lanes() {
        let candidate = ThreadGroupPlan {
            group: GroupShape::new(3, 3, 1),
            grid: GroupShape::new(4, 4, 1),
        };
        // 12x12 over 10x10: 2*10 + 2*10 + 2*2 = 44 overrun pixels,
        // 9 threads per group leaves 7 of 16 lanes idle across 16 groups.
        assert_eq!(
            estimated_underutilization(&candidate, Extent::new(10, 10), 16),
            44 + 7 * 16
        );
    }

    #[test]
    fn per_axis_limits_and_grid_ceiling_are_honoured() {
        let limits = DeviceLimits {
            max_threads_per_group: 256,
            execution_width: 32,
            max_group_width: 16,
            max_group_height: 8,
            max_groups_per_dimension: 65_535,
        };
        let extent = Extent::new(1920, 1080);
        let selected = plan_within(extent, &limits);
        assert!(selected.group.x <= 16);
        assert!(selected.group.y <= 8);
        assert!(selected.covers(extent));

        let tight = DeviceLimits {
            max_groups_per_dimension: 4,
            ..DeviceLimits::new(4, 4)
        };
        assert!(plan_within(Extent::new(100, 100), &tight).is_degenerate());
    }

    #[test]
    fn cache_reuses_plan_until_size_changes() {
        let limits = DeviceLimits::new(256, 32);
        let mut cache = PlanCache::new();
        let first = cache.plan_for(Extent::new(640, 480), &limits);
        assert_eq!(cache.cached(), Some((Extent::new(640, 480), first)));

        assert!(!cache.invalidate_if_size_changed(Extent::new(640, 480)));
        assert!(cache.invalidate_if_size_changed(Extent::new(800, 600)));
        assert_eq!(cache.cached(), None);

        let resized = cache.plan_for(Extent::new(800, 600), &limits);
        assert!(resized.covers(Extent::new(800, 600)));
        assert_eq!(cache.cached().map(|(key, _)| key), Some(Extent::new(800, 600)));
    }

    #[test]
    fn cache_holds_degenerate_plans_for_empty_outputs() {
        let mut cache = PlanCache::new();
        let limits = DeviceLimits::new(256, 32);
        assert!(cache.plan_for(Extent::new(0, 600), &limits).is_degenerate());
        assert!(!cache.plan_for(Extent::new(10, 600), &limits).is_degenerate());
    }
}
