/// Sizing of the GPU working cache kept by an uber-surface interface.
#[derive(Clone, Debug, PartialEq)]
pub struct UberCacheConfig {
    /// Samples the cache window reaches past the edit center on each side.
    pub cache_extent: u32,
    pub group_dimension: u32,
    /// Erosion regions are rounded up to whole water tiles of this size.
    pub erosion_tile: u32,
    /// Physical size of one surface sample, used by the water simulation.
    pub terrain_scale: f32,
    pub tree_depth: u32,
}

impl Default for UberCacheConfig {
    fn default() -> Self {
        Self {
            cache_extent: 512,
            group_dimension: 16,
            erosion_tile: 256,
            terrain_scale: 2.0,
            tree_depth: 5,
        }
    }
}

impl UberCacheConfig {
    pub fn cache_extent(mut self, samples: u32) -> Self {
        self.cache_extent = samples;
        self
    }

    pub fn group_dimension(mut self, dimension: u32) -> Self {
        self.group_dimension = dimension.max(1);
        self
    }

    pub fn erosion_tile(mut self, samples: u32) -> Self {
        self.erosion_tile = samples.max(1);
        self
    }

    pub fn terrain_scale(mut self, scale: f32) -> Self {
        self.terrain_scale = scale;
        self
    }

    pub fn tree_depth(mut self, depth: u32) -> Self {
        self.tree_depth = depth;
        self
    }

    pub(crate) fn group_count(&self, dims: [u32; 2]) -> [u32; 3] {
        [
            dims[0].div_ceil(self.group_dimension),
            dims[1].div_ceil(self.group_dimension),
            1,
        ]
    }
}
