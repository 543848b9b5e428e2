/// Integer box with exclusive right/bottom edges. The all-zero box stands for
/// the whole extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Box2D {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Box2D {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Box of `size` texels starting at `origin`, saturating at `i32::MAX`.
    pub fn from_origin(origin: [u32; 2], size: [u32; 2]) -> Self {
        let edge = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        Self::new(
            edge(origin[0]),
            edge(origin[1]),
            edge(origin[0].saturating_add(size[0])),
            edge(origin[1].saturating_add(size[1])),
        )
    }

    pub fn is_whole(&self) -> bool {
        *self == Self::default()
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    /// Clamps the box to `width x height`; the whole box expands to it.
    pub fn resolve(&self, width: u32, height: u32) -> Box2D {
        if self.is_whole() {
            return Box2D::new(0, 0, width as i32, height as i32);
        }
        Box2D::new(
            self.left.clamp(0, width as i32),
            self.top.clamp(0, height as i32),
            self.right.clamp(0, width as i32),
            self.bottom.clamp(0, height as i32),
        )
    }
}

/// Restricts an update or copy to part of a resource: a box within each mip,
/// an inclusive mip range and optionally a single array layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartialResource {
    pub area: Box2D,
    pub lod_min: u32,
    pub lod_max: u32,
    pub array_index: Option<u32>,
}

impl PartialResource {
    pub fn whole() -> Self {
        Self {
            area: Box2D::default(),
            lod_min: 0,
            lod_max: u32::MAX,
            array_index: None,
        }
    }

    pub fn area(area: Box2D) -> Self {
        Self {
            area,
            ..Self::whole()
        }
    }

    pub fn lods(mut self, lod_min: u32, lod_max: u32) -> Self {
        self.lod_min = lod_min;
        self.lod_max = lod_max;
        self
    }

    pub fn array_index(mut self, index: u32) -> Self {
        self.array_index = Some(index);
        self
    }

    pub fn is_whole(&self) -> bool {
        *self == Self::whole()
    }

    pub fn includes_lod(&self, lod: u32) -> bool {
        lod >= self.lod_min && lod <= self.lod_max
    }

    pub fn includes_layer(&self, layer: u32) -> bool {
        self.array_index.is_none_or(|index| index == layer)
    }
}

impl Default for PartialResource {
    fn default() -> Self {
        Self::whole()
    }
}
