/// Integer rectangle over surface samples. Both corners are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub mins: [u32; 2],
    pub maxs: [u32; 2],
}

impl Rect {
    pub fn new(mins: [u32; 2], maxs: [u32; 2]) -> Self {
        debug_assert!(mins[0] <= maxs[0] && mins[1] <= maxs[1], "inverted rect {mins:?}-{maxs:?}");
        Self { mins, maxs }
    }

    /// `None` when the corners are inverted on either axis.
    pub fn checked(mins: [u32; 2], maxs: [u32; 2]) -> Option<Self> {
        (mins[0] <= maxs[0] && mins[1] <= maxs[1]).then_some(Self { mins, maxs })
    }

    pub fn dims(&self) -> [u32; 2] {
        [
            self.maxs[0] - self.mins[0] + 1,
            self.maxs[1] - self.mins[1] + 1,
        ]
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.mins[0] >= self.mins[0]
            && other.mins[1] >= self.mins[1]
            && other.maxs[0] <= self.maxs[0]
            && other.maxs[1] <= self.maxs[1]
    }

    pub fn contains_point(&self, x: u32, y: u32) -> bool {
        (self.mins[0]..=self.maxs[0]).contains(&x) && (self.mins[1]..=self.maxs[1]).contains(&y)
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !(other.maxs[0] < self.mins[0]
            || other.maxs[1] < self.mins[1]
            || other.mins[0] > self.maxs[0]
            || other.mins[1] > self.maxs[1])
    }

    /// Limits the rect to a `width` x `height` surface. `None` when nothing
    /// of it lies on the surface.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        if width == 0 || height == 0 || self.mins[0] >= width || self.mins[1] >= height {
            return None;
        }
        Some(Rect {
            mins: self.mins,
            maxs: [self.maxs[0].min(width - 1), self.maxs[1].min(height - 1)],
        })
    }

    /// Grows every side by `amount`, saturating at zero and at `limit`.
    pub fn expand(&self, amount: u32, limit: [u32; 2]) -> Rect {
        Rect {
            mins: [
                self.mins[0].saturating_sub(amount),
                self.mins[1].saturating_sub(amount),
            ],
            maxs: [
                self.maxs[0].saturating_add(amount).min(limit[0]),
                self.maxs[1].saturating_add(amount).min(limit[1]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_is_inclusive() {
        let window = Rect::new([10, 10], [20, 20]);
        assert!(window.contains(&Rect::new([10, 10], [20, 20])));
        assert!(window.contains(&Rect::new([12, 15], [12, 15])));
        assert!(!window.contains(&Rect::new([9, 10], [20, 20])));
        assert!(window.contains_point(20, 10));
        assert!(!window.contains_point(21, 10));
        assert_eq!(window.dims(), [11, 11]);
    }

    #[test]
    fn touching_edges_intersect() {
        let a = Rect::new([0, 0], [10, 10]);
        assert!(a.intersects(&Rect::new([10, 10], [30, 30])));
        assert!(!a.intersects(&Rect::new([11, 0], [30, 30])));
        assert!(!a.intersects(&Rect::new([0, 11], [3, 30])));
    }

    #[test]
    fn clamping_and_expansion_saturate() {
        let a = Rect::new([5, 60], [90, 200]);
        assert_eq!(a.clamp_to(64, 128), Some(Rect::new([5, 60], [63, 127])));
        assert_eq!(a.clamp_to(4, 128), None);
        assert_eq!(a.clamp_to(0, 0), None);
        assert_eq!(a.expand(10, [95, 1000]), Rect::new([0, 50], [95, 210]));
        assert_eq!(Rect::checked([3, 3], [2, 9]), None);
    }
}
