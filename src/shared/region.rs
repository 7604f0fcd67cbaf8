// This is free and unencumbered software released into the public domain.

//! Zoom crop and touch metering regions.
//!
//! A touch lands in view coordinates and has to end up in the coordinate
//! system of the current crop region, which is what the hardware expects for
//! AF/AE regions. The mapping goes through three affine steps:
//!
//! 1. view space → normalized driver space (-1000..1000), accounting for the
//!    display orientation and front camera mirroring;
//! 2. normalized space → sensor active array (the un-zoomed crop);
//! 3. active array → current (zoomed) crop region.
//!
//! The result is truncated to integers and clamped to the crop bounds one
//! edge at a time, left, top, right, bottom.

use derive_more::Display;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
#[display("[{left}, {top}, {right}, {bottom}]")]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Clamps every edge into `bounds`, in the order left, top, right, bottom.
    pub fn clamp_to(&self, bounds: &Rect) -> Rect {
        Rect {
            left: clamp(self.left, bounds.left, bounds.right),
            top: clamp(self.top, bounds.top, bounds.bottom),
            right: clamp(self.right, bounds.left, bounds.right),
            bottom: clamp(self.bottom, bounds.top, bounds.bottom),
        }
    }
}

fn clamp(x: i32, min: i32, max: i32) -> i32 {
    if x > max {
        return max;
    }
    if x < min {
        return min;
    }
    x
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RectF {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
}

/// A 2D affine transform, `x' = sx*x + kx*y + tx`, `y' = ky*x + sy*y + ty`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine {
    sx: f32,
    kx: f32,
    tx: f32,
    ky: f32,
    sy: f32,
    ty: f32,
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        sx: 1.0,
        kx: 0.0,
        tx: 0.0,
        ky: 0.0,
        sy: 1.0,
        ty: 0.0,
    };

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            sx,
            sy,
            ..Self::IDENTITY
        }
    }

    pub fn translate(dx: f32, dy: f32) -> Self {
        Self {
            tx: dx,
            ty: dy,
            ..Self::IDENTITY
        }
    }

    /// Clockwise rotation in view coordinates (y grows downwards). Quarter
    /// turns are exact.
    pub fn rotate(degrees: i32) -> Self {
        let (sin, cos) = match degrees.rem_euclid(360) {
            0 => (0.0, 1.0),
            90 => (1.0, 0.0),
            180 => (0.0, -1.0),
            270 => (-1.0, 0.0),
            d => (d as f32).to_radians().sin_cos(),
        };
        Self {
            sx: cos,
            kx: -sin,
            ky: sin,
            sy: cos,
            ..Self::IDENTITY
        }
    }

    /// `self` followed by `next`.
    pub fn then(self, next: Affine) -> Affine {
        Affine {
            sx: next.sx * self.sx + next.kx * self.ky,
            kx: next.sx * self.kx + next.kx * self.sy,
            tx: next.sx * self.tx + next.kx * self.ty + next.tx,
            ky: next.ky * self.sx + next.sy * self.ky,
            sy: next.ky * self.kx + next.sy * self.sy,
            ty: next.ky * self.tx + next.sy * self.ty + next.ty,
        }
    }

    pub fn invert(&self) -> Option<Affine> {
        let det = self.sx * self.sy - self.kx * self.ky;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        Some(Affine {
            sx: self.sy / det,
            kx: -self.kx / det,
            tx: (self.kx * self.ty - self.sy * self.tx) / det,
            ky: -self.ky / det,
            sy: self.sx / det,
            ty: (self.ky * self.tx - self.sx * self.ty) / det,
        })
    }

    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.sx * x + self.kx * y + self.tx,
            self.ky * x + self.sy * y + self.ty,
        )
    }

    /// Bounding box of the four mapped corners.
    fn map_rect(&self, r: RectF) -> RectF {
        let corners = [
            self.map_point(r.left, r.top),
            self.map_point(r.right, r.top),
            self.map_point(r.left, r.bottom),
            self.map_point(r.right, r.bottom),
        ];
        let mut out = RectF {
            left: f32::INFINITY,
            top: f32::INFINITY,
            right: f32::NEG_INFINITY,
            bottom: f32::NEG_INFINITY,
        };
        for (x, y) in corners {
            out.left = out.left.min(x);
            out.top = out.top.min(y);
            out.right = out.right.max(x);
            out.bottom = out.bottom.max(y);
        }
        out
    }
}

/// The on-screen preview the user touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewGeometry {
    pub width: i32,
    pub height: i32,
    /// Degrees the preview is rotated to appear upright.
    pub display_orientation: i32,
    /// Front cameras preview mirrored.
    pub mirror: bool,
}

impl ViewGeometry {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            display_orientation: 0,
            mirror: false,
        }
    }

    pub fn with_orientation(mut self, degrees: i32) -> Self {
        self.display_orientation = degrees;
        self
    }

    pub fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    /// Maps driver coordinates (-1000..1000) to view coordinates.
    fn driver_to_view(&self) -> Affine {
        let (w, h) = (self.width as f32, self.height as f32);
        Affine::scale(if self.mirror { -1.0 } else { 1.0 }, 1.0)
            .then(Affine::rotate(self.display_orientation))
            .then(Affine::scale(w / 2000.0, h / 2000.0))
            .then(Affine::translate(w / 2.0, h / 2.0))
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RegionKind {
    #[display("focus")]
    Focus,
    #[display("exposure")]
    Exposure,
    #[display("tracking")]
    Tracking,
}

impl RegionKind {
    pub fn multiplier(self) -> f32 {
        match self {
            Self::Focus => 1.0,
            Self::Exposure => 1.5,
            Self::Tracking => 1.25,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeteringRect {
    pub rect: Rect,
    pub weight: i32,
}

/// Computes the metering rectangle for a touch at (`x`, `y`) in view space.
///
/// `original` is the un-zoomed crop region (the active array) and `crop` the
/// crop region currently applied to requests. Returns `None` when the view
/// or the original crop are degenerate.
pub fn metering_region(
    x: f32,
    y: f32,
    view: &ViewGeometry,
    kind: RegionKind,
    original: &Rect,
    crop: &Rect,
) -> Option<MeteringRect> {
    if original.is_empty() {
        return None;
    }

    let side = ((view.width.max(view.height) / 8) as f32 * kind.multiplier()) as i32;
    let half = (side / 2) as f32;
    let region = RectF {
        left: x - half,
        top: y - half,
        right: x + half,
        bottom: y + half,
    };

    let view_to_driver = view.driver_to_view().invert()?;

    let (ow, oh) = (original.width() as f32, original.height() as f32);
    let driver_to_active = Affine::translate(-ow / 2.0, -oh / 2.0)
        .then(Affine::scale(2000.0 / ow, 2000.0 / oh))
        .invert()?;

    let region = view_to_driver.map_rect(region);
    let region = driver_to_active.map_rect(region);

    let (cw, ch) = (crop.width() as f32, crop.height() as f32);
    let region = RectF {
        left: region.left * cw / ow + crop.left as f32,
        top: region.top * ch / oh + crop.top as f32,
        right: region.right * cw / ow + crop.left as f32,
        bottom: region.bottom * ch / oh + crop.top as f32,
    };

    let rect = Rect::new(
        region.left as i32,
        region.top as i32,
        region.right as i32,
        region.bottom as i32,
    )
    .clamp_to(crop);

    Some(MeteringRect { rect, weight: 1 })
}

/// Crop region for a digital zoom factor, centred on the active array.
pub fn crop_region_for_zoom(active: &Rect, zoom: f32) -> Rect {
    let zoom = if zoom.is_finite() { zoom.max(1.0) } else { 1.0 };
    let x_center = active.left + active.width() / 2;
    let y_center = active.top + active.height() / 2;
    let x_delta = (active.width() as f32 / (2.0 * zoom)) as i32;
    let y_delta = (active.height() as f32 / (2.0 * zoom)) as i32;
    Rect::new(
        x_center - x_delta,
        y_center - y_delta,
        x_center + x_delta,
        y_center + y_delta,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE: Rect = Rect::from_size(4000, 2000);

    fn region(x: f32, y: f32, view: ViewGeometry, crop: Rect) -> Rect {
        metering_region(x, y, &view, RegionKind::Focus, &ACTIVE, &crop)
            .unwrap()
            .rect
    }

    #[test]
    fn centre_touch_maps_to_centre_of_active_array() {
        let r = region(1000.0, 1000.0, ViewGeometry::new(2000, 2000), ACTIVE);
        assert_eq!(r, Rect::new(1750, 875, 2250, 1125));
    }

    #[test]
    fn display_rotation_is_undone() {
        let view = ViewGeometry::new(2000, 2000).with_orientation(90);
        let r = region(1500.0, 1000.0, view, ACTIVE);
        assert_eq!(r, Rect::new(1750, 375, 2250, 625));
    }

    #[test]
    fn front_camera_touch_is_mirrored() {
        let view = ViewGeometry::new(2000, 2000).with_mirror(true);
        let r = region(1500.0, 1000.0, view, ACTIVE);
        assert_eq!(r, Rect::new(750, 875, 1250, 1125));
    }

    #[test]
    fn zoomed_crop_scales_and_offsets_the_region() {
        let crop = crop_region_for_zoom(&ACTIVE, 2.0);
        assert_eq!(crop, Rect::new(1000, 500, 3000, 1500));
        let r = region(1000.0, 1000.0, ViewGeometry::new(2000, 2000), crop);
        assert_eq!(r, Rect::new(1875, 937, 2125, 1062));
    }

    #[test]
    fn corner_touch_is_clamped_to_the_crop() {
        let r = region(0.0, 0.0, ViewGeometry::new(2000, 2000), ACTIVE);
        assert_eq!(r, Rect::new(0, 0, 250, 125));
    }

    #[test]
    fn exposure_box_is_wider_than_focus_box() {
        let view = ViewGeometry::new(2000, 2000);
        let af = metering_region(1000.0, 1000.0, &view, RegionKind::Focus, &ACTIVE, &ACTIVE)
            .unwrap();
        let ae = metering_region(1000.0, 1000.0, &view, RegionKind::Exposure, &ACTIVE, &ACTIVE)
            .unwrap();
        // 250px and 375px squares in view space, doubled horizontally.
        assert_eq!(af.rect.width(), 500);
        assert_eq!(ae.rect.width(), 748);
        assert_eq!(ae.weight, 1);
    }

    #[test]
    fn clamping_an_in_bounds_rect_is_idempotent() {
        let crop = Rect::new(100, 100, 900, 700);
        for r in [
            Rect::new(100, 100, 900, 700),
            Rect::new(200, 150, 300, 250),
            Rect::new(899, 699, 900, 700),
        ] {
            assert_eq!(r.clamp_to(&crop), r);
            assert_eq!(r.clamp_to(&crop).clamp_to(&crop), r);
        }
        let outside = Rect::new(-50, 50, 1000, 800);
        let once = outside.clamp_to(&crop);
        assert_eq!(once, Rect::new(100, 100, 900, 700));
        assert_eq!(once.clamp_to(&crop), once);
    }

    #[test]
    fn degenerate_view_yields_no_region() {
        let view = ViewGeometry::new(0, 0);
        assert!(metering_region(0.0, 0.0, &view, RegionKind::Focus, &ACTIVE, &ACTIVE).is_none());
    }

    #[test]
    fn zoom_below_one_is_treated_as_no_zoom() {
        assert_eq!(crop_region_for_zoom(&ACTIVE, 0.5), ACTIVE);
        assert_eq!(crop_region_for_zoom(&ACTIVE, f32::NAN), ACTIVE);
    }
}
