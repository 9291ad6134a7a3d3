//! Host-side mirror of the kernel parameter buffer.
//!
//! The kernel reads its parameters from a tightly packed array of
//! little-endian `f32`:
//!
//! - viewport layout: `[cursor.x, cursor.y, origin.x, origin.y, zoom.x, zoom.y]`
//! - control-point layout: `[p0.x, p0.y, .., pn.x, pn.y, zoom.x, zoom.y, origin.x, origin.y]`
//!
//! The cursor and origin are in output pixels. Control points are already
//! complex-plane coordinates.

use serde::{Deserialize, Serialize};

use crate::model::Complex;

/// Width of the complex plane across the longer output side at zoom 1.
pub const VIEW_SPAN: f32 = 4.0;

/// Floats in the viewport layout.
pub const VIEWPORT_FLOATS: usize = 6;

/// Floats trailing the points in the control-point layout (zoom, origin).
pub const CONTROL_POINT_TAIL_FLOATS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ParameterLayout {
    Viewport,
    ControlPoints { count: u32 },
}

impl ParameterLayout {
    pub fn float_count(&self) -> usize {
        match self {
            Self::Viewport => VIEWPORT_FLOATS,
            Self::ControlPoints { count } => 2 * *count as usize + CONTROL_POINT_TAIL_FLOATS,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.float_count() * std::mem::size_of::<f32>()
    }

    /// Value of the kernel's `control_point_count` override.
    pub fn control_point_count(&self) -> u32 {
        match self {
            Self::Viewport => 0,
            Self::ControlPoints { count } => *count,
        }
    }
}

impl std::fmt::Display for ParameterLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Viewport => f.write_str("viewport"),
            Self::ControlPoints { count } => write!(f, "{count} control points"),
        }
    }
}

/// Cursor, origin and zoom for the viewport layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ViewParameters {
    pub cursor: [f32; 2],
    pub origin: [f32; 2],
    pub zoom: [f32; 2],
}

impl ViewParameters {
    pub fn new(cursor: [f32; 2], origin: [f32; 2], zoom: [f32; 2]) -> Self {
        Self {
            cursor,
            origin,
            zoom,
        }
    }

    /// Complex coordinate the kernel assigns to `pixel`.
    pub fn pixel_to_complex(&self, pixel: [f32; 2], extent: crate::Extent) -> Complex {
        let longest = extent.width.max(extent.height).max(1) as f32;
        let half = [extent.width as f32 * 0.5, extent.height as f32 * 0.5];
        [
            (pixel[0] - half[0] - self.origin[0]) * VIEW_SPAN * self.zoom[0] / longest,
            (pixel[1] - half[1] - self.origin[1]) * VIEW_SPAN * self.zoom[1] / longest,
        ]
    }

    /// Rescales pixel-space coordinates after the output changes size.
    pub fn rescaled(&self, from: crate::Extent, to: crate::Extent) -> Self {
        if from.is_empty() || to.is_empty() {
            return *self;
        }
        let sx = to.width as f32 / from.width as f32;
        let sy = to.height as f32 / from.height as f32;
        Self {
            cursor: [self.cursor[0] * sx, self.cursor[1] * sy],
            origin: [self.origin[0] * sx, self.origin[1] * sy],
            zoom: self.zoom,
        }
    }
}

impl Default for ViewParameters {
    /// View used for cached snapshots.
    fn default() -> Self {
        Self::new([384.0, 256.0], [0.0, 0.0], [1.0, 1.0])
    }
}

/// Parameters for one dispatch, in either layout.
#[derive(Clone, Debug, PartialEq)]
pub enum Parameters {
    View(ViewParameters),
    ControlPoints {
        points: Vec<Complex>,
        zoom: [f32; 2],
        origin: [f32; 2],
    },
}

impl Parameters {
    pub fn layout(&self) -> ParameterLayout {
        match self {
            Self::View(_) => ParameterLayout::Viewport,
            Self::ControlPoints { points, .. } => ParameterLayout::ControlPoints {
                count: points.len() as u32,
            },
        }
    }
}

impl From<ViewParameters> for Parameters {
    fn from(view: ViewParameters) -> Self {
        Self::View(view)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParameterError {
    #[error("parameters of layout {found} written to a {expected} buffer")]
    LayoutMismatch {
        expected: ParameterLayout,
        found: ParameterLayout,
    },
}

/// Packed parameter values for one variant, in wire order.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterBlock {
    layout: ParameterLayout,
    values: Vec<f32>,
}

impl ParameterBlock {
    /// A zero-filled block sized for `layout`.
    pub fn new(layout: ParameterLayout) -> Self {
        Self {
            layout,
            values: vec![0.0; layout.float_count()],
        }
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn write(&mut self, parameters: &Parameters) -> Result<(), ParameterError> {
        match parameters {
            Parameters::View(view) => self.write_viewport(view),
            Parameters::ControlPoints {
                points,
                zoom,
                origin,
            } => self.write_control_points(points, *zoom, *origin),
        }
    }

    pub fn write_viewport(&mut self, view: &ViewParameters) -> Result<(), ParameterError> {
        self.expect_layout(ParameterLayout::Viewport)?;
        let floats = bytemuck::cast_slice::<ViewParameters, f32>(std::slice::from_ref(view));
        self.values.copy_from_slice(floats);
        Ok(())
    }

    pub fn write_control_points(
        &mut self,
        points: &[Complex],
        zoom: [f32; 2],
        origin: [f32; 2],
    ) -> Result<(), ParameterError> {
        self.expect_layout(ParameterLayout::ControlPoints {
            count: points.len() as u32,
        })?;
        let split = 2 * points.len();
        self.values[..split].copy_from_slice(bytemuck::cast_slice(points));
        self.values[split..split + 2].copy_from_slice(&zoom);
        self.values[split + 2..].copy_from_slice(&origin);
        Ok(())
    }

    /// Little-endian bytes exactly as the kernel reads them.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    /// The viewport fields, when this block uses the viewport layout.
    pub fn view(&self) -> Option<ViewParameters> {
        match self.layout {
            ParameterLayout::Viewport => Some(ViewParameters::new(
                [self.values[0], self.values[1]],
                [self.values[2], self.values[3]],
                [self.values[4], self.values[5]],
            )),
            ParameterLayout::ControlPoints { .. } => None,
        }
    }

    fn expect_layout(&self, found: ParameterLayout) -> Result<(), ParameterError> {
        if found == self.layout {
            return Ok(());
        }
        debug_assert!(
            false,
            "parameter layout mismatch: buffer is {}, write is {found}",
            self.layout
        );
        Err(ParameterError::LayoutMismatch {
            expected: self.layout,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_block_packs_six_floats_in_order() {
        let mut block = ParameterBlock::new(ParameterLayout::Viewport);
        block
            .write_viewport(&ViewParameters::new([10.0, 20.0], [0.0, 0.0], [1.5, 1.5]))
            .unwrap();

        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), 24);
        let decoded: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        assert_eq!(decoded, vec![10.0, 20.0, 0.0, 0.0, 1.5, 1.5]);

        assert_eq!(block.view().unwrap().cursor, [10.0, 20.0]);
    }

    #[test]
    fn control_point_block_places_zoom_before_origin() {
        let layout = ParameterLayout::ControlPoints { count: 2 };
        let mut block = ParameterBlock::new(layout);
        block
            .write_control_points(&[[1.0, 2.0], [3.0, 4.0]], [5.0, 6.0], [7.0, 8.0])
            .unwrap();
        assert_eq!(block.values(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(layout.byte_len(), 32);
        assert_eq!(block.view(), None);
    }

    #[test]
    fn rescaling_follows_output_size() {
        let view = ViewParameters::new([100.0, 50.0], [10.0, -10.0], [2.0, 2.0]);
        let scaled = view.rescaled(crate::Extent::new(200, 100), crate::Extent::new(400, 50));
        assert_eq!(scaled.cursor, [200.0, 25.0]);
        assert_eq!(scaled.origin, [20.0, -5.0]);
        assert_eq!(scaled.zoom, [2.0, 2.0]);
        assert_eq!(view.rescaled(crate::Extent::new(0, 100), crate::Extent::new(1, 1)), view);
    }

    #[test]
    fn pixel_mapping_centres_the_view() {
        let extent = crate::Extent::new(400, 200);
        let view = ViewParameters::new([0.0, 0.0], [0.0, 0.0], [1.0, 1.0]);
        assert_eq!(view.pixel_to_complex([200.0, 100.0], extent), [0.0, 0.0]);
        assert_eq!(view.pixel_to_complex([400.0, 100.0], extent), [2.0, 0.0]);

        let zoomed = ViewParameters::new([0.0, 0.0], [100.0, 0.0], [0.5, 0.5]);
        assert_eq!(zoomed.pixel_to_complex([300.0, 100.0], extent), [0.0, 0.0]);
        assert_eq!(zoomed.pixel_to_complex([400.0, 100.0], extent), [0.5, 0.0]);
    }

    #[test]
    fn default_view_matches_snapshot_defaults() {
        let view = ViewParameters::default();
        assert_eq!(view.cursor, [384.0, 256.0]);
        assert_eq!(view.origin, [0.0, 0.0]);
        assert_eq!(view.zoom, [1.0, 1.0]);
    }

    #[test]
    fn parameters_report_their_layout() {
        assert_eq!(
            Parameters::from(ViewParameters::default()).layout(),
            ParameterLayout::Viewport
        );
        let points = Parameters::ControlPoints {
            points: vec![[0.0, 0.0]; 3],
            zoom: [1.0, 1.0],
            origin: [0.0, 0.0],
        };
        assert_eq!(points.layout(), ParameterLayout::ControlPoints { count: 3 });
        assert_eq!(points.layout().float_count(), 10);
    }
}
