//! Video frame types and pixel row handling.

use bytemuck::{Pod, Zeroable};
use std::collections::BTreeMap;

use crate::error::{Result, TransitionError};

/// Supported pixel formats for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed RGB with 8 bits per channel (24 bits per pixel)
    Rgb24,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba => 4,
        }
    }
}

/// Rational time base. A timestamp of `ticks` is `ticks * num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MILLISECONDS: TimeBase = TimeBase { num: 1, den: 1000 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Converts a tick count to seconds.
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.num as f64 / self.den as f64
    }

    /// Seconds from `start` to `end`, exact for any pair of tick values.
    pub fn span_seconds(&self, start: i64, end: i64) -> f64 {
        let ticks = end as i128 - start as i128;
        ticks as f64 * self.num as f64 / self.den as f64
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

/// Properties of one input stream, known before the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub time_base: TimeBase,
}

impl StreamInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat, time_base: TimeBase) -> Self {
        Self {
            width,
            height,
            format,
            time_base,
        }
    }

    /// Width over height.
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    /// Checks that `frame` has this stream's geometry.
    pub fn check_frame(&self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height || frame.format != self.format {
            return Err(TransitionError::FrameMismatch(format!(
                "expected {}x{} {:?}, got {}x{} {:?}",
                self.width, self.height, self.format, frame.width, frame.height, frame.format
            )));
        }
        frame.check_layout()
    }
}

/// A video frame: pixel rows plus timing and opaque metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    /// Bytes per row, at least `width * bytes_per_pixel`
    pub stride: usize,
    /// Presentation timestamp in the stream time base
    pub pts: Option<i64>,
    /// Display duration in the stream time base
    pub duration: Option<i64>,
    /// Host side data, carried through to the output
    pub metadata: BTreeMap<String, String>,
    /// Raw pixel rows
    pub data: Vec<u8>,
}

impl Frame {
    /// Creates a zeroed frame with tightly packed rows.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self::with_alignment(width, height, format, 1)
    }

    /// Creates a zeroed frame whose row stride is rounded up to `align` bytes.
    pub fn with_alignment(width: u32, height: u32, format: PixelFormat, align: usize) -> Self {
        let row = width as usize * format.bytes_per_pixel();
        let align = align.max(1);
        let stride = row.div_ceil(align) * align;
        Self {
            width,
            height,
            format,
            stride,
            pts: None,
            duration: None,
            metadata: BTreeMap::new(),
            data: vec![0; stride * height as usize],
        }
    }

    /// Creates a frame from existing rows of `stride` bytes.
    pub fn from_data(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        data: Vec<u8>,
    ) -> Result<Self> {
        let frame = Self {
            width,
            height,
            format,
            stride,
            pts: None,
            duration: None,
            metadata: BTreeMap::new(),
            data,
        };
        frame.check_layout()?;
        Ok(frame)
    }

    /// Checks that `stride` covers a row and `data` holds every row.
    pub fn check_layout(&self) -> Result<()> {
        let row = self.width as usize * self.format.bytes_per_pixel();
        if self.stride < row {
            return Err(TransitionError::FrameMismatch(format!(
                "stride {} is shorter than a {} byte row",
                self.stride, row
            )));
        }
        if self.height == 0 {
            return Ok(());
        }
        let needed = self
            .stride
            .checked_mul(self.height as usize - 1)
            .and_then(|rows| rows.checked_add(row));
        match needed {
            Some(needed) if self.data.len() >= needed => Ok(()),
            needed => Err(TransitionError::FrameMismatch(format!(
                "buffer holds {} bytes, {}x{} rows with stride {} need {}",
                self.data.len(),
                self.width,
                self.height,
                self.stride,
                needed.map_or_else(|| "more".to_string(), |n| n.to_string())
            ))),
        }
    }

    /// Creates a tightly packed frame filled with one RGB color.
    pub fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut frame = Self::new(width, height, PixelFormat::Rgb24);
        for px in frame.data.chunks_exact_mut(3) {
            px.copy_from_slice(&rgb);
        }
        frame
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Visible bytes of row `y`, without stride padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.width as usize * self.format.bytes_per_pixel()]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &mut self.data[start..start + len]
    }

    /// Copies timing and metadata from `other`, leaving pixels untouched.
    pub fn copy_props_from(&mut self, other: &Frame) {
        self.pts = other.pts;
        self.duration = other.duration;
        self.metadata = other.metadata.clone();
    }

    /// Writes tightly packed RGBA texels into `out`, honoring this frame's stride.
    pub fn write_rgba_rows(&self, out: &mut Vec<u8>) {
        let width = self.width as usize;
        out.clear();
        out.reserve(width * self.height as usize * 4);
        for y in 0..self.height {
            let row = self.row(y);
            match self.format {
                PixelFormat::Rgba => out.extend_from_slice(row),
                // Fast path for RGB -> RGBA: just add alpha=255
                PixelFormat::Rgb24 => {
                    for px in row.chunks_exact(3) {
                        out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                    }
                }
            }
        }
    }

    /// Fills this frame from RGBA rows of `src_stride` bytes, honoring this frame's stride.
    pub fn read_rgba_rows(&mut self, src: &[u8], src_stride: usize) {
        let width = self.width as usize;
        for y in 0..self.height {
            let start = y as usize * src_stride;
            let texels = &src[start..start + width * 4];
            let format = self.format;
            let row = self.row_mut(y);
            match format {
                PixelFormat::Rgba => row.copy_from_slice(texels),
                PixelFormat::Rgb24 => {
                    for (dst, px) in row.chunks_exact_mut(3).zip(texels.chunks_exact(4)) {
                        dst.copy_from_slice(&px[..3]);
                    }
                }
            }
        }
    }

    /// Compares visible pixels only, ignoring stride padding.
    pub fn same_pixels(&self, other: &Frame) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.format == other.format
            && (0..self.height).all(|y| self.row(y) == other.row(y))
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
}

impl QuadVertex {
    /// Two triangles covering normalized device coordinates.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0] },
        QuadVertex { position: [1.0, -1.0] },
        QuadVertex { position: [-1.0, 1.0] },
        QuadVertex { position: [-1.0, 1.0] },
        QuadVertex { position: [1.0, -1.0] },
        QuadVertex { position: [1.0, 1.0] },
    ];

    /// Returns the vertex buffer layout with `position` at `location`.
    pub fn layout(attributes: &[wgpu::VertexAttribute]) -> wgpu::VertexBufferLayout<'_> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes,
        }
    }

    pub fn position_attribute(location: u32) -> wgpu::VertexAttribute {
        wgpu::VertexAttribute {
            offset: 0,
            shader_location: location,
            format: wgpu::VertexFormat::Float32x2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_rgba_rows_skip_padding() {
        // 2x2 RGB with 2 bytes of padding per row
        let data = vec![
            255, 0, 0, 0, 255, 0, 9, 9, //
            0, 0, 255, 255, 255, 255, 9, 9,
        ];
        let frame = Frame::from_data(2, 2, PixelFormat::Rgb24, 8, data).unwrap();
        let mut rgba = Vec::new();
        frame.write_rgba_rows(&mut rgba);

        assert_eq!(rgba.len(), 16);
        assert_eq!(&rgba[0..4], &[255, 0, 0, 255]);
        assert_eq!(&rgba[4..8], &[0, 255, 0, 255]);
        assert_eq!(&rgba[8..12], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_read_rgba_rows_into_padded_frame() {
        let src = vec![
            1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0, //
            7, 8, 9, 255, 10, 11, 12, 255, 0, 0, 0, 0,
        ];
        let mut frame = Frame::with_alignment(2, 2, PixelFormat::Rgb24, 32);
        assert_eq!(frame.stride, 32);
        frame.read_rgba_rows(&src, 12);
        assert_eq!(frame.row(0), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.row(1), &[7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_from_data_rejects_short_buffer() {
        assert!(Frame::from_data(4, 2, PixelFormat::Rgb24, 12, vec![0; 20]).is_err());
        assert!(Frame::from_data(4, 2, PixelFormat::Rgb24, 10, vec![0; 24]).is_err());
        // The last row does not need trailing padding.
        assert!(Frame::from_data(4, 2, PixelFormat::Rgb24, 16, vec![0; 28]).is_ok());
    }

    #[test]
    fn test_same_pixels_ignores_padding() {
        let tight = Frame::solid_rgb(3, 2, [10, 20, 30]);
        let mut padded = Frame::with_alignment(3, 2, PixelFormat::Rgb24, 64);
        padded.data.fill(0xAA);
        for y in 0..2 {
            padded.row_mut(y).copy_from_slice(tight.row(y));
        }
        assert!(tight.same_pixels(&padded));
    }

    #[test]
    fn test_time_base_conversion() {
        assert_eq!(TimeBase::MILLISECONDS.to_seconds(2500), 2.5);
        assert_eq!(TimeBase::new(1001, 30000).to_seconds(30), 1.001);
    }

    #[test]
    fn test_check_frame_reports_geometry() {
        let info = StreamInfo::new(4, 4, PixelFormat::Rgb24, TimeBase::MILLISECONDS);
        assert!(info.check_frame(&Frame::solid_rgb(4, 4, [0; 3])).is_ok());
        let err = info.check_frame(&Frame::solid_rgb(4, 2, [0; 3])).unwrap_err();
        assert!(err.to_string().contains("4x2"));
    }

    #[test]
    fn test_span_seconds_does_not_overflow() {
        let tb = TimeBase::MILLISECONDS;
        assert_eq!(tb.span_seconds(1000, 2500), 1.5);
        assert_eq!(tb.span_seconds(2500, 1000), -1.5);
        let span = tb.span_seconds(-10, i64::MAX);
        assert!(span.is_finite() && span > 9.2e15);
        assert!(tb.span_seconds(i64::MAX, i64::MIN) < 0.0);
    }

    #[test]
    fn test_check_frame_rejects_truncated_data() {
        let info = StreamInfo::new(64, 64, PixelFormat::Rgb24, TimeBase::MILLISECONDS);
        let mut frame = Frame::solid_rgb(64, 64, [1, 2, 3]);
        frame.data.truncate(10);
        assert!(matches!(
            info.check_frame(&frame),
            Err(TransitionError::FrameMismatch(_))
        ));
    }

    #[test]
    fn test_check_frame_rejects_short_stride() {
        let info = StreamInfo::new(4, 2, PixelFormat::Rgb24, TimeBase::MILLISECONDS);
        let mut frame = Frame::solid_rgb(4, 2, [0; 3]);
        frame.stride = 8;
        assert!(info.check_frame(&frame).is_err());
        frame.stride = usize::MAX;
        assert!(info.check_frame(&frame).is_err());
    }
}
