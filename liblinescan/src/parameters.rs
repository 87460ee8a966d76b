use crate::geometry::ScanParameters;

/// Image layout as the client receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub format: FrameFormat,
    pub last_frame: bool,
    pub bytes_per_line: usize,
    pub pixels_per_line: usize,
    pub lines: usize,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Gray,
    RGB,
}

impl From<&ScanParameters> for Parameters {
    fn from(params: &ScanParameters) -> Self {
        Parameters {
            format: params.frame_format(),
            last_frame: true,
            bytes_per_line: params.output_bytes_per_line(),
            pixels_per_line: params.output_pixels_per_line() as usize,
            lines: params.output_lines() as usize,
            depth: params.output_depth as usize,
        }
    }
}
