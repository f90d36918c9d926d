use image::imageops::FilterType;

pub const SAMPLE_SIZE: u32 = 224;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpg", "image/jpeg", "image/png"];

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Invalid image file")]
    Decode(#[from] image::ImageError),
    #[error("sample data has {actual} values, expected {expected} for {width}x{height} RGB")]
    Shape {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// RGB pixel intensities, row-major and channel-interleaved.
///
/// Samples decoded from uploads hold values in 0..=255. The classifier
/// adapter also accepts samples already scaled to 0..=1.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSample {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ImageSample {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, SampleError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(SampleError::Shape {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn pixels(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        self.data.chunks_exact(3).map(|px| [px[0], px[1], px[2]])
    }

    pub fn pixel_count(&self) -> usize {
        self.data.len() / 3
    }
}

/// Decodes uploaded bytes, converts to RGB and resizes to exactly 224x224.
pub fn decode_upload(bytes: &[u8]) -> Result<ImageSample, SampleError> {
    let img = image::load_from_memory(bytes)?;
    let rgb = img.to_rgb8();

    let resized = if rgb.dimensions() == (SAMPLE_SIZE, SAMPLE_SIZE) {
        rgb
    } else {
        image::imageops::resize(&rgb, SAMPLE_SIZE, SAMPLE_SIZE, FilterType::CatmullRom)
    };

    let (width, height) = resized.dimensions();
    let data = resized.into_raw().into_iter().map(f32::from).collect();
    ImageSample::new(width, height, data)
}

pub fn is_allowed_content_type(content_type: Option<&str>) -> bool {
    content_type.map_or(false, |ct| ALLOWED_CONTENT_TYPES.contains(&ct))
}
