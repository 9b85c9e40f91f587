use crate::{Dims, Error};
use std::path::Path;
use tch::{Kind, Tensor};

/// Per-channel means subtracted by `ImageTensor::mean_centered`, in BGR order
pub const BGR_MEANS: [f32; 3] = [103.939, 116.779, 123.68];

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the preprocessor
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

pub(crate) fn load_image(src: ImageSource<'_>, size: Dims) -> Result<image::RgbImage, Error> {
    use image::GenericImageView;

    let img = load_dynamic_image(src)?;

    let img = if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img.to_rgb(),
            size.width,
            size.height,
            image::imageops::CatmullRom,
        )
    } else {
        img.to_rgb()
    };

    Ok(img)
}

/// A batch of one image laid out `[1, height, width, 3]`, with the channels
/// in BGR order and values on the `0-255` pixel scale.
pub struct ImageTensor {
    tensor: Tensor,
    dims: Dims,
    mean_centered: bool,
}

impl ImageTensor {
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn is_mean_centered(&self) -> bool {
        self.mean_centered
    }

    /// Subtracts `BGR_MEANS` from each channel. Calling this on an already
    /// centered tensor is a no-op.
    pub fn mean_centered(self) -> Self {
        if self.mean_centered {
            return self;
        }

        let means = Tensor::from_slice(&BGR_MEANS).view([1, 1, 1, 3]);
        Self {
            tensor: self.tensor - means,
            dims: self.dims,
            mean_centered: true,
        }
    }

    /// Copies the pixels out into a flat NHWC buffer, the layout used by the
    /// optimizer and by `postprocess`
    pub fn to_flat(&self) -> Result<Vec<f64>, Error> {
        let flat = self.tensor.f_flatten(0, -1)?.f_to_kind(Kind::Double)?;
        Ok(Vec::<f64>::try_from(&flat)?)
    }
}

/// Loads an image, resizes it to `dims` if needed, and converts it into a
/// BGR `ImageTensor`. No normalization is applied.
pub fn preprocess(src: ImageSource<'_>, dims: Dims) -> Result<ImageTensor, Error> {
    let img = load_image(src, dims)?;

    let pixels: Vec<f32> = img.into_raw().into_iter().map(f32::from).collect();
    let tensor = Tensor::f_from_slice(&pixels)?
        .f_view([1, i64::from(dims.height), i64::from(dims.width), 3])?
        .f_flip([3])?;

    Ok(ImageTensor {
        tensor,
        dims,
        mean_centered: false,
    })
}

/// Converts a flat BGR buffer back into an RGB image, adding the channel
/// means back first if the buffer was mean-centered. Values are clipped to
/// `0-255` and truncated.
pub fn postprocess(flat: &[f64], dims: Dims, mean_centered: bool) -> Result<image::RgbImage, Error> {
    let expected = dims.width as usize * dims.height as usize * 3;
    if flat.len() != expected {
        return Err(Error::BufferSize {
            expected,
            actual: flat.len(),
        });
    }

    let mut raw = Vec::with_capacity(expected);
    for bgr in flat.chunks_exact(3) {
        for channel in (0..3).rev() {
            let mut value = bgr[channel];
            if mean_centered {
                value += f64::from(BGR_MEANS[channel]);
            }

            raw.push(value.clamp(0.0, 255.0) as u8);
        }
    }

    image::RgbImage::from_raw(dims.width, dims.height, raw).ok_or(Error::BufferSize {
        expected,
        actual: flat.len(),
    })
}

/// Postprocesses a flat BGR buffer and writes it to `path` as a PNG, whatever
/// the extension of `path` says.
pub fn postprocess_and_save<P: AsRef<Path>>(flat: &[f64], dims: Dims, path: P) -> Result<(), Error> {
    let img = postprocess(flat, dims, false)?;
    save_png(&img, path.as_ref())
}

pub(crate) fn save_png(img: &image::RgbImage, path: &Path) -> Result<(), Error> {
    if let Some(parent_path) = path.parent() {
        if !parent_path.as_os_str().is_empty() {
            std::fs::create_dir_all(parent_path)?;
        }
    }

    img.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn checkerboard(dims: Dims) -> image::RgbImage {
        image::RgbImage::from_fn(dims.width, dims.height, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([250, 13, 77])
            } else {
                image::Rgb([0, 128, 255])
            }
        })
    }

    #[test]
    fn reverses_channels() {
        let dims = Dims::square(2);
        let red = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 0]));

        let tensor = preprocess(image::DynamicImage::ImageRgb8(red).into(), dims).unwrap();
        assert_eq!(tensor.tensor().size(), vec![1, 2, 2, 3]);

        let flat = tensor.to_flat().unwrap();
        assert_eq!(&flat[..3], &[0.0, 0.0, 255.0]);
    }

    #[test]
    fn resizes_to_requested_dims() {
        let img = image::DynamicImage::ImageRgb8(checkerboard(Dims::new(8, 5)));
        let tensor = preprocess(img.into(), Dims::square(4)).unwrap();

        assert_eq!(tensor.tensor().size(), vec![1, 4, 4, 3]);
        assert_eq!(tensor.dims(), Dims::square(4));
    }

    #[test]
    fn round_trip() {
        let dims = Dims::new(5, 3);
        let original = checkerboard(dims);

        let tensor = preprocess(image::DynamicImage::ImageRgb8(original.clone()).into(), dims)
            .unwrap();
        let restored = postprocess(&tensor.to_flat().unwrap(), dims, false).unwrap();

        assert_eq!(original.into_raw(), restored.into_raw());
    }

    #[test]
    fn mean_centered_round_trip() {
        let dims = Dims::square(3);
        let original = checkerboard(dims);

        let tensor = preprocess(image::DynamicImage::ImageRgb8(original.clone()).into(), dims)
            .unwrap()
            .mean_centered();
        assert!(tensor.is_mean_centered());

        let flat = tensor.to_flat().unwrap();
        // The first pixel is [250, 13, 77] in RGB, so 77 - 103.939 in the B slot
        assert!((flat[0] - (77.0 - 103.939)).abs() < 1e-3);

        let restored = postprocess(&flat, dims, true).unwrap();
        for (a, b) in original.into_raw().iter().zip(restored.into_raw().iter()) {
            assert!((i16::from(*a) - i16::from(*b)).abs() <= 1);
        }
    }

    #[test]
    fn clips_out_of_range_values() {
        let dims = Dims::square(1);
        let img = postprocess(&[-20.0, 300.0, 127.9], dims, false).unwrap();

        assert_eq!(img.get_pixel(0, 0), &image::Rgb([127, 255, 0]));
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        match postprocess(&[0.0; 11], Dims::square(2), false) {
            Err(Error::BufferSize { expected, actual }) => {
                assert_eq!(expected, 12);
                assert_eq!(actual, 11);
            }
            _ => panic!("expected a buffer size error"),
        }
    }

    #[test]
    fn saves_png_regardless_of_extension() {
        let dir = std::env::temp_dir().join("neural-style-utils-test");
        let path = dir.join("out.jpg");

        let flat: Vec<f64> = (0..12).map(f64::from).collect();
        postprocess_and_save(&flat, Dims::square(2), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
