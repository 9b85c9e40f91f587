// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer, which repaints
//! the structure of one image with the textures and colors of another.
//!
//! A pretrained VGG16 network extracts features from the content image, the
//! style image, and the image being generated. The generated image starts out
//! as noise and is optimized with L-BFGS against a weighted sum of three
//! losses:
//!
//! 1. Content loss, the distance between content and generated features at a
//!    single layer
//! 2. Style loss, the distance between the Gram matrices of style and
//!    generated features at several layers
//! 3. Total variation loss, which keeps neighboring pixels similar
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you chain functions together.
//!
//! ```no_run
//! use neural_style::{Dims, Lbfgs, Session, Vgg16, Weights};
//!
//! // The ImageNet weights, as distributed with tch-rs
//! let vgg = Vgg16::new(Weights::Pretrained("vgg16.ot".into())).expect("failed to load vgg16");
//!
//! // Create a new session with default parameters
//! let session = Session::builder()
//!     // Set some parameters
//!     .output_size(Dims::square(256))
//!     .abstract_factor(4)
//!     // Specify the input images
//!     .content(&"imgs/content.jpg")
//!     .style(&"imgs/style.jpg")
//!     // Build the session
//!     .build(vgg)
//!     .expect("failed to build session");
//!
//! // Generate a new image
//! let generated = session
//!     .run(&mut Lbfgs::default(), None)
//!     .expect("failed to transfer style");
//!
//! // Save the generated image to disk, always as a PNG
//! generated.save("out/styled.png").expect("failed to save generated image");
//! ```
mod errors;
mod evaluator;
mod features;
mod loss;
mod optim;
pub mod session;
mod utils;

pub use image;
use std::path::Path;

pub use errors::{Error, InvalidRange};
pub use evaluator::{Evaluation, Evaluator, Objective};
pub use features::{FeatureExtractor, FeatureMaps, LayerInfo, Vgg16, Weights};
pub use loss::{
    content_loss, gram_matrix, style_loss, total_variation_loss, LossBreakdown, LossTerms,
    LossWeights, StyleTransferLoss, DEFAULT_STYLE_LAYERS, STYLE_CHANNELS,
};
pub use optim::{Lbfgs, Minimizer, Minimum};
pub use session::{
    ProgressStat, ProgressUpdate, Session, SessionBuilder, TransferProgress,
};
pub use utils::{
    load_dynamic_image, postprocess, postprocess_and_save, preprocess, ImageSource, ImageTensor,
    BGR_MEANS,
};

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

struct Parameters {
    output_size: Dims,
    iterations: u32,
    max_evaluations: usize,
    weights: LossWeights,
    abstract_factor: u32,
    style_layers: Vec<String>,
    seed: u64,
    mean_center: bool,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            output_size: Dims::square(512),
            iterations: 10,
            max_evaluations: 20,
            weights: LossWeights::default(),
            abstract_factor: 4,
            style_layers: DEFAULT_STYLE_LAYERS.iter().map(|l| (*l).to_owned()).collect(),
            seed: 0,
            mean_center: false,
            max_thread_count: None,
        }
    }
}

/// An image generated by a `Session::run()`
pub struct GeneratedImage {
    pixels: Vec<f64>,
    dims: Dims,
    mean_centered: bool,
    loss: f64,
}

impl GeneratedImage {
    /// Saves the generated image to the specified path. The image is always
    /// encoded as a PNG, regardless of the extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let img = postprocess(&self.pixels, self.dims, self.mean_centered)?;
        utils::save_png(&img, path.as_ref())
    }

    /// Writes the generated image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let img = postprocess(&self.pixels, self.dims, self.mean_centered)?;
        Ok(image::DynamicImage::ImageRgb8(img).write_to(writer, fmt)?)
    }

    /// The raw optimized buffer, BGR and `[height, width, channel]` ordered
    pub fn pixels(&self) -> &[f64] {
        &self.pixels
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// The loss of the final image
    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// Returns the generated output image
    pub fn into_image(self) -> Result<image::DynamicImage, Error> {
        let img = postprocess(&self.pixels, self.dims, self.mean_centered)?;
        Ok(image::DynamicImage::ImageRgb8(img))
    }
}
