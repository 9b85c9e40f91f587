use crate::*;
use log::info;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tch::{Device, Kind, Tensor};

/// Style transfer session.
///
/// Calling `run()` optimizes a noise image against the content and style
/// images and returns the result, consuming the session in the process. You
/// can provide a `TransferProgress` implementation to get an update after
/// every iteration.
///
/// # Example
/// ```no_run
/// use neural_style::{Dims, Lbfgs, Session, Vgg16, Weights};
///
/// let session = Session::builder()
///     .content(&"imgs/content.jpg")
///     .style(&"imgs/style.jpg")
///     .output_size(Dims::square(256))
///     .build(Vgg16::new(Weights::Pretrained("vgg16.ot".into())).expect("failed to load vgg16"))
///     .expect("failed to build session");
///
/// let generated = session.run(&mut Lbfgs::default(), None).expect("failed to transfer style");
/// generated.save("out/styled.png").expect("failed to save image");
/// ```
pub struct Session<E: FeatureExtractor> {
    extractor: E,
    content: ImageTensor,
    style: ImageTensor,
    loss: StyleTransferLoss,
    params: Parameters,
}

impl Session<Vgg16> {
    /// Creates a new session builder with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }
}

impl<E: FeatureExtractor> Session<E> {
    pub fn loss(&self) -> &StyleTransferLoss {
        &self.loss
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// The noise image the optimization starts from, uniformly distributed
    /// over the pixel range and fully determined by the seed
    pub fn initial_image(&self) -> Vec<f64> {
        let dims = self.params.output_size;
        let len = dims.width as usize * dims.height as usize * 3;
        let mut rng = rand_pcg::Pcg32::seed_from_u64(self.params.seed);

        let mut pixels: Vec<f64> = (0..len).map(|_| rng.gen_range(0.0..255.0)).collect();

        if self.params.mean_center {
            for bgr in pixels.chunks_exact_mut(3) {
                for (value, mean) in bgr.iter_mut().zip(BGR_MEANS.iter()) {
                    *value -= f64::from(*mean);
                }
            }
        }

        pixels
    }

    /// An evaluator for this session's loss, usable with any `Minimizer`
    pub fn evaluator(&self) -> Evaluator<'_, E> {
        Evaluator::new(
            &self.extractor,
            self.content.tensor(),
            self.style.tensor(),
            &self.loss,
            self.params.output_size,
        )
        .mean_centered(self.params.mean_center)
    }

    /// Runs the optimization for the configured number of iterations, each
    /// of which is one call to `minimizer` with the evaluation budget.
    pub fn run<M: Minimizer + ?Sized>(
        self,
        minimizer: &mut M,
        mut progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<GeneratedImage, Error> {
        let threads = self
            .params
            .max_thread_count
            .unwrap_or_else(num_cpus::get);
        tch::set_num_threads(threads as i32);

        let dims = self.params.output_size;
        let iterations = self.params.iterations;
        let mut x = self.initial_image();
        let mut loss = f64::NAN;

        info!(
            "transferring style at {}x{} for {} iterations",
            dims.width, dims.height, iterations
        );

        let mut evaluator = self.evaluator();
        let started = Instant::now();

        for iteration in 0..iterations {
            let iteration_start = Instant::now();

            let minimum = minimizer.minimize(&mut evaluator, x, self.params.max_evaluations)?;
            x = minimum.x;
            loss = minimum.loss;

            let elapsed = iteration_start.elapsed();
            info!(
                "iteration {} completed in {:.2}s, loss {:.6e}",
                iteration,
                elapsed.as_secs_f64(),
                loss
            );

            if let Some(ref mut progress) = progress {
                progress.update(ProgressUpdate {
                    iterations: ProgressStat {
                        current: iteration as usize + 1,
                        total: iterations as usize,
                    },
                    loss,
                    evaluations: minimum.evaluations,
                    elapsed,
                });
            }
        }

        info!(
            "style transfer finished in {:.2}s after {} evaluations",
            started.elapsed().as_secs_f64(),
            evaluator.evaluations()
        );

        Ok(GeneratedImage {
            pixels: x,
            dims,
            mean_centered: self.params.mean_center,
            loss,
        })
    }
}

/// Builds a session by setting parameters and adding the input images,
/// calling `build` will check all of the provided inputs to verify that
/// style transfer can run
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure is preserved
    pub fn content<I: Into<ImageSource<'a>>>(mut self, content: I) -> Self {
        self.content = Some(content.into());
        self
    }

    /// The image whose textures and colors are transferred
    pub fn style<I: Into<ImageSource<'a>>>(mut self, style: I) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Size of the generated image. Both inputs are resized to it, and it
    /// must be square.
    ///
    /// Default: 512x512
    pub fn output_size(mut self, dims: Dims) -> Self {
        self.params.output_size = dims;
        self
    }

    /// The number of times the minimizer is invoked.
    ///
    /// Default: 10
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// How many objective evaluations each iteration may use.
    ///
    /// Default: 20
    pub fn max_evaluations(mut self, count: usize) -> Self {
        self.params.max_evaluations = count;
        self
    }

    /// Weight of the content loss. Increase to keep more of the content,
    /// decrease for more style.
    ///
    /// Default: 0.05
    pub fn content_weight(mut self, value: f64) -> Self {
        self.params.weights.content = value;
        self
    }

    /// Multiplier on the summed style losses. Leaving it at 1 keeps the
    /// style term unscaled.
    ///
    /// Default: 1.0
    pub fn style_weight(mut self, value: f64) -> Self {
        self.params.weights.style = value;
        self
    }

    /// Weight of the total variation loss, which smooths the output.
    ///
    /// Default: 1.0
    pub fn total_variation_weight(mut self, value: f64) -> Self {
        self.params.weights.total_variation = value;
        self
    }

    /// The VGG block whose second convolution is used to match content,
    /// higher values give a more abstract result. Range (1-5).
    ///
    /// Default: 4
    pub fn abstract_factor(mut self, value: u32) -> Self {
        self.params.abstract_factor = value;
        self
    }

    /// The layers the style is extracted from.
    ///
    /// Default: `DEFAULT_STYLE_LAYERS`
    pub fn style_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.style_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Changes the seed of the initial noise image.
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// Subtracts the ImageNet channel means from the inputs before
    /// optimizing, and adds them back to the output.
    ///
    /// Default: false
    pub fn mean_center(mut self, enabled: bool) -> Self {
        self.params.mean_center = enabled;
        self
    }

    /// Controls the maximum number of threads libtorch uses for its kernels.
    ///
    /// Setting this number to `1` will result in completely deterministic
    /// output on the CPU, meaning that rerunning with the same inputs will
    /// always give you the same outputs.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session` around `extractor`, or returns an error if invalid
    /// parameters or input images were specified.
    pub fn build<E: FeatureExtractor>(self, extractor: E) -> Result<Session<E>, Error> {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::MissingInput("content"))?;
        let style = self.style.ok_or(Error::MissingInput("style"))?;

        let dims = self.params.output_size;
        let mut content = preprocess(content, dims)?;
        let mut style = preprocess(style, dims)?;

        if self.params.mean_center {
            content = content.mean_centered();
            style = style.mean_centered();
        }

        let placeholder = Tensor::f_zeros(
            [1, i64::from(dims.height), i64::from(dims.width), 3],
            (Kind::Float, Device::Cpu),
        )?
        .set_requires_grad(true);

        let loss = StyleTransferLoss::new(
            &extractor,
            &placeholder,
            dims,
            self.params.style_layers.clone(),
            self.params.weights,
            self.params.abstract_factor,
        )?;

        Ok(Session {
            extractor,
            content,
            style,
            loss,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let dims = self.params.output_size;
        if dims.width != dims.height {
            return Err(Error::NotSquare(dims.width, dims.height));
        }

        // the total variation loss needs at least one pixel pair
        if dims.width < 2 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 2.0,
                max: u32::MAX as f32,
                value: dims.width as f32,
                name: "size",
            }));
        }

        if self.params.max_evaluations == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: usize::MAX as f32,
                value: 0.0,
                name: "max-evaluations",
            }));
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }
}

/// Helper struct for passing progress information to external callers
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The state of the optimization after an iteration
pub struct ProgressUpdate {
    pub iterations: ProgressStat,
    /// The best loss found so far
    pub loss: f64,
    /// Objective evaluations used by the iteration
    pub evaluations: usize,
    /// Wall time spent in the iteration
    pub elapsed: Duration,
}

/// Allows the session to update external callers with the current progress
/// of the optimization
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info)
    }
}
