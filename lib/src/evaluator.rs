use crate::{
    features::FeatureMaps, Dims, Error, FeatureExtractor, StyleTransferLoss, BGR_MEANS,
};
use log::debug;
use tch::{Device, Kind, Tensor};

/// The loss at a point and its gradient with respect to that point
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub gradient: Vec<f64>,
}

/// A differentiable scalar function over a flat parameter buffer.
///
/// Loss and gradient always come from the same call, so there is no way to
/// observe one without the other.
pub trait Objective {
    fn evaluate(&mut self, x: &[f64]) -> Result<Evaluation, Error>;
}

/// Evaluates the style transfer loss for a flat combination image.
///
/// The most recent evaluation is cached, keyed by the input buffer itself, so
/// asking about the same point twice only runs the network once.
pub struct Evaluator<'a, E: FeatureExtractor + ?Sized> {
    extractor: &'a E,
    content: &'a Tensor,
    style: &'a Tensor,
    loss: &'a StyleTransferLoss,
    dims: Dims,
    mean_centered: bool,
    cache: Option<(Vec<f64>, Evaluation)>,
    evaluations: usize,
}

impl<'a, E: FeatureExtractor + ?Sized> Evaluator<'a, E> {
    /// `content` and `style` are the preprocessed `[1, height, width, 3]`
    /// input images
    pub fn new(
        extractor: &'a E,
        content: &'a Tensor,
        style: &'a Tensor,
        loss: &'a StyleTransferLoss,
        dims: Dims,
    ) -> Self {
        Self {
            extractor,
            content,
            style,
            loss,
            dims,
            mean_centered: false,
            cache: None,
            evaluations: 0,
        }
    }

    /// Marks the content, style and combination images as mean-centered. The
    /// means are added back before the images reach the extractor, which
    /// always sees the `0-255` pixel scale.
    pub fn mean_centered(mut self, enabled: bool) -> Self {
        self.mean_centered = enabled;
        self
    }

    /// The number of forward/backward passes run so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn loss(&mut self, x: &[f64]) -> Result<f64, Error> {
        Ok(self.evaluate(x)?.loss)
    }

    /// The gradient at `x`, shaped `[1, height, width, 3]`
    pub fn grads(&mut self, x: &[f64]) -> Result<Tensor, Error> {
        let evaluation = self.evaluate(x)?;
        Ok(Tensor::f_from_slice(&evaluation.gradient)?.f_view([
            1,
            i64::from(self.dims.height),
            i64::from(self.dims.width),
            3,
        ])?)
    }

    fn pixel_count(&self) -> usize {
        self.dims.width as usize * self.dims.height as usize * 3
    }

    /// The activations of every layer the loss uses, for the content, style
    /// and `x` batch
    pub fn features(&self, x: &[f64]) -> Result<FeatureMaps, Error> {
        self.extract(&self.combination(x)?)
    }

    fn combination(&self, x: &[f64]) -> Result<Tensor, Error> {
        if x.len() != self.pixel_count() {
            return Err(Error::BufferSize {
                expected: self.pixel_count(),
                actual: x.len(),
            });
        }

        Ok(Tensor::f_from_slice(x)?
            .f_to_kind(Kind::Float)?
            .f_view([
                1,
                i64::from(self.dims.height),
                i64::from(self.dims.width),
                3,
            ])?
            .detach()
            .set_requires_grad(true))
    }

    fn extract(&self, combination: &Tensor) -> Result<FeatureMaps, Error> {
        let mut batch = Tensor::f_cat(&[self.content, self.style, combination], 0)?;

        if self.mean_centered {
            let means = Tensor::f_from_slice(&BGR_MEANS)?
                .f_view([1, 1, 1, 3])?
                .f_to_device(batch.device())?;
            batch = batch.f_add(&means)?;
        }

        self.extractor.extract(&batch, &self.loss.layers())
    }

    fn forward_backward(&mut self, x: &[f64]) -> Result<Evaluation, Error> {
        let combination = self.combination(x)?;
        let features = self.extract(&combination)?;

        let terms = self.loss.compute_terms(&features, &combination)?;
        terms.total()?.backward();

        let gradient = combination
            .grad()
            .f_to_device(Device::Cpu)?
            .f_to_kind(Kind::Double)?
            .f_flatten(0, -1)?;
        let gradient = Vec::<f64>::try_from(&gradient)?;

        let breakdown = terms.breakdown()?;
        self.evaluations += 1;

        debug!(
            "evaluation {}: loss {:.6e} (content {:.6e}, style {:.6e}, variation {:.6e})",
            self.evaluations,
            breakdown.total,
            breakdown.content,
            breakdown.style,
            breakdown.total_variation
        );

        Ok(Evaluation {
            loss: breakdown.total,
            gradient,
        })
    }
}

impl<'a, E: FeatureExtractor + ?Sized> Objective for Evaluator<'a, E> {
    fn evaluate(&mut self, x: &[f64]) -> Result<Evaluation, Error> {
        if let Some((ref point, ref evaluation)) = self.cache {
            if point.as_slice() == x {
                return Ok(evaluation.clone());
            }
        }

        let evaluation = self.forward_backward(x)?;
        self.cache = Some((x.to_vec(), evaluation.clone()));

        Ok(evaluation)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{features::PoolingExtractor, LossWeights, DEFAULT_STYLE_LAYERS};

    const DIM: u32 = 16;

    struct Fixture {
        extractor: PoolingExtractor,
        content: Tensor,
        style: Tensor,
        loss: StyleTransferLoss,
    }

    impl Fixture {
        fn new() -> Self {
            let dims = Dims::square(DIM);
            let extractor = PoolingExtractor::new();
            let placeholder = Tensor::zeros([1, 16, 16, 3], (Kind::Float, Device::Cpu))
                .set_requires_grad(true);
            let loss = StyleTransferLoss::new(
                &extractor,
                &placeholder,
                dims,
                DEFAULT_STYLE_LAYERS.iter().map(|l| (*l).to_owned()).collect(),
                LossWeights::default(),
                2,
            )
            .unwrap();

            Self {
                content: Tensor::full([1, 16, 16, 3], 100.0, (Kind::Float, Device::Cpu)),
                style: Tensor::rand([1, 16, 16, 3], (Kind::Float, Device::Cpu)) * 255.0,
                extractor,
                loss,
            }
        }

        fn evaluator(&self) -> Evaluator<'_, PoolingExtractor> {
            Evaluator::new(
                &self.extractor,
                &self.content,
                &self.style,
                &self.loss,
                Dims::square(DIM),
            )
        }
    }

    fn point(seed: u64) -> Vec<f64> {
        (0..DIM as u64 * DIM as u64 * 3)
            .map(|i| ((i * 31 + seed * 17) % 255) as f64)
            .collect()
    }

    #[test]
    fn loss_then_grads_evaluates_once() {
        let fixture = Fixture::new();
        let mut evaluator = fixture.evaluator();
        let x = point(1);

        let loss = evaluator.loss(&x).unwrap();
        let grads = evaluator.grads(&x).unwrap();

        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(grads.size(), vec![1, 16, 16, 3]);
        assert_eq!(evaluator.evaluations(), 1);
        assert_eq!(fixture.extractor.calls.get(), 1);
    }

    #[test]
    fn grads_without_loss_is_fresh() {
        let fixture = Fixture::new();
        let mut evaluator = fixture.evaluator();
        let (a, b) = (point(1), point(2));

        let loss_a = evaluator.loss(&a).unwrap();
        let grads_b = evaluator.grads(&b).unwrap();
        assert_eq!(evaluator.evaluations(), 2);

        // the gradient is for `b`, not a stale one left over from `a`
        let fresh = evaluator.evaluate(&b).unwrap();
        assert_eq!(evaluator.evaluations(), 2);
        assert_eq!(
            Vec::<f64>::try_from(&grads_b.flatten(0, -1)).unwrap(),
            fresh.gradient
        );

        let again = evaluator.evaluate(&a).unwrap();
        assert_eq!(evaluator.evaluations(), 3);
        assert_eq!(again.loss, loss_a);
    }

    #[test]
    fn gradient_points_downhill() {
        let fixture = Fixture::new();
        let mut evaluator = fixture.evaluator();
        let x = point(3);

        let start = evaluator.evaluate(&x).unwrap();
        assert_eq!(start.gradient.len(), x.len());
        assert!(start.gradient.iter().all(|g| g.is_finite()));

        let norm = start.gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
        let step = 1.0 / norm.max(1e-12);
        let moved: Vec<f64> = x
            .iter()
            .zip(&start.gradient)
            .map(|(x, g)| x - step * g)
            .collect();

        assert!(evaluator.loss(&moved).unwrap() < start.loss);
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let fixture = Fixture::new();
        let mut evaluator = fixture.evaluator();

        assert!(matches!(
            evaluator.evaluate(&[0.0; 10]),
            Err(Error::BufferSize { actual: 10, .. })
        ));
    }
}
