//! Content, style and total variation losses, and the weighted sum of them
//! that is minimized during style transfer.

use crate::{features::FeatureMaps, Dims, Error, FeatureExtractor};
use tch::{Kind, Tensor};

/// The layers style is extracted from unless told otherwise
pub const DEFAULT_STYLE_LAYERS: [&str; 5] = [
    "block1_conv2",
    "block2_conv2",
    "block3_conv2",
    "block4_conv2",
    "block5_conv2",
];

/// The channel count used in the style loss normalization
pub const STYLE_CHANNELS: i64 = 3;

/// Batch positions of the three images fed through the network together
const CONTENT_INDEX: i64 = 0;
const STYLE_INDEX: i64 = 1;
const COMBINATION_INDEX: i64 = 2;

/// The relative importance of each loss term.
///
/// The defaults weigh the summed style losses by 1, so `style` only scales
/// the objective when set explicitly.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content: f64,
    pub style: f64,
    pub total_variation: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            content: 0.05,
            style: 1.0,
            total_variation: 1.0,
        }
    }
}

/// Sum of squared differences between content and combination features
pub fn content_loss(content: &Tensor, combination: &Tensor) -> Result<Tensor, Error> {
    Ok(content
        .f_sub(combination)?
        .f_square()?
        .f_sum(Kind::Float)?)
}

/// Inner products between the flattened channels of a `[height, width,
/// channels]` feature map, giving a `[channels, channels]` matrix.
pub fn gram_matrix(x: &Tensor) -> Result<Tensor, Error> {
    let features = x.f_permute([2, 0, 1])?.f_flatten(1, -1)?;
    Ok(features.f_matmul(&features.f_transpose(0, 1)?)?)
}

/// Squared distance between the Gram matrices of the style and combination
/// features, normalized by the *image* size (not the layer's).
pub fn style_loss(
    style: &Tensor,
    combination: &Tensor,
    dims: Dims,
    channels: i64,
) -> Result<Tensor, Error> {
    let s = gram_matrix(style)?;
    let c = gram_matrix(combination)?;

    let size = f64::from(dims.height) * f64::from(dims.width);
    let channels = channels as f64;

    Ok(s
        .f_sub(&c)?
        .f_square()?
        .f_sum(Kind::Float)?
        .f_div_scalar(4.0 * channels.powi(2) * size.powi(2))?)
}

/// Smoothness penalty over a `[batch, height, width, channels]` image:
/// `sum((dy^2 + dx^2)^1.25)` using forward differences. The last row and
/// column only take part as the neighbours of their predecessors.
pub fn total_variation_loss(x: &Tensor, dims: Dims) -> Result<Tensor, Error> {
    let h = i64::from(dims.height);
    let w = i64::from(dims.width);

    let origin = x.f_narrow(1, 0, h - 1)?.f_narrow(2, 0, w - 1)?;
    let below = x.f_narrow(1, 1, h - 1)?.f_narrow(2, 0, w - 1)?;
    let right = x.f_narrow(1, 0, h - 1)?.f_narrow(2, 1, w - 1)?;

    let a = origin.f_sub(&below)?.f_square()?;
    let b = origin.f_sub(&right)?.f_square()?;

    Ok(a.f_add(&b)?.f_pow_tensor_scalar(1.25)?.f_sum(Kind::Float)?)
}

/// The scalar values of each weighted loss term
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossBreakdown {
    pub content: f64,
    pub style: f64,
    pub total_variation: f64,
    pub total: f64,
}

/// The weighted loss terms of a single evaluation, still attached to the
/// autograd graph
pub struct LossTerms {
    pub content: Tensor,
    pub style: Tensor,
    pub total_variation: Tensor,
}

impl LossTerms {
    pub fn total(&self) -> Result<Tensor, Error> {
        Ok(self
            .content
            .f_add(&self.style)?
            .f_add(&self.total_variation)?)
    }

    pub fn breakdown(&self) -> Result<LossBreakdown, Error> {
        let content = self.content.f_double_value(&[])?;
        let style = self.style.f_double_value(&[])?;
        let total_variation = self.total_variation.f_double_value(&[])?;

        Ok(LossBreakdown {
            content,
            style,
            total_variation,
            total: content + style + total_variation,
        })
    }
}

/// The complete style transfer objective for one configuration.
///
/// Features are expected in a batch of 3: content, style, combination.
pub struct StyleTransferLoss {
    dims: Dims,
    content_layer: String,
    style_layers: Vec<String>,
    weights: LossWeights,
}

impl StyleTransferLoss {
    /// Validates the configuration against the layers `extractor` exposes.
    ///
    /// `combination` is the image being optimized, or a placeholder of the
    /// same shape: `[1, height, width, 3]`, floating point, tracking
    /// gradients.
    pub fn new<E: FeatureExtractor + ?Sized>(
        extractor: &E,
        combination: &Tensor,
        dims: Dims,
        style_layers: Vec<String>,
        weights: LossWeights,
        abstract_factor: u32,
    ) -> Result<Self, Error> {
        if !(1..=5).contains(&abstract_factor) {
            return Err(Error::InvalidRange(crate::errors::InvalidRange {
                min: 1.0,
                max: 5.0,
                value: abstract_factor as f32,
                name: "abstract-factor",
            }));
        }

        if style_layers.is_empty() {
            return Err(Error::NoStyleLayers);
        }

        let content_layer = Self::content_layer_name(abstract_factor);

        for layer in style_layers.iter().chain(std::iter::once(&content_layer)) {
            if !extractor.has_layer(layer) {
                return Err(Error::UnknownLayer(layer.clone()));
            }
        }

        let loss = Self {
            dims,
            content_layer,
            style_layers,
            weights,
        };

        loss.check_combination(combination)?;

        Ok(loss)
    }

    /// The layer content is matched at, deeper layers give a more abstract
    /// result
    pub fn content_layer_name(abstract_factor: u32) -> String {
        format!("block{}_conv2", abstract_factor)
    }

    pub fn content_layer(&self) -> &str {
        &self.content_layer
    }

    pub fn style_layers(&self) -> &[String] {
        &self.style_layers
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }

    /// Every layer that needs to be extracted, without duplicates
    pub fn layers(&self) -> Vec<&str> {
        let mut layers: Vec<&str> = self.style_layers.iter().map(String::as_str).collect();
        if !layers.contains(&self.content_layer.as_str()) {
            layers.push(&self.content_layer);
        }
        layers
    }

    pub fn check_combination(&self, combination: &Tensor) -> Result<(), Error> {
        let expected = vec![1, i64::from(self.dims.height), i64::from(self.dims.width), 3];
        let size = combination.size();

        if size != expected {
            return Err(Error::InvalidCombination(format!(
                "expected shape {:?}, got {:?}",
                expected, size
            )));
        }

        if !matches!(
            combination.kind(),
            Kind::Half | Kind::BFloat16 | Kind::Float | Kind::Double
        ) {
            return Err(Error::InvalidCombination(format!(
                "expected a floating point tensor, got {:?}",
                combination.kind()
            )));
        }

        if !combination.requires_grad() {
            return Err(Error::InvalidCombination(
                "the tensor doesn't track gradients".to_owned(),
            ));
        }

        Ok(())
    }

    fn layer<'f>(features: &'f FeatureMaps, name: &str) -> Result<&'f Tensor, Error> {
        features
            .get(name)
            .ok_or_else(|| Error::UnknownLayer(name.to_owned()))
    }

    /// Weighted content loss between batch entries 0 and 2 of the content
    /// layer
    pub fn content_loss(&self, features: &FeatureMaps) -> Result<Tensor, Error> {
        let layer = Self::layer(features, &self.content_layer)?;
        let content = layer.f_select(0, CONTENT_INDEX)?;
        let combination = layer.f_select(0, COMBINATION_INDEX)?;

        Ok(content_loss(&content, &combination)?.f_mul_scalar(self.weights.content)?)
    }

    /// Style loss between batch entries 1 and 2 of one layer, scaled by the
    /// style weight
    pub fn style_loss(&self, features: &FeatureMaps, layer_name: &str) -> Result<Tensor, Error> {
        let layer = Self::layer(features, layer_name)?;
        let style = layer.f_select(0, STYLE_INDEX)?;
        let combination = layer.f_select(0, COMBINATION_INDEX)?;

        Ok(style_loss(&style, &combination, self.dims, STYLE_CHANNELS)?
            .f_mul_scalar(self.weights.style)?)
    }

    pub fn compute_terms(
        &self,
        features: &FeatureMaps,
        combination: &Tensor,
    ) -> Result<LossTerms, Error> {
        let content = self.content_loss(features)?;

        let mut style: Option<Tensor> = None;
        for layer in &self.style_layers {
            let term = self.style_loss(features, layer)?;
            style = Some(match style {
                Some(sum) => sum.f_add(&term)?,
                None => term,
            });
        }
        let style = style.ok_or(Error::NoStyleLayers)?;

        let total_variation = total_variation_loss(combination, self.dims)?
            .f_mul_scalar(self.weights.total_variation)?;

        Ok(LossTerms {
            content,
            style,
            total_variation,
        })
    }

    /// The scalar loss to minimize
    pub fn compute_loss(&self, features: &FeatureMaps, combination: &Tensor) -> Result<Tensor, Error> {
        self.compute_terms(features, combination)?.total()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::features::PoolingExtractor;
    use tch::Device;

    const OPTS: (Kind, Device) = (Kind::Float, Device::Cpu);

    fn value(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    fn placeholder(dims: Dims) -> Tensor {
        Tensor::zeros(
            [1, i64::from(dims.height), i64::from(dims.width), 3],
            OPTS,
        )
        .set_requires_grad(true)
    }

    fn default_layers() -> Vec<String> {
        DEFAULT_STYLE_LAYERS.iter().map(|l| (*l).to_owned()).collect()
    }

    #[test]
    fn gram_is_symmetric() {
        let x = Tensor::randn([5, 7, 6], OPTS);
        let gram = gram_matrix(&x).unwrap();

        assert_eq!(gram.size(), vec![6, 6]);
        let asymmetry = value(&(&gram - gram.tr()).abs().max());
        assert!(asymmetry < 1e-3, "asymmetry {}", asymmetry);
    }

    #[test]
    fn gram_known_values() {
        // a 1x2 map with 2 channels: pixel 0 = [1, 2], pixel 1 = [3, 4]
        let x = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).view([1, 2, 2]);
        let gram = gram_matrix(&x).unwrap();

        let flat = Vec::<f32>::try_from(&gram.flatten(0, -1)).unwrap();
        assert_eq!(flat, vec![10.0, 14.0, 14.0, 20.0]);
    }

    #[test]
    fn content_loss_is_sum_of_squares() {
        let a = Tensor::ones([2, 2, 3], OPTS);
        let b = Tensor::zeros([2, 2, 3], OPTS);

        assert_eq!(value(&content_loss(&a, &b).unwrap()), 12.0);
        assert_eq!(value(&content_loss(&a, &a).unwrap()), 0.0);
    }

    #[test]
    fn style_loss_normalization() {
        let style = Tensor::full([1, 1, 1], 2.0, OPTS);
        let combination = Tensor::full([1, 1, 1], 1.0, OPTS);

        // (4 - 1)^2 / (4 * 3^2 * (2 * 2)^2)
        let loss = value(&style_loss(&style, &combination, Dims::square(2), 3).unwrap());
        assert!((loss - 9.0 / 576.0).abs() < 1e-7);
    }

    #[test]
    fn total_variation_of_constant_image() {
        let x = Tensor::full([1, 8, 8, 3], 93.0, OPTS);
        assert_eq!(value(&total_variation_loss(&x, Dims::square(8)).unwrap()), 0.0);
    }

    #[test]
    fn total_variation_of_varying_image() {
        let x = Tensor::arange(16, OPTS).view([1, 4, 4, 1]);
        assert!(value(&total_variation_loss(&x, Dims::square(4)).unwrap()) > 0.0);
    }

    #[test]
    fn total_variation_exponent() {
        // origin 0, the pixel below is 1 and the one to the right is 2
        let x = Tensor::from_slice(&[0.0f32, 2.0, 1.0, 9.0]).view([1, 2, 2, 1]);
        let tv = value(&total_variation_loss(&x, Dims::square(2)).unwrap());

        assert!((tv - 5f64.powf(1.25)).abs() < 1e-4);
    }

    #[test]
    fn solid_color_losses_are_finite() {
        let dims = Dims::square(16);
        let extractor = PoolingExtractor::new();
        let loss = StyleTransferLoss::new(
            &extractor,
            &placeholder(dims),
            dims,
            default_layers(),
            LossWeights::default(),
            4,
        )
        .unwrap();

        let content = Tensor::full([1, 16, 16, 3], 128.0, OPTS);
        let style = Tensor::full([1, 16, 16, 3], 40.0, OPTS);
        let combination = (Tensor::rand([1, 16, 16, 3], OPTS) * 255.0).set_requires_grad(true);

        let batch = Tensor::cat(&[&content, &style, &combination], 0);
        let features = extractor.extract(&batch, &loss.layers()).unwrap();
        let breakdown = loss
            .compute_terms(&features, &combination)
            .unwrap()
            .breakdown()
            .unwrap();

        for term in &[breakdown.content, breakdown.style, breakdown.total_variation] {
            assert!(term.is_finite());
            assert!(*term >= 0.0);
        }
        assert!(breakdown.total.is_finite());
    }

    #[test]
    fn layers_are_deduplicated() {
        let dims = Dims::square(16);
        let loss = StyleTransferLoss::new(
            &PoolingExtractor::new(),
            &placeholder(dims),
            dims,
            default_layers(),
            LossWeights::default(),
            3,
        )
        .unwrap();

        assert_eq!(loss.content_layer(), "block3_conv2");
        assert_eq!(loss.layers().len(), 5);
    }

    #[test]
    fn validates_configuration() {
        let dims = Dims::square(16);
        let extractor = PoolingExtractor::new();
        let build = |layers: Vec<String>, combination: &Tensor, factor: u32| {
            StyleTransferLoss::new(
                &extractor,
                combination,
                dims,
                layers,
                LossWeights::default(),
                factor,
            )
        };

        assert!(matches!(
            build(vec!["block9_conv2".to_owned()], &placeholder(dims), 4),
            Err(Error::UnknownLayer(ref name)) if name == "block9_conv2"
        ));
        assert!(matches!(
            build(Vec::new(), &placeholder(dims), 4),
            Err(Error::NoStyleLayers)
        ));
        assert!(matches!(
            build(default_layers(), &placeholder(dims), 6),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            build(default_layers(), &Tensor::zeros([1, 16, 16, 3], OPTS), 4),
            Err(Error::InvalidCombination(_))
        ));
        assert!(matches!(
            build(default_layers(), &placeholder(Dims::square(8)), 4),
            Err(Error::InvalidCombination(_))
        ));
    }

    #[test]
    fn default_weights_leave_style_unscaled() {
        let dims = Dims::square(16);
        let extractor = PoolingExtractor::new();
        let loss = StyleTransferLoss::new(
            &extractor,
            &placeholder(dims),
            dims,
            default_layers(),
            LossWeights::default(),
            4,
        )
        .unwrap();

        let content = Tensor::full([1, 16, 16, 3], 90.0, OPTS);
        let style = Tensor::rand([1, 16, 16, 3], OPTS) * 255.0;
        let combination = (Tensor::rand([1, 16, 16, 3], OPTS) * 255.0).set_requires_grad(true);

        let batch = Tensor::cat(&[&content, &style, &combination], 0);
        let features = extractor.extract(&batch, &loss.layers()).unwrap();

        let layer = |name: &str, index: i64| features[name].select(0, index);

        let mut expected = 0.05 * value(&content_loss(
            &layer("block4_conv2", 0),
            &layer("block4_conv2", 2),
        )
        .unwrap());
        for name in DEFAULT_STYLE_LAYERS.iter() {
            expected += value(
                &style_loss(&layer(name, 1), &layer(name, 2), dims, STYLE_CHANNELS).unwrap(),
            );
        }
        expected += value(&total_variation_loss(&combination, dims).unwrap());

        let actual = value(&loss.compute_loss(&features, &combination).unwrap());
        assert!(
            (actual - expected).abs() <= expected.abs() * 1e-5,
            "{} != {}",
            actual,
            expected
        );
    }

    #[test]
    fn wrong_rank_features_are_errors() {
        let flat = Tensor::ones([4], OPTS);

        assert!(matches!(gram_matrix(&flat), Err(Error::Torch(_))));
        assert!(matches!(
            total_variation_loss(&flat, Dims::square(2)),
            Err(Error::Torch(_))
        ));
        assert!(matches!(
            content_loss(&Tensor::ones([2, 3], OPTS), &Tensor::ones([4, 5], OPTS)),
            Err(Error::Torch(_))
        ));
    }
}
