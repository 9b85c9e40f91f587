//! Named-layer feature extraction.
//!
//! The loss only needs "given an input batch, return the activations of these
//! layers", which is what `FeatureExtractor` expresses. `Vgg16` implements it
//! with the convolutional part of VGG16 running on libtorch.

use crate::Error;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tch::{nn, Device, Kind, Tensor};

/// Layer activations keyed by layer name, each laid out
/// `[batch, height, width, channels]`
pub type FeatureMaps = BTreeMap<String, Tensor>;

/// Describes a layer that a `FeatureExtractor` can read out
#[derive(Clone, Debug, PartialEq)]
pub struct LayerInfo {
    pub name: String,
    pub channels: i64,
}

/// A frozen network that maps an image batch to intermediate activations.
///
/// The input batch is `[batch, height, width, 3]`, BGR, on the `0-255` pixel
/// scale, exactly as produced by `preprocess`. The output activations must
/// stay differentiable with respect to the input.
pub trait FeatureExtractor {
    /// Every layer this extractor can read out
    fn layers(&self) -> &[LayerInfo];

    /// Runs the network on `input` and returns the activations for `layers`
    fn extract(&self, input: &Tensor, layers: &[&str]) -> Result<FeatureMaps, Error>;

    fn has_layer(&self, name: &str) -> bool {
        self.layers().iter().any(|layer| layer.name == name)
    }
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for &E {
    fn layers(&self) -> &[LayerInfo] {
        (**self).layers()
    }

    fn extract(&self, input: &Tensor, layers: &[&str]) -> Result<FeatureMaps, Error> {
        (**self).extract(input, layers)
    }
}

/// How the weights of a `Vgg16` are initialized
#[derive(Clone, Debug)]
pub enum Weights {
    /// Load the ImageNet weights from a libtorch `.ot` file, such as the
    /// `vgg16.ot` distributed with tch-rs
    Pretrained(PathBuf),
    /// Keep libtorch's random initialization, seeded for reproducibility.
    /// Only useful for testing and benchmarking.
    Random { seed: i64 },
}

// (convolutions, output channels) for each of the 5 blocks
const VGG16_BLOCKS: [(usize, i64); 5] = [(2, 64), (2, 128), (3, 256), (3, 512), (3, 512)];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

struct Layer {
    info: LayerInfo,
    // position of the layer's output in `forward_all_t`
    index: usize,
}

/// The 13 convolution layers of VGG16, without the classifier.
///
/// Layers are named `block{b}_conv{c}` and `block{b}_pool`, where a
/// convolution's activation is read after its ReLU.
pub struct Vgg16 {
    net: nn::SequentialT,
    layers: Vec<Layer>,
    infos: Vec<LayerInfo>,
    device: Device,
    _vs: nn::VarStore,
}

impl Vgg16 {
    /// Creates the network on the GPU if one is available
    pub fn new(weights: Weights) -> Result<Self, Error> {
        Self::with_device(weights, Device::cuda_if_available())
    }

    pub fn with_device(weights: Weights, device: Device) -> Result<Self, Error> {
        if let Weights::Random { seed } = weights {
            tch::manual_seed(seed);
        }

        let mut vs = nn::VarStore::new(device);
        let (net, layers) = vgg16_features(&vs.root());

        if let Weights::Pretrained(ref path) = weights {
            vs.load(path)?;
        }
        vs.freeze();

        let infos = layers.iter().map(|l| l.info.clone()).collect();

        Ok(Self {
            net,
            layers,
            infos,
            device,
            _vs: vs,
        })
    }

    /// Converts the BGR pixel batch into the NCHW, RGB, normalized layout the
    /// ImageNet weights were trained on
    fn to_network_input(&self, input: &Tensor) -> Result<Tensor, Error> {
        let mean = Tensor::f_from_slice(&IMAGENET_MEAN)?
            .f_view([1, 3, 1, 1])?
            .f_to_device(self.device)?;
        let std = Tensor::f_from_slice(&IMAGENET_STD)?
            .f_view([1, 3, 1, 1])?
            .f_to_device(self.device)?;

        let xs = input
            .f_to_device(self.device)?
            .f_to_kind(Kind::Float)?
            .f_permute([0, 3, 1, 2])?
            .f_flip([1])?
            / 255.0;

        Ok((xs - mean) / std)
    }
}

fn vgg16_features(p: &nn::Path<'_>) -> (nn::SequentialT, Vec<Layer>) {
    let f = p / "features";
    let conv_cfg = nn::ConvConfig {
        padding: 1,
        ..Default::default()
    };

    let mut seq = nn::seq_t();
    let mut layers = Vec::new();
    let mut c_in = 3;

    for (block, &(convs, c_out)) in VGG16_BLOCKS.iter().enumerate() {
        for conv in 0..convs {
            let l = seq.len();
            seq = seq
                .add(nn::conv2d(&f / l.to_string(), c_in, c_out, 3, conv_cfg))
                .add_fn(|xs| xs.relu());
            layers.push(Layer {
                info: LayerInfo {
                    name: format!("block{}_conv{}", block + 1, conv + 1),
                    channels: c_out,
                },
                index: l as usize + 1,
            });
            c_in = c_out;
        }

        let l = seq.len();
        seq = seq.add_fn(|xs| xs.max_pool2d_default(2));
        layers.push(Layer {
            info: LayerInfo {
                name: format!("block{}_pool", block + 1),
                channels: c_out,
            },
            index: l as usize,
        });
    }

    (seq, layers)
}

impl FeatureExtractor for Vgg16 {
    fn layers(&self) -> &[LayerInfo] {
        &self.infos
    }

    fn extract(&self, input: &Tensor, layers: &[&str]) -> Result<FeatureMaps, Error> {
        let wanted = layers
            .iter()
            .map(|name| {
                self.layers
                    .iter()
                    .find(|l| l.info.name == *name)
                    .ok_or_else(|| Error::UnknownLayer((*name).to_owned()))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut maps = FeatureMaps::new();

        // Only run the network as deep as the deepest requested layer
        let depth = match wanted.iter().map(|l| l.index + 1).max() {
            Some(depth) => depth,
            None => return Ok(maps),
        };

        let xs = self.to_network_input(input)?;
        let outputs = self.net.forward_all_t(&xs, false, Some(depth));

        for layer in wanted {
            let activation = outputs[layer.index].f_permute([0, 2, 3, 1])?;
            maps.insert(layer.info.name.clone(), activation);
        }

        Ok(maps)
    }
}

/// A cheap stand-in for a real network: `block{b}_conv2` is the input
/// average-pooled by `2^(b-1)`, so it keeps 3 channels.
#[cfg(test)]
pub(crate) struct PoolingExtractor {
    infos: Vec<LayerInfo>,
    pub(crate) calls: std::cell::Cell<usize>,
}

#[cfg(test)]
impl PoolingExtractor {
    pub(crate) fn new() -> Self {
        Self {
            infos: (1..=5)
                .map(|block| LayerInfo {
                    name: format!("block{}_conv2", block),
                    channels: 3,
                })
                .collect(),
            calls: std::cell::Cell::new(0),
        }
    }
}

#[cfg(test)]
impl FeatureExtractor for PoolingExtractor {
    fn layers(&self) -> &[LayerInfo] {
        &self.infos
    }

    fn extract(&self, input: &Tensor, layers: &[&str]) -> Result<FeatureMaps, Error> {
        self.calls.set(self.calls.get() + 1);

        let nchw = input.f_permute([0, 3, 1, 2])?;
        let mut maps = FeatureMaps::new();

        for name in layers {
            let block = (1..=5)
                .find(|block| format!("block{}_conv2", block) == *name)
                .ok_or_else(|| Error::UnknownLayer((*name).to_owned()))?;

            let pooled = if block == 1 {
                nchw.shallow_clone()
            } else {
                nchw.avg_pool2d_default(1 << (block - 1))
            };

            maps.insert((*name).to_owned(), pooled.f_permute([0, 2, 3, 1])?);
        }

        Ok(maps)
    }
}
