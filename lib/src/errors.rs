use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// libtorch reported an error while running the network or autograd
    Torch(tch::TchError),
    /// The minimizer failed for a reason other than the objective itself
    Optimizer(String),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The output image must be square
    NotSquare(u32, u32),
    /// A required input (content image, style image, ...) was never provided
    MissingInput(&'static str),
    /// A layer was requested that the feature extractor doesn't expose
    UnknownLayer(String),
    /// At least one style layer is needed to compute a style loss
    NoStyleLayers,
    /// The combination image can't be optimized, eg wrong shape or it
    /// doesn't track gradients
    InvalidCombination(String),
    /// A flat pixel buffer didn't have `width * height * 3` elements
    BufferSize { expected: usize, actual: usize },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Torch(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::Torch(te) => write!(f, "{}", te),
            Self::Optimizer(msg) => write!(f, "the optimizer failed: {}", msg),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::NotSquare(width, height) => write!(
                f,
                "the output must be square, but {}x{} was requested",
                width, height
            ),
            Self::MissingInput(what) => write!(f, "no {} image was provided", what),
            Self::UnknownLayer(name) => write!(
                f,
                "the layer '{}' is not present in the feature extractor",
                name
            ),
            Self::NoStyleLayers => write!(f, "at least 1 style layer must be specified"),
            Self::InvalidCombination(why) => {
                write!(f, "the combination image is invalid: {}", why)
            }
            Self::BufferSize { expected, actual } => write!(
                f,
                "the pixel buffer has {} values, but {} were expected",
                actual, expected
            ),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<tch::TchError> for Error {
    fn from(te: tch::TchError) -> Self {
        Self::Torch(te)
    }
}
