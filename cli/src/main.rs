mod progress_window;

use log::{info, warn};
use progress_window::ProgressWindow;
use std::path::PathBuf;
use structopt::StructOpt;

use neural_style::{Dims, Error, Lbfgs, Session, TransferProgress, Vgg16, Weights};

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Repaints a content image in the style of another image",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image from which the style will be sourced
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The image whose structure is kept in the generated output
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The path to save the generated image to, always encoded as a PNG
    #[structopt(long = "save_path", parse(from_os_str))]
    save_path: PathBuf,
    /// Size of the generated image, which is always square. Both inputs are
    /// resized to it.
    #[structopt(long, default_value = "256")]
    size: u32,
    /// The number of times the optimizer is run, each with up to 20
    /// evaluations of the network
    #[structopt(long = "iter", default_value = "10")]
    iterations: u32,
    /// Weight of the content loss. Larger values keep more of the content
    /// image, smaller values give more style.
    #[structopt(long, default_value = "0.01")]
    alpha: f64,
    /// The VGG block used to match the content. Higher values give a more
    /// abstract result. Range (1-5)
    #[structopt(long, default_value = "4")]
    afactor: u32,
    /// Path to the VGG16 weights in libtorch's `.ot` format. If not given,
    /// the network is randomly initialized, which is only useful for testing.
    #[structopt(long, parse(from_os_str))]
    weights: Option<PathBuf>,
    /// Weight of the style loss
    #[structopt(long, default_value = "1.0")]
    style_weight: f64,
    /// Weight of the total variation loss, larger values give a smoother image
    #[structopt(long, default_value = "0.2")]
    tv_weight: f64,
    /// Comma separated list of the layers the style is extracted from
    #[structopt(
        long,
        use_delimiter = true,
        default_value = "block1_conv2,block2_conv2,block3_conv2,block4_conv2,block5_conv2"
    )]
    style_layers: Vec<String>,
    /// A seed value for the noise the generated image starts from
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Subtract the ImageNet channel means from the inputs before optimizing
    #[structopt(long)]
    mean_center: bool,
    /// The maximum number of threads libtorch uses. Defaults to the logical
    /// core count. Use 1 for fully reproducible output on the CPU.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Hide the progress bar
    #[structopt(long)]
    no_progress: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    let weights = match args.weights {
        Some(ref path) => Weights::Pretrained(path.clone()),
        None => {
            warn!("no --weights given, using a randomly initialized network");
            Weights::Random { seed: 0 }
        }
    };

    let vgg = Vgg16::new(weights)?;

    let mut sb = Session::builder()
        .content(&args.content)
        .style(&args.style)
        .output_size(Dims::square(args.size))
        .iterations(args.iterations)
        .content_weight(args.alpha)
        .style_weight(args.style_weight)
        .total_variation_weight(args.tv_weight)
        .abstract_factor(args.afactor)
        .style_layers(args.style_layers.iter().cloned())
        .seed(args.seed)
        .mean_center(args.mean_center);

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    let session = sb.build(vgg)?;

    let progress: Option<Box<dyn TransferProgress>> = if !args.no_progress {
        Some(Box::new(ProgressWindow::new(args.iterations)))
    } else {
        None
    };

    let generated = session.run(&mut Lbfgs::default(), progress)?;
    generated.save(&args.save_path)?;

    info!(
        "saved {} with a final loss of {:.6e}",
        args.save_path.display(),
        generated.loss()
    );

    Ok(())
}
