use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let vgg = ns::Vgg16::new(ns::Weights::Pretrained("vgg16.ot".into()))?;

    let session = ns::Session::builder()
        .content(&"imgs/content.jpg")
        .style(&"imgs/style.jpg")
        .output_size(ns::Dims::square(256))
        // match the content at the deepest block for a more abstract result,
        // and only use the shallower layers for the style
        .abstract_factor(5)
        .style_layers(vec!["block1_conv2", "block2_conv2", "block3_conv2"])
        .content_weight(0.01)
        .style_weight(1.0)
        .total_variation_weight(0.2)
        .iterations(20)
        .build(vgg)?;

    // any closure can receive progress updates
    let progress = |update: ns::ProgressUpdate| {
        println!(
            "iteration {}/{}: loss {:.4e} after {} evaluations in {:?}",
            update.iterations.current,
            update.iterations.total,
            update.loss,
            update.evaluations,
            update.elapsed
        );
    };

    let generated = session.run(&mut ns::Lbfgs::new(5), Some(Box::new(progress)))?;
    generated.save("out/02.png")
}
