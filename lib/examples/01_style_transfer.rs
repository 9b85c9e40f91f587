use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    // the ImageNet weights, as distributed with tch-rs
    let vgg = ns::Vgg16::new(ns::Weights::Pretrained("vgg16.ot".into()))?;

    //create a new session
    let session = ns::Session::builder()
        //the image whose structure we keep
        .content(&"imgs/content.jpg")
        //the image whose style gets painted onto it
        .style(&"imgs/style.jpg")
        .output_size(ns::Dims::square(256))
        .build(vgg)?;

    //optimize the image
    let generated = session.run(&mut ns::Lbfgs::default(), None)?;

    //save the image to the disk, always as a png
    generated.save("out/01.png")
}
