use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, TransferProgress};

pub struct ProgressWindow {
    iterations_pb: ProgressBar,
    total_len: usize,
}

impl ProgressWindow {
    pub fn new(iterations: u32) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss {msg}")
            .progress_chars("##-");

        let iterations_pb = ProgressBar::new(u64::from(iterations));
        iterations_pb.set_style(sty);

        Self {
            iterations_pb,
            total_len: iterations as usize,
        }
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.iterations_pb.finish();
    }
}

impl TransferProgress for ProgressWindow {
    fn update(&mut self, update: ProgressUpdate) {
        if update.iterations.total != self.total_len {
            self.total_len = update.iterations.total;
            self.iterations_pb.set_length(self.total_len as u64);
        }

        self.iterations_pb
            .set_message(&format!("{:.4e}", update.loss));
        self.iterations_pb
            .set_position(update.iterations.current as u64);
    }
}
