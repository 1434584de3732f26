pub mod archive;
pub mod batch;
pub mod images;
pub mod prompt;
pub mod traits;
pub mod tree;
pub mod worker;

pub use batch::{BatchRunner, BatchStats, RunOptions};
pub use images::{FetchedImage, ImageAcquirer};
pub use worker::{CaptionWorker, ProcessOptions};
