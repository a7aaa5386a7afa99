//! Service layer for enhance
//!
//! This module contains service classes that separate infrastructure concerns
//! (file formats, image I/O, progress reporting, background work) from the
//! enhancement pipeline itself.

pub mod format;
pub mod io;
pub mod progress;
pub mod worker;

pub use format::ImageFileFormat;
pub use io::ImageIOService;
pub use progress::{
    ConsoleProgressReporter, Job, JobHistory, JobOutcome, JobRecord, NoOpProgressReporter,
    ProgressReporter, ProgressUpdate,
};
pub use worker::OperationQueue;
