// Signal conditioning module
// Filter designs and the fixed-order preprocessing pipeline

pub mod filters;
pub mod preprocess;

pub use preprocess::{process, DcOffset, FilterFamily, LowpassSettings, NotchSettings, PreprocessOptions};
