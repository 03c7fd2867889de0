// Template module
// Alignment of accepted events and template construction/persistence

pub mod align;
pub mod build;

pub use align::{align, AlignPolicy, AlignedWaveform};
pub use build::{build_template, load_template, save_template, Template, TemplateError};
