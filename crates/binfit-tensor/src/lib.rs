//! Model tensor construction for binned template fits.
//!
//! This crate turns per-channel histograms (nominal process templates,
//! systematic variations, observed and pseudo data) into a single canonical
//! numeric artifact, the [`ModelTensor`], consumed by the fitting engine:
//!
//! - [`builder::ModelTensorBuilder`] accumulates registrations and performs
//!   symmetrization, log-effect computation with a sign-flip floor, sparsity
//!   masking and Barlow-Beeston bookkeeping;
//! - [`tensor::ModelTensor`] is the immutable result with processes ordered
//!   signals-first and systematics in canonical blocks;
//! - [`container`] persists tensors (and fit results) in a chunked binary
//!   key-value format with a footer index for random access.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod axis;
pub mod builder;
pub mod container;
pub mod sparse;
pub mod tensor;

pub use axis::{bin_count, Axis, AxisKind, ChannelInfo};
pub use builder::{
    ArrayHistogram, Histogram, ModelTensorBuilder, Symmetrization, SystematicOptions, Variation,
    LOGK_EPSILON,
};
pub use container::{read_model, write_model, ContainerReader, ContainerWriter};
pub use sparse::SparseArray2;
pub use tensor::{LogkStorage, ModelTensor, NormStorage, SystGroup};
