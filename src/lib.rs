//! Hand-landmark capture, dataset assembly and gesture classifier training.

pub mod capture;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod knn;
pub mod mlp;
pub mod model_download;
pub mod normalize;
pub mod source;
pub mod store;
pub mod train;
pub mod types;
