pub mod classifier;
pub mod normalizer;
pub mod similarity;
