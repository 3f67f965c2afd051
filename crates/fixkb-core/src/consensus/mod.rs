pub mod novelty;
pub mod shared_dir;
pub mod sync;
pub mod transport;
