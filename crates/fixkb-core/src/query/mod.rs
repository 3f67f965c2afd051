pub mod guards;
pub mod ranker;
