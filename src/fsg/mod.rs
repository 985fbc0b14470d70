//! Grammar-constrained search: the FSG model itself, the JSGF compiler that produces one, the
//! compiled lexicon tree, the word history arena, and the Viterbi search that ties them
//! together.
pub mod history;
pub mod jsgf;
pub mod lextree;
pub mod model;
pub mod search;

pub use jsgf::Jsgf;
pub use model::{FsgArc, FsgModel};
pub use search::FsgSearch;
