pub mod checkpoint;
pub mod corpus;
pub mod error;
pub mod schema;

pub use checkpoint::{Checkpoint, Manifest, TrainingSummary};
pub use corpus::{CorpusStats, CorpusStore, LabeledDay};
pub use error::{Result, StoreError};
