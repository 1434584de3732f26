pub mod captions;
pub mod client;
pub mod error;
pub mod outcome;
pub mod pics;
pub mod record;
pub mod tags;

pub use captions::{shard_name, CaptionStore, PROCESSED_STATUS_CODES, SHARD_SIZE};
pub use client::StoreClient;
pub use error::{Result, StoreError};
pub use outcome::CaptionOutcome;
pub use pics::{CharacterStats, PicsStore};
pub use record::{ImageRecord, UrlResolution, UrlStatus};
pub use tags::TagStore;
