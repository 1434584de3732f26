pub mod caption;
pub mod config;
pub mod credentials;
pub mod language;
pub mod tags;

pub use caption::Caption;
pub use config::Config;
pub use credentials::Credentials;
pub use language::Language;
pub use tags::TagValue;
