use serde::{Deserialize, Serialize};

/// The structured caption the model is required to produce.
///
/// All five fields are mandatory; deserialization fails when any key is
/// missing, which is what distinguishes a parseable caption (status 200)
/// from model text that merely looks like JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    pub regular_summary: String,
    pub midjourney_style_summary: String,
    pub short_summary: String,
    pub creation_instructional_summary: String,
    pub deviantart_commission_request: String,
}
