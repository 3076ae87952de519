//! Message metadata: summary records, flags, message ids, addresses, and MIME content trees.

pub mod address;
pub mod content_info;
pub mod flags;
pub mod message_id;
pub mod message_info;
