//! Email parsing: streaming MBOX splitter, header decoding, and the pull MIME parser.

pub mod header;
pub mod mbox;
pub mod mime;
