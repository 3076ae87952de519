//! Backend hooks.
//!
//! A summary is generic over a [`SummaryBackend`], which contributes an
//! extension to the file header and to every record, and may react to flag
//! changes. The plain summary uses [`DefaultBackend`], which stores nothing
//! extra.

use std::fmt::Debug;
use std::io::{self, Write};

use crate::model::flags::MessageFlags;
use crate::model::message_info::MessageInfo;

use super::codec::{DecodeError, Decoder};

pub trait SummaryBackend: Send + Sync + 'static {
    /// Per-record extension data.
    type Extra: Clone + Default + Debug + Send + Sync + 'static;

    /// Header extension data.
    type Header: Clone + Default + Debug + Send + Sync + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn header_save(&self, _header: &Self::Header, _w: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn header_load(&self, _dec: &mut Decoder<'_>) -> Result<Self::Header, DecodeError> {
        Ok(Self::Header::default())
    }

    fn extra_save(&self, _extra: &Self::Extra, _w: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn extra_load(&self, _dec: &mut Decoder<'_>) -> Result<Self::Extra, DecodeError> {
        Ok(Self::Extra::default())
    }

    /// Called with the record write-locked after its flags changed from
    /// `old`, before listeners are told. No summary lock is held.
    fn flags_changed(&self, _info: &mut MessageInfo<Self::Extra>, _old: MessageFlags) {}
}

/// Backend with no extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBackend;

impl SummaryBackend for DefaultBackend {
    type Extra = ();
    type Header = ();

    fn name(&self) -> &'static str {
        "default"
    }
}
