//! Message flag bits.
//!
//! The low 16 bits are user-visible state; changing them marks a summary
//! dirty and notifies listeners. The high 16 bits ([`MessageFlags::SYSTEM_MASK`])
//! are bookkeeping owned by the summary and its backends.
//!
//! DO NOT renumber: these bits are stored verbatim in summary files.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
    pub struct MessageFlags: u32 {
        const ANSWERED       = 1 << 0;
        const DELETED        = 1 << 1;
        const DRAFT          = 1 << 2;
        const FLAGGED        = 1 << 3;
        const SEEN           = 1 << 4;
        const ATTACHMENTS    = 1 << 5;
        const ANSWERED_ALL   = 1 << 6;
        const JUNK           = 1 << 7;
        const SECURE         = 1 << 8;
        const NOTJUNK        = 1 << 9;

        /// The record needs attention from its backend (renamed uid, unsynced flags).
        const FOLDER_FLAGGED = 1 << 16;
        /// The message was removed from the store.
        const EXPUNGED       = 1 << 20;

        const SYSTEM_MASK    = 0xffff_0000;
    }
}

/// Names accepted by [`MessageFlags::parse_name`], matched case-insensitively.
const SYSTEM_FLAG_NAMES: [(&str, MessageFlags); 10] = [
    ("Answered", MessageFlags::ANSWERED),
    ("Deleted", MessageFlags::DELETED),
    ("Draft", MessageFlags::DRAFT),
    ("Flagged", MessageFlags::FLAGGED),
    ("Seen", MessageFlags::SEEN),
    ("Attachments", MessageFlags::ATTACHMENTS),
    ("AnsweredAll", MessageFlags::ANSWERED_ALL),
    ("Junk", MessageFlags::JUNK),
    ("Secure", MessageFlags::SECURE),
    ("NotJunk", MessageFlags::NOTJUNK),
];

impl MessageFlags {
    /// Decode flags read from disk, keeping bits this build does not know.
    pub fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    /// Map a system flag name (`"Seen"`, `"\\Seen"`, `"seen"`) to its bit.
    pub fn parse_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix('\\').unwrap_or(name);
        SYSTEM_FLAG_NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, flag)| *flag)
    }

    /// The user-visible part of the flags.
    pub fn visible(self) -> Self {
        self.difference(Self::SYSTEM_MASK)
    }

    /// Names of the user-visible flags that are set, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        SYSTEM_FLAG_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_bits_survive() {
        let flags = MessageFlags::from_raw(0x8000_0011);
        assert_eq!(flags.bits(), 0x8000_0011);
        assert!(flags.contains(MessageFlags::SEEN | MessageFlags::ANSWERED));
    }

    #[test]
    fn test_system_mask_split() {
        let flags = MessageFlags::SEEN | MessageFlags::FOLDER_FLAGGED;
        assert_eq!(flags.visible(), MessageFlags::SEEN);
        assert!(MessageFlags::SYSTEM_MASK.contains(MessageFlags::EXPUNGED));
        assert!(!MessageFlags::SYSTEM_MASK.intersects(MessageFlags::NOTJUNK));
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(MessageFlags::parse_name("seen"), Some(MessageFlags::SEEN));
        assert_eq!(
            MessageFlags::parse_name("\\Answered"),
            Some(MessageFlags::ANSWERED)
        );
        assert_eq!(MessageFlags::parse_name("$Label1"), None);
    }

    #[test]
    fn test_names() {
        let flags = MessageFlags::SEEN | MessageFlags::FLAGGED | MessageFlags::EXPUNGED;
        assert_eq!(flags.names(), vec!["Flagged", "Seen"]);
    }
}
