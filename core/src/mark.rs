use std::str::FromStr;

/// Matches every bit of a fwmark.
pub const MARK_FULL_MASK: u32 = 0xffff_ffff;

/// Matches only the high byte, which identifies this agent's marks among
/// other agents sharing the same tables.
pub const MARK_AGENT_MASK: u32 = 0xff00_0000;

/// A 32-bit kernel fwmark.
///
/// The configured base mark carries the agent identifier in its high byte;
/// per-gateway-node marks published in `EgressNode.status.mark` add a node
/// delta in the low bytes.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Mark(pub u32);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid fwmark {0:?}")]
pub struct InvalidMark(pub String);

impl FromStr for Mark {
    type Err = InvalidMark;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        u32::from_str_radix(hex, 16)
            .map(Mark)
            .map_err(|_| InvalidMark(s.to_string()))
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl std::fmt::Debug for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mark({:#010x})", self.0)
    }
}
