//! Command token payload.
//!
//! A command token is an ordinary buffer from the scheduler's command pool.
//! Its first bytes say which resource it stands for:
//! `kind: u32 LE | target: u32 LE`.

pub(crate) const COMMAND_LEN: usize = 8;

const KIND_DEQUEUE: u32 = 1;
const KIND_POLL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Drain the queue in this queue-table slot.
    Dequeue { queue: u32 },
    /// Invoke the poll callback in this poll-table slot.
    Poll { source: u32 },
}

impl Command {
    pub(crate) fn encode(self) -> [u8; COMMAND_LEN] {
        let (kind, target) = match self {
            Command::Dequeue { queue } => (KIND_DEQUEUE, queue),
            Command::Poll { source } => (KIND_POLL, source),
        };
        let mut out = [0u8; COMMAND_LEN];
        out[..4].copy_from_slice(&kind.to_le_bytes());
        out[4..].copy_from_slice(&target.to_le_bytes());
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        let kind = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?);
        let target = u32::from_le_bytes(bytes.get(4..COMMAND_LEN)?.try_into().ok()?);
        match kind {
            KIND_DEQUEUE => Some(Command::Dequeue { queue: target }),
            KIND_POLL => Some(Command::Poll { source: target }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_kind_then_target() {
        let bytes = Command::Poll { source: 0x0102_0304 }.encode();
        assert_eq!(bytes, [2, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(
            Command::decode(&bytes),
            Some(Command::Poll { source: 0x0102_0304 })
        );
        assert_eq!(
            Command::decode(&Command::Dequeue { queue: 9 }.encode()),
            Some(Command::Dequeue { queue: 9 })
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Command::decode(&[0; COMMAND_LEN]), None);
        assert_eq!(Command::decode(&[1, 0, 0]), None);
    }
}
