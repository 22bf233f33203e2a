use std::fmt;

/// Tag attached to every change batch, in the local store and in the
/// replicated document alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOrigin {
    /// Produced by this client's user.
    Local,
    /// Received from a peer through the replicated document.
    Remote,
    /// Adopted from pre-existing shared state after a sync handshake.
    Bootstrap,
}

impl SyncOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOrigin::Local => "local",
            SyncOrigin::Remote => "remote",
            SyncOrigin::Bootstrap => "bootstrap",
        }
    }
}

impl fmt::Display for SyncOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
