//! Conflict resolution for notesync.
//!
//! Given the local and the remote version of one record, decide which one
//! survives. Rules, in precedence order:
//!
//! 1. No local version: the remote version is adopted.
//! 2. Exactly one side is a tombstone: the tombstone wins, whatever the
//!    clocks say. A deletion is never resurrected by an older edit.
//! 3. Otherwise last write wins on the modification clock; equal clocks
//!    go to the remote version so every device converges on the server copy.
//!
//! Resolution is pure. Callers persist the outcome.

use std::fmt;

use crate::models::{RecordVersion, SyncRecord};

/// Which version survives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Keep the local version; it must be pushed again.
    KeepLocal,
    /// Overwrite the local version with the remote one.
    TakeRemote,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::KeepLocal => "keep_local",
            Winner::TakeRemote => "take_remote",
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a winner was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NewRecord,
    LocalTombstone,
    RemoteTombstone,
    LocalNewer,
    RemoteNewer,
    /// Equal clocks, or both sides tombstoned with equal clocks
    Tie,
}

/// Outcome of resolving one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Winner,
    pub reason: Reason,
    /// True when both versions existed and carried different data.
    pub conflict: bool,
}

/// Decide between the local and the remote version of one record.
pub fn resolve<T: SyncRecord>(local: Option<&T>, remote: &T) -> Resolution {
    let local = match local {
        Some(local) => local,
        None => {
            return Resolution {
                winner: Winner::TakeRemote,
                reason: Reason::NewRecord,
                conflict: false,
            }
        }
    };

    let conflict = !local.same_content(remote);

    let (winner, reason) = match (local.deleted_at().is_some(), remote.deleted_at().is_some()) {
        (true, false) => (Winner::KeepLocal, Reason::LocalTombstone),
        (false, true) => (Winner::TakeRemote, Reason::RemoteTombstone),
        _ => {
            if local.last_modified() > remote.last_modified() {
                (Winner::KeepLocal, Reason::LocalNewer)
            } else if remote.last_modified() > local.last_modified() {
                (Winner::TakeRemote, Reason::RemoteNewer)
            } else {
                (Winner::TakeRemote, Reason::Tie)
            }
        }
    };

    if conflict {
        tracing::debug!(
            "Conflict on {:?} {}: {} ({:?})",
            T::KIND,
            remote.id(),
            winner,
            reason
        );
    }

    Resolution {
        winner,
        reason,
        conflict,
    }
}

/// True when the stored remote version would beat `local` under the rules
/// above. Pushing `local` would then overwrite the winner, so the upload
/// phase holds it back and lets the download phase resolve it.
///
/// Equal clocks supersede too, since ties go to the remote version and the
/// two contents cannot be compared from the clock alone.
pub fn remote_supersedes<T: SyncRecord>(local: &T, remote: &RecordVersion) -> bool {
    match (local.deleted_at().is_some(), remote.deleted_at.is_some()) {
        (false, true) => true,
        (true, false) => false,
        _ => remote.last_modified >= local.last_modified(),
    }
}

/// True when `remote` carries a change the local copy has not seen yet: a
/// deletion of a live record, or a strictly later clock.
pub fn remote_is_ahead(local: &RecordVersion, remote: &RecordVersion) -> bool {
    match (local.deleted_at.is_some(), remote.deleted_at.is_some()) {
        (false, true) => true,
        (true, false) => false,
        _ => remote.last_modified > local.last_modified,
    }
}
