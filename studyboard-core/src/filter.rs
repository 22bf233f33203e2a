//! Which record kinds leave the local document.

use crate::record::RecordKind;

/// Kinds shared with every collaborator on the board.
pub const REPLICABLE_KINDS: [RecordKind; 3] = [
    RecordKind::Drawable,
    RecordKind::Attachment,
    RecordKind::Relation,
];

/// Viewport, selection, pointer and instance state stay per-user.
pub fn is_replicable(kind: RecordKind) -> bool {
    matches!(
        kind,
        RecordKind::Drawable | RecordKind::Attachment | RecordKind::Relation
    )
}
