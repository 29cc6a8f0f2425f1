//! Shared document state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ot::attrs::Attributes;
use crate::ot::operation::FormatSpan;
use crate::util;

/// Access control for a document. The hierarchy is owner ⊇ admin ⊇ write
/// ⊇ read; membership in a higher set implies the lower ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPermissions {
    /// Users allowed to read.
    pub read: BTreeSet<String>,
    /// Users allowed to write.
    pub write: BTreeSet<String>,
    /// Users allowed to administer.
    pub admin: BTreeSet<String>,
    /// The owning user; has every permission.
    pub owner: String,
}

impl DocumentPermissions {
    /// Permissions with only an owner.
    pub fn owned_by(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            ..Default::default()
        }
    }

    /// Whether `user` may administer the document.
    pub fn can_admin(&self, user: &str) -> bool {
        user == self.owner || self.admin.contains(user)
    }

    /// Whether `user` may write. Admins and the owner always may.
    pub fn can_write(&self, user: &str) -> bool {
        self.can_admin(user) || self.write.contains(user)
    }

    /// Whether `user` may read. Writers, admins, and the owner always may.
    pub fn can_read(&self, user: &str) -> bool {
        self.can_write(user) || self.read.contains(user)
    }
}

/// What kind of text the document holds. Drives the `content_aware`
/// conflict strategy; persisted with the document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Unstructured prose.
    #[default]
    Plain,
    /// Markdown text.
    Markdown,
    /// Source code.
    Code,
    /// Rich text with formatting.
    RichText,
}

/// Title, collaborator list, content type, and permissions of a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Display title.
    pub title: String,
    /// Users who have participated.
    pub collaborators: BTreeSet<String>,
    /// What kind of text this document holds.
    #[serde(default)]
    pub content_type: ContentKind,
    /// Access control.
    pub permissions: DocumentPermissions,
}

/// The replicated document: content, sparse formatting, and versioning.
///
/// Positions everywhere in the engine are character indices into `content`;
/// `formatting` maps a character position to the attributes in effect there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    /// Document identifier.
    pub id: String,
    /// Current text.
    pub content: String,
    /// Monotonic version, starting at 1; bumped once per applied operation.
    pub version: u64,
    /// Base-36 rolling hash of `content`.
    pub checksum: String,
    /// Milliseconds since epoch of the last applied operation.
    pub last_modified: u64,
    /// Sparse per-position style attributes.
    pub formatting: FormatSpan,
    /// Title, collaborators, permissions.
    pub metadata: DocumentMetadata,
}

impl DocumentState {
    /// A fresh empty document owned by `owner`.
    pub fn new(id: &str, owner: &str) -> Self {
        Self::with_content(id, owner, String::new())
    }

    /// A fresh document seeded with `content`.
    pub fn with_content(id: &str, owner: &str, content: String) -> Self {
        let checksum = util::checksum(&content);
        Self {
            id: id.to_string(),
            content,
            version: 1,
            checksum,
            last_modified: util::now_millis(),
            formatting: FormatSpan::new(),
            metadata: DocumentMetadata {
                title: id.to_string(),
                collaborators: BTreeSet::from([owner.to_string()]),
                content_type: ContentKind::default(),
                permissions: DocumentPermissions::owned_by(owner),
            },
        }
    }

    /// Content length in characters.
    pub fn char_len(&self) -> u32 {
        self.content.chars().count() as u32
    }

    /// Byte offset of character position `pos`, clamped to the end.
    pub fn byte_offset(&self, pos: u32) -> usize {
        self.content
            .char_indices()
            .nth(pos as usize)
            .map(|(i, _)| i)
            .unwrap_or(self.content.len())
    }

    /// Attributes in effect at `pos`, if any.
    pub fn attributes_at(&self, pos: u32) -> Option<&Attributes> {
        self.formatting.get(&pos)
    }

    /// Recomputes the checksum after a content change.
    pub(crate) fn rehash(&mut self) {
        self.checksum = util::checksum(&self.content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_hierarchy() {
        let mut perms = DocumentPermissions::owned_by("olive");
        perms.read.insert("rita".to_string());
        perms.write.insert("wade".to_string());
        perms.admin.insert("ada".to_string());

        assert!(perms.can_read("rita") && !perms.can_write("rita"));
        assert!(perms.can_read("wade") && perms.can_write("wade") && !perms.can_admin("wade"));
        assert!(perms.can_read("ada") && perms.can_write("ada") && perms.can_admin("ada"));
        assert!(perms.can_admin("olive"));
        assert!(!perms.can_read("mallory"));
    }

    #[test]
    fn byte_offset_handles_multibyte_content() {
        let doc = DocumentState::with_content("d", "u", "héllo".to_string());
        assert_eq!(doc.char_len(), 5);
        assert_eq!(doc.byte_offset(0), 0);
        assert_eq!(doc.byte_offset(2), 3);
        assert_eq!(doc.byte_offset(99), doc.content.len());
    }

    #[test]
    fn content_type_defaults_for_older_snapshots() {
        let doc = DocumentState::with_content("d", "u", "x".to_string());
        let mut value = serde_json::to_value(&doc).unwrap();
        value["metadata"].as_object_mut().unwrap().remove("contentType");
        let loaded: DocumentState = serde_json::from_value(value).unwrap();
        assert_eq!(loaded.metadata.content_type, ContentKind::Plain);
    }

    #[test]
    fn checksum_tracks_content() {
        let mut doc = DocumentState::new("d", "u");
        assert_eq!(doc.checksum, util::checksum(""));
        doc.content.push_str("abc");
        doc.rehash();
        assert_eq!(doc.checksum, util::checksum("abc"));
    }
}
