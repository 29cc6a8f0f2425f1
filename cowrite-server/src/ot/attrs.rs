//! Text style attributes carried by insert, retain, and format operations.

use serde::{Deserialize, Serialize};

/// Horizontal alignment of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Align {
    /// Left-aligned text.
    Left,
    /// Centered text.
    Center,
    /// Right-aligned text.
    Right,
    /// Justified text.
    Justify,
}

/// List membership of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListType {
    /// Bulleted list.
    Bullet,
    /// Numbered list.
    Ordered,
    /// Checkbox list.
    Checklist,
}

/// A sparse set of style attributes. An absent field means "unchanged".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)] // the field names are the whole story
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underline: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strikethrough: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Heading level, 1 through 6.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub align: Option<Align>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_type: Option<ListType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_level: Option<u8>,
}

macro_rules! for_each_field {
    ($macro:ident) => {
        $macro!(
            bold, italic, underline, strikethrough, font_size, font_family, color,
            background_color, link, heading, align, list_type, list_level
        )
    };
}

impl Attributes {
    /// Returns true when no field is set.
    pub fn is_empty(&self) -> bool {
        macro_rules! all_none {
            ($($field:ident),+) => { true $(&& self.$field.is_none())+ };
        }
        for_each_field!(all_none)
    }

    /// Overlays every set field of `other` onto `self`.
    pub fn merge(&mut self, other: &Attributes) {
        macro_rules! overlay {
            ($($field:ident),+) => {
                $(if let Some(value) = &other.$field {
                    self.$field = Some(value.clone());
                })+
            };
        }
        for_each_field!(overlay);
    }

    /// Union of two attribute sets for concurrent formats.
    ///
    /// Fields only one side sets are taken as-is. When both sides set the
    /// same field, booleans are OR-ed and every other type takes the value
    /// from `winner` (the higher-priority operation).
    pub fn union_with(&self, other: &Attributes, self_is_winner: bool) -> Attributes {
        let mut out = Attributes::default();
        macro_rules! pick {
            ($($field:ident),+) => {
                $(out.$field = match (&self.$field, &other.$field) {
                    (None, None) => None,
                    (Some(v), None) | (None, Some(v)) => Some(v.clone()),
                    (Some(ours), Some(theirs)) => {
                        if self_is_winner {
                            Some(ours.clone())
                        } else {
                            Some(theirs.clone())
                        }
                    }
                };)+
            };
        }
        for_each_field!(pick);
        // Booleans are OR-ed regardless of priority.
        out.bold = or_bools(self.bold, other.bold);
        out.italic = or_bools(self.italic, other.italic);
        out.underline = or_bools(self.underline, other.underline);
        out.strikethrough = or_bools(self.strikethrough, other.strikethrough);
        out
    }
}

fn or_bools(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x),
        (Some(x), Some(y)) => Some(x || y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bold() -> Attributes {
        Attributes {
            bold: Some(true),
            ..Default::default()
        }
    }

    fn italic() -> Attributes {
        Attributes {
            italic: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn empty_and_merge() {
        let mut attrs = Attributes::default();
        assert!(attrs.is_empty());
        attrs.merge(&bold());
        assert!(!attrs.is_empty());
        assert_eq!(attrs.bold, Some(true));
        assert_eq!(attrs.italic, None);
    }

    #[test]
    fn union_ors_booleans() {
        let merged = bold().union_with(&italic(), true);
        assert_eq!(merged.bold, Some(true));
        assert_eq!(merged.italic, Some(true));
    }

    #[test]
    fn union_prefers_winner_for_values() {
        let red = Attributes {
            color: Some("#ff0000".into()),
            ..Default::default()
        };
        let blue = Attributes {
            color: Some("#0000ff".into()),
            ..Default::default()
        };
        assert_eq!(red.union_with(&blue, true).color.as_deref(), Some("#ff0000"));
        assert_eq!(red.union_with(&blue, false).color.as_deref(), Some("#0000ff"));
    }

    #[test]
    fn absent_fields_stay_off_the_wire() {
        let json = serde_json::to_string(&bold()).unwrap();
        assert_eq!(json, r#"{"bold":true}"#);
    }
}
