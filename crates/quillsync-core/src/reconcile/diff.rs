//! Minimal edit script between two editor snapshots
//!
//! The editor hands the reconciler whole buffer snapshots; this turns a
//! pair of snapshots into at most one delete plus one insert by trimming
//! the common prefix and suffix. Character-based, so multi-byte text is
//! handled in the same units the CRDT uses.

use crate::crdt::EditOp;

/// Compute the edit script turning `old` into `new`.
///
/// Returns at most two edits: a delete of the changed span, then an
/// insert at the same position. Positions are visible character indices
/// against `old` after the delete has been applied.
pub fn diff(old: &str, new: &str) -> Vec<EditOp> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix = 0;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut edits = Vec::with_capacity(2);
    let deleted = old_chars.len() - prefix - suffix;
    if deleted > 0 {
        edits.push(EditOp::Delete {
            at: prefix,
            len: deleted,
        });
    }
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    if !inserted.is_empty() {
        edits.push(EditOp::Insert {
            at: prefix,
            text: inserted,
        });
    }
    edits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_is_empty() {
        assert!(diff("hello", "hello").is_empty());
        assert!(diff("", "").is_empty());
    }

    #[test]
    fn test_pure_insert() {
        assert_eq!(
            diff("", "hello"),
            vec![EditOp::Insert {
                at: 0,
                text: "hello".to_string()
            }]
        );
        assert_eq!(
            diff("held", "hello world"),
            vec![EditOp::Insert {
                at: 3,
                text: "lo worl".to_string()
            }]
        );
    }

    #[test]
    fn test_append() {
        assert_eq!(
            diff("abc", "abcd"),
            vec![EditOp::Insert {
                at: 3,
                text: "d".to_string()
            }]
        );
    }

    #[test]
    fn test_insert_in_middle() {
        assert_eq!(
            diff("acd", "abcd"),
            vec![EditOp::Insert {
                at: 1,
                text: "b".to_string()
            }]
        );
    }

    #[test]
    fn test_pure_delete() {
        assert_eq!(
            diff("abcd", "ad"),
            vec![EditOp::Delete { at: 1, len: 2 }]
        );
        assert_eq!(
            diff("abc", ""),
            vec![EditOp::Delete { at: 0, len: 3 }]
        );
    }

    #[test]
    fn test_replace_middle() {
        assert_eq!(
            diff("the cat sat", "the dog sat"),
            vec![
                EditOp::Delete { at: 4, len: 3 },
                EditOp::Insert {
                    at: 4,
                    text: "dog".to_string()
                }
            ]
        );
    }

    #[test]
    fn test_multibyte_chars_counted_as_chars() {
        // Prefix "héllo " is 6 chars regardless of byte width
        assert_eq!(
            diff("héllo wörld", "héllo mönde"),
            vec![
                EditOp::Delete { at: 6, len: 4 },
                EditOp::Insert {
                    at: 6,
                    text: "mönd".to_string()
                }
            ]
        );
    }

    #[test]
    fn test_repeated_chars_do_not_over_trim() {
        // Prefix and suffix trimming must not overlap on "aaa" -> "aa"
        assert_eq!(
            diff("aaa", "aa"),
            vec![EditOp::Delete { at: 2, len: 1 }]
        );
        assert_eq!(
            diff("aa", "aaa"),
            vec![EditOp::Insert {
                at: 2,
                text: "a".to_string()
            }]
        );
    }
}
