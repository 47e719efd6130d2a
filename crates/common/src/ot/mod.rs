// Operational transform on plain-text snapshots.
//
// Positions address UTF-8 byte offsets in the snapshot as it was before
// the component applied. Transform follows the ShareJS text convention:
// `transform(op, base, side)` rebases `op` onto a snapshot that already
// has `base` applied, with `side` breaking ties between inserts at the
// same position.

mod diff;
mod hash;

pub use diff::diff;
pub use hash::{content_hash, content_hash_hex};

use thiserror::Error;

use crate::update::Component;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    #[error("Delete component '{expected}' does not match deleted text '{actual}'")]
    DeleteMismatch { expected: String, actual: String },
    #[error("Comment component '{expected}' does not match commented text '{actual}'")]
    CommentMismatch { expected: String, actual: String },
    #[error("Position {position} is out of range for a snapshot of {len} bytes")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("Position {position} does not fall on a UTF-8 character boundary")]
    NotCharBoundary { position: usize },
    #[error("Delete ops delete different text in the same region of the document")]
    InconsistentDelete,
}

/// Which side of a concurrent pair an op is on. The first-applied op is
/// `Right` relative to the incoming one; the incoming op is transformed
/// with `Left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Applies `op` to `snapshot`, producing the new snapshot.
///
/// Deletions and comments verify the expected text before touching the
/// snapshot; a mismatch fails the whole op without partial effects on
/// the returned value (the input snapshot is never mutated).
pub fn apply(snapshot: &str, op: &[Component]) -> Result<String, OtError> {
    let mut text = snapshot.to_owned();
    for component in op {
        apply_component(&mut text, component)?;
    }
    Ok(text)
}

fn apply_component(text: &mut String, component: &Component) -> Result<(), OtError> {
    let position = component.position();
    if position > text.len() {
        return Err(OtError::PositionOutOfBounds { position, len: text.len() });
    }
    if !text.is_char_boundary(position) {
        return Err(OtError::NotCharBoundary { position });
    }

    match component {
        Component::Insertion { i, .. } => {
            text.insert_str(position, i);
        }
        Component::Deletion { d, .. } => {
            let actual = expected_slice(text, position, d.len());
            if actual != d {
                return Err(OtError::DeleteMismatch {
                    expected: d.clone(),
                    actual: actual.to_owned(),
                });
            }
            text.replace_range(position..position + d.len(), "");
        }
        Component::Comment { c, .. } => {
            let actual = expected_slice(text, position, c.len());
            if actual != c {
                return Err(OtError::CommentMismatch {
                    expected: c.clone(),
                    actual: actual.to_owned(),
                });
            }
        }
    }
    Ok(())
}

/// The snapshot slice a deletion/comment claims to cover, clamped to the
/// snapshot end and floored to a character boundary so the comparison
/// itself cannot fail.
fn expected_slice(text: &str, position: usize, len: usize) -> &str {
    let mut end = (position + len).min(text.len());
    while end > position && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[position..end]
}

/// Rebases `op` onto a snapshot that already has `base` applied.
pub fn transform(op: &[Component], base: &[Component], side: Side) -> Result<Vec<Component>, OtError> {
    let mut current: Vec<Component> = op.to_vec();
    for base_component in base {
        let mut next = Vec::with_capacity(current.len());
        for component in &current {
            transform_component(&mut next, component, base_component, side)?;
        }
        current = next;
    }
    Ok(current)
}

fn transform_component(
    dest: &mut Vec<Component>,
    component: &Component,
    other: &Component,
    side: Side,
) -> Result<(), OtError> {
    match component {
        Component::Insertion { i, p, u } => {
            push(dest, Component::Insertion {
                i: i.clone(),
                p: transform_position(*p, other, side == Side::Right),
                u: *u,
            });
        }
        Component::Deletion { d, p, u } => transform_deletion(dest, d, *p, *u, other)?,
        Component::Comment { c, p, t } => transform_comment(dest, c, *p, t, other)?,
    }
    Ok(())
}

fn transform_deletion(
    dest: &mut Vec<Component>,
    text: &str,
    position: usize,
    undo: Option<bool>,
    other: &Component,
) -> Result<(), OtError> {
    match other {
        Component::Insertion { i, p: other_p, .. } => {
            // The concurrent insert may split the deletion in two.
            let mut tail = text;
            if position < *other_p {
                let split = (*other_p - position).min(text.len());
                let (head, rest) = split_checked(text, split)?;
                push(dest, Component::Deletion { d: head.to_owned(), p: position, u: undo });
                tail = rest;
            }
            if !tail.is_empty() {
                push(dest, Component::Deletion {
                    d: tail.to_owned(),
                    p: position + i.len(),
                    u: undo,
                });
            }
            Ok(())
        }
        Component::Deletion { d: other_text, p: other_p, .. } => {
            let start = position;
            let end = position + text.len();
            let other_start = *other_p;
            let other_end = *other_p + other_text.len();

            if start >= other_end {
                push(dest, Component::Deletion {
                    d: text.to_owned(),
                    p: start - other_text.len(),
                    u: undo,
                });
            } else if end <= other_start {
                push(dest, Component::Deletion { d: text.to_owned(), p: start, u: undo });
            } else {
                // Overlap: the doubly-deleted region is already gone.
                let intersect_start = start.max(other_start);
                let intersect_end = end.min(other_end);
                let ours = slice_checked(text, intersect_start - start, intersect_end - start)?;
                let theirs = slice_checked(
                    other_text,
                    intersect_start - other_start,
                    intersect_end - other_start,
                )?;
                if ours != theirs {
                    return Err(OtError::InconsistentDelete);
                }

                let mut kept = String::new();
                if start < other_start {
                    kept.push_str(slice_checked(text, 0, other_start - start)?);
                }
                if end > other_end {
                    kept.push_str(slice_checked(text, other_end - start, text.len())?);
                }
                if !kept.is_empty() {
                    push(dest, Component::Deletion {
                        d: kept,
                        p: transform_position(start, other, false),
                        u: undo,
                    });
                }
            }
            Ok(())
        }
        Component::Comment { .. } => {
            push(dest, Component::Deletion { d: text.to_owned(), p: position, u: undo });
            Ok(())
        }
    }
}

fn transform_comment(
    dest: &mut Vec<Component>,
    text: &str,
    position: usize,
    thread: &Option<String>,
    other: &Component,
) -> Result<(), OtError> {
    match other {
        Component::Insertion { i, p: other_p, .. } => {
            if position < *other_p && *other_p < position + text.len() {
                // Insert landed inside the commented region: absorb it.
                let (head, tail) = split_checked(text, *other_p - position)?;
                let mut merged = String::with_capacity(text.len() + i.len());
                merged.push_str(head);
                merged.push_str(i);
                merged.push_str(tail);
                push(dest, Component::Comment { c: merged, p: position, t: thread.clone() });
            } else {
                push(dest, Component::Comment {
                    c: text.to_owned(),
                    p: transform_position(position, other, true),
                    t: thread.clone(),
                });
            }
            Ok(())
        }
        Component::Deletion { d, p: other_p, .. } => {
            let start = position;
            let end = position + text.len();
            let other_start = *other_p;
            let other_end = *other_p + d.len();

            if start >= other_end {
                push(dest, Component::Comment {
                    c: text.to_owned(),
                    p: start - d.len(),
                    t: thread.clone(),
                });
            } else if end <= other_start {
                push(dest, Component::Comment { c: text.to_owned(), p: start, t: thread.clone() });
            } else {
                // The delete removed part of the commented region.
                let keep_head_to = other_start.saturating_sub(start).min(text.len());
                let keep_tail_from = (other_end - start).min(text.len());
                let head = slice_checked(text, 0, keep_head_to)?;
                let tail = slice_checked(text, keep_tail_from, text.len())?;
                let mut merged = String::with_capacity(head.len() + tail.len());
                merged.push_str(head);
                merged.push_str(tail);
                push(dest, Component::Comment {
                    c: merged,
                    p: transform_position(start, other, false),
                    t: thread.clone(),
                });
            }
            Ok(())
        }
        Component::Comment { .. } => {
            push(dest, Component::Comment { c: text.to_owned(), p: position, t: thread.clone() });
            Ok(())
        }
    }
}

/// Maps a position through a single already-applied component.
///
/// `insert_after` controls the tie at an equal insert position: when
/// true the position shifts past the inserted text.
fn transform_position(position: usize, other: &Component, insert_after: bool) -> usize {
    match other {
        Component::Insertion { i, p, .. } => {
            if *p < position || (*p == position && insert_after) {
                position + i.len()
            } else {
                position
            }
        }
        Component::Deletion { d, p, .. } => {
            if position <= *p {
                position
            } else if position <= *p + d.len() {
                *p
            } else {
                position - d.len()
            }
        }
        Component::Comment { .. } => position,
    }
}

fn push(dest: &mut Vec<Component>, component: Component) {
    match &component {
        Component::Insertion { i, .. } if i.is_empty() => return,
        Component::Deletion { d, .. } if d.is_empty() => return,
        _ => {}
    }
    dest.push(component);
}

fn split_checked(text: &str, at: usize) -> Result<(&str, &str), OtError> {
    if at > text.len() || !text.is_char_boundary(at) {
        return Err(OtError::NotCharBoundary { position: at });
    }
    Ok(text.split_at(at))
}

fn slice_checked(text: &str, from: usize, to: usize) -> Result<&str, OtError> {
    if from > to || to > text.len() {
        return Err(OtError::PositionOutOfBounds { position: to, len: text.len() });
    }
    if !text.is_char_boundary(from) {
        return Err(OtError::NotCharBoundary { position: from });
    }
    if !text.is_char_boundary(to) {
        return Err(OtError::NotCharBoundary { position: to });
    }
    Ok(&text[from..to])
}

#[cfg(test)]
mod tests {
    use super::{apply, transform, OtError, Side};
    use crate::update::Component;

    #[test]
    fn applies_insertions_at_byte_offsets() {
        let result = apply("foo", &[Component::insertion("X", 0)]).expect("apply should succeed");
        assert_eq!(result, "Xfoo");

        let result = apply("né", &[Component::insertion("e", 3)]).expect("apply should succeed");
        assert_eq!(result, "née");
    }

    #[test]
    fn rejects_insertion_past_the_end_and_mid_character() {
        assert_eq!(
            apply("ab", &[Component::insertion("X", 3)]),
            Err(OtError::PositionOutOfBounds { position: 3, len: 2 })
        );
        assert_eq!(
            apply("é", &[Component::insertion("X", 1)]),
            Err(OtError::NotCharBoundary { position: 1 })
        );
    }

    #[test]
    fn deletion_mismatch_reports_both_texts() {
        let error = apply("fooBar", &[Component::deletion("bar", 3)])
            .expect_err("mismatched deletion should fail");
        assert_eq!(
            error.to_string(),
            "Delete component 'bar' does not match deleted text 'Bar'"
        );
    }

    #[test]
    fn comment_verifies_but_does_not_mutate() {
        let result =
            apply("hello", &[Component::comment("ell", 1)]).expect("apply should succeed");
        assert_eq!(result, "hello");

        let error = apply("hello", &[Component::comment("xyz", 1)])
            .expect_err("mismatched comment should fail");
        assert!(matches!(error, OtError::CommentMismatch { .. }));
    }

    #[test]
    fn empty_op_is_identity() {
        assert_eq!(apply("snapshot", &[]).expect("apply should succeed"), "snapshot");
        let op = vec![Component::insertion("Y", 2)];
        assert_eq!(transform(&op, &[], Side::Left).expect("transform should succeed"), op);
    }

    #[test]
    fn transform_shifts_insert_past_concurrent_insert() {
        // Base applied insert "X"@1 to "AB"; the late insert "Y"@2 lands after it.
        let transformed = transform(
            &[Component::insertion("Y", 2)],
            &[Component::insertion("X", 1)],
            Side::Left,
        )
        .expect("transform should succeed");
        assert_eq!(transformed, vec![Component::insertion("Y", 3)]);
    }

    #[test]
    fn concurrent_insert_ties_converge() {
        // The Left side keeps its position at an equal-offset tie, the
        // Right side shifts past it; both linearizations must agree.
        let late = transform(
            &[Component::insertion("B", 1)],
            &[Component::insertion("A", 1)],
            Side::Left,
        )
        .expect("transform should succeed");
        let base_first = apply(&apply("xy", &[Component::insertion("A", 1)]).unwrap(), &late)
            .expect("apply should succeed");
        let other = transform(
            &[Component::insertion("A", 1)],
            &[Component::insertion("B", 1)],
            Side::Right,
        )
        .expect("transform should succeed");
        let late_first = apply(&apply("xy", &[Component::insertion("B", 1)]).unwrap(), &other)
            .expect("apply should succeed");
        assert_eq!(base_first, late_first);
    }

    #[test]
    fn transform_splits_deletion_around_concurrent_insert() {
        // Doc "abcdef": we delete "cde"@2 while "XY"@3 was applied first.
        let transformed = transform(
            &[Component::deletion("cde", 2)],
            &[Component::insertion("XY", 3)],
            Side::Left,
        )
        .expect("transform should succeed");
        assert_eq!(
            transformed,
            vec![Component::deletion("c", 2), Component::deletion("de", 4)]
        );

        let base = apply("abcdef", &[Component::insertion("XY", 3)]).unwrap();
        assert_eq!(apply(&base, &transformed).expect("apply should succeed"), "abXYf");
    }

    #[test]
    fn overlapping_deletes_drop_the_common_region() {
        // Doc "abcdef": base deleted "cd"@2, we delete "de"@3 → only "e" remains ours.
        let transformed = transform(
            &[Component::deletion("de", 3)],
            &[Component::deletion("cd", 2)],
            Side::Left,
        )
        .expect("transform should succeed");
        assert_eq!(transformed, vec![Component::deletion("e", 2)]);
    }

    #[test]
    fn overlapping_deletes_with_different_text_fail() {
        let error = transform(
            &[Component::deletion("xx", 2)],
            &[Component::deletion("cd", 2)],
            Side::Left,
        )
        .expect_err("inconsistent overlap should fail");
        assert_eq!(error, OtError::InconsistentDelete);
    }

    #[test]
    fn comment_absorbs_insert_inside_its_region() {
        let transformed = transform(
            &[Component::Comment { c: "bcd".into(), p: 1, t: Some("th-1".into()) }],
            &[Component::insertion("XY", 2)],
            Side::Left,
        )
        .expect("transform should succeed");
        assert_eq!(
            transformed,
            vec![Component::Comment { c: "bXYcd".into(), p: 1, t: Some("th-1".into()) }]
        );
    }

    #[test]
    fn comment_shrinks_under_overlapping_delete() {
        // Doc "abcdef", comment "bcde"@1, base deleted "cd"@2.
        let transformed = transform(
            &[Component::Comment { c: "bcde".into(), p: 1, t: None }],
            &[Component::deletion("cd", 2)],
            Side::Left,
        )
        .expect("transform should succeed");
        assert_eq!(transformed, vec![Component::Comment { c: "be".into(), p: 1, t: None }]);
    }

    #[test]
    fn multibyte_positions_stay_byte_accurate() {
        // "é" is two bytes; deleting it shifts later positions by two.
        let transformed = transform(
            &[Component::insertion("!", 4)],
            &[Component::deletion("é", 1)],
            Side::Left,
        )
        .expect("transform should succeed");
        assert_eq!(transformed, vec![Component::insertion("!", 2)]);
    }
}
