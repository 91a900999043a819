//! Layer 7: Events emitted to the editor.
//!
//! One linear stream per replica: text mutations plus the minimal
//! add/remove stream for annotations. Within one processed operation the
//! order is removals, then additions, then derived text events.
//! `end_index` is exclusive everywhere; endpoint inclusivity is carried
//! by the annotation's `end_closed` flag, not by the index.

use serde::{Deserialize, Serialize};

use super::annotation::{Annotation, RemoveReason};
use super::identity::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocEvent<P> {
    Insert {
        index: usize,
        text: String,
        positions: Vec<P>,
    },
    Delete {
        index: usize,
        text: String,
        positions: Vec<P>,
    },
    AnnotationAdded {
        start_index: usize,
        end_index: usize,
        annotation: Annotation<P>,
    },
    AnnotationRemoved {
        start_index: usize,
        end_index: usize,
        annotation: Annotation<P>,
        reason: RemoveReason,
        /// Author of the record that terminated the annotation (not of
        /// the annotation itself).
        author: UserId,
    },
}
