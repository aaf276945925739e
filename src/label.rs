use std::fmt;

/// Separator between name and student id in the external face label
pub const LABEL_SEPARATOR: char = '_';

/// Student id reported when a label carries no separator
pub const UNKNOWN_ID: &str = "Unknown";

/// Identity a face is indexed under
///
/// The face directory only stores a single string per face, so the label is
/// encoded as `"<name>_<student_id>"` on the wire. Names are sanitized so they
/// never contain the separator; student ids may, since decoding splits on the
/// first separator only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceLabel {
    pub name: String,
    pub student_id: String,
}

impl FaceLabel {
    /// Build a label from operator input, sanitizing the display name
    pub fn new(name: &str, student_id: &str) -> Self {
        Self {
            name: sanitize_name(name),
            student_id: student_id.to_string(),
        }
    }

    /// Wire form used as the face directory's external image id
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.name, LABEL_SEPARATOR, self.student_id)
    }

    /// Parse a wire label, splitting on the first separator
    ///
    /// A label without a separator yields the whole string as the name and
    /// [`UNKNOWN_ID`] as the student id.
    pub fn decode(raw: &str) -> Self {
        match raw.split_once(LABEL_SEPARATOR) {
            Some((name, id)) => Self {
                name: name.to_string(),
                student_id: id.to_string(),
            },
            None => Self {
                name: raw.to_string(),
                student_id: UNKNOWN_ID.to_string(),
            },
        }
    }

    /// True when the label resolved to a real student
    pub fn is_known(&self) -> bool {
        self.student_id != UNKNOWN_ID
    }
}

impl fmt::Display for FaceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Replace everything except ASCII alphanumerics, `-` and `.` with `-`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Student ids must fit the face directory's external id alphabet
pub fn is_valid_student_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':'))
}
