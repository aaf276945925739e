/// Face directory collection every student face is indexed into
pub const COLLECTION_ID: &str = "students";

/// Minimum similarity (percent) for a face search to count as a match
pub const FACE_MATCH_THRESHOLD: f32 = 60.0;

/// Status written on attendance records created by recognition
pub const STATUS_PRESENT: &str = "PRESENT";

/// Column order shared by export, template and import
pub const ATTENDANCE_COLUMNS: [&str; 7] = [
    "doc_id",
    "student_id",
    "name",
    "subject_id",
    "subject_name",
    "timestamp",
    "status",
];

pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Default number of conversation turns kept, system turn included
pub const DEFAULT_MAX_MEMORY: usize = 20;

/// Seed turn for every new conversation
pub const SYSTEM_CONTEXT: &str = "You are Gemini, a somewhat witty (but polite) AI assistant.
Facial Recognition Attendance system features:

1) Face directory:
   - A 'students' collection is ensured on startup.
   - /register indexes a face under (name + student_id).
   - /recognize detects faces in an uploaded image and logs attendance for every match.

2) Attendance:
   - 'attendance' collection: { student_id, name, timestamp, subject_id, subject_name, status='PRESENT' }.
   - UI has tabs: Register, Recognize, Subjects, Attendance.
   - Attendance can be filtered, edited inline, downloaded and uploaded as Excel.

3) Subjects:
   - Subjects live in the 'subjects' collection and can be picked during recognition.

4) Multi-face:
   - Every recognized face in a group photo is logged separately.

5) Chat:
   - You are the assistant, a bit humorous, guiding usage or code features.
";
