//! Bullet journal store.
//! Line classification, the per-date → master-log migration, task carry-forward,
//! and the cache/folder-mirror façade the `bujo` binary is built on.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{io, path::PathBuf};

    /* ---------------------------- Storage keys ---------------------------- */

    /// Cache key of the legacy per-date collection (JSON array of `LogEntry`).
    pub const LEGACY_KEY: &str = "bujo_logs";

    /// Cache key of the master log blob.
    pub const MASTER_KEY: &str = "bujo_master_log";

    /* ------------------------------- Sigils ------------------------------- */

    pub mod sigil {
        pub const TASK: char = '.';
        pub const NOTE: char = '-';
        pub const MIGRATE: char = '>';
        pub const DONE: char = 'x';
        pub const EVENT: char = 'o';
        pub const NOTE_ARROW: char = '→';
        pub const FEELING: char = '=';
        pub const HEADER: char = '#';
    }

    /// Semantic kind of one journal line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum LineKind {
        Task,
        Done,
        Note,
        Migrate,
        Event,
        Feeling,
        Header,
        Plain,
        Blank,
    }

    impl LineKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                LineKind::Task => "task",
                LineKind::Done => "done",
                LineKind::Note => "note",
                LineKind::Migrate => "migrate",
                LineKind::Event => "event",
                LineKind::Feeling => "feeling",
                LineKind::Header => "header",
                LineKind::Plain => "plain",
                LineKind::Blank => "blank",
            }
        }
    }

    /// A classified line, borrowing from the text it was cut from.
    ///
    /// `prefix` + `sigil` + `rest` always reassembles the original line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct Line<'a> {
        pub kind: LineKind,
        pub sigil: Option<char>,
        pub prefix: &'a str,
        pub rest: &'a str,
    }

    impl Line<'_> {
        pub fn render(&self) -> String {
            let mut out = String::with_capacity(self.prefix.len() + self.rest.len() + 4);
            out.push_str(self.prefix);
            if let Some(c) = self.sigil {
                out.push(c);
            }
            out.push_str(self.rest);
            out
        }

        /// Same line with its sigil swapped; lines without a sigil are returned unchanged.
        pub fn with_sigil(&self, replacement: char) -> String {
            match self.sigil {
                Some(_) => format!("{}{}{}", self.prefix, replacement, self.rest),
                None => self.render(),
            }
        }
    }

    /* ------------------------------ Legacy model ------------------------------ */

    /// One day of the legacy per-date generation, as stored under `LEGACY_KEY`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LogEntry {
        /// ISO 8601 calendar date (`YYYY-MM-DD`), unique within a collection.
        pub date: String,
        pub content: String,
    }

    /// The legacy collection: date → content, kept in insertion order.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct LegacyLog {
        pub entries: IndexMap<String, String>,
    }

    impl LegacyLog {
        pub fn from_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
            let mut log = Self::default();
            for entry in entries {
                log.entries.insert(entry.date, entry.content);
            }
            log
        }

        pub fn from_json(raw: &str) -> StoreResult<Self> {
            let entries: Vec<LogEntry> =
                serde_json::from_str(raw).map_err(StoreError::MalformedLegacyData)?;
            Ok(Self::from_entries(entries))
        }

        pub fn to_json(&self) -> serde_json::Result<String> {
            serde_json::to_string(&self.to_entries())
        }

        pub fn to_entries(&self) -> Vec<LogEntry> {
            self.entries
                .iter()
                .map(|(date, content)| LogEntry {
                    date: date.clone(),
                    content: content.clone(),
                })
                .collect()
        }

        /// Content saved for `date`, or `""`.
        pub fn content(&self, date: &str) -> &str {
            self.entries.get(date).map(String::as_str).unwrap_or("")
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        /// Entries ordered by date string. ISO dates sort chronologically.
        pub fn sorted(&self) -> Vec<(&str, &str)> {
            let mut out: Vec<(&str, &str)> = self
                .entries
                .iter()
                .map(|(d, c)| (d.as_str(), c.as_str()))
                .collect();
            out.sort_by(|a, b| a.0.cmp(b.0));
            out
        }
    }

    /* ------------------------------ Master model ------------------------------ */

    /// The single journal blob of the current generation.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MasterLog(pub String);

    impl MasterLog {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        pub fn into_string(self) -> String {
            self.0
        }
    }

    /// Which data model the cache currently holds.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Generation {
        /// Nothing saved yet.
        Empty,
        /// A legacy collection is present; a master blob may already exist next to it.
        Legacy {
            legacy: LegacyLog,
            existing: Option<MasterLog>,
        },
        Master(MasterLog),
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("legacy log collection is malformed: {0}")]
        MalformedLegacyData(#[source] serde_json::Error),
        #[error("read-write permission not granted for folder {0}")]
        FolderPermissionDenied(String),
        #[error("folder file {path:?}: {source}")]
        FolderIo {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("folder selection was cancelled")]
        UserCancelledSelection,
        #[error("storage unavailable: {0}")]
        StorageUnavailable(String),
    }

    impl From<rusqlite::Error> for StoreError {
        fn from(value: rusqlite::Error) -> Self {
            Self::StorageUnavailable(value.to_string())
        }
    }

    pub type StoreResult<T> = Result<T, StoreError>;
}

pub mod classify {
    //! Sigil classification, one line at a time.

    use crate::core::{Line, LineKind, sigil};

    /// Semantic kind of a sigil character, if it is one.
    pub fn sigil_kind(c: char) -> Option<LineKind> {
        match c {
            sigil::TASK => Some(LineKind::Task),
            sigil::NOTE | sigil::NOTE_ARROW => Some(LineKind::Note),
            sigil::MIGRATE => Some(LineKind::Migrate),
            sigil::DONE => Some(LineKind::Done),
            sigil::EVENT => Some(LineKind::Event),
            sigil::FEELING => Some(LineKind::Feeling),
            sigil::HEADER => Some(LineKind::Header),
            _ => None,
        }
    }

    /// Classify a single line (no trailing newline) by its first non-whitespace character.
    pub fn classify(line: &str) -> Line<'_> {
        let trimmed = line.trim_start();
        let Some(first) = trimmed.chars().next() else {
            return Line {
                kind: LineKind::Blank,
                sigil: None,
                prefix: "",
                rest: line,
            };
        };
        match sigil_kind(first) {
            Some(kind) => {
                let at = line.len() - trimmed.len();
                Line {
                    kind,
                    sigil: Some(first),
                    prefix: &line[..at],
                    rest: &line[at + first.len_utf8()..],
                }
            }
            None => Line {
                kind: LineKind::Plain,
                sigil: None,
                prefix: "",
                rest: line,
            },
        }
    }

    /// Classify every `\n`-separated line of a blob.
    pub fn classify_text(text: &str) -> impl Iterator<Item = Line<'_>> {
        text.split('\n').map(classify)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn every_sigil_maps_to_its_kind() {
            let cases = [
                (". buy milk", LineKind::Task),
                ("- a note", LineKind::Note),
                ("→ also a note", LineKind::Note),
                ("> move me", LineKind::Migrate),
                ("x finished", LineKind::Done),
                ("o dentist 3pm", LineKind::Event),
                ("= tired", LineKind::Feeling),
                ("# Monday", LineKind::Header),
            ];
            for (line, kind) in cases {
                assert_eq!(classify(line).kind, kind, "line {line:?}");
            }
        }

        #[test]
        fn leading_whitespace_becomes_prefix() {
            let line = classify("    > call bank");
            assert_eq!(line.kind, LineKind::Migrate);
            assert_eq!(line.prefix, "    ");
            assert_eq!(line.sigil, Some('>'));
            assert_eq!(line.rest, " call bank");
        }

        #[test]
        fn multibyte_arrow_splits_on_char_boundary() {
            let line = classify("\t→ read later");
            assert_eq!(line.prefix, "\t");
            assert_eq!(line.sigil, Some('→'));
            assert_eq!(line.rest, " read later");
        }

        #[test]
        fn blank_and_plain_lines() {
            assert_eq!(classify("").kind, LineKind::Blank);
            assert_eq!(classify("   \t").kind, LineKind::Blank);

            let plain = classify("  just words");
            assert_eq!(plain.kind, LineKind::Plain);
            assert_eq!(plain.sigil, None);
            assert_eq!(plain.rest, "  just words");
        }

        #[test]
        fn render_reassembles_input() {
            let text = ". one\n  > two\n\nplain\n  \n= three→\n#";
            for (line, original) in classify_text(text).zip(text.split('\n')) {
                assert_eq!(line.render(), original);
                // classification is deterministic
                assert_eq!(classify(original), line);
            }
        }

        #[test]
        fn with_sigil_keeps_prefix_and_rest() {
            assert_eq!(classify("  > buy milk").with_sigil('.'), "  . buy milk");
            assert_eq!(classify("no sigil").with_sigil('.'), "no sigil");
        }
    }
}

pub mod sections {
    //! Dated `--- YYYY-MM-DD ---` sections inside the master log.
    //!
    //! Sections are located line-by-line; text outside the targeted section is never
    //! rewritten.

    use chrono::NaiveDate;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, space0, space1},
        combinator::{eof, map_res, recognize},
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Delimiter line for a date section.
    pub fn render_header(date: &str) -> String {
        format!("--- {date} ---")
    }

    /// Date of a delimiter line, if `line` is one.
    pub fn parse_header(line: &str) -> Option<NaiveDate> {
        header(line).ok().map(|(_, date)| date)
    }

    fn header(i: &str) -> PResult<'_, NaiveDate> {
        let (i, _) = tuple((space0, tag("---"), space1))(i)?;
        let (i, date) = map_res(iso_date, |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d"))(i)?;
        let (i, _) = tuple((space1, tag("---"), space0, eof))(i)?;
        Ok((i, date))
    }

    fn iso_date(i: &str) -> PResult<'_, &str> {
        recognize(tuple((digits4, char('-'), digits2, char('-'), digits2)))(i)
    }

    fn digits4(i: &str) -> PResult<'_, &str> {
        take_while_m_n(4, 4, |c: char| c.is_ascii_digit())(i)
    }

    fn digits2(i: &str) -> PResult<'_, &str> {
        take_while_m_n(2, 2, |c: char| c.is_ascii_digit())(i)
    }

    /// Line range of one section: the header line and the exclusive end of its body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionSpan {
        pub date: NaiveDate,
        pub header: usize,
        pub end: usize,
    }

    pub fn section_spans(lines: &[&str]) -> Vec<SectionSpan> {
        let headers: Vec<(usize, NaiveDate)> = lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| parse_header(line).map(|date| (idx, date)))
            .collect();
        headers
            .iter()
            .enumerate()
            .map(|(n, &(header, date))| SectionSpan {
                date,
                header,
                end: headers.get(n + 1).map(|h| h.0).unwrap_or(lines.len()),
            })
            .collect()
    }

    fn split_lines(blob: &str) -> Vec<&str> {
        if blob.is_empty() {
            Vec::new()
        } else {
            blob.split('\n').collect()
        }
    }

    fn trim_trailing_blank<'a, 'b>(lines: &'b [&'a str]) -> &'b [&'a str] {
        let mut end = lines.len();
        while end > 0 && lines[end - 1].trim().is_empty() {
            end -= 1;
        }
        &lines[..end]
    }

    /// Body of the first section dated `date`, without its trailing blank separator.
    pub fn day_content(blob: &str, date: NaiveDate) -> Option<String> {
        let lines = split_lines(blob);
        let span = section_spans(&lines).into_iter().find(|s| s.date == date)?;
        Some(trim_trailing_blank(&lines[span.header + 1..span.end]).join("\n"))
    }

    /// Replace the body of `date`'s section, inserting the section in date order when absent.
    pub fn replace_day(blob: &str, date: NaiveDate, content: &str) -> String {
        let lines = split_lines(blob);
        let spans = section_spans(&lines);
        let header = render_header(&date.to_string());
        let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 4);

        if let Some(span) = spans.iter().find(|s| s.date == date) {
            out.extend_from_slice(&lines[..=span.header]);
            if !content.is_empty() {
                out.extend(content.split('\n'));
            }
            if span.end < lines.len() {
                out.push("");
                out.extend_from_slice(&lines[span.end..]);
            }
        } else {
            let insert_at = spans
                .iter()
                .find(|s| s.date > date)
                .map(|s| s.header)
                .unwrap_or(lines.len());
            let (before, after) = lines.split_at(insert_at);
            out.extend_from_slice(before);
            if out.last().is_some_and(|l| !l.trim().is_empty()) {
                out.push("");
            }
            out.push(&header);
            if !content.is_empty() {
                out.extend(content.split('\n'));
            }
            if !after.is_empty() {
                out.push("");
                out.extend_from_slice(after);
            }
        }
        out.join("\n")
    }

    /// A slice of the master log: a dated section, or text before the first header.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DaySection {
        pub date: Option<NaiveDate>,
        pub content: String,
    }

    pub fn split_sections(blob: &str) -> Vec<DaySection> {
        let lines = split_lines(blob);
        let spans = section_spans(&lines);
        let mut out = Vec::with_capacity(spans.len() + 1);

        let preamble_end = spans.first().map(|s| s.header).unwrap_or(lines.len());
        let preamble = trim_trailing_blank(&lines[..preamble_end]).join("\n");
        if !preamble.trim().is_empty() {
            out.push(DaySection {
                date: None,
                content: preamble,
            });
        }
        for span in spans {
            out.push(DaySection {
                date: Some(span.date),
                content: trim_trailing_blank(&lines[span.header + 1..span.end]).join("\n"),
            });
        }
        out
    }

}

pub mod carry {
    //! Task carry-forward: `>` lines of one day become `.` lines of the next.
    //!
    //! Carry-forward is a single hop. The next day's lines are appended without
    //! re-triggering carry-forward for that day.

    use crate::classify::classify_text;
    use crate::core::{LegacyLog, sigil};
    use crate::sections::{day_content, replace_day};
    use chrono::NaiveDate;
    use tracing::{debug, warn};

    /// Migrate lines of `content`, rewritten as tasks.
    pub fn migrated_tasks(content: &str) -> Vec<String> {
        classify_text(content)
            .filter(|line| line.sigil == Some(sigil::MIGRATE))
            .map(|line| line.with_sigil(sigil::TASK))
            .collect()
    }

    pub fn parse_day(date: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }

    /// Append each line not already present verbatim. `None` when nothing was appended.
    pub fn append_unique(existing: &str, lines: &[String]) -> Option<String> {
        let mut out = existing.to_string();
        let mut changed = false;
        for line in lines {
            if out.split('\n').any(|l| l == line) {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
            changed = true;
        }
        changed.then_some(out)
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CarryOutcome {
        /// Day that received the tasks.
        pub target: NaiveDate,
        /// Its content after appending.
        pub content: String,
    }

    /// One carry-forward hop from `date`. `load_next` supplies the next day's current content.
    pub fn carry_forward<F>(date: NaiveDate, content: &str, load_next: F) -> Option<CarryOutcome>
    where
        F: FnOnce(NaiveDate) -> String,
    {
        let tasks = migrated_tasks(content);
        if tasks.is_empty() {
            return None;
        }
        let Some(target) = date.succ_opt() else {
            warn!(%date, "no calendar day after date; carry-forward skipped");
            return None;
        };
        let existing = load_next(target);
        let content = append_unique(&existing, &tasks)?;
        debug!(%date, %target, tasks = tasks.len(), "carried migrated tasks forward");
        Some(CarryOutcome { target, content })
    }

    impl LegacyLog {
        /// Upsert `content` for `date` and carry its migrate lines into the next day.
        ///
        /// Returns the day that received tasks. Unparseable dates skip carry-forward.
        pub fn save_entry(&mut self, date: &str, content: &str) -> Option<NaiveDate> {
            self.entries.insert(date.to_string(), content.to_string());
            let Some(day) = parse_day(date) else {
                warn!(date, "unparseable entry date; carry-forward skipped");
                return None;
            };
            let outcome = carry_forward(day, content, |next| {
                self.content(&next.to_string()).to_string()
            })?;
            self.entries
                .insert(outcome.target.to_string(), outcome.content);
            Some(outcome.target)
        }
    }

    /// Carry-forward between the `date` and `date + 1` sections of a master blob.
    ///
    /// Returns the receiving day and the rewritten blob.
    pub fn carry_forward_master(blob: &str, date: NaiveDate) -> Option<(NaiveDate, String)> {
        let content = day_content(blob, date)?;
        let outcome = carry_forward(date, &content, |next| {
            day_content(blob, next).unwrap_or_default()
        })?;
        Some((
            outcome.target,
            replace_day(blob, outcome.target, &outcome.content),
        ))
    }

    /// Replace `date`'s section of `blob`, then carry its migrate lines one day forward.
    pub fn write_day(blob: &str, date: NaiveDate, content: &str) -> (Option<NaiveDate>, String) {
        let updated = replace_day(blob, date, content);
        match carry_forward_master(&updated, date) {
            Some((target, carried)) => (Some(target), carried),
            None => (None, updated),
        }
    }

}

pub mod legacy {
    //! One-time migration from the per-date collection into the master log.

    use crate::core::{
        Generation, LEGACY_KEY, LegacyLog, MASTER_KEY, MasterLog, StoreResult,
    };
    use crate::sections::render_header;
    use crate::storage::KeyValueStore;
    use tracing::{debug, info};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MigrationReport {
        pub entries: usize,
        pub prepended_to_existing: bool,
    }

    /// Render the legacy collection as dated sections, oldest first.
    pub fn render_legacy(log: &LegacyLog) -> String {
        log.sorted()
            .into_iter()
            .map(|(date, content)| format!("{}\n{}", render_header(date), content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Pure transform: legacy entries (plus an existing master blob) into a master blob.
    pub fn migrate(legacy: &LegacyLog, existing: Option<&MasterLog>) -> MasterLog {
        let rendered = render_legacy(legacy);
        match existing.filter(|m| !m.is_empty()) {
            Some(master) => MasterLog(format!("{rendered}\n\n{}", master.as_str())),
            None => MasterLog(rendered),
        }
    }

    /// Inspect the cache and report which generation it holds.
    pub fn detect<K: KeyValueStore + ?Sized>(kv: &K) -> StoreResult<Generation> {
        let master = kv.get(MASTER_KEY)?.map(MasterLog);
        match kv.get(LEGACY_KEY)? {
            Some(raw) => Ok(Generation::Legacy {
                legacy: LegacyLog::from_json(&raw)?,
                existing: master,
            }),
            None => Ok(master.map_or(Generation::Empty, Generation::Master)),
        }
    }

    /// Migrate a legacy collection if one is present. A second run is a no-op.
    ///
    /// A malformed collection is reported and both keys are left as they were.
    pub fn run_migration<K: KeyValueStore + ?Sized>(kv: &K) -> StoreResult<Option<MigrationReport>> {
        let Generation::Legacy { legacy, existing } = detect(kv)? else {
            debug!("no legacy collection present");
            return Ok(None);
        };
        if legacy.is_empty() {
            kv.remove(LEGACY_KEY)?;
            debug!("removed empty legacy collection");
            return Ok(None);
        }

        let master = migrate(&legacy, existing.as_ref());
        kv.set_and_remove(MASTER_KEY, master.as_str(), LEGACY_KEY)?;

        let report = MigrationReport {
            entries: legacy.len(),
            prepended_to_existing: existing.is_some_and(|m| !m.is_empty()),
        };
        info!(
            entries = report.entries,
            prepended = report.prepended_to_existing,
            "migrated legacy journal into master log"
        );
        Ok(Some(report))
    }

}

pub mod storage {
    //! Key-value persistence for the cache and the directory database.

    use crate::core::{StoreError, StoreResult};
    use rusqlite::{Connection, OptionalExtension, params};
    use std::{
        collections::BTreeMap,
        fs,
        path::{Path, PathBuf},
        sync::{Mutex, MutexGuard},
    };

    /// Get/set/remove by fixed string key.
    pub trait KeyValueStore: Send + Sync {
        fn get(&self, key: &str) -> StoreResult<Option<String>>;

        fn set(&self, key: &str, value: &str) -> StoreResult<()>;

        fn remove(&self, key: &str) -> StoreResult<()>;

        /// Write `set_key` and delete `remove_key` as one step where the backend allows it.
        fn set_and_remove(&self, set_key: &str, value: &str, remove_key: &str) -> StoreResult<()> {
            self.set(set_key, value)?;
            self.remove(remove_key)
        }
    }

    /// Volatile store for tests and throwaway sessions.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        values: Mutex<BTreeMap<String, String>>,
    }

    impl MemoryStore {
        fn values(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, String>>> {
            self.values
                .lock()
                .map_err(|_| StoreError::StorageUnavailable("memory store mutex poisoned".into()))
        }
    }

    impl KeyValueStore for MemoryStore {
        fn get(&self, key: &str) -> StoreResult<Option<String>> {
            Ok(self.values()?.get(key).cloned())
        }

        fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.values()?.insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn remove(&self, key: &str) -> StoreResult<()> {
            self.values()?.remove(key);
            Ok(())
        }
    }

    /// SQLite-backed store holding one `(key, value)` table.
    #[derive(Debug)]
    pub struct SqliteStore {
        conn: Mutex<Connection>,
        table: &'static str,
        path: Option<PathBuf>,
    }

    impl SqliteStore {
        /// Open (or create) the cache table `kv` at `path`.
        pub fn open(path: &Path) -> StoreResult<Self> {
            Self::open_table(path, "kv")
        }

        /// Open (or create) `table` at `path`; the schema is created on first use.
        pub fn open_table(path: &Path, table: &'static str) -> StoreResult<Self> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    StoreError::StorageUnavailable(format!("creating {:?}: {err}", parent))
                })?;
            }
            let conn = Connection::open(path)?;
            Self::init(conn, table, Some(path.to_path_buf()))
        }

        pub fn open_in_memory(table: &'static str) -> StoreResult<Self> {
            Self::init(Connection::open_in_memory()?, table, None)
        }

        fn init(conn: Connection, table: &'static str, path: Option<PathBuf>) -> StoreResult<Self> {
            debug_assert!(table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                   key   TEXT PRIMARY KEY NOT NULL,
                   value TEXT NOT NULL
                 );"
            ))?;
            Ok(Self {
                conn: Mutex::new(conn),
                table,
                path,
            })
        }

        pub fn path(&self) -> Option<&Path> {
            self.path.as_deref()
        }

        fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
            self.conn
                .lock()
                .map_err(|_| StoreError::StorageUnavailable("database mutex poisoned".into()))
        }
    }

    impl KeyValueStore for SqliteStore {
        fn get(&self, key: &str) -> StoreResult<Option<String>> {
            let conn = self.conn()?;
            let value = conn
                .query_row(
                    &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                    [key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        }

        fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            let conn = self.conn()?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    self.table
                ),
                params![key, value],
            )?;
            Ok(())
        }

        fn remove(&self, key: &str) -> StoreResult<()> {
            let conn = self.conn()?;
            conn.execute(&format!("DELETE FROM {} WHERE key = ?1", self.table), [key])?;
            Ok(())
        }

        fn set_and_remove(&self, set_key: &str, value: &str, remove_key: &str) -> StoreResult<()> {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    self.table
                ),
                params![set_key, value],
            )?;
            tx.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table),
                [remove_key],
            )?;
            tx.commit()?;
            Ok(())
        }
    }

}

pub mod folder {
    //! User-granted directories: the handle abstraction, pickers, and the registry
    //! that remembers one directory across restarts.

    use crate::core::{StoreError, StoreResult};
    use crate::storage::{KeyValueStore, SqliteStore};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize, de::DeserializeOwned};
    use std::{
        fmt,
        fs,
        io::{self, BufRead, Write},
        path::{Path, PathBuf},
    };
    use tempfile::NamedTempFile;
    use tracing::{debug, warn};
    use uuid::Uuid;

    /* ------------------------------ Permission ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum PermissionState {
        Granted,
        Denied,
        /// Access must be re-established through an explicit user action.
        Prompt,
    }

    /* -------------------------------- Handles -------------------------------- */

    /// A revocable capability on a directory.
    pub trait DirectoryHandle: fmt::Debug + Send + Sync {
        fn name(&self) -> String;

        /// Current read-write permission. Never prompts.
        fn query_permission(&self) -> PermissionState;

        /// Re-authorize access. Only call this in response to an explicit user action.
        fn request_permission(&self) -> PermissionState;

        /// Handle to `name` inside the directory. With `create` the file may be absent;
        /// it comes into existence on the first completed write.
        fn get_file(&self, name: &str, create: bool) -> io::Result<FileHandle>;
    }

    /// Granted only when the host currently reports read-write access.
    pub fn validate<H: DirectoryHandle + ?Sized>(handle: &H) -> bool {
        handle.query_permission() == PermissionState::Granted
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FileHandle {
        path: PathBuf,
    }

    impl FileHandle {
        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn read_text(&self) -> io::Result<String> {
            fs::read_to_string(&self.path)
        }

        /// Writable stream; the file is replaced atomically on `close`.
        pub fn open_writable(&self) -> io::Result<WritableFile> {
            let dir = self
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            Ok(WritableFile {
                temp: NamedTempFile::new_in(dir)?,
                target: self.path.clone(),
            })
        }
    }

    #[derive(Debug)]
    pub struct WritableFile {
        temp: NamedTempFile,
        target: PathBuf,
    }

    impl WritableFile {
        pub fn write(&mut self, text: &str) -> io::Result<()> {
            self.temp.write_all(text.as_bytes())
        }

        pub fn close(self) -> io::Result<()> {
            self.temp.as_file().sync_all()?;
            self.temp.persist(&self.target).map_err(|err| err.error)?;
            Ok(())
        }
    }

    /// Handle on a local directory, identified by a grant id.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FsDirectoryHandle {
        pub id: Uuid,
        pub path: PathBuf,
        pub granted_at: DateTime<Utc>,
    }

    impl FsDirectoryHandle {
        pub fn grant(path: PathBuf) -> Self {
            Self {
                id: Uuid::new_v4(),
                path,
                granted_at: Utc::now(),
            }
        }
    }

    impl DirectoryHandle for FsDirectoryHandle {
        fn name(&self) -> String {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        }

        fn query_permission(&self) -> PermissionState {
            match fs::metadata(&self.path) {
                Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => {
                    PermissionState::Granted
                }
                Ok(meta) if meta.is_dir() => PermissionState::Denied,
                _ => PermissionState::Prompt,
            }
        }

        fn request_permission(&self) -> PermissionState {
            if self.query_permission() == PermissionState::Prompt {
                if let Err(err) = fs::create_dir_all(&self.path) {
                    warn!(path = ?self.path, %err, "could not re-create journal folder");
                }
            }
            self.query_permission()
        }

        fn get_file(&self, name: &str, create: bool) -> io::Result<FileHandle> {
            let path = self.path.join(name);
            if create {
                if !self.path.is_dir() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} not found", self.path.display()),
                    ));
                }
            } else if !path.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ));
            }
            Ok(FileHandle { path })
        }
    }

    /* -------------------------------- Pickers -------------------------------- */

    /// Host-level directory chooser. Dismissal is `UserCancelledSelection`.
    pub trait DirectoryPicker {
        type Handle: DirectoryHandle + Serialize + 'static;

        fn pick(&mut self) -> StoreResult<Self::Handle>;
    }

    fn handle_for(path: &Path) -> StoreResult<FsDirectoryHandle> {
        let canonical = fs::canonicalize(path).map_err(|source| StoreError::FolderIo {
            path: path.to_path_buf(),
            source,
        })?;
        if !canonical.is_dir() {
            return Err(StoreError::FolderIo {
                path: canonical,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        Ok(FsDirectoryHandle::grant(canonical))
    }

    /// Picker with a predetermined answer; `None` behaves like a dismissed dialog.
    #[derive(Debug, Clone, Default)]
    pub struct PathPicker {
        pub path: Option<PathBuf>,
    }

    impl PathPicker {
        pub fn new(path: Option<PathBuf>) -> Self {
            Self { path }
        }
    }

    impl DirectoryPicker for PathPicker {
        type Handle = FsDirectoryHandle;

        fn pick(&mut self) -> StoreResult<FsDirectoryHandle> {
            match self.path.take() {
                Some(path) => handle_for(&path),
                None => Err(StoreError::UserCancelledSelection),
            }
        }
    }

    /// Interactive picker: asks for a directory path, an empty answer cancels.
    pub struct PromptPicker<R, W> {
        input: R,
        output: W,
    }

    impl<R: BufRead, W: Write> PromptPicker<R, W> {
        pub fn new(input: R, output: W) -> Self {
            Self { input, output }
        }
    }

    impl<R: BufRead, W: Write> DirectoryPicker for PromptPicker<R, W> {
        type Handle = FsDirectoryHandle;

        fn pick(&mut self) -> StoreResult<FsDirectoryHandle> {
            let prompt_io = |source: io::Error| StoreError::FolderIo {
                path: PathBuf::from("<stdin>"),
                source,
            };
            write!(self.output, "Journal folder (empty to cancel): ").map_err(prompt_io)?;
            self.output.flush().map_err(prompt_io)?;

            let mut answer = String::new();
            self.input.read_line(&mut answer).map_err(prompt_io)?;
            let answer = answer.trim();
            if answer.is_empty() {
                return Err(StoreError::UserCancelledSelection);
            }
            handle_for(Path::new(answer))
        }
    }

    /* -------------------------------- Registry -------------------------------- */

    /// Object store holding the remembered handle.
    pub const HANDLE_STORE: &str = "handles";
    /// The registry's single key.
    pub const HANDLE_KEY: &str = "root";

    /// Single-slot registry of the granted journal folder.
    #[derive(Debug)]
    pub struct FolderRegistry {
        db: SqliteStore,
    }

    impl FolderRegistry {
        pub fn open(path: &Path) -> StoreResult<Self> {
            Ok(Self {
                db: SqliteStore::open_table(path, HANDLE_STORE)?,
            })
        }

        pub fn in_memory() -> StoreResult<Self> {
            Ok(Self {
                db: SqliteStore::open_in_memory(HANDLE_STORE)?,
            })
        }

        /// Remember `handle`, replacing whatever was stored.
        pub fn persist<H: Serialize>(&self, handle: &H) -> StoreResult<()> {
            let raw = serde_json::to_string(handle)
                .map_err(|err| StoreError::StorageUnavailable(err.to_string()))?;
            self.db.set(HANDLE_KEY, &raw)
        }

        /// The stored handle, or `None` when absent or unreadable.
        pub fn restore<H: DeserializeOwned>(&self) -> Option<H> {
            match self.db.get(HANDLE_KEY) {
                Ok(Some(raw)) => match serde_json::from_str(&raw) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(%err, "stored folder handle is unreadable");
                        None
                    }
                },
                Ok(None) => None,
                Err(err) => {
                    warn!(%err, "folder registry unavailable");
                    None
                }
            }
        }

        /// Startup path: the stored handle, only while it still has permission.
        ///
        /// A handle without permission stays stored for a later explicit reconnect.
        pub fn restore_granted<H: DeserializeOwned + DirectoryHandle>(&self) -> Option<H> {
            let handle: H = self.restore()?;
            if validate(&handle) {
                debug!(folder = %handle.name(), "restored folder handle");
                Some(handle)
            } else {
                debug!(folder = %handle.name(), "folder handle lacks permission; using cache only");
                None
            }
        }

        /// Run the picker and make sure the chosen folder is writable. Does not persist.
        pub fn select<P: DirectoryPicker>(&self, picker: &mut P) -> StoreResult<P::Handle> {
            let handle = picker.pick()?;
            if handle.request_permission() != PermissionState::Granted {
                return Err(StoreError::FolderPermissionDenied(handle.name()));
            }
            Ok(handle)
        }

        pub fn forget(&self) -> StoreResult<()> {
            self.db.remove(HANDLE_KEY)
        }
    }

}

pub mod store {
    //! The log store façade: the cache is always written first; an attached folder
    //! mirror receives the same content afterwards and wins on load.

    use crate::carry::write_day;
    use crate::core::{MASTER_KEY, StoreError, StoreResult};
    use crate::folder::{DirectoryHandle, validate};
    use crate::sections::{day_content, split_sections};
    use crate::storage::KeyValueStore;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::{
        sync::{Arc, Mutex, MutexGuard, mpsc},
        thread::{self, JoinHandle},
    };
    use tracing::{debug, warn};

    /// Default name of the mirrored file inside the chosen folder.
    pub const DEFAULT_MIRROR_FILE: &str = "bujo.txt";

    /// How folder writes are issued after the cache commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MirrorMode {
        /// Written before `save` returns; failures are logged.
        #[default]
        Inline,
        /// Queued to the mirror worker thread.
        Background,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SearchMatch {
        /// Section date, when the match is scoped to one.
        pub date: Option<NaiveDate>,
        pub content: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct StoreStatus {
        pub is_file_storage: bool,
        pub folder: Option<String>,
        pub mirror_mode: MirrorMode,
        pub last_mirror_error: Option<String>,
    }

    #[derive(Debug, Clone)]
    struct Mirror {
        handle: Arc<dyn DirectoryHandle>,
    }

    type ErrorSlot = Arc<Mutex<Option<String>>>;

    fn record(slot: &ErrorSlot, value: Option<String>) {
        if let Ok(mut guard) = slot.lock() {
            *guard = value;
        }
    }

    fn read_mirror(handle: &dyn DirectoryHandle, file_name: &str) -> StoreResult<String> {
        let file = handle
            .get_file(file_name, false)
            .map_err(|source| StoreError::FolderIo {
                path: file_name.into(),
                source,
            })?;
        file.read_text().map_err(|source| StoreError::FolderIo {
            path: file.path().to_path_buf(),
            source,
        })
    }

    fn write_mirror(handle: &dyn DirectoryHandle, file_name: &str, content: &str) -> StoreResult<()> {
        let file = handle
            .get_file(file_name, true)
            .map_err(|source| StoreError::FolderIo {
                path: file_name.into(),
                source,
            })?;
        let io_err = |source| StoreError::FolderIo {
            path: file.path().to_path_buf(),
            source,
        };
        let mut writer = file.open_writable().map_err(io_err)?;
        writer.write(content).map_err(io_err)?;
        writer.close().map_err(io_err)
    }

    /* ----------------------------- Mirror worker ----------------------------- */

    enum MirrorJob {
        Write {
            handle: Arc<dyn DirectoryHandle>,
            file_name: String,
            content: String,
        },
        Flush(mpsc::Sender<()>),
    }

    /// Single background writer; jobs run in submission order.
    struct MirrorWorker {
        tx: Option<mpsc::Sender<MirrorJob>>,
        thread: Option<JoinHandle<()>>,
    }

    impl MirrorWorker {
        fn spawn(errors: ErrorSlot) -> std::io::Result<Self> {
            let (tx, rx) = mpsc::channel::<MirrorJob>();
            let thread = thread::Builder::new()
                .name("bujo-mirror".into())
                .spawn(move || {
                    for job in rx {
                        match job {
                            MirrorJob::Write {
                                handle,
                                file_name,
                                content,
                            } => match write_mirror(handle.as_ref(), &file_name, &content) {
                                Ok(()) => record(&errors, None),
                                Err(err) => {
                                    warn!(%err, "background folder write failed");
                                    record(&errors, Some(err.to_string()));
                                }
                            },
                            MirrorJob::Flush(done) => {
                                let _ = done.send(());
                            }
                        }
                    }
                })?;
            Ok(Self {
                tx: Some(tx),
                thread: Some(thread),
            })
        }

        fn submit(&self, job: MirrorJob) -> bool {
            self.tx.as_ref().is_some_and(|tx| tx.send(job).is_ok())
        }

        fn flush(&self) {
            let (done, wait) = mpsc::channel();
            if self.submit(MirrorJob::Flush(done)) {
                let _ = wait.recv();
            }
        }
    }

    impl Drop for MirrorWorker {
        fn drop(&mut self) {
            // closing the channel lets the thread drain queued writes and exit
            drop(self.tx.take());
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    /* --------------------------------- Store --------------------------------- */

    struct State {
        mirror: Option<Mirror>,
    }

    /// Cache plus optional folder mirror. Every operation is serialized on one mutex.
    pub struct LogStore {
        cache: Arc<dyn KeyValueStore>,
        file_name: String,
        mode: MirrorMode,
        state: Mutex<State>,
        mirror_error: ErrorSlot,
        worker: Option<MirrorWorker>,
    }

    impl LogStore {
        pub fn new(cache: Arc<dyn KeyValueStore>, file_name: impl Into<String>, mode: MirrorMode) -> Self {
            let mirror_error: ErrorSlot = Arc::default();
            let (mode, worker) = match mode {
                MirrorMode::Inline => (MirrorMode::Inline, None),
                MirrorMode::Background => match MirrorWorker::spawn(mirror_error.clone()) {
                    Ok(worker) => (MirrorMode::Background, Some(worker)),
                    Err(err) => {
                        warn!(%err, "mirror worker unavailable; writing folder inline");
                        (MirrorMode::Inline, None)
                    }
                },
            };
            Self {
                cache,
                file_name: file_name.into(),
                mode,
                state: Mutex::new(State { mirror: None }),
                mirror_error,
                worker,
            }
        }

        fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
            self.state
                .lock()
                .map_err(|_| StoreError::StorageUnavailable("log store mutex poisoned".into()))
        }

        fn cached(&self) -> StoreResult<String> {
            Ok(self.cache.get(MASTER_KEY)?.unwrap_or_default())
        }

        /// Mirror `handle`. An existing folder file wins over the cache; otherwise the
        /// current cache content is written into the folder. Returns the current content.
        pub fn attach_folder(&self, handle: Arc<dyn DirectoryHandle>) -> StoreResult<String> {
            if !validate(handle.as_ref()) {
                return Err(StoreError::FolderPermissionDenied(handle.name()));
            }
            let mut state = self.lock()?;
            let content = match read_mirror(handle.as_ref(), &self.file_name) {
                Ok(text) => {
                    self.cache.set(MASTER_KEY, &text)?;
                    text
                }
                Err(err) => {
                    debug!(%err, "no readable folder file; seeding it from the cache");
                    let cached = self.cached()?;
                    if let Err(err) = write_mirror(handle.as_ref(), &self.file_name, &cached) {
                        warn!(%err, "could not seed folder file");
                        record(&self.mirror_error, Some(err.to_string()));
                    }
                    cached
                }
            };
            debug!(folder = %handle.name(), "folder mirror attached");
            state.mirror = Some(Mirror { handle });
            Ok(content)
        }

        pub fn detach_folder(&self) -> StoreResult<()> {
            self.flush();
            self.lock()?.mirror = None;
            record(&self.mirror_error, None);
            Ok(())
        }

        pub fn is_file_storage(&self) -> bool {
            self.lock().map(|s| s.mirror.is_some()).unwrap_or(false)
        }

        /// Current content: the folder file when readable (refreshing the cache), else the cache.
        pub fn load(&self) -> StoreResult<String> {
            let state = self.lock()?;
            self.load_locked(&state)
        }

        fn load_locked(&self, state: &State) -> StoreResult<String> {
            let Some(mirror) = &state.mirror else {
                return self.cached();
            };
            // queued writes must land before the folder is trusted over the cache
            self.flush();
            match read_mirror(mirror.handle.as_ref(), &self.file_name) {
                Ok(text) => {
                    if self.cache.get(MASTER_KEY)?.as_deref() != Some(text.as_str()) {
                        self.cache.set(MASTER_KEY, &text)?;
                    }
                    Ok(text)
                }
                Err(err) => {
                    warn!(%err, "folder read failed; using cached content");
                    self.cached()
                }
            }
        }

        /// Commit `content` to the cache, then mirror it. Mirror failures never fail the save.
        pub fn save(&self, content: &str) -> StoreResult<()> {
            let state = self.lock()?;
            self.save_locked(&state, content)
        }

        fn save_locked(&self, state: &State, content: &str) -> StoreResult<()> {
            self.cache.set(MASTER_KEY, content)?;
            let Some(mirror) = &state.mirror else {
                return Ok(());
            };
            match &self.worker {
                Some(worker) => {
                    let queued = worker.submit(MirrorJob::Write {
                        handle: mirror.handle.clone(),
                        file_name: self.file_name.clone(),
                        content: content.to_string(),
                    });
                    if !queued {
                        warn!("mirror worker stopped; folder write dropped");
                        record(&self.mirror_error, Some("mirror worker stopped".into()));
                    }
                }
                None => match write_mirror(mirror.handle.as_ref(), &self.file_name, content) {
                    Ok(()) => record(&self.mirror_error, None),
                    Err(err) => {
                        warn!(%err, "folder write failed; cache kept");
                        record(&self.mirror_error, Some(err.to_string()));
                    }
                },
            }
            Ok(())
        }

        /// Whole-blob search: one match holding the full blob, or nothing.
        pub fn search(&self, query: &str) -> StoreResult<Vec<SearchMatch>> {
            let query = query.trim();
            if query.is_empty() {
                return Ok(Vec::new());
            }
            let state = self.lock()?;
            let blob = self.load_locked(&state)?;
            if blob.to_lowercase().contains(&query.to_lowercase()) {
                Ok(vec![SearchMatch {
                    date: None,
                    content: blob,
                }])
            } else {
                Ok(Vec::new())
            }
        }

        /// Section-scoped search: one match per dated section containing `query`.
        pub fn search_sections(&self, query: &str) -> StoreResult<Vec<SearchMatch>> {
            let query = query.trim().to_lowercase();
            if query.is_empty() {
                return Ok(Vec::new());
            }
            let state = self.lock()?;
            let blob = self.load_locked(&state)?;
            Ok(split_sections(&blob)
                .into_iter()
                .filter(|s| s.content.to_lowercase().contains(&query))
                .map(|s| SearchMatch {
                    date: s.date,
                    content: s.content,
                })
                .collect())
        }

        /// Body of `date`'s section, `""` when the day has no section.
        pub fn load_day(&self, date: NaiveDate) -> StoreResult<String> {
            let state = self.lock()?;
            let blob = self.load_locked(&state)?;
            Ok(day_content(&blob, date).unwrap_or_default())
        }

        /// Replace `date`'s section and carry its migrate lines into the next day.
        ///
        /// Returns the day that received carried tasks, if any.
        pub fn save_day(&self, date: NaiveDate, content: &str) -> StoreResult<Option<NaiveDate>> {
            let state = self.lock()?;
            let blob = self.load_locked(&state)?;
            let (carried_to, updated) = write_day(&blob, date, content);
            self.save_locked(&state, &updated)?;
            Ok(carried_to)
        }

        /// Wait for queued background folder writes.
        pub fn flush(&self) {
            if let Some(worker) = &self.worker {
                worker.flush();
            }
        }

        pub fn status(&self) -> StoreStatus {
            let folder = self
                .lock()
                .ok()
                .and_then(|s| s.mirror.as_ref().map(|m| m.handle.name()));
            StoreStatus {
                is_file_storage: folder.is_some(),
                folder,
                mirror_mode: self.mode,
                last_mirror_error: self.mirror_error.lock().ok().and_then(|e| e.clone()),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::folder::FsDirectoryHandle;
        use crate::storage::MemoryStore;
        use std::fs;

        fn store(mode: MirrorMode) -> (Arc<MemoryStore>, LogStore) {
            let cache = Arc::new(MemoryStore::default());
            let store = LogStore::new(cache.clone(), DEFAULT_MIRROR_FILE, mode);
            (cache, store)
        }

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        #[test]
        fn save_then_load_without_folder() {
            let (_, store) = store(MirrorMode::Inline);
            assert_eq!(store.load().unwrap(), "");
            store.save(". one\n- two").unwrap();
            assert_eq!(store.load().unwrap(), ". one\n- two");
            assert!(!store.is_file_storage());
        }

        #[test]
        fn folder_content_wins_and_refreshes_cache() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join(DEFAULT_MIRROR_FILE), "F").unwrap();
            let (cache, store) = store(MirrorMode::Inline);
            cache.set(MASTER_KEY, "C").unwrap();

            let handle = Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf()));
            assert_eq!(store.attach_folder(handle).unwrap(), "F");
            assert_eq!(store.load().unwrap(), "F");
            assert_eq!(cache.get(MASTER_KEY).unwrap().as_deref(), Some("F"));

            fs::write(tmp.path().join(DEFAULT_MIRROR_FILE), "edited elsewhere").unwrap();
            assert_eq!(store.load().unwrap(), "edited elsewhere");
            assert_eq!(cache.get(MASTER_KEY).unwrap().as_deref(), Some("edited elsewhere"));
        }

        #[test]
        fn attach_seeds_missing_folder_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (cache, store) = store(MirrorMode::Inline);
            cache.set(MASTER_KEY, ". cached").unwrap();
            let handle = Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf()));
            assert_eq!(store.attach_folder(handle).unwrap(), ". cached");
            assert_eq!(
                fs::read_to_string(tmp.path().join(DEFAULT_MIRROR_FILE)).unwrap(),
                ". cached"
            );
            assert!(store.status().is_file_storage);
        }

        #[test]
        fn save_writes_both_copies() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (cache, store) = store(MirrorMode::Inline);
            store
                .attach_folder(Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf())))
                .unwrap();
            store.save("x done").unwrap();
            assert_eq!(cache.get(MASTER_KEY).unwrap().as_deref(), Some("x done"));
            assert_eq!(
                fs::read_to_string(tmp.path().join(DEFAULT_MIRROR_FILE)).unwrap(),
                "x done"
            );
        }

        #[test]
        fn folder_failure_keeps_cache_commit() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let dir = tmp.path().join("journal");
            fs::create_dir(&dir).unwrap();
            let (cache, store) = store(MirrorMode::Inline);
            store
                .attach_folder(Arc::new(FsDirectoryHandle::grant(dir.clone())))
                .unwrap();
            fs::remove_dir_all(&dir).unwrap();

            store.save(". still saved").expect("cache commit succeeds");
            assert_eq!(cache.get(MASTER_KEY).unwrap().as_deref(), Some(". still saved"));
            assert!(store.status().last_mirror_error.is_some());
            // read falls back to the cache
            assert_eq!(store.load().unwrap(), ". still saved");
        }

        #[test]
        fn background_mirror_converges_after_flush() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (cache, store) = store(MirrorMode::Background);
            store
                .attach_folder(Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf())))
                .unwrap();
            for n in 0..5 {
                store.save(&format!(". revision {n}")).unwrap();
            }
            store.flush();
            let on_disk = fs::read_to_string(tmp.path().join(DEFAULT_MIRROR_FILE)).unwrap();
            assert_eq!(on_disk, ". revision 4");
            assert_eq!(cache.get(MASTER_KEY).unwrap().as_deref(), Some(on_disk.as_str()));
            assert_eq!(store.status().mirror_mode, MirrorMode::Background);
            assert_eq!(store.status().last_mirror_error, None);
        }

        #[test]
        fn background_reads_see_latest_save() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (cache, store) = store(MirrorMode::Background);
            store
                .attach_folder(Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf())))
                .unwrap();
            for n in 0..50 {
                let content = format!(". revision {n}");
                store.save(&content).unwrap();
                assert_eq!(store.load().unwrap(), content);
                assert_eq!(cache.get(MASTER_KEY).unwrap().as_deref(), Some(content.as_str()));
            }
        }

        #[test]
        fn background_day_writes_keep_earlier_days() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (_, store) = store(MirrorMode::Background);
            store
                .attach_folder(Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf())))
                .unwrap();
            for n in 0..20 {
                store.save(&format!("round {n}")).unwrap();
                store.save_day(d(2024, 1, 1), ". first").unwrap();
                store.save_day(d(2024, 1, 5), ". second").unwrap();
                assert_eq!(store.load_day(d(2024, 1, 1)).unwrap(), ". first");
                assert_eq!(store.load_day(d(2024, 1, 5)).unwrap(), ". second");
            }
            store.flush();
            let on_disk = fs::read_to_string(tmp.path().join(DEFAULT_MIRROR_FILE)).unwrap();
            assert!(on_disk.contains(". first"));
            assert!(on_disk.contains(". second"));
        }

        #[test]
        fn search_follows_external_folder_edits() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (cache, store) = store(MirrorMode::Inline);
            store
                .attach_folder(Arc::new(FsDirectoryHandle::grant(tmp.path().to_path_buf())))
                .unwrap();
            store.save(". old").unwrap();
            fs::write(
                tmp.path().join(DEFAULT_MIRROR_FILE),
                "--- 2024-02-02 ---\n. buy milk",
            )
            .unwrap();

            let hits = store.search("milk").unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].content, "--- 2024-02-02 ---\n. buy milk");
            let sections = store.search_sections("MILK").unwrap();
            assert_eq!(sections.len(), 1);
            assert_eq!(sections[0].date, Some(d(2024, 2, 2)));
            assert_eq!(
                cache.get(MASTER_KEY).unwrap().as_deref(),
                Some("--- 2024-02-02 ---\n. buy milk")
            );
        }

        #[test]
        fn attach_rejects_folder_without_permission() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let (_, store) = store(MirrorMode::Inline);
            let missing = FsDirectoryHandle::grant(tmp.path().join("nope"));
            let err = store.attach_folder(Arc::new(missing)).expect_err("denied");
            assert!(matches!(err, StoreError::FolderPermissionDenied(_)));
            assert!(!store.is_file_storage());
        }

        #[test]
        fn search_is_whole_blob_and_case_insensitive() {
            let (_, store) = store(MirrorMode::Inline);
            store.save("--- 2024-01-01 ---\n. buy milk\n\n--- 2024-01-02 ---\n- bread").unwrap();

            assert!(store.search("").unwrap().is_empty());
            assert!(store.search("   ").unwrap().is_empty());
            assert!(store.search("coffee").unwrap().is_empty());

            let hits = store.search("MILK").unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].content, store.load().unwrap());
            assert_eq!(hits[0].date, None);
        }

        #[test]
        fn section_search_scopes_to_days() {
            let (_, store) = store(MirrorMode::Inline);
            store.save("--- 2024-01-01 ---\n. buy milk\n\n--- 2024-01-02 ---\n- bread").unwrap();
            let hits = store.search_sections("Bread").unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].date, Some(d(2024, 1, 2)));
            assert_eq!(hits[0].content, "- bread");
        }

        #[test]
        fn save_day_carries_once() {
            let (_, store) = store(MirrorMode::Inline);
            assert_eq!(store.save_day(d(2024, 1, 31), "> buy milk").unwrap(), Some(d(2024, 2, 1)));
            assert_eq!(store.save_day(d(2024, 1, 31), "> buy milk").unwrap(), None);
            assert_eq!(store.load_day(d(2024, 2, 1)).unwrap(), ". buy milk");
            assert_eq!(store.load_day(d(2024, 1, 31)).unwrap(), "> buy milk");
            assert_eq!(store.load().unwrap().matches(". buy milk").count(), 1);
            assert_eq!(store.load_day(d(2024, 3, 1)).unwrap(), "");
        }
    }
}

pub mod config {
    //! `config.toml` for the journal binary.

    use crate::store::{DEFAULT_MIRROR_FILE, MirrorMode};
    use anyhow::{Context, Result, bail};
    use directories::ProjectDirs;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("org", "bujo", "bujo")
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// Directory holding `journal.db` and `handles.db`.
        pub data_dir: PathBuf,
        /// File name used inside the chosen journal folder.
        pub mirror_file_name: String,
        pub mirror_mode: MirrorMode,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                data_dir: project_dirs()
                    .map(|dirs| dirs.data_dir().to_path_buf())
                    .unwrap_or_else(|| PathBuf::from(".bujo")),
                mirror_file_name: DEFAULT_MIRROR_FILE.to_string(),
                mirror_mode: MirrorMode::default(),
            }
        }
    }

    impl Config {
        /// Platform location of `config.toml`.
        pub fn default_path() -> Option<PathBuf> {
            project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
        }

        /// Read `path`; a missing file yields the defaults.
        pub fn load(path: &Path) -> Result<Self> {
            let cfg = match fs::read_to_string(path) {
                Ok(text) => toml::from_str::<Config>(&text)
                    .with_context(|| format!("parsing {:?}", path))?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
                Err(err) => return Err(err).with_context(|| format!("reading {:?}", path)),
            };
            cfg.validate()?;
            Ok(cfg)
        }

        pub fn validate(&self) -> Result<()> {
            let name = self.mirror_file_name.as_str();
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                bail!("mirror_file_name {:?} must be a plain file name", name);
            }
            Ok(())
        }

        pub fn cache_path(&self) -> PathBuf {
            self.data_dir.join("journal.db")
        }

        pub fn handles_path(&self) -> PathBuf {
            self.data_dir.join("handles.db")
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_file_gives_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let cfg = Config::load(&tmp.path().join("config.toml")).expect("load");
            assert_eq!(cfg.mirror_file_name, DEFAULT_MIRROR_FILE);
            assert_eq!(cfg.mirror_mode, MirrorMode::Inline);
        }

        #[test]
        fn partial_file_overrides_fields() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("config.toml");
            fs::write(&path, "data_dir = \"/tmp/j\"\nmirror_mode = \"background\"\n").unwrap();
            let cfg = Config::load(&path).expect("load");
            assert_eq!(cfg.data_dir, PathBuf::from("/tmp/j"));
            assert_eq!(cfg.mirror_mode, MirrorMode::Background);
            assert_eq!(cfg.cache_path(), PathBuf::from("/tmp/j/journal.db"));
        }

        #[test]
        fn rejects_nested_mirror_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("config.toml");
            fs::write(&path, "mirror_file_name = \"a/b.txt\"\n").unwrap();
            assert!(Config::load(&path).is_err());
        }
    }
}

pub mod journal {
    //! Application root: owns the cache, the folder registry and the log store,
    //! and runs the startup sequence.

    use crate::carry::write_day;
    use crate::config::Config;
    use crate::core::{StoreError, StoreResult};
    use crate::folder::{
        DirectoryHandle, DirectoryPicker, FolderRegistry, FsDirectoryHandle, PermissionState,
    };
    use crate::legacy::{MigrationReport, run_migration};
    use crate::store::{LogStore, MirrorMode, SearchMatch, StoreStatus};
    use crate::storage::{KeyValueStore, SqliteStore};
    use chrono::NaiveDate;
    use serde::Serialize;
    use std::sync::Arc;
    use tracing::{info, warn};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct JournalStatus {
        #[serde(flatten)]
        pub store: StoreStatus,
        pub registry_available: bool,
        pub migration_error: Option<String>,
    }

    pub struct Journal {
        cache: Arc<dyn KeyValueStore>,
        store: LogStore,
        registry: Option<FolderRegistry>,
        migration: Result<Option<MigrationReport>, String>,
    }

    impl Journal {
        /// Open the on-disk cache and registry described by `config`.
        pub fn open(config: &Config) -> StoreResult<Self> {
            let cache: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&config.cache_path())?);
            let registry = match FolderRegistry::open(&config.handles_path()) {
                Ok(registry) => Some(registry),
                Err(err) => {
                    warn!(%err, "folder registry unavailable; cache-only mode");
                    None
                }
            };
            Ok(Self::start(
                cache,
                registry,
                &config.mirror_file_name,
                config.mirror_mode,
            ))
        }

        /// Startup: legacy migration, then folder restore. Neither step blocks startup.
        pub fn start(
            cache: Arc<dyn KeyValueStore>,
            registry: Option<FolderRegistry>,
            mirror_file_name: &str,
            mode: MirrorMode,
        ) -> Self {
            let migration = run_migration(cache.as_ref()).map_err(|err| {
                warn!(%err, "legacy migration failed; reading the master log as empty this session");
                err.to_string()
            });

            let store = LogStore::new(cache.clone(), mirror_file_name, mode);
            if let Some(handle) = registry
                .as_ref()
                .and_then(|r| r.restore_granted::<FsDirectoryHandle>())
            {
                if let Err(err) = store.attach_folder(Arc::new(handle)) {
                    warn!(%err, "could not attach restored folder");
                }
            }

            Self {
                cache,
                store,
                registry,
                migration,
            }
        }

        pub fn store(&self) -> &LogStore {
            &self.store
        }

        pub fn cache(&self) -> &dyn KeyValueStore {
            self.cache.as_ref()
        }

        pub fn migration_report(&self) -> Option<MigrationReport> {
            self.migration.as_ref().ok().copied().flatten()
        }

        /// True when the legacy migration failed this session.
        pub fn is_degraded(&self) -> bool {
            self.migration.is_err()
        }

        /// Current content. A failed migration or an unavailable cache reads as empty.
        pub fn load(&self) -> String {
            if self.is_degraded() {
                return String::new();
            }
            match self.store.load() {
                Ok(content) => content,
                Err(err) => {
                    warn!(%err, "journal unavailable; showing empty content");
                    String::new()
                }
            }
        }

        pub fn save(&self, content: &str) -> StoreResult<()> {
            self.store.save(content)
        }

        pub fn search(&self, query: &str) -> StoreResult<Vec<SearchMatch>> {
            if self.is_degraded() {
                return Ok(Vec::new());
            }
            self.store.search(query)
        }

        pub fn search_sections(&self, query: &str) -> StoreResult<Vec<SearchMatch>> {
            if self.is_degraded() {
                return Ok(Vec::new());
            }
            self.store.search_sections(query)
        }

        pub fn load_day(&self, date: NaiveDate) -> StoreResult<String> {
            if self.is_degraded() {
                return Ok(String::new());
            }
            self.store.load_day(date)
        }

        /// In degraded mode the day is written against the empty view, like `save`.
        pub fn save_day(&self, date: NaiveDate, content: &str) -> StoreResult<Option<NaiveDate>> {
            if self.is_degraded() {
                let (carried_to, blob) = write_day("", date, content);
                self.store.save(&blob)?;
                return Ok(carried_to);
            }
            self.store.save_day(date, content)
        }

        fn registry(&self) -> StoreResult<&FolderRegistry> {
            self.registry
                .as_ref()
                .ok_or_else(|| StoreError::StorageUnavailable("folder registry unavailable".into()))
        }

        /// Choose a folder, remember it and start mirroring. Returns the current content.
        pub fn choose_folder<P: DirectoryPicker>(&self, picker: &mut P) -> StoreResult<String> {
            let registry = self.registry()?;
            let handle = registry.select(picker)?;
            registry.persist(&handle)?;
            info!(folder = %handle.name(), "journal folder selected");
            self.store.attach_folder(Arc::new(handle))
        }

        /// Explicit re-authorization of the remembered folder.
        pub fn reconnect_folder(&self) -> StoreResult<Option<String>> {
            let Some(handle) = self.registry()?.restore::<FsDirectoryHandle>() else {
                return Ok(None);
            };
            match handle.request_permission() {
                PermissionState::Granted => self.store.attach_folder(Arc::new(handle)).map(Some),
                _ => Err(StoreError::FolderPermissionDenied(handle.name())),
            }
        }

        pub fn forget_folder(&self) -> StoreResult<()> {
            self.registry()?.forget()?;
            self.store.detach_folder()
        }

        pub fn status(&self) -> JournalStatus {
            JournalStatus {
                store: self.store.status(),
                registry_available: self.registry.is_some(),
                migration_error: self.migration.as_ref().err().cloned(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{LEGACY_KEY, LegacyLog, LogEntry, MASTER_KEY};
        use crate::folder::PathPicker;
        use crate::store::DEFAULT_MIRROR_FILE;
        use std::fs;

        fn config(dir: &std::path::Path) -> Config {
            Config {
                data_dir: dir.join("data"),
                ..Config::default()
            }
        }

        fn seed_legacy(cache: &dyn KeyValueStore, entries: Vec<(&str, &str)>) {
            let log = LegacyLog::from_entries(entries.into_iter().map(|(date, content)| LogEntry {
                date: date.into(),
                content: content.into(),
            }));
            cache.set(LEGACY_KEY, &log.to_json().unwrap()).unwrap();
        }

        #[test]
        fn startup_migrates_legacy_journal() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let cfg = config(tmp.path());
            {
                let cache = SqliteStore::open(&cfg.cache_path()).expect("cache");
                seed_legacy(&cache, vec![("2024-01-02", ". b"), ("2024-01-01", ". a")]);
            }

            let journal = Journal::open(&cfg).expect("open");
            assert_eq!(journal.migration_report().map(|r| r.entries), Some(2));
            assert_eq!(journal.load(), "--- 2024-01-01 ---\n. a\n\n--- 2024-01-02 ---\n. b");
            assert_eq!(journal.cache().get(LEGACY_KEY).unwrap(), None);
            drop(journal);

            let reopened = Journal::open(&cfg).expect("reopen");
            assert_eq!(reopened.migration_report(), None);
            assert_eq!(reopened.load(), "--- 2024-01-01 ---\n. a\n\n--- 2024-01-02 ---\n. b");
        }

        #[test]
        fn malformed_legacy_does_not_block_startup() {
            let cache = Arc::new(crate::storage::MemoryStore::default());
            cache.set(LEGACY_KEY, "not json").unwrap();
            let journal = Journal::start(cache.clone(), None, DEFAULT_MIRROR_FILE, MirrorMode::Inline);

            assert!(journal.status().migration_error.is_some());
            assert!(journal.is_degraded());
            assert_eq!(journal.load(), "");
            assert!(journal.search("anything").unwrap().is_empty());
            assert_eq!(cache.get(LEGACY_KEY).unwrap().as_deref(), Some("not json"));
            assert_eq!(cache.get(MASTER_KEY).unwrap(), None);
        }

        #[test]
        fn degraded_day_write_uses_empty_view() {
            let cache = Arc::new(crate::storage::MemoryStore::default());
            cache.set(LEGACY_KEY, "not json").unwrap();
            let journal = Journal::start(cache.clone(), None, DEFAULT_MIRROR_FILE, MirrorMode::Inline);
            let day = NaiveDate::from_ymd_opt(2024, 4, 1).expect("date");

            let carried = journal.save_day(day, "> call bank").expect("save day");
            assert_eq!(carried, day.succ_opt());
            assert_eq!(
                cache.get(MASTER_KEY).unwrap().as_deref(),
                Some("--- 2024-04-01 ---\n> call bank\n\n--- 2024-04-02 ---\n. call bank")
            );
            assert_eq!(journal.load(), "");
            assert_eq!(cache.get(LEGACY_KEY).unwrap().as_deref(), Some("not json"));
        }

        #[test]
        fn chosen_folder_is_restored_on_next_start() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let cfg = config(tmp.path());
            let folder = tmp.path().join("notes");
            fs::create_dir(&folder).unwrap();

            let journal = Journal::open(&cfg).expect("open");
            journal.save(". before folder").unwrap();
            let content = journal
                .choose_folder(&mut PathPicker::new(Some(folder.clone())))
                .expect("select");
            assert_eq!(content, ". before folder");
            journal.save(". mirrored").unwrap();
            drop(journal);

            fs::write(folder.join(DEFAULT_MIRROR_FILE), ". edited on disk").unwrap();
            let journal = Journal::open(&cfg).expect("reopen");
            assert!(journal.status().store.is_file_storage);
            assert_eq!(journal.load(), ". edited on disk");
        }

        #[test]
        fn revoked_folder_degrades_to_cache() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let cfg = config(tmp.path());
            let folder = tmp.path().join("usb");
            fs::create_dir(&folder).unwrap();

            let journal = Journal::open(&cfg).expect("open");
            journal
                .choose_folder(&mut PathPicker::new(Some(folder.clone())))
                .expect("select");
            journal.save(". cached copy").unwrap();
            drop(journal);
            fs::remove_dir_all(&folder).unwrap();

            let journal = Journal::open(&cfg).expect("reopen");
            assert!(!journal.status().store.is_file_storage);
            assert_eq!(journal.load(), ". cached copy");

            let restored = journal.reconnect_folder().expect("reconnect");
            assert_eq!(restored.as_deref(), Some(". cached copy"));
            assert!(journal.status().store.is_file_storage);
        }

        #[test]
        fn cancelled_selection_changes_nothing() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let journal = Journal::open(&config(tmp.path())).expect("open");
            journal.save(". keep").unwrap();
            let err = journal
                .choose_folder(&mut PathPicker::new(None))
                .expect_err("cancelled");
            assert!(matches!(err, StoreError::UserCancelledSelection));
            assert!(!journal.status().store.is_file_storage);
            assert_eq!(journal.load(), ". keep");
        }

        #[test]
        fn forget_folder_returns_to_cache_only() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let cfg = config(tmp.path());
            let journal = Journal::open(&cfg).expect("open");
            journal
                .choose_folder(&mut PathPicker::new(Some(tmp.path().to_path_buf())))
                .expect("select");
            journal.forget_folder().expect("forget");
            assert!(!journal.status().store.is_file_storage);
            drop(journal);
            assert!(!Journal::open(&cfg).expect("reopen").status().store.is_file_storage);
        }
    }
}

pub use classify::{classify, classify_text};
pub use config::Config;
pub use crate::core::{Line, LineKind, StoreError, StoreResult};
pub use journal::Journal;
pub use store::{LogStore, MirrorMode};
